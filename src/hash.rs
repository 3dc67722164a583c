//! Hashing of command lines for the command log.
//!
//! The log compares a build step's current command against the hash recorded
//! by the run that last produced its outputs; a mismatch forces a rerun.  We
//! use the standard library's DefaultHasher: it is deterministic across
//! processes, and the worst case of a hasher change across toolchains is a
//! one-time full rebuild.

use std::hash::Hasher;

/// Hash an expanded command line (including any rspfile content appended by
/// the caller).  Stored in the command log as lowercase hex.
pub fn hash_command(command: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    hasher.write(command.as_bytes());
    hasher.finish()
}
