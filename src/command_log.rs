//! Persistent log of command hashes and timings per output (`.ninja_log`).
//!
//! Text, line-based: a `# ninja log vN` header, then one tab-separated entry
//! per completed command and output:
//!
//!   start_ms <TAB> end_ms <TAB> restat_mtime <TAB> output <TAB> hash_hex
//!
//! Each run appends; on load we run through all entries in series, keeping
//! the last one per output.  Once the number of redundant entries passes a
//! threshold we write out a fresh file and swap it into place.

use crate::disk::Timestamp;
use crate::graph::{EdgeId, Graph};
use crate::hash::hash_command;
use anyhow::{anyhow, Context};
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;

const FILE_SIGNATURE: &str = "# ninja log v";
const CURRENT_VERSION: u32 = 4;

const MIN_COMPACTION_ENTRY_COUNT: usize = 100;
const COMPACTION_RATIO: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub output: String,
    pub command_hash: u64,
    /// Start/end of the command, in milliseconds relative to the start of
    /// the build that ran it.
    pub start_time: i32,
    pub end_time: i32,
    /// Output mtime observed right after a restat rule ran; zero otherwise.
    pub restat_mtime: Timestamp,
}

#[derive(Default)]
pub struct CommandLog {
    entries: HashMap<String, LogEntry>,
    file: Option<File>,
    needs_recompaction: bool,
}

impl CommandLog {
    pub fn new() -> Self {
        CommandLog::default()
    }

    /// Load an existing log; absent file is an empty log.
    pub fn load(&mut self, path: &str) -> anyhow::Result<()> {
        let contents = match std::fs::read(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(anyhow!("read {}: {}", path, err)),
        };

        let mut version = 0;
        let mut total_entry_count = 0;
        let mut unique_entry_count = 0;
        for line in contents.split(|&c| c == b'\n') {
            if line.is_empty() {
                continue;
            }
            let line = String::from_utf8_lossy(line);
            if version == 0 {
                version = 1; // Headerless logs predate versioning.
                if let Some(v) = line.strip_prefix(FILE_SIGNATURE) {
                    version = v.trim().parse().unwrap_or(1);
                    continue;
                }
            }

            // Early versions separated fields with spaces.
            let sep = if version >= 4 { '\t' } else { ' ' };
            let mut fields = line.splitn(5, sep);
            let entry = (|| {
                let start_time = fields.next()?.parse().ok()?;
                let end_time = fields.next()?.parse().ok()?;
                let restat_mtime = fields.next()?.parse().ok()?;
                let output = fields.next()?.to_owned();
                // The final field is a hex hash at the current version and
                // the literal command before that; hash old commands on load
                // so lookups are uniform.  An empty or garbled field still
                // records the entry, with a hash that can never match.
                let last = fields.next().unwrap_or("");
                let command_hash = if version >= 4 {
                    u64::from_str_radix(last, 16).unwrap_or(0)
                } else {
                    hash_command(last)
                };
                Some(LogEntry {
                    output,
                    command_hash,
                    start_time,
                    end_time,
                    restat_mtime,
                })
            })();
            let entry = match entry {
                Some(entry) => entry,
                None => continue,
            };
            total_entry_count += 1;
            if self
                .entries
                .insert(entry.output.clone(), entry)
                .is_none()
            {
                unique_entry_count += 1;
            }
        }

        // Rebuild the log if we're upgrading versions or it has gotten large
        // and mostly redundant.
        if version < CURRENT_VERSION
            || (total_entry_count > MIN_COMPACTION_ENTRY_COUNT
                && total_entry_count > unique_entry_count * COMPACTION_RATIO)
        {
            self.needs_recompaction = true;
        }

        Ok(())
    }

    /// Open the log for appending, recompacting first if load decided to.
    pub fn open_for_write(&mut self, path: &str) -> anyhow::Result<()> {
        if self.needs_recompaction {
            self.recompact(path)?;
            self.needs_recompaction = false;
        }

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .with_context(|| format!("open {}", path))?;
        if file.metadata()?.len() == 0 {
            writeln!(file, "{}{}", FILE_SIGNATURE, CURRENT_VERSION)?;
        }
        self.file = Some(file);
        Ok(())
    }

    pub fn lookup(&self, output: &str) -> Option<&LogEntry> {
        self.entries.get(output)
    }

    /// Record a finished command, updating the in-memory state and appending
    /// one line per output.
    pub fn record_command(
        &mut self,
        graph: &Graph,
        edge: EdgeId,
        start_time: i32,
        end_time: i32,
        restat_mtime: Timestamp,
    ) -> anyhow::Result<()> {
        let command = graph.evaluate_command(edge, true);
        let command_hash = hash_command(&command);
        for &out in &graph.edge(edge).outputs {
            let entry = LogEntry {
                output: graph.node(out).path().to_owned(),
                command_hash,
                start_time,
                end_time,
                restat_mtime,
            };
            if let Some(file) = &mut self.file {
                write_entry(file, &entry)?;
            }
            self.entries.insert(entry.output.clone(), entry);
        }
        Ok(())
    }

    /// Rewrite the log with only the latest entry per output, then swap it
    /// into place.
    pub fn recompact(&mut self, path: &str) -> anyhow::Result<()> {
        self.close();
        let temp_path = format!("{}.recompact", path);
        let mut file = File::create(&temp_path).with_context(|| format!("open {}", temp_path))?;
        writeln!(file, "{}{}", FILE_SIGNATURE, CURRENT_VERSION)?;
        for entry in self.entries.values() {
            write_entry(&mut file, entry)?;
        }
        file.flush()?;
        drop(file);
        std::fs::rename(&temp_path, path)
            .with_context(|| format!("rename {} -> {}", temp_path, path))?;
        Ok(())
    }

    pub fn close(&mut self) {
        self.file = None;
    }
}

fn write_entry(file: &mut File, entry: &LogEntry) -> anyhow::Result<()> {
    // One line per write, flushed immediately, so a crash mid-build loses at
    // most the line being written.
    writeln!(
        file,
        "{}\t{}\t{}\t{}\t{:x}",
        entry.start_time, entry.end_time, entry.restat_mtime, entry.output, entry.command_hash
    )?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load;

    fn log_path(dir: &tempfile::TempDir) -> String {
        dir.path().join(".ninja_log").to_str().unwrap().to_owned()
    }

    fn sample_graph() -> (Graph, EdgeId) {
        let loaded = load::read_text(
            "rule cat\n  command = cat $in > $out\n\
             build out out2: cat in\n",
        )
        .unwrap();
        let graph = loaded.graph;
        let edge = graph.node(graph.lookup_node("out").unwrap()).in_edge.unwrap();
        (graph, edge)
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        let (graph, edge) = sample_graph();

        let mut log = CommandLog::new();
        log.open_for_write(&path).unwrap();
        log.record_command(&graph, edge, 10, 20, 0).unwrap();
        log.close();

        let mut reloaded = CommandLog::new();
        reloaded.load(&path).unwrap();
        let entry = reloaded.lookup("out").unwrap();
        assert_eq!(entry.start_time, 10);
        assert_eq!(entry.end_time, 20);
        assert_eq!(
            entry.command_hash,
            hash_command(&graph.evaluate_command(edge, true))
        );
        assert!(reloaded.lookup("out2").is_some());
        assert!(reloaded.lookup("absent").is_none());
    }

    #[test]
    fn last_entry_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        let (graph, edge) = sample_graph();

        let mut log = CommandLog::new();
        log.open_for_write(&path).unwrap();
        log.record_command(&graph, edge, 1, 2, 0).unwrap();
        log.record_command(&graph, edge, 3, 4, 0).unwrap();
        log.close();

        let mut reloaded = CommandLog::new();
        reloaded.load(&path).unwrap();
        assert_eq!(reloaded.lookup("out").unwrap().start_time, 3);
    }

    #[test]
    fn loads_old_version_with_literal_commands() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        std::fs::write(
            &path,
            "# ninja log v3\n5 10 0 out cat in > out\n",
        )
        .unwrap();

        let mut log = CommandLog::new();
        log.load(&path).unwrap();
        let entry = log.lookup("out").unwrap();
        assert_eq!(entry.command_hash, hash_command("cat in > out"));

        // A version upgrade forces a rewrite at the current version.
        log.open_for_write(&path).unwrap();
        log.close();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("# ninja log v4\n"));
        assert!(contents.contains('\t'));
    }

    #[test]
    fn recompaction_keeps_latest_entries_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        let (graph, edge) = sample_graph();

        let mut log = CommandLog::new();
        log.open_for_write(&path).unwrap();
        for i in 0..200 {
            log.record_command(&graph, edge, i, i + 1, 0).unwrap();
        }
        log.close();

        let mut reloaded = CommandLog::new();
        reloaded.load(&path).unwrap();
        assert!(reloaded.needs_recompaction);
        reloaded.open_for_write(&path).unwrap();
        reloaded.close();

        let contents = std::fs::read_to_string(&path).unwrap();
        // Header plus one line per unique output.
        assert_eq!(contents.lines().count(), 3);
        let mut after = CommandLog::new();
        after.load(&path).unwrap();
        assert_eq!(after.lookup("out").unwrap().start_time, 199);
    }
}
