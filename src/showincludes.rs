//! Parsing of MSVC cl.exe `/showIncludes` output.
//!
//! cl.exe has no depfile mode; instead it can announce each header on
//! stderr with a localizable prefix.  We pull those lines out of the
//! captured output, returning the header list and the output with the
//! announcements (and cl's echo of the source filename) removed.

/// The prefix printed by an English-locale cl.exe; overridable per edge with
/// the `msvc_deps_prefix` binding for other locales.
pub const DEFAULT_SHOW_INCLUDES_PREFIX: &str = "Note: including file: ";

/// Headers under the toolchain installation don't belong in the deps log;
/// they change only when the toolchain does, and recording them bloats the
/// log with thousands of entries per object file.
fn is_system_include(path: &str) -> bool {
    let lowered = path.to_ascii_lowercase();
    lowered.contains("program files") || lowered.contains("microsoft visual studio")
}

/// cl.exe unconditionally echoes the name of the file it compiles; that line
/// is noise in a build log.
fn is_input_filename(line: &str) -> bool {
    let lowered = line.to_ascii_lowercase();
    [".c", ".cc", ".cxx", ".cpp"]
        .iter()
        .any(|ext| lowered.ends_with(ext))
}

/// Parse captured compiler output.  Returns the discovered include paths
/// (first mention wins, system headers dropped) and the remaining output.
pub fn parse(output: &str, prefix: &str) -> (Vec<String>, String) {
    let mut includes: Vec<String> = Vec::new();
    let mut filtered = String::new();
    for line in output.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(include) = line.strip_prefix(prefix) {
            let include = include.trim_start();
            if !is_system_include(include) && !includes.iter().any(|i| i == include) {
                includes.push(include.to_owned());
            }
        } else if !is_input_filename(line) {
            filtered.push_str(line);
            filtered.push('\n');
        }
    }
    (includes, filtered)
}
