//! Build status output: a progress counter and command output, with smart
//! overprinting on capable terminals and plain lines everywhere else.

use crate::graph::{EdgeId, Graph};
use anyhow::bail;
use std::io::Write;
use std::time::Instant;

/// Consumer of build progress events.
pub trait Status {
    fn plan_has_total_edges(&mut self, total: usize);
    fn build_edge_started(&mut self, graph: &Graph, edge: EdgeId);
    /// A failed edge always gets its command and output printed in full.
    fn build_edge_finished(&mut self, graph: &Graph, edge: EdgeId, success: bool, output: &[u8]);
    /// While a console-pool edge runs it owns the terminal; other status
    /// output is buffered until release.
    fn set_console_locked(&mut self, locked: bool);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verbosity {
    /// No output; used when testing.
    Quiet,
    Normal,
    /// Print full command lines.
    Verbose,
}

/// One piece of the `NINJA_STATUS` format string.
enum FormatPiece {
    Literal(String),
    Placeholder(char),
}

/// Parse a `NINJA_STATUS`-style format string.
fn parse_status_format(format: &str) -> anyhow::Result<Vec<FormatPiece>> {
    let mut pieces = Vec::new();
    let mut literal = String::new();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            literal.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => literal.push('%'),
            Some(p @ ('s' | 't' | 'f' | 'u' | 'r' | 'p' | 'e')) => {
                if !literal.is_empty() {
                    pieces.push(FormatPiece::Literal(std::mem::take(&mut literal)));
                }
                pieces.push(FormatPiece::Placeholder(p));
            }
            Some(other) => bail!("unknown placeholder '%{}' in $NINJA_STATUS", other),
            None => bail!("unterminated '%' in $NINJA_STATUS"),
        }
    }
    if !literal.is_empty() {
        pieces.push(FormatPiece::Literal(literal));
    }
    Ok(pieces)
}

/// Status implementation writing to stdout.
pub struct ConsoleStatus {
    verbosity: Verbosity,
    /// Whether we can overprint with carriage returns and erase codes.
    smart_terminal: bool,
    format: Vec<FormatPiece>,
    start_time: Instant,
    started_edges: usize,
    finished_edges: usize,
    total_edges: usize,
    console_locked: bool,
    /// Lines held back while the console is locked.
    buffered: String,
    /// Whether the cursor sits on a fresh line (as opposed to atop an
    /// overprinted status line).
    have_blank_line: bool,
}

impl ConsoleStatus {
    pub fn new(verbosity: Verbosity) -> anyhow::Result<ConsoleStatus> {
        let format = std::env::var("NINJA_STATUS").unwrap_or_else(|_| "[%f/%t] ".to_owned());
        Ok(ConsoleStatus {
            verbosity,
            // Fancy terminal control interleaves badly with full command
            // echo, so verbose mode always prints plain lines.
            smart_terminal: verbosity == Verbosity::Normal && is_smart_terminal(),
            format: parse_status_format(&format)?,
            start_time: Instant::now(),
            started_edges: 0,
            finished_edges: 0,
            total_edges: 0,
            console_locked: false,
            buffered: String::new(),
            have_blank_line: true,
        })
    }

    fn format_progress(&self) -> String {
        let mut out = String::new();
        for piece in &self.format {
            match piece {
                FormatPiece::Literal(text) => out.push_str(text),
                FormatPiece::Placeholder(p) => {
                    let value = match p {
                        's' => self.started_edges.to_string(),
                        't' => self.total_edges.to_string(),
                        'f' => self.finished_edges.to_string(),
                        'u' => (self.total_edges - self.started_edges.min(self.total_edges))
                            .to_string(),
                        'r' => (self.started_edges - self.finished_edges).to_string(),
                        'p' => {
                            let percent = if self.total_edges == 0 {
                                100
                            } else {
                                100 * self.finished_edges / self.total_edges
                            };
                            format!("{:3}%", percent)
                        }
                        'e' => format!("{:.3}", self.start_time.elapsed().as_secs_f64()),
                        _ => unreachable!(),
                    };
                    out.push_str(&value);
                }
            }
        }
        out
    }

    fn message_for(&self, graph: &Graph, edge: EdgeId) -> String {
        if self.verbosity == Verbosity::Verbose {
            return graph.evaluate_command(edge, false);
        }
        let description = graph.edge_binding(edge, "description");
        if description.is_empty() {
            graph.evaluate_command(edge, false)
        } else {
            description
        }
    }

    /// Print the `[n/m] message` line, overprinting the previous one on a
    /// smart terminal.
    fn print_status(&mut self, graph: &Graph, edge: EdgeId) {
        if self.verbosity == Verbosity::Quiet {
            return;
        }
        let line = format!("{}{}", self.format_progress(), self.message_for(graph, edge));
        if self.console_locked {
            self.buffered.push_str(&line);
            self.buffered.push('\n');
            return;
        }
        if self.smart_terminal {
            let width = terminal_width().unwrap_or(80);
            print!("\r{}\x1b[K", elide_middle(&line, width));
            let _ = std::io::stdout().flush();
            self.have_blank_line = false;
        } else {
            println!("{}", line);
        }
    }

    /// Print full lines (command output, failures) below any status line.
    fn print_on_new_line(&mut self, text: &str) {
        if self.console_locked {
            self.buffered.push_str(text);
            if !text.ends_with('\n') {
                self.buffered.push('\n');
            }
            return;
        }
        if !self.have_blank_line {
            println!();
            self.have_blank_line = true;
        }
        print!("{}", text);
        if !text.ends_with('\n') {
            println!();
        }
        let _ = std::io::stdout().flush();
    }
}

impl Status for ConsoleStatus {
    fn plan_has_total_edges(&mut self, total: usize) {
        self.total_edges = total;
    }

    fn build_edge_started(&mut self, graph: &Graph, edge: EdgeId) {
        self.started_edges += 1;
        self.print_status(graph, edge);
    }

    fn build_edge_finished(&mut self, graph: &Graph, edge: EdgeId, success: bool, output: &[u8]) {
        self.finished_edges += 1;
        if self.verbosity == Verbosity::Quiet {
            return;
        }

        if self.smart_terminal {
            self.print_status(graph, edge);
        }

        // Print the command that is spewing before printing its output.
        if !success {
            let command = graph.evaluate_command(edge, false);
            self.print_on_new_line(&format!("FAILED: {}", command));
        }
        if !output.is_empty() {
            self.print_on_new_line(&String::from_utf8_lossy(output));
        } else if self.smart_terminal && self.finished_edges == self.total_edges {
            // Leave the final status line in place.
            if !self.console_locked {
                println!();
                self.have_blank_line = true;
            }
        }
    }

    fn set_console_locked(&mut self, locked: bool) {
        if locked && !self.have_blank_line && !self.console_locked {
            // Hand the terminal over on a fresh line.
            println!();
            self.have_blank_line = true;
        }
        self.console_locked = locked;
        if !locked && !self.buffered.is_empty() {
            let buffered = std::mem::take(&mut self.buffered);
            print!("{}", buffered);
            let _ = std::io::stdout().flush();
        }
    }
}

/// Shorten `text` to fit in `width` columns by replacing its middle with
/// an ellipsis.
fn elide_middle(text: &str, width: usize) -> String {
    const MARGIN: usize = 3; // Space for "...".
    if text.len() <= width || width <= MARGIN {
        return text.to_owned();
    }
    let elide_size = (width - MARGIN) / 2;
    format!(
        "{}...{}",
        &text[..elide_size],
        &text[text.len() - elide_size..]
    )
}

#[cfg(unix)]
fn is_smart_terminal() -> bool {
    let term = std::env::var("TERM").unwrap_or_default();
    term != "dumb" && unsafe { libc::isatty(1) } == 1
}

#[cfg(not(unix))]
fn is_smart_terminal() -> bool {
    false
}

#[cfg(unix)]
fn terminal_width() -> Option<usize> {
    // Safety: ioctl with a zeroed winsize out-param.
    unsafe {
        let mut size: libc::winsize = std::mem::zeroed();
        if libc::ioctl(1, libc::TIOCGWINSZ, &mut size) == 0 && size.ws_col > 0 {
            Some(size.ws_col as usize)
        } else {
            None
        }
    }
}

#[cfg(not(unix))]
fn terminal_width() -> Option<usize> {
    None
}
