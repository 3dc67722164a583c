//! Runs build commands as subprocesses, potentially in parallel.
//! Unaware of the build graph or pools; just command execution.

use crate::build::{CommandResult, CommandRunner, Termination};
use crate::graph::EdgeId;
use std::collections::{HashMap, HashSet};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

/// Process ids of live children, so abort() can signal them.  Keyed by an
/// opaque per-command token.
type ChildPids = Arc<Mutex<HashMap<usize, u32>>>;

/// CommandRunner that spawns each command through the shell on its own
/// worker thread, reporting completions over a channel.
pub struct RealCommandRunner {
    parallelism: usize,
    finished_send: mpsc::Sender<CommandResult>,
    finished_recv: mpsc::Receiver<CommandResult>,
    running: HashSet<EdgeId>,
    children: ChildPids,
    next_token: usize,
}

impl RealCommandRunner {
    pub fn new(parallelism: usize) -> RealCommandRunner {
        let (finished_send, finished_recv) = mpsc::channel();
        RealCommandRunner {
            parallelism,
            finished_send,
            finished_recv,
            running: HashSet::new(),
            children: Arc::new(Mutex::new(HashMap::new())),
            next_token: 0,
        }
    }
}

impl CommandRunner for RealCommandRunner {
    fn can_run_more(&self) -> bool {
        self.running.len() < self.parallelism
    }

    fn start_command(&mut self, edge: EdgeId, cmdline: String) -> anyhow::Result<()> {
        let token = self.next_token;
        self.next_token += 1;
        let send = self.finished_send.clone();
        let children = self.children.clone();
        std::thread::spawn(move || {
            let (termination, output) = run_command(&cmdline, token, &children);
            // The send only fails if the receiver is gone, i.e. shutdown.
            let _ = send.send(CommandResult {
                edge,
                termination,
                output,
            });
        });
        self.running.insert(edge);
        Ok(())
    }

    fn wait_for_command(&mut self) -> Option<CommandResult> {
        if self.running.is_empty() {
            return None;
        }
        // Cannot fail: we hold a sender ourselves.
        let result = self.finished_recv.recv().unwrap();
        self.running.remove(&result.edge);
        Some(result)
    }

    fn get_active_edges(&self) -> Vec<EdgeId> {
        self.running.iter().copied().collect()
    }

    fn abort(&mut self) {
        // Interrupt live children; the worker threads reap them and their
        // results drain through the channel as usual.
        #[cfg(unix)]
        {
            let children = self.children.lock().unwrap();
            for &pid in children.values() {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGINT);
                }
            }
        }
    }
}

/// Run one command through the shell, merging its stdout and stderr into a
/// single stream so interleaved output reads the way it was printed.
#[cfg(unix)]
fn run_command(cmdline: &str, token: usize, children: &ChildPids) -> (Termination, Vec<u8>) {
    use std::io::Read;
    use std::os::fd::FromRawFd;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{Command, Stdio};

    // One pipe for both output streams.
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return (Termination::Failure, b"pipe failed".to_vec());
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);

    let spawned = {
        // Safety: the raw fds are freshly created above and handed off; the
        // dup gives stdout its own descriptor so both Stdio values may own
        // theirs.
        let (stdout, stderr) = unsafe {
            (
                Stdio::from_raw_fd(libc::dup(write_fd)),
                Stdio::from_raw_fd(write_fd),
            )
        };
        Command::new("/bin/sh")
            .arg("-c")
            .arg(cmdline)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
    };
    let mut child = match spawned {
        Ok(child) => child,
        Err(err) => {
            unsafe { libc::close(read_fd) };
            return (
                Termination::Failure,
                format!("failed to spawn: {}", err).into_bytes(),
            );
        }
    };
    children.lock().unwrap().insert(token, child.id());

    // The write ends were dropped with the Command above, so this reads
    // until the child (and anything it spawned) closes its copies.
    let mut output = Vec::new();
    let mut pipe = unsafe { std::fs::File::from_raw_fd(read_fd) };
    let _ = pipe.read_to_end(&mut output);

    let status = child.wait();
    children.lock().unwrap().remove(&token);

    match status {
        Ok(status) if status.success() => (Termination::Success, output),
        Ok(status) => {
            if let Some(sig) = status.signal() {
                if sig == libc::SIGINT {
                    output.extend_from_slice(b"interrupted");
                    return (Termination::Interrupted, output);
                }
                output.extend_from_slice(format!("terminated by signal {}", sig).as_bytes());
            }
            (Termination::Failure, output)
        }
        Err(err) => (
            Termination::Failure,
            format!("wait failed: {}", err).into_bytes(),
        ),
    }
}

#[cfg(not(unix))]
fn run_command(cmdline: &str, _token: usize, _children: &ChildPids) -> (Termination, Vec<u8>) {
    match std::process::Command::new("cmd")
        .arg("/c")
        .arg(cmdline)
        .output()
    {
        Ok(out) => {
            let mut output = out.stdout;
            output.extend_from_slice(&out.stderr);
            let termination = if out.status.success() {
                Termination::Success
            } else {
                Termination::Failure
            };
            (termination, output)
        }
        Err(err) => (
            Termination::Failure,
            format!("failed to spawn: {}", err).into_bytes(),
        ),
    }
}

/// A CommandRunner that doesn't actually run the commands; everything
/// "succeeds" immediately.  Backs the -n flag.
#[derive(Default)]
pub struct DryRunCommandRunner {
    finished: std::collections::VecDeque<EdgeId>,
}

impl DryRunCommandRunner {
    pub fn new() -> DryRunCommandRunner {
        DryRunCommandRunner::default()
    }
}

impl CommandRunner for DryRunCommandRunner {
    fn can_run_more(&self) -> bool {
        true
    }

    fn start_command(&mut self, edge: EdgeId, _cmdline: String) -> anyhow::Result<()> {
        self.finished.push_back(edge);
        Ok(())
    }

    fn wait_for_command(&mut self) -> Option<CommandResult> {
        self.finished.pop_front().map(|edge| CommandResult {
            edge,
            termination: Termination::Success,
            output: Vec::new(),
        })
    }

    fn get_active_edges(&self) -> Vec<EdgeId> {
        self.finished.iter().copied().collect()
    }

    fn abort(&mut self) {
        self.finished.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;

    fn edge_id(graph: &mut Graph, n: usize) -> EdgeId {
        use crate::graph::{Edge, PHONY_RULE, ROOT_SCOPE};
        let mut last = None;
        for i in graph.edge_ids().count()..=n {
            let mut edge = Edge::new(PHONY_RULE, ROOT_SCOPE);
            let node = graph.get_node(&format!("file{}", i), 0);
            edge.outputs.push(node);
            last = Some(graph.add_edge(edge).unwrap());
        }
        last.unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn captures_merged_output() {
        let mut graph = Graph::new();
        let edge = edge_id(&mut graph, 0);
        let mut runner = RealCommandRunner::new(1);
        runner
            .start_command(edge, "echo to-stdout && echo to-stderr >&2".to_owned())
            .unwrap();
        let result = runner.wait_for_command().unwrap();
        assert_eq!(result.termination, Termination::Success);
        let output = String::from_utf8(result.output).unwrap();
        assert!(output.contains("to-stdout"));
        assert!(output.contains("to-stderr"));
        assert!(runner.wait_for_command().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn reports_failure_status() {
        let mut graph = Graph::new();
        let edge = edge_id(&mut graph, 0);
        let mut runner = RealCommandRunner::new(1);
        runner.start_command(edge, "exit 3".to_owned()).unwrap();
        let result = runner.wait_for_command().unwrap();
        assert_eq!(result.termination, Termination::Failure);
    }

    #[cfg(unix)]
    #[test]
    fn runs_commands_in_parallel() {
        let mut graph = Graph::new();
        let a = edge_id(&mut graph, 0);
        let b = edge_id(&mut graph, 1);
        let mut runner = RealCommandRunner::new(2);
        assert!(runner.can_run_more());
        runner.start_command(a, "true".to_owned()).unwrap();
        assert!(runner.can_run_more());
        runner.start_command(b, "true".to_owned()).unwrap();
        assert!(!runner.can_run_more());
        assert!(runner.wait_for_command().is_some());
        assert!(runner.wait_for_command().is_some());
        assert!(runner.wait_for_command().is_none());
    }

    #[test]
    fn dry_run_succeeds_without_running() {
        let mut graph = Graph::new();
        let edge = edge_id(&mut graph, 0);
        let mut runner = DryRunCommandRunner::new();
        runner
            .start_command(edge, "definitely-not-a-real-binary".to_owned())
            .unwrap();
        let result = runner.wait_for_command().unwrap();
        assert_eq!(result.termination, Termination::Success);
        assert!(runner.wait_for_command().is_none());
    }
}
