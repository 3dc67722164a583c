//! The builder: drives the plan against a command runner, starting ready
//! edges, reaping finished commands, and recording results in the logs.
//!
//! The dispatcher here is strictly single-threaded; only command execution
//! is concurrent, hidden behind the CommandRunner interface, and the sole
//! blocking point is `wait_for_command`.

use crate::canon::canon_path;
use crate::command_log::CommandLog;
use crate::depfile;
use crate::deps_log::DepsLog;
use crate::disk::{DiskInterface, Timestamp};
use crate::graph::{EdgeId, Graph, NodeId};
use crate::plan::Plan;
use crate::scan::DependencyScan;
use crate::scanner::Scanner;
use crate::showincludes;
use crate::status::Status;
use anyhow::{anyhow, bail};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    Success,
    Failure,
    Interrupted,
}

/// Latched by the ^C handler; polled by the dispatcher between commands.
static INTERRUPT_FLAG: AtomicBool = AtomicBool::new(false);

/// Arrange for ^C to stop the dispatcher.
///
/// A terminal delivers the interrupt to the whole foreground process group,
/// so in-flight commands die on their own and surface through the runner as
/// Termination::Interrupted; the flag covers the stretches where nothing is
/// running.  The handler re-arms the default disposition, making a second
/// ^C fatal on the spot.
#[cfg(unix)]
pub fn install_interrupt_handler() {
    // Safety: signal(2) registration.
    unsafe {
        libc::signal(libc::SIGINT, on_interrupt as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
pub fn install_interrupt_handler() {}

#[cfg(unix)]
extern "C" fn on_interrupt(_sig: libc::c_int) {
    INTERRUPT_FLAG.store(true, Ordering::Release);
    // Only async-signal-safe calls from here: re-registration qualifies.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
    }
}

/// The result of running one edge's command.
pub struct CommandResult {
    pub edge: EdgeId,
    pub termination: Termination,
    /// Merged stdout and stderr of the command.
    pub output: Vec<u8>,
}

/// Interface wrapping command execution, so tests and dry runs can swap out
/// the subprocess machinery.
pub trait CommandRunner {
    fn can_run_more(&self) -> bool;
    /// Begin running an expanded command line on behalf of an edge.
    fn start_command(&mut self, edge: EdgeId, cmdline: String) -> anyhow::Result<()>;
    /// Block until a started command completes.  None when nothing is
    /// running.
    fn wait_for_command(&mut self) -> Option<CommandResult>;
    fn get_active_edges(&self) -> Vec<EdgeId>;
    /// Terminate all running commands.
    fn abort(&mut self);
}

/// Options controlling a build.
pub struct BuildConfig {
    pub parallelism: usize,
    /// Number of command failures tolerated before giving up; zero means
    /// keep going as long as progress is possible.
    pub failures_allowed: usize,
    /// Don't run commands or touch the logs; just walk the plan.
    pub dry_run: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            parallelism: 1,
            failures_allowed: 1,
            dry_run: false,
        }
    }
}

/// Builder wraps the build process: scanning targets, starting commands,
/// updating status and the on-disk logs.
pub struct Builder<'a> {
    graph: &'a mut Graph,
    plan: Plan,
    config: &'a BuildConfig,
    disk: &'a dyn DiskInterface,
    command_log: &'a mut CommandLog,
    deps_log: &'a mut DepsLog,
    status: &'a mut dyn Status,
    runner: &'a mut dyn CommandRunner,
    /// Start time per running edge, in ms relative to the build start.
    running: HashMap<EdgeId, i32>,
    start_time: Instant,
}

impl<'a> Builder<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: &'a mut Graph,
        config: &'a BuildConfig,
        disk: &'a dyn DiskInterface,
        command_log: &'a mut CommandLog,
        deps_log: &'a mut DepsLog,
        status: &'a mut dyn Status,
        runner: &'a mut dyn CommandRunner,
    ) -> Builder<'a> {
        let plan = Plan::new(graph);
        Builder {
            graph,
            plan,
            config,
            disk,
            command_log,
            deps_log,
            status,
            runner,
            running: HashMap::new(),
            start_time: Instant::now(),
        }
    }

    pub fn add_target_by_name(&mut self, name: &str) -> anyhow::Result<NodeId> {
        let (path, _) = canon_path(name)?;
        let node = match self.graph.lookup_node(&path) {
            Some(node) => node,
            None => bail!("unknown target '{}'", name),
        };
        self.add_target(node)?;
        Ok(node)
    }

    /// Add a target to the build, scanning its dependencies.  Returns false
    /// when it is already up to date.
    pub fn add_target(&mut self, node: NodeId) -> anyhow::Result<bool> {
        self.graph.stat_if_necessary(self.disk, node)?;
        if let Some(in_edge) = self.graph.node(node).in_edge {
            let scan = DependencyScan::new(self.command_log, self.deps_log, self.disk);
            scan.recompute_dirty(self.graph, in_edge)?;
            if self.graph.edge(in_edge).outputs_ready {
                return Ok(false); // Nothing to do.
            }
        }
        self.plan.add_target(self.graph, node)
    }

    /// True if the added targets need no work.
    pub fn already_up_to_date(&self) -> bool {
        !self.plan.more_to_do()
    }

    /// Run the build.  Returns the number of commands started.
    /// It is an error to call this when already_up_to_date().
    pub fn build(&mut self) -> anyhow::Result<usize> {
        assert!(!self.already_up_to_date());
        self.status.plan_has_total_edges(self.plan.command_edge_count());

        let mut pending = 0usize;
        let mut started = 0usize;
        let mut failures = 0usize;

        // First start as many commands as the runner accepts, then reap one
        // finished command; if neither is possible the build is wedged.
        while self.plan.more_to_do() {
            if INTERRUPT_FLAG.load(Ordering::Acquire) {
                self.cleanup()?;
                bail!("interrupted by user");
            }

            if self.runner.can_run_more() {
                if let Some(edge) = self.plan.find_work() {
                    if self.graph.edge(edge).is_phony() {
                        self.plan.edge_finished(self.graph, edge);
                    } else {
                        self.start_edge(edge)?;
                        pending += 1;
                        started += 1;
                    }
                    continue;
                }
            }

            if pending > 0 {
                let result = match self.runner.wait_for_command() {
                    Some(result) => result,
                    None => bail!("stuck [build]"),
                };
                pending -= 1;

                if result.termination == Termination::Interrupted {
                    self.cleanup()?;
                    bail!("interrupted by user");
                }

                if !self.finish_command(result)? {
                    failures += 1;
                    if self.config.failures_allowed != 0
                        && failures >= self.config.failures_allowed
                    {
                        if failures > 1 {
                            bail!("subcommands failed");
                        }
                        bail!("subcommand failed");
                    }
                }
                continue;
            }

            // We can neither start new commands nor wait for any.
            if failures > 0 {
                bail!("cannot make progress due to previous errors");
            }
            bail!("stuck [build]");
        }

        Ok(started)
    }

    fn start_edge(&mut self, edge: EdgeId) -> anyhow::Result<()> {
        let start_time = self.start_time.elapsed().as_millis() as i32;
        self.running.insert(edge, start_time);

        if !self.config.dry_run {
            // Create directories necessary for outputs.
            for i in 0..self.graph.edge(edge).outputs.len() {
                let output = self.graph.edge(edge).outputs[i];
                self.disk.make_dirs(self.graph.node(output).path())?;
            }

            // Write the response file, if any.
            let rspfile = self.graph.unescaped_edge_binding(edge, "rspfile");
            if !rspfile.is_empty() {
                let content = self.graph.edge_binding(edge, "rspfile_content");
                self.disk.write_file(&rspfile, content.as_bytes())?;
            }
        }

        if self.graph.edge(edge).use_console() {
            self.status.set_console_locked(true);
        }
        self.status.build_edge_started(self.graph, edge);

        let command = self.graph.evaluate_command(edge, false);
        self.runner.start_command(edge, command)?;
        Ok(())
    }

    /// Process a completed command: deps extraction, restat, log recording,
    /// plan propagation.  Returns whether the command succeeded.
    fn finish_command(&mut self, result: CommandResult) -> anyhow::Result<bool> {
        let edge = result.edge;
        let start_time = self.running.remove(&edge).unwrap_or(0);
        let end_time = self.start_time.elapsed().as_millis() as i32;

        let mut success = result.termination == Termination::Success;
        let mut output = result.output;

        // Extract discovered dependencies first, so include-listing chatter
        // never reaches the user's terminal.
        let deps_type = self.graph.edge_binding(edge, "deps");
        let mut deps_nodes: Vec<NodeId> = Vec::new();
        if success && !deps_type.is_empty() && !self.config.dry_run {
            match self.extract_deps(edge, &deps_type, &mut output) {
                Ok(nodes) => deps_nodes = nodes,
                Err(err) => {
                    if !output.is_empty() {
                        output.push(b'\n');
                    }
                    output.extend_from_slice(err.to_string().as_bytes());
                    success = false;
                }
            }
        }

        self.status
            .build_edge_finished(self.graph, edge, success, &output);
        if self.graph.edge(edge).use_console() {
            self.status.set_console_locked(false);
        }

        if !success {
            // Remove any outputs the failed command touched, so the next
            // build starts from a clean slate.  The plan keeps the edge
            // wanted, stalling everything downstream of it.
            if !self.config.dry_run {
                for i in 0..self.graph.edge(edge).outputs.len() {
                    let node = self.graph.edge(edge).outputs[i];
                    let path = self.graph.node(node).path().to_owned();
                    if self.disk.stat(&path)? != self.graph.node(node).mtime {
                        self.disk.remove_file(&path)?;
                    }
                }
            }
            return Ok(false);
        }

        // Restat the outputs.  A restat rule that left an output untouched
        // propagates cleanliness downstream instead of dirtying it.
        let mut restat_mtime: Timestamp = 0;
        if !self.config.dry_run {
            let restat = self.graph.edge_binding_bool(edge, "restat");
            let mut node_cleaned = false;
            for i in 0..self.graph.edge(edge).outputs.len() {
                let node = self.graph.edge(edge).outputs[i];
                let old_mtime = self.graph.node(node).mtime;
                let new_mtime = self.disk.stat(self.graph.node(node).path())?;
                self.graph.node_mut(node).mtime = new_mtime;
                if restat && old_mtime == new_mtime {
                    // Note this also applies to still-nonexistent outputs.
                    let scan = DependencyScan::new(self.command_log, self.deps_log, self.disk);
                    self.plan.clean_node(&scan, self.graph, node)?;
                    node_cleaned = true;
                }
            }

            if node_cleaned {
                // Record the newest input mtime, so later scans judge the
                // untouched output against it rather than the output's own
                // (older) stamp.
                restat_mtime = self.restat_input_mtime(edge)?;
                // Cleaning may have dropped whole commands from the plan.
                self.status
                    .plan_has_total_edges(self.plan.command_edge_count());
            }
        }

        // Log writes happen before edge_finished: a crash in between leaves
        // the logs as if the command never ran, and the next build reruns it.
        if !self.config.dry_run {
            self.command_log
                .record_command(self.graph, edge, start_time, end_time, restat_mtime)?;
            if !deps_type.is_empty() {
                let out = self.graph.edge(edge).outputs[0];
                let deps_mtime = self.graph.node(out).mtime.stamp();
                self.deps_log
                    .record_deps(self.graph, out, deps_mtime, &deps_nodes)?;
            }

            // The response file is only needed while the command runs.
            let rspfile = self.graph.unescaped_edge_binding(edge, "rspfile");
            if !rspfile.is_empty() {
                self.disk.remove_file(&rspfile)?;
            }
        }

        self.plan.edge_finished(self.graph, edge);
        Ok(true)
    }

    /// The newest mtime among the edge's non-order-only inputs and its
    /// depfile; zero if any of them is missing.
    fn restat_input_mtime(&mut self, edge: EdgeId) -> anyhow::Result<Timestamp> {
        let mut restat_mtime: Timestamp = 0;
        for i in 0..self.graph.edge(edge).dirtying_inputs().len() {
            let input = self.graph.edge(edge).dirtying_inputs()[i];
            match self.disk.stat(self.graph.node(input).path())?.stamp() {
                0 => return Ok(0),
                mtime => restat_mtime = restat_mtime.max(mtime),
            }
        }
        let depfile = self.graph.unescaped_edge_binding(edge, "depfile");
        if restat_mtime != 0 && !depfile.is_empty() {
            match self.disk.stat(&depfile)?.stamp() {
                0 => return Ok(0),
                mtime => restat_mtime = restat_mtime.max(mtime),
            }
        }
        Ok(restat_mtime)
    }

    /// Pull the discovered dependency list out of a finished command, either
    /// from the depfile the compiler wrote (gcc) or from /showIncludes lines
    /// in the captured output (msvc).
    fn extract_deps(
        &mut self,
        edge: EdgeId,
        deps_type: &str,
        output: &mut Vec<u8>,
    ) -> anyhow::Result<Vec<NodeId>> {
        match deps_type {
            "msvc" => {
                let prefix = {
                    let prefix = self.graph.edge_binding(edge, "msvc_deps_prefix");
                    if prefix.is_empty() {
                        showincludes::DEFAULT_SHOW_INCLUDES_PREFIX.to_owned()
                    } else {
                        prefix
                    }
                };
                let text = String::from_utf8_lossy(output).into_owned();
                let (includes, filtered) = showincludes::parse(&text, &prefix);
                *output = filtered.into_bytes();
                let mut nodes = Vec::with_capacity(includes.len());
                for include in includes {
                    let (path, slash_bits) = canon_path(&include)?;
                    nodes.push(self.graph.get_node(&path, slash_bits));
                }
                Ok(nodes)
            }
            "gcc" => {
                let depfile = self.graph.unescaped_edge_binding(edge, "depfile");
                if depfile.is_empty() {
                    bail!("edge with deps=gcc but no depfile makes no sense");
                }
                let mut contents = match self.disk.read_file(&depfile)? {
                    Some(contents) => contents,
                    None => bail!("depfile '{}' was not written", depfile),
                };
                contents.push(0);
                let mut scanner = Scanner::new(&contents);
                let parsed = depfile::parse(&mut scanner).map_err(|err| {
                    anyhow!(scanner.format_parse_error(Path::new(&depfile), err))
                })?;
                let mut nodes = Vec::new();
                for (_, deps) in parsed.iter() {
                    for dep in deps {
                        let (path, slash_bits) = canon_path(dep)?;
                        nodes.push(self.graph.get_node(&path, slash_bits));
                    }
                }
                // The depfile was a side channel; the deps log replaces it.
                self.disk.remove_file(&depfile)?;
                Ok(nodes)
            }
            _ => bail!("unknown deps type '{}'", deps_type),
        }
    }

    /// After an interrupt: kill what's running and remove half-written
    /// outputs, keeping generator outputs and untouched restat outputs.
    fn cleanup(&mut self) -> anyhow::Result<()> {
        let active = self.runner.get_active_edges();
        self.runner.abort();

        for edge in active {
            if self.graph.edge_binding_bool(edge, "generator") {
                continue;
            }
            let restat = self.graph.edge_binding_bool(edge, "restat");
            let depfile = self.graph.unescaped_edge_binding(edge, "depfile");
            for i in 0..self.graph.edge(edge).outputs.len() {
                let node = self.graph.edge(edge).outputs[i];
                let path = self.graph.node(node).path().to_owned();
                if restat && self.graph.node(node).mtime.exists() {
                    continue;
                }
                let new_mtime = self.disk.stat(&path)?;
                if !depfile.is_empty() || self.graph.node(node).mtime != new_mtime {
                    self.disk.remove_file(&path)?;
                }
            }
            if !depfile.is_empty() {
                self.disk.remove_file(&depfile)?;
            }
        }
        Ok(())
    }
}
