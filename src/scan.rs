//! Scanning the files in the graph to update dirty and outputs_ready state,
//! by combining stat results, command-log entries, and implicit dependencies
//! loaded from depfiles or the deps log.

use crate::canon::canon_path;
use crate::command_log::CommandLog;
use crate::depfile;
use crate::deps_log::DepsLog;
use crate::disk::{DiskInterface, MTime};
use crate::graph::{Edge, EdgeId, Graph, NodeId, PHONY_RULE, ROOT_SCOPE};
use crate::hash::hash_command;
use crate::scanner::Scanner;
use anyhow::{anyhow, bail};
use std::path::Path;

/// Loads an edge's implicit inputs, as referenced via the `depfile` or
/// `deps` attributes.
pub struct ImplicitDepLoader<'a> {
    deps_log: &'a DepsLog,
    disk: &'a dyn DiskInterface,
}

impl<'a> ImplicitDepLoader<'a> {
    pub fn new(deps_log: &'a DepsLog, disk: &'a dyn DiskInterface) -> Self {
        ImplicitDepLoader { deps_log, disk }
    }

    /// Load implicit dependencies for an edge.  Returns Ok(false) when the
    /// dependency info is merely missing or out of date, which obliges a
    /// rebuild but is not an error.
    pub fn load_deps(&self, graph: &mut Graph, id: EdgeId) -> anyhow::Result<bool> {
        let deps_type = graph.edge_binding(id, "deps");
        if !deps_type.is_empty() {
            return self.load_deps_from_log(graph, id);
        }

        let depfile = graph.unescaped_edge_binding(id, "depfile");
        if !depfile.is_empty() {
            return self.load_depfile(graph, id, &depfile);
        }

        // No deps to load.
        Ok(true)
    }

    fn load_depfile(&self, graph: &mut Graph, id: EdgeId, path: &str) -> anyhow::Result<bool> {
        let mut contents = match self.disk.read_file(path)? {
            Some(contents) if !contents.is_empty() => contents,
            // Missing depfile: rebuild to regenerate it.
            _ => return Ok(false),
        };
        contents.push(0);
        let mut scanner = Scanner::new(&contents);
        let parsed = depfile::parse(&mut scanner)
            .map_err(|err| anyhow!(scanner.format_parse_error(Path::new(path), err)))?;

        let first_output = graph.edge(id).outputs[0];
        let opath = graph.node(first_output).path().to_owned();
        let mut deps = Vec::new();
        for (n, (target, target_deps)) in parsed.iter().enumerate() {
            let (target, _) = canon_path(target)?;
            // The primary rule must talk about our output; later dep-less
            // rules are the stubs -MP emits for each header.
            if n == 0 && target != opath {
                bail!(
                    "expected depfile '{}' to mention '{}', got '{}'",
                    path,
                    opath,
                    target
                );
            }
            for dep in target_deps {
                deps.push(canon_path(dep)?);
            }
        }

        let nodes: Vec<NodeId> = deps
            .iter()
            .map(|(path, slash_bits)| graph.get_node(path, *slash_bits))
            .collect();
        insert_implicit_deps(graph, id, &nodes)?;
        Ok(true)
    }

    fn load_deps_from_log(&self, graph: &mut Graph, id: EdgeId) -> anyhow::Result<bool> {
        // Deps are only stored for single-output edges; the first output
        // stands for the edge.
        let output = graph.edge(id).outputs[0];
        let deps = match self.deps_log.get_deps(output) {
            None => return Ok(false),
            Some(deps) => deps,
        };

        // Stored deps are out of date if the output changed after they were
        // recorded.
        if let MTime::Stamp(mtime) = graph.node(output).mtime {
            if mtime > deps.mtime {
                return Ok(false);
            }
        }

        let nodes = deps.nodes.clone();
        insert_implicit_deps(graph, id, &nodes)?;
        Ok(true)
    }
}

/// Splice loaded deps into the edge's implicit region, which sits between
/// the explicit and order-only inputs.
fn insert_implicit_deps(graph: &mut Graph, id: EdgeId, nodes: &[NodeId]) -> anyhow::Result<()> {
    let insert_at = {
        let edge = graph.edge(id);
        edge.inputs.len() - edge.order_only_inputs
    };
    {
        let edge = graph.edge_mut(id);
        edge.inputs.splice(insert_at..insert_at, nodes.iter().copied());
        edge.implicit_inputs += nodes.len();
    }
    for &node in nodes {
        graph.node_mut(node).out_edges.push(id);
        create_phony_in_edge(graph, node)?;
    }
    Ok(())
}

/// Give a discovered input with no producer a synthetic phony in-edge, so a
/// missing header triggers a rebuild instead of aborting the build.
fn create_phony_in_edge(graph: &mut Graph, node: NodeId) -> anyhow::Result<()> {
    if graph.node(node).in_edge.is_some() {
        return Ok(());
    }
    let mut edge = Edge::new(PHONY_RULE, ROOT_SCOPE);
    edge.outputs.push(node);
    // An earlier scan may have already stat'ed this node and judged it ready
    // for lack of an in-edge; keep outputs_ready set so that verdict stays
    // valid.  Scanning this edge recomputes the real value.
    edge.outputs_ready = true;
    graph.add_edge(edge)?;
    Ok(())
}

/// DependencyScan manages the process of scanning the files in a graph and
/// updating the dirty/outputs_ready state of all the nodes and edges.
pub struct DependencyScan<'a> {
    command_log: &'a CommandLog,
    disk: &'a dyn DiskInterface,
    dep_loader: ImplicitDepLoader<'a>,
}

impl<'a> DependencyScan<'a> {
    pub fn new(
        command_log: &'a CommandLog,
        deps_log: &'a DepsLog,
        disk: &'a dyn DiskInterface,
    ) -> Self {
        DependencyScan {
            command_log,
            disk,
            dep_loader: ImplicitDepLoader::new(deps_log, disk),
        }
    }

    /// Examine inputs, outputs, and command lines to judge whether an edge
    /// needs to be re-run, updating outputs_ready and each file's dirty bit.
    ///
    /// Recursion is memoized through the nodes' stat state: an input whose
    /// mtime is already known has had its producing edge visited.
    pub fn recompute_dirty(&self, graph: &mut Graph, id: EdgeId) -> anyhow::Result<()> {
        let mut dirty = false;
        graph.edge_mut(id).outputs_ready = true;

        if !graph.edge(id).deps_loaded {
            graph.edge_mut(id).deps_loaded = true;
            graph.edge_mut(id).deps_missing = false;
            if !self.dep_loader.load_deps(graph, id)? {
                // Failed to load dependency info: rebuild to regenerate it.
                dirty = true;
                graph.edge_mut(id).deps_missing = true;
            }
        } else if graph.edge(id).deps_missing {
            dirty = true;
        }

        // Visit all inputs; we're dirty if any of them are.
        let mut most_recent_input: Option<NodeId> = None;
        for i in 0..graph.edge(id).inputs.len() {
            let input = graph.edge(id).inputs[i];
            if graph.stat_if_necessary(self.disk, input)? {
                if let Some(in_edge) = graph.node(input).in_edge {
                    self.recompute_dirty(graph, in_edge)?;
                } else {
                    // An input with no producing edge is dirty iff missing.
                    let missing = !graph.node(input).exists();
                    graph.node_mut(input).dirty = missing;
                }
            }

            // If an input is not ready, neither are our outputs.
            if let Some(in_edge) = graph.node(input).in_edge {
                if !graph.edge(in_edge).outputs_ready {
                    graph.edge_mut(id).outputs_ready = false;
                }
            }

            if !graph.edge(id).is_order_only(i) {
                // A dirty regular input dirties us; otherwise it competes
                // for most-recent input.
                if graph.node(input).dirty {
                    dirty = true;
                } else {
                    let newer = match most_recent_input {
                        None => true,
                        Some(mri) => {
                            graph.node(input).mtime.stamp() > graph.node(mri).mtime.stamp()
                        }
                    };
                    if newer {
                        most_recent_input = Some(input);
                    }
                }
            }
        }

        // We may also be dirty due to output state: missing or out-of-date
        // outputs, a changed command line.
        if !dirty {
            dirty = self.recompute_outputs_dirty(graph, id, most_recent_input)?;
        }

        // Mark each output visited, propagating the verdict.
        for i in 0..graph.edge(id).outputs.len() {
            let output = graph.edge(id).outputs[i];
            graph.stat_if_necessary(self.disk, output)?;
            if dirty {
                graph.node_mut(output).dirty = true;
            }
        }

        // A dirty edge's outputs are not ready, except that a phony edge
        // with no inputs has nothing to run.
        if dirty && !(graph.edge(id).is_phony() && graph.edge(id).inputs.is_empty()) {
            graph.edge_mut(id).outputs_ready = false;
        }

        Ok(())
    }

    /// Whether any output of the edge is dirty with respect to the given
    /// most recent input.
    pub fn recompute_outputs_dirty(
        &self,
        graph: &mut Graph,
        id: EdgeId,
        most_recent_input: Option<NodeId>,
    ) -> anyhow::Result<bool> {
        let command = graph.evaluate_command(id, true);
        for i in 0..graph.edge(id).outputs.len() {
            let output = graph.edge(id).outputs[i];
            graph.stat_if_necessary(self.disk, output)?;
            if self.recompute_output_dirty(graph, id, most_recent_input, &command, output) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn recompute_output_dirty(
        &self,
        graph: &Graph,
        id: EdgeId,
        most_recent_input: Option<NodeId>,
        command: &str,
        output: NodeId,
    ) -> bool {
        let edge = graph.edge(id);
        if edge.is_phony() {
            // Phony edges don't write any output.  Outputs are only dirty
            // if there are no inputs and the output is missing.
            return edge.inputs.is_empty() && !graph.node(output).exists();
        }

        // Dirty if we're missing the output.
        if !graph.node(output).exists() {
            return true;
        }

        let mut entry = None;

        // Dirty if the output is older than the input.
        if let Some(mri) = most_recent_input {
            let input_mtime = graph.node(mri).mtime.stamp();
            if graph.node(output).mtime.stamp() < input_mtime {
                let mut output_mtime = graph.node(output).mtime.stamp();

                // A restat rule may have cleaned this output in a previous
                // run and stored the newest input mtime it saw in the
                // command log; judge against that stamp instead so only
                // modifications since then count.
                if graph.edge_binding_bool(id, "restat") {
                    if let Some(log_entry) = self.command_log.lookup(graph.node(output).path()) {
                        output_mtime = log_entry.restat_mtime;
                        entry = Some(log_entry);
                    }
                }

                if output_mtime < input_mtime {
                    return true;
                }
            }
        }

        // Dirty if the command changed since the last build, unless this is
        // a generator rule.
        if !graph.edge_binding_bool(id, "generator") {
            let entry = entry.or_else(|| self.command_log.lookup(graph.node(output).path()));
            match entry {
                Some(entry) => {
                    if hash_command(command) != entry.command_hash {
                        return true;
                    }
                }
                None => return true,
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::VirtualDisk;
    use crate::load;

    /// Everything needed to drive scans against an in-memory file system.
    struct Fixture {
        graph: Graph,
        disk: VirtualDisk,
        command_log: CommandLog,
        deps_log: DepsLog,
    }

    impl Fixture {
        fn new(manifest: &str) -> Fixture {
            let loaded = load::read_text(manifest).unwrap();
            Fixture {
                graph: loaded.graph,
                disk: VirtualDisk::new(),
                command_log: CommandLog::new(),
                deps_log: DepsLog::new(),
            }
        }

        fn node(&self, path: &str) -> NodeId {
            self.graph.lookup_node(path).unwrap()
        }

        fn in_edge(&self, path: &str) -> EdgeId {
            self.graph.node(self.node(path)).in_edge.unwrap()
        }

        /// Pretend `path` was just built successfully by its in-edge.
        fn record_built(&mut self, path: &str) {
            let edge = self.in_edge(path);
            self.command_log
                .record_command(&self.graph, edge, 0, 1, 0)
                .unwrap();
        }

        fn scan(&mut self, target: &str) -> anyhow::Result<()> {
            let edge = self.in_edge(target);
            let target = self.node(target);
            self.graph.stat_if_necessary(&self.disk, target)?;
            let scan = DependencyScan::new(&self.command_log, &self.deps_log, &self.disk);
            scan.recompute_dirty(&mut self.graph, edge)
        }

        fn dirty(&self, path: &str) -> bool {
            self.graph.node(self.node(path)).dirty
        }
    }

    const CAT_MANIFEST: &str = "rule cat\n  command = cat $in > $out\n\
                                build out: cat in\n";

    #[test]
    fn missing_output_is_dirty() {
        let mut fx = Fixture::new(CAT_MANIFEST);
        fx.disk.create("in", "");
        fx.scan("out").unwrap();
        assert!(fx.dirty("out"));
        assert!(!fx.graph.edge(fx.in_edge("out")).outputs_ready);
    }

    #[test]
    fn recorded_and_newer_output_is_clean() {
        let mut fx = Fixture::new(CAT_MANIFEST);
        fx.disk.create("in", "");
        fx.disk.create("out", "");
        fx.record_built("out");
        fx.scan("out").unwrap();
        assert!(!fx.dirty("out"));
        assert!(fx.graph.edge(fx.in_edge("out")).outputs_ready);
    }

    #[test]
    fn stale_output_is_dirty() {
        let mut fx = Fixture::new(CAT_MANIFEST);
        fx.disk.create("out", "");
        fx.disk.create("in", "");
        fx.record_built("out");
        fx.scan("out").unwrap();
        assert!(fx.dirty("out"));
    }

    #[test]
    fn command_change_dirties_output() {
        // Record a build under one manifest...
        let mut old = Fixture::new(CAT_MANIFEST);
        old.record_built("out");

        // ...then scan with a changed command but unchanged files.
        let mut fx = Fixture::new(
            "rule cat\n  command = cat $in $in > $out\n\
             build out: cat in\n",
        );
        fx.command_log = old.command_log;
        fx.disk.create("in", "");
        fx.disk.create("out", "");
        fx.scan("out").unwrap();
        assert!(fx.dirty("out"));
    }

    #[test]
    fn generator_rule_ignores_command_changes() {
        let manifest = "rule gen\n  command = generate $out\n  generator = 1\n\
                        build build.ninja: gen in\n";
        let mut fx = Fixture::new(manifest);
        fx.disk.create("in", "");
        fx.disk.create("build.ninja", "");
        // No command log entry at all: a generator output still counts as
        // clean as long as mtimes line up.
        fx.scan("build.ninja").unwrap();
        assert!(!fx.dirty("build.ninja"));
    }

    #[test]
    fn order_only_inputs_do_not_dirty() {
        let manifest = "rule cat\n  command = cat $in > $out\n\
                        build out: cat in || oo\n";
        let mut fx = Fixture::new(manifest);
        fx.disk.create("in", "");
        fx.disk.create("out", "");
        fx.record_built("out");
        fx.disk.touch("oo"); // newer than out, but order-only
        fx.scan("out").unwrap();
        assert!(!fx.dirty("out"));
    }

    #[test]
    fn missing_source_with_no_rule_is_dirty() {
        let mut fx = Fixture::new(CAT_MANIFEST);
        fx.disk.create("out", "");
        fx.record_built("out");
        fx.scan("out").unwrap();
        // "in" does not exist and nothing builds it.
        assert!(fx.dirty("in"));
        assert!(fx.dirty("out"));
    }

    #[test]
    fn missing_depfile_flags_deps_missing() {
        let manifest = "rule cc\n  command = cc $in\n  depfile = $out.d\n\
                        build out.o: cc in.c\n";
        let mut fx = Fixture::new(manifest);
        fx.disk.create("in.c", "");
        fx.disk.create("out.o", "");
        fx.record_built("out.o");
        fx.scan("out.o").unwrap();
        let edge = fx.in_edge("out.o");
        assert!(fx.graph.edge(edge).deps_missing);
        assert!(fx.dirty("out.o"));
    }

    #[test]
    fn depfile_adds_implicit_inputs() {
        let manifest = "rule cc\n  command = cc $in\n  depfile = $out.d\n\
                        build out.o: cc in.c || oo\n";
        let mut fx = Fixture::new(manifest);
        fx.disk.create("in.c", "");
        fx.disk.create("foo.h", "");
        fx.disk.create("out.o", "");
        fx.disk.create("out.o.d", "out.o: foo.h\n");
        fx.record_built("out.o");
        fx.scan("out.o").unwrap();

        let edge = fx.graph.edge(fx.in_edge("out.o"));
        assert_eq!(edge.implicit_inputs, 1);
        assert_eq!(edge.order_only_inputs, 1);
        // Implicit deps land between explicit and order-only inputs.
        let paths: Vec<&str> = edge
            .inputs
            .iter()
            .map(|&id| fx.graph.node(id).path())
            .collect();
        assert_eq!(paths, vec!["in.c", "foo.h", "oo"]);
        // $in still expands to the explicit inputs only.
        assert_eq!(
            fx.graph.edge(fx.in_edge("out.o")).explicit_inputs().len(),
            1
        );
        // The discovered header got a phony producer so its disappearance
        // forces a rebuild rather than an error.
        let header = fx.node("foo.h");
        let phony = fx.graph.node(header).in_edge.unwrap();
        assert!(fx.graph.edge(phony).is_phony());
    }

    #[test]
    fn depfile_target_mismatch_is_an_error() {
        let manifest = "rule cc\n  command = cc $in\n  depfile = $out.d\n\
                        build out.o: cc in.c\n";
        let mut fx = Fixture::new(manifest);
        fx.disk.create("in.c", "");
        fx.disk.create("out.o.d", "other.o: foo.h\n");
        let err = fx.scan("out.o").unwrap_err();
        assert_eq!(
            err.to_string(),
            "expected depfile 'out.o.d' to mention 'out.o', got 'other.o'"
        );
    }

    #[test]
    fn deps_log_supplies_implicit_inputs() {
        let manifest = "rule cc\n  command = cc $in\n  deps = gcc\n\
                        build out.o: cc in.c\n";
        let mut fx = Fixture::new(manifest);
        fx.disk.create("in.c", "");
        fx.disk.create("foo.h", "");
        fx.disk.create("out.o", "");
        fx.record_built("out.o");
        let out = fx.node("out.o");
        let header = fx.node("foo.h");
        let mtime = fx.disk.mtime("out.o").unwrap();
        fx.deps_log
            .record_deps(&fx.graph, out, mtime, &[header])
            .unwrap();

        fx.scan("out.o").unwrap();
        assert!(!fx.graph.edge(fx.in_edge("out.o")).deps_missing);
        assert!(!fx.dirty("out.o"));
        assert_eq!(fx.graph.edge(fx.in_edge("out.o")).implicit_inputs, 1);
    }

    #[test]
    fn stale_deps_log_entry_forces_rebuild() {
        let manifest = "rule cc\n  command = cc $in\n  deps = gcc\n\
                        build out.o: cc in.c\n";
        let mut fx = Fixture::new(manifest);
        fx.disk.create("in.c", "");
        let out_mtime = {
            fx.disk.create("out.o", "");
            fx.disk.mtime("out.o").unwrap()
        };
        fx.record_built("out.o");
        let out = fx.node("out.o");
        // Deps recorded before the output was last written.
        fx.deps_log
            .record_deps(&fx.graph, out, out_mtime - 1, &[])
            .unwrap();

        fx.scan("out.o").unwrap();
        assert!(fx.graph.edge(fx.in_edge("out.o")).deps_missing);
        assert!(fx.dirty("out.o"));
    }

    #[test]
    fn restat_mtime_overrides_output_mtime() {
        let manifest = "rule copy\n  command = cp $in $out\n  restat = 1\n\
                        build out: copy in\n";
        let mut fx = Fixture::new(manifest);
        fx.disk.create("out", "");
        fx.disk.create("in", "");
        let in_mtime = fx.disk.mtime("in").unwrap();
        // The log says a restat run observed the input's mtime already.
        let edge = fx.in_edge("out");
        fx.command_log
            .record_command(&fx.graph, edge, 0, 1, in_mtime)
            .unwrap();
        fx.scan("out").unwrap();
        assert!(!fx.dirty("out"));
    }

    #[test]
    fn phony_aggregate_with_inputs_is_never_self_dirty() {
        let manifest = "rule touch\n  command = touch $out\n\
                        build real: touch in\n\
                        build all: phony real\n";
        let mut fx = Fixture::new(manifest);
        fx.disk.create("in", "");
        fx.disk.create("real", "");
        fx.record_built("real");
        fx.scan("all").unwrap();
        assert!(!fx.dirty("all"));
        // Phony with no inputs and no output file is dirty, though.
        let mut fx2 = Fixture::new("build ghost: phony\n");
        fx2.scan("ghost").unwrap();
        assert!(fx2.dirty("ghost"));
        // But its edge stays ready: there is nothing to run.
        assert!(fx2.graph.edge(fx2.in_edge("ghost")).outputs_ready);
    }
}
