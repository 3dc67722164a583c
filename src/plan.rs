//! The build plan: the set of edges we intend to bring up to date, which of
//! them are ready to execute, and pool admission limiting how many run at
//! once.

use crate::densemap::DenseMap;
use crate::graph::{EdgeId, Graph, NodeId, PoolId};
use crate::scan::DependencyScan;
use anyhow::bail;
use std::collections::{HashMap, VecDeque};

/// Runtime admission state for one pool.
#[derive(Clone, Default)]
struct PoolState {
    in_use: usize,
    /// Edges waiting for the pool to free up, admitted in FIFO order.
    delayed: VecDeque<EdgeId>,
}

pub struct Plan {
    /// Edges we need brought up to date.  An edge mapping to false need not
    /// run itself, but an edge it feeds does; true means it must run.
    want: HashMap<EdgeId, bool>,
    /// Edges whose inputs are all ready, in scheduling order.
    ready: VecDeque<EdgeId>,
    pools: DenseMap<PoolId, PoolState>,
    /// Total remaining number of wanted edges.
    wanted_edges: usize,
    /// Wanted edges that have a command to run (not phony).
    command_edges: usize,
}

impl Plan {
    pub fn new(graph: &Graph) -> Plan {
        Plan {
            want: HashMap::new(),
            ready: VecDeque::new(),
            pools: DenseMap::new_sized(PoolId::from(graph.pool_count()), PoolState::default()),
            wanted_edges: 0,
            command_edges: 0,
        }
    }

    /// Add a target and its out-of-date dependencies to the plan.  Returns
    /// false when the target needs no work.
    pub fn add_target(&mut self, graph: &Graph, node: NodeId) -> anyhow::Result<bool> {
        let mut stack = Vec::new();
        self.add_sub_target(graph, node, &mut stack)
    }

    fn add_sub_target(
        &mut self,
        graph: &Graph,
        node: NodeId,
        stack: &mut Vec<NodeId>,
    ) -> anyhow::Result<bool> {
        let edge = match graph.node(node).in_edge {
            Some(edge) => edge,
            None => {
                // Leaf file: nothing can produce it, so it had better exist.
                if graph.node(node).dirty {
                    let referenced = match stack.last() {
                        Some(&parent) => {
                            format!(", needed by '{}',", graph.node(parent).path())
                        }
                        None => String::new(),
                    };
                    bail!(
                        "'{}'{} missing and no known rule to make it",
                        graph.node(node).path(),
                        referenced
                    );
                }
                return Ok(false);
            }
        };

        self.check_dependency_cycle(graph, node, stack)?;

        if graph.edge(edge).outputs_ready {
            return Ok(false); // Don't need to do anything.
        }

        // The first visit records the edge as needed by something wanted;
        // whether it must run itself depends on this node's dirtiness.
        let first_visit = !self.want.contains_key(&edge);
        if first_visit {
            self.want.insert(edge, false);
        }

        if graph.node(node).dirty && !self.want[&edge] {
            self.want.insert(edge, true);
            self.wanted_edges += 1;
            if graph.all_inputs_ready(edge) {
                self.schedule_work(graph, edge);
            }
            if !graph.edge(edge).is_phony() {
                self.command_edges += 1;
            }
        }

        if !first_visit {
            return Ok(true); // We've already processed the inputs.
        }

        stack.push(node);
        for i in 0..graph.edge(edge).inputs.len() {
            let input = graph.edge(edge).inputs[i];
            self.add_sub_target(graph, input, stack)?;
        }
        debug_assert_eq!(stack.last(), Some(&node));
        stack.pop();

        Ok(true)
    }

    fn check_dependency_cycle(
        &self,
        graph: &Graph,
        node: NodeId,
        stack: &[NodeId],
    ) -> anyhow::Result<()> {
        let start = match stack.iter().position(|&n| n == node) {
            None => return Ok(()),
            Some(start) => start,
        };
        // Repeat the node at the end to make it clearer where the loop is.
        let mut cycle: Vec<&str> = stack[start..]
            .iter()
            .map(|&n| graph.node(n).path())
            .collect();
        cycle.push(graph.node(node).path());
        bail!("dependency cycle: {}", cycle.join(" -> "));
    }

    /// Pop a ready edge off the queue of edges to build.  None when there is
    /// no work currently available.
    pub fn find_work(&mut self) -> Option<EdgeId> {
        self.ready.pop_front()
    }

    /// True if there's more work to be done.
    pub fn more_to_do(&self) -> bool {
        self.wanted_edges > 0 && self.command_edges > 0
    }

    /// Number of wanted edges with commands to run.
    pub fn command_edge_count(&self) -> usize {
        self.command_edges
    }

    /// Submit a ready edge for execution.  The edge may be delayed, for
    /// example if it's a member of a currently-full pool.
    fn schedule_work(&mut self, graph: &Graph, edge: EdgeId) {
        // An edge with duplicated outputs can be re-announced by each of
        // them; scheduling it twice would run it twice.
        if self.ready.contains(&edge) {
            return;
        }
        let pool = graph.edge(edge).pool;
        if self.pool_is_full(graph, pool) {
            let state = self.pools.get_mut(pool);
            if !state.delayed.contains(&edge) {
                state.delayed.push_back(edge);
            }
        } else {
            self.pool_edge_scheduled(graph, pool, edge);
            self.ready.push_back(edge);
        }
    }

    fn pool_is_full(&self, graph: &Graph, pool: PoolId) -> bool {
        match graph.pool(pool).depth.capacity() {
            None => false,
            Some(cap) => self.pools.get(pool).in_use >= cap,
        }
    }

    fn pool_edge_scheduled(&mut self, graph: &Graph, pool: PoolId, edge: EdgeId) {
        if graph.pool(pool).depth.capacity().is_some() {
            self.pools.get_mut(pool).in_use += graph.edge(edge).weight();
        }
    }

    /// Mark an edge as done building and propagate readiness downstream.
    pub fn edge_finished(&mut self, graph: &mut Graph, edge: EdgeId) {
        let want = self
            .want
            .remove(&edge)
            .expect("finished an edge the plan does not want");
        if want {
            self.wanted_edges -= 1;
        }
        graph.edge_mut(edge).outputs_ready = true;

        // See if this frees up any delayed jobs.  Only edges that ran held
        // pool capacity.
        let pool = graph.edge(edge).pool;
        if want {
            if graph.pool(pool).depth.capacity().is_some() {
                let state = self.pools.get_mut(pool);
                state.in_use -= graph.edge(edge).weight();
            }
        }
        self.retrieve_ready_edges(graph, pool);

        // Check off any nodes we were waiting for with this edge.
        for i in 0..graph.edge(edge).outputs.len() {
            let output = graph.edge(edge).outputs[i];
            self.node_finished(graph, output);
        }
    }

    /// Admit delayed edges in FIFO order while the pool has capacity.
    fn retrieve_ready_edges(&mut self, graph: &Graph, pool: PoolId) {
        loop {
            let admit = match self.pools.get(pool).delayed.front() {
                None => false,
                Some(&edge) => match graph.pool(pool).depth.capacity() {
                    None => true,
                    Some(cap) => self.pools.get(pool).in_use + graph.edge(edge).weight() <= cap,
                },
            };
            if !admit {
                break;
            }
            let edge = self.pools.get_mut(pool).delayed.pop_front().unwrap();
            self.pool_edge_scheduled(graph, pool, edge);
            self.ready.push_back(edge);
        }
    }

    fn node_finished(&mut self, graph: &mut Graph, node: NodeId) {
        // See if we want any edges consuming this node.
        for i in 0..graph.node(node).out_edges.len() {
            let edge = graph.node(node).out_edges[i];
            let want = match self.want.get(&edge) {
                None => continue,
                Some(&want) => want,
            };
            if !graph.all_inputs_ready(edge) {
                continue;
            }
            if want {
                self.schedule_work(graph, edge);
            } else {
                // We do not need to build this edge, but we might need to
                // build one of its dependents.
                self.edge_finished(graph, edge);
            }
        }
    }

    /// Mark a node clean during the build, unwanting downstream edges whose
    /// outputs turn out to be up to date after all.  Used when a restat rule
    /// leaves its output untouched.
    pub fn clean_node(
        &mut self,
        scan: &DependencyScan,
        graph: &mut Graph,
        node: NodeId,
    ) -> anyhow::Result<()> {
        graph.node_mut(node).dirty = false;

        for i in 0..graph.node(node).out_edges.len() {
            let edge = graph.node(node).out_edges[i];
            match self.want.get(&edge) {
                Some(&true) => {}
                _ => continue,
            }
            // Don't attempt to clean an edge that failed to load deps.
            if graph.edge(edge).deps_missing {
                continue;
            }

            // Only once all non-order-only inputs are clean can the edge's
            // outputs have changed their verdict.
            let dirtying = graph.edge(edge).dirtying_inputs().to_vec();
            if dirtying.iter().any(|&input| graph.node(input).dirty) {
                continue;
            }

            let mut most_recent_input: Option<NodeId> = None;
            for &input in &dirtying {
                let newer = match most_recent_input {
                    None => true,
                    Some(mri) => graph.node(input).mtime.stamp() > graph.node(mri).mtime.stamp(),
                };
                if newer {
                    most_recent_input = Some(input);
                }
            }

            if !scan.recompute_outputs_dirty(graph, edge, most_recent_input)? {
                for j in 0..graph.edge(edge).outputs.len() {
                    let output = graph.edge(edge).outputs[j];
                    self.clean_node(scan, graph, output)?;
                }

                self.want.insert(edge, false);
                self.wanted_edges -= 1;
                if !graph.edge(edge).is_phony() {
                    self.command_edges -= 1;
                }
            }
        }
        Ok(())
    }
}
