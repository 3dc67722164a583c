//! The build graph: files (nodes), build steps (edges), rules, pools, and
//! the lexical variable scopes they evaluate in.
//!
//! Nodes and edges refer to each other cyclically, so both live in arenas
//! keyed by typed integer ids and hold ids of the other.

use crate::canon::decanonicalize_path;
use crate::densemap::{self, DenseMap};
use crate::disk::{DiskInterface, MTime};
use crate::eval::{Env, EvalString};
use crate::smallmap::SmallMap;
use anyhow::bail;
use std::borrow::Cow;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);
impl densemap::Index for NodeId {
    fn index(&self) -> usize {
        self.0
    }
}
impl From<usize> for NodeId {
    fn from(u: usize) -> NodeId {
        NodeId(u)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(usize);
impl densemap::Index for EdgeId {
    fn index(&self) -> usize {
        self.0
    }
}
impl From<usize> for EdgeId {
    fn from(u: usize) -> EdgeId {
        EdgeId(u)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleId(usize);
impl densemap::Index for RuleId {
    fn index(&self) -> usize {
        self.0
    }
}
impl From<usize> for RuleId {
    fn from(u: usize) -> RuleId {
        RuleId(u)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolId(usize);
impl densemap::Index for PoolId {
    fn index(&self) -> usize {
        self.0
    }
}
impl From<usize> for PoolId {
    fn from(u: usize) -> PoolId {
        PoolId(u)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeId(usize);
impl densemap::Index for ScopeId {
    fn index(&self) -> usize {
        self.0
    }
}
impl From<usize> for ScopeId {
    fn from(u: usize) -> ScopeId {
        ScopeId(u)
    }
}

/// The rule named "phony", present in every graph.
pub const PHONY_RULE: RuleId = RuleId(0);
/// The unnamed default pool, which admits everything.
pub const DEFAULT_POOL: PoolId = PoolId(0);
/// The built-in "console" pool: serialized, and its running edge owns the
/// terminal.
pub const CONSOLE_POOL: PoolId = PoolId(1);
/// The manifest's top-level variable scope.
pub const ROOT_SCOPE: ScopeId = ScopeId(0);

/// Information about a file in the dependency graph: its path, stat state,
/// dirtiness, and the edges it connects.
#[derive(Debug)]
pub struct Node {
    path: String,
    /// Which slashes in `path` were originally backslashes; see canon.
    slash_bits: u64,
    pub mtime: MTime,
    /// True when the underlying file is out of date.  Note that
    /// Edge::outputs_ready also participates in judging which edges to build.
    pub dirty: bool,
    /// The edge that produces this node, if any.
    pub in_edge: Option<EdgeId>,
    /// All edges that consume this node as an input.
    pub out_edges: Vec<EdgeId>,
}

impl Node {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `path()`, but with the original separator spelling restored.
    pub fn path_decanonicalized(&self) -> String {
        decanonicalize_path(&self.path, self.slash_bits)
    }

    pub fn exists(&self) -> bool {
        self.mtime.exists()
    }
}

/// A named command template.  Bindings are stored unexpanded and evaluate
/// lazily in the context of each edge.
#[derive(Debug)]
pub struct Rule {
    pub name: String,
    pub bindings: SmallMap<String, EvalString<String>>,
}

/// How many edges a pool admits at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolDepth {
    /// No limit; never delays.
    Unbounded,
    /// At most this many edges run concurrently.
    Limited(usize),
    /// One at a time, and the running edge owns the terminal.
    Console,
}

impl PoolDepth {
    /// The concurrency cap, if there is one.
    pub fn capacity(&self) -> Option<usize> {
        match self {
            PoolDepth::Unbounded => None,
            PoolDepth::Limited(n) => Some(*n),
            PoolDepth::Console => Some(1),
        }
    }
}

#[derive(Debug)]
pub struct Pool {
    pub name: String,
    pub depth: PoolDepth,
}

/// A lexical variable scope: the top-level manifest scope, or a subninja's.
#[derive(Debug, Default)]
struct Scope {
    parent: Option<ScopeId>,
    bindings: SmallMap<String, String>,
    /// Rules declared in this scope.  Rule names never shadow variables,
    /// so this is a separate map.
    rules: SmallMap<String, RuleId>,
}

/// A build step: a rule invocation binding input files to output files.
#[derive(Debug)]
pub struct Edge {
    pub rule: RuleId,
    pub pool: PoolId,
    pub scope: ScopeId,
    /// Bindings declared on the build statement, already evaluated.
    pub bindings: SmallMap<String, String>,
    /// All inputs: explicit, then implicit, then order-only.
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
    pub implicit_inputs: usize,
    pub order_only_inputs: usize,
    pub outputs_ready: bool,
    /// Whether the scanner has pulled this edge's implicit deps in; loading
    /// twice would duplicate the inputs.
    pub deps_loaded: bool,
    pub deps_missing: bool,
}

impl Edge {
    pub fn new(rule: RuleId, scope: ScopeId) -> Edge {
        Edge {
            rule,
            pool: DEFAULT_POOL,
            scope,
            bindings: SmallMap::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            implicit_inputs: 0,
            order_only_inputs: 0,
            outputs_ready: false,
            deps_loaded: false,
            deps_missing: false,
        }
    }

    pub fn is_phony(&self) -> bool {
        self.rule == PHONY_RULE
    }

    pub fn use_console(&self) -> bool {
        self.pool == CONSOLE_POOL
    }

    /// Reserved for per-edge pool weights; every edge costs 1 for now.
    pub fn weight(&self) -> usize {
        1
    }

    pub fn is_order_only(&self, input_index: usize) -> bool {
        input_index >= self.inputs.len() - self.order_only_inputs
    }

    /// The inputs that `$in` expands to.
    pub fn explicit_inputs(&self) -> &[NodeId] {
        &self.inputs[..self.inputs.len() - self.implicit_inputs - self.order_only_inputs]
    }

    /// The inputs that participate in dirtiness, i.e. everything but
    /// order-only ones.
    pub fn dirtying_inputs(&self) -> &[NodeId] {
        &self.inputs[..self.inputs.len() - self.order_only_inputs]
    }
}

#[derive(Debug)]
pub struct Graph {
    nodes: DenseMap<NodeId, Node>,
    edges: DenseMap<EdgeId, Edge>,
    rules: DenseMap<RuleId, Rule>,
    pools: DenseMap<PoolId, Pool>,
    scopes: DenseMap<ScopeId, Scope>,
    by_path: HashMap<String, NodeId>,
    pools_by_name: HashMap<String, PoolId>,
}

impl Default for Graph {
    fn default() -> Self {
        Graph::new()
    }
}

impl Graph {
    pub fn new() -> Graph {
        let mut graph = Graph {
            nodes: DenseMap::new(),
            edges: DenseMap::new(),
            rules: DenseMap::new(),
            pools: DenseMap::new(),
            scopes: DenseMap::new(),
            by_path: HashMap::new(),
            pools_by_name: HashMap::new(),
        };
        let phony = graph.rules.push(Rule {
            name: "phony".to_owned(),
            bindings: SmallMap::default(),
        });
        assert_eq!(phony, PHONY_RULE);
        let default_pool = graph.pools.push(Pool {
            name: String::new(),
            depth: PoolDepth::Unbounded,
        });
        assert_eq!(default_pool, DEFAULT_POOL);
        let console = graph.pools.push(Pool {
            name: "console".to_owned(),
            depth: PoolDepth::Console,
        });
        assert_eq!(console, CONSOLE_POOL);
        graph.pools_by_name.insert(String::new(), DEFAULT_POOL);
        graph.pools_by_name.insert("console".to_owned(), CONSOLE_POOL);
        let root = graph.scopes.push(Scope::default());
        assert_eq!(root, ROOT_SCOPE);
        graph
            .scopes
            .get_mut(ROOT_SCOPE)
            .rules
            .insert("phony".to_owned(), PHONY_RULE);
        graph
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes.get_mut(id)
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        self.edges.get(id)
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut Edge {
        self.edges.get_mut(id)
    }

    pub fn edge_ids(&self) -> impl Iterator<Item = EdgeId> {
        self.edges.ids()
    }

    pub fn rule(&self, id: RuleId) -> &Rule {
        self.rules.get(id)
    }

    pub fn pool(&self, id: PoolId) -> &Pool {
        self.pools.get(id)
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Intern a canonical path, creating the node if needed.  The slash bits
    /// of the first observation win.
    pub fn get_node(&mut self, path: &str, slash_bits: u64) -> NodeId {
        if let Some(&id) = self.by_path.get(path) {
            return id;
        }
        let id = self.nodes.push(Node {
            path: path.to_owned(),
            slash_bits,
            mtime: MTime::Unknown,
            dirty: false,
            in_edge: None,
            out_edges: Vec::new(),
        });
        self.by_path.insert(path.to_owned(), id);
        id
    }

    pub fn lookup_node(&self, path: &str) -> Option<NodeId> {
        self.by_path.get(path).copied()
    }

    /// Register an edge, wiring up each output's in-edge and each input's
    /// out-edge list.
    pub fn add_edge(&mut self, edge: Edge) -> anyhow::Result<EdgeId> {
        let id = self.edges.next_id();
        for &out in &edge.outputs {
            let node = self.nodes.get_mut(out);
            if node.in_edge.is_some() {
                bail!("multiple rules generate {}", node.path);
            }
            node.in_edge = Some(id);
        }
        for &input in &edge.inputs {
            self.nodes.get_mut(input).out_edges.push(id);
        }
        Ok(self.edges.push(edge))
    }

    pub fn add_rule(&mut self, scope: ScopeId, rule: Rule) -> anyhow::Result<RuleId> {
        if self.scopes.get(scope).rules.contains_key(rule.name.as_str()) {
            bail!("duplicate rule '{}'", rule.name);
        }
        let name = rule.name.clone();
        let id = self.rules.push(rule);
        self.scopes.get_mut(scope).rules.insert(name, id);
        Ok(id)
    }

    /// Look up a rule by name, walking the scope chain.
    pub fn lookup_rule(&self, mut scope: ScopeId, name: &str) -> Option<RuleId> {
        loop {
            let s = self.scopes.get(scope);
            if let Some(&id) = s.rules.get(name) {
                return Some(id);
            }
            scope = s.parent?;
        }
    }

    pub fn add_pool(&mut self, name: &str, depth: usize) -> anyhow::Result<PoolId> {
        if self.pools_by_name.contains_key(name) {
            bail!("duplicate pool '{}'", name);
        }
        let depth = if depth == 0 {
            PoolDepth::Unbounded
        } else {
            PoolDepth::Limited(depth)
        };
        let id = self.pools.push(Pool {
            name: name.to_owned(),
            depth,
        });
        self.pools_by_name.insert(name.to_owned(), id);
        Ok(id)
    }

    pub fn lookup_pool(&self, name: &str) -> Option<PoolId> {
        self.pools_by_name.get(name).copied()
    }

    pub fn add_scope(&mut self, parent: ScopeId) -> ScopeId {
        self.scopes.push(Scope {
            parent: Some(parent),
            bindings: SmallMap::default(),
            rules: SmallMap::default(),
        })
    }

    pub fn add_binding(&mut self, scope: ScopeId, name: &str, value: String) {
        self.scopes
            .get_mut(scope)
            .bindings
            .insert(name.to_owned(), value);
    }

    /// Look up a variable, walking the scope chain.
    pub fn scope_var(&self, mut scope: ScopeId, var: &str) -> Option<&str> {
        loop {
            let s = self.scopes.get(scope);
            if let Some(val) = s.bindings.get(var) {
                return Some(val);
            }
            scope = s.parent?;
        }
    }

    /// Stat a node, recording the result.
    pub fn stat(&mut self, disk: &dyn DiskInterface, id: NodeId) -> anyhow::Result<()> {
        let mtime = disk.stat(&self.nodes.get(id).path)?;
        self.nodes.get_mut(id).mtime = mtime;
        Ok(())
    }

    /// Stat a node unless its state is already known.  Returns true if this
    /// call performed the stat, which drives the scanner's memoization.
    pub fn stat_if_necessary(
        &mut self,
        disk: &dyn DiskInterface,
        id: NodeId,
    ) -> anyhow::Result<bool> {
        if self.nodes.get(id).mtime.known() {
            return Ok(false);
        }
        self.stat(disk, id)?;
        Ok(true)
    }

    /// True if every input's producing edge has finished (inputs without a
    /// producer are always ready).
    pub fn all_inputs_ready(&self, id: EdgeId) -> bool {
        self.edge(id)
            .inputs
            .iter()
            .all(|&input| match self.node(input).in_edge {
                Some(in_edge) => self.edge(in_edge).outputs_ready,
                None => true,
            })
    }

    /// Outputs that no edge consumes; used as the default build targets when
    /// the manifest declares none.
    pub fn roots(&self) -> Vec<NodeId> {
        self.nodes
            .ids()
            .filter(|&id| {
                let node = self.nodes.get(id);
                node.in_edge.is_some() && node.out_edges.is_empty()
            })
            .collect()
    }

    /// The shell-escaped value of an edge binding; empty if unbound.
    pub fn edge_binding(&self, id: EdgeId, key: &str) -> String {
        let env = EdgeEnv {
            graph: self,
            id,
            escape: EscapeKind::ShellEscape,
        };
        env.get_var(key).map(Cow::into_owned).unwrap_or_default()
    }

    /// Boolean edge bindings like `restat` and `generator` are true when
    /// bound to any non-empty value.
    pub fn edge_binding_bool(&self, id: EdgeId, key: &str) -> bool {
        !self.edge_binding(id, key).is_empty()
    }

    /// Like edge_binding but without shell escaping; for `depfile` and
    /// `rspfile`, which name files rather than feed a shell.
    pub fn unescaped_edge_binding(&self, id: EdgeId, key: &str) -> String {
        let env = EdgeEnv {
            graph: self,
            id,
            escape: EscapeKind::DoNotEscape,
        };
        env.get_var(key).map(Cow::into_owned).unwrap_or_default()
    }

    /// Expand an edge's command.  With `incl_rsp_file`, the expanded rspfile
    /// content is appended so that rspfile changes alter the command hash.
    pub fn evaluate_command(&self, id: EdgeId, incl_rsp_file: bool) -> String {
        let mut command = self.edge_binding(id, "command");
        if incl_rsp_file {
            let rspfile_content = self.edge_binding(id, "rspfile_content");
            if !rspfile_content.is_empty() {
                command.push_str(";rspfile=");
                command.push_str(&rspfile_content);
            }
        }
        command
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum EscapeKind {
    ShellEscape,
    DoNotEscape,
}

/// An Env for evaluating bindings in the context of an edge: provides $in
/// and $out, the edge's own bindings, the rule's lazily-expanded bindings,
/// and the enclosing scope chain, in that order.
struct EdgeEnv<'a> {
    graph: &'a Graph,
    id: EdgeId,
    escape: EscapeKind,
}

impl EdgeEnv<'_> {
    fn make_path_list(&self, nodes: &[NodeId], sep: char) -> String {
        let mut result = String::new();
        for &id in nodes {
            if !result.is_empty() {
                result.push(sep);
            }
            let path = self.graph.node(id).path_decanonicalized();
            match self.escape {
                EscapeKind::ShellEscape => {
                    if cfg!(windows) {
                        win32_escape(&path, &mut result)
                    } else {
                        shell_escape(&path, &mut result)
                    }
                }
                EscapeKind::DoNotEscape => result.push_str(&path),
            }
        }
        result
    }
}

impl Env for EdgeEnv<'_> {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        let edge = self.graph.edge(self.id);
        match var {
            "in" | "in_newline" => {
                let sep = if var == "in" { ' ' } else { '\n' };
                Some(Cow::Owned(
                    self.make_path_list(edge.explicit_inputs(), sep),
                ))
            }
            "out" => Some(Cow::Owned(self.make_path_list(&edge.outputs, ' '))),
            _ => {
                if let Some(val) = edge.bindings.get(var) {
                    return Some(Cow::Borrowed(val.as_str()));
                }
                if let Some(eval) = self.graph.rule(edge.rule).bindings.get(var) {
                    return Some(Cow::Owned(eval.evaluate(&[self])));
                }
                self.graph.scope_var(edge.scope, var).map(Cow::Borrowed)
            }
        }
    }
}

fn is_shell_safe(c: char) -> bool {
    matches!(c, 'A'..='Z' | 'a'..='z' | '0'..='9' | '_' | '+' | '-' | '.' | '/')
}

/// Append `input` to `result` with POSIX shell quoting.
pub fn shell_escape(input: &str, result: &mut String) {
    if input.chars().all(is_shell_safe) {
        result.push_str(input);
        return;
    }
    result.push('\'');
    for c in input.chars() {
        if c == '\'' {
            result.push_str("'\\''");
        } else {
            result.push(c);
        }
    }
    result.push('\'');
}

/// Append `input` to `result` with CommandLineToArgvW-compatible quoting.
pub fn win32_escape(input: &str, result: &mut String) {
    if !input.contains([' ', '"']) {
        result.push_str(input);
        return;
    }
    result.push('"');
    let mut consecutive_backslashes = 0;
    for c in input.chars() {
        match c {
            '\\' => consecutive_backslashes += 1,
            '"' => {
                // A quote needs its own escape plus one for each backslash
                // immediately preceding it.
                for _ in 0..consecutive_backslashes + 1 {
                    result.push('\\');
                }
                consecutive_backslashes = 0;
            }
            _ => consecutive_backslashes = 0,
        }
        result.push(c);
    }
    for _ in 0..consecutive_backslashes {
        result.push('\\');
    }
    result.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load;

    fn escaped(input: &str) -> String {
        let mut out = String::new();
        shell_escape(input, &mut out);
        out
    }

    #[test]
    fn shell_escaping() {
        assert_eq!(escaped("plain_word1.o"), "plain_word1.o");
        assert_eq!(escaped("no'space"), "'no'\\''space'");
        assert_eq!(escaped("with space$"), "'with space$'");
        assert_eq!(escaped("no\"space2"), "'no\"space2'");
        assert_eq!(escaped("a b"), "'a b'");
    }

    fn win32_escaped(input: &str) -> String {
        let mut out = String::new();
        win32_escape(input, &mut out);
        out
    }

    #[test]
    fn win32_escaping() {
        assert_eq!(win32_escaped("plain"), "plain");
        assert_eq!(win32_escaped("a b"), "\"a b\"");
        assert_eq!(win32_escaped("has\"quote"), "\"has\\\"quote\"");
        assert_eq!(win32_escaped("trail\\ ing\\"), "\"trail\\ ing\\\\\"");
    }

    #[cfg(unix)]
    #[test]
    fn evaluate_command_escapes_paths() {
        let loaded = load::read_text(
            "rule cat\n  command = cat $in > $out\n\
             build a$ b: cat no'space with$ space$$ no\"space2\n",
        )
        .unwrap();
        let graph = loaded.graph;
        let out = graph.lookup_node("a b").unwrap();
        let edge = graph.node(out).in_edge.unwrap();
        assert_eq!(
            graph.evaluate_command(edge, false),
            "cat 'no'\\''space' 'with space$' 'no\"space2' > 'a b'"
        );
    }

    #[test]
    fn in_newline_separator() {
        let loaded = load::read_text(
            "rule join\n  command = join $in_newline > $out\n\
             build out: join a b c\n",
        )
        .unwrap();
        let graph = loaded.graph;
        let out = graph.lookup_node("out").unwrap();
        let edge = graph.node(out).in_edge.unwrap();
        assert_eq!(graph.evaluate_command(edge, false), "join a\nb\nc > out");
    }

    #[test]
    fn rule_binding_expands_lazily_in_edge_env() {
        let loaded = load::read_text(
            "rule cc\n  command = cc -MF $depfile $in\n  depfile = $out.d\n\
             build out.o: cc in.c\n",
        )
        .unwrap();
        let graph = loaded.graph;
        let out = graph.lookup_node("out.o").unwrap();
        let edge = graph.node(out).in_edge.unwrap();
        assert_eq!(graph.evaluate_command(edge, false), "cc -MF out.o.d in.c");
    }

    #[test]
    fn scope_var_reaches_commands() {
        let loaded = load::read_text(
            "flags = -O2\n\
             rule cc\n  command = cc $flags $in\n\
             build out.o: cc in.c\n",
        )
        .unwrap();
        let graph = loaded.graph;
        let out = graph.lookup_node("out.o").unwrap();
        let edge = graph.node(out).in_edge.unwrap();
        assert_eq!(graph.evaluate_command(edge, false), "cc -O2 in.c");
    }

    #[test]
    fn edge_binding_overrides_rule() {
        let loaded = load::read_text(
            "rule say\n  command = echo $out\n  description = from rule\n\
             build out: say\n  description = from edge\n",
        )
        .unwrap();
        let graph = loaded.graph;
        let out = graph.lookup_node("out").unwrap();
        let edge = graph.node(out).in_edge.unwrap();
        assert_eq!(graph.edge_binding(edge, "description"), "from edge");
    }

    #[test]
    fn rspfile_content_in_command_hash_input() {
        let loaded = load::read_text(
            "rule link\n  command = ld @$out.rsp\n  rspfile = $out.rsp\n  rspfile_content = $in\n\
             build out: link a b\n",
        )
        .unwrap();
        let graph = loaded.graph;
        let out = graph.lookup_node("out").unwrap();
        let edge = graph.node(out).in_edge.unwrap();
        assert_eq!(graph.evaluate_command(edge, false), "ld @out.rsp");
        assert_eq!(graph.evaluate_command(edge, true), "ld @out.rsp;rspfile=a b");
    }

    #[test]
    fn duplicate_output_is_an_error() {
        let err = load::read_text(
            "rule touch\n  command = touch $out\n\
             build out: touch a\n\
             build out: touch b\n",
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "multiple rules generate out");
    }
}
