//! Loads parsed manifest statements into a Graph: evaluates variables in
//! their lexical scopes, resolves rules and pools, and wires up nodes and
//! edges.

use crate::canon::canon_path;
use crate::disk::{DiskInterface, VirtualDisk};
use crate::eval::Env;
use crate::graph::{Edge, Graph, NodeId, Rule, ScopeId, DEFAULT_POOL, ROOT_SCOPE};
use crate::parse::{self, Parser, Statement};
use crate::smallmap::SmallMap;
use anyhow::{anyhow, bail};
use std::borrow::Cow;
use std::path::Path;

/// A manifest loaded into graph form: what the front-end hands the build.
#[derive(Debug)]
pub struct Loaded {
    pub graph: Graph,
    pub defaults: Vec<NodeId>,
}

/// Variable lookups that walk a scope chain in the graph.
struct ScopeEnv<'a> {
    graph: &'a Graph,
    scope: ScopeId,
}

impl Env for ScopeEnv<'_> {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        self.graph.scope_var(self.scope, var).map(Cow::Borrowed)
    }
}

struct Loader<'a> {
    graph: Graph,
    defaults: Vec<NodeId>,
    disk: &'a dyn DiskInterface,
}

impl Loader<'_> {
    fn load_file(&mut self, filename: &str, scope: ScopeId) -> anyhow::Result<()> {
        let mut bytes = match self.disk.read_file(filename)? {
            Some(bytes) => bytes,
            None => bail!("loading '{}': file not found", filename),
        };
        bytes.push(0);

        let mut parser = Parser::new(&bytes);
        loop {
            let stmt = match parser
                .read()
                .map_err(|err| anyhow!(parser.format_parse_error(Path::new(filename), err)))?
            {
                None => break,
                Some(stmt) => stmt,
            };
            match stmt {
                Statement::Binding(name, value) => {
                    // Top-level bindings are evaluated eagerly, against what
                    // is in scope so far.
                    let value = value.evaluate(&[&ScopeEnv {
                        graph: &self.graph,
                        scope,
                    }]);
                    self.graph.add_binding(scope, name, value);
                }
                Statement::Rule(rule) => {
                    let mut bindings = SmallMap::default();
                    for (name, value) in rule.vars.into_iter() {
                        bindings.insert(name.to_owned(), value.into_owned());
                    }
                    self.graph.add_rule(
                        scope,
                        Rule {
                            name: rule.name.to_owned(),
                            bindings,
                        },
                    )?;
                }
                Statement::Pool(pool) => {
                    self.graph.add_pool(pool.name, pool.depth)?;
                }
                Statement::Default(paths) => {
                    for path in paths {
                        let path = path.evaluate(&[&ScopeEnv {
                            graph: &self.graph,
                            scope,
                        }]);
                        let (path, _) = canon_path(&path)?;
                        let node = self
                            .graph
                            .lookup_node(&path)
                            .ok_or_else(|| anyhow!("unknown default target '{}'", path))?;
                        self.defaults.push(node);
                    }
                }
                Statement::Include(path) => {
                    // include parses into the same scope.
                    let path = path.evaluate(&[&ScopeEnv {
                        graph: &self.graph,
                        scope,
                    }]);
                    self.load_file(&path, scope)?;
                }
                Statement::Subninja(path) => {
                    // subninja gets a child scope: it sees our variables and
                    // rules, we don't see its.
                    let path = path.evaluate(&[&ScopeEnv {
                        graph: &self.graph,
                        scope,
                    }]);
                    let child = self.graph.add_scope(scope);
                    self.load_file(&path, child)?;
                }
                Statement::Build(build) => self.add_build(scope, build)?,
            }
        }
        Ok(())
    }

    fn add_build(&mut self, scope: ScopeId, build: parse::Build) -> anyhow::Result<()> {
        let rule = self
            .graph
            .lookup_rule(scope, build.rule)
            .ok_or_else(|| anyhow!("unknown build rule '{}'", build.rule))?;

        // Evaluate the statement's own bindings; later ones may reference
        // earlier ones.
        let mut bindings: SmallMap<String, String> = SmallMap::default();
        for (name, value) in build.vars.into_iter() {
            let value = value.evaluate(&[
                &bindings,
                &ScopeEnv {
                    graph: &self.graph,
                    scope,
                },
            ]);
            bindings.insert(name.to_owned(), value);
        }

        // Evaluate all paths before touching the graph, then intern them.
        let mut out_paths = Vec::with_capacity(build.outs.len());
        let mut in_paths = Vec::with_capacity(build.ins.len());
        {
            let scope_env = ScopeEnv {
                graph: &self.graph,
                scope,
            };
            for path in &build.outs {
                out_paths.push(path.evaluate(&[&bindings, &scope_env]));
            }
            for path in &build.ins {
                in_paths.push(path.evaluate(&[&bindings, &scope_env]));
            }
        }
        let mut outputs = Vec::with_capacity(out_paths.len());
        for path in out_paths {
            let (path, slash_bits) = canon_path(&path)?;
            outputs.push(self.graph.get_node(&path, slash_bits));
        }
        let mut inputs = Vec::with_capacity(in_paths.len());
        for path in in_paths {
            let (path, slash_bits) = canon_path(&path)?;
            inputs.push(self.graph.get_node(&path, slash_bits));
        }

        let mut edge = Edge::new(rule, scope);
        edge.bindings = bindings;
        edge.outputs = outputs;
        edge.inputs = inputs;
        edge.implicit_inputs = build.implicit_ins;
        edge.order_only_inputs = build.order_only_ins;
        let id = self.graph.add_edge(edge)?;

        // Resolve the pool only now: it can come from the edge bindings or
        // the rule, and `pool =` opts back into the default pool.
        let pool_name = self.graph.edge_binding(id, "pool");
        let pool = if pool_name.is_empty() {
            DEFAULT_POOL
        } else {
            self.graph
                .lookup_pool(&pool_name)
                .ok_or_else(|| anyhow!("unknown pool name '{}'", pool_name))?
        };
        self.graph.edge_mut(id).pool = pool;
        Ok(())
    }
}

/// Load a manifest and everything it includes.
pub fn read(build_filename: &str, disk: &dyn DiskInterface) -> anyhow::Result<Loaded> {
    let mut loader = Loader {
        graph: Graph::new(),
        defaults: Vec::new(),
        disk,
    };
    loader.load_file(build_filename, ROOT_SCOPE)?;
    Ok(Loaded {
        graph: loader.graph,
        defaults: loader.defaults,
    })
}

/// Load a manifest from a string; the graph entry point used all over the
/// tests.
pub fn read_text(text: &str) -> anyhow::Result<Loaded> {
    let disk = VirtualDisk::new();
    disk.create("build.ninja", text);
    read("build.ninja", &disk)
}
