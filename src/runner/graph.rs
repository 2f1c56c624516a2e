//! The build graph: nodes, edges, and the arenas they live in.
//!
//! Nodes and edges refer to each other by index so the cyclic structure
//! stays borrow-checker friendly. Edge command hashes use MurmurHash64A,
//! which is part of the `.ninja_log` on-disk contract.

use std::collections::HashMap;

use thiserror::Error;

use crate::runner::env::{Env, EnvId, EvalPart, EvalString, Pool, PoolId, Rule, RuleId};

/// Stat result sentinels; real mtimes are nanoseconds since the epoch.
pub const MTIME_UNKNOWN: i64 = i64::MIN;
pub const MTIME_MISSING: i64 = i64::MIN + 1;

pub const FLAG_WORK: u8 = 1 << 0;
pub const FLAG_HASH: u8 = 1 << 1;
pub const FLAG_DIRTY_IN: u8 = 1 << 2;
pub const FLAG_DIRTY_OUT: u8 = 1 << 3;
pub const FLAG_CYCLE: u8 = 1 << 4;
pub const FLAG_DEPS: u8 = 1 << 5;
pub const FLAG_DIRTY: u8 = FLAG_DIRTY_IN | FLAG_DIRTY_OUT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(pub u32);

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("{path}:{line}:{col}: {msg}")]
    Scan { path: String, line: u32, col: u32, msg: String },
    #[error("{0}")]
    Fatal(String),
    #[error("dependency cycle involving '{0}'")]
    Cycle(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct Node {
    pub path: String,
    shellpath: Option<String>,
    /// `MTIME_UNKNOWN` until first stat; `MTIME_MISSING` if absent.
    pub mtime: i64,
    /// The mtime recorded in `.ninja_log`, if any.
    pub logmtime: i64,
    pub generated_by: Option<EdgeId>,
    pub used_by: Vec<EdgeId>,
    /// Command hash recorded for the last build of this output.
    pub hash: u64,
    /// `.ninja_deps` record id, `-1` when unwritten.
    pub id: i32,
    pub dirty: bool,
}

#[derive(Debug)]
pub struct Edge {
    pub rule: RuleId,
    pub pool: Option<PoolId>,
    pub env: EnvId,
    pub outs: Vec<NodeId>,
    /// Outputs before this index are explicit.
    pub outimpidx: usize,
    pub ins: Vec<NodeId>,
    /// Inputs before this index are explicit or implicit; the rest are
    /// order-only.
    pub inorderidx: usize,
    /// Inputs before this index are explicit.
    pub inimpidx: usize,
    pub flags: u8,
    pub hash: u64,
    /// Dirty or blocking inputs remaining.
    pub nblock: usize,
    /// Inputs that could still be pruned by restat.
    pub nprune: usize,
}

/// The whole engine state for one manifest: node table, edges, scoped
/// environments, rules, and pools.
#[derive(Debug)]
pub struct Graph {
    pub nodes: Vec<Node>,
    by_path: HashMap<String, NodeId>,
    pub edges: Vec<Edge>,
    pub envs: Vec<Env>,
    pub rules: Vec<Rule>,
    pub pools: Vec<Pool>,
    pools_by_name: HashMap<String, PoolId>,
    pub root_env: EnvId,
    pub phony_rule: RuleId,
    pub console_pool: PoolId,
    pub default_targets: Vec<NodeId>,
    /// Rule variables currently being expanded, for cycle detection.
    evaluating: Vec<(RuleId, String)>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    #[must_use]
    pub fn new() -> Self {
        let mut graph = Self {
            nodes: Vec::new(),
            by_path: HashMap::new(),
            edges: Vec::new(),
            envs: Vec::new(),
            rules: Vec::new(),
            pools: Vec::new(),
            pools_by_name: HashMap::new(),
            root_env: EnvId(0),
            phony_rule: RuleId(0),
            console_pool: PoolId(0),
            default_targets: Vec::new(),
            evaluating: Vec::new(),
        };
        graph.root_env = graph.make_env(None);
        graph.phony_rule =
            graph.add_rule(Rule { name: "phony".to_owned(), bindings: HashMap::new() });
        graph.console_pool = graph
            .add_pool(Pool::new("console".to_owned(), 1))
            .unwrap_or(PoolId(0));
        graph
    }

    // ------------------------------------------------------------------
    // environments

    pub fn make_env(&mut self, parent: Option<EnvId>) -> EnvId {
        let id = EnvId(u32::try_from(self.envs.len()).unwrap_or(u32::MAX));
        self.envs.push(Env { parent, bindings: HashMap::new() });
        id
    }

    #[must_use]
    pub fn env_var(&self, mut env: EnvId, var: &str) -> Option<&str> {
        loop {
            let e = &self.envs[env.0 as usize];
            if let Some(found) = e.bindings.get(var) {
                return Some(found);
            }
            env = e.parent?;
        }
    }

    pub fn env_add_var(&mut self, env: EnvId, var: String, value: String) {
        self.envs[env.0 as usize].bindings.insert(var, value);
    }

    /// Evaluate chunks against the environment chain.
    #[must_use]
    pub fn env_eval(&self, env: EnvId, value: &EvalString) -> String {
        let mut out = String::new();
        for part in value {
            match part {
                EvalPart::Lit(lit) => out.push_str(lit),
                EvalPart::Var(var) => {
                    if let Some(v) = self.env_var(env, var) {
                        out.push_str(v);
                    }
                }
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // rules and pools

    pub fn add_rule(&mut self, rule: Rule) -> RuleId {
        let id = RuleId(u32::try_from(self.rules.len()).unwrap_or(u32::MAX));
        self.rules.push(rule);
        id
    }

    #[must_use]
    pub fn find_rule(&self, name: &str) -> Option<RuleId> {
        self.rules
            .iter()
            .position(|r| r.name == name)
            .map(|i| RuleId(u32::try_from(i).unwrap_or(u32::MAX)))
    }

    pub fn add_pool(&mut self, pool: Pool) -> Result<PoolId, GraphError> {
        if self.pools_by_name.contains_key(&pool.name) {
            return Err(GraphError::Fatal(format!("pool '{}' redefined", pool.name)));
        }
        let id = PoolId(u32::try_from(self.pools.len()).unwrap_or(u32::MAX));
        self.pools_by_name.insert(pool.name.clone(), id);
        self.pools.push(pool);
        Ok(id)
    }

    #[must_use]
    pub fn find_pool(&self, name: &str) -> Option<PoolId> {
        self.pools_by_name.get(name).copied()
    }

    // ------------------------------------------------------------------
    // nodes

    pub fn node(&mut self, path: &str) -> NodeId {
        if let Some(found) = self.by_path.get(path) {
            return *found;
        }
        let id = NodeId(u32::try_from(self.nodes.len()).unwrap_or(u32::MAX));
        self.nodes.push(Node {
            path: path.to_owned(),
            shellpath: None,
            mtime: MTIME_UNKNOWN,
            logmtime: MTIME_MISSING,
            generated_by: None,
            used_by: Vec::new(),
            hash: 0,
            id: -1,
            dirty: false,
        });
        self.by_path.insert(path.to_owned(), id);
        id
    }

    #[must_use]
    pub fn node_lookup(&self, path: &str) -> Option<NodeId> {
        self.by_path.get(path).copied()
    }

    /// Stat the node's path, caching the result.
    pub fn node_stat(&mut self, node: NodeId) {
        let path = self.nodes[node.0 as usize].path.clone();
        let mtime = match std::fs::metadata(&path) {
            Ok(meta) => meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .and_then(|d| i64::try_from(d.as_nanos()).ok())
                .unwrap_or(0),
            Err(_) => MTIME_MISSING,
        };
        self.nodes[node.0 as usize].mtime = mtime;
    }

    /// The node's path, shell-escaped on demand and cached.
    pub fn node_path(&mut self, node: NodeId, escape: bool) -> String {
        if !escape {
            return self.nodes[node.0 as usize].path.clone();
        }
        if let Some(cached) = &self.nodes[node.0 as usize].shellpath {
            return cached.clone();
        }
        let escaped = shell_escape(&self.nodes[node.0 as usize].path);
        self.nodes[node.0 as usize].shellpath = Some(escaped.clone());
        escaped
    }

    // ------------------------------------------------------------------
    // edges

    pub fn make_edge(&mut self, parent: EnvId) -> EdgeId {
        let env = self.make_env(Some(parent));
        let id = EdgeId(u32::try_from(self.edges.len()).unwrap_or(u32::MAX));
        self.edges.push(Edge {
            rule: self.phony_rule,
            pool: None,
            env,
            outs: Vec::new(),
            outimpidx: 0,
            ins: Vec::new(),
            inorderidx: 0,
            inimpidx: 0,
            flags: 0,
            hash: 0,
            nblock: 0,
            nprune: 0,
        });
        id
    }

    fn make_phony(&mut self, node: NodeId) -> EdgeId {
        let edge = self.make_edge(self.root_env);
        let e = &mut self.edges[edge.0 as usize];
        e.rule = self.phony_rule;
        e.outs.push(node);
        e.outimpidx = 1;
        self.nodes[node.0 as usize].generated_by = Some(edge);
        edge
    }

    /// Splice discovered dependencies in as implicit inputs, ahead of the
    /// order-only section. Sources without a generator get a phony edge.
    pub fn edge_add_deps(&mut self, edge: EdgeId, deps: &[NodeId]) {
        for dep in deps {
            if self.nodes[dep.0 as usize].generated_by.is_none() {
                self.make_phony(*dep);
            }
            self.nodes[dep.0 as usize].used_by.push(edge);
        }
        let e = &mut self.edges[edge.0 as usize];
        let at = e.inorderidx;
        for (i, dep) in deps.iter().enumerate() {
            e.ins.insert(at + i, *dep);
        }
        e.inorderidx += deps.len();
    }

    /// Join the selected nodes' paths with `sep`, shell-escaping each.
    pub fn path_list(&mut self, nodes: &[NodeId], sep: char, escape: bool) -> Option<String> {
        if nodes.is_empty() {
            return None;
        }
        let parts: Vec<String> = nodes.to_vec().iter().map(|n| self.node_path(*n, escape)).collect();
        Some(parts.join(&sep.to_string()))
    }

    /// Resolve an edge variable: special names, edge bindings, rule
    /// bindings (recursively evaluated, with cycle detection), then the
    /// enclosing environment.
    pub fn edge_var(
        &mut self,
        edge: EdgeId,
        var: &str,
        escape: bool,
    ) -> Result<Option<String>, GraphError> {
        let (ins, outs, env, rule) = {
            let e = &self.edges[edge.0 as usize];
            (e.ins.clone(), e.outs.clone(), e.env, e.rule)
        };
        let (inimpidx, outimpidx) = {
            let e = &self.edges[edge.0 as usize];
            (e.inimpidx, e.outimpidx)
        };
        match var {
            "in" => return Ok(self.path_list(&ins[..inimpidx], ' ', escape)),
            "in_newline" => return Ok(self.path_list(&ins[..inimpidx], '\n', escape)),
            "out" => return Ok(self.path_list(&outs[..outimpidx], ' ', escape)),
            _ => {}
        }
        if let Some(found) = self.envs[env.0 as usize].bindings.get(var) {
            return Ok(Some(found.clone()));
        }
        let Some(value) = self.rules[rule.0 as usize].bindings.get(var).cloned() else {
            let parent = self.envs[env.0 as usize].parent;
            return Ok(parent.and_then(|p| self.env_var(p, var)).map(ToOwned::to_owned));
        };
        let key = (rule, var.to_owned());
        if self.evaluating.contains(&key) {
            return Err(GraphError::Fatal(format!("cycle in rule variable involving '{var}'")));
        }
        self.evaluating.push(key);
        let mut out = String::new();
        let mut result = Ok(());
        for part in &value {
            match part {
                EvalPart::Lit(lit) => out.push_str(lit),
                EvalPart::Var(inner) => match self.edge_var(edge, inner, escape) {
                    Ok(Some(v)) => out.push_str(&v),
                    Ok(None) => {}
                    Err(err) => {
                        result = Err(err);
                        break;
                    }
                },
            }
        }
        self.evaluating.pop();
        result.map(|()| Some(out))
    }

    /// Convenience wrapper treating a missing variable as empty.
    pub fn edge_var_or_empty(
        &mut self,
        edge: EdgeId,
        var: &str,
        escape: bool,
    ) -> Result<String, GraphError> {
        Ok(self.edge_var(edge, var, escape)?.unwrap_or_default())
    }

    #[must_use]
    pub fn edge_bool_var(&mut self, edge: EdgeId, var: &str) -> bool {
        matches!(self.edge_var(edge, var, true), Ok(Some(v)) if !v.is_empty())
    }

    /// Hash the edge command (plus the rsp file content when present) for
    /// the build log.
    pub fn edge_hash(&mut self, edge: EdgeId) -> Result<u64, GraphError> {
        if self.edges[edge.0 as usize].flags & FLAG_HASH != 0 {
            return Ok(self.edges[edge.0 as usize].hash);
        }
        self.edges[edge.0 as usize].flags |= FLAG_HASH;
        let Some(cmd) = self.edge_var(edge, "command", true)? else {
            let rule = self.edges[edge.0 as usize].rule;
            let name = self.rules[rule.0 as usize].name.clone();
            return Err(GraphError::Fatal(format!("rule '{name}' has no command")));
        };
        let rsp = self.edge_var(edge, "rspfile_content", true)?;
        let hash = match rsp {
            Some(rsp) if !rsp.is_empty() => {
                let combined = format!("{cmd};rspfile={rsp}");
                murmurhash64a(combined.as_bytes())
            }
            _ => murmurhash64a(cmd.as_bytes()),
        };
        self.edges[edge.0 as usize].hash = hash;
        Ok(hash)
    }

    /// Default targets: explicit `default` statements, otherwise every
    /// output no edge consumes.
    #[must_use]
    pub fn default_nodes(&self) -> Vec<NodeId> {
        if !self.default_targets.is_empty() {
            return self.default_targets.clone();
        }
        let mut out = Vec::new();
        for edge in &self.edges {
            for node in &edge.outs {
                if self.nodes[node.0 as usize].used_by.is_empty() {
                    out.push(*node);
                }
            }
        }
        out
    }
}

/// Plain work list: LIFO main queue (front-loaded) feeding the scheduler.
#[derive(Debug, Default)]
pub struct WorkQueue {
    pub ready: Vec<EdgeId>,
}

impl WorkQueue {
    pub fn push_front(&mut self, edge: EdgeId) {
        self.ready.push(edge);
    }

    pub fn pop(&mut self) -> Option<EdgeId> {
        self.ready.pop()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }
}

/// MurmurHash64A with samurai's seed; the hash value lands in
/// `.ninja_log`, so the algorithm is part of the format.
#[must_use]
pub fn murmurhash64a(data: &[u8]) -> u64 {
    const SEED: u64 = 0xdeca_fbad_deca_fbad;
    const M: u64 = 0xc6a4_a793_5bd1_e995;
    const R: u32 = 47;
    let mut h = SEED ^ (data.len() as u64).wrapping_mul(M);
    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut k = u64::from_le_bytes(chunk.try_into().unwrap_or([0; 8]));
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0_u64;
        for (i, b) in tail.iter().enumerate() {
            k |= u64::from(*b) << (8 * i);
        }
        h ^= k;
        h = h.wrapping_mul(M);
    }
    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}

/// Escape a path for `/bin/sh` the way ninja does: quote only when the
/// path strays outside the known-safe set.
#[must_use]
pub fn shell_escape(path: &str) -> String {
    let safe =
        |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '-' | '.' | '/' | '@' | '=');
    if !path.is_empty() && path.chars().all(safe) {
        return path.to_owned();
    }
    let mut out = String::with_capacity(path.len() + 2);
    out.push('\'');
    for c in path.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Collapse `.` and empty path segments; keeps the graph keyed on one
/// spelling per file.
#[must_use]
pub fn canon_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(p) if *p != "..") {
                    parts.pop();
                } else {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    let mut out = String::new();
    if absolute {
        out.push('/');
    }
    out.push_str(&joined);
    if out.is_empty() { ".".to_owned() } else { out }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::env::literal;
    use rstest::rstest;

    #[rstest]
    fn node_table_interns_by_path() {
        let mut g = Graph::new();
        let a = g.node("out/a.o");
        let b = g.node("out/a.o");
        assert_eq!(a, b);
        assert_eq!(g.node_lookup("out/a.o"), Some(a));
    }

    #[rstest]
    fn edge_vars_resolve_through_the_chain() {
        let mut g = Graph::new();
        g.env_add_var(g.root_env, "cflags".into(), "-O2".into());
        let rule = g.add_rule(Rule {
            name: "cc".into(),
            bindings: HashMap::from([(
                "command".into(),
                vec![
                    EvalPart::Lit("cc ".into()),
                    EvalPart::Var("cflags".into()),
                    EvalPart::Lit(" -c ".into()),
                    EvalPart::Var("in".into()),
                    EvalPart::Lit(" -o ".into()),
                    EvalPart::Var("out".into()),
                ],
            )]),
        });
        let edge = g.make_edge(g.root_env);
        g.edges[edge.0 as usize].rule = rule;
        let src = g.node("a.c");
        let out = g.node("a.o");
        g.edges[edge.0 as usize].ins.push(src);
        g.edges[edge.0 as usize].inimpidx = 1;
        g.edges[edge.0 as usize].inorderidx = 1;
        g.edges[edge.0 as usize].outs.push(out);
        g.edges[edge.0 as usize].outimpidx = 1;

        let cmd = g.edge_var(edge, "command", true).expect("eval").expect("present");
        assert_eq!(cmd, "cc -O2 -c a.c -o a.o");
    }

    #[rstest]
    fn edge_binding_overrides_rule_and_root() {
        let mut g = Graph::new();
        g.env_add_var(g.root_env, "flags".into(), "root".into());
        let rule =
            g.add_rule(Rule { name: "r".into(), bindings: HashMap::from([("command".into(), literal(":"))]) });
        let edge = g.make_edge(g.root_env);
        g.edges[edge.0 as usize].rule = rule;
        let env = g.edges[edge.0 as usize].env;
        g.env_add_var(env, "flags".into(), "edge".into());
        let v = g.edge_var(edge, "flags", true).expect("eval");
        assert_eq!(v.as_deref(), Some("edge"));
    }

    #[rstest]
    fn rule_variable_cycles_are_fatal() {
        let mut g = Graph::new();
        let rule = g.add_rule(Rule {
            name: "r".into(),
            bindings: HashMap::from([
                ("command".into(), vec![EvalPart::Var("a".into())]),
                ("a".into(), vec![EvalPart::Var("b".into())]),
                ("b".into(), vec![EvalPart::Var("a".into())]),
            ]),
        });
        let edge = g.make_edge(g.root_env);
        g.edges[edge.0 as usize].rule = rule;
        assert!(g.edge_var(edge, "command", true).is_err());
    }

    #[rstest]
    fn edge_hash_includes_rspfile_content() {
        let mut g = Graph::new();
        let mk = |g: &mut Graph, rsp: Option<&str>| {
            let mut bindings = HashMap::from([("command".into(), literal("cc a.c"))]);
            if let Some(rsp) = rsp {
                bindings.insert("rspfile_content".into(), literal(rsp));
            }
            let rule = g.add_rule(Rule { name: format!("r{}", g.rules.len()), bindings });
            let edge = g.make_edge(g.root_env);
            g.edges[edge.0 as usize].rule = rule;
            g.edge_hash(edge).expect("hash")
        };
        let plain = mk(&mut g, None);
        let with_rsp = mk(&mut g, Some("extra"));
        assert_ne!(plain, with_rsp);
        // Identical command, identical hash.
        let again = mk(&mut g, None);
        assert_eq!(plain, again);
    }

    #[rstest]
    #[case("a/b", "a/b")]
    #[case("./a//b", "a/b")]
    #[case("a/../b", "b")]
    #[case("/x/./y", "/x/y")]
    fn canonicalizes_paths(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(canon_path(input), expected);
    }

    #[rstest]
    fn shell_escape_quotes_only_when_needed() {
        assert_eq!(shell_escape("plain/path.o"), "plain/path.o");
        assert_eq!(shell_escape("has space"), "'has space'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
    }

    #[rstest]
    fn murmur_is_stable() {
        // Locked value: the hash is persisted in .ninja_log files.
        let h1 = murmurhash64a(b"gcc -c main.c");
        let h2 = murmurhash64a(b"gcc -c main.c");
        assert_eq!(h1, h2);
        assert_ne!(h1, murmurhash64a(b"gcc -c main2.c"));
    }

    #[rstest]
    fn default_nodes_fall_back_to_unconsumed_outputs() {
        let mut g = Graph::new();
        let rule =
            g.add_rule(Rule { name: "r".into(), bindings: HashMap::from([("command".into(), literal(":"))]) });
        let e1 = g.make_edge(g.root_env);
        g.edges[e1.0 as usize].rule = rule;
        let mid = g.node("mid");
        let fin = g.node("final");
        g.edges[e1.0 as usize].outs.push(mid);
        g.edges[e1.0 as usize].outimpidx = 1;
        g.nodes[mid.0 as usize].generated_by = Some(e1);

        let e2 = g.make_edge(g.root_env);
        g.edges[e2.0 as usize].rule = rule;
        g.edges[e2.0 as usize].ins.push(mid);
        g.edges[e2.0 as usize].outs.push(fin);
        g.edges[e2.0 as usize].outimpidx = 1;
        g.nodes[mid.0 as usize].used_by.push(e2);
        g.nodes[fin.0 as usize].generated_by = Some(e2);

        assert_eq!(g.default_nodes(), vec![fin]);
    }
}
