//! Manifest parser: materializes rules, edges, pools, and bindings from
//! the scanned statement stream.

use std::collections::HashMap;

use crate::runner::env::{EnvId, EvalString, Pool, Rule};
use crate::runner::graph::{Graph, GraphError, canon_path};
use crate::runner::scan::{Keyword, Scanner, Statement};

/// Highest manifest version this engine understands.
pub const NINJA_MAJOR: u32 = 1;
pub const NINJA_MINOR: u32 = 9;

/// Parse-time behavior switches (`-w dupbuild=warn`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOpts {
    pub dupbuild_warn: bool,
}

pub fn parse_file(
    graph: &mut Graph,
    opts: ParseOpts,
    path: &str,
    env: EnvId,
) -> Result<(), GraphError> {
    let scanner = Scanner::from_file(path)?;
    parse(graph, opts, scanner, env)
}

pub fn parse(
    graph: &mut Graph,
    opts: ParseOpts,
    mut scanner: Scanner,
    env: EnvId,
) -> Result<(), GraphError> {
    loop {
        match scanner.keyword()? {
            Statement::Eof => return Ok(()),
            Statement::Keyword(Keyword::Rule) => parse_rule(graph, &mut scanner)?,
            Statement::Keyword(Keyword::Build) => parse_edge(graph, opts, &mut scanner, env)?,
            Statement::Keyword(Keyword::Include) => {
                parse_include(graph, opts, &mut scanner, env, false)?;
            }
            Statement::Keyword(Keyword::Subninja) => {
                parse_include(graph, opts, &mut scanner, env, true)?;
            }
            Statement::Keyword(Keyword::Default) => parse_default(graph, &mut scanner, env)?,
            Statement::Keyword(Keyword::Pool) => parse_pool(graph, &mut scanner, env)?,
            Statement::Variable(name) => {
                let value = parse_let(&mut scanner)?;
                let value = graph.env_eval(env, &value);
                if name == "ninja_required_version" {
                    check_version(&value)?;
                }
                graph.env_add_var(env, name, value);
            }
        }
    }
}

/// `name = value` after the current token, then newline.
fn parse_let(scanner: &mut Scanner) -> Result<EvalString, GraphError> {
    scanner.expect_char(b'=')?;
    let value = scanner.string(false)?.unwrap_or_default();
    scanner.expect_newline()?;
    Ok(value)
}

fn parse_rule(graph: &mut Graph, scanner: &mut Scanner) -> Result<(), GraphError> {
    let name = scanner.name()?;
    if graph.find_rule(&name).is_some() {
        return Err(GraphError::Fatal(format!("rule '{name}' redefined")));
    }
    scanner.expect_newline()?;
    let mut bindings: HashMap<String, EvalString> = HashMap::new();
    while scanner.indent()? {
        let var = scanner.name()?;
        let value = parse_let(scanner)?;
        bindings.insert(var, value);
    }
    if !bindings.contains_key("command") {
        return Err(GraphError::Fatal(format!("rule '{name}' has no command")));
    }
    if bindings.contains_key("rspfile") != bindings.contains_key("rspfile_content") {
        return Err(GraphError::Fatal(format!(
            "rule '{name}' has rspfile and no rspfile_content or vice versa"
        )));
    }
    graph.add_rule(Rule { name, bindings });
    Ok(())
}

fn parse_edge(
    graph: &mut Graph,
    opts: ParseOpts,
    scanner: &mut Scanner,
    env: EnvId,
) -> Result<(), GraphError> {
    let edge = graph.make_edge(env);

    let mut out_paths = scanner.paths()?;
    let outimpidx = out_paths.len();
    if scanner.pipe(1)? == 1 {
        out_paths.extend(scanner.paths()?);
    }
    if out_paths.is_empty() {
        return Err(GraphError::Fatal("expected output path".into()));
    }
    scanner.expect_char(b':')?;
    let rule_name = scanner.name()?;
    let Some(rule) = graph.find_rule(&rule_name) else {
        return Err(GraphError::Fatal(format!("undefined rule '{rule_name}'")));
    };

    let mut in_paths = scanner.paths()?;
    let inimpidx = in_paths.len();
    let mut pipe = scanner.pipe(1 | 2)?;
    if pipe == 1 {
        in_paths.extend(scanner.paths()?);
        pipe = scanner.pipe(2)?;
    }
    let inorderidx = in_paths.len();
    if pipe == 2 {
        in_paths.extend(scanner.paths()?);
    }
    scanner.expect_newline()?;

    // Edge-local bindings are evaluated immediately against the enclosing
    // scope.
    let edge_env = graph.edges[edge.0 as usize].env;
    while scanner.indent()? {
        let name = scanner.name()?;
        let value = parse_let(scanner)?;
        let value = graph.env_eval(env, &value);
        graph.env_add_var(edge_env, name, value);
    }

    graph.edges[edge.0 as usize].rule = rule;

    let mut kept_outs = Vec::new();
    let mut outimpidx = outimpidx;
    for (i, path) in out_paths.iter().enumerate() {
        let value = canon_path(&graph.env_eval(edge_env, path));
        let node = graph.node(&value);
        if graph.nodes[node.0 as usize].generated_by.is_some() {
            if !opts.dupbuild_warn {
                return Err(GraphError::Fatal(format!("multiple rules generate '{value}'")));
            }
            tracing::warn!(path = %value, "multiple rules generate output");
            if i < outimpidx {
                outimpidx -= 1;
            }
            continue;
        }
        graph.nodes[node.0 as usize].generated_by = Some(edge);
        kept_outs.push(node);
    }
    graph.edges[edge.0 as usize].outs = kept_outs;
    graph.edges[edge.0 as usize].outimpidx = outimpidx;

    let mut ins = Vec::new();
    for path in &in_paths {
        let value = canon_path(&graph.env_eval(edge_env, path));
        let node = graph.node(&value);
        graph.nodes[node.0 as usize].used_by.push(edge);
        ins.push(node);
    }
    graph.edges[edge.0 as usize].ins = ins;
    graph.edges[edge.0 as usize].inimpidx = inimpidx;
    graph.edges[edge.0 as usize].inorderidx = inorderidx;

    if let Some(pool_name) = graph.edge_var(edge, "pool", true)?
        && !pool_name.is_empty()
    {
        let Some(pool) = graph.find_pool(&pool_name) else {
            return Err(GraphError::Fatal(format!("unknown pool '{pool_name}'")));
        };
        graph.edges[edge.0 as usize].pool = Some(pool);
    }
    Ok(())
}

fn parse_include(
    graph: &mut Graph,
    opts: ParseOpts,
    scanner: &mut Scanner,
    env: EnvId,
    new_scope: bool,
) -> Result<(), GraphError> {
    let Some(path) = scanner.string(true)? else {
        return Err(GraphError::Fatal("expected include path".into()));
    };
    scanner.expect_newline()?;
    let path = graph.env_eval(env, &path);
    let env = if new_scope { graph.make_env(Some(env)) } else { env };
    parse_file(graph, opts, &path, env)
}

fn parse_default(graph: &mut Graph, scanner: &mut Scanner, env: EnvId) -> Result<(), GraphError> {
    let paths = scanner.paths()?;
    for path in &paths {
        let value = canon_path(&graph.env_eval(env, path));
        let Some(node) = graph.node_lookup(&value) else {
            return Err(GraphError::Fatal(format!("unknown target '{value}'")));
        };
        graph.default_targets.push(node);
    }
    scanner.expect_newline()
}

fn parse_pool(graph: &mut Graph, scanner: &mut Scanner, env: EnvId) -> Result<(), GraphError> {
    let name = scanner.name()?;
    scanner.expect_newline()?;
    let mut depth = None;
    while scanner.indent()? {
        let var = scanner.name()?;
        let value = parse_let(scanner)?;
        if var == "depth" {
            let value = graph.env_eval(env, &value);
            let parsed: usize = value
                .parse()
                .map_err(|_| GraphError::Fatal(format!("invalid pool depth '{value}'")))?;
            depth = Some(parsed);
        } else {
            return Err(GraphError::Fatal(format!("unexpected pool variable '{var}'")));
        }
    }
    let Some(depth) = depth.filter(|d| *d > 0) else {
        return Err(GraphError::Fatal(format!("pool '{name}' has no depth")));
    };
    graph.add_pool(Pool::new(name, depth))?;
    Ok(())
}

fn check_version(version: &str) -> Result<(), GraphError> {
    let mut parts = version.split('.');
    let major: u32 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(|| {
        GraphError::Fatal(format!("invalid ninja_required_version '{version}'"))
    })?;
    let minor: u32 = parts.next().and_then(|p| p.trim().parse().ok()).unwrap_or(0);
    if major > NINJA_MAJOR || (major == NINJA_MAJOR && minor > NINJA_MINOR) {
        return Err(GraphError::Fatal(format!(
            "ninja_required_version {version} is newer than {NINJA_MAJOR}.{NINJA_MINOR}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::scan::Scanner;
    use rstest::rstest;

    pub(crate) fn parse_str(text: &str) -> Result<Graph, GraphError> {
        let mut graph = Graph::new();
        let scanner = Scanner::from_bytes("test.ninja", text.as_bytes().to_vec());
        let root = graph.root_env;
        parse(&mut graph, ParseOpts::default(), scanner, root)?;
        Ok(graph)
    }

    #[rstest]
    fn parses_rules_edges_and_defaults() {
        let graph = parse_str(concat!(
            "rule cc\n",
            "  command = gcc -c $in -o $out\n",
            "build a.o: cc a.c\n",
            "default a.o\n",
        ))
        .expect("parse");
        assert!(graph.find_rule("cc").is_some());
        let out = graph.node_lookup("a.o").expect("a.o");
        assert!(graph.nodes[out.0 as usize].generated_by.is_some());
        assert_eq!(graph.default_targets.len(), 1);
    }

    #[rstest]
    fn edge_sections_partition_inputs() {
        let graph = parse_str(concat!(
            "rule r\n",
            "  command = :\n",
            "build out | out.imp: r a | b || c\n",
        ))
        .expect("parse");
        let edge = &graph.edges[graph.edges.len() - 1];
        assert_eq!(edge.outs.len(), 2);
        assert_eq!(edge.outimpidx, 1);
        assert_eq!(edge.ins.len(), 3);
        assert_eq!(edge.inimpidx, 1);
        assert_eq!(edge.inorderidx, 2);
    }

    #[rstest]
    fn rule_without_command_is_fatal() {
        let err = parse_str("rule bad\n  description = d\n").expect_err("must fail");
        assert!(err.to_string().contains("has no command"));
    }

    #[rstest]
    fn duplicate_outputs_are_fatal_by_default() {
        let err = parse_str(concat!(
            "rule r\n  command = :\n",
            "build x: r\n",
            "build x: r\n",
        ))
        .expect_err("must fail");
        assert!(err.to_string().contains("multiple rules generate"));
    }

    #[rstest]
    fn duplicate_outputs_warn_when_configured() {
        let mut graph = Graph::new();
        let scanner = Scanner::from_bytes(
            "test.ninja",
            b"rule r\n  command = :\nbuild x: r\nbuild x: r\n".to_vec(),
        );
        let root = graph.root_env;
        parse(&mut graph, ParseOpts { dupbuild_warn: true }, scanner, root).expect("parse");
    }

    #[rstest]
    fn pool_requires_depth() {
        assert!(parse_str("pool link\n").is_err());
        let graph = parse_str("pool link\n  depth = 2\n").expect("parse");
        let pool = graph.find_pool("link").expect("pool");
        assert_eq!(graph.pools[pool.0 as usize].maxjobs, 2);
    }

    #[rstest]
    fn edge_binding_shadows_for_variable_expansion() {
        let graph = parse_str(concat!(
            "flags = -O2\n",
            "rule cc\n",
            "  command = gcc $flags -c $in -o $out\n",
            "build a.o: cc a.c\n",
            "  flags = -O0\n",
        ))
        .expect("parse");
        let mut graph = graph;
        let edge = crate::runner::graph::EdgeId(
            u32::try_from(graph.edges.len() - 1).expect("edge id"),
        );
        let cmd = graph.edge_var(edge, "command", true).expect("eval").expect("cmd");
        assert_eq!(cmd, "gcc -O0 -c a.c -o a.o");
    }

    #[rstest]
    fn too_new_required_version_is_rejected() {
        assert!(parse_str("ninja_required_version = 99.0\n").is_err());
        parse_str("ninja_required_version = 1.3\n").expect("parse");
    }

    #[rstest]
    fn paths_are_canonicalized() {
        let graph = parse_str(concat!(
            "rule r\n  command = :\n",
            "build ./out/../x: r ./src/./a.c\n",
        ))
        .expect("parse");
        assert!(graph.node_lookup("x").is_some());
        assert!(graph.node_lookup("src/a.c").is_some());
    }
}
