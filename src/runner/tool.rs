//! `-t` subtools of the embedded engine.

use std::collections::HashSet;
use std::io::Write;

use crate::runner::graph::{EdgeId, Graph, GraphError, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Clean,
    Commands,
    Query,
    Targets,
}

impl Tool {
    /// Tool lookup by CLI name. `graph` and `compdb` are recognized but
    /// handled by external collaborators, so they report as unsupported.
    pub fn from_name(name: &str) -> Result<Self, GraphError> {
        match name {
            "clean" => Ok(Self::Clean),
            "commands" => Ok(Self::Commands),
            "query" => Ok(Self::Query),
            "targets" => Ok(Self::Targets),
            "graph" | "compdb" => {
                Err(GraphError::Fatal(format!("tool '{name}' is not supported by this engine")))
            }
            other => Err(GraphError::Fatal(format!("unknown tool '{other}'"))),
        }
    }

    pub fn run(
        self,
        graph: &mut Graph,
        targets: &[String],
        out: &mut dyn Write,
    ) -> Result<(), GraphError> {
        match self {
            Self::Clean => clean(graph, out),
            Self::Commands => commands(graph, targets, out),
            Self::Query => query(graph, targets, out),
            Self::Targets => list_targets(graph, out),
        }
    }
}

fn resolve_targets(graph: &Graph, targets: &[String]) -> Result<Vec<NodeId>, GraphError> {
    if targets.is_empty() {
        return Ok(graph.default_nodes());
    }
    targets
        .iter()
        .map(|t| {
            graph
                .node_lookup(t)
                .ok_or_else(|| GraphError::Fatal(format!("unknown target '{t}'")))
        })
        .collect()
}

/// Print every command needed to build the targets, dependencies first.
fn commands(graph: &mut Graph, targets: &[String], out: &mut dyn Write) -> Result<(), GraphError> {
    let roots = resolve_targets(graph, targets)?;
    let mut seen: HashSet<EdgeId> = HashSet::new();
    let mut stack: Vec<(NodeId, bool)> = roots.into_iter().map(|n| (n, false)).collect();
    let mut ordered = Vec::new();
    while let Some((node, expanded)) = stack.pop() {
        let Some(edge) = graph.nodes[node.0 as usize].generated_by else { continue };
        if expanded {
            if seen.insert(edge) {
                ordered.push(edge);
            }
            continue;
        }
        if seen.contains(&edge) {
            continue;
        }
        stack.push((node, true));
        for input in graph.edges[edge.0 as usize].ins.clone() {
            stack.push((input, false));
        }
    }
    for edge in ordered {
        if graph.edges[edge.0 as usize].rule == graph.phony_rule {
            continue;
        }
        if let Some(cmd) = graph.edge_var(edge, "command", true)? {
            writeln!(out, "{cmd}")?;
        }
    }
    Ok(())
}

/// Show each target's generating rule and consumers.
fn query(graph: &mut Graph, targets: &[String], out: &mut dyn Write) -> Result<(), GraphError> {
    let nodes = resolve_targets(graph, targets)?;
    for node in nodes {
        let path = graph.nodes[node.0 as usize].path.clone();
        writeln!(out, "{path}:")?;
        if let Some(edge) = graph.nodes[node.0 as usize].generated_by {
            let rule = graph.edges[edge.0 as usize].rule;
            writeln!(out, "  input: {}", graph.rules[rule.0 as usize].name)?;
            for input in graph.edges[edge.0 as usize].ins.clone() {
                writeln!(out, "    {}", graph.nodes[input.0 as usize].path)?;
            }
        }
        writeln!(out, "  outputs:")?;
        for edge in graph.nodes[node.0 as usize].used_by.clone() {
            for output in graph.edges[edge.0 as usize].outs.clone() {
                writeln!(out, "    {}", graph.nodes[output.0 as usize].path)?;
            }
        }
    }
    Ok(())
}

/// List every output with its rule name.
fn list_targets(graph: &mut Graph, out: &mut dyn Write) -> Result<(), GraphError> {
    for i in 0..graph.edges.len() {
        let rule = graph.edges[i].rule;
        let rule_name = graph.rules[rule.0 as usize].name.clone();
        for node in graph.edges[i].outs.clone() {
            writeln!(out, "{}: {rule_name}", graph.nodes[node.0 as usize].path)?;
        }
    }
    Ok(())
}

/// Remove every generated output, rspfile, and depfile.
fn clean(graph: &mut Graph, out: &mut dyn Write) -> Result<(), GraphError> {
    for i in 0..graph.edges.len() {
        let edge = EdgeId(u32::try_from(i).unwrap_or(u32::MAX));
        if graph.edges[i].rule == graph.phony_rule {
            continue;
        }
        let mut paths: Vec<String> = graph.edges[i]
            .outs
            .clone()
            .into_iter()
            .map(|n| graph.nodes[n.0 as usize].path.clone())
            .collect();
        if let Some(rsp) = graph.edge_var(edge, "rspfile", false)? {
            paths.push(rsp);
        }
        if let Some(depfile) = graph.edge_var(edge, "depfile", false)? {
            paths.push(depfile);
        }
        for path in paths {
            if std::fs::metadata(&path).is_ok() && std::fs::remove_file(&path).is_ok() {
                writeln!(out, "remove {path}")?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::parse::{ParseOpts, parse};
    use crate::runner::scan::Scanner;
    use rstest::rstest;

    fn graph_of(manifest: &str) -> Graph {
        let mut graph = Graph::new();
        let scanner = Scanner::from_bytes("build.ninja", manifest.as_bytes().to_vec());
        let root = graph.root_env;
        parse(&mut graph, ParseOpts::default(), scanner, root).expect("parse");
        graph
    }

    const MANIFEST: &str = concat!(
        "rule cc\n  command = gcc -c $in -o $out\n",
        "rule ld\n  command = gcc -o $out $in\n",
        "build a.o: cc a.c\n",
        "build prog: ld a.o\n",
    );

    #[rstest]
    fn commands_prints_in_dependency_order() {
        let mut graph = graph_of(MANIFEST);
        let mut out = Vec::new();
        Tool::Commands.run(&mut graph, &[], &mut out).expect("run");
        let text = String::from_utf8(out).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, ["gcc -c a.c -o a.o", "gcc -o prog a.o"]);
    }

    #[rstest]
    fn targets_lists_outputs_with_rules() {
        let mut graph = graph_of(MANIFEST);
        let mut out = Vec::new();
        Tool::Targets.run(&mut graph, &[], &mut out).expect("run");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("a.o: cc"));
        assert!(text.contains("prog: ld"));
    }

    #[rstest]
    fn unsupported_tools_are_reported() {
        assert!(Tool::from_name("graph").is_err());
        assert!(Tool::from_name("compdb").is_err());
        assert!(Tool::from_name("bogus").is_err());
        assert!(Tool::from_name("clean").is_ok());
    }

    #[rstest]
    fn query_names_generating_rule() {
        let mut graph = graph_of(MANIFEST);
        let mut out = Vec::new();
        Tool::Query.run(&mut graph, &["a.o".to_owned()], &mut out).expect("run");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("a.o:"));
        assert!(text.contains("input: cc"));
        assert!(text.contains("prog"));
    }

    #[rstest]
    fn unknown_query_target_is_fatal() {
        let mut graph = graph_of(MANIFEST);
        let mut out = Vec::new();
        assert!(Tool::Query.run(&mut graph, &["nope".to_owned()], &mut out).is_err());
    }
}
