//! The `.ninja_log` text build log.
//!
//! Version 5. One header line, then tab-separated records:
//! `start_time\tend_time\tmtime\toutput_path\tcommand_hash_hex`. Unknown
//! versions are silently discarded; corrupt lines warn and are skipped.
//! On open the log is rewritten from the records that survived into the
//! current graph.

use std::fs::File;
use std::io::Write;

use crate::runner::graph::{Graph, GraphError, MTIME_MISSING, NodeId};

const LOG_NAME: &str = ".ninja_log";
const LOG_VERSION: u32 = 5;

#[derive(Debug, Default)]
pub struct BuildLog {
    path: String,
    file: Option<File>,
}

impl BuildLog {
    /// Parse an existing log into the graph's `logmtime`/`hash` fields,
    /// then rewrite it from the graph and keep it open for appending.
    pub fn open(graph: &mut Graph, builddir: Option<&str>) -> Result<Self, GraphError> {
        let path = builddir.map_or_else(|| LOG_NAME.to_owned(), |d| format!("{d}/{LOG_NAME}"));
        let mut log = Self { path, file: None };

        let existing = std::fs::read_to_string(&log.path).ok();
        let mut have_entries = false;
        if let Some(text) = existing {
            have_entries = parse_into_graph(graph, &text);
        }
        log.reopen(graph, have_entries)?;
        Ok(log)
    }

    fn reopen(&mut self, graph: &mut Graph, write_graph: bool) -> Result<(), GraphError> {
        let mut file = File::create(&self.path)?;
        writeln!(file, "# ninja log v{LOG_VERSION}")?;
        self.file = Some(file);
        if write_graph {
            let nodes: Vec<NodeId> = (0..graph.nodes.len())
                .map(|i| NodeId(u32::try_from(i).unwrap_or(u32::MAX)))
                .collect();
            for node in nodes {
                if graph.nodes[node.0 as usize].hash != 0
                    && graph.nodes[node.0 as usize].generated_by.is_some()
                {
                    self.record(graph, node, 0, 0)?;
                }
            }
        }
        Ok(())
    }

    /// Append one record for a finished output.
    pub fn record(
        &mut self,
        graph: &Graph,
        node: NodeId,
        start_time: u64,
        end_time: u64,
    ) -> Result<(), GraphError> {
        let Some(file) = &mut self.file else { return Ok(()) };
        let n = &graph.nodes[node.0 as usize];
        writeln!(file, "{start_time}\t{end_time}\t{}\t{}\t{:x}", n.logmtime, n.path, n.hash)?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), GraphError> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Returns whether any usable entry was found.
fn parse_into_graph(graph: &mut Graph, text: &str) -> bool {
    let mut lines = text.lines();
    let Some(header) = lines.next() else { return false };
    let version_ok = header
        .strip_prefix("# ninja log v")
        .and_then(|v| v.trim().parse::<u32>().ok())
        .is_some_and(|v| v == LOG_VERSION);
    if !version_ok {
        tracing::debug!("discarding build log with unknown version");
        return false;
    }
    let mut nentry = false;
    for (line_no, line) in lines.enumerate() {
        let mut fields = line.split('\t');
        let _start = fields.next();
        let _end = fields.next();
        let mtime = fields.next();
        let output = fields.next();
        let hash = fields.next();
        let (Some(mtime), Some(output), Some(hash)) = (mtime, output, hash) else {
            tracing::warn!(line = line_no + 2, "corrupt build log line");
            continue;
        };
        let Some(node) = graph.node_lookup(output) else { continue };
        if graph.nodes[node.0 as usize].generated_by.is_none() {
            continue;
        }
        let Ok(mtime) = mtime.parse::<i64>() else {
            tracing::warn!(line = line_no + 2, "invalid mtime in build log");
            continue;
        };
        let Ok(hash) = u64::from_str_radix(hash, 16) else {
            tracing::warn!(line = line_no + 2, "invalid hash in build log");
            continue;
        };
        graph.nodes[node.0 as usize].logmtime = mtime;
        graph.nodes[node.0 as usize].hash = hash;
        nentry = true;
    }
    nentry
}

/// True when the node has no usable record.
#[must_use]
pub fn log_missing(graph: &Graph, node: NodeId) -> bool {
    graph.nodes[node.0 as usize].logmtime == MTIME_MISSING
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::env::{Rule, literal};
    use rstest::rstest;
    use std::collections::HashMap;

    fn graph_with_output(path: &str) -> (Graph, NodeId) {
        let mut g = Graph::new();
        let rule = g.add_rule(Rule {
            name: "r".into(),
            bindings: HashMap::from([("command".into(), literal("touch out"))]),
        });
        let edge = g.make_edge(g.root_env);
        g.edges[edge.0 as usize].rule = rule;
        let out = g.node(path);
        g.edges[edge.0 as usize].outs.push(out);
        g.edges[edge.0 as usize].outimpidx = 1;
        g.nodes[out.0 as usize].generated_by = Some(edge);
        (g, out)
    }

    #[rstest]
    fn round_trips_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let builddir = dir.path().to_string_lossy().into_owned();

        let (mut g, out) = graph_with_output("out");
        {
            let mut log = BuildLog::open(&mut g, Some(&builddir)).expect("open");
            g.nodes[out.0 as usize].logmtime = 12345;
            g.nodes[out.0 as usize].hash = 0xdead_beef;
            log.record(&g, out, 0, 9).expect("record");
            log.close().expect("close");
        }

        let (mut g2, out2) = graph_with_output("out");
        let _log = BuildLog::open(&mut g2, Some(&builddir)).expect("reopen");
        assert_eq!(g2.nodes[out2.0 as usize].logmtime, 12345);
        assert_eq!(g2.nodes[out2.0 as usize].hash, 0xdead_beef);
    }

    #[rstest]
    fn old_version_logs_are_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let builddir = dir.path().to_string_lossy().into_owned();
        let path = format!("{builddir}/.ninja_log");
        std::fs::write(&path, "# ninja log v4\n0\t0\t5\tout\tabc\n").expect("write");

        let (mut g, out) = graph_with_output("out");
        let _log = BuildLog::open(&mut g, Some(&builddir)).expect("open");
        assert!(log_missing(&g, out));
        // The file is rewritten at the current version.
        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.starts_with("# ninja log v5"));
    }

    #[rstest]
    fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let builddir = dir.path().to_string_lossy().into_owned();
        let path = format!("{builddir}/.ninja_log");
        std::fs::write(
            &path,
            "# ninja log v5\nnot-enough-fields\n1\t2\t77\tout\tff\n",
        )
        .expect("write");

        let (mut g, out) = graph_with_output("out");
        let _log = BuildLog::open(&mut g, Some(&builddir)).expect("open");
        assert_eq!(g.nodes[out.0 as usize].logmtime, 77);
        assert_eq!(g.nodes[out.0 as usize].hash, 0xff);
    }
}
