//! The `.ninja_deps` binary dependency log.
//!
//! Format (version 4): a 12-byte header `"# ninjadeps\n"`, a 4-byte
//! host-endian version, then records. A record starts with a 4-byte word;
//! the high bit distinguishes dependency records from node records, the
//! low 31 bits give the record size, which must be a multiple of 4 and at
//! most 2^19. Node records carry a NUL-padded path and a checksum equal to
//! the bitwise negation of the assigned sequential id. Dependency records
//! carry the output id, a split 64-bit mtime, and dependency ids.
//!
//! The log is always rewritten compactly on open; only entries that still
//! carry dependencies survive. Writes are flushed record by record so a
//! crash loses at most the in-flight record.

use std::fs::File;
use std::io::{Read, Write};

use crate::runner::graph::{EdgeId, Graph, GraphError, MTIME_MISSING, NodeId};

const DEPS_NAME: &str = ".ninja_deps";
const DEPS_HEADER: &[u8] = b"# ninjadeps\n";
const DEPS_VERSION: u32 = 4;
const MAX_RECORD_SIZE: u32 = 1 << 19;

#[derive(Debug, Clone)]
pub struct DepsEntry {
    pub node: NodeId,
    pub mtime: i64,
    pub deps: Vec<NodeId>,
}

#[derive(Debug, Default)]
pub struct DepsLog {
    path: String,
    file: Option<File>,
    entries: Vec<DepsEntry>,
}

impl DepsLog {
    /// Load, validate, and compact the deps log, then leave it open for
    /// appending. Any malformed prefix discards the rest of the file.
    pub fn open(graph: &mut Graph, builddir: Option<&str>) -> Result<Self, GraphError> {
        let path = builddir.map_or_else(|| DEPS_NAME.to_owned(), |d| format!("{d}/{DEPS_NAME}"));
        let mut log = Self { path, file: None, entries: Vec::new() };
        if let Ok(mut file) = File::open(&log.path) {
            let mut buf = Vec::new();
            if file.read_to_end(&mut buf).is_ok() {
                log.load(graph, &buf);
            }
        }
        log.rewrite(graph)?;
        Ok(log)
    }

    fn load(&mut self, graph: &mut Graph, buf: &[u8]) {
        let mut i = 0;
        if buf.len() < DEPS_HEADER.len() + 4 || &buf[..DEPS_HEADER.len()] != DEPS_HEADER {
            tracing::warn!("invalid deps log header");
            return;
        }
        i += DEPS_HEADER.len();
        let version = read_u32(buf, i);
        i += 4;
        if version != Some(DEPS_VERSION) {
            tracing::warn!(?version, "unknown deps log version");
            return;
        }
        while let Some(word) = read_u32(buf, i) {
            i += 4;
            let is_dep = word & 0x8000_0000 != 0;
            let size = (word & 0x7fff_ffff) as usize;
            if size as u32 > MAX_RECORD_SIZE || size % 4 != 0 {
                tracing::warn!(size, "invalid deps record size");
                return;
            }
            let Some(body) = buf.get(i..i + size) else {
                tracing::warn!("deps log truncated");
                return;
            };
            i += size;
            if is_dep {
                if !self.load_dep_record(graph, body) {
                    return;
                }
            } else if !self.load_node_record(graph, body) {
                return;
            }
        }
    }

    fn load_node_record(&mut self, graph: &mut Graph, body: &[u8]) -> bool {
        if body.len() <= 4 {
            tracing::warn!("node record too small");
            return false;
        }
        let checksum = read_u32(body, body.len() - 4).unwrap_or(0);
        let expected = !u32::try_from(self.entries.len()).unwrap_or(u32::MAX);
        if checksum != expected {
            tracing::warn!("corrupt deps log, bad checksum");
            return false;
        }
        let mut path = &body[..body.len() - 4];
        while path.last() == Some(&0) {
            path = &path[..path.len() - 1];
        }
        let path = String::from_utf8_lossy(path).into_owned();
        let node = graph.node(&path);
        graph.nodes[node.0 as usize].id = i32::try_from(self.entries.len()).unwrap_or(-1);
        self.entries.push(DepsEntry { node, mtime: MTIME_MISSING, deps: Vec::new() });
        true
    }

    fn load_dep_record(&mut self, graph: &mut Graph, body: &[u8]) -> bool {
        if body.len() < 12 {
            tracing::warn!("dep record too small");
            return false;
        }
        let id = read_u32(body, 0).unwrap_or(u32::MAX) as usize;
        if id >= self.entries.len() {
            tracing::warn!(id, "invalid node id in dep record");
            return false;
        }
        let lo = u64::from(read_u32(body, 4).unwrap_or(0));
        let hi = u64::from(read_u32(body, 8).unwrap_or(0));
        #[expect(clippy::cast_possible_wrap, reason = "mtime round-trips through u64 halves")]
        let mtime = (hi << 32 | lo) as i64;
        self.entries[id].mtime = mtime;

        // Keep the dependency list only when the generating edge still
        // wants recorded deps.
        let node = self.entries[id].node;
        let wants_deps = graph.nodes[node.0 as usize]
            .generated_by
            .is_some_and(|edge| graph.edge_bool_var(edge, "deps"));
        let mut deps = Vec::new();
        for off in (12..body.len()).step_by(4) {
            let dep_id = read_u32(body, off).unwrap_or(u32::MAX) as usize;
            let Some(entry) = self.entries.get(dep_id) else {
                tracing::warn!(dep_id, "invalid node id in dep record");
                return false;
            };
            deps.push(entry.node);
        }
        if wants_deps {
            self.entries[id].deps = deps;
        }
        true
    }

    /// Rewrite the whole log from surviving entries and leave the file
    /// open for appending.
    fn rewrite(&mut self, graph: &mut Graph) -> Result<(), GraphError> {
        let mut file = File::create(&self.path)?;
        file.write_all(DEPS_HEADER)?;
        file.write_all(&DEPS_VERSION.to_ne_bytes())?;
        self.file = Some(file);

        for entry in &self.entries {
            graph.nodes[entry.node.0 as usize].id = -1;
        }
        let old_entries = std::mem::take(&mut self.entries);
        for entry in old_entries {
            if entry.deps.is_empty() {
                continue;
            }
            self.record_id(graph, entry.node)?;
            for dep in &entry.deps {
                self.record_id(graph, *dep)?;
            }
            self.write_deps_record(graph, entry.node, &entry.deps, entry.mtime)?;
            let id = graph.nodes[entry.node.0 as usize].id;
            if let Ok(idx) = usize::try_from(id) {
                self.entries[idx] = entry;
            }
        }
        if let Some(file) = &mut self.file {
            file.flush()?;
        }
        Ok(())
    }

    /// Assign an id and emit a node record if the node has none yet.
    /// Returns whether a record was written.
    fn record_id(&mut self, graph: &mut Graph, node: NodeId) -> Result<bool, GraphError> {
        if graph.nodes[node.0 as usize].id != -1 {
            return Ok(false);
        }
        let id = u32::try_from(self.entries.len())
            .map_err(|_| GraphError::Fatal("too many nodes in deps log".into()))?;
        graph.nodes[node.0 as usize].id = i32::try_from(id).unwrap_or(-1);
        self.entries.push(DepsEntry { node, mtime: MTIME_MISSING, deps: Vec::new() });

        let path = graph.nodes[node.0 as usize].path.as_bytes();
        let padded = (path.len() + 7) & !3;
        if padded + 4 >= MAX_RECORD_SIZE as usize {
            return Err(GraphError::Fatal("deps node record too large".into()));
        }
        let Some(file) = &mut self.file else { return Ok(true) };
        file.write_all(&u32::try_from(padded).unwrap_or(0).to_ne_bytes())?;
        file.write_all(path)?;
        let pad = padded - path.len() - 4;
        file.write_all(&vec![0_u8; pad])?;
        file.write_all(&(!id).to_ne_bytes())?;
        Ok(true)
    }

    fn write_deps_record(
        &mut self,
        graph: &Graph,
        out: NodeId,
        deps: &[NodeId],
        mtime: i64,
    ) -> Result<(), GraphError> {
        let size = 12 + deps.len() * 4;
        if size + 4 >= MAX_RECORD_SIZE as usize {
            return Err(GraphError::Fatal("deps record too large".into()));
        }
        let Some(file) = &mut self.file else { return Ok(()) };
        let word = 0x8000_0000_u32 | u32::try_from(size).unwrap_or(0);
        file.write_all(&word.to_ne_bytes())?;
        let out_id = u32::try_from(graph.nodes[out.0 as usize].id).unwrap_or(0);
        file.write_all(&out_id.to_ne_bytes())?;
        #[expect(clippy::cast_sign_loss, reason = "mtime round-trips through u64 halves")]
        let unsigned = mtime as u64;
        file.write_all(&u32::try_from(unsigned & 0xffff_ffff).unwrap_or(0).to_ne_bytes())?;
        file.write_all(&u32::try_from(unsigned >> 32).unwrap_or(0).to_ne_bytes())?;
        for dep in deps {
            let dep_id = u32::try_from(graph.nodes[dep.0 as usize].id).unwrap_or(0);
            file.write_all(&dep_id.to_ne_bytes())?;
        }
        Ok(())
    }

    #[must_use]
    pub fn entry_for(&self, graph: &Graph, node: NodeId) -> Option<&DepsEntry> {
        let id = usize::try_from(graph.nodes[node.0 as usize].id).ok()?;
        self.entries.get(id)
    }

    #[must_use]
    pub fn entries(&self) -> &[DepsEntry] {
        &self.entries
    }

    /// Record discovered dependencies for `out`, writing only when the
    /// entry actually changed. Flushes so a crash cannot lose the record.
    pub fn record(
        &mut self,
        graph: &mut Graph,
        out: NodeId,
        deps: &[NodeId],
        mtime: i64,
    ) -> Result<(), GraphError> {
        let mut update = self.record_id(graph, out)?;
        if !update {
            let id = usize::try_from(graph.nodes[out.0 as usize].id).unwrap_or(usize::MAX);
            let entry = &self.entries[id];
            update = entry.mtime != mtime
                || entry.deps.len() != deps.len()
                || entry.deps.iter().zip(deps).any(|(a, b)| a != b);
        }
        for dep in deps {
            if self.record_id(graph, *dep)? {
                update = true;
            }
        }
        if update {
            self.write_deps_record(graph, out, deps, mtime)?;
            let id = usize::try_from(graph.nodes[out.0 as usize].id).unwrap_or(usize::MAX);
            self.entries[id] = DepsEntry { node: out, mtime, deps: deps.to_vec() };
            if let Some(file) = &mut self.file {
                file.flush()?;
            }
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), GraphError> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes: [u8; 4] = buf.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_ne_bytes(bytes))
}

/// Load recorded dependencies for an edge's first output, falling back to
/// parsing its depfile. A missing record marks the output dirty.
pub fn deps_load(
    graph: &mut Graph,
    deps_log: &DepsLog,
    edge: EdgeId,
    explain: bool,
) -> Result<(), GraphError> {
    use crate::runner::graph::{FLAG_DEPS, FLAG_DIRTY_OUT};

    if graph.edges[edge.0 as usize].flags & FLAG_DEPS != 0 {
        return Ok(());
    }
    graph.edges[edge.0 as usize].flags |= FLAG_DEPS;
    let Some(out) = graph.edges[edge.0 as usize].outs.first().copied() else {
        return Ok(());
    };

    let deps = if graph.edge_bool_var(edge, "deps") {
        match deps_log.entry_for(graph, out) {
            Some(entry) if graph.nodes[out.0 as usize].mtime <= entry.mtime => {
                Some(entry.deps.clone())
            }
            _ => {
                if explain {
                    let path = &graph.nodes[out.0 as usize].path;
                    tracing::info!(%path, "explain: missing or outdated record in .ninja_deps");
                }
                None
            }
        }
    } else {
        let Some(depfile) = graph.edge_var(edge, "depfile", false)? else {
            return Ok(());
        };
        match crate::runner::depfile::parse_gcc_depfile_at(&depfile, false) {
            Ok(Some(paths)) => Some(paths.iter().map(|p| graph.node(p)).collect()),
            Ok(None) => {
                if explain {
                    let path = &graph.nodes[out.0 as usize].path;
                    tracing::info!(%path, "explain: missing or invalid depfile");
                }
                None
            }
            Err(err) => {
                return Err(GraphError::Fatal(format!(
                    "failed to parse depfile {depfile}: {err}"
                )));
            }
        }
    };

    match deps {
        Some(deps) => graph.edge_add_deps(edge, &deps),
        None => {
            graph.nodes[out.0 as usize].dirty = true;
            graph.edges[edge.0 as usize].flags |= FLAG_DIRTY_OUT;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn scratch_log(name: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(name).to_string_lossy().into_owned();
        (dir, path)
    }

    fn graph_with_deps_edge(paths: &[&str]) -> (Graph, EdgeId) {
        let mut g = Graph::new();
        let rule = g.add_rule(crate::runner::env::Rule {
            name: "cc".into(),
            bindings: HashMap::from([
                ("command".into(), crate::runner::env::literal("cc")),
                ("deps".into(), crate::runner::env::literal("gcc")),
            ]),
        });
        let edge = g.make_edge(g.root_env);
        g.edges[edge.0 as usize].rule = rule;
        for (i, p) in paths.iter().enumerate() {
            let n = g.node(p);
            if i == 0 {
                g.edges[edge.0 as usize].outs.push(n);
                g.edges[edge.0 as usize].outimpidx = 1;
                g.nodes[n.0 as usize].generated_by = Some(edge);
            }
        }
        (g, edge)
    }

    #[rstest]
    fn round_trips_nodes_and_deps() {
        let (dir, _) = scratch_log("unused");
        let builddir = dir.path().to_string_lossy().into_owned();

        let (mut g, _edge) = graph_with_deps_edge(&["a", "bb"]);
        {
            let mut log = DepsLog::open(&mut g, Some(&builddir)).expect("open");
            let a = g.node("a");
            let b = g.node("bb");
            log.record(&mut g, a, &[b], 42).expect("record");
            log.close().expect("close");
        }

        // Re-open with a fresh graph; the same logical entries come back
        // and ids stay sequential from zero.
        let (mut g2, _edge) = graph_with_deps_edge(&["a", "bb"]);
        let log = DepsLog::open(&mut g2, Some(&builddir)).expect("reopen");
        let a = g2.node("a");
        let entry = log.entry_for(&g2, a).expect("entry");
        assert_eq!(entry.mtime, 42);
        assert_eq!(entry.deps.len(), 1);
        assert_eq!(g2.nodes[a.0 as usize].id, 0);
        let dep_node = entry.deps[0];
        assert_eq!(g2.nodes[dep_node.0 as usize].path, "bb");
        assert_eq!(g2.nodes[dep_node.0 as usize].id, 1);
    }

    #[rstest]
    fn corrupt_log_is_rewritten_to_a_valid_prefix() {
        let (dir, _) = scratch_log("unused");
        let builddir = dir.path().to_string_lossy().into_owned();
        let path = format!("{builddir}/.ninja_deps");

        // A dep record referencing an unknown id triggers a full rewrite.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(DEPS_HEADER);
        bytes.extend_from_slice(&DEPS_VERSION.to_ne_bytes());
        bytes.extend_from_slice(&0x8000_000c_u32.to_ne_bytes());
        bytes.extend_from_slice(&99_u32.to_ne_bytes());
        bytes.extend_from_slice(&0_u32.to_ne_bytes());
        bytes.extend_from_slice(&0_u32.to_ne_bytes());
        std::fs::write(&path, &bytes).expect("write");

        let mut g = Graph::new();
        let log = DepsLog::open(&mut g, Some(&builddir)).expect("open");
        assert!(log.entries().is_empty());

        let rewritten = std::fs::read(&path).expect("read");
        assert!(rewritten.starts_with(DEPS_HEADER));
        assert_eq!(rewritten.len(), DEPS_HEADER.len() + 4);
    }

    #[rstest]
    fn unchanged_records_are_not_rewritten() {
        let (dir, _) = scratch_log("unused");
        let builddir = dir.path().to_string_lossy().into_owned();
        let path = format!("{builddir}/.ninja_deps");

        let (mut g, _) = graph_with_deps_edge(&["a", "b"]);
        let mut log = DepsLog::open(&mut g, Some(&builddir)).expect("open");
        let a = g.node("a");
        let b = g.node("b");
        log.record(&mut g, a, &[b], 7).expect("record");
        let size_after_first = std::fs::metadata(&path).expect("meta").len();
        log.record(&mut g, a, &[b], 7).expect("record again");
        let size_after_second = std::fs::metadata(&path).expect("meta").len();
        assert_eq!(size_after_first, size_after_second);
    }

    #[rstest]
    fn compaction_drops_entries_without_deps() {
        let (dir, _) = scratch_log("unused");
        let builddir = dir.path().to_string_lossy().into_owned();

        let (mut g, _) = graph_with_deps_edge(&["a", "b"]);
        {
            let mut log = DepsLog::open(&mut g, Some(&builddir)).expect("open");
            let a = g.node("a");
            let orphan = g.node("orphan");
            let b = g.node("b");
            log.record(&mut g, a, &[b], 1).expect("record");
            // Give the orphan an id but no dep record.
            log.record_id(&mut g, orphan).expect("id");
            log.close().expect("close");
        }
        let (mut g2, _) = graph_with_deps_edge(&["a", "b"]);
        let log = DepsLog::open(&mut g2, Some(&builddir)).expect("reopen");
        // Only `a` and its dep survive compaction.
        assert_eq!(log.entries().len(), 2);
    }
}
