//! Dirty analysis and the cooperative job scheduler.
//!
//! The configure-free half of ninja: decide which edges must run, then
//! drive up to `maxjobs` child processes from a single control thread.
//! Process handles are owned exclusively by their slot, so no locking is
//! involved; the loop polls non-blockingly and naps for 10 ms when every
//! slot is busy and nothing is ready.

use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::time::Instant;

use crate::runner::depfile;
use crate::runner::deps::{DepsLog, deps_load};
use crate::runner::graph::{
    EdgeId, FLAG_CYCLE, FLAG_DIRTY, FLAG_DIRTY_IN, FLAG_DIRTY_OUT, FLAG_WORK, Graph, GraphError,
    MTIME_MISSING, MTIME_UNKNOWN, NodeId, WorkQueue,
};
use crate::runner::log::BuildLog;

const POLL_SLEEP_MS: u64 = 10;

#[derive(Debug, Clone)]
pub struct BuildOpts {
    pub maxjobs: usize,
    /// Stop starting new jobs once this many have failed; `u64::MAX`
    /// means keep going.
    pub maxfail: u64,
    pub verbose: bool,
    pub explain: bool,
    pub keepdepfile: bool,
    pub keeprsp: bool,
    pub dryrun: bool,
    pub statusfmt: String,
}

impl Default for BuildOpts {
    fn default() -> Self {
        Self {
            maxjobs: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            maxfail: 1,
            verbose: false,
            explain: false,
            keepdepfile: false,
            keeprsp: false,
            dryrun: false,
            statusfmt: "[%s/%t] ".to_owned(),
        }
    }
}

struct Job {
    edge: EdgeId,
    cmd: String,
    child: Child,
    capture_path: Option<std::path::PathBuf>,
    start_time_ms: u64,
    console: bool,
}

pub struct Builder<'a> {
    pub graph: &'a mut Graph,
    deps: &'a mut DepsLog,
    log: &'a mut BuildLog,
    opts: BuildOpts,
    work: WorkQueue,
    ntotal: usize,
    nstarted: usize,
    nfinished: usize,
    console_used: bool,
    stop_requested: bool,
    timer: Instant,
}

impl<'a> Builder<'a> {
    pub fn new(
        graph: &'a mut Graph,
        deps: &'a mut DepsLog,
        log: &'a mut BuildLog,
        opts: BuildOpts,
    ) -> Self {
        Self {
            graph,
            deps,
            log,
            opts,
            work: WorkQueue::default(),
            ntotal: 0,
            nstarted: 0,
            nfinished: 0,
            console_used: false,
            stop_requested: false,
            timer: Instant::now(),
        }
    }

    /// `(started, finished, total)` counters for the last run.
    #[must_use]
    pub fn stats(&self) -> (usize, usize, usize) {
        (self.nstarted, self.nfinished, self.ntotal)
    }

    /// Stop admitting new jobs; running ones drain normally. This is the
    /// SIGINT policy hook.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    /// Clear per-build work flags so analysis can run again (used after a
    /// manifest regeneration).
    pub fn reset(graph: &mut Graph) {
        for edge in &mut graph.edges {
            edge.flags &= !FLAG_WORK;
        }
    }

    // ------------------------------------------------------------------
    // dirty analysis

    fn is_newer(&self, newest: Option<NodeId>, candidate: NodeId) -> bool {
        newest.is_none_or(|n| {
            self.graph.nodes[candidate.0 as usize].mtime > self.graph.nodes[n.0 as usize].mtime
        })
    }

    fn explain(&self, node: NodeId, why: &str) {
        if self.opts.explain {
            let path = &self.graph.nodes[node.0 as usize].path;
            tracing::info!(%path, why, "explain");
        }
    }

    /// Is this output dirty relative to the newest explicit input?
    fn is_dirty(
        &mut self,
        node: NodeId,
        newest: Option<NodeId>,
        generator: bool,
        restat: bool,
    ) -> Result<bool, GraphError> {
        let Some(edge) = self.graph.nodes[node.0 as usize].generated_by else {
            return Ok(false);
        };
        if self.graph.edges[edge.0 as usize].rule == self.graph.phony_rule {
            let e = &self.graph.edges[edge.0 as usize];
            if !e.ins.is_empty() || self.graph.nodes[node.0 as usize].mtime != MTIME_MISSING {
                return Ok(false);
            }
            self.explain(node, "phony and no inputs");
            return Ok(true);
        }
        if self.graph.nodes[node.0 as usize].mtime == MTIME_MISSING {
            self.explain(node, "missing");
            return Ok(true);
        }
        let logmtime = self.graph.nodes[node.0 as usize].logmtime;
        if let Some(newest) = newest
            && self.graph.nodes[newest.0 as usize].mtime > self.graph.nodes[node.0 as usize].mtime
            && (!restat || logmtime == MTIME_MISSING)
        {
            self.explain(node, "older than input");
            return Ok(true);
        }
        if logmtime == MTIME_MISSING {
            if !generator {
                self.explain(node, "no record in .ninja_log");
                return Ok(true);
            }
        } else if let Some(newest) = newest
            && logmtime < self.graph.nodes[newest.0 as usize].mtime
        {
            self.explain(node, "recorded mtime is older than input");
            return Ok(true);
        }
        if generator {
            return Ok(false);
        }
        let hash = self.graph.edge_hash(edge)?;
        if hash == self.graph.nodes[node.0 as usize].hash {
            return Ok(false);
        }
        self.explain(node, "command line changed");
        Ok(true)
    }

    /// Admit an edge to the ready queue, diverting past-capacity pool
    /// members to their pool's FIFO.
    fn queue(&mut self, edge: EdgeId) {
        let pool = self.graph.edges[edge.0 as usize].pool;
        let phony = self.graph.edges[edge.0 as usize].rule == self.graph.phony_rule;
        if let Some(pool) = pool
            && !phony
        {
            let p = &mut self.graph.pools[pool.0 as usize];
            if p.numjobs == p.maxjobs {
                p.work.push_back(edge);
                return;
            }
            p.numjobs += 1;
        }
        self.work.push_front(edge);
    }

    /// Recursively add a requested target, computing dirtiness, `nblock`,
    /// and `nprune` for its generating edge.
    pub fn add_target(&mut self, node: NodeId) -> Result<(), GraphError> {
        let Some(edge) = self.graph.nodes[node.0 as usize].generated_by else {
            if self.graph.nodes[node.0 as usize].mtime == MTIME_UNKNOWN {
                self.graph.node_stat(node);
            }
            if self.graph.nodes[node.0 as usize].mtime == MTIME_MISSING {
                return Err(GraphError::Fatal(format!(
                    "file is missing and not created by any action: '{}'",
                    self.graph.nodes[node.0 as usize].path
                )));
            }
            self.graph.nodes[node.0 as usize].dirty = false;
            return Ok(());
        };
        if self.graph.edges[edge.0 as usize].flags & FLAG_CYCLE != 0 {
            return Err(GraphError::Cycle(self.graph.nodes[node.0 as usize].path.clone()));
        }
        if self.graph.edges[edge.0 as usize].flags & FLAG_WORK != 0 {
            return Ok(());
        }
        self.graph.edges[edge.0 as usize].flags |= FLAG_CYCLE | FLAG_WORK;

        for out in self.graph.edges[edge.0 as usize].outs.clone() {
            self.graph.nodes[out.0 as usize].dirty = false;
            if self.graph.nodes[out.0 as usize].mtime == MTIME_UNKNOWN {
                self.graph.node_stat(out);
            }
        }
        deps_load(self.graph, self.deps, edge, self.opts.explain)?;

        let mut nblock = 0;
        let mut newest: Option<NodeId> = None;
        let ins = self.graph.edges[edge.0 as usize].ins.clone();
        let inorderidx = self.graph.edges[edge.0 as usize].inorderidx;
        for (i, input) in ins.iter().enumerate() {
            self.add_target(*input)?;
            let input_dirty = self.graph.nodes[input.0 as usize].dirty;
            if i < inorderidx {
                if input_dirty {
                    self.graph.edges[edge.0 as usize].flags |= FLAG_DIRTY_IN;
                }
                if self.graph.nodes[input.0 as usize].mtime != MTIME_MISSING
                    && self.is_newer(newest, *input)
                {
                    newest = Some(*input);
                }
            }
            let input_blocking = self.graph.nodes[input.0 as usize]
                .generated_by
                .is_some_and(|g| self.graph.edges[g.0 as usize].nblock > 0);
            if input_dirty || input_blocking {
                nblock += 1;
            }
        }
        self.graph.edges[edge.0 as usize].nblock = nblock;

        let generator = self.graph.edge_bool_var(edge, "generator");
        let restat = self.graph.edge_bool_var(edge, "restat");
        for out in self.graph.edges[edge.0 as usize].outs.clone() {
            if self.graph.edges[edge.0 as usize].flags & FLAG_DIRTY_OUT != 0 {
                break;
            }
            if self.is_dirty(out, newest, generator, restat)? {
                self.graph.nodes[out.0 as usize].dirty = true;
                self.graph.edges[edge.0 as usize].flags |= FLAG_DIRTY_OUT;
            }
        }
        // All outputs are dirty if any input or output is.
        if self.graph.edges[edge.0 as usize].flags & FLAG_DIRTY != 0 {
            for out in self.graph.edges[edge.0 as usize].outs.clone() {
                self.graph.nodes[out.0 as usize].dirty = true;
            }
        }
        if self.graph.edges[edge.0 as usize].flags & FLAG_DIRTY_OUT == 0 {
            self.graph.edges[edge.0 as usize].nprune = nblock;
        }
        if self.graph.edges[edge.0 as usize].flags & FLAG_DIRTY != 0 {
            if nblock == 0 {
                self.queue(edge);
            }
            if self.graph.edges[edge.0 as usize].rule != self.graph.phony_rule {
                self.ntotal += 1;
            }
        }
        self.graph.edges[edge.0 as usize].flags &= !FLAG_CYCLE;
        Ok(())
    }

    // ------------------------------------------------------------------
    // completion propagation

    /// An output finished (or was pruned). Unblock or prune consumers.
    fn node_done(&mut self, node: NodeId, prune: bool) {
        let users = self.graph.nodes[node.0 as usize].used_by.clone();
        for edge in users {
            let flags = self.graph.edges[edge.0 as usize].flags;
            if flags & FLAG_WORK == 0 {
                continue;
            }
            let gate = if prune { FLAG_DIRTY_OUT } else { FLAG_DIRTY };
            if flags & gate == 0 {
                let e = &mut self.graph.edges[edge.0 as usize];
                e.nprune = e.nprune.saturating_sub(1);
                if e.nprune == 0 {
                    // The edge was clean, or every blocking input was
                    // pruned: its outputs prune too.
                    for out in self.graph.edges[edge.0 as usize].outs.clone() {
                        self.node_done(out, true);
                    }
                    if flags & FLAG_DIRTY != 0
                        && self.graph.edges[edge.0 as usize].rule != self.graph.phony_rule
                    {
                        self.ntotal = self.ntotal.saturating_sub(1);
                    }
                    continue;
                }
                // nprune didn't hit zero; fall through to unblock.
            }
            let e = &mut self.graph.edges[edge.0 as usize];
            e.nblock = e.nblock.saturating_sub(1);
            if e.nblock == 0 {
                self.queue(edge);
            }
        }
    }

    /// Restat verdict: output mtime unchanged means consumers prune; the
    /// recorded mtime is advanced to the newest input to keep future
    /// builds quiet.
    fn should_prune(&mut self, edge: EdgeId, node: NodeId, old_mtime: i64) -> bool {
        if old_mtime != self.graph.nodes[node.0 as usize].mtime {
            return false;
        }
        let inorderidx = self.graph.edges[edge.0 as usize].inorderidx;
        let ins = self.graph.edges[edge.0 as usize].ins.clone();
        let mut newest: Option<NodeId> = None;
        for input in ins.iter().take(inorderidx) {
            self.graph.node_stat(*input);
            if self.graph.nodes[input.0 as usize].mtime != MTIME_MISSING
                && self.is_newer(newest, *input)
            {
                newest = Some(*input);
            }
        }
        if let Some(newest) = newest {
            self.graph.nodes[node.0 as usize].logmtime = self.graph.nodes[newest.0 as usize].mtime;
        }
        true
    }

    // ------------------------------------------------------------------
    // status output

    fn format_status(&self) -> Result<String, GraphError> {
        let elapsed = self.timer.elapsed().as_secs_f64();
        let mut out = String::new();
        let mut chars = self.opts.statusfmt.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('%') => out.push('%'),
                Some('s') => out.push_str(&self.nstarted.to_string()),
                Some('f') => out.push_str(&self.nfinished.to_string()),
                Some('t') => out.push_str(&self.ntotal.to_string()),
                Some('r') => out.push_str(&(self.nstarted - self.nfinished).to_string()),
                Some('u') => {
                    out.push_str(&self.ntotal.saturating_sub(self.nstarted).to_string());
                }
                Some('p') => {
                    let pct = if self.ntotal == 0 {
                        100
                    } else {
                        100 * self.nfinished / self.ntotal
                    };
                    out.push_str(&format!("{pct:3}%"));
                }
                Some('o') => {
                    let rate = if elapsed > 0.0 {
                        #[expect(clippy::cast_precision_loss, reason = "status display only")]
                        let rate = self.nfinished as f64 / elapsed;
                        rate
                    } else {
                        0.0
                    };
                    out.push_str(&format!("{rate:.1}"));
                }
                Some('e') => out.push_str(&format!("{elapsed:.3}")),
                other => {
                    return Err(GraphError::Fatal(format!(
                        "unknown placeholder '%{}' in $NINJA_STATUS",
                        other.map_or_else(String::new, |c| c.to_string())
                    )));
                }
            }
        }
        Ok(out)
    }

    fn print_status(&mut self, edge: EdgeId, cmd: &str) -> Result<(), GraphError> {
        let description = if self.opts.verbose {
            None
        } else {
            self.graph.edge_var(edge, "description", true)?.filter(|d| !d.is_empty())
        };
        let status = self.format_status()?;
        let text = description.as_deref().unwrap_or(cmd);
        println!("{status}{text}");
        Ok(())
    }

    // ------------------------------------------------------------------
    // job control

    fn start_job(&mut self, edge: EdgeId, slot: usize) -> Result<Job, GraphError> {
        self.nstarted += 1;
        for out in self.graph.edges[edge.0 as usize].outs.clone() {
            if self.graph.nodes[out.0 as usize].mtime == MTIME_MISSING {
                let path = std::path::Path::new(&self.graph.nodes[out.0 as usize].path);
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        if let Some(rspfile) = self.graph.edge_var(edge, "rspfile", false)? {
            let content = self.graph.edge_var_or_empty(edge, "rspfile_content", true)?;
            std::fs::write(&rspfile, content)?;
        }
        let Some(cmd) = self.graph.edge_var(edge, "command", true)? else {
            let rule = self.graph.edges[edge.0 as usize].rule;
            let name = self.graph.rules[rule.0 as usize].name.clone();
            return Err(GraphError::Fatal(format!("rule '{name}' has no command")));
        };

        let console = self.graph.edges[edge.0 as usize].pool == Some(self.graph.console_pool);
        if !self.console_used {
            self.print_status(edge, &cmd)?;
        }

        let mut command = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/c").arg(&cmd);
            c
        } else {
            let mut c = Command::new("/bin/sh");
            c.arg("-c").arg(&cmd);
            c
        };
        let capture_path = if console {
            self.console_used = true;
            None
        } else {
            // Capture both streams into one file; the buffered content is
            // replayed atomically at job completion so interleaved child
            // output never tears.
            let path = std::env::temp_dir()
                .join(format!("kiln-job-{}-{slot}.out", std::process::id()));
            let file = std::fs::File::create(&path)?;
            let err_file = file.try_clone()?;
            command.stdout(Stdio::from(file)).stderr(Stdio::from(err_file));
            command.stdin(Stdio::null());
            Some(path)
        };
        let child = command
            .spawn()
            .map_err(|e| GraphError::Fatal(format!("failed to start job: {e}")))?;
        let start_time_ms = u64::try_from(self.timer.elapsed().as_millis()).unwrap_or(0);
        Ok(Job { edge, cmd, child, capture_path, start_time_ms, console })
    }

    /// Post-process a successful job: restat outputs, prune or unblock
    /// consumers, ingest discovered dependencies, update both logs.
    fn edge_done(&mut self, job: &Job, output: &str) -> Result<Option<String>, GraphError> {
        let edge = job.edge;
        let restat = self.graph.edge_bool_var(edge, "restat");
        for out in self.graph.edges[edge.0 as usize].outs.clone() {
            let old = self.graph.nodes[out.0 as usize].mtime;
            self.graph.node_stat(out);
            let mtime = self.graph.nodes[out.0 as usize].mtime;
            self.graph.nodes[out.0 as usize].logmtime =
                if mtime == MTIME_MISSING { 0 } else { mtime };
            let prune = restat && self.should_prune(edge, out, old);
            self.node_done(out, prune);
        }
        if let Some(rspfile) = self.graph.edge_var(edge, "rspfile", false)?
            && !self.opts.keeprsp
        {
            let _ = std::fs::remove_file(&rspfile);
        }
        self.graph.edge_hash(edge)?;

        let filtered = self.record_deps(edge, output)?;

        let end_time_ms = u64::try_from(self.timer.elapsed().as_millis()).unwrap_or(0);
        let hash = self.graph.edges[edge.0 as usize].hash;
        for out in self.graph.edges[edge.0 as usize].outs.clone() {
            self.graph.nodes[out.0 as usize].hash = hash;
            self.log.record(self.graph, out, job.start_time_ms, end_time_ms)?;
        }
        Ok(filtered)
    }

    /// Ingest `deps = gcc|msvc` dependency discovery for a finished edge.
    fn record_deps(&mut self, edge: EdgeId, output: &str) -> Result<Option<String>, GraphError> {
        let Some(deptype) = self.graph.edge_var(edge, "deps", true)? else { return Ok(None) };
        if deptype.is_empty() {
            return Ok(None);
        }
        let (deps, filtered) = match deptype.as_str() {
            "gcc" => {
                let Some(depfile) = self.graph.edge_var(edge, "depfile", false)? else {
                    tracing::warn!("deps but no depfile");
                    return Ok(None);
                };
                let parsed = depfile::parse_gcc_depfile_at(&depfile, true);
                if !self.opts.keepdepfile {
                    let _ = std::fs::remove_file(&depfile);
                }
                match parsed {
                    Ok(Some(paths)) => (paths, None),
                    Ok(None) => return Ok(None),
                    Err(err) => {
                        tracing::warn!(%err, "failed to parse depfile");
                        return Ok(None);
                    }
                }
            }
            "msvc" => {
                let prefix = self.graph.edge_var(edge, "msvc_deps_prefix", true)?;
                let result = depfile::parse_msvc_showincludes(output, prefix.as_deref());
                (result.deps, Some(result.filtered_output))
            }
            other => {
                tracing::warn!(deps = other, "unsupported deps type");
                return Ok(None);
            }
        };
        let Some(out) = self.graph.edges[edge.0 as usize].outs.first().copied() else {
            return Ok(filtered);
        };
        let dep_nodes: Vec<NodeId> = deps.iter().map(|p| self.graph.node(p)).collect();
        let mtime = self.graph.nodes[out.0 as usize].mtime;
        self.deps.record(self.graph, out, &dep_nodes, mtime)?;
        Ok(filtered)
    }

    fn job_done(&mut self, job: Job, failed: bool, status: i32) -> Result<(), GraphError> {
        let mut filtered = None;
        if failed {
            tracing::warn!(status, cmd = %job.cmd, "job failed");
        } else {
            let output = job
                .capture_path
                .as_ref()
                .and_then(|p| std::fs::read_to_string(p).ok())
                .unwrap_or_default();
            filtered = self.edge_done(&job, &output)?;
        }
        self.nfinished += 1;

        if !self.console_used || failed {
            let raw = job
                .capture_path
                .as_ref()
                .and_then(|p| std::fs::read_to_string(p).ok())
                .unwrap_or_default();
            let text = filtered.unwrap_or(raw);
            if !text.is_empty() {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
        }
        if let Some(path) = &job.capture_path {
            let _ = std::fs::remove_file(path);
        }

        if job.console {
            self.console_used = false;
        }
        let pool = self.graph.edges[job.edge.0 as usize].pool;
        if let Some(pool) = pool {
            // Promote a waiting pool edge into the main queue, or free
            // the slot.
            let promoted = self.graph.pools[pool.0 as usize].work.pop_front();
            match promoted {
                Some(next) => self.work.push_front(next),
                None => {
                    let p = &mut self.graph.pools[pool.0 as usize];
                    p.numjobs = p.numjobs.saturating_sub(1);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // the scheduler loop

    pub fn build(&mut self) -> Result<(), GraphError> {
        if self.ntotal == 0 {
            return Ok(());
        }
        self.timer = Instant::now();
        // Validate the status format up front.
        self.format_status()?;
        self.nstarted = 0;
        self.nfinished = 0;

        let maxjobs = self.opts.maxjobs.max(1);
        let mut slots: Vec<Option<Job>> = (0..maxjobs).map(|_| None).collect();
        let mut numjobs = 0_usize;
        let mut numfail = 0_u64;

        loop {
            while !self.work.is_empty()
                && numjobs < maxjobs
                && numfail < self.opts.maxfail
                && !self.stop_requested
            {
                let Some(edge) = self.work.pop() else { break };
                let phony = self.graph.edges[edge.0 as usize].rule == self.graph.phony_rule;
                if !phony && self.opts.dryrun {
                    self.nstarted += 1;
                    let cmd = self.graph.edge_var_or_empty(edge, "command", true)?;
                    self.print_status(edge, &cmd)?;
                    self.nfinished += 1;
                }
                if phony || self.opts.dryrun {
                    for out in self.graph.edges[edge.0 as usize].outs.clone() {
                        self.node_done(out, false);
                    }
                    continue;
                }
                let Some(slot) = slots.iter().position(Option::is_none) else { break };
                match self.start_job(edge, slot) {
                    Ok(job) => {
                        slots[slot] = Some(job);
                        numjobs += 1;
                    }
                    Err(err) => {
                        tracing::warn!(%err, "job failed to start");
                        numfail += 1;
                    }
                }
            }
            if numjobs == 0 {
                break;
            }

            let mut collected = false;
            for slot in &mut slots {
                let Some(job) = slot else { continue };
                match job.child.try_wait() {
                    Ok(None) => {}
                    Ok(Some(status)) => {
                        let code = status.code().unwrap_or(-1);
                        let failed = !status.success();
                        let Some(job) = slot.take() else { continue };
                        numjobs -= 1;
                        collected = true;
                        if failed {
                            numfail += 1;
                        }
                        self.job_done(job, failed, code)?;
                    }
                    Err(err) => {
                        tracing::warn!(%err, "failed to poll job");
                        let Some(mut job) = slot.take() else { continue };
                        let _ = job.child.kill();
                        numjobs -= 1;
                        numfail += 1;
                        collected = true;
                    }
                }
            }
            if !collected && (self.work.is_empty() || numjobs == maxjobs) {
                std::thread::sleep(std::time::Duration::from_millis(POLL_SLEEP_MS));
            }
        }

        let result = if self.stop_requested && numfail == 0 {
            Err(GraphError::Fatal("interrupted by user".into()))
        } else if numfail > 0 {
            if numfail < self.opts.maxfail {
                Err(GraphError::Fatal("cannot make progress due to previous errors".into()))
            } else if numfail > 1 {
                Err(GraphError::Fatal("subcommands failed".into()))
            } else {
                Err(GraphError::Fatal("subcommand failed".into()))
            }
        } else {
            Ok(())
        };
        // Reset in case the manifest gets rebuilt and analysis reruns.
        self.ntotal = 0;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::parse::{ParseOpts, parse};
    use crate::runner::scan::Scanner;
    use rstest::rstest;

    struct Fixture {
        _dir: tempfile::TempDir,
        graph: Graph,
        deps: DepsLog,
        log: BuildLog,
    }

    fn fixture(manifest: &str) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        std::env::set_current_dir(dir.path()).expect("chdir");
        let mut graph = Graph::new();
        let scanner = Scanner::from_bytes("build.ninja", manifest.as_bytes().to_vec());
        let root = graph.root_env;
        parse(&mut graph, ParseOpts::default(), scanner, root).expect("parse");
        let deps = DepsLog::open(&mut graph, None).expect("deps");
        let log = BuildLog::open(&mut graph, None).expect("log");
        Fixture { _dir: dir, graph, deps, log }
    }

    fn build_defaults(fx: &mut Fixture, opts: BuildOpts) -> (Result<(), GraphError>, usize) {
        let targets = fx.graph.default_nodes();
        let mut builder = Builder::new(&mut fx.graph, &mut fx.deps, &mut fx.log, opts);
        for t in targets {
            if let Err(e) = builder.add_target(t) {
                return (Err(e), 0);
            }
        }
        let result = builder.build();
        let (started, _, _) = builder.stats();
        (result, started)
    }

    // Serialized: the fixtures chdir into their tempdir.
    #[rstest]
    #[serial_test::serial]
    fn dependency_cycle_is_fatal() {
        let mut fx = fixture(concat!(
            "rule r\n  command = :\n",
            "build a: r b\n",
            "build b: r a\n",
        ));
        let a = fx.graph.node_lookup("a").expect("a");
        let mut builder =
            Builder::new(&mut fx.graph, &mut fx.deps, &mut fx.log, BuildOpts::default());
        let err = builder.add_target(a).expect_err("cycle");
        assert!(err.to_string().contains("dependency cycle involving"));
    }

    #[rstest]
    #[serial_test::serial]
    fn builds_and_then_noops() {
        let mut fx = fixture(concat!(
            "rule touch\n  command = touch $out\n",
            "build out.txt: touch\n",
        ));
        let (result, started) = build_defaults(&mut fx, BuildOpts::default());
        result.expect("build");
        assert_eq!(started, 1);
        assert!(std::path::Path::new("out.txt").exists());

        // A fresh analysis over the same graph state spawns nothing.
        Builder::reset(&mut fx.graph);
        for node in 0..fx.graph.nodes.len() {
            fx.graph.nodes[node].mtime = MTIME_UNKNOWN;
        }
        let (result, started) = build_defaults(&mut fx, BuildOpts::default());
        result.expect("rebuild");
        assert_eq!(started, 0);
    }

    #[rstest]
    #[serial_test::serial]
    fn dryrun_spawns_nothing() {
        let mut fx = fixture(concat!(
            "rule touch\n  command = touch $out\n",
            "build out.txt: touch\n",
        ));
        let opts = BuildOpts { dryrun: true, ..BuildOpts::default() };
        let (result, _) = build_defaults(&mut fx, opts);
        result.expect("dry run");
        assert!(!std::path::Path::new("out.txt").exists());
    }

    #[rstest]
    #[serial_test::serial]
    fn missing_source_is_fatal() {
        let mut fx = fixture(concat!(
            "rule cp\n  command = cp $in $out\n",
            "build out: cp missing-input\n",
        ));
        let (result, _) = build_defaults(&mut fx, BuildOpts::default());
        let err = result.expect_err("must fail");
        assert!(err.to_string().contains("missing and not created by any action"));
    }

    #[rstest]
    #[serial_test::serial]
    fn restat_prunes_consumers_when_output_unchanged() {
        let mut fx = fixture(concat!(
            "rule gen\n",
            "  command = if ! cmp -s src.txt mid.txt; then cp src.txt mid.txt; fi\n",
            "  restat = 1\n",
            "rule cp\n  command = cp $in $out\n",
            "build mid.txt: gen src.txt\n",
            "build final.txt: cp mid.txt\n",
        ));
        std::fs::write("src.txt", "same").expect("write src");
        let (result, started) = build_defaults(&mut fx, BuildOpts::default());
        result.expect("first build");
        assert_eq!(started, 2);

        // Touch the input but keep the generated output byte-identical:
        // gen re-runs, the consumer is pruned.
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write("src.txt", "same").expect("rewrite src");
        let mut fx2 = fixture_reload(&fx);
        let (result, started) = build_defaults(&mut fx2, BuildOpts::default());
        result.expect("second build");
        assert_eq!(started, 1, "only gen may run; consumer must be pruned");
    }

    fn fixture_reload(old: &Fixture) -> Fixture {
        // Reparse the same manifest in the same directory, fresh state.
        let manifest = concat!(
            "rule gen\n",
            "  command = if ! cmp -s src.txt mid.txt; then cp src.txt mid.txt; fi\n",
            "  restat = 1\n",
            "rule cp\n  command = cp $in $out\n",
            "build mid.txt: gen src.txt\n",
            "build final.txt: cp mid.txt\n",
        );
        let _ = old;
        let mut graph = Graph::new();
        let scanner = Scanner::from_bytes("build.ninja", manifest.as_bytes().to_vec());
        let root = graph.root_env;
        parse(&mut graph, ParseOpts::default(), scanner, root).expect("parse");
        let deps = DepsLog::open(&mut graph, None).expect("deps");
        let log = BuildLog::open(&mut graph, None).expect("log");
        Fixture {
            _dir: tempfile::tempdir().expect("tempdir placeholder"),
            graph,
            deps,
            log,
        }
    }

    #[rstest]
    #[serial_test::serial]
    fn scheduler_respects_dependencies_with_limited_jobs() {
        // Three edges, one depending on the other two: the parents start
        // first and the dependent never runs concurrently with them. The
        // commands append to a trace file; with maxjobs=2 the child's
        // line must come last.
        let mut fx = fixture(concat!(
            "rule t\n  command = echo $out >> trace.log && touch $out\n",
            "build p1: t\n",
            "build p2: t\n",
            "build child: t p1 p2\n",
        ));
        let child = fx.graph.node_lookup("child").expect("child");
        let opts = BuildOpts { maxjobs: 2, ..BuildOpts::default() };
        let mut builder = Builder::new(&mut fx.graph, &mut fx.deps, &mut fx.log, opts);
        builder.add_target(child).expect("analyze");
        builder.build().expect("build");
        let trace = std::fs::read_to_string("trace.log").expect("trace");
        let lines: Vec<&str> = trace.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2], "child");
    }

    #[rstest]
    #[serial_test::serial]
    fn pool_depth_limits_concurrency() {
        // A depth-1 pool forces serial execution; both jobs append to the
        // same file, so overlap would interleave begin/end markers.
        let mut fx = fixture(concat!(
            "pool serial\n  depth = 1\n",
            "rule t\n",
            "  command = echo begin-$out >> pool.log && sleep 0.05 && echo end-$out >> pool.log && touch $out\n",
            "  pool = serial\n",
            "build a: t\n",
            "build b: t\n",
        ));
        let (result, _) = build_defaults(&mut fx, BuildOpts { maxjobs: 4, ..BuildOpts::default() });
        result.expect("build");
        let text = std::fs::read_to_string("pool.log").expect("log");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        // begin/end pairs must not interleave.
        assert!(lines[0].starts_with("begin-"));
        assert_eq!(lines[1].replace("end-", ""), lines[0].replace("begin-", ""));
    }

    #[rstest]
    #[serial_test::serial]
    fn failing_job_fails_the_build() {
        let mut fx = fixture(concat!("rule f\n  command = false\n", "build out: f\n",));
        let (result, _) = build_defaults(&mut fx, BuildOpts::default());
        let err = result.expect_err("must fail");
        assert!(err.to_string().contains("subcommand failed"));
    }

    #[rstest]
    #[serial_test::serial]
    fn stop_request_drains_and_reports_failure() {
        let mut fx = fixture(concat!(
            "rule t\n  command = touch $out\n",
            "build a: t\n",
            "build b: t a\n",
        ));
        let b = fx.graph.node_lookup("b").expect("b");
        let mut builder =
            Builder::new(&mut fx.graph, &mut fx.deps, &mut fx.log, BuildOpts::default());
        builder.add_target(b).expect("analyze");
        builder.request_stop();
        assert!(builder.build().is_err());
    }

    #[rstest]
    fn status_format_expands_all_specifiers() {
        let mut graph = Graph::new();
        let mut deps = DepsLog::default();
        let mut log = BuildLog::default();
        let opts = BuildOpts {
            statusfmt: "[%s/%f/%t %p %r %u] %%".to_owned(),
            ..BuildOpts::default()
        };
        let mut builder = Builder::new(&mut graph, &mut deps, &mut log, opts);
        builder.ntotal = 4;
        builder.nstarted = 2;
        builder.nfinished = 1;
        let status = builder.format_status().expect("format");
        assert_eq!(status, "[2/1/4  25% 1 2] %");
    }

    #[rstest]
    fn unknown_status_placeholder_is_fatal() {
        let mut graph = Graph::new();
        let mut deps = DepsLog::default();
        let mut log = BuildLog::default();
        let opts = BuildOpts { statusfmt: "%q".to_owned(), ..BuildOpts::default() };
        let builder = Builder::new(&mut graph, &mut deps, &mut log, opts);
        assert!(builder.format_status().is_err());
    }
}
