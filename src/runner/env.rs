//! Environments, rules, pools, and lazily-evaluated variable strings for
//! the embedded build engine.
//!
//! Manifest values are stored unevaluated as [`EvalString`] chunks and
//! resolved at read time against the edge-local environment, then the
//! rule-local bindings, then the parent environment chain.

use std::collections::HashMap;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(pub u32);

/// One chunk of a manifest value: a literal or a `$var` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalPart {
    Lit(String),
    Var(String),
}

/// A sequence of literal chunks and variable substitutions.
pub type EvalString = Vec<EvalPart>;

#[derive(Debug)]
pub struct Env {
    pub parent: Option<EnvId>,
    pub bindings: HashMap<String, String>,
}

#[derive(Debug)]
pub struct Rule {
    pub name: String,
    pub bindings: HashMap<String, EvalString>,
}

#[derive(Debug)]
pub struct Pool {
    pub name: String,
    pub maxjobs: usize,
    pub numjobs: usize,
    /// Edges waiting for a pool slot, admitted FIFO.
    pub work: VecDeque<super::graph::EdgeId>,
}

impl Pool {
    #[must_use]
    pub fn new(name: String, maxjobs: usize) -> Self {
        Self { name, maxjobs, numjobs: 0, work: VecDeque::new() }
    }
}

/// Render a literal-only eval string (no variable references), used by
/// tests and simple values.
#[must_use]
pub fn literal(text: &str) -> EvalString {
    vec![EvalPart::Lit(text.to_owned())]
}
