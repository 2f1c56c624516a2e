//! Abstract syntax tree.
//!
//! Nodes live in a bucket arena owned by the [`Ast`]; identities are stable
//! [`NodeId`] indices, never pointers. Literal payloads are interned into
//! the heap at parse time so the compiler only moves handles around.

use crate::lang::object::Obj;
use crate::lang::types::TypeTag;
use crate::source::SourceLocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Eq,
    NEq,
    In,
    NotIn,
    Lt,
    Gt,
    Leq,
    Geq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Negate,
}

/// Call arguments: positionals first, then `name: value` keywords.
#[derive(Debug, Clone, Default)]
pub struct Arguments {
    pub positional: Vec<NodeId>,
    pub kwargs: Vec<(Obj, NodeId)>,
}

#[derive(Debug, Clone)]
pub struct IfArm {
    /// `None` for the trailing `else` arm.
    pub cond: Option<NodeId>,
    pub body: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct ParamDecl {
    pub name: Obj,
    pub ty: TypeTag,
    pub default: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    /// A value known at parse time (bool, number, string).
    Literal(Obj),
    Id(Obj),
    Array(Vec<NodeId>),
    Dict(Vec<(NodeId, NodeId)>),
    Binary { op: BinOp, lhs: NodeId, rhs: NodeId },
    Unary { op: UnOp, expr: NodeId },
    Ternary { cond: NodeId, then: NodeId, otherwise: NodeId },
    Index { lhs: NodeId, index: NodeId },
    Call { callee: NodeId, args: Arguments },
    Method { receiver: NodeId, name: Obj, args: Arguments, has_parens: bool },
    /// Coerce to string; synthesized by f-string expansion.
    Stringify(NodeId),
    Assign { name: Obj, value: NodeId },
    AddAssign { name: Obj, value: NodeId },
    If { arms: Vec<IfArm> },
    Foreach { vars: (Obj, Option<Obj>), iterable: NodeId, body: Vec<NodeId> },
    Continue,
    Break,
    FuncDef {
        name: Option<Obj>,
        params: Vec<ParamDecl>,
        return_type: TypeTag,
        body: Vec<NodeId>,
    },
    Return(Option<NodeId>),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub loc: SourceLocation,
}

/// One parsed source file: a node arena plus its top-level statements.
#[derive(Debug, Default)]
pub struct Ast {
    nodes: Vec<Node>,
    pub stmts: Vec<NodeId>,
}

impl Ast {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: NodeKind, loc: SourceLocation) -> NodeId {
        let id = NodeId(u32::try_from(self.nodes.len()).unwrap_or(u32::MAX));
        self.nodes.push(Node { kind, loc });
        id
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
