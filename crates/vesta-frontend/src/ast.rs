//! Typed AST
//!
//! The expression tree the backend lowers. Every node carries a `NodeId`
//! keying into the symbol table's resolution and type maps, plus a source
//! span for diagnostics. The node kind set is closed; the backend matches on
//! it exhaustively.

use crate::symbols::DeclId;
use crate::types::SourceType;
use serde::{Deserialize, Serialize};

/// Identity of an AST node within one checked program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Create a new node ID.
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

/// Byte range in the original source, for diagnostics only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    /// Create a new span.
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// An expression node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expr {
    pub id: NodeId,
    pub kind: ExprKind,
    pub span: Span,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    /// Whether the operator yields a boolean.
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
}

/// One clause of a `when` expression: any condition matching selects the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhenClause {
    /// Candidate conditions, compared against the subject (or evaluated as
    /// booleans when there is no subject), in source order.
    pub conditions: Vec<Expr>,
    pub body: Expr,
}

/// One catch handler of a `try` expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatchClause {
    /// Local binding the caught value; its declared type selects the handler.
    pub param: DeclId,
    pub body: Expr,
}

/// Expression kinds. Closed set; lowering matches exhaustively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExprKind {
    /// Integer literal; the node's recorded type picks Int/Long/Byte/Short.
    IntLit(i64),
    /// Floating literal; the node's recorded type picks Float/Double.
    FloatLit(f64),
    BoolLit(bool),
    CharLit(char),
    StrLit(String),
    NullLit,
    UnitLit,

    /// A simple name; its target is in the resolution map.
    Name,
    /// The enclosing instance (`this`), possibly qualified by class via the
    /// node's recorded type.
    This,

    /// Statement sequence; value of the block is the value of its last
    /// expression, or unit when empty.
    Block(Vec<Expr>),
    /// Local variable declaration with optional initializer.
    Let {
        decl: DeclId,
        init: Option<Box<Expr>>,
    },

    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
    },
    /// Compound assignment (`+=` and friends).
    Compound {
        op: BinOp,
        target: Box<Expr>,
        value: Box<Expr>,
    },

    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },

    /// Call of a resolved callable. Constructors have no receiver; instance
    /// methods without an explicit receiver dispatch on the enclosing
    /// instance found through the scope chain.
    Call {
        callee: DeclId,
        receiver: Option<Box<Expr>>,
        args: Vec<Expr>,
        /// Generic arguments at the call site, in declaration order.
        type_args: Vec<SourceType>,
    },
    /// Property or field access. A missing receiver means the member is
    /// reached through the enclosing instance.
    Member {
        receiver: Option<Box<Expr>>,
        member: DeclId,
    },
    /// Array element access.
    Index {
        array: Box<Expr>,
        index: Box<Expr>,
    },
    ArrayLit {
        elem_ty: SourceType,
        elems: Vec<Expr>,
    },
    /// Fixed-arity tuple construction.
    TupleLit(Vec<Expr>),

    If {
        cond: Box<Expr>,
        then: Box<Expr>,
        els: Option<Box<Expr>>,
    },
    While {
        label: Option<String>,
        cond: Box<Expr>,
        body: Box<Expr>,
    },
    DoWhile {
        label: Option<String>,
        body: Box<Expr>,
        cond: Box<Expr>,
    },
    Break {
        label: Option<String>,
    },
    Continue {
        label: Option<String>,
    },

    /// Pattern/branch construct. With a subject, clause conditions are
    /// compared against it; without, they are boolean guards.
    When {
        subject: Option<Box<Expr>>,
        clauses: Vec<WhenClause>,
        else_body: Option<Box<Expr>>,
    },

    Try {
        body: Box<Expr>,
        catches: Vec<CatchClause>,
        finally: Option<Box<Expr>>,
    },

    Return {
        value: Option<Box<Expr>>,
    },
    Throw(Box<Expr>),

    /// Not-null assertion (`!!`).
    NotNull(Box<Expr>),
    /// `is` / `!is` type test.
    TypeTest {
        operand: Box<Expr>,
        ty: SourceType,
        negated: bool,
    },
    /// Checked cast.
    Cast {
        operand: Box<Expr>,
        ty: SourceType,
    },

    /// Closure literal. `decl` is the synthetic callable the front end
    /// created for it; the body is carried inline.
    Closure {
        decl: DeclId,
        body: Box<Expr>,
    },
}

impl Expr {
    /// Create an expression node.
    pub fn new(id: NodeId, kind: ExprKind, span: Span) -> Self {
        Self { id, kind, span }
    }

    /// Short name of the node kind, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            ExprKind::IntLit(_) => "integer literal",
            ExprKind::FloatLit(_) => "float literal",
            ExprKind::BoolLit(_) => "boolean literal",
            ExprKind::CharLit(_) => "character literal",
            ExprKind::StrLit(_) => "string literal",
            ExprKind::NullLit => "null literal",
            ExprKind::UnitLit => "unit literal",
            ExprKind::Name => "name",
            ExprKind::This => "this",
            ExprKind::Block(_) => "block",
            ExprKind::Let { .. } => "local declaration",
            ExprKind::Assign { .. } => "assignment",
            ExprKind::Compound { .. } => "compound assignment",
            ExprKind::Binary { .. } => "binary operation",
            ExprKind::Unary { .. } => "unary operation",
            ExprKind::Call { .. } => "call",
            ExprKind::Member { .. } => "member access",
            ExprKind::Index { .. } => "index access",
            ExprKind::ArrayLit { .. } => "array literal",
            ExprKind::TupleLit(_) => "tuple literal",
            ExprKind::If { .. } => "if",
            ExprKind::While { .. } => "while",
            ExprKind::DoWhile { .. } => "do-while",
            ExprKind::Break { .. } => "break",
            ExprKind::Continue { .. } => "continue",
            ExprKind::When { .. } => "when",
            ExprKind::Try { .. } => "try",
            ExprKind::Return { .. } => "return",
            ExprKind::Throw(_) => "throw",
            ExprKind::NotNull(_) => "not-null assertion",
            ExprKind::TypeTest { .. } => "type test",
            ExprKind::Cast { .. } => "cast",
            ExprKind::Closure { .. } => "closure literal",
        }
    }
}
