//! Kernel ASTs
//!
//! Two trees live here:
//!
//! - the **raw AST** ([`RawExpr`]/[`RawStmt`]/[`RawFunction`]): what the
//!   host hands us. Names are unresolved strings, literals are untyped
//!   numbers, macros are still visible as member accesses and calls. The
//!   raw tree serializes (serde), so program files can carry kernels.
//! - the **specialized AST** ([`Expr`]/[`Stmt`]): every name resolved to a
//!   field/global/relation/builtin/helper/local, macros expanded to core
//!   forms (`Affine`, axis extractors, links), each node carrying a `ty`
//!   slot. The specializer leaves `ty = Unknown`; the checker returns a
//!   tree where every slot is concrete.
//!
//! Every node carries a [`Span`] so errors can point at the offending
//! source position.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

use crate::relation::{FieldId, FunId, GlobalId, RelationId};
use crate::types::{Primitive, Scalar, Type};

// ============================================================================
// Spans
// ============================================================================

/// Source position of a node (1-based; 0/0 when synthesized).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub line: u32,
    pub col: u32,
}

impl Span {
    pub fn none() -> Span {
        Span::default()
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == Span::none() {
            write!(f, "<synthesized>")
        } else {
            write!(f, "{}:{}", self.line, self.col)
        }
    }
}

// ============================================================================
// Operators and builtins
// ============================================================================

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
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
    pub fn is_comparison(self) -> bool {
        matches!(self, BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge)
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }

    pub fn is_arithmetic(self) -> bool {
        !self.is_comparison() && !self.is_logical()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Reduction operators accepted on fields and globals.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReduceOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

impl ReduceOp {
    pub fn name(self) -> &'static str {
        match self {
            ReduceOp::Add => "+",
            ReduceOp::Sub => "-",
            ReduceOp::Mul => "*",
            ReduceOp::Div => "/",
            ReduceOp::Min => "min",
            ReduceOp::Max => "max",
        }
    }
}

/// Intrinsics callable from kernel bodies.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Builtin {
    Acos,
    Asin,
    Atan,
    Cbrt,
    Ceil,
    Cos,
    Fabs,
    Floor,
    Fmod,
    Log,
    Sin,
    Sqrt,
    Tan,
    Pow,
    Fmin,
    Fmax,
    Imin,
    Imax,
    Rand,
    Dot,
    Assert,
    Id,
    Xid,
    Yid,
    Zid,
    /// `Affine(rel, M, key)` stencil form; consumed by the specializer.
    Affine,
    /// `UNSAFE_ROW(id, rel)` typed key constructor.
    UnsafeRow,
}

impl Builtin {
    /// Resolve a free name to a builtin.
    pub fn lookup(name: &str) -> Option<Builtin> {
        Some(match name {
            "acos" => Builtin::Acos,
            "asin" => Builtin::Asin,
            "atan" => Builtin::Atan,
            "cbrt" => Builtin::Cbrt,
            "ceil" => Builtin::Ceil,
            "cos" => Builtin::Cos,
            "fabs" => Builtin::Fabs,
            "floor" => Builtin::Floor,
            "fmod" => Builtin::Fmod,
            "log" => Builtin::Log,
            "sin" => Builtin::Sin,
            "sqrt" => Builtin::Sqrt,
            "tan" => Builtin::Tan,
            "pow" => Builtin::Pow,
            "fmin" => Builtin::Fmin,
            "fmax" => Builtin::Fmax,
            "imin" => Builtin::Imin,
            "imax" => Builtin::Imax,
            "rand" => Builtin::Rand,
            "dot" => Builtin::Dot,
            "assert" => Builtin::Assert,
            "id" => Builtin::Id,
            "xid" => Builtin::Xid,
            "yid" => Builtin::Yid,
            "zid" => Builtin::Zid,
            "Affine" => Builtin::Affine,
            "UNSAFE_ROW" => Builtin::UnsafeRow,
            _ => return None,
        })
    }

    /// Fixed argument count.
    pub fn arity(self) -> usize {
        match self {
            Builtin::Rand => 0,
            Builtin::Fmod
            | Builtin::Pow
            | Builtin::Fmin
            | Builtin::Fmax
            | Builtin::Imin
            | Builtin::Imax
            | Builtin::Dot
            | Builtin::UnsafeRow => 2,
            Builtin::Affine => 3,
            _ => 1,
        }
    }
}

// ============================================================================
// Type expressions (serializable)
// ============================================================================

/// Serializable spelling of a type; relations are referenced by name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TypeExpr {
    Prim(Primitive),
    Vector { elem: Primitive, len: u8 },
    Matrix { elem: Primitive, rows: u8, cols: u8 },
    Key { rel: String },
}

// ============================================================================
// Raw AST
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawExpr {
    pub kind: RawExprKind,
    #[serde(default)]
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RawExprKind {
    /// Unresolved identifier: a local, the kernel parameter, or a host name.
    Name(String),
    Bool(bool),
    /// Untyped numeric literal. Integral values adopt the width of the
    /// context they meet; fractional values are `f64`.
    Num(f64),
    /// Vector literal `{a, b, c}`.
    Vector(Vec<RawExpr>),
    Unary { op: UnaryOp, expr: Box<RawExpr> },
    Binary { op: BinOp, lhs: Box<RawExpr>, rhs: Box<RawExpr> },
    /// A call: builtin, helper, or neighbor-offset call on a grid key.
    Call { callee: Box<RawExpr>, args: Vec<RawExpr> },
    /// Member access `base.name`: a field, or a relation macro.
    Member { base: Box<RawExpr>, name: String },
    /// Element read `v[i]` / `m[i, j]`.
    Index { base: Box<RawExpr>, indices: Vec<RawExpr> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawStmt {
    pub kind: RawStmtKind,
    #[serde(default)]
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RawStmtKind {
    /// Local declaration `var name [: ty] = init`.
    Let { name: String, ty: Option<TypeExpr>, init: RawExpr },
    /// Assignment to a local or a field (`k.f = e`).
    Assign { target: RawExpr, value: RawExpr },
    /// Reduction `target op= e` on a field or global.
    Reduce { target: RawExpr, op: ReduceOp, value: RawExpr },
    If { cond: RawExpr, then: Vec<RawStmt>, else_: Option<Vec<RawStmt>> },
    /// Numeric for over `[lo, hi)`.
    For { var: String, lo: RawExpr, hi: RawExpr, body: Vec<RawStmt> },
    /// Expression statement (`assert(..)`).
    Expr(RawExpr),
    /// `insert { f = e, ... } into rel`.
    Insert { rel: RawExpr, fields: Vec<(String, RawExpr)> },
    /// `delete k`.
    Delete { key: RawExpr },
    /// Helper return.
    Return(Option<RawExpr>),
}

/// Whether a function is launched over a domain or called from kernels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunKind {
    Kernel,
    Helper,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawParam {
    pub name: String,
    /// Kernels leave this `None` (the entity type comes from the launch
    /// relation); helpers must annotate.
    pub ty: Option<TypeExpr>,
}

/// A kernel or helper as declared by the host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawFunction {
    pub name: String,
    pub kind: FunKind,
    pub params: Vec<RawParam>,
    pub ret: Option<TypeExpr>,
    pub body: Vec<RawStmt>,
}

// ============================================================================
// Specialized AST
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: Type,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Expr {
        Expr { kind, ty: Type::Unknown, span }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Const(Scalar),
    VectorLit(Vec<Expr>),
    /// Reference to the n-th function parameter.
    Param(usize),
    /// Reference to a local introduced by `Let` or `For`.
    Local(String),
    /// `key.field`.
    FieldAccess { field: FieldId, key: Box<Expr> },
    /// Read of a global cell.
    GlobalRead(GlobalId),
    /// Off-center key: `(base + translation) mod bounds(target)`.
    Affine { target: RelationId, translation: Vec<i64>, base: Box<Expr> },
    /// Trusted raw-key constructor.
    UnsafeRow { rel: RelationId, id: Box<Expr> },
    Builtin { builtin: Builtin, args: Vec<Expr> },
    HelperCall { fun: FunId, args: Vec<Expr> },
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Index { base: Box<Expr>, indices: Vec<Expr> },
    /// Widening conversion inserted by the checker.
    Cast { to: Type, expr: Box<Expr> },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StmtKind {
    Let { name: String, ty: Type, init: Expr },
    AssignLocal { name: String, value: Expr },
    FieldWrite { field: FieldId, key: Expr, value: Expr },
    FieldReduce { field: FieldId, key: Expr, op: ReduceOp, value: Expr },
    GlobalReduce { global: GlobalId, op: ReduceOp, value: Expr },
    If { cond: Expr, then: Vec<Stmt>, else_: Vec<Stmt> },
    For { var: String, lo: Expr, hi: Expr, body: Vec<Stmt> },
    Expr(Expr),
    Insert { rel: RelationId, fields: Vec<(FieldId, Expr)> },
    Delete { key: Expr },
    Return(Option<Expr>),
}

// ============================================================================
// Raw-tree builders
// ============================================================================

/// Ergonomic constructors for raw trees. Hosts embedding the DSL from Rust
/// and the test suites build kernels through these; spans default to
/// "synthesized".
pub mod build {
    use super::*;

    pub fn name(n: &str) -> RawExpr {
        RawExpr { kind: RawExprKind::Name(n.to_string()), span: Span::none() }
    }

    pub fn num(v: f64) -> RawExpr {
        RawExpr { kind: RawExprKind::Num(v), span: Span::none() }
    }

    pub fn boolean(v: bool) -> RawExpr {
        RawExpr { kind: RawExprKind::Bool(v), span: Span::none() }
    }

    pub fn vector(items: Vec<RawExpr>) -> RawExpr {
        RawExpr { kind: RawExprKind::Vector(items), span: Span::none() }
    }

    pub fn unary(op: UnaryOp, expr: RawExpr) -> RawExpr {
        RawExpr { kind: RawExprKind::Unary { op, expr: Box::new(expr) }, span: Span::none() }
    }

    pub fn binary(op: BinOp, lhs: RawExpr, rhs: RawExpr) -> RawExpr {
        RawExpr {
            kind: RawExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            span: Span::none(),
        }
    }

    pub fn call(callee: RawExpr, args: Vec<RawExpr>) -> RawExpr {
        RawExpr { kind: RawExprKind::Call { callee: Box::new(callee), args }, span: Span::none() }
    }

    pub fn member(base: RawExpr, field: &str) -> RawExpr {
        RawExpr {
            kind: RawExprKind::Member { base: Box::new(base), name: field.to_string() },
            span: Span::none(),
        }
    }

    pub fn index(base: RawExpr, indices: Vec<RawExpr>) -> RawExpr {
        RawExpr { kind: RawExprKind::Index { base: Box::new(base), indices }, span: Span::none() }
    }

    pub fn let_(n: &str, init: RawExpr) -> RawStmt {
        RawStmt {
            kind: RawStmtKind::Let { name: n.to_string(), ty: None, init },
            span: Span::none(),
        }
    }

    pub fn assign(target: RawExpr, value: RawExpr) -> RawStmt {
        RawStmt { kind: RawStmtKind::Assign { target, value }, span: Span::none() }
    }

    pub fn reduce(target: RawExpr, op: ReduceOp, value: RawExpr) -> RawStmt {
        RawStmt { kind: RawStmtKind::Reduce { target, op, value }, span: Span::none() }
    }

    pub fn if_(cond: RawExpr, then: Vec<RawStmt>, else_: Option<Vec<RawStmt>>) -> RawStmt {
        RawStmt { kind: RawStmtKind::If { cond, then, else_ }, span: Span::none() }
    }

    pub fn for_(var: &str, lo: RawExpr, hi: RawExpr, body: Vec<RawStmt>) -> RawStmt {
        RawStmt {
            kind: RawStmtKind::For { var: var.to_string(), lo, hi, body },
            span: Span::none(),
        }
    }

    pub fn expr(e: RawExpr) -> RawStmt {
        RawStmt { kind: RawStmtKind::Expr(e), span: Span::none() }
    }

    pub fn insert(rel: RawExpr, fields: Vec<(&str, RawExpr)>) -> RawStmt {
        RawStmt {
            kind: RawStmtKind::Insert {
                rel,
                fields: fields.into_iter().map(|(n, e)| (n.to_string(), e)).collect(),
            },
            span: Span::none(),
        }
    }

    pub fn delete(key: RawExpr) -> RawStmt {
        RawStmt { kind: RawStmtKind::Delete { key }, span: Span::none() }
    }

    pub fn ret(value: Option<RawExpr>) -> RawStmt {
        RawStmt { kind: RawStmtKind::Return(value), span: Span::none() }
    }

    /// A kernel over one entity parameter.
    pub fn kernel(name: &str, param: &str, body: Vec<RawStmt>) -> RawFunction {
        RawFunction {
            name: name.to_string(),
            kind: FunKind::Kernel,
            params: vec![RawParam { name: param.to_string(), ty: None }],
            ret: None,
            body,
        }
    }

    /// A helper with annotated parameters and optional return type.
    pub fn helper(
        name: &str,
        params: Vec<(&str, TypeExpr)>,
        ret: Option<TypeExpr>,
        body: Vec<RawStmt>,
    ) -> RawFunction {
        RawFunction {
            name: name.to_string(),
            kind: FunKind::Helper,
            params: params
                .into_iter()
                .map(|(n, t)| RawParam { name: n.to_string(), ty: Some(t) })
                .collect(),
            ret,
            body,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
