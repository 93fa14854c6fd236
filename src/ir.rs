//! Control-program IR & recorder
//!
//! The stored program: declarations plus the imperative statement tree the
//! host records (`IF`/`ELSE`/`WHILE`/`END`, `FOR_EACH`, `LOAD_FIELD`,
//! `SET_GLOBAL`). Everything here is **name-based and serializable** — a
//! [`Program`] round-trips through JSON, which is also the launcher's
//! on-disk script format. Resolution of names to handles happens later, in
//! the lowerer, so a recorded program is a self-contained artifact.
//!
//! The [`Recorder`] keeps two ambient stacks while the host is declaring
//! its program: `scopes` (open statement lists) and `blocks` (open
//! `If`/`While` wrappers). `IF`/`WHILE` push one of each; `ELSE` closes the
//! then-scope and opens the else-scope; `END` pops the wrapper, installs
//! the scopes it owns, and appends it to the scope below. Imbalance is a
//! fatal [`RecordError`].

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

use crate::ast::{RawFunction, TypeExpr};

// ============================================================================
// Constants
// ============================================================================

/// A host-boundary constant: bool, number, or a finite nested list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ExprConst {
    Bool(bool),
    Num(f64),
    List(Vec<ExprConst>),
}

impl ExprConst {
    /// Validate a dynamic JSON value as an `ExprConst`
    /// (bool | number | array thereof, recursively).
    pub fn from_json(v: &serde_json::Value) -> Option<ExprConst> {
        match v {
            serde_json::Value::Bool(b) => Some(ExprConst::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(ExprConst::Num),
            serde_json::Value::Array(items) => items
                .iter()
                .map(ExprConst::from_json)
                .collect::<Option<Vec<_>>>()
                .map(ExprConst::List),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            ExprConst::Num(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ExprConst::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

// ============================================================================
// Declarations
// ============================================================================

/// Shape of a declared relation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ShapeDecl {
    Flat { size: u64 },
    /// Declares the whole grid family; the companion `vertices` and
    /// `dual_cells` relations are derived from the name.
    Grid { dims: Vec<u64>, n_bd: u64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Decl {
    NewRelation { name: String, shape: ShapeDecl },
    NewField { rel: String, name: String, ty: TypeExpr },
    NewGlobal { name: String, ty: TypeExpr, init: ExprConst },
    NewFunction { fun: RawFunction },
    /// Grid subset from a union of inclusive rectangles, spelled as a
    /// constant: a list of `[[lo…], [hi…]]` pairs.
    NewSubset { rel: String, name: String, rectangles: ExprConst },
}

// ============================================================================
// Statements, conditions, expressions
// ============================================================================

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

/// Scalar expression over globals and constants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Const(ExprConst),
    GetGlobal(String),
    Binary { op: ArithOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Neg(Box<Expr>),
}

/// Boolean condition over [`Expr`]s.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Cond {
    Literal(bool),
    And(Box<Cond>, Box<Cond>),
    Or(Box<Cond>, Box<Cond>),
    Not(Box<Cond>),
    Compare { op: CmpOp, lhs: Expr, rhs: Expr },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Block(Vec<Stmt>),
    /// Launch `fun` over `rel` (or a subset of it).
    ForEach { fun: String, rel: String, subset: Option<String> },
    If { cond: Cond, then: Option<Box<Stmt>>, else_: Option<Box<Stmt>> },
    /// Fill every row of a field with a constant.
    LoadField { rel: String, field: String, value: ExprConst },
    SetGlobal { global: String, value: Expr },
    While { cond: Cond, body: Option<Box<Stmt>> },
}

/// A complete recorded program: what the launcher loads and the lowerer
/// consumes.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Program {
    pub decls: Vec<Decl>,
    pub stmts: Vec<Stmt>,
}

impl Program {
    /// Content digest of the serialized program; stamped into the emitted
    /// task-graph manifest so consumers can bind artifact to source.
    pub fn digest(&self) -> [u8; 32] {
        let bytes = serde_json::to_vec(self).expect("program serializes");
        *blake3::hash(&bytes).as_bytes()
    }
}

// ============================================================================
// Recorder
// ============================================================================

/// Recorder invariant violations. All are fatal to the control program.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("malformed program: END without a matching IF or WHILE")]
    EndWithoutOpener,
    #[error("malformed program: ELSE without an open IF")]
    ElseWithoutIf,
    #[error("malformed program: second ELSE in the same IF")]
    DoubleElse,
    #[error("malformed program: {0} block(s) still open at finish")]
    UnclosedBlocks(usize),
}

/// An `If`/`While` whose `END` has not been recorded yet.
#[derive(Debug)]
enum OpenBlock {
    If { cond: Cond, then: Option<Stmt> },
    While { cond: Cond },
}

/// Records host declarations and statements into a [`Program`].
#[derive(Debug)]
pub struct Recorder {
    decls: Vec<Decl>,
    /// Statement lists, innermost last. The bottom scope is the program
    /// body and is never popped by block closers.
    scopes: Vec<Vec<Stmt>>,
    /// Open wrappers, innermost last.
    blocks: Vec<OpenBlock>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    pub fn new() -> Recorder {
        Recorder { decls: Vec::new(), scopes: vec![Vec::new()], blocks: Vec::new() }
    }

    pub fn decl(&mut self, d: Decl) {
        self.decls.push(d);
    }

    /// Append a statement to the innermost open scope.
    pub fn stmt(&mut self, s: Stmt) {
        self.scopes.last_mut().expect("recorder always has a scope").push(s);
    }

    pub fn for_each(&mut self, fun: &str, rel: &str, subset: Option<&str>) {
        self.stmt(Stmt::ForEach {
            fun: fun.to_string(),
            rel: rel.to_string(),
            subset: subset.map(str::to_string),
        });
    }

    pub fn load_field(&mut self, rel: &str, field: &str, value: ExprConst) {
        self.stmt(Stmt::LoadField { rel: rel.to_string(), field: field.to_string(), value });
    }

    pub fn set_global(&mut self, global: &str, value: Expr) {
        self.stmt(Stmt::SetGlobal { global: global.to_string(), value });
    }

    /// Open an `If`: pushes the wrapper and its then-scope.
    pub fn if_(&mut self, cond: Cond) {
        self.blocks.push(OpenBlock::If { cond, then: None });
        self.scopes.push(Vec::new());
    }

    /// Close the then-scope of the innermost `If` and open its else-scope.
    pub fn else_(&mut self) -> Result<(), RecordError> {
        match self.blocks.last_mut() {
            Some(OpenBlock::If { then: then @ None, .. }) => {
                let scope = self.scopes.pop().expect("if pushed a scope");
                *then = Some(Stmt::Block(scope));
                self.scopes.push(Vec::new());
                Ok(())
            }
            Some(OpenBlock::If { then: Some(_), .. }) => Err(RecordError::DoubleElse),
            _ => Err(RecordError::ElseWithoutIf),
        }
    }

    /// Open a `While`: pushes the wrapper and its body scope.
    pub fn while_(&mut self, cond: Cond) {
        self.blocks.push(OpenBlock::While { cond });
        self.scopes.push(Vec::new());
    }

    /// Close the innermost open block and append it to the enclosing scope.
    pub fn end(&mut self) -> Result<(), RecordError> {
        let block = self.blocks.pop().ok_or(RecordError::EndWithoutOpener)?;
        let scope = self.scopes.pop().expect("open block owns a scope");
        let stmt = match block {
            OpenBlock::If { cond, then: None } => {
                Stmt::If { cond, then: Some(Box::new(Stmt::Block(scope))), else_: None }
            }
            OpenBlock::If { cond, then: Some(t) } => Stmt::If {
                cond,
                then: Some(Box::new(t)),
                else_: Some(Box::new(Stmt::Block(scope))),
            },
            OpenBlock::While { cond } => {
                Stmt::While { cond, body: Some(Box::new(Stmt::Block(scope))) }
            }
        };
        self.stmt(stmt);
        Ok(())
    }

    /// Finish recording. Fails if any block is still open.
    pub fn finish(mut self) -> Result<Program, RecordError> {
        if !self.blocks.is_empty() {
            return Err(RecordError::UnclosedBlocks(self.blocks.len()));
        }
        debug_assert_eq!(self.scopes.len(), 1);
        Ok(Program { decls: self.decls, stmts: self.scopes.pop().unwrap_or_default() })
    }
}

// ============================================================================
// Condition/expression builders
// ============================================================================

/// Shorthand constructors for the control-program surface
/// (`AND`/`OR`/`NOT`, comparisons, arithmetic).
pub mod build {
    use super::*;

    pub fn get(global: &str) -> Expr {
        Expr::GetGlobal(global.to_string())
    }

    pub fn num(v: f64) -> Expr {
        Expr::Const(ExprConst::Num(v))
    }

    pub fn arith(op: ArithOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    pub fn add(lhs: Expr, rhs: Expr) -> Expr {
        arith(ArithOp::Add, lhs, rhs)
    }

    pub fn neg(e: Expr) -> Expr {
        Expr::Neg(Box::new(e))
    }

    pub fn and(a: Cond, b: Cond) -> Cond {
        Cond::And(Box::new(a), Box::new(b))
    }

    pub fn or(a: Cond, b: Cond) -> Cond {
        Cond::Or(Box::new(a), Box::new(b))
    }

    pub fn not(c: Cond) -> Cond {
        Cond::Not(Box::new(c))
    }

    pub fn cmp(op: CmpOp, lhs: Expr, rhs: Expr) -> Cond {
        Cond::Compare { op, lhs, rhs }
    }

    pub fn lt(lhs: Expr, rhs: Expr) -> Cond {
        cmp(CmpOp::Lt, lhs, rhs)
    }

    pub fn ge(lhs: Expr, rhs: Expr) -> Cond {
        cmp(CmpOp::Ge, lhs, rhs)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::build as b;
    use super::*;

    fn marker(n: &str) -> Stmt {
        Stmt::SetGlobal { global: n.to_string(), value: b::num(0.0) }
    }

    #[test]
    fn if_else_end_records_both_blocks_and_drains_stacks() {
        let mut r = Recorder::new();
        r.if_(Cond::Literal(true));
        r.stmt(marker("s1"));
        r.else_().unwrap();
        r.stmt(marker("s2"));
        r.end().unwrap();

        let p = r.finish().unwrap();
        assert_eq!(p.stmts.len(), 1);
        match &p.stmts[0] {
            Stmt::If { cond: Cond::Literal(true), then: Some(t), else_: Some(e) } => {
                assert_eq!(**t, Stmt::Block(vec![marker("s1")]));
                assert_eq!(**e, Stmt::Block(vec![marker("s2")]));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn if_without_else_leaves_else_empty() {
        let mut r = Recorder::new();
        r.if_(Cond::Literal(false));
        r.stmt(marker("only"));
        r.end().unwrap();
        let p = r.finish().unwrap();
        match &p.stmts[0] {
            Stmt::If { then: Some(_), else_: None, .. } => {}
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn nested_while_inside_if() {
        let mut r = Recorder::new();
        r.if_(Cond::Literal(true));
        r.while_(b::lt(b::get("g"), b::num(3.0)));
        r.stmt(marker("body"));
        r.end().unwrap(); // while
        r.end().unwrap(); // if
        let p = r.finish().unwrap();
        match &p.stmts[0] {
            Stmt::If { then: Some(t), .. } => match &**t {
                Stmt::Block(inner) => {
                    assert!(matches!(inner[0], Stmt::While { body: Some(_), .. }))
                }
                other => panic!("then is not a block: {other:?}"),
            },
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn unbalanced_end_is_malformed() {
        let mut r = Recorder::new();
        assert!(matches!(r.end(), Err(RecordError::EndWithoutOpener)));
    }

    #[test]
    fn else_outside_if_and_double_else_are_malformed() {
        let mut r = Recorder::new();
        assert!(matches!(r.else_(), Err(RecordError::ElseWithoutIf)));

        r.if_(Cond::Literal(true));
        r.else_().unwrap();
        assert!(matches!(r.else_(), Err(RecordError::DoubleElse)));

        let mut w = Recorder::new();
        w.while_(Cond::Literal(false));
        assert!(matches!(w.else_(), Err(RecordError::ElseWithoutIf)));
    }

    #[test]
    fn unclosed_block_fails_finish() {
        let mut r = Recorder::new();
        r.while_(Cond::Literal(true));
        assert!(matches!(r.finish(), Err(RecordError::UnclosedBlocks(1))));
    }

    #[test]
    fn expr_const_validator_accepts_exactly_bool_number_list() {
        let ok = serde_json::json!([1.0, true, [2, 3]]);
        assert_eq!(
            ExprConst::from_json(&ok),
            Some(ExprConst::List(vec![
                ExprConst::Num(1.0),
                ExprConst::Bool(true),
                ExprConst::List(vec![ExprConst::Num(2.0), ExprConst::Num(3.0)]),
            ]))
        );
        assert_eq!(ExprConst::from_json(&serde_json::json!("nope")), None);
        assert_eq!(ExprConst::from_json(&serde_json::json!({"a": 1})), None);
        assert_eq!(ExprConst::from_json(&serde_json::json!([1, "nope"])), None);
    }

    #[test]
    fn program_digest_is_stable_and_content_sensitive() {
        let mut r = Recorder::new();
        r.set_global("g", b::num(1.0));
        let p1 = r.finish().unwrap();
        let p2 = p1.clone();
        assert_eq!(p1.digest(), p2.digest());

        let mut r = Recorder::new();
        r.set_global("g", b::num(2.0));
        let p3 = r.finish().unwrap();
        assert_ne!(p1.digest(), p3.digest());
    }

    #[test]
    fn program_json_round_trip() {
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation { name: "cells".into(), shape: ShapeDecl::Flat { size: 10 } });
        r.for_each("step", "cells", None);
        r.while_(b::not(b::ge(b::get("t"), b::num(10.0))));
        r.for_each("step", "cells", None);
        r.end().unwrap();
        let p = r.finish().unwrap();

        let json = serde_json::to_string_pretty(&p).unwrap();
        let back: Program = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);
    }
}
