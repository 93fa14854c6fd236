//! Phase analysis
//!
//! For one typed kernel, compute how every field and global is touched —
//! `{read, write, reduce-with-op}` — and prove the kernel data-race-free
//! under the parallel-per-key execution contract:
//!
//! - a **write** must go through the kernel parameter itself (centered);
//!   writing through any other key is a [`StencilError`],
//! - `read ∧ write` on one field is legal only when *every* access to that
//!   field is centered (distinct keys then touch distinct rows),
//! - `write` and `reduce` never mix on one field, and a field or global is
//!   reduced with at most one operator,
//! - a global is *either* read *or* reduced, never both,
//! - reductions may scatter (non-centered keys are fine): the operator is
//!   associative-commutative and the runtime may partially reduce,
//! - `delete` is centered; `insert` targets some other relation, whose
//!   rows this kernel cannot otherwise touch.
//!
//! Helpers are pure over their arguments: a helper body that touches a
//! field or global, or inserts/deletes, is rejected here, which is what
//! lets helper tasks carry no region privileges.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::BTreeMap;

use crate::ast::{Expr, ExprKind, ReduceOp, Span, Stmt, StmtKind};
use crate::check::TypedFun;
use crate::relation::{Context, FieldId, GlobalId, RelationId};

// ============================================================================
// Errors
// ============================================================================

/// Illegal off-center patterns.
#[derive(Debug, thiserror::Error)]
pub enum StencilError {
    #[error("affine matrix must be rank x rank+1 for a rank-{rank} relation (at {span})")]
    BadAffineShape { rank: usize, span: Span },
    #[error("affine rotation part must be the identity (at {span})")]
    NonDiagonalAffine { span: Span },
    #[error("write through a non-centered key (at {span})")]
    NonCenteredWrite { span: Span },
    #[error("delete through a non-centered key (at {span})")]
    NonCenteredDelete { span: Span },
}

/// Race-freedom violations.
#[derive(Debug, thiserror::Error)]
pub enum PhaseError {
    #[error("field {field:?} is both written and read through off-center keys (at {span})")]
    ReadWriteNotCentered { field: String, span: Span },
    #[error("field {field:?} is both written and reduced (at {span})")]
    WriteAndReduce { field: String, span: Span },
    #[error("{target:?} reduced with both {first} and {second} (at {span})")]
    ConflictingReduceOps { target: String, first: &'static str, second: &'static str, span: Span },
    #[error("global {global:?} is both read and reduced (at {span})")]
    GlobalReadAndReduce { global: String, span: Span },
    #[error("kernel inserts into {rel:?} and also accesses its fields (at {span})")]
    InsertAliasesAccess { rel: String, span: Span },
    #[error("helper {helper:?} touches fields, globals, or relation sizes")]
    HelperTouchesState { helper: String },
    #[error(transparent)]
    Stencil(#[from] StencilError),
}

// ============================================================================
// Results
// ============================================================================

/// Access modes of one field or global within one kernel.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PhaseType {
    pub read: bool,
    pub write: bool,
    pub reduceop: Option<ReduceOp>,
    /// All accesses so far went through the kernel parameter.
    pub centered: bool,
}

/// Everything the lowerer needs to emit privileges for one kernel.
#[derive(Clone, Debug, Default)]
pub struct PhaseResult {
    /// Deterministic iteration order matters for emitted signatures.
    pub field_use: BTreeMap<FieldId, PhaseType>,
    pub global_use: BTreeMap<GlobalId, PhaseType>,
    /// Relations this kernel inserts into.
    pub inserts: Vec<RelationId>,
    /// Set iff the kernel deletes its own keys.
    pub deletes: Option<RelationId>,
    /// No access anywhere went through an off-center key.
    pub is_centered: bool,
}

impl PhaseResult {
    /// The single reduced global, if the kernel reduces exactly one.
    pub fn reduced_global(&self) -> Option<(GlobalId, ReduceOp)> {
        let mut found = None;
        for (g, pt) in &self.global_use {
            if let Some(op) = pt.reduceop {
                if found.is_some() {
                    return None;
                }
                found = Some((*g, op));
            }
        }
        found
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Access {
    Read,
    Write,
    Reduce(ReduceOp),
}

/// Analyze a typed kernel against the relation it is launched over.
pub fn analyze(ctx: &Context, fun: &TypedFun, domain: RelationId) -> Result<PhaseResult, PhaseError> {
    let mut an = Analyzer { ctx, domain, out: PhaseResult { is_centered: true, ..Default::default() } };
    for s in &fun.body {
        an.stmt(s)?;
    }
    an.finish()
}

/// Require an empty phase for a helper body (helpers are pure).
pub fn require_pure(ctx: &Context, fun: &TypedFun) -> Result<(), PhaseError> {
    // Helpers have no centered relation; analyze against a dummy domain and
    // demand that nothing was touched.
    let mut an = Analyzer {
        ctx,
        domain: RelationId(usize::MAX),
        out: PhaseResult { is_centered: true, ..Default::default() },
    };
    for s in &fun.body {
        an.stmt(s)?;
    }
    let out = an.out;
    if !out.field_use.is_empty()
        || !out.global_use.is_empty()
        || !out.inserts.is_empty()
        || out.deletes.is_some()
    {
        return Err(PhaseError::HelperTouchesState { helper: fun.name.clone() });
    }
    Ok(())
}

// ============================================================================
// The pass
// ============================================================================

struct Analyzer<'a> {
    ctx: &'a Context,
    domain: RelationId,
    out: PhaseResult,
}

/// A key expression is centered iff it is syntactically the parameter.
fn is_centered_key(key: &Expr) -> bool {
    matches!(key.kind, ExprKind::Param(_))
}

impl<'a> Analyzer<'a> {
    fn finish(self) -> Result<PhaseResult, PhaseError> {
        let out = self.out;
        // read ∧ write legality needs the per-field view, not just the
        // kernel-wide flag.
        for (fid, pt) in &out.field_use {
            if pt.read && pt.write && !pt.centered {
                return Err(PhaseError::ReadWriteNotCentered {
                    field: self.ctx.field(*fid).name.clone(),
                    span: Span::none(),
                });
            }
        }
        // A kernel may not insert into a relation whose columns it reads or
        // writes: the tail region it appends to aliases them.
        for rel in &out.inserts {
            if out.field_use.keys().any(|f| self.ctx.field(*f).rel == *rel) {
                return Err(PhaseError::InsertAliasesAccess {
                    rel: self.ctx.relation(*rel).name.clone(),
                    span: Span::none(),
                });
            }
        }
        Ok(out)
    }

    fn field_access(
        &mut self,
        field: FieldId,
        access: Access,
        centered: bool,
        span: Span,
    ) -> Result<(), PhaseError> {
        if !centered {
            self.out.is_centered = false;
        }
        if matches!(access, Access::Write) && !centered {
            return Err(StencilError::NonCenteredWrite { span }.into());
        }
        let name = self.ctx.field(field).name.clone();
        let pt = self
            .out
            .field_use
            .entry(field)
            .or_insert(PhaseType { centered: true, ..Default::default() });
        pt.centered &= centered;
        match access {
            Access::Read => pt.read = true,
            Access::Write => {
                if pt.reduceop.is_some() {
                    return Err(PhaseError::WriteAndReduce { field: name, span });
                }
                pt.write = true;
            }
            Access::Reduce(op) => {
                if pt.write {
                    return Err(PhaseError::WriteAndReduce { field: name, span });
                }
                match pt.reduceop {
                    None => pt.reduceop = Some(op),
                    Some(prev) if prev == op => {}
                    Some(prev) => {
                        return Err(PhaseError::ConflictingReduceOps {
                            target: name,
                            first: prev.name(),
                            second: op.name(),
                            span,
                        })
                    }
                }
            }
        }
        Ok(())
    }

    fn global_access(
        &mut self,
        global: GlobalId,
        access: Access,
        span: Span,
    ) -> Result<(), PhaseError> {
        let name = self.ctx.global(global).name.clone();
        let pt = self
            .out
            .global_use
            .entry(global)
            .or_insert(PhaseType { centered: true, ..Default::default() });
        match access {
            Access::Read => {
                if pt.reduceop.is_some() {
                    return Err(PhaseError::GlobalReadAndReduce { global: name, span });
                }
                pt.read = true;
            }
            Access::Reduce(op) => {
                if pt.read {
                    return Err(PhaseError::GlobalReadAndReduce { global: name, span });
                }
                match pt.reduceop {
                    None => pt.reduceop = Some(op),
                    Some(prev) if prev == op => {}
                    Some(prev) => {
                        return Err(PhaseError::ConflictingReduceOps {
                            target: name,
                            first: prev.name(),
                            second: op.name(),
                            span,
                        })
                    }
                }
            }
            Access::Write => unreachable!("kernels cannot write globals"),
        }
        Ok(())
    }

    fn stmt(&mut self, s: &Stmt) -> Result<(), PhaseError> {
        match &s.kind {
            StmtKind::Let { init, .. } => self.expr(init),
            StmtKind::AssignLocal { value, .. } => self.expr(value),
            StmtKind::FieldWrite { field, key, value } => {
                self.expr(value)?;
                self.key(key)?;
                self.field_access(*field, Access::Write, is_centered_key(key), s.span)
            }
            StmtKind::FieldReduce { field, key, op, value } => {
                self.expr(value)?;
                self.key(key)?;
                self.field_access(*field, Access::Reduce(*op), is_centered_key(key), s.span)
            }
            StmtKind::GlobalReduce { global, op, value } => {
                self.expr(value)?;
                self.global_access(*global, Access::Reduce(*op), s.span)
            }
            StmtKind::If { cond, then, else_ } => {
                self.expr(cond)?;
                for t in then.iter().chain(else_) {
                    self.stmt(t)?;
                }
                Ok(())
            }
            StmtKind::For { lo, hi, body, .. } => {
                self.expr(lo)?;
                self.expr(hi)?;
                for t in body {
                    self.stmt(t)?;
                }
                Ok(())
            }
            StmtKind::Expr(e) => self.expr(e),
            StmtKind::Insert { rel, fields } => {
                for (_, v) in fields {
                    self.expr(v)?;
                }
                if !self.out.inserts.contains(rel) {
                    self.out.inserts.push(*rel);
                }
                Ok(())
            }
            StmtKind::Delete { key } => {
                if !is_centered_key(key) {
                    return Err(StencilError::NonCenteredDelete { span: key.span }.into());
                }
                self.out.deletes = Some(self.domain);
                Ok(())
            }
            StmtKind::Return(v) => v.as_ref().map_or(Ok(()), |e| self.expr(e)),
        }
    }

    /// Walk a key expression without recording a field access for it; the
    /// caller records the access it reaches through this key.
    fn key(&mut self, key: &Expr) -> Result<(), PhaseError> {
        match &key.kind {
            ExprKind::Affine { base, .. } => self.key(base),
            ExprKind::UnsafeRow { id, .. } => self.expr(id),
            ExprKind::FieldAccess { field, key: inner } => {
                // Key-valued field read used as a key.
                self.key(inner)?;
                self.field_access(*field, Access::Read, is_centered_key(inner), key.span)
            }
            _ => Ok(()),
        }
    }

    fn expr(&mut self, e: &Expr) -> Result<(), PhaseError> {
        match &e.kind {
            ExprKind::FieldAccess { field, key } => {
                self.key(key)?;
                self.field_access(*field, Access::Read, is_centered_key(key), e.span)
            }
            ExprKind::GlobalRead(g) => self.global_access(*g, Access::Read, e.span),
            ExprKind::Affine { base, .. } => {
                // A bare affine key marks the kernel as a stencil even
                // before it reaches any field.
                self.out.is_centered = false;
                self.key(base)
            }
            ExprKind::UnsafeRow { id, .. } => self.expr(id),
            ExprKind::VectorLit(items) => items.iter().try_for_each(|i| self.expr(i)),
            ExprKind::Unary { expr, .. } | ExprKind::Cast { expr, .. } => self.expr(expr),
            ExprKind::Binary { lhs, rhs, .. } => {
                self.expr(lhs)?;
                self.expr(rhs)
            }
            ExprKind::Index { base, indices } => {
                self.expr(base)?;
                indices.iter().try_for_each(|i| self.expr(i))
            }
            ExprKind::Builtin { args, .. } | ExprKind::HelperCall { args, .. } => {
                args.iter().try_for_each(|a| self.expr(a))
            }
            ExprKind::Const(_) | ExprKind::Param(_) | ExprKind::Local(_) => Ok(()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
