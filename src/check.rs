//! Semantic checker
//!
//! Pure pass from a specialized tree to a **typed** tree: every node comes
//! back with a concrete `ty`, widening [`ExprKind::Cast`]s inserted where
//! the coercion lattice allows them, and a domain error everywhere else.
//! The diagnostic text for lattice violations is exactly
//! `"invalid types: …"` — callers and tests rely on the prefix.
//!
//! Rules enforced here (the phase analyzer handles access modes):
//! - kernel signature: one Key-typed parameter, no return value; helpers
//!   carry annotated parameters and an optional return,
//! - `k.f` only when `k : Key(R)` and `f ∈ fields(R)`,
//! - off-center keys only through the `Affine` form (the specializer
//!   already reduced every macro to it; the checker verifies ranks line
//!   up),
//! - reductions use `+ − × ÷ min max` with a type-compatible target
//!   (`min`/`max` on scalars only),
//! - insertion records must cover the target schema exactly,
//! - integral literals adopt the width of the typed operand they meet;
//!   everything else follows the lattice, no narrowing, no bool↔number.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::HashMap;

use crate::ast::{
    BinOp, Builtin, Expr, ExprKind, FunKind, ReduceOp, Span, Stmt, StmtKind, UnaryOp,
};
use crate::relation::{Context, FunId};
use crate::specialize::{resolve_type_expr, SpecFun};
use crate::types::{Primitive, Scalar, Type};

// ============================================================================
// Errors
// ============================================================================

/// Lattice and structure violations. The `"invalid types"` prefix is part
/// of the contract.
#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    #[error("invalid types: {detail} (at {span})")]
    InvalidTypes { detail: String, span: Span },
    #[error("kernel {name:?} must not return a value (at {span})")]
    KernelReturns { name: String, span: Span },
    #[error("insert record does not match the schema of {rel:?}: {detail} (at {span})")]
    InsertSchema { rel: String, detail: String, span: Span },
}

impl TypeError {
    fn invalid(detail: impl Into<String>, span: Span) -> TypeError {
        TypeError::InvalidTypes { detail: detail.into(), span }
    }
}

/// Call-shape violations.
#[derive(Debug, thiserror::Error)]
pub enum ArityError {
    #[error("kernel {kernel:?} is declared over {declared:?} but launched over {launched:?}")]
    WrongRelation { kernel: String, declared: String, launched: String },
    #[error("helper {helper:?} expects {want} argument(s), got {got} (at {span})")]
    HelperCall { helper: String, want: usize, got: usize, span: Span },
}

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Arity(#[from] ArityError),
}

// ============================================================================
// Output
// ============================================================================

/// A fully typed function: `ty` is concrete on every node of `body`.
#[derive(Clone, Debug)]
pub struct TypedFun {
    pub name: String,
    pub kind: FunKind,
    pub params: Vec<(String, Type)>,
    pub ret: Type,
    pub body: Vec<Stmt>,
}

/// Type-check a specialized function.
pub fn check(ctx: &Context, fun: &SpecFun) -> Result<TypedFun, CheckError> {
    let mut ck = Checker {
        ctx,
        name: &fun.name,
        kind: fun.kind,
        params: &fun.params,
        ret: &fun.ret,
        scopes: vec![HashMap::new()],
    };
    let body = ck.block(&fun.body)?;
    Ok(TypedFun {
        name: fun.name.clone(),
        kind: fun.kind,
        params: fun.params.clone(),
        ret: fun.ret.clone(),
        body,
    })
}

/// Signature of a helper as seen from a call site, resolved from its raw
/// annotations without checking its body.
pub fn helper_signature(
    ctx: &Context,
    fun: FunId,
) -> Result<(Vec<Type>, Type), crate::specialize::SpecializeError> {
    let raw = ctx.function(fun);
    let mut params = Vec::with_capacity(raw.params.len());
    for p in &raw.params {
        let te = p.ty.as_ref().ok_or_else(|| {
            crate::specialize::SpecializeError::UntypedHelperParam { name: raw.name.clone() }
        })?;
        params.push(resolve_type_expr(ctx, te)?);
    }
    let ret = match &raw.ret {
        Some(te) => resolve_type_expr(ctx, te)?,
        None => Type::Void,
    };
    Ok((params, ret))
}

// ============================================================================
// The pass
// ============================================================================

struct Checker<'a> {
    ctx: &'a Context,
    name: &'a str,
    kind: FunKind,
    params: &'a [(String, Type)],
    ret: &'a Type,
    scopes: Vec<HashMap<String, Type>>,
}

/// Integral literal payload, if `e` is still width-less.
fn int_literal(e: &Expr) -> Option<i64> {
    match e.kind {
        ExprKind::Const(Scalar::Int(v)) => Some(v),
        _ => None,
    }
}

impl<'a> Checker<'a> {
    fn local_ty(&self, name: &str) -> Option<&Type> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    fn declare(&mut self, name: &str, ty: Type) {
        self.scopes.last_mut().expect("checker always has a scope").insert(name.to_string(), ty);
    }

    fn block(&mut self, stmts: &[Stmt]) -> Result<Vec<Stmt>, CheckError> {
        self.scopes.push(HashMap::new());
        let out: Result<Vec<_>, _> = stmts.iter().map(|s| self.stmt(s)).collect();
        self.scopes.pop();
        out
    }

    // ------------------------------------------------------------- coercion

    /// Coerce `e` to exactly `want`, inserting a widening cast or adopting
    /// a literal width. Fails with "invalid types" otherwise.
    fn coerce(&self, e: Expr, want: &Type) -> Result<Expr, CheckError> {
        if &e.ty == want {
            return Ok(e);
        }
        if let (Some(v), Type::Prim(p)) = (int_literal(&e), want) {
            if let Some(lit) = retype_int_literal(v, *p) {
                return Ok(Expr { kind: ExprKind::Const(lit), ty: want.clone(), span: e.span });
            }
        }
        match Type::join(&e.ty, want) {
            Some(j) if &j == want => {
                let span = e.span;
                Ok(Expr {
                    kind: ExprKind::Cast { to: want.clone(), expr: Box::new(e) },
                    ty: want.clone(),
                    span,
                })
            }
            _ => Err(TypeError::invalid(
                format!("cannot coerce {} to {}", e.ty, want),
                e.span,
            )
            .into()),
        }
    }

    /// Bring two scalar operands to a common type, letting an integral
    /// literal adopt the width of the other side.
    fn unify(&self, a: Expr, b: Expr, span: Span) -> Result<(Expr, Expr, Type), CheckError> {
        if a.ty == b.ty {
            let ty = a.ty.clone();
            return Ok((a, b, ty));
        }
        if int_literal(&a).is_some() && b.ty.is_numeric_scalar() {
            let ty = b.ty.clone();
            let a = self.coerce(a, &ty)?;
            return Ok((a, b, ty));
        }
        if int_literal(&b).is_some() && a.ty.is_numeric_scalar() {
            let ty = a.ty.clone();
            let b = self.coerce(b, &ty)?;
            return Ok((a, b, ty));
        }
        match Type::join(&a.ty, &b.ty) {
            Some(j) => {
                let a = self.coerce(a, &j)?;
                let b = self.coerce(b, &j)?;
                Ok((a, b, j))
            }
            None => Err(TypeError::invalid(format!("{} with {}", a.ty, b.ty), span).into()),
        }
    }

    // ----------------------------------------------------------- statements

    fn stmt(&mut self, s: &Stmt) -> Result<Stmt, CheckError> {
        let span = s.span;
        let kind = match &s.kind {
            StmtKind::Let { name, ty, init } => {
                let init = self.expr(init)?;
                if init.ty == Type::Void {
                    return Err(TypeError::invalid("binding a void value", span).into());
                }
                let (ty, init) = match ty {
                    Type::Unknown => {
                        // Width-less literals default to i64/f64.
                        (init.ty.clone(), init)
                    }
                    declared => {
                        let init = self.coerce(init, declared)?;
                        (declared.clone(), init)
                    }
                };
                self.declare(name, ty.clone());
                StmtKind::Let { name: name.clone(), ty, init }
            }
            StmtKind::AssignLocal { name, value } => {
                let want = self
                    .local_ty(name)
                    .cloned()
                    .expect("specializer resolved local assignments");
                let value = self.expr(value)?;
                let value = self.coerce(value, &want)?;
                StmtKind::AssignLocal { name: name.clone(), value }
            }
            StmtKind::FieldWrite { field, key, value } => {
                let key = self.key_expr(key, *field)?;
                let want = self.ctx.field(*field).ty.clone();
                let value = self.expr(value)?;
                let value = self.coerce(value, &want)?;
                StmtKind::FieldWrite { field: *field, key, value }
            }
            StmtKind::FieldReduce { field, key, op, value } => {
                let key = self.key_expr(key, *field)?;
                let want = self.ctx.field(*field).ty.clone();
                self.reducible(&want, *op, span)?;
                let value = self.expr(value)?;
                let value = self.coerce(value, &want)?;
                StmtKind::FieldReduce { field: *field, key, op: *op, value }
            }
            StmtKind::GlobalReduce { global, op, value } => {
                let want = self.ctx.global(*global).ty.clone();
                self.reducible(&want, *op, span)?;
                let value = self.expr(value)?;
                let value = self.coerce(value, &want)?;
                StmtKind::GlobalReduce { global: *global, op: *op, value }
            }
            StmtKind::If { cond, then, else_ } => {
                let cond = self.expr(cond)?;
                if !cond.ty.is_bool() {
                    return Err(TypeError::invalid(
                        format!("if condition is {}", cond.ty),
                        cond.span,
                    )
                    .into());
                }
                StmtKind::If { cond, then: self.block(then)?, else_: self.block(else_)? }
            }
            StmtKind::For { var, lo, hi, body } => {
                let lo = self.integral_scalar(lo)?;
                let hi = self.integral_scalar(hi)?;
                self.scopes.push(HashMap::new());
                self.declare(var, Type::Prim(Primitive::I64));
                let body: Result<Vec<_>, _> = body.iter().map(|s| self.stmt(s)).collect();
                self.scopes.pop();
                StmtKind::For { var: var.clone(), lo, hi, body: body? }
            }
            StmtKind::Expr(e) => StmtKind::Expr(self.expr(e)?),
            StmtKind::Insert { rel, fields } => {
                let relation = self.ctx.relation(*rel);
                let mut out = Vec::with_capacity(fields.len());
                let mut covered = Vec::new();
                for (fid, value) in fields {
                    if covered.contains(fid) {
                        return Err(TypeError::InsertSchema {
                            rel: relation.name.clone(),
                            detail: format!("field {:?} given twice", self.ctx.field(*fid).name),
                            span,
                        }
                        .into());
                    }
                    covered.push(*fid);
                    let want = self.ctx.field(*fid).ty.clone();
                    let value = self.expr(value)?;
                    out.push((*fid, self.coerce(value, &want)?));
                }
                for fid in &relation.fields {
                    let hidden = Some(*fid) == relation.live_mask;
                    if !hidden && !covered.contains(fid) {
                        return Err(TypeError::InsertSchema {
                            rel: relation.name.clone(),
                            detail: format!("missing field {:?}", self.ctx.field(*fid).name),
                            span,
                        }
                        .into());
                    }
                }
                StmtKind::Insert { rel: *rel, fields: out }
            }
            StmtKind::Delete { key } => {
                let key = self.expr(key)?;
                if !matches!(key.ty, Type::Key(_)) {
                    return Err(
                        TypeError::invalid(format!("delete of {}", key.ty), key.span).into()
                    );
                }
                StmtKind::Delete { key }
            }
            StmtKind::Return(value) => match (self.kind, value) {
                (FunKind::Kernel, Some(v)) => {
                    return Err(TypeError::KernelReturns {
                        name: self.name.to_string(),
                        span: v.span,
                    }
                    .into())
                }
                (FunKind::Kernel, None) => StmtKind::Return(None),
                (FunKind::Helper, None) => {
                    if *self.ret != Type::Void {
                        return Err(TypeError::invalid(
                            format!("helper returns {} but this return has no value", self.ret),
                            span,
                        )
                        .into());
                    }
                    StmtKind::Return(None)
                }
                (FunKind::Helper, Some(v)) => {
                    let v = self.expr(v)?;
                    let v = self.coerce(v, &self.ret.clone())?;
                    StmtKind::Return(Some(v))
                }
            },
        };
        Ok(Stmt { kind, span })
    }

    /// Reduction-operator/type compatibility: numeric targets for the
    /// arithmetic ops, numeric scalars for `min`/`max`.
    fn reducible(&self, target: &Type, op: ReduceOp, span: Span) -> Result<(), CheckError> {
        let ok = match op {
            ReduceOp::Add | ReduceOp::Sub | ReduceOp::Mul | ReduceOp::Div => {
                matches!(target.elem(), Some(p) if p.is_numeric())
            }
            ReduceOp::Min | ReduceOp::Max => target.is_numeric_scalar(),
        };
        if ok {
            Ok(())
        } else {
            Err(TypeError::invalid(format!("{} reduction into {}", op.name(), target), span)
                .into())
        }
    }

    /// Type the key side of a field access and verify it belongs to the
    /// field's relation.
    fn key_expr(&mut self, key: &Expr, field: crate::relation::FieldId) -> Result<Expr, CheckError> {
        let key = self.expr(key)?;
        let want = Type::Key(self.ctx.field(field).rel);
        if key.ty != want {
            return Err(TypeError::invalid(
                format!("field of {} accessed through {}", want, key.ty),
                key.span,
            )
            .into());
        }
        Ok(key)
    }

    fn integral_scalar(&mut self, e: &Expr) -> Result<Expr, CheckError> {
        let e = self.expr(e)?;
        if int_literal(&e).is_some() {
            return self.coerce(e, &Type::Prim(Primitive::I64));
        }
        match &e.ty {
            Type::Prim(p) if p.is_integral() => self.coerce(e, &Type::Prim(Primitive::I64)),
            other => Err(TypeError::invalid(format!("loop bound is {other}"), e.span).into()),
        }
    }

    // ----------------------------------------------------------- expressions

    fn expr(&mut self, e: &Expr) -> Result<Expr, CheckError> {
        let span = e.span;
        let (kind, ty) = match &e.kind {
            ExprKind::Const(s) => {
                let ty = match s {
                    Scalar::Bool(_) => Type::Prim(Primitive::Bool),
                    Scalar::Int(_) => Type::Prim(Primitive::I64),
                    Scalar::Uint(_) => Type::Prim(Primitive::U64),
                    Scalar::Float(_) => Type::Prim(Primitive::F64),
                };
                (e.kind.clone(), ty)
            }
            ExprKind::Param(i) => (e.kind.clone(), self.params[*i].1.clone()),
            ExprKind::Local(name) => {
                let ty =
                    self.local_ty(name).cloned().expect("specializer resolved local reads");
                (e.kind.clone(), ty)
            }
            ExprKind::GlobalRead(g) => (e.kind.clone(), self.ctx.global(*g).ty.clone()),
            ExprKind::FieldAccess { field, key } => {
                let key = self.key_expr(key, *field)?;
                let ty = self.ctx.field(*field).ty.clone();
                (ExprKind::FieldAccess { field: *field, key: Box::new(key) }, ty)
            }
            ExprKind::Affine { target, translation, base } => {
                let base = self.expr(base)?;
                let base_rank = match &base.ty {
                    Type::Key(r) => self.ctx.relation(*r).shape.bounds().len(),
                    other => {
                        return Err(TypeError::invalid(
                            format!("affine base is {other}"),
                            base.span,
                        )
                        .into())
                    }
                };
                let target_rank = self.ctx.relation(*target).shape.bounds().len();
                if base_rank != target_rank || translation.len() != target_rank {
                    return Err(TypeError::invalid(
                        format!(
                            "affine maps rank {base_rank} key into rank {target_rank} relation"
                        ),
                        span,
                    )
                    .into());
                }
                (
                    ExprKind::Affine {
                        target: *target,
                        translation: translation.clone(),
                        base: Box::new(base),
                    },
                    Type::Key(*target),
                )
            }
            ExprKind::UnsafeRow { rel, id } => {
                let id = self.expr(id)?;
                let id = if int_literal(&id).is_some() {
                    self.coerce(id, &Type::Prim(Primitive::U64))?
                } else {
                    match &id.ty {
                        Type::Prim(p) if p.is_integral() => {
                            self.coerce(id, &Type::Prim(Primitive::U64))?
                        }
                        other => {
                            return Err(TypeError::invalid(
                                format!("row id is {other}"),
                                id.span,
                            )
                            .into())
                        }
                    }
                };
                (ExprKind::UnsafeRow { rel: *rel, id: Box::new(id) }, Type::Key(*rel))
            }
            ExprKind::VectorLit(items) => {
                let items: Result<Vec<_>, _> = items.iter().map(|i| self.expr(i)).collect();
                let items = items?;
                if items.is_empty() || items.len() > crate::types::MAX_VECTOR_LEN as usize {
                    return Err(TypeError::invalid(
                        format!("vector literal of length {}", items.len()),
                        span,
                    )
                    .into());
                }
                // Fold a common element type; literals defer to typed items.
                let mut elem: Option<Primitive> = None;
                for it in &items {
                    if int_literal(it).is_some() {
                        continue;
                    }
                    let p = match &it.ty {
                        Type::Prim(p) if p.is_numeric() => *p,
                        other => {
                            return Err(TypeError::invalid(
                                format!("vector element is {other}"),
                                it.span,
                            )
                            .into())
                        }
                    };
                    elem = Some(match elem {
                        None => p,
                        Some(prev) => Primitive::join(prev, p).ok_or_else(|| {
                            TypeError::invalid(
                                format!("{} with {}", prev.name(), p.name()),
                                it.span,
                            )
                        })?,
                    });
                }
                let elem = elem.unwrap_or(Primitive::I64);
                let want = Type::Prim(elem);
                let items: Result<Vec<_>, _> =
                    items.into_iter().map(|it| self.coerce(it, &want)).collect();
                let items = items?;
                let len = items.len() as u8;
                (ExprKind::VectorLit(items), Type::Vector { elem, len })
            }
            ExprKind::Unary { op, expr } => {
                let expr = self.expr(expr)?;
                match op {
                    UnaryOp::Not => {
                        if !expr.ty.is_bool() {
                            return Err(TypeError::invalid(
                                format!("not of {}", expr.ty),
                                expr.span,
                            )
                            .into());
                        }
                        let ty = expr.ty.clone();
                        (ExprKind::Unary { op: *op, expr: Box::new(expr) }, ty)
                    }
                    UnaryOp::Neg => {
                        let ok = match expr.ty.elem() {
                            Some(p) => p.is_signed() || p.is_float(),
                            None => false,
                        };
                        if !ok {
                            return Err(TypeError::invalid(
                                format!("negation of {}", expr.ty),
                                expr.span,
                            )
                            .into());
                        }
                        let ty = expr.ty.clone();
                        (ExprKind::Unary { op: *op, expr: Box::new(expr) }, ty)
                    }
                }
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let lhs = self.expr(lhs)?;
                let rhs = self.expr(rhs)?;
                return self.binary(*op, lhs, rhs, span);
            }
            ExprKind::Index { base, indices } => {
                let base = self.expr(base)?;
                let indices: Result<Vec<_>, _> =
                    indices.iter().map(|i| self.expr(i)).collect();
                let indices: Result<Vec<_>, _> =
                    indices?.into_iter().map(|i| self.integral_index(i)).collect();
                let indices = indices?;
                let ty = match (&base.ty, indices.len()) {
                    (Type::Vector { elem, .. }, 1) => Type::Prim(*elem),
                    (Type::Matrix { elem, .. }, 2) => Type::Prim(*elem),
                    (other, n) => {
                        return Err(TypeError::invalid(
                            format!("indexing {other} with {n} subscript(s)"),
                            span,
                        )
                        .into())
                    }
                };
                (ExprKind::Index { base: Box::new(base), indices }, ty)
            }
            ExprKind::Builtin { builtin, args } => {
                let args: Result<Vec<_>, _> = args.iter().map(|a| self.expr(a)).collect();
                return self.builtin(*builtin, args?, span);
            }
            ExprKind::HelperCall { fun, args } => {
                let (want, ret) =
                    helper_signature(self.ctx, *fun).map_err(|e| -> CheckError {
                        TypeError::invalid(e.to_string(), span).into()
                    })?;
                let raw = self.ctx.function(*fun);
                if args.len() != want.len() {
                    return Err(ArityError::HelperCall {
                        helper: raw.name.clone(),
                        want: want.len(),
                        got: args.len(),
                        span,
                    }
                    .into());
                }
                let mut typed = Vec::with_capacity(args.len());
                for (a, w) in args.iter().zip(&want) {
                    let a = self.expr(a)?;
                    typed.push(self.coerce(a, w)?);
                }
                (ExprKind::HelperCall { fun: *fun, args: typed }, ret)
            }
            ExprKind::Cast { .. } => {
                unreachable!("casts are introduced by the checker, not before it")
            }
        };
        Ok(Expr { kind, ty, span })
    }

    fn integral_index(&self, i: Expr) -> Result<Expr, CheckError> {
        if int_literal(&i).is_some() {
            return self.coerce(i, &Type::Prim(Primitive::I64));
        }
        match &i.ty {
            Type::Prim(p) if p.is_integral() => self.coerce(i, &Type::Prim(Primitive::I64)),
            other => Err(TypeError::invalid(format!("subscript is {other}"), i.span).into()),
        }
    }

    fn binary(&mut self, op: BinOp, lhs: Expr, rhs: Expr, span: Span) -> Result<Expr, CheckError> {
        if op.is_logical() {
            if !lhs.ty.is_bool() || !rhs.ty.is_bool() {
                return Err(
                    TypeError::invalid(format!("{} with {}", lhs.ty, rhs.ty), span).into()
                );
            }
            return Ok(Expr {
                kind: ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
                ty: Type::Prim(Primitive::Bool),
                span,
            });
        }

        if op.is_comparison() {
            let ordered = matches!(op, BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge);
            // Literal adoption first, then the lattice families.
            let adopted = (int_literal(&lhs).is_some() && rhs.ty.is_numeric_scalar())
                || (int_literal(&rhs).is_some() && lhs.ty.is_numeric_scalar());
            let legal = if adopted {
                true
            } else if ordered {
                Type::ordered_pair(&lhs.ty, &rhs.ty)
            } else {
                Type::equality_pair(&lhs.ty, &rhs.ty)
            };
            if !legal {
                return Err(
                    TypeError::invalid(format!("{} with {}", lhs.ty, rhs.ty), span).into()
                );
            }
            let (lhs, rhs) = if lhs.ty == rhs.ty {
                (lhs, rhs)
            } else {
                let (l, r, _) = self.unify(lhs, rhs, span)?;
                (l, r)
            };
            return Ok(Expr {
                kind: ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
                ty: Type::Prim(Primitive::Bool),
                span,
            });
        }

        // Arithmetic. `^` is scalar-only and computes in f64.
        if op == BinOp::Pow {
            let f64t = Type::Prim(Primitive::F64);
            let numeric_scalar = |e: &Expr| e.ty.is_numeric_scalar() || int_literal(e).is_some();
            if !numeric_scalar(&lhs) || !numeric_scalar(&rhs) {
                return Err(
                    TypeError::invalid(format!("{} with {}", lhs.ty, rhs.ty), span).into()
                );
            }
            let lhs = self.coerce(lhs, &f64t)?;
            let rhs = self.coerce(rhs, &f64t)?;
            return Ok(Expr {
                kind: ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) },
                ty: f64t,
                span,
            });
        }

        let shape = (lhs.ty.clone(), rhs.ty.clone());
        let (lhs, rhs, ty) = match shape {
            // scalar ∘ scalar
            (Type::Prim(_), Type::Prim(_)) => {
                let (l, r, ty) = self.unify(lhs, rhs, span)?;
                match ty.elem() {
                    Some(p) if p.is_numeric() => (l, r, ty),
                    _ => {
                        return Err(TypeError::invalid(
                            format!("{} with {}", l.ty, r.ty),
                            span,
                        )
                        .into())
                    }
                }
            }
            // vector ∘ vector, matrix ∘ matrix (elementwise)
            (Type::Vector { .. }, Type::Vector { .. })
            | (Type::Matrix { .. }, Type::Matrix { .. }) => {
                match Type::join(&lhs.ty, &rhs.ty) {
                    Some(j) => {
                        let l = self.coerce(lhs, &j)?;
                        let r = self.coerce(rhs, &j)?;
                        (l, r, j)
                    }
                    None => {
                        return Err(TypeError::invalid(
                            format!("{} with {}", lhs.ty, rhs.ty),
                            span,
                        )
                        .into())
                    }
                }
            }
            // broadcast: scalar against vector/matrix
            (Type::Prim(_), Type::Vector { .. } | Type::Matrix { .. }) => {
                let (s, v) = (lhs, rhs);
                let (s, v, ty) = self.broadcast(s, v, span)?;
                (s, v, ty)
            }
            (Type::Vector { .. } | Type::Matrix { .. }, Type::Prim(_)) => {
                let (v, s) = (lhs, rhs);
                let (s, v, ty) = self.broadcast(s, v, span)?;
                (v, s, ty)
            }
            _ => {
                return Err(
                    TypeError::invalid(format!("{} with {}", lhs.ty, rhs.ty), span).into()
                )
            }
        };
        Ok(Expr { kind: ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }, ty, span })
    }

    /// Widen a scalar against a vector/matrix for elementwise arithmetic.
    /// Returns `(scalar, aggregate, result type)`.
    fn broadcast(
        &self,
        scalar: Expr,
        agg: Expr,
        span: Span,
    ) -> Result<(Expr, Expr, Type), CheckError> {
        let elem = agg.ty.elem().expect("aggregate operand");
        let sp = match &scalar.ty {
            _ if int_literal(&scalar).is_some() => elem,
            Type::Prim(p) if p.is_numeric() => *p,
            other => {
                return Err(TypeError::invalid(format!("{} with {}", other, agg.ty), span).into())
            }
        };
        let je = Primitive::join(sp, elem).ok_or_else(|| {
            TypeError::invalid(format!("{} with {}", scalar.ty, agg.ty), span)
        })?;
        let result = match &agg.ty {
            Type::Vector { len, .. } => Type::Vector { elem: je, len: *len },
            Type::Matrix { rows, cols, .. } => Type::Matrix { elem: je, rows: *rows, cols: *cols },
            _ => unreachable!("broadcast against a non-aggregate"),
        };
        let scalar = self.coerce(scalar, &Type::Prim(je))?;
        let agg = self.coerce(agg, &result)?;
        Ok((scalar, agg, result))
    }

    fn builtin(
        &mut self,
        b: Builtin,
        args: Vec<Expr>,
        span: Span,
    ) -> Result<Expr, CheckError> {
        let f64t = Type::Prim(Primitive::F64);
        let (args, ty) = match b {
            Builtin::Acos
            | Builtin::Asin
            | Builtin::Atan
            | Builtin::Cbrt
            | Builtin::Ceil
            | Builtin::Cos
            | Builtin::Fabs
            | Builtin::Floor
            | Builtin::Log
            | Builtin::Sin
            | Builtin::Sqrt
            | Builtin::Tan => {
                let a = self.numeric_to_f64(args.into_iter().next().expect("arity checked"))?;
                (vec![a], f64t)
            }
            Builtin::Fmod | Builtin::Pow | Builtin::Fmin | Builtin::Fmax => {
                let mut it = args.into_iter();
                let a = self.numeric_to_f64(it.next().expect("arity checked"))?;
                let c = self.numeric_to_f64(it.next().expect("arity checked"))?;
                (vec![a, c], f64t)
            }
            Builtin::Imin | Builtin::Imax => {
                let mut it = args.into_iter();
                let a = it.next().expect("arity checked");
                let c = it.next().expect("arity checked");
                let (a, c, ty) = self.unify(a, c, span)?;
                match ty.elem() {
                    Some(p) if p.is_integral() => {}
                    _ => {
                        return Err(TypeError::invalid(
                            format!("integer min/max of {ty}"),
                            span,
                        )
                        .into())
                    }
                }
                (vec![a, c], ty)
            }
            Builtin::Rand => (args, f64t),
            Builtin::Dot => {
                let mut it = args.into_iter();
                let a = it.next().expect("arity checked");
                let c = it.next().expect("arity checked");
                match (&a.ty, &c.ty) {
                    (
                        Type::Vector { len: la, .. },
                        Type::Vector { len: lb, .. },
                    ) if la == lb && *la <= 3 => {}
                    _ => {
                        return Err(TypeError::invalid(
                            format!("dot of {} and {}", a.ty, c.ty),
                            span,
                        )
                        .into())
                    }
                }
                let j = Type::join(&a.ty, &c.ty).ok_or_else(|| {
                    TypeError::invalid(format!("dot of {} and {}", a.ty, c.ty), span)
                })?;
                let elem = j.elem().expect("vector join");
                let a = self.coerce(a, &j)?;
                let c = self.coerce(c, &j)?;
                (vec![a, c], Type::Prim(elem))
            }
            Builtin::Assert => {
                let a = args.into_iter().next().expect("arity checked");
                if !a.ty.is_bool() {
                    return Err(
                        TypeError::invalid(format!("assert of {}", a.ty), a.span).into()
                    );
                }
                (vec![a], Type::Void)
            }
            Builtin::Id => {
                let a = args.into_iter().next().expect("arity checked");
                if !matches!(a.ty, Type::Key(_)) {
                    return Err(TypeError::invalid(format!("id of {}", a.ty), a.span).into());
                }
                (vec![a], Type::Prim(Primitive::I64))
            }
            Builtin::Xid | Builtin::Yid | Builtin::Zid => {
                let a = args.into_iter().next().expect("arity checked");
                let axis = match b {
                    Builtin::Xid => 0,
                    Builtin::Yid => 1,
                    _ => 2,
                };
                let rank = match &a.ty {
                    Type::Key(r) => self.ctx.relation(*r).shape.bounds().len(),
                    other => {
                        return Err(
                            TypeError::invalid(format!("axis of {other}"), a.span).into()
                        )
                    }
                };
                if axis >= rank {
                    return Err(TypeError::invalid(
                        format!("axis {axis} of a rank-{rank} key"),
                        a.span,
                    )
                    .into());
                }
                (vec![a], Type::Prim(Primitive::I64))
            }
            Builtin::Affine | Builtin::UnsafeRow => {
                unreachable!("specializer reduces these to core forms")
            }
        };
        Ok(Expr { kind: ExprKind::Builtin { builtin: b, args }, ty, span })
    }

    fn numeric_to_f64(&self, e: Expr) -> Result<Expr, CheckError> {
        if int_literal(&e).is_some() || e.ty.is_numeric_scalar() {
            self.coerce(e, &Type::Prim(Primitive::F64))
        } else {
            Err(TypeError::invalid(format!("math builtin applied to {}", e.ty), e.span).into())
        }
    }
}

fn retype_int_literal(v: i64, p: Primitive) -> Option<Scalar> {
    match p {
        Primitive::I8 | Primitive::I16 | Primitive::I32 | Primitive::I64 => Some(Scalar::Int(v)),
        Primitive::U8 | Primitive::U16 | Primitive::U32 | Primitive::U64 => {
            u64::try_from(v).ok().map(Scalar::Uint)
        }
        Primitive::F32 | Primitive::F64 => Some(Scalar::Float(v as f64)),
        Primitive::Bool => None,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build as b;
    use crate::ast::TypeExpr;
    use crate::relation::Context;
    use crate::specialize::{specialize, HostEnv};
    use crate::types::Scalar;

    fn checked(
        ctx: &Context,
        fun: &crate::ast::RawFunction,
        domain: crate::relation::RelationId,
    ) -> Result<TypedFun, CheckError> {
        let sp = specialize(ctx, &HostEnv::new(), fun, Some(domain)).unwrap();
        check(ctx, &sp)
    }

    fn err_text(e: CheckError) -> String {
        e.to_string()
    }

    #[test]
    fn centered_increment_types_with_literal_adoption() {
        let mut ctx = Context::new();
        let r = ctx.new_relation(10, "rows").unwrap();
        ctx.new_field(r, "x", Type::Prim(Primitive::I32)).unwrap();

        // v.x = v.x + 1  — the literal 1 adopts i32.
        let fun = b::kernel(
            "bump",
            "v",
            vec![b::assign(
                b::member(b::name("v"), "x"),
                b::binary(BinOp::Add, b::member(b::name("v"), "x"), b::num(1.0)),
            )],
        );
        let tf = checked(&ctx, &fun, r).unwrap();
        match &tf.body[0].kind {
            StmtKind::FieldWrite { value, .. } => {
                assert_eq!(value.ty, Type::Prim(Primitive::I32));
                match &value.kind {
                    ExprKind::Binary { rhs, .. } => {
                        assert_eq!(rhs.kind, ExprKind::Const(Scalar::Int(1)));
                        assert_eq!(rhs.ty, Type::Prim(Primitive::I32));
                    }
                    other => panic!("not a binary: {other:?}"),
                }
            }
            other => panic!("not a field write: {other:?}"),
        }
    }

    #[test]
    fn well_typed_comparisons_check_in_every_ordered_family() {
        let mut ctx = Context::new();
        let r = ctx.new_relation(4, "r").unwrap();
        for (name, p) in
            [("a", Primitive::I32), ("b", Primitive::U16), ("c", Primitive::F64)]
        {
            ctx.new_field(r, name, Type::Prim(p)).unwrap();
        }
        for field in ["a", "b", "c"] {
            for op in [BinOp::Lt, BinOp::Le, BinOp::Gt, BinOp::Ge, BinOp::Eq, BinOp::Ne] {
                let fun = b::kernel(
                    "cmp",
                    "k",
                    vec![b::let_(
                        "t",
                        b::binary(
                            op,
                            b::member(b::name("k"), field),
                            b::member(b::name("k"), field),
                        ),
                    )],
                );
                let tf = checked(&ctx, &fun, r).unwrap();
                match &tf.body[0].kind {
                    StmtKind::Let { ty, .. } => assert_eq!(*ty, Type::Prim(Primitive::Bool)),
                    other => panic!("not a let: {other:?}"),
                }
            }
        }
    }

    #[test]
    fn cross_family_operands_raise_invalid_types() {
        let mut ctx = Context::new();
        let r = ctx.new_relation(4, "r").unwrap();
        ctx.new_field(r, "i", Type::Prim(Primitive::I32)).unwrap();
        ctx.new_field(r, "u", Type::Prim(Primitive::U32)).unwrap();
        ctx.new_field(r, "h", Type::Prim(Primitive::F32)).unwrap();

        // Every arithmetic and comparison node over (i32, u32) fails.
        for op in [
            BinOp::Add,
            BinOp::Sub,
            BinOp::Mul,
            BinOp::Div,
            BinOp::Mod,
            BinOp::Lt,
            BinOp::Le,
            BinOp::Gt,
            BinOp::Ge,
            BinOp::Eq,
            BinOp::Ne,
        ] {
            let fun = b::kernel(
                "mix",
                "k",
                vec![b::let_(
                    "t",
                    b::binary(op, b::member(b::name("k"), "i"), b::member(b::name("k"), "u")),
                )],
            );
            let msg = err_text(checked(&ctx, &fun, r).unwrap_err());
            assert!(msg.starts_with("invalid types"), "unexpected message: {msg}");
        }

        // int with f32 is also not a family (ints only promote to f64).
        let fun = b::kernel(
            "mix2",
            "k",
            vec![b::let_(
                "t",
                b::binary(
                    BinOp::Add,
                    b::member(b::name("k"), "i"),
                    b::member(b::name("k"), "h"),
                ),
            )],
        );
        let msg = err_text(checked(&ctx, &fun, r).unwrap_err());
        assert!(msg.starts_with("invalid types"), "unexpected message: {msg}");
    }

    #[test]
    fn comparing_number_with_bool_raises_invalid_types() {
        let mut ctx = Context::new();
        let r = ctx.new_relation(4, "r").unwrap();
        ctx.new_field(r, "flag", Type::Prim(Primitive::Bool)).unwrap();
        ctx.new_field(r, "x", Type::Prim(Primitive::F64)).unwrap();

        for op in [BinOp::Lt, BinOp::Eq] {
            let fun = b::kernel(
                "nb",
                "k",
                vec![b::let_(
                    "t",
                    b::binary(
                        op,
                        b::member(b::name("k"), "x"),
                        b::member(b::name("k"), "flag"),
                    ),
                )],
            );
            let msg = err_text(checked(&ctx, &fun, r).unwrap_err());
            assert!(msg.starts_with("invalid types"), "unexpected message: {msg}");
        }
    }

    #[test]
    fn pow_on_a_vector_operand_raises_invalid_types() {
        let mut ctx = Context::new();
        let r = ctx.new_relation(4, "r").unwrap();
        ctx.new_field(r, "v", Type::Vector { elem: Primitive::F64, len: 3 }).unwrap();

        let fun = b::kernel(
            "p",
            "k",
            vec![b::let_(
                "t",
                b::binary(BinOp::Pow, b::member(b::name("k"), "v"), b::num(2.0)),
            )],
        );
        let msg = err_text(checked(&ctx, &fun, r).unwrap_err());
        assert!(msg.starts_with("invalid types"), "unexpected message: {msg}");
    }

    #[test]
    fn comparing_vectors_raises_invalid_types() {
        let mut ctx = Context::new();
        let r = ctx.new_relation(4, "r").unwrap();
        ctx.new_field(r, "v", Type::Vector { elem: Primitive::F64, len: 2 }).unwrap();
        let fun = b::kernel(
            "vc",
            "k",
            vec![b::let_(
                "t",
                b::binary(BinOp::Lt, b::member(b::name("k"), "v"), b::member(b::name("k"), "v")),
            )],
        );
        let msg = err_text(checked(&ctx, &fun, r).unwrap_err());
        assert!(msg.starts_with("invalid types"), "unexpected message: {msg}");
    }

    #[test]
    fn no_implicit_narrowing_into_fields() {
        let mut ctx = Context::new();
        let r = ctx.new_relation(4, "r").unwrap();
        ctx.new_field(r, "i", Type::Prim(Primitive::I32)).unwrap();
        ctx.new_field(r, "d", Type::Prim(Primitive::F64)).unwrap();

        // k.i = k.d is a narrowing write.
        let fun = b::kernel(
            "nar",
            "k",
            vec![b::assign(b::member(b::name("k"), "i"), b::member(b::name("k"), "d"))],
        );
        let msg = err_text(checked(&ctx, &fun, r).unwrap_err());
        assert!(msg.starts_with("invalid types"), "unexpected message: {msg}");
    }

    #[test]
    fn vector_broadcast_and_dot_type_correctly() {
        let mut ctx = Context::new();
        let r = ctx.new_relation(4, "r").unwrap();
        ctx.new_field(r, "v", Type::Vector { elem: Primitive::F64, len: 3 }).unwrap();

        // 2 * k.v : vec3(f64); dot(k.v, k.v) : f64
        let fun = b::kernel(
            "bv",
            "k",
            vec![
                b::let_("s", b::binary(BinOp::Mul, b::num(2.0), b::member(b::name("k"), "v"))),
                b::let_(
                    "d",
                    b::call(
                        b::name("dot"),
                        vec![b::member(b::name("k"), "v"), b::member(b::name("k"), "v")],
                    ),
                ),
            ],
        );
        let tf = checked(&ctx, &fun, r).unwrap();
        match &tf.body[0].kind {
            StmtKind::Let { ty, .. } => {
                assert_eq!(*ty, Type::Vector { elem: Primitive::F64, len: 3 })
            }
            other => panic!("not a let: {other:?}"),
        }
        match &tf.body[1].kind {
            StmtKind::Let { ty, .. } => assert_eq!(*ty, Type::Prim(Primitive::F64)),
            other => panic!("not a let: {other:?}"),
        }
    }

    #[test]
    fn global_reduce_requires_compatible_op() {
        let mut ctx = Context::new();
        let r = ctx.new_relation(4, "r").unwrap();
        ctx.new_global("g", Type::Prim(Primitive::F64), crate::ir::ExprConst::Num(0.0))
            .unwrap();
        ctx.new_global("flag", Type::Prim(Primitive::Bool), crate::ir::ExprConst::Bool(false))
            .unwrap();

        let ok = b::kernel(
            "acc",
            "k",
            vec![b::reduce(b::name("g"), ReduceOp::Add, b::num(1.0))],
        );
        checked(&ctx, &ok, r).unwrap();

        let bad = b::kernel(
            "accb",
            "k",
            vec![b::reduce(b::name("flag"), ReduceOp::Add, b::boolean(true))],
        );
        let msg = err_text(checked(&ctx, &bad, r).unwrap_err());
        assert!(msg.starts_with("invalid types"), "unexpected message: {msg}");
    }

    #[test]
    fn helper_calls_check_arity_and_coerce_arguments() {
        let mut ctx = Context::new();
        let r = ctx.new_relation(4, "r").unwrap();
        ctx.new_field(r, "x", Type::Prim(Primitive::F64)).unwrap();
        ctx.new_function(b::helper(
            "square",
            vec![("v", TypeExpr::Prim(Primitive::F64))],
            Some(TypeExpr::Prim(Primitive::F64)),
            vec![b::ret(Some(b::binary(BinOp::Mul, b::name("v"), b::name("v"))))],
        ))
        .unwrap();

        let ok = b::kernel(
            "use",
            "k",
            vec![b::assign(
                b::member(b::name("k"), "x"),
                b::call(b::name("square"), vec![b::num(3.0)]),
            )],
        );
        checked(&ctx, &ok, r).unwrap();

        let bad = b::kernel(
            "use2",
            "k",
            vec![b::let_("t", b::call(b::name("square"), vec![b::num(1.0), b::num(2.0)]))],
        );
        assert!(matches!(
            checked(&ctx, &bad, r),
            Err(CheckError::Arity(ArityError::HelperCall { want: 1, got: 2, .. }))
        ));
    }

    #[test]
    fn kernel_with_a_return_value_is_rejected() {
        let mut ctx = Context::new();
        let r = ctx.new_relation(4, "r").unwrap();
        let fun = b::kernel("retk", "k", vec![b::ret(Some(b::num(1.0)))]);
        assert!(matches!(
            checked(&ctx, &fun, r),
            Err(CheckError::Type(TypeError::KernelReturns { .. }))
        ));
    }

    #[test]
    fn insert_schema_must_be_covered_exactly() {
        let mut ctx = Context::new();
        let src = ctx.new_relation(4, "src").unwrap();
        let dst = ctx.new_relation(4, "dst").unwrap();
        ctx.new_field(dst, "a", Type::Prim(Primitive::F64)).unwrap();
        ctx.new_field(dst, "c", Type::Prim(Primitive::I32)).unwrap();
        ctx.make_elastic(dst).unwrap();

        let ok = b::kernel(
            "ins",
            "k",
            vec![b::insert(b::name("dst"), vec![("a", b::num(1.0)), ("c", b::num(2.0))])],
        );
        checked(&ctx, &ok, src).unwrap();

        let missing = b::kernel(
            "ins2",
            "k",
            vec![b::insert(b::name("dst"), vec![("a", b::num(1.0))])],
        );
        assert!(matches!(
            checked(&ctx, &missing, src),
            Err(CheckError::Type(TypeError::InsertSchema { .. }))
        ));
    }

    #[test]
    fn numeric_for_bounds_must_be_integral() {
        let mut ctx = Context::new();
        let r = ctx.new_relation(4, "r").unwrap();
        ctx.new_field(r, "x", Type::Prim(Primitive::F64)).unwrap();

        let ok = b::kernel(
            "loop",
            "k",
            vec![b::for_(
                "i",
                b::num(0.0),
                b::num(4.0),
                vec![b::reduce(b::member(b::name("k"), "x"), ReduceOp::Add, b::num(1.0))],
            )],
        );
        checked(&ctx, &ok, r).unwrap();

        let bad = b::kernel("loop2", "k", vec![b::for_("i", b::num(0.5), b::num(4.0), vec![])]);
        let msg = err_text(checked(&ctx, &bad, r).unwrap_err());
        assert!(msg.starts_with("invalid types"), "unexpected message: {msg}");
    }
}
