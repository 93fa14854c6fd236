//! Specializer: raw trees → resolved trees
//!
//! Resolves every free identifier of a raw kernel/helper against the
//! explicit host environment (the [`Context`] name table plus captured
//! constants), expands relation macros into core forms, and fixes the
//! relation identity of the kernel parameter. After this pass the tree
//! contains no names the checker cannot type locally.
//!
//! Resolution order for a bare name: function parameter, enclosing local,
//! captured host constant, context name (global/relation/function/subset),
//! builtin. Relations, subsets and functions are not values; they are only
//! legal in the positions that consume them (`Affine`, `UNSAFE_ROW`,
//! `insert … into`, call position).
//!
//! Macro expansion is a plain AST rewrite:
//! - `k.xid`/`yid`/`zid` → axis extractor builtins,
//! - `k.center` → vector of `origin + (axis + 0.5) · width`,
//! - `k.xneg_depth`/… → `imax(n_bd − axis, 0)` forms,
//! - `k.in_boundary`/`in_interior` → per-axis comparison chains,
//! - link members (`cell.vertex`, …) → zero-translation [`ExprKind::Affine`]
//!   into the sibling relation,
//! - neighbor calls `c(dx,dy[,dz])` → [`ExprKind::Affine`] with the literal
//!   translation.
//!
//! The affine rotation part must be the (padded) identity; anything else is
//! a [`StencilError`] at this stage, before the checker ever sees the tree.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::HashMap;

use crate::ast::{
    BinOp, Builtin, Expr, ExprKind, FunKind, RawExpr, RawExprKind, RawFunction, RawStmt,
    RawStmtKind, ReduceOp, Span, Stmt, StmtKind, TypeExpr,
};
use crate::phase::StencilError;
use crate::relation::{Context, Named, RelationId};
use crate::types::{Scalar, Type};

// ============================================================================
// Host environment
// ============================================================================

/// Constants captured from the host at kernel-declaration time, passed
/// explicitly (no ambient scope).
#[derive(Default, Debug, Clone)]
pub struct HostEnv {
    consts: HashMap<String, Scalar>,
}

impl HostEnv {
    pub fn new() -> HostEnv {
        HostEnv::default()
    }

    pub fn define_const(&mut self, name: &str, value: Scalar) {
        self.consts.insert(name.to_string(), value);
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SpecializeError {
    #[error("unbound name {name:?} at {span}")]
    Unbound { name: String, span: Span },
    #[error("{name:?} is not callable (at {span})")]
    NotCallable { name: String, span: Span },
    #[error("{name:?} is not a value (at {span})")]
    NotAValue { name: String, span: Span },
    #[error("{what} expects {want} argument(s), got {got} (at {span})")]
    WrongArity { what: String, want: usize, got: usize, span: Span },
    #[error("kernel {name:?} must take exactly one entity parameter (has {got})")]
    KernelSignature { name: String, got: usize },
    #[error("helper {name:?} parameters must be type-annotated")]
    UntypedHelperParam { name: String },
    #[error("neighbor offsets must be integer literals (at {span})")]
    NonIntegerOffset { span: Span },
    #[error("offset call requires a grid key of known relation (at {span})")]
    CannotOffset { span: Span },
    #[error("relation {rel:?} has no field or macro named {name:?} (at {span})")]
    UnknownMember { rel: String, name: String, span: Span },
    #[error("member access on a non-key value (at {span})")]
    MemberOnNonKey { span: Span },
    #[error("target is not assignable (at {span})")]
    NotAssignable { span: Span },
    #[error("min=/max= requires a field or global target (at {span})")]
    LocalMinMax { span: Span },
    #[error("insert requires a relation name (at {span})")]
    InsertTarget { span: Span },
    #[error("expected a relation name (at {span})")]
    ExpectedRelation { span: Span },
    #[error(transparent)]
    Stencil(#[from] StencilError),
}

// ============================================================================
// Output
// ============================================================================

/// A specialized function: resolved body plus annotated signature. The
/// checker turns this into a fully typed tree.
#[derive(Clone, Debug)]
pub struct SpecFun {
    pub name: String,
    pub kind: FunKind,
    pub params: Vec<(String, Type)>,
    pub ret: Type,
    pub body: Vec<Stmt>,
}

/// Specialize `fun` against `ctx`/`env`. Kernels need the launch relation
/// (`domain`); helpers pass `None` and rely on their annotations.
pub fn specialize(
    ctx: &Context,
    env: &HostEnv,
    fun: &RawFunction,
    domain: Option<RelationId>,
) -> Result<SpecFun, SpecializeError> {
    let params: Vec<(String, Type)> = match fun.kind {
        FunKind::Kernel => {
            let rel = domain.expect("kernel specialization requires a domain relation");
            if fun.params.len() != 1 {
                return Err(SpecializeError::KernelSignature {
                    name: fun.name.clone(),
                    got: fun.params.len(),
                });
            }
            vec![(fun.params[0].name.clone(), Type::Key(rel))]
        }
        FunKind::Helper => {
            let mut out = Vec::with_capacity(fun.params.len());
            for p in &fun.params {
                let ty = p
                    .ty
                    .as_ref()
                    .ok_or_else(|| SpecializeError::UntypedHelperParam { name: fun.name.clone() })?;
                out.push((p.name.clone(), resolve_type_expr(ctx, ty)?));
            }
            out
        }
    };

    let ret = match (&fun.kind, &fun.ret) {
        (FunKind::Kernel, _) | (_, None) => Type::Void,
        (FunKind::Helper, Some(t)) => resolve_type_expr(ctx, t)?,
    };

    let mut sp = Specializer { ctx, env, params: &params, scopes: vec![HashMap::new()] };
    let body = sp.block(&fun.body)?;

    Ok(SpecFun { name: fun.name.clone(), kind: fun.kind, params, ret, body })
}

/// Resolve a serialized type spelling against the context.
pub fn resolve_type_expr(ctx: &Context, te: &TypeExpr) -> Result<Type, SpecializeError> {
    Ok(match te {
        TypeExpr::Prim(p) => Type::Prim(*p),
        TypeExpr::Vector { elem, len } => Type::Vector { elem: *elem, len: *len },
        TypeExpr::Matrix { elem, rows, cols } => {
            Type::Matrix { elem: *elem, rows: *rows, cols: *cols }
        }
        TypeExpr::Key { rel } => match ctx.lookup(rel) {
            Some(Named::Relation(r)) => Type::Key(r),
            _ => {
                return Err(SpecializeError::Unbound { name: rel.clone(), span: Span::none() })
            }
        },
    })
}

// ============================================================================
// The pass
// ============================================================================

struct Specializer<'a> {
    ctx: &'a Context,
    env: &'a HostEnv,
    params: &'a [(String, Type)],
    /// Lexical scopes of locals; the payload tracks key-typed locals so
    /// member access through them can resolve statically.
    scopes: Vec<HashMap<String, Option<RelationId>>>,
}

impl<'a> Specializer<'a> {
    fn lookup_param(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|(n, _)| n == name)
    }

    fn lookup_local(&self, name: &str) -> Option<Option<RelationId>> {
        self.scopes.iter().rev().find_map(|s| s.get(name).copied())
    }

    fn declare_local(&mut self, name: &str, key_rel: Option<RelationId>) {
        self.scopes
            .last_mut()
            .expect("specializer always has a scope")
            .insert(name.to_string(), key_rel);
    }

    /// Relation a key-valued expression statically belongs to, when the
    /// specializer can see it.
    fn key_relation_of(&self, e: &Expr) -> Option<RelationId> {
        match &e.kind {
            ExprKind::Param(i) => match self.params[*i].1 {
                Type::Key(r) => Some(r),
                _ => None,
            },
            ExprKind::Local(name) => self.lookup_local(name).flatten(),
            ExprKind::Affine { target, .. } | ExprKind::UnsafeRow { rel: target, .. } => {
                Some(*target)
            }
            ExprKind::FieldAccess { field, .. } => match self.ctx.field(*field).ty {
                Type::Key(r) => Some(r),
                _ => None,
            },
            _ => None,
        }
    }

    // ------------------------------------------------------------ statements

    fn block(&mut self, stmts: &[RawStmt]) -> Result<Vec<Stmt>, SpecializeError> {
        self.scopes.push(HashMap::new());
        let out = stmts.iter().map(|s| self.stmt(s)).collect();
        self.scopes.pop();
        out
    }

    fn stmt(&mut self, s: &RawStmt) -> Result<Stmt, SpecializeError> {
        let span = s.span;
        let kind = match &s.kind {
            RawStmtKind::Let { name, ty, init } => {
                let init = self.expr(init)?;
                let ty = match ty {
                    Some(te) => resolve_type_expr(self.ctx, te)?,
                    None => Type::Unknown,
                };
                self.declare_local(name, self.key_relation_of(&init));
                StmtKind::Let { name: name.clone(), ty, init }
            }
            RawStmtKind::Assign { target, value } => {
                let value = self.expr(value)?;
                self.assign_target(target, value)?
            }
            RawStmtKind::Reduce { target, op, value } => {
                let value = self.expr(value)?;
                self.reduce_target(target, *op, value)?
            }
            RawStmtKind::If { cond, then, else_ } => StmtKind::If {
                cond: self.expr(cond)?,
                then: self.block(then)?,
                else_: match else_ {
                    Some(b) => self.block(b)?,
                    None => Vec::new(),
                },
            },
            RawStmtKind::For { var, lo, hi, body } => {
                let lo = self.expr(lo)?;
                let hi = self.expr(hi)?;
                self.scopes.push(HashMap::new());
                self.declare_local(var, None);
                let body: Result<Vec<_>, _> = body.iter().map(|s| self.stmt(s)).collect();
                self.scopes.pop();
                StmtKind::For { var: var.clone(), lo, hi, body: body? }
            }
            RawStmtKind::Expr(e) => StmtKind::Expr(self.expr(e)?),
            RawStmtKind::Insert { rel, fields } => {
                let rel_id = match &rel.kind {
                    RawExprKind::Name(n) => match self.ctx.lookup(n) {
                        Some(Named::Relation(r)) => r,
                        _ => return Err(SpecializeError::InsertTarget { span: rel.span }),
                    },
                    _ => return Err(SpecializeError::InsertTarget { span: rel.span }),
                };
                let mut resolved = Vec::with_capacity(fields.len());
                for (fname, fexpr) in fields {
                    let fid = self.ctx.field_by_name(rel_id, fname).ok_or_else(|| {
                        SpecializeError::UnknownMember {
                            rel: self.ctx.relation(rel_id).name.clone(),
                            name: fname.clone(),
                            span,
                        }
                    })?;
                    resolved.push((fid, self.expr(fexpr)?));
                }
                StmtKind::Insert { rel: rel_id, fields: resolved }
            }
            RawStmtKind::Delete { key } => StmtKind::Delete { key: self.expr(key)? },
            RawStmtKind::Return(v) => {
                StmtKind::Return(v.as_ref().map(|e| self.expr(e)).transpose()?)
            }
        };
        Ok(Stmt { kind, span })
    }

    fn assign_target(&mut self, target: &RawExpr, value: Expr) -> Result<StmtKind, SpecializeError> {
        match &target.kind {
            RawExprKind::Name(n) => {
                if self.lookup_local(n).is_some() {
                    return Ok(StmtKind::AssignLocal { name: n.clone(), value });
                }
                // Params, globals, host names: none of these are assignable
                // inside a kernel (globals are only reduced or re-bound by
                // the control program).
                Err(SpecializeError::NotAssignable { span: target.span })
            }
            RawExprKind::Member { base, name } => {
                let key = self.expr(base)?;
                match self.member_field(&key, name, target.span)? {
                    MemberResolution::Field(field) => {
                        Ok(StmtKind::FieldWrite { field, key, value })
                    }
                    MemberResolution::Expanded(_) => {
                        Err(SpecializeError::NotAssignable { span: target.span })
                    }
                }
            }
            _ => Err(SpecializeError::NotAssignable { span: target.span }),
        }
    }

    fn reduce_target(
        &mut self,
        target: &RawExpr,
        op: ReduceOp,
        value: Expr,
    ) -> Result<StmtKind, SpecializeError> {
        match &target.kind {
            RawExprKind::Name(n) => {
                if self.lookup_local(n).is_some() {
                    // Arithmetic reductions on locals are sugar for
                    // assignment; min=/max= have no scalar operator form.
                    let bin = match op {
                        ReduceOp::Add => BinOp::Add,
                        ReduceOp::Sub => BinOp::Sub,
                        ReduceOp::Mul => BinOp::Mul,
                        ReduceOp::Div => BinOp::Div,
                        ReduceOp::Min | ReduceOp::Max => {
                            return Err(SpecializeError::LocalMinMax { span: target.span })
                        }
                    };
                    let local = Expr::new(ExprKind::Local(n.clone()), target.span);
                    let combined = Expr::new(
                        ExprKind::Binary { op: bin, lhs: Box::new(local), rhs: Box::new(value) },
                        target.span,
                    );
                    return Ok(StmtKind::AssignLocal { name: n.clone(), value: combined });
                }
                match self.ctx.lookup(n) {
                    Some(Named::Global(g)) => Ok(StmtKind::GlobalReduce { global: g, op, value }),
                    _ => Err(SpecializeError::NotAssignable { span: target.span }),
                }
            }
            RawExprKind::Member { base, name } => {
                let key = self.expr(base)?;
                match self.member_field(&key, name, target.span)? {
                    MemberResolution::Field(field) => {
                        Ok(StmtKind::FieldReduce { field, key, op, value })
                    }
                    MemberResolution::Expanded(_) => {
                        Err(SpecializeError::NotAssignable { span: target.span })
                    }
                }
            }
            _ => Err(SpecializeError::NotAssignable { span: target.span }),
        }
    }

    // ----------------------------------------------------------- expressions

    fn expr(&mut self, e: &RawExpr) -> Result<Expr, SpecializeError> {
        let span = e.span;
        let kind = match &e.kind {
            RawExprKind::Bool(b) => ExprKind::Const(Scalar::Bool(*b)),
            RawExprKind::Num(v) => {
                // Integral literals stay integer-typed so they can adopt
                // the width of whatever they meet; see the checker.
                if v.fract() == 0.0 && v.is_finite() {
                    ExprKind::Const(Scalar::Int(*v as i64))
                } else {
                    ExprKind::Const(Scalar::Float(*v))
                }
            }
            RawExprKind::Name(n) => return self.name(n, span),
            RawExprKind::Vector(items) => {
                let items: Result<Vec<_>, _> = items.iter().map(|i| self.expr(i)).collect();
                ExprKind::VectorLit(items?)
            }
            RawExprKind::Unary { op, expr } => {
                ExprKind::Unary { op: *op, expr: Box::new(self.expr(expr)?) }
            }
            RawExprKind::Binary { op, lhs, rhs } => ExprKind::Binary {
                op: *op,
                lhs: Box::new(self.expr(lhs)?),
                rhs: Box::new(self.expr(rhs)?),
            },
            RawExprKind::Index { base, indices } => {
                let indices: Result<Vec<_>, _> = indices.iter().map(|i| self.expr(i)).collect();
                ExprKind::Index { base: Box::new(self.expr(base)?), indices: indices? }
            }
            RawExprKind::Member { base, name } => {
                let key = self.expr(base)?;
                match self.member_field(&key, name, span)? {
                    MemberResolution::Field(field) => {
                        ExprKind::FieldAccess { field, key: Box::new(key) }
                    }
                    MemberResolution::Expanded(expr) => return Ok(expr),
                }
            }
            RawExprKind::Call { callee, args } => return self.call(callee, args, span),
        };
        Ok(Expr { kind, ty: Type::Unknown, span })
    }

    fn name(&mut self, n: &str, span: Span) -> Result<Expr, SpecializeError> {
        if let Some(i) = self.lookup_param(n) {
            return Ok(Expr::new(ExprKind::Param(i), span));
        }
        if self.lookup_local(n).is_some() {
            return Ok(Expr::new(ExprKind::Local(n.to_string()), span));
        }
        if let Some(v) = self.env.consts.get(n) {
            return Ok(Expr::new(ExprKind::Const(*v), span));
        }
        match self.ctx.lookup(n) {
            Some(Named::Global(g)) => Ok(Expr::new(ExprKind::GlobalRead(g), span)),
            Some(Named::Relation(_)) | Some(Named::Function(_)) | Some(Named::Subset(_)) => {
                Err(SpecializeError::NotAValue { name: n.to_string(), span })
            }
            None => {
                if Builtin::lookup(n).is_some() {
                    // Builtins are callable, not first-class.
                    Err(SpecializeError::NotAValue { name: n.to_string(), span })
                } else {
                    Err(SpecializeError::Unbound { name: n.to_string(), span })
                }
            }
        }
    }

    fn call(
        &mut self,
        callee: &RawExpr,
        args: &[RawExpr],
        span: Span,
    ) -> Result<Expr, SpecializeError> {
        // Named callees: builtins and helpers, unless shadowed by a
        // param/local (then it is a neighbor-offset call on a key).
        if let RawExprKind::Name(n) = &callee.kind {
            let shadowed = self.lookup_param(n).is_some() || self.lookup_local(n).is_some();
            if !shadowed {
                if let Some(Named::Function(f)) = self.ctx.lookup(n) {
                    let args: Result<Vec<_>, _> = args.iter().map(|a| self.expr(a)).collect();
                    return Ok(Expr::new(ExprKind::HelperCall { fun: f, args: args? }, span));
                }
                if let Some(b) = Builtin::lookup(n) {
                    return self.builtin_call(b, args, span);
                }
                if self.ctx.lookup(n).is_some() {
                    return Err(SpecializeError::NotCallable { name: n.to_string(), span });
                }
                if self.env.consts.contains_key(n) {
                    return Err(SpecializeError::NotCallable { name: n.to_string(), span });
                }
                return Err(SpecializeError::Unbound { name: n.to_string(), span });
            }
        }

        // Anything else must be a key expression: a neighbor-offset call.
        let base = self.expr(callee)?;
        let target =
            self.key_relation_of(&base).ok_or(SpecializeError::CannotOffset { span })?;
        let rel = self.ctx.relation(target);
        let grid = rel.shape.grid().ok_or(SpecializeError::CannotOffset { span })?;
        if args.len() != grid.rank() {
            return Err(SpecializeError::WrongArity {
                what: format!("offset into {:?}", rel.name),
                want: grid.rank(),
                got: args.len(),
                span,
            });
        }
        let mut translation = Vec::with_capacity(args.len());
        for a in args {
            match &a.kind {
                RawExprKind::Num(v) if v.fract() == 0.0 => translation.push(*v as i64),
                RawExprKind::Unary { op: crate::ast::UnaryOp::Neg, expr } => match &expr.kind {
                    RawExprKind::Num(v) if v.fract() == 0.0 => translation.push(-(*v as i64)),
                    _ => return Err(SpecializeError::NonIntegerOffset { span: a.span }),
                },
                _ => return Err(SpecializeError::NonIntegerOffset { span: a.span }),
            }
        }
        Ok(Expr::new(ExprKind::Affine { target, translation, base: Box::new(base) }, span))
    }

    fn builtin_call(
        &mut self,
        b: Builtin,
        args: &[RawExpr],
        span: Span,
    ) -> Result<Expr, SpecializeError> {
        match b {
            Builtin::Affine => self.affine_form(args, span),
            Builtin::UnsafeRow => {
                if args.len() != 2 {
                    return Err(SpecializeError::WrongArity {
                        what: "UNSAFE_ROW".to_string(),
                        want: 2,
                        got: args.len(),
                        span,
                    });
                }
                let id = self.expr(&args[0])?;
                let rel = match &args[1].kind {
                    RawExprKind::Name(n) => match self.ctx.lookup(n) {
                        Some(Named::Relation(r)) => r,
                        _ => {
                            return Err(SpecializeError::Unbound {
                                name: n.clone(),
                                span: args[1].span,
                            })
                        }
                    },
                    _ => return Err(SpecializeError::ExpectedRelation { span: args[1].span }),
                };
                Ok(Expr::new(ExprKind::UnsafeRow { rel, id: Box::new(id) }, span))
            }
            _ => {
                if args.len() != b.arity() {
                    return Err(SpecializeError::WrongArity {
                        what: format!("{b:?}"),
                        want: b.arity(),
                        got: args.len(),
                        span,
                    });
                }
                let args: Result<Vec<_>, _> = args.iter().map(|a| self.expr(a)).collect();
                Ok(Expr::new(ExprKind::Builtin { builtin: b, args: args? }, span))
            }
        }
    }

    /// `Affine(rel, M, key)`: validate the matrix is a padded diagonal
    /// translation (identity rotation, integer last column) and reduce it
    /// to the translation vector.
    fn affine_form(&mut self, args: &[RawExpr], span: Span) -> Result<Expr, SpecializeError> {
        if args.len() != 3 {
            return Err(SpecializeError::WrongArity {
                what: "Affine".to_string(),
                want: 3,
                got: args.len(),
                span,
            });
        }
        let target = match &args[0].kind {
            RawExprKind::Name(n) => match self.ctx.lookup(n) {
                Some(Named::Relation(r)) => r,
                _ => {
                    return Err(SpecializeError::Unbound { name: n.clone(), span: args[0].span })
                }
            },
            _ => return Err(SpecializeError::ExpectedRelation { span: args[0].span }),
        };
        let rank = self.ctx.relation(target).shape.bounds().len();

        let rows = match &args[1].kind {
            RawExprKind::Vector(rows) => rows,
            _ => return Err(StencilError::BadAffineShape { rank, span }.into()),
        };
        if rows.len() != rank {
            return Err(StencilError::BadAffineShape { rank, span }.into());
        }
        let mut translation = Vec::with_capacity(rank);
        for (i, row) in rows.iter().enumerate() {
            let cols = match &row.kind {
                RawExprKind::Vector(cols) => cols,
                _ => return Err(StencilError::BadAffineShape { rank, span }.into()),
            };
            if cols.len() != rank + 1 {
                return Err(StencilError::BadAffineShape { rank, span }.into());
            }
            for (j, cell) in cols.iter().enumerate() {
                let v = match &cell.kind {
                    RawExprKind::Num(v) => *v,
                    _ => return Err(SpecializeError::NonIntegerOffset { span: cell.span }),
                };
                if j < rank {
                    // Rotation part: must be the identity.
                    let want = if i == j { 1.0 } else { 0.0 };
                    if v != want {
                        return Err(StencilError::NonDiagonalAffine { span }.into());
                    }
                } else {
                    if v.fract() != 0.0 {
                        return Err(SpecializeError::NonIntegerOffset { span: cell.span });
                    }
                    translation.push(v as i64);
                }
            }
        }

        let base = self.expr(&args[2])?;
        Ok(Expr::new(ExprKind::Affine { target, translation, base: Box::new(base) }, span))
    }

    // -------------------------------------------------------------- members

    fn member_field(
        &mut self,
        key: &Expr,
        name: &str,
        span: Span,
    ) -> Result<MemberResolution, SpecializeError> {
        let rel_id =
            self.key_relation_of(key).ok_or(SpecializeError::MemberOnNonKey { span })?;
        if let Some(field) = self.ctx.field_by_name(rel_id, name) {
            return Ok(MemberResolution::Field(field));
        }
        let rel = self.ctx.relation(rel_id);
        let mac = rel.macros.get(name).cloned().ok_or_else(|| {
            SpecializeError::UnknownMember {
                rel: rel.name.clone(),
                name: name.to_string(),
                span,
            }
        })?;
        Ok(MemberResolution::Expanded(self.expand_macro(rel_id, &mac, key.clone(), span)))
    }

    fn expand_macro(
        &self,
        rel_id: RelationId,
        mac: &crate::relation::RelMacro,
        key: Expr,
        span: Span,
    ) -> Expr {
        use crate::relation::RelMacro;

        let axis_builtin = |axis: u8| match axis {
            0 => Builtin::Xid,
            1 => Builtin::Yid,
            _ => Builtin::Zid,
        };
        let axis_of = |axis: u8, key: Expr| {
            Expr::new(
                ExprKind::Builtin { builtin: axis_builtin(axis), args: vec![key] },
                span,
            )
        };
        let int = |v: i64| Expr::new(ExprKind::Const(Scalar::Int(v)), span);
        let float = |v: f64| Expr::new(ExprKind::Const(Scalar::Float(v)), span);
        let bin = |op: BinOp, l: Expr, r: Expr| {
            Expr::new(ExprKind::Binary { op, lhs: Box::new(l), rhs: Box::new(r) }, span)
        };

        let grid = self.ctx.relation(rel_id).shape.grid();

        match mac {
            RelMacro::AxisId(a) => axis_of(*a, key),
            RelMacro::Link { target } => {
                let rank = self.ctx.relation(*target).shape.bounds().len();
                Expr::new(
                    ExprKind::Affine {
                        target: *target,
                        translation: vec![0; rank],
                        base: Box::new(key),
                    },
                    span,
                )
            }
            RelMacro::Center => {
                let g = grid.expect("center macro only on grids");
                let comps: Vec<Expr> = (0..g.rank())
                    .map(|a| {
                        // origin + (axis + 0.5) * width
                        bin(
                            BinOp::Add,
                            float(g.origin[a]),
                            bin(
                                BinOp::Mul,
                                bin(BinOp::Add, axis_of(a as u8, key.clone()), float(0.5)),
                                float(g.width[a]),
                            ),
                        )
                    })
                    .collect();
                Expr::new(ExprKind::VectorLit(comps), span)
            }
            RelMacro::BoundaryDepth { axis, negative } => {
                let g = grid.expect("depth macro only on grids");
                let n_bd = g.n_bd as i64;
                let dim = g.dims[*axis as usize] as i64;
                let a = axis_of(*axis, key);
                let depth = if *negative {
                    // n_bd - axis, clamped at 0
                    bin(BinOp::Sub, int(n_bd), a)
                } else {
                    // axis + n_bd + 1 - dim, clamped at 0
                    bin(BinOp::Sub, bin(BinOp::Add, a, int(n_bd + 1)), int(dim))
                };
                Expr::new(
                    ExprKind::Builtin { builtin: Builtin::Imax, args: vec![depth, int(0)] },
                    span,
                )
            }
            RelMacro::InBoundary => {
                let g = grid.expect("boundary macro only on grids");
                if g.n_bd == 0 {
                    return Expr::new(ExprKind::Const(Scalar::Bool(false)), span);
                }
                let mut acc: Option<Expr> = None;
                for a in 0..g.rank() {
                    let near_lo =
                        bin(BinOp::Lt, axis_of(a as u8, key.clone()), int(g.n_bd as i64));
                    let near_hi = bin(
                        BinOp::Ge,
                        axis_of(a as u8, key.clone()),
                        int(g.dims[a] as i64 - g.n_bd as i64),
                    );
                    let axis_test = bin(BinOp::Or, near_lo, near_hi);
                    acc = Some(match acc {
                        None => axis_test,
                        Some(prev) => bin(BinOp::Or, prev, axis_test),
                    });
                }
                acc.expect("grid rank is at least 1")
            }
            RelMacro::InInterior => {
                let inner = self.expand_macro(rel_id, &RelMacro::InBoundary, key, span);
                Expr::new(
                    ExprKind::Unary { op: crate::ast::UnaryOp::Not, expr: Box::new(inner) },
                    span,
                )
            }
        }
    }
}

enum MemberResolution {
    Field(crate::relation::FieldId),
    Expanded(Expr),
}

// ============================================================================
// Tests
// ============================================================================
