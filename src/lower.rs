//! Lowering pipeline
//!
//! Drives specialize → check → phase per kernel and emits the task graph:
//! one task per kernel specialization (memoized on the
//! `(function, relation|subset, backend)` triple, retained for the process
//! lifetime), one generated task per helper and per `dot` shape, and one
//! driver lowered from the recorded control program.
//!
//! ForEach lowering walks the three-stage machine the task model expects:
//! *NeedsDomain* (bind the subset region or fall back to the universe),
//! *NeedsPrivileges* (derive `reads`/`writes`/`reduces` column sets from
//! the phase result; an untouched universe region is omitted), then
//! *NeedsReduction* (wrap the call as `global op= task(...)` when the
//! kernel reduces a global).
//!
//! Elasticity is granted lazily: the first compiled kernel that inserts
//! into or deletes from a relation installs its live mask. Insert and
//! delete lower only for the CPU backend.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::{debug, warn};

use crate::ast::{
    BinOp, Builtin, Expr, ExprKind, FunKind, ReduceOp, Stmt, StmtKind, TypeExpr, UnaryOp,
};
use crate::check::{check, ArityError, TypedFun};
use crate::ir::{self, Decl, ExprConst, Program, ShapeDecl};
use crate::layout::Dld;
use crate::phase::{analyze, require_pure, PhaseResult};
use crate::relation::{Context, FieldId, FunId, GlobalId, Named, RelationId, SubsetData, SubsetId};
use crate::specialize::{resolve_type_expr, specialize, HostEnv};
use crate::task::{
    reduce_identity, AccumSpec, Backend, CellInit, ColumnDecl, CondExpr, DomainRef, DriverOp,
    FieldSlot, GlobalSlot, LBinOp, LExpr, LStmt, LUnOp, Manifest, Privilege, RegionReq,
    RuntimeFn, ScalarExpr, SigLayout, TaskGraph, TaskId, TaskKind, TaskSpec,
};
use crate::types::{Primitive, Scalar, Type};
use crate::CompileError;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LowerError {
    #[error("unknown name {0:?} in the control program")]
    Unknown(String),
    #[error("{name:?} is not a {want}")]
    NotA { name: String, want: &'static str },
    #[error("subset {subset:?} does not filter relation {rel:?}")]
    SubsetMismatch { subset: String, rel: String },
    #[error("insert/delete kernels are only supported on the cpu backend")]
    UnsupportedBackend,
    #[error("subset {0:?} was skipped (multi-rectangle) and cannot be launched over")]
    SubsetNotBound(String),
    #[error("kernel {0:?} reduces more than one global")]
    MultipleGlobalReductions(String),
    #[error("kernel {0:?} inserts into more than one relation")]
    MultipleInsertTargets(String),
    #[error("constant does not fit {ty}: {detail}")]
    BadConst { ty: Type, detail: String },
    #[error("control expression mixes numbers and booleans")]
    ControlType,
    #[error("malformed rectangles constant for subset {0:?}")]
    BadRectangles(String),
}

// ============================================================================
// Pipeline
// ============================================================================

/// One memoized kernel specialization.
#[derive(Clone, Debug)]
pub struct Specialization {
    pub fun: FunId,
    pub domain: DomainRef,
    pub backend: Backend,
    pub typed: TypedFun,
    pub phase: PhaseResult,
    pub task: TaskId,
}

/// Explicit compiler state threaded through every pass: the data model,
/// the target backend, and the process-lifetime memo caches (no eviction).
pub struct Pipeline {
    pub ctx: Context,
    backend: Backend,
    specs: HashMap<(FunId, DomainRef, Backend), usize>,
    spec_list: Vec<Specialization>,
    helper_tasks: HashMap<(FunId, Backend), TaskId>,
    dot_tasks: HashMap<(Primitive, u8), TaskId>,
    tasks: Vec<TaskSpec>,
    skipped_subsets: HashSet<SubsetId>,
}

/// Compile a recorded program for `backend`.
pub fn compile(program: &Program, backend: Backend) -> Result<TaskGraph, CompileError> {
    let mut p = Pipeline::new(backend);
    p.apply_decls(&program.decls)?;

    // Compile every referenced kernel first; this settles lazily granted
    // elasticity before regions are sized and columns enumerated.
    for s in &program.stmts {
        p.precompile_stmt(s)?;
    }

    let mut driver = Vec::new();
    p.emit_prologue(&mut driver);
    for s in &program.stmts {
        p.lower_stmt(s, &mut driver)?;
    }

    debug!(
        tasks = p.tasks.len(),
        driver_ops = driver.len(),
        "lowered program into task graph"
    );
    Ok(TaskGraph {
        manifest: Manifest { program_digest: hex::encode(program.digest()), backend },
        tasks: p.tasks,
        driver,
    })
}

impl Pipeline {
    pub fn new(backend: Backend) -> Pipeline {
        Pipeline {
            ctx: Context::new(),
            backend,
            specs: HashMap::new(),
            spec_list: Vec::new(),
            helper_tasks: HashMap::new(),
            dot_tasks: HashMap::new(),
            tasks: Vec::new(),
            skipped_subsets: HashSet::new(),
        }
    }

    // ---------------------------------------------------------- declarations

    fn apply_decls(&mut self, decls: &[Decl]) -> Result<(), CompileError> {
        for d in decls {
            match d {
                Decl::NewRelation { name, shape } => match shape {
                    ShapeDecl::Flat { size } => {
                        self.ctx.new_relation(*size, name)?;
                    }
                    ShapeDecl::Grid { dims, n_bd } => {
                        self.ctx.new_grid(dims, *n_bd, name)?;
                    }
                },
                Decl::NewField { rel, name, ty } => {
                    let rel = self.relation_named(rel)?;
                    let ty = resolve_type_expr(&self.ctx, ty)?;
                    self.ctx.new_field(rel, name, ty)?;
                }
                Decl::NewGlobal { name, ty, init } => {
                    let ty = resolve_type_expr(&self.ctx, ty)?;
                    // Validate the initializer up front; lowering re-uses it.
                    const_to_cell(&ty, init)?;
                    self.ctx.new_global(name, ty, init.clone())?;
                }
                Decl::NewFunction { fun } => {
                    self.ctx.new_function(fun.clone())?;
                }
                Decl::NewSubset { rel, name, rectangles } => {
                    let rel = self.relation_named(rel)?;
                    let rects = parse_rectangles(rectangles)
                        .ok_or_else(|| LowerError::BadRectangles(name.clone()))?;
                    let id = self.ctx.new_subset_from_rectangles(rel, name, rects.clone())?;
                    if rects.len() > 1 {
                        warn!(
                            subset = %name,
                            rectangles = rects.len(),
                            "multi-rectangle subsets are not supported; skipping partition"
                        );
                        self.skipped_subsets.insert(id);
                    }
                }
            }
        }
        Ok(())
    }

    fn relation_named(&self, name: &str) -> Result<RelationId, LowerError> {
        match self.ctx.lookup(name) {
            Some(Named::Relation(r)) => Ok(r),
            Some(_) => Err(LowerError::NotA { name: name.to_string(), want: "relation" }),
            None => Err(LowerError::Unknown(name.to_string())),
        }
    }

    fn global_named(&self, name: &str) -> Result<GlobalId, LowerError> {
        match self.ctx.lookup(name) {
            Some(Named::Global(g)) => Ok(g),
            Some(_) => Err(LowerError::NotA { name: name.to_string(), want: "global" }),
            None => Err(LowerError::Unknown(name.to_string())),
        }
    }

    // ------------------------------------------------------- kernel compile

    fn resolve_for_each(
        &self,
        fun: &str,
        rel: &str,
        subset: &Option<String>,
    ) -> Result<(FunId, DomainRef), CompileError> {
        let f = match self.ctx.lookup(fun) {
            Some(Named::Function(f)) => f,
            Some(_) => {
                return Err(LowerError::NotA { name: fun.to_string(), want: "kernel" }.into())
            }
            None => return Err(LowerError::Unknown(fun.to_string()).into()),
        };
        let raw = self.ctx.function(f);
        if raw.kind != FunKind::Kernel {
            return Err(LowerError::NotA { name: fun.to_string(), want: "kernel" }.into());
        }
        let r = self.relation_named(rel)?;

        // An annotated kernel parameter pins the entity type.
        if let Some(TypeExpr::Key { rel: declared }) = &raw.params.first().and_then(|p| p.ty.clone())
        {
            match self.ctx.lookup(declared) {
                Some(Named::Relation(d)) if d == r => {}
                _ => {
                    return Err(ArityError::WrongRelation {
                        kernel: raw.name.clone(),
                        declared: declared.clone(),
                        launched: rel.to_string(),
                    }
                    .into())
                }
            }
        }

        let domain = match subset {
            None => DomainRef::Universe(r),
            Some(sname) => {
                let s = match self.ctx.lookup(sname) {
                    Some(Named::Subset(s)) => s,
                    Some(_) => {
                        return Err(
                            LowerError::NotA { name: sname.clone(), want: "subset" }.into()
                        )
                    }
                    None => return Err(LowerError::Unknown(sname.clone()).into()),
                };
                if self.ctx.subset(s).rel != r {
                    return Err(LowerError::SubsetMismatch {
                        subset: sname.clone(),
                        rel: rel.to_string(),
                    }
                    .into());
                }
                if self.skipped_subsets.contains(&s) {
                    return Err(LowerError::SubsetNotBound(sname.clone()).into());
                }
                DomainRef::Subset(s)
            }
        };
        Ok((f, domain))
    }

    fn precompile_stmt(&mut self, s: &ir::Stmt) -> Result<(), CompileError> {
        match s {
            ir::Stmt::Block(inner) => inner.iter().try_for_each(|s| self.precompile_stmt(s)),
            ir::Stmt::ForEach { fun, rel, subset } => {
                let (f, domain) = self.resolve_for_each(fun, rel, subset)?;
                self.specialization(f, domain)?;
                Ok(())
            }
            ir::Stmt::If { then, else_, .. } => {
                for b in [then, else_].into_iter().flatten() {
                    self.precompile_stmt(b)?;
                }
                Ok(())
            }
            ir::Stmt::While { body, .. } => {
                body.as_deref().map_or(Ok(()), |b| self.precompile_stmt(b))
            }
            ir::Stmt::LoadField { .. } | ir::Stmt::SetGlobal { .. } => Ok(()),
        }
    }

    /// Fetch or build the memoized specialization of `(fun, domain)` on the
    /// pipeline backend.
    pub fn specialization(
        &mut self,
        fun: FunId,
        domain: DomainRef,
    ) -> Result<&Specialization, CompileError> {
        let key = (fun, domain, self.backend);
        if let Some(&i) = self.specs.get(&key) {
            debug!(kernel = %self.ctx.function(fun).name, "specialization cache hit");
            return Ok(&self.spec_list[i]);
        }

        let rel = domain.relation(&self.ctx);
        let raw = self.ctx.function(fun).clone();
        let sp = specialize(&self.ctx, &HostEnv::new(), &raw, Some(rel))?;
        let typed = check(&self.ctx, &sp)?;
        let phase = analyze(&self.ctx, &typed, rel)?;

        if (!phase.inserts.is_empty() || phase.deletes.is_some()) && self.backend != Backend::Cpu
        {
            return Err(LowerError::UnsupportedBackend.into());
        }
        if phase.inserts.len() > 1 {
            return Err(LowerError::MultipleInsertTargets(typed.name.clone()).into());
        }
        let n_reduced = phase.global_use.values().filter(|pt| pt.reduceop.is_some()).count();
        if n_reduced > 1 {
            return Err(LowerError::MultipleGlobalReductions(typed.name.clone()).into());
        }

        // Lazily granted elasticity installs the live mask now, before the
        // signature enumerates columns.
        for target in phase.inserts.clone() {
            self.ctx.make_elastic(target)?;
        }
        if let Some(target) = phase.deletes {
            self.ctx.make_elastic(target)?;
        }

        // Generated callees first, so the body lowering is a pure function.
        let (dot_shapes, helpers) = collect_calls(&typed);
        for shape in dot_shapes {
            self.dot_task(shape.0, shape.1);
        }
        for h in helpers {
            self.helper_task(h)?;
        }

        let sig = self.build_sig(&phase, domain);
        let regions = self.build_regions(&phase, rel);
        let reduction = self.build_reduction(&phase);
        let (body, local_slots) =
            lower_body(&self.ctx, &sig, &typed, &self.helper_tasks, &self.dot_tasks, self.backend);

        let id = TaskId(self.tasks.len());
        let name = format!("{}${}", typed.name, self.domain_name(domain));
        debug!(task = %name, "emitting kernel task");
        self.tasks.push(TaskSpec {
            id,
            name,
            kind: TaskKind::KernelLoop,
            sig,
            regions,
            param_slots: 0,
            local_slots,
            body,
            reduction,
        });

        let i = self.spec_list.len();
        self.spec_list.push(Specialization {
            fun,
            domain,
            backend: self.backend,
            typed,
            phase,
            task: id,
        });
        self.specs.insert(key, i);
        Ok(&self.spec_list[i])
    }

    fn domain_name(&self, domain: DomainRef) -> String {
        match domain {
            DomainRef::Universe(r) => self.ctx.relation(r).name.clone(),
            DomainRef::Subset(s) => self.ctx.subset(s).name.clone(),
        }
    }

    /// Helper bodies lower once per backend; purity means the cache needs
    /// no argument-type or caller-domain component.
    fn helper_task(&mut self, fun: FunId) -> Result<TaskId, CompileError> {
        if let Some(&t) = self.helper_tasks.get(&(fun, self.backend)) {
            return Ok(t);
        }
        let raw = self.ctx.function(fun).clone();
        let sp = specialize(&self.ctx, &HostEnv::new(), &raw, None)?;
        let typed = check(&self.ctx, &sp)?;
        require_pure(&self.ctx, &typed)?;

        let (dot_shapes, helpers) = collect_calls(&typed);
        for shape in dot_shapes {
            self.dot_task(shape.0, shape.1);
        }
        for h in helpers {
            self.helper_task(h)?;
        }

        let sig = SigLayout {
            n_rows: 0,
            subset: None,
            use_boolmask: false,
            insert_into: None,
            fields: Vec::new(),
            globals: Vec::new(),
        };
        let (body, local_slots) =
            lower_body(&self.ctx, &sig, &typed, &self.helper_tasks, &self.dot_tasks, self.backend);

        let id = TaskId(self.tasks.len());
        debug!(task = %typed.name, "emitting helper task");
        self.tasks.push(TaskSpec {
            id,
            name: typed.name.clone(),
            kind: TaskKind::HelperExpr,
            sig,
            regions: Vec::new(),
            param_slots: typed.params.len() as u32,
            local_slots,
            body,
            reduction: None,
        });
        self.helper_tasks.insert((fun, self.backend), id);
        Ok(id)
    }

    /// Straight-line dot product for one `(element, length)` shape,
    /// generated once and memoized.
    fn dot_task(&mut self, elem: Primitive, n: u8) -> TaskId {
        if let Some(&t) = self.dot_tasks.get(&(elem, n)) {
            return t;
        }
        let lane = |arg: u32, i: u8| LExpr::Lane {
            base: Box::new(LExpr::Local(arg)),
            index: Box::new(LExpr::Const(Scalar::Int(i as i64))),
        };
        let mut acc = LExpr::Binary {
            op: LBinOp::Mul,
            lhs: Box::new(lane(0, 0)),
            rhs: Box::new(lane(1, 0)),
        };
        for i in 1..n {
            let term = LExpr::Binary {
                op: LBinOp::Mul,
                lhs: Box::new(lane(0, i)),
                rhs: Box::new(lane(1, i)),
            };
            acc = LExpr::Binary { op: LBinOp::Add, lhs: Box::new(acc), rhs: Box::new(term) };
        }

        let id = TaskId(self.tasks.len());
        let name = format!("dot_{}x{}", elem.name(), n);
        debug!(task = %name, "emitting dot-product task");
        self.tasks.push(TaskSpec {
            id,
            name,
            kind: TaskKind::HelperExpr,
            sig: SigLayout {
                n_rows: 0,
                subset: None,
                use_boolmask: false,
                insert_into: None,
                fields: Vec::new(),
                globals: Vec::new(),
            },
            regions: Vec::new(),
            param_slots: 2,
            local_slots: 2,
            body: vec![LStmt::Return(Some(acc))],
            reduction: None,
        });
        self.dot_tasks.insert((elem, n), id);
        id
    }

    // --------------------------------------------------------- sig & regions

    fn build_sig(&self, phase: &PhaseResult, domain: DomainRef) -> SigLayout {
        let rel = domain.relation(&self.ctx);
        let (subset, use_boolmask) = match domain {
            DomainRef::Universe(_) => (None, false),
            DomainRef::Subset(s) => {
                (Some(s), matches!(self.ctx.subset(s).data, SubsetData::Mask(_)))
            }
        };

        let mut fields: Vec<FieldSlot> = phase
            .field_use
            .keys()
            .map(|&f| self.field_slot_for(f))
            .collect();
        let insert_into = phase.inserts.first().copied();
        if let Some(target) = insert_into {
            for fid in &self.ctx.relation(target).fields {
                fields.push(self.field_slot_for(*fid));
            }
        }
        if phase.deletes.is_some() {
            let mask = self
                .ctx
                .relation(rel)
                .live_mask
                .expect("deleting kernels make their relation elastic");
            if !fields.iter().any(|s| s.field == mask) {
                fields.push(self.field_slot_for(mask));
            }
        }

        let globals: Vec<GlobalSlot> = phase
            .global_use
            .iter()
            .map(|(&g, pt)| GlobalSlot { global: g, reduce: pt.reduceop })
            .collect();

        SigLayout {
            n_rows: self.ctx.relation(rel).row_count(),
            subset,
            use_boolmask,
            insert_into,
            fields,
            globals,
        }
    }

    fn field_slot_for(&self, f: FieldId) -> FieldSlot {
        let field = self.ctx.field(f);
        let n = self.ctx.relation(field.rel).row_count();
        FieldSlot { field: f, dld: Dld::compact(field.dld_type(), n, 0) }
    }

    /// Privileges are declared on universe regions, grouped by relation.
    fn build_regions(&self, phase: &PhaseResult, domain_rel: RelationId) -> Vec<RegionReq> {
        let mut reads: BTreeMap<RelationId, Vec<FieldId>> = BTreeMap::new();
        let mut writes: BTreeMap<RelationId, Vec<FieldId>> = BTreeMap::new();
        let mut reduces: BTreeMap<RelationId, BTreeMap<ReduceOp, Vec<FieldId>>> = BTreeMap::new();

        for (&f, pt) in &phase.field_use {
            let rel = self.ctx.field(f).rel;
            if pt.read {
                reads.entry(rel).or_default().push(f);
            }
            if pt.write {
                writes.entry(rel).or_default().push(f);
            }
            if let Some(op) = pt.reduceop {
                reduces.entry(rel).or_default().entry(op).or_default().push(f);
            }
        }
        if let Some(&target) = phase.inserts.first() {
            writes
                .entry(target)
                .or_default()
                .extend(self.ctx.relation(target).fields.iter().copied());
        }
        if phase.deletes.is_some() {
            let mask =
                self.ctx.relation(domain_rel).live_mask.expect("delete grants elasticity");
            let w = writes.entry(domain_rel).or_default();
            if !w.contains(&mask) {
                w.push(mask);
            }
        }

        let mut rels: BTreeSet<RelationId> = BTreeSet::new();
        rels.extend(reads.keys());
        rels.extend(writes.keys());
        rels.extend(reduces.keys());

        rels.into_iter()
            .map(|rel| {
                let mut privileges = Vec::new();
                if let Some(cols) = reads.remove(&rel) {
                    privileges.push(Privilege::Reads(cols));
                }
                if let Some(cols) = writes.remove(&rel) {
                    privileges.push(Privilege::Writes(cols));
                }
                if let Some(ops) = reduces.remove(&rel) {
                    for (op, fields) in ops {
                        privileges.push(Privilege::Reduces { op, fields });
                    }
                }
                RegionReq { relation: rel, privileges }
            })
            .collect()
    }

    fn build_reduction(&self, phase: &PhaseResult) -> Option<AccumSpec> {
        let (global, op) = phase.reduced_global()?;
        let ty = self.ctx.global(global).ty.clone();
        let elem = ty.elem().expect("reducible globals are numeric");
        let lanes = ty.lanes().expect("reducible globals are scalar or vector");
        let identity = reduce_identity(op, elem);
        Some(AccumSpec {
            global,
            op,
            identity: CellInit { ty, lanes: vec![identity; lanes as usize] },
        })
    }

    // ---------------------------------------------------------------- driver

    /// Prologue: global declarations, region allocations, subset bindings —
    /// in that order, before any recorded statement runs.
    fn emit_prologue(&self, out: &mut Vec<DriverOp>) {
        for (gid, g) in self.ctx.globals() {
            let init = const_to_cell(&g.ty, &g.init).expect("validated at declaration");
            out.push(DriverOp::DeclareGlobal { global: gid, init });
        }
        for (rid, rel) in self.ctx.relations() {
            let columns = rel
                .fields
                .iter()
                .map(|&f| ColumnDecl { field: f, ty: self.ctx.field(f).dld_type() })
                .collect();
            out.push(DriverOp::AllocRegion {
                relation: rid,
                n_rows: rel.row_count(),
                columns,
                live_mask: rel.live_mask,
            });
        }
        for (rid, rel) in self.ctx.relations() {
            for &sid in &rel.subsets {
                if self.skipped_subsets.contains(&sid) {
                    continue;
                }
                out.push(DriverOp::BindSubset {
                    subset: sid,
                    relation: rid,
                    data: self.ctx.subset(sid).data.clone(),
                });
            }
        }
    }

    fn lower_stmt(&mut self, s: &ir::Stmt, out: &mut Vec<DriverOp>) -> Result<(), CompileError> {
        match s {
            ir::Stmt::Block(inner) => inner.iter().try_for_each(|s| self.lower_stmt(s, out)),
            ir::Stmt::ForEach { fun, rel, subset } => {
                let (f, domain) = self.resolve_for_each(fun, rel, subset)?;
                // NeedsDomain → NeedsPrivileges → NeedsReduction.
                let spec = self.specialization(f, domain)?;
                let reduce_into = spec.phase.reduced_global().map(|(g, _)| g);
                out.push(DriverOp::Launch { task: spec.task, domain, reduce_into });
                Ok(())
            }
            ir::Stmt::LoadField { rel, field, value } => {
                let r = self.relation_named(rel)?;
                let f = self
                    .ctx
                    .field_by_name(r, field)
                    .ok_or_else(|| LowerError::Unknown(format!("{rel}.{field}")))?;
                let cell = const_to_cell(&self.ctx.field(f).ty, value)?;
                out.push(DriverOp::Fill { field: f, value: cell });
                Ok(())
            }
            ir::Stmt::SetGlobal { global, value } => {
                let g = self.global_named(global)?;
                let want = ctl_kind(&self.ctx.global(g).ty).ok_or(LowerError::ControlType)?;
                let (value, got) = self.lower_ctl_expr(value)?;
                if want != got {
                    return Err(LowerError::ControlType.into());
                }
                out.push(DriverOp::SetGlobal { global: g, value });
                Ok(())
            }
            ir::Stmt::If { cond, then, else_ } => {
                let cond = self.lower_ctl_cond(cond)?;
                let mut t = Vec::new();
                if let Some(b) = then {
                    self.lower_stmt(b, &mut t)?;
                }
                let mut e = Vec::new();
                if let Some(b) = else_ {
                    self.lower_stmt(b, &mut e)?;
                }
                out.push(DriverOp::If { cond, then: t, else_: e });
                Ok(())
            }
            ir::Stmt::While { cond, body } => {
                let cond = self.lower_ctl_cond(cond)?;
                let mut b = Vec::new();
                if let Some(inner) = body {
                    self.lower_stmt(inner, &mut b)?;
                }
                out.push(DriverOp::While { cond, body: b });
                Ok(())
            }
        }
    }

    fn lower_ctl_expr(&self, e: &ir::Expr) -> Result<(ScalarExpr, CtlKind), CompileError> {
        Ok(match e {
            ir::Expr::Const(ExprConst::Num(v)) => (ScalarExpr::Num(*v), CtlKind::Num),
            ir::Expr::Const(ExprConst::Bool(b)) => (ScalarExpr::Bool(*b), CtlKind::Bool),
            ir::Expr::Const(ExprConst::List(_)) => return Err(LowerError::ControlType.into()),
            ir::Expr::GetGlobal(name) => {
                let g = self.global_named(name)?;
                let kind =
                    ctl_kind(&self.ctx.global(g).ty).ok_or(LowerError::ControlType)?;
                (ScalarExpr::ReadGlobal(g), kind)
            }
            ir::Expr::Binary { op, lhs, rhs } => {
                let (l, lk) = self.lower_ctl_expr(lhs)?;
                let (r, rk) = self.lower_ctl_expr(rhs)?;
                if lk != CtlKind::Num || rk != CtlKind::Num {
                    return Err(LowerError::ControlType.into());
                }
                (
                    ScalarExpr::Arith { op: *op, lhs: Box::new(l), rhs: Box::new(r) },
                    CtlKind::Num,
                )
            }
            ir::Expr::Neg(inner) => {
                let (v, k) = self.lower_ctl_expr(inner)?;
                if k != CtlKind::Num {
                    return Err(LowerError::ControlType.into());
                }
                (ScalarExpr::Neg(Box::new(v)), CtlKind::Num)
            }
        })
    }

    fn lower_ctl_cond(&self, c: &ir::Cond) -> Result<CondExpr, CompileError> {
        Ok(match c {
            ir::Cond::Literal(b) => CondExpr::Literal(*b),
            ir::Cond::And(a, b) => CondExpr::And(
                Box::new(self.lower_ctl_cond(a)?),
                Box::new(self.lower_ctl_cond(b)?),
            ),
            ir::Cond::Or(a, b) => CondExpr::Or(
                Box::new(self.lower_ctl_cond(a)?),
                Box::new(self.lower_ctl_cond(b)?),
            ),
            ir::Cond::Not(a) => CondExpr::Not(Box::new(self.lower_ctl_cond(a)?)),
            ir::Cond::Compare { op, lhs, rhs } => {
                let (l, lk) = self.lower_ctl_expr(lhs)?;
                let (r, rk) = self.lower_ctl_expr(rhs)?;
                let ordered = matches!(
                    op,
                    ir::CmpOp::Lt | ir::CmpOp::Le | ir::CmpOp::Gt | ir::CmpOp::Ge
                );
                let legal = if ordered {
                    lk == CtlKind::Num && rk == CtlKind::Num
                } else {
                    lk == rk
                };
                if !legal {
                    return Err(LowerError::ControlType.into());
                }
                CondExpr::Compare { op: *op, lhs: l, rhs: r }
            }
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum CtlKind {
    Num,
    Bool,
}

fn ctl_kind(ty: &Type) -> Option<CtlKind> {
    match ty {
        Type::Prim(Primitive::Bool) => Some(CtlKind::Bool),
        Type::Prim(p) if p.is_numeric() => Some(CtlKind::Num),
        _ => None,
    }
}

// ============================================================================
// Constants
// ============================================================================

/// Typed constant conversion at the host boundary.
pub fn const_to_cell(ty: &Type, c: &ExprConst) -> Result<CellInit, LowerError> {
    fn scalar(p: Primitive, c: &ExprConst) -> Option<Scalar> {
        match (p, c) {
            (Primitive::Bool, ExprConst::Bool(b)) => Some(Scalar::Bool(*b)),
            (Primitive::Bool, _) => None,
            (_, ExprConst::Num(v)) => {
                if p.is_float() {
                    Some(Scalar::Float(*v))
                } else if v.fract() == 0.0 {
                    if p.is_unsigned() {
                        if *v < 0.0 {
                            None
                        } else {
                            Some(Scalar::Uint(*v as u64))
                        }
                    } else {
                        Some(Scalar::Int(*v as i64))
                    }
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    let bad = |detail: &str| LowerError::BadConst { ty: ty.clone(), detail: detail.to_string() };

    match ty {
        Type::Prim(p) => {
            let s = scalar(*p, c).ok_or_else(|| bad("expected a scalar"))?;
            Ok(CellInit { ty: ty.clone(), lanes: vec![s] })
        }
        Type::Vector { elem, len } => {
            let items = match c {
                ExprConst::List(items) if items.len() == *len as usize => items,
                _ => return Err(bad("expected a list of the vector length")),
            };
            let lanes: Option<Vec<Scalar>> = items.iter().map(|i| scalar(*elem, i)).collect();
            Ok(CellInit { ty: ty.clone(), lanes: lanes.ok_or_else(|| bad("bad element"))? })
        }
        Type::Matrix { elem, rows, cols } => {
            let rws = match c {
                ExprConst::List(r) if r.len() == *rows as usize => r,
                _ => return Err(bad("expected one list per row")),
            };
            let mut lanes = Vec::with_capacity(*rows as usize * *cols as usize);
            for r in rws {
                let cs = match r {
                    ExprConst::List(c) if c.len() == *cols as usize => c,
                    _ => return Err(bad("expected one element per column")),
                };
                for c in cs {
                    lanes.push(scalar(*elem, c).ok_or_else(|| bad("bad element"))?);
                }
            }
            Ok(CellInit { ty: ty.clone(), lanes })
        }
        Type::Key(_) => {
            let s = scalar(Primitive::U64, c).ok_or_else(|| bad("expected a row number"))?;
            Ok(CellInit { ty: ty.clone(), lanes: vec![s] })
        }
        _ => Err(bad("type is not storable")),
    }
}

/// Parse a rectangles constant: a list of `[[lo…], [hi…]]` pairs.
fn parse_rectangles(c: &ExprConst) -> Option<Vec<crate::relation::Rect>> {
    let axis = |c: &ExprConst| -> Option<Vec<u64>> {
        match c {
            ExprConst::List(items) => items
                .iter()
                .map(|i| match i {
                    ExprConst::Num(v) if v.fract() == 0.0 && *v >= 0.0 => Some(*v as u64),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    };
    match c {
        ExprConst::List(rects) => rects
            .iter()
            .map(|r| match r {
                ExprConst::List(pair) if pair.len() == 2 => Some(crate::relation::Rect {
                    lo: axis(&pair[0])?,
                    hi: axis(&pair[1])?,
                }),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

// ============================================================================
// Body lowering
// ============================================================================

fn collect_calls(fun: &TypedFun) -> (BTreeSet<(Primitive, u8)>, BTreeSet<FunId>) {
    let mut dots = BTreeSet::new();
    let mut helpers = BTreeSet::new();
    fn walk_expr(
        e: &Expr,
        dots: &mut BTreeSet<(Primitive, u8)>,
        helpers: &mut BTreeSet<FunId>,
    ) {
        match &e.kind {
            ExprKind::Builtin { builtin: Builtin::Dot, args } => {
                if let Type::Vector { elem, len } = &args[0].ty {
                    dots.insert((*elem, *len));
                }
                args.iter().for_each(|a| walk_expr(a, dots, helpers));
            }
            ExprKind::HelperCall { fun, args } => {
                helpers.insert(*fun);
                args.iter().for_each(|a| walk_expr(a, dots, helpers));
            }
            ExprKind::VectorLit(items) => items.iter().for_each(|i| walk_expr(i, dots, helpers)),
            ExprKind::Builtin { args, .. } => {
                args.iter().for_each(|a| walk_expr(a, dots, helpers))
            }
            ExprKind::Unary { expr, .. } | ExprKind::Cast { expr, .. } => {
                walk_expr(expr, dots, helpers)
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                walk_expr(lhs, dots, helpers);
                walk_expr(rhs, dots, helpers);
            }
            ExprKind::FieldAccess { key, .. } => walk_expr(key, dots, helpers),
            ExprKind::Affine { base, .. } => walk_expr(base, dots, helpers),
            ExprKind::UnsafeRow { id, .. } => walk_expr(id, dots, helpers),
            ExprKind::Index { base, indices } => {
                walk_expr(base, dots, helpers);
                indices.iter().for_each(|i| walk_expr(i, dots, helpers));
            }
            ExprKind::Const(_)
            | ExprKind::Param(_)
            | ExprKind::Local(_)
            | ExprKind::GlobalRead(_) => {}
        }
    }
    fn walk_stmt(
        s: &Stmt,
        dots: &mut BTreeSet<(Primitive, u8)>,
        helpers: &mut BTreeSet<FunId>,
    ) {
        match &s.kind {
            StmtKind::Let { init: e, .. }
            | StmtKind::AssignLocal { value: e, .. }
            | StmtKind::GlobalReduce { value: e, .. }
            | StmtKind::Expr(e)
            | StmtKind::Delete { key: e } => walk_expr(e, dots, helpers),
            StmtKind::FieldWrite { key, value, .. }
            | StmtKind::FieldReduce { key, value, .. } => {
                walk_expr(key, dots, helpers);
                walk_expr(value, dots, helpers);
            }
            StmtKind::If { cond, then, else_ } => {
                walk_expr(cond, dots, helpers);
                then.iter().chain(else_).for_each(|s| walk_stmt(s, dots, helpers));
            }
            StmtKind::For { lo, hi, body, .. } => {
                walk_expr(lo, dots, helpers);
                walk_expr(hi, dots, helpers);
                body.iter().for_each(|s| walk_stmt(s, dots, helpers));
            }
            StmtKind::Insert { fields, .. } => {
                fields.iter().for_each(|(_, e)| walk_expr(e, dots, helpers))
            }
            StmtKind::Return(v) => {
                if let Some(e) = v {
                    walk_expr(e, dots, helpers)
                }
            }
        }
    }
    for s in &fun.body {
        walk_stmt(s, &mut dots, &mut helpers);
    }
    (dots, helpers)
}

struct BodyLowerer<'a> {
    ctx: &'a Context,
    sig: &'a SigLayout,
    helper_tasks: &'a HashMap<(FunId, Backend), TaskId>,
    dot_tasks: &'a HashMap<(Primitive, u8), TaskId>,
    backend: Backend,
    kernel: bool,
    scopes: Vec<HashMap<String, u32>>,
    next_slot: u32,
}

/// Lower a typed body into the task IR. Returns the statements and the
/// number of local slots used.
fn lower_body(
    ctx: &Context,
    sig: &SigLayout,
    fun: &TypedFun,
    helper_tasks: &HashMap<(FunId, Backend), TaskId>,
    dot_tasks: &HashMap<(Primitive, u8), TaskId>,
    backend: Backend,
) -> (Vec<LStmt>, u32) {
    let kernel = fun.kind == FunKind::Kernel;
    let mut bl = BodyLowerer {
        ctx,
        sig,
        helper_tasks,
        dot_tasks,
        backend,
        kernel,
        scopes: vec![HashMap::new()],
        next_slot: if kernel { 0 } else { fun.params.len() as u32 },
    };
    let body = fun.body.iter().map(|s| bl.stmt(s)).collect();
    (body, bl.next_slot)
}

impl<'a> BodyLowerer<'a> {
    fn alloc_local(&mut self, name: &str) -> u32 {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.scopes
            .last_mut()
            .expect("body lowerer always has a scope")
            .insert(name.to_string(), slot);
        slot
    }

    fn local_slot(&self, name: &str) -> u32 {
        *self
            .scopes
            .iter()
            .rev()
            .find_map(|s| s.get(name))
            .expect("checker resolved every local")
    }

    fn field_slot(&self, f: FieldId) -> u32 {
        self.sig.field_slot(f).expect("phase listed every touched field")
    }

    fn block(&mut self, stmts: &[Stmt]) -> Vec<LStmt> {
        self.scopes.push(HashMap::new());
        let out = stmts.iter().map(|s| self.stmt(s)).collect();
        self.scopes.pop();
        out
    }

    fn stmt(&mut self, s: &Stmt) -> LStmt {
        match &s.kind {
            StmtKind::Let { name, init, .. } => {
                let init = self.expr(init);
                LStmt::DeclLocal { slot: self.alloc_local(name), init }
            }
            StmtKind::AssignLocal { name, value } => {
                LStmt::SetLocal { slot: self.local_slot(name), value: self.expr(value) }
            }
            StmtKind::FieldWrite { field, key, value } => LStmt::StoreField {
                slot: self.field_slot(*field),
                key: self.expr(key),
                value: self.expr(value),
            },
            StmtKind::FieldReduce { field, key, op, value } => LStmt::ReduceField {
                slot: self.field_slot(*field),
                op: *op,
                key: self.expr(key),
                value: self.expr(value),
            },
            StmtKind::GlobalReduce { op, value, .. } => {
                LStmt::ReduceAccum { op: *op, value: self.expr(value) }
            }
            StmtKind::If { cond, then, else_ } => LStmt::If {
                cond: self.expr(cond),
                then: self.block(then),
                else_: self.block(else_),
            },
            StmtKind::For { var, lo, hi, body } => {
                let lo = self.expr(lo);
                let hi = self.expr(hi);
                self.scopes.push(HashMap::new());
                let slot = self.alloc_local(var);
                let body = body.iter().map(|s| self.stmt(s)).collect();
                self.scopes.pop();
                LStmt::For { slot, lo, hi, body }
            }
            StmtKind::Expr(e) => match &e.kind {
                ExprKind::Builtin { builtin: Builtin::Assert, args } => {
                    LStmt::Assert { cond: self.expr(&args[0]) }
                }
                _ => LStmt::Eval(self.expr(e)),
            },
            StmtKind::Insert { rel, fields } => {
                let mask = self
                    .ctx
                    .relation(*rel)
                    .live_mask
                    .expect("insert targets are elastic");
                let mut values: Vec<(u32, LExpr)> = fields
                    .iter()
                    .map(|(f, e)| (self.field_slot(*f), self.expr(e)))
                    .collect();
                values.push((self.field_slot(mask), LExpr::Const(Scalar::Bool(true))));
                LStmt::Insert { values }
            }
            StmtKind::Delete { .. } => LStmt::DeleteSelf,
            StmtKind::Return(v) => LStmt::Return(v.as_ref().map(|e| self.expr(e))),
        }
    }

    fn expr(&mut self, e: &Expr) -> LExpr {
        match &e.kind {
            ExprKind::Const(s) => LExpr::Const(*s),
            ExprKind::VectorLit(items) => {
                LExpr::Vector(items.iter().map(|i| self.expr(i)).collect())
            }
            ExprKind::Param(i) => {
                if self.kernel {
                    LExpr::Key
                } else {
                    LExpr::Local(*i as u32)
                }
            }
            ExprKind::Local(name) => LExpr::Local(self.local_slot(name)),
            ExprKind::FieldAccess { field, key } => LExpr::LoadField {
                slot: self.field_slot(*field),
                key: Box::new(self.expr(key)),
            },
            ExprKind::GlobalRead(g) => LExpr::ReadGlobal {
                slot: self.sig.global_slot(*g).expect("phase listed every touched global"),
            },
            ExprKind::Affine { target, translation, base } => {
                let src = match &base.ty {
                    Type::Key(r) => self.ctx.relation(*r).shape.bounds(),
                    other => unreachable!("checker typed affine base as a key, got {other}"),
                };
                let dst = self.ctx.relation(*target).shape.bounds();
                LExpr::Offset {
                    src_bounds: src,
                    dst_bounds: dst,
                    translation: translation.clone(),
                    base: Box::new(self.expr(base)),
                }
            }
            ExprKind::UnsafeRow { id, .. } => self.expr(id),
            ExprKind::Builtin { builtin, args } => self.builtin(*builtin, args),
            ExprKind::HelperCall { fun, args } => LExpr::CallTask {
                task: self.helper_tasks[&(*fun, self.backend)],
                args: args.iter().map(|a| self.expr(a)).collect(),
            },
            ExprKind::Unary { op, expr } => LExpr::Unary {
                op: match op {
                    UnaryOp::Neg => LUnOp::Neg,
                    UnaryOp::Not => LUnOp::Not,
                },
                expr: Box::new(self.expr(expr)),
            },
            ExprKind::Binary { op, lhs, rhs } => {
                if *op == BinOp::Pow {
                    return LExpr::Call {
                        f: RuntimeFn::Pow,
                        args: vec![self.expr(lhs), self.expr(rhs)],
                    };
                }
                let lop = match op {
                    BinOp::Add => LBinOp::Add,
                    BinOp::Sub => LBinOp::Sub,
                    BinOp::Mul => LBinOp::Mul,
                    BinOp::Div => LBinOp::Div,
                    BinOp::Mod => LBinOp::Mod,
                    BinOp::Eq => LBinOp::Eq,
                    BinOp::Ne => LBinOp::Ne,
                    BinOp::Lt => LBinOp::Lt,
                    BinOp::Le => LBinOp::Le,
                    BinOp::Gt => LBinOp::Gt,
                    BinOp::Ge => LBinOp::Ge,
                    BinOp::And => LBinOp::And,
                    BinOp::Or => LBinOp::Or,
                    BinOp::Pow => unreachable!("handled above"),
                };
                LExpr::Binary {
                    op: lop,
                    lhs: Box::new(self.expr(lhs)),
                    rhs: Box::new(self.expr(rhs)),
                }
            }
            ExprKind::Index { base, indices } => {
                let idx = match indices.len() {
                    1 => self.expr(&indices[0]),
                    2 => {
                        let cols = match &base.ty {
                            Type::Matrix { cols, .. } => *cols as i64,
                            other => unreachable!("two subscripts on {other}"),
                        };
                        LExpr::Binary {
                            op: LBinOp::Add,
                            lhs: Box::new(LExpr::Binary {
                                op: LBinOp::Mul,
                                lhs: Box::new(self.expr(&indices[0])),
                                rhs: Box::new(LExpr::Const(Scalar::Int(cols))),
                            }),
                            rhs: Box::new(self.expr(&indices[1])),
                        }
                    }
                    n => unreachable!("checker bounded subscripts, got {n}"),
                };
                LExpr::Lane { base: Box::new(self.expr(base)), index: Box::new(idx) }
            }
            ExprKind::Cast { to, expr } => {
                let prim = to.elem().expect("casts target numeric shapes");
                LExpr::Convert { to: prim, expr: Box::new(self.expr(expr)) }
            }
        }
    }

    fn builtin(&mut self, b: Builtin, args: &[Expr]) -> LExpr {
        let call = |f: RuntimeFn, args: Vec<LExpr>| LExpr::Call { f, args };
        let math = |b: Builtin| match b {
            Builtin::Acos => RuntimeFn::Acos,
            Builtin::Asin => RuntimeFn::Asin,
            Builtin::Atan => RuntimeFn::Atan,
            Builtin::Cbrt => RuntimeFn::Cbrt,
            Builtin::Ceil => RuntimeFn::Ceil,
            Builtin::Cos => RuntimeFn::Cos,
            Builtin::Fabs => RuntimeFn::Fabs,
            Builtin::Floor => RuntimeFn::Floor,
            Builtin::Fmod => RuntimeFn::Fmod,
            Builtin::Log => RuntimeFn::Log,
            Builtin::Sin => RuntimeFn::Sin,
            Builtin::Sqrt => RuntimeFn::Sqrt,
            Builtin::Tan => RuntimeFn::Tan,
            Builtin::Pow => RuntimeFn::Pow,
            other => unreachable!("{other:?} is not a math runtime call"),
        };
        match b {
            Builtin::Acos
            | Builtin::Asin
            | Builtin::Atan
            | Builtin::Cbrt
            | Builtin::Ceil
            | Builtin::Cos
            | Builtin::Fabs
            | Builtin::Floor
            | Builtin::Fmod
            | Builtin::Log
            | Builtin::Sin
            | Builtin::Sqrt
            | Builtin::Tan
            | Builtin::Pow => call(math(b), args.iter().map(|a| self.expr(a)).collect()),
            Builtin::Fmin | Builtin::Imin => LExpr::Binary {
                op: LBinOp::Min,
                lhs: Box::new(self.expr(&args[0])),
                rhs: Box::new(self.expr(&args[1])),
            },
            Builtin::Fmax | Builtin::Imax => LExpr::Binary {
                op: LBinOp::Max,
                lhs: Box::new(self.expr(&args[0])),
                rhs: Box::new(self.expr(&args[1])),
            },
            Builtin::Rand => call(RuntimeFn::UniformF64, Vec::new()),
            Builtin::Dot => {
                let shape = match &args[0].ty {
                    Type::Vector { elem, len } => (*elem, *len),
                    other => unreachable!("checker typed dot over vectors, got {other}"),
                };
                LExpr::CallTask {
                    task: self.dot_tasks[&shape],
                    args: args.iter().map(|a| self.expr(a)).collect(),
                }
            }
            Builtin::Id => LExpr::Convert {
                to: Primitive::I64,
                expr: Box::new(self.expr(&args[0])),
            },
            Builtin::Xid | Builtin::Yid | Builtin::Zid => {
                let axis = match b {
                    Builtin::Xid => 0u8,
                    Builtin::Yid => 1,
                    _ => 2,
                };
                let dims = match &args[0].ty {
                    Type::Key(r) => self.ctx.relation(*r).shape.bounds(),
                    other => unreachable!("checker typed axis extraction, got {other}"),
                };
                LExpr::AxisId { axis, dims, base: Box::new(self.expr(&args[0])) }
            }
            Builtin::Assert => unreachable!("assert lowers at statement position"),
            Builtin::Affine | Builtin::UnsafeRow => {
                unreachable!("specializer reduced these to core forms")
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build as b;
    use crate::ir::{build as cb, Recorder};

    fn bump_program(launches: usize) -> Program {
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation { name: "rows".into(), shape: ShapeDecl::Flat { size: 10 } });
        r.decl(Decl::NewField {
            rel: "rows".into(),
            name: "x".into(),
            ty: TypeExpr::Prim(Primitive::I32),
        });
        r.decl(Decl::NewFunction {
            fun: b::kernel(
                "bump",
                "v",
                vec![b::assign(
                    b::member(b::name("v"), "x"),
                    b::binary(BinOp::Add, b::member(b::name("v"), "x"), b::num(1.0)),
                )],
            ),
        });
        for _ in 0..launches {
            r.for_each("bump", "rows", None);
        }
        r.finish().unwrap()
    }

    #[test]
    fn repeated_launches_share_one_memoized_task() {
        let g = compile(&bump_program(3), Backend::Cpu).unwrap();
        assert_eq!(g.tasks.len(), 1);
        let launches: Vec<_> = g
            .driver
            .iter()
            .filter_map(|op| match op {
                DriverOp::Launch { task, .. } => Some(*task),
                _ => None,
            })
            .collect();
        assert_eq!(launches.len(), 3);
        assert!(launches.iter().all(|t| *t == launches[0]));
    }

    #[test]
    fn centered_rmw_gets_reads_and_writes_on_the_universe() {
        let g = compile(&bump_program(1), Backend::Cpu).unwrap();
        let task = &g.tasks[0];
        assert_eq!(task.kind, TaskKind::KernelLoop);
        assert_eq!(task.regions.len(), 1);
        let privs = &task.regions[0].privileges;
        assert!(privs.iter().any(|p| matches!(p, Privilege::Reads(f) if f.len() == 1)));
        assert!(privs.iter().any(|p| matches!(p, Privilege::Writes(f) if f.len() == 1)));
        assert!(!privs.iter().any(|p| matches!(p, Privilege::Reduces { .. })));
    }

    #[test]
    fn driver_prologue_precedes_statement_ops() {
        let g = compile(&bump_program(1), Backend::Cpu).unwrap();
        let kinds: Vec<&'static str> = g
            .driver
            .iter()
            .map(|op| match op {
                DriverOp::DeclareGlobal { .. } => "global",
                DriverOp::AllocRegion { .. } => "alloc",
                DriverOp::BindSubset { .. } => "subset",
                DriverOp::Launch { .. } => "launch",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["alloc", "launch"]);
    }

    #[test]
    fn reducing_kernel_returns_an_identity_seeded_accumulator() {
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation { name: "rows".into(), shape: ShapeDecl::Flat { size: 100 } });
        r.decl(Decl::NewGlobal {
            name: "total".into(),
            ty: TypeExpr::Prim(Primitive::F64),
            init: ExprConst::Num(0.0),
        });
        r.decl(Decl::NewFunction {
            fun: b::kernel(
                "count",
                "k",
                vec![b::reduce(b::name("total"), ReduceOp::Add, b::num(1.0))],
            ),
        });
        r.for_each("count", "rows", None);
        let g = compile(&r.finish().unwrap(), Backend::Cpu).unwrap();

        let task = &g.tasks[0];
        let acc = task.reduction.as_ref().expect("reducing kernel");
        assert_eq!(acc.op, ReduceOp::Add);
        assert_eq!(acc.identity.lanes, vec![Scalar::Float(0.0)]);
        assert_eq!(task.sig.globals.len(), 1);
        assert_eq!(task.sig.globals[0].reduce, Some(ReduceOp::Add));

        assert!(g.driver.iter().any(|op| matches!(
            op,
            DriverOp::Launch { reduce_into: Some(_), .. }
        )));
    }

    #[test]
    fn min_reduction_seeds_with_type_maximum() {
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation { name: "rows".into(), shape: ShapeDecl::Flat { size: 4 } });
        r.decl(Decl::NewField {
            rel: "rows".into(),
            name: "x".into(),
            ty: TypeExpr::Prim(Primitive::I32),
        });
        r.decl(Decl::NewGlobal {
            name: "lo".into(),
            ty: TypeExpr::Prim(Primitive::I32),
            init: ExprConst::Num(0.0),
        });
        r.decl(Decl::NewFunction {
            fun: b::kernel(
                "mn",
                "k",
                vec![b::reduce(b::name("lo"), ReduceOp::Min, b::member(b::name("k"), "x"))],
            ),
        });
        r.for_each("mn", "rows", None);
        let g = compile(&r.finish().unwrap(), Backend::Cpu).unwrap();
        let acc = g.tasks[0].reduction.as_ref().unwrap();
        assert_eq!(acc.identity.lanes, vec![Scalar::Int(i32::MAX as i64)]);
    }

    #[test]
    fn subset_launch_binds_the_subset_domain() {
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation {
            name: "mesh".into(),
            shape: ShapeDecl::Grid { dims: vec![4, 4], n_bd: 1 },
        });
        r.decl(Decl::NewField {
            rel: "mesh".into(),
            name: "f".into(),
            ty: TypeExpr::Prim(Primitive::F64),
        });
        r.decl(Decl::NewFunction {
            fun: b::kernel(
                "zero",
                "c",
                vec![b::assign(b::member(b::name("c"), "f"), b::num(0.0))],
            ),
        });
        r.for_each("zero", "mesh", Some("mesh.boundary"));
        let g = compile(&r.finish().unwrap(), Backend::Cpu).unwrap();

        let task = &g.tasks[0];
        assert!(task.sig.subset.is_some());
        assert!(task.sig.use_boolmask);
        assert!(g
            .driver
            .iter()
            .any(|op| matches!(op, DriverOp::Launch { domain: DomainRef::Subset(_), .. })));
        // The boundary and interior subsets were bound in the prologue.
        let binds = g
            .driver
            .iter()
            .filter(|op| matches!(op, DriverOp::BindSubset { .. }))
            .count();
        assert_eq!(binds, 2);
    }

    #[test]
    fn multi_rectangle_subsets_are_skipped_and_unlaunchable() {
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation {
            name: "mesh".into(),
            shape: ShapeDecl::Grid { dims: vec![4, 4], n_bd: 0 },
        });
        r.decl(Decl::NewSubset {
            rel: "mesh".into(),
            name: "bands".into(),
            rectangles: ExprConst::List(vec![
                ExprConst::List(vec![
                    ExprConst::List(vec![ExprConst::Num(0.0), ExprConst::Num(0.0)]),
                    ExprConst::List(vec![ExprConst::Num(3.0), ExprConst::Num(0.0)]),
                ]),
                ExprConst::List(vec![
                    ExprConst::List(vec![ExprConst::Num(0.0), ExprConst::Num(3.0)]),
                    ExprConst::List(vec![ExprConst::Num(3.0), ExprConst::Num(3.0)]),
                ]),
            ]),
        });
        r.decl(Decl::NewFunction { fun: b::kernel("noop", "c", vec![]) });
        r.for_each("noop", "mesh", Some("bands"));
        let err = compile(&r.finish().unwrap(), Backend::Cpu).unwrap_err();
        assert!(matches!(
            err,
            CompileError::Lower(LowerError::SubsetNotBound(name)) if name == "bands"
        ));
    }

    #[test]
    fn single_rectangle_subsets_bind_fine() {
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation {
            name: "mesh".into(),
            shape: ShapeDecl::Grid { dims: vec![4, 4], n_bd: 0 },
        });
        r.decl(Decl::NewSubset {
            rel: "mesh".into(),
            name: "row0".into(),
            rectangles: ExprConst::List(vec![ExprConst::List(vec![
                ExprConst::List(vec![ExprConst::Num(0.0), ExprConst::Num(0.0)]),
                ExprConst::List(vec![ExprConst::Num(3.0), ExprConst::Num(0.0)]),
            ])]),
        });
        r.decl(Decl::NewFunction { fun: b::kernel("noop", "c", vec![]) });
        r.for_each("noop", "mesh", Some("row0"));
        let g = compile(&r.finish().unwrap(), Backend::Cpu).unwrap();
        assert!(g
            .driver
            .iter()
            .any(|op| matches!(op, DriverOp::BindSubset { .. })));
    }

    #[test]
    fn insert_kernels_are_cpu_only() {
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation { name: "src".into(), shape: ShapeDecl::Flat { size: 4 } });
        r.decl(Decl::NewRelation { name: "dst".into(), shape: ShapeDecl::Flat { size: 4 } });
        r.decl(Decl::NewField {
            rel: "dst".into(),
            name: "a".into(),
            ty: TypeExpr::Prim(Primitive::F64),
        });
        r.decl(Decl::NewFunction {
            fun: b::kernel(
                "spawn",
                "k",
                vec![b::insert(b::name("dst"), vec![("a", b::num(1.0))])],
            ),
        });
        r.for_each("spawn", "src", None);
        let p = r.finish().unwrap();

        assert!(matches!(
            compile(&p, Backend::Gpu),
            Err(CompileError::Lower(LowerError::UnsupportedBackend))
        ));
        let g = compile(&p, Backend::Cpu).unwrap();
        // Insert target columns (payload + live mask) are writable.
        let task = &g.tasks[0];
        assert_eq!(task.sig.insert_into, Some(RelationId(1)));
        assert!(task
            .regions
            .iter()
            .any(|r| r.relation == RelationId(1)
                && r.privileges.iter().any(|p| matches!(p, Privilege::Writes(f) if f.len() == 2))));
    }

    #[test]
    fn annotated_kernel_launched_on_wrong_relation_is_an_arity_error() {
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation { name: "a".into(), shape: ShapeDecl::Flat { size: 4 } });
        r.decl(Decl::NewRelation { name: "b".into(), shape: ShapeDecl::Flat { size: 4 } });
        let mut fun = b::kernel("pinned", "k", vec![]);
        fun.params[0].ty = Some(TypeExpr::Key { rel: "a".into() });
        r.decl(Decl::NewFunction { fun });
        r.for_each("pinned", "b", None);
        assert!(matches!(
            compile(&r.finish().unwrap(), Backend::Cpu),
            Err(CompileError::Arity(ArityError::WrongRelation { .. }))
        ));
    }

    #[test]
    fn dot_tasks_are_generated_once_per_shape() {
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation { name: "rows".into(), shape: ShapeDecl::Flat { size: 4 } });
        r.decl(Decl::NewField {
            rel: "rows".into(),
            name: "v".into(),
            ty: TypeExpr::Vector { elem: Primitive::F64, len: 3 },
        });
        r.decl(Decl::NewField {
            rel: "rows".into(),
            name: "n".into(),
            ty: TypeExpr::Prim(Primitive::F64),
        });
        let dot = |a: crate::ast::RawExpr, b_: crate::ast::RawExpr| {
            b::call(b::name("dot"), vec![a, b_])
        };
        r.decl(Decl::NewFunction {
            fun: b::kernel(
                "norms",
                "k",
                vec![b::assign(
                    b::member(b::name("k"), "n"),
                    b::binary(
                        BinOp::Add,
                        dot(b::member(b::name("k"), "v"), b::member(b::name("k"), "v")),
                        dot(b::member(b::name("k"), "v"), b::member(b::name("k"), "v")),
                    ),
                )],
            ),
        });
        r.for_each("norms", "rows", None);
        let g = compile(&r.finish().unwrap(), Backend::Cpu).unwrap();

        let dots: Vec<_> =
            g.tasks.iter().filter(|t| t.name.starts_with("dot_")).collect();
        assert_eq!(dots.len(), 1);
        assert_eq!(dots[0].name, "dot_f64x3");
        assert_eq!(dots[0].kind, TaskKind::HelperExpr);
        assert_eq!(dots[0].param_slots, 2);
    }

    #[test]
    fn while_and_set_global_lower_with_type_consistency() {
        let mut r = Recorder::new();
        r.decl(Decl::NewGlobal {
            name: "g".into(),
            ty: TypeExpr::Prim(Primitive::F64),
            init: ExprConst::Num(0.0),
        });
        r.set_global("g", cb::add(cb::get("g"), cb::num(1.0)));
        r.while_(cb::lt(cb::get("g"), cb::num(3.0)));
        r.set_global("g", cb::add(cb::get("g"), cb::num(1.0)));
        r.end().unwrap();
        let g = compile(&r.finish().unwrap(), Backend::Cpu).unwrap();
        assert!(g.driver.iter().any(|op| matches!(op, DriverOp::While { .. })));

        // Comparing a bool global against a number is rejected.
        let mut r = Recorder::new();
        r.decl(Decl::NewGlobal {
            name: "flag".into(),
            ty: TypeExpr::Prim(Primitive::Bool),
            init: ExprConst::Bool(false),
        });
        r.if_(cb::lt(cb::get("flag"), cb::num(1.0)));
        r.end().unwrap();
        assert!(matches!(
            compile(&r.finish().unwrap(), Backend::Cpu),
            Err(CompileError::Lower(LowerError::ControlType))
        ));
    }
}
