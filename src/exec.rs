//! Reference executor
//!
//! Interprets a [`TaskGraph`] exactly per the execution contract the
//! lowering commits to: driver ops run in program order, every launch is a
//! barrier, per-key instances are pure data-flow over their key, cross-key
//! communication happens only through declared reductions, and a global
//! reduced by a kernel is rebound from the task's returned accumulator
//! after the launch completes.
//!
//! This is the test harness's ground truth, not a production runtime: it
//! runs keys sequentially (any order is a legal schedule) and it
//! **asserts privileges** — a body that touches a column its task did not
//! declare is an executor error, which keeps the lowering honest.
//!
//! Storage follows the region model: one contiguous byte buffer per
//! relation, field columns aliasing packed sub-ranges, addressed through
//! the same layout descriptors the tasks advertise. Insert reserves
//! `concrete + |domain|` slots at the tail before the launch, trims to
//! `concrete + n_inserted` after it, and marks the relation fragmented;
//! delete clears live flags and defragments when occupancy drops below
//! one half (no hysteresis).

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::HashMap;

use tracing::debug;

use crate::ast::ReduceOp;
use crate::layout::{Dld, DldType};
use crate::relation::{FieldId, GlobalId, RelationId, SubsetData, SubsetId};
use crate::task::{
    Backend, CellInit, ColumnDecl, CondExpr, DomainRef, DriverOp, LBinOp, LExpr, LStmt, LUnOp,
    Privilege, RuntimeFn, ScalarExpr, TaskGraph, TaskId, TaskSpec,
};
use crate::types::{Primitive, Scalar};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The `assert` builtin tripped. The message is fixed.
    #[error("assertion failed in kernel task")]
    Assertion,
    #[error("task graph targets {0:?}; the reference executor runs cpu graphs only")]
    WrongBackend(Backend),
    #[error("key {key} out of range ({rows} rows)")]
    KeyOutOfRange { key: u64, rows: u64 },
    #[error("task {task:?} lacks the {action} privilege on column {field:?}")]
    Privilege { task: String, action: &'static str, field: FieldId },
    #[error("region for relation {0:?} was never allocated")]
    NoRegion(RelationId),
    #[error("global {0:?} was never declared")]
    NoGlobal(GlobalId),
    #[error("subset {0:?} was never bound")]
    NoSubset(SubsetId),
    #[error("field {0:?} belongs to no allocated region")]
    UnknownField(FieldId),
    #[error("integer division by zero")]
    DivideByZero,
}

// ============================================================================
// Values
// ============================================================================

/// Interpreter value: widened scalars plus flattened vector/matrix lanes.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    B(bool),
    I(i64),
    U(u64),
    F(f64),
    Lanes(Vec<Value>),
}

impl Value {
    fn from_scalar(s: Scalar) -> Value {
        match s {
            Scalar::Bool(b) => Value::B(b),
            Scalar::Int(v) => Value::I(v),
            Scalar::Uint(v) => Value::U(v),
            Scalar::Float(v) => Value::F(v),
        }
    }

    fn from_cell(c: &CellInit) -> Value {
        if c.lanes.len() == 1 {
            Value::from_scalar(c.lanes[0])
        } else {
            Value::Lanes(c.lanes.iter().map(|s| Value::from_scalar(*s)).collect())
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Value::B(b) => *b as u8 as f64,
            Value::I(v) => *v as f64,
            Value::U(v) => *v as f64,
            Value::F(v) => *v,
            Value::Lanes(_) => f64::NAN,
        }
    }

    fn as_key(&self, rows: u64) -> Result<u64, ExecError> {
        let k = match self {
            Value::U(v) => *v,
            Value::I(v) if *v >= 0 => *v as u64,
            other => {
                return Err(ExecError::KeyOutOfRange {
                    key: other.as_f64() as u64,
                    rows,
                })
            }
        };
        if k >= rows {
            return Err(ExecError::KeyOutOfRange { key: k, rows });
        }
        Ok(k)
    }

    fn truthy(&self) -> bool {
        matches!(self, Value::B(true))
    }
}

// ============================================================================
// Regions
// ============================================================================

#[derive(Debug)]
struct Region {
    relation: RelationId,
    /// Allocated slots.
    capacity: u64,
    /// Materialized rows (live and dead).
    concrete: u64,
    columns: Vec<ColumnDecl>,
    /// Byte offset of each column within `buf`, for the current capacity.
    offsets: HashMap<FieldId, u64>,
    buf: Vec<u8>,
    live_mask: Option<FieldId>,
    fragmented: bool,
}

impl Region {
    fn new(relation: RelationId, n_rows: u64, columns: Vec<ColumnDecl>, live_mask: Option<FieldId>) -> Region {
        let mut r = Region {
            relation,
            capacity: n_rows,
            concrete: n_rows,
            columns,
            offsets: HashMap::new(),
            buf: Vec::new(),
            live_mask,
            fragmented: false,
        };
        r.buf = vec![0u8; r.layout_bytes(n_rows) as usize];
        r.recompute_offsets();
        if live_mask.is_some() {
            for row in 0..n_rows {
                r.set_live(row, true);
            }
        }
        r
    }

    fn layout_bytes(&self, capacity: u64) -> u64 {
        self.columns.iter().map(|c| c.ty.packed_bytes() * capacity).sum()
    }

    fn recompute_offsets(&mut self) {
        self.offsets.clear();
        let mut off = 0u64;
        for c in &self.columns {
            self.offsets.insert(c.field, off);
            off += c.ty.packed_bytes() * self.capacity;
        }
    }

    fn column_ty(&self, field: FieldId) -> DldType {
        self.columns
            .iter()
            .find(|c| c.field == field)
            .expect("column belongs to this region")
            .ty
    }

    /// Layout descriptor for one column, as handed across task boundaries.
    fn dld(&self, field: FieldId) -> Dld {
        let ty = self.column_ty(field);
        let base = self.buf.as_ptr() as usize + self.offsets[&field] as usize;
        Dld::compact(ty, self.concrete, base)
    }

    /// Grow capacity, preserving column contents.
    fn reserve(&mut self, capacity: u64) {
        if capacity <= self.capacity {
            return;
        }
        let old_offsets = self.offsets.clone();
        let old_capacity = self.capacity;
        let mut buf = vec![0u8; self.layout_bytes(capacity) as usize];
        let mut off = 0u64;
        for c in &self.columns {
            let w = c.ty.packed_bytes();
            let src = old_offsets[&c.field];
            buf[(off as usize)..(off + w * old_capacity) as usize]
                .copy_from_slice(&self.buf[(src as usize)..(src + w * old_capacity) as usize]);
            off += w * capacity;
        }
        self.buf = buf;
        self.capacity = capacity;
        self.recompute_offsets();
    }

    fn lane_offset(&self, field: FieldId, row: u64, lane: u64) -> (usize, Primitive) {
        let ty = self.column_ty(field);
        debug_assert!(lane < ty.vector_size);
        let off = self.offsets[&field] + row * ty.packed_bytes() + lane * ty.base_bytes;
        (off as usize, ty.base_type)
    }

    fn read(&self, field: FieldId, row: u64) -> Value {
        let ty = self.column_ty(field);
        if ty.vector_size == 1 {
            let (off, p) = self.lane_offset(field, row, 0);
            read_lane(&self.buf, off, p)
        } else {
            Value::Lanes(
                (0..ty.vector_size)
                    .map(|lane| {
                        let (off, p) = self.lane_offset(field, row, lane);
                        read_lane(&self.buf, off, p)
                    })
                    .collect(),
            )
        }
    }

    fn write(&mut self, field: FieldId, row: u64, v: &Value) {
        let ty = self.column_ty(field);
        if ty.vector_size == 1 {
            let (off, p) = self.lane_offset(field, row, 0);
            write_lane(&mut self.buf, off, p, v);
        } else {
            let lanes = match v {
                Value::Lanes(l) => l.clone(),
                scalar => vec![scalar.clone(); ty.vector_size as usize],
            };
            for (lane, lv) in lanes.iter().enumerate() {
                let (off, p) = self.lane_offset(field, row, lane as u64);
                write_lane(&mut self.buf, off, p, lv);
            }
        }
    }

    fn is_live(&self, row: u64) -> bool {
        match self.live_mask {
            None => true,
            Some(mask) => matches!(self.read(mask, row), Value::B(true)),
        }
    }

    fn set_live(&mut self, row: u64, live: bool) {
        let mask = self.live_mask.expect("elastic region");
        self.write(mask, row, &Value::B(live));
    }

    fn live_count(&self) -> u64 {
        (0..self.concrete).filter(|&r| self.is_live(r)).count() as u64
    }

    /// Compact live rows to the front, preserving order.
    fn defragment(&mut self) {
        let columns = self.columns.clone();
        let mut dst = 0u64;
        for src in 0..self.concrete {
            if !self.is_live(src) {
                continue;
            }
            if src != dst {
                for c in &columns {
                    let v = self.read(c.field, src);
                    self.write(c.field, dst, &v);
                }
            }
            dst += 1;
        }
        self.concrete = dst;
        for row in 0..dst {
            self.set_live(row, true);
        }
        self.fragmented = false;
    }
}

fn read_lane(buf: &[u8], off: usize, p: Primitive) -> Value {
    let n = p.size_in_bytes() as usize;
    let bytes = &buf[off..off + n];
    match p {
        Primitive::Bool => Value::B(bytes[0] != 0),
        Primitive::I8 => Value::I(bytes[0] as i8 as i64),
        Primitive::I16 => Value::I(i16::from_le_bytes([bytes[0], bytes[1]]) as i64),
        Primitive::I32 => {
            Value::I(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64)
        }
        Primitive::I64 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(bytes);
            Value::I(i64::from_le_bytes(b))
        }
        Primitive::U8 => Value::U(bytes[0] as u64),
        Primitive::U16 => Value::U(u16::from_le_bytes([bytes[0], bytes[1]]) as u64),
        Primitive::U32 => {
            Value::U(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64)
        }
        Primitive::U64 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(bytes);
            Value::U(u64::from_le_bytes(b))
        }
        Primitive::F32 => {
            Value::F(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64)
        }
        Primitive::F64 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(bytes);
            Value::F(f64::from_le_bytes(b))
        }
    }
}

fn write_lane(buf: &mut [u8], off: usize, p: Primitive, v: &Value) {
    let write = |buf: &mut [u8], bytes: &[u8]| buf[off..off + bytes.len()].copy_from_slice(bytes);
    match p {
        Primitive::Bool => write(buf, &[v.truthy() as u8]),
        Primitive::I8 => write(buf, &(as_i64(v) as i8).to_le_bytes()),
        Primitive::I16 => write(buf, &(as_i64(v) as i16).to_le_bytes()),
        Primitive::I32 => write(buf, &(as_i64(v) as i32).to_le_bytes()),
        Primitive::I64 => write(buf, &as_i64(v).to_le_bytes()),
        Primitive::U8 => write(buf, &(as_u64(v) as u8).to_le_bytes()),
        Primitive::U16 => write(buf, &(as_u64(v) as u16).to_le_bytes()),
        Primitive::U32 => write(buf, &(as_u64(v) as u32).to_le_bytes()),
        Primitive::U64 => write(buf, &as_u64(v).to_le_bytes()),
        Primitive::F32 => write(buf, &(v.as_f64() as f32).to_le_bytes()),
        Primitive::F64 => write(buf, &v.as_f64().to_le_bytes()),
    }
}

fn as_i64(v: &Value) -> i64 {
    match v {
        Value::B(b) => *b as i64,
        Value::I(x) => *x,
        Value::U(x) => *x as i64,
        Value::F(x) => *x as i64,
        Value::Lanes(_) => 0,
    }
}

fn as_u64(v: &Value) -> u64 {
    match v {
        Value::B(b) => *b as u64,
        Value::I(x) => *x as u64,
        Value::U(x) => *x,
        Value::F(x) => *x as u64,
        Value::Lanes(_) => 0,
    }
}

// ============================================================================
// Machine
// ============================================================================

/// All mutable state of one driver run.
#[derive(Debug)]
pub struct Machine {
    regions: Vec<Option<Region>>,
    globals: Vec<Option<Value>>,
    global_prims: Vec<Option<Primitive>>,
    subsets: HashMap<SubsetId, (RelationId, SubsetData)>,
    field_home: HashMap<FieldId, RelationId>,
}

impl Machine {
    fn new() -> Machine {
        Machine {
            regions: Vec::new(),
            globals: Vec::new(),
            global_prims: Vec::new(),
            subsets: HashMap::new(),
            field_home: HashMap::new(),
        }
    }

    fn region(&self, rel: RelationId) -> Result<&Region, ExecError> {
        self.regions
            .get(rel.as_usize())
            .and_then(|r| r.as_ref())
            .ok_or(ExecError::NoRegion(rel))
    }

    fn region_mut(&mut self, rel: RelationId) -> Result<&mut Region, ExecError> {
        self.regions
            .get_mut(rel.as_usize())
            .and_then(|r| r.as_mut())
            .ok_or(ExecError::NoRegion(rel))
    }

    fn field_region(&self, field: FieldId) -> Result<&Region, ExecError> {
        let rel = *self.field_home.get(&field).ok_or(ExecError::UnknownField(field))?;
        self.region(rel)
    }

    /// Final value of a global, for hosts inspecting the run.
    pub fn global_value(&self, g: GlobalId) -> Result<&Value, ExecError> {
        self.globals
            .get(g.as_usize())
            .and_then(|v| v.as_ref())
            .ok_or(ExecError::NoGlobal(g))
    }

    /// Read one row of one field, for hosts inspecting the run.
    pub fn read_field(&self, field: FieldId, row: u64) -> Result<Value, ExecError> {
        let region = self.field_region(field)?;
        if row >= region.concrete {
            return Err(ExecError::KeyOutOfRange { key: row, rows: region.concrete });
        }
        Ok(region.read(field, row))
    }

    /// Rows currently materialized for a relation (live and dead).
    pub fn concrete_size(&self, rel: RelationId) -> Result<u64, ExecError> {
        Ok(self.region(rel)?.concrete)
    }

    /// Live rows of a relation.
    pub fn live_size(&self, rel: RelationId) -> Result<u64, ExecError> {
        Ok(self.region(rel)?.live_count())
    }

    /// Whether deletions or inserts have left the relation fragmented.
    pub fn is_fragmented(&self, rel: RelationId) -> Result<bool, ExecError> {
        Ok(self.region(rel)?.fragmented)
    }

    /// Layout descriptor for one column, as a DLD-aware interface sees it.
    pub fn field_dld(&self, field: FieldId) -> Result<Dld, ExecError> {
        Ok(self.field_region(field)?.dld(field))
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Run a compiled graph to completion and hand back the machine state.
pub fn run(graph: &TaskGraph) -> Result<Machine, ExecError> {
    if graph.manifest.backend != Backend::Cpu {
        return Err(ExecError::WrongBackend(graph.manifest.backend));
    }
    let mut m = Machine::new();
    exec_ops(graph, &mut m, &graph.driver)?;
    Ok(m)
}

fn exec_ops(graph: &TaskGraph, m: &mut Machine, ops: &[DriverOp]) -> Result<(), ExecError> {
    for op in ops {
        match op {
            DriverOp::DeclareGlobal { global, init } => {
                let i = global.as_usize();
                if m.globals.len() <= i {
                    m.globals.resize(i + 1, None);
                    m.global_prims.resize(i + 1, None);
                }
                m.globals[i] = Some(Value::from_cell(init));
                m.global_prims[i] = init.ty.elem();
            }
            DriverOp::AllocRegion { relation, n_rows, columns, live_mask } => {
                let i = relation.as_usize();
                if m.regions.len() <= i {
                    m.regions.resize_with(i + 1, || None);
                }
                for c in columns {
                    m.field_home.insert(c.field, *relation);
                }
                m.regions[i] = Some(Region::new(*relation, *n_rows, columns.clone(), *live_mask));
            }
            DriverOp::BindSubset { subset, relation, data } => {
                m.subsets.insert(*subset, (*relation, data.clone()));
            }
            DriverOp::Launch { task, domain, reduce_into } => {
                launch(graph, m, *task, *domain, *reduce_into)?;
            }
            DriverOp::Fill { field, value } => {
                let rel = *m.field_home.get(field).ok_or(ExecError::UnknownField(*field))?;
                let v = Value::from_cell(value);
                let region = m.region_mut(rel)?;
                // Fill walks the column through its descriptor.
                let dld = region.dld(*field);
                for row in 0..dld.logical_size {
                    region.write(*field, row, &v);
                }
            }
            DriverOp::SetGlobal { global, value } => {
                let v = eval_scalar(m, value)?;
                let i = global.as_usize();
                let converted = match m.global_prims.get(i).copied().flatten() {
                    Some(p) => convert(&v, p),
                    None => return Err(ExecError::NoGlobal(*global)),
                };
                m.globals[i] = Some(converted);
            }
            DriverOp::If { cond, then, else_ } => {
                if eval_cond(m, cond)? {
                    exec_ops(graph, m, then)?;
                } else {
                    exec_ops(graph, m, else_)?;
                }
            }
            DriverOp::While { cond, body } => {
                while eval_cond(m, cond)? {
                    exec_ops(graph, m, body)?;
                }
            }
        }
    }
    Ok(())
}

fn eval_scalar(m: &Machine, e: &ScalarExpr) -> Result<Value, ExecError> {
    Ok(match e {
        ScalarExpr::Num(v) => Value::F(*v),
        ScalarExpr::Bool(b) => Value::B(*b),
        ScalarExpr::ReadGlobal(g) => m.global_value(*g)?.clone(),
        ScalarExpr::Arith { op, lhs, rhs } => {
            let l = eval_scalar(m, lhs)?.as_f64();
            let r = eval_scalar(m, rhs)?.as_f64();
            Value::F(match op {
                crate::ir::ArithOp::Add => l + r,
                crate::ir::ArithOp::Sub => l - r,
                crate::ir::ArithOp::Mul => l * r,
                crate::ir::ArithOp::Div => l / r,
                crate::ir::ArithOp::Mod => l % r,
            })
        }
        ScalarExpr::Neg(inner) => Value::F(-eval_scalar(m, inner)?.as_f64()),
    })
}

fn eval_cond(m: &Machine, c: &CondExpr) -> Result<bool, ExecError> {
    Ok(match c {
        CondExpr::Literal(b) => *b,
        CondExpr::And(a, b) => eval_cond(m, a)? && eval_cond(m, b)?,
        CondExpr::Or(a, b) => eval_cond(m, a)? || eval_cond(m, b)?,
        CondExpr::Not(a) => !eval_cond(m, a)?,
        CondExpr::Compare { op, lhs, rhs } => {
            let l = eval_scalar(m, lhs)?;
            let r = eval_scalar(m, rhs)?;
            match (l, r) {
                (Value::B(a), Value::B(b)) => match op {
                    crate::ir::CmpOp::Eq => a == b,
                    crate::ir::CmpOp::Ne => a != b,
                    _ => false,
                },
                (a, b) => {
                    let (a, b) = (a.as_f64(), b.as_f64());
                    match op {
                        crate::ir::CmpOp::Eq => a == b,
                        crate::ir::CmpOp::Ne => a != b,
                        crate::ir::CmpOp::Lt => a < b,
                        crate::ir::CmpOp::Le => a <= b,
                        crate::ir::CmpOp::Gt => a > b,
                        crate::ir::CmpOp::Ge => a >= b,
                    }
                }
            }
        }
    })
}

// ============================================================================
// Launch
// ============================================================================

/// Relation whose rows the launch iterates.
fn domain_relation(m: &Machine, domain: DomainRef) -> Result<RelationId, ExecError> {
    match domain {
        DomainRef::Universe(r) => Ok(r),
        DomainRef::Subset(s) => {
            m.subsets.get(&s).map(|(rel, _)| *rel).ok_or(ExecError::NoSubset(s))
        }
    }
}

fn domain_keys(m: &Machine, domain: DomainRef, rel: RelationId) -> Result<Vec<u64>, ExecError> {
    match domain {
        DomainRef::Universe(_) => {
            let region = m.region(rel)?;
            Ok((0..region.concrete).filter(|&k| region.is_live(k)).collect())
        }
        DomainRef::Subset(s) => match &m.subsets.get(&s).ok_or(ExecError::NoSubset(s))?.1 {
            SubsetData::Mask(mask) => Ok(mask
                .iter()
                .enumerate()
                .filter_map(|(i, &b)| b.then_some(i as u64))
                .collect()),
            SubsetData::Indices(ix) => Ok(ix.clone()),
        },
    }
}

fn launch(
    graph: &TaskGraph,
    m: &mut Machine,
    task: TaskId,
    domain: DomainRef,
    reduce_into: Option<GlobalId>,
) -> Result<(), ExecError> {
    let spec = graph.task(task);
    let domain_rel = domain_relation(m, domain)?;
    let keys = domain_keys(m, domain, domain_rel)?;
    debug!(task = %spec.name, keys = keys.len(), "launch");

    // Insert reserves concrete + |domain| slots at the tail before launch.
    if let Some(target) = spec.sig.insert_into {
        let need = {
            let r = m.region(target)?;
            r.concrete + keys.len() as u64
        };
        m.region_mut(target)?.reserve(need);
    }

    let mut interp = Interp {
        graph,
        m: &mut *m,
        spec,
        domain_rel,
        accum: spec.reduction.as_ref().map(|a| Value::from_cell(&a.identity)),
        inserted: 0,
    };
    for k in keys {
        let mut frame = vec![Value::F(0.0); spec.local_slots as usize];
        interp.exec_body(&spec.body, &mut frame, k)?;
    }
    let accum = interp.accum.take();
    let inserted = interp.inserted;

    // Commit tail inserts, trim concrete size, mark fragmented.
    if let Some(target) = spec.sig.insert_into {
        let region = m.region_mut(target)?;
        region.concrete += inserted;
        region.fragmented = true;
    }
    // Commit deletions; defragment below half occupancy.
    if spec.body_deletes() {
        let region = m.region_mut(domain_rel)?;
        region.fragmented = true;
        let live = region.live_count();
        if live * 2 < region.concrete {
            debug!(relation = ?region.relation, live, concrete = region.concrete, "defragmenting");
            region.defragment();
        }
    }
    // Rebind the reduced global from the task's return value.
    if let (Some(g), Some(acc)) = (reduce_into, accum) {
        let op = spec.reduction.as_ref().expect("reducing task").op;
        let current = m.global_value(g)?.clone();
        let merged = apply_reduce(op, &current, &acc)?;
        let p = m.global_prims[g.as_usize()].expect("numeric global");
        m.globals[g.as_usize()] = Some(convert(&merged, p));
    }
    Ok(())
}

impl TaskSpec {
    fn body_deletes(&self) -> bool {
        fn walk(stmts: &[LStmt]) -> bool {
            stmts.iter().any(|s| match s {
                LStmt::DeleteSelf => true,
                LStmt::If { then, else_, .. } => walk(then) || walk(else_),
                LStmt::For { body, .. } => walk(body),
                _ => false,
            })
        }
        walk(&self.body)
    }
}

// ============================================================================
// Body interpreter
// ============================================================================

enum Flow {
    Normal,
    Returned(Option<Value>),
}

struct Interp<'a> {
    graph: &'a TaskGraph,
    m: &'a mut Machine,
    spec: &'a TaskSpec,
    /// Relation the launch iterates; `DeleteSelf` clears its live flags.
    domain_rel: RelationId,
    accum: Option<Value>,
    inserted: u64,
}

impl<'a> Interp<'a> {
    fn exec_body(&mut self, body: &[LStmt], locals: &mut Vec<Value>, key: u64) -> Result<(), ExecError> {
        match self.stmts(body, locals, key)? {
            Flow::Normal | Flow::Returned(None) => Ok(()),
            Flow::Returned(Some(_)) => Ok(()),
        }
    }

    fn stmts(&mut self, stmts: &[LStmt], locals: &mut Vec<Value>, key: u64) -> Result<Flow, ExecError> {
        for s in stmts {
            match self.stmt(s, locals, key)? {
                Flow::Normal => {}
                done => return Ok(done),
            }
        }
        Ok(Flow::Normal)
    }

    fn check_privilege(&self, field: FieldId, action: &'static str) -> Result<(), ExecError> {
        let ok = self.spec.regions.iter().any(|r| {
            r.privileges.iter().any(|p| match (p, action) {
                (Privilege::Reads(f), "read") => f.contains(&field),
                (Privilege::Writes(f), "write") => f.contains(&field),
                (Privilege::Reduces { fields, .. }, "reduce") => fields.contains(&field),
                _ => false,
            })
        });
        if ok {
            Ok(())
        } else {
            Err(ExecError::Privilege { task: self.spec.name.clone(), action, field })
        }
    }

    fn field_of_slot(&self, slot: u32) -> FieldId {
        self.spec.sig.fields[slot as usize].field
    }

    fn stmt(&mut self, s: &LStmt, locals: &mut Vec<Value>, key: u64) -> Result<Flow, ExecError> {
        match s {
            LStmt::DeclLocal { slot, init } | LStmt::SetLocal { slot, value: init } => {
                let v = self.eval(init, locals, key)?;
                locals[*slot as usize] = v;
                Ok(Flow::Normal)
            }
            LStmt::StoreField { slot, key: kexpr, value } => {
                let field = self.field_of_slot(*slot);
                self.check_privilege(field, "write")?;
                let v = self.eval(value, locals, key)?;
                let k = self.eval_key(kexpr, locals, key, field)?;
                let rel = self.m.field_home[&field];
                self.m.region_mut(rel)?.write(field, k, &v);
                Ok(Flow::Normal)
            }
            LStmt::ReduceField { slot, op, key: kexpr, value } => {
                let field = self.field_of_slot(*slot);
                self.check_privilege(field, "reduce")?;
                let v = self.eval(value, locals, key)?;
                let k = self.eval_key(kexpr, locals, key, field)?;
                let rel = self.m.field_home[&field];
                let current = self.m.region(rel)?.read(field, k);
                let merged = apply_reduce(*op, &current, &v)?;
                self.m.region_mut(rel)?.write(field, k, &merged);
                Ok(Flow::Normal)
            }
            LStmt::ReduceAccum { op, value } => {
                // Contributions fold with the op's combining form (`+` for
                // `+=`/`-=`, `×` for `×=`/`÷=`); the driver applies the
                // declared op once, against the returned total.
                let v = self.eval(value, locals, key)?;
                let acc = self.accum.take().expect("reducing task has an accumulator");
                self.accum = Some(binary(fold_op(*op), &acc, &v)?);
                Ok(Flow::Normal)
            }
            LStmt::If { cond, then, else_ } => {
                if self.eval(cond, locals, key)?.truthy() {
                    self.stmts(then, locals, key)
                } else {
                    self.stmts(else_, locals, key)
                }
            }
            LStmt::For { slot, lo, hi, body } => {
                let lo = as_i64(&self.eval(lo, locals, key)?);
                let hi = as_i64(&self.eval(hi, locals, key)?);
                for i in lo..hi {
                    locals[*slot as usize] = Value::I(i);
                    match self.stmts(body, locals, key)? {
                        Flow::Normal => {}
                        done => return Ok(done),
                    }
                }
                Ok(Flow::Normal)
            }
            LStmt::Assert { cond } => {
                if self.eval(cond, locals, key)?.truthy() {
                    Ok(Flow::Normal)
                } else {
                    Err(ExecError::Assertion)
                }
            }
            LStmt::Eval(e) => {
                self.eval(e, locals, key)?;
                Ok(Flow::Normal)
            }
            LStmt::Insert { values } => {
                let target = self.spec.sig.insert_into.expect("inserting task");
                let row = self.m.region(target)?.concrete + self.inserted;
                let evaluated: Result<Vec<(FieldId, Value)>, ExecError> = values
                    .iter()
                    .map(|(slot, e)| {
                        let f = self.field_of_slot(*slot);
                        self.check_privilege(f, "write")?;
                        Ok((f, self.eval(e, locals, key)?))
                    })
                    .collect();
                let region = self.m.region_mut(target)?;
                for (f, v) in evaluated? {
                    region.write(f, row, &v);
                }
                self.inserted += 1;
                Ok(Flow::Normal)
            }
            LStmt::DeleteSelf => {
                self.m.region_mut(self.domain_rel)?.set_live(key, false);
                Ok(Flow::Normal)
            }
            LStmt::Return(v) => {
                let v = v.as_ref().map(|e| self.eval(e, locals, key)).transpose()?;
                Ok(Flow::Returned(v))
            }
        }
    }

    fn eval_key(
        &mut self,
        e: &LExpr,
        locals: &mut Vec<Value>,
        key: u64,
        field: FieldId,
    ) -> Result<u64, ExecError> {
        let rel = self.m.field_home[&field];
        let rows = self.m.region(rel)?.concrete;
        self.eval(e, locals, key)?.as_key(rows)
    }

    fn eval(&mut self, e: &LExpr, locals: &mut Vec<Value>, key: u64) -> Result<Value, ExecError> {
        Ok(match e {
            LExpr::Const(s) => Value::from_scalar(*s),
            LExpr::Vector(items) => Value::Lanes(
                items
                    .iter()
                    .map(|i| self.eval(i, locals, key))
                    .collect::<Result<_, _>>()?,
            ),
            LExpr::Key => Value::U(key),
            LExpr::Local(slot) => locals[*slot as usize].clone(),
            LExpr::LoadField { slot, key: kexpr } => {
                let field = self.field_of_slot(*slot);
                self.check_privilege(field, "read")?;
                let k = self.eval_key(kexpr, locals, key, field)?;
                let rel = self.m.field_home[&field];
                self.m.region(rel)?.read(field, k)
            }
            LExpr::ReadGlobal { slot } => {
                let g = self.spec.sig.globals[*slot as usize].global;
                self.m.global_value(g)?.clone()
            }
            LExpr::Offset { src_bounds, dst_bounds, translation, base } => {
                let b = self.eval(base, locals, key)?;
                let lin = as_u64(&b);
                // Delinearize (x fastest), translate, wrap, relinearize.
                let mut coords = Vec::with_capacity(src_bounds.len());
                let mut rest = lin;
                for &d in src_bounds {
                    coords.push(rest % d);
                    rest /= d;
                }
                let mut out = 0u64;
                for axis in (0..dst_bounds.len()).rev() {
                    let d = dst_bounds[axis] as i64;
                    let c = (coords[axis] as i64 + translation[axis]).rem_euclid(d) as u64;
                    out = out * dst_bounds[axis] + c;
                }
                Value::U(out)
            }
            LExpr::AxisId { axis, dims, base } => {
                let lin = as_u64(&self.eval(base, locals, key)?);
                let mut rest = lin;
                let mut v = 0u64;
                for (a, &d) in dims.iter().enumerate() {
                    v = rest % d;
                    rest /= d;
                    if a == *axis as usize {
                        break;
                    }
                }
                Value::I(v as i64)
            }
            LExpr::Call { f, args } => {
                let vals: Result<Vec<Value>, _> =
                    args.iter().map(|a| self.eval(a, locals, key)).collect();
                let vals = vals?;
                let x = vals.first().map(|v| v.as_f64()).unwrap_or(0.0);
                let y = vals.get(1).map(|v| v.as_f64()).unwrap_or(0.0);
                Value::F(match f {
                    RuntimeFn::Acos => x.acos(),
                    RuntimeFn::Asin => x.asin(),
                    RuntimeFn::Atan => x.atan(),
                    RuntimeFn::Cbrt => x.cbrt(),
                    RuntimeFn::Ceil => x.ceil(),
                    RuntimeFn::Cos => x.cos(),
                    RuntimeFn::Fabs => x.abs(),
                    RuntimeFn::Floor => x.floor(),
                    RuntimeFn::Fmod => x % y,
                    RuntimeFn::Log => x.ln(),
                    RuntimeFn::Sin => x.sin(),
                    RuntimeFn::Sqrt => x.sqrt(),
                    RuntimeFn::Tan => x.tan(),
                    RuntimeFn::Pow => x.powf(y),
                    RuntimeFn::UniformF64 => rand::Rng::gen::<f64>(&mut rand::thread_rng()),
                })
            }
            LExpr::CallTask { task, args } => {
                let vals: Result<Vec<Value>, _> =
                    args.iter().map(|a| self.eval(a, locals, key)).collect();
                self.call_task(*task, vals?)?
            }
            LExpr::Binary { op, lhs, rhs } => {
                let l = self.eval(lhs, locals, key)?;
                let r = self.eval(rhs, locals, key)?;
                binary(*op, &l, &r)?
            }
            LExpr::Unary { op, expr } => {
                let v = self.eval(expr, locals, key)?;
                match op {
                    LUnOp::Not => Value::B(!v.truthy()),
                    LUnOp::Neg => match v {
                        Value::I(x) => Value::I(-x),
                        Value::F(x) => Value::F(-x),
                        Value::Lanes(items) => Value::Lanes(
                            items
                                .into_iter()
                                .map(|i| match i {
                                    Value::I(x) => Value::I(-x),
                                    Value::F(x) => Value::F(-x),
                                    other => other,
                                })
                                .collect(),
                        ),
                        other => other,
                    },
                }
            }
            LExpr::Lane { base, index } => {
                let b = self.eval(base, locals, key)?;
                let i = as_i64(&self.eval(index, locals, key)?) as usize;
                match b {
                    Value::Lanes(items) => items[i].clone(),
                    scalar => scalar,
                }
            }
            LExpr::Convert { to, expr } => {
                let v = self.eval(expr, locals, key)?;
                convert(&v, *to)
            }
        })
    }

    /// Call a helper task: bind argument slots, run to `Return`.
    fn call_task(&mut self, task: TaskId, args: Vec<Value>) -> Result<Value, ExecError> {
        let callee = self.graph.task(task);
        let mut locals = vec![Value::F(0.0); callee.local_slots as usize];
        for (i, a) in args.into_iter().enumerate() {
            locals[i] = a;
        }
        let mut inner = Interp {
            graph: self.graph,
            m: &mut *self.m,
            spec: callee,
            domain_rel: self.domain_rel,
            accum: None,
            inserted: 0,
        };
        match inner.stmts(&callee.body, &mut locals, 0)? {
            Flow::Returned(Some(v)) => Ok(v),
            _ => Ok(Value::F(0.0)),
        }
    }
}

fn convert(v: &Value, to: Primitive) -> Value {
    if let Value::Lanes(items) = v {
        return Value::Lanes(items.iter().map(|i| convert(i, to)).collect());
    }
    match to {
        Primitive::Bool => Value::B(v.truthy()),
        Primitive::F32 => Value::F(v.as_f64() as f32 as f64),
        Primitive::F64 => Value::F(v.as_f64()),
        p if p.is_unsigned() => Value::U(as_u64(v)),
        _ => Value::I(as_i64(v)),
    }
}

fn binary(op: LBinOp, l: &Value, r: &Value) -> Result<Value, ExecError> {
    // Elementwise with scalar broadcast.
    match (l, r) {
        (Value::Lanes(a), Value::Lanes(b)) => {
            let items: Result<Vec<Value>, _> =
                a.iter().zip(b).map(|(x, y)| binary(op, x, y)).collect();
            return Ok(Value::Lanes(items?));
        }
        (Value::Lanes(a), s) => {
            let items: Result<Vec<Value>, _> = a.iter().map(|x| binary(op, x, s)).collect();
            return Ok(Value::Lanes(items?));
        }
        (s, Value::Lanes(b)) => {
            let items: Result<Vec<Value>, _> = b.iter().map(|y| binary(op, s, y)).collect();
            return Ok(Value::Lanes(items?));
        }
        _ => {}
    }

    let out = match (op, l, r) {
        (LBinOp::And, Value::B(a), Value::B(b)) => Value::B(*a && *b),
        (LBinOp::Or, Value::B(a), Value::B(b)) => Value::B(*a || *b),
        (LBinOp::Eq, Value::B(a), Value::B(b)) => Value::B(a == b),
        (LBinOp::Ne, Value::B(a), Value::B(b)) => Value::B(a != b),

        (_, Value::I(a), Value::I(b)) => int_binary(op, *a, *b)?,
        (_, Value::U(a), Value::U(b)) => uint_binary(op, *a, *b)?,
        // Mixed integer encodings appear when a key feeds arithmetic.
        (_, Value::U(a), Value::I(b)) => int_binary(op, *a as i64, *b)?,
        (_, Value::I(a), Value::U(b)) => int_binary(op, *a, *b as i64)?,

        (_, a, b) => float_binary(op, a.as_f64(), b.as_f64()),
    };
    Ok(out)
}

fn int_binary(op: LBinOp, a: i64, b: i64) -> Result<Value, ExecError> {
    Ok(match op {
        LBinOp::Add => Value::I(a.wrapping_add(b)),
        LBinOp::Sub => Value::I(a.wrapping_sub(b)),
        LBinOp::Mul => Value::I(a.wrapping_mul(b)),
        LBinOp::Div => Value::I(a.checked_div(b).ok_or(ExecError::DivideByZero)?),
        LBinOp::Mod => Value::I(a.checked_rem(b).ok_or(ExecError::DivideByZero)?),
        LBinOp::Min => Value::I(a.min(b)),
        LBinOp::Max => Value::I(a.max(b)),
        LBinOp::Eq => Value::B(a == b),
        LBinOp::Ne => Value::B(a != b),
        LBinOp::Lt => Value::B(a < b),
        LBinOp::Le => Value::B(a <= b),
        LBinOp::Gt => Value::B(a > b),
        LBinOp::Ge => Value::B(a >= b),
        LBinOp::And | LBinOp::Or => Value::B(false),
    })
}

fn uint_binary(op: LBinOp, a: u64, b: u64) -> Result<Value, ExecError> {
    Ok(match op {
        LBinOp::Add => Value::U(a.wrapping_add(b)),
        LBinOp::Sub => Value::U(a.wrapping_sub(b)),
        LBinOp::Mul => Value::U(a.wrapping_mul(b)),
        LBinOp::Div => Value::U(a.checked_div(b).ok_or(ExecError::DivideByZero)?),
        LBinOp::Mod => Value::U(a.checked_rem(b).ok_or(ExecError::DivideByZero)?),
        LBinOp::Min => Value::U(a.min(b)),
        LBinOp::Max => Value::U(a.max(b)),
        LBinOp::Eq => Value::B(a == b),
        LBinOp::Ne => Value::B(a != b),
        LBinOp::Lt => Value::B(a < b),
        LBinOp::Le => Value::B(a <= b),
        LBinOp::Gt => Value::B(a > b),
        LBinOp::Ge => Value::B(a >= b),
        LBinOp::And | LBinOp::Or => Value::B(false),
    })
}

fn float_binary(op: LBinOp, a: f64, b: f64) -> Value {
    match op {
        LBinOp::Add => Value::F(a + b),
        LBinOp::Sub => Value::F(a - b),
        LBinOp::Mul => Value::F(a * b),
        LBinOp::Div => Value::F(a / b),
        LBinOp::Mod => Value::F(a % b),
        LBinOp::Min => Value::F(a.min(b)),
        LBinOp::Max => Value::F(a.max(b)),
        LBinOp::Eq => Value::B(a == b),
        LBinOp::Ne => Value::B(a != b),
        LBinOp::Lt => Value::B(a < b),
        LBinOp::Le => Value::B(a <= b),
        LBinOp::Gt => Value::B(a > b),
        LBinOp::Ge => Value::B(a >= b),
        LBinOp::And | LBinOp::Or => Value::B(false),
    }
}

fn apply_reduce(op: ReduceOp, current: &Value, contribution: &Value) -> Result<Value, ExecError> {
    let bop = match op {
        ReduceOp::Add => LBinOp::Add,
        ReduceOp::Sub => LBinOp::Sub,
        ReduceOp::Mul => LBinOp::Mul,
        ReduceOp::Div => LBinOp::Div,
        ReduceOp::Min => LBinOp::Min,
        ReduceOp::Max => LBinOp::Max,
    };
    binary(bop, current, contribution)
}

/// Associative-commutative combining form of a reduction operator.
fn fold_op(op: ReduceOp) -> LBinOp {
    match op {
        ReduceOp::Add | ReduceOp::Sub => LBinOp::Add,
        ReduceOp::Mul | ReduceOp::Div => LBinOp::Mul,
        ReduceOp::Min => LBinOp::Min,
        ReduceOp::Max => LBinOp::Max,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build as b;
    use crate::ast::{BinOp, TypeExpr};
    use crate::ir::{build as cb, Decl, ExprConst, Recorder, ShapeDecl};
    use crate::lower::compile;
    use crate::types::Primitive;

    fn run_program(r: Recorder) -> Machine {
        let p = r.finish().unwrap();
        let g = compile(&p, Backend::Cpu).unwrap();
        run(&g).unwrap()
    }

    #[test]
    fn double_launch_increments_every_row_twice() {
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
        r.load_field("rows", "x", ExprConst::Num(0.0));
        r.for_each("bump", "rows", None);
        r.for_each("bump", "rows", None);
        let m = run_program(r);
        for row in 0..10 {
            assert_eq!(m.read_field(FieldId(0), row).unwrap(), Value::I(2));
        }
    }

    #[test]
    fn global_sum_over_hundred_rows_is_hundred() {
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation { name: "rows".into(), shape: ShapeDecl::Flat { size: 100 } });
        r.decl(Decl::NewGlobal {
            name: "g".into(),
            ty: TypeExpr::Prim(Primitive::F64),
            init: ExprConst::Num(0.0),
        });
        r.decl(Decl::NewFunction {
            fun: b::kernel(
                "acc",
                "k",
                vec![b::reduce(b::name("g"), crate::ast::ReduceOp::Add, b::num(1.0))],
            ),
        });
        r.for_each("acc", "rows", None);
        let m = run_program(r);
        assert_eq!(m.global_value(GlobalId(0)).unwrap(), &Value::F(100.0));
    }

    #[test]
    fn affine_translation_wraps_modulo_grid_bounds() {
        // c.nbr = id(c(1, 0)) on a 5×5 grid.
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation {
            name: "mesh".into(),
            shape: ShapeDecl::Grid { dims: vec![5, 5], n_bd: 0 },
        });
        r.decl(Decl::NewField {
            rel: "mesh".into(),
            name: "nbr".into(),
            ty: TypeExpr::Prim(Primitive::I64),
        });
        r.decl(Decl::NewFunction {
            fun: b::kernel(
                "shift",
                "c",
                vec![b::assign(
                    b::member(b::name("c"), "nbr"),
                    b::call(
                        b::name("id"),
                        vec![b::call(b::name("c"), vec![b::num(1.0), b::num(0.0)])],
                    ),
                )],
            ),
        });
        r.for_each("shift", "mesh", None);
        let m = run_program(r);

        // (xid=2, yid=3) → (3, 3): 17 → 18.
        assert_eq!(m.read_field(FieldId(0), 2 + 5 * 3).unwrap(), Value::I(3 + 5 * 3));
        // (xid=4, yid=3) wraps to (0, 3): 19 → 15.
        assert_eq!(m.read_field(FieldId(0), 4 + 5 * 3).unwrap(), Value::I(0 + 5 * 3));
    }

    #[test]
    fn zero_translation_is_the_identity() {
        // assert(id(c(0,0)) == id(c)) over the whole grid: the run only
        // succeeds if the zero translation is semantically the identity.
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation {
            name: "mesh".into(),
            shape: ShapeDecl::Grid { dims: vec![4, 3], n_bd: 0 },
        });
        r.decl(Decl::NewFunction {
            fun: b::kernel(
                "check",
                "c",
                vec![b::expr(b::call(
                    b::name("assert"),
                    vec![b::binary(
                        BinOp::Eq,
                        b::call(
                            b::name("id"),
                            vec![b::call(b::name("c"), vec![b::num(0.0), b::num(0.0)])],
                        ),
                        b::call(b::name("id"), vec![b::name("c")]),
                    )],
                ))],
            ),
        });
        r.for_each("check", "mesh", None);
        let _ = run_program(r);
    }

    #[test]
    fn all_read_launch_leaves_state_unchanged() {
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation { name: "rows".into(), shape: ShapeDecl::Flat { size: 6 } });
        r.decl(Decl::NewField {
            rel: "rows".into(),
            name: "x".into(),
            ty: TypeExpr::Prim(Primitive::F64),
        });
        r.decl(Decl::NewFunction {
            fun: b::kernel("look", "k", vec![b::let_("t", b::member(b::name("k"), "x"))]),
        });
        r.load_field("rows", "x", ExprConst::Num(7.5));
        r.for_each("look", "rows", None);
        let m = run_program(r);
        for row in 0..6 {
            assert_eq!(m.read_field(FieldId(0), row).unwrap(), Value::F(7.5));
        }
    }

    #[test]
    fn disjoint_write_launches_commute() {
        let build = |order_ab: bool| {
            let mut r = Recorder::new();
            r.decl(Decl::NewRelation { name: "rows".into(), shape: ShapeDecl::Flat { size: 4 } });
            for f in ["a", "b"] {
                r.decl(Decl::NewField {
                    rel: "rows".into(),
                    name: f.into(),
                    ty: TypeExpr::Prim(Primitive::I64),
                });
            }
            r.decl(Decl::NewFunction {
                fun: b::kernel(
                    "wa",
                    "k",
                    vec![b::assign(b::member(b::name("k"), "a"), b::num(1.0))],
                ),
            });
            r.decl(Decl::NewFunction {
                fun: b::kernel(
                    "wb",
                    "k",
                    vec![b::assign(b::member(b::name("k"), "b"), b::num(2.0))],
                ),
            });
            if order_ab {
                r.for_each("wa", "rows", None);
                r.for_each("wb", "rows", None);
            } else {
                r.for_each("wb", "rows", None);
                r.for_each("wa", "rows", None);
            }
            run_program(r)
        };
        let m1 = build(true);
        let m2 = build(false);
        for row in 0..4 {
            for f in [FieldId(0), FieldId(1)] {
                assert_eq!(m1.read_field(f, row).unwrap(), m2.read_field(f, row).unwrap());
            }
        }
    }

    #[test]
    fn while_loop_terminates_with_g_equal_three() {
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
        let m = run_program(r);
        assert_eq!(m.global_value(GlobalId(0)).unwrap(), &Value::F(3.0));
    }

    #[test]
    fn boundary_subset_launch_touches_only_boundary_rows() {
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation {
            name: "mesh".into(),
            shape: ShapeDecl::Grid { dims: vec![4, 4], n_bd: 1 },
        });
        r.decl(Decl::NewField {
            rel: "mesh".into(),
            name: "f".into(),
            ty: TypeExpr::Prim(Primitive::I64),
        });
        r.decl(Decl::NewFunction {
            fun: b::kernel(
                "mark",
                "c",
                vec![b::assign(b::member(b::name("c"), "f"), b::num(9.0))],
            ),
        });
        r.for_each("mark", "mesh", Some("mesh.boundary"));
        let m = run_program(r);

        // id=0 is a corner (boundary), id=5 is (1,1) (interior).
        assert_eq!(m.read_field(FieldId(0), 0).unwrap(), Value::I(9));
        assert_eq!(m.read_field(FieldId(0), 5).unwrap(), Value::I(0));
        let marked = (0..16)
            .filter(|&row| m.read_field(FieldId(0), row).unwrap() == Value::I(9))
            .count();
        assert_eq!(marked, 12);
    }

    #[test]
    fn grid_macros_expand_to_running_arithmetic() {
        // pos = center, depth = xneg_depth on a 4×4 grid with n_bd = 2.
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation {
            name: "mesh".into(),
            shape: ShapeDecl::Grid { dims: vec![4, 4], n_bd: 2 },
        });
        r.decl(Decl::NewField {
            rel: "mesh".into(),
            name: "pos".into(),
            ty: TypeExpr::Vector { elem: Primitive::F64, len: 2 },
        });
        r.decl(Decl::NewField {
            rel: "mesh".into(),
            name: "depth".into(),
            ty: TypeExpr::Prim(Primitive::I64),
        });
        r.decl(Decl::NewFunction {
            fun: b::kernel(
                "geo",
                "c",
                vec![
                    b::assign(b::member(b::name("c"), "pos"), b::member(b::name("c"), "center")),
                    b::assign(
                        b::member(b::name("c"), "depth"),
                        b::member(b::name("c"), "xneg_depth"),
                    ),
                ],
            ),
        });
        r.for_each("geo", "mesh", None);
        let m = run_program(r);

        // Cell (1, 2) = id 9: center (1.5, 2.5), xneg depth 2 - 1 = 1.
        assert_eq!(
            m.read_field(FieldId(0), 9).unwrap(),
            Value::Lanes(vec![Value::F(1.5), Value::F(2.5)])
        );
        assert_eq!(m.read_field(FieldId(1), 9).unwrap(), Value::I(1));
        // Cell (3, 0) = id 3 is outside the xneg layer.
        assert_eq!(m.read_field(FieldId(1), 3).unwrap(), Value::I(0));
    }

    #[test]
    fn matrix_fields_load_fill_and_index() {
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation { name: "rows".into(), shape: ShapeDecl::Flat { size: 2 } });
        r.decl(Decl::NewField {
            rel: "rows".into(),
            name: "m".into(),
            ty: TypeExpr::Matrix { elem: Primitive::F64, rows: 2, cols: 3 },
        });
        r.decl(Decl::NewField {
            rel: "rows".into(),
            name: "pick".into(),
            ty: TypeExpr::Prim(Primitive::F64),
        });
        r.decl(Decl::NewFunction {
            fun: b::kernel(
                "take",
                "k",
                vec![b::assign(
                    b::member(b::name("k"), "pick"),
                    b::index(b::member(b::name("k"), "m"), vec![b::num(1.0), b::num(2.0)]),
                )],
            ),
        });
        r.load_field(
            "rows",
            "m",
            ExprConst::List(vec![
                ExprConst::List(vec![
                    ExprConst::Num(1.0),
                    ExprConst::Num(2.0),
                    ExprConst::Num(3.0),
                ]),
                ExprConst::List(vec![
                    ExprConst::Num(4.0),
                    ExprConst::Num(5.0),
                    ExprConst::Num(6.0),
                ]),
            ]),
        );
        r.for_each("take", "rows", None);
        let m = run_program(r);
        // Row-major: m[1, 2] is the sixth lane.
        assert_eq!(m.read_field(FieldId(1), 0).unwrap(), Value::F(6.0));
    }

    #[test]
    fn index_list_subsets_drive_launches_too() {
        // The interior subset is carried as an index list, unlike the
        // boundary mask.
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation {
            name: "mesh".into(),
            shape: ShapeDecl::Grid { dims: vec![4, 4], n_bd: 1 },
        });
        r.decl(Decl::NewField {
            rel: "mesh".into(),
            name: "f".into(),
            ty: TypeExpr::Prim(Primitive::I64),
        });
        r.decl(Decl::NewFunction {
            fun: b::kernel(
                "mark",
                "c",
                vec![b::assign(b::member(b::name("c"), "f"), b::num(7.0))],
            ),
        });
        r.for_each("mark", "mesh", Some("mesh.interior"));
        let m = run_program(r);
        let marked: Vec<u64> = (0..16)
            .filter(|&row| m.read_field(FieldId(0), row).unwrap() == Value::I(7))
            .collect();
        assert_eq!(marked, vec![5, 6, 9, 10]);
    }

    #[test]
    fn helper_and_dot_tasks_compute_through_call_sites() {
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation { name: "rows".into(), shape: ShapeDecl::Flat { size: 3 } });
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
        r.decl(Decl::NewFunction {
            fun: b::helper(
                "halve",
                vec![("x", TypeExpr::Prim(Primitive::F64))],
                Some(TypeExpr::Prim(Primitive::F64)),
                vec![b::ret(Some(b::binary(BinOp::Div, b::name("x"), b::num(2.0))))],
            ),
        });
        r.decl(Decl::NewFunction {
            fun: b::kernel(
                "norm2",
                "k",
                vec![b::assign(
                    b::member(b::name("k"), "n"),
                    b::call(
                        b::name("halve"),
                        vec![b::call(
                            b::name("dot"),
                            vec![b::member(b::name("k"), "v"), b::member(b::name("k"), "v")],
                        )],
                    ),
                )],
            ),
        });
        r.load_field(
            "rows",
            "v",
            ExprConst::List(vec![
                ExprConst::Num(1.0),
                ExprConst::Num(2.0),
                ExprConst::Num(2.0),
            ]),
        );
        r.for_each("norm2", "rows", None);
        let m = run_program(r);
        // dot([1,2,2],[1,2,2]) = 9; halved = 4.5.
        assert_eq!(m.read_field(FieldId(1), 0).unwrap(), Value::F(4.5));
    }

    #[test]
    fn insert_appends_rows_and_marks_fragmented() {
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation { name: "src".into(), shape: ShapeDecl::Flat { size: 4 } });
        r.decl(Decl::NewRelation { name: "dst".into(), shape: ShapeDecl::Flat { size: 2 } });
        r.decl(Decl::NewField {
            rel: "dst".into(),
            name: "a".into(),
            ty: TypeExpr::Prim(Primitive::F64),
        });
        r.decl(Decl::NewFunction {
            fun: b::kernel(
                "spawn",
                "k",
                vec![b::insert(b::name("dst"), vec![("a", b::num(5.0))])],
            ),
        });
        r.for_each("spawn", "src", None);
        let m = run_program(r);

        // 2 original rows + 4 inserted, all live.
        assert_eq!(m.concrete_size(RelationId(1)).unwrap(), 6);
        assert_eq!(m.live_size(RelationId(1)).unwrap(), 6);
        assert!(m.is_fragmented(RelationId(1)).unwrap());
        for row in 2..6 {
            assert_eq!(m.read_field(FieldId(0), row).unwrap(), Value::F(5.0));
        }
    }

    #[test]
    fn delete_below_half_occupancy_defragments() {
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation { name: "rows".into(), shape: ShapeDecl::Flat { size: 8 } });
        r.decl(Decl::NewField {
            rel: "rows".into(),
            name: "x".into(),
            ty: TypeExpr::Prim(Primitive::I64),
        });
        // Keep only keys whose x is below 2 (we fill x with the row id).
        r.decl(Decl::NewFunction {
            fun: b::kernel(
                "mark_ids",
                "k",
                vec![b::assign(
                    b::member(b::name("k"), "x"),
                    b::call(b::name("id"), vec![b::name("k")]),
                )],
            ),
        });
        r.decl(Decl::NewFunction {
            fun: b::kernel(
                "cull",
                "k",
                vec![b::if_(
                    b::binary(BinOp::Ge, b::member(b::name("k"), "x"), b::num(2.0)),
                    vec![b::delete(b::name("k"))],
                    None,
                )],
            ),
        });
        r.for_each("mark_ids", "rows", None);
        r.for_each("cull", "rows", None);
        let m = run_program(r);

        // 2 of 8 survive: occupancy 0.25 < 0.5 triggers defragmentation.
        assert_eq!(m.live_size(RelationId(0)).unwrap(), 2);
        assert_eq!(m.concrete_size(RelationId(0)).unwrap(), 2);
        assert_eq!(m.read_field(FieldId(0), 0).unwrap(), Value::I(0));
        assert_eq!(m.read_field(FieldId(0), 1).unwrap(), Value::I(1));
    }

    #[test]
    fn runtime_assertion_aborts_with_the_fixed_message() {
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation { name: "rows".into(), shape: ShapeDecl::Flat { size: 1 } });
        r.decl(Decl::NewFunction {
            fun: b::kernel("boom", "k", vec![b::expr(b::call(b::name("assert"), vec![b::boolean(false)]))]),
        });
        r.for_each("boom", "rows", None);
        let p = r.finish().unwrap();
        let g = compile(&p, Backend::Cpu).unwrap();
        let err = run(&g).unwrap_err();
        assert_eq!(err.to_string(), "assertion failed in kernel task");
    }

    #[test]
    fn gpu_graphs_are_refused() {
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation { name: "rows".into(), shape: ShapeDecl::Flat { size: 1 } });
        r.decl(Decl::NewFunction { fun: b::kernel("noop", "k", vec![]) });
        r.for_each("noop", "rows", None);
        let g = compile(&r.finish().unwrap(), Backend::Gpu).unwrap();
        assert!(matches!(run(&g), Err(ExecError::WrongBackend(Backend::Gpu))));
    }

    #[test]
    fn field_dlds_are_compact_and_sized() {
        let mut r = Recorder::new();
        r.decl(Decl::NewRelation { name: "rows".into(), shape: ShapeDecl::Flat { size: 10 } });
        r.decl(Decl::NewField {
            rel: "rows".into(),
            name: "v".into(),
            ty: TypeExpr::Vector { elem: Primitive::F32, len: 3 },
        });
        let m = run_program(r);
        let dld = m.field_dld(FieldId(0)).unwrap();
        assert!(dld.is_compact());
        assert_eq!(dld.logical_size, 10);
        assert_eq!(dld.stride, 12);
        assert_ne!(dld.address, 0);
        assert_eq!(dld.physical_size(), 120);
    }
}
