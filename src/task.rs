//! Task specifications
//!
//! The lowering target: a serializable sequence of task definitions plus
//! one driver, consumable by any task-based runtime that understands
//! region privileges and operator-tagged reductions. Nothing here
//! executes; `exec` interprets this model and a real backend would
//! translate it.
//!
//! A kernel task is a loop body over a domain; its [`SigLayout`] is the
//! stable ABI between driver and task (row count, optional subset slots,
//! optional insert cursor, one slot per used field, one per used global).
//! Privileges are declared on the **universe** region — never on a subset
//! — as `reads`/`writes`/`reduces op` column sets.
//!
//! The body IR ([`LExpr`]/[`LStmt`]) is deliberately lower-level than the
//! typed AST: builtins have become runtime calls, affine keys have become
//! delinearize/translate/wrap arithmetic, `dot` has become a call to a
//! generated straight-line helper, and reductions into the task's single
//! returned accumulator are explicit.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

use crate::ast::ReduceOp;
use crate::layout::Dld;
use crate::relation::{FieldId, GlobalId, RelationId, SubsetId};
use crate::types::{Primitive, Scalar, Type};

// ============================================================================
// Handles
// ============================================================================

/// Index of a task within its [`TaskGraph`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub usize);

impl TaskId {
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Compilation target. Build-time artifacts are backend-keyed; the
/// reference executor only consumes CPU graphs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Backend {
    Cpu,
    Gpu,
}

/// What a kernel launch iterates: the whole relation, or a bound subset.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DomainRef {
    Universe(RelationId),
    Subset(SubsetId),
}

impl DomainRef {
    pub fn relation(self, ctx: &crate::relation::Context) -> RelationId {
        match self {
            DomainRef::Universe(r) => r,
            DomainRef::Subset(s) => ctx.subset(s).rel,
        }
    }
}

// ============================================================================
// Privileges and signatures
// ============================================================================

/// One privilege declaration over a set of columns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Privilege {
    Reads(Vec<FieldId>),
    Writes(Vec<FieldId>),
    Reduces { op: ReduceOp, fields: Vec<FieldId> },
}

/// Privileges a task holds on one relation's storage region.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionReq {
    pub relation: RelationId,
    pub privileges: Vec<Privilege>,
}

/// One field slot of a signature. `dld.address` is zero until the runtime
/// binds the region.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldSlot {
    pub field: FieldId,
    pub dld: Dld,
}

/// One global slot of a signature. `reduce = None` means the global is a
/// read-only by-value argument.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GlobalSlot {
    pub global: GlobalId,
    pub reduce: Option<ReduceOp>,
}

/// The flat record passed from driver to task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SigLayout {
    /// Rows of the universe relation at compile time.
    pub n_rows: u64,
    /// Bound subset, when the launch supplied one.
    pub subset: Option<SubsetId>,
    /// With a subset: true selects the boolmask slots, false the index
    /// list slots.
    pub use_boolmask: bool,
    /// Insert cursor target, when the kernel inserts.
    pub insert_into: Option<RelationId>,
    pub fields: Vec<FieldSlot>,
    pub globals: Vec<GlobalSlot>,
}

impl SigLayout {
    pub fn field_slot(&self, field: FieldId) -> Option<u32> {
        self.fields.iter().position(|s| s.field == field).map(|i| i as u32)
    }

    pub fn global_slot(&self, global: GlobalId) -> Option<u32> {
        self.globals.iter().position(|s| s.global == global).map(|i| i as u32)
    }
}

// ============================================================================
// Lowered body IR
// ============================================================================

/// Math runtime calls a backend links against libm for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeFn {
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
    /// `rand()` scaled into `[0, 1)`.
    UniformF64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Min,
    Max,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LUnOp {
    Neg,
    Not,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LExpr {
    Const(Scalar),
    Vector(Vec<LExpr>),
    /// The current key of the kernel loop, as a linear row number.
    Key,
    /// Local slot read (helper arguments occupy the first slots).
    Local(u32),
    LoadField { slot: u32, key: Box<LExpr> },
    ReadGlobal { slot: u32 },
    /// Affine key arithmetic: delinearize by `src_bounds`, translate,
    /// wrap modulo `dst_bounds`, relinearize.
    Offset {
        src_bounds: Vec<u64>,
        dst_bounds: Vec<u64>,
        translation: Vec<i64>,
        base: Box<LExpr>,
    },
    /// Axis extraction from a linear key.
    AxisId { axis: u8, dims: Vec<u64>, base: Box<LExpr> },
    Call { f: RuntimeFn, args: Vec<LExpr> },
    CallTask { task: TaskId, args: Vec<LExpr> },
    Binary { op: LBinOp, lhs: Box<LExpr>, rhs: Box<LExpr> },
    Unary { op: LUnOp, expr: Box<LExpr> },
    /// Lane extraction; matrices index row-major as `i · cols + j`.
    Lane { base: Box<LExpr>, index: Box<LExpr> },
    Convert { to: Primitive, expr: Box<LExpr> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LStmt {
    DeclLocal { slot: u32, init: LExpr },
    SetLocal { slot: u32, value: LExpr },
    StoreField { slot: u32, key: LExpr, value: LExpr },
    ReduceField { slot: u32, op: ReduceOp, key: LExpr, value: LExpr },
    /// Fold into the task's returned accumulator.
    ReduceAccum { op: ReduceOp, value: LExpr },
    If { cond: LExpr, then: Vec<LStmt>, else_: Vec<LStmt> },
    For { slot: u32, lo: LExpr, hi: LExpr, body: Vec<LStmt> },
    /// Runtime assertion; aborts the task with a fixed message.
    Assert { cond: LExpr },
    Eval(LExpr),
    /// Append one row at the insert cursor.
    Insert { values: Vec<(u32, LExpr)> },
    /// Clear the live flag of the current key.
    DeleteSelf,
    Return(Option<LExpr>),
}

// ============================================================================
// Tasks
// ============================================================================

/// A constant cell value: scalar lanes plus their logical type. Globals,
/// fills and accumulator identities all travel in this shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellInit {
    pub ty: Type,
    pub lanes: Vec<Scalar>,
}

impl CellInit {
    pub fn scalar(ty: Primitive, v: Scalar) -> CellInit {
        CellInit { ty: Type::Prim(ty), lanes: vec![v] }
    }
}

/// The accumulator a reducing kernel task returns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccumSpec {
    pub global: GlobalId,
    pub op: ReduceOp,
    pub identity: CellInit,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    /// `for k in domain { body }`.
    KernelLoop,
    /// Expression body, called with argument slots bound.
    HelperExpr,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub name: String,
    pub kind: TaskKind,
    pub sig: SigLayout,
    pub regions: Vec<RegionReq>,
    /// Number of argument slots (helpers); kernels take only the key.
    pub param_slots: u32,
    /// Total local slots the body uses, arguments included.
    pub local_slots: u32,
    pub body: Vec<LStmt>,
    pub reduction: Option<AccumSpec>,
}

// ============================================================================
// Driver
// ============================================================================

/// Scalar expression of the driver (control program), names resolved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ScalarExpr {
    Num(f64),
    Bool(bool),
    ReadGlobal(GlobalId),
    Arith { op: crate::ir::ArithOp, lhs: Box<ScalarExpr>, rhs: Box<ScalarExpr> },
    Neg(Box<ScalarExpr>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CondExpr {
    Literal(bool),
    And(Box<CondExpr>, Box<CondExpr>),
    Or(Box<CondExpr>, Box<CondExpr>),
    Not(Box<CondExpr>),
    Compare { op: crate::ir::CmpOp, lhs: ScalarExpr, rhs: ScalarExpr },
}

/// One column of a region, as the runtime needs to see it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnDecl {
    pub field: FieldId,
    pub ty: crate::layout::DldType,
}

/// One step of the driver task. Order is program order; each `Launch` is a
/// barrier with respect to the ops that follow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DriverOp {
    DeclareGlobal { global: GlobalId, init: CellInit },
    /// Allocate one region: the concatenation of the listed columns.
    AllocRegion {
        relation: RelationId,
        n_rows: u64,
        columns: Vec<ColumnDecl>,
        /// Live-flag column of an elastic relation.
        live_mask: Option<FieldId>,
    },
    /// Bind a subset partition (single-rectangle grids are partitioned by
    /// a one-color coloring; masks and index lists bind directly).
    BindSubset { subset: SubsetId, relation: RelationId, data: crate::relation::SubsetData },
    Launch { task: TaskId, domain: DomainRef, reduce_into: Option<GlobalId> },
    Fill { field: FieldId, value: CellInit },
    SetGlobal { global: GlobalId, value: ScalarExpr },
    If { cond: CondExpr, then: Vec<DriverOp>, else_: Vec<DriverOp> },
    While { cond: CondExpr, body: Vec<DriverOp> },
}

/// Binds the emitted artifact to the program and backend that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub program_digest: String,
    pub backend: Backend,
}

/// The complete lowering output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskGraph {
    pub manifest: Manifest,
    pub tasks: Vec<TaskSpec>,
    pub driver: Vec<DriverOp>,
}

impl TaskGraph {
    pub fn task(&self, id: TaskId) -> &TaskSpec {
        &self.tasks[id.as_usize()]
    }
}

// ============================================================================
// Reduction identities
// ============================================================================

/// Identity element a reducing task seeds its accumulator with.
///
/// `min` seeds with the type's maximum and `max` with its minimum, so the
/// fold is a no-op until the first real contribution.
pub fn reduce_identity(op: ReduceOp, p: Primitive) -> Scalar {
    match op {
        ReduceOp::Add | ReduceOp::Sub => match p {
            Primitive::F32 | Primitive::F64 => Scalar::Float(0.0),
            _ if p.is_unsigned() => Scalar::Uint(0),
            _ => Scalar::Int(0),
        },
        ReduceOp::Mul | ReduceOp::Div => match p {
            Primitive::F32 | Primitive::F64 => Scalar::Float(1.0),
            _ if p.is_unsigned() => Scalar::Uint(1),
            _ => Scalar::Int(1),
        },
        ReduceOp::Min => p.max_value(),
        ReduceOp::Max => p.min_value(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduction_identities_are_neutral_elements() {
        assert_eq!(reduce_identity(ReduceOp::Add, Primitive::F64), Scalar::Float(0.0));
        assert_eq!(reduce_identity(ReduceOp::Sub, Primitive::I32), Scalar::Int(0));
        assert_eq!(reduce_identity(ReduceOp::Mul, Primitive::F32), Scalar::Float(1.0));
        assert_eq!(reduce_identity(ReduceOp::Div, Primitive::U64), Scalar::Uint(1));
        // min seeds at max, max seeds at min.
        assert_eq!(reduce_identity(ReduceOp::Min, Primitive::I8), Scalar::Int(127));
        assert_eq!(reduce_identity(ReduceOp::Max, Primitive::I8), Scalar::Int(-128));
        assert_eq!(reduce_identity(ReduceOp::Min, Primitive::U16), Scalar::Uint(65535));
        assert_eq!(reduce_identity(ReduceOp::Max, Primitive::U16), Scalar::Uint(0));
    }

    #[test]
    fn sig_layout_slot_lookup() {
        let sig = SigLayout {
            n_rows: 10,
            subset: None,
            use_boolmask: false,
            insert_into: None,
            fields: vec![
                FieldSlot {
                    field: FieldId(3),
                    dld: Dld::compact(
                        crate::layout::DldType::new(Primitive::F64, 1),
                        10,
                        0,
                    ),
                },
                FieldSlot {
                    field: FieldId(7),
                    dld: Dld::compact(
                        crate::layout::DldType::new(Primitive::I32, 2),
                        10,
                        0,
                    ),
                },
            ],
            globals: vec![GlobalSlot { global: GlobalId(0), reduce: Some(ReduceOp::Add) }],
        };
        assert_eq!(sig.field_slot(FieldId(7)), Some(1));
        assert_eq!(sig.field_slot(FieldId(4)), None);
        assert_eq!(sig.global_slot(GlobalId(0)), Some(0));
    }

    #[test]
    fn task_graph_serializes() {
        let g = TaskGraph {
            manifest: Manifest {
                program_digest: hex::encode([0u8; 32]),
                backend: Backend::Cpu,
            },
            tasks: vec![],
            driver: vec![DriverOp::DeclareGlobal {
                global: GlobalId(0),
                init: CellInit::scalar(Primitive::F64, Scalar::Float(0.0)),
            }],
        };
        let json = serde_json::to_string(&g).unwrap();
        let back: TaskGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(g, back);
    }
}
