//! Crate root: public surface and pipeline-wide invariants
//!
//! `meshlang` compiles a small DSL for parallel computations over
//! structured mesh and grid relations into a typed task graph. User
//! programs declare **relations** (cells, vertices, dual cells) carrying
//! typed **fields**, process-wide **globals**, and per-key **kernels**;
//! an imperative control program sequences launches, fills and global
//! assignments. The compiler proves every kernel data-race-free and emits
//! task specifications — signature, region privileges, loop body — that
//! any privilege-aware parallel runtime can consume. A sequential
//! reference executor ([`exec`]) interprets the emitted graph for tests
//! and the CLI.
//!
//! ## Invariants (pipeline-wide)
//!
//! - **Build-time determinism.** Specialize, check, phase and lower are
//!   single-threaded, deterministic and idempotent per
//!   `(kernel, relation|subset, backend)` triple; compiled artifacts are
//!   memoized for the process lifetime with no eviction.
//! - **Race freedom by construction.** A launch may run its per-key
//!   instances in any order and concurrently: writes are centered,
//!   scatters go through declared associative-commutative reductions,
//!   and a task receives exactly the privileges its phase result implies.
//! - **Stable error taxonomy.** Lattice violations surface as
//!   `TypeError` with the literal `"invalid types"` prefix; off-center
//!   writes as `StencilError`; recorder imbalance as a fatal
//!   `MalformedProgram`-class `RecordError`.
//! - **Sizes are integers.** Row counts, extents and byte sizes stay in
//!   `u64` end to end.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

/// Kernel ASTs: serializable raw trees and the resolved, typed core forms.
pub mod ast;
/// Semantic checker: type inference over specialized trees.
pub mod check;
/// Reference executor for emitted task graphs (CPU, sequential).
pub mod exec;
/// Control-program IR and the `IF`/`WHILE`/`END` recorder.
pub mod ir;
/// Data-layout descriptors exchanged at task boundaries.
pub mod layout;
/// Lowering pipeline: memoized kernel specialization and task emission.
pub mod lower;
/// Phase analysis: per-field/global access modes and race-freedom proof.
pub mod phase;
/// Relations, fields, globals, subsets, grids and the compiler context.
pub mod relation;
/// Specializer: name resolution and macro expansion.
pub mod specialize;
/// Task model: signatures, privileges, lowered bodies, driver ops.
pub mod task;
/// Primitive/vector/matrix/key types and the coercion lattice.
pub mod types;

// ============================================================================
// Canonical re-exports
// ============================================================================

pub use crate::check::{ArityError, CheckError, TypeError};
pub use crate::exec::{run, ExecError, Machine, Value};
pub use crate::ir::{ExprConst, Program, RecordError, Recorder};
pub use crate::lower::{compile, LowerError, Pipeline};
pub use crate::phase::{PhaseError, PhaseResult, PhaseType, StencilError};
pub use crate::relation::{
    Context, FieldId, FunId, GlobalId, RelationError, RelationId, SubsetId,
};
pub use crate::specialize::{HostEnv, SpecializeError};
pub use crate::task::{Backend, DomainRef, TaskGraph, TaskId};
pub use crate::types::{Primitive, Scalar, Type};

// ============================================================================
// Umbrella error
// ============================================================================

/// Any failure while compiling a program, by taxonomy kind. Compile-time
/// errors abort the compile of the enclosing kernel and carry the
/// offending node's source position in their message.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// Data-model construction failures (duplicate names, bad subsets).
    #[error(transparent)]
    Relation(#[from] RelationError),
    /// Unresolved names, malformed macro uses.
    #[error(transparent)]
    Specialize(#[from] SpecializeError),
    /// Lattice and structure violations (`"invalid types"`).
    #[error(transparent)]
    Type(#[from] TypeError),
    /// Call-shape violations (wrong relation, wrong helper arity).
    #[error(transparent)]
    Arity(#[from] ArityError),
    /// Race-freedom violations, including illegal stencils.
    #[error(transparent)]
    Phase(#[from] PhaseError),
    /// Recorder imbalance; fatal to the whole control program.
    #[error(transparent)]
    Record(#[from] RecordError),
    /// Control-program and task-emission failures.
    #[error(transparent)]
    Lower(#[from] LowerError),
}

impl From<CheckError> for CompileError {
    fn from(e: CheckError) -> CompileError {
        match e {
            CheckError::Type(t) => CompileError::Type(t),
            CheckError::Arity(a) => CompileError::Arity(a),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_keep_their_diagnostic_texts() {
        let e: CompileError = TypeError::InvalidTypes {
            detail: "bool with f64".into(),
            span: crate::ast::Span::none(),
        }
        .into();
        assert!(e.to_string().starts_with("invalid types"));

        let e: CompileError = RecordError::EndWithoutOpener.into();
        assert!(e.to_string().starts_with("malformed program"));
    }
}
