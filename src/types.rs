//! Type lattice for kernel values
//!
//! Primitive scalars, short vectors (length 1–6), small matrices, entity
//! keys, and record payloads, plus the **coercion lattice** every pass
//! agrees on:
//!
//! - integers widen within their own signedness (`i8 → i16 → i32 → i64`,
//!   likewise `u*`),
//! - any integer widens to `f64`,
//! - `f32` widens to `f64`,
//! - nothing narrows, and `bool` never mixes with numbers.
//!
//! The checker asks this module two questions: "do these two types have a
//! least upper bound?" (arithmetic) and "is that bound ordered?"
//! (comparison). Everything else — broadcast rules, reduction targets — is
//! the checker's business, not the lattice's.
//!
//! Sizes are `u64` end-to-end; no row count or byte size ever round-trips
//! through a float.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::relation::RelationId;

/// Machine scalar types available to fields, globals and kernel locals.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Primitive {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl Primitive {
    /// Storage width of one scalar.
    pub fn size_in_bytes(self) -> u64 {
        match self {
            Primitive::Bool | Primitive::I8 | Primitive::U8 => 1,
            Primitive::I16 | Primitive::U16 => 2,
            Primitive::I32 | Primitive::U32 | Primitive::F32 => 4,
            Primitive::I64 | Primitive::U64 | Primitive::F64 => 8,
        }
    }

    /// Stable lowercase name, used by layout descriptors and diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Primitive::Bool => "bool",
            Primitive::I8 => "i8",
            Primitive::I16 => "i16",
            Primitive::I32 => "i32",
            Primitive::I64 => "i64",
            Primitive::U8 => "u8",
            Primitive::U16 => "u16",
            Primitive::U32 => "u32",
            Primitive::U64 => "u64",
            Primitive::F32 => "f32",
            Primitive::F64 => "f64",
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Primitive::I8 | Primitive::I16 | Primitive::I32 | Primitive::I64)
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, Primitive::U8 | Primitive::U16 | Primitive::U32 | Primitive::U64)
    }

    pub fn is_integral(self) -> bool {
        self.is_signed() || self.is_unsigned()
    }

    pub fn is_float(self) -> bool {
        matches!(self, Primitive::F32 | Primitive::F64)
    }

    pub fn is_numeric(self) -> bool {
        self.is_integral() || self.is_float()
    }

    /// Smallest representable value, as a typed scalar constant.
    pub fn min_value(self) -> Scalar {
        match self {
            Primitive::Bool => Scalar::Bool(false),
            Primitive::I8 => Scalar::Int(i8::MIN as i64),
            Primitive::I16 => Scalar::Int(i16::MIN as i64),
            Primitive::I32 => Scalar::Int(i32::MIN as i64),
            Primitive::I64 => Scalar::Int(i64::MIN),
            Primitive::U8 | Primitive::U16 | Primitive::U32 | Primitive::U64 => Scalar::Uint(0),
            Primitive::F32 => Scalar::Float(f32::MIN as f64),
            Primitive::F64 => Scalar::Float(f64::MIN),
        }
    }

    /// Largest representable value, as a typed scalar constant.
    pub fn max_value(self) -> Scalar {
        match self {
            Primitive::Bool => Scalar::Bool(true),
            Primitive::I8 => Scalar::Int(i8::MAX as i64),
            Primitive::I16 => Scalar::Int(i16::MAX as i64),
            Primitive::I32 => Scalar::Int(i32::MAX as i64),
            Primitive::I64 => Scalar::Int(i64::MAX),
            Primitive::U8 => Scalar::Uint(u8::MAX as u64),
            Primitive::U16 => Scalar::Uint(u16::MAX as u64),
            Primitive::U32 => Scalar::Uint(u32::MAX as u64),
            Primitive::U64 => Scalar::Uint(u64::MAX),
            Primitive::F32 => Scalar::Float(f32::MAX as f64),
            Primitive::F64 => Scalar::Float(f64::MAX),
        }
    }

    /// Least upper bound in the coercion lattice, if the pair has one.
    ///
    /// This is the single source of truth for implicit conversion; the
    /// checker refuses any operand pair for which this returns `None`.
    pub fn join(a: Primitive, b: Primitive) -> Option<Primitive> {
        use Primitive::*;
        if a == b {
            return Some(a);
        }
        let rank = |p: Primitive| p.size_in_bytes();
        match (a, b) {
            // Same signedness: widen to the larger width.
            _ if a.is_signed() && b.is_signed() => Some(if rank(a) >= rank(b) { a } else { b }),
            _ if a.is_unsigned() && b.is_unsigned() => Some(if rank(a) >= rank(b) { a } else { b }),
            // f32 promotes to f64.
            (F32, F64) | (F64, F32) => Some(F64),
            // Integers promote to f64 (never to f32).
            _ if a.is_integral() && b == F64 => Some(F64),
            _ if b.is_integral() && a == F64 => Some(F64),
            _ => None,
        }
    }
}

/// A typed scalar constant.
///
/// Carrier for global initializers, fill values, reduction identities and
/// interpreter scalars. The payload is widened (`i64`/`u64`/`f64`); the
/// column's [`Primitive`] decides the stored width.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
}

impl Scalar {
    pub fn as_f64(self) -> f64 {
        match self {
            Scalar::Bool(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
            Scalar::Int(v) => v as f64,
            Scalar::Uint(v) => v as f64,
            Scalar::Float(v) => v,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(b),
            _ => None,
        }
    }
}

/// Value type of an expression, field column, global or helper parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Type {
    /// A single scalar.
    Prim(Primitive),
    /// Fixed-length vector, `1 ≤ len ≤ 6`.
    Vector { elem: Primitive, len: u8 },
    /// Row-major matrix of scalars.
    Matrix { elem: Primitive, rows: u8, cols: u8 },
    /// Identifier of one row of a relation.
    Key(RelationId),
    /// Ordered named fields; used only for insertion payloads.
    Record(Vec<(String, Type)>),
    /// Statements and kernels produce no value.
    Void,
    /// Placeholder between specialization and checking. Never survives the
    /// checker.
    Unknown,
}

/// Maximum vector length accepted by [`Type::vector`].
pub const MAX_VECTOR_LEN: u8 = 6;

impl Type {
    /// Checked vector constructor (`1 ≤ len ≤ 6`).
    pub fn vector(elem: Primitive, len: u8) -> Option<Type> {
        if (1..=MAX_VECTOR_LEN).contains(&len) {
            Some(Type::Vector { elem, len })
        } else {
            None
        }
    }

    /// Element primitive of a scalar/vector/matrix type.
    pub fn elem(&self) -> Option<Primitive> {
        match self {
            Type::Prim(p) => Some(*p),
            Type::Vector { elem, .. } | Type::Matrix { elem, .. } => Some(*elem),
            _ => None,
        }
    }

    /// Number of scalar lanes (1 for a scalar, `len` for a vector, `r·c`
    /// for a matrix).
    pub fn lanes(&self) -> Option<u64> {
        match self {
            Type::Prim(_) => Some(1),
            Type::Vector { len, .. } => Some(*len as u64),
            Type::Matrix { rows, cols, .. } => Some(*rows as u64 * *cols as u64),
            _ => None,
        }
    }

    /// Storage footprint of one value of this type. Keys are stored as
    /// 64-bit linear row numbers.
    pub fn size_in_bytes(&self) -> u64 {
        match self {
            Type::Prim(p) => p.size_in_bytes(),
            Type::Vector { elem, len } => elem.size_in_bytes() * *len as u64,
            Type::Matrix { elem, rows, cols } => {
                elem.size_in_bytes() * *rows as u64 * *cols as u64
            }
            Type::Key(_) => 8,
            Type::Record(fields) => fields.iter().map(|(_, t)| t.size_in_bytes()).sum(),
            Type::Void | Type::Unknown => 0,
        }
    }

    pub fn is_numeric_scalar(&self) -> bool {
        matches!(self, Type::Prim(p) if p.is_numeric())
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Type::Prim(Primitive::Bool))
    }

    /// Least upper bound of two types under elementwise coercion.
    ///
    /// Shapes must agree exactly (equal vector length, equal matrix
    /// dimensions); only the element primitive widens. Keys and records
    /// join only with themselves.
    pub fn join(a: &Type, b: &Type) -> Option<Type> {
        match (a, b) {
            (Type::Prim(pa), Type::Prim(pb)) => Primitive::join(*pa, *pb).map(Type::Prim),
            (Type::Vector { elem: ea, len: la }, Type::Vector { elem: eb, len: lb })
                if la == lb =>
            {
                Primitive::join(*ea, *eb).map(|e| Type::Vector { elem: e, len: *la })
            }
            (
                Type::Matrix { elem: ea, rows: ra, cols: ca },
                Type::Matrix { elem: eb, rows: rb, cols: cb },
            ) if ra == rb && ca == cb => Primitive::join(*ea, *eb)
                .map(|e| Type::Matrix { elem: e, rows: *ra, cols: *ca }),
            (Type::Key(ra), Type::Key(rb)) if ra == rb => Some(Type::Key(*ra)),
            _ => None,
        }
    }

    /// Whether `<`/`≤`/`>`/`≥` are defined on this pair: the join must
    /// exist and be a numeric **scalar**. Vectors, keys, records and
    /// booleans are unordered.
    pub fn ordered_pair(a: &Type, b: &Type) -> bool {
        matches!(Type::join(a, b), Some(Type::Prim(p)) if p.is_numeric())
    }

    /// Whether `==`/`≠` are defined on this pair. Equality additionally
    /// accepts `bool` with `bool` and key with same-relation key.
    pub fn equality_pair(a: &Type, b: &Type) -> bool {
        match (a, b) {
            (Type::Prim(Primitive::Bool), Type::Prim(Primitive::Bool)) => true,
            (Type::Key(ra), Type::Key(rb)) => ra == rb,
            _ => Type::ordered_pair(a, b),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Prim(p) => write!(f, "{}", p.name()),
            Type::Vector { elem, len } => write!(f, "vec{}({})", len, elem.name()),
            Type::Matrix { elem, rows, cols } => {
                write!(f, "mat{}x{}({})", rows, cols, elem.name())
            }
            Type::Key(rel) => write!(f, "key(rel{})", rel.as_usize()),
            Type::Record(fields) => {
                write!(f, "record{{")?;
                for (i, (name, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {ty}")?;
                }
                write!(f, "}}")
            }
            Type::Void => write!(f, "void"),
            Type::Unknown => write!(f, "?"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SIGNED: [Primitive; 4] = [Primitive::I8, Primitive::I16, Primitive::I32, Primitive::I64];
    const UNSIGNED: [Primitive; 4] =
        [Primitive::U8, Primitive::U16, Primitive::U32, Primitive::U64];

    #[test]
    fn integers_widen_within_signedness() {
        for (i, a) in SIGNED.iter().enumerate() {
            for b in &SIGNED[i..] {
                assert_eq!(Primitive::join(*a, *b), Some(*b));
                assert_eq!(Primitive::join(*b, *a), Some(*b));
            }
        }
        for (i, a) in UNSIGNED.iter().enumerate() {
            for b in &UNSIGNED[i..] {
                assert_eq!(Primitive::join(*a, *b), Some(*b));
            }
        }
    }

    #[test]
    fn mixed_signedness_has_no_join() {
        for a in SIGNED {
            for b in UNSIGNED {
                assert_eq!(Primitive::join(a, b), None);
                assert_eq!(Primitive::join(b, a), None);
            }
        }
    }

    #[test]
    fn integers_promote_to_f64_only() {
        for p in SIGNED.iter().chain(UNSIGNED.iter()) {
            assert_eq!(Primitive::join(*p, Primitive::F64), Some(Primitive::F64));
            // No silent int → f32 promotion.
            assert_eq!(Primitive::join(*p, Primitive::F32), None);
        }
        assert_eq!(Primitive::join(Primitive::F32, Primitive::F64), Some(Primitive::F64));
    }

    #[test]
    fn bool_never_mixes_with_numbers() {
        for p in SIGNED.iter().chain(UNSIGNED.iter()).chain([Primitive::F32, Primitive::F64].iter())
        {
            assert_eq!(Primitive::join(Primitive::Bool, *p), None);
        }
        assert_eq!(Primitive::join(Primitive::Bool, Primitive::Bool), Some(Primitive::Bool));
    }

    #[test]
    fn vector_join_needs_equal_length() {
        let v3i = Type::vector(Primitive::I32, 3).unwrap();
        let v3f = Type::vector(Primitive::F64, 3).unwrap();
        let v4i = Type::vector(Primitive::I32, 4).unwrap();

        assert_eq!(Type::join(&v3i, &v3f), Some(Type::Vector { elem: Primitive::F64, len: 3 }));
        assert_eq!(Type::join(&v3i, &v4i), None);
        // Scalar with vector has no lattice join; broadcast is a checker rule.
        assert_eq!(Type::join(&v3i, &Type::Prim(Primitive::I32)), None);
    }

    #[test]
    fn ordering_excludes_bools_and_vectors() {
        let f = Type::Prim(Primitive::F64);
        let b = Type::Prim(Primitive::Bool);
        let v = Type::vector(Primitive::F64, 2).unwrap();

        assert!(Type::ordered_pair(&f, &Type::Prim(Primitive::I32)));
        assert!(!Type::ordered_pair(&f, &b));
        assert!(!Type::ordered_pair(&v, &v));
        assert!(Type::equality_pair(&b, &b));
        assert!(!Type::equality_pair(&f, &b));
    }

    #[test]
    fn vector_length_bounds() {
        assert!(Type::vector(Primitive::F32, 0).is_none());
        assert!(Type::vector(Primitive::F32, 1).is_some());
        assert!(Type::vector(Primitive::F32, 6).is_some());
        assert!(Type::vector(Primitive::F32, 7).is_none());
    }

    #[test]
    fn reduction_identity_endpoints() {
        assert_eq!(Primitive::I8.max_value(), Scalar::Int(127));
        assert_eq!(Primitive::I8.min_value(), Scalar::Int(-128));
        assert_eq!(Primitive::U16.min_value(), Scalar::Uint(0));
        assert_eq!(Primitive::U16.max_value(), Scalar::Uint(65535));
    }

    #[test]
    fn sizes_are_exact() {
        assert_eq!(Type::Prim(Primitive::F32).size_in_bytes(), 4);
        assert_eq!(Type::vector(Primitive::F64, 3).unwrap().size_in_bytes(), 24);
        assert_eq!(
            Type::Matrix { elem: Primitive::F32, rows: 2, cols: 3 }.size_in_bytes(),
            24
        );
    }
}
