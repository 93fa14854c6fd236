//! Relations, fields, globals, subsets and grids
//!
//! The data model every pass operates on:
//!
//! - a **relation** is a set of keyed entities with typed columns and a
//!   fixed logical size (flat count, or 1–3 grid extents),
//! - a **field** is one typed column of a relation,
//! - a **global** is a process-wide typed cell, assigned by the control
//!   program or reduced by kernels,
//! - a **subset** is a filtered view of a relation's keys, carried either
//!   as a boolean mask or as a sorted index list (exactly one is the
//!   source of truth; grid subsets may additionally remember the union of
//!   rectangles they came from).
//!
//! Grid relation families (`cells`, `vertices`, `dual_cells`) share a
//! row-major linearization (x fastest) and get their neighbor/link/axis
//! macros installed here as *data* ([`RelMacro`]); the specializer turns
//! them into core AST forms.
//!
//! [`Context`] owns the arenas and the name table. It is threaded
//! explicitly through every pass; no pass consults ambient state.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ir::ExprConst;
use crate::types::{Primitive, Type};

// ============================================================================
// Handles
// ============================================================================

macro_rules! arena_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub usize);
        impl $name {
            #[inline]
            pub fn as_usize(self) -> usize {
                self.0
            }
        }
    };
}

arena_id!(
    /// Immutable identity of a relation.
    RelationId
);
arena_id!(
    /// Identity of a field column.
    FieldId
);
arena_id!(
    /// Identity of a global cell.
    GlobalId
);
arena_id!(
    /// Identity of a subset view.
    SubsetId
);
arena_id!(
    /// Identity of a declared kernel or helper function.
    FunId
);

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while building the data model.
#[derive(Debug, thiserror::Error)]
pub enum RelationError {
    #[error("duplicate name {0:?}")]
    DuplicateName(String),
    #[error("relation {rel:?} already has a field or macro named {name:?}")]
    DuplicateField { rel: String, name: String },
    #[error("field type {0} is not storable")]
    UnstorableFieldType(Type),
    #[error("grid must have 1 to 3 extents (got {0})")]
    BadGridRank(usize),
    #[error("grid extents must be positive")]
    ZeroExtent,
    #[error("subset index {idx} out of range (size {size})")]
    IndexOutOfRange { idx: u64, size: u64 },
    #[error("subset index list must be strictly increasing")]
    UnsortedIndices,
    #[error("rectangle extent {axis} is [{lo}, {hi}] but the relation bound is {bound}")]
    RectOutOfBounds { axis: usize, lo: u64, hi: u64, bound: u64 },
    #[error("rectangle rank {got} does not match grid rank {want}")]
    RectRankMismatch { got: usize, want: usize },
    #[error("subsets over {0:?} require a grid relation")]
    NotAGrid(String),
    #[error("unknown name {0:?}")]
    UnknownName(String),
}

// ============================================================================
// Relations
// ============================================================================

/// Which member of a grid family a relation is.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridRole {
    Cells,
    Vertices,
    DualCells,
}

/// Structured-grid topology attached to a relation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GridInfo {
    /// Integer extents, rank 1–3. For `Vertices`/`DualCells` these are the
    /// cell extents plus one per axis.
    pub dims: Vec<u64>,
    /// Boundary layer depth used for the automatic subsets.
    pub n_bd: u64,
    /// Spatial origin of the cell at index 0 along each axis.
    pub origin: Vec<f64>,
    /// Cell width along each axis.
    pub width: Vec<f64>,
    pub role: GridRole,
}

impl GridInfo {
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn row_count(&self) -> u64 {
        self.dims.iter().product()
    }

    /// Row-major linearization, x fastest.
    pub fn linearize(&self, coords: &[u64]) -> u64 {
        debug_assert_eq!(coords.len(), self.dims.len());
        let mut id = 0u64;
        for axis in (0..self.dims.len()).rev() {
            id = id * self.dims[axis] + coords[axis];
        }
        id
    }

    /// Inverse of [`GridInfo::linearize`].
    pub fn delinearize(&self, mut id: u64) -> Vec<u64> {
        let mut coords = Vec::with_capacity(self.dims.len());
        for &d in &self.dims {
            coords.push(id % d);
            id /= d;
        }
        coords
    }

    /// Whether the cell at `coords` lies within `n_bd` of any face.
    pub fn in_boundary(&self, coords: &[u64]) -> bool {
        coords
            .iter()
            .zip(&self.dims)
            .any(|(&c, &d)| c < self.n_bd || c + self.n_bd >= d)
    }
}

/// Logical shape of a relation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Shape {
    /// Unstructured: a flat row count.
    Flat { size: u64 },
    /// Structured grid member.
    Grid(GridInfo),
}

impl Shape {
    pub fn row_count(&self) -> u64 {
        match self {
            Shape::Flat { size } => *size,
            Shape::Grid(g) => g.row_count(),
        }
    }

    /// Per-axis bounds used by affine wrap-around; a flat relation is a
    /// rank-1 space.
    pub fn bounds(&self) -> Vec<u64> {
        match self {
            Shape::Flat { size } => vec![*size],
            Shape::Grid(g) => g.dims.clone(),
        }
    }

    pub fn grid(&self) -> Option<&GridInfo> {
        match self {
            Shape::Grid(g) => Some(g),
            Shape::Flat { .. } => None,
        }
    }
}

/// A compile-time rewrite installed on a relation under a member name.
///
/// The specializer expands these to core AST forms when a kernel accesses
/// `key.<name>` and `<name>` is not a field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RelMacro {
    /// `xid`/`yid`/`zid`: extract one axis coordinate of the key.
    AxisId(u8),
    /// Spatial center of the cell, a `vec<rank>(f64)`.
    Center,
    /// Depth into the boundary layer from one face (0 outside the layer).
    BoundaryDepth { axis: u8, negative: bool },
    /// True iff the key lies within `n_bd` of any face.
    InBoundary,
    /// Negation of [`RelMacro::InBoundary`].
    InInterior,
    /// Same-coordinate link into a sibling grid relation
    /// (`cell.vertex`, `vertex.cell`, …).
    Link { target: RelationId },
}

/// An entity set with typed columns.
#[derive(Clone, Debug)]
pub struct Relation {
    pub name: String,
    pub shape: Shape,
    pub fields: Vec<FieldId>,
    pub subsets: Vec<SubsetId>,
    pub macros: HashMap<String, RelMacro>,
    /// Set once a kernel that inserts into or deletes from this relation
    /// has been compiled; installs the hidden live mask.
    pub elastic: bool,
    /// Hidden `_is_live_mask` column, present iff `elastic`.
    pub live_mask: Option<FieldId>,
    /// Deletions have left dead rows behind.
    pub fragmented: bool,
}

impl Relation {
    pub fn row_count(&self) -> u64 {
        self.shape.row_count()
    }
}

/// One typed column of a relation.
#[derive(Clone, Debug)]
pub struct Field {
    pub rel: RelationId,
    pub name: String,
    pub ty: Type,
}

impl Field {
    /// Element shape for layout descriptors. Keys are stored as `u64`
    /// linear row numbers.
    pub fn dld_type(&self) -> crate::layout::DldType {
        let (base, lanes) = match &self.ty {
            Type::Key(_) => (Primitive::U64, 1),
            other => (
                other.elem().expect("storable field type"),
                other.lanes().expect("storable field type"),
            ),
        };
        crate::layout::DldType::new(base, lanes)
    }
}

/// A process-wide typed cell.
#[derive(Clone, Debug)]
pub struct Global {
    pub name: String,
    pub ty: Type,
    pub init: ExprConst,
}

/// Key filter payload: exactly one representation is the source of truth.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SubsetData {
    /// One flag per key of the parent relation.
    Mask(Vec<bool>),
    /// Strictly increasing key list.
    Indices(Vec<u64>),
}

impl SubsetData {
    pub fn member_count(&self) -> u64 {
        match self {
            SubsetData::Mask(m) => m.iter().filter(|b| **b).count() as u64,
            SubsetData::Indices(ix) => ix.len() as u64,
        }
    }

    pub fn contains(&self, key: u64) -> bool {
        match self {
            SubsetData::Mask(m) => m.get(key as usize).copied().unwrap_or(false),
            SubsetData::Indices(ix) => ix.binary_search(&key).is_ok(),
        }
    }
}

/// Inclusive axis-aligned extents on a grid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub lo: Vec<u64>,
    pub hi: Vec<u64>,
}

/// A filtered view of a relation's keys.
#[derive(Clone, Debug)]
pub struct Subset {
    pub rel: RelationId,
    pub name: String,
    pub data: SubsetData,
    /// For grid subsets built from rectangles: the union the mask encodes.
    pub rectangles: Option<Vec<Rect>>,
}

/// Handles to the three members of a grid family.
#[derive(Copy, Clone, Debug)]
pub struct GridRelations {
    pub cells: RelationId,
    pub vertices: RelationId,
    pub dual_cells: RelationId,
}

// ============================================================================
// Context
// ============================================================================

/// Arena owner for the whole data model, threaded explicitly through the
/// compiler passes.
#[derive(Default, Debug)]
pub struct Context {
    relations: Vec<Relation>,
    fields: Vec<Field>,
    globals: Vec<Global>,
    subsets: Vec<Subset>,
    functions: Vec<crate::ast::RawFunction>,
    names: HashMap<String, Named>,
}

/// What a top-level name resolves to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Named {
    Relation(RelationId),
    Global(GlobalId),
    Subset(SubsetId),
    Function(FunId),
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    fn bind_name(&mut self, name: &str, value: Named) -> Result<(), RelationError> {
        if self.names.contains_key(name) {
            return Err(RelationError::DuplicateName(name.to_string()));
        }
        self.names.insert(name.to_string(), value);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Named> {
        self.names.get(name).copied()
    }

    // ---------------------------------------------------------------- arenas

    pub fn relation(&self, id: RelationId) -> &Relation {
        &self.relations[id.as_usize()]
    }

    pub fn relation_mut(&mut self, id: RelationId) -> &mut Relation {
        &mut self.relations[id.as_usize()]
    }

    pub fn field(&self, id: FieldId) -> &Field {
        &self.fields[id.as_usize()]
    }

    pub fn global(&self, id: GlobalId) -> &Global {
        &self.globals[id.as_usize()]
    }

    pub fn subset(&self, id: SubsetId) -> &Subset {
        &self.subsets[id.as_usize()]
    }

    pub fn function(&self, id: FunId) -> &crate::ast::RawFunction {
        &self.functions[id.as_usize()]
    }

    pub fn relations(&self) -> impl Iterator<Item = (RelationId, &Relation)> {
        self.relations.iter().enumerate().map(|(i, r)| (RelationId(i), r))
    }

    pub fn globals(&self) -> impl Iterator<Item = (GlobalId, &Global)> {
        self.globals.iter().enumerate().map(|(i, g)| (GlobalId(i), g))
    }

    pub fn fields_of(&self, rel: RelationId) -> impl Iterator<Item = (FieldId, &Field)> {
        self.relations[rel.as_usize()]
            .fields
            .iter()
            .map(move |fid| (*fid, self.field(*fid)))
    }

    /// Field of `rel` named `name`, if any.
    pub fn field_by_name(&self, rel: RelationId, name: &str) -> Option<FieldId> {
        self.relations[rel.as_usize()]
            .fields
            .iter()
            .copied()
            .find(|fid| self.field(*fid).name == name)
    }

    // ------------------------------------------------------------- creation

    /// Declare an unstructured relation of `size` rows.
    pub fn new_relation(&mut self, size: u64, name: &str) -> Result<RelationId, RelationError> {
        let id = RelationId(self.relations.len());
        self.bind_name(name, Named::Relation(id))?;
        self.relations.push(Relation {
            name: name.to_string(),
            shape: Shape::Flat { size },
            fields: Vec::new(),
            subsets: Vec::new(),
            macros: HashMap::new(),
            elastic: false,
            live_mask: None,
            fragmented: false,
        });
        Ok(id)
    }

    /// Declare a grid family: `cells` under `name`, plus `<name>.vertices`
    /// and `<name>.dual_cells`. Installs axis/center/boundary macros and
    /// the same-coordinate links, and builds the `boundary`/`interior`
    /// subsets of depth `n_bd` over the cells.
    pub fn new_grid(
        &mut self,
        dims: &[u64],
        n_bd: u64,
        name: &str,
    ) -> Result<GridRelations, RelationError> {
        let rank = dims.len();
        if !(1..=3).contains(&rank) {
            return Err(RelationError::BadGridRank(rank));
        }
        if dims.iter().any(|&d| d == 0) {
            return Err(RelationError::ZeroExtent);
        }

        let origin = vec![0.0; rank];
        let width = vec![1.0; rank];
        let dual_dims: Vec<u64> = dims.iter().map(|d| d + 1).collect();

        let mk = |role, dims: &[u64]| GridInfo {
            dims: dims.to_vec(),
            n_bd,
            origin: origin.clone(),
            width: width.clone(),
            role,
        };

        let cells = self.push_grid_relation(name, mk(GridRole::Cells, dims))?;
        let vertices = self
            .push_grid_relation(&format!("{name}.vertices"), mk(GridRole::Vertices, &dual_dims))?;
        let dual_cells = self.push_grid_relation(
            &format!("{name}.dual_cells"),
            mk(GridRole::DualCells, &dual_dims),
        )?;

        // Same-coordinate links agree with the shared row-major layout.
        self.install_link(cells, "vertex", vertices);
        self.install_link(vertices, "cell", cells);
        self.install_link(vertices, "dual_cell", dual_cells);
        self.install_link(dual_cells, "vertex", vertices);

        if n_bd > 0 {
            self.build_boundary_subsets(cells)?;
        }

        Ok(GridRelations { cells, vertices, dual_cells })
    }

    fn push_grid_relation(
        &mut self,
        name: &str,
        info: GridInfo,
    ) -> Result<RelationId, RelationError> {
        let id = RelationId(self.relations.len());
        self.bind_name(name, Named::Relation(id))?;

        let mut macros = HashMap::new();
        for (axis, label) in ["xid", "yid", "zid"].iter().enumerate().take(info.rank()) {
            macros.insert(label.to_string(), RelMacro::AxisId(axis as u8));
        }
        let depth_names =
            [("xneg_depth", "xpos_depth"), ("yneg_depth", "ypos_depth"), ("zneg_depth", "zpos_depth")];
        for (axis, (neg, pos)) in depth_names.into_iter().enumerate().take(info.rank()) {
            macros
                .insert(neg.to_string(), RelMacro::BoundaryDepth { axis: axis as u8, negative: true });
            macros
                .insert(pos.to_string(), RelMacro::BoundaryDepth { axis: axis as u8, negative: false });
        }
        macros.insert("in_boundary".to_string(), RelMacro::InBoundary);
        macros.insert("in_interior".to_string(), RelMacro::InInterior);
        if info.role == GridRole::Cells {
            macros.insert("center".to_string(), RelMacro::Center);
        }

        self.relations.push(Relation {
            name: name.to_string(),
            shape: Shape::Grid(info),
            fields: Vec::new(),
            subsets: Vec::new(),
            macros,
            elastic: false,
            live_mask: None,
            fragmented: false,
        });
        Ok(id)
    }

    fn install_link(&mut self, on: RelationId, name: &str, target: RelationId) {
        self.relations[on.as_usize()]
            .macros
            .insert(name.to_string(), RelMacro::Link { target });
    }

    fn build_boundary_subsets(&mut self, cells: RelationId) -> Result<(), RelationError> {
        let (mask, interior): (Vec<bool>, Vec<u64>) = {
            let g = self.relation(cells).shape.grid().expect("grid relation");
            let n = g.row_count();
            let mut mask = Vec::with_capacity(n as usize);
            let mut interior = Vec::new();
            for id in 0..n {
                let coords = g.delinearize(id);
                let bd = g.in_boundary(&coords);
                mask.push(bd);
                if !bd {
                    interior.push(id);
                }
            }
            (mask, interior)
        };

        let name = self.relation(cells).name.clone();
        self.push_subset(cells, &format!("{name}.boundary"), SubsetData::Mask(mask), None)?;
        self.push_subset(cells, &format!("{name}.interior"), SubsetData::Indices(interior), None)?;
        Ok(())
    }

    /// Declare a typed column on `rel`.
    pub fn new_field(
        &mut self,
        rel: RelationId,
        name: &str,
        ty: Type,
    ) -> Result<FieldId, RelationError> {
        match &ty {
            Type::Prim(_) | Type::Vector { .. } | Type::Matrix { .. } | Type::Key(_) => {}
            other => return Err(RelationError::UnstorableFieldType(other.clone())),
        }
        let relation = &self.relations[rel.as_usize()];
        if self.field_by_name(rel, name).is_some() || relation.macros.contains_key(name) {
            return Err(RelationError::DuplicateField {
                rel: relation.name.clone(),
                name: name.to_string(),
            });
        }
        let id = FieldId(self.fields.len());
        self.fields.push(Field { rel, name: name.to_string(), ty });
        self.relations[rel.as_usize()].fields.push(id);
        Ok(id)
    }

    /// Install a compile-time rewrite on `rel` under `name`.
    pub fn new_field_macro(
        &mut self,
        rel: RelationId,
        name: &str,
        mac: RelMacro,
    ) -> Result<(), RelationError> {
        if self.field_by_name(rel, name).is_some()
            || self.relations[rel.as_usize()].macros.contains_key(name)
        {
            return Err(RelationError::DuplicateField {
                rel: self.relation(rel).name.clone(),
                name: name.to_string(),
            });
        }
        self.relations[rel.as_usize()].macros.insert(name.to_string(), mac);
        Ok(())
    }

    /// Declare a global cell with an initial constant.
    pub fn new_global(
        &mut self,
        name: &str,
        ty: Type,
        init: ExprConst,
    ) -> Result<GlobalId, RelationError> {
        let id = GlobalId(self.globals.len());
        self.bind_name(name, Named::Global(id))?;
        self.globals.push(Global { name: name.to_string(), ty, init });
        Ok(id)
    }

    /// Register a kernel or helper definition.
    pub fn new_function(
        &mut self,
        fun: crate::ast::RawFunction,
    ) -> Result<FunId, RelationError> {
        let id = FunId(self.functions.len());
        self.bind_name(&fun.name.clone(), Named::Function(id))?;
        self.functions.push(fun);
        Ok(id)
    }

    /// Build a subset by evaluating `pred` over every key.
    pub fn new_subset_from_mask(
        &mut self,
        rel: RelationId,
        name: &str,
        pred: impl Fn(u64) -> bool,
    ) -> Result<SubsetId, RelationError> {
        let n = self.relation(rel).row_count();
        let mask: Vec<bool> = (0..n).map(pred).collect();
        self.push_subset(rel, name, SubsetData::Mask(mask), None)
    }

    /// Build a subset from an explicit, strictly increasing key list.
    pub fn new_subset_from_indices(
        &mut self,
        rel: RelationId,
        name: &str,
        indices: Vec<u64>,
    ) -> Result<SubsetId, RelationError> {
        let n = self.relation(rel).row_count();
        for w in indices.windows(2) {
            if w[0] >= w[1] {
                return Err(RelationError::UnsortedIndices);
            }
        }
        if let Some(&last) = indices.last() {
            if last >= n {
                return Err(RelationError::IndexOutOfRange { idx: last, size: n });
            }
        }
        self.push_subset(rel, name, SubsetData::Indices(indices), None)
    }

    /// Build a grid subset as the union of inclusive rectangles.
    pub fn new_subset_from_rectangles(
        &mut self,
        rel: RelationId,
        name: &str,
        rects: Vec<Rect>,
    ) -> Result<SubsetId, RelationError> {
        let mask = {
            let relation = self.relation(rel);
            let g = relation
                .shape
                .grid()
                .ok_or_else(|| RelationError::NotAGrid(relation.name.clone()))?;
            for r in &rects {
                if r.lo.len() != g.rank() || r.hi.len() != g.rank() {
                    return Err(RelationError::RectRankMismatch {
                        got: r.lo.len().max(r.hi.len()),
                        want: g.rank(),
                    });
                }
                for axis in 0..g.rank() {
                    if r.lo[axis] > r.hi[axis] || r.hi[axis] >= g.dims[axis] {
                        return Err(RelationError::RectOutOfBounds {
                            axis,
                            lo: r.lo[axis],
                            hi: r.hi[axis],
                            bound: g.dims[axis],
                        });
                    }
                }
            }
            let n = g.row_count();
            let mut mask = vec![false; n as usize];
            for id in 0..n {
                let coords = g.delinearize(id);
                if rects.iter().any(|r| {
                    (0..g.rank()).all(|a| r.lo[a] <= coords[a] && coords[a] <= r.hi[a])
                }) {
                    mask[id as usize] = true;
                }
            }
            mask
        };
        self.push_subset(rel, name, SubsetData::Mask(mask), Some(rects))
    }

    fn push_subset(
        &mut self,
        rel: RelationId,
        name: &str,
        data: SubsetData,
        rectangles: Option<Vec<Rect>>,
    ) -> Result<SubsetId, RelationError> {
        let id = SubsetId(self.subsets.len());
        self.bind_name(name, Named::Subset(id))?;
        self.subsets.push(Subset { rel, name: name.to_string(), data, rectangles });
        self.relations[rel.as_usize()].subsets.push(id);
        Ok(id)
    }

    /// Make `rel` elastic: install the hidden `_is_live_mask` column.
    /// Idempotent.
    pub fn make_elastic(&mut self, rel: RelationId) -> Result<FieldId, RelationError> {
        if let Some(mask) = self.relation(rel).live_mask {
            return Ok(mask);
        }
        let mask = self.new_field(rel, "_is_live_mask", Type::Prim(Primitive::Bool))?;
        let r = self.relation_mut(rel);
        r.elastic = true;
        r.live_mask = Some(mask);
        Ok(mask)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_family_row_counts() {
        let mut ctx = Context::new();
        let g = ctx.new_grid(&[4, 4], 1, "mesh").unwrap();
        assert_eq!(ctx.relation(g.cells).row_count(), 16);
        assert_eq!(ctx.relation(g.vertices).row_count(), 25);
        assert_eq!(ctx.relation(g.dual_cells).row_count(), 25);
    }

    #[test]
    fn boundary_and_interior_of_4x4_depth_1() {
        let mut ctx = Context::new();
        let g = ctx.new_grid(&[4, 4], 1, "mesh").unwrap();

        let boundary = match ctx.lookup("mesh.boundary") {
            Some(Named::Subset(s)) => ctx.subset(s),
            other => panic!("expected boundary subset, got {other:?}"),
        };
        let interior = match ctx.lookup("mesh.interior") {
            Some(Named::Subset(s)) => ctx.subset(s),
            other => panic!("expected interior subset, got {other:?}"),
        };

        assert_eq!(boundary.data.member_count(), 12);
        assert_eq!(interior.data.member_count(), 4);

        // id=5 is (1,1): interior. id=0 is (0,0): boundary.
        assert!(!boundary.data.contains(5));
        assert!(boundary.data.contains(0));
        assert!(interior.data.contains(5));
        let _ = g;
    }

    #[test]
    fn row_major_linearization_round_trips() {
        let g = GridInfo {
            dims: vec![5, 4, 3],
            n_bd: 0,
            origin: vec![0.0; 3],
            width: vec![1.0; 3],
            role: GridRole::Cells,
        };
        // x varies fastest.
        assert_eq!(g.linearize(&[1, 0, 0]), 1);
        assert_eq!(g.linearize(&[0, 1, 0]), 5);
        assert_eq!(g.linearize(&[0, 0, 1]), 20);
        for id in 0..g.row_count() {
            assert_eq!(g.linearize(&g.delinearize(id)), id);
        }
    }

    #[test]
    fn grid_links_point_at_siblings() {
        let mut ctx = Context::new();
        let g = ctx.new_grid(&[3, 3], 0, "m").unwrap();
        assert_eq!(
            ctx.relation(g.cells).macros.get("vertex"),
            Some(&RelMacro::Link { target: g.vertices })
        );
        assert_eq!(
            ctx.relation(g.vertices).macros.get("cell"),
            Some(&RelMacro::Link { target: g.cells })
        );
        assert_eq!(
            ctx.relation(g.dual_cells).macros.get("vertex"),
            Some(&RelMacro::Link { target: g.vertices })
        );
    }

    #[test]
    fn subset_index_validation() {
        let mut ctx = Context::new();
        let r = ctx.new_relation(10, "cells").unwrap();
        assert!(matches!(
            ctx.new_subset_from_indices(r, "bad", vec![3, 3]),
            Err(RelationError::UnsortedIndices)
        ));
        assert!(matches!(
            ctx.new_subset_from_indices(r, "oob", vec![4, 12]),
            Err(RelationError::IndexOutOfRange { idx: 12, size: 10 })
        ));
        let ok = ctx.new_subset_from_indices(r, "ok", vec![1, 4, 9]).unwrap();
        assert_eq!(ctx.subset(ok).data.member_count(), 3);
    }

    #[test]
    fn predicate_subsets_evaluate_over_every_key() {
        let mut ctx = Context::new();
        let r = ctx.new_relation(10, "cells").unwrap();
        let s = ctx.new_subset_from_mask(r, "even", |k| k % 2 == 0).unwrap();
        assert_eq!(ctx.subset(s).data.member_count(), 5);
        assert!(ctx.subset(s).data.contains(4));
        assert!(!ctx.subset(s).data.contains(5));
    }

    #[test]
    fn record_types_are_not_storable_columns() {
        let mut ctx = Context::new();
        let r = ctx.new_relation(4, "r").unwrap();
        let record = Type::Record(vec![("a".to_string(), Type::Prim(Primitive::F64))]);
        assert!(matches!(
            ctx.new_field(r, "payload", record),
            Err(RelationError::UnstorableFieldType(_))
        ));
    }

    #[test]
    fn rectangle_subset_mask_is_the_union() {
        let mut ctx = Context::new();
        let g = ctx.new_grid(&[5, 5], 0, "m").unwrap();
        let s = ctx
            .new_subset_from_rectangles(
                g.cells,
                "strip",
                vec![
                    Rect { lo: vec![0, 0], hi: vec![4, 0] },
                    Rect { lo: vec![0, 4], hi: vec![4, 4] },
                ],
            )
            .unwrap();
        assert_eq!(ctx.subset(s).data.member_count(), 10);
        assert!(ctx.subset(s).data.contains(0));
        assert!(!ctx.subset(s).data.contains(7));
    }

    #[test]
    fn rectangle_bounds_are_inclusive_and_checked() {
        let mut ctx = Context::new();
        let g = ctx.new_grid(&[4, 4], 0, "m").unwrap();
        assert!(matches!(
            ctx.new_subset_from_rectangles(
                g.cells,
                "oob",
                vec![Rect { lo: vec![0, 0], hi: vec![4, 3] }],
            ),
            Err(RelationError::RectOutOfBounds { axis: 0, hi: 4, bound: 4, .. })
        ));
    }

    #[test]
    fn elastic_installs_live_mask_once() {
        let mut ctx = Context::new();
        let r = ctx.new_relation(8, "particles").unwrap();
        let m1 = ctx.make_elastic(r).unwrap();
        let m2 = ctx.make_elastic(r).unwrap();
        assert_eq!(m1, m2);
        assert!(ctx.relation(r).elastic);
        assert_eq!(ctx.field(m1).name, "_is_live_mask");
    }

    #[test]
    fn field_macros_install_once_and_never_shadow_fields() {
        let mut ctx = Context::new();
        let g = ctx.new_grid(&[3, 3], 0, "m").unwrap();
        let other = ctx.new_grid(&[3, 3], 0, "o").unwrap();

        ctx.new_field_macro(g.cells, "twin", RelMacro::Link { target: other.cells }).unwrap();
        assert_eq!(
            ctx.relation(g.cells).macros.get("twin"),
            Some(&RelMacro::Link { target: other.cells })
        );
        // Installing over an existing macro or field is rejected.
        assert!(matches!(
            ctx.new_field_macro(g.cells, "twin", RelMacro::InBoundary),
            Err(RelationError::DuplicateField { .. })
        ));
        ctx.new_field(g.cells, "rho", Type::Prim(Primitive::F64)).unwrap();
        assert!(matches!(
            ctx.new_field_macro(g.cells, "rho", RelMacro::InBoundary),
            Err(RelationError::DuplicateField { .. })
        ));
        // And a field cannot shadow a macro either.
        assert!(matches!(
            ctx.new_field(g.cells, "in_boundary", Type::Prim(Primitive::Bool)),
            Err(RelationError::DuplicateField { .. })
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut ctx = Context::new();
        ctx.new_relation(4, "r").unwrap();
        assert!(matches!(ctx.new_relation(4, "r"), Err(RelationError::DuplicateName(_))));
        let r = ctx.lookup("r");
        assert!(matches!(r, Some(Named::Relation(_))));
    }
}
