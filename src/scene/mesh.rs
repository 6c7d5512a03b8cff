//! Mesh ingestion: vertex layouts, tangent basis derivation, and the
//! per-triangle acceleration data consumed by the intersector.

use crate::bvh::{build, BvhBuild, BvhSettings};
use crate::math::Aabb;
use crate::scene::material::MaterialHandle;
use glam::{Vec2, Vec3};

/// Opaque 32-bit mesh handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MeshHandle(pub u32);

impl MeshHandle {
    pub const INVALID: Self = Self(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Opaque 32-bit mesh-instance handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MeshInstanceHandle(pub u32);

impl MeshInstanceHandle {
    pub const INVALID: Self = Self(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Supported input vertex layouts.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VertexLayout {
    PxyzNxyzTuv,
    PxyzNxyzTuvTuv,
    PxyzNxyzBxyzTuv,
    PxyzNxyzBxyzTuvTuv,
}

impl VertexLayout {
    /// Floats per vertex.
    pub fn stride(self) -> usize {
        match self {
            VertexLayout::PxyzNxyzTuv => 8,
            VertexLayout::PxyzNxyzTuvTuv => 10,
            VertexLayout::PxyzNxyzBxyzTuv => 11,
            VertexLayout::PxyzNxyzBxyzTuvTuv => 13,
        }
    }

    /// Whether the layout carries an explicit bitangent.
    pub fn has_bitangent(self) -> bool {
        matches!(
            self,
            VertexLayout::PxyzNxyzBxyzTuv | VertexLayout::PxyzNxyzBxyzTuvTuv
        )
    }
}

/// Common vertex layout all inputs are normalized into.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct Vertex {
    pub p: [f32; 3],
    pub n: [f32; 3],
    pub b: [f32; 3],
    pub t: [f32; 2],
}

/// One surface range of a mesh with its two-sided materials.
#[derive(Debug, Copy, Clone)]
pub struct ShapeDesc {
    pub vtx_start: usize,
    pub vtx_count: usize,
    pub front_mat: MaterialHandle,
    pub back_mat: MaterialHandle,
}

/// Caller-supplied mesh description.
#[derive(Debug, Clone)]
pub struct MeshDesc<'a> {
    pub name: &'a str,
    pub layout: VertexLayout,
    pub vtx_attrs: &'a [f32],
    pub vtx_indices: &'a [u32],
    pub base_vertex: u32,
    pub shapes: &'a [ShapeDesc],
    pub allow_spatial_splits: bool,
    pub use_fast_bvh_build: bool,
}

/// Stored mesh: bbox plus slices into the global node/tri/index arrays.
#[derive(Debug, Copy, Clone)]
pub struct Mesh {
    pub bbox: Aabb,
    pub node_index: u32,
    pub node_count: u32,
    pub wide_node_index: u32,
    pub wide_node_count: u32,
    pub tris_index: u32,
    pub tris_count: u32,
    pub vert_index: u32,
    pub vert_count: u32,
}

/// Mesh instance: mesh + transform + cached world bounds.
#[derive(Debug, Copy, Clone)]
pub struct MeshInstance {
    pub mesh_index: u32,
    pub tr_index: u32,
    pub bbox: Aabb,
}

/// Object-to-world transform with its cached inverse.
#[derive(Debug, Copy, Clone)]
pub struct Transform {
    pub xform: glam::Mat4,
    pub inv_xform: glam::Mat4,
}

impl Transform {
    pub fn new(xform: glam::Mat4) -> Self {
        Self {
            xform,
            inv_xform: xform.inverse(),
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::new(glam::Mat4::IDENTITY)
    }
}

/// Per-triangle Moller-Trumbore data: base vertex plus the two edges,
/// precomputed so the hot loop never touches the vertex arrays.
#[derive(Debug, Copy, Clone)]
pub struct TriAccel {
    pub v0: Vec3,
    pub e1: Vec3,
    pub e2: Vec3,
}

/// Per-side solid flag; cleared when the side's material tree contains a
/// Transparent leaf.
pub const MATERIAL_SOLID_BIT: u16 = 0x8000;
/// Mask extracting the material index from a triangle side.
pub const MATERIAL_INDEX_BITS: u16 = 0x3fff;

/// Front/back material references of one triangle.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct TriMaterial {
    pub front_mi: u16,
    pub back_mi: u16,
}

/// Geometry produced by mesh preprocessing, in mesh-local index space.
pub(crate) struct PreprocessedMesh {
    pub vertices: Vec<Vertex>,
    pub vtx_indices: Vec<u32>,
    pub bvh: BvhBuild,
    pub tris: Vec<TriAccel>,
    pub bbox: Aabb,
}

/// Normalize input attributes into `Vertex`, build the BLAS, and
/// precompute triangle accel data.
pub(crate) fn preprocess_mesh(desc: &MeshDesc) -> PreprocessedMesh {
    let stride = desc.layout.stride();
    let vertex_count = desc.vtx_attrs.len() / stride;

    let mut vertices = Vec::with_capacity(vertex_count);
    for i in 0..vertex_count {
        let a = &desc.vtx_attrs[i * stride..];
        let mut v = Vertex {
            p: [a[0], a[1], a[2]],
            n: [a[3], a[4], a[5]],
            ..Default::default()
        };
        match desc.layout {
            VertexLayout::PxyzNxyzTuv | VertexLayout::PxyzNxyzTuvTuv => {
                v.t = [a[6], a[7]];
            }
            VertexLayout::PxyzNxyzBxyzTuv | VertexLayout::PxyzNxyzBxyzTuvTuv => {
                v.b = [a[6], a[7], a[8]];
                v.t = [a[9], a[10]];
            }
        }
        vertices.push(v);
    }

    let vtx_indices: Vec<u32> = desc
        .vtx_indices
        .iter()
        .map(|&i| i + desc.base_vertex)
        .collect();

    if !desc.layout.has_bitangent() {
        compute_tangent_basis(&mut vertices, &vtx_indices);
    }

    let tri_count = vtx_indices.len() / 3;
    let mut tris = Vec::with_capacity(tri_count);
    let mut prim_bounds = Vec::with_capacity(tri_count);
    let mut bbox = Aabb::empty();
    for t in 0..tri_count {
        let v0 = Vec3::from(vertices[vtx_indices[t * 3] as usize].p);
        let v1 = Vec3::from(vertices[vtx_indices[t * 3 + 1] as usize].p);
        let v2 = Vec3::from(vertices[vtx_indices[t * 3 + 2] as usize].p);
        tris.push(TriAccel {
            v0,
            e1: v1 - v0,
            e2: v2 - v0,
        });
        let mut b = Aabb::empty();
        b.include_point(v0);
        b.include_point(v1);
        b.include_point(v2);
        bbox.include(b);
        prim_bounds.push(b);
    }

    let settings = BvhSettings {
        allow_spatial_splits: desc.allow_spatial_splits && !desc.use_fast_bvh_build,
        use_fast_build: desc.use_fast_bvh_build,
        ..Default::default()
    };
    let bvh = build(&prim_bounds, &settings);

    PreprocessedMesh {
        vertices,
        vtx_indices,
        bvh,
        tris,
        bbox,
    }
}

/// Derive a tangent basis from UV derivatives, accumulated per triangle
/// and stored into the vertex bitangent slot.
pub(crate) fn compute_tangent_basis(vertices: &mut [Vertex], indices: &[u32]) {
    let mut acc = vec![Vec3::ZERO; vertices.len()];
    for tri in indices.chunks_exact(3) {
        let (i0, i1, i2) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
        let p0 = Vec3::from(vertices[i0].p);
        let p1 = Vec3::from(vertices[i1].p);
        let p2 = Vec3::from(vertices[i2].p);
        let t0 = Vec2::from(vertices[i0].t);
        let t1 = Vec2::from(vertices[i1].t);
        let t2 = Vec2::from(vertices[i2].t);

        let e1 = p1 - p0;
        let e2 = p2 - p0;
        let du1 = t1 - t0;
        let du2 = t2 - t0;

        let det = du1.x * du2.y - du2.x * du1.y;
        let tangent = if det.abs() > 1.0e-12 {
            (e1 * du2.y - e2 * du1.y) / det
        } else {
            // Degenerate UVs fall back to a geometric edge.
            e1
        };
        for i in [i0, i1, i2] {
            acc[i] += tangent;
        }
    }
    for (v, t) in vertices.iter_mut().zip(acc) {
        let n = Vec3::from(v.n);
        // Gram-Schmidt against the normal; bitangent closes the frame.
        let t = (t - n * n.dot(t)).normalize_or_zero();
        let t = if t == Vec3::ZERO {
            let n_unit = n.normalize_or_zero();
            let n_unit = if n_unit == Vec3::ZERO { Vec3::Z } else { n_unit };
            crate::math::Onb::from_normal(n_unit).tangent
        } else {
            t
        };
        v.b = n.cross(t).into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn quad_attrs() -> (Vec<f32>, Vec<u32>) {
        // Unit quad in the XZ plane, +Y normal.
        let attrs = vec![
            // p           n        t
            0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, //
            1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, //
            1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 1.0, //
            0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0,
        ];
        let indices = vec![0, 1, 2, 0, 2, 3];
        (attrs, indices)
    }

    #[test]
    fn preprocess_builds_tris_and_bbox() {
        let (attrs, indices) = quad_attrs();
        let desc = MeshDesc {
            name: "quad",
            layout: VertexLayout::PxyzNxyzTuv,
            vtx_attrs: &attrs,
            vtx_indices: &indices,
            base_vertex: 0,
            shapes: &[],
            allow_spatial_splits: false,
            use_fast_bvh_build: false,
        };
        let m = preprocess_mesh(&desc);
        assert_eq!(m.tris.len(), 2);
        assert_eq!(m.vertices.len(), 4);
        assert_eq!(m.bbox.min, Vec3::ZERO);
        assert_eq!(m.bbox.max, Vec3::new(1.0, 0.0, 1.0));
        assert!(!m.bvh.nodes.is_empty());
        // Derived bitangent is orthogonal to the normal.
        for v in &m.vertices {
            let n = Vec3::from(v.n);
            let b = Vec3::from(v.b);
            assert!(n.dot(b).abs() < 1.0e-4);
            assert!((b.length() - 1.0).abs() < 1.0e-3);
        }
    }

    #[test]
    fn base_vertex_offsets_indices() {
        let (mut attrs, indices) = quad_attrs();
        // Prepend one dummy vertex; indices stay relative to base_vertex.
        let mut padded = vec![0.0; 8];
        padded.append(&mut attrs);
        let desc = MeshDesc {
            name: "quad",
            layout: VertexLayout::PxyzNxyzTuv,
            vtx_attrs: &padded,
            vtx_indices: &indices,
            base_vertex: 1,
            shapes: &[],
            allow_spatial_splits: false,
            use_fast_bvh_build: false,
        };
        let m = preprocess_mesh(&desc);
        assert_eq!(m.vtx_indices[0], 1);
        assert_eq!(m.tris.len(), 2);
        assert_eq!(m.bbox.max, Vec3::new(1.0, 0.0, 1.0));
    }
}
