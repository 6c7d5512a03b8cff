//! Ray-scene intersection: TLAS/BLAS traversal over the binary or wide
//! BVH layout, closest-hit and any-hit (shadow) queries.

use crate::bvh::{unpack_wide_leaf, BvhNode, LEAF_BIT, WIDE_WIDTH};
use crate::scene::material::{ShadingNode, MIX_MAT1, MIX_MAT2};
use crate::scene::mesh::{MATERIAL_INDEX_BITS, MATERIAL_SOLID_BIT};
use crate::scene::SceneInner;
use glam::{Vec2, Vec3};

/// A ray with its origin and unit direction.
#[derive(Debug, Copy, Clone)]
pub struct Ray {
    pub orig: Vec3,
    pub dir: Vec3,
}

/// Closest-hit record. The same record shape is what a hardware
/// ray-tracing backend would hand back.
#[derive(Debug, Copy, Clone)]
pub struct Hit {
    pub t: f32,
    /// Instance slot in the scene's instance store.
    pub instance: u32,
    /// Global triangle index.
    pub tri_index: u32,
    /// Barycentrics of the hit (weights of v1 and v2).
    pub u: f32,
    pub v: f32,
    /// Whether the front side was struck.
    pub front_facing: bool,
}

/// Transmission below this is treated as fully occluded.
const SHADOW_TRANSMISSION_EPS: f32 = 1.0e-4;

/// Offset a ray origin along the geometric normal, scale-invariantly
/// (integer-ulp nudge away from the surface, per Ray Tracing Gems).
pub fn offset_ray_origin(p: Vec3, n: Vec3) -> Vec3 {
    const ORIGIN: f32 = 1.0 / 32.0;
    const FLOAT_SCALE: f32 = 1.0 / 65536.0;
    const INT_SCALE: f32 = 256.0;

    let of_i = [
        (INT_SCALE * n.x) as i32,
        (INT_SCALE * n.y) as i32,
        (INT_SCALE * n.z) as i32,
    ];
    let mut out = [0.0f32; 3];
    for c in 0..3 {
        let pc = p[c];
        if pc.abs() < ORIGIN {
            out[c] = pc + FLOAT_SCALE * n[c];
        } else {
            let bits = pc.to_bits() as i32;
            let adj = if pc < 0.0 { bits - of_i[c] } else { bits + of_i[c] };
            out[c] = f32::from_bits(adj as u32);
        }
    }
    Vec3::from(out)
}

#[derive(Debug, Copy, Clone)]
struct TriHit {
    t: f32,
    u: f32,
    v: f32,
    front_facing: bool,
}

/// Moller-Trumbore test against precomputed `(v0, e1, e2)`.
fn intersect_tri(
    v0: Vec3,
    e1: Vec3,
    e2: Vec3,
    orig: Vec3,
    dir: Vec3,
    t_max: f32,
) -> Option<TriHit> {
    let pvec = dir.cross(e2);
    let det = e1.dot(pvec);
    if det.abs() < 1.0e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    let tvec = orig - v0;
    let u = tvec.dot(pvec) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let qvec = tvec.cross(e1);
    let v = dir.dot(qvec) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(qvec) * inv_det;
    if t <= 0.0 || t >= t_max {
        return None;
    }
    Some(TriHit {
        t,
        u,
        v,
        front_facing: det > 0.0,
    })
}

/// Slab test; returns the near parameter when the box is hit in
/// `(0, t_max)`.
fn slab(bbox_min: Vec3, bbox_max: Vec3, orig: Vec3, inv_dir: Vec3, t_max: f32) -> Option<f32> {
    let t0 = (bbox_min - orig) * inv_dir;
    let t1 = (bbox_max - orig) * inv_dir;
    let t_near = t0.min(t1).max_element().max(0.0);
    let t_far = t0.max(t1).min_element();
    if t_near <= t_far && t_near < t_max {
        Some(t_near)
    } else {
        None
    }
}

struct ObjectRay {
    orig: Vec3,
    dir: Vec3,
    inv_dir: Vec3,
}

impl ObjectRay {
    fn new(orig: Vec3, dir: Vec3) -> Self {
        Self {
            orig,
            dir,
            inv_dir: dir.recip(),
        }
    }
}

fn use_wide(s: &SceneInner) -> bool {
    s.settings.use_wide_bvh && !s.wide_nodes.is_empty()
}

/// Closest hit over the whole scene.
pub(crate) fn intersect_closest(s: &SceneInner, ray: &Ray, t_max: f32) -> Option<Hit> {
    if s.mi_indices.is_empty() {
        return None;
    }
    let world = ObjectRay::new(ray.orig, ray.dir);
    let mut best: Option<Hit> = None;
    let mut closest = t_max;

    let visit_instance = |slot: u32, closest: &mut f32, best: &mut Option<Hit>| {
        let Some(mi) = s.mesh_instances.get(slot) else {
            return;
        };
        let Some(mesh) = s.meshes.get(mi.mesh_index) else {
            return;
        };
        let Some(tr) = s.transforms.get(mi.tr_index) else {
            return;
        };
        let obj = ObjectRay::new(
            tr.inv_xform.transform_point3(ray.orig),
            tr.inv_xform.transform_vector3(ray.dir),
        );
        let local = if use_wide(s) {
            blas_closest_wide(s, &obj, mesh.wide_node_index, *closest)
        } else {
            blas_closest(s, &obj, mesh.node_index, *closest)
        };
        if let Some(h) = local {
            *closest = h.0;
            *best = Some(Hit {
                t: h.0,
                instance: slot,
                tri_index: h.1,
                u: h.2.u,
                v: h.2.v,
                front_facing: h.2.front_facing,
            });
        }
    };

    if use_wide(s) {
        let mut stack = vec![s.wide_macro_start];
        while let Some(node_index) = stack.pop() {
            let node = &s.wide_nodes[node_index as usize];
            let mut order: [(f32, u32); WIDE_WIDTH] = [(f32::INFINITY, u32::MAX); WIDE_WIDTH];
            let mut n_hit = 0;
            for lane in 0..node.child_count as usize {
                let bb_min = Vec3::new(
                    node.bbox_min[0][lane],
                    node.bbox_min[1][lane],
                    node.bbox_min[2][lane],
                );
                let bb_max = Vec3::new(
                    node.bbox_max[0][lane],
                    node.bbox_max[1][lane],
                    node.bbox_max[2][lane],
                );
                if let Some(t) = slab(bb_min, bb_max, world.orig, world.inv_dir, closest) {
                    order[n_hit] = (t, node.child[lane]);
                    n_hit += 1;
                }
            }
            // Far children first so the stack pops near-first.
            order[..n_hit].sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            for &(_, child) in &order[..n_hit] {
                if child & LEAF_BIT != 0 {
                    let (prim, count) = unpack_wide_leaf(child);
                    for k in 0..count {
                        visit_instance(s.mi_indices[(prim + k) as usize], &mut closest, &mut best);
                    }
                } else {
                    stack.push(child);
                }
            }
        }
    } else {
        let mut stack = vec![s.macro_nodes_start];
        while let Some(node_index) = stack.pop() {
            let node = &s.nodes[node_index as usize];
            if slab(node.bbox_min, node.bbox_max, world.orig, world.inv_dir, closest).is_none() {
                continue;
            }
            if node.is_leaf() {
                let start = node.prim_index();
                for k in 0..node.prim_count() {
                    visit_instance(s.mi_indices[(start + k) as usize], &mut closest, &mut best);
                }
            } else {
                push_ordered(s, &world, node, closest, &mut stack);
            }
        }
    }
    best
}

/// Push a binary node's children far-first.
fn push_ordered(s: &SceneInner, ray: &ObjectRay, node: &BvhNode, t_max: f32, stack: &mut Vec<u32>) {
    let l = &s.nodes[node.left_child as usize];
    let r = &s.nodes[node.right_child as usize];
    let tl = slab(l.bbox_min, l.bbox_max, ray.orig, ray.inv_dir, t_max);
    let tr = slab(r.bbox_min, r.bbox_max, ray.orig, ray.inv_dir, t_max);
    match (tl, tr) {
        (Some(a), Some(b)) => {
            if a <= b {
                stack.push(node.right_child);
                stack.push(node.left_child);
            } else {
                stack.push(node.left_child);
                stack.push(node.right_child);
            }
        }
        (Some(_), None) => stack.push(node.left_child),
        (None, Some(_)) => stack.push(node.right_child),
        (None, None) => {}
    }
}

fn blas_leaf_closest(
    s: &SceneInner,
    ray: &ObjectRay,
    prim_start: u32,
    prim_count: u32,
    closest: &mut f32,
    best: &mut Option<(f32, u32, TriHit)>,
) {
    for k in 0..prim_count {
        let tri = s.tri_indices[(prim_start + k) as usize];
        let accel = &s.tris[tri as usize];
        if let Some(h) = intersect_tri(accel.v0, accel.e1, accel.e2, ray.orig, ray.dir, *closest) {
            *closest = h.t;
            *best = Some((h.t, tri, h));
        }
    }
}

fn blas_closest(
    s: &SceneInner,
    ray: &ObjectRay,
    root: u32,
    t_max: f32,
) -> Option<(f32, u32, TriHit)> {
    let mut best = None;
    let mut closest = t_max;
    let mut stack = vec![root];
    while let Some(node_index) = stack.pop() {
        let node = &s.nodes[node_index as usize];
        if slab(node.bbox_min, node.bbox_max, ray.orig, ray.inv_dir, closest).is_none() {
            continue;
        }
        if node.is_leaf() {
            blas_leaf_closest(s, ray, node.prim_index(), node.prim_count(), &mut closest, &mut best);
        } else {
            push_ordered(s, ray, node, closest, &mut stack);
        }
    }
    best
}

fn blas_closest_wide(
    s: &SceneInner,
    ray: &ObjectRay,
    root: u32,
    t_max: f32,
) -> Option<(f32, u32, TriHit)> {
    let mut best = None;
    let mut closest = t_max;
    let mut stack = vec![root];
    while let Some(node_index) = stack.pop() {
        let node = &s.wide_nodes[node_index as usize];
        let mut order: [(f32, u32); WIDE_WIDTH] = [(f32::INFINITY, u32::MAX); WIDE_WIDTH];
        let mut n_hit = 0;
        for lane in 0..node.child_count as usize {
            let bb_min = Vec3::new(
                node.bbox_min[0][lane],
                node.bbox_min[1][lane],
                node.bbox_min[2][lane],
            );
            let bb_max = Vec3::new(
                node.bbox_max[0][lane],
                node.bbox_max[1][lane],
                node.bbox_max[2][lane],
            );
            if let Some(t) = slab(bb_min, bb_max, ray.orig, ray.inv_dir, closest) {
                order[n_hit] = (t, node.child[lane]);
                n_hit += 1;
            }
        }
        order[..n_hit].sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        for &(_, child) in &order[..n_hit] {
            if child & LEAF_BIT != 0 {
                let (prim, count) = unpack_wide_leaf(child);
                blas_leaf_closest(s, ray, prim, count, &mut closest, &mut best);
            } else {
                stack.push(child);
            }
        }
    }
    best
}

/// Interpolated UV of a hit on a (global) triangle.
pub(crate) fn hit_uv(s: &SceneInner, tri_index: u32, u: f32, v: f32) -> Vec2 {
    let base = (tri_index * 3) as usize;
    let t0 = Vec2::from(s.vertices[s.vtx_indices[base] as usize].t);
    let t1 = Vec2::from(s.vertices[s.vtx_indices[base + 1] as usize].t);
    let t2 = Vec2::from(s.vertices[s.vtx_indices[base + 2] as usize].t);
    t0 * (1.0 - u - v) + t1 * u + t2 * v
}

/// Fraction of light passing through a material tree at a surface point.
/// Transparent leaves pass their base color; Mix nodes blend; everything
/// else blocks.
fn eval_transparency(s: &SceneInner, mat_index: u32, uv: Vec2) -> Vec3 {
    let Some(mat) = s.materials.get(mat_index) else {
        return Vec3::ZERO;
    };
    match mat.kind {
        ShadingNode::Transparent => {
            let mut c = mat.base_color;
            let base_tex = crate::tex::TextureHandle(mat.textures[crate::scene::material::BASE_TEXTURE]);
            if base_tex.is_valid() {
                let t = s.textures.sample(base_tex, uv);
                c *= Vec3::new(t.x, t.y, t.z);
            }
            c
        }
        ShadingNode::Mix => {
            let mut k = mat.strength;
            let base_tex = crate::tex::TextureHandle(mat.textures[crate::scene::material::BASE_TEXTURE]);
            if base_tex.is_valid() {
                k *= s.textures.sample(base_tex, uv).x;
            }
            if mat.flags & crate::scene::material::MAT_FLAG_MIX_ADD != 0 {
                return eval_transparency(s, mat.textures[MIX_MAT1], uv);
            }
            let a = eval_transparency(s, mat.textures[MIX_MAT1], uv);
            let b = eval_transparency(s, mat.textures[MIX_MAT2], uv);
            a * (1.0 - k) + b * k
        }
        _ => Vec3::ZERO,
    }
}

/// Shadow query: transmission along `ray` up to `t_max`. Opaque (solid)
/// surfaces return zero immediately; transparent surfaces scale the
/// transmission and the ray continues.
pub(crate) fn trace_shadow(s: &SceneInner, ray: &Ray, t_max: f32) -> Vec3 {
    if s.mi_indices.is_empty() {
        return Vec3::ONE;
    }
    let world = ObjectRay::new(ray.orig, ray.dir);
    let mut transmission = Vec3::ONE;

    // Any-hit order does not matter; reuse the binary TLAS for iteration
    // simplicity and the per-mesh layout of choice below it.
    let mut stack = vec![s.macro_nodes_start];
    while let Some(node_index) = stack.pop() {
        let node = &s.nodes[node_index as usize];
        if slab(node.bbox_min, node.bbox_max, world.orig, world.inv_dir, t_max).is_none() {
            continue;
        }
        if !node.is_leaf() {
            stack.push(node.left_child);
            stack.push(node.right_child);
            continue;
        }
        for k in 0..node.prim_count() {
            let slot = s.mi_indices[(node.prim_index() + k) as usize];
            let Some(mi) = s.mesh_instances.get(slot) else {
                continue;
            };
            let Some(mesh) = s.meshes.get(mi.mesh_index) else {
                continue;
            };
            let Some(tr) = s.transforms.get(mi.tr_index) else {
                continue;
            };
            let obj = ObjectRay::new(
                tr.inv_xform.transform_point3(ray.orig),
                tr.inv_xform.transform_vector3(ray.dir),
            );
            let mut blas_stack = vec![mesh.node_index];
            while let Some(bi) = blas_stack.pop() {
                let bnode = &s.nodes[bi as usize];
                if slab(bnode.bbox_min, bnode.bbox_max, obj.orig, obj.inv_dir, t_max).is_none() {
                    continue;
                }
                if !bnode.is_leaf() {
                    blas_stack.push(bnode.left_child);
                    blas_stack.push(bnode.right_child);
                    continue;
                }
                for j in 0..bnode.prim_count() {
                    let tri = s.tri_indices[(bnode.prim_index() + j) as usize];
                    let accel = &s.tris[tri as usize];
                    let Some(h) =
                        intersect_tri(accel.v0, accel.e1, accel.e2, obj.orig, obj.dir, t_max)
                    else {
                        continue;
                    };
                    let tm = s.tri_materials[tri as usize];
                    let side = if h.front_facing { tm.front_mi } else { tm.back_mi };
                    if side & MATERIAL_SOLID_BIT != 0 {
                        return Vec3::ZERO;
                    }
                    let uv = hit_uv(s, tri, h.u, h.v);
                    transmission *= eval_transparency(s, (side & MATERIAL_INDEX_BITS) as u32, uv);
                    if transmission.max_element() < SHADOW_TRANSMISSION_EPS {
                        return Vec3::ZERO;
                    }
                }
            }
        }
    }
    transmission
}

#[cfg(test)]
mod tests;
