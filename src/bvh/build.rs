//! Binned-SAH BVH construction with optional spatial splits.

use super::{BvhNode, LEAF_BIT};
use crate::math::Aabb;
use glam::Vec3;

const NUM_BINS: usize = 16;
const MAX_DEPTH: u32 = 60;
const DEGENERATE_EPS: f32 = 1.0e-5;

/// Construction parameters.
#[derive(Debug, Copy, Clone)]
pub struct BvhSettings {
    /// Cost of one traversal step relative to one primitive test.
    pub traversal_cost: f32,
    /// Leaves are emitted at or below this primitive count.
    pub leaf_threshold: u32,
    /// Evaluate spatial splits when object-split children overlap.
    pub allow_spatial_splits: bool,
    /// Median-centroid splits only; implies no spatial splits.
    pub use_fast_build: bool,
    /// Child-overlap area fraction above which spatial splits are tried.
    pub oversplit_threshold: f32,
}

impl Default for BvhSettings {
    fn default() -> Self {
        Self {
            traversal_cost: 1.0,
            leaf_threshold: 4,
            allow_spatial_splits: false,
            use_fast_build: false,
            oversplit_threshold: 1.0e-5,
        }
    }
}

/// Result of a build: flat nodes plus the primitive-index permutation.
/// With spatial splits enabled, indices may repeat across leaves.
#[derive(Debug, Clone)]
pub struct BvhBuild {
    pub nodes: Vec<BvhNode>,
    pub prim_indices: Vec<u32>,
}

#[derive(Debug, Copy, Clone)]
struct PrimRef {
    index: u32,
    bounds: Aabb,
}

#[derive(Debug, Copy, Clone, Default)]
struct Bin {
    bounds: Option<Aabb>,
    count: u32,
    // Spatial binning tracks references entering and leaving at this bin.
    enter: u32,
    exit: u32,
}

impl Bin {
    fn include(&mut self, b: Aabb) {
        self.bounds = Some(match self.bounds {
            Some(cur) => cur.union(&b),
            None => b,
        });
    }

    fn bounds(&self) -> Aabb {
        self.bounds.unwrap_or_else(Aabb::empty)
    }
}

/// Build a BVH over primitive bounding boxes.
pub fn build(prims: &[Aabb], settings: &BvhSettings) -> BvhBuild {
    let mut refs: Vec<PrimRef> = prims
        .iter()
        .enumerate()
        .map(|(i, b)| PrimRef {
            index: i as u32,
            bounds: pad_degenerate(*b),
        })
        .collect();

    let mut out = BvhBuild {
        nodes: Vec::new(),
        prim_indices: Vec::new(),
    };
    if refs.is_empty() {
        return out;
    }
    let root_area = node_bounds(&refs).area().max(1.0e-20);
    build_node(&mut out, &mut refs, settings, root_area, 0);
    out
}

fn pad_degenerate(mut b: Aabb) -> Aabb {
    let e = b.extent();
    for i in 0..3 {
        if e[i] < DEGENERATE_EPS {
            b.min[i] -= 0.5 * DEGENERATE_EPS;
            b.max[i] += 0.5 * DEGENERATE_EPS;
        }
    }
    b
}

fn node_bounds(refs: &[PrimRef]) -> Aabb {
    let mut b = Aabb::empty();
    for r in refs {
        b.include(r.bounds);
    }
    b
}

fn centroid_bounds(refs: &[PrimRef]) -> Aabb {
    let mut b = Aabb::empty();
    for r in refs {
        b.include_point(r.bounds.center());
    }
    b
}

fn emit_leaf(out: &mut BvhBuild, refs: &[PrimRef], bounds: Aabb) -> u32 {
    let node_index = out.nodes.len() as u32;
    let prim_index = out.prim_indices.len() as u32;
    for r in refs {
        out.prim_indices.push(r.index);
    }
    out.nodes.push(BvhNode {
        bbox_min: bounds.min,
        bbox_max: bounds.max,
        left_child: prim_index | LEAF_BIT,
        right_child: refs.len() as u32,
    });
    node_index
}

fn build_node(
    out: &mut BvhBuild,
    refs: &mut Vec<PrimRef>,
    settings: &BvhSettings,
    root_area: f32,
    depth: u32,
) -> u32 {
    let bounds = node_bounds(refs);

    if refs.len() as u32 <= settings.leaf_threshold || depth >= MAX_DEPTH {
        return emit_leaf(out, refs, bounds);
    }

    let split = if settings.use_fast_build {
        median_split(refs)
    } else {
        sah_split(refs, bounds, settings, root_area)
    };

    let Some((mut left, mut right)) = split else {
        return emit_leaf(out, refs, bounds);
    };
    refs.clear();
    refs.shrink_to_fit();

    // Reserve the interior node before descending so child indices are
    // final when each subtree completes.
    let node_index = out.nodes.len() as u32;
    out.nodes.push(BvhNode {
        bbox_min: bounds.min,
        bbox_max: bounds.max,
        left_child: 0,
        right_child: 0,
    });

    let left_index = build_node(out, &mut left, settings, root_area, depth + 1);
    let right_index = build_node(out, &mut right, settings, root_area, depth + 1);
    out.nodes[node_index as usize].left_child = left_index;
    out.nodes[node_index as usize].right_child = right_index;
    node_index
}

/// Median-centroid split along the widest axis, used by fast builds and
/// as the fallback when binning cannot separate the input.
fn median_split(refs: &mut Vec<PrimRef>) -> Option<(Vec<PrimRef>, Vec<PrimRef>)> {
    let cb = centroid_bounds(refs);
    let e = cb.extent();
    let axis = widest_axis(e);
    refs.sort_by(|a, b| {
        let ca = a.bounds.center()[axis];
        let cb = b.bounds.center()[axis];
        ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
    });
    let mid = refs.len() / 2;
    if mid == 0 || mid == refs.len() {
        return None;
    }
    let right = refs.split_off(mid);
    Some((std::mem::take(refs), right))
}

fn widest_axis(e: Vec3) -> usize {
    if e.x >= e.y && e.x >= e.z {
        0
    } else if e.y >= e.z {
        1
    } else {
        2
    }
}

struct SplitCandidate {
    cost: f32,
    axis: usize,
    bin: usize,
    spatial: bool,
}

fn sah_split(
    refs: &mut Vec<PrimRef>,
    bounds: Aabb,
    settings: &BvhSettings,
    root_area: f32,
) -> Option<(Vec<PrimRef>, Vec<PrimRef>)> {
    let cb = centroid_bounds(refs);
    let parent_area = bounds.area().max(1.0e-20);
    let leaf_cost = refs.len() as f32;

    let mut best: Option<SplitCandidate> = None;
    let mut best_overlap = Aabb::empty();

    for axis in 0..3 {
        let extent = cb.extent()[axis];
        if extent < DEGENERATE_EPS {
            continue;
        }
        let scale = NUM_BINS as f32 / extent;
        let base = cb.min[axis];

        let mut bins = [Bin::default(); NUM_BINS];
        for r in refs.iter() {
            let c = r.bounds.center()[axis];
            let bi = (((c - base) * scale) as usize).min(NUM_BINS - 1);
            bins[bi].count += 1;
            bins[bi].include(r.bounds);
        }

        if let Some((cost, bin, overlap)) = sweep_bins(&bins, settings, parent_area) {
            if best.as_ref().map_or(true, |b| cost < b.cost) {
                best = Some(SplitCandidate {
                    cost,
                    axis,
                    bin,
                    spatial: false,
                });
                best_overlap = overlap;
            }
        }
    }

    // Spatial splits: when the winning object split leaves children with
    // significant overlap, clip straddling references against bin planes
    // and re-run SAH over the chipped sets.
    if settings.allow_spatial_splits {
        if let Some(obj) = best.as_ref() {
            let overlap_frac = best_overlap.area() / root_area;
            if overlap_frac > settings.oversplit_threshold {
                if let Some((cost, bin)) = spatial_sweep(refs, bounds, obj.axis, settings, parent_area) {
                    if cost < obj.cost {
                        best = Some(SplitCandidate {
                            cost,
                            axis: obj.axis,
                            bin,
                            spatial: true,
                        });
                    }
                }
            }
        }
    }

    let best = best?;
    if best.cost >= leaf_cost && refs.len() <= (4 * settings.leaf_threshold) as usize {
        // No split beats the leaf and the leaf is still reasonably small.
        return None;
    }

    if best.spatial {
        Some(spatial_partition(refs, bounds, best.axis, best.bin))
    } else {
        let extent = cb.extent()[best.axis];
        let scale = NUM_BINS as f32 / extent;
        let base = cb.min[best.axis];
        let mut left = Vec::new();
        let mut right = Vec::new();
        for r in refs.drain(..) {
            let bi = (((r.bounds.center()[best.axis] - base) * scale) as usize).min(NUM_BINS - 1);
            if bi <= best.bin {
                left.push(r);
            } else {
                right.push(r);
            }
        }
        if left.is_empty() || right.is_empty() {
            // Binning failed to separate equal centroids.
            refs.extend(left);
            refs.extend(right);
            return median_split(refs);
        }
        Some((left, right))
    }
}

/// Prefix/suffix sweep over object bins. Returns the best
/// `(cost, split_bin, child_overlap)` for this axis.
fn sweep_bins(
    bins: &[Bin; NUM_BINS],
    settings: &BvhSettings,
    parent_area: f32,
) -> Option<(f32, usize, Aabb)> {
    let mut left_bounds = [Aabb::empty(); NUM_BINS];
    let mut left_count = [0u32; NUM_BINS];
    let mut acc = Aabb::empty();
    let mut cnt = 0;
    for i in 0..NUM_BINS {
        cnt += bins[i].count;
        if bins[i].count > 0 {
            acc.include(bins[i].bounds());
        }
        left_bounds[i] = acc;
        left_count[i] = cnt;
    }

    let mut right_bounds = [Aabb::empty(); NUM_BINS];
    let mut right_count = [0u32; NUM_BINS];
    acc = Aabb::empty();
    cnt = 0;
    for i in (0..NUM_BINS).rev() {
        cnt += bins[i].count;
        if bins[i].count > 0 {
            acc.include(bins[i].bounds());
        }
        right_bounds[i] = acc;
        right_count[i] = cnt;
    }

    let mut best = None;
    for i in 0..NUM_BINS - 1 {
        if left_count[i] == 0 || right_count[i + 1] == 0 {
            continue;
        }
        let cost = settings.traversal_cost
            + (left_bounds[i].area() * left_count[i] as f32
                + right_bounds[i + 1].area() * right_count[i + 1] as f32)
                / parent_area;
        if best.map_or(true, |(c, _, _)| cost < c) {
            let overlap = Aabb::new(
                left_bounds[i].min.max(right_bounds[i + 1].min),
                left_bounds[i].max.min(right_bounds[i + 1].max),
            );
            best = Some((cost, i, overlap));
        }
    }
    best
}

fn clip_bounds(b: Aabb, axis: usize, lo: f32, hi: f32) -> Aabb {
    let mut out = b;
    out.min[axis] = out.min[axis].max(lo);
    out.max[axis] = out.max[axis].min(hi);
    out
}

/// Bin references spatially: a straddling reference contributes a clipped
/// box to every bin it crosses; entry/exit counts track reference counts.
fn spatial_sweep(
    refs: &[PrimRef],
    bounds: Aabb,
    axis: usize,
    settings: &BvhSettings,
    parent_area: f32,
) -> Option<(f32, usize)> {
    let extent = bounds.extent()[axis];
    if extent < DEGENERATE_EPS {
        return None;
    }
    let base = bounds.min[axis];
    let scale = NUM_BINS as f32 / extent;
    let bin_width = extent / NUM_BINS as f32;

    let mut bins = [Bin::default(); NUM_BINS];
    for r in refs {
        let b0 = (((r.bounds.min[axis] - base) * scale) as usize).min(NUM_BINS - 1);
        let b1 = (((r.bounds.max[axis] - base) * scale) as usize).min(NUM_BINS - 1);
        bins[b0].enter += 1;
        bins[b1].exit += 1;
        for bi in b0..=b1 {
            let lo = base + bi as f32 * bin_width;
            let hi = lo + bin_width;
            bins[bi].include(clip_bounds(r.bounds, axis, lo, hi));
        }
    }

    let mut left_bounds = [Aabb::empty(); NUM_BINS];
    let mut left_count = [0u32; NUM_BINS];
    let mut acc = Aabb::empty();
    let mut cnt = 0;
    for i in 0..NUM_BINS {
        cnt += bins[i].enter;
        if bins[i].bounds.is_some() {
            acc.include(bins[i].bounds());
        }
        left_bounds[i] = acc;
        left_count[i] = cnt;
    }

    let mut right_bounds = [Aabb::empty(); NUM_BINS];
    let mut right_count = [0u32; NUM_BINS];
    acc = Aabb::empty();
    cnt = 0;
    for i in (0..NUM_BINS).rev() {
        cnt += bins[i].exit;
        if bins[i].bounds.is_some() {
            acc.include(bins[i].bounds());
        }
        right_bounds[i] = acc;
        right_count[i] = cnt;
    }

    let mut best = None;
    for i in 0..NUM_BINS - 1 {
        if left_count[i] == 0 || right_count[i + 1] == 0 {
            continue;
        }
        let cost = settings.traversal_cost
            + (left_bounds[i].area() * left_count[i] as f32
                + right_bounds[i + 1].area() * right_count[i + 1] as f32)
                / parent_area;
        if best.map_or(true, |(c, _)| cost < c) {
            best = Some((cost, i));
        }
    }
    best
}

/// Partition for a spatial split at the upper edge of `split_bin`;
/// straddling references are duplicated with clipped bounds.
fn spatial_partition(
    refs: &mut Vec<PrimRef>,
    bounds: Aabb,
    axis: usize,
    split_bin: usize,
) -> (Vec<PrimRef>, Vec<PrimRef>) {
    let extent = bounds.extent()[axis];
    let plane = bounds.min[axis] + extent * (split_bin + 1) as f32 / NUM_BINS as f32;

    let mut left = Vec::new();
    let mut right = Vec::new();
    for r in refs.drain(..) {
        if r.bounds.max[axis] <= plane {
            left.push(r);
        } else if r.bounds.min[axis] >= plane {
            right.push(r);
        } else {
            left.push(PrimRef {
                index: r.index,
                bounds: clip_bounds(r.bounds, axis, f32::NEG_INFINITY, plane),
            });
            right.push(PrimRef {
                index: r.index,
                bounds: clip_bounds(r.bounds, axis, plane, f32::INFINITY),
            });
        }
    }
    (left, right)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::unpack_wide_leaf;
    use crate::bvh::{convert_wide, LEAF_BIT};

    fn grid_boxes(n: usize) -> Vec<Aabb> {
        let mut out = Vec::new();
        for i in 0..n {
            let base = Vec3::new(
                (i % 7) as f32 * 2.0,
                ((i / 7) % 5) as f32 * 3.0,
                (i / 35) as f32 * 1.5,
            );
            out.push(Aabb::new(base, base + Vec3::new(1.0, 0.8, 0.6)));
        }
        out
    }

    fn check_node(nodes: &[BvhNode], idx: usize) {
        let n = &nodes[idx];
        if n.is_leaf() {
            assert!(n.prim_count() > 0);
            return;
        }
        for child in [n.left_child, n.right_child] {
            assert!((child as usize) < nodes.len());
            let c = &nodes[child as usize];
            assert!(
                n.bounds().contains(&c.bounds()),
                "parent must cover child bounds"
            );
            check_node(nodes, child as usize);
        }
    }

    #[test]
    fn covers_geometry_recursively() {
        let prims = grid_boxes(120);
        let built = build(&prims, &BvhSettings::default());
        let root = built.nodes[0].bounds();
        for p in &prims {
            assert!(root.contains(p));
        }
        check_node(&built.nodes, 0);
    }

    #[test]
    fn object_split_partitions_primitives_exactly_once() {
        let prims = grid_boxes(97);
        let built = build(&prims, &BvhSettings::default());
        let mut seen = vec![0u32; prims.len()];
        for n in &built.nodes {
            if n.is_leaf() {
                let start = n.prim_index() as usize;
                for k in 0..n.prim_count() as usize {
                    seen[built.prim_indices[start + k] as usize] += 1;
                }
            }
        }
        assert!(seen.iter().all(|&c| c == 1));
    }

    #[test]
    fn fast_build_matches_partition_property() {
        let prims = grid_boxes(64);
        let built = build(
            &prims,
            &BvhSettings {
                use_fast_build: true,
                ..Default::default()
            },
        );
        let total: u32 = built
            .nodes
            .iter()
            .filter(|n| n.is_leaf())
            .map(|n| n.prim_count())
            .sum();
        assert_eq!(total as usize, prims.len());
    }

    #[test]
    fn coincident_input_becomes_single_leaf() {
        let b = Aabb::new(Vec3::splat(1.0), Vec3::splat(1.0));
        let prims = vec![b; 3];
        let built = build(&prims, &BvhSettings::default());
        assert_eq!(built.nodes.len(), 1);
        assert!(built.nodes[0].is_leaf());
        assert_eq!(built.nodes[0].prim_count(), 3);
        // Degenerate boxes get padded to nonzero extent.
        assert!(built.nodes[0].bounds().area() > 0.0);
    }

    #[test]
    fn spatial_splits_cover_every_primitive() {
        // Long thin boxes crossing the scene force straddling references.
        let mut prims = grid_boxes(40);
        for i in 0..6 {
            let y = i as f32 * 1.3;
            prims.push(Aabb::new(
                Vec3::new(-1.0, y, 0.0),
                Vec3::new(14.0, y + 0.1, 0.4),
            ));
        }
        let built = build(
            &prims,
            &BvhSettings {
                allow_spatial_splits: true,
                ..Default::default()
            },
        );
        let mut seen = vec![0u32; prims.len()];
        for n in &built.nodes {
            if n.is_leaf() {
                let start = n.prim_index() as usize;
                for k in 0..n.prim_count() as usize {
                    seen[built.prim_indices[start + k] as usize] += 1;
                }
            }
        }
        // Duplication is allowed, dropping a primitive is not.
        assert!(seen.iter().all(|&c| c >= 1));
        check_node(&built.nodes, 0);
    }

    #[test]
    fn wide_conversion_preserves_leaves() {
        let prims = grid_boxes(120);
        let built = build(&prims, &BvhSettings::default());
        let wide = convert_wide(&built.nodes);

        let mut binary_leaves: Vec<(u32, u32)> = built
            .nodes
            .iter()
            .filter(|n| n.is_leaf())
            .map(|n| (n.prim_index(), n.prim_count()))
            .collect();
        let mut wide_leaves = Vec::new();
        for n in &wide {
            for c in 0..n.child_count as usize {
                let child = n.child[c];
                if child & LEAF_BIT != 0 {
                    wide_leaves.push(unpack_wide_leaf(child));
                }
            }
        }
        binary_leaves.sort_unstable();
        wide_leaves.sort_unstable();
        assert_eq!(binary_leaves, wide_leaves);

        for n in &wide {
            assert!(n.child_count >= 1 && n.child_count as usize <= crate::bvh::WIDE_WIDTH);
        }
    }
}
