//! Collapse a binary BVH into 8-wide SoA nodes.

use super::{pack_wide_leaf, BvhNode};

/// Children per wide node.
pub const WIDE_WIDTH: usize = 8;

/// Wide BVH node with child bounds stored as structure-of-arrays so a
/// traversal step can test all slabs in parallel. Leaf children keep the
/// binary encoding (`LEAF_BIT` + packed start/count); interior children
/// index the wide-node array.
#[derive(Debug, Clone)]
pub struct WideBvhNode {
    /// Per-axis child minima, `bbox_min[axis][lane]`.
    pub bbox_min: [[f32; WIDE_WIDTH]; 3],
    /// Per-axis child maxima, `bbox_max[axis][lane]`.
    pub bbox_max: [[f32; WIDE_WIDTH]; 3],
    /// Child references; unused lanes hold `u32::MAX`.
    pub child: [u32; WIDE_WIDTH],
    /// Number of populated lanes.
    pub child_count: u32,
}

impl WideBvhNode {
    fn empty() -> Self {
        Self {
            bbox_min: [[f32::INFINITY; WIDE_WIDTH]; 3],
            bbox_max: [[f32::NEG_INFINITY; WIDE_WIDTH]; 3],
            child: [u32::MAX; WIDE_WIDTH],
            child_count: 0,
        }
    }

    fn set_lane(&mut self, lane: usize, src: &BvhNode, child: u32) {
        for axis in 0..3 {
            self.bbox_min[axis][lane] = src.bbox_min[axis];
            self.bbox_max[axis][lane] = src.bbox_max[axis];
        }
        self.child[lane] = child;
    }
}

/// Convert a flat binary BVH (rooted at index 0) into wide nodes.
pub fn convert_wide(nodes: &[BvhNode]) -> Vec<WideBvhNode> {
    let mut out = Vec::new();
    if nodes.is_empty() {
        return out;
    }
    if nodes[0].is_leaf() {
        let mut n = WideBvhNode::empty();
        n.set_lane(0, &nodes[0], pack_wide_leaf(nodes[0].prim_index(), nodes[0].prim_count()));
        n.child_count = 1;
        out.push(n);
        return out;
    }
    emit_wide(nodes, 0, &mut out);
    out
}

fn emit_wide(nodes: &[BvhNode], root: u32, out: &mut Vec<WideBvhNode>) -> u32 {
    let node = &nodes[root as usize];
    let mut children = vec![node.left_child, node.right_child];

    // Grow the child list by expanding the largest interior child until
    // the node is full or only leaves remain.
    while children.len() < WIDE_WIDTH {
        let mut grow = None;
        let mut grow_area = f32::NEG_INFINITY;
        for (i, &c) in children.iter().enumerate() {
            let n = &nodes[c as usize];
            if !n.is_leaf() {
                let area = n.bounds().area();
                if area > grow_area {
                    grow_area = area;
                    grow = Some(i);
                }
            }
        }
        let Some(i) = grow else { break };
        let expanded = children.swap_remove(i);
        children.push(nodes[expanded as usize].left_child);
        children.push(nodes[expanded as usize].right_child);
    }

    let index = out.len() as u32;
    out.push(WideBvhNode::empty());

    let mut wide = WideBvhNode::empty();
    wide.child_count = children.len() as u32;
    for (lane, &c) in children.iter().enumerate() {
        let n = &nodes[c as usize];
        let child_ref = if n.is_leaf() {
            pack_wide_leaf(n.prim_index(), n.prim_count())
        } else {
            emit_wide(nodes, c, out)
        };
        wide.set_lane(lane, n, child_ref);
    }
    out[index as usize] = wide;
    index
}
