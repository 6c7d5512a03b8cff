//! Material records: tagged shading nodes, packed parameter fields, and
//! the composite tree built for principled descriptors.

use crate::storage::SparseStorage;
use crate::tex::TextureHandle;
use glam::Vec3;

/// Shading node kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShadingNode {
    Diffuse,
    Glossy,
    Refractive,
    Emissive,
    Mix,
    Transparent,
    Principled,
}

/// Opaque 32-bit material handle (dense index over a stable-ID store).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MaterialHandle(pub u32);

impl MaterialHandle {
    /// Sentinel returned on validation failure.
    pub const INVALID: Self = Self(u32::MAX);

    /// Whether this handle refers to a material.
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Emissive nodes flagged this way get light-table entries for NEE.
pub const MAT_FLAG_MULT_IMPORTANCE: u32 = 1 << 0;
/// Mix blends additively (used for the emission wrapper).
pub const MAT_FLAG_MIX_ADD: u32 = 1 << 1;

/// Texture slots of a material.
pub const BASE_TEXTURE: usize = 0;
pub const ROUGH_TEXTURE: usize = 1;
pub const METALLIC_TEXTURE: usize = 2;
pub const NORMALS_TEXTURE: usize = 3;
pub const SPECULAR_TEXTURE: usize = 4;
pub const MIX_MAT1: usize = 5;
pub const MIX_MAT2: usize = 6;
/// Slot count.
pub const NUM_MAT_TEXTURES: usize = 7;

/// Quantize `[0, 1]` to unorm16.
pub fn pack_unorm_16(x: f32) -> u16 {
    (x.clamp(0.0, 1.0) * 65535.0 + 0.5) as u16
}

/// Dequantize unorm16 back to `[0, 1]`.
pub fn unpack_unorm_16(x: u16) -> f32 {
    x as f32 / 65535.0
}

/// One stored shading node. `Mix` nodes alias the `MIX_MAT1`/`MIX_MAT2`
/// texture slots as child material indices, so the tree is a flat array
/// with child indices and no owning pointers.
#[derive(Debug, Clone)]
pub struct Material {
    pub kind: ShadingNode,
    pub base_color: Vec3,
    pub textures: [u32; NUM_MAT_TEXTURES],
    pub flags: u32,
    pub roughness_unorm: u16,
    pub metallic_unorm: u16,
    pub transmission_unorm: u16,
    pub transmission_roughness_unorm: u16,
    pub sheen_unorm: u16,
    pub sheen_tint_unorm: u16,
    pub tint_unorm: u16,
    pub specular_unorm: u16,
    pub specular_tint_unorm: u16,
    pub clearcoat_unorm: u16,
    pub clearcoat_roughness_unorm: u16,
    pub anisotropic_unorm: u16,
    pub normal_map_strength_unorm: u16,
    pub ior: f32,
    pub strength: f32,
    pub tangent_rotation: f32,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            kind: ShadingNode::Diffuse,
            base_color: Vec3::ZERO,
            textures: [TextureHandle::INVALID.0; NUM_MAT_TEXTURES],
            flags: 0,
            roughness_unorm: 0,
            metallic_unorm: 0,
            transmission_unorm: 0,
            transmission_roughness_unorm: 0,
            sheen_unorm: 0,
            sheen_tint_unorm: 0,
            tint_unorm: 0,
            specular_unorm: 0,
            specular_tint_unorm: 0,
            clearcoat_unorm: 0,
            clearcoat_roughness_unorm: 0,
            anisotropic_unorm: 0,
            normal_map_strength_unorm: pack_unorm_16(1.0),
            ior: 1.0,
            strength: 1.0,
            tangent_rotation: 0.0,
        }
    }
}

/// Descriptor of a single shading node.
#[derive(Debug, Clone)]
pub struct ShadingNodeDesc {
    pub kind: ShadingNode,
    pub base_color: Vec3,
    pub base_texture: TextureHandle,
    pub roughness: f32,
    pub roughness_texture: TextureHandle,
    pub metallic_texture: TextureHandle,
    pub normal_map: TextureHandle,
    pub normal_map_intensity: f32,
    pub ior: f32,
    pub sheen: f32,
    pub tint: f32,
    pub anisotropic_rotation: f32,
    pub strength: f32,
    pub multiple_importance: bool,
    pub mix_materials: [MaterialHandle; 2],
    pub mix_add: bool,
}

impl Default for ShadingNodeDesc {
    fn default() -> Self {
        Self {
            kind: ShadingNode::Diffuse,
            base_color: Vec3::splat(0.5),
            base_texture: TextureHandle::INVALID,
            roughness: 0.5,
            roughness_texture: TextureHandle::INVALID,
            metallic_texture: TextureHandle::INVALID,
            normal_map: TextureHandle::INVALID,
            normal_map_intensity: 1.0,
            ior: 1.45,
            sheen: 0.0,
            tint: 0.0,
            anisotropic_rotation: 0.0,
            strength: 1.0,
            multiple_importance: false,
            mix_materials: [MaterialHandle::INVALID; 2],
            mix_add: false,
        }
    }
}

/// Descriptor of a principled material.
#[derive(Debug, Clone)]
pub struct PrincipledMatDesc {
    pub base_color: Vec3,
    pub base_texture: TextureHandle,
    pub metallic: f32,
    pub metallic_texture: TextureHandle,
    pub roughness: f32,
    pub roughness_texture: TextureHandle,
    pub specular: f32,
    pub specular_texture: TextureHandle,
    pub specular_tint: f32,
    pub sheen: f32,
    pub sheen_tint: f32,
    pub clearcoat: f32,
    pub clearcoat_roughness: f32,
    pub transmission: f32,
    pub transmission_roughness: f32,
    pub anisotropic: f32,
    pub anisotropic_rotation: f32,
    pub ior: f32,
    pub normal_map: TextureHandle,
    pub normal_map_intensity: f32,
    pub emission_color: Vec3,
    pub emission_texture: TextureHandle,
    pub emission_strength: f32,
    pub alpha: f32,
    pub alpha_texture: TextureHandle,
}

impl Default for PrincipledMatDesc {
    fn default() -> Self {
        Self {
            base_color: Vec3::splat(0.5),
            base_texture: TextureHandle::INVALID,
            metallic: 0.0,
            metallic_texture: TextureHandle::INVALID,
            roughness: 0.5,
            roughness_texture: TextureHandle::INVALID,
            specular: 0.5,
            specular_texture: TextureHandle::INVALID,
            specular_tint: 0.0,
            sheen: 0.0,
            sheen_tint: 0.5,
            clearcoat: 0.0,
            clearcoat_roughness: 0.0,
            transmission: 0.0,
            transmission_roughness: 0.0,
            anisotropic: 0.0,
            anisotropic_rotation: 0.0,
            ior: 1.45,
            normal_map: TextureHandle::INVALID,
            normal_map_intensity: 1.0,
            emission_color: Vec3::ZERO,
            emission_texture: TextureHandle::INVALID,
            emission_strength: 0.0,
            alpha: 1.0,
            alpha_texture: TextureHandle::INVALID,
        }
    }
}

/// Store a single shading node.
pub(crate) fn add_shading_node(
    materials: &mut SparseStorage<Material>,
    m: &ShadingNodeDesc,
) -> MaterialHandle {
    let mut mat = Material {
        kind: m.kind,
        base_color: m.base_color,
        roughness_unorm: pack_unorm_16(m.roughness),
        ior: m.ior,
        ..Default::default()
    };
    mat.textures[BASE_TEXTURE] = m.base_texture.0;
    mat.textures[ROUGH_TEXTURE] = m.roughness_texture.0;

    match m.kind {
        ShadingNode::Diffuse => {
            mat.sheen_unorm = pack_unorm_16((0.5 * m.sheen).clamp(0.0, 1.0));
            mat.sheen_tint_unorm = pack_unorm_16(m.tint);
            mat.textures[METALLIC_TEXTURE] = m.metallic_texture.0;
        }
        ShadingNode::Glossy => {
            mat.tangent_rotation = 2.0 * std::f32::consts::PI * m.anisotropic_rotation;
            mat.textures[METALLIC_TEXTURE] = m.metallic_texture.0;
            mat.tint_unorm = pack_unorm_16(m.tint);
        }
        ShadingNode::Emissive => {
            mat.strength = m.strength;
            if m.multiple_importance {
                mat.flags |= MAT_FLAG_MULT_IMPORTANCE;
            }
        }
        ShadingNode::Mix => {
            mat.strength = m.strength;
            mat.textures[MIX_MAT1] = m.mix_materials[0].0;
            mat.textures[MIX_MAT2] = m.mix_materials[1].0;
            if m.mix_add {
                mat.flags |= MAT_FLAG_MIX_ADD;
            }
        }
        ShadingNode::Refractive | ShadingNode::Transparent | ShadingNode::Principled => {}
    }

    mat.textures[NORMALS_TEXTURE] = m.normal_map.0;
    mat.normal_map_strength_unorm = pack_unorm_16(m.normal_map_intensity);

    MaterialHandle(materials.push(mat))
}

/// Store a principled material tree and return the root handle.
///
/// The composition wraps the principled node with an additive Mix for
/// emission and a plain Mix against a Transparent node for alpha; a fully
/// transparent descriptor collapses to the Transparent node.
pub(crate) fn add_principled(
    materials: &mut SparseStorage<Material>,
    m: &PrincipledMatDesc,
) -> MaterialHandle {
    let mut main = Material {
        kind: ShadingNode::Principled,
        base_color: m.base_color,
        roughness_unorm: pack_unorm_16(m.roughness),
        metallic_unorm: pack_unorm_16(m.metallic),
        transmission_unorm: pack_unorm_16(m.transmission),
        transmission_roughness_unorm: pack_unorm_16(m.transmission_roughness),
        sheen_unorm: pack_unorm_16((0.5 * m.sheen).clamp(0.0, 1.0)),
        sheen_tint_unorm: pack_unorm_16(m.sheen_tint),
        specular_unorm: pack_unorm_16(m.specular),
        specular_tint_unorm: pack_unorm_16(m.specular_tint),
        clearcoat_unorm: pack_unorm_16(m.clearcoat),
        clearcoat_roughness_unorm: pack_unorm_16(m.clearcoat_roughness),
        anisotropic_unorm: pack_unorm_16(m.anisotropic),
        normal_map_strength_unorm: pack_unorm_16(m.normal_map_intensity),
        ior: m.ior,
        tangent_rotation: 2.0 * std::f32::consts::PI * m.anisotropic_rotation.clamp(0.0, 1.0),
        ..Default::default()
    };
    main.textures[BASE_TEXTURE] = m.base_texture.0;
    main.textures[ROUGH_TEXTURE] = m.roughness_texture.0;
    main.textures[METALLIC_TEXTURE] = m.metallic_texture.0;
    main.textures[SPECULAR_TEXTURE] = m.specular_texture.0;
    main.textures[NORMALS_TEXTURE] = m.normal_map.0;

    let mut root = MaterialHandle(materials.push(main));

    if m.emission_strength > 0.0 && m.emission_color.max_element() > 0.0 {
        let emissive = add_shading_node(
            materials,
            &ShadingNodeDesc {
                kind: ShadingNode::Emissive,
                base_color: m.emission_color,
                base_texture: m.emission_texture,
                strength: m.emission_strength,
                multiple_importance: true,
                ..Default::default()
            },
        );
        root = add_shading_node(
            materials,
            &ShadingNodeDesc {
                kind: ShadingNode::Mix,
                base_texture: TextureHandle::INVALID,
                strength: 0.5,
                ior: 0.0,
                mix_add: true,
                mix_materials: [root, emissive],
                ..Default::default()
            },
        );
    }

    if m.alpha != 1.0 || m.alpha_texture.is_valid() {
        let transparent = add_shading_node(
            materials,
            &ShadingNodeDesc {
                kind: ShadingNode::Transparent,
                base_color: Vec3::ONE,
                ..Default::default()
            },
        );
        if m.alpha == 0.0 && !m.alpha_texture.is_valid() {
            root = transparent;
        } else {
            root = add_shading_node(
                materials,
                &ShadingNodeDesc {
                    kind: ShadingNode::Mix,
                    base_texture: m.alpha_texture,
                    strength: m.alpha,
                    ior: 0.0,
                    mix_materials: [transparent, root],
                    ..Default::default()
                },
            );
        }
    }

    root
}

/// Walk a material tree; `true` when any leaf is `Transparent`. The walk
/// drives the per-triangle SOLID_BIT so the intersector can skip alpha
/// evaluation on fully solid surfaces.
pub(crate) fn tree_has_transparency(
    materials: &SparseStorage<Material>,
    root: MaterialHandle,
) -> bool {
    let mut stack = vec![root.0];
    while let Some(index) = stack.pop() {
        let Some(mat) = materials.get(index) else {
            continue;
        };
        match mat.kind {
            ShadingNode::Transparent => return true,
            ShadingNode::Mix => {
                stack.push(mat.textures[MIX_MAT1]);
                stack.push(mat.textures[MIX_MAT2]);
            }
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unorm_packing_roundtrip() {
        for x in [0.0, 0.25, 0.5, 1.0] {
            assert!((unpack_unorm_16(pack_unorm_16(x)) - x).abs() < 1.0e-4);
        }
        assert_eq!(pack_unorm_16(-1.0), 0);
        assert_eq!(pack_unorm_16(2.0), 65535);
    }

    #[test]
    fn principled_with_emission_and_alpha_builds_tree() {
        let mut materials = SparseStorage::default();
        let root = add_principled(
            &mut materials,
            &PrincipledMatDesc {
                emission_color: Vec3::ONE,
                emission_strength: 2.0,
                alpha: 0.5,
                ..Default::default()
            },
        );
        // Root is the alpha mix of (transparent, emission mix).
        let root_mat = materials.get(root.0).unwrap();
        assert_eq!(root_mat.kind, ShadingNode::Mix);
        assert_eq!(root_mat.flags & MAT_FLAG_MIX_ADD, 0);

        let inner = materials.get(root_mat.textures[MIX_MAT2]).unwrap();
        assert_eq!(inner.kind, ShadingNode::Mix);
        assert_ne!(inner.flags & MAT_FLAG_MIX_ADD, 0);

        assert!(tree_has_transparency(&materials, root));
        // 5 nodes total: principled, emissive, add-mix, transparent, alpha-mix.
        assert_eq!(materials.len(), 5);
    }

    #[test]
    fn zero_alpha_collapses_to_transparent() {
        let mut materials = SparseStorage::default();
        let root = add_principled(
            &mut materials,
            &PrincipledMatDesc {
                alpha: 0.0,
                ..Default::default()
            },
        );
        assert_eq!(materials.get(root.0).unwrap().kind, ShadingNode::Transparent);
    }

    #[test]
    fn opaque_tree_reports_no_transparency() {
        let mut materials = SparseStorage::default();
        let root = add_principled(&mut materials, &PrincipledMatDesc::default());
        assert_eq!(materials.len(), 1);
        assert!(!tree_has_transparency(&materials, root));
    }
}
