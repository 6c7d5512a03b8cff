use glam::{Mat4, Vec3};

use super::env::{Environment, PHYSICAL_SKY_TEXTURE};
use super::material::{PrincipledMatDesc, ShadingNode, ShadingNodeDesc};
use super::mesh::{MeshDesc, ShapeDesc, VertexLayout, MATERIAL_SOLID_BIT};
use super::*;
use crate::lights::{DirectionalLightDesc, LightKind};
use crate::tex::{TextureDesc, TextureFormat};

fn quad_desc<'a>(
    attrs: &'a [f32],
    indices: &'a [u32],
    shapes: &'a [ShapeDesc],
) -> MeshDesc<'a> {
    MeshDesc {
        name: "quad",
        layout: VertexLayout::PxyzNxyzTuv,
        vtx_attrs: attrs,
        vtx_indices: indices,
        base_vertex: 0,
        shapes,
        allow_spatial_splits: false,
        use_fast_bvh_build: false,
    }
}

fn unit_quad() -> (Vec<f32>, Vec<u32>) {
    let attrs = vec![
        0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, //
        1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, //
        1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 1.0, //
        0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0,
    ];
    (attrs, vec![0, 1, 2, 0, 2, 3])
}

fn default_scene() -> (Scene, MeshHandle) {
    let scene = Scene::new(SceneSettings::default());
    let mat = scene.add_material(&ShadingNodeDesc::default());
    let (attrs, indices) = unit_quad();
    let mesh = scene.add_mesh(&quad_desc(
        &attrs,
        &indices,
        &[ShapeDesc {
            vtx_start: 0,
            vtx_count: 6,
            front_mat: mat,
            back_mat: mat,
        }],
    ));
    (scene, mesh)
}

#[test]
fn instance_world_bbox_matches_transformed_mesh_bbox() {
    let (scene, mesh) = default_scene();
    let xform = Mat4::from_rotation_y(0.7) * Mat4::from_translation(Vec3::new(2.0, -1.0, 3.0));
    let mi = scene.add_mesh_instance(mesh, &xform);
    assert!(mi.is_valid());

    let s = scene.read();
    let instance = s.mesh_instances.get(mi.0).unwrap();
    let expected = s.meshes.get(mesh.0).unwrap().bbox.transform(&xform);
    assert!((instance.bbox.min - expected.min).length() < 1.0e-5);
    assert!((instance.bbox.max - expected.max).length() < 1.0e-5);
}

#[test]
fn tlas_root_covers_all_instances() {
    let (scene, mesh) = default_scene();
    for i in 0..5 {
        scene.add_mesh_instance(
            mesh,
            &Mat4::from_translation(Vec3::new(i as f32 * 3.0, 0.0, -(i as f32))),
        );
    }
    scene.finalize();

    let s = scene.read();
    assert_ne!(s.macro_nodes_start, u32::MAX);
    let root = s.nodes[s.macro_nodes_start as usize].bounds();
    for (_, mi) in s.mesh_instances.iter() {
        assert!(root.contains(&mi.bbox), "TLAS root must cover {mi:?}");
    }
    // Every instance appears in the TLAS index list exactly once.
    let mut seen: Vec<u32> = s.mi_indices.clone();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), s.mesh_instances.len());
}

#[test]
fn emissive_triangle_lights_match_emissive_triangle_count() {
    let scene = Scene::new(SceneSettings::default());
    let glow = scene.add_material(&ShadingNodeDesc {
        kind: ShadingNode::Emissive,
        base_color: Vec3::ONE,
        strength: 4.0,
        multiple_importance: true,
        ..Default::default()
    });
    let plain = scene.add_material(&ShadingNodeDesc::default());
    let (attrs, indices) = unit_quad();
    // One emissive triangle, one plain.
    let mesh = scene.add_mesh(&quad_desc(
        &attrs,
        &indices,
        &[
            ShapeDesc {
                vtx_start: 0,
                vtx_count: 3,
                front_mat: glow,
                back_mat: plain,
            },
            ShapeDesc {
                vtx_start: 3,
                vtx_count: 3,
                front_mat: plain,
                back_mat: plain,
            },
        ],
    ));
    scene.add_mesh_instance(mesh, &Mat4::IDENTITY);
    scene.add_mesh_instance(mesh, &Mat4::from_translation(Vec3::X * 4.0));

    let s = scene.read();
    let tri_lights = s
        .lights
        .lights
        .iter()
        .filter(|(_, l)| matches!(l.kind, LightKind::Triangle { .. }))
        .count();
    // One emissive triangle per instance.
    assert_eq!(tri_lights, 2);
}

#[test]
fn non_multiple_importance_emissive_gets_no_light() {
    let scene = Scene::new(SceneSettings::default());
    let glow = scene.add_material(&ShadingNodeDesc {
        kind: ShadingNode::Emissive,
        base_color: Vec3::ONE,
        strength: 4.0,
        multiple_importance: false,
        ..Default::default()
    });
    let (attrs, indices) = unit_quad();
    let mesh = scene.add_mesh(&quad_desc(
        &attrs,
        &indices,
        &[ShapeDesc {
            vtx_start: 0,
            vtx_count: 6,
            front_mat: glow,
            back_mat: glow,
        }],
    ));
    scene.add_mesh_instance(mesh, &Mat4::IDENTITY);
    assert!(scene.read().lights.is_empty());
}

#[test]
fn transparent_tree_clears_the_solid_bit() {
    let scene = Scene::new(SceneSettings::default());
    let clear = scene.add_principled_material(&PrincipledMatDesc {
        alpha: 0.5,
        ..Default::default()
    });
    let solid = scene.add_material(&ShadingNodeDesc::default());
    let (attrs, indices) = unit_quad();
    scene.add_mesh(&quad_desc(
        &attrs,
        &indices,
        &[ShapeDesc {
            vtx_start: 0,
            vtx_count: 6,
            front_mat: clear,
            back_mat: solid,
        }],
    ));
    let s = scene.read();
    for tm in &s.tri_materials {
        assert_eq!(tm.front_mi & MATERIAL_SOLID_BIT, 0, "front side is not solid");
        assert_ne!(tm.back_mi & MATERIAL_SOLID_BIT, 0, "back side is solid");
    }
}

#[test]
fn environment_roundtrips() {
    let scene = Scene::new(SceneSettings::default());
    let env = Environment {
        env_col: Vec3::new(0.1, 0.2, 0.3),
        env_map_rotation: 1.25,
        back_col: Vec3::splat(0.5),
        back_map_rotation: -0.5,
        multiple_importance: true,
        ..Default::default()
    };
    scene.set_environment(&env);
    assert_eq!(scene.environment(), env);
}

#[test]
fn add_remove_instance_is_idempotent_across_finalize() {
    let (scene, mesh) = default_scene();
    scene.add_mesh_instance(mesh, &Mat4::IDENTITY);
    scene.finalize();

    let (instances, lights, transforms, nodes, mi_count) = {
        let s = scene.read();
        (
            s.mesh_instances.len(),
            s.lights.len(),
            s.transforms.len(),
            s.nodes.len(),
            s.mi_indices.len(),
        )
    };

    let mi = scene.add_mesh_instance(mesh, &Mat4::from_translation(Vec3::Y * 2.0));
    scene.remove_mesh_instance(mi);
    scene.finalize();

    let s = scene.read();
    assert_eq!(s.mesh_instances.len(), instances);
    assert_eq!(s.lights.len(), lights);
    assert_eq!(s.transforms.len(), transforms);
    assert_eq!(s.nodes.len(), nodes);
    assert_eq!(s.mi_indices.len(), mi_count);
}

#[test]
fn removing_an_instance_removes_its_triangle_lights() {
    let scene = Scene::new(SceneSettings::default());
    let glow = scene.add_material(&ShadingNodeDesc {
        kind: ShadingNode::Emissive,
        base_color: Vec3::ONE,
        strength: 2.0,
        multiple_importance: true,
        ..Default::default()
    });
    let (attrs, indices) = unit_quad();
    let mesh = scene.add_mesh(&quad_desc(
        &attrs,
        &indices,
        &[ShapeDesc {
            vtx_start: 0,
            vtx_count: 6,
            front_mat: glow,
            back_mat: glow,
        }],
    ));
    let mi = scene.add_mesh_instance(mesh, &Mat4::IDENTITY);
    assert_eq!(scene.read().lights.len(), 2);

    scene.remove_mesh_instance(mi);
    // Tombstoned until finalize.
    assert_eq!(scene.read().lights.len(), 2);
    scene.finalize();
    assert_eq!(scene.read().lights.len(), 0);
    assert!(scene.read().mesh_instances.is_empty());
}

#[test]
fn meshes_added_after_finalize_keep_the_node_array_consistent() {
    let (scene, mesh_a) = default_scene();
    scene.add_mesh_instance(mesh_a, &Mat4::IDENTITY);
    scene.finalize();

    // The new BLAS lands after the TLAS slice; the next rebuild must
    // remove the old TLAS from the middle and patch indices.
    let mat = scene.add_material(&ShadingNodeDesc::default());
    let (attrs, indices) = unit_quad();
    let mesh_b = scene.add_mesh(&quad_desc(
        &attrs,
        &indices,
        &[ShapeDesc {
            vtx_start: 0,
            vtx_count: 6,
            front_mat: mat,
            back_mat: mat,
        }],
    ));
    scene.add_mesh_instance(mesh_b, &Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0)));
    scene.finalize();

    let s = scene.read();
    let node_count = s.nodes.len() as u32;
    for n in &s.nodes {
        if !n.is_leaf() {
            assert!(n.left_child < node_count);
            assert!(n.right_child < node_count);
            let parent = n.bounds();
            assert!(parent.contains(&s.nodes[n.left_child as usize].bounds()));
            assert!(parent.contains(&s.nodes[n.right_child as usize].bounds()));
        }
    }
    for (_, m) in s.meshes.iter() {
        assert!(m.node_index + m.node_count <= node_count);
    }
    let root = s.nodes[s.macro_nodes_start as usize].bounds();
    for (_, mi) in s.mesh_instances.iter() {
        assert!(root.contains(&mi.bbox));
    }
}

#[test]
fn removed_textures_retire_after_the_frame_horizon() {
    let scene = Scene::new(SceneSettings::default());
    let data = vec![128u8; 8 * 8 * 3];
    let tex = scene.add_texture(&TextureDesc {
        name: "t",
        format: TextureFormat::Rgb888,
        data: &data,
        w: 8,
        h: 8,
        is_srgb: false,
        is_normalmap: false,
        generate_mipmaps: false,
        force_no_compression: false,
    });
    scene.remove_texture(tex);
    assert_eq!(scene.read().retire.len(), 1);
    scene.retire_frame();
    assert_eq!(scene.read().retire.len(), 0);
}

#[test]
fn physical_sky_bakes_into_env_map_and_qtree() {
    let scene = Scene::new(SceneSettings::default());
    scene.add_directional_light(&DirectionalLightDesc {
        direction: Vec3::new(0.2, -1.0, 0.1).normalize(),
        color: Vec3::splat(8.0),
        angle: 2.0,
        cast_shadow: true,
    });
    scene.set_environment(&Environment {
        env_col: Vec3::ONE,
        env_map: PHYSICAL_SKY_TEXTURE,
        multiple_importance: true,
        ..Default::default()
    });
    scene.finalize();

    let s = scene.read();
    assert!(s.physical_sky_texture.is_valid());
    assert_eq!(s.env.env_map, s.physical_sky_texture);
    assert!(s.qtree.levels() >= 1, "qtree must build from the baked sky");
    assert!(s.env_map_light.is_valid());
}

#[test]
fn mix_material_with_unknown_children_is_rejected() {
    let scene = Scene::new(SceneSettings::default());
    let bad = scene.add_material(&ShadingNodeDesc {
        kind: ShadingNode::Mix,
        mix_materials: [MaterialHandle(99), MaterialHandle(100)],
        ..Default::default()
    });
    assert_eq!(bad, MaterialHandle::INVALID);
}
