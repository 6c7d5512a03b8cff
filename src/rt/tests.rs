use super::*;
use crate::scene::material::{PrincipledMatDesc, ShadingNodeDesc};
use crate::scene::mesh::{MeshDesc, ShapeDesc, VertexLayout};
use crate::scene::{Scene, SceneSettings};
use glam::Mat4;

fn cube_attrs() -> (Vec<f32>, Vec<u32>) {
    // Axis-aligned unit cube centered at the origin, outward normals.
    let mut attrs = Vec::new();
    let mut indices = Vec::new();
    let faces: [(Vec3, Vec3, Vec3); 6] = [
        (Vec3::Z, Vec3::X, Vec3::Y),
        (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y),
        (Vec3::X, Vec3::NEG_Z, Vec3::Y),
        (Vec3::NEG_X, Vec3::Z, Vec3::Y),
        (Vec3::Y, Vec3::X, Vec3::NEG_Z),
        (Vec3::NEG_Y, Vec3::X, Vec3::Z),
    ];
    for (n, u, v) in faces {
        let base = (attrs.len() / 8) as u32;
        for (su, sv) in [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)] {
            let p = n * 0.5 + u * su + v * sv;
            attrs.extend_from_slice(&[p.x, p.y, p.z, n.x, n.y, n.z, su + 0.5, sv + 0.5]);
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    (attrs, indices)
}

fn build_scene(use_wide: bool, transparent: bool) -> Scene {
    let scene = Scene::new(SceneSettings {
        use_wide_bvh: use_wide,
        ..Default::default()
    });
    let mat = if transparent {
        scene.add_principled_material(&PrincipledMatDesc {
            alpha: 0.0,
            ..Default::default()
        })
    } else {
        scene.add_material(&ShadingNodeDesc::default())
    };
    let (attrs, indices) = cube_attrs();
    let mesh = scene.add_mesh(&MeshDesc {
        name: "cube",
        layout: VertexLayout::PxyzNxyzTuv,
        vtx_attrs: &attrs,
        vtx_indices: &indices,
        base_vertex: 0,
        shapes: &[ShapeDesc {
            vtx_start: 0,
            vtx_count: indices.len(),
            front_mat: mat,
            back_mat: mat,
        }],
        allow_spatial_splits: false,
        use_fast_bvh_build: false,
    });
    scene.add_mesh_instance(mesh, &Mat4::IDENTITY);
    scene.finalize();
    scene
}

#[test]
fn closest_hit_finds_the_front_face() {
    let scene = build_scene(false, false);
    let s = scene.read();
    let hit = intersect_closest(
        &s,
        &Ray {
            orig: Vec3::new(0.0, 0.0, 5.0),
            dir: Vec3::NEG_Z,
        },
        f32::INFINITY,
    )
    .expect("cube in front of the ray");
    assert!((hit.t - 4.5).abs() < 1.0e-4);
    assert!(hit.front_facing);
}

#[test]
fn triangle_centroids_report_their_own_triangle() {
    let scene = build_scene(false, false);
    let s = scene.read();
    let tri_count = s.tris.len();
    for tri in 0..tri_count as u32 {
        let a = &s.tris[tri as usize];
        let centroid = a.v0 + (a.e1 + a.e2) / 3.0;
        let n = a.e1.cross(a.e2).normalize();
        let orig = offset_ray_origin(centroid, n);
        let hit = intersect_closest(
            &s,
            &Ray { orig, dir: -n },
            f32::INFINITY,
        )
        .expect("centroid ray must hit");
        assert_eq!(hit.tri_index, tri, "wrong triangle for centroid {tri}");
        assert!(hit.t < 1.0e-2, "t = {}", hit.t);
    }
}

#[test]
fn wide_and_binary_traversal_agree() {
    let narrow = build_scene(false, false);
    let wide = build_scene(true, false);
    let sn = narrow.read();
    let sw = wide.read();
    for (orig, dir) in [
        (Vec3::new(0.2, 0.1, 3.0), Vec3::NEG_Z),
        (Vec3::new(3.0, 0.3, 0.2), Vec3::NEG_X),
        (Vec3::new(0.45, 3.0, -0.45), Vec3::NEG_Y),
        (Vec3::new(2.0, 2.0, 2.0), Vec3::new(-1.0, -1.0, -1.0).normalize()),
    ] {
        let a = intersect_closest(&sn, &Ray { orig, dir }, f32::INFINITY);
        let b = intersect_closest(&sw, &Ray { orig, dir }, f32::INFINITY);
        match (a, b) {
            (Some(a), Some(b)) => {
                assert!((a.t - b.t).abs() < 1.0e-5);
                assert_eq!(a.tri_index, b.tri_index);
            }
            (None, None) => {}
            other => panic!("traversals disagree: {other:?}"),
        }
    }
}

#[test]
fn instance_transform_moves_the_geometry() {
    let scene = build_scene(false, false);
    {
        let s = scene.read();
        assert!(intersect_closest(
            &s,
            &Ray {
                orig: Vec3::new(5.0, 0.0, 5.0),
                dir: Vec3::NEG_Z,
            },
            f32::INFINITY,
        )
        .is_none());
    }
    // Move the instance under the second ray.
    let handle = crate::scene::mesh::MeshInstanceHandle(0);
    scene.set_mesh_instance_transform(handle, &Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0)));
    let s = scene.read();
    let hit = intersect_closest(
        &s,
        &Ray {
            orig: Vec3::new(5.0, 0.0, 5.0),
            dir: Vec3::NEG_Z,
        },
        f32::INFINITY,
    );
    assert!(hit.is_some());
}

#[test]
fn shadow_rays_respect_the_solid_bit() {
    let opaque = build_scene(false, false);
    let s = opaque.read();
    let blocked = trace_shadow(
        &s,
        &Ray {
            orig: Vec3::new(0.0, 0.0, 5.0),
            dir: Vec3::NEG_Z,
        },
        8.0,
    );
    assert_eq!(blocked, Vec3::ZERO);

    let clear = build_scene(false, true);
    let s = clear.read();
    let passed = trace_shadow(
        &s,
        &Ray {
            orig: Vec3::new(0.0, 0.0, 5.0),
            dir: Vec3::NEG_Z,
        },
        8.0,
    );
    assert!((passed - Vec3::ONE).length() < 1.0e-5);
}

#[test]
fn shadow_ray_stops_at_t_max() {
    let scene = build_scene(false, false);
    let s = scene.read();
    // Occluder sits past t_max: unshadowed.
    let passed = trace_shadow(
        &s,
        &Ray {
            orig: Vec3::new(0.0, 0.0, 5.0),
            dir: Vec3::NEG_Z,
        },
        4.0,
    );
    assert_eq!(passed, Vec3::ONE);
}
