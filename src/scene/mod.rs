//! The scene manager: owns all entities, serializes writers behind a
//! shared-exclusive lock, and rebuilds derived structures on `finalize`.

pub mod env;
pub mod material;
pub mod mesh;
pub mod retire;

#[cfg(test)]
mod tests;

use parking_lot::{RwLock, RwLockReadGuard};

use crate::bvh::{convert_wide, BvhNode, WideBvhNode, LEAF_BIT};
use crate::camera::{Camera, CameraDesc, CameraHandle};
use crate::lights::{
    DirectionalLightDesc, DiskLightDesc, Light, LightHandle, LightKind, LightTable, LineLightDesc,
    RectLightDesc, SphereLightDesc, SpotLightDesc,
};
use crate::math::Aabb;
use crate::storage::SparseStorage;
use crate::tex::{TextureDesc, TextureHandle, TextureStorage};
use env::{EnvQTree, Environment, PHYSICAL_SKY_TEXTURE, SKY_ENV_RES};
use glam::{Mat4, Vec3};
use material::{
    Material, MaterialHandle, PrincipledMatDesc, ShadingNode, ShadingNodeDesc,
    MAT_FLAG_MULT_IMPORTANCE,
};
use mesh::{
    preprocess_mesh, Mesh, MeshDesc, MeshHandle, MeshInstance, MeshInstanceHandle, Transform,
    TriAccel, TriMaterial, MATERIAL_INDEX_BITS, MATERIAL_SOLID_BIT,
};
use retire::RetireQueue;

/// Scene-level configuration handed down from the renderer settings.
#[derive(Debug, Copy, Clone, Default)]
pub struct SceneSettings {
    pub use_wide_bvh: bool,
    pub use_bindless: bool,
    pub use_tex_compression: bool,
}

/// The mutable, concurrently-readable world.
///
/// All mutators take the exclusive side of the lock; `environment` and
/// the renderer's per-frame snapshot take the shared side. Edits made
/// while a frame is in flight are observed at the next `finalize`.
pub struct Scene {
    inner: RwLock<SceneInner>,
}

pub(crate) struct SceneInner {
    pub settings: SceneSettings,

    pub nodes: Vec<BvhNode>,
    pub wide_nodes: Vec<WideBvhNode>,
    pub tris: Vec<TriAccel>,
    pub tri_indices: Vec<u32>,
    pub tri_materials: Vec<TriMaterial>,
    pub transforms: SparseStorage<Transform>,
    pub meshes: SparseStorage<Mesh>,
    pub mesh_instances: SparseStorage<MeshInstance>,
    pub mi_indices: Vec<u32>,
    pub vertices: Vec<mesh::Vertex>,
    pub vtx_indices: Vec<u32>,

    pub materials: SparseStorage<Material>,
    pub textures: TextureStorage,
    pub lights: LightTable,

    pub env: Environment,
    pub env_map_light: LightHandle,
    pub physical_sky_texture: TextureHandle,
    pub qtree: EnvQTree,

    pub macro_nodes_start: u32,
    pub macro_nodes_count: u32,
    pub wide_macro_start: u32,
    pub wide_macro_count: u32,

    pub cameras: SparseStorage<Camera>,
    pub current_camera: CameraHandle,

    tombstoned_instances: Vec<u32>,
    tombstoned_meshes: Vec<u32>,
    pub retire: RetireQueue,
    pub frame_index: u64,
}

impl Scene {
    /// Create an empty scene.
    pub fn new(settings: SceneSettings) -> Self {
        Self {
            inner: RwLock::new(SceneInner {
                settings,
                nodes: Vec::new(),
                wide_nodes: Vec::new(),
                tris: Vec::new(),
                tri_indices: Vec::new(),
                tri_materials: Vec::new(),
                transforms: SparseStorage::default(),
                meshes: SparseStorage::default(),
                mesh_instances: SparseStorage::default(),
                mi_indices: Vec::new(),
                vertices: Vec::new(),
                vtx_indices: Vec::new(),
                materials: SparseStorage::default(),
                textures: TextureStorage::new(settings.use_bindless, settings.use_tex_compression),
                lights: LightTable::default(),
                env: Environment::default(),
                env_map_light: LightHandle::INVALID,
                physical_sky_texture: TextureHandle::INVALID,
                qtree: EnvQTree::default(),
                macro_nodes_start: u32::MAX,
                macro_nodes_count: 0,
                wide_macro_start: u32::MAX,
                wide_macro_count: 0,
                cameras: SparseStorage::default(),
                current_camera: CameraHandle::INVALID,
                tombstoned_instances: Vec::new(),
                tombstoned_meshes: Vec::new(),
                retire: RetireQueue::default(),
                frame_index: 0,
            }),
        }
    }

    /// Shared snapshot for the render path.
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, SceneInner> {
        self.inner.read()
    }

    /// Add a texture in the active storage mode.
    pub fn add_texture(&self, desc: &TextureDesc) -> TextureHandle {
        self.inner.write().textures.add(desc)
    }

    /// Remove a texture; backing storage is retired after the in-flight
    /// horizon.
    pub fn remove_texture(&self, handle: TextureHandle) {
        let mut s = self.inner.write();
        let frame = s.frame_index;
        if let Some(payload) = s.textures.remove(handle) {
            s.retire.defer(frame, Box::new(move || drop(payload)));
        }
    }

    /// Add a single shading node.
    pub fn add_material(&self, desc: &ShadingNodeDesc) -> MaterialHandle {
        let mut s = self.inner.write();
        if desc.kind == ShadingNode::Mix
            && (!s.materials.exists(desc.mix_materials[0].0)
                || !s.materials.exists(desc.mix_materials[1].0))
        {
            log::warn!("mix material references unknown children");
            return MaterialHandle::INVALID;
        }
        material::add_shading_node(&mut s.materials, desc)
    }

    /// Add a principled material; returns the root of the composed tree.
    pub fn add_principled_material(&self, desc: &PrincipledMatDesc) -> MaterialHandle {
        material::add_principled(&mut self.inner.write().materials, desc)
    }

    /// Remove a material node.
    pub fn remove_material(&self, handle: MaterialHandle) {
        self.inner.write().materials.erase(handle.0);
    }

    /// Add a mesh: preprocess vertices, build the BLAS, and append the
    /// result to the global arrays.
    pub fn add_mesh(&self, desc: &MeshDesc) -> MeshHandle {
        if desc.vtx_indices.len() % 3 != 0 || desc.vtx_indices.is_empty() {
            log::warn!("mesh '{}' has a non-triangle index count", desc.name);
            return MeshHandle::INVALID;
        }
        // Geometry work happens outside the lock.
        let pre = preprocess_mesh(desc);

        let mut s = self.inner.write();

        // Per-triangle materials with the solid hint per side.
        let tri_count = pre.vtx_indices.len() / 3;
        let mut new_tri_materials = vec![TriMaterial::default(); tri_count];
        for sh in desc.shapes {
            let front_solid = !material::tree_has_transparency(&s.materials, sh.front_mat);
            let back_solid = !material::tree_has_transparency(&s.materials, sh.back_mat);
            debug_assert!(sh.front_mat.0 == u32::MAX || sh.front_mat.0 < (1 << 14));
            debug_assert!(sh.back_mat.0 == u32::MAX || sh.back_mat.0 < (1 << 14));
            for i in (sh.vtx_start..sh.vtx_start + sh.vtx_count).step_by(3) {
                let tm = &mut new_tri_materials[i / 3];
                tm.front_mi = (sh.front_mat.0 as u16) & MATERIAL_INDEX_BITS;
                if front_solid {
                    tm.front_mi |= MATERIAL_SOLID_BIT;
                }
                tm.back_mi = (sh.back_mat.0 as u16) & MATERIAL_INDEX_BITS;
                if back_solid {
                    tm.back_mi |= MATERIAL_SOLID_BIT;
                }
            }
        }

        let node_base = s.nodes.len() as u32;
        let tri_index_base = s.tri_indices.len() as u32;
        let tri_base = s.tris.len() as u32;
        let vert_base = s.vertices.len() as u32;
        let vert_index_base = s.vtx_indices.len() as u32;

        // Wide layout converts from the local tree before offsetting.
        let (wide_node_index, wide_node_count) = if s.settings.use_wide_bvh {
            let base = s.wide_nodes.len() as u32;
            let mut wide = convert_wide(&pre.bvh.nodes);
            offset_wide_nodes(&mut wide, base, tri_index_base);
            let count = wide.len() as u32;
            s.wide_nodes.append(&mut wide);
            (base, count)
        } else {
            (u32::MAX, 0)
        };

        // Offset child and primitive indices into the global arrays.
        let mut new_nodes = pre.bvh.nodes;
        for n in &mut new_nodes {
            if n.is_leaf() {
                n.left_child = (n.prim_index() + tri_index_base) | LEAF_BIT;
            } else {
                n.left_child += node_base;
                n.right_child += node_base;
            }
        }
        let node_count = new_nodes.len() as u32;
        s.nodes.append(&mut new_nodes);
        s.tri_indices
            .extend(pre.bvh.prim_indices.iter().map(|&i| i + tri_base));
        s.tris.extend_from_slice(&pre.tris);
        s.tri_materials.extend_from_slice(&new_tri_materials);
        debug_assert_eq!(s.tri_materials.len(), s.tris.len());

        s.vtx_indices
            .extend(pre.vtx_indices.iter().map(|&i| i + vert_base));
        s.vertices.extend_from_slice(&pre.vertices);

        let m = Mesh {
            bbox: pre.bbox,
            node_index: node_base,
            node_count,
            wide_node_index,
            wide_node_count,
            tris_index: tri_base,
            tris_count: pre.tris.len() as u32,
            vert_index: vert_index_base,
            vert_count: pre.vtx_indices.len() as u32,
        };
        MeshHandle(s.meshes.push(m))
    }

    /// Tombstone a mesh; the record is dropped at the next `finalize`.
    pub fn remove_mesh(&self, handle: MeshHandle) {
        let mut s = self.inner.write();
        if s.meshes.exists(handle.0) {
            s.tombstoned_meshes.push(handle.0);
        }
    }

    /// Instance a mesh with a transform; emissive triangles become
    /// Triangle lights.
    pub fn add_mesh_instance(&self, mesh: MeshHandle, xform: &Mat4) -> MeshInstanceHandle {
        let mut guard = self.inner.write();
        let s = &mut *guard;
        if !s.meshes.exists(mesh.0) {
            log::warn!("add_mesh_instance: unknown mesh handle");
            return MeshInstanceHandle::INVALID;
        }
        let tr_index = s.transforms.push(Transform::default());
        let mi = MeshInstance {
            mesh_index: mesh.0,
            tr_index,
            bbox: Aabb::empty(),
        };
        let mi_index = s.mesh_instances.push(mi);

        // Emissive-triangle discovery for this instance.
        let m = *s.meshes.get(mesh.0).expect("checked above");
        let first_tri = m.vert_index / 3;
        let last_tri = (m.vert_index + m.vert_count) / 3;
        for tri in first_tri..last_tri {
            let tri_mat = s.tri_materials[tri as usize];
            let front_index = (tri_mat.front_mi & MATERIAL_INDEX_BITS) as u32;
            let Some(front) = s.materials.get(front_index) else {
                continue;
            };
            if front.kind == ShadingNode::Emissive && front.flags & MAT_FLAG_MULT_IMPORTANCE != 0 {
                let col = front.base_color * front.strength;
                s.lights.push(Light {
                    kind: LightKind::Triangle {
                        tri_index: tri,
                        xform_index: tr_index,
                    },
                    col,
                    cast_shadow: true,
                    visible: false,
                    sky_portal: false,
                });
            }
        }

        s.set_mesh_instance_transform_nolock(mi_index, xform);
        MeshInstanceHandle(mi_index)
    }

    /// Move an instance; the cached world box and the TLAS refresh.
    pub fn set_mesh_instance_transform(&self, handle: MeshInstanceHandle, xform: &Mat4) {
        let mut s = self.inner.write();
        if s.mesh_instances.exists(handle.0) {
            s.set_mesh_instance_transform_nolock(handle.0, xform);
        }
    }

    /// Tombstone an instance; compaction happens at the next `finalize`.
    pub fn remove_mesh_instance(&self, handle: MeshInstanceHandle) {
        let mut s = self.inner.write();
        if s.mesh_instances.exists(handle.0) {
            s.tombstoned_instances.push(handle.0);
        }
    }

    /// Add a directional (sun) light.
    pub fn add_directional_light(&self, desc: &DirectionalLightDesc) -> LightHandle {
        let angle = desc.angle * std::f32::consts::PI / 360.0;
        let mut col = desc.color;
        if angle != 0.0 {
            let radius = angle.tan();
            col /= std::f32::consts::PI * radius * radius;
        }
        self.inner.write().lights.push(Light {
            kind: LightKind::Directional {
                dir: -desc.direction.normalize(),
                angle,
            },
            col,
            cast_shadow: desc.cast_shadow,
            visible: false,
            sky_portal: false,
        })
    }

    /// Add a sphere light.
    pub fn add_sphere_light(&self, desc: &SphereLightDesc) -> LightHandle {
        self.inner.write().lights.push(Light {
            kind: LightKind::Sphere {
                pos: desc.position,
                radius: desc.radius,
                area: 4.0 * std::f32::consts::PI * desc.radius * desc.radius,
                dir: Vec3::NEG_Y,
                spot: -1.0,
                blend: -1.0,
            },
            col: desc.color,
            cast_shadow: desc.cast_shadow,
            visible: desc.visible,
            sky_portal: false,
        })
    }

    /// Add a spot light (a sphere light with a cone).
    pub fn add_spot_light(&self, desc: &SpotLightDesc) -> LightHandle {
        self.inner.write().lights.push(Light {
            kind: LightKind::Sphere {
                pos: desc.position,
                radius: desc.radius,
                area: 4.0 * std::f32::consts::PI * desc.radius * desc.radius,
                dir: desc.direction.normalize(),
                spot: 0.5 * std::f32::consts::PI * desc.spot_size / 180.0,
                blend: desc.spot_blend * desc.spot_blend,
            },
            col: desc.color,
            cast_shadow: desc.cast_shadow,
            visible: desc.visible,
            sky_portal: false,
        })
    }

    /// Add a rect area light placed by `xform`.
    pub fn add_rect_light(&self, desc: &RectLightDesc, xform: &Mat4) -> LightHandle {
        let u = desc.width * xform.transform_vector3(Vec3::X);
        let v = desc.height * xform.transform_vector3(Vec3::Z);
        self.inner.write().lights.push(Light {
            kind: LightKind::Rect {
                pos: xform.transform_point3(Vec3::ZERO),
                u,
                v,
                area: desc.width * desc.height,
            },
            col: desc.color,
            cast_shadow: desc.cast_shadow,
            visible: desc.visible,
            sky_portal: desc.sky_portal,
        })
    }

    /// Add a disk area light placed by `xform`.
    pub fn add_disk_light(&self, desc: &DiskLightDesc, xform: &Mat4) -> LightHandle {
        let u = desc.size_x * xform.transform_vector3(Vec3::X);
        let v = desc.size_y * xform.transform_vector3(Vec3::Z);
        self.inner.write().lights.push(Light {
            kind: LightKind::Disk {
                pos: xform.transform_point3(Vec3::ZERO),
                u,
                v,
                area: 0.25 * std::f32::consts::PI * desc.size_x * desc.size_y,
            },
            col: desc.color,
            cast_shadow: desc.cast_shadow,
            visible: desc.visible,
            sky_portal: desc.sky_portal,
        })
    }

    /// Add a line (cylinder) light placed by `xform`.
    pub fn add_line_light(&self, desc: &LineLightDesc, xform: &Mat4) -> LightHandle {
        self.inner.write().lights.push(Light {
            kind: LightKind::Line {
                pos: xform.transform_point3(Vec3::ZERO),
                axis: xform.transform_vector3(Vec3::Y).normalize(),
                radius: desc.radius,
                height: desc.height,
                area: 2.0 * std::f32::consts::PI * desc.radius * desc.height,
            },
            col: desc.color,
            cast_shadow: desc.cast_shadow,
            visible: desc.visible,
            sky_portal: desc.sky_portal,
        })
    }

    /// Remove a light.
    pub fn remove_light(&self, handle: LightHandle) {
        self.inner.write().lights.remove(handle);
    }

    /// Replace the environment description.
    pub fn set_environment(&self, env: &Environment) {
        self.inner.write().env = *env;
    }

    /// Read back the environment description.
    pub fn environment(&self) -> Environment {
        self.inner.read().env
    }

    /// Add a camera.
    pub fn add_camera(&self, desc: &CameraDesc) -> CameraHandle {
        let mut s = self.inner.write();
        let handle = CameraHandle(s.cameras.push(Camera::new(desc.clone())));
        if !s.current_camera.is_valid() {
            s.current_camera = handle;
        }
        handle
    }

    /// Select the camera used by subsequent frames.
    pub fn set_current_camera(&self, handle: CameraHandle) {
        let mut s = self.inner.write();
        if s.cameras.exists(handle.0) {
            s.current_camera = handle;
        }
    }

    /// Currently selected camera.
    pub fn current_camera(&self) -> CameraHandle {
        self.inner.read().current_camera
    }

    /// Rebuild every derived structure so edits become visible to the
    /// next frame: bake the sky if requested, refresh the env importance
    /// tree and env light, compact tombstones, generate mips, refresh
    /// the bindless table, and rebuild the TLAS.
    pub fn finalize(&self) {
        let mut s = self.inner.write();

        if s.env_map_light.is_valid() {
            let handle = s.env_map_light;
            s.lights.remove(handle);
            s.env_map_light = LightHandle::INVALID;
        }
        s.qtree = EnvQTree::default();

        if s.env.env_map == PHYSICAL_SKY_TEXTURE
            || (s.physical_sky_texture.is_valid() && s.env.env_map == s.physical_sky_texture)
        {
            s.prepare_sky_env_map_nolock();
        }

        if s.env.multiple_importance && s.env.env_col.min_element() > 0.0 {
            if s.env.env_map.is_valid() {
                s.prepare_env_map_qtree_nolock();
            }
            s.env_map_light = s.lights.push(Light {
                kind: LightKind::Environment,
                col: Vec3::ONE,
                cast_shadow: true,
                visible: false,
                sky_portal: false,
            });
        }

        s.compact_tombstones_nolock();
        s.textures.generate_mips();
        if let Some(table) = s.textures.bindless_table() {
            log::debug!("bindless table refreshed ({} entries)", table.len());
        }
        s.rebuild_tlas_nolock();

        s.frame_index += 1;
        let frame = s.frame_index;
        s.retire.retire_all(frame);
    }

    /// Mark the current frame complete, retiring deferred resources.
    pub fn retire_frame(&self) {
        let mut s = self.inner.write();
        s.frame_index += 1;
        let frame = s.frame_index;
        s.retire.retire_all(frame);
    }
}

impl SceneInner {
    pub(crate) fn set_mesh_instance_transform_nolock(&mut self, mi_index: u32, xform: &Mat4) {
        let tr = Transform::new(*xform);
        let mi = *self.mesh_instances.get(mi_index).expect("live instance");
        let mesh_bbox = self.meshes.get(mi.mesh_index).expect("live mesh").bbox;
        let world = mesh_bbox.transform(xform);

        if let Some(slot) = self.mesh_instances.get_mut(mi_index) {
            slot.bbox = world;
        }
        if let Some(slot) = self.transforms.get_mut(mi.tr_index) {
            *slot = tr;
        }
        self.rebuild_tlas_nolock();
    }

    /// Remove a node range from the global array, shifting the tail down
    /// and patching child indices, mesh slices, and the TLAS handle.
    pub(crate) fn remove_nodes_nolock(&mut self, node_index: u32, node_count: u32) {
        if node_count == 0 || node_index == u32::MAX {
            return;
        }
        let start = node_index as usize;
        let count = node_count as usize;
        self.nodes.drain(start..start + count);

        if start != self.nodes.len() {
            let meshes: Vec<u32> = self.meshes.iter().map(|(i, _)| i).collect();
            for i in meshes {
                if let Some(m) = self.meshes.get_mut(i) {
                    if m.node_index > node_index {
                        m.node_index -= node_count;
                    }
                }
            }
            for n in &mut self.nodes[start..] {
                if !n.is_leaf() {
                    if n.left_child > node_index {
                        n.left_child -= node_count;
                    }
                    if n.right_child > node_index {
                        n.right_child -= node_count;
                    }
                }
            }
            if self.macro_nodes_start != u32::MAX && self.macro_nodes_start > node_index {
                self.macro_nodes_start -= node_count;
            }
        }
    }

    fn remove_wide_nodes_nolock(&mut self, node_index: u32, node_count: u32) {
        if node_count == 0 || node_index == u32::MAX {
            return;
        }
        let start = node_index as usize;
        let count = node_count as usize;
        self.wide_nodes.drain(start..start + count);

        if start != self.wide_nodes.len() {
            let meshes: Vec<u32> = self.meshes.iter().map(|(i, _)| i).collect();
            for i in meshes {
                if let Some(m) = self.meshes.get_mut(i) {
                    if m.wide_node_index != u32::MAX && m.wide_node_index > node_index {
                        m.wide_node_index -= node_count;
                    }
                }
            }
            for n in &mut self.wide_nodes[start..] {
                for c in &mut n.child {
                    if *c != u32::MAX && *c & LEAF_BIT == 0 && *c > node_index {
                        *c -= node_count;
                    }
                }
            }
        }
    }

    /// Rebuild the TLAS over the live instances' world boxes.
    pub(crate) fn rebuild_tlas_nolock(&mut self) {
        let old_start = self.macro_nodes_start;
        let old_count = self.macro_nodes_count;
        self.macro_nodes_start = u32::MAX;
        self.macro_nodes_count = 0;
        self.remove_nodes_nolock(old_start, old_count);

        let old_wide_start = self.wide_macro_start;
        let old_wide_count = self.wide_macro_count;
        self.wide_macro_start = u32::MAX;
        self.wide_macro_count = 0;
        self.remove_wide_nodes_nolock(old_wide_start, old_wide_count);

        self.mi_indices.clear();

        let live: Vec<(u32, Aabb)> = self
            .mesh_instances
            .iter()
            .map(|(i, mi)| (i, mi.bbox))
            .collect();
        if live.is_empty() {
            return;
        }
        let prims: Vec<Aabb> = live.iter().map(|(_, b)| *b).collect();
        let built = crate::bvh::build(&prims, &crate::bvh::BvhSettings::default());

        let node_base = self.nodes.len() as u32;
        self.macro_nodes_start = node_base;
        self.macro_nodes_count = built.nodes.len() as u32;

        let mut tlas_nodes = built.nodes;
        for n in &mut tlas_nodes {
            if !n.is_leaf() {
                n.left_child += node_base;
                n.right_child += node_base;
            }
        }

        if self.settings.use_wide_bvh {
            let wide_base = self.wide_nodes.len() as u32;
            // Convert from the local tree so child indices start at 0.
            let local: Vec<BvhNode> = tlas_nodes
                .iter()
                .map(|n| {
                    let mut n = *n;
                    if !n.is_leaf() {
                        n.left_child -= node_base;
                        n.right_child -= node_base;
                    }
                    n
                })
                .collect();
            let mut wide = convert_wide(&local);
            offset_wide_nodes(&mut wide, wide_base, 0);
            self.wide_macro_start = wide_base;
            self.wide_macro_count = wide.len() as u32;
            self.wide_nodes.append(&mut wide);
        }

        self.nodes.append(&mut tlas_nodes);
        self.mi_indices = built.prim_indices.iter().map(|&p| live[p as usize].0).collect();
    }

    /// Bake the analytic sky against the scene's directional lights and
    /// register it as the environment map.
    pub(crate) fn prepare_sky_env_map_nolock(&mut self) {
        if self.physical_sky_texture.is_valid() {
            if let Some(payload) = self.textures.remove(self.physical_sky_texture) {
                let frame = self.frame_index;
                self.retire.defer(frame, Box::new(move || drop(payload)));
            }
            self.physical_sky_texture = TextureHandle::INVALID;
        }

        let mut suns = Vec::new();
        for (_, l) in self.lights.lights.iter() {
            if let LightKind::Directional { dir, angle } = l.kind {
                suns.push((dir, l.col, angle));
            }
        }
        if suns.is_empty() {
            self.env.env_map = TextureHandle::INVALID;
            if self.env.back_map == PHYSICAL_SKY_TEXTURE {
                self.env.back_map = TextureHandle::INVALID;
            }
            return;
        }

        let pixels = env::bake_physical_sky(&suns);
        let handle = self.textures.add(&TextureDesc {
            name: "physical_sky",
            format: crate::tex::TextureFormat::Rgba8888,
            data: &pixels,
            w: SKY_ENV_RES.0,
            h: SKY_ENV_RES.1,
            is_srgb: false,
            is_normalmap: false,
            generate_mipmaps: false,
            force_no_compression: true,
        });
        self.physical_sky_texture = handle;
        self.env.env_map = handle;
        if self.env.back_map == PHYSICAL_SKY_TEXTURE {
            self.env.back_map = handle;
        }
    }

    /// Build the luminance quad-tree from the env map.
    pub(crate) fn prepare_env_map_qtree_nolock(&mut self) {
        let handle = self.env.env_map;
        let Some((w, h)) = self.textures.dims(handle) else {
            return;
        };
        let textures = &self.textures;
        self.qtree = EnvQTree::build(|x, y| env::fetch_env_rgb(textures, handle, x, y), w, h);
        log::info!("env map qtree res is {}", self.qtree.res);
    }

    /// Erase tombstoned instances and meshes along with their derived
    /// lights and transforms.
    fn compact_tombstones_nolock(&mut self) {
        let instances = std::mem::take(&mut self.tombstoned_instances);
        for mi_index in instances {
            let Some(mi) = self.mesh_instances.erase(mi_index) else {
                continue;
            };
            self.transforms.erase(mi.tr_index);
            let doomed: Vec<u32> = self
                .lights
                .lights
                .iter()
                .filter_map(|(i, l)| match l.kind {
                    LightKind::Triangle { xform_index, .. } if xform_index == mi.tr_index => {
                        Some(i)
                    }
                    _ => None,
                })
                .collect();
            for i in doomed {
                self.lights.remove(LightHandle(i));
            }
        }

        let meshes = std::mem::take(&mut self.tombstoned_meshes);
        for mesh_index in meshes {
            let in_use = self
                .mesh_instances
                .iter()
                .any(|(_, mi)| mi.mesh_index == mesh_index);
            if in_use {
                log::warn!("mesh {mesh_index} still instanced, keeping");
                continue;
            }
            self.meshes.erase(mesh_index);
        }
    }

    /// World-space vertices of a (global) triangle under a transform.
    pub(crate) fn triangle_world_verts(&self, tri_index: u32, tr_index: u32) -> (Vec3, Vec3, Vec3) {
        let base = (tri_index * 3) as usize;
        let v0 = Vec3::from(self.vertices[self.vtx_indices[base] as usize].p);
        let v1 = Vec3::from(self.vertices[self.vtx_indices[base + 1] as usize].p);
        let v2 = Vec3::from(self.vertices[self.vtx_indices[base + 2] as usize].p);
        let xf = self
            .transforms
            .get(tr_index)
            .map(|t| t.xform)
            .unwrap_or(Mat4::IDENTITY);
        (
            xf.transform_point3(v0),
            xf.transform_point3(v1),
            xf.transform_point3(v2),
        )
    }
}

/// Shift wide-node child references after concatenation: interior
/// children move by `node_offset`, leaf primitive starts by `prim_offset`.
fn offset_wide_nodes(nodes: &mut [WideBvhNode], node_offset: u32, prim_offset: u32) {
    for n in nodes {
        for c in &mut n.child {
            if *c == u32::MAX {
                continue;
            }
            if *c & LEAF_BIT != 0 {
                let (prim, count) = crate::bvh::unpack_wide_leaf(*c);
                *c = crate::bvh::pack_wide_leaf(prim + prim_offset, count);
            } else {
                *c += node_offset;
            }
        }
    }
}
