//! Light table: analytical, triangle, and environment lights with
//! per-kind sampling routines for next-event estimation.

use crate::math::{sample_disk_concentric, Onb};
use crate::storage::SparseStorage;
use glam::{Vec2, Vec3};

/// Opaque 32-bit light handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LightHandle(pub u32);

impl LightHandle {
    /// Sentinel for absent lights.
    pub const INVALID: Self = Self(u32::MAX);

    /// Whether this handle refers to a light.
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Per-kind light geometry. Directions stored point toward the light.
#[derive(Debug, Copy, Clone)]
pub enum LightKind {
    Directional {
        dir: Vec3,
        /// Angular radius in radians; 0 means a true delta light.
        angle: f32,
    },
    /// Spheres double as spot lights when `spot >= 0`.
    Sphere {
        pos: Vec3,
        radius: f32,
        area: f32,
        dir: Vec3,
        spot: f32,
        blend: f32,
    },
    Rect {
        pos: Vec3,
        u: Vec3,
        v: Vec3,
        area: f32,
    },
    Disk {
        pos: Vec3,
        u: Vec3,
        v: Vec3,
        area: f32,
    },
    Line {
        pos: Vec3,
        axis: Vec3,
        radius: f32,
        height: f32,
        area: f32,
    },
    /// Emissive mesh triangle, resolved against scene data at sample time.
    Triangle { tri_index: u32, xform_index: u32 },
    Environment,
}

/// One stored light.
#[derive(Debug, Copy, Clone)]
pub struct Light {
    pub kind: LightKind,
    pub col: Vec3,
    pub cast_shadow: bool,
    pub visible: bool,
    pub sky_portal: bool,
}

/// Directional light descriptor. `angle` is the full angular diameter in
/// degrees; nonzero values turn the sun into a cone of that size.
#[derive(Debug, Clone)]
pub struct DirectionalLightDesc {
    pub direction: Vec3,
    pub color: Vec3,
    pub angle: f32,
    pub cast_shadow: bool,
}

/// Sphere light descriptor.
#[derive(Debug, Clone)]
pub struct SphereLightDesc {
    pub position: Vec3,
    pub radius: f32,
    pub color: Vec3,
    pub visible: bool,
    pub cast_shadow: bool,
}

/// Spot light descriptor; `spot_size` is the cone angle in degrees.
#[derive(Debug, Clone)]
pub struct SpotLightDesc {
    pub position: Vec3,
    pub direction: Vec3,
    pub radius: f32,
    pub spot_size: f32,
    pub spot_blend: f32,
    pub color: Vec3,
    pub visible: bool,
    pub cast_shadow: bool,
}

/// Rect area light descriptor; placed by a transform at add time.
#[derive(Debug, Clone)]
pub struct RectLightDesc {
    pub width: f32,
    pub height: f32,
    pub color: Vec3,
    pub visible: bool,
    pub sky_portal: bool,
    pub cast_shadow: bool,
}

/// Disk area light descriptor.
#[derive(Debug, Clone)]
pub struct DiskLightDesc {
    pub size_x: f32,
    pub size_y: f32,
    pub color: Vec3,
    pub visible: bool,
    pub sky_portal: bool,
    pub cast_shadow: bool,
}

/// Line (cylinder) light descriptor.
#[derive(Debug, Clone)]
pub struct LineLightDesc {
    pub radius: f32,
    pub height: f32,
    pub color: Vec3,
    pub visible: bool,
    pub sky_portal: bool,
    pub cast_shadow: bool,
}

/// A candidate direction toward a light.
#[derive(Debug, Copy, Clone)]
pub struct LightSample {
    /// Unit direction from the shading point toward the light.
    pub dir: Vec3,
    /// Distance to the sampled point (`f32::INFINITY` for delta/env).
    pub dist: f32,
    /// Solid-angle pdf; 0 marks a delta light (no MIS competition).
    pub pdf: f32,
    /// Incident radiance along `dir`, before visibility.
    pub radiance: Vec3,
}

/// The scene's light set plus the sampling CDF over it.
#[derive(Debug, Default)]
pub struct LightTable {
    pub lights: SparseStorage<Light>,
    /// Compacted indices of all sampleable lights.
    pub li_indices: Vec<u32>,
    /// Lights directly visible to camera/BSDF rays.
    pub visible_lights: Vec<u32>,
    /// Sky-portal lights.
    pub blocker_lights: Vec<u32>,
    cdf: Vec<f32>,
}

impl LightTable {
    /// Insert a light and register it in the index lists.
    pub fn push(&mut self, light: Light) -> LightHandle {
        let index = self.lights.push(light);
        self.li_indices.push(index);
        if light.visible {
            self.visible_lights.push(index);
        }
        if light.sky_portal {
            self.blocker_lights.push(index);
        }
        self.rebuild_cdf();
        LightHandle(index)
    }

    /// Remove a light and drop it from the index lists.
    pub fn remove(&mut self, handle: LightHandle) {
        if self.lights.erase(handle.0).is_none() {
            return;
        }
        self.li_indices.retain(|&i| i != handle.0);
        self.visible_lights.retain(|&i| i != handle.0);
        self.blocker_lights.retain(|&i| i != handle.0);
        self.rebuild_cdf();
    }

    /// Number of sampleable lights.
    pub fn len(&self) -> usize {
        self.li_indices.len()
    }

    /// Whether the table has no sampleable lights.
    pub fn is_empty(&self) -> bool {
        self.li_indices.is_empty()
    }

    /// Recompute the discrete CDF; called whenever the table changes.
    pub fn rebuild_cdf(&mut self) {
        self.cdf.clear();
        let mut acc = 0.0;
        for &i in &self.li_indices {
            acc += self.lights.get(i).map_or(0.0, light_power);
            self.cdf.push(acc);
        }
        if acc > 0.0 {
            for v in &mut self.cdf {
                *v /= acc;
            }
        }
    }

    /// Pick a light by CDF inversion; returns `(light_index, pmf)`.
    pub fn pick(&self, u: f32) -> Option<(u32, f32)> {
        if self.li_indices.is_empty() {
            return None;
        }
        let pos = self.cdf.partition_point(|&c| c < u).min(self.cdf.len() - 1);
        Some((self.li_indices[pos], self.pmf_at(pos)))
    }

    /// Probability of picking the light stored at `index`.
    pub fn pmf(&self, index: u32) -> f32 {
        self.li_indices
            .iter()
            .position(|&i| i == index)
            .map_or(0.0, |pos| self.pmf_at(pos))
    }

    fn pmf_at(&self, pos: usize) -> f32 {
        let hi = self.cdf[pos];
        let lo = if pos == 0 { 0.0 } else { self.cdf[pos - 1] };
        hi - lo
    }
}

/// Relative sampling weight of a light in the CDF.
fn light_power(l: &Light) -> f32 {
    let tint = l.col.max_element().max(1.0e-4);
    match l.kind {
        LightKind::Sphere { area, .. }
        | LightKind::Rect { area, .. }
        | LightKind::Disk { area, .. }
        | LightKind::Line { area, .. } => tint * area.max(1.0e-4),
        // Delta, env, and triangle lights weigh by tint alone; triangle
        // areas are instance-dependent.
        _ => tint,
    }
}

/// Spot attenuation for a sphere light; 1 outside spot mode.
pub fn spot_attenuation(kind: &LightKind, to_point: Vec3) -> f32 {
    let LightKind::Sphere {
        dir, spot, blend, ..
    } = kind
    else {
        return 1.0;
    };
    if *spot < 0.0 {
        return 1.0;
    }
    let cos_angle = dir.dot(to_point).clamp(-1.0, 1.0);
    let angle = cos_angle.acos();
    if angle > *spot {
        return 0.0;
    }
    if *blend > 0.0 {
        ((*spot - angle) / (*spot * *blend)).clamp(0.0, 1.0)
    } else {
        1.0
    }
}

/// Sample a direction toward a light from shading point `p`.
/// Triangle and environment kinds are resolved by the caller, which owns
/// mesh data and the importance quad-tree.
pub fn sample_light(light: &Light, p: Vec3, u: Vec2) -> Option<LightSample> {
    match light.kind {
        LightKind::Directional { dir, angle } => {
            let d = if angle > 0.0 {
                let onb = Onb::from_normal(dir);
                let disk = sample_disk_concentric(u) * angle.tan();
                onb.to_world(Vec3::new(disk.x, disk.y, 1.0)).normalize()
            } else {
                dir
            };
            Some(LightSample {
                dir: d,
                dist: f32::INFINITY,
                pdf: 0.0,
                radiance: light.col,
            })
        }
        LightKind::Sphere { pos, radius, .. } => {
            let to_center = pos - p;
            let dc2 = to_center.length_squared();
            let dc = dc2.sqrt();
            if dc <= radius {
                return None;
            }
            let sin2_max = (radius * radius / dc2).min(1.0);
            let cos_max = (1.0 - sin2_max).max(0.0).sqrt();
            // Uniform direction in the cone subtended by the sphere.
            let cos_theta = 1.0 - u.x * (1.0 - cos_max);
            let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
            let phi = 2.0 * std::f32::consts::PI * u.y;
            let onb = Onb::from_normal(to_center / dc);
            let dir = onb.to_world(Vec3::new(
                sin_theta * phi.cos(),
                sin_theta * phi.sin(),
                cos_theta,
            ));
            let pdf = 1.0 / (2.0 * std::f32::consts::PI * (1.0 - cos_max)).max(1.0e-8);
            let spot = spot_attenuation(&light.kind, -dir);
            if spot <= 0.0 {
                return None;
            }
            Some(LightSample {
                dir,
                dist: dc - radius,
                pdf,
                radiance: light.col * spot,
            })
        }
        LightKind::Rect { pos, u: lu, v: lv, area } => {
            let q = pos + (u.x - 0.5) * lu + (u.y - 0.5) * lv;
            area_sample(p, q, lu.cross(lv), area, light.col)
        }
        LightKind::Disk { pos, u: lu, v: lv, area } => {
            let d = sample_disk_concentric(u) * 0.5;
            let q = pos + d.x * lu + d.y * lv;
            area_sample(p, q, lu.cross(lv), area, light.col)
        }
        LightKind::Line {
            pos,
            axis,
            radius,
            height,
            area,
        } => {
            let q = pos + (u.x - 0.5) * height * axis;
            let to_p = (p - q).normalize();
            // Cylinder normal faces the shading point.
            let n = (to_p - axis * to_p.dot(axis)).normalize_or_zero();
            let q = q + n * radius;
            area_sample(p, q, n * area, area, light.col)
        }
        LightKind::Triangle { .. } | LightKind::Environment => None,
    }
}

/// Convert an area sample at `q` with (unnormalized) normal direction
/// `n_scaled` into a solid-angle light sample.
fn area_sample(p: Vec3, q: Vec3, n_scaled: Vec3, area: f32, col: Vec3) -> Option<LightSample> {
    let to_q = q - p;
    let dist2 = to_q.length_squared();
    if dist2 <= 1.0e-12 || area <= 0.0 {
        return None;
    }
    let dist = dist2.sqrt();
    let dir = to_q / dist;
    let n = n_scaled.normalize_or_zero();
    let cos_l = n.dot(-dir).abs();
    if cos_l <= 1.0e-6 {
        return None;
    }
    Some(LightSample {
        dir,
        dist,
        pdf: dist2 / (cos_l * area),
        radiance: col,
    })
}

/// Sample a point on a world-space triangle light.
pub fn sample_triangle_light(
    p: Vec3,
    v0: Vec3,
    v1: Vec3,
    v2: Vec3,
    col: Vec3,
    u: Vec2,
) -> Option<LightSample> {
    // Uniform barycentrics via the square-root warp.
    let su = u.x.sqrt();
    let b0 = 1.0 - su;
    let b1 = u.y * su;
    let q = v0 * b0 + v1 * b1 + v2 * (1.0 - b0 - b1);
    let n_scaled = (v1 - v0).cross(v2 - v0);
    let area = 0.5 * n_scaled.length();
    area_sample(p, q, n_scaled, area, col)
}

/// Solid-angle pdf of hitting a world-space triangle light along `dir`
/// at distance `dist`.
pub fn triangle_light_pdf(dir: Vec3, dist: f32, v0: Vec3, v1: Vec3, v2: Vec3) -> f32 {
    let n_scaled = (v1 - v0).cross(v2 - v0);
    let area = 0.5 * n_scaled.length();
    if area <= 0.0 {
        return 0.0;
    }
    let cos_l = n_scaled.normalize().dot(-dir).abs();
    if cos_l <= 1.0e-6 {
        return 0.0;
    }
    dist * dist / (cos_l * area)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sphere_light(radius: f32) -> Light {
        Light {
            kind: LightKind::Sphere {
                pos: Vec3::new(0.0, 5.0, 0.0),
                radius,
                area: 4.0 * std::f32::consts::PI * radius * radius,
                dir: Vec3::NEG_Y,
                spot: -1.0,
                blend: -1.0,
            },
            col: Vec3::ONE,
            cast_shadow: true,
            visible: true,
            sky_portal: false,
        }
    }

    #[test]
    fn cdf_pick_matches_pmf_and_sums_to_one() {
        let mut table = LightTable::default();
        let a = table.push(sphere_light(0.5));
        let b = table.push(sphere_light(2.0));
        let total: f32 = (0..table.len())
            .map(|i| table.pmf(table.li_indices[i]))
            .sum();
        assert!((total - 1.0).abs() < 1.0e-5);
        // The larger light is picked more often.
        assert!(table.pmf(b.0) > table.pmf(a.0));
        let (picked, pmf) = table.pick(0.999).unwrap();
        assert_eq!(picked, b.0);
        assert!((pmf - table.pmf(b.0)).abs() < 1.0e-6);
    }

    #[test]
    fn removal_rebuilds_cdf() {
        let mut table = LightTable::default();
        let a = table.push(sphere_light(1.0));
        let b = table.push(sphere_light(1.0));
        table.remove(a);
        assert_eq!(table.len(), 1);
        assert!((table.pmf(b.0) - 1.0).abs() < 1.0e-6);
        assert_eq!(table.pick(0.5).unwrap().0, b.0);
    }

    #[test]
    fn sphere_samples_point_at_light() {
        let light = sphere_light(1.0);
        for u in [Vec2::new(0.1, 0.3), Vec2::new(0.9, 0.8)] {
            let s = sample_light(&light, Vec3::ZERO, u).unwrap();
            // Direction must fall within the cone subtended by the sphere.
            let cos_to_center = s.dir.dot(Vec3::Y);
            let cos_max = (1.0 - 1.0 / 25.0_f32).sqrt();
            assert!(cos_to_center >= cos_max - 1.0e-4);
            assert!(s.pdf > 0.0);
        }
    }

    #[test]
    fn rect_pdf_scales_with_distance_squared() {
        let mk = |y: f32| {
            let light = Light {
                kind: LightKind::Rect {
                    pos: Vec3::new(0.0, y, 0.0),
                    u: Vec3::X,
                    v: Vec3::Z,
                    area: 1.0,
                },
                col: Vec3::ONE,
                cast_shadow: true,
                visible: true,
                sky_portal: false,
            };
            sample_light(&light, Vec3::ZERO, Vec2::splat(0.5)).unwrap()
        };
        let near = mk(2.0);
        let far = mk(4.0);
        assert!((far.pdf / near.pdf - 4.0).abs() < 0.01);
    }

    #[test]
    fn spot_cuts_off_outside_cone() {
        let kind = LightKind::Sphere {
            pos: Vec3::ZERO,
            radius: 0.1,
            area: 1.0,
            dir: Vec3::NEG_Y,
            spot: 0.5,
            blend: 0.0,
        };
        assert_eq!(spot_attenuation(&kind, Vec3::NEG_Y), 1.0);
        assert_eq!(spot_attenuation(&kind, Vec3::X), 0.0);
    }

    #[test]
    fn triangle_sample_and_pdf_agree() {
        let (v0, v1, v2) = (
            Vec3::new(-1.0, 3.0, -1.0),
            Vec3::new(1.0, 3.0, -1.0),
            Vec3::new(0.0, 3.0, 1.0),
        );
        let s =
            sample_triangle_light(Vec3::ZERO, v0, v1, v2, Vec3::ONE, Vec2::new(0.4, 0.6)).unwrap();
        let pdf = triangle_light_pdf(s.dir, s.dist, v0, v1, v2);
        assert!((pdf / s.pdf - 1.0).abs() < 1.0e-3);
    }
}
