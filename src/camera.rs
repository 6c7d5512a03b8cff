//! Camera descriptors and primary-ray generation.

use crate::math::sample_disk_concentric;
use glam::{Vec2, Vec3};

/// Opaque 32-bit camera handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CameraHandle(pub u32);

impl CameraHandle {
    pub const INVALID: Self = Self(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Film reconstruction filters for the pixel jitter.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum FilmFilter {
    #[default]
    Box,
    Gaussian,
}

/// Caller-supplied camera description.
#[derive(Debug, Clone)]
pub struct CameraDesc {
    pub origin: Vec3,
    pub fwd: Vec3,
    pub up: Vec3,
    /// Vertical field of view in degrees.
    pub fov: f32,
    /// Lens radius; 0 collapses the thin lens into a pinhole.
    pub aperture: f32,
    pub focus_distance: f32,
    /// Polygonal aperture blade count; below 3 means a circular lens.
    pub aperture_blades: u32,
    /// Blade rotation in radians.
    pub aperture_rotation: f32,
    pub filter: FilmFilter,
}

impl Default for CameraDesc {
    fn default() -> Self {
        Self {
            origin: Vec3::ZERO,
            fwd: Vec3::NEG_Z,
            up: Vec3::Y,
            fov: 45.0,
            aperture: 0.0,
            focus_distance: 1.0,
            aperture_blades: 0,
            aperture_rotation: 0.0,
            filter: FilmFilter::Box,
        }
    }
}

/// Stored camera with its cached orthonormal basis.
#[derive(Debug, Clone)]
pub struct Camera {
    pub desc: CameraDesc,
    fwd: Vec3,
    right: Vec3,
    up: Vec3,
}

impl Camera {
    /// Build the camera basis from a descriptor.
    pub fn new(desc: CameraDesc) -> Self {
        let fwd = desc.fwd.normalize_or_zero();
        let fwd = if fwd == Vec3::ZERO { Vec3::NEG_Z } else { fwd };
        let right = fwd.cross(desc.up).normalize_or_zero();
        let right = if right == Vec3::ZERO { Vec3::X } else { right };
        let up = right.cross(fwd);
        Self {
            desc,
            fwd,
            right,
            up,
        }
    }

    /// Film-plane jitter in `[-0.5, 0.5]`-ish units for one sample.
    fn film_jitter(&self, u: Vec2) -> Vec2 {
        match self.desc.filter {
            FilmFilter::Box => u - Vec2::splat(0.5),
            FilmFilter::Gaussian => {
                // Box-Muller, truncated to +-1.5 pixels.
                let r = (-2.0 * (1.0 - u.x).max(1.0e-7).ln()).sqrt() * 0.375;
                let phi = 2.0 * std::f32::consts::PI * u.y;
                Vec2::new(r * phi.cos(), r * phi.sin()).clamp(Vec2::splat(-1.5), Vec2::splat(1.5))
            }
        }
    }

    /// Point on the lens, circular or polygonal, scaled by the aperture.
    fn lens_point(&self, u: Vec2) -> Vec2 {
        if self.desc.aperture <= 0.0 {
            return Vec2::ZERO;
        }
        let p = if self.desc.aperture_blades >= 3 {
            sample_aperture_polygon(self.desc.aperture_blades, self.desc.aperture_rotation, u)
        } else {
            sample_disk_concentric(u)
        };
        p * self.desc.aperture
    }

    /// Generate the primary ray for pixel `(px, py)` of a `w`x`h` film.
    pub fn sample_ray(
        &self,
        px: u32,
        py: u32,
        w: u32,
        h: u32,
        film_u: Vec2,
        lens_u: Vec2,
    ) -> (Vec3, Vec3) {
        let jitter = self.film_jitter(film_u);
        let sx = (px as f32 + 0.5 + jitter.x) / w as f32 * 2.0 - 1.0;
        let sy = 1.0 - (py as f32 + 0.5 + jitter.y) / h as f32 * 2.0;
        let tan_half = (self.desc.fov.to_radians() * 0.5).tan();
        let aspect = w as f32 / h as f32;

        let dir = (self.fwd + self.right * (sx * tan_half * aspect) + self.up * (sy * tan_half))
            .normalize();

        if self.desc.aperture <= 0.0 {
            return (self.desc.origin, dir);
        }
        let focus = self.desc.origin + dir * (self.desc.focus_distance / dir.dot(self.fwd));
        let l = self.lens_point(lens_u);
        let origin = self.desc.origin + self.right * l.x + self.up * l.y;
        (origin, (focus - origin).normalize())
    }
}

/// Uniform point on a regular polygon with `blades` vertices.
fn sample_aperture_polygon(blades: u32, rotation: f32, u: Vec2) -> Vec2 {
    let sector_angle = 2.0 * std::f32::consts::PI / blades as f32;
    let sector = ((u.x * blades as f32) as u32).min(blades - 1);
    let u0 = (u.x * blades as f32 - sector as f32).clamp(0.0, 1.0);

    let a0 = rotation + sector as f32 * sector_angle;
    let a1 = a0 + sector_angle;
    let v0 = Vec2::new(a0.cos(), a0.sin());
    let v1 = Vec2::new(a1.cos(), a1.sin());

    // Uniform point in the (origin, v0, v1) triangle.
    let su = u0.sqrt();
    v0 * (su * (1.0 - u.y)) + v1 * (su * u.y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinhole_rays_start_at_origin_and_cover_fov() {
        let cam = Camera::new(CameraDesc {
            origin: Vec3::new(1.0, 2.0, 3.0),
            ..Default::default()
        });
        let (o, d) = cam.sample_ray(32, 32, 64, 64, Vec2::splat(0.5), Vec2::splat(0.5));
        assert_eq!(o, Vec3::new(1.0, 2.0, 3.0));
        // Center pixel looks straight down the forward axis.
        assert!((d - Vec3::NEG_Z).length() < 1.0e-3);

        let (_, corner) = cam.sample_ray(0, 0, 64, 64, Vec2::splat(0.5), Vec2::splat(0.5));
        assert!(corner.x < 0.0 && corner.y > 0.0);
    }

    #[test]
    fn thin_lens_rays_converge_at_focus_plane() {
        let cam = Camera::new(CameraDesc {
            aperture: 0.1,
            focus_distance: 5.0,
            ..Default::default()
        });
        // Two lens samples of the same film point intersect at focus.
        let (o1, d1) = cam.sample_ray(40, 20, 64, 64, Vec2::splat(0.5), Vec2::new(0.1, 0.2));
        let (o2, d2) = cam.sample_ray(40, 20, 64, 64, Vec2::splat(0.5), Vec2::new(0.9, 0.7));
        assert_ne!(o1, o2);
        let t1 = 5.0 / d1.dot(Vec3::NEG_Z);
        let t2 = 5.0 / d2.dot(Vec3::NEG_Z);
        assert!(((o1 + d1 * t1) - (o2 + d2 * t2)).length() < 1.0e-3);
    }

    #[test]
    fn polygon_aperture_points_stay_inside_unit_circle() {
        for i in 0..32 {
            let u = Vec2::new((i as f32 + 0.5) / 32.0, ((i * 13) % 32) as f32 / 32.0);
            let p = sample_aperture_polygon(6, 0.3, u);
            assert!(p.length() <= 1.0 + 1.0e-5);
        }
    }
}
