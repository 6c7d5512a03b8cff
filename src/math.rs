//! Small geometric helpers used across lumen.

use glam::{Mat4, Vec2, Vec3};

/// Axis-aligned bounding box in world or object space.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Aabb {
    /// Minimum corner.
    pub min: Vec3,
    /// Maximum corner.
    pub max: Vec3,
}

impl Aabb {
    /// Return an empty box that can be grown via `include`.
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::INFINITY),
            max: Vec3::splat(f32::NEG_INFINITY),
        }
    }

    /// Box spanning the given corners.
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Expand this box to include a point.
    pub fn include_point(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    /// Expand this box to include another.
    pub fn include(&mut self, other: Aabb) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Union of two boxes.
    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Center point.
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Extent (max - min); negative components mean the box is empty.
    pub fn extent(&self) -> Vec3 {
        self.max - self.min
    }

    /// Surface area. Empty boxes report zero.
    pub fn area(&self) -> f32 {
        let e = self.max - self.min;
        if e.x < 0.0 || e.y < 0.0 || e.z < 0.0 {
            return 0.0;
        }
        2.0 * (e.x * e.y + e.y * e.z + e.z * e.x)
    }

    /// Whether another box lies fully inside this one (inclusive).
    pub fn contains(&self, other: &Aabb) -> bool {
        self.min.x <= other.min.x
            && self.min.y <= other.min.y
            && self.min.z <= other.min.z
            && self.max.x >= other.max.x
            && self.max.y >= other.max.y
            && self.max.z >= other.max.z
    }

    /// Transform all eight corners and rebound.
    pub fn transform(&self, m: &Mat4) -> Aabb {
        let mut out = Aabb::empty();
        for i in 0..8 {
            let c = Vec3::new(
                if i & 1 != 0 { self.max.x } else { self.min.x },
                if i & 2 != 0 { self.max.y } else { self.min.y },
                if i & 4 != 0 { self.max.z } else { self.min.z },
            );
            out.include_point(m.transform_point3(c));
        }
        out
    }
}

/// Orthonormal basis around a unit normal.
#[derive(Debug, Copy, Clone)]
pub struct Onb {
    pub tangent: Vec3,
    pub bitangent: Vec3,
    pub normal: Vec3,
}

impl Onb {
    /// Build a basis from a unit normal (branchless Duff et al. construction).
    pub fn from_normal(n: Vec3) -> Self {
        let sign = 1.0_f32.copysign(n.z);
        let a = -1.0 / (sign + n.z);
        let b = n.x * n.y * a;
        Self {
            tangent: Vec3::new(1.0 + sign * n.x * n.x * a, sign * b, -sign * n.x),
            bitangent: Vec3::new(b, sign + n.y * n.y * a, -n.y),
            normal: n,
        }
    }

    /// Rotate the tangent frame around the normal.
    pub fn rotated(self, angle: f32) -> Self {
        if angle == 0.0 {
            return self;
        }
        let (s, c) = angle.sin_cos();
        Self {
            tangent: self.tangent * c + self.bitangent * s,
            bitangent: self.bitangent * c - self.tangent * s,
            normal: self.normal,
        }
    }

    /// Local (tangent-space) vector to world space.
    pub fn to_world(&self, v: Vec3) -> Vec3 {
        self.tangent * v.x + self.bitangent * v.y + self.normal * v.z
    }

    /// World-space vector to local (tangent) space.
    pub fn to_local(&self, v: Vec3) -> Vec3 {
        Vec3::new(v.dot(self.tangent), v.dot(self.bitangent), v.dot(self.normal))
    }
}

/// Reflect `v` about unit normal `n`.
pub fn reflect(v: Vec3, n: Vec3) -> Vec3 {
    v - 2.0 * v.dot(n) * n
}

/// Refract `v` through unit normal `n` with relative IOR `eta`.
/// Returns `None` on total internal reflection.
pub fn refract(v: Vec3, n: Vec3, eta: f32) -> Option<Vec3> {
    let cos_i = -v.dot(n);
    let sin2_t = eta * eta * (1.0 - cos_i * cos_i);
    if sin2_t >= 1.0 {
        return None;
    }
    let cos_t = (1.0 - sin2_t).sqrt();
    Some(eta * v + (eta * cos_i - cos_t) * n)
}

/// Fresnel reflectance of a dielectric interface, `eta` = n_i / n_t.
pub fn fresnel_dielectric(cos_i: f32, eta: f32) -> f32 {
    let cos_i = cos_i.abs().clamp(0.0, 1.0);
    let sin2_t = eta * eta * (1.0 - cos_i * cos_i);
    if sin2_t >= 1.0 {
        return 1.0;
    }
    let cos_t = (1.0 - sin2_t).sqrt();
    let rs = (cos_i - eta * cos_t) / (cos_i + eta * cos_t);
    let rp = (eta * cos_i - cos_t) / (eta * cos_i + cos_t);
    0.5 * (rs * rs + rp * rp)
}

/// Power heuristic (beta = 2) for combining two sampling strategies.
pub fn power_heuristic(pdf_a: f32, pdf_b: f32) -> f32 {
    let a = pdf_a * pdf_a;
    let b = pdf_b * pdf_b;
    if a + b > 0.0 {
        a / (a + b)
    } else {
        0.0
    }
}

/// Map a unit direction to canonical `(u, v)` on `[0, 1]^2`, with a
/// rotation around the world Y axis applied first.
pub fn dir_to_canonical(d: Vec3, y_rotation: f32) -> Vec2 {
    let cos_theta = d.y.clamp(-1.0, 1.0);
    let mut phi = d.z.atan2(d.x) + y_rotation;
    while phi < 0.0 {
        phi += 2.0 * std::f32::consts::PI;
    }
    while phi >= 2.0 * std::f32::consts::PI {
        phi -= 2.0 * std::f32::consts::PI;
    }
    Vec2::new((cos_theta + 1.0) * 0.5, phi / (2.0 * std::f32::consts::PI))
}

/// Inverse of `dir_to_canonical`.
pub fn canonical_to_dir(p: Vec2, y_rotation: f32) -> Vec3 {
    let cos_theta = 2.0 * p.x - 1.0;
    let phi = p.y * 2.0 * std::f32::consts::PI - y_rotation;
    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
    Vec3::new(sin_theta * phi.cos(), cos_theta, sin_theta * phi.sin())
}

/// Uniform point on the unit disk via concentric mapping.
pub fn sample_disk_concentric(u: Vec2) -> Vec2 {
    let offset = 2.0 * u - Vec2::ONE;
    if offset == Vec2::ZERO {
        return Vec2::ZERO;
    }
    let (r, theta) = if offset.x.abs() > offset.y.abs() {
        (offset.x, std::f32::consts::FRAC_PI_4 * (offset.y / offset.x))
    } else {
        (
            offset.y,
            std::f32::consts::FRAC_PI_2 - std::f32::consts::FRAC_PI_4 * (offset.x / offset.y),
        )
    };
    r * Vec2::new(theta.cos(), theta.sin())
}

/// Cosine-weighted hemisphere direction around +Z, with its pdf.
pub fn sample_cosine_hemisphere(u: Vec2) -> (Vec3, f32) {
    let d = sample_disk_concentric(u);
    let z = (1.0 - d.length_squared()).max(0.0).sqrt();
    (Vec3::new(d.x, d.y, z), z.max(1.0e-8) * std::f32::consts::FRAC_1_PI)
}

/// Uniform direction on the unit sphere.
pub fn sample_sphere_uniform(u: Vec2) -> Vec3 {
    let z = 1.0 - 2.0 * u.x;
    let r = (1.0 - z * z).max(0.0).sqrt();
    let phi = 2.0 * std::f32::consts::PI * u.y;
    Vec3::new(r * phi.cos(), r * phi.sin(), z)
}
