//! Environment state: the importance quad-tree over the equirectangular
//! map and the baked physical-sky texture.

use crate::color::{rgb_to_rgbe, rgbe_to_rgb};
use crate::math::{canonical_to_dir, dir_to_canonical};
use crate::tex::{TextureHandle, TextureStorage};
use glam::{Vec2, Vec3, Vec4};

/// Sentinel env-map handle requesting the analytic sky bake.
pub const PHYSICAL_SKY_TEXTURE: TextureHandle = TextureHandle(u32::MAX - 1);

/// Resolution of the baked sky texture.
pub const SKY_ENV_RES: (u32, u32) = (512, 256);

/// Quad-tree levels dropped when they carry less than this luminance share.
const LUM_FRACT_THRESHOLD: f32 = 0.01;

/// Environment description shared by the public API and internal state.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Environment {
    pub env_col: Vec3,
    pub env_map: TextureHandle,
    pub back_col: Vec3,
    pub back_map: TextureHandle,
    /// Radians around world Y.
    pub env_map_rotation: f32,
    pub back_map_rotation: f32,
    pub multiple_importance: bool,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            env_col: Vec3::ZERO,
            env_map: TextureHandle::INVALID,
            back_col: Vec3::ZERO,
            back_map: TextureHandle::INVALID,
            env_map_rotation: 0.0,
            back_map_rotation: 0.0,
            multiple_importance: false,
        }
    }
}

/// Luminance-weighted spherical quad-tree over an equirectangular map.
///
/// Level 0 is the finest: an `(R/2)x(R/2)` grid of cells whose four
/// components hold the maximum luminance of one sub-quadrant each.
/// Each higher level sums the four child components.
#[derive(Debug, Default)]
pub struct EnvQTree {
    pub res: u32,
    pub mips: Vec<Vec<Vec4>>,
    pub total_lum: f32,
}

impl EnvQTree {
    /// Build the tree from the env map's decoded pixels.
    pub fn build(fetch_rgb: impl Fn(u32, u32) -> Vec3, w: u32, h: u32) -> Self {
        let lowest_dim = w.min(h);
        let mut res = 2u32;
        while 2 * res < lowest_dim {
            res *= 2;
        }

        let mut mips: Vec<Vec<Vec4>> = Vec::new();
        let mut cur_res = res;
        mips.push(vec![Vec4::ZERO; (cur_res * cur_res / 4) as usize]);

        for y in 0..h {
            let theta = std::f32::consts::PI * y as f32 / h as f32;
            for x in 0..w {
                let phi = 2.0 * std::f32::consts::PI * x as f32 / w as f32;
                let col = fetch_rgb(x, y);
                let lum = col.x + col.y + col.z;
                let dir = Vec3::new(
                    theta.sin() * phi.cos(),
                    theta.cos(),
                    theta.sin() * phi.sin(),
                );
                let q = dir_to_canonical(dir, 0.0);
                let qx = ((cur_res as f32 * q.x) as u32).min(cur_res - 1);
                let qy = ((cur_res as f32 * q.y) as u32).min(cur_res - 1);
                let index = ((qx & 1) | ((qy & 1) << 1)) as usize;
                let cell = &mut mips[0][((qy / 2) * (cur_res / 2) + qx / 2) as usize];
                cell[index] = cell[index].max(lum);
            }
        }

        let mut total_lum = 0.0;
        for v in &mips[0] {
            total_lum += v.x + v.y + v.z + v.w;
        }
        cur_res /= 2;

        while cur_res > 1 {
            let prev = mips.last().unwrap();
            let mut next = vec![Vec4::ZERO; (cur_res * cur_res / 4) as usize];
            for y in 0..cur_res {
                for x in 0..cur_res {
                    let sum = {
                        let c = prev[(y * cur_res + x) as usize];
                        c.x + c.y + c.z + c.w
                    };
                    let index = ((x & 1) | ((y & 1) << 1)) as usize;
                    next[((y / 2) * (cur_res / 2) + x / 2) as usize][index] = sum;
                }
            }
            mips.push(next);
            cur_res /= 2;
        }

        let mut tree = Self {
            res,
            mips,
            total_lum,
        };
        tree.trim();
        tree
    }

    /// Drop fine levels whose cells all fall below the luminance share
    /// threshold; the kept share of `total_lum` stays above 99%.
    fn trim(&mut self) {
        let mut last_required = 0usize;
        for lod in (0..self.mips.len()).rev() {
            last_required = lod;
            let mip = &self.mips[lod];
            let side = ((self.res >> lod) / 2).max(1);
            let mut subdivision_required = false;
            'scan: for y in 0..side {
                for x in 0..side {
                    let c = mip[(y * side + x) as usize];
                    if c.max_element() > LUM_FRACT_THRESHOLD * self.total_lum {
                        subdivision_required = true;
                        break 'scan;
                    }
                }
            }
            if !subdivision_required {
                break;
            }
        }

        for _ in 0..last_required {
            self.mips.remove(0);
            self.res /= 2;
        }
    }

    /// Level count after trimming.
    pub fn levels(&self) -> usize {
        self.mips.len()
    }

    /// Importance-sample a canonical position. Returns `(uv, pdf)` where
    /// the pdf is over the unit square; divide by `4 * PI` for solid angle.
    pub fn sample(&self, mut u: Vec2) -> (Vec2, f32) {
        if self.mips.is_empty() || self.total_lum <= 0.0 {
            return (u, 1.0);
        }
        let mut factor = 1.0f32;
        let (mut cx, mut cy) = (0u32, 0u32);
        for lod in (0..self.mips.len()).rev() {
            let side = ((self.res >> lod) / 2).max(1);
            let cell = self.mips[lod][(cy * side + cx) as usize];
            let total = cell.x + cell.y + cell.z + cell.w;
            if total <= 0.0 {
                break;
            }
            // Split the unit square by quadrant probabilities along x
            // then y, remapping the residual of `u` for reuse.
            let px = (cell.x + cell.z) / total;
            let (qx, ux) = if u.x < px {
                (0u32, u.x / px.max(1.0e-12))
            } else {
                (1u32, (u.x - px) / (1.0 - px).max(1.0e-12))
            };
            let col = if qx == 0 {
                Vec2::new(cell.x, cell.z)
            } else {
                Vec2::new(cell.y, cell.w)
            };
            let col_total = col.x + col.y;
            let py = col.x / col_total.max(1.0e-12);
            let (qy, uy) = if u.y < py {
                (0u32, u.y / py.max(1.0e-12))
            } else {
                (1u32, (u.y - py) / (1.0 - py).max(1.0e-12))
            };
            let q = [cell.x, cell.y, cell.z, cell.w][(qx + 2 * qy) as usize];
            factor *= 4.0 * q / total;
            u = Vec2::new(ux.clamp(0.0, 0.999_999), uy.clamp(0.0, 0.999_999));
            cx = 2 * cx + qx;
            cy = 2 * cy + qy;
        }
        let uv = Vec2::new(
            (cx as f32 + u.x) / self.res as f32,
            (cy as f32 + u.y) / self.res as f32,
        );
        (uv, factor)
    }

    /// Pdf (over the unit square) of sampling canonical position `uv`.
    pub fn pdf(&self, uv: Vec2) -> f32 {
        if self.mips.is_empty() || self.total_lum <= 0.0 {
            return 1.0;
        }
        let qx = ((uv.x * self.res as f32) as u32).min(self.res - 1);
        let qy = ((uv.y * self.res as f32) as u32).min(self.res - 1);
        let mut factor = 1.0f32;
        for lod in (0..self.mips.len()).rev() {
            let side = ((self.res >> lod) / 2).max(1);
            let (cx, cy) = (qx >> (lod + 1), qy >> (lod + 1));
            let cell = self.mips[lod][(cy * side + cx) as usize];
            let total = cell.x + cell.y + cell.z + cell.w;
            if total <= 0.0 {
                return 0.0;
            }
            let ix = ((qx >> lod) & 1) | (((qy >> lod) & 1) << 1);
            factor *= 4.0 * cell[ix as usize] / total;
        }
        factor
    }
}

/// Decode one env-map texel (RGBE in RGBA8) to linear RGB.
pub fn fetch_env_rgb(store: &TextureStorage, handle: TextureHandle, x: u32, y: u32) -> Vec3 {
    let raw = store.fetch_base(handle, x, y);
    rgbe_to_rgb(raw)
}

/// Evaluate the environment map along a direction, with rotation. Uses
/// bilinear filtering over decoded texels.
pub fn eval_env_map(
    store: &TextureStorage,
    handle: TextureHandle,
    rotation: f32,
    dir: Vec3,
) -> Vec3 {
    let Some((w, h)) = store.dims(handle) else {
        return Vec3::ONE;
    };
    // Equirectangular latitude/longitude addressing.
    let theta = dir.y.clamp(-1.0, 1.0).acos();
    let mut phi = dir.z.atan2(dir.x) + rotation;
    while phi < 0.0 {
        phi += 2.0 * std::f32::consts::PI;
    }
    while phi >= 2.0 * std::f32::consts::PI {
        phi -= 2.0 * std::f32::consts::PI;
    }
    let fx = phi / (2.0 * std::f32::consts::PI) * w as f32 - 0.5;
    let fy = theta / std::f32::consts::PI * h as f32 - 0.5;
    let (x0, y0) = (fx.floor(), fy.floor());
    let (tx, ty) = (fx - x0, fy - y0);
    let wrap_x = |v: f32| ((v as i64).rem_euclid(w as i64)) as u32;
    let clamp_y = |v: f32| (v.max(0.0) as u32).min(h - 1);
    let mut acc = Vec3::ZERO;
    for (dx, dy, wgt) in [
        (0.0, 0.0, (1.0 - tx) * (1.0 - ty)),
        (1.0, 0.0, tx * (1.0 - ty)),
        (0.0, 1.0, (1.0 - tx) * ty),
        (1.0, 1.0, tx * ty),
    ] {
        acc += fetch_env_rgb(store, handle, wrap_x(x0 + dx), clamp_y(y0 + dy)) * wgt;
    }
    acc
}

/// Direction for a canonical qtree sample, honoring the env rotation.
pub fn qtree_uv_to_dir(uv: Vec2, rotation: f32) -> Vec3 {
    canonical_to_dir(uv, rotation)
}

// Single-scattering atmosphere for the physical-sky bake.
// Heights in kilometers; densities fall off exponentially.
const PLANET_RADIUS: f32 = 6371.0;
const ATMOSPHERE_HEIGHT: f32 = 100.0;
const RAYLEIGH_HEIGHT: f32 = 8.0;
const MIE_HEIGHT: f32 = 1.2;
const RAYLEIGH_COEFF: Vec3 = Vec3::new(5.802e-3, 13.558e-3, 33.1e-3);
const MIE_COEFF: f32 = 3.996e-3;
const MIE_G: f32 = 0.8;
const SKY_STEPS: usize = 16;

fn atmosphere_exit(origin: Vec3, dir: Vec3) -> f32 {
    let r = PLANET_RADIUS + ATMOSPHERE_HEIGHT;
    let b = origin.dot(dir);
    let c = origin.length_squared() - r * r;
    let disc = b * b - c;
    if disc <= 0.0 {
        return 0.0;
    }
    -b + disc.sqrt()
}

fn densities(p: Vec3) -> (f32, f32) {
    let h = (p.length() - PLANET_RADIUS).max(0.0);
    ((-h / RAYLEIGH_HEIGHT).exp(), (-h / MIE_HEIGHT).exp())
}

fn rayleigh_phase(cos_a: f32) -> f32 {
    3.0 / (16.0 * std::f32::consts::PI) * (1.0 + cos_a * cos_a)
}

fn mie_phase(cos_a: f32) -> f32 {
    let g2 = MIE_G * MIE_G;
    3.0 / (8.0 * std::f32::consts::PI) * ((1.0 - g2) * (1.0 + cos_a * cos_a))
        / ((2.0 + g2) * (1.0 + g2 - 2.0 * MIE_G * cos_a).powf(1.5))
}

fn optical_depth_to_sun(p: Vec3, sun_dir: Vec3) -> Vec3 {
    let t_exit = atmosphere_exit(p, sun_dir);
    if t_exit <= 0.0 {
        return Vec3::splat(1.0e9);
    }
    let step = t_exit / SKY_STEPS as f32;
    let mut depth_r = 0.0;
    let mut depth_m = 0.0;
    for i in 0..SKY_STEPS {
        let q = p + sun_dir * ((i as f32 + 0.5) * step);
        let (dr, dm) = densities(q);
        depth_r += dr * step;
        depth_m += dm * step;
    }
    RAYLEIGH_COEFF * depth_r + Vec3::splat(MIE_COEFF * 1.1 * depth_m)
}

/// Integrate single scattering along a view ray against one sun.
pub fn integrate_scattering(view_dir: Vec3, sun_dir: Vec3, sun_col: Vec3) -> Vec3 {
    let origin = Vec3::new(0.0, PLANET_RADIUS + 0.2, 0.0);
    let t_exit = atmosphere_exit(origin, view_dir);
    if t_exit <= 0.0 {
        return Vec3::ZERO;
    }
    let step = t_exit / SKY_STEPS as f32;
    let cos_a = view_dir.dot(sun_dir);
    let ph_r = rayleigh_phase(cos_a);
    let ph_m = mie_phase(cos_a);

    let mut depth_r = 0.0;
    let mut depth_m = 0.0;
    let mut acc = Vec3::ZERO;
    for i in 0..SKY_STEPS {
        let p = origin + view_dir * ((i as f32 + 0.5) * step);
        let (dr, dm) = densities(p);
        depth_r += dr * step;
        depth_m += dm * step;
        let depth_view = RAYLEIGH_COEFF * depth_r + Vec3::splat(MIE_COEFF * 1.1 * depth_m);
        let depth_sun = optical_depth_to_sun(p, sun_dir);
        let transmittance = (-(depth_view + depth_sun)).exp();
        acc += transmittance * (RAYLEIGH_COEFF * (ph_r * dr) + Vec3::splat(MIE_COEFF * ph_m * dm)) * step;
    }
    acc * sun_col
}

/// Bake the 512x256 RGBE sky texture from a set of directional suns,
/// given as `(direction_toward_sun, color, angular_radius)` triples.
pub fn bake_physical_sky(suns: &[(Vec3, Vec3, f32)]) -> Vec<u8> {
    let (w, h) = SKY_ENV_RES;
    let mut pixels = Vec::with_capacity((w * h * 4) as usize);
    for y in 0..h {
        let theta = std::f32::consts::PI * y as f32 / h as f32;
        for x in 0..w {
            let phi = 2.0 * std::f32::consts::PI * x as f32 / w as f32;
            let dir = Vec3::new(
                theta.sin() * phi.cos(),
                theta.cos(),
                theta.sin() * phi.sin(),
            );
            let mut col = Vec3::ZERO;
            for &(sun_dir, sun_col, angle) in suns {
                // Undo the delta-light normalization applied at add time.
                let restored = if angle != 0.0 {
                    let radius = angle.tan();
                    sun_col * (std::f32::consts::PI * radius * radius)
                } else {
                    sun_col
                };
                col += integrate_scattering(dir, sun_dir, restored);
            }
            pixels.extend_from_slice(&rgb_to_rgbe(col));
        }
    }
    pixels
}
