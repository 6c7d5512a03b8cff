//! Color codecs and transfer curves: RGBE and YCoCg packing, sRGB, and
//! the baked tone-mapping LUTs. Radiance itself travels as `glam`
//! vectors throughout the tracer.

use glam::Vec3;

/// Perceptual luminance of a linear RGB triple (Rec. 709 weights).
pub fn luminance(c: Vec3) -> f32 {
    0.212671 * c.x + 0.715160 * c.y + 0.072169 * c.z
}

/// Pack linear RGB into shared-exponent RGBE.
pub fn rgb_to_rgbe(rgb: Vec3) -> [u8; 4] {
    let max_component = rgb.x.max(rgb.y).max(rgb.z);
    if max_component < 1.0e-32 {
        return [0; 4];
    }
    let exponent = max_component.log2().floor() as i32 + 1;
    let factor = 256.0 / (exponent as f32).exp2();
    [
        (rgb.x * factor).min(255.0) as u8,
        (rgb.y * factor).min(255.0) as u8,
        (rgb.z * factor).min(255.0) as u8,
        (exponent + 128) as u8,
    ]
}

/// Unpack shared-exponent RGBE into linear RGB.
pub fn rgbe_to_rgb(rgbe: [u8; 4]) -> Vec3 {
    if rgbe[3] == 0 {
        return Vec3::ZERO;
    }
    let f = ((rgbe[3] as i32 - 128 - 8) as f32).exp2();
    Vec3::new(rgbe[0] as f32, rgbe[1] as f32, rgbe[2] as f32) * f
}

/// Convert an RGB8 texel into CoCg_Y layout (chroma in RG, luma in alpha),
/// the arrangement the BC3 path compresses.
pub fn rgb_to_cocg_y(rgb: [u8; 3]) -> [u8; 4] {
    let r = rgb[0] as i32;
    let g = rgb[1] as i32;
    let b = rgb[2] as i32;
    let co = ((r - b) / 2) + 128;
    let tmp = b + (r - b) / 2;
    let cg = ((g - tmp) / 2) + 128;
    let y = tmp + (g - tmp) / 2;
    [
        co.clamp(0, 255) as u8,
        cg.clamp(0, 255) as u8,
        0,
        y.clamp(0, 255) as u8,
    ]
}

/// Inverse of `rgb_to_cocg_y`.
pub fn cocg_y_to_rgb(cocg_y: [u8; 4]) -> [u8; 3] {
    let co = cocg_y[0] as i32 - 128;
    let cg = cocg_y[1] as i32 - 128;
    let y = cocg_y[3] as i32;
    let tmp = y - cg;
    let g = y + cg;
    let r = tmp + co;
    let b = tmp - co;
    [
        r.clamp(0, 255) as u8,
        g.clamp(0, 255) as u8,
        b.clamp(0, 255) as u8,
    ]
}

/// Linear value to the sRGB transfer curve.
pub fn linear_to_srgb(x: f32) -> f32 {
    if x <= 0.0031308 {
        12.92 * x
    } else {
        1.055 * x.powf(1.0 / 2.4) - 0.055
    }
}

/// sRGB transfer curve back to linear.
pub fn srgb_to_linear(x: f32) -> f32 {
    if x <= 0.04045 {
        x / 12.92
    } else {
        ((x + 0.055) / 1.055).powf(2.4)
    }
}

/// Tone-mapping operators selectable on the post-process.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum TonemapMode {
    /// Clamp and apply the sRGB curve.
    #[default]
    Standard,
    /// Filmic curve (Hejl-Burgess-Dawson fit), sRGB folded in.
    Filmic,
}

/// Number of entries in a baked tone-mapping LUT.
pub const TONEMAP_LUT_SIZE: usize = 256;

/// Bake a 1-D tone-mapping LUT over [0, `range`] for the given operator.
pub fn bake_tonemap_lut(mode: TonemapMode, range: f32) -> Vec<f32> {
    let mut lut = Vec::with_capacity(TONEMAP_LUT_SIZE);
    for i in 0..TONEMAP_LUT_SIZE {
        let x = range * i as f32 / (TONEMAP_LUT_SIZE - 1) as f32;
        lut.push(match mode {
            TonemapMode::Standard => linear_to_srgb(x.clamp(0.0, 1.0)),
            TonemapMode::Filmic => {
                let v = (x - 0.004).max(0.0);
                (v * (6.2 * v + 0.5)) / (v * (6.2 * v + 1.7) + 0.06)
            }
        });
    }
    lut
}

/// Evaluate a baked LUT with linear interpolation; inputs above the baked
/// range clamp to the last entry.
pub fn apply_tonemap_lut(lut: &[f32], range: f32, x: f32) -> f32 {
    let t = (x / range).clamp(0.0, 1.0) * (lut.len() - 1) as f32;
    let i = (t as usize).min(lut.len() - 2);
    let frac = t - i as f32;
    lut[i] * (1.0 - frac) + lut[i + 1] * frac
}
