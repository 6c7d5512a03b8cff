//! Post-process: variance prefilter, non-local-means denoise, and the
//! LUT-based tone-mapping into the output image.

use crate::color::{apply_tonemap_lut, bake_tonemap_lut, TonemapMode, TONEMAP_LUT_SIZE};
use rayon::prelude::*;

use super::types::{Image, PostProcessOptions};

/// NLM search window half-extent (7x7 window).
const SEARCH_RADIUS: i32 = 3;
/// NLM patch half-extent (3x3 patch).
const PATCH_RADIUS: i32 = 1;

fn clamp_at(w: u32, h: u32, x: i32, y: i32) -> usize {
    let x = x.clamp(0, w as i32 - 1);
    let y = y.clamp(0, h as i32 - 1);
    (y as u32 * w + x as u32) as usize
}

/// 3x3 tent prefilter over the per-pixel variance estimate; smoothing
/// the guide keeps single-pixel variance spikes from disabling the
/// filter locally.
pub(crate) fn filter_variance(variance: &[[f32; 3]], w: u32, h: u32) -> Vec<[f32; 3]> {
    let mut out = vec![[0.0f32; 3]; variance.len()];
    out.par_iter_mut().enumerate().for_each(|(i, dst)| {
        let x = (i as u32 % w) as i32;
        let y = (i as u32 / w) as i32;
        let mut acc = [0.0f32; 3];
        let mut total = 0.0;
        for dy in -1i32..=1 {
            for dx in -1i32..=1 {
                let weight = (2 - dx.abs()) as f32 * (2 - dy.abs()) as f32;
                let v = variance[clamp_at(w, h, x + dx, y + dy)];
                for c in 0..3 {
                    acc[c] += v[c] * weight;
                }
                total += weight;
            }
        }
        for c in 0..3 {
            dst[c] = acc[c] / total;
        }
    });
    out
}

/// Variance-guided non-local-means over the raw accumulator.
/// `alpha` controls the weight falloff, `damping` the tolerance of the
/// variance-cancelled patch distance.
pub(crate) fn nlm_filter(
    pixels: &[[f32; 4]],
    variance: &[[f32; 3]],
    w: u32,
    h: u32,
    alpha: f32,
    damping: f32,
) -> Vec<[f32; 4]> {
    if alpha <= 0.0 {
        return pixels.to_vec();
    }
    let mut out = vec![[0.0f32; 4]; pixels.len()];
    out.par_iter_mut().enumerate().for_each(|(i, dst)| {
        let px = (i as u32 % w) as i32;
        let py = (i as u32 / w) as i32;

        let mut acc = [0.0f32; 4];
        let mut total_weight = 0.0f32;

        for sy in -SEARCH_RADIUS..=SEARCH_RADIUS {
            for sx in -SEARCH_RADIUS..=SEARCH_RADIUS {
                // Variance-cancelled patch distance.
                let mut dist = 0.0f32;
                for ky in -PATCH_RADIUS..=PATCH_RADIUS {
                    for kx in -PATCH_RADIUS..=PATCH_RADIUS {
                        let ip = clamp_at(w, h, px + kx, py + ky);
                        let iq = clamp_at(w, h, px + sx + kx, py + sy + ky);
                        for c in 0..3 {
                            let d = pixels[ip][c] - pixels[iq][c];
                            let var_p = variance[ip][c];
                            let var_q = variance[iq][c];
                            let cancel = var_p + var_p.min(var_q);
                            let denom = 1.0e-4 + damping * damping * (var_p + var_q);
                            dist += ((d * d - cancel) / denom).max(0.0);
                        }
                    }
                }
                let patch_n = ((2 * PATCH_RADIUS + 1) * (2 * PATCH_RADIUS + 1) * 3) as f32;
                let weight = (-(dist / patch_n).max(0.0) / alpha).exp();
                let q = clamp_at(w, h, px + sx, py + sy);
                for c in 0..4 {
                    acc[c] += pixels[q][c] * weight;
                }
                total_weight += weight;
            }
        }
        for c in 0..4 {
            dst[c] = acc[c] / total_weight.max(1.0e-9);
        }
    });
    out
}

/// Tone-map a linear accumulator into a displayable image.
pub(crate) fn tonemap_image(
    pixels: &[[f32; 4]],
    w: u32,
    h: u32,
    mode: TonemapMode,
    inv_gamma: f32,
) -> Image {
    debug_assert_eq!(TONEMAP_LUT_SIZE, 256);
    let range = 1.0;
    let lut = bake_tonemap_lut(mode, range);
    let mut out = Vec::with_capacity(pixels.len() * 4);
    for p in pixels {
        for c in 0..3 {
            let mut v = apply_tonemap_lut(&lut, range, p[c]);
            if inv_gamma != 1.0 {
                v = v.max(0.0).powf(inv_gamma);
            }
            out.push(v);
        }
        out.push(p[3]);
    }
    Image {
        width: w,
        height: h,
        pixels: out,
    }
}

/// Full post-process chain: variance prefilter, NLM, tone map.
pub(crate) fn postprocess(
    pixels: &[[f32; 4]],
    variance: &[[f32; 3]],
    w: u32,
    h: u32,
    opts: &PostProcessOptions,
) -> Image {
    let prefiltered = filter_variance(variance, w, h);
    let denoised = nlm_filter(pixels, &prefiltered, w, h, opts.alpha, opts.damping);
    tonemap_image(&denoised, w, h, opts.tonemap, opts.inv_gamma)
}
