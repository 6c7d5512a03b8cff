//! BSDF evaluation and importance sampling.
//!
//! All lobes work in the tangent frame (`z` along the shading normal);
//! the composite principled closure mixes them through a lobe CDF.
//! Delta lobes (roughness below the threshold) never participate in
//! `eval` and report a zero pdf so MIS treats them as their own
//! strategy.

use crate::color::luminance;
use crate::math::{fresnel_dielectric, reflect, refract, sample_cosine_hemisphere, Onb};
use crate::scene::material::ShadingNode;
use glam::{Vec2, Vec3};

/// Roughness below this collapses a microfacet lobe into a delta.
pub const DELTA_ROUGHNESS: f32 = 1.0e-3;

/// Parameters of a resolved (texture-applied) surface closure.
#[derive(Debug, Clone)]
pub struct ShadingParams {
    pub kind: ShadingNode,
    pub base_color: Vec3,
    pub roughness: f32,
    pub metallic: f32,
    pub transmission: f32,
    pub transmission_roughness: f32,
    pub sheen: f32,
    pub sheen_tint: f32,
    pub specular: f32,
    pub specular_tint: f32,
    pub clearcoat: f32,
    pub clearcoat_roughness: f32,
    /// Relative IOR along the ray (entering vs leaving handled upstream).
    pub eta: f32,
}

impl Default for ShadingParams {
    fn default() -> Self {
        Self {
            kind: ShadingNode::Diffuse,
            base_color: Vec3::splat(0.5),
            roughness: 0.5,
            metallic: 0.0,
            transmission: 0.0,
            transmission_roughness: 0.0,
            sheen: 0.0,
            sheen_tint: 0.5,
            specular: 0.5,
            specular_tint: 0.0,
            clearcoat: 0.0,
            clearcoat_roughness: 0.0,
            eta: 1.0 / 1.45,
        }
    }
}

/// Lobe classes, used by the path tracer's per-class depth budgets.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Lobe {
    Diffuse,
    Specular,
    Clearcoat,
    Refraction,
}

/// One importance-sampled scattering direction.
#[derive(Debug, Copy, Clone)]
pub struct BsdfSample {
    /// World-space outgoing direction.
    pub dir: Vec3,
    /// `f * |cos| / pdf`, ready to multiply into throughput.
    pub weight: Vec3,
    /// Solid-angle pdf; 0 for delta lobes.
    pub pdf: f32,
    pub is_delta: bool,
    /// Whether the sample crossed to the other side of the surface.
    pub is_transmission: bool,
    /// Which lobe produced the sample.
    pub lobe: Lobe,
}

fn ggx_alpha(roughness: f32) -> f32 {
    (roughness * roughness).max(1.0e-7)
}

fn ggx_d(alpha: f32, h: Vec3) -> f32 {
    let a2 = alpha * alpha;
    let d = h.z * h.z * (a2 - 1.0) + 1.0;
    a2 / (std::f32::consts::PI * d * d).max(1.0e-12)
}

fn ggx_g1(alpha: f32, w: Vec3) -> f32 {
    let a2 = alpha * alpha;
    let cos2 = w.z * w.z;
    let tan2 = ((1.0 - cos2) / cos2.max(1.0e-9)).max(0.0);
    2.0 / (1.0 + (1.0 + a2 * tan2).sqrt())
}

fn ggx_g2(alpha: f32, wo: Vec3, wi: Vec3) -> f32 {
    ggx_g1(alpha, wo) * ggx_g1(alpha, wi)
}

/// Sample a visible GGX micronormal (Heitz 2018).
fn sample_vndf(wo: Vec3, alpha: f32, u: Vec2) -> Vec3 {
    let vh = Vec3::new(alpha * wo.x, alpha * wo.y, wo.z).normalize();
    let lensq = vh.x * vh.x + vh.y * vh.y;
    let t1 = if lensq > 0.0 {
        Vec3::new(-vh.y, vh.x, 0.0) / lensq.sqrt()
    } else {
        Vec3::X
    };
    let t2 = vh.cross(t1);
    let r = u.x.sqrt();
    let phi = 2.0 * std::f32::consts::PI * u.y;
    let p1 = r * phi.cos();
    let mut p2 = r * phi.sin();
    let s = 0.5 * (1.0 + vh.z);
    p2 = (1.0 - s) * (1.0 - p1 * p1).max(0.0).sqrt() + s * p2;
    let p3 = (1.0 - p1 * p1 - p2 * p2).max(0.0).sqrt();
    let nh = p1 * t1 + p2 * t2 + p3 * vh;
    Vec3::new(alpha * nh.x, alpha * nh.y, nh.z.max(1.0e-6)).normalize()
}

/// Visible-normal pdf of a reflection direction through micronormal `h`.
fn vndf_reflect_pdf(alpha: f32, wo: Vec3, h: Vec3) -> f32 {
    let d = ggx_d(alpha, h);
    let g1 = ggx_g1(alpha, wo);
    d * g1 * wo.dot(h).abs() / (wo.z.abs().max(1.0e-9)) / (4.0 * wo.dot(h).abs())
}

fn schlick(f0: Vec3, cos: f32) -> Vec3 {
    f0 + (Vec3::ONE - f0) * (1.0 - cos).max(0.0).powi(5)
}

// Oren-Nayar with the qualitative A/B fit; sigma derived from roughness.
fn oren_nayar(base: Vec3, roughness: f32, wo: Vec3, wi: Vec3) -> Vec3 {
    let sigma2 = roughness * roughness;
    let a = 1.0 - 0.5 * sigma2 / (sigma2 + 0.33);
    let b = 0.45 * sigma2 / (sigma2 + 0.09);
    let cos_o = wo.z.abs().min(1.0);
    let cos_i = wi.z.abs().min(1.0);
    let sin_o = (1.0 - cos_o * cos_o).max(0.0).sqrt();
    let sin_i = (1.0 - cos_i * cos_i).max(0.0).sqrt();
    // Azimuthal cosine between the projected directions.
    let cos_dphi = if sin_o > 1.0e-4 && sin_i > 1.0e-4 {
        ((wo.x * wi.x + wo.y * wi.y) / (sin_o * sin_i)).clamp(-1.0, 1.0)
    } else {
        0.0
    }
    .max(0.0);
    let (sin_alpha, tan_beta) = if cos_o < cos_i {
        (sin_o, sin_i / cos_i.max(1.0e-4))
    } else {
        (sin_i, sin_o / cos_o.max(1.0e-4))
    };
    base * std::f32::consts::FRAC_1_PI * (a + b * cos_dphi * sin_alpha * tan_beta)
}

fn sheen_term(params: &ShadingParams, wo: Vec3, wi: Vec3) -> Vec3 {
    if params.sheen <= 0.0 {
        return Vec3::ZERO;
    }
    let h = (wo + wi).normalize_or_zero();
    if h == Vec3::ZERO {
        return Vec3::ZERO;
    }
    let lum = luminance(params.base_color).max(1.0e-4);
    let tint_col = params.base_color / lum;
    let sheen_col = Vec3::ONE.lerp(tint_col, params.sheen_tint);
    sheen_col * (2.0 * params.sheen) * (1.0 - h.dot(wi).abs()).max(0.0).powi(5)
}

/// Specular F0 of the principled closure.
fn principled_f0(params: &ShadingParams) -> Vec3 {
    let lum = luminance(params.base_color).max(1.0e-4);
    let tint_col = params.base_color / lum;
    let dielectric = 0.08 * params.specular * Vec3::ONE.lerp(tint_col, params.specular_tint);
    dielectric.lerp(params.base_color, params.metallic)
}

struct LobeWeights {
    diffuse: f32,
    specular: f32,
    clearcoat: f32,
    refraction: f32,
}

impl LobeWeights {
    fn of(params: &ShadingParams) -> Self {
        let (diffuse, specular, clearcoat, refraction) = match params.kind {
            ShadingNode::Diffuse => (1.0, 0.0, 0.0, 0.0),
            ShadingNode::Glossy => (0.0, 1.0, 0.0, 0.0),
            ShadingNode::Refractive => (0.0, 0.0, 0.0, 1.0),
            _ => {
                let d = (1.0 - params.metallic)
                    * (1.0 - params.transmission)
                    * luminance(params.base_color).max(1.0e-3);
                let s = luminance(principled_f0(params)).max(1.0e-3);
                let c = 0.25 * params.clearcoat;
                let r = (1.0 - params.metallic) * params.transmission;
                (d, s, c, r)
            }
        };
        let total = (diffuse + specular + clearcoat + refraction).max(1.0e-9);
        Self {
            diffuse: diffuse / total,
            specular: specular / total,
            clearcoat: clearcoat / total,
            refraction: refraction / total,
        }
    }
}

fn spec_f0(params: &ShadingParams) -> Vec3 {
    match params.kind {
        ShadingNode::Glossy => params.base_color,
        _ => principled_f0(params),
    }
}

/// Evaluate the smooth lobes toward `wi`, returning `(f, pdf)` in the
/// tangent frame of `onb`. Delta lobes contribute nothing here.
pub fn eval(params: &ShadingParams, onb: &Onb, wo_world: Vec3, wi_world: Vec3) -> (Vec3, f32) {
    let wo = onb.to_local(wo_world);
    let wi = onb.to_local(wi_world);
    if wo.z.abs() < 1.0e-6 {
        return (Vec3::ZERO, 0.0);
    }
    let weights = LobeWeights::of(params);
    let mut f = Vec3::ZERO;
    let mut pdf = 0.0;

    let reflecting = wo.z * wi.z > 0.0;

    if weights.diffuse > 0.0 && reflecting && wi.z * wo.z > 0.0 && wo.z > 0.0 {
        f += oren_nayar(params.base_color, params.roughness, wo, wi) * wi.z.abs()
            + sheen_term(params, wo, wi) * std::f32::consts::FRAC_1_PI * wi.z.abs();
        pdf += weights.diffuse * wi.z.abs() * std::f32::consts::FRAC_1_PI;
    }

    if weights.specular > 0.0 && reflecting && params.roughness >= DELTA_ROUGHNESS {
        let alpha = ggx_alpha(params.roughness);
        let h = (wo + wi).normalize_or_zero();
        if h != Vec3::ZERO && h.z > 0.0 {
            let fr = schlick(spec_f0(params), wo.dot(h).abs());
            let d = ggx_d(alpha, h);
            let g = ggx_g2(alpha, wo, wi);
            f += fr * (d * g / (4.0 * wo.z.abs()).max(1.0e-9));
            pdf += weights.specular * vndf_reflect_pdf(alpha, wo, h);
        }
    }

    if weights.clearcoat > 0.0 && reflecting {
        // Clearcoat keeps a gloss floor instead of going delta.
        let alpha = ggx_alpha(params.clearcoat_roughness.max(0.05));
        let h = (wo + wi).normalize_or_zero();
        if h != Vec3::ZERO && h.z > 0.0 {
            let fr = 0.04 + 0.96 * (1.0 - wo.dot(h).abs()).max(0.0).powi(5);
            let d = ggx_d(alpha, h);
            let g = ggx_g2(alpha, wo, wi);
            f += Vec3::splat(0.25 * params.clearcoat * fr * d * g / (4.0 * wo.z.abs()).max(1.0e-9));
            pdf += weights.clearcoat * vndf_reflect_pdf(alpha, wo, h);
        }
    }

    if weights.refraction > 0.0
        && !reflecting
        && params.transmission_roughness.max(params.roughness) >= DELTA_ROUGHNESS
    {
        // Rough transmission: evaluate through the refraction half-vector.
        let eta = params.eta;
        let h = -(wi * (1.0 / eta) + wo).normalize_or_zero();
        let h = if h.z < 0.0 { -h } else { h };
        if h != Vec3::ZERO {
            let alpha = ggx_alpha(params.transmission_roughness.max(params.roughness));
            let cos_oh = wo.dot(h);
            let cos_ih = wi.dot(h);
            if cos_oh * cos_ih < 0.0 {
                let fr = fresnel_dielectric(cos_oh, eta);
                let d = ggx_d(alpha, h);
                let g = ggx_g2(alpha, wo, wi);
                let denom = (cos_ih / eta + cos_oh).powi(2).max(1.0e-9);
                let jac = cos_ih.abs() / denom;
                f += params.base_color
                    * ((1.0 - fr) * d * g * cos_oh.abs() * jac / wo.z.abs().max(1.0e-9));
                pdf += weights.refraction
                    * (ggx_d(alpha, h) * ggx_g1(alpha, wo) * cos_oh.abs()
                        / wo.z.abs().max(1.0e-9))
                    * jac;
            }
        }
    }

    (f, pdf)
}

/// Importance-sample a scattering direction. `lobe_u` picks the lobe,
/// `u` drives the in-lobe sample.
pub fn sample(
    params: &ShadingParams,
    onb: &Onb,
    wo_world: Vec3,
    u: Vec2,
    lobe_u: f32,
) -> Option<BsdfSample> {
    let wo = onb.to_local(wo_world);
    if wo.z.abs() < 1.0e-6 {
        return None;
    }
    let weights = LobeWeights::of(params);

    let mut pick = lobe_u;
    let lobe = if pick < weights.diffuse {
        0
    } else if {
        pick -= weights.diffuse;
        pick < weights.specular
    } {
        1
    } else if {
        pick -= weights.specular;
        pick < weights.clearcoat
    } {
        2
    } else {
        3
    };

    match lobe {
        0 => {
            // Cosine-weighted diffuse; flip into the upper hemisphere.
            let flip = wo.z < 0.0;
            let (mut wi, _) = sample_cosine_hemisphere(u);
            if flip {
                wi.z = -wi.z;
            }
            let wi_world = onb.to_world(wi);
            let (f, pdf) = eval(params, onb, wo_world, wi_world);
            if pdf <= 0.0 {
                return None;
            }
            Some(BsdfSample {
                dir: wi_world,
                weight: f / pdf,
                pdf,
                is_delta: false,
                is_transmission: false,
                lobe: Lobe::Diffuse,
            })
        }
        1 | 2 => {
            let rough = if lobe == 1 {
                params.roughness
            } else {
                params.clearcoat_roughness.max(0.05)
            };
            if rough < DELTA_ROUGHNESS && lobe == 1 {
                // Perfect mirror.
                let wi = Vec3::new(-wo.x, -wo.y, wo.z);
                let fr = schlick(spec_f0(params), wo.z.abs());
                let select_pdf = weights.specular.max(1.0e-6);
                return Some(BsdfSample {
                    dir: onb.to_world(wi),
                    weight: fr / select_pdf,
                    pdf: 0.0,
                    is_delta: true,
                    is_transmission: false,
                    lobe: Lobe::Specular,
                });
            }
            let flip = wo.z < 0.0;
            let wo_up = if flip { -wo } else { wo };
            let alpha = ggx_alpha(rough);
            let h = sample_vndf(wo_up, alpha, u);
            let wi_up = reflect(-wo_up, h);
            if wi_up.z <= 0.0 {
                return None;
            }
            let wi = if flip { -wi_up } else { wi_up };
            let wi_world = onb.to_world(wi);
            let (f, pdf) = eval(params, onb, wo_world, wi_world);
            if pdf <= 0.0 {
                return None;
            }
            Some(BsdfSample {
                dir: wi_world,
                weight: f / pdf,
                pdf,
                is_delta: false,
                is_transmission: false,
                lobe: if lobe == 1 { Lobe::Specular } else { Lobe::Clearcoat },
            })
        }
        _ => {
            let rough = params.transmission_roughness.max(params.roughness);
            let eta = params.eta;
            if rough < DELTA_ROUGHNESS {
                // Smooth dielectric: choose reflect vs refract by Fresnel.
                let n = Vec3::Z * wo.z.signum();
                let fr = fresnel_dielectric(wo.z, eta);
                let select_pdf = weights.refraction.max(1.0e-6);
                let reflectance = if u.x < fr {
                    let wi = Vec3::new(-wo.x, -wo.y, wo.z);
                    return Some(BsdfSample {
                        dir: onb.to_world(wi),
                        weight: Vec3::ONE / select_pdf,
                        pdf: 0.0,
                        is_delta: true,
                        is_transmission: false,
                        lobe: Lobe::Specular,
                    });
                } else {
                    refract(-wo, n, eta)
                };
                let wi = reflectance?;
                return Some(BsdfSample {
                    dir: onb.to_world(wi),
                    weight: params.base_color / select_pdf,
                    pdf: 0.0,
                    is_delta: true,
                    is_transmission: true,
                    lobe: Lobe::Refraction,
                });
            }
            // Rough dielectric through a sampled micronormal.
            let flip = wo.z < 0.0;
            let wo_up = if flip { -wo } else { wo };
            let alpha = ggx_alpha(rough);
            let h = sample_vndf(wo_up, alpha, u);
            let fr = fresnel_dielectric(wo_up.dot(h), eta);
            // Reuse the lobe selector's residual for the Fresnel choice.
            let residual = ((lobe_u * 4096.0).fract()).clamp(0.0, 1.0);
            let wi_up = if residual < fr {
                reflect(-wo_up, h)
            } else {
                refract(-wo_up, h, eta)?
            };
            let wi = if flip { -wi_up } else { wi_up };
            let wi_world = onb.to_world(wi);
            let (f, pdf) = eval(params, onb, wo_world, wi_world);
            if pdf <= 0.0 || f == Vec3::ZERO {
                return None;
            }
            Some(BsdfSample {
                dir: wi_world,
                weight: f / pdf,
                pdf,
                is_delta: false,
                is_transmission: wi.z * wo.z < 0.0,
                lobe: if wi.z * wo.z < 0.0 { Lobe::Refraction } else { Lobe::Specular },
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn onb_up() -> Onb {
        Onb::from_normal(Vec3::Z)
    }

    fn halton_like(i: u32) -> Vec2 {
        Vec2::new(
            ((i as f32 * 0.618_034).fract() + 1.0e-3).min(0.999),
            ((i as f32 * 0.414_214).fract() + 1.0e-3).min(0.999),
        )
    }

    #[test]
    fn diffuse_sample_eval_consistency() {
        let params = ShadingParams {
            base_color: Vec3::new(0.5, 0.0, 0.0),
            roughness: 0.5,
            ..Default::default()
        };
        let onb = onb_up();
        let wo = Vec3::new(0.3, -0.1, 0.9).normalize();
        for i in 0..32 {
            let u = halton_like(i);
            let Some(s) = sample(&params, &onb, wo, u, 0.2) else {
                continue;
            };
            let (f, pdf) = eval(&params, &onb, wo, s.dir);
            assert!((pdf - s.pdf).abs() / pdf.max(1.0e-6) < 1.0e-3);
            let w = f / pdf;
            assert!((w - s.weight).length() < 1.0e-3);
            // Red albedo only.
            assert_eq!(s.weight.y, 0.0);
            assert!(s.weight.x <= 1.05, "diffuse must not gain energy");
        }
    }

    #[test]
    fn ggx_reflection_stays_above_surface_and_conserves() {
        let params = ShadingParams {
            kind: ShadingNode::Glossy,
            base_color: Vec3::ONE,
            roughness: 0.3,
            ..Default::default()
        };
        let onb = onb_up();
        let wo = Vec3::new(0.5, 0.2, 0.8).normalize();
        let mut mean = Vec3::ZERO;
        let mut n = 0;
        for i in 0..128 {
            let u = halton_like(i);
            if let Some(s) = sample(&params, &onb, wo, u, 0.5) {
                assert!(s.dir.z > 0.0);
                mean += s.weight;
                n += 1;
            }
        }
        assert!(n > 100);
        mean /= n as f32;
        // White furnace bound with some sampling slack.
        assert!(mean.x < 1.1, "mean weight {mean:?}");
        assert!(mean.x > 0.4, "GGX with F0=1 should retain most energy");
    }

    #[test]
    fn mirror_is_delta_and_reflects() {
        let params = ShadingParams {
            kind: ShadingNode::Principled,
            base_color: Vec3::ONE,
            roughness: 0.0,
            metallic: 1.0,
            ..Default::default()
        };
        let onb = onb_up();
        let wo = Vec3::new(0.4, 0.0, 0.917).normalize();
        let s = sample(&params, &onb, wo, Vec2::splat(0.4), 0.9).unwrap();
        assert!(s.is_delta);
        assert_eq!(s.pdf, 0.0);
        let expected = Vec3::new(-wo.x, -wo.y, wo.z);
        assert!((s.dir - expected).length() < 1.0e-5);
        // Mirror eval contributes nothing to MIS.
        let (f, pdf) = eval(&params, &onb, wo, s.dir);
        assert_eq!(pdf, 0.0);
        assert_eq!(f, Vec3::ZERO);
    }

    #[test]
    fn smooth_dielectric_refracts_by_snell() {
        let params = ShadingParams {
            kind: ShadingNode::Refractive,
            base_color: Vec3::ONE,
            roughness: 0.0,
            eta: 1.0 / 1.45,
            ..Default::default()
        };
        let onb = onb_up();
        let wo = Vec3::new(0.5, 0.0, 0.866).normalize();
        // Force the transmissive branch (u.x above normal-incidence Fresnel).
        let s = sample(&params, &onb, wo, Vec2::new(0.99, 0.5), 0.99).unwrap();
        assert!(s.is_delta);
        assert!(s.is_transmission);
        assert!(s.dir.z < 0.0);
        let sin_i = (1.0 - wo.z * wo.z).sqrt();
        let sin_t = (1.0 - s.dir.z * s.dir.z).sqrt();
        assert!((sin_t - sin_i / 1.45).abs() < 1.0e-3);
    }

    #[test]
    fn principled_lobe_pdf_is_a_convex_mix() {
        let params = ShadingParams {
            kind: ShadingNode::Principled,
            base_color: Vec3::splat(0.8),
            roughness: 0.4,
            metallic: 0.3,
            clearcoat: 1.0,
            clearcoat_roughness: 0.2,
            ..Default::default()
        };
        let onb = onb_up();
        let wo = Vec3::new(0.1, 0.2, 0.97).normalize();
        let wi = Vec3::new(-0.2, 0.1, 0.97).normalize();
        let (f, pdf) = eval(&params, &onb, wo, wi);
        assert!(pdf > 0.0);
        assert!(f.min_element() >= 0.0);
        // Removing the clearcoat must lower the pdf contribution.
        let mut no_cc = params.clone();
        no_cc.clearcoat = 0.0;
        let (_, pdf_no_cc) = eval(&no_cc, &onb, wo, wi);
        assert!(pdf_no_cc > 0.0);
    }
}
