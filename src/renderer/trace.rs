//! The per-pixel path-tracing state machine: generate, intersect,
//! shade with next-event estimation, scatter, terminate.

use crate::bsdf::{self, Lobe, ShadingParams};
use crate::camera::Camera;
use crate::lights::{
    sample_light, sample_triangle_light, triangle_light_pdf, LightKind, LightSample,
};
use crate::math::{canonical_to_dir, dir_to_canonical, power_heuristic, Onb};
use crate::rt::{self, offset_ray_origin, Hit, Ray};
use crate::scene::env::eval_env_map;
use crate::scene::material::{
    unpack_unorm_16, Material, ShadingNode, BASE_TEXTURE, MAT_FLAG_MIX_ADD, METALLIC_TEXTURE,
    MIX_MAT1, MIX_MAT2, NORMALS_TEXTURE, ROUGH_TEXTURE,
};
use crate::scene::mesh::MATERIAL_INDEX_BITS;
use crate::scene::SceneInner;
use crate::tex::TextureHandle;

use super::rng::{
    hash_combine, hash_u32, Pcg32, SobolSampler, DIM_BSDF_UV, DIM_FILM, DIM_LENS, DIM_LIGHT_SEL,
    DIM_LIGHT_UV, DIM_MIX, DIM_RR,
};
use super::types::RenderOptions;
use glam::{Vec2, Vec3};

/// Paths whose throughput drops below this stop contributing.
const THROUGHPUT_EPS: f32 = 1.0e-5;
/// Hard cap on material-tree walks; trees are acyclic by construction.
const MAX_TREE_WALK: u32 = 64;

/// Surface geometry at a hit, in world space.
struct SurfaceContext {
    point: Vec3,
    geo_normal: Vec3,
    shading_onb: Onb,
    uv: Vec2,
}

fn surface_context(s: &SceneInner, ray: &Ray, hit: &Hit) -> SurfaceContext {
    let base = (hit.tri_index * 3) as usize;
    let i0 = s.vtx_indices[base] as usize;
    let i1 = s.vtx_indices[base + 1] as usize;
    let i2 = s.vtx_indices[base + 2] as usize;
    let (w0, w1, w2) = (1.0 - hit.u - hit.v, hit.u, hit.v);

    let n_obj = Vec3::from(s.vertices[i0].n) * w0
        + Vec3::from(s.vertices[i1].n) * w1
        + Vec3::from(s.vertices[i2].n) * w2;
    let uv = Vec2::from(s.vertices[i0].t) * w0
        + Vec2::from(s.vertices[i1].t) * w1
        + Vec2::from(s.vertices[i2].t) * w2;

    let accel = &s.tris[hit.tri_index as usize];
    let geo_obj = accel.e1.cross(accel.e2);

    let mi = s.mesh_instances.get(hit.instance);
    let inv = mi
        .and_then(|mi| s.transforms.get(mi.tr_index))
        .map(|t| t.inv_xform)
        .unwrap_or(glam::Mat4::IDENTITY);
    // Normals transform by the inverse transpose.
    let normal_mat = inv.transpose();
    let mut geo_normal = normal_mat.transform_vector3(geo_obj).normalize_or_zero();
    let mut shading_n = normal_mat.transform_vector3(n_obj).normalize_or_zero();
    if shading_n == Vec3::ZERO {
        shading_n = geo_normal;
    }
    if !hit.front_facing {
        geo_normal = -geo_normal;
        shading_n = -shading_n;
    }
    // Keep the shading normal on the visible side.
    if shading_n.dot(-ray.dir) < 0.0 {
        shading_n = geo_normal;
    }

    SurfaceContext {
        point: ray.orig + ray.dir * hit.t,
        geo_normal,
        shading_onb: Onb::from_normal(shading_n),
        uv,
    }
}

/// Build texture-resolved closure parameters from a material leaf.
fn resolve_params(s: &SceneInner, mat: &Material, uv: Vec2, front_facing: bool) -> ShadingParams {
    let tex = |slot: usize| TextureHandle(mat.textures[slot]);
    let mut base_color = mat.base_color;
    if tex(BASE_TEXTURE).is_valid() {
        let t = s.textures.sample(tex(BASE_TEXTURE), uv);
        base_color *= Vec3::new(t.x, t.y, t.z);
    }
    let mut roughness = unpack_unorm_16(mat.roughness_unorm);
    if tex(ROUGH_TEXTURE).is_valid() {
        roughness *= s.textures.sample(tex(ROUGH_TEXTURE), uv).x;
    }
    let mut metallic = unpack_unorm_16(mat.metallic_unorm);
    if tex(METALLIC_TEXTURE).is_valid() {
        metallic *= s.textures.sample(tex(METALLIC_TEXTURE), uv).x;
    }
    let ior = mat.ior.max(1.0e-3);
    ShadingParams {
        kind: mat.kind,
        base_color,
        roughness,
        metallic,
        transmission: unpack_unorm_16(mat.transmission_unorm),
        transmission_roughness: unpack_unorm_16(mat.transmission_roughness_unorm),
        sheen: unpack_unorm_16(mat.sheen_unorm),
        sheen_tint: unpack_unorm_16(mat.sheen_tint_unorm),
        specular: unpack_unorm_16(mat.specular_unorm),
        specular_tint: unpack_unorm_16(mat.specular_tint_unorm),
        clearcoat: unpack_unorm_16(mat.clearcoat_unorm),
        clearcoat_roughness: unpack_unorm_16(mat.clearcoat_roughness_unorm),
        eta: if front_facing { 1.0 / ior } else { ior },
    }
}

/// Apply the material's normal map to the shading frame.
fn apply_normal_map(s: &SceneInner, mat: &Material, ctx: &mut SurfaceContext) {
    let handle = TextureHandle(mat.textures[NORMALS_TEXTURE]);
    if !handle.is_valid() {
        if mat.tangent_rotation != 0.0 {
            ctx.shading_onb = ctx.shading_onb.rotated(mat.tangent_rotation);
        }
        return;
    }
    let t = s.textures.sample(handle, ctx.uv);
    let mut n_ts = Vec3::new(t.x * 2.0 - 1.0, t.y * 2.0 - 1.0, t.z * 2.0 - 1.0);
    if s.textures.has_reconstruct_z(handle) {
        n_ts.z = (1.0 - n_ts.x * n_ts.x - n_ts.y * n_ts.y).max(0.0).sqrt();
    }
    let strength = unpack_unorm_16(mat.normal_map_strength_unorm);
    let onb = ctx.shading_onb.rotated(mat.tangent_rotation);
    let mapped = onb.to_world(n_ts).normalize_or_zero();
    if mapped != Vec3::ZERO {
        let n = ctx.shading_onb.normal.lerp(mapped, strength).normalize();
        ctx.shading_onb = Onb::from_normal(n);
    }
}

/// Outcome of walking a material tree at a surface point.
enum ResolvedMaterial {
    Scatter { mat_index: u32 },
    Transparent { tint: Vec3 },
    /// The walk ended in an emissive leaf with no scattering lobes.
    EmissionOnly,
}

/// Walk the material tree from `root`, stochastically resolving Mix
/// nodes and accumulating emission (additive mixes) into `emission`.
#[allow(clippy::too_many_arguments)]
fn resolve_material(
    s: &SceneInner,
    root: u32,
    uv: Vec2,
    mix_u: f32,
    path_hash: u32,
    stochastic: bool,
    emission: &mut Vec3,
) -> ResolvedMaterial {
    let mut index = root;
    // Fast path: one deterministic PCG stream per walk, seeded by the
    // bounce's Sobol mix value.
    let mut mix_rng = Pcg32::new(root as u64, mix_u.to_bits() as u64);
    for _walk in 0..MAX_TREE_WALK {
        let Some(mat) = s.materials.get(index) else {
            return ResolvedMaterial::Transparent { tint: Vec3::ONE };
        };
        match mat.kind {
            ShadingNode::Mix => {
                if mat.flags & MAT_FLAG_MIX_ADD != 0 {
                    // Additive branch: accumulate the emissive side, keep
                    // resolving the scattering side.
                    if let Some(emissive) = s.materials.get(mat.textures[MIX_MAT2]) {
                        if emissive.kind == ShadingNode::Emissive {
                            let mut col = emissive.base_color * emissive.strength;
                            let tex = TextureHandle(emissive.textures[BASE_TEXTURE]);
                            if tex.is_valid() {
                                let t = s.textures.sample(tex, uv);
                                col *= Vec3::new(t.x, t.y, t.z);
                            }
                            *emission += col;
                        }
                    }
                    index = mat.textures[MIX_MAT1];
                    continue;
                }
                let mut k = mat.strength;
                let tex = TextureHandle(mat.textures[BASE_TEXTURE]);
                if tex.is_valid() {
                    k *= s.textures.sample(tex, uv).x;
                }
                let u = if stochastic {
                    // Hash of the path state keeps deep trees reproducible.
                    hash_u32(hash_combine(path_hash, index)) as f32 / u32::MAX as f32
                } else {
                    mix_rng.next_f32()
                };
                index = if u < k {
                    mat.textures[MIX_MAT2]
                } else {
                    mat.textures[MIX_MAT1]
                };
            }
            ShadingNode::Transparent => {
                let mut tint = mat.base_color;
                let tex = TextureHandle(mat.textures[BASE_TEXTURE]);
                if tex.is_valid() {
                    let t = s.textures.sample(tex, uv);
                    tint *= Vec3::new(t.x, t.y, t.z);
                }
                return ResolvedMaterial::Transparent { tint };
            }
            ShadingNode::Emissive => {
                let mut col = mat.base_color * mat.strength;
                let tex = TextureHandle(mat.textures[BASE_TEXTURE]);
                if tex.is_valid() {
                    let t = s.textures.sample(tex, uv);
                    col *= Vec3::new(t.x, t.y, t.z);
                }
                *emission += col;
                return ResolvedMaterial::EmissionOnly;
            }
            _ => return ResolvedMaterial::Scatter { mat_index: index },
        }
    }
    debug_assert!(false, "material tree too deep");
    ResolvedMaterial::Transparent { tint: Vec3::ONE }
}

/// Pdf (solid angle) of the environment light producing `dir`, without
/// the light-pick pmf.
fn env_pdf(s: &SceneInner, dir: Vec3) -> f32 {
    if s.qtree.levels() == 0 {
        return 1.0 / (4.0 * std::f32::consts::PI);
    }
    let uv = dir_to_canonical(dir, s.env.env_map_rotation);
    s.qtree.pdf(uv) / (4.0 * std::f32::consts::PI)
}

/// Environment radiance along `dir`. Primary rays prefer the back map.
fn env_radiance(s: &SceneInner, dir: Vec3, primary: bool) -> Vec3 {
    let use_back = primary && (s.env.back_map.is_valid() || s.env.back_col != Vec3::ZERO);
    let (col, map, rotation) = if use_back {
        (s.env.back_col, s.env.back_map, s.env.back_map_rotation)
    } else {
        (s.env.env_col, s.env.env_map, s.env.env_map_rotation)
    };
    if map.is_valid() {
        col * eval_env_map(&s.textures, map, rotation, dir)
    } else {
        col
    }
}

/// Mis weight of emission hit by a BSDF ray, against the matching
/// Triangle light.
fn emissive_hit_weight(s: &SceneInner, ray: &Ray, hit: &Hit, prev_pdf: f32) -> f32 {
    if prev_pdf <= 0.0 || !hit.front_facing {
        return 1.0;
    }
    let Some(mi) = s.mesh_instances.get(hit.instance) else {
        return 1.0;
    };
    let mut light_index = None;
    for (i, l) in s.lights.lights.iter() {
        if let LightKind::Triangle {
            tri_index,
            xform_index,
        } = l.kind
        {
            if tri_index == hit.tri_index && xform_index == mi.tr_index {
                light_index = Some(i);
                break;
            }
        }
    }
    let Some(light_index) = light_index else {
        return 1.0;
    };
    let (v0, v1, v2) = s.triangle_world_verts(hit.tri_index, mi.tr_index);
    let light_pdf =
        triangle_light_pdf(ray.dir, hit.t, v0, v1, v2) * s.lights.pmf(light_index);
    power_heuristic(prev_pdf, light_pdf)
}

/// Sample one light for next-event estimation; returns the sample plus
/// the pick pmf.
fn sample_one_light(
    s: &SceneInner,
    p: Vec3,
    sel: f32,
    uv2: Vec2,
) -> Option<(LightSample, f32, bool)> {
    let (light_index, pmf) = s.lights.pick(sel)?;
    let light = s.lights.lights.get(light_index)?;
    let sample = match light.kind {
        LightKind::Triangle {
            tri_index,
            xform_index,
        } => {
            let (v0, v1, v2) = s.triangle_world_verts(tri_index, xform_index);
            sample_triangle_light(p, v0, v1, v2, light.col, uv2)?
        }
        LightKind::Environment => {
            let (dir, pdf) = if s.qtree.levels() > 0 {
                let (quv, pdf_uv) = s.qtree.sample(uv2);
                (
                    canonical_to_dir(quv, s.env.env_map_rotation),
                    pdf_uv / (4.0 * std::f32::consts::PI),
                )
            } else {
                (
                    crate::math::sample_sphere_uniform(uv2),
                    1.0 / (4.0 * std::f32::consts::PI),
                )
            };
            LightSample {
                dir,
                dist: f32::INFINITY,
                pdf,
                radiance: light.col * env_radiance(s, dir, false),
            }
        }
        _ => sample_light(light, p, uv2)?,
    };
    Some((sample, pmf, light.cast_shadow))
}

/// Trace one sample of one pixel. The Sobol dimension layout follows
/// the order documented in `renderer::rng`.
pub(crate) fn trace_pixel(
    s: &SceneInner,
    cam: &Camera,
    px: u32,
    py: u32,
    img_w: u32,
    img_h: u32,
    sampler: &SobolSampler,
    opts: &RenderOptions,
) -> Vec3 {
    let film_u = sampler.get_2d(DIM_FILM);
    let lens_u = sampler.get_2d(DIM_LENS);
    let (orig, dir) = cam.sample_ray(px, py, img_w, img_h, film_u, lens_u);
    let mut ray = Ray { orig, dir };

    let mut radiance = Vec3::ZERO;
    let mut throughput = Vec3::ONE;
    let mut prev_pdf = 0.0f32;

    let mut diff_depth = 0u32;
    let mut spec_depth = 0u32;
    let mut refr_depth = 0u32;
    let mut total_depth = 0u32;
    let mut transp_count = 0u32;
    let mut bounce = 0u32;
    let path_hash = hash_combine(hash_combine(px, py), sampler.get_1d(DIM_FILM).to_bits());

    loop {
        let Some(hit) = rt::intersect_closest(s, &ray, f32::INFINITY) else {
            let weight = if prev_pdf > 0.0 && s.env_map_light.is_valid() {
                let light_pdf = env_pdf(s, ray.dir) * s.lights.pmf(s.env_map_light.0);
                power_heuristic(prev_pdf, light_pdf)
            } else {
                1.0
            };
            radiance += throughput * env_radiance(s, ray.dir, bounce == 0) * weight;
            break;
        };

        let mut ctx = surface_context(s, &ray, &hit);
        let tm = s.tri_materials[hit.tri_index as usize];
        let side = if hit.front_facing { tm.front_mi } else { tm.back_mi };
        let root = (side & MATERIAL_INDEX_BITS) as u32;

        let mix_u = sampler.get_1d(SobolSampler::bounce_pair(bounce, DIM_MIX));
        let mut emission = Vec3::ZERO;
        let resolved = resolve_material(
            s,
            root,
            ctx.uv,
            mix_u,
            hash_combine(path_hash, bounce),
            opts.stochastic_mix,
            &mut emission,
        );

        if emission != Vec3::ZERO {
            let weight = emissive_hit_weight(s, &ray, &hit, prev_pdf);
            radiance += throughput * emission * weight;
        }

        let mat_index = match resolved {
            ResolvedMaterial::Scatter { mat_index } => mat_index,
            ResolvedMaterial::Transparent { tint } => {
                throughput *= tint;
                transp_count += 1;
                if transp_count > opts.max_total_depth
                    || throughput.max_element() < THROUGHPUT_EPS
                {
                    break;
                }
                // Continue through the surface. prev_pdf and the bounce
                // dimensions stay untouched: a punch-through is not a
                // scattering event, and keeping the dimension cursor in
                // place makes a fully transparent surface invisible to
                // the estimator.
                ray.orig = offset_ray_origin(
                    ctx.point,
                    ctx.geo_normal * ctx.geo_normal.dot(ray.dir).signum(),
                );
                continue;
            }
            ResolvedMaterial::EmissionOnly => break,
        };

        let mat = s.materials.get(mat_index).expect("resolved leaf exists");
        apply_normal_map(s, mat, &mut ctx);
        let params = resolve_params(s, mat, ctx.uv, hit.front_facing);
        let wo = -ray.dir;

        // Next-event estimation toward one light.
        if !s.lights.is_empty() {
            let sel_u = sampler.get_2d(SobolSampler::bounce_pair(bounce, DIM_LIGHT_SEL));
            let light_uv = sampler.get_2d(SobolSampler::bounce_pair(bounce, DIM_LIGHT_UV));
            if let Some((ls, pmf, cast_shadow)) = sample_one_light(s, ctx.point, sel_u.x, light_uv)
            {
                let (f, pdf_bsdf) = bsdf::eval(&params, &ctx.shading_onb, wo, ls.dir);
                if f != Vec3::ZERO && pmf > 0.0 {
                    let transmission = if cast_shadow {
                        let shadow_orig = offset_ray_origin(
                            ctx.point,
                            ctx.geo_normal * ctx.geo_normal.dot(ls.dir).signum(),
                        );
                        let t_max = if ls.dist.is_finite() {
                            ls.dist * 0.999
                        } else {
                            f32::MAX
                        };
                        rt::trace_shadow(
                            s,
                            &Ray {
                                orig: shadow_orig,
                                dir: ls.dir,
                            },
                            t_max,
                        )
                    } else {
                        Vec3::ONE
                    };
                    if transmission != Vec3::ZERO {
                        let contrib = if ls.pdf <= 0.0 {
                            // Delta light: no competing strategy.
                            throughput * f * ls.radiance * transmission / pmf
                        } else {
                            let light_pdf = ls.pdf * pmf;
                            let mis = power_heuristic(light_pdf, pdf_bsdf);
                            throughput * f * ls.radiance * transmission * mis / light_pdf
                        };
                        radiance += contrib;
                    }
                }
            }
        }

        // Scatter.
        let bsdf_uv = sampler.get_2d(SobolSampler::bounce_pair(bounce, DIM_BSDF_UV));
        let lobe_u = sampler.get_2d(SobolSampler::bounce_pair(bounce, DIM_LIGHT_SEL)).y;
        let Some(scatter) = bsdf::sample(&params, &ctx.shading_onb, wo, bsdf_uv, lobe_u) else {
            break;
        };

        match scatter.lobe {
            Lobe::Diffuse => diff_depth += 1,
            Lobe::Specular | Lobe::Clearcoat => spec_depth += 1,
            Lobe::Refraction => refr_depth += 1,
        }
        total_depth += 1;
        if diff_depth > opts.max_diff_depth
            || spec_depth > opts.max_spec_depth
            || refr_depth > opts.max_refr_depth
            || total_depth > opts.max_total_depth
        {
            break;
        }

        throughput *= scatter.weight;
        if throughput.max_element() < THROUGHPUT_EPS {
            break;
        }
        prev_pdf = if scatter.is_delta { 0.0 } else { scatter.pdf };

        let offset_n = if scatter.is_transmission {
            -ctx.geo_normal
        } else {
            ctx.geo_normal
        };
        ray = Ray {
            orig: offset_ray_origin(ctx.point, offset_n),
            dir: scatter.dir,
        };

        // Russian roulette after the safe bounces.
        if total_depth > opts.min_bounce {
            let q = throughput.max_element().clamp(opts.rr_low, 1.0);
            if sampler.get_1d(SobolSampler::bounce_pair(bounce, DIM_RR)) >= q {
                break;
            }
            throughput /= q;
        }

        bounce += 1;
    }

    if radiance.is_finite() {
        radiance
    } else {
        Vec3::ZERO
    }
}

/// Progressive running-mean update plus a Welford variance step.
/// `mean` and `m2` are per-pixel accumulators; `n1` is the sample count
/// after this update.
pub(crate) fn accumulate(mean: &mut [f32; 4], m2: &mut [f32; 3], sample: Vec3, n1: u32) {
    let old = Vec3::new(mean[0], mean[1], mean[2]);
    let delta = sample - old;
    let new = old + delta / n1 as f32;
    let d2 = sample - new;
    m2[0] += delta.x * d2.x;
    m2[1] += delta.y * d2.y;
    m2[2] += delta.z * d2.z;
    *mean = [new.x, new.y, new.z, 1.0];
}
