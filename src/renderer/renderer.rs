//! Progressive CPU renderer: tile scheduling, parallel sample passes,
//! and the per-pixel accumulator.

use rayon::prelude::*;

use crate::camera::Camera;
use crate::scene::{Scene, SceneInner, SceneSettings};

use super::filter;
use super::rng::SobolSampler;
use super::tiles::{build_region_contexts, TILE_SIZE};
use super::trace::{accumulate, trace_pixel};
use super::types::{Image, PostProcessOptions, RegionContext, RenderError, RenderOptions, Settings};

/// Software path-tracing renderer over a scene snapshot.
pub struct Renderer {
    settings: Settings,
    options: RenderOptions,
    /// Progressive running mean, linear RGBA.
    mean: Vec<[f32; 4]>,
    /// Welford M2 accumulator per channel.
    m2: Vec<[f32; 3]>,
    /// Per-pixel accumulated sample counts.
    counts: Vec<u32>,
    samples_done: u32,
}

impl Renderer {
    /// Validate settings and build an empty accumulator.
    pub fn new(settings: Settings) -> Result<Self, RenderError> {
        if settings.w == 0 || settings.h == 0 {
            return Err(RenderError::InvalidSettings("zero image extent"));
        }
        if settings.samples_per_portion == 0 {
            return Err(RenderError::InvalidSettings("zero sample portion"));
        }
        if settings.use_hwrt {
            log::warn!("hardware ray tracing unavailable here, using software traversal");
        }
        if let Some(pattern) = &settings.preferred_device {
            log::info!("device preference '{pattern}' noted; rendering on the CPU pool");
        }
        let len = (settings.w * settings.h) as usize;
        Ok(Self {
            settings,
            options: RenderOptions::default(),
            mean: vec![[0.0; 4]; len],
            m2: vec![[0.0; 3]; len],
            counts: vec![0; len],
            samples_done: 0,
        })
    }

    /// Renderer settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Current path-tracing options.
    pub fn options(&self) -> RenderOptions {
        self.options
    }

    /// Replace the path-tracing options (applies to subsequent samples).
    pub fn set_options(&mut self, options: RenderOptions) {
        self.options = options;
    }

    /// Create a scene configured for this renderer.
    pub fn create_scene(&self) -> Scene {
        Scene::new(SceneSettings {
            use_wide_bvh: self.settings.use_wide_bvh,
            use_bindless: self.settings.use_bindless,
            use_tex_compression: self.settings.use_tex_compression,
        })
    }

    /// Tile set covering the full image.
    pub fn region_contexts(&self) -> Vec<RegionContext> {
        build_region_contexts(self.settings.w, self.settings.h)
    }

    /// Drop all accumulated samples.
    pub fn clear(&mut self) {
        self.mean.fill([0.0; 4]);
        self.m2.fill([0.0; 3]);
        self.counts.fill(0);
        self.samples_done = 0;
    }

    /// Advance one sample for one tile. The region's iteration counter
    /// selects the low-discrepancy sample index, so calls are
    /// reproducible per `(pixel, iteration)`.
    pub fn render_region(
        &mut self,
        scene: &Scene,
        region: &mut RegionContext,
    ) -> Result<(), RenderError> {
        let s = scene.read();
        let cam = current_camera(&s)?;
        render_tile(
            &s,
            &cam,
            &self.settings,
            &self.options,
            *region,
            0,
            &mut self.mean,
            &mut self.m2,
            &mut self.counts,
        );
        region.iteration += 1;
        Ok(())
    }

    /// Run `samples` full-image passes on the worker pool. All tiles of
    /// sample `k` complete before sample `k + 1` starts, which the
    /// running-mean update depends on.
    pub fn render_frame(&mut self, scene: &Scene, samples: u32) -> Result<(), RenderError> {
        let img_w = self.settings.w;
        let img_h = self.settings.h;
        let band_px = (TILE_SIZE * img_w) as usize;
        {
            let s = scene.read();
            let cam = current_camera(&s)?;
            for k in 0..samples {
                let sample_index = self.samples_done + k;
                if sample_index % self.settings.samples_per_portion == 0 {
                    log::debug!("rendering sample {sample_index}");
                }
                let settings = &self.settings;
                let options = &self.options;
                let s_ref = &s;
                let cam_ref = &cam;
                self.mean
                    .par_chunks_mut(band_px)
                    .zip(self.m2.par_chunks_mut(band_px))
                    .zip(self.counts.par_chunks_mut(band_px))
                    .enumerate()
                    .for_each(|(band, ((mean, m2), counts))| {
                        let y0 = band as u32 * TILE_SIZE;
                        let band_h = TILE_SIZE.min(img_h - y0);
                        // 16x16 tiles within this band.
                        for tx in 0..(img_w + TILE_SIZE - 1) / TILE_SIZE {
                            let x0 = tx * TILE_SIZE;
                            let region = RegionContext {
                                x: x0,
                                y: y0,
                                w: TILE_SIZE.min(img_w - x0),
                                h: band_h,
                                iteration: sample_index,
                            };
                            render_tile(
                                s_ref, cam_ref, settings, options, region, y0, mean, m2, counts,
                            );
                        }
                    });
                self.samples_done += 1;
            }
        }
        scene.retire_frame();
        Ok(())
    }

    /// Borrow the linear RGBA accumulator.
    pub fn pixels(&self) -> &[[f32; 4]] {
        &self.mean
    }

    /// Total full-image samples accumulated via `render_frame`.
    pub fn samples_done(&self) -> u32 {
        self.samples_done
    }

    /// Per-pixel variance of the mean estimate.
    pub fn variance(&self) -> Vec<[f32; 3]> {
        self.m2
            .iter()
            .zip(&self.counts)
            .map(|(m2, &n)| {
                if n < 2 {
                    [0.0; 3]
                } else {
                    let denom = (n * (n - 1)) as f32;
                    [m2[0] / denom, m2[1] / denom, m2[2] / denom]
                }
            })
            .collect()
    }

    /// Run the NLM variance filter and tone mapping over the current
    /// accumulator.
    pub fn postprocess(&self, opts: &PostProcessOptions) -> Image {
        filter::postprocess(
            &self.mean,
            &self.variance(),
            self.settings.w,
            self.settings.h,
            opts,
        )
    }
}

fn current_camera(s: &SceneInner) -> Result<Camera, RenderError> {
    s.cameras
        .get(s.current_camera.0)
        .cloned()
        .ok_or(RenderError::NoCamera)
}

/// Render one sample of one tile into the band-local buffers.
/// `buf_y0` is the image row the buffer slices start at.
#[allow(clippy::too_many_arguments)]
fn render_tile(
    s: &SceneInner,
    cam: &Camera,
    settings: &Settings,
    options: &RenderOptions,
    region: RegionContext,
    buf_y0: u32,
    mean: &mut [[f32; 4]],
    m2: &mut [[f32; 3]],
    counts: &mut [u32],
) {
    for y in region.y..region.y + region.h {
        for x in region.x..region.x + region.w {
            let sampler = SobolSampler::new(x, y, region.iteration, settings.seed);
            let value = trace_pixel(
                s,
                cam,
                x,
                y,
                settings.w,
                settings.h,
                &sampler,
                options,
            );
            let idx = ((y - buf_y0) * settings.w + x) as usize;
            counts[idx] += 1;
            accumulate(&mut mean[idx], &mut m2[idx], value, counts[idx]);
        }
    }
}
