//! Public renderer settings, options, and output types.

use crate::color::TonemapMode;

/// Renderer construction settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Output width in pixels.
    pub w: u32,
    /// Output height in pixels.
    pub h: u32,
    /// Preferred device name pattern; informational for the CPU path.
    pub preferred_device: Option<String>,
    /// Request hardware ray tracing. The software renderer logs and
    /// falls back; the hit contract is identical.
    pub use_hwrt: bool,
    /// Bindless textures instead of the packed atlases.
    pub use_bindless: bool,
    /// Collapse BLAS/TLAS into the 8-wide SoA layout.
    pub use_wide_bvh: bool,
    /// BC-compress eligible textures.
    pub use_tex_compression: bool,
    /// Samples run per tile between scheduler checks.
    pub samples_per_portion: u32,
    /// Seed decorrelating whole renders.
    pub seed: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            w: 0,
            h: 0,
            preferred_device: None,
            use_hwrt: false,
            use_bindless: false,
            use_wide_bvh: true,
            use_tex_compression: false,
            samples_per_portion: 16,
            seed: 0,
        }
    }
}

/// Per-frame path-tracing options: depth budgets and termination.
#[derive(Debug, Copy, Clone)]
pub struct RenderOptions {
    pub max_diff_depth: u32,
    pub max_spec_depth: u32,
    pub max_refr_depth: u32,
    pub max_total_depth: u32,
    /// Bounce after which Russian roulette may terminate paths.
    pub min_bounce: u32,
    /// Lower clamp of the roulette survival probability.
    pub rr_low: f32,
    /// Resolve Mix nodes by hashing the path state instead of one draw.
    pub stochastic_mix: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            max_diff_depth: 4,
            max_spec_depth: 8,
            max_refr_depth: 8,
            max_total_depth: 10,
            min_bounce: 3,
            rr_low: 0.05,
            stochastic_mix: false,
        }
    }
}

/// One tile of the image plus its progressive sample counter.
#[derive(Debug, Copy, Clone)]
pub struct RegionContext {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    /// Samples already accumulated for this region.
    pub iteration: u32,
}

impl RegionContext {
    /// Region covering `(x, y)..(x+w, y+h)`.
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self {
            x,
            y,
            w,
            h,
            iteration: 0,
        }
    }
}

/// RGBA image in linear color space.
#[derive(Debug, Clone)]
pub struct Image {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Linear RGBA pixels, row-major, length = width * height * 4.
    pub pixels: Vec<f32>,
}

/// Post-process configuration for the NLM filter and tone mapping.
#[derive(Debug, Copy, Clone)]
pub struct PostProcessOptions {
    /// NLM weight falloff; 0 disables filtering.
    pub alpha: f32,
    /// Variance damping of the NLM distance.
    pub damping: f32,
    /// Display gamma applied after tone mapping.
    pub inv_gamma: f32,
    pub tonemap: TonemapMode,
}

impl Default for PostProcessOptions {
    fn default() -> Self {
        Self {
            alpha: 0.45,
            damping: 0.6,
            inv_gamma: 1.0,
            tonemap: TonemapMode::Standard,
        }
    }
}

/// Renderer-level error conditions.
#[derive(Debug)]
pub enum RenderError {
    /// Settings are inconsistent (zero extent, bad portion size).
    InvalidSettings(&'static str),
    /// The scene has no camera to render from.
    NoCamera,
}

impl std::fmt::Display for RenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderError::InvalidSettings(what) => write!(f, "invalid settings: {what}"),
            RenderError::NoCamera => write!(f, "scene has no current camera"),
        }
    }
}

impl std::error::Error for RenderError {}
