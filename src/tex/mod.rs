//! Texture storage: the packed-atlas path, the bindless table, mip
//! generation, and the CPU sampler shared by both.

mod atlas;
mod bindless;
pub mod codec;

pub use atlas::{AtlasFormat, TextureAtlas, ATLAS_PAGE_SIZE};
pub use bindless::{round_up, BindlessTable, BindlessTexture, TEXTURE_DATA_PITCH_ALIGNMENT};

use crate::color::{cocg_y_to_rgb, rgb_to_cocg_y, srgb_to_linear};
use crate::storage::SparseStorage;
use codec::BlockKind;
use glam::{Vec2, Vec4};

/// Pixel formats accepted on texture input.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TextureFormat {
    Rgba8888,
    Rgb888,
    Rg88,
    R8,
}

impl TextureFormat {
    /// Channel count of the input layout.
    pub fn channels(self) -> usize {
        match self {
            TextureFormat::Rgba8888 => 4,
            TextureFormat::Rgb888 => 3,
            TextureFormat::Rg88 => 2,
            TextureFormat::R8 => 1,
        }
    }
}

/// Caller-supplied texture description.
#[derive(Debug, Clone)]
pub struct TextureDesc<'a> {
    pub name: &'a str,
    pub format: TextureFormat,
    pub data: &'a [u8],
    pub w: u32,
    pub h: u32,
    pub is_srgb: bool,
    pub is_normalmap: bool,
    pub generate_mipmaps: bool,
    pub force_no_compression: bool,
}

/// Opaque 32-bit texture handle. In bindless mode it packs
/// `(slot << 8) | flags`; in atlas mode it is a plain sparse index.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u32);

impl TextureHandle {
    /// Sentinel returned on validation or allocation failure.
    pub const INVALID: Self = Self(u32::MAX);

    /// Whether this handle refers to a texture.
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// sRGB content flag in a bindless handle.
pub const TEX_SRGB_BIT: u32 = 0x01;
/// Normal-map Z reconstruction flag in a bindless handle.
pub const TEX_RECONSTRUCT_Z_BIT: u32 = 0x02;
/// YCoCg-encoded color flag in a bindless handle.
pub const TEX_YCOCG_BIT: u32 = 0x04;

/// Atlas-record bit stealing, matching the packed 16-bit fields.
pub const ATLAS_TEX_SRGB_BIT: u32 = 0x8000;
pub const ATLAS_TEX_RECONSTRUCT_Z_BIT: u32 = 0x4000;
pub const ATLAS_TEX_WIDTH_BITS: u32 = 0x3fff;
pub const ATLAS_TEX_MIPS_BIT: u32 = 0x8000;
pub const ATLAS_TEX_HEIGHT_BITS: u32 = 0x7fff;

/// Mip slots in an atlas texture record.
pub const NUM_MIP_LEVELS: usize = 14;
/// Textures at or below this size skip mip generation.
const MIN_ATLAS_TEXTURE_SIZE: u32 = 4;
/// Source blue below this marks a normal map as needing Z reconstruction.
const RECONSTRUCT_Z_THRESHOLD: u8 = 250;

/// Per-texture record of the packed-atlas path.
#[derive(Debug, Clone)]
pub struct AtlasTexture {
    /// Which of the seven atlases holds the texels.
    pub atlas: u32,
    /// Width with `ATLAS_TEX_SRGB_BIT` / `ATLAS_TEX_RECONSTRUCT_Z_BIT` stolen.
    pub width: u32,
    /// Height with `ATLAS_TEX_MIPS_BIT` stolen.
    pub height: u32,
    /// Page per mip level.
    pub page: [u8; NUM_MIP_LEVELS],
    /// Position per mip level.
    pub pos: [[u16; 2]; NUM_MIP_LEVELS],
    /// Populated mip count.
    pub mip_count: u32,
}

impl AtlasTexture {
    /// Texel width.
    pub fn w(&self) -> u32 {
        self.width & ATLAS_TEX_WIDTH_BITS
    }

    /// Texel height.
    pub fn h(&self) -> u32 {
        self.height & ATLAS_TEX_HEIGHT_BITS
    }
}

/// Fixed atlas choice table keyed by (format, normal map, compression).
fn choose_atlas(format: TextureFormat, is_normalmap: bool, compress: bool) -> u32 {
    if is_normalmap {
        return if compress { 6 } else { 2 };
    }
    match format {
        TextureFormat::Rgba8888 => 0,
        TextureFormat::Rgb888 => {
            if compress {
                4
            } else {
                1
            }
        }
        TextureFormat::Rg88 => {
            if compress {
                6
            } else {
                2
            }
        }
        TextureFormat::R8 => {
            if compress {
                5
            } else {
                3
            }
        }
    }
}

/// Repack an RGB(A) normal map to two channels, reporting whether any
/// source blue fell below the reconstruction threshold.
fn repack_normalmap(data: &[u8], channels: usize, count: usize) -> (Vec<u8>, bool) {
    let mut out = Vec::with_capacity(count * 2);
    let mut reconstruct_z = false;
    for i in 0..count {
        out.push(data[i * channels]);
        out.push(data[i * channels + 1]);
        if channels >= 3 {
            reconstruct_z |= data[i * channels + 2] < RECONSTRUCT_Z_THRESHOLD;
        }
    }
    (out, reconstruct_z)
}

/// 2x2 box-filter downsample with clamp-to-edge.
fn downsample_2x2(src: &[u8], w: u32, h: u32, channels: usize) -> (Vec<u8>, u32, u32) {
    let dw = (w / 2).max(1);
    let dh = (h / 2).max(1);
    let mut out = vec![0u8; (dw * dh) as usize * channels];
    for y in 0..dh {
        for x in 0..dw {
            for c in 0..channels {
                let fetch = |sx: u32, sy: u32| {
                    src[((sy.min(h - 1) * w + sx.min(w - 1)) as usize) * channels + c] as u32
                };
                let sum = fetch(2 * x, 2 * y)
                    + fetch(2 * x + 1, 2 * y)
                    + fetch(2 * x, 2 * y + 1)
                    + fetch(2 * x + 1, 2 * y + 1);
                out[((y * dw + x) as usize) * channels + c] = (sum / 4) as u8;
            }
        }
    }
    (out, dw, dh)
}

fn mip_chain_len(w: u32, h: u32) -> u32 {
    let mut count = 1;
    let (mut w, mut h) = (w, h);
    while w.min(h) > MIN_ATLAS_TEXTURE_SIZE && (count as usize) < NUM_MIP_LEVELS {
        w = (w / 2).max(1);
        h = (h / 2).max(1);
        count += 1;
    }
    count
}

enum Mode {
    Atlas {
        atlases: [TextureAtlas; 7],
        textures: SparseStorage<AtlasTexture>,
        /// Raw texels retained until deferred mip generation runs.
        pending_mips: Vec<(u32, Vec<u8>, usize)>,
    },
    Bindless {
        table: BindlessTable,
    },
}

/// Texture storage facade over the atlas and bindless paths.
pub struct TextureStorage {
    mode: Mode,
    use_compression: bool,
}

impl TextureStorage {
    /// Create storage in atlas or bindless mode.
    pub fn new(use_bindless: bool, use_compression: bool) -> Self {
        let mode = if use_bindless {
            Mode::Bindless {
                table: BindlessTable::default(),
            }
        } else {
            Mode::Atlas {
                atlases: [
                    TextureAtlas::new(AtlasFormat::Rgba8),
                    TextureAtlas::new(AtlasFormat::Rgb8),
                    TextureAtlas::new(AtlasFormat::Rg8),
                    TextureAtlas::new(AtlasFormat::R8),
                    TextureAtlas::new(AtlasFormat::Bc3),
                    TextureAtlas::new(AtlasFormat::Bc4),
                    TextureAtlas::new(AtlasFormat::Bc5),
                ],
                textures: SparseStorage::default(),
                pending_mips: Vec::new(),
            }
        };
        Self {
            mode,
            use_compression,
        }
    }

    /// Whether the bindless path is active.
    pub fn is_bindless(&self) -> bool {
        matches!(self.mode, Mode::Bindless { .. })
    }

    /// Add a texture; returns `TextureHandle::INVALID` on failure.
    pub fn add(&mut self, desc: &TextureDesc) -> TextureHandle {
        let expected = (desc.w as usize) * (desc.h as usize) * desc.format.channels();
        if desc.w == 0 || desc.h == 0 || desc.data.len() < expected {
            log::warn!("texture '{}' has inconsistent dimensions", desc.name);
            return TextureHandle::INVALID;
        }
        let compress = self.use_compression && !desc.force_no_compression;
        match &mut self.mode {
            Mode::Atlas {
                atlases,
                textures,
                pending_mips,
            } => add_atlas_texture(atlases, textures, pending_mips, desc, compress),
            Mode::Bindless { table } => add_bindless_texture(table, desc, compress),
        }
    }

    /// Remove a texture, returning the owned backing record so callers
    /// can defer its destruction past the in-flight horizon. Unknown
    /// handles are ignored.
    pub fn remove(&mut self, handle: TextureHandle) -> Option<Box<dyn std::any::Any + Send + Sync>> {
        if !handle.is_valid() {
            return None;
        }
        match &mut self.mode {
            Mode::Atlas { textures, .. } => textures
                .erase(handle.0)
                .map(|t| Box::new(t) as Box<dyn std::any::Any + Send + Sync>),
            Mode::Bindless { table } => table
                .erase(handle.0 >> 8)
                .map(|t| Box::new(t) as Box<dyn std::any::Any + Send + Sync>),
        }
    }

    /// Base-level dimensions of a texture.
    pub fn dims(&self, handle: TextureHandle) -> Option<(u32, u32)> {
        match &self.mode {
            Mode::Atlas { textures, .. } => textures.get(handle.0).map(|t| (t.w(), t.h())),
            Mode::Bindless { table } => table.get(handle.0 >> 8).map(|t| (t.w, t.h)),
        }
    }

    /// Whether the sampler must reconstruct the normal Z channel.
    pub fn has_reconstruct_z(&self, handle: TextureHandle) -> bool {
        match &self.mode {
            Mode::Atlas { textures, .. } => textures
                .get(handle.0)
                .map_or(false, |t| t.width & ATLAS_TEX_RECONSTRUCT_Z_BIT != 0),
            Mode::Bindless { .. } => handle.0 & TEX_RECONSTRUCT_Z_BIT != 0,
        }
    }

    /// Fetch a base-level texel as raw bytes (no color-space conversion),
    /// used by the environment importance builder on RGBE data.
    pub fn fetch_base(&self, handle: TextureHandle, x: u32, y: u32) -> [u8; 4] {
        match &self.mode {
            Mode::Atlas {
                atlases, textures, ..
            } => {
                let Some(t) = textures.get(handle.0) else {
                    return [0; 4];
                };
                let x = x.min(t.w() - 1);
                let y = y.min(t.h() - 1);
                atlases[t.atlas as usize].fetch(
                    t.page[0] as u32,
                    t.pos[0][0] as u32 + x,
                    t.pos[0][1] as u32 + y,
                )
            }
            Mode::Bindless { table } => table
                .get(handle.0 >> 8)
                .map_or([0; 4], |t| t.fetch(0, x, y)),
        }
    }

    /// Bilinear sample with repeat addressing; returns linear RGBA. A
    /// zero vector comes back for invalid handles so downstream shading
    /// stays benign.
    pub fn sample(&self, handle: TextureHandle, uv: Vec2) -> Vec4 {
        let Some((w, h)) = self.dims(handle) else {
            return Vec4::ZERO;
        };
        let fx = (uv.x.rem_euclid(1.0)) * w as f32 - 0.5;
        let fy = (uv.y.rem_euclid(1.0)) * h as f32 - 0.5;
        let x0 = fx.floor();
        let y0 = fy.floor();
        let tx = fx - x0;
        let ty = fy - y0;
        let wrap = |v: f32, n: u32| ((v as i64).rem_euclid(n as i64)) as u32;

        let mut acc = Vec4::ZERO;
        for (dx, dy, wgt) in [
            (0.0, 0.0, (1.0 - tx) * (1.0 - ty)),
            (1.0, 0.0, tx * (1.0 - ty)),
            (0.0, 1.0, (1.0 - tx) * ty),
            (1.0, 1.0, tx * ty),
        ] {
            let t = self.texel_linear(handle, wrap(x0 + dx, w), wrap(y0 + dy, h));
            acc += t * wgt;
        }
        acc
    }

    fn texel_linear(&self, handle: TextureHandle, x: u32, y: u32) -> Vec4 {
        let raw = self.fetch_base(handle, x, y);
        let (srgb, ycocg) = match &self.mode {
            Mode::Atlas { textures, .. } => {
                let t = textures.get(handle.0);
                (
                    t.map_or(false, |t| t.width & ATLAS_TEX_SRGB_BIT != 0),
                    t.map_or(false, |t| t.atlas == 4),
                )
            }
            Mode::Bindless { .. } => (
                handle.0 & TEX_SRGB_BIT != 0,
                handle.0 & TEX_YCOCG_BIT != 0,
            ),
        };
        let rgba = if ycocg {
            let rgb = cocg_y_to_rgb(raw);
            [rgb[0], rgb[1], rgb[2], 255]
        } else {
            raw
        };
        let mut v = Vec4::new(
            rgba[0] as f32 / 255.0,
            rgba[1] as f32 / 255.0,
            rgba[2] as f32 / 255.0,
            rgba[3] as f32 / 255.0,
        );
        if srgb {
            v.x = srgb_to_linear(v.x);
            v.y = srgb_to_linear(v.y);
            v.z = srgb_to_linear(v.z);
        }
        v
    }

    /// Generate the mip chains deferred at add time.
    pub fn generate_mips(&mut self) {
        match &mut self.mode {
            Mode::Atlas {
                atlases,
                textures,
                pending_mips,
            } => {
                for (index, data, channels) in pending_mips.drain(..) {
                    let Some(t) = textures.get(index) else {
                        continue;
                    };
                    let (atlas_idx, w, h) = (t.atlas as usize, t.w(), t.h());
                    let chain = mip_chain_len(w, h);
                    let mut cur = data;
                    let (mut cw, mut ch) = (w, h);
                    let mut pages = t.page;
                    let mut pos = t.pos;
                    let mut level = 1usize;
                    while (level as u32) < chain {
                        let (next, nw, nh) = downsample_2x2(&cur, cw, ch, channels);
                        match atlases[atlas_idx].allocate(&next, nw, nh) {
                            Some((page, x, y)) => {
                                pages[level] = page as u8;
                                pos[level] = [x as u16, y as u16];
                            }
                            None => break,
                        }
                        cur = next;
                        cw = nw;
                        ch = nh;
                        level += 1;
                    }
                    if let Some(t) = textures.get_mut(index) {
                        t.page = pages;
                        t.pos = pos;
                        t.mip_count = level as u32;
                    }
                }
            }
            Mode::Bindless { table } => {
                let slots: Vec<u32> = table.iter().map(|(i, _)| i).collect();
                for slot in slots {
                    let Some(t) = table.get_mut(slot) else { continue };
                    if t.block.is_some() || t.mips.len() > 1 {
                        continue;
                    }
                    let chain = mip_chain_len(t.w, t.h);
                    let channels = t.channels;
                    let (mut cw, mut ch) = (t.w, t.h);
                    while (t.mips.len() as u32) < chain {
                        let (next, nw, nh) = downsample_2x2(t.mips.last().unwrap(), cw, ch, channels);
                        t.mips.push(next);
                        cw = nw;
                        ch = nh;
                    }
                }
            }
        }
    }

    /// Number of live textures.
    pub fn len(&self) -> usize {
        match &self.mode {
            Mode::Atlas { textures, .. } => textures.len(),
            Mode::Bindless { table } => table.len(),
        }
    }

    /// Borrow the bindless table, if that path is active.
    pub fn bindless_table(&self) -> Option<&BindlessTable> {
        match &self.mode {
            Mode::Bindless { table } => Some(table),
            Mode::Atlas { .. } => None,
        }
    }

    /// Per-atlas page counts, for logging.
    pub fn atlas_page_counts(&self) -> [usize; 7] {
        match &self.mode {
            Mode::Atlas { atlases, .. } => {
                let mut out = [0; 7];
                for (i, a) in atlases.iter().enumerate() {
                    out[i] = a.page_count();
                }
                out
            }
            Mode::Bindless { .. } => [0; 7],
        }
    }
}

fn add_atlas_texture(
    atlases: &mut [TextureAtlas; 7],
    textures: &mut SparseStorage<AtlasTexture>,
    pending_mips: &mut Vec<(u32, Vec<u8>, usize)>,
    desc: &TextureDesc,
    compress: bool,
) -> TextureHandle {
    let count = (desc.w * desc.h) as usize;
    let mut reconstruct_z = false;

    let (payload, channels): (Vec<u8>, usize) = if desc.is_normalmap {
        let (rg, rz) = repack_normalmap(desc.data, desc.format.channels(), count);
        reconstruct_z = rz;
        (rg, 2)
    } else if desc.format == TextureFormat::Rgb888 && compress {
        // BC3 stores CoCg in RG and luma in alpha.
        let mut out = Vec::with_capacity(count * 4);
        for i in 0..count {
            let t = rgb_to_cocg_y([
                desc.data[i * 3],
                desc.data[i * 3 + 1],
                desc.data[i * 3 + 2],
            ]);
            out.extend_from_slice(&t);
        }
        (out, 4)
    } else {
        (
            desc.data[..count * desc.format.channels()].to_vec(),
            desc.format.channels(),
        )
    };

    let atlas_idx = choose_atlas(desc.format, desc.is_normalmap, compress);
    let Some((page, x, y)) = atlases[atlas_idx as usize].allocate(&payload, desc.w, desc.h) else {
        log::warn!("atlas allocation failed for texture '{}'", desc.name);
        return TextureHandle::INVALID;
    };

    let mut width = desc.w;
    if desc.is_srgb {
        width |= ATLAS_TEX_SRGB_BIT;
    }
    if reconstruct_z {
        width |= ATLAS_TEX_RECONSTRUCT_Z_BIT;
    }
    let mut height = desc.h;
    let wants_mips = desc.generate_mipmaps
        && desc.w > MIN_ATLAS_TEXTURE_SIZE
        && desc.h > MIN_ATLAS_TEXTURE_SIZE;
    if wants_mips {
        height |= ATLAS_TEX_MIPS_BIT;
    }

    // Unpopulated mip slots point at the base level until generation runs.
    let t = AtlasTexture {
        atlas: atlas_idx,
        width,
        height,
        page: [page as u8; NUM_MIP_LEVELS],
        pos: [[x as u16, y as u16]; NUM_MIP_LEVELS],
        mip_count: 1,
    };
    let index = textures.push(t);

    if wants_mips {
        pending_mips.push((index, payload, channels));
    }

    log::info!(
        "texture '{}' loaded (atlas = {}, {}x{})",
        desc.name,
        atlas_idx,
        desc.w,
        desc.h
    );
    TextureHandle(index)
}

fn add_bindless_texture(table: &mut BindlessTable, desc: &TextureDesc, compress: bool) -> TextureHandle {
    let count = (desc.w * desc.h) as usize;
    let mut flags = 0u32;
    let mut block = None;

    let (payload, channels): (Vec<u8>, usize) = if desc.is_normalmap {
        let (rg, rz) = repack_normalmap(desc.data, desc.format.channels(), count);
        if rz {
            flags |= TEX_RECONSTRUCT_Z_BIT;
        }
        if compress {
            block = Some(BlockKind::Bc5);
        }
        (rg, 2)
    } else {
        match desc.format {
            TextureFormat::Rgba8888 => (desc.data[..count * 4].to_vec(), 4),
            TextureFormat::Rgb888 => {
                if compress {
                    flags |= TEX_YCOCG_BIT;
                    block = Some(BlockKind::Bc3);
                    let mut out = Vec::with_capacity(count * 4);
                    for i in 0..count {
                        out.extend_from_slice(&rgb_to_cocg_y([
                            desc.data[i * 3],
                            desc.data[i * 3 + 1],
                            desc.data[i * 3 + 2],
                        ]));
                    }
                    (out, 4)
                } else {
                    (desc.data[..count * 3].to_vec(), 3)
                }
            }
            TextureFormat::Rg88 => {
                if compress {
                    block = Some(BlockKind::Bc5);
                }
                (desc.data[..count * 2].to_vec(), 2)
            }
            TextureFormat::R8 => {
                if compress {
                    block = Some(BlockKind::Bc4);
                }
                (desc.data[..count].to_vec(), 1)
            }
        }
    };
    if desc.is_srgb {
        flags |= TEX_SRGB_BIT;
    }

    // Compressed data cannot be resampled later, so the chain is built now.
    let mips = if let Some(kind) = block {
        let chain = if desc.generate_mipmaps {
            mip_chain_len(desc.w, desc.h)
        } else {
            1
        };
        let mut raw = payload;
        let (mut w, mut h) = (desc.w, desc.h);
        let mut mips = Vec::with_capacity(chain as usize);
        for level in 0..chain {
            if level > 0 {
                let (next, nw, nh) = downsample_2x2(&raw, w, h, channels);
                raw = next;
                w = nw;
                h = nh;
            }
            mips.push(match kind {
                BlockKind::Bc3 => codec::compress_bc3(&raw, w, h),
                BlockKind::Bc4 => codec::compress_bc4(&raw, w, h, 1),
                BlockKind::Bc5 => codec::compress_bc5(&raw, w, h, 2),
            });
        }
        mips
    } else {
        vec![payload]
    };

    let slot = table.push(BindlessTexture {
        w: desc.w,
        h: desc.h,
        channels,
        block,
        mips,
    });
    debug_assert!(slot <= 0x00ff_ffff);
    log::info!("texture '{}' loaded ({}x{})", desc.name, desc.w, desc.h);
    TextureHandle((slot << 8) | flags)
}
