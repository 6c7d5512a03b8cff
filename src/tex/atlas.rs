//! Packed texture atlases: fixed-size pages with a skyline bin-pack.

use super::codec::{self, BlockKind};

/// Page resolution of every atlas.
pub const ATLAS_PAGE_SIZE: u32 = 4096;

/// Storage formats of the seven scene atlases.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AtlasFormat {
    Rgba8,
    Rgb8,
    Rg8,
    R8,
    Bc3,
    Bc4,
    Bc5,
}

impl AtlasFormat {
    /// Channel count of the raw texel layout this atlas accepts.
    pub fn channels(self) -> usize {
        match self {
            AtlasFormat::Rgba8 | AtlasFormat::Bc3 => 4,
            AtlasFormat::Rgb8 => 3,
            AtlasFormat::Rg8 | AtlasFormat::Bc5 => 2,
            AtlasFormat::R8 | AtlasFormat::Bc4 => 1,
        }
    }

    fn block_kind(self) -> Option<BlockKind> {
        match self {
            AtlasFormat::Bc3 => Some(BlockKind::Bc3),
            AtlasFormat::Bc4 => Some(BlockKind::Bc4),
            AtlasFormat::Bc5 => Some(BlockKind::Bc5),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SkylineNode {
    x: u32,
    y: u32,
    w: u32,
}

#[derive(Debug)]
struct AtlasPage {
    skyline: Vec<SkylineNode>,
    data: Vec<u8>,
}

impl AtlasPage {
    fn new(format: AtlasFormat, res: u32) -> Self {
        let data = match format.block_kind() {
            Some(kind) => vec![0u8; codec::required_size(res, res, kind.block_size())],
            None => vec![0u8; (res * res) as usize * format.channels()],
        };
        Self {
            skyline: vec![SkylineNode { x: 0, y: 0, w: res }],
            data,
        }
    }

    /// Lowest-then-leftmost skyline fit for a `w`x`h` rectangle.
    fn find(&self, res: u32, w: u32, h: u32) -> Option<(usize, u32, u32)> {
        let mut best: Option<(usize, u32, u32)> = None;
        for i in 0..self.skyline.len() {
            let x = self.skyline[i].x;
            if x + w > res {
                continue;
            }
            let mut y = 0;
            let mut covered = 0;
            let mut j = i;
            while covered < w {
                let Some(node) = self.skyline.get(j) else {
                    covered = 0;
                    break;
                };
                y = y.max(node.y);
                covered = node.x + node.w - x;
                j += 1;
            }
            if covered < w || y + h > res {
                continue;
            }
            if best.map_or(true, |(_, _, by)| y < by) {
                best = Some((i, x, y));
            }
        }
        best
    }

    fn place(&mut self, i: usize, x: u32, y: u32, w: u32, h: u32) {
        let new_node = SkylineNode { x, y: y + h, w };
        self.skyline.insert(i, new_node);
        // Shrink or drop the nodes shadowed by the new span.
        let end = x + w;
        let mut j = i + 1;
        while j < self.skyline.len() {
            let node = self.skyline[j];
            if node.x >= end {
                break;
            }
            if node.x + node.w <= end {
                self.skyline.remove(j);
            } else {
                self.skyline[j].w = node.x + node.w - end;
                self.skyline[j].x = end;
                break;
            }
        }
        // Merge runs of equal height.
        let mut j = 0;
        while j + 1 < self.skyline.len() {
            if self.skyline[j].y == self.skyline[j + 1].y {
                self.skyline[j].w += self.skyline[j + 1].w;
                self.skyline.remove(j + 1);
            } else {
                j += 1;
            }
        }
    }

    fn write_raw(&mut self, res: u32, channels: usize, x: u32, y: u32, w: u32, h: u32, src: &[u8]) {
        for row in 0..h {
            let dst = (((y + row) * res + x) as usize) * channels;
            let s = ((row * w) as usize) * channels;
            self.data[dst..dst + w as usize * channels]
                .copy_from_slice(&src[s..s + w as usize * channels]);
        }
    }

    fn write_blocks(&mut self, res: u32, kind: BlockKind, x: u32, y: u32, w: u32, h: u32, src: &[u8]) {
        let bs = kind.block_size();
        let page_bw = codec::blocks_wide(res) as usize;
        let src_bw = codec::blocks_wide(w) as usize;
        for brow in 0..codec::blocks_wide(h.max(1)) as usize {
            let dst = ((y as usize / 4 + brow) * page_bw + x as usize / 4) * bs;
            let s = brow * src_bw * bs;
            self.data[dst..dst + src_bw * bs].copy_from_slice(&src[s..s + src_bw * bs]);
        }
    }
}

/// One atlas: an append-only array of pages sharing a format.
#[derive(Debug)]
pub struct TextureAtlas {
    format: AtlasFormat,
    res: u32,
    pages: Vec<AtlasPage>,
}

impl TextureAtlas {
    /// Create an empty atlas.
    pub fn new(format: AtlasFormat) -> Self {
        Self {
            format,
            res: ATLAS_PAGE_SIZE,
            pages: Vec::new(),
        }
    }

    /// Storage format of this atlas.
    pub fn format(&self) -> AtlasFormat {
        self.format
    }

    /// Number of pages allocated so far.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Allocate and fill a `w`x`h` region; `data` is in this atlas's raw
    /// channel layout. Compressed atlases encode on the way in and align
    /// placements to the 4x4 block grid. Returns `(page, x, y)`.
    pub fn allocate(&mut self, data: &[u8], w: u32, h: u32) -> Option<(u32, u32, u32)> {
        if w == 0 || h == 0 || w > self.res || h > self.res {
            return None;
        }
        // Guard band of one texel (one block for BC) against bleed.
        let (aw, ah) = match self.format.block_kind() {
            Some(_) => (((w + 3) / 4) * 4 + 4, ((h + 3) / 4) * 4 + 4),
            None => (w + 2, h + 2),
        };
        if aw > self.res || ah > self.res {
            return None;
        }

        let mut slot = None;
        for (pi, page) in self.pages.iter().enumerate() {
            if let Some((i, x, y)) = page.find(self.res, aw, ah) {
                slot = Some((pi, i, x, y));
                break;
            }
        }
        let (pi, i, x, y) = match slot {
            Some(s) => s,
            None => {
                self.pages.push(AtlasPage::new(self.format, self.res));
                let pi = self.pages.len() - 1;
                let (i, x, y) = self.pages[pi].find(self.res, aw, ah)?;
                (pi, i, x, y)
            }
        };

        let page = &mut self.pages[pi];
        page.place(i, x, y, aw, ah);
        let (px, py) = match self.format.block_kind() {
            Some(kind) => {
                let (bx, by) = (((x + 3) / 4) * 4, ((y + 3) / 4) * 4);
                let blocks = match kind {
                    BlockKind::Bc3 => codec::compress_bc3(data, w, h),
                    BlockKind::Bc4 => codec::compress_bc4(data, w, h, 1),
                    BlockKind::Bc5 => codec::compress_bc5(data, w, h, 2),
                };
                page.write_blocks(self.res, kind, bx, by, w, h, &blocks);
                (bx, by)
            }
            None => {
                let channels = self.format.channels();
                page.write_raw(self.res, channels, x + 1, y + 1, w, h, data);
                (x + 1, y + 1)
            }
        };
        Some((pi as u32, px, py))
    }

    /// Fetch one texel as RGBA bytes; missing channels read as 0 (alpha 255).
    pub fn fetch(&self, page: u32, x: u32, y: u32) -> [u8; 4] {
        let Some(page) = self.pages.get(page as usize) else {
            return [0, 0, 0, 255];
        };
        let x = x.min(self.res - 1);
        let y = y.min(self.res - 1);
        match self.format.block_kind() {
            Some(kind) => codec::fetch_compressed(kind, &page.data, self.res, x, y),
            None => {
                let c = self.format.channels();
                let base = ((y * self.res + x) as usize) * c;
                let mut out = [0, 0, 0, 255];
                out[..c.min(4)].copy_from_slice(&page.data[base..base + c.min(4)]);
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_do_not_overlap_and_roundtrip() {
        let mut atlas = TextureAtlas::new(AtlasFormat::Rg8);
        let mut placements = Vec::new();
        for k in 0..12u8 {
            let (w, h) = (40 + k as u32 * 13, 25 + k as u32 * 7);
            let data: Vec<u8> = (0..(w * h * 2)).map(|i| (i as u8).wrapping_add(k)).collect();
            let (page, x, y) = atlas.allocate(&data, w, h).unwrap();
            placements.push((page, x, y, w, h, data));
        }
        for (page, x, y, w, h, data) in &placements {
            for (sx, sy) in [(0, 0), (w / 2, h / 2), (w - 1, h - 1)] {
                let t = atlas.fetch(*page, x + sx, y + sy);
                let base = ((sy * w + sx) as usize) * 2;
                assert_eq!(t[0], data[base]);
                assert_eq!(t[1], data[base + 1]);
            }
        }
    }

    #[test]
    fn full_page_appends_a_new_one() {
        let mut atlas = TextureAtlas::new(AtlasFormat::R8);
        let big = ATLAS_PAGE_SIZE - 2;
        let data = vec![7u8; (big * big) as usize];
        let (p0, _, _) = atlas.allocate(&data, big, big).unwrap();
        let (p1, _, _) = atlas.allocate(&data[..100 * 100], 100, 100).unwrap();
        assert_eq!(p0, 0);
        assert_eq!(p1, 1);
        assert_eq!(atlas.page_count(), 2);
    }

    #[test]
    fn compressed_atlas_is_block_aligned() {
        let mut atlas = TextureAtlas::new(AtlasFormat::Bc4);
        let data = vec![128u8; 30 * 30];
        let (_, x, y) = atlas.allocate(&data, 30, 30).unwrap();
        assert_eq!(x % 4, 0);
        assert_eq!(y % 4, 0);
        let t = atlas.fetch(0, x + 3, y + 3);
        assert!((t[0] as i32 - 128).abs() <= 4);
    }

    #[test]
    fn oversized_request_fails() {
        let mut atlas = TextureAtlas::new(AtlasFormat::R8);
        assert!(atlas
            .allocate(&[0], ATLAS_PAGE_SIZE + 1, 1)
            .is_none());
    }
}
