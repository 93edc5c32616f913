//! Square RGBA8 image tiles

use bytemuck::{Pod, Zeroable};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::streaming::quadtree::CHILD_CORNERS;

/// One RGBA8 pixel
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Texel {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Texel {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Same value on all four channels
    pub const fn splat(v: u8) -> Self {
        Self::new(v, v, v, v)
    }

    /// Rounded per-channel mean of four texels
    pub fn average(quad: [Texel; 4]) -> Texel {
        let channels = quad.map(|t| [t.r, t.g, t.b, t.a]);
        let mut out = [0u8; 4];
        for (c, slot) in out.iter_mut().enumerate() {
            let sum: u32 = channels.iter().map(|ch| ch[c] as u32).sum();
            *slot = ((sum + 2) / 4) as u8;
        }
        Texel::new(out[0], out[1], out[2], out[3])
    }
}

/// How texels are stored on disk
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TextureFormat {
    #[default]
    Raw,
    /// LZ4 block with the decompressed size prepended
    Lz4,
}

impl TextureFormat {
    fn tag(self) -> u8 {
        match self {
            TextureFormat::Raw => 0,
            TextureFormat::Lz4 => 1,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(TextureFormat::Raw),
            1 => Some(TextureFormat::Lz4),
            _ => None,
        }
    }
}

/// A `size` x `size` tile, row-major with `x` along a row
#[derive(Clone, Debug, PartialEq)]
pub struct TextureChunk {
    size: u32,
    format: TextureFormat,
    texels: Vec<Texel>,
    /// Still-compressed storage, present until `process` runs
    packed: Option<Vec<u8>>,
}

impl TextureChunk {
    pub fn from_texels(size: u32, texels: Vec<Texel>, format: TextureFormat) -> Result<Self> {
        let expected = (size as usize) * (size as usize);
        if texels.len() != expected {
            return Err(Error::Payload(format!(
                "{}x{} tile needs {} texels, got {}",
                size,
                size,
                expected,
                texels.len()
            )));
        }
        Ok(Self {
            size,
            format,
            texels,
            packed: None,
        })
    }

    /// Tile filled with one texel
    pub fn filled(size: u32, texel: Texel, format: TextureFormat) -> Self {
        Self {
            size,
            format,
            texels: vec![texel; (size as usize) * (size as usize)],
            packed: None,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    /// False while compressed storage has not been decoded
    pub fn is_decoded(&self) -> bool {
        self.packed.is_none()
    }

    pub fn texels(&self) -> &[Texel] {
        &self.texels
    }

    pub fn texel(&self, x: u32, y: u32) -> Option<Texel> {
        if x >= self.size || y >= self.size || !self.is_decoded() {
            return None;
        }
        self.texels.get((y * self.size + x) as usize).copied()
    }

    pub(crate) fn resident_size(&self) -> usize {
        self.texels.len() * std::mem::size_of::<Texel>() + self.packed.as_ref().map_or(0, Vec::len)
    }

    /// Decode compressed storage into texels.
    pub fn process(&mut self) -> Result<()> {
        let Some(packed) = self.packed.take() else {
            return Ok(());
        };
        let raw = lz4_flex::decompress_size_prepended(&packed)
            .map_err(|e| Error::Payload(format!("LZ4 decompression failed: {}", e)))?;
        self.texels = texels_from_bytes(self.size, &raw)
            .ok_or_else(|| Error::Payload(format!("decoded tile has {} bytes", raw.len())))?;
        Ok(())
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        let data = match (&self.packed, self.format) {
            (Some(packed), _) => packed.clone(),
            (None, TextureFormat::Raw) => bytemuck::cast_slice(&self.texels).to_vec(),
            (None, TextureFormat::Lz4) => lz4_flex::compress_prepend_size(bytemuck::cast_slice(&self.texels)),
        };
        out.extend_from_slice(&self.size.to_le_bytes());
        out.push(self.format.tag());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&data);
        Ok(())
    }

    pub(crate) fn read(body: &[u8], offset: u64) -> Result<Self> {
        if body.len() < 9 {
            return Err(Error::corrupt(offset, "texture header truncated"));
        }
        let size = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        let format = TextureFormat::from_tag(body[4])
            .ok_or_else(|| Error::corrupt(offset, format!("unknown texture format {}", body[4])))?;
        let len = u32::from_le_bytes([body[5], body[6], body[7], body[8]]) as usize;
        let data = body
            .get(9..9 + len)
            .ok_or_else(|| Error::corrupt(offset, "texture data truncated"))?;

        match format {
            TextureFormat::Raw => {
                let texels = texels_from_bytes(size, data)
                    .ok_or_else(|| Error::corrupt(offset, format!("raw tile of size {} has {} bytes", size, len)))?;
                Ok(Self {
                    size,
                    format,
                    texels,
                    packed: None,
                })
            }
            TextureFormat::Lz4 => Ok(Self {
                size,
                format,
                texels: Vec::new(),
                packed: Some(data.to_vec()),
            }),
        }
    }

    /// Downsample four decoded children into one tile of the same size.
    ///
    /// Child `i` fills the quadrant at `CHILD_CORNERS[i]`, each parent texel
    /// being the rounded mean of a 2x2 block of the child.
    pub fn generate(children: [&TextureChunk; 4]) -> Result<Self> {
        let size = children[0].size;
        if size < 2 || size % 2 != 0 {
            return Err(Error::Payload(format!("cannot downsample a tile of size {}", size)));
        }
        if let Some(child) = children.iter().find(|c| c.size != size || !c.is_decoded()) {
            return Err(Error::Payload(format!(
                "child tile of size {} (decoded: {}) cannot merge into size {}",
                child.size,
                child.is_decoded(),
                size
            )));
        }

        let half = size / 2;
        let mut texels = vec![Texel::default(); (size * size) as usize];
        for (child, [cx, cy]) in children.iter().zip(CHILD_CORNERS) {
            for y in 0..half {
                for x in 0..half {
                    let at = |dx: u32, dy: u32| child.texels[((2 * y + dy) * size + 2 * x + dx) as usize];
                    let px = cx * half + x;
                    let py = cy * half + y;
                    texels[(py * size + px) as usize] = Texel::average([at(0, 0), at(1, 0), at(0, 1), at(1, 1)]);
                }
            }
        }

        Ok(Self {
            size,
            format: children[0].format,
            texels,
            packed: None,
        })
    }
}

fn texels_from_bytes(size: u32, bytes: &[u8]) -> Option<Vec<Texel>> {
    let expected = (size as usize) * (size as usize) * std::mem::size_of::<Texel>();
    if bytes.len() != expected {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| Texel::new(c[0], c[1], c[2], c[3]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_rounds() {
        let t = Texel::average([Texel::splat(0), Texel::splat(1), Texel::splat(1), Texel::splat(0)]);
        assert_eq!(t, Texel::splat(1));
        let t = Texel::average([Texel::splat(0), Texel::splat(0), Texel::splat(0), Texel::splat(1)]);
        assert_eq!(t, Texel::splat(0));
    }

    #[test]
    fn test_lz4_needs_process() {
        let tile = TextureChunk::filled(8, Texel::new(10, 20, 30, 255), TextureFormat::Lz4);
        let mut body = Vec::new();
        tile.write(&mut body).unwrap();

        let mut read = TextureChunk::read(&body, 0).unwrap();
        assert!(!read.is_decoded());
        assert_eq!(read.texel(0, 0), None);
        read.process().unwrap();
        assert_eq!(read, tile);
        assert_eq!(read.texel(7, 7), Some(Texel::new(10, 20, 30, 255)));
    }

    #[test]
    fn test_corrupt_lz4_fails_process() {
        let mut body = Vec::new();
        body.extend_from_slice(&4u32.to_le_bytes());
        body.push(1);
        body.extend_from_slice(&5u32.to_le_bytes());
        body.extend_from_slice(&[64, 0, 0, 0, 0xf0]);
        let mut read = TextureChunk::read(&body, 0).unwrap();
        assert!(read.process().is_err());
    }

    #[test]
    fn test_generate_places_quadrants() {
        let kids: Vec<TextureChunk> = (0..4)
            .map(|i| TextureChunk::filled(4, Texel::splat(i * 10), TextureFormat::Raw))
            .collect();
        let parent = TextureChunk::generate([&kids[0], &kids[1], &kids[2], &kids[3]]).unwrap();
        assert_eq!(parent.size(), 4);
        for (i, [cx, cy]) in CHILD_CORNERS.into_iter().enumerate() {
            for y in 0..2 {
                for x in 0..2 {
                    assert_eq!(parent.texel(cx * 2 + x, cy * 2 + y), Some(Texel::splat(i as u8 * 10)));
                }
            }
        }
    }

    #[test]
    fn test_generate_averages_blocks() {
        let mut texels = vec![Texel::splat(0); 4];
        texels[3] = Texel::splat(7);
        let child = TextureChunk::from_texels(2, texels, TextureFormat::Raw).unwrap();
        let parent = TextureChunk::generate([&child, &child, &child, &child]).unwrap();
        assert_eq!(parent.texel(0, 0), Some(Texel::splat(2)));
    }

    #[test]
    fn test_generate_rejects_odd_sizes() {
        let child = TextureChunk::filled(3, Texel::default(), TextureFormat::Raw);
        assert!(TextureChunk::generate([&child, &child, &child, &child]).is_err());
    }
}
