//! Chunk payloads and their on-disk framing
//!
//! A framed chunk is laid out as
//! `"ATSP" | u32 length | u32 head sentinel | payload[length] | u32 tail sentinel`.
//! Every payload starts with the chunk's history back-offset (u64) followed
//! by the kind-specific body.

pub mod config;
pub mod geometry;
pub mod texture;

pub use config::ConfigChunk;
pub use geometry::GeomChunk;
pub use texture::{Texel, TextureChunk, TextureFormat};

use crate::core::error::Error;
use crate::core::types::{Result, TocId};
use crate::streaming::format::FRAME_MAGIC;
use crate::streaming::registry::TocKind;

/// Bytes of framing around a payload
pub const FRAME_OVERHEAD: usize = 4 + 4 + 4 + 4;

/// Kind-specific chunk contents
#[derive(Clone, Debug, PartialEq)]
pub enum ChunkBody {
    Geometry(GeomChunk),
    Texture(TextureChunk),
    Config(ConfigChunk),
}

/// Inputs a TOC supplies when generating a parent chunk
#[derive(Clone, Copy, Debug)]
pub struct GenerateParams {
    /// Upper bound on vertices in a generated geometry chunk
    pub goal_batch_size: u32,
}

/// Payload of one stub
#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    /// Offset of the revision this chunk replaced, or 0
    pub previous_offset: u64,
    /// Owning TOC, once instated
    pub toc: Option<TocId>,
    pub body: ChunkBody,
}

impl Chunk {
    pub fn new(body: ChunkBody) -> Self {
        Self {
            previous_offset: 0,
            toc: None,
            body,
        }
    }

    pub fn geometry(chunk: GeomChunk) -> Self {
        Self::new(ChunkBody::Geometry(chunk))
    }

    pub fn texture(chunk: TextureChunk) -> Self {
        Self::new(ChunkBody::Texture(chunk))
    }

    pub fn config(chunk: ConfigChunk) -> Self {
        Self::new(ChunkBody::Config(chunk))
    }

    pub fn kind(&self) -> TocKind {
        match self.body {
            ChunkBody::Geometry(_) => TocKind::Geometry,
            ChunkBody::Texture(_) => TocKind::Texture,
            ChunkBody::Config(_) => TocKind::Config,
        }
    }

    pub fn head_sentinel(&self) -> u32 {
        self.kind().head_sentinel()
    }

    pub fn tail_sentinel(&self) -> u32 {
        self.kind().tail_sentinel()
    }

    /// Approximate resident size in bytes
    pub fn size(&self) -> usize {
        match &self.body {
            ChunkBody::Geometry(c) => c.resident_size(),
            ChunkBody::Texture(c) => c.resident_size(),
            ChunkBody::Config(c) => c.resident_size(),
        }
    }

    pub fn as_geometry(&self) -> Option<&GeomChunk> {
        match &self.body {
            ChunkBody::Geometry(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_texture(&self) -> Option<&TextureChunk> {
        match &self.body {
            ChunkBody::Texture(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_config(&self) -> Option<&ConfigChunk> {
        match &self.body {
            ChunkBody::Config(c) => Some(c),
            _ => None,
        }
    }

    /// Prepare freshly read data for use on the main thread.
    pub fn process(&mut self) -> Result<()> {
        match &mut self.body {
            ChunkBody::Geometry(c) => {
                c.process();
                Ok(())
            }
            ChunkBody::Texture(c) => c.process(),
            ChunkBody::Config(_) => Ok(()),
        }
    }

    /// Build a parent chunk of `kind` from four children given in
    /// [`CHILD_CORNERS`](crate::streaming::quadtree::CHILD_CORNERS) order.
    pub fn generate(kind: TocKind, children: [&Chunk; 4], params: &GenerateParams) -> Result<Chunk> {
        let mismatch = children.iter().find(|c| c.kind() != kind);
        if let Some(child) = mismatch {
            return Err(Error::Payload(format!(
                "cannot generate {} chunk from a {} child",
                kind,
                child.kind()
            )));
        }

        let body = match kind {
            TocKind::Geometry => {
                let kids = children.map(|c| c.as_geometry());
                let kids = collect_children(kids)?;
                ChunkBody::Geometry(GeomChunk::generate(kids, params.goal_batch_size)?)
            }
            TocKind::Texture => {
                let kids = children.map(|c| c.as_texture());
                let kids = collect_children(kids)?;
                ChunkBody::Texture(TextureChunk::generate(kids)?)
            }
            TocKind::Config => {
                return Err(Error::Payload("config chunks cannot be generated".into()));
            }
        };
        Ok(Chunk::new(body))
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(256);
        payload.extend_from_slice(&self.previous_offset.to_le_bytes());
        match &self.body {
            ChunkBody::Geometry(c) => c.write(&mut payload)?,
            ChunkBody::Texture(c) => c.write(&mut payload)?,
            ChunkBody::Config(c) => c.write(&mut payload)?,
        }
        Ok(payload)
    }

    fn decode_payload(kind: TocKind, payload: &[u8], offset: u64) -> Result<Chunk> {
        let (prev, body) = payload
            .split_first_chunk::<8>()
            .ok_or_else(|| Error::corrupt(offset, "payload shorter than its back-offset"))?;
        let previous_offset = u64::from_le_bytes(*prev);

        let body = match kind {
            TocKind::Geometry => ChunkBody::Geometry(GeomChunk::read(body, offset)?),
            TocKind::Texture => ChunkBody::Texture(TextureChunk::read(body, offset)?),
            TocKind::Config => ChunkBody::Config(ConfigChunk::read(body, offset)?),
        };
        Ok(Chunk {
            previous_offset,
            toc: None,
            body,
        })
    }
}

fn collect_children<T>(kids: [Option<&T>; 4]) -> Result<[&T; 4]> {
    match kids {
        [Some(a), Some(b), Some(c), Some(d)] => Ok([a, b, c, d]),
        _ => Err(Error::Payload("child chunk has the wrong kind".into())),
    }
}

/// Serialize `chunk` into a complete frame.
///
/// The payload is built first so its length is known before framing.
pub fn prepare_write(chunk: &Chunk) -> Result<Vec<u8>> {
    let payload = chunk.encode_payload()?;
    let length = u32::try_from(payload.len())
        .map_err(|_| Error::Payload(format!("payload of {} bytes is too large", payload.len())))?;

    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    frame.extend_from_slice(FRAME_MAGIC);
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&chunk.head_sentinel().to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&chunk.tail_sentinel().to_le_bytes());
    Ok(frame)
}

/// Parse a frame read from `offset` into a chunk of `kind`.
///
/// Magic, length and both sentinels are checked before the payload is
/// decoded. Any mismatch is reported as [`Error::CorruptChunk`].
pub fn read_framed(kind: TocKind, frame: &[u8], offset: u64) -> Result<Chunk> {
    if frame.len() < FRAME_OVERHEAD {
        return Err(Error::corrupt(offset, format!("truncated frame of {} bytes", frame.len())));
    }
    if &frame[0..4] != FRAME_MAGIC {
        return Err(Error::corrupt(offset, "bad frame magic"));
    }

    let length = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
    if frame.len() < length + FRAME_OVERHEAD {
        return Err(Error::corrupt(
            offset,
            format!("frame declares {} payload bytes but only {} were read", length, frame.len() - FRAME_OVERHEAD),
        ));
    }

    let head = u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]);
    if head != kind.head_sentinel() {
        return Err(Error::corrupt(offset, format!("head sentinel {:#010x} does not match {}", head, kind)));
    }

    let tail_at = 12 + length;
    let tail = u32::from_le_bytes([frame[tail_at], frame[tail_at + 1], frame[tail_at + 2], frame[tail_at + 3]]);
    if tail != kind.tail_sentinel() {
        return Err(Error::corrupt(offset, format!("tail sentinel {:#010x} does not match {}", tail, kind)));
    }

    Chunk::decode_payload(kind, &frame[12..tail_at], offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_texture() -> Chunk {
        let texels = (0..16).map(|i| Texel::splat(i as u8)).collect();
        let mut chunk = Chunk::texture(TextureChunk::from_texels(4, texels, TextureFormat::Raw).unwrap());
        chunk.previous_offset = 1234;
        chunk
    }

    #[test]
    fn test_frame_roundtrip_is_byte_identical() {
        let chunk = sample_texture();
        let frame = prepare_write(&chunk).unwrap();
        let read = read_framed(TocKind::Texture, &frame, 64).unwrap();
        assert_eq!(read.previous_offset, 1234);
        assert_eq!(read, chunk);
        assert_eq!(prepare_write(&read).unwrap(), frame);
    }

    #[test]
    fn test_frame_layout() {
        let frame = prepare_write(&sample_texture()).unwrap();
        assert_eq!(&frame[0..4], b"ATSP");
        let length = u32::from_le_bytes(frame[4..8].try_into().unwrap()) as usize;
        assert_eq!(frame.len(), length + FRAME_OVERHEAD);
        assert_eq!(&frame[8..12], b"atch");
        assert_eq!(&frame[frame.len() - 4..], b"attc");
    }

    #[test]
    fn test_any_sentinel_byte_flip_is_corruption() {
        let frame = prepare_write(&sample_texture()).unwrap();
        let tail = frame.len() - 4;
        let sentinel_bytes = (8..12).chain(tail..frame.len());
        for at in sentinel_bytes {
            let mut bad = frame.clone();
            bad[at] ^= 0x5a;
            let result = read_framed(TocKind::Texture, &bad, 0);
            assert!(
                matches!(result, Err(Error::CorruptChunk { .. })),
                "flipping byte {} was not detected",
                at
            );
        }
    }

    #[test]
    fn test_wrong_kind_is_corruption() {
        let frame = prepare_write(&sample_texture()).unwrap();
        let result = read_framed(TocKind::Geometry, &frame, 0);
        assert!(matches!(result, Err(Error::CorruptChunk { .. })));
    }

    #[test]
    fn test_truncated_frame_is_corruption() {
        let frame = prepare_write(&sample_texture()).unwrap();
        for len in [0, 8, FRAME_OVERHEAD, frame.len() - 1] {
            let result = read_framed(TocKind::Texture, &frame[..len], 0);
            assert!(result.unwrap_err().is_corruption(), "length {} accepted", len);
        }
    }

    #[test]
    fn test_config_cannot_generate() {
        let c = Chunk::config(ConfigChunk::new());
        let params = GenerateParams { goal_batch_size: 0 };
        let result = Chunk::generate(TocKind::Config, [&c, &c, &c, &c], &params);
        assert!(matches!(result, Err(Error::Payload(_))));
    }

    #[test]
    fn test_generate_rejects_mixed_kinds() {
        let t = sample_texture();
        let c = Chunk::config(ConfigChunk::new());
        let params = GenerateParams { goal_batch_size: 0 };
        assert!(Chunk::generate(TocKind::Texture, [&t, &t, &c, &t], &params).is_err());
    }
}
