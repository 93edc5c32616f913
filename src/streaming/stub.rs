//! Always-resident descriptors of quadtree nodes

use std::io::{self, Read, Write};

use crate::core::config::HeatConfig;
use crate::core::types::UVec2;
use crate::math::Aabb;
use crate::streaming::chunk::Chunk;
use crate::streaming::format::{read_f32, read_fixed_name, read_u32, read_u64, write_fixed_name};
use crate::streaming::priority::RequestHeader;
use crate::streaming::registry::{CONFIG_NAME_LEN, TocKind};

/// Paging state of a stub's chunk
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum StubState {
    /// No chunk and no outstanding load
    #[default]
    Unloaded,
    /// Requested, waiting for the scheduler
    Pending,
    /// Disk read in flight
    Loading,
    Loaded,
}

/// Kind-specific data stored in a stub record
#[derive(Clone, Debug, Default, PartialEq)]
pub enum StubExtra {
    #[default]
    None,
    /// Geometry: bounds of the node's mesh
    Bounds(Aabb),
    /// Config: record name, empty if the slot is free
    Name(String),
}

impl StubExtra {
    fn for_kind(kind: TocKind) -> Self {
        match kind {
            TocKind::Geometry => StubExtra::Bounds(Aabb::EMPTY),
            TocKind::Texture => StubExtra::None,
            TocKind::Config => StubExtra::Name(String::new()),
        }
    }
}

/// Descriptor of one node and owner of its chunk, if loaded
#[derive(Debug, Default)]
pub struct Stub {
    pub level: u32,
    pub pos: UVec2,
    /// File offset of the latest chunk frame; 0 if never written
    pub offset: u64,
    /// Length of the frame at `offset`
    pub length: u32,
    /// Bumped on every completed chunk write
    pub generation: u32,
    /// File offset of this stub's own header record
    pub stub_offset: u64,
    pub state: StubState,
    pub priority: f32,
    pub heat: f32,
    pub requests: RequestHeader,
    pub extra: StubExtra,
    /// The frame at `offset` failed validation; cleared by the next write
    pub corrupt: bool,
    chunk: Option<Chunk>,
}

impl Stub {
    pub fn new(kind: TocKind) -> Self {
        Self {
            extra: StubExtra::for_kind(kind),
            ..Default::default()
        }
    }

    /// Bytes in the fixed-size header record for a stub of `kind`
    pub fn record_size(kind: TocKind) -> usize {
        8 + 4 + 4 + kind.stub_extra_size()
    }

    pub fn is_written(&self) -> bool {
        self.offset != 0
    }

    pub fn has_chunk(&self) -> bool {
        self.chunk.is_some()
    }

    pub fn chunk(&self) -> Option<&Chunk> {
        self.chunk.as_ref()
    }

    pub fn chunk_mut(&mut self) -> Option<&mut Chunk> {
        self.chunk.as_mut()
    }

    pub(crate) fn set_chunk(&mut self, chunk: Chunk) {
        self.chunk = Some(chunk);
    }

    pub fn bounds(&self) -> Option<Aabb> {
        match self.extra {
            StubExtra::Bounds(b) => Some(b),
            _ => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match &self.extra {
            StubExtra::Name(n) => Some(n),
            _ => None,
        }
    }

    /// Drop the chunk, if any, and return to `Unloaded`.
    pub fn purge(&mut self, heat: &HeatConfig) {
        if self.chunk.take().is_some() {
            self.heat += heat.on_purge;
        }
        self.state = StubState::Unloaded;
    }

    /// Clamp heat to the cap, then cool it by `dt` seconds.
    pub fn decay_heat(&mut self, cap: f32, dt: f32) {
        self.heat = (self.heat.min(cap) - dt).max(0.0);
    }

    /// Copy of the on-disk layout with no location, chunk or load state
    pub fn layout_copy(&self) -> Stub {
        Stub {
            level: self.level,
            pos: self.pos,
            extra: self.extra.clone(),
            ..Default::default()
        }
    }

    pub fn write_record(&self, out: &mut impl Write, kind: TocKind) -> io::Result<()> {
        out.write_all(&self.offset.to_le_bytes())?;
        out.write_all(&self.length.to_le_bytes())?;
        out.write_all(&self.generation.to_le_bytes())?;
        match (kind, &self.extra) {
            (TocKind::Geometry, StubExtra::Bounds(b)) => {
                for v in b.to_array() {
                    out.write_all(&v.to_le_bytes())?;
                }
            }
            (TocKind::Geometry, _) => {
                for v in Aabb::EMPTY.to_array() {
                    out.write_all(&v.to_le_bytes())?;
                }
            }
            (TocKind::Config, StubExtra::Name(name)) => write_fixed_name::<CONFIG_NAME_LEN>(out, name)?,
            (TocKind::Config, _) => write_fixed_name::<CONFIG_NAME_LEN>(out, "")?,
            (TocKind::Texture, _) => {}
        }
        Ok(())
    }

    pub fn read_record(input: &mut impl Read, kind: TocKind) -> io::Result<Stub> {
        let offset = read_u64(input)?;
        let length = read_u32(input)?;
        let generation = read_u32(input)?;
        let extra = match kind {
            TocKind::Geometry => {
                let mut v = [0f32; 6];
                for slot in v.iter_mut() {
                    *slot = read_f32(input)?;
                }
                StubExtra::Bounds(Aabb::from_array(v))
            }
            TocKind::Texture => StubExtra::None,
            TocKind::Config => StubExtra::Name(read_fixed_name::<CONFIG_NAME_LEN>(input)?),
        };
        Ok(Stub {
            offset,
            length,
            generation,
            extra,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Vec3;
    use std::io::Cursor;

    #[test]
    fn test_record_sizes() {
        for kind in TocKind::ALL {
            let stub = Stub::new(kind);
            let mut buf = Vec::new();
            stub.write_record(&mut buf, kind).unwrap();
            assert_eq!(buf.len(), Stub::record_size(kind), "{}", kind);
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let mut stub = Stub::new(TocKind::Geometry);
        stub.offset = 4096;
        stub.length = 77;
        stub.generation = 3;
        stub.extra = StubExtra::Bounds(Aabb::new(Vec3::ZERO, Vec3::new(1.0, 2.0, 3.0)));

        let mut buf = Vec::new();
        stub.write_record(&mut buf, TocKind::Geometry).unwrap();
        let read = Stub::read_record(&mut Cursor::new(buf), TocKind::Geometry).unwrap();
        assert_eq!(read.offset, 4096);
        assert_eq!(read.length, 77);
        assert_eq!(read.generation, 3);
        assert_eq!(read.extra, stub.extra);
    }

    #[test]
    fn test_purge_heats_only_with_chunk() {
        let heat = HeatConfig::default();
        let mut stub = Stub::new(TocKind::Config);
        stub.state = StubState::Pending;
        stub.purge(&heat);
        assert_eq!(stub.heat, 0.0);
        assert_eq!(stub.state, StubState::Unloaded);

        stub.set_chunk(Chunk::config(Default::default()));
        stub.state = StubState::Loaded;
        stub.purge(&heat);
        assert_eq!(stub.heat, heat.on_purge);
        assert!(!stub.has_chunk());
    }

    #[test]
    fn test_heat_decay() {
        let mut stub = Stub::new(TocKind::Texture);
        stub.heat = 9.0;
        stub.decay_heat(5.0, 1.5);
        assert_eq!(stub.heat, 3.5);
        stub.decay_heat(5.0, 10.0);
        assert_eq!(stub.heat, 0.0);
    }
}
