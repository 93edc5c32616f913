//! Terrain mesh chunks
//!
//! Geometry payloads are archived with rkyv. Parents are built from their
//! four children by welding, then vertex-clustering the combined mesh down
//! to the TOC's goal batch size.

use std::collections::HashMap;

use rkyv::{Archive, Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::{Result, Vec2, Vec3};
use crate::math::Aabb;

/// Quadrant of the parent's texture space that each child's texture
/// coordinates are mapped into, indexed like the gathered children.
pub const TEXCOORD_CORNERS: [[u32; 2]; 4] = [
    [0, 0],
    [0, 1],
    [1, 1],
    [1, 0],
];

/// Vertices addressable by u16 indices
pub const MAX_VERTICES: usize = u16::MAX as usize + 1;

/// Finest clustering grid tried when decimating
const INITIAL_GRID: u32 = 256;

#[derive(Archive, Deserialize, Serialize)]
struct GeomChunkData {
    bounds: [f32; 6],
    positions: Vec<[f32; 3]>,
    tex_coords: Vec<[f32; 2]>,
    indices: Vec<u16>,
}

/// Indexed triangle mesh with one texture coordinate per vertex
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GeomChunk {
    pub bounds: Aabb,
    pub positions: Vec<Vec3>,
    pub tex_coords: Vec<Vec2>,
    pub indices: Vec<u16>,
}

impl GeomChunk {
    /// Build a mesh; bounds are computed from the positions.
    pub fn new(positions: Vec<Vec3>, tex_coords: Vec<Vec2>, indices: Vec<u16>) -> Result<Self> {
        let chunk = Self {
            bounds: Aabb::from_points(positions.iter().copied()),
            positions,
            tex_coords,
            indices,
        };
        chunk.validate().map_err(Error::Payload)?;
        Ok(chunk)
    }

    /// Flat grid of `cells` x `cells` quads covering `origin..origin+extent` in XZ.
    pub fn grid(origin: Vec3, extent: f32, cells: u16, height: impl Fn(f32, f32) -> f32) -> Result<Self> {
        let n = cells as u32 + 1;
        let mut positions = Vec::with_capacity((n * n) as usize);
        let mut tex_coords = Vec::with_capacity((n * n) as usize);
        for x in 0..n {
            for z in 0..n {
                let u = x as f32 / cells.max(1) as f32;
                let v = z as f32 / cells.max(1) as f32;
                let px = origin.x + u * extent;
                let pz = origin.z + v * extent;
                positions.push(Vec3::new(px, origin.y + height(px, pz), pz));
                tex_coords.push(Vec2::new(u, v));
            }
        }

        let mut indices = Vec::with_capacity(cells as usize * cells as usize * 6);
        for x in 0..cells as u32 {
            for z in 0..cells as u32 {
                let i = x * n + z;
                let quad = [i, i + n, i + 1, i + 1, i + n, i + n + 1];
                for idx in quad {
                    let idx = u16::try_from(idx).map_err(|_| Error::Payload("grid too large for u16 indices".into()))?;
                    indices.push(idx);
                }
            }
        }
        Self::new(positions, tex_coords, indices)
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Stored bounds, or bounds of the positions when none are stored
    pub fn effective_bounds(&self) -> Aabb {
        if self.bounds.is_empty() {
            Aabb::from_points(self.positions.iter().copied())
        } else {
            self.bounds
        }
    }

    pub(crate) fn resident_size(&self) -> usize {
        self.positions.len() * std::mem::size_of::<Vec3>()
            + self.tex_coords.len() * std::mem::size_of::<Vec2>()
            + self.indices.len() * 2
    }

    /// Fill in missing bounds.
    pub fn process(&mut self) {
        if self.bounds.is_empty() {
            self.bounds = Aabb::from_points(self.positions.iter().copied());
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.tex_coords.len() != self.positions.len() {
            return Err(format!(
                "{} texture coordinates for {} vertices",
                self.tex_coords.len(),
                self.positions.len()
            ));
        }
        if self.indices.len() % 3 != 0 {
            return Err(format!("index count {} is not a multiple of 3", self.indices.len()));
        }
        if let Some(&bad) = self.indices.iter().find(|&&i| i as usize >= self.positions.len()) {
            return Err(format!("index {} out of range for {} vertices", bad, self.positions.len()));
        }
        Ok(())
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        let data = GeomChunkData {
            bounds: self.bounds.to_array(),
            positions: self.positions.iter().map(|p| p.to_array()).collect(),
            tex_coords: self.tex_coords.iter().map(|t| t.to_array()).collect(),
            indices: self.indices.clone(),
        };
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&data)
            .map_err(|e| Error::Payload(e.to_string()))?;
        out.extend_from_slice(&bytes);
        Ok(())
    }

    pub(crate) fn read(body: &[u8], offset: u64) -> Result<Self> {
        // Frames land at arbitrary file offsets, so realign before access.
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(body.len());
        aligned.extend_from_slice(body);

        let archived = rkyv::access::<ArchivedGeomChunkData, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::corrupt(offset, format!("geometry archive: {}", e)))?;
        let data: GeomChunkData = rkyv::deserialize::<GeomChunkData, rkyv::rancor::Error>(archived)
            .map_err(|e| Error::corrupt(offset, format!("geometry archive: {}", e)))?;

        let chunk = Self {
            bounds: Aabb::from_array(data.bounds),
            positions: data.positions.into_iter().map(Vec3::from_array).collect(),
            tex_coords: data.tex_coords.into_iter().map(Vec2::from_array).collect(),
            indices: data.indices,
        };
        chunk.validate().map_err(|reason| Error::corrupt(offset, reason))?;
        Ok(chunk)
    }

    /// Combine four children into a parent with at most `goal_batch_size`
    /// vertices (0 means only the u16 index limit applies).
    pub fn generate(children: [&GeomChunk; 4], goal_batch_size: u32) -> Result<Self> {
        let limit = match goal_batch_size {
            0 => MAX_VERTICES,
            goal => (goal as usize).min(MAX_VERTICES),
        };

        let mut positions = Vec::new();
        let mut tex_coords = Vec::new();
        let mut triangles: Vec<[u32; 3]> = Vec::new();
        let mut bounds = Aabb::EMPTY;

        for (child, [cu, cv]) in children.iter().zip(TEXCOORD_CORNERS) {
            let base = positions.len() as u32;
            let corner = Vec2::new(cu as f32, cv as f32);
            positions.extend_from_slice(&child.positions);
            tex_coords.extend(child.tex_coords.iter().map(|&t| (t + corner) * 0.5));
            triangles.extend(
                child
                    .indices
                    .chunks_exact(3)
                    .map(|t| [base + t[0] as u32, base + t[1] as u32, base + t[2] as u32]),
            );
            bounds = bounds.merged(&child.effective_bounds());
        }

        let welded = weld(&positions, &tex_coords);
        let mut mesh = Remapped {
            positions: welded.positions.clone(),
            tex_coords: welded.tex_coords.clone(),
            remap: (0..welded.positions.len() as u32).collect(),
        };
        let mut grid = INITIAL_GRID;
        while mesh.positions.len() > limit {
            mesh = cluster(&welded, &bounds, grid);
            if grid == 1 {
                break;
            }
            grid /= 2;
        }

        let mut indices = Vec::with_capacity(triangles.len() * 3);
        for tri in &triangles {
            let [a, b, c] = tri.map(|i| mesh.remap[welded.remap[i as usize] as usize]);
            if a == b || b == c || a == c {
                continue;
            }
            for i in [a, b, c] {
                let i = u16::try_from(i)
                    .map_err(|_| Error::Payload(format!("vertex {} exceeds u16 index range", i)))?;
                indices.push(i);
            }
        }

        log::trace!(
            "generated geometry: {} -> {} vertices, {} triangles",
            positions.len(),
            mesh.positions.len(),
            indices.len() / 3
        );

        Ok(Self {
            bounds,
            positions: mesh.positions,
            tex_coords: mesh.tex_coords,
            indices,
        })
    }
}

/// Vertex set plus the mapping from input vertex to output vertex
struct Remapped {
    positions: Vec<Vec3>,
    tex_coords: Vec<Vec2>,
    remap: Vec<u32>,
}

/// Merge vertices whose position and texture coordinate are bit-identical.
fn weld(positions: &[Vec3], tex_coords: &[Vec2]) -> Remapped {
    let mut seen: HashMap<([u32; 3], [u32; 2]), u32> = HashMap::with_capacity(positions.len());
    let mut out = Remapped {
        positions: Vec::with_capacity(positions.len()),
        tex_coords: Vec::with_capacity(positions.len()),
        remap: Vec::with_capacity(positions.len()),
    };

    for (p, t) in positions.iter().zip(tex_coords) {
        let key = (p.to_array().map(f32::to_bits), t.to_array().map(f32::to_bits));
        let next = out.positions.len() as u32;
        let id = *seen.entry(key).or_insert_with(|| {
            out.positions.push(*p);
            out.tex_coords.push(*t);
            next
        });
        out.remap.push(id);
    }
    out
}

/// Collapse vertices sharing a cell of a `grid`^3 lattice over `bounds`
/// into their mean. Clusters are numbered in first-seen order.
fn cluster(mesh: &Remapped, bounds: &Aabb, grid: u32) -> Remapped {
    let extent = bounds.size().max(Vec3::splat(f32::EPSILON));
    let max_cell = (grid - 1) as f32;

    let mut ids: HashMap<[u32; 3], u32> = HashMap::new();
    let mut sums: Vec<(Vec3, Vec2, u32)> = Vec::new();
    let mut remap = Vec::with_capacity(mesh.positions.len());

    for (p, t) in mesh.positions.iter().zip(&mesh.tex_coords) {
        let cell = ((*p - bounds.min) / extent * grid as f32).floor().clamp(Vec3::ZERO, Vec3::splat(max_cell));
        let key = [cell.x as u32, cell.y as u32, cell.z as u32];
        let next = sums.len() as u32;
        let id = *ids.entry(key).or_insert_with(|| {
            sums.push((Vec3::ZERO, Vec2::ZERO, 0));
            next
        });
        let slot = &mut sums[id as usize];
        slot.0 += *p;
        slot.1 += *t;
        slot.2 += 1;
        remap.push(id);
    }

    Remapped {
        positions: sums.iter().map(|(p, _, n)| *p / *n as f32).collect(),
        tex_coords: sums.iter().map(|(_, t, n)| *t / *n as f32).collect(),
        remap,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(x: f32, z: f32, cells: u16) -> GeomChunk {
        GeomChunk::grid(Vec3::new(x, 0.0, z), 1.0, cells, |px, pz| (px * 3.0 + pz).sin()).unwrap()
    }

    fn quad_children(cells: u16) -> [GeomChunk; 4] {
        [tile(0.0, 0.0, cells), tile(0.0, 1.0, cells), tile(1.0, 1.0, cells), tile(1.0, 0.0, cells)]
    }

    #[test]
    fn test_grid_shape() {
        let g = tile(0.0, 0.0, 4);
        assert_eq!(g.vertex_count(), 25);
        assert_eq!(g.triangle_count(), 32);
        assert!(!g.bounds.is_empty());
    }

    #[test]
    fn test_payload_roundtrip() {
        let g = tile(2.0, 3.0, 3);
        let mut body = vec![0u8; 3];
        g.write(&mut body).unwrap();
        let read = GeomChunk::read(&body[3..], 0).unwrap();
        assert_eq!(read, g);
    }

    #[test]
    fn test_garbage_is_corruption() {
        let result = GeomChunk::read(&[1, 2, 3, 4, 5], 77);
        assert!(matches!(result, Err(Error::CorruptChunk { offset: 77, .. })));
    }

    #[test]
    fn test_process_fills_bounds() {
        let mut g = tile(0.0, 0.0, 2);
        let expected = g.bounds;
        g.bounds = Aabb::EMPTY;
        g.process();
        assert_eq!(g.bounds, expected);
    }

    #[test]
    fn test_generate_welds_and_unions_bounds() {
        let kids = quad_children(2);
        let parent = GeomChunk::generate([&kids[0], &kids[1], &kids[2], &kids[3]], 0).unwrap();

        let expected = kids.iter().fold(Aabb::EMPTY, |b, k| b.merged(&k.bounds));
        assert_eq!(parent.bounds, expected);
        assert_eq!(parent.triangle_count(), 4 * 8);
        assert!(parent.vertex_count() < 4 * 9);
        for t in &parent.tex_coords {
            assert!(t.x >= 0.0 && t.x <= 1.0 && t.y >= 0.0 && t.y <= 1.0);
        }
    }

    #[test]
    fn test_generate_texcoord_quadrants() {
        let kids = quad_children(1);
        let parent = GeomChunk::generate([&kids[0], &kids[1], &kids[2], &kids[3]], 0).unwrap();
        // Child 2 maps its (1, 1) corner to the parent's (1, 1).
        assert!(parent.tex_coords.iter().any(|t| *t == Vec2::new(1.0, 1.0)));
        // Child 3's origin lands at (0.5, 0.0).
        assert!(parent.tex_coords.iter().any(|t| *t == Vec2::new(0.5, 0.0)));
    }

    #[test]
    fn test_generate_respects_goal_batch_size() {
        let kids = quad_children(16);
        let parent = GeomChunk::generate([&kids[0], &kids[1], &kids[2], &kids[3]], 100).unwrap();
        assert!(parent.vertex_count() <= 100, "{} vertices", parent.vertex_count());
        assert!(parent.triangle_count() > 0);
        for tri in parent.indices.chunks_exact(3) {
            assert!(tri[0] != tri[1] && tri[1] != tri[2] && tri[0] != tri[2]);
        }
    }

    #[test]
    fn test_generate_is_deterministic() {
        let kids = quad_children(8);
        let a = GeomChunk::generate([&kids[0], &kids[1], &kids[2], &kids[3]], 50).unwrap();
        let b = GeomChunk::generate([&kids[0], &kids[1], &kids[2], &kids[3]], 50).unwrap();
        assert_eq!(a, b);
    }
}
