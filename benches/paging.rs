use criterion::{criterion_group, criterion_main, Criterion, black_box};

use quadatlas::core::{TocId, UVec2, Vec3};
use quadatlas::streaming::chunk::{prepare_write, read_framed};
use quadatlas::streaming::quadtree::{node_count, node_index, node_position};
use quadatlas::streaming::{
    Chunk, GeomChunk, LoadCandidate, LoadScheduler, Texel, TextureChunk, TextureFormat, TocKind,
};

fn bench_node_index_roundtrip(c: &mut Criterion) {
    let depth = 8;
    let count = node_count(depth);

    c.bench_function("quadtree_node_position_depth8", |b| {
        b.iter(|| {
            let mut sum = 0usize;
            for index in (0..count).step_by(97) {
                let (level, pos) = node_position(black_box(index));
                sum = sum.wrapping_add(node_index(level, pos));
            }
            black_box(sum)
        });
    });

    c.bench_function("quadtree_node_index_leaves", |b| {
        b.iter(|| {
            let mut sum = 0usize;
            for x in 0..128u32 {
                for y in 0..128u32 {
                    sum = sum.wrapping_add(node_index(7, black_box(UVec2::new(x, y))));
                }
            }
            black_box(sum)
        });
    });
}

fn bench_texture_framing(c: &mut Criterion) {
    let raw = Chunk::texture(TextureChunk::filled(64, Texel::new(10, 20, 30, 255), TextureFormat::Raw));
    let packed = Chunk::texture(TextureChunk::filled(64, Texel::new(10, 20, 30, 255), TextureFormat::Lz4));
    let raw_frame = prepare_write(&raw).expect("frame");
    let packed_frame = prepare_write(&packed).expect("frame");

    c.bench_function("texture_prepare_write_64", |b| {
        b.iter(|| black_box(prepare_write(black_box(&raw)).expect("frame")));
    });

    c.bench_function("texture_read_framed_64", |b| {
        b.iter(|| black_box(read_framed(TocKind::Texture, black_box(&raw_frame), 64).expect("read")));
    });

    c.bench_function("texture_read_framed_lz4_process_64", |b| {
        b.iter(|| {
            let mut chunk = read_framed(TocKind::Texture, black_box(&packed_frame), 64).expect("read");
            chunk.process().expect("process");
            black_box(chunk)
        });
    });
}

fn bench_geometry_framing(c: &mut Criterion) {
    let grid = GeomChunk::grid(Vec3::ZERO, 64.0, 32, |x, z| (x * 0.1).sin() * (z * 0.1).cos())
        .expect("grid");
    let chunk = Chunk::geometry(grid);
    let frame = prepare_write(&chunk).expect("frame");

    c.bench_function("geometry_prepare_write_32x32", |b| {
        b.iter(|| black_box(prepare_write(black_box(&chunk)).expect("frame")));
    });

    c.bench_function("geometry_read_framed_32x32", |b| {
        b.iter(|| black_box(read_framed(TocKind::Geometry, black_box(&frame), 64).expect("read")));
    });
}

fn bench_round_robin(c: &mut Criterion) {
    let lists: Vec<Vec<LoadCandidate>> = (0..8)
        .map(|toc| {
            (0..5)
                .map(|stub| LoadCandidate {
                    toc: TocId(toc),
                    stub,
                    kind: TocKind::Texture,
                    offset: 4096 + stub as u64 * 64,
                    length: 64,
                    priority: 5.0 - stub as f32,
                })
                .collect()
        })
        .collect();

    c.bench_function("scheduler_rebuild_and_drain_8x5", |b| {
        let mut scheduler = LoadScheduler::new();
        b.iter(|| {
            scheduler.rebuild(black_box(lists.clone()));
            let mut taken = 0;
            while scheduler.next().is_some() {
                taken += 1;
            }
            black_box(taken)
        });
    });
}

criterion_group!(
    benches,
    bench_node_index_roundtrip,
    bench_texture_framing,
    bench_geometry_framing,
    bench_round_robin,
);
criterion_main!(benches);
