//! Chunk paging for quadtree datasets

pub mod format;
pub mod quadtree;
pub mod registry;
pub mod semaphore;
pub mod disk_io;
pub mod chunk;
pub mod priority;
pub mod scheduler;
pub mod stub;
pub mod toc;
pub mod chunk_loader;
pub mod container;

pub use chunk::{Chunk, ChunkBody, ConfigChunk, GenerateParams, GeomChunk, Texel, TextureChunk, TextureFormat};
pub use chunk_loader::{LoadPipeline, ReadNote};
pub use container::{Container, ContainerState};
pub use disk_io::{DeferredFile, DeferredIo, IoKind, IoQueue, IoTag};
pub use priority::{LoadReason, RequestHeader};
pub use registry::{TocKind, TocRegistry};
pub use scheduler::{LoadCandidate, LoadScheduler};
pub use stub::{Stub, StubExtra, StubState};
pub use toc::{Toc, TocStats};
