//! Core type aliases and re-exports

pub use glam::{UVec2, Vec2, Vec3};

/// Standard Result type for the crate
pub type Result<T> = std::result::Result<T, crate::core::error::Error>;

/// Non-owning handle to a TOC registered with a container.
///
/// The value is the TOC's position in the container's ordered TOC list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TocId(pub usize);

impl TocId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for TocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "toc#{}", self.0)
    }
}
