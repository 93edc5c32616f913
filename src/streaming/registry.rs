//! TOC kinds and the type-name registry used when opening containers

use std::collections::BTreeMap;

use crate::core::error::Error;
use crate::core::types::Result;
use crate::streaming::format::fourcc;

/// The closed set of dataset kinds a container can hold
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TocKind {
    Geometry,
    Texture,
    Config,
}

impl TocKind {
    pub const ALL: [TocKind; 3] = [TocKind::Geometry, TocKind::Texture, TocKind::Config];

    /// Name written into the header for TOCs of this kind by default
    pub fn default_type_name(self) -> &'static str {
        match self {
            TocKind::Geometry => "GeomTOC",
            TocKind::Texture => "TexTOC",
            TocKind::Config => "ConfigTOC",
        }
    }

    pub fn head_sentinel(self) -> u32 {
        match self {
            TocKind::Geometry => fourcc(b"agch"),
            TocKind::Texture => fourcc(b"atch"),
            TocKind::Config => fourcc(b"acch"),
        }
    }

    pub fn tail_sentinel(self) -> u32 {
        match self {
            TocKind::Geometry => fourcc(b"agct"),
            TocKind::Texture => fourcc(b"attc"),
            TocKind::Config => fourcc(b"acct"),
        }
    }

    /// Config TOCs are flat record arrays; every other kind is a quadtree.
    pub fn is_quadtree(self) -> bool {
        !matches!(self, TocKind::Config)
    }

    /// Bytes of kind-specific data following the common stub record
    pub fn stub_extra_size(self) -> usize {
        match self {
            TocKind::Geometry => 6 * 4,
            TocKind::Texture => 0,
            TocKind::Config => CONFIG_NAME_LEN,
        }
    }
}

impl std::fmt::Display for TocKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_type_name())
    }
}

/// Width of the zero-padded name field in a config stub record
pub const CONFIG_NAME_LEN: usize = 32;

/// Maps header type names to TOC kinds.
///
/// Built once at startup and passed to [`Container::open`](crate::streaming::Container::open).
#[derive(Clone, Debug)]
pub struct TocRegistry {
    kinds: BTreeMap<String, TocKind>,
}

impl Default for TocRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl TocRegistry {
    /// A registry that recognizes nothing
    pub fn empty() -> Self {
        Self {
            kinds: BTreeMap::new(),
        }
    }

    /// A registry with every kind under its default type name
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        for kind in TocKind::ALL {
            registry.register(kind.default_type_name(), kind);
        }
        registry
    }

    /// Register `name` as an alias for `kind`, replacing any earlier mapping.
    pub fn register(&mut self, name: impl Into<String>, kind: TocKind) -> &mut Self {
        self.kinds.insert(name.into(), kind);
        self
    }

    pub fn kind_of(&self, name: &str) -> Option<TocKind> {
        self.kinds.get(name).copied()
    }

    /// Like [`kind_of`](Self::kind_of), failing with `UnknownTocKind`.
    pub fn resolve(&self, name: &str) -> Result<TocKind> {
        self.kind_of(name)
            .ok_or_else(|| Error::UnknownTocKind(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_names_resolve() {
        let registry = TocRegistry::with_defaults();
        for kind in TocKind::ALL {
            assert_eq!(registry.kind_of(kind.default_type_name()), Some(kind));
        }
        assert_eq!(registry.kind_of("TerrainTOC"), None);
        assert!(matches!(registry.resolve("TerrainTOC"), Err(Error::UnknownTocKind(name)) if name == "TerrainTOC"));
    }

    #[test]
    fn test_sentinels_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for kind in TocKind::ALL {
            assert!(seen.insert(kind.head_sentinel()));
            assert!(seen.insert(kind.tail_sentinel()));
        }
    }

    #[test]
    fn test_alias_registration() {
        let mut registry = TocRegistry::empty();
        registry.register("LegacyGeom", TocKind::Geometry);
        assert_eq!(registry.kind_of("LegacyGeom"), Some(TocKind::Geometry));
        assert_eq!(registry.len(), 1);
    }
}
