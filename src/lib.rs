//! Quadatlas - background-threaded chunk paging for quadtree datasets

pub mod core;
pub mod math;
pub mod streaming;
