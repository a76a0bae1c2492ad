//! Prebuilt topologies for examples, tests, and the command line.

mod triangle;
pub use triangle::{triangle, triangle_topology};

mod link_failure;
pub use link_failure::link_failure;
