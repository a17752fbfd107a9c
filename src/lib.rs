//! Tiled street graph for the Waybiker bikeability map.
//!
//! Street geometry is streamed from Overpass one batch of slippy tiles at a time,
//! merged into a reference-counted node/way graph shared across tiles, and reduced
//! to intersection-to-intersection links that users rate, select and ride along.

pub mod config;
pub mod error;
pub mod street_graph;

pub use config::{GraphConfig, RetryConfig};
pub use error::{GraphError, GraphResult};
pub use street_graph::{
    GeoBounds, GraphHandle, GraphService, GraphStore, GraphView, LinkKey, NodeId, OverpassFetcher,
    TileCoord,
};
