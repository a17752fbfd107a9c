pub mod graph_store;
pub mod link_extraction;
pub mod link_index;
pub mod load_pipeline;
pub mod osm_parser;
pub mod overpass_fetcher;
pub mod queries;
pub mod service;
pub mod source;
pub mod street_scoring;
pub mod tile_coord;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;

pub use graph_store::{GraphStore, GraphView, MergeReport, NodeData, TileData, WayData};
pub use link_extraction::{extract_tile_links, Link, LinkChain, LinkKey, LinkMetadata};
pub use link_index::LinkIndex;
pub use load_pipeline::{BatchOutcome, RetryPolicy, TileLoadPipeline, TileState};
pub use osm_parser::{parse_overpass_json, NodeId, OverpassElements, RawNode, RawWay, WayId};
pub use overpass_fetcher::{FetchError, OverpassFetcher};
pub use queries::{approx_distance_m, approx_distance_sqr, EARTH_RADIUS_M};
pub use service::{GraphCommand, GraphHandle, GraphService, GraphSummary};
pub use source::{NoRatings, RatedSource, RatingProvider, StaticRatings, TileBatch, TileSource};
pub use street_scoring::{
    is_rating_fading, segment_score, street_color, track_score, LinkScore, StreetRating,
    MAX_STREET_RATING, NUM_CONSIDERED_RATINGS, UNRATED_COLOR,
};
pub use tile_coord::{
    viewport_to_tile_range, GeoBounds, TileCoord, TileRange, TileRangeIter, DEFAULT_ZOOM, MAX_ZOOM,
};
pub use workflow::{
    DragResult, Handle, RatingSubmission, RecorderState, SelectionState, StreetSelection,
    TrackRecorder,
};
