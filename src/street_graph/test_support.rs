//! Fixtures shared by the graph engine tests

use super::{
    FetchError, NodeId, OverpassElements, RawNode, RawWay, StreetRating, TileBatch, TileCoord,
    TileSource, WayId, DEFAULT_ZOOM,
};
use geo::Point;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

/// Tile around Montreal's Plateau, away from any grid edge
pub fn center_tile() -> TileCoord {
    TileCoord::new(19372, 23439, DEFAULT_ZOOM)
}

/// Point at fractional offsets inside `tile`; `fx` runs west to east, `fy` north to south
pub fn point_in(tile: TileCoord, fx: f64, fy: f64) -> Point<f64> {
    let (south, west, north, east) = tile.bbox();
    Point::new(west + fx * (east - west), north - fy * (north - south))
}

pub fn node(id: NodeId, tile: TileCoord, fx: f64, fy: f64) -> RawNode {
    RawNode {
        id,
        position: point_in(tile, fx, fy),
    }
}

pub fn way(id: WayId, nodes: &[NodeId]) -> RawWay {
    RawWay {
        id,
        nodes: nodes.to_vec(),
        center: None,
    }
}

pub fn elements(nodes: Vec<RawNode>, ways: Vec<RawWay>) -> OverpassElements {
    OverpassElements {
        nodes,
        ways,
        skipped: 0,
    }
}

/// Two streets crossing at node 10 in the centre tile:
///
/// ```text
///           12
///           |
///           11
///           |
///  18 - 17 - 10 - 13 - 14
///           |
///           15
///           |
///           16
/// ```
pub fn cross_world() -> OverpassElements {
    let c = center_tile();
    elements(
        vec![
            node(10, c, 0.5, 0.5),
            node(11, c, 0.5, 0.35),
            node(12, c, 0.5, 0.2),
            node(13, c, 0.65, 0.5),
            node(14, c, 0.8, 0.5),
            node(15, c, 0.5, 0.65),
            node(16, c, 0.5, 0.8),
            node(17, c, 0.35, 0.5),
            node(18, c, 0.2, 0.5),
        ],
        vec![way(100, &[12, 11, 10, 15, 16]), way(200, &[18, 17, 10, 13, 14])],
    )
}

/// What Overpass would answer for `tiles`: every way with a node inside one of
/// them, plus all nodes of those ways
pub fn batch_for(world: &OverpassElements, tiles: &[TileCoord]) -> TileBatch {
    let wanted: HashSet<TileCoord> = tiles.iter().copied().collect();
    let inside: HashSet<NodeId> = world
        .nodes
        .iter()
        .filter(|n| wanted.contains(&TileCoord::from_point(n.position, DEFAULT_ZOOM)))
        .map(|n| n.id)
        .collect();

    let ways: Vec<RawWay> = world
        .ways
        .iter()
        .filter(|w| w.nodes.iter().any(|id| inside.contains(id)))
        .cloned()
        .collect();
    let needed: HashSet<NodeId> = ways.iter().flat_map(|w| w.nodes.iter().copied()).collect();
    let nodes = world
        .nodes
        .iter()
        .filter(|n| needed.contains(&n.id))
        .cloned()
        .collect();

    TileBatch {
        elements: elements(nodes, ways),
        ratings: Vec::new(),
    }
}

/// Every element of `world`, unfiltered
pub fn world_batch(world: &OverpassElements) -> TileBatch {
    TileBatch {
        elements: world.clone(),
        ratings: Vec::new(),
    }
}

pub fn rating_for(tile: TileCoord, start: NodeId, end: NodeId, value: i16) -> StreetRating {
    StreetRating {
        start,
        end,
        rating: value,
        user_id: "tester".to_string(),
        tile_x: tile.x,
        tile_y: tile.y,
        timestamp: None,
    }
}

/// In-memory [`TileSource`] answering from a fixed world, with scripted failures
pub struct FixtureSource {
    world: OverpassElements,
    failures: Mutex<VecDeque<FetchError>>,
    requests: Mutex<Vec<Vec<TileCoord>>>,
}

impl FixtureSource {
    pub fn new(world: OverpassElements) -> Self {
        FixtureSource {
            world,
            failures: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// The next calls fail with these errors, in order
    pub fn failing_with(self, errors: impl IntoIterator<Item = FetchError>) -> Self {
        self.failures.lock().unwrap().extend(errors);
        self
    }

    /// Tile lists of every call so far
    pub fn requests(&self) -> Vec<Vec<TileCoord>> {
        self.requests.lock().unwrap().clone()
    }
}

impl TileSource for FixtureSource {
    async fn fetch_batch(&self, tiles: Vec<TileCoord>) -> Result<TileBatch, FetchError> {
        self.requests.lock().unwrap().push(tiles.clone());
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(batch_for(&self.world, &tiles))
    }
}
