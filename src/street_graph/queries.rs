use super::{GraphView, LinkIndex, LinkKey, NodeId, TileCoord};
use geo::Point;
use std::collections::{HashMap, HashSet, VecDeque};

/// Mean Earth radius used by the equirectangular approximation
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Squared angular distance (radians²) under the equirectangular approximation.
///
/// Only meant for ranking candidates at city scale; monotonic in true distance there.
pub fn approx_distance_sqr(a: Point<f64>, b: Point<f64>) -> f64 {
    let mean_lat = ((a.y() + b.y()) / 2.0).to_radians();
    let dx = (b.x() - a.x()).to_radians() * mean_lat.cos();
    let dy = (b.y() - a.y()).to_radians();
    dx * dx + dy * dy
}

/// Approximate distance in meters
pub fn approx_distance_m(a: Point<f64>, b: Point<f64>) -> f64 {
    approx_distance_sqr(a, b).sqrt() * EARTH_RADIUS_M
}

impl<'a> GraphView<'a> {
    /// Closest candidate to `point`. Candidates missing from the graph are ignored;
    /// ties go to the earliest candidate.
    pub fn find_nearest_node(
        &self,
        point: Point<f64>,
        candidates: impl IntoIterator<Item = NodeId>,
    ) -> Option<NodeId> {
        let mut best: Option<(NodeId, f64)> = None;

        for id in candidates {
            let Some(node) = self.node(id) else { continue };
            let distance = approx_distance_sqr(point, node.position);
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((id, distance));
            }
        }

        best.map(|(id, _)| id)
    }

    /// Closest node of the whole graph
    pub fn find_nearest_node_anywhere(&self, point: Point<f64>) -> Option<NodeId> {
        self.find_nearest_node(point, self.nodes().map(|(id, _)| id))
    }

    /// Fewest-hops path from `start` to `end`, both included.
    ///
    /// `None` when either node is unknown or no loaded edges connect them.
    pub fn shortest_path(&self, start: NodeId, end: NodeId) -> Option<Vec<NodeId>> {
        self.node(start)?;
        self.node(end)?;
        if start == end {
            return Some(vec![start]);
        }

        let mut previous: HashMap<NodeId, NodeId> = HashMap::new();
        let mut visited = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);

        while let Some(current) = queue.pop_front() {
            let Some(node) = self.node(current) else { continue };

            for next in node.adjacent() {
                if !visited.insert(next) {
                    continue;
                }
                previous.insert(next, current);

                if next == end {
                    let mut path = vec![end];
                    let mut cursor = end;
                    while let Some(&before) = previous.get(&cursor) {
                        path.push(before);
                        cursor = before;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }

        None
    }

    /// Intersections joined to `node` by a single link, sorted
    pub fn linked_intersections(&self, node: NodeId) -> Vec<NodeId> {
        let mut linked: Vec<NodeId> = self
            .links()
            .filter_map(|link| link.key.other_end(node))
            .filter(|&other| other != node)
            .collect();
        linked.sort_unstable();
        linked.dedup();
        linked
    }

    /// All nine tiles of the 3x3 block around `tile` are loaded
    pub fn is_tile_neighborhood_complete(&self, tile: TileCoord) -> bool {
        tile.neighborhood()
            .iter()
            .all(|t| self.is_tile_loaded(*t))
    }

    /// Snap a dragged handle to `anchor` or one of the intersections linked to it
    pub fn drag_handle(&self, point: Point<f64>, anchor: NodeId) -> Option<NodeId> {
        self.node(anchor)?;
        let candidates = std::iter::once(anchor).chain(self.linked_intersections(anchor));
        self.find_nearest_node(point, candidates)
    }

    /// Closest node lying on any link
    pub fn nearest_link_node(&self, point: Point<f64>) -> Option<NodeId> {
        let on_links: HashSet<NodeId> = self
            .links()
            .flat_map(|link| link.nodes.iter().copied())
            .collect();
        self.find_nearest_node(point, on_links)
    }

    /// Link whose polyline passes within `tolerance_m` of `point`, nearest first
    pub fn click_link(&self, point: Point<f64>, tolerance_m: f64) -> Option<LinkKey> {
        LinkIndex::build(*self).nearest_link(point, tolerance_m)
    }
}
