use super::{
    extract_tile_links, Link, LinkKey, LinkMetadata, LinkScore, NodeId, RawWay, StreetRating,
    TileBatch, TileCoord, WayId, MAX_ZOOM, NUM_CONSIDERED_RATINGS,
};
use crate::config::GraphConfig;
use chrono::Utc;
use geo::Point;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// A point of the street network, shared by every way passing through it
#[derive(Clone, Debug, PartialEq)]
pub struct NodeData {
    pub position: Point<f64>,
    /// Tile the position falls in
    pub tile: TileCoord,
    /// Neighbour -> number of way edges joining the two nodes
    adjacency: BTreeMap<NodeId, u32>,
    ref_count: u32,
}

impl NodeData {
    fn new(position: Point<f64>, zoom: u8) -> Self {
        NodeData {
            position,
            tile: TileCoord::from_point(position, zoom),
            adjacency: BTreeMap::new(),
            ref_count: 0,
        }
    }

    /// Adjacent node ids in ascending order
    pub fn adjacent(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.adjacency.keys().copied()
    }

    pub fn degree(&self) -> usize {
        self.adjacency.len()
    }

    /// Anything but a plain street point: dead ends and junctions
    pub fn is_intersection(&self) -> bool {
        self.adjacency.len() != 2
    }

    /// Number of live ways containing this node
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WayData {
    pub nodes: Vec<NodeId>,
    ref_count: u32,
}

impl WayData {
    /// Number of loaded tiles owning this way
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }
}

/// A loaded tile and what it owns
#[derive(Clone, Debug, Default)]
pub struct TileData {
    ways: HashSet<WayId>,
    links: BTreeSet<LinkKey>,
    links_derived: bool,
}

impl TileData {
    pub fn ways(&self) -> impl Iterator<Item = WayId> + '_ {
        self.ways.iter().copied()
    }

    pub fn links(&self) -> impl Iterator<Item = LinkKey> + '_ {
        self.links.iter().copied()
    }

    /// False until the first derivation, and again after a neighbour was evicted
    pub fn links_derived(&self) -> bool {
        self.links_derived
    }
}

/// Counts from one merged batch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub tiles: usize,
    pub new_ways: usize,
    pub shared_ways: usize,
    /// Ways with a node whose position is unknown
    pub skipped_ways: usize,
    /// Ways touching none of the batch tiles
    pub foreign_ways: usize,
    /// Tiles whose links were (re)derived after the merge
    pub derived_tiles: usize,
}

/// In-memory street graph assembled from tile batches.
///
/// # Ownership
/// - Tiles own ways: a way belongs to every loaded tile containing its representative
///   point or any of its nodes, and lives while at least one such tile does
/// - Ways own nodes: a node lives while at least one loaded way contains it
/// - Tiles own links: a link belongs to the tile of its lower endpoint
///
/// Links for a tile are only derived once its whole 3x3 neighbourhood is loaded.
pub struct GraphStore {
    zoom: u8,
    considered_ratings: usize,
    tiles: HashMap<TileCoord, TileData>,
    ways: HashMap<WayId, WayData>,
    nodes: HashMap<NodeId, NodeData>,
    /// Live nodes by the tile their position falls in, loaded or not
    tile_nodes: HashMap<TileCoord, BTreeSet<NodeId>>,
    links: HashMap<LinkKey, Link>,
    /// Ratings by owning tile, then link
    ratings: HashMap<TileCoord, HashMap<LinkKey, Vec<StreetRating>>>,
    highlighted: HashSet<LinkKey>,
}

impl GraphStore {
    pub fn new(zoom: u8) -> Self {
        assert!(zoom <= MAX_ZOOM, "graph zoom {} is deeper than the maximum of {}", zoom, MAX_ZOOM);
        GraphStore {
            zoom,
            considered_ratings: NUM_CONSIDERED_RATINGS,
            tiles: HashMap::new(),
            ways: HashMap::new(),
            nodes: HashMap::new(),
            tile_nodes: HashMap::new(),
            links: HashMap::new(),
            ratings: HashMap::new(),
            highlighted: HashSet::new(),
        }
    }

    pub fn from_config(config: &GraphConfig) -> Self {
        GraphStore {
            considered_ratings: config.considered_ratings,
            ..GraphStore::new(config.zoom)
        }
    }

    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    pub fn view(&self) -> GraphView<'_> {
        GraphView { store: self }
    }

    pub fn is_loaded(&self, tile: TileCoord) -> bool {
        self.tiles.contains_key(&tile)
    }

    pub fn tile(&self, tile: TileCoord) -> Option<&TileData> {
        self.tiles.get(&tile)
    }

    pub fn loaded_tiles(&self) -> impl Iterator<Item = TileCoord> + '_ {
        self.tiles.keys().copied()
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeData> {
        self.nodes.get(&id)
    }

    pub fn way(&self, id: WayId) -> Option<&WayData> {
        self.ways.get(&id)
    }

    pub fn link(&self, key: LinkKey) -> Option<&Link> {
        self.links.get(&key)
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> + '_ {
        self.links.values()
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn way_count(&self) -> usize {
        self.ways.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Merge a fetched batch and mark its tiles loaded.
    ///
    /// Tiles of the batch that are already loaded are evicted first, so merging the
    /// same batch twice leaves the tables as if it was merged once.
    pub fn merge_batch(&mut self, tiles: &[TileCoord], batch: TileBatch) -> MergeReport {
        let mut report = MergeReport::default();
        let batch_tiles: HashSet<TileCoord> = tiles.iter().copied().collect();

        for &tile in &batch_tiles {
            if self.is_loaded(tile) {
                log::debug!("Replacing already loaded {}", tile);
                self.evict_tile(tile);
            }
            self.tiles.insert(tile, TileData::default());
        }
        report.tiles = batch_tiles.len();

        let positions: HashMap<NodeId, Point<f64>> = batch
            .elements
            .nodes
            .iter()
            .map(|node| (node.id, node.position))
            .collect();

        for way in &batch.elements.ways {
            let Some(points) = self.resolve_positions(way, &positions) else {
                log::warn!("Skipping way {}: node position missing from response", way.id);
                report.skipped_ways += 1;
                continue;
            };

            let owners = self.owning_tiles(way, &points, &batch_tiles);
            if owners.is_empty() {
                report.foreign_ways += 1;
                continue;
            }

            for owner in owners {
                let Some(tile) = self.tiles.get_mut(&owner) else { continue };
                if !tile.ways.insert(way.id) {
                    continue;
                }
                if self.acquire_way(way, &points) {
                    report.new_ways += 1;
                } else {
                    report.shared_ways += 1;
                }
            }
        }

        for tile in &batch_tiles {
            self.ratings.remove(tile);
        }
        for rating in batch.ratings {
            let tile = rating.tile(self.zoom);
            if !batch_tiles.contains(&tile) {
                continue;
            }
            self.ratings
                .entry(tile)
                .or_default()
                .entry(rating.link_key())
                .or_default()
                .push(rating);
        }

        report.derived_tiles = self.refresh_links();

        log::info!(
            "Merged {} tile(s): {} new way(s), {} shared, {} skipped; {} tile(s) derived",
            report.tiles,
            report.new_ways,
            report.shared_ways,
            report.skipped_ways,
            report.derived_tiles
        );

        report
    }

    /// Positions of every node of `way`, from the response or the existing table
    fn resolve_positions(
        &self,
        way: &RawWay,
        positions: &HashMap<NodeId, Point<f64>>,
    ) -> Option<Vec<Point<f64>>> {
        way.nodes
            .iter()
            .map(|id| {
                positions
                    .get(id)
                    .copied()
                    .or_else(|| self.nodes.get(id).map(|node| node.position))
            })
            .collect()
    }

    fn owning_tiles(
        &self,
        way: &RawWay,
        points: &[Point<f64>],
        batch_tiles: &HashSet<TileCoord>,
    ) -> BTreeSet<TileCoord> {
        let representative = way.center.unwrap_or_else(|| centroid(points));

        std::iter::once(representative)
            .chain(points.iter().copied())
            .map(|p| TileCoord::from_point(p, self.zoom))
            .filter(|tile| batch_tiles.contains(tile))
            .collect()
    }

    /// Take one reference on `way`. Returns true if the way was new.
    fn acquire_way(&mut self, way: &RawWay, points: &[Point<f64>]) -> bool {
        if let Some(existing) = self.ways.get_mut(&way.id) {
            existing.ref_count += 1;
            return false;
        }

        let mut counted = HashSet::new();
        for (&id, &position) in way.nodes.iter().zip(points) {
            if !counted.insert(id) {
                continue;
            }
            match self.nodes.entry(id) {
                Entry::Occupied(mut existing) => existing.get_mut().ref_count += 1,
                Entry::Vacant(slot) => {
                    let node = NodeData::new(position, self.zoom);
                    self.tile_nodes.entry(node.tile).or_default().insert(id);
                    slot.insert(node).ref_count += 1;
                }
            }
        }

        for pair in way.nodes.windows(2) {
            self.add_edge(pair[0], pair[1]);
        }

        self.ways.insert(
            way.id,
            WayData {
                nodes: way.nodes.clone(),
                ref_count: 1,
            },
        );
        true
    }

    fn add_edge(&mut self, a: NodeId, b: NodeId) {
        if a == b {
            return;
        }
        for (from, to) in [(a, b), (b, a)] {
            if let Some(node) = self.nodes.get_mut(&from) {
                *node.adjacency.entry(to).or_insert(0) += 1;
            }
        }
    }

    fn remove_edge(&mut self, a: NodeId, b: NodeId) {
        if a == b {
            return;
        }
        for (from, to) in [(a, b), (b, a)] {
            let Some(node) = self.nodes.get_mut(&from) else {
                panic!("edge {}-{} references missing node {}", a, b, from);
            };
            let Some(count) = node.adjacency.get_mut(&to) else {
                panic!("node {} has no edge to {}", from, to);
            };
            *count -= 1;
            if *count == 0 {
                node.adjacency.remove(&to);
            }
        }
    }

    /// Drop one reference on `id`; the way and any orphaned nodes go at zero
    fn release_way(&mut self, id: WayId) {
        let Some(way) = self.ways.get_mut(&id) else {
            panic!("tile references missing way {}", id);
        };
        assert!(way.ref_count > 0, "way {} has no references left", id);
        way.ref_count -= 1;
        if way.ref_count > 0 {
            return;
        }

        let Some(way) = self.ways.remove(&id) else { return };

        for pair in way.nodes.windows(2) {
            self.remove_edge(pair[0], pair[1]);
        }

        let mut released = HashSet::new();
        for &node in &way.nodes {
            if released.insert(node) {
                self.release_node(node);
            }
        }
    }

    fn release_node(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(&id) else {
            panic!("way references missing node {}", id);
        };
        assert!(node.ref_count > 0, "node {} has no references left", id);
        node.ref_count -= 1;
        if node.ref_count > 0 {
            return;
        }

        let Some(node) = self.nodes.remove(&id) else { return };
        if let Entry::Occupied(mut in_tile) = self.tile_nodes.entry(node.tile) {
            in_tile.get_mut().remove(&id);
            if in_tile.get().is_empty() {
                in_tile.remove();
            }
        }
        for neighbour in node.adjacency.keys() {
            if let Some(other) = self.nodes.get_mut(neighbour) {
                other.adjacency.remove(&id);
            }
        }
    }

    /// Unload a tile, releasing its ways and removing the links it owns.
    ///
    /// Derived neighbours are flagged so their links are rebuilt once the
    /// neighbourhood is complete again. Returns false if the tile was not loaded.
    pub fn evict_tile(&mut self, tile: TileCoord) -> bool {
        let Some(data) = self.tiles.remove(&tile) else {
            return false;
        };

        for way in data.ways {
            self.release_way(way);
        }
        for key in &data.links {
            self.links.remove(key);
        }
        self.ratings.remove(&tile);

        for neighbour in tile.neighbors() {
            if let Some(other) = self.tiles.get_mut(&neighbour) {
                other.links_derived = false;
            }
        }

        log::debug!("Evicted {} with {} link(s)", tile, data.links.len());
        true
    }

    /// Derive links for every loaded tile that needs it and has a complete
    /// neighbourhood. Returns how many tiles were derived.
    pub fn refresh_links(&mut self) -> usize {
        let mut ready: Vec<TileCoord> = self
            .tiles
            .iter()
            .filter(|(_, data)| !data.links_derived)
            .map(|(tile, _)| *tile)
            .filter(|tile| self.view().is_tile_neighborhood_complete(*tile))
            .collect();
        ready.sort();

        for &tile in &ready {
            self.derive_tile_links(tile);
        }
        ready.len()
    }

    fn derive_tile_links(&mut self, tile: TileCoord) {
        let chains = extract_tile_links(&self.view(), tile);
        let now = Utc::now();

        let previous = self
            .tiles
            .get_mut(&tile)
            .map(|data| std::mem::take(&mut data.links))
            .unwrap_or_default();
        for key in &previous {
            self.links.remove(key);
        }

        let mut owned = BTreeSet::new();
        for chain in chains {
            let ratings = self
                .ratings
                .get(&tile)
                .and_then(|by_link| by_link.get(&chain.key))
                .map(Vec::as_slice)
                .unwrap_or_default();

            let metadata = LinkMetadata {
                rating: LinkScore::from_ratings(ratings, self.considered_ratings, now),
                highlighted: self.highlighted.contains(&chain.key),
            };

            owned.insert(chain.key);
            self.links.insert(
                chain.key,
                Link {
                    key: chain.key,
                    nodes: chain.nodes,
                    tile,
                    metadata,
                },
            );
        }

        if let Some(data) = self.tiles.get_mut(&tile) {
            log::debug!("Derived {} link(s) for {}", owned.len(), tile);
            data.links = owned;
            data.links_derived = true;
        }
    }

    /// Mark links highlighted. Keys without a link yet stay highlighted once it appears.
    pub fn highlight_links(&mut self, keys: impl IntoIterator<Item = LinkKey>) {
        for key in keys {
            self.highlighted.insert(key);
            if let Some(link) = self.links.get_mut(&key) {
                link.metadata.highlighted = true;
            }
        }
    }

    pub fn clear_highlights(&mut self) {
        for key in self.highlighted.drain() {
            if let Some(link) = self.links.get_mut(&key) {
                link.metadata.highlighted = false;
            }
        }
    }

    pub fn highlighted(&self) -> impl Iterator<Item = LinkKey> + '_ {
        self.highlighted.iter().copied()
    }
}

/// Centroid of the node positions, for ways that arrive without `center`
fn centroid(points: &[Point<f64>]) -> Point<f64> {
    let n = points.len().max(1) as f64;
    let (x, y) = points
        .iter()
        .fold((0.0, 0.0), |(x, y), p| (x + p.x(), y + p.y()));
    Point::new(x / n, y / n)
}

/// Read-only access to a [`GraphStore`] for query consumers
#[derive(Clone, Copy)]
pub struct GraphView<'a> {
    store: &'a GraphStore,
}

impl<'a> GraphView<'a> {
    pub fn zoom(&self) -> u8 {
        self.store.zoom
    }

    pub fn node(&self, id: NodeId) -> Option<&'a NodeData> {
        self.store.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &'a NodeData)> + 'a {
        self.store.nodes.iter().map(|(id, node)| (*id, node))
    }

    /// Nodes positioned in `tile`, in ascending id order
    pub fn nodes_in_tile(&self, tile: TileCoord) -> impl Iterator<Item = (NodeId, &'a NodeData)> + 'a {
        let store = self.store;
        store
            .tile_nodes
            .get(&tile)
            .into_iter()
            .flatten()
            .filter_map(move |id| store.nodes.get(id).map(|node| (*id, node)))
    }

    pub fn link(&self, key: LinkKey) -> Option<&'a Link> {
        self.store.links.get(&key)
    }

    pub fn links(&self) -> impl Iterator<Item = &'a Link> + 'a {
        self.store.links.values()
    }

    pub fn is_tile_loaded(&self, tile: TileCoord) -> bool {
        self.store.is_loaded(tile)
    }

    /// Tile owning `key`, if the link exists
    pub fn link_tile(&self, key: LinkKey) -> Option<TileCoord> {
        self.link(key).map(|link| link.tile)
    }

    /// Node ids of a link from its lower endpoint to its higher one
    pub fn link_node_ids(&self, key: LinkKey) -> Option<&'a [NodeId]> {
        self.link(key).map(|link| link.nodes.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::street_graph::test_support::*;
    use crate::street_graph::OverpassElements;

    fn load(store: &mut GraphStore, world: &OverpassElements, tiles: &[TileCoord]) {
        store.merge_batch(tiles, batch_for(world, tiles));
    }

    /// Reference count of every node equals the number of live ways holding it
    fn assert_ref_counts_consistent(store: &GraphStore) {
        let mut expected: HashMap<NodeId, u32> = HashMap::new();
        for way in store.ways.values() {
            let unique: HashSet<_> = way.nodes.iter().collect();
            for node in unique {
                *expected.entry(*node).or_default() += 1;
            }
        }
        assert_eq!(expected.len(), store.nodes.len());
        for (id, node) in &store.nodes {
            assert_eq!(Some(&node.ref_count), expected.get(id), "node {}", id);
            for neighbour in node.adjacent() {
                assert!(store.nodes.contains_key(&neighbour));
            }
            assert!(store.tile_nodes[&node.tile].contains(id), "node {} not indexed", id);
        }
        let indexed: usize = store.tile_nodes.values().map(BTreeSet::len).sum();
        assert_eq!(indexed, store.nodes.len());
        assert!(store.tile_nodes.values().all(|ids| !ids.is_empty()));
    }

    #[test]
    fn test_merge_builds_adjacency() {
        let c = center_tile();
        let world = cross_world();
        let mut store = GraphStore::new(c.zoom);
        load(&mut store, &world, &[c]);

        assert_eq!(store.way_count(), 2);
        assert_eq!(store.node_count(), 9);
        assert_eq!(store.node(10).unwrap().degree(), 4);
        assert!(store.node(10).unwrap().is_intersection());
        assert!(!store.node(11).unwrap().is_intersection());
        assert!(store.node(12).unwrap().is_intersection());
        assert_eq!(store.node(10).unwrap().ref_count(), 2);
        assert_eq!(store.node(11).unwrap().ref_count(), 1);
        assert_ref_counts_consistent(&store);
    }

    #[test]
    fn test_way_shared_by_two_tiles() {
        let c = center_tile();
        let east = c.neighbors()[4];
        let world = elements(
            vec![node(1, c, 0.6, 0.5), node(2, c, 0.95, 0.5), node(3, east, 0.2, 0.5)],
            vec![way(100, &[1, 2, 3])],
        );

        let mut store = GraphStore::new(c.zoom);
        load(&mut store, &world, &[c]);
        load(&mut store, &world, &[east]);

        assert_eq!(store.way_count(), 1);
        assert_eq!(store.way(100).unwrap().ref_count(), 2);
        assert_eq!(store.node(2).unwrap().ref_count(), 1);

        assert!(store.evict_tile(east));
        assert_eq!(store.way(100).unwrap().ref_count(), 1);
        assert_eq!(store.node_count(), 3);
        assert_ref_counts_consistent(&store);

        assert!(store.evict_tile(c));
        assert_eq!(store.way_count(), 0);
        assert_eq!(store.node_count(), 0);
    }

    #[test]
    fn test_way_in_one_batch_counts_once_per_tile() {
        let c = center_tile();
        let east = c.neighbors()[4];
        let world = elements(
            vec![node(1, c, 0.8, 0.5), node(2, east, 0.2, 0.5)],
            vec![way(100, &[1, 2])],
        );

        let mut store = GraphStore::new(c.zoom);
        let report = store.merge_batch(&[c, east], batch_for(&world, &[c, east]));

        assert_eq!(report.new_ways, 1);
        assert_eq!(report.shared_ways, 1);
        assert_eq!(store.way(100).unwrap().ref_count(), 2);
    }

    #[test]
    fn test_shared_node_counts_each_way_once() {
        let c = center_tile();
        // Way 200 is a closed ring through node 1
        let world = elements(
            vec![
                node(1, c, 0.5, 0.5),
                node(2, c, 0.2, 0.5),
                node(3, c, 0.7, 0.4),
                node(4, c, 0.7, 0.6),
            ],
            vec![way(100, &[2, 1]), way(200, &[1, 3, 4, 1])],
        );

        let mut store = GraphStore::new(c.zoom);
        load(&mut store, &world, &[c]);

        assert_eq!(store.node(1).unwrap().ref_count(), 2);
        assert_eq!(store.node(1).unwrap().degree(), 3);
        assert_ref_counts_consistent(&store);
    }

    #[test]
    fn test_eviction_prunes_orphans_from_adjacency() {
        let c = center_tile();
        let north = c.neighbors()[1];
        // Way 200 crosses from the centre into the north tile
        let world = elements(
            vec![
                node(1, c, 0.5, 0.1),
                node(2, c, 0.5, 0.6),
                node(3, c, 0.2, 0.1),
                node(4, north, 0.5, 0.5),
            ],
            vec![way(100, &[3, 1, 2]), way(200, &[1, 4])],
        );

        let mut store = GraphStore::new(c.zoom);
        load(&mut store, &world, &[c]);
        load(&mut store, &world, &[north]);
        assert!(store.node(1).unwrap().is_intersection());

        // Way 200 touches the centre tile too, so evicting north keeps it
        assert!(store.evict_tile(north));
        assert!(store.node(4).is_some());

        assert!(store.evict_tile(c));
        assert_eq!(store.node_count(), 0);

        // Reload only the centre: way 200 is owned again through node 1
        load(&mut store, &world, &[c]);
        assert_eq!(store.way(200).unwrap().ref_count(), 1);
        assert_ref_counts_consistent(&store);
    }

    #[test]
    fn test_way_removal_restores_plain_street_point() {
        let c = center_tile();
        let world = elements(
            vec![
                node(1, c, 0.2, 0.5),
                node(2, c, 0.5, 0.5),
                node(3, c, 0.8, 0.5),
                node(4, c, 0.5, 0.8),
            ],
            vec![way(100, &[1, 2, 3]), way(200, &[4, 2])],
        );

        let mut store = GraphStore::new(c.zoom);
        load(&mut store, &world, &[c]);
        assert!(store.node(2).unwrap().is_intersection());

        // The source dropped way 200; reloading the tile must forget its edge
        let updated = elements(world.nodes.clone(), vec![way(100, &[1, 2, 3])]);
        load(&mut store, &updated, &[c]);

        assert_eq!(store.way(200), None);
        assert_eq!(store.node(4), None);
        assert_eq!(store.node(2).unwrap().degree(), 2);
        assert!(!store.node(2).unwrap().is_intersection());
        assert_ref_counts_consistent(&store);
    }

    #[test]
    fn test_way_with_unknown_node_is_skipped() {
        let c = center_tile();
        let world = elements(
            vec![node(1, c, 0.2, 0.5), node(2, c, 0.4, 0.5)],
            vec![way(100, &[1, 2]), way(200, &[2, 99])],
        );

        let mut store = GraphStore::new(c.zoom);
        let report = store.merge_batch(&[c], world_batch(&world));

        assert_eq!(report.skipped_ways, 1);
        assert_eq!(store.way(200), None);
        assert_eq!(store.node(2).unwrap().degree(), 1);
    }

    #[test]
    fn test_way_outside_batch_is_dropped() {
        let c = center_tile();
        let far = TileCoord::new(c.x + 5, c.y, c.zoom);
        let world = elements(vec![node(1, far, 0.2, 0.5), node(2, far, 0.4, 0.5)], vec![way(100, &[1, 2])]);

        let mut store = GraphStore::new(c.zoom);
        let report = store.merge_batch(&[c], world_batch(&world));

        assert_eq!(report.foreign_ways, 1);
        assert!(store.is_loaded(c));
        assert_eq!(store.node_count(), 0);
    }

    #[test]
    fn test_links_wait_for_complete_neighbourhood() {
        let c = center_tile();
        let world = cross_world();
        let mut store = GraphStore::new(c.zoom);

        load(&mut store, &world, &[c]);
        assert!(!store.view().is_tile_neighborhood_complete(c));
        assert_eq!(store.link_count(), 0);
        assert!(!store.tile(c).unwrap().links_derived());

        let neighbours = c.neighbors();
        load(&mut store, &world, &neighbours[..7]);
        assert_eq!(store.link_count(), 0);

        let report = store.merge_batch(&neighbours[7..], batch_for(&world, &neighbours[7..]));
        assert_eq!(report.derived_tiles, 1);
        assert_eq!(store.link_count(), 4);
        assert!(store.tile(c).unwrap().links_derived());

        let link = store.link(LinkKey::new(12, 10)).unwrap();
        assert_eq!(link.nodes, vec![10, 11, 12]);
        assert_eq!(link.tile, c);
    }

    #[test]
    fn test_evicting_a_tile_removes_only_its_links() {
        let c = center_tile();
        let east = c.neighbors()[4];
        let mut world = cross_world();
        world.nodes.push(node(1, east, 0.3, 0.3));
        world.nodes.push(node(2, east, 0.6, 0.6));
        world.ways.push(way(300, &[1, 2]));

        let mut tiles: Vec<TileCoord> = c.neighborhood().to_vec();
        tiles.extend(east.neighborhood());
        tiles.sort();
        tiles.dedup();

        let mut store = GraphStore::new(c.zoom);
        load(&mut store, &world, &tiles);
        assert_eq!(store.link_count(), 5);
        assert!(store.link(LinkKey::new(1, 2)).is_some());

        store.evict_tile(c);
        assert_eq!(store.link_count(), 1);
        assert_eq!(store.link(LinkKey::new(1, 2)).unwrap().tile, east);
        assert!(!store.tile(east).unwrap().links_derived());

        // Reloading the centre re-derives both tiles
        let report = store.merge_batch(&[c], batch_for(&world, &[c]));
        assert_eq!(report.derived_tiles, 2);
        assert_eq!(store.link_count(), 5);
    }

    #[test]
    fn test_ratings_attach_to_links() {
        let c = center_tile();
        let world = cross_world();
        let tiles = c.neighborhood();
        let mut batch = batch_for(&world, &tiles);
        batch.ratings = vec![
            rating_for(c, 10, 12, 2),
            rating_for(c, 12, 10, 4),
            rating_for(TileCoord::new(1, 1, c.zoom), 10, 14, 1),
        ];

        let mut store = GraphStore::new(c.zoom);
        store.merge_batch(&tiles, batch);

        let rated = store.link(LinkKey::new(10, 12)).unwrap();
        let score = rated.metadata.rating.score.unwrap();
        assert!(score > 3.0 && score < 4.0);
        assert!(rated.metadata.rating.fading);

        let unrated = store.link(LinkKey::new(10, 14)).unwrap();
        assert_eq!(unrated.metadata.rating, LinkScore::default());
    }

    #[test]
    fn test_highlights_survive_rederivation() {
        let c = center_tile();
        let world = cross_world();
        let tiles = c.neighborhood();

        let mut store = GraphStore::new(c.zoom);
        store.highlight_links([LinkKey::new(10, 16)]);
        load(&mut store, &world, &tiles);
        assert!(store.link(LinkKey::new(10, 16)).unwrap().metadata.highlighted);

        store.highlight_links([LinkKey::new(10, 12)]);
        load(&mut store, &world, &[c]);
        assert!(store.link(LinkKey::new(10, 12)).unwrap().metadata.highlighted);
        assert!(!store.link(LinkKey::new(10, 14)).unwrap().metadata.highlighted);

        store.clear_highlights();
        assert!(store.links().all(|link| !link.metadata.highlighted));
        assert_eq!(store.highlighted().count(), 0);
    }

    #[test]
    fn test_view_link_helpers() {
        let c = center_tile();
        let mut store = GraphStore::new(c.zoom);
        load(&mut store, &cross_world(), &c.neighborhood());

        let view = store.view();
        assert_eq!(view.link_tile(LinkKey::new(10, 18)), Some(c));
        assert_eq!(view.link_node_ids(LinkKey::new(18, 10)), Some(&[10, 17, 18][..]));
        assert_eq!(view.link_tile(LinkKey::new(11, 12)), None);
        assert_eq!(view.nodes_in_tile(c).count(), 9);
    }

    #[test]
    fn test_tile_node_index_follows_eviction() {
        let c = center_tile();
        let east = c.neighbors()[4];
        let world = elements(
            vec![
                node(1, c, 0.6, 0.5),
                node(2, c, 0.95, 0.5),
                node(3, east, 0.2, 0.5),
                node(4, east, 0.6, 0.5),
            ],
            vec![way(100, &[1, 2, 3]), way(200, &[3, 4])],
        );

        let mut store = GraphStore::new(c.zoom);
        load(&mut store, &world, &[c, east]);
        let ids = |store: &GraphStore, tile| -> Vec<NodeId> {
            store.view().nodes_in_tile(tile).map(|(id, _)| id).collect()
        };
        assert_eq!(ids(&store, c), vec![1, 2]);
        assert_eq!(ids(&store, east), vec![3, 4]);
        assert_ref_counts_consistent(&store);

        // Way 100 survives through its node in the east tile; way 200 does not
        store.evict_tile(east);
        assert_eq!(ids(&store, c), vec![1, 2]);
        assert_eq!(ids(&store, east), vec![3]);
        assert_ref_counts_consistent(&store);

        store.evict_tile(c);
        assert!(ids(&store, east).is_empty());
        assert!(store.tile_nodes.is_empty());
    }

    #[test]
    #[should_panic(expected = "deeper than the maximum")]
    fn test_store_rejects_unsupported_zoom() {
        GraphStore::new(40);
    }
}
