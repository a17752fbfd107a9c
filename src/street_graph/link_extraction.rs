use super::{GraphView, LinkScore, NodeId, TileCoord};
use std::collections::HashSet;
use std::fmt::{Display, Formatter};

/// Unordered pair of link endpoints, stored smaller id first
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkKey {
    first: NodeId,
    second: NodeId,
}

impl LinkKey {
    pub fn new(a: NodeId, b: NodeId) -> Self {
        if a <= b {
            LinkKey { first: a, second: b }
        } else {
            LinkKey { first: b, second: a }
        }
    }

    /// Lower endpoint id; its tile owns the link
    pub fn first(&self) -> NodeId {
        self.first
    }

    pub fn second(&self) -> NodeId {
        self.second
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.first == node || self.second == node
    }

    /// The endpoint opposite `node`, or `None` if `node` is not an endpoint
    pub fn other_end(&self, node: NodeId) -> Option<NodeId> {
        if node == self.first {
            Some(self.second)
        } else if node == self.second {
            Some(self.first)
        } else {
            None
        }
    }
}

impl Display for LinkKey {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}-{}", self.first, self.second)
    }
}

/// Mutable presentation state attached to a link
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LinkMetadata {
    pub rating: LinkScore,
    pub highlighted: bool,
}

/// Intersection-to-intersection street piece, the unit users rate and select
#[derive(Clone, Debug, PartialEq)]
pub struct Link {
    pub key: LinkKey,
    /// Every node from `key.first()` to `key.second()`, endpoints included
    pub nodes: Vec<NodeId>,
    /// Tile of the lower endpoint
    pub tile: TileCoord,
    pub metadata: LinkMetadata,
}

/// Node chain discovered by a walk, before metadata is attached
#[derive(Clone, Debug, PartialEq)]
pub struct LinkChain {
    pub key: LinkKey,
    pub nodes: Vec<NodeId>,
}

/// Walk every intersection of `tile` outwards and collect the links the tile owns.
///
/// The caller is responsible for only asking once the tile's 3x3 neighborhood is
/// loaded; chains that run into missing nodes are dropped rather than truncated.
pub fn extract_tile_links(view: &GraphView<'_>, tile: TileCoord) -> Vec<LinkChain> {
    let mut starts: Vec<NodeId> = view
        .nodes_in_tile(tile)
        .filter(|(_, node)| node.is_intersection())
        .map(|(id, _)| id)
        .collect();
    starts.sort_unstable();

    let mut seen = HashSet::new();
    let mut chains = Vec::new();

    for start in starts {
        let Some(node) = view.node(start) else { continue };

        for first_step in node.adjacent() {
            let Some(nodes) = walk_to_intersection(view, start, first_step) else {
                continue;
            };

            let key = LinkKey::new(start, nodes[nodes.len() - 1]);

            // Only the tile holding the lower endpoint creates the link
            let owned_here = view.node(key.first()).is_some_and(|n| n.tile == tile);
            if !owned_here || !seen.insert(key) {
                continue;
            }

            chains.push(LinkChain {
                key,
                nodes: orient(nodes, key),
            });
        }
    }

    chains
}

/// Follow ordinary street points from `start` through `first_step` until the next
/// intersection. Returns the visited chain, both ends included.
fn walk_to_intersection(
    view: &GraphView<'_>,
    start: NodeId,
    first_step: NodeId,
) -> Option<Vec<NodeId>> {
    let mut chain = vec![start];
    let mut visited = HashSet::from([start]);
    let mut previous = start;
    let mut current = first_step;

    loop {
        let node = view.node(current)?;
        chain.push(current);

        if node.is_intersection() {
            return Some(chain);
        }

        // Ring of plain street points not anchored to any intersection
        if !visited.insert(current) {
            log::debug!("Abandoning walk from {} at revisited node {}", start, current);
            return None;
        }

        let next = node.adjacent().find(|&n| n != previous)?;
        previous = current;
        current = next;
    }
}

/// Chains read from the lower endpoint to the higher one
fn orient(mut nodes: Vec<NodeId>, key: LinkKey) -> Vec<NodeId> {
    if nodes.first() != Some(&key.first()) {
        nodes.reverse();
    }
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::street_graph::test_support::*;
    use crate::street_graph::GraphStore;

    #[test]
    fn test_link_key_is_canonical() {
        for (a, b) in [(1, 3), (3, 1), (7, 7), (0, u64::MAX)] {
            assert_eq!(LinkKey::new(a, b), LinkKey::new(b, a));
            assert!(LinkKey::new(a, b).first() <= LinkKey::new(a, b).second());
        }
        let key = LinkKey::new(9, 4);
        assert_eq!(key.other_end(4), Some(9));
        assert_eq!(key.other_end(9), Some(4));
        assert_eq!(key.other_end(5), None);
        assert_eq!(key.to_string(), "4-9");
    }

    #[test]
    fn test_single_street_with_side_branch() {
        // Way [1,2,3,4] with a second way [3,5] making 3 an intersection
        let c = center_tile();
        let world = elements(
            vec![
                node(1, c, 0.1, 0.5),
                node(2, c, 0.3, 0.5),
                node(3, c, 0.5, 0.5),
                node(4, c, 0.7, 0.5),
                node(5, c, 0.5, 0.8),
            ],
            vec![way(100, &[1, 2, 3, 4]), way(200, &[3, 5])],
        );

        let mut store = GraphStore::new(c.zoom);
        store.merge_batch(&c.neighborhood(), batch_for(&world, &c.neighborhood()));

        let chains = extract_tile_links(&store.view(), c);
        let keys: Vec<_> = chains.iter().map(|l| l.key).collect();
        assert_eq!(
            keys,
            vec![LinkKey::new(1, 3), LinkKey::new(3, 4), LinkKey::new(3, 5)]
        );

        let link = chains.iter().find(|l| l.key == LinkKey::new(1, 3)).unwrap();
        assert_eq!(link.nodes, vec![1, 2, 3]);
        assert!(chains.iter().all(|l| !l.key.contains(2)));
    }

    #[test]
    fn test_lower_endpoint_outside_tile_is_skipped() {
        let c = center_tile();
        let east = c.neighbors()[4];
        // Node 1 lives east; link (1,30) belongs to the east tile
        let world = elements(
            vec![node(1, east, 0.5, 0.5), node(20, c, 0.9, 0.5), node(30, c, 0.5, 0.5)],
            vec![way(100, &[1, 20, 30])],
        );

        let mut store = GraphStore::new(c.zoom);
        let mut tiles = c.neighborhood().to_vec();
        tiles.extend(east.neighborhood());
        tiles.sort();
        tiles.dedup();
        store.merge_batch(&tiles, batch_for(&world, &tiles));

        assert!(extract_tile_links(&store.view(), c).is_empty());

        let east_links = extract_tile_links(&store.view(), east);
        assert_eq!(east_links.len(), 1);
        assert_eq!(east_links[0].nodes, vec![1, 20, 30]);
    }

    #[test]
    fn test_dead_end_and_loop() {
        let c = center_tile();
        // 1 is a dead end hanging off intersection 2; 2-3-4-2 is a loop back to 2
        let world = elements(
            vec![
                node(1, c, 0.1, 0.1),
                node(2, c, 0.3, 0.3),
                node(3, c, 0.6, 0.3),
                node(4, c, 0.45, 0.6),
            ],
            vec![way(100, &[1, 2]), way(200, &[2, 3, 4, 2])],
        );

        let mut store = GraphStore::new(c.zoom);
        store.merge_batch(&c.neighborhood(), batch_for(&world, &c.neighborhood()));

        let chains = extract_tile_links(&store.view(), c);
        let keys: Vec<_> = chains.iter().map(|l| l.key).collect();
        assert_eq!(keys, vec![LinkKey::new(1, 2), LinkKey::new(2, 2)]);

        let ring = &chains[1];
        assert_eq!(ring.nodes.first(), Some(&2));
        assert_eq!(ring.nodes.last(), Some(&2));
        assert_eq!(ring.nodes.len(), 4);
    }
}
