use super::{GraphView, LinkKey, EARTH_RADIUS_M};
use geo::{Coord, EuclideanDistance, LineString, Point};
use rstar::{RTree, RTreeObject, AABB};

/// Meters per degree of latitude on the mean-radius sphere
const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

/// Link polyline with its indexing envelope, in locally scaled coordinates
#[derive(Clone, Debug)]
struct SpatialLink {
    key: LinkKey,
    geometry: LineString<f64>,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for SpatialLink {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// R-tree of link polylines for click hit tests
///
/// # Coordinates
/// Longitudes are scaled by the cosine of one reference latitude (the mean over all
/// indexed nodes), so Euclidean distances in the index are degrees of latitude and
/// convert to meters with a single factor. Accurate at city scale.
///
/// The index is a snapshot: rebuild it after the graph changes.
pub struct LinkIndex {
    tree: RTree<SpatialLink>,
    lon_scale: f64,
}

impl LinkIndex {
    /// Index every link whose nodes are all present in the graph
    pub fn build(view: GraphView<'_>) -> Self {
        let mut lat_sum = 0.0;
        let mut lat_count = 0usize;
        let polylines: Vec<(LinkKey, Vec<Point<f64>>)> = view
            .links()
            .filter_map(|link| {
                let points: Option<Vec<Point<f64>>> = link
                    .nodes
                    .iter()
                    .map(|id| view.node(*id).map(|node| node.position))
                    .collect();
                points.map(|points| (link.key, points))
            })
            .inspect(|(_, points)| {
                lat_sum += points.iter().map(|p| p.y()).sum::<f64>();
                lat_count += points.len();
            })
            .collect();

        let reference_lat = if lat_count > 0 {
            lat_sum / lat_count as f64
        } else {
            0.0
        };
        let lon_scale = reference_lat.to_radians().cos();

        let links: Vec<SpatialLink> = polylines
            .into_iter()
            .map(|(key, points)| {
                let geometry: LineString<f64> = points
                    .iter()
                    .map(|p| Coord {
                        x: p.x() * lon_scale,
                        y: p.y(),
                    })
                    .collect();
                let envelope = compute_envelope(&geometry);
                SpatialLink {
                    key,
                    geometry,
                    envelope,
                }
            })
            .collect();

        LinkIndex {
            tree: RTree::bulk_load(links),
            lon_scale,
        }
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// Links within `max_distance_m` of `point`, nearest first
    pub fn links_near(&self, point: Point<f64>, max_distance_m: f64) -> Vec<(LinkKey, f64)> {
        let radius = max_distance_m / METERS_PER_DEGREE;
        let query = Point::new(point.x() * self.lon_scale, point.y());

        let envelope = AABB::from_corners(
            [query.x() - radius, query.y() - radius],
            [query.x() + radius, query.y() + radius],
        );

        let mut candidates: Vec<(LinkKey, f64)> = self
            .tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|link| {
                let distance = query.euclidean_distance(&link.geometry) * METERS_PER_DEGREE;
                (link.key, distance)
            })
            .filter(|(_, distance)| *distance <= max_distance_m)
            .collect();

        candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        candidates
    }

    /// Closest link within `max_distance_m`
    pub fn nearest_link(&self, point: Point<f64>, max_distance_m: f64) -> Option<LinkKey> {
        self.links_near(point, max_distance_m)
            .first()
            .map(|(key, _)| *key)
    }
}

/// Bounding box of a polyline
fn compute_envelope(line: &LineString<f64>) -> AABB<[f64; 2]> {
    let mut min = [f64::INFINITY, f64::INFINITY];
    let mut max = [f64::NEG_INFINITY, f64::NEG_INFINITY];

    for coord in line.coords() {
        min = [min[0].min(coord.x), min[1].min(coord.y)];
        max = [max[0].max(coord.x), max[1].max(coord.y)];
    }

    if min[0] > max[0] {
        return AABB::from_point([0.0, 0.0]);
    }
    AABB::from_corners(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::street_graph::test_support::*;
    use crate::street_graph::GraphStore;

    fn cross_index() -> (GraphStore, LinkIndex) {
        let c = center_tile();
        let mut store = GraphStore::new(c.zoom);
        let tiles = c.neighborhood();
        store.merge_batch(&tiles, batch_for(&cross_world(), &tiles));
        let index = LinkIndex::build(store.view());
        (store, index)
    }

    #[test]
    fn test_empty_index() {
        let store = GraphStore::new(16);
        let index = LinkIndex::build(store.view());
        assert!(index.is_empty());
        assert_eq!(index.nearest_link(point_in(center_tile(), 0.5, 0.5), 1000.0), None);
    }

    #[test]
    fn test_indexes_every_link() {
        let (_store, index) = cross_index();
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn test_links_near_sorted_by_distance() {
        let (_store, index) = cross_index();
        let c = center_tile();

        // Just west of the north arm: all four arms meet within 100 m of the centre
        let hits = index.links_near(point_in(c, 0.48, 0.45), 100.0);
        assert_eq!(hits.len(), 4);
        assert_eq!(hits[0].0, LinkKey::new(10, 12));
        assert!(hits.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn test_distance_in_meters() {
        let (_store, index) = cross_index();
        let c = center_tile();

        // 0.1 tile east of the north arm; a z16 tile is about 428 m wide at this latitude
        let hits = index.links_near(point_in(c, 0.6, 0.25), 100.0);
        let (key, distance) = hits[0];
        assert_eq!(key, LinkKey::new(10, 12));
        assert!(distance > 38.0 && distance < 48.0, "got {}", distance);

        assert_eq!(index.nearest_link(point_in(c, 0.6, 0.25), 30.0), None);
    }
}
