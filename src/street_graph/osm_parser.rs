use geo::Point;
use serde::Deserialize;
use serde_json::Value;

/// Source-assigned OSM node id
pub type NodeId = u64;
/// Source-assigned OSM way id
pub type WayId = u64;

/// Node element with its position (x = lon, y = lat)
#[derive(Clone, Debug, PartialEq)]
pub struct RawNode {
    pub id: NodeId,
    pub position: Point<f64>,
}

/// Way element: ordered node list plus the centroid Overpass computes with `out center`
#[derive(Clone, Debug, PartialEq)]
pub struct RawWay {
    pub id: WayId,
    pub nodes: Vec<NodeId>,
    pub center: Option<Point<f64>>,
}

/// Decoded elements of one Overpass response
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OverpassElements {
    pub nodes: Vec<RawNode>,
    pub ways: Vec<RawWay>,
    /// Elements that could not be decoded and were dropped
    pub skipped: usize,
}

impl OverpassElements {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.ways.is_empty()
    }
}

// OSM JSON deserialization structures
#[derive(Debug, Deserialize)]
struct LatLon {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum OsmElement {
    #[serde(rename = "node")]
    Node { id: u64, lat: f64, lon: f64 },
    #[serde(rename = "way")]
    Way {
        id: u64,
        nodes: Vec<u64>,
        #[serde(default)]
        center: Option<LatLon>,
    },
    #[serde(other)]
    Other,
}

/// Parse an Overpass JSON response.
///
/// Only a body without a top-level `elements` array is an error. Each element is
/// decoded on its own, and broken ones are logged and counted in `skipped`.
pub fn parse_overpass_json(json: &str) -> Result<OverpassElements, String> {
    let mut body: Value =
        serde_json::from_str(json).map_err(|e| format!("Failed to parse Overpass JSON: {}", e))?;

    let elements = match body.get_mut("elements").map(Value::take) {
        Some(Value::Array(elements)) => elements,
        Some(_) => return Err("`elements` is not an array".to_string()),
        None => return Err("Response has no `elements` array".to_string()),
    };

    let mut parsed = OverpassElements::default();

    for (index, element) in elements.into_iter().enumerate() {
        match serde_json::from_value::<OsmElement>(element) {
            Ok(OsmElement::Node { id, lat, lon }) => {
                parsed.nodes.push(RawNode {
                    id,
                    position: Point::new(lon, lat),
                });
            }
            Ok(OsmElement::Way { id, nodes, center }) => {
                // A single point carries no street geometry
                if nodes.len() < 2 {
                    log::warn!("Skipping way {} with {} node(s)", id, nodes.len());
                    parsed.skipped += 1;
                    continue;
                }
                parsed.ways.push(RawWay {
                    id,
                    nodes,
                    center: center.map(|c| Point::new(c.lon, c.lat)),
                });
            }
            Ok(OsmElement::Other) => {}
            Err(e) => {
                log::warn!("Skipping malformed element #{}: {}", index, e);
                parsed.skipped += 1;
            }
        }
    }

    Ok(parsed)
}
