use geo::Point;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Zoom level used for street tiles. At z16 a tile is roughly 600 m wide at mid latitudes.
pub const DEFAULT_ZOOM: u8 = 16;

/// Deepest zoom the tile arithmetic supports
pub const MAX_ZOOM: u8 = 30;

/// Latitude limit of the Web Mercator projection
const MAX_MERCATOR_LAT: f64 = 85.05112878;

/// Slippy-map tile coordinate (Web Mercator, EPSG:3857)
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Debug, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
    pub zoom: u8,
}

impl TileCoord {
    pub fn new(x: u32, y: u32, zoom: u8) -> Self {
        TileCoord { x, y, zoom }
    }

    /// Converts WGS84 lat/lon (degrees) to the tile containing it
    ///
    /// Formula (https://wiki.openstreetmap.org/wiki/Slippy_map_tilenames):
    ///   n = 2^zoom
    ///   x = floor((lon + 180) / 360 * n)
    ///   y = floor((1 - asinh(tan(lat_rad)) / π) / 2 * n)
    pub fn from_latlon(lat: f64, lon: f64, zoom: u8) -> Self {
        let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);

        // Wrap lon to [-180, 180)
        let lon = ((lon + 180.0) % 360.0 + 360.0) % 360.0 - 180.0;

        let n = grid_size(zoom) as f64;

        let x = ((lon + 180.0) / 360.0 * n).floor() as u32;

        let lat_rad = lat.to_radians();
        let y_raw = (1.0 - lat_rad.tan().asinh() / std::f64::consts::PI) / 2.0 * n;
        let y = y_raw.max(0.0).floor() as u32;

        let max_tile = grid_size(zoom) - 1;
        TileCoord {
            x: x.min(max_tile),
            y: y.min(max_tile),
            zoom,
        }
    }

    /// Tile containing a `geo` point (x = lon, y = lat)
    pub fn from_point(point: Point<f64>, zoom: u8) -> Self {
        Self::from_latlon(point.y(), point.x(), zoom)
    }

    /// Bounding box of this tile as (south, west, north, east)
    pub fn bbox(&self) -> (f64, f64, f64, f64) {
        let n = grid_size(self.zoom) as f64;

        let west = self.x as f64 / n * 360.0 - 180.0;
        let east = (self.x + 1) as f64 / n * 360.0 - 180.0;

        // Tile rows grow southwards
        let north = mercator_y_to_lat(self.y, n);
        let south = mercator_y_to_lat(self.y + 1, n);

        (south, west, north, east)
    }

    pub fn bounds(&self) -> GeoBounds {
        let (south, west, north, east) = self.bbox();
        GeoBounds { south, west, north, east }
    }

    /// Geographic centre of the tile rectangle
    pub fn center(&self) -> Point<f64> {
        let (south, west, north, east) = self.bbox();
        Point::new((west + east) / 2.0, (south + north) / 2.0)
    }

    /// True if the point projects into this tile at this tile's zoom
    pub fn contains_point(&self, point: Point<f64>) -> bool {
        TileCoord::from_point(point, self.zoom) == *self
    }

    /// Returns the 8 surrounding tiles in a 3x3 grid (excluding center)
    ///
    /// Order: NW, N, NE, W, E, SW, S, SE
    /// Handles x wrapping (longitude), clips y at poles
    pub fn neighbors(&self) -> [TileCoord; 8] {
        let max_tile = grid_size(self.zoom) - 1;

        let wrap_x = |x: i64| -> u32 {
            let n = max_tile as i64 + 1;
            ((x + n) % n) as u32
        };

        let clamp_y = |y: i64| -> u32 { y.clamp(0, max_tile as i64) as u32 };

        let x = self.x as i64;
        let y = self.y as i64;
        let zoom = self.zoom;

        [
            // NW
            TileCoord { x: wrap_x(x - 1), y: clamp_y(y - 1), zoom },
            // N
            TileCoord { x: self.x, y: clamp_y(y - 1), zoom },
            // NE
            TileCoord { x: wrap_x(x + 1), y: clamp_y(y - 1), zoom },
            // W
            TileCoord { x: wrap_x(x - 1), y: self.y, zoom },
            // E
            TileCoord { x: wrap_x(x + 1), y: self.y, zoom },
            // SW
            TileCoord { x: wrap_x(x - 1), y: clamp_y(y + 1), zoom },
            // S
            TileCoord { x: self.x, y: clamp_y(y + 1), zoom },
            // SE
            TileCoord { x: wrap_x(x + 1), y: clamp_y(y + 1), zoom },
        ]
    }

    /// The full 3x3 block centred on this tile, centre first
    pub fn neighborhood(&self) -> [TileCoord; 9] {
        let n = self.neighbors();
        [*self, n[0], n[1], n[2], n[3], n[4], n[5], n[6], n[7]]
    }
}

impl Display for TileCoord {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "tile_{}_{}_z{}", self.x, self.y, self.zoom)
    }
}

/// Geographic rectangle in degrees, e.g. the visible map viewport
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl GeoBounds {
    pub fn new(south: f64, west: f64, north: f64, east: f64) -> Self {
        GeoBounds { south, west, north, east }
    }
}

/// Inclusive rectangle of tiles in tile-index space (`min.y` is the northern row).
///
/// When `min.x > max.x` the range crosses the antimeridian: its columns run east
/// from `min.x` to the last column of the grid, then on from column 0 to `max.x`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileRange {
    pub min: TileCoord,
    pub max: TileCoord,
}

impl TileRange {
    pub fn contains(&self, tile: &TileCoord) -> bool {
        let in_columns = if self.wraps() {
            tile.x >= self.min.x || tile.x <= self.max.x
        } else {
            (self.min.x..=self.max.x).contains(&tile.x)
        };
        tile.zoom == self.min.zoom && in_columns && (self.min.y..=self.max.y).contains(&tile.y)
    }

    /// Crosses the antimeridian
    pub fn wraps(&self) -> bool {
        self.min.x > self.max.x
    }

    /// Number of columns
    pub fn width(&self) -> usize {
        columns_between(self.min.x, self.max.x, self.min.zoom)
    }

    pub fn height(&self) -> usize {
        (self.max.y - self.min.y + 1) as usize
    }

    pub fn len(&self) -> usize {
        self.width() * self.height()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row-major walk over every tile in the range. Call again to restart.
    pub fn tiles(&self) -> TileRangeIter {
        TileRangeIter {
            range: *self,
            cursor: Some((self.min.x, self.min.y)),
        }
    }
}

impl<'a> IntoIterator for &'a TileRange {
    type Item = TileCoord;
    type IntoIter = TileRangeIter;

    fn into_iter(self) -> Self::IntoIter {
        self.tiles()
    }
}

/// Lazy row-major iterator over a [`TileRange`]
#[derive(Clone, Debug)]
pub struct TileRangeIter {
    range: TileRange,
    cursor: Option<(u32, u32)>,
}

impl Iterator for TileRangeIter {
    type Item = TileCoord;

    fn next(&mut self) -> Option<TileCoord> {
        let (x, y) = self.cursor?;
        let TileRange { min, max } = self.range;

        self.cursor = if x != max.x {
            Some(((x + 1) % grid_size(min.zoom), y))
        } else if y < max.y {
            Some((min.x, y + 1))
        } else {
            None
        };

        Some(TileCoord { x, y, zoom: min.zoom })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = match self.cursor {
            None => 0,
            Some((x, y)) => {
                let rows_after = (self.range.max.y - y) as usize;
                columns_between(x, self.range.max.x, self.range.min.zoom)
                    + rows_after * self.range.width()
            }
        };
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TileRangeIter {}

/// Converts a viewport into the inclusive tile rectangle covering it,
/// grown by one ring so tiles at the viewport edge can have complete neighborhoods.
///
/// A viewport with `west > east` crosses the antimeridian and yields a wrapping
/// range. Columns wrap like [`TileCoord::neighbors`]; rows clamp at the poles.
pub fn viewport_to_tile_range(bounds: &GeoBounds, zoom: u8) -> TileRange {
    let north_west = TileCoord::from_latlon(bounds.north, bounds.west, zoom);
    let south_east = TileCoord::from_latlon(bounds.south, bounds.east, zoom);
    let n = grid_size(zoom);
    let max_tile = n - 1;

    let min_y = north_west.y.min(south_east.y);
    let max_y = north_west.y.max(south_east.y);

    let span = if bounds.west <= bounds.east {
        bounds.east - bounds.west
    } else {
        bounds.east - bounds.west + 360.0
    };
    // Corners in one column with west > east means the viewport goes all the way round
    let inner = if bounds.west > bounds.east && north_west.x <= south_east.x {
        n as usize
    } else {
        columns_between(north_west.x, south_east.x, zoom)
    };
    let columns = inner + 2;

    let (min_x, max_x) = if span >= 360.0 || columns >= n as usize {
        (0, max_tile)
    } else {
        ((north_west.x + max_tile) % n, (south_east.x + 1) % n)
    };

    TileRange {
        min: TileCoord::new(min_x, min_y.saturating_sub(1), zoom),
        max: TileCoord::new(max_x, (max_y + 1).min(max_tile), zoom),
    }
}

/// Columns from `from` east to `to`, both included, wrapping at the antimeridian
fn columns_between(from: u32, to: u32, zoom: u8) -> usize {
    let n = grid_size(zoom) as u64;
    ((to as u64 + n - from as u64) % n + 1) as usize
}

fn grid_size(zoom: u8) -> u32 {
    assert!(zoom <= MAX_ZOOM, "zoom {} is deeper than the maximum of {}", zoom, MAX_ZOOM);
    1u32 << zoom
}

/// Convert Web Mercator y tile coordinate to latitude
fn mercator_y_to_lat(y: u32, n: f64) -> f64 {
    let y_mercator = std::f64::consts::PI * (1.0 - 2.0 * y as f64 / n);
    y_mercator.sinh().atan().to_degrees()
}
