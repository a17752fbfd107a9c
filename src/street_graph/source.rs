use super::{FetchError, OverpassElements, StreetRating, TileCoord};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

/// Everything one fetch round trip yields for a batch of tiles
#[derive(Clone, Debug, Default)]
pub struct TileBatch {
    pub elements: OverpassElements,
    pub ratings: Vec<StreetRating>,
}

/// Remote street-geometry source, queried with a whole batch of tiles at once.
///
/// Implementations must be safe to call again with the same tiles after a failure.
pub trait TileSource {
    fn fetch_batch(
        &self,
        tiles: Vec<TileCoord>,
    ) -> impl Future<Output = Result<TileBatch, FetchError>> + Send;
}

impl<T> TileSource for Arc<T>
where
    T: TileSource + Send + Sync,
{
    async fn fetch_batch(&self, tiles: Vec<TileCoord>) -> Result<TileBatch, FetchError> {
        self.as_ref().fetch_batch(tiles).await
    }
}

/// Backend holding user street ratings, keyed by the tile of each rated link
pub trait RatingProvider {
    fn ratings_for_tiles(
        &self,
        tiles: &[TileCoord],
    ) -> impl Future<Output = Result<Vec<StreetRating>, FetchError>> + Send;
}

/// Provider for deployments without a ratings backend
#[derive(Clone, Copy, Debug, Default)]
pub struct NoRatings;

impl RatingProvider for NoRatings {
    async fn ratings_for_tiles(&self, _tiles: &[TileCoord]) -> Result<Vec<StreetRating>, FetchError> {
        Ok(Vec::new())
    }
}

/// Ratings held in memory, e.g. loaded from a JSON export
#[derive(Clone, Debug, Default)]
pub struct StaticRatings {
    ratings: Vec<StreetRating>,
    zoom: u8,
}

impl StaticRatings {
    pub fn new(ratings: Vec<StreetRating>, zoom: u8) -> Self {
        StaticRatings { ratings, zoom }
    }

    pub fn len(&self) -> usize {
        self.ratings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ratings.is_empty()
    }
}

impl RatingProvider for StaticRatings {
    async fn ratings_for_tiles(&self, tiles: &[TileCoord]) -> Result<Vec<StreetRating>, FetchError> {
        let wanted: HashSet<&TileCoord> = tiles.iter().collect();
        Ok(self
            .ratings
            .iter()
            .filter(|rating| wanted.contains(&rating.tile(self.zoom)))
            .cloned()
            .collect())
    }
}

/// Geometry source paired with a rating provider; both must succeed for the batch to land
pub struct RatedSource<G, R> {
    geometry: G,
    ratings: R,
}

impl<G, R> RatedSource<G, R> {
    pub fn new(geometry: G, ratings: R) -> Self {
        RatedSource { geometry, ratings }
    }
}

impl<G, R> TileSource for RatedSource<G, R>
where
    G: TileSource + Sync,
    R: RatingProvider + Sync,
{
    async fn fetch_batch(&self, tiles: Vec<TileCoord>) -> Result<TileBatch, FetchError> {
        let ratings = self.ratings.ratings_for_tiles(&tiles).await?;
        let mut batch = self.geometry.fetch_batch(tiles).await?;
        batch.ratings.extend(ratings);
        Ok(batch)
    }
}
