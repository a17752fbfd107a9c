use super::{
    viewport_to_tile_range, FetchError, GeoBounds, GraphStore, MergeReport, TileBatch, TileCoord,
};
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Where a tile is in the load pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileState {
    Absent,
    Queued,
    InFlight,
    Loaded,
}

/// Exponential backoff between failed batch fetches
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    /// Consecutive failures after which the batch is dropped; `None` never gives up
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base_delay: Duration::from_secs(2),
            factor: 2.0,
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failures`-th consecutive failure: base * factor^(failures-1), capped
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    pub fn gives_up_after(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }
}

/// Result of resolving the outstanding batch
#[derive(Debug, PartialEq)]
pub enum BatchOutcome {
    Merged(MergeReport),
    /// Tiles went back to the queue; nothing is sent before `delay` elapses
    Retrying {
        error: FetchError,
        attempt: u32,
        delay: Duration,
    },
    /// Attempt cap reached; the tiles are absent again
    Abandoned { error: FetchError, tiles: Vec<TileCoord> },
    /// No batch was outstanding
    Unexpected,
}

/// Queue of tiles waiting to be fetched, with at most one batch in flight.
///
/// # Lifecycle
/// Absent -> Queued -> InFlight -> Loaded, and back to Absent on unload. A failed
/// batch goes back to Queued behind a backoff delay. Reloading or unloading an
/// in-flight tile is deferred until its batch resolves; the latest request wins.
pub struct TileLoadPipeline {
    zoom: u8,
    pending: VecDeque<TileCoord>,
    queued: HashSet<TileCoord>,
    in_flight: Option<Vec<TileCoord>>,
    deferred_reloads: HashSet<TileCoord>,
    deferred_unloads: HashSet<TileCoord>,
    retry: RetryPolicy,
    failures: u32,
    retry_at: Option<Instant>,
}

impl TileLoadPipeline {
    pub fn new(zoom: u8, retry: RetryPolicy) -> Self {
        TileLoadPipeline {
            zoom,
            pending: VecDeque::new(),
            queued: HashSet::new(),
            in_flight: None,
            deferred_reloads: HashSet::new(),
            deferred_unloads: HashSet::new(),
            retry,
            failures: 0,
            retry_at: None,
        }
    }

    pub fn tile_state(&self, store: &GraphStore, tile: TileCoord) -> TileState {
        if self.is_in_flight(tile) {
            TileState::InFlight
        } else if self.queued.contains(&tile) {
            TileState::Queued
        } else if store.is_loaded(tile) {
            TileState::Loaded
        } else {
            TileState::Absent
        }
    }

    fn is_in_flight(&self, tile: TileCoord) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|batch| batch.contains(&tile))
    }

    /// Queue tiles that are not loaded, in flight or already queued.
    /// Returns how many were added.
    pub fn queue_tiles(
        &mut self,
        store: &GraphStore,
        tiles: impl IntoIterator<Item = TileCoord>,
    ) -> usize {
        let mut added = 0;
        for tile in tiles {
            if self.tile_state(store, tile) == TileState::Absent {
                self.push(tile);
                added += 1;
            }
        }
        added
    }

    /// Queue every tile of the viewport plus one ring around it
    pub fn queue_viewport(&mut self, store: &GraphStore, bounds: &GeoBounds) -> usize {
        let range = viewport_to_tile_range(bounds, self.zoom);
        self.queue_tiles(store, range.tiles())
    }

    /// Evict and requeue tiles. In-flight tiles are handled once their batch resolves.
    pub fn force_reload(
        &mut self,
        store: &mut GraphStore,
        tiles: impl IntoIterator<Item = TileCoord>,
    ) -> usize {
        let mut count = 0;
        for tile in tiles {
            if self.is_in_flight(tile) {
                log::debug!("Deferring reload of in-flight {}", tile);
                self.deferred_unloads.remove(&tile);
                self.deferred_reloads.insert(tile);
            } else {
                store.evict_tile(tile);
                if !self.queued.contains(&tile) {
                    self.push(tile);
                }
            }
            count += 1;
        }
        count
    }

    /// Forget tiles: loaded ones are evicted, queued ones leave the queue and
    /// in-flight ones are evicted when their batch resolves.
    /// Returns how many of them were loaded, queued or in flight.
    pub fn unload_tiles(
        &mut self,
        store: &mut GraphStore,
        tiles: impl IntoIterator<Item = TileCoord>,
    ) -> usize {
        let tiles: HashSet<TileCoord> = tiles.into_iter().collect();
        let mut dequeued = HashSet::new();
        let mut count = 0;

        for tile in tiles {
            match self.tile_state(store, tile) {
                TileState::Absent => continue,
                TileState::Queued => {
                    self.queued.remove(&tile);
                    dequeued.insert(tile);
                }
                TileState::InFlight => {
                    log::debug!("Deferring unload of in-flight {}", tile);
                    self.deferred_reloads.remove(&tile);
                    self.deferred_unloads.insert(tile);
                }
                TileState::Loaded => {
                    store.evict_tile(tile);
                }
            }
            count += 1;
        }

        if !dequeued.is_empty() {
            self.pending.retain(|tile| !dequeued.contains(tile));
        }
        if count > 0 {
            log::info!("Unloaded {} tile(s)", count);
        }
        count
    }

    /// Unload every tile outside the viewport and its surrounding ring
    pub fn unload_outside(&mut self, store: &mut GraphStore, bounds: &GeoBounds) -> usize {
        let keep = viewport_to_tile_range(bounds, self.zoom);
        let outside: Vec<TileCoord> = store
            .loaded_tiles()
            .chain(self.pending.iter().copied())
            .chain(self.in_flight.iter().flatten().copied())
            .filter(|tile| !keep.contains(tile))
            .collect();
        self.unload_tiles(store, outside)
    }

    fn push(&mut self, tile: TileCoord) {
        if self.queued.insert(tile) {
            self.pending.push_back(tile);
        }
    }

    /// Take every queued tile as the next batch, unless one is in flight or the
    /// backoff delay has not elapsed
    pub fn next_batch(&mut self, now: Instant) -> Option<Vec<TileCoord>> {
        if self.in_flight.is_some() || self.pending.is_empty() {
            return None;
        }
        if self.retry_at.is_some_and(|at| now < at) {
            return None;
        }

        let batch: Vec<TileCoord> = self.pending.drain(..).collect();
        self.queued.clear();
        self.in_flight = Some(batch.clone());
        Some(batch)
    }

    /// When the backoff delay ends, if the pipeline is waiting on one
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Resolve the outstanding batch: merge on success, requeue with backoff on failure
    pub fn complete_batch(
        &mut self,
        store: &mut GraphStore,
        result: Result<TileBatch, FetchError>,
        now: Instant,
    ) -> BatchOutcome {
        let Some(tiles) = self.in_flight.take() else {
            log::warn!("Batch completed while none was in flight");
            return BatchOutcome::Unexpected;
        };

        let reloads: Vec<TileCoord> = tiles
            .iter()
            .copied()
            .filter(|tile| self.deferred_reloads.remove(tile))
            .collect();
        let unloads: HashSet<TileCoord> = tiles
            .iter()
            .copied()
            .filter(|tile| self.deferred_unloads.remove(tile))
            .collect();

        match result {
            Ok(batch) => {
                self.failures = 0;
                self.retry_at = None;
                let report = store.merge_batch(&tiles, batch);

                for tile in reloads {
                    store.evict_tile(tile);
                    self.push(tile);
                }
                for &tile in &unloads {
                    store.evict_tile(tile);
                }
                BatchOutcome::Merged(report)
            }
            Err(error) => {
                self.failures += 1;

                if self.retry.gives_up_after(self.failures) {
                    log::error!(
                        "Giving up on {} tile(s) after {} failed attempt(s): {}",
                        tiles.len(),
                        self.failures,
                        error
                    );
                    self.failures = 0;
                    self.retry_at = None;
                    return BatchOutcome::Abandoned { error, tiles };
                }

                let delay = self.retry.delay_for(self.failures);
                log::warn!(
                    "Fetch of {} tile(s) failed (attempt {}): {}; retrying in {:.1}s",
                    tiles.len(),
                    self.failures,
                    error,
                    delay.as_secs_f64()
                );

                // Failed tiles go back ahead of anything queued meanwhile
                for tile in tiles.into_iter().rev() {
                    if unloads.contains(&tile) {
                        continue;
                    }
                    if self.queued.insert(tile) {
                        self.pending.push_front(tile);
                    }
                }
                self.retry_at = Some(now + delay);

                BatchOutcome::Retrying {
                    error,
                    attempt: self.failures,
                    delay,
                }
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight(&self) -> Option<&[TileCoord]> {
        self.in_flight.as_deref()
    }

    /// Nothing queued and nothing in flight
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_none()
    }
}
