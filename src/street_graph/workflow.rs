//! Interactive flows built on the graph queries: selecting a run of streets to
//! rate, and snapping a recorded ride onto the street network.

use super::{track_score, GraphView, Link, LinkKey, NodeId, StreetRating, TileCoord, MAX_STREET_RATING};
use chrono::{DateTime, Utc};
use geo::Point;
use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionState {
    Inactive,
    /// Waiting for the first link to be tapped
    TapStreet,
    /// Handles at both ends of the selection can be dragged
    DefineLength,
    Rate,
}

/// End of the selection a handle sits on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handle {
    Head,
    Tail,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DragResult {
    /// Handle stayed on its intersection, or the drag was not allowed
    Unchanged,
    /// Selection grew by one link
    Extended(LinkKey),
    /// Handle went back over the selection; these links were dropped
    Trimmed(Vec<LinkKey>),
}

/// Ratings to store and the tiles to reload so they show up
#[derive(Clone, Debug, PartialEq)]
pub struct RatingSubmission {
    pub ratings: Vec<StreetRating>,
    pub tiles: Vec<TileCoord>,
}

/// Selection of consecutive links to rate, as a chain of intersections
#[derive(Clone, Debug)]
pub struct StreetSelection {
    state: SelectionState,
    chain: VecDeque<NodeId>,
}

impl Default for StreetSelection {
    fn default() -> Self {
        Self::new()
    }
}

impl StreetSelection {
    pub fn new() -> Self {
        StreetSelection {
            state: SelectionState::Inactive,
            chain: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SelectionState {
        self.state
    }

    pub fn start(&mut self) {
        self.chain.clear();
        self.state = SelectionState::TapStreet;
    }

    /// Select the tapped link and move on to adjusting its length
    pub fn tap_link(&mut self, key: LinkKey) -> bool {
        if self.state != SelectionState::TapStreet {
            return false;
        }
        self.chain = VecDeque::from([key.first(), key.second()]);
        self.state = SelectionState::DefineLength;
        true
    }

    pub fn handle_node(&self, handle: Handle) -> Option<NodeId> {
        match handle {
            Handle::Head => self.chain.front().copied(),
            Handle::Tail => self.chain.back().copied(),
        }
    }

    /// Snap a dragged handle to the nearest intersection linked to it.
    ///
    /// Landing on an intersection already in the selection trims everything
    /// beyond it; otherwise the selection is extended by the new link.
    pub fn drag_handle(&mut self, view: &GraphView<'_>, handle: Handle, point: Point<f64>) -> DragResult {
        if self.state != SelectionState::DefineLength {
            return DragResult::Unchanged;
        }
        let Some(anchor) = self.handle_node(handle) else {
            return DragResult::Unchanged;
        };
        let Some(snapped) = view.drag_handle(point, anchor) else {
            return DragResult::Unchanged;
        };
        if snapped == anchor {
            return DragResult::Unchanged;
        }

        let mut dropped = Vec::new();
        match handle {
            Handle::Head => {
                if let Some(index) = self.chain.iter().position(|&n| n == snapped) {
                    for _ in 0..index {
                        if let (Some(a), Some(b)) = (self.chain.pop_front(), self.chain.front()) {
                            dropped.push(LinkKey::new(a, *b));
                        }
                    }
                }
            }
            Handle::Tail => {
                if let Some(index) = self.chain.iter().rposition(|&n| n == snapped) {
                    while self.chain.len() > index + 1 {
                        if let (Some(b), Some(a)) = (self.chain.pop_back(), self.chain.back()) {
                            dropped.push(LinkKey::new(*a, b));
                        }
                    }
                }
            }
        }
        if !dropped.is_empty() {
            return DragResult::Trimmed(dropped);
        }

        match handle {
            Handle::Head => self.chain.push_front(snapped),
            Handle::Tail => self.chain.push_back(snapped),
        }
        DragResult::Extended(LinkKey::new(anchor, snapped))
    }

    /// Links between consecutive intersections of the selection, head to tail
    pub fn selected_links(&self) -> Vec<LinkKey> {
        self.chain
            .iter()
            .zip(self.chain.iter().skip(1))
            .map(|(a, b)| LinkKey::new(*a, *b))
            .collect()
    }

    pub fn confirm(&mut self) -> bool {
        if self.state != SelectionState::DefineLength {
            return false;
        }
        self.state = SelectionState::Rate;
        true
    }

    /// Step back one state; going back from adjusting drops the selection
    pub fn back(&mut self) {
        self.state = match self.state {
            SelectionState::Inactive | SelectionState::TapStreet => {
                self.chain.clear();
                SelectionState::Inactive
            }
            SelectionState::DefineLength => {
                self.chain.clear();
                SelectionState::TapStreet
            }
            SelectionState::Rate => SelectionState::DefineLength,
        };
    }

    pub fn finish(&mut self) {
        self.chain.clear();
        self.state = SelectionState::Inactive;
    }

    /// Turn the selection into one rating per link and finish.
    ///
    /// Links that no longer exist in the graph are left out. Returns `None`
    /// outside the rating step.
    pub fn submit(
        &mut self,
        view: &GraphView<'_>,
        stars: f32,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Option<RatingSubmission> {
        if self.state != SelectionState::Rate {
            return None;
        }

        let rating = stars.clamp(0.0, MAX_STREET_RATING).round() as i16;
        let mut submission = RatingSubmission {
            ratings: Vec::new(),
            tiles: Vec::new(),
        };

        for key in self.selected_links() {
            let Some(tile) = view.link_tile(key) else {
                log::debug!("Skipping rating of vanished link {}", key);
                continue;
            };
            submission.ratings.push(StreetRating {
                start: key.first(),
                end: key.second(),
                rating,
                user_id: user_id.to_string(),
                tile_x: tile.x,
                tile_y: tile.y,
                timestamp: Some(now),
            });
            if !submission.tiles.contains(&tile) {
                submission.tiles.push(tile);
            }
        }

        self.finish();
        Some(submission)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    Finished,
}

/// Ride recorder snapping location fixes to nodes on links
#[derive(Clone, Debug)]
pub struct TrackRecorder {
    state: RecorderState,
    nodes: Vec<NodeId>,
}

impl Default for TrackRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackRecorder {
    pub fn new() -> Self {
        TrackRecorder {
            state: RecorderState::Idle,
            nodes: Vec::new(),
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn start(&mut self) {
        self.nodes.clear();
        self.state = RecorderState::Recording;
    }

    /// Record a location fix. Returns the node appended, if the fix reached a new one.
    pub fn on_location(&mut self, view: &GraphView<'_>, location: Point<f64>) -> Option<NodeId> {
        if self.state != RecorderState::Recording {
            return None;
        }
        let nearest = view.nearest_link_node(location)?;
        if self.nodes.last() == Some(&nearest) {
            return None;
        }
        self.nodes.push(nearest);
        Some(nearest)
    }

    pub fn stop(&mut self) {
        if self.state == RecorderState::Recording {
            self.state = RecorderState::Finished;
        }
    }

    /// Drop the track and go back to idle
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.state = RecorderState::Idle;
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Keys of the links the track runs along, in riding order.
    /// Steps between nodes that no loaded link joins are left out.
    pub fn segments(&self, view: &GraphView<'_>) -> Vec<LinkKey> {
        let mut keys: Vec<LinkKey> = Vec::new();
        for link in self.step_links(*view).into_iter().flatten() {
            if keys.last() != Some(&link.key) {
                keys.push(link.key);
            }
        }
        keys
    }

    /// Lowest score among the links the track runs along
    pub fn score(&self, view: &GraphView<'_>) -> Option<f32> {
        let scores = self
            .step_links(*view)
            .into_iter()
            .map(|link| link.and_then(|link| link.metadata.rating.score));
        track_score(scores)
    }

    /// Link holding each step between consecutive recorded nodes
    fn step_links<'a>(&self, view: GraphView<'a>) -> Vec<Option<&'a Link>> {
        self.nodes
            .windows(2)
            .map(|pair| {
                let step = LinkKey::new(pair[0], pair[1]);
                view.links().find(|link| {
                    link.nodes
                        .windows(2)
                        .any(|edge| LinkKey::new(edge[0], edge[1]) == step)
                })
            })
            .collect()
    }
}
