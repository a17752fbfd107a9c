use super::{LinkKey, NodeId, TileCoord};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_STREET_RATING: f32 = 5.0;
pub const NUM_CONSIDERED_RATINGS: usize = 5;

/// Colour for links nobody has rated yet
pub const UNRATED_COLOR: &str = "#9C9C9C";

/// One user rating of a link, as stored by the ratings backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreetRating {
    pub start: NodeId,
    pub end: NodeId,
    pub rating: i16,
    pub user_id: String,
    pub tile_x: u32,
    pub tile_y: u32,
    pub timestamp: Option<DateTime<Utc>>,
}

impl StreetRating {
    pub fn link_key(&self) -> LinkKey {
        LinkKey::new(self.start, self.end)
    }

    /// Tile owning the rated link
    pub fn tile(&self, zoom: u8) -> TileCoord {
        TileCoord::new(self.tile_x, self.tile_y, zoom)
    }
}

/// Display-ready fold of a link's ratings
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct LinkScore {
    pub score: Option<f32>,
    pub fading: bool,
}

impl LinkScore {
    pub fn from_ratings(ratings: &[StreetRating], considered: usize, now: DateTime<Utc>) -> Self {
        LinkScore {
            score: segment_score(ratings, considered),
            fading: is_rating_fading(most_recent(ratings, considered), now),
        }
    }
}

/// Weighted average of the `considered` most recent ratings.
///
/// Every rating weighs double the one before it, so the newest dominates.
pub fn segment_score(ratings: &[StreetRating], considered: usize) -> Option<f32> {
    let recent = most_recent(ratings, considered);
    if recent.is_empty() {
        return None;
    }

    let mut total_weight = 0.0f32;
    let mut weighted_sum = 0.0f32;
    for (i, rating) in recent.iter().enumerate() {
        let weight = 2.0f32.powi(i as i32);
        total_weight += weight;
        weighted_sum += rating.rating as f32 * weight;
    }

    (total_weight > 0.0).then(|| weighted_sum / total_weight)
}

/// The `considered` newest ratings, oldest first. Ratings without a timestamp sort oldest.
fn most_recent(ratings: &[StreetRating], considered: usize) -> Vec<&StreetRating> {
    let mut by_age: Vec<&StreetRating> = ratings.iter().collect();
    by_age.sort_by_key(|r| r.timestamp);
    by_age.split_off(by_age.len().saturating_sub(considered))
}

/// True if any rating is at least one whole month old. Undated ratings count as old.
pub fn is_rating_fading<'a>(
    ratings: impl IntoIterator<Item = &'a StreetRating>,
    now: DateTime<Utc>,
) -> bool {
    ratings.into_iter().any(|rating| {
        rating
            .timestamp
            .map_or(1, |ts| whole_months_between(ts, now))
            > 0
    })
}

/// Calendar months from `from` to `to`, truncated towards zero
fn whole_months_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i32 {
    let mut months = (to.year() - from.year()) * 12 + to.month() as i32 - from.month() as i32;

    let to_in_month = (to.day(), to.time());
    let from_in_month = (from.day(), from.time());
    if months > 0 && to_in_month < from_in_month {
        months -= 1;
    } else if months < 0 && to_in_month > from_in_month {
        months += 1;
    }

    months
}

/// Red → yellow → green ramp over `[0, MAX_STREET_RATING]`, as `#RRGGBB`
pub fn street_color(score: Option<f32>) -> String {
    static STOPS: [(f32, [f32; 3]); 3] = [
        (0.0, [255.0, 0.0, 0.0]),
        (0.5, [255.0, 255.0, 0.0]),
        (1.0, [0.0, 255.0, 0.0]),
    ];

    let Some(score) = score else {
        return UNRATED_COLOR.to_string();
    };

    let alpha = score / MAX_STREET_RATING;
    let Some(stops) = STOPS
        .windows(2)
        .find(|pair| alpha >= pair[0].0 && alpha <= pair[1].0)
    else {
        return UNRATED_COLOR.to_string();
    };

    let (a0, c0) = stops[0];
    let (a1, c1) = stops[1];
    let t = (alpha - a0) / (a1 - a0);

    let channel = |i: usize| (c0[i] + (c1[i] - c0[i]) * t).round() as u8;
    format!("#{:02X}{:02X}{:02X}", channel(0), channel(1), channel(2))
}

/// A track is as good as its worst scored segment; unscored segments are ignored
pub fn track_score(segment_scores: impl IntoIterator<Item = Option<f32>>) -> Option<f32> {
    segment_scores
        .into_iter()
        .flatten()
        .fold(None, |lowest: Option<f32>, score| {
            Some(lowest.map_or(score, |l| l.min(score)))
        })
}
