//! Swipe data model and the JSON schemas that cross process boundaries.
//!
//! Validation happens exactly once per boundary: [`SwipeRequest::validate`]
//! at the HTTP ingress and [`SwipeMessage::decode`] at the consumer. Inner
//! layers only ever see a typed [`SwipeEvent`].

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{ParseError, ValidationError};

/// Maximum comment size in bytes.
pub const MAX_COMMENT_BYTES: usize = 256;

/// Swipe direction. `right` is a like, `left` is a dislike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Like,
    Dislike,
}

impl Direction {
    /// Wire token used in URLs and broker messages.
    pub fn token(self) -> &'static str {
        match self {
            Direction::Like => "right",
            Direction::Dislike => "left",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for Direction {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "right" => Ok(Direction::Like),
            "left" => Ok(Direction::Dislike),
            other => Err(ParseError::Direction(other.to_string())),
        }
    }
}

// ── Ingress request ──────────────────────────────────────────────

/// Body of `POST /swipe/{direction}`. Ids arrive string-encoded.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct SwipeRequest {
    #[serde(default)]
    pub swiper: String,
    #[serde(default)]
    pub swipee: String,
    #[serde(default)]
    pub comment: String,
}

impl SwipeRequest {
    /// Validate the request together with the path-derived direction.
    ///
    /// Checks run in a fixed order: swiper, swipee, comment, direction.
    pub fn validate(self, direction: &str) -> Result<SwipeEvent, ValidationError> {
        let swiper_id = self
            .swiper
            .parse::<i64>()
            .map_err(|_| ValidationError::InvalidSwiper(self.swiper.clone()))?;
        let swipee_id = self
            .swipee
            .parse::<i64>()
            .map_err(|_| ValidationError::InvalidSwipee(self.swipee.clone()))?;
        if self.comment.len() > MAX_COMMENT_BYTES {
            return Err(ValidationError::CommentTooLong);
        }
        let direction = direction
            .parse::<Direction>()
            .map_err(|_| ValidationError::InvalidDirection(direction.to_string()))?;

        Ok(SwipeEvent {
            swiper_id,
            swipee_id,
            direction,
            comment: self.comment,
        })
    }
}

// ── Event + broker wire message ──────────────────────────────────

/// A validated swipe. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwipeEvent {
    pub swiper_id: i64,
    pub swipee_id: i64,
    pub direction: Direction,
    pub comment: String,
}

impl SwipeEvent {
    pub fn to_message(&self) -> SwipeMessage {
        SwipeMessage {
            swiper: self.swiper_id.to_string(),
            swipee: self.swipee_id.to_string(),
            comment: self.comment.clone(),
            direction: self.direction.token().to_string(),
        }
    }

    /// Serialize into the broker message body.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_message())
    }
}

/// Broker message body: `{"swiper", "swipee", "comment", "direction"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwipeMessage {
    pub swiper: String,
    pub swipee: String,
    #[serde(default)]
    pub comment: String,
    pub direction: String,
}

impl SwipeMessage {
    /// Parse a delivery body into a typed event. Any failure marks the
    /// delivery as poison.
    pub fn decode(body: &[u8]) -> Result<SwipeEvent, ParseError> {
        let msg: SwipeMessage =
            serde_json::from_slice(body).map_err(|e| ParseError::Json(e.to_string()))?;
        msg.into_event()
    }

    pub fn into_event(self) -> Result<SwipeEvent, ParseError> {
        let swiper_id = self.swiper.parse::<i64>().map_err(|_| ParseError::Id {
            field: "swiper",
            value: self.swiper.clone(),
        })?;
        let swipee_id = self.swipee.parse::<i64>().map_err(|_| ParseError::Id {
            field: "swipee",
            value: self.swipee.clone(),
        })?;
        let direction = self.direction.parse::<Direction>()?;
        Ok(SwipeEvent {
            swiper_id,
            swipee_id,
            direction,
            comment: self.comment,
        })
    }
}

// ── Aggregates ───────────────────────────────────────────────────

/// Per-user aggregate owned by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserAggregate {
    pub like_count: u64,
    pub dislike_count: u64,
    pub matches: BTreeSet<i64>,
}

impl UserAggregate {
    /// Apply one swipe. A like also records the swipee as a match; adding an
    /// existing match is a no-op.
    pub fn apply(&mut self, swipee_id: i64, direction: Direction) {
        match direction {
            Direction::Like => {
                self.like_count += 1;
                self.matches.insert(swipee_id);
            }
            Direction::Dislike => self.dislike_count += 1,
        }
    }

    pub fn stats(&self) -> UserStats {
        UserStats {
            num_likes: self.like_count,
            num_dislikes: self.dislike_count,
        }
    }

    pub fn match_list(&self) -> UserMatches {
        UserMatches {
            match_list: self.matches.iter().copied().collect(),
        }
    }
}

/// Response body of `GET /stats/{userId}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub num_likes: u64,
    pub num_dislikes: u64,
}

/// Response body of `GET /matches/{userId}`. Sorted ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserMatches {
    pub match_list: Vec<i64>,
}
