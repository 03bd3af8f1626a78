use thiserror::Error;

/// Startup configuration problems. Always fatal.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing mandatory setting: {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// A swipe request that failed boundary validation.
///
/// The `Display` text is exactly what the ingress returns in `{"message": ...}`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("bad request")]
    Malformed,

    #[error("invalid swiper: {0}")]
    InvalidSwiper(String),

    #[error("invalid swipee: {0}")]
    InvalidSwipee(String),

    #[error("comment too long")]
    CommentTooLong,

    #[error("not left or right: {0}")]
    InvalidDirection(String),
}

/// A broker delivery whose body is not a valid swipe message (poison).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid JSON body: {0}")]
    Json(String),

    #[error("invalid {field} id: {value}")]
    Id { field: &'static str, value: String },

    #[error("unknown direction: {0}")]
    Direction(String),
}
