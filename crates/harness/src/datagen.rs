//! Random swipe traffic.

use rand::distributions::Alphanumeric;
use rand::Rng;

use twinder_core::{Direction, SwipeRequest, MAX_COMMENT_BYTES};

pub const SWIPER_RANGE: std::ops::RangeInclusive<i64> = 1..=5000;
pub const SWIPEE_RANGE: std::ops::RangeInclusive<i64> = 1..=1_000_000;

/// Coin flip between like and dislike.
pub fn random_direction<R: Rng + ?Sized>(rng: &mut R) -> Direction {
    if rng.gen_bool(0.5) {
        Direction::Like
    } else {
        Direction::Dislike
    }
}

/// A user id that the write pool may have swiped as.
pub fn random_user_id<R: Rng + ?Sized>(rng: &mut R) -> i64 {
    rng.gen_range(SWIPER_RANGE)
}

pub fn random_comment<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn random_request<R: Rng + ?Sized>(rng: &mut R) -> SwipeRequest {
    SwipeRequest {
        swiper: rng.gen_range(SWIPER_RANGE).to_string(),
        swipee: rng.gen_range(SWIPEE_RANGE).to_string(),
        comment: random_comment(rng, MAX_COMMENT_BYTES),
    }
}
