//! Retry backoff strategies.
//!
//! A strategy is a pure function of the retry attempt about to occur
//! (0-indexed) returning a non-negative delay. Strategies are enumerated
//! configuration records: the variant is selected by tag, and an unknown tag
//! fails deserialization rather than falling back to a default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Jitter applied to an exponential delay after the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// No jitter; the capped delay is used as-is.
    #[default]
    None,
    /// `floor(U * cap)` for uniform `U ∈ [0, 1)`.
    Full,
    /// `cap/2 + U * cap/2` for uniform `U ∈ [0, 1)`.
    Equal,
}

/// Backoff strategy configuration.
///
/// All delays are in milliseconds. Arithmetic saturates; a strategy never
/// overflows for large attempt numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategyOptions {
    /// Retry immediately.
    #[default]
    None,

    /// Constant delay between attempts.
    Fixed { delay_ms: u64 },

    /// `base + increment * attempt`.
    Linear {
        #[serde(default)]
        base_delay_ms: u64,
        increment_ms: u64,
    },

    /// `base * 2^attempt`, capped at `max_delay_ms`, then jittered.
    Exponential {
        base_delay_ms: u64,
        #[serde(default)]
        max_delay_ms: Option<u64>,
        #[serde(default)]
        jitter: Jitter,
    },
}

impl BackoffStrategyOptions {
    /// Delay before the given retry attempt (0-indexed: the attempt about
    /// to occur).
    pub fn delay(&self, retry_attempt: u32) -> Duration {
        let millis = match self {
            BackoffStrategyOptions::None => 0,
            BackoffStrategyOptions::Fixed { delay_ms } => *delay_ms,
            BackoffStrategyOptions::Linear {
                base_delay_ms,
                increment_ms,
            } => base_delay_ms.saturating_add(increment_ms.saturating_mul(u64::from(retry_attempt))),
            BackoffStrategyOptions::Exponential {
                base_delay_ms,
                max_delay_ms,
                jitter,
            } => {
                let factor = 1u64.checked_shl(retry_attempt).unwrap_or(u64::MAX);
                let exponential = base_delay_ms.saturating_mul(factor);
                let capped = max_delay_ms.map_or(exponential, |max| exponential.min(max));
                match jitter {
                    Jitter::None => capped,
                    Jitter::Full => (fastrand::f64() * capped as f64) as u64,
                    Jitter::Equal => capped / 2 + (fastrand::f64() * (capped as f64 / 2.0)) as u64,
                }
            }
        };

        Duration::from_millis(millis)
    }
}
