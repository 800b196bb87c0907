/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Tunables for the packet store and the decode orchestrator.

use serde::{Deserialize, Serialize};

use crate::packet::Level;
use crate::{ResidualError, Result};

/// Packet store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Width of a bucket in seconds. Must be at least one frame period of the
    /// lowest supported frame rate.
    pub bucket_size: f64,
    /// Duration, in timescale ticks, assumed when a sample carries none
    pub default_duration: f64,
    /// First-keyframe offsets at or above this are reported as the minimum
    /// offset unless the stream is live
    pub max_keyframe_offset: f64,
    /// Live streams report the first keyframe offset unclamped
    pub live: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bucket_size: 1.0,
            default_duration: 3000.0,
            max_keyframe_offset: 2.0,
            live: false,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.bucket_size.is_finite() && self.bucket_size > 0.0) {
            return Err(ResidualError::InvalidConfig(format!(
                "bucket_size must be a positive number of seconds, got {}",
                self.bucket_size
            )));
        }
        if !(self.default_duration.is_finite() && self.default_duration > 0.0) {
            return Err(ResidualError::InvalidConfig(format!(
                "default_duration must be positive, got {}",
                self.default_duration
            )));
        }
        if self.max_keyframe_offset.is_nan() {
            return Err(ResidualError::InvalidConfig(
                "max_keyframe_offset is NaN".to_string(),
            ));
        }
        Ok(())
    }
}

/// Decode orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Rendition fed to the decoder. Packets tagged for other renditions are skipped.
    pub level: Level,
    /// Packets of history replayed to bridge a gap during playback
    pub max_gap_packets: u32,
    /// Buckets searched backwards for a keyframe on seek or pause
    pub max_buckets_back: u32,
    /// Buckets searched backwards for the keyframe replayed by a reset
    pub reset_lookback_buckets: u32,
    /// Decimal places used when testing whether a packet covers the render time
    pub timestamp_precision: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            level: Level::Any,
            max_gap_packets: 10,
            max_buckets_back: 5,
            reset_lookback_buckets: 5,
            timestamp_precision: 3,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timestamp_precision > 9 {
            return Err(ResidualError::InvalidConfig(format!(
                "timestamp_precision above 9 decimals is meaningless, got {}",
                self.timestamp_precision
            )));
        }
        Ok(())
    }
}
