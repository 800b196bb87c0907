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

//! Contains the fundamental data structures for enhancement packets.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// The canonical time key of a packet, in seconds.
///
/// Today a key is the packet's start time verbatim. It is kept as its own type
/// so the discretization (e.g. snapping to 60ths of a second) can change
/// without touching the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeKey(f64);

impl TimeKey {
    pub fn from_time(timestamp: f64) -> Self {
        // -0.0 and 0.0 must hash the same.
        if timestamp == 0.0 {
            Self(0.0)
        } else {
            Self(timestamp)
        }
    }

    pub fn as_time(self) -> f64 {
        self.0
    }
}

impl PartialEq for TimeKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TimeKey {}

impl PartialOrd for TimeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for TimeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl fmt::Display for TimeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}

/// The rendition a packet belongs to.
///
/// On the wire a level is a plain integer where `-1` means "applies to every
/// rendition"; any negative value is read as [`Level::Any`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum Level {
    /// Valid for whichever rendition is currently playing.
    #[default]
    Any,
    /// A specific rendition id.
    Rendition(u32),
}

impl Level {
    /// Whether a packet tagged with `self` may be fed while `active` is playing.
    pub fn matches(self, active: Level) -> bool {
        match (self, active) {
            (Level::Any, _) | (_, Level::Any) => true,
            (Level::Rendition(a), Level::Rendition(b)) => a == b,
        }
    }
}

impl From<i32> for Level {
    fn from(raw: i32) -> Self {
        u32::try_from(raw).map_or(Level::Any, Level::Rendition)
    }
}

impl From<Level> for i32 {
    fn from(level: Level) -> Self {
        match level {
            Level::Any => -1,
            Level::Rendition(id) => i32::try_from(id).unwrap_or(i32::MAX),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Any => write!(f, "any"),
            Level::Rendition(id) => write!(f, "{id}"),
        }
    }
}

/// A demuxed enhancement sample as handed over by the producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancementSample {
    /// Presentation time in seconds.
    pub start_time: f64,
    /// Ticks per second of `duration`.
    pub timescale: u32,
    /// Duration in `timescale` ticks. Zero or negative means unknown.
    pub duration: f64,
    #[serde(default)]
    pub keyframe: bool,
    #[serde(default)]
    pub level: Level,
    #[serde(default)]
    pub payload: Bytes,
    /// Container-specific discretization hint, carried for diagnostics.
    #[serde(default)]
    pub discretization_hint: i32,
}

impl EnhancementSample {
    pub fn new(start_time: f64, timescale: u32, duration: f64, payload: impl Into<Bytes>) -> Self {
        Self {
            start_time,
            timescale,
            duration,
            keyframe: false,
            level: Level::Any,
            payload: payload.into(),
            discretization_hint: 0,
        }
    }

    pub fn keyframe(mut self, keyframe: bool) -> Self {
        self.keyframe = keyframe;
        self
    }

    pub fn level(mut self, level: impl Into<Level>) -> Self {
        self.level = level.into();
        self
    }

    pub fn discretization_hint(mut self, hint: i32) -> Self {
        self.discretization_hint = hint;
        self
    }

    /// Frames per second implied by the sample, substituting `default_duration`
    /// for a missing or malformed duration.
    pub fn frame_rate(&self, default_duration: f64) -> f64 {
        let duration = if self.duration.is_finite() && self.duration > 0.0 {
            self.duration
        } else {
            default_duration
        };
        self.timescale as f64 / duration
    }
}

/// One stored enhancement payload and the time interval it applies to.
///
/// The interval is half-open, `[start_time, end_time)`. The store narrows it
/// in place when later insertions overlap it.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub key: TimeKey,
    pub frame_rate: f64,
    pub start_time: f64,
    pub end_time: f64,
    pub keyframe: bool,
    pub level: Level,
    pub payload: Bytes,
}

impl Packet {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    /// Whether `timestamp` falls inside `[start_time, end_time)`.
    pub fn covers(&self, timestamp: f64) -> bool {
        self.start_time <= timestamp && timestamp < self.end_time
    }

    pub fn overlaps(&self, other: &Packet) -> bool {
        self.start_time < other.end_time && other.start_time < self.end_time
    }

    pub fn is_empty(&self) -> bool {
        self.end_time <= self.start_time
    }
}
