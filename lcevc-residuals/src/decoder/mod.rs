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

//! The seam between the orchestrator and an LCEVC decoder.
//!
//! A backend owns whatever global resources it needs and hands out opaque
//! handles, one per decode session. The orchestrator only ever holds one.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::packet::{Level, TimeKey};

mod mock;
pub use self::mock::{DecoderEvent, MockDecoder, MockHandle};

/// Raw status code used by decoders for a generic bitstream error.
pub const GENERIC_STREAM_ERROR: i32 = 3;

/// Decoder status codes the orchestrator distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The bitstream could not be interpreted in the current decoder state,
    /// usually because global configuration is missing.
    GenericStream,
    /// The handle was used after being closed.
    Closed,
    Other(i32),
}

impl ErrorCode {
    pub fn from_raw(code: i32) -> Self {
        match code {
            GENERIC_STREAM_ERROR => ErrorCode::GenericStream,
            code => ErrorCode::Other(code),
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            ErrorCode::GenericStream => GENERIC_STREAM_ERROR,
            ErrorCode::Closed => -1,
            ErrorCode::Other(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::GenericStream => write!(f, "generic stream error"),
            ErrorCode::Closed => write!(f, "decoder closed"),
            ErrorCode::Other(code) => write!(f, "decoder error {code}"),
        }
    }
}

/// What the decoder learned from parsing one enhancement payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PictureInfo {
    pub width: u32,
    pub height: u32,
    /// Enhancement uses 1D transforms rather than 2D.
    pub is_1d: bool,
    pub has_base: bool,
    pub has_high: bool,
}

/// Residual plane produced by one of the enhancement sub-layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    #[serde(skip)]
    pub data: Vec<u8>,
}

/// The decoded enhancement for one render timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedInfo {
    pub key: TimeKey,
    pub start_time: f64,
    pub end_time: f64,
    pub keyframe: bool,
    pub level: Level,
    pub picture: PictureInfo,
    pub base: Option<PixelBuffer>,
    pub high: Option<PixelBuffer>,
    /// Keys fed to the decoder to produce this frame, oldest first. Bridging
    /// packets come before the target.
    pub parse_log: Vec<TimeKey>,
}

/// A decoder the orchestrator can drive.
///
/// All calls happen on one thread, one at a time. Handles are owned by the
/// caller and must be given back to `close`.
pub trait DecoderBackend {
    type Handle;

    /// Creates a fresh decode session.
    fn open(&mut self) -> Result<Self::Handle, ErrorCode>;

    fn close(&mut self, handle: Self::Handle);

    /// Forgets accumulated temporal residuals so the next frame can only
    /// build on a keyframe. Global configuration survives.
    fn clear_temporal_state(&mut self, handle: &mut Self::Handle, level: Level);

    /// Feeds one enhancement payload.
    fn parse(&mut self, handle: &mut Self::Handle, payload: &[u8]) -> Result<PictureInfo, ErrorCode>;

    /// Residuals of the base sub-layer for the last parsed payload.
    fn decode_base(&mut self, handle: &mut Self::Handle) -> Result<PixelBuffer, ErrorCode>;

    /// Residuals of the high sub-layer for the last parsed payload.
    fn decode_high(&mut self, handle: &mut Self::Handle) -> Result<PixelBuffer, ErrorCode>;

    /// Status of the session's most recent call, consulted when `parse`
    /// fails.
    fn last_error(&self, handle: &Self::Handle) -> Option<ErrorCode>;
}
