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

use thiserror::Error;

use crate::decoder::ErrorCode;

/// Result type for residual store and orchestration operations
pub type Result<T> = std::result::Result<T, ResidualError>;

/// Errors that can surface from the residual pipeline.
///
/// Lookup misses, unbridgeable gaps and integrity failures are not errors:
/// they show up as `Ok(None)` from the parse calls.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResidualError {
    #[error("Decoder is busy with another parse request, try again")]
    Busy,

    #[error("No keyframe found at or before {timestamp}s within the lookback window")]
    NoKeyframe { timestamp: f64 },

    #[error("Failed to open decoder: {0}")]
    DecoderOpen(String),

    #[error("Decoder is not open")]
    DecoderClosed,

    #[error("Keyframe replay at {timestamp}s failed with {code}")]
    KeyframeReplay { timestamp: f64, code: ErrorCode },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
