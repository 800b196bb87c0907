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

//! # LCEVC residuals
//!
//! Time-indexed storage for LCEVC enhancement packets and the logic that
//! feeds them to a decoder in a temporally consistent order.
//!
//! A producer inserts demuxed samples into a [`PacketStore`]; a renderer asks
//! a [`DecodeOrchestrator`] for the enhancement covering each presentation
//! timestamp. The store resolves overlapping samples so every instant maps to
//! at most one packet. The orchestrator bridges skipped frames, restarts from
//! keyframes after seeks and recovers from decoder state loss.

pub mod bucket;
pub mod config;
pub mod decoder;
pub mod error;
pub mod guard;
pub mod orchestrator;
pub mod packet;
pub mod statistics;
pub mod store;

pub use config::{OrchestratorConfig, StoreConfig};
pub use decoder::{DecodedInfo, DecoderBackend, ErrorCode, MockDecoder, PictureInfo, PixelBuffer};
pub use error::{ResidualError, Result};
pub use guard::{ParseGuard, ParseState};
pub use orchestrator::{DecodeOrchestrator, SessionState};
pub use packet::{EnhancementSample, Level, Packet, TimeKey};
pub use statistics::{OrchestratorStats, StoreStats};
pub use store::PacketStore;
