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

//! Counters exposed by the store and the orchestrator.

use serde::{Deserialize, Serialize};
use web_time::Duration;

/// Write-side statistics of a packet store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Samples accepted by `insert`
    pub packets_inserted: u64,
    /// Samples rejected for a non-finite start time
    pub packets_rejected: u64,
    /// Insertions that replaced a packet with the same key
    pub packets_overwritten: u64,
    /// Packets whose interval was narrowed by a later insertion
    pub packets_trimmed: u64,
    /// Packets removed because a later insertion covered them entirely
    pub packets_superseded: u64,
    /// Trimmed packets moved to the following bucket
    pub packets_migrated: u64,
    /// Packets removed by `flush_range`
    pub packets_flushed: u64,
    /// Buckets dropped by evict-on-next-insert
    pub buckets_evicted: u64,
}

/// Read-side statistics of a decode orchestrator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    /// Payloads handed to the decoder, bridging packets included
    pub packets_fed: u64,
    /// Frames that needed history replayed before them
    pub gaps_bridged: u64,
    /// Times a gap was too large and the session had to wait for a keyframe
    pub keyframe_waits: u64,
    /// Keyframe parses that had to step back to an earlier keyframe
    pub keyframe_retries: u64,
    /// Decoder close/reopen cycles
    pub resets: u64,
    /// Target packets the decoder failed on
    pub decode_errors: u64,
    /// Decodes rejected for zero dimensions
    pub integrity_failures: u64,
    /// Requests rejected because a parse was already in flight
    pub busy_rejections: u64,
    /// Wall time of the most recent parse request in milliseconds
    pub last_parse_ms: f64,
}

impl OrchestratorStats {
    pub(crate) fn record_parse_time(&mut self, elapsed: Duration) {
        self.last_parse_ms = elapsed.as_secs_f64() * 1000.0;
    }
}
