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

//! Drives a [`DecoderBackend`] from the packet store.
//!
//! Enhancement residuals are temporally predicted: a delta packet only
//! decodes correctly on top of everything fed since the last keyframe. The
//! orchestrator keeps track of what the decoder has seen and, for every
//! render timestamp, decides what has to be fed before the packet covering
//! it.
//!
//! Two entry points exist:
//!
//! * [`DecodeOrchestrator::parse_continuous`] for steady playback, which
//!   bridges short gaps by replaying recent history.
//! * [`DecodeOrchestrator::parse_from_keyframe`] for seeks and pauses, which
//!   restarts from the nearest keyframe and walks forward.
//!
//! A generic stream error on a delta packet means the decoder lost its global
//! configuration; the orchestrator then reopens the decoder and replays a
//! keyframe.

use web_time::Instant;

use crate::config::OrchestratorConfig;
use crate::decoder::{DecodedInfo, DecoderBackend, ErrorCode, PictureInfo};
use crate::guard::{InFlight, ParseGuard};
use crate::packet::{Level, Packet, TimeKey};
use crate::statistics::OrchestratorStats;
use crate::store::PacketStore;
use crate::{ResidualError, Result};

/// Where the decode session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing fed since the decoder was opened or the temporal state cleared.
    Idle,
    /// The decoder holds a consistent temporal chain up to the last fed key.
    Fed,
    /// The chain is broken; delta packets are skipped until a keyframe.
    AwaitingKeyframe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResetMode {
    ReplayKeyframe,
    ReopenOnly,
}

/// Outcome of walking forward from one keyframe.
enum Replay<'s> {
    /// The keyframe itself was rejected.
    KeyframeFailed(ErrorCode),
    /// Nothing eligible between the keyframe and the target.
    Empty,
    Fed {
        last: &'s Packet,
        result: std::result::Result<PictureInfo, ErrorCode>,
        parse_log: Vec<TimeKey>,
    },
}

/// Stateful decode session on top of a [`PacketStore`].
pub struct DecodeOrchestrator<D: DecoderBackend> {
    config: OrchestratorConfig,
    backend: D,
    handle: Option<D::Handle>,
    guard: ParseGuard,
    last_fed: Option<TimeKey>,
    awaiting_keyframe: bool,
    refresh_pending: bool,
    last_decoded: Option<DecodedInfo>,
    reset_size: Option<(u32, u32)>,
    stats: OrchestratorStats,
}

impl<D: DecoderBackend> DecodeOrchestrator<D> {
    /// Opens a decode session on `backend`.
    pub fn new(mut backend: D, config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let handle = backend
            .open()
            .map_err(|code| ResidualError::DecoderOpen(code.to_string()))?;
        log::debug!("Decode orchestrator ready, level {}", config.level);
        Ok(Self {
            config,
            backend,
            handle: Some(handle),
            guard: ParseGuard::new(),
            last_fed: None,
            awaiting_keyframe: true,
            refresh_pending: false,
            last_decoded: None,
            reset_size: None,
            stats: OrchestratorStats::default(),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn level(&self) -> Level {
        self.config.level
    }

    /// Switches the rendition fed to the decoder. The next keyframe parse
    /// that cannot find a route reopens the decoder.
    pub fn set_level(&mut self, level: Level) {
        if level != self.config.level {
            log::info!("Switching enhancement level {} -> {level}", self.config.level);
            self.config.level = level;
            self.refresh_pending = true;
        }
    }

    pub fn is_refresh_pending(&self) -> bool {
        self.refresh_pending
    }

    pub fn state(&self) -> SessionState {
        match (self.last_fed, self.awaiting_keyframe) {
            (None, _) => SessionState::Idle,
            (Some(_), true) => SessionState::AwaitingKeyframe,
            (Some(_), false) => SessionState::Fed,
        }
    }

    pub fn last_fed_key(&self) -> Option<TimeKey> {
        self.last_fed
    }

    pub fn is_awaiting_keyframe(&self) -> bool {
        self.awaiting_keyframe
    }

    /// Picture size reported by the keyframe replayed on the last reset.
    pub fn reset_size(&self) -> Option<(u32, u32)> {
        self.reset_size
    }

    pub fn stats(&self) -> &OrchestratorStats {
        &self.stats
    }

    /// Shared handle on the admission slot.
    pub fn guard(&self) -> &ParseGuard {
        &self.guard
    }

    pub fn backend(&self) -> &D {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut D {
        &mut self.backend
    }

    //
    // Entry points
    //

    /// Decodes the packet covering `timestamp` during steady playback,
    /// replaying up to `max_gap_packets` earlier packets if frames were
    /// skipped since the last call.
    ///
    /// `Ok(None)` means there is nothing to render for this timestamp: no
    /// packet covers it, the decoder is waiting for a keyframe, or the frame
    /// was dropped.
    pub fn parse_continuous(
        &mut self,
        store: &PacketStore,
        timestamp: f64,
        max_gap_packets: u32,
    ) -> Result<Option<DecodedInfo>> {
        self.guarded(|this| this.continuous(store, timestamp, max_gap_packets as usize))
    }

    /// Restarts decoding from the nearest keyframe at most `max_buckets_back`
    /// buckets before `timestamp` and feeds forward up to it. With `force`,
    /// packets of every rendition are fed.
    pub fn parse_from_keyframe(
        &mut self,
        store: &PacketStore,
        timestamp: f64,
        max_buckets_back: u32,
        force: bool,
    ) -> Result<Option<DecodedInfo>> {
        self.guarded(|this| this.from_keyframe(store, timestamp, max_buckets_back, force))
    }

    /// Reopens the decoder and feeds the nearest keyframe before `timestamp`
    /// to restore its global configuration.
    pub fn reset(&mut self, store: &PacketStore, timestamp: f64) -> Result<()> {
        self.guarded(|this| this.reset_session(store, timestamp, ResetMode::ReplayKeyframe))
    }

    /// [`Self::parse_continuous`] with the configured gap limit.
    pub fn parse_next(&mut self, store: &PacketStore, timestamp: f64) -> Result<Option<DecodedInfo>> {
        let max_gap_packets = self.config.max_gap_packets;
        self.parse_continuous(store, timestamp, max_gap_packets)
    }

    /// [`Self::parse_from_keyframe`] with the configured lookback.
    pub fn seek(&mut self, store: &PacketStore, timestamp: f64) -> Result<Option<DecodedInfo>> {
        let max_buckets_back = self.config.max_buckets_back;
        self.parse_from_keyframe(store, timestamp, max_buckets_back, false)
    }

    fn guarded<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let _in_flight: InFlight = match self.guard.try_acquire() {
            Some(in_flight) => in_flight,
            None => {
                log::warn!("Parse requested while another is in flight");
                self.stats.busy_rejections += 1;
                return Err(ResidualError::Busy);
            }
        };
        let started = Instant::now();
        let result = op(self);
        self.stats.record_parse_time(started.elapsed());
        result
    }

    //
    // Continuous playback
    //

    fn continuous(
        &mut self,
        store: &PacketStore,
        timestamp: f64,
        max_gap: usize,
    ) -> Result<Option<DecodedInfo>> {
        let Some(target) = self.covering(store, timestamp) else {
            log::trace!("No residual covers {timestamp}");
            return Ok(None);
        };
        if self.handle.is_none() {
            return Err(ResidualError::DecoderClosed);
        }

        if self.last_fed == Some(target.key) {
            return Ok(self
                .last_decoded
                .as_ref()
                .filter(|info| info.key == target.key)
                .cloned());
        }

        let history = store.adjacent(target, max_gap);
        let bridge: Vec<&Packet> = match self.last_fed {
            Some(last) if last < target.key => match history.last() {
                Some(oldest) if oldest.key > last && self.is_eligible_keyframe(target) => {
                    log::debug!(
                        "Gap from {last} to {} exceeds {max_gap} packets, restarting at its keyframe",
                        target.key
                    );
                    self.clear_temporal_state();
                    Vec::new()
                }
                Some(oldest) if oldest.key > last => {
                    log::debug!(
                        "Gap from {last} to {} exceeds {max_gap} packets, waiting for a keyframe",
                        target.key
                    );
                    self.clear_temporal_state();
                    self.last_fed = Some(target.key);
                    self.stats.keyframe_waits += 1;
                    return Ok(None);
                }
                _ => history.iter().rev().filter(|p| p.key > last).copied().collect(),
            },
            previous => {
                if let Some(last) = previous {
                    log::debug!("Playback jumped back from {last} to {}", target.key);
                    self.clear_temporal_state();
                }
                self.awaiting_keyframe = true;
                self.history_from_keyframe(target, &history)
            }
        };

        let mut parse_log = Vec::with_capacity(bridge.len() + 1);
        for packet in bridge {
            if !self.admits(packet) {
                continue;
            }
            match self.feed(packet) {
                Ok(_) => parse_log.push(packet.key),
                Err(code) => log::debug!("Bridging residual {} failed: {code}", packet.key),
            }
        }
        if !parse_log.is_empty() {
            self.stats.gaps_bridged += 1;
        }

        if !self.admits(target) {
            log::debug!(
                "Skipping residual {} (level {}, awaiting keyframe: {})",
                target.key,
                target.level,
                self.awaiting_keyframe
            );
            return Ok(None);
        }
        let result = self.feed(target);
        self.last_fed = Some(target.key);
        match result {
            Ok(picture) => {
                parse_log.push(target.key);
                Ok(self.finish(target, picture, parse_log))
            }
            Err(code) => self.target_failed(store, timestamp, target, code),
        }
    }

    /// History worth replaying for a session with no usable chain: everything
    /// from the latest eligible keyframe, oldest first.
    fn history_from_keyframe<'s>(&self, target: &Packet, history: &[&'s Packet]) -> Vec<&'s Packet> {
        if self.is_eligible_keyframe(target) {
            return Vec::new();
        }
        match history.iter().position(|p| self.is_eligible_keyframe(p)) {
            Some(position) => history[..=position].iter().rev().copied().collect(),
            None => Vec::new(),
        }
    }

    //
    // Keyframe restarts
    //

    fn from_keyframe(
        &mut self,
        store: &PacketStore,
        timestamp: f64,
        max_buckets_back: u32,
        force: bool,
    ) -> Result<Option<DecodedInfo>> {
        if self.handle.is_none() {
            return Err(ResidualError::DecoderClosed);
        }
        self.clear_temporal_state();
        self.last_fed = None;

        let Some(target) = self.covering(store, timestamp) else {
            return Ok(None);
        };
        let floor = timestamp - f64::from(max_buckets_back) * store.bucket_size();
        let Some(mut keyframe) = store.nearest_preceding_keyframe(timestamp, max_buckets_back) else {
            log::debug!("No keyframe within {max_buckets_back} buckets before {timestamp}");
            self.stats.keyframe_waits += 1;
            if self.refresh_pending {
                self.reset_session(store, timestamp, ResetMode::ReopenOnly)?;
            }
            return Ok(None);
        };

        loop {
            match self.replay_from(store, keyframe, timestamp, force) {
                Replay::KeyframeFailed(code) => {
                    let Some(earlier) = store.previous_keyframe(keyframe, floor) else {
                        log::warn!("Keyframe {keyframe} rejected ({code}) and none earlier to fall back to");
                        self.stats.decode_errors += 1;
                        return Ok(None);
                    };
                    log::debug!("Keyframe {keyframe} rejected ({code}), retrying from {earlier}");
                    self.stats.keyframe_retries += 1;
                    self.clear_temporal_state();
                    keyframe = earlier;
                }
                Replay::Empty => {
                    if self.refresh_pending {
                        self.reset_session(store, timestamp, ResetMode::ReopenOnly)?;
                    }
                    return Ok(None);
                }
                Replay::Fed {
                    last,
                    result,
                    parse_log,
                } => {
                    self.last_fed = Some(last.key);
                    self.refresh_pending = false;
                    return match result {
                        Ok(_) if last.key != target.key => Ok(None),
                        Ok(picture) => Ok(self.finish(last, picture, parse_log)),
                        Err(code) => self.target_failed(store, timestamp, last, code),
                    };
                }
            }
        }
    }

    /// Feeds the keyframe at `keyframe` and every eligible packet after it
    /// starting no later than `timestamp`.
    fn replay_from<'s>(
        &mut self,
        store: &'s PacketStore,
        keyframe: f64,
        timestamp: f64,
        force: bool,
    ) -> Replay<'s> {
        let limit = self.round(timestamp);
        let mut parse_log = Vec::new();
        let mut last = None;
        let mut cursor = store.lookup(keyframe, true);

        while let Some(packet) = cursor {
            if self.round(packet.start_time) > limit {
                break;
            }
            if force || packet.level.matches(self.config.level) {
                let first = parse_log.is_empty() && last.is_none();
                let result = self.feed(packet);
                match result {
                    Ok(_) => {
                        if packet.keyframe {
                            self.awaiting_keyframe = false;
                        }
                        parse_log.push(packet.key);
                    }
                    Err(code) if first => return Replay::KeyframeFailed(code),
                    Err(code) => log::debug!("Residual {} failed during replay: {code}", packet.key),
                }
                last = Some((packet, result));
            }
            cursor = store.next(packet);
        }

        match last {
            None => Replay::Empty,
            Some((last, result)) => Replay::Fed {
                last,
                result,
                parse_log,
            },
        }
    }

    //
    // Resets
    //

    fn reset_session(&mut self, store: &PacketStore, timestamp: f64, mode: ResetMode) -> Result<()> {
        log::info!("Resetting decoder at {timestamp} ({mode:?})");
        self.stats.resets += 1;
        if let Some(handle) = self.handle.take() {
            self.backend.close(handle);
        }
        let handle = self
            .backend
            .open()
            .map_err(|code| ResidualError::DecoderOpen(code.to_string()))?;
        self.handle = Some(handle);
        self.last_fed = None;
        self.last_decoded = None;
        self.awaiting_keyframe = true;
        self.refresh_pending = false;

        if mode == ResetMode::ReopenOnly {
            return Ok(());
        }

        let keyframe = store
            .nearest_preceding_keyframe(timestamp, self.config.reset_lookback_buckets)
            .and_then(|time| store.lookup(time, true))
            .ok_or(ResidualError::NoKeyframe { timestamp })?;
        match self.feed(keyframe) {
            Ok(picture) => {
                self.reset_size = Some((picture.width, picture.height));
                self.last_fed = Some(keyframe.key);
                self.awaiting_keyframe = false;
                Ok(())
            }
            Err(code) => Err(ResidualError::KeyframeReplay {
                timestamp: keyframe.start_time,
                code,
            }),
        }
    }

    //
    // Helpers
    //

    fn round(&self, value: f64) -> f64 {
        let scale = 10f64.powi(self.config.timestamp_precision as i32);
        (value * scale).round() / scale
    }

    /// The packet whose interval contains `timestamp` at the configured
    /// precision.
    fn covering<'s>(&self, store: &'s PacketStore, timestamp: f64) -> Option<&'s Packet> {
        let packet = store.lookup(timestamp, false)?;
        let at = self.round(timestamp);
        (self.round(packet.start_time) <= at && at < self.round(packet.end_time)).then_some(packet)
    }

    fn is_eligible_keyframe(&self, packet: &Packet) -> bool {
        packet.keyframe && packet.level.matches(self.config.level)
    }

    /// Whether `packet` may be fed now. A matching keyframe ends any wait.
    fn admits(&mut self, packet: &Packet) -> bool {
        if !packet.level.matches(self.config.level) {
            return false;
        }
        if packet.keyframe {
            self.awaiting_keyframe = false;
        }
        !self.awaiting_keyframe
    }

    fn feed(&mut self, packet: &Packet) -> std::result::Result<PictureInfo, ErrorCode> {
        let handle = self.handle.as_mut().ok_or(ErrorCode::Closed)?;
        log::trace!(
            "Feeding residual {} ({} bytes, keyframe={})",
            packet.key,
            packet.payload.len(),
            packet.keyframe
        );
        self.stats.packets_fed += 1;
        // The session status can be more specific than the parse result.
        match self.backend.parse(handle, &packet.payload) {
            Ok(picture) => Ok(picture),
            Err(code) => Err(self.backend.last_error(handle).unwrap_or(code)),
        }
    }

    fn clear_temporal_state(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            self.backend.clear_temporal_state(handle, self.config.level);
        }
        self.awaiting_keyframe = true;
        self.last_decoded = None;
    }

    fn target_failed(
        &mut self,
        store: &PacketStore,
        timestamp: f64,
        target: &Packet,
        code: ErrorCode,
    ) -> Result<Option<DecodedInfo>> {
        self.stats.decode_errors += 1;
        self.last_decoded = None;
        if code == ErrorCode::GenericStream && !target.keyframe {
            log::warn!("Generic stream error on residual {}, resetting decoder", target.key);
            match self.reset_session(store, timestamp, ResetMode::ReplayKeyframe) {
                Ok(()) => {}
                Err(err @ ResidualError::DecoderOpen(_)) => return Err(err),
                Err(err) => log::warn!("Decoder reset failed: {err}"),
            }
        } else {
            log::warn!("Dropping residual {}: {code}", target.key);
        }
        Ok(None)
    }

    /// Pulls the residual planes for a successfully parsed target.
    fn finish(
        &mut self,
        target: &Packet,
        picture: PictureInfo,
        parse_log: Vec<TimeKey>,
    ) -> Option<DecodedInfo> {
        if picture.width == 0 || picture.height == 0 {
            log::warn!(
                "Residual {} decoded to {}x{}, discarding",
                target.key,
                picture.width,
                picture.height
            );
            self.stats.integrity_failures += 1;
            self.last_decoded = None;
            return None;
        }

        let handle = self.handle.as_mut()?;
        let base = if picture.has_base {
            self.backend
                .decode_base(handle)
                .map_err(|code| log::warn!("Base residuals for {} unavailable: {code}", target.key))
                .ok()
        } else {
            None
        };
        let high = if picture.has_high {
            self.backend
                .decode_high(handle)
                .map_err(|code| log::warn!("High residuals for {} unavailable: {code}", target.key))
                .ok()
        } else {
            None
        };

        let info = DecodedInfo {
            key: target.key,
            start_time: target.start_time,
            end_time: target.end_time,
            keyframe: target.keyframe,
            level: target.level,
            picture,
            base,
            high,
            parse_log,
        };
        self.last_decoded = Some(info.clone());
        Some(info)
    }
}

impl<D: DecoderBackend> Drop for DecodeOrchestrator<D> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.backend.close(handle);
        }
    }
}
