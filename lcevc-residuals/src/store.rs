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

//! The temporal packet store.
//!
//! Packets are grouped in fixed-width buckets keyed by
//! `floor(start_time / bucket_size)`. A packet is never longer than one
//! bucket, so any overlap involves at most the previous, current and next
//! bucket of an insertion.
//!
//! Every insertion restores the invariant that stored intervals are pairwise
//! disjoint, the newest packet winning the contested region:
//!
//! ```text
//!            bucket n                    bucket n+1
//! |-----------------------------|-----------------------------|
//!        [ predecessor )
//!              [  new packet        )
//!                  [ a ) [ b  )  [  c      )
//!
//! predecessor -> end clipped to new.start
//! a, b        -> removed, fully covered
//! c           -> start advanced to new.end, re-keyed into bucket n+1
//! ```

use std::collections::BTreeMap;

use crate::bucket::{floor_position, Bucket};
use crate::config::StoreConfig;
use crate::packet::{EnhancementSample, Packet, TimeKey};
use crate::statistics::StoreStats;
use crate::Result;

/// Smallest first-keyframe offset reported to the consumer.
pub const MIN_KEYFRAME_OFFSET: f64 = 0.01;

/// Time-ordered store of enhancement packets.
#[derive(Debug)]
pub struct PacketStore {
    config: StoreConfig,
    buckets: BTreeMap<i64, Bucket>,
    first_keyframe_time: Option<f64>,
    evict_on_next_insert: bool,
    stats: StoreStats,
}

impl Default for PacketStore {
    fn default() -> Self {
        Self::from_valid_config(StoreConfig::default())
    }
}

impl PacketStore {
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_valid_config(config))
    }

    fn from_valid_config(config: StoreConfig) -> Self {
        Self {
            config,
            buckets: BTreeMap::new(),
            first_keyframe_time: None,
            evict_on_next_insert: false,
            stats: StoreStats::default(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn bucket_size(&self) -> f64 {
        self.config.bucket_size
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Bucket index owning `timestamp`.
    pub fn bucket_index(&self, timestamp: f64) -> i64 {
        // `as` saturates, so infinities land on the extreme buckets.
        (timestamp / self.config.bucket_size).floor() as i64
    }

    pub fn bucket(&self, index: i64) -> Option<&Bucket> {
        self.buckets.get(&index)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(Bucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(Bucket::is_empty)
    }

    /// Every stored packet in time order.
    pub fn packets(&self) -> impl Iterator<Item = &Packet> + '_ {
        self.buckets.values().flat_map(|bucket| bucket.iter())
    }

    /// Time of the first keyframe ever inserted.
    pub fn first_keyframe_time(&self) -> Option<f64> {
        self.first_keyframe_time
    }

    /// Offset the consumer should shift enhancement time by, derived from the
    /// first keyframe. A keyframe at zero still yields a small positive offset,
    /// and on non-live streams implausibly large offsets are ignored.
    pub fn first_keyframe_offset(&self) -> Option<f64> {
        self.first_keyframe_time.map(|time| {
            let offset = if time == 0.0 { MIN_KEYFRAME_OFFSET } else { time };
            if self.config.live || offset < self.config.max_keyframe_offset {
                offset
            } else {
                MIN_KEYFRAME_OFFSET
            }
        })
    }

    /// Arms eviction: the next insertion first drops every bucket older than
    /// its own.
    pub fn evict_on_next_insert(&mut self) {
        self.evict_on_next_insert = true;
    }

    pub fn is_evict_armed(&self) -> bool {
        self.evict_on_next_insert
    }

    /// Drops every packet and forgets the first keyframe.
    pub fn clear(&mut self) {
        self.buckets.clear();
        self.first_keyframe_time = None;
        self.evict_on_next_insert = false;
    }

    /// Releases the store's memory. The store stays usable.
    pub fn close(&mut self) {
        log::debug!("Closing packet store holding {} packets", self.len());
        self.clear();
    }

    //
    // Insertion
    //

    /// Adds a demuxed sample, trimming whatever it overlaps.
    pub fn insert(&mut self, sample: EnhancementSample) {
        if !sample.start_time.is_finite() {
            log::warn!(
                "Dropping enhancement sample with non-finite start time {}",
                sample.start_time
            );
            self.stats.packets_rejected += 1;
            return;
        }

        let frame_rate = sample.frame_rate(self.config.default_duration);
        let span = (1.0 / frame_rate).min(self.config.bucket_size);
        let start_time = sample.start_time;
        let end_time = start_time + span;
        let key = TimeKey::from_time(start_time);
        let index = self.bucket_index(start_time);

        if self.evict_on_next_insert {
            self.evict_on_next_insert = false;
            self.evict_before(index);
        }

        log::trace!(
            "Inserting residual {key} [{start_time}, {end_time}) level={} keyframe={} hint={}",
            sample.level,
            sample.keyframe,
            sample.discretization_hint
        );

        let packet = Packet {
            key,
            frame_rate,
            start_time,
            end_time,
            keyframe: sample.keyframe,
            level: sample.level,
            payload: sample.payload,
        };
        let bucket_size = self.config.bucket_size;
        let bucket = self
            .buckets
            .entry(index)
            .or_insert_with(|| Bucket::new(index, bucket_size));
        if bucket.insert(packet).is_some() {
            self.stats.packets_overwritten += 1;
        }
        self.stats.packets_inserted += 1;

        if sample.keyframe && self.first_keyframe_time.is_none() {
            log::debug!("First keyframe observed at {start_time}");
            self.first_keyframe_time = Some(start_time);
        }

        self.clip_predecessor(index, key);
        self.trim_successors(index, key, end_time);
    }

    /// The packet right before `key`, looking in `index` and then the last
    /// packet of the bucket before it.
    fn predecessor_slot(&self, index: i64, key: TimeKey) -> Option<(i64, TimeKey)> {
        let in_bucket = self.buckets.get(&index).and_then(|bucket| {
            let keys = bucket.ordered_keys();
            keys.partition_point(|k| *k < key)
                .checked_sub(1)
                .map(|position| (index, keys[position]))
        });
        in_bucket.or_else(|| {
            let before = index.checked_sub(1)?;
            self.buckets
                .get(&before)
                .and_then(|bucket| bucket.ordered_keys().last())
                .map(|key| (before, *key))
        })
    }

    /// The packet right after `key`, looking in `index` and then the first
    /// packet of the bucket after it.
    fn successor_slot(&self, index: i64, key: TimeKey) -> Option<(i64, TimeKey)> {
        let in_bucket = self.buckets.get(&index).and_then(|bucket| {
            let keys = bucket.ordered_keys();
            keys.get(keys.partition_point(|k| *k <= key))
                .map(|next| (index, *next))
        });
        in_bucket.or_else(|| {
            let after = index.checked_add(1)?;
            self.buckets
                .get(&after)
                .and_then(|bucket| bucket.ordered_keys().first())
                .map(|key| (after, *key))
        })
    }

    fn clip_predecessor(&mut self, index: i64, key: TimeKey) {
        let start_time = key.as_time();
        let Some((owner, previous)) = self.predecessor_slot(index, key) else {
            return;
        };
        let Some(bucket) = self.buckets.get_mut(&owner) else {
            return;
        };
        let overlaps = bucket
            .get(&previous)
            .is_some_and(|packet| packet.end_time > start_time);
        if overlaps {
            if let Some(packet) = bucket.get_mut(&previous) {
                log::trace!(
                    "Clipping {} end from {} to {start_time}",
                    packet.key,
                    packet.end_time
                );
                packet.end_time = start_time;
                self.stats.packets_trimmed += 1;
            }
        }
    }

    /// Removes or shortens every packet after `key` that starts before
    /// `end_time`, re-keying the survivors into whichever bucket owns their
    /// new start.
    fn trim_successors(&mut self, index: i64, key: TimeKey, end_time: f64) {
        while let Some((owner, next)) = self.successor_slot(index, key) {
            let starts_inside = self
                .buckets
                .get(&owner)
                .and_then(|bucket| bucket.get(&next))
                .is_some_and(|packet| packet.start_time < end_time);
            if !starts_inside {
                break;
            }
            let Some(mut packet) = self
                .buckets
                .get_mut(&owner)
                .and_then(|bucket| bucket.remove(&next))
            else {
                break;
            };

            if packet.end_time > end_time {
                packet.start_time = end_time;
                packet.key = TimeKey::from_time(end_time);
                self.stats.packets_trimmed += 1;
                self.rehome(owner, packet);
            } else {
                log::trace!("Residual {} superseded", packet.key);
                self.stats.packets_superseded += 1;
            }
            self.drop_if_empty(owner, index);
        }
    }

    /// Re-inserts a packet whose start moved, unless its new key is taken.
    fn rehome(&mut self, origin: i64, packet: Packet) {
        let target = self.bucket_index(packet.start_time);
        if target != origin {
            log::trace!("Migrating {} from bucket {origin} to {target}", packet.key);
            self.stats.packets_migrated += 1;
            if let Some(bucket) = self.buckets.get_mut(&origin) {
                bucket.mark_dirty();
            }
        }
        let bucket_size = self.config.bucket_size;
        let bucket = self
            .buckets
            .entry(target)
            .or_insert_with(|| Bucket::new(target, bucket_size));
        if bucket.contains_key(&packet.key) {
            log::debug!(
                "Residual already stored at {}, dropping trimmed remainder",
                packet.key
            );
        } else {
            bucket.insert(packet);
        }
    }

    fn drop_if_empty(&mut self, index: i64, keep: i64) {
        if index != keep && self.buckets.get(&index).is_some_and(Bucket::is_empty) {
            self.buckets.remove(&index);
        }
    }

    fn evict_before(&mut self, index: i64) {
        let retained = self.buckets.split_off(&index);
        let evicted = std::mem::replace(&mut self.buckets, retained);
        if !evicted.is_empty() {
            log::debug!(
                "Evicted {} stale buckets before bucket {index}",
                evicted.len()
            );
            self.stats.buckets_evicted += evicted.len() as u64;
        }
    }

    //
    // Queries
    //

    /// The packet with the greatest key at or before `timestamp`.
    ///
    /// With `keyframe_only`, a non-keyframe hit is replaced by the next packet
    /// of the same bucket.
    pub fn lookup(&self, timestamp: f64, keyframe_only: bool) -> Option<&Packet> {
        if !timestamp.is_finite() {
            return None;
        }
        let index = self.bucket_index(timestamp);
        let bucket = self
            .buckets
            .get(&index)
            .or_else(|| self.buckets.get(&index.checked_sub(1)?))?;

        match bucket.floor_position(timestamp) {
            Some(position) => {
                let packet = bucket.packet_at(position)?;
                if keyframe_only && !packet.keyframe {
                    bucket.packet_at(position + 1)
                } else {
                    Some(packet)
                }
            }
            None => {
                // Every key here is later; the answer is the previous bucket's tail.
                let packet = self.buckets.get(&bucket.index().checked_sub(1)?)?.last()?;
                (!keyframe_only || packet.keyframe).then_some(packet)
            }
        }
    }

    /// Whether a stored packet's interval contains `timestamp`.
    pub fn has_coverage(&self, timestamp: f64) -> bool {
        self.lookup(timestamp, false)
            .is_some_and(|packet| packet.covers(timestamp))
    }

    /// Time of the latest keyframe `k` with
    /// `timestamp - max_buckets_back * bucket_size <= k <= timestamp`.
    pub fn nearest_preceding_keyframe(&self, timestamp: f64, max_buckets_back: u32) -> Option<f64> {
        if !timestamp.is_finite() {
            return None;
        }
        let floor = timestamp - f64::from(max_buckets_back) * self.config.bucket_size;
        let newest = self.bucket_index(timestamp);
        let oldest = newest.saturating_sub(i64::from(max_buckets_back));
        let key = TimeKey::from_time(timestamp);

        for (_, bucket) in self.buckets.range(oldest..=newest).rev() {
            let keyframes = bucket.keyframe_keys();
            if let Some(position) = floor_position(keyframes, key) {
                let found = keyframes[position].as_time();
                return (found >= floor).then_some(found);
            }
        }
        None
    }

    /// Time of the latest keyframe strictly before `before` and not earlier
    /// than `floor`.
    pub fn previous_keyframe(&self, before: f64, floor: f64) -> Option<f64> {
        if !(before.is_finite() && floor <= before) {
            return None;
        }
        let key = TimeKey::from_time(before);
        let newest = self.bucket_index(before);
        let oldest = self.bucket_index(floor);
        for (_, bucket) in self.buckets.range(oldest..=newest).rev() {
            let keyframes = bucket.keyframe_keys();
            if let Some(position) = keyframes.partition_point(|k| *k < key).checked_sub(1) {
                let found = keyframes[position].as_time();
                return (found >= floor).then_some(found);
            }
        }
        None
    }

    /// Up to `count` packets before `packet`, nearest first.
    pub fn adjacent(&self, packet: &Packet, count: usize) -> Vec<&Packet> {
        let key = packet.key;
        let index = self.bucket_index(packet.start_time);
        self.buckets
            .range(..=index)
            .rev()
            .flat_map(move |(_, bucket)| bucket.iter().rev().filter(move |p| p.key < key))
            .take(count)
            .collect()
    }

    /// The packet following `packet`, looking no further than the next bucket.
    pub fn next(&self, packet: &Packet) -> Option<&Packet> {
        let index = self.bucket_index(packet.start_time);
        let (owner, key) = self.successor_slot(index, packet.key)?;
        self.buckets.get(&owner)?.get(&key)
    }

    //
    // Flushing
    //

    /// Removes everything inside `[start_time, end_time)`.
    ///
    /// Packets straddling a boundary are shortened so nothing inside the range
    /// survives. A packet spanning the whole range is split in two, both halves
    /// keeping the payload.
    pub fn flush_range(&mut self, start_time: f64, end_time: f64) {
        // Also rejects NaN bounds.
        if self.buckets.is_empty() || !(start_time < end_time) {
            return;
        }

        let first = self.bucket_index(start_time).saturating_sub(1);
        let last = self.bucket_index(end_time);
        let indices: Vec<i64> = self.buckets.range(first..=last).map(|(i, _)| *i).collect();
        let mut remainders = Vec::new();

        for index in indices {
            let Some(bucket) = self.buckets.get_mut(&index) else {
                continue;
            };

            let window_inside =
                bucket.start_time() >= start_time && bucket.end_time() <= end_time;
            if window_inside && bucket.iter().all(|p| p.end_time <= end_time) {
                self.stats.packets_flushed += bucket.len() as u64;
                self.buckets.remove(&index);
                continue;
            }

            let keys = bucket.ordered_keys().to_vec();
            for key in keys {
                let Some(packet) = bucket.get(&key) else {
                    continue;
                };
                if packet.end_time <= start_time || packet.start_time >= end_time {
                    continue;
                }

                if packet.start_time < start_time {
                    let tail = (packet.end_time > end_time).then(|| Packet {
                        key: TimeKey::from_time(end_time),
                        start_time: end_time,
                        ..packet.clone()
                    });
                    if let Some(head) = bucket.get_mut(&key) {
                        head.end_time = start_time;
                    }
                    remainders.extend(tail);
                } else if let Some(mut packet) = bucket.remove(&key) {
                    if packet.end_time > end_time {
                        packet.start_time = end_time;
                        packet.key = TimeKey::from_time(end_time);
                        remainders.push(packet);
                    } else {
                        self.stats.packets_flushed += 1;
                    }
                }
            }

            bucket.repair();
            if bucket.is_empty() {
                self.buckets.remove(&index);
            }
        }

        let bucket_size = self.config.bucket_size;
        for packet in remainders {
            let index = self.bucket_index(packet.start_time);
            let bucket = self
                .buckets
                .entry(index)
                .or_insert_with(|| Bucket::new(index, bucket_size));
            if !bucket.contains_key(&packet.key) {
                bucket.insert(packet);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Level;
    use approx::assert_relative_eq;

    // Times below are dyadic so interval ends compare exactly.
    fn sample(start: f64, duration: f64, keyframe: bool, payload: &'static [u8]) -> EnhancementSample {
        EnhancementSample::new(start, 1, duration, payload)
            .keyframe(keyframe)
            .level(0)
    }

    fn intervals(store: &PacketStore) -> Vec<(f64, f64)> {
        store.packets().map(|p| (p.start_time, p.end_time)).collect()
    }

    #[test]
    fn stores_and_retrieves_residuals_at_a_timestamp() {
        let mut store = PacketStore::default();
        store.insert(
            EnhancementSample::new(0.5, 1, 0.25, vec![0, 1, 0, 1, 1, 1, 0, 1])
                .keyframe(true)
                .level(0),
        );

        assert!(store.has_coverage(0.5));
        let packet = store.lookup(0.5, false).unwrap();
        assert_eq!(packet.payload.as_ref(), &[0, 1, 0, 1, 1, 1, 0, 1]);
        assert_eq!(packet.end_time, 0.75);
        assert_relative_eq!(packet.frame_rate, 4.0);
        assert_eq!(packet.level, Level::Rendition(0));
    }

    #[test]
    fn later_insert_clips_the_earlier_one() {
        let mut store = PacketStore::default();
        store.insert(sample(0.0, 1.0, false, b"A"));
        store.insert(sample(0.5, 1.0, false, b"B"));

        let early = store.lookup(0.25, false).unwrap();
        assert_eq!(early.payload.as_ref(), b"A");
        assert_eq!(early.end_time, 0.5);
        assert_eq!(store.lookup(0.5, false).unwrap().payload.as_ref(), b"B");
        assert_eq!(store.stats().packets_trimmed, 1);
    }

    #[test]
    fn predecessor_in_previous_bucket_is_clipped() {
        let mut store = PacketStore::default();
        store.insert(sample(0.75, 0.5, true, b"A"));
        assert_eq!(store.bucket(0).unwrap().keyframe_keys().len(), 1);
        assert!(!store.bucket(0).unwrap().is_dirty());

        store.insert(sample(1.125, 0.5, false, b"B"));

        assert_eq!(intervals(&store), vec![(0.75, 1.125), (1.125, 1.625)]);
        assert!(store.bucket(0).unwrap().is_dirty());
    }

    #[test]
    fn covered_successors_are_removed_and_partial_ones_shifted() {
        let mut store = PacketStore::default();
        store.insert(sample(0.25, 0.125, false, b"a"));
        store.insert(sample(0.375, 0.125, false, b"b"));
        store.insert(sample(0.5, 0.25, false, b"c"));
        store.insert(sample(0.125, 0.5, false, b"new"));

        assert_eq!(intervals(&store), vec![(0.125, 0.625), (0.625, 0.75)]);
        let shifted = store.lookup(0.7, false).unwrap();
        assert_eq!(shifted.key, TimeKey::from_time(0.625));
        assert_eq!(shifted.payload.as_ref(), b"c");
        assert_eq!(store.stats().packets_superseded, 2);
    }

    #[test]
    fn shifted_successor_migrates_into_the_next_bucket() {
        let mut store = PacketStore::default();
        store.insert(sample(0.875, 0.5, false, b"old"));
        store.insert(sample(0.625, 0.5, false, b"new"));

        assert!(store.bucket(0).unwrap().get(&TimeKey::from_time(0.875)).is_none());
        let moved = store.bucket(1).unwrap().first().unwrap();
        assert_eq!(moved.payload.as_ref(), b"old");
        assert_eq!(moved.start_time, 1.125);
        assert_eq!(moved.end_time, 1.375);
        assert_eq!(store.stats().packets_migrated, 1);
    }

    #[test]
    fn successors_in_next_bucket_are_trimmed() {
        let mut store = PacketStore::default();
        store.insert(sample(1.0, 0.125, false, b"x"));
        store.insert(sample(1.125, 0.375, false, b"y"));
        store.insert(sample(0.875, 0.5, false, b"new"));

        assert_eq!(intervals(&store), vec![(0.875, 1.375), (1.375, 1.5)]);
        assert_eq!(store.lookup(1.4, false).unwrap().payload.as_ref(), b"y");
    }

    #[test]
    fn same_start_overwrites_in_place() {
        let mut store = PacketStore::default();
        store.insert(sample(0.5, 0.25, false, b"first"));
        store.insert(sample(0.5, 0.125, true, b"second"));

        assert_eq!(store.len(), 1);
        let packet = store.lookup(0.5, false).unwrap();
        assert_eq!(packet.payload.as_ref(), b"second");
        assert!(packet.keyframe);
        assert_eq!(packet.end_time, 0.625);
        assert_eq!(store.stats().packets_overwritten, 1);
    }

    #[test]
    fn zero_duration_uses_default() {
        let mut store = PacketStore::default();
        store.insert(EnhancementSample::new(2.0, 90_000, 0.0, vec![1u8]));
        let packet = store.lookup(2.0, false).unwrap();
        assert_relative_eq!(packet.frame_rate, 30.0);
        assert_relative_eq!(packet.end_time, 2.0 + 1.0 / 30.0);
    }

    #[test]
    fn long_samples_are_capped_at_one_bucket() {
        let mut store = PacketStore::default();
        store.insert(sample(0.5, 4.0, false, b"long"));
        assert_eq!(store.lookup(0.5, false).unwrap().end_time, 1.5);
    }

    #[test]
    fn non_finite_start_is_rejected() {
        let mut store = PacketStore::default();
        store.insert(EnhancementSample::new(f64::NAN, 1, 0.125, vec![1u8]));
        assert!(store.is_empty());
        assert_eq!(store.stats().packets_rejected, 1);
    }

    #[test]
    fn extreme_finite_starts_share_the_edge_buckets() {
        let mut store = PacketStore::default();
        store.insert(sample(1e300, 0.25, false, b"far"));
        store.insert(sample(2e300, 0.25, false, b"farther"));
        store.insert(sample(-1e300, 0.25, false, b"past"));

        assert_eq!(store.len(), 3);
        assert_eq!(store.bucket_count(), 2);
        assert_eq!(store.stats().packets_superseded, 0);
        assert_eq!(store.lookup(1.5e300, false).unwrap().payload.as_ref(), b"far");
        assert_eq!(store.lookup(2e300, false).unwrap().payload.as_ref(), b"farther");
        assert_eq!(store.lookup(-1e300, false).unwrap().payload.as_ref(), b"past");
        assert_eq!(store.lookup(-2e300, false), None);
    }

    #[test]
    fn lookup_falls_back_to_previous_bucket() {
        let mut store = PacketStore::default();
        store.insert(sample(0.875, 1.0, false, b"tail"));

        // No bucket 1 at all.
        assert_eq!(store.lookup(1.5, false).unwrap().payload.as_ref(), b"tail");
        assert!(store.has_coverage(1.5));
        assert!(!store.has_coverage(1.9));

        // Bucket 2 exists but starts later than the query.
        store.insert(sample(2.5, 0.125, false, b"later"));
        assert_eq!(store.lookup(2.125, false), None);
    }

    #[test]
    fn lookup_before_any_packet_is_none() {
        let mut store = PacketStore::default();
        store.insert(sample(0.5, 0.125, false, b"a"));
        assert!(store.lookup(0.25, false).is_none());
        assert!(!store.has_coverage(0.25));
    }

    #[test]
    fn keyframe_only_lookup_advances_past_delta() {
        let mut store = PacketStore::default();
        store.insert(sample(0.125, 0.125, false, b"delta"));
        store.insert(sample(0.25, 0.125, true, b"key"));

        assert_eq!(store.lookup(0.1875, true).unwrap().payload.as_ref(), b"key");
        assert_eq!(store.lookup(0.3125, true).unwrap().payload.as_ref(), b"key");
        assert_eq!(store.lookup(0.1875, false).unwrap().payload.as_ref(), b"delta");
    }

    #[test]
    fn keyframe_search_is_bounded() {
        let mut store = PacketStore::default();
        store.insert(sample(0.5, 0.125, true, b"k0"));
        store.insert(sample(3.5, 0.125, true, b"k3"));
        store.insert(sample(6.25, 0.125, false, b"d6"));

        assert_eq!(store.nearest_preceding_keyframe(3.5, 0), Some(3.5));
        assert_eq!(store.nearest_preceding_keyframe(3.375, 3), Some(0.5));
        assert_eq!(store.nearest_preceding_keyframe(3.625, 3), Some(3.5));
        assert_eq!(store.nearest_preceding_keyframe(3.375, 2), None);
        assert_eq!(store.nearest_preceding_keyframe(6.25, 2), None);
        assert_eq!(store.nearest_preceding_keyframe(6.25, 3), Some(3.5));
    }

    #[test]
    fn keyframe_in_range_bucket_but_outside_window_is_ignored() {
        let mut store = PacketStore::default();
        store.insert(sample(0.5, 0.125, true, b"k0"));

        assert_eq!(store.nearest_preceding_keyframe(3.25, 3), Some(0.5));
        // Bucket 0 is searched, but 0.5 is older than 3.75 - 3.
        assert_eq!(store.nearest_preceding_keyframe(3.75, 3), None);
    }

    #[test]
    fn previous_keyframe_is_strict() {
        let mut store = PacketStore::default();
        store.insert(sample(0.25, 0.125, true, b"k1"));
        store.insert(sample(1.5, 0.125, true, b"k2"));

        assert_eq!(store.previous_keyframe(1.5, 0.0), Some(0.25));
        assert_eq!(store.previous_keyframe(0.25, 0.0), None);
        assert_eq!(store.previous_keyframe(1.5, 0.5), None);
    }

    #[test]
    fn adjacent_walks_back_across_buckets() {
        let mut store = PacketStore::default();
        for (i, start) in [0.625, 0.75, 0.875, 1.0, 1.125].into_iter().enumerate() {
            store.insert(sample(start, 0.125, i == 0, b"p"));
        }
        let anchor = store.lookup(1.125, false).unwrap().clone();
        let previous: Vec<f64> = store.adjacent(&anchor, 3).iter().map(|p| p.start_time).collect();
        assert_eq!(previous, vec![1.0, 0.875, 0.75]);
        assert_eq!(store.adjacent(&anchor, 10).len(), 4);
    }

    #[test]
    fn next_crosses_one_bucket_only() {
        let mut store = PacketStore::default();
        store.insert(sample(0.875, 0.125, false, b"a"));
        store.insert(sample(1.0, 0.125, false, b"b"));
        store.insert(sample(3.0, 0.125, false, b"c"));

        let a = store.lookup(0.875, false).unwrap();
        let b = store.next(a).unwrap();
        assert_eq!(b.payload.as_ref(), b"b");
        assert!(store.next(b).is_none());
    }

    #[test]
    fn flush_removes_inside_and_trims_edges() {
        let mut store = PacketStore::default();
        store.insert(sample(0.0, 0.5, false, b"a"));
        store.insert(sample(0.5, 0.5, false, b"b"));
        store.insert(sample(1.0, 0.5, false, b"c"));
        store.insert(sample(1.5, 0.5, false, b"d"));

        store.flush_range(0.25, 1.25);

        assert_eq!(intervals(&store), vec![(0.0, 0.25), (1.25, 1.5), (1.5, 2.0)]);
        assert_eq!(store.lookup(1.3, false).unwrap().payload.as_ref(), b"c");
        assert!(!store.has_coverage(0.75));
        assert_eq!(store.stats().packets_flushed, 1);
    }

    #[test]
    fn flush_whole_bucket_drops_it() {
        let mut store = PacketStore::default();
        store.insert(sample(1.25, 0.25, true, b"a"));
        store.insert(sample(1.5, 0.25, false, b"b"));
        store.insert(sample(2.5, 0.25, false, b"c"));

        store.flush_range(1.0, 2.0);
        assert!(store.bucket(1).is_none());
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().packets_flushed, 2);
        assert_eq!(store.nearest_preceding_keyframe(2.625, 5), None);
    }

    #[test]
    fn flush_splits_a_spanning_packet() {
        let mut store = PacketStore::default();
        store.insert(sample(0.125, 0.75, false, b"long"));
        store.flush_range(0.25, 0.5);

        assert_eq!(intervals(&store), vec![(0.125, 0.25), (0.5, 0.875)]);
        assert!(store.packets().all(|p| p.payload.as_ref() == b"long"));
    }

    #[test]
    fn flush_ignores_empty_and_inverted_ranges() {
        let mut store = PacketStore::default();
        store.flush_range(0.0, 10.0);
        assert_eq!(store.bucket_count(), 0);

        store.insert(sample(0.5, 0.25, false, b"a"));
        store.flush_range(0.75, 0.25);
        store.flush_range(0.5, 0.5);
        assert_eq!(intervals(&store), vec![(0.5, 0.75)]);
    }

    #[test]
    fn first_keyframe_offset_is_latched_and_clamped() {
        let mut store = PacketStore::default();
        assert_eq!(store.first_keyframe_offset(), None);
        store.insert(sample(0.0, 0.125, true, b"k"));
        store.insert(sample(1.0, 0.125, true, b"k"));
        assert_eq!(store.first_keyframe_time(), Some(0.0));
        assert_eq!(store.first_keyframe_offset(), Some(MIN_KEYFRAME_OFFSET));

        let mut late = PacketStore::default();
        late.insert(sample(5.0, 0.125, true, b"k"));
        assert_eq!(late.first_keyframe_offset(), Some(MIN_KEYFRAME_OFFSET));

        let mut live = PacketStore::new(StoreConfig {
            live: true,
            ..Default::default()
        })
        .unwrap();
        live.insert(sample(5.0, 0.125, true, b"k"));
        assert_eq!(live.first_keyframe_offset(), Some(5.0));
    }

    #[test]
    fn armed_eviction_drops_older_buckets_once() {
        let mut store = PacketStore::default();
        store.insert(sample(0.5, 0.125, true, b"a"));
        store.insert(sample(1.5, 0.125, false, b"b"));
        store.evict_on_next_insert();
        assert!(store.is_evict_armed());

        store.insert(sample(3.5, 0.125, false, b"c"));
        assert!(!store.is_evict_armed());
        assert_eq!(store.bucket_count(), 1);
        assert_eq!(store.stats().buckets_evicted, 2);

        store.insert(sample(0.5, 0.125, false, b"d"));
        assert_eq!(store.bucket_count(), 2);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = StoreConfig {
            bucket_size: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            PacketStore::new(config),
            Err(crate::ResidualError::InvalidConfig(_))
        ));
    }

    #[test]
    fn close_forgets_everything() {
        let mut store = PacketStore::default();
        store.insert(sample(0.5, 0.125, true, b"a"));
        store.close();
        assert!(store.is_empty());
        assert_eq!(store.first_keyframe_time(), None);
    }
}
