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

//! A fixed-width time window of packets with ordered keys.

use std::cell::OnceCell;
use std::collections::HashMap;

use crate::packet::{Packet, TimeKey};

/// Index of the greatest key `<= value`, if any.
pub(crate) fn floor_position(keys: &[TimeKey], value: TimeKey) -> Option<usize> {
    keys.partition_point(|k| *k <= value).checked_sub(1)
}

/// Packets whose start time falls in `[start_time, end_time)`.
///
/// Keys live twice: in a map for constant-time access and in a sorted vector
/// for ordered traversal. The keyframe index is derived from both and cached
/// until the next mutation.
#[derive(Debug)]
pub struct Bucket {
    index: i64,
    start_time: f64,
    end_time: f64,
    packets: HashMap<TimeKey, Packet>,
    ordered_keys: Vec<TimeKey>,
    keyframe_keys: OnceCell<Vec<TimeKey>>,
}

impl Bucket {
    pub fn new(index: i64, size: f64) -> Self {
        Self {
            index,
            start_time: index as f64 * size,
            end_time: index.saturating_add(1) as f64 * size,
            packets: HashMap::new(),
            ordered_keys: Vec::new(),
            keyframe_keys: OnceCell::new(),
        }
    }

    pub fn index(&self) -> i64 {
        self.index
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn end_time(&self) -> f64 {
        self.end_time
    }

    pub fn len(&self) -> usize {
        self.ordered_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered_keys.is_empty()
    }

    //
    // Reads
    //

    pub fn get(&self, key: &TimeKey) -> Option<&Packet> {
        self.packets.get(key)
    }

    pub fn contains_key(&self, key: &TimeKey) -> bool {
        self.packets.contains_key(key)
    }

    pub fn ordered_keys(&self) -> &[TimeKey] {
        &self.ordered_keys
    }

    pub fn packet_at(&self, position: usize) -> Option<&Packet> {
        self.ordered_keys
            .get(position)
            .and_then(|key| self.packets.get(key))
    }

    pub fn first(&self) -> Option<&Packet> {
        self.packet_at(0)
    }

    pub fn last(&self) -> Option<&Packet> {
        self.ordered_keys
            .len()
            .checked_sub(1)
            .and_then(|position| self.packet_at(position))
    }

    /// Position of the greatest key `<= timestamp`.
    pub fn floor_position(&self, timestamp: f64) -> Option<usize> {
        floor_position(&self.ordered_keys, TimeKey::from_time(timestamp))
    }

    /// Packets in key order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Packet> + '_ {
        self.ordered_keys
            .iter()
            .filter_map(|key| self.packets.get(key))
    }

    /// Sorted keys of the keyframe packets, recomputed if the bucket changed
    /// since the last call.
    pub fn keyframe_keys(&self) -> &[TimeKey] {
        self.keyframe_keys.get_or_init(|| {
            self.ordered_keys
                .iter()
                .filter(|key| match self.packets.get(key) {
                    Some(packet) => packet.keyframe,
                    None => {
                        log::warn!(
                            "Bucket {} lists key {} without a packet, skipping it",
                            self.index,
                            key
                        );
                        false
                    }
                })
                .copied()
                .collect()
        })
    }

    pub fn is_dirty(&self) -> bool {
        self.keyframe_keys.get().is_none()
    }

    pub fn mark_dirty(&mut self) {
        self.keyframe_keys.take();
    }

    //
    // Writes. Every one of these invalidates the keyframe index.
    //

    pub fn get_mut(&mut self, key: &TimeKey) -> Option<&mut Packet> {
        self.mark_dirty();
        self.packets.get_mut(key)
    }

    /// Stores `packet` under its key, returning the packet it replaced.
    pub fn insert(&mut self, packet: Packet) -> Option<Packet> {
        self.mark_dirty();
        let key = packet.key;
        self.packets.insert(key, packet).or_else(|| {
            if let Err(position) = self.ordered_keys.binary_search(&key) {
                self.ordered_keys.insert(position, key);
            }
            None
        })
    }

    pub fn remove(&mut self, key: &TimeKey) -> Option<Packet> {
        self.mark_dirty();
        if let Ok(position) = self.ordered_keys.binary_search(key) {
            self.ordered_keys.remove(position);
        }
        self.packets.remove(key)
    }

    /// Drops keys that no longer have a packet behind them. Returns how many
    /// were pruned.
    pub fn repair(&mut self) -> usize {
        let packets = &self.packets;
        let before = self.ordered_keys.len();
        self.ordered_keys.retain(|key| {
            let present = packets.contains_key(key);
            if !present {
                log::warn!("Pruning dangling key {key} from bucket {}", self.index);
            }
            present
        });
        let pruned = before - self.ordered_keys.len();
        if pruned > 0 {
            self.mark_dirty();
        }
        pruned
    }
}
