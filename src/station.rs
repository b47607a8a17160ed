//! Station registry and ignore list.
//!
//! The registry keeps one record per (RFPI, kind) pair for the lifetime of
//! the run — nothing is ever evicted. Lookups are a linear scan; sessions
//! last hours and see low hundreds of identities, so a `Vec` in insertion
//! order is the right shape and keeps `dump` output stable.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::rfpi::Rfpi;

/// Which side of the air interface a record tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationKind {
    /// Fixed part (basestation), seen during fpscan.
    Base,
    /// Portable part (handset), seen during callscan or while synced.
    Handset,
}

/// One observation delivered by the device, before registry aggregation.
#[derive(Debug, Clone, Copy)]
pub struct Sighting {
    pub rfpi: Rfpi,
    pub kind: StationKind,
    pub channel: u8,
    pub rssi: u8,
}

/// Aggregated statistics for one (RFPI, kind) pair.
#[derive(Debug, Clone)]
pub struct StationRecord {
    pub rfpi: Rfpi,
    pub kind: StationKind,
    /// Channel of the most recent sighting.
    pub channel: u8,
    /// Running RSSI sum across all sightings. A session would need billions
    /// of sightings to overflow a u64, far beyond an hours-long run.
    pub rssi_sum: u64,
    pub count_seen: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl StationRecord {
    /// Average RSSI across all sightings. Computed at read time, never stored.
    pub fn rssi_avg(&self) -> f64 {
        self.rssi_sum as f64 / self.count_seen as f64
    }
}

/// Result of feeding one sighting into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// First time this (RFPI, kind) pair was seen.
    pub is_new: bool,
    /// Set when an existing record moved channel: (old, new).
    pub channel_change: Option<(u8, u8)>,
}

/// Append-mostly list of every station and call seen this run.
#[derive(Debug, Default)]
pub struct StationRegistry {
    records: Vec<StationRecord>,
}

impl StationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting. Updates the existing (RFPI, kind) record in place
    /// or appends a new one. Returns whether the identity was new and
    /// whether its channel moved.
    pub fn observe(&mut self, sighting: Sighting, now: DateTime<Utc>) -> Observation {
        for record in &mut self.records {
            if record.rfpi == sighting.rfpi && record.kind == sighting.kind {
                let channel_change = if record.channel != sighting.channel {
                    Some((record.channel, sighting.channel))
                } else {
                    None
                };
                record.channel = sighting.channel;
                record.count_seen += 1;
                record.last_seen = now;
                record.rssi_sum += u64::from(sighting.rssi);
                return Observation {
                    is_new: false,
                    channel_change,
                };
            }
        }

        self.records.push(StationRecord {
            rfpi: sighting.rfpi,
            kind: sighting.kind,
            channel: sighting.channel,
            rssi_sum: u64::from(sighting.rssi),
            count_seen: 1,
            first_seen: now,
            last_seen: now,
        });
        Observation {
            is_new: true,
            channel_change: None,
        }
    }

    /// All records in insertion order.
    pub fn list(&self) -> &[StationRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// RFPIs the autorec policy must not chase.
#[derive(Debug, Default)]
pub struct IgnoreSet {
    rfpis: HashSet<Rfpi>,
}

impl IgnoreSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, rfpi: &Rfpi) -> bool {
        self.rfpis.contains(rfpi)
    }

    /// Add if absent, remove if present. Returns true if the RFPI is
    /// ignored after the call.
    pub fn toggle(&mut self, rfpi: Rfpi) -> bool {
        if self.rfpis.contains(&rfpi) {
            self.rfpis.remove(&rfpi);
            false
        } else {
            self.rfpis.insert(rfpi);
            true
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rfpis.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rfpi> {
        self.rfpis.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rfpi(last: u8) -> Rfpi {
        Rfpi([0xaa, 0xbb, 0xcc, 0xdd, last])
    }

    fn sighting(kind: StationKind, channel: u8, rssi: u8) -> Sighting {
        Sighting {
            rfpi: rfpi(0xee),
            kind,
            channel,
            rssi,
        }
    }

    #[test]
    fn test_first_observe_is_new() {
        let mut reg = StationRegistry::new();
        let now = Utc::now();
        let obs = reg.observe(sighting(StationKind::Base, 1, 10), now);
        assert!(obs.is_new);
        assert_eq!(reg.list().len(), 1);
    }

    #[test]
    fn test_repeat_observe_never_grows() {
        let mut reg = StationRegistry::new();
        let now = Utc::now();
        assert!(reg.observe(sighting(StationKind::Base, 1, 10), now).is_new);
        for _ in 0..5 {
            let obs = reg.observe(sighting(StationKind::Base, 1, 10), now);
            assert!(!obs.is_new);
        }
        assert_eq!(reg.list().len(), 1);
        assert_eq!(reg.list()[0].count_seen, 6);
    }

    #[test]
    fn test_same_rfpi_different_kind_is_separate() {
        let mut reg = StationRegistry::new();
        let now = Utc::now();
        assert!(reg.observe(sighting(StationKind::Base, 1, 10), now).is_new);
        assert!(reg.observe(sighting(StationKind::Handset, 1, 10), now).is_new);
        assert_eq!(reg.list().len(), 2);
    }

    #[test]
    fn test_rssi_sum_and_average() {
        // AA BB CC DD EE seen 3x as basestation on channels {1,1,2},
        // strengths {10,20,30}: one record, channel 2, count 3, avg 20.0.
        let mut reg = StationRegistry::new();
        let now = Utc::now();
        reg.observe(sighting(StationKind::Base, 1, 10), now);
        reg.observe(sighting(StationKind::Base, 1, 20), now);
        let obs = reg.observe(sighting(StationKind::Base, 2, 30), now);

        assert_eq!(obs.channel_change, Some((1, 2)));
        let records = reg.list();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, StationKind::Base);
        assert_eq!(records[0].channel, 2);
        assert_eq!(records[0].count_seen, 3);
        assert_eq!(records[0].rssi_sum, 60);
        assert_eq!(records[0].rssi_avg(), 20.0);
    }

    #[test]
    fn test_first_last_seen() {
        let mut reg = StationRegistry::new();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(5);
        reg.observe(sighting(StationKind::Handset, 3, 1), t0);
        reg.observe(sighting(StationKind::Handset, 3, 1), t1);
        assert_eq!(reg.list()[0].first_seen, t0);
        assert_eq!(reg.list()[0].last_seen, t1);
    }

    #[test]
    fn test_ignore_toggle_is_involution() {
        let mut ignored = IgnoreSet::new();
        let id = rfpi(0x01);
        assert!(!ignored.contains(&id));
        assert!(ignored.toggle(id));
        assert!(ignored.contains(&id));
        assert!(!ignored.toggle(id));
        assert!(!ignored.contains(&id));
    }
}
