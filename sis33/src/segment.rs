//! Per-buffer acquisition and transfer state.
//!
//! The on-board sample memory is split in segments so that one can be fetched while another one
//! is being filled. Each [`Segment`] owns the event directory of its last acquisition, which is
//! dropped when the segment is armed again.

use crate::core::Event;
use std::{sync::Arc, time::SystemTime};
use tracing::warn;

/// States of a segment, only one segment of a card can be [`SegmentState::Acquiring`]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum SegmentState {
    #[default]
    Idle,
    Acquiring,
    Transferring,
}

/// What a backend read back from the hardware about a finished or cancelled acquisition
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    /// Number of events captured
    pub nr_events: u32,
    /// Event directory, laid out as `events[channel * nr_events + event]`
    pub events: Vec<Event>,
    /// Raw timestamp of each event, on hardware that keeps them
    pub timestamps: Option<Vec<u64>>,
}

impl SegmentRecord {
    /// A record with no events
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Event directory and timestamps of a finished acquisition
#[derive(Debug, PartialEq, Eq)]
pub struct SegmentCache {
    nr_events: u32,
    n_channels: usize,
    events: Vec<Event>,
    /// Ticks since the first event
    prevticks: Option<Vec<u64>>,
}

impl SegmentCache {
    /// Builds the cache out of a backend's record. Returns `None` when no event is usable.
    pub(crate) fn from_record(record: SegmentRecord, n_channels: usize) -> Option<Self> {
        let SegmentRecord {
            nr_events,
            events,
            timestamps,
        } = record;
        if nr_events == 0 {
            return None;
        }
        if events.len() != nr_events as usize * n_channels {
            warn!(
                nr_events,
                n_channels,
                directory = events.len(),
                "Event directory doesn't match the event count, dropping it"
            );
            return None;
        }
        let prevticks = match timestamps {
            Some(ts) if ts.len() >= nr_events as usize => {
                let first = ts[0];
                Some(ts.iter().map(|t| t.wrapping_sub(first)).collect())
            }
            Some(ts) => {
                warn!(
                    nr_events,
                    timestamps = ts.len(),
                    "Not enough timestamps for the captured events, dropping them"
                );
                None
            }
            None => None,
        };
        Some(Self {
            nr_events,
            n_channels,
            events,
            prevticks,
        })
    }

    #[must_use]
    pub fn nr_events(&self) -> u32 {
        self.nr_events
    }

    /// The directory entry of event `event_nr` on `channel`
    #[must_use]
    pub fn event(&self, channel: usize, event_nr: usize) -> Option<Event> {
        if channel >= self.n_channels || event_nr >= self.nr_events as usize {
            return None;
        }
        self.events
            .get(channel * self.nr_events as usize + event_nr)
            .copied()
    }

    /// Ticks between the first event and `event_nr`, zero on hardware without timestamps
    #[must_use]
    pub fn prevticks(&self, event_nr: usize) -> u64 {
        self.prevticks
            .as_ref()
            .and_then(|pt| pt.get(event_nr))
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn has_timestamps(&self) -> bool {
        self.prevticks.is_some()
    }
}

#[derive(Debug, Default)]
pub struct Segment {
    state: SegmentState,
    /// Bumped on every arm so a late completion can't finish a newer acquisition
    arm_seq: u64,
    samples_per_event: u32,
    cache: Option<Arc<SegmentCache>>,
    endtime: Option<SystemTime>,
}

impl Segment {
    #[must_use]
    pub fn state(&self) -> SegmentState {
        self.state
    }

    #[must_use]
    pub fn is_acquiring(&self) -> bool {
        self.state == SegmentState::Acquiring
    }

    #[must_use]
    pub fn is_transferring(&self) -> bool {
        self.state == SegmentState::Transferring
    }

    #[must_use]
    pub fn samples_per_event(&self) -> u32 {
        self.samples_per_event
    }

    #[must_use]
    pub fn recorded_event_count(&self) -> u32 {
        self.cache.as_ref().map_or(0, |c| c.nr_events())
    }

    /// When the last acquisition on this segment finished
    #[must_use]
    pub fn endtime(&self) -> Option<SystemTime> {
        self.endtime
    }

    pub(crate) fn arm_seq(&self) -> u64 {
        self.arm_seq
    }

    pub(crate) fn cache(&self) -> Option<Arc<SegmentCache>> {
        self.cache.clone()
    }

    /// `Idle -> Acquiring`, discarding the previous acquisition. Returns the arm's sequence number.
    pub(crate) fn arm(&mut self, samples_per_event: u32) -> u64 {
        debug_assert_eq!(self.state, SegmentState::Idle);
        self.cache = None;
        self.endtime = None;
        self.samples_per_event = samples_per_event;
        self.arm_seq += 1;
        self.state = SegmentState::Acquiring;
        self.arm_seq
    }

    /// `Acquiring -> Idle` for the arm numbered `seq`, storing what the backend recorded.
    /// Returns false, dropping `record`, if that acquisition was already completed.
    pub(crate) fn complete(
        &mut self,
        seq: u64,
        record: SegmentRecord,
        n_channels: usize,
        endtime: SystemTime,
    ) -> bool {
        if self.state != SegmentState::Acquiring || self.arm_seq != seq {
            return false;
        }
        self.cache = SegmentCache::from_record(record, n_channels).map(Arc::new);
        self.endtime = Some(endtime);
        self.state = SegmentState::Idle;
        true
    }

    /// `Idle -> Transferring`
    pub(crate) fn begin_transfer(&mut self) {
        debug_assert_eq!(self.state, SegmentState::Idle);
        self.state = SegmentState::Transferring;
    }

    /// `Transferring -> Idle`
    pub(crate) fn end_transfer(&mut self) {
        if self.state == SegmentState::Transferring {
            self.state = SegmentState::Idle;
        }
    }

    /// Drops everything recorded, used on teardown and when the segment layout changes
    pub(crate) fn clear(&mut self) {
        self.cache = None;
        self.endtime = None;
        self.samples_per_event = 0;
        self.state = SegmentState::Idle;
    }
}
