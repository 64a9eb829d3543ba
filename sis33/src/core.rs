//! The core request and response types exchanged with a card

use crate::error::{Error, Result};
use packed_struct::prelude::*;
use std::time::{Duration, SystemTime};

/// Samples are stored as 16-bit words regardless of the ADC resolution
pub const SAMPLE_WIDTH: usize = std::mem::size_of::<u16>();

/// Software trigger kinds
#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Trigger {
    Stop = 0,
    Start = 1,
}

impl TryFrom<u32> for Trigger {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        u8::try_from(value)
            .ok()
            .and_then(Self::from_primitive)
            .ok_or_else(|| Error::invalid(format!("{value} is not a trigger kind")))
    }
}

/// Wait-mode flags of an arm or fetch request
#[derive(PackedStruct, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
pub struct AcqFlags {
    /// Return immediately instead of waiting for the acquisition
    #[packed_field(bits = "0")]
    pub dont_wait: bool,
    /// Wait at most for the request's timeout
    #[packed_field(bits = "1")]
    pub timeout: bool,
}

impl AcqFlags {
    pub const DONT_WAIT: u32 = 1;
    pub const TIMEOUT: u32 = 2;

    /// Decodes the flag word of a control request, unknown bits are dropped
    #[must_use]
    pub fn from_bits(bits: u32) -> Self {
        Self::unpack(&bits.to_be_bytes()).unwrap_or_default()
    }

    #[must_use]
    pub fn bits(self) -> u32 {
        self.pack().map(u32::from_be_bytes).unwrap_or_default()
    }

    /// Resolves the flags and the request's timeout into a [`WaitMode`]
    /// # Errors
    /// Returns an error when both "don't wait" and "timeout" are requested, or the timeout is
    /// malformed
    pub fn wait_mode(self, timeout: Timespec) -> Result<WaitMode> {
        match (self.dont_wait, self.timeout) {
            (true, true) => Err(Error::invalid(
                "the no-wait and timeout flags are mutually exclusive",
            )),
            (true, false) => Ok(WaitMode::NoWait),
            (false, false) => Ok(WaitMode::Block),
            (false, true) => Ok(WaitMode::Timeout(timeout.to_duration()?)),
        }
    }
}

/// How a caller wants to deal with an acquisition still in progress
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitMode {
    NoWait,
    Block,
    Timeout(Duration),
}

impl WaitMode {
    /// The bound on the wait, `None` meaning forever
    #[must_use]
    pub fn timeout(self) -> Option<Duration> {
        match self {
            Self::Timeout(t) => Some(t),
            _ => None,
        }
    }
}

/// A `{seconds, nanoseconds}` pair, the canonical form timeouts travel in
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Timespec {
    pub seconds: i64,
    pub nanoseconds: i64,
}

impl Timespec {
    /// # Errors
    /// Returns an error for negative times and out of range nanoseconds
    pub fn to_duration(self) -> Result<Duration> {
        let seconds = u64::try_from(self.seconds)
            .map_err(|_| Error::invalid("negative timeout"))?;
        let nanos = u32::try_from(self.nanoseconds)
            .ok()
            .filter(|n| *n < 1_000_000_000)
            .ok_or_else(|| Error::invalid("timeout nanoseconds out of range"))?;
        Ok(Duration::new(seconds, nanos))
    }
}

impl From<Duration> for Timespec {
    fn from(value: Duration) -> Self {
        Self {
            seconds: i64::try_from(value.as_secs()).unwrap_or(i64::MAX),
            nanoseconds: i64::from(value.subsec_nanos()),
        }
    }
}

/// Byte order of the fetched sample words
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

impl ByteOrder {
    #[must_use]
    pub fn is_big_endian(self) -> bool {
        self == Self::Big
    }
}

/// What the hardware recorded for one event of a segment
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Event {
    /// Number of valid samples
    pub nr_samples: u32,
    /// Index of the oldest sample, non-zero when the capture wrapped around
    pub first_samp: u32,
}

/// The arm request
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AcqDescriptor {
    pub segment: u32,
    pub nr_events: u32,
    /// Samples per event
    pub ev_length: u32,
    pub flags: AcqFlags,
    pub timeout: Timespec,
}

impl AcqDescriptor {
    /// A blocking arm request
    #[must_use]
    pub fn new(segment: u32, nr_events: u32, ev_length: u32) -> Self {
        Self {
            segment,
            nr_events,
            ev_length,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn no_wait(mut self) -> Self {
        self.flags.dont_wait = true;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.flags.timeout = true;
        self.timeout = timeout.into();
        self
    }
}

/// One fetched event: the caller's buffer plus the metadata filled in by the fetch
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Acq {
    /// Raw sample words, in `byte_order`
    pub data: Vec<u8>,
    /// Declared size of `data` in bytes
    pub size: u32,
    pub nr_samples: u32,
    /// Timestamp ticks since the first event of the segment
    pub prevticks: u64,
    pub first_samp: u32,
    pub byte_order: ByteOrder,
}

impl Acq {
    /// A zeroed buffer large enough for one event of `ev_length` samples
    #[must_use]
    pub fn for_event_length(ev_length: u32) -> Self {
        let size = ev_length as usize * SAMPLE_WIDTH;
        Self {
            data: vec![0; size],
            size: u32::try_from(size).unwrap_or(u32::MAX),
            ..Default::default()
        }
    }

    /// Decodes the valid samples in chronological order, unwrapping ring captures
    #[must_use]
    pub fn samples(&self) -> Vec<u16> {
        let words: Vec<u16> = self
            .data
            .chunks_exact(SAMPLE_WIDTH)
            .take(self.nr_samples as usize)
            .map(|c| match self.byte_order {
                ByteOrder::Big => u16::from_be_bytes([c[0], c[1]]),
                ByteOrder::Little => u16::from_le_bytes([c[0], c[1]]),
            })
            .collect();
        let first = (self.first_samp as usize).min(words.len());
        words[first..].iter().chain(&words[..first]).copied().collect()
    }
}

/// The fetch request, and its response once [`crate::card::Card::fetch`] returns
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AcqList {
    pub segment: u32,
    pub channel: u32,
    pub acqs: Vec<Acq>,
    pub flags: AcqFlags,
    pub timeout: Timespec,
    /// When the fetched acquisition finished
    pub endtime: Option<SystemTime>,
}

impl AcqList {
    /// A blocking request for `n_acqs` events of `ev_length` samples
    #[must_use]
    pub fn new(segment: u32, channel: u32, n_acqs: usize, ev_length: u32) -> Self {
        Self {
            segment,
            channel,
            acqs: vec![Acq::for_event_length(ev_length); n_acqs],
            ..Default::default()
        }
    }

    #[must_use]
    pub fn no_wait(mut self) -> Self {
        self.flags.dont_wait = true;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.flags.timeout = true;
        self.timeout = timeout.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_bits() {
        assert_eq!(AcqFlags::from_bits(AcqFlags::DONT_WAIT).bits(), 1);
        let flags = AcqFlags::from_bits(AcqFlags::DONT_WAIT | AcqFlags::TIMEOUT);
        assert!(flags.dont_wait && flags.timeout);
        // Unknown bits are ignored
        assert_eq!(AcqFlags::from_bits(0xff00_0004), AcqFlags::default());
    }

    #[test]
    fn test_wait_modes() {
        let ts = Timespec {
            seconds: 1,
            nanoseconds: 500,
        };
        assert_eq!(AcqFlags::default().wait_mode(ts).unwrap(), WaitMode::Block);
        assert_eq!(
            AcqFlags::from_bits(AcqFlags::DONT_WAIT).wait_mode(ts).unwrap(),
            WaitMode::NoWait
        );
        assert_eq!(
            AcqFlags::from_bits(AcqFlags::TIMEOUT).wait_mode(ts).unwrap(),
            WaitMode::Timeout(Duration::new(1, 500))
        );
        assert!(matches!(
            AcqFlags::from_bits(3).wait_mode(ts),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_bad_timespec() {
        let negative = Timespec {
            seconds: -1,
            nanoseconds: 0,
        };
        assert!(negative.to_duration().is_err());
        let too_many_nanos = Timespec {
            seconds: 0,
            nanoseconds: 1_000_000_000,
        };
        assert!(too_many_nanos.to_duration().is_err());
        // Only looked at when the timeout flag is set
        assert_eq!(
            AcqFlags::default().wait_mode(negative).unwrap(),
            WaitMode::Block
        );
    }

    #[test]
    fn test_trigger_from_u32() {
        assert_eq!(Trigger::try_from(1).unwrap(), Trigger::Start);
        assert_eq!(Trigger::try_from(0).unwrap(), Trigger::Stop);
        assert!(Trigger::try_from(2).is_err());
        assert!(Trigger::try_from(0x100).is_err());
    }

    #[test]
    fn test_samples_unwrap_ring() {
        let acq = Acq {
            data: [0u16, 1, 2, 3, 4, 5]
                .iter()
                .flat_map(|s| s.to_be_bytes())
                .collect(),
            size: 12,
            nr_samples: 4,
            first_samp: 1,
            byte_order: ByteOrder::Big,
            ..Default::default()
        };
        assert_eq!(acq.samples(), vec![1, 2, 3, 0]);
    }
}
