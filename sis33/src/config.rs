//! Card-wide acquisition settings and the per-channel configuration.
//!
//! Every setter takes the card lock, refuses to touch a card that is acquiring, hands the updated
//! settings to the backend and only keeps them if the backend accepted them.

use crate::{
    card::Card,
    core::Trigger,
    error::{Error, Result},
    segment::SegmentState,
};
use packed_struct::prelude::*;
use tracing::debug;

/// Where the sampling clock comes from
#[derive(PrimitiveEnum_u8, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ClockSource {
    #[default]
    Internal = 0,
    External = 1,
}

/// Rounding direction when picking a value out of a list of supported ones
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Round {
    #[default]
    Nearest,
    Down,
    Up,
}

/// The card-wide acquisition settings
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CardConfig {
    pub clock_source: ClockSource,
    /// Sampling frequency in Hz, when running off the internal clock
    pub clock_frequency: u32,
    /// Samples between the start trigger and the start of sampling
    pub start_delay: u32,
    /// Samples between the stop trigger and the end of sampling
    pub stop_delay: u32,
    /// Start sampling as soon as the card is armed
    pub start_auto: bool,
    /// Stop once an event is full
    pub stop_auto: bool,
    /// Accept triggers on the front panel input
    pub trigger_ext_enable: bool,
    /// Divider between the sampling clock and the timestamp counter
    pub timestamp_divider: u32,
}

impl Default for CardConfig {
    fn default() -> Self {
        Self {
            clock_source: ClockSource::Internal,
            clock_frequency: 0,
            start_delay: 0,
            stop_delay: 0,
            start_auto: true,
            stop_auto: true,
            trigger_ext_enable: true,
            timestamp_divider: 1,
        }
    }
}

/// One analog input
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Channel {
    /// DAC calibration offset, 16 bits
    pub offset: u32,
    /// Whether the channel is offered to users
    pub exposed: bool,
}

const OFFSET_MASK: u32 = 0xffff;

impl Card {
    /// Applies `update` to a copy of the configuration and commits it once the backend took it
    fn update_config<F>(&self, what: &'static str, update: F) -> Result<()>
    where
        F: FnOnce(&mut CardConfig),
    {
        let contract = self.contract()?;
        let mut state = self.state();
        if state.acquiring().is_some() {
            debug!(card = self.index(), what, "Refusing to reconfigure while acquiring");
            return Err(Error::Busy);
        }
        let mut cfg = state.cfg.clone();
        update(&mut cfg);
        self.backend
            .configure_acquisition(&cfg, contract.layout(state.n_segments))?;
        state.cfg = cfg;
        debug!(card = self.index(), what, "Configuration updated");
        Ok(())
    }

    /// A copy of the current settings
    /// # Errors
    /// Returns an error if the card isn't registered
    pub fn config(&self) -> Result<CardConfig> {
        self.contract()?;
        Ok(self.state().cfg.clone())
    }

    /// # Errors
    /// Returns an error if the card is busy acquiring or on backend failure
    pub fn set_start_auto(&self, enable: bool) -> Result<()> {
        self.update_config("start_auto", |cfg| cfg.start_auto = enable)
    }

    /// # Errors
    /// Returns an error if the card is busy acquiring or on backend failure
    pub fn set_stop_auto(&self, enable: bool) -> Result<()> {
        self.update_config("stop_auto", |cfg| cfg.stop_auto = enable)
    }

    /// # Errors
    /// Returns an error if the card is busy acquiring or on backend failure
    pub fn set_trigger_ext_enable(&self, enable: bool) -> Result<()> {
        self.update_config("trigger_ext_en", |cfg| cfg.trigger_ext_enable = enable)
    }

    /// # Errors
    /// Returns an error if `delay` exceeds the card's maximum, the card is busy acquiring or on
    /// backend failure
    pub fn set_start_delay(&self, delay: u32) -> Result<()> {
        if delay > self.contract()?.max_delay {
            return Err(Error::invalid(format!("start delay {delay} too large")));
        }
        self.update_config("start_delay", |cfg| cfg.start_delay = delay)
    }

    /// # Errors
    /// Returns an error if `delay` exceeds the card's maximum, the card is busy acquiring or on
    /// backend failure
    pub fn set_stop_delay(&self, delay: u32) -> Result<()> {
        if delay > self.contract()?.max_delay {
            return Err(Error::invalid(format!("stop delay {delay} too large")));
        }
        self.update_config("stop_delay", |cfg| cfg.stop_delay = delay)
    }

    /// # Errors
    /// Returns an error if the card can't timestamp events, `divider` is out of range, the card is
    /// busy acquiring or on backend failure
    pub fn set_timestamp_divider(&self, divider: u32) -> Result<()> {
        let Some(ts) = self.contract()?.timestamping else {
            return Err(Error::invalid("the card doesn't timestamp events"));
        };
        if divider == 0 || divider > ts.divider_max {
            return Err(Error::invalid(format!(
                "timestamp divider {divider} out of range"
            )));
        }
        self.update_config("ev_tstamp_divider", |cfg| cfg.timestamp_divider = divider)
    }

    /// # Errors
    /// Returns an error if the card is busy acquiring or on backend failure
    pub fn set_clock_source(&self, source: ClockSource) -> Result<()> {
        self.update_config("clock_source", |cfg| cfg.clock_source = source)
    }

    /// Sets the sampling frequency, see
    /// [`Contract::round_clock_frequency`](crate::card::Contract::round_clock_frequency) to get a
    /// valid one
    /// # Errors
    /// Returns an error if `hz` isn't supported, the card is busy acquiring or on backend failure
    pub fn set_clock_frequency(&self, hz: u32) -> Result<()> {
        if !self.contract()?.freqs.contains(&hz) {
            return Err(Error::invalid(format!("unsupported clock frequency {hz}")));
        }
        self.update_config("clock_frequency", |cfg| cfg.clock_frequency = hz)
    }

    /// Splits the sample memory in `n` segments, rounded up to a power of two and clamped to what
    /// the card supports. Everything recorded so far is dropped.
    /// # Errors
    /// Returns an error if `n` is below the minimum, any segment is acquiring or transferring or
    /// on backend failure
    pub fn set_n_segments(&self, n: u32) -> Result<()> {
        let contract = self.contract()?;
        if n < contract.n_segments_min {
            return Err(Error::invalid(format!(
                "{n} segments, the card needs at least {}",
                contract.n_segments_min
            )));
        }
        let n = n
            .checked_next_power_of_two()
            .unwrap_or(u32::MAX)
            .min(contract.n_segments_max);
        let mut state = self.state();
        if state.segments.iter().any(|s| s.state() != SegmentState::Idle) {
            return Err(Error::Busy);
        }
        if n == state.n_segments {
            return Ok(());
        }
        self.backend
            .configure_acquisition(&state.cfg, contract.layout(n))?;
        state.n_segments = n;
        state.curr_segment = 0;
        for segment in &mut state.segments {
            segment.clear();
        }
        debug!(card = self.index(), n_segments = n, "Segment layout changed");
        Ok(())
    }

    /// # Errors
    /// Returns an error if `channel` is out of range or the card isn't registered
    pub fn channel_offset(&self, channel: usize) -> Result<u32> {
        self.contract()?;
        self.state()
            .channels
            .get(channel)
            .map(|c| c.offset)
            .ok_or_else(|| Error::invalid(format!("channel {channel} out of range")))
    }

    /// Sets the calibration offset of `channel`, only the low 16 bits are kept
    /// # Errors
    /// Returns an error if `channel` is out of range or on backend failure, in which case the
    /// previous offset stays
    pub fn set_channel_offset(&self, channel: usize, offset: u32) -> Result<()> {
        if channel >= self.contract()?.n_channels {
            return Err(Error::invalid(format!("channel {channel} out of range")));
        }
        let mut state = self.state();
        let previous = state.channels[channel].offset;
        state.channels[channel].offset = offset & OFFSET_MASK;
        if let Err(e) = self.backend.configure_channels(&state.channels) {
            state.channels[channel].offset = previous;
            return Err(e.into());
        }
        Ok(())
    }

    /// Sends a software trigger
    /// # Errors
    /// Returns an error if the card isn't registered or on backend failure
    pub fn trigger(&self, kind: Trigger) -> Result<()> {
        self.contract()?;
        Ok(self.backend.trigger(kind)?)
    }
}
