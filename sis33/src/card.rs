//! The card abstraction: one digitizer board bound to the backend of its family

use crate::{
    backend::{Backend, SegmentLayout},
    completion::CompletionSignal,
    config::{CardConfig, Channel, Round},
    error::{Error, Result},
    segment::{Segment, SegmentState},
    workqueue::{IrqLine, Job},
};
use crossbeam_channel::Sender;
use kstring::KString;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak,
};
use tracing::{info, warn};

/// Event timestamping capabilities
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Timestamping {
    /// Width of the timestamp counter
    pub max_ticks_log2: u32,
    /// Largest supported clock divider for the timestamp counter
    pub divider_max: u32,
}

/// What a backend declares about its hardware when registering a card
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    pub description: KString,
    /// ADC resolution
    pub n_bits: u32,
    pub n_channels: usize,
    /// Most events a single arm may ask for
    pub max_nr_events: u32,
    /// Largest start/stop delay, in samples
    pub max_delay: u32,
    /// Supported event lengths, in samples, largest first
    pub ev_lengths: Vec<u32>,
    /// Supported sampling clock frequencies, in Hz, fastest first
    pub freqs: Vec<u32>,
    pub n_segments_min: u32,
    pub n_segments_max: u32,
    /// Number of segments after registration
    pub n_segments: u32,
    pub timestamping: Option<Timestamping>,
}

fn strictly_descending(list: &[u32]) -> bool {
    !list.is_empty() && list.windows(2).all(|w| w[0] > w[1])
}

fn round_in(list: &[u32], value: u32, round: Round) -> u32 {
    let (Some(&largest), Some(&smallest)) = (list.first(), list.last()) else {
        return value;
    };
    if value >= largest {
        return largest;
    }
    if value <= smallest {
        return smallest;
    }
    // Ties go to the larger candidate
    list.iter()
        .copied()
        .filter(|c| match round {
            Round::Up => *c >= value,
            Round::Down => *c <= value,
            Round::Nearest => true,
        })
        .min_by_key(|c| c.abs_diff(value))
        .unwrap_or(value)
}

impl Contract {
    /// # Errors
    /// Returns an error if the declared capabilities are inconsistent
    pub fn validate(&self) -> Result<()> {
        if self.n_segments == 0 || self.n_segments_min == 0 || self.n_segments_max == 0 {
            return Err(Error::invalid("segment counts must be non-zero"));
        }
        if !self.n_segments_min.is_power_of_two()
            || !self.n_segments_max.is_power_of_two()
            || !self.n_segments.is_power_of_two()
        {
            return Err(Error::invalid("segment counts must be powers of two"));
        }
        if !(self.n_segments_min..=self.n_segments_max).contains(&self.n_segments) {
            return Err(Error::invalid("initial segment count out of bounds"));
        }
        if self.n_channels == 0 {
            return Err(Error::invalid("a card needs at least one channel"));
        }
        if self.max_nr_events == 0 {
            return Err(Error::invalid("max_nr_events must be non-zero"));
        }
        if !strictly_descending(&self.ev_lengths) || self.ev_lengths.contains(&0) {
            return Err(Error::invalid(
                "event lengths must be non-zero and sorted largest first",
            ));
        }
        if !strictly_descending(&self.freqs) {
            return Err(Error::invalid("frequencies must be sorted fastest first"));
        }
        if self.timestamping.is_some_and(|t| t.divider_max == 0) {
            return Err(Error::invalid("timestamp divider_max must be non-zero"));
        }
        Ok(())
    }

    /// Samples a segment can hold when memory is split in `n_segments`
    #[must_use]
    pub fn max_samples_per_segment(&self, n_segments: u32) -> u32 {
        let split = (n_segments / self.n_segments_min.max(1)).max(1);
        self.ev_lengths.first().map_or(0, |l| l / split)
    }

    #[must_use]
    pub fn supports_event_length(&self, ev_length: u32) -> bool {
        self.ev_lengths.contains(&ev_length)
    }

    /// Rounds `ev_length` to a supported event length
    #[must_use]
    pub fn round_event_length(&self, ev_length: u32, round: Round) -> u32 {
        round_in(&self.ev_lengths, ev_length, round)
    }

    /// Rounds `hz` to a supported clock frequency
    #[must_use]
    pub fn round_clock_frequency(&self, hz: u32, round: Round) -> u32 {
        round_in(&self.freqs, hz, round)
    }

    pub(crate) fn layout(&self, n_segments: u32) -> SegmentLayout {
        SegmentLayout {
            n_segments,
            max_samples_per_segment: self.max_samples_per_segment(n_segments),
        }
    }
}

/// Everything guarded by the card lock
#[derive(Debug, Default)]
pub(crate) struct CardState {
    pub(crate) cfg: CardConfig,
    pub(crate) n_segments: u32,
    /// The segment armed last
    pub(crate) curr_segment: usize,
    pub(crate) segments: Vec<Segment>,
    pub(crate) channels: Vec<Channel>,
}

impl CardState {
    /// The acquiring segment and its arm number
    pub(crate) fn acquiring(&self) -> Option<(usize, u64)> {
        self.segments
            .iter()
            .enumerate()
            .find(|(_, s)| s.is_acquiring())
            .map(|(i, s)| (i, s.arm_seq()))
    }
}

/// One digitizer board.
///
/// Cards are created by the [`Registry`](crate::registry::Registry) and shared as `Arc<Card>`
/// between every user of the board.
#[derive(Debug)]
pub struct Card {
    index: usize,
    pub(crate) backend: Arc<dyn Backend>,
    contract: OnceLock<Contract>,
    registered: AtomicBool,
    state: Mutex<CardState>,
    pub(crate) completion: CompletionSignal,
    /// Completion queue of the owning registry
    jobs: Sender<Job>,
    /// Upwards pointer to ourselves for the interrupt lines we hand out
    this: Weak<Card>,
}

impl Card {
    pub(crate) fn new(index: usize, backend: Arc<dyn Backend>, jobs: Sender<Job>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            index,
            backend,
            contract: OnceLock::new(),
            registered: AtomicBool::new(false),
            state: Mutex::new(CardState::default()),
            completion: CompletionSignal::new(),
            jobs,
            this: this.clone(),
        })
    }

    /// Slot of this card in its registry
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// The capabilities the backend declared
    /// # Errors
    /// Returns an error if the card isn't registered
    pub fn contract(&self) -> Result<&Contract> {
        if !self.is_registered() {
            return Err(Error::NoDevice);
        }
        self.contract.get().ok_or(Error::NoDevice)
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, CardState> {
        // Every lock section leaves the state consistent before it can panic
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn irq_line(&self, segment: usize, seq: u64) -> IrqLine {
        IrqLine::new(self.jobs.clone(), self.this.clone(), segment, seq)
    }

    /// Runs the backend's default configuration and opens the card for business
    pub(crate) fn register(&self, contract: Contract) -> Result<()> {
        contract.validate()?;
        if self.contract.get().is_some() {
            return Err(Error::invalid("the card was registered before"));
        }
        let mut cfg = CardConfig {
            clock_frequency: contract.freqs[0],
            ..Default::default()
        };
        let mut channels = vec![Channel::default(); contract.n_channels];
        let layout = contract.layout(contract.n_segments);

        let mut state = self.state();
        self.backend.init_defaults(&mut cfg, &mut channels)?;
        self.backend.configure_acquisition(&cfg, layout)?;
        self.backend.configure_channels(&channels)?;
        *state = CardState {
            cfg,
            n_segments: contract.n_segments,
            curr_segment: 0,
            segments: (0..contract.n_segments_max)
                .map(|_| Segment::default())
                .collect(),
            channels,
        };
        drop(state);

        info!(
            card = self.index,
            description = contract.description.as_str(),
            "Registered card"
        );
        // Only fails on a concurrent registration, which the check above makes a caller bug
        if self.contract.set(contract).is_err() {
            return Err(Error::invalid("the card was registered concurrently"));
        }
        self.registered.store(true, Ordering::Release);
        Ok(())
    }

    /// Closes the card and drops every segment's recorded data. Returns false if it wasn't
    /// registered.
    pub(crate) fn unregister(&self) -> bool {
        if !self.registered.swap(false, Ordering::AcqRel) {
            return false;
        }
        let mut state = self.state();
        if let Some((segment, _)) = state.acquiring() {
            let n_channels = self.contract.get().map_or(0, |c| c.n_channels);
            // Best effort, the card goes away either way
            if let Err(e) = self.backend.cancel_acquisition(segment, n_channels) {
                warn!(card = self.index, segment, "Cannot stop the running acquisition: {e}");
            }
        }
        for segment in &mut state.segments {
            segment.clear();
        }
        drop(state);
        // Nobody should stay blocked on a card that is going away
        self.completion.interrupt();
        info!(card = self.index, "Unregistered card");
        true
    }

    /// Number of segments the sample memory is currently split in
    /// # Errors
    /// Returns an error if the card isn't registered
    pub fn n_segments(&self) -> Result<u32> {
        self.contract()?;
        Ok(self.state().n_segments)
    }

    /// The segment armed last
    /// # Errors
    /// Returns an error if the card isn't registered
    pub fn curr_segment(&self) -> Result<usize> {
        self.contract()?;
        Ok(self.state().curr_segment)
    }

    /// # Errors
    /// Returns an error if the card isn't registered or `segment` is out of range
    pub fn segment_state(&self, segment: usize) -> Result<SegmentState> {
        self.contract()?;
        let state = self.state();
        if segment >= state.n_segments as usize {
            return Err(Error::invalid(format!("segment {segment} out of range")));
        }
        Ok(state.segments[segment].state())
    }

    /// Number of events the last acquisition on `segment` recorded
    /// # Errors
    /// Returns an error if the card isn't registered or `segment` is out of range
    pub fn recorded_events(&self, segment: usize) -> Result<u32> {
        self.contract()?;
        let state = self.state();
        if segment >= state.n_segments as usize {
            return Err(Error::invalid(format!("segment {segment} out of range")));
        }
        Ok(state.segments[segment].recorded_event_count())
    }

    /// Whether any segment is acquiring right now
    /// # Errors
    /// Returns an error if the card isn't registered
    pub fn is_acquiring(&self) -> Result<bool> {
        self.contract()?;
        Ok(self.state().acquiring().is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::Mock;

    #[test]
    fn test_contract_validation() {
        let good = Mock::contract();
        assert!(good.validate().is_ok());

        let mut c = good.clone();
        c.n_segments = 0;
        assert!(c.validate().is_err());
        let mut c = good.clone();
        c.n_segments_min = 0;
        assert!(c.validate().is_err());
        let mut c = good.clone();
        c.n_segments_max = 0;
        assert!(c.validate().is_err());
        let mut c = good.clone();
        c.n_segments = 3;
        assert!(c.validate().is_err());
        let mut c = good.clone();
        c.ev_lengths = vec![64, 128];
        assert!(c.validate().is_err());
        let mut c = good.clone();
        c.freqs.clear();
        assert!(c.validate().is_err());
        let mut c = good;
        c.n_channels = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_max_samples_per_segment() {
        let c = Mock::contract();
        let largest = c.ev_lengths[0];
        assert_eq!(c.max_samples_per_segment(1), largest);
        assert_eq!(c.max_samples_per_segment(2), largest / 2);
        assert_eq!(c.max_samples_per_segment(8), largest / 8);
    }

    #[test]
    fn test_rounding() {
        let c = Contract {
            ev_lengths: vec![1024, 512, 256, 128],
            ..Mock::contract()
        };
        assert_eq!(c.round_event_length(300, Round::Nearest), 256);
        assert_eq!(c.round_event_length(300, Round::Up), 512);
        assert_eq!(c.round_event_length(300, Round::Down), 256);
        assert_eq!(c.round_event_length(512, Round::Up), 512);
        // Equidistant goes to the larger one
        assert_eq!(c.round_event_length(384, Round::Nearest), 512);
        // Out of range values clamp, whatever the direction
        assert_eq!(c.round_event_length(5000, Round::Down), 1024);
        assert_eq!(c.round_event_length(1, Round::Up), 128);
    }

    #[test]
    fn test_frequency_rounding() {
        let c = Mock::contract();
        assert_eq!(
            c.round_clock_frequency(90_000_000, Round::Nearest),
            100_000_000
        );
        assert_eq!(c.round_clock_frequency(90_000_000, Round::Down), 50_000_000);
        assert_eq!(c.round_clock_frequency(90_000_000, Round::Up), 100_000_000);
        assert_eq!(c.round_clock_frequency(1, Round::Down), 25_000_000);
    }
}
