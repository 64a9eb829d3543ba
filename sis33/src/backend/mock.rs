//! A simulated digitizer, useful for testing cards without hardware

use super::{Backend, BackendResult, Error, FetchRequest, SegmentLayout};
use crate::{
    card::{Contract, Timestamping},
    config::{CardConfig, Channel},
    core::{Acq, AcqDescriptor, ByteOrder, Event, Trigger},
    segment::SegmentRecord,
    workqueue::IrqLine,
};
use kstring::KString;
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

/// Base address of the simulated board, reported in injected bus errors
const VME_BASE: u32 = 0x3000_0000;
/// Timestamp of the first event after power-on
const FIRST_TIMESTAMP: u64 = 0x1_0000;
/// Timestamp ticks between two simulated triggers
const TRIGGER_PERIOD: u64 = 1_000;

/// Backend operations, for failure injection
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Op {
    InitDefaults,
    ConfigureAcquisition,
    ConfigureEvent,
    ConfigureChannels,
    StartAcquisition,
    FinalizeAcquisition,
    CancelAcquisition,
    Fetch,
    Trigger,
}

/// One backend call, as seen by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    InitDefaults,
    ConfigureAcquisition {
        cfg: CardConfig,
        layout: SegmentLayout,
    },
    ConfigureEvent {
        segment: u32,
        nr_events: u32,
        ev_length: u32,
    },
    ConfigureChannels {
        offsets: Vec<u32>,
    },
    StartAcquisition {
        segment: usize,
    },
    FinalizeAcquisition {
        segment: usize,
    },
    CancelAcquisition {
        segment: usize,
    },
    Fetch {
        segment: usize,
        channel: usize,
        n: usize,
    },
    Trigger(Trigger),
}

/// When the simulated board raises its "acquisition done" interrupt
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Completion {
    /// Only on [`Mock::fire`]
    Manual,
    /// All events are captured this long after the start
    Timed(Duration),
}

#[derive(Debug)]
struct Armed {
    segment: usize,
    nr_events: u32,
    ev_length: u32,
    irq: Option<IrqLine>,
    /// Tells a timed completion apart from the ones of earlier arms
    generation: u64,
    /// Cleared once the acquisition is over, the event counters stay readable
    running: bool,
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<Call>,
    fail: Option<Op>,
    /// What the last `configure_event` programmed
    pending: Option<(usize, u32, u32)>,
    /// The last acquisition started
    armed: Option<Armed>,
    captured: u32,
    generation: u64,
}

/// A platform that simulates a digitizer, recording every call made to it
#[derive(Debug)]
pub struct Mock {
    completion: Completion,
    fetch_delay: Duration,
    state: Arc<Mutex<State>>,
}

impl Mock {
    fn new(completion: Completion) -> Self {
        Self {
            completion,
            fetch_delay: Duration::ZERO,
            state: Arc::default(),
        }
    }

    /// A board whose acquisitions only end through [`Mock::fire`] or a cancel
    #[must_use]
    pub fn manual() -> Self {
        Self::new(Completion::Manual)
    }

    /// A board that captures every requested event `latency` after the start
    #[must_use]
    pub fn timed(latency: Duration) -> Self {
        Self::new(Completion::Timed(latency))
    }

    /// Makes every fetch take at least `delay`, as a slow bus would
    #[must_use]
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    /// The capabilities of the simulated board, modeled after a SIS3302
    #[must_use]
    pub fn contract() -> Contract {
        Contract {
            description: KString::from_static("SIS3302 (simulated)"),
            n_bits: 16,
            n_channels: 4,
            max_nr_events: 512,
            max_delay: (1 << 24) - 2,
            ev_lengths: (6..=20).rev().map(|p| 1 << p).collect(),
            freqs: vec![100_000_000, 50_000_000, 25_000_000],
            n_segments_min: 1,
            n_segments_max: 8,
            n_segments: 2,
            timestamping: Some(Timestamping {
                max_ticks_log2: 48,
                divider_max: 4,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `call` and fails it if a failure was injected for `op`
    fn enter(&self, op: Op, call: Call) -> BackendResult<MutexGuard<'_, State>> {
        let mut state = self.state();
        state.calls.push(call);
        if state.fail == Some(op) {
            state.fail = None;
            return Err(Error::Bus { addr: VME_BASE });
        }
        Ok(state)
    }

    /// Every call made so far
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Makes the next call of `op` fail with a bus error
    pub fn fail_next(&self, op: Op) {
        self.state().fail = Some(op);
    }

    /// Whether an acquisition is running
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.state().armed.as_ref().is_some_and(|a| a.running)
    }

    /// Pretends `n` events have been captured so far
    pub fn capture(&self, n: u32) {
        let mut state = self.state();
        let max = state.armed.as_ref().map_or(0, |a| a.nr_events);
        state.captured = n.min(max);
    }

    /// Raises the "acquisition done" interrupt. Returns false if nothing is running.
    pub fn fire(&self) -> bool {
        let irq = self
            .state()
            .armed
            .as_ref()
            .filter(|a| a.running)
            .and_then(|a| a.irq.clone());
        irq.is_some_and(|irq| irq.raise())
    }

    fn record(armed: &Armed, captured: u32, n_channels: usize) -> SegmentRecord {
        let events = (0..n_channels)
            .flat_map(|_| 0..captured)
            .map(|event| Event {
                nr_samples: armed.ev_length,
                first_samp: (event * 3) % armed.ev_length,
            })
            .collect();
        let timestamps = (0..u64::from(captured))
            .map(|event| FIRST_TIMESTAMP + event * TRIGGER_PERIOD)
            .collect();
        SegmentRecord {
            nr_events: captured,
            events,
            timestamps: Some(timestamps),
        }
    }

    /// The sample the simulated ADC produces
    #[must_use]
    pub fn sample(channel: usize, event: usize, index: usize) -> u16 {
        // Truncation is what we want, it's a test pattern
        #[allow(clippy::cast_possible_truncation)]
        let (c, e, i) = (channel as u16, event as u16, index as u16);
        ((c & 0xf) << 12) | ((e & 0xf) << 8) | (i & 0xff)
    }
}

impl Backend for Mock {
    fn init_defaults(&self, cfg: &mut CardConfig, channels: &mut [Channel]) -> BackendResult<()> {
        self.enter(Op::InitDefaults, Call::InitDefaults)?;
        cfg.trigger_ext_enable = false;
        for channel in channels {
            channel.offset = 0x8000;
            channel.exposed = true;
        }
        Ok(())
    }

    fn configure_acquisition(
        &self,
        cfg: &CardConfig,
        layout: SegmentLayout,
    ) -> BackendResult<()> {
        self.enter(
            Op::ConfigureAcquisition,
            Call::ConfigureAcquisition {
                cfg: cfg.clone(),
                layout,
            },
        )?;
        Ok(())
    }

    fn configure_event(
        &self,
        _cfg: &CardConfig,
        _layout: SegmentLayout,
        desc: &AcqDescriptor,
    ) -> BackendResult<()> {
        let mut state = self.enter(
            Op::ConfigureEvent,
            Call::ConfigureEvent {
                segment: desc.segment,
                nr_events: desc.nr_events,
                ev_length: desc.ev_length,
            },
        )?;
        state.pending = Some((desc.segment as usize, desc.nr_events, desc.ev_length));
        Ok(())
    }

    fn configure_channels(&self, channels: &[Channel]) -> BackendResult<()> {
        self.enter(
            Op::ConfigureChannels,
            Call::ConfigureChannels {
                offsets: channels.iter().map(|c| c.offset).collect(),
            },
        )?;
        Ok(())
    }

    fn start_acquisition(&self, irq: IrqLine) -> BackendResult<()> {
        let segment = irq.segment();
        let mut state = self.enter(Op::StartAcquisition, Call::StartAcquisition { segment })?;
        let Some((_, nr_events, ev_length)) = state.pending.take() else {
            return Err(Error::Unsupported("starting an acquisition that wasn't configured"));
        };
        state.generation += 1;
        state.captured = 0;
        let generation = state.generation;
        state.armed = Some(Armed {
            segment,
            nr_events,
            ev_length,
            irq: Some(irq.clone()),
            generation,
            running: true,
        });
        drop(state);

        if let Completion::Timed(latency) = self.completion {
            let shared = Arc::clone(&self.state);
            thread::spawn(move || {
                thread::sleep(latency);
                let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
                if state
                    .armed
                    .as_ref()
                    .is_some_and(|a| a.running && a.generation == generation)
                {
                    state.captured = nr_events;
                    drop(state);
                    irq.raise();
                }
            });
        }
        Ok(())
    }

    fn finalize_acquisition(
        &self,
        segment: usize,
        n_channels: usize,
    ) -> BackendResult<SegmentRecord> {
        let mut state = self.enter(
            Op::FinalizeAcquisition,
            Call::FinalizeAcquisition { segment },
        )?;
        let captured = state.captured;
        match state.armed.as_mut() {
            Some(armed) if armed.segment == segment => {
                armed.running = false;
                Ok(Self::record(armed, captured, n_channels))
            }
            _ => Ok(SegmentRecord::empty()),
        }
    }

    fn cancel_acquisition(
        &self,
        segment: usize,
        n_channels: usize,
    ) -> BackendResult<SegmentRecord> {
        let mut state = self.enter(Op::CancelAcquisition, Call::CancelAcquisition { segment })?;
        let captured = state.captured;
        // Stopping a finished acquisition still reads back its event counter
        match state.armed.as_mut() {
            Some(armed) if armed.segment == segment => {
                armed.running = false;
                Ok(Self::record(armed, captured, n_channels))
            }
            _ => Ok(SegmentRecord::empty()),
        }
    }

    fn fetch(&self, request: FetchRequest<'_>, acqs: &mut [Acq]) -> BackendResult<ByteOrder> {
        self.enter(
            Op::Fetch,
            Call::Fetch {
                segment: request.segment,
                channel: request.channel,
                n: acqs.len(),
            },
        )?;
        if !self.fetch_delay.is_zero() {
            thread::sleep(self.fetch_delay);
        }
        for (event, acq) in acqs.iter_mut().enumerate() {
            let n = request.samples_per_event as usize;
            for (index, word) in acq.data.chunks_exact_mut(2).take(n).enumerate() {
                word.copy_from_slice(&Self::sample(request.channel, event, index).to_be_bytes());
            }
        }
        Ok(ByteOrder::Big)
    }

    fn trigger(&self, kind: Trigger) -> BackendResult<()> {
        self.enter(Op::Trigger, Call::Trigger(kind))?;
        Ok(())
    }
}
