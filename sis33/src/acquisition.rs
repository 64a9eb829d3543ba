//! Arming a segment, and the two ways an acquisition ends: the backend's completion or an
//! explicit cancel

use crate::{
    card::Card,
    completion::WaitOutcome,
    core::{AcqDescriptor, WaitMode},
    error::{Error, Result},
    segment::SegmentRecord,
};
use std::time::SystemTime;
use tracing::{debug, info, warn};

impl Card {
    /// Configures and starts an acquisition of `desc.nr_events` events of `desc.ev_length` samples
    /// into segment `desc.segment`, then waits for it as the descriptor's flags say.
    ///
    /// Only one segment of a card can be acquiring at a time.
    /// # Errors
    /// - [`Error::InvalidArgument`] on out of range or unsupported parameters
    /// - [`Error::Busy`] if any segment is acquiring or the target segment is being fetched
    /// - [`Error::TimedOut`] / [`Error::Interrupted`] if the wait didn't see the end of the
    ///   acquisition, which keeps running
    /// - [`Error::Backend`] if the hardware couldn't be programmed
    pub fn acquire(&self, desc: &AcqDescriptor) -> Result<()> {
        let contract = self.contract()?;
        if desc.nr_events == 0 || desc.nr_events > contract.max_nr_events {
            debug!(card = self.index(), nr_events = desc.nr_events, "Invalid nr_events");
            return Err(Error::invalid(format!(
                "nr_events must be within [1, {}]",
                contract.max_nr_events
            )));
        }
        if !contract.supports_event_length(desc.ev_length) {
            debug!(card = self.index(), ev_length = desc.ev_length, "Invalid ev_length");
            return Err(Error::invalid(format!(
                "unsupported event length {}",
                desc.ev_length
            )));
        }
        let mode = desc.flags.wait_mode(desc.timeout)?;
        let segment = desc.segment as usize;

        let mut state = self.state();
        if segment >= state.n_segments as usize {
            return Err(Error::invalid(format!(
                "segment {segment} out of range, the card has {}",
                state.n_segments
            )));
        }
        let layout = contract.layout(state.n_segments);
        let samples = u64::from(desc.nr_events) * u64::from(desc.ev_length);
        if samples > u64::from(layout.max_samples_per_segment) {
            debug!(
                card = self.index(),
                samples,
                max = layout.max_samples_per_segment,
                "Acquisition doesn't fit in a segment"
            );
            return Err(Error::invalid(format!(
                "{} events of {} samples don't fit in a segment",
                desc.nr_events, desc.ev_length
            )));
        }
        if state.segments[segment].is_transferring() || state.acquiring().is_some() {
            debug!(card = self.index(), segment, "Busy, cannot arm");
            return Err(Error::Busy);
        }
        self.backend.configure_event(&state.cfg, layout, desc)?;
        let seq = state.segments[segment].arm(desc.ev_length);
        state.curr_segment = segment;
        let generation = self.completion.reset();
        drop(state);

        // Sampling runs without the card lock
        if let Err(e) = self.backend.start_acquisition(self.irq_line(segment, seq)) {
            let mut state = self.state();
            if state.segments[segment].complete(
                seq,
                SegmentRecord::empty(),
                contract.n_channels,
                SystemTime::now(),
            ) {
                self.completion.signal();
            }
            return Err(e.into());
        }
        debug!(
            card = self.index(),
            segment,
            nr_events = desc.nr_events,
            ev_length = desc.ev_length,
            "Acquisition started"
        );
        if mode == WaitMode::NoWait {
            return Ok(());
        }
        self.wait_acquisition(mode, generation)
    }

    /// Blocks until the acquisition armed as `generation` of the card's completion ends, as
    /// `mode` says
    pub(crate) fn wait_acquisition(&self, mode: WaitMode, generation: u64) -> Result<()> {
        match self
            .backend
            .wait_acquisition(&self.completion, generation, mode.timeout())
        {
            WaitOutcome::Completed => Ok(()),
            WaitOutcome::TimedOut => Err(Error::TimedOut),
            WaitOutcome::Interrupted => Err(Error::Interrupted),
        }
    }

    /// Stops the running acquisition, keeping whatever events were captured until then.
    /// Does nothing if no segment is acquiring.
    /// # Errors
    /// Returns an error if the card isn't registered or the hardware couldn't be stopped
    pub fn cancel(&self) -> Result<()> {
        let contract = self.contract()?;
        // Held until the segment is idle, the hardware must only be stopped for this very arm
        let mut state = self.state();
        let Some((segment, seq)) = state.acquiring() else {
            debug!(card = self.index(), "Nothing to cancel");
            return Ok(());
        };
        let record = self
            .backend
            .cancel_acquisition(segment, contract.n_channels)?;
        let captured = record.nr_events;
        if state.segments[segment].complete(seq, record, contract.n_channels, SystemTime::now()) {
            self.completion.signal();
            info!(card = self.index(), segment, captured, "Acquisition cancelled");
        }
        Ok(())
    }

    /// Completion worker side of an acquisition: read back what was captured and wake the waiters
    pub(crate) fn finish_acquisition(&self, segment: usize, seq: u64) {
        let Ok(contract) = self.contract() else {
            debug!(card = self.index(), segment, "Completion on an unregistered card");
            return;
        };
        {
            let state = self.state();
            match state.segments.get(segment) {
                Some(s) if s.is_acquiring() && s.arm_seq() == seq => {}
                _ => {
                    debug!(card = self.index(), segment, "Stale completion");
                    return;
                }
            }
        }
        let endtime = SystemTime::now();
        let record = self
            .backend
            .finalize_acquisition(segment, contract.n_channels)
            .unwrap_or_else(|e| {
                warn!(card = self.index(), segment, "Cannot read back the segment: {e}");
                SegmentRecord::empty()
            });
        let nr_events = record.nr_events;
        let mut state = self.state();
        // Signaled under the lock so a new arm can't reset the signal in between
        if state.segments[segment].complete(seq, record, contract.n_channels, endtime) {
            self.completion.signal();
            debug!(card = self.index(), segment, nr_events, "Acquisition finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{
            mock::{Call, Mock, Op},
            Backend, BackendResult, FetchRequest, SegmentLayout,
        },
        config::{CardConfig, Channel},
        core::{Acq, AcqList, ByteOrder, Trigger},
        registry::{Registry, Slot},
        segment::SegmentState,
        workqueue::IrqLine,
    };
    use crossbeam_channel::{Receiver, Sender};
    use std::{sync::Arc, thread, time::Duration};
    use tracing_test::traced_test;

    fn setup(mock: Mock) -> (Registry, Arc<Card>, Arc<Mock>) {
        let registry = Registry::new().unwrap();
        let mock = Arc::new(mock);
        let card = registry.create(Slot::Auto, mock.clone()).unwrap();
        registry.register(&card, Mock::contract()).unwrap();
        mock.clear_calls();
        (registry, card, mock)
    }

    /// Waits for the worker to bring `segment` back to idle
    fn wait_idle(card: &Card, segment: usize) {
        for _ in 0..500 {
            if card.segment_state(segment).unwrap() == SegmentState::Idle {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("segment {segment} never went idle");
    }

    #[test]
    fn test_arm_wait_fetch() {
        let (_registry, card, _) = setup(Mock::timed(Duration::from_millis(20)));
        card.acquire(&AcqDescriptor::new(0, 4, 64)).unwrap();
        assert_eq!(card.segment_state(0).unwrap(), SegmentState::Idle);
        assert_eq!(card.recorded_events(0).unwrap(), 4);
        let mut list = AcqList::new(0, 0, 4, 64);
        assert_eq!(card.fetch(&mut list).unwrap(), 4);
        assert!(list.acqs.iter().all(|a| a.nr_samples <= 64));
    }

    #[test]
    fn test_second_arm_busy() {
        let (_registry, card, mock) = setup(Mock::manual());
        card.acquire(&AcqDescriptor::new(0, 4, 64).no_wait()).unwrap();
        assert!(matches!(
            card.acquire(&AcqDescriptor::new(1, 4, 64).no_wait()),
            Err(Error::Busy)
        ));
        assert!(matches!(
            card.acquire(&AcqDescriptor::new(0, 4, 64).no_wait()),
            Err(Error::Busy)
        ));
        mock.capture(4);
        mock.fire();
        wait_idle(&card, 0);
        card.acquire(&AcqDescriptor::new(1, 4, 64).no_wait()).unwrap();
        assert_eq!(card.curr_segment().unwrap(), 1);
    }

    #[test]
    fn test_blocking_arm_sees_completion() {
        let (_registry, card, mock) = setup(Mock::manual());
        let remote = Arc::clone(&card);
        let waiter = thread::spawn(move || remote.acquire(&AcqDescriptor::new(1, 2, 128)));
        while !mock.is_armed() {
            thread::sleep(Duration::from_millis(1));
        }
        // Concurrent arm on the other segment while the first one is running
        assert!(matches!(
            card.acquire(&AcqDescriptor::new(0, 1, 64).no_wait()),
            Err(Error::Busy)
        ));
        mock.capture(2);
        mock.fire();
        waiter.join().unwrap().unwrap();
        assert_eq!(card.recorded_events(1).unwrap(), 2);
    }

    #[test]
    fn test_argument_validation() {
        let (_registry, card, mock) = setup(Mock::manual());
        let max = Mock::contract().max_nr_events;
        for desc in [
            AcqDescriptor::new(0, 0, 64),
            AcqDescriptor::new(0, max + 1, 64),
            AcqDescriptor::new(2, 1, 64),
            AcqDescriptor::new(0, 1, 100),
            AcqDescriptor::new(0, 4, 64).no_wait().with_timeout(Duration::from_secs(1)),
        ] {
            assert!(
                matches!(card.acquire(&desc), Err(Error::InvalidArgument(_))),
                "{desc:?}"
            );
        }
        // None of them touched the hardware
        assert!(mock.calls().is_empty());
        assert_eq!(card.segment_state(0).unwrap(), SegmentState::Idle);
    }

    #[test]
    fn test_too_many_samples() {
        let (_registry, card, mock) = setup(Mock::manual());
        let contract = Mock::contract();
        let per_segment = contract.max_samples_per_segment(contract.n_segments);
        let ev_length = contract.ev_lengths[0];
        // A single event of the largest length can't fit once memory is split
        assert!(ev_length > per_segment);
        assert!(matches!(
            card.acquire(&AcqDescriptor::new(0, 1, ev_length).no_wait()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn test_timeout() {
        let (_registry, card, mock) = setup(Mock::manual());
        assert!(matches!(
            card.acquire(&AcqDescriptor::new(0, 4, 64).with_timeout(Duration::from_millis(20))),
            Err(Error::TimedOut)
        ));
        // Still sampling after the caller gave up
        assert_eq!(card.segment_state(0).unwrap(), SegmentState::Acquiring);
        mock.capture(4);
        mock.fire();
        wait_idle(&card, 0);
        assert_eq!(card.recorded_events(0).unwrap(), 4);
    }

    #[test]
    fn test_cancel_keeps_partial() {
        let (_registry, card, mock) = setup(Mock::manual());
        card.acquire(&AcqDescriptor::new(0, 8, 64).no_wait()).unwrap();
        mock.capture(3);
        card.cancel().unwrap();
        assert_eq!(card.segment_state(0).unwrap(), SegmentState::Idle);
        assert_eq!(card.recorded_events(0).unwrap(), 3);
        let mut list = AcqList::new(0, 0, 10, 64);
        assert_eq!(card.fetch(&mut list).unwrap(), 3);
    }

    #[test]
    fn test_cancel_idle_noop() {
        let (_registry, card, mock) = setup(Mock::manual());
        card.cancel().unwrap();
        card.cancel().unwrap();
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn test_cancel_races_completion() {
        let (_registry, card, mock) = setup(Mock::manual());
        card.acquire(&AcqDescriptor::new(0, 8, 64).no_wait()).unwrap();
        mock.capture(5);
        // The interrupt fires, then the cancel comes in right behind it
        mock.fire();
        card.cancel().unwrap();
        wait_idle(&card, 0);
        // Whichever got there first decided the count, and nothing was counted twice
        assert_eq!(card.recorded_events(0).unwrap(), 5);
        card.acquire(&AcqDescriptor::new(1, 2, 64).no_wait()).unwrap();
        assert!(card.is_acquiring().unwrap());
    }

    /// Holds every cancel inside the backend until told to go on
    #[derive(Debug)]
    struct GatedCancel {
        inner: Arc<Mock>,
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl Backend for GatedCancel {
        fn init_defaults(
            &self,
            cfg: &mut CardConfig,
            channels: &mut [Channel],
        ) -> BackendResult<()> {
            self.inner.init_defaults(cfg, channels)
        }

        fn configure_acquisition(
            &self,
            cfg: &CardConfig,
            layout: SegmentLayout,
        ) -> BackendResult<()> {
            self.inner.configure_acquisition(cfg, layout)
        }

        fn configure_event(
            &self,
            cfg: &CardConfig,
            layout: SegmentLayout,
            desc: &AcqDescriptor,
        ) -> BackendResult<()> {
            self.inner.configure_event(cfg, layout, desc)
        }

        fn configure_channels(&self, channels: &[Channel]) -> BackendResult<()> {
            self.inner.configure_channels(channels)
        }

        fn start_acquisition(&self, irq: IrqLine) -> BackendResult<()> {
            self.inner.start_acquisition(irq)
        }

        fn finalize_acquisition(
            &self,
            segment: usize,
            n_channels: usize,
        ) -> BackendResult<SegmentRecord> {
            self.inner.finalize_acquisition(segment, n_channels)
        }

        fn cancel_acquisition(
            &self,
            segment: usize,
            n_channels: usize,
        ) -> BackendResult<SegmentRecord> {
            self.entered.send(()).unwrap();
            self.release.recv().unwrap();
            self.inner.cancel_acquisition(segment, n_channels)
        }

        fn fetch(&self, request: FetchRequest<'_>, acqs: &mut [Acq]) -> BackendResult<ByteOrder> {
            self.inner.fetch(request, acqs)
        }

        fn trigger(&self, kind: Trigger) -> BackendResult<()> {
            self.inner.trigger(kind)
        }
    }

    #[test]
    fn test_slow_cancel_never_stops_a_later_arm() {
        let registry = Registry::new().unwrap();
        let mock = Arc::new(Mock::manual());
        let (entered, entered_rx) = crossbeam_channel::unbounded();
        let (release_tx, release) = crossbeam_channel::unbounded();
        let card = registry
            .create(
                Slot::Auto,
                Arc::new(GatedCancel {
                    inner: mock.clone(),
                    entered,
                    release,
                }),
            )
            .unwrap();
        registry.register(&card, Mock::contract()).unwrap();

        card.acquire(&AcqDescriptor::new(0, 8, 64).no_wait()).unwrap();
        mock.capture(3);
        let remote = Arc::clone(&card);
        let canceller = thread::spawn(move || remote.cancel());
        entered_rx.recv().unwrap();
        // The hardware finishes while the cancel is still on its way
        assert!(mock.fire());
        let remote = Arc::clone(&card);
        let rearm = thread::spawn(move || {
            while remote
                .acquire(&AcqDescriptor::new(0, 2, 64).no_wait())
                .is_err()
            {
                thread::yield_now();
            }
        });
        thread::sleep(Duration::from_millis(20));
        release_tx.send(()).unwrap();
        canceller.join().unwrap().unwrap();
        rearm.join().unwrap();

        // The new arm is still live on the hardware and ends normally
        assert!(mock.is_armed());
        assert_eq!(card.segment_state(0).unwrap(), SegmentState::Acquiring);
        mock.capture(2);
        assert!(mock.fire());
        wait_idle(&card, 0);
        assert_eq!(card.recorded_events(0).unwrap(), 2);
        card.acquire(&AcqDescriptor::new(1, 1, 64).no_wait()).unwrap();
    }

    #[test]
    fn test_blocking_arm_released_by_cancel() {
        let (_registry, card, mock) = setup(Mock::manual());
        let remote = Arc::clone(&card);
        let waiter = thread::spawn(move || remote.acquire(&AcqDescriptor::new(0, 8, 64)));
        while !mock.is_armed() {
            thread::sleep(Duration::from_millis(1));
        }
        mock.capture(1);
        card.cancel().unwrap();
        waiter.join().unwrap().unwrap();
        assert_eq!(card.recorded_events(0).unwrap(), 1);
    }

    #[test]
    fn test_start_failure_rolls_back() {
        let (_registry, card, mock) = setup(Mock::manual());
        mock.fail_next(Op::StartAcquisition);
        assert!(matches!(
            card.acquire(&AcqDescriptor::new(0, 4, 64)),
            Err(Error::Backend(_))
        ));
        assert!(!card.is_acquiring().unwrap());
        card.acquire(&AcqDescriptor::new(0, 4, 64).no_wait()).unwrap();
    }

    #[test]
    fn test_configure_event_failure() {
        let (_registry, card, mock) = setup(Mock::manual());
        mock.fail_next(Op::ConfigureEvent);
        assert!(matches!(
            card.acquire(&AcqDescriptor::new(0, 4, 64).no_wait()),
            Err(Error::Backend(_))
        ));
        assert!(!card.is_acquiring().unwrap());
        assert!(!mock
            .calls()
            .iter()
            .any(|c| matches!(c, Call::StartAcquisition { .. })));
    }

    #[test]
    #[traced_test]
    fn test_finalize_failure_releases_waiter() {
        let (_registry, card, mock) = setup(Mock::manual());
        card.acquire(&AcqDescriptor::new(0, 4, 64).no_wait()).unwrap();
        let generation = card.completion.generation();
        let remote = Arc::clone(&card);
        let waiter = thread::spawn(move || remote.wait_acquisition(WaitMode::Block, generation));
        mock.capture(4);
        mock.fail_next(Op::FinalizeAcquisition);
        // Run the completion here rather than on the worker, so its logs land in this test
        let seq = card.state().segments[0].arm_seq();
        card.finish_acquisition(0, seq);
        waiter.join().unwrap().unwrap();
        assert!(logs_contain("Cannot read back the segment"));
        assert_eq!(card.recorded_events(0).unwrap(), 0);
        let mut list = AcqList::new(0, 0, 4, 64);
        assert!(matches!(card.fetch(&mut list), Err(Error::NoData)));
    }
}
