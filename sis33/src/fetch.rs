//! Reading captured events back out of a segment

use crate::{
    backend::FetchRequest,
    card::Card,
    core::{AcqList, WaitMode, SAMPLE_WIDTH},
    error::{Error, Result},
};
use tracing::debug;

/// Hands a transferring segment back to idle however the bus copy ends
struct TransferGuard<'a> {
    card: &'a Card,
    segment: usize,
}

impl Drop for TransferGuard<'_> {
    fn drop(&mut self) {
        if let Some(s) = self.card.state().segments.get_mut(self.segment) {
            s.end_transfer();
        }
    }
}

impl Card {
    /// Copies up to `list.acqs.len()` events of channel `list.channel` from segment
    /// `list.segment` into the buffers of `list`, filling in each event's metadata.
    ///
    /// If the segment is still acquiring, the flags of `list` say whether to give up or wait for
    /// it. Returns the number of events delivered, which is less than requested when the
    /// acquisition captured fewer events. Events past that count are left untouched.
    /// # Errors
    /// - [`Error::InvalidArgument`] on contradictory flags, an empty list, out of range indices
    ///   or a buffer whose size doesn't match the segment's event length
    /// - [`Error::Busy`] if the segment is acquiring and the caller won't wait, or another fetch
    ///   holds it
    /// - [`Error::NoData`] if the segment holds no events
    /// - [`Error::TimedOut`] / [`Error::Interrupted`] if the wait for the acquisition was cut
    ///   short
    /// - [`Error::Backend`] if the copy failed, in which case no metadata is written
    pub fn fetch(&self, list: &mut AcqList) -> Result<usize> {
        let contract = self.contract()?;
        let mode = list.flags.wait_mode(list.timeout)?;
        if list.acqs.is_empty() {
            return Err(Error::invalid("a fetch needs at least one event"));
        }
        let segment = list.segment as usize;
        let channel = list.channel as usize;

        let mut state = self.state();
        if segment >= state.n_segments as usize {
            return Err(Error::invalid(format!(
                "segment {segment} out of range, the card has {}",
                state.n_segments
            )));
        }
        if channel >= contract.n_channels {
            return Err(Error::invalid(format!(
                "channel {channel} out of range, the card has {}",
                contract.n_channels
            )));
        }

        if state.segments[segment].is_acquiring() {
            // The arm we wait for, a later one may have started by the time we block
            let generation = self.completion.generation();
            drop(state);
            if mode == WaitMode::NoWait {
                debug!(card = self.index(), segment, "Segment still acquiring");
                return Err(Error::Busy);
            }
            self.wait_acquisition(mode, generation)?;
            state = self.state();
        }
        // Anything could have happened while we weren't holding the lock
        let seg = &state.segments[segment];
        if seg.is_acquiring() || seg.is_transferring() {
            debug!(card = self.index(), segment, state = ?seg.state(), "Busy, cannot fetch");
            return Err(Error::Busy);
        }
        let Some(cache) = seg.cache() else {
            debug!(card = self.index(), segment, "Nothing recorded");
            return Err(Error::NoData);
        };
        let deliverable = list.acqs.len().min(cache.nr_events() as usize);
        let samples_per_event = seg.samples_per_event();
        let expected = samples_per_event as usize * SAMPLE_WIDTH;
        if let Some((i, acq)) = list.acqs[..deliverable]
            .iter()
            .enumerate()
            .find(|(_, a)| a.size as usize != expected || a.data.len() < expected)
        {
            debug!(
                card = self.index(),
                segment,
                event = i,
                size = acq.size,
                expected,
                "Bad buffer size"
            );
            return Err(Error::invalid(format!(
                "buffer {i} holds {} bytes, events of segment {segment} take {expected}",
                acq.size
            )));
        }
        state.segments[segment].begin_transfer();
        let endtime = state.segments[segment].endtime();
        drop(state);

        let guard = TransferGuard {
            card: self,
            segment,
        };
        let acqs = &mut list.acqs[..deliverable];
        let byte_order = self.backend.fetch(
            FetchRequest {
                segment,
                channel,
                samples_per_event,
                cache: &cache,
            },
            acqs,
        );
        drop(guard);
        let byte_order = byte_order?;

        for (event_nr, acq) in acqs.iter_mut().enumerate() {
            let event = cache.event(channel, event_nr).unwrap_or_default();
            acq.nr_samples = event.nr_samples.min(samples_per_event);
            acq.first_samp = event.first_samp;
            acq.prevticks = cache.prevticks(event_nr);
            acq.byte_order = byte_order;
        }
        list.endtime = endtime;
        debug!(card = self.index(), segment, channel, deliverable, "Fetched");
        Ok(deliverable)
    }
}
