//! Defines the capabilities every digitizer family must implement to be driven by a
//! [`Card`](crate::card::Card)

pub mod mock;

use crate::{
    completion::{CompletionSignal, WaitOutcome},
    config::{CardConfig, Channel},
    core::{Acq, AcqDescriptor, ByteOrder, Trigger},
    segment::{SegmentCache, SegmentRecord},
    workqueue::IrqLine,
};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Bus error at address {addr:#010x}")]
    Bus { addr: u32 },
    #[error("The hardware doesn't support {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type BackendResult<T> = std::result::Result<T, Error>;

/// How the sample memory is currently split
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SegmentLayout {
    pub n_segments: u32,
    /// Samples a single segment can hold, across all its events
    pub max_samples_per_segment: u32,
}

/// A fetch, as handed to the backend once the core has validated it
#[derive(Debug, Copy, Clone)]
pub struct FetchRequest<'a> {
    pub segment: usize,
    pub channel: usize,
    pub samples_per_event: u32,
    /// The segment's event directory, valid for as long as the segment is transferring
    pub cache: &'a SegmentCache,
}

/// The trait implemented by every digitizer family.
///
/// Methods are called with the card lock held unless noted otherwise. Every method may fail, the
/// error is handed back to the caller of the card operation unchanged.
pub trait Backend: Send + Sync + std::fmt::Debug {
    /// Fills in the power-on configuration of the family
    fn init_defaults(&self, cfg: &mut CardConfig, channels: &mut [Channel]) -> BackendResult<()>;

    /// Programs the card-wide acquisition settings
    fn configure_acquisition(&self, cfg: &CardConfig, layout: SegmentLayout)
        -> BackendResult<()>;

    /// Programs event length, event count and the target segment of the next arm
    fn configure_event(
        &self,
        cfg: &CardConfig,
        layout: SegmentLayout,
        desc: &AcqDescriptor,
    ) -> BackendResult<()>;

    /// Programs the per-channel settings
    fn configure_channels(&self, channels: &[Channel]) -> BackendResult<()>;

    /// Starts sampling, runs without the card lock. The backend raises `irq` from its interrupt
    /// path once the segment is done.
    fn start_acquisition(&self, irq: IrqLine) -> BackendResult<()>;

    /// Blocks until the acquisition armed as `generation` of `completion` completes. Runs
    /// without the card lock.
    fn wait_acquisition(
        &self,
        completion: &CompletionSignal,
        generation: u64,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        completion.wait_for(generation, timeout)
    }

    /// Reads back the event directory of a finished acquisition. Called from the completion
    /// worker without the card lock, so it may take its time on the bus.
    fn finalize_acquisition(&self, segment: usize, n_channels: usize)
        -> BackendResult<SegmentRecord>;

    /// Stops the running acquisition and reports what had been captured so far.
    /// Called with the card lock held.
    fn cancel_acquisition(&self, segment: usize, n_channels: usize)
        -> BackendResult<SegmentRecord>;

    /// Copies the samples of the first `acqs.len()` events of a segment into the buffers of
    /// `acqs`. Runs without the card lock.
    fn fetch(&self, request: FetchRequest<'_>, acqs: &mut [Acq]) -> BackendResult<ByteOrder>;

    /// Sends a software trigger. Runs without the card lock.
    fn trigger(&self, kind: Trigger) -> BackendResult<()>;
}
