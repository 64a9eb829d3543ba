//! The deferred side of acquisition completion.
//!
//! A backend's interrupt path only queues "segment X is done" through its [`IrqLine`]. The single
//! worker thread owned by the [`Registry`](crate::registry::Registry) picks it up, lets the
//! backend read back the event directory (slow bus traffic) and then wakes the waiters.

use crate::card::Card;
use crossbeam_channel::{Receiver, Sender};
use std::{
    sync::Weak,
    thread::{self, JoinHandle},
};
use tracing::{debug, warn};

#[derive(Debug)]
pub(crate) enum Job {
    SegmentDone {
        card: Weak<Card>,
        segment: usize,
        seq: u64,
    },
    Shutdown,
}

#[derive(Debug)]
pub(crate) struct Workqueue {
    jobs: Sender<Job>,
    handle: Option<JoinHandle<()>>,
}

impl Workqueue {
    pub(crate) fn spawn() -> std::io::Result<Self> {
        let (jobs, rx) = crossbeam_channel::unbounded();
        let handle = thread::Builder::new()
            .name("sis33-irq".into())
            .spawn(move || run(&rx))?;
        Ok(Self {
            jobs,
            handle: Some(handle),
        })
    }

    pub(crate) fn sender(&self) -> Sender<Job> {
        self.jobs.clone()
    }
}

impl Drop for Workqueue {
    fn drop(&mut self) {
        // Interrupt lines may outlive us, so the channel can't be relied on to disconnect
        let _ = self.jobs.send(Job::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("The completion worker panicked");
            }
        }
    }
}

fn run(rx: &Receiver<Job>) {
    for job in rx {
        match job {
            Job::SegmentDone { card, segment, seq } => match card.upgrade() {
                Some(card) => card.finish_acquisition(segment, seq),
                None => debug!(segment, "Completion for a card that no longer exists"),
            },
            Job::Shutdown => break,
        }
    }
}

/// Handed to a backend when an acquisition starts. The backend raises it from its interrupt
/// handler once the segment is full.
#[derive(Debug, Clone)]
pub struct IrqLine {
    jobs: Sender<Job>,
    card: Weak<Card>,
    segment: usize,
    seq: u64,
}

impl IrqLine {
    pub(crate) fn new(jobs: Sender<Job>, card: Weak<Card>, segment: usize, seq: u64) -> Self {
        Self {
            jobs,
            card,
            segment,
            seq,
        }
    }

    /// The segment being acquired
    #[must_use]
    pub fn segment(&self) -> usize {
        self.segment
    }

    /// Queues the completion for the worker. Never blocks, safe to call from any context.
    /// Returns false if the worker is gone.
    pub fn raise(&self) -> bool {
        let queued = self
            .jobs
            .send(Job::SegmentDone {
                card: self.card.clone(),
                segment: self.segment,
                seq: self.seq,
            })
            .is_ok();
        if !queued {
            warn!(segment = self.segment, "Completion worker is gone, dropping interrupt");
        }
        queued
    }
}
