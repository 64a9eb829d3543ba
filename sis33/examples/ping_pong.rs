//! In this example, we drive a simulated digitizer the way a data-taking loop would: one segment
//! is filled while the previous one is read out.

use sis33::prelude::*;
use std::{sync::Arc, thread, time::Duration};

const EVENTS: u32 = 4;
const EV_LENGTH: u32 = 256;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let registry = Registry::new()?;
    let card = registry.create(Slot::Auto, Arc::new(Mock::timed(Duration::from_millis(50))))?;
    registry.register(&card, Mock::contract())?;
    card.set_clock_frequency(card.contract()?.round_clock_frequency(60_000_000, Round::Nearest))?;

    let n_segments = card.n_segments()?;
    for round in 0..6u32 {
        let segment = round % n_segments;
        card.acquire(&AcqDescriptor::new(segment, EVENTS, EV_LENGTH).no_wait())?;

        // Read out the segment filled in the previous round while this one samples
        if round > 0 {
            let previous = (round - 1) % n_segments;
            let mut list = AcqList::new(previous, 0, EVENTS as usize, EV_LENGTH);
            let n = card.fetch(&mut list)?;
            for acq in &list.acqs[..n] {
                let samples = acq.samples();
                println!(
                    "segment {previous}: {} samples, +{} ticks, first {:#06x}",
                    samples.len(),
                    acq.prevticks,
                    samples[0]
                );
            }
        }

        while card.is_acquiring()? {
            thread::sleep(Duration::from_millis(5));
        }
    }
    registry.free(&card);
    Ok(())
}
