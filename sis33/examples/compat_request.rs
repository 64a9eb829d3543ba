//! In this example, a 32-bit caller arms and reads a simulated digitizer through the C-layout
//! control requests, the way it would through a device node.

use sis33::{
    prelude::*,
    wire::{Wire, WireAcq, WireAcqDesc, WireAcqList},
};
use std::{sync::Arc, time::Duration};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let registry = Registry::new()?;
    let card = registry.create(Slot::Auto, Arc::new(Mock::timed(Duration::from_millis(10))))?;
    registry.register(&card, Mock::contract())?;

    let memory = Arc::new(Arena::new(1 << 20));
    let surface = ControlSurface::new(card, memory.clone());
    let narrow = Abi::ILP32_LE;

    let desc = WireAcqDesc {
        segment: 0,
        nr_events: 2,
        ev_length: 64,
        ..Default::default()
    };
    let arg = memory.alloc_bytes(&desc.to_bytes(narrow)?, 4)?;
    surface.compat_ioctl(narrow, Request::Acquire.number(narrow), arg)?;

    let stride = WireAcq::size(narrow);
    let acqs = memory.alloc(2 * stride, 4)?;
    for i in 0..2 {
        let acq = WireAcq {
            data: memory.alloc(128, 2)?,
            size: 128,
            ..Default::default()
        };
        memory.write(acqs.offset(i * stride), &acq.to_bytes(narrow)?)?;
    }
    let list = WireAcqList {
        acqs,
        n_acqs: 2,
        ..Default::default()
    };
    let arg = memory.alloc_bytes(&list.to_bytes(narrow)?, 4)?;
    let n = surface.compat_ioctl(narrow, Request::Fetch.number(narrow), arg)?;

    for i in 0..n {
        let acq = WireAcq::from_bytes(narrow, &memory.read_vec(acqs.offset(i * stride), stride)?)?;
        let data = memory.read_vec(acq.data, acq.size as usize)?;
        println!(
            "event {i}: {} samples, big endian: {}, first bytes {:02x?}",
            acq.nr_samples,
            acq.be != 0,
            &data[..8]
        );
    }
    Ok(())
}
