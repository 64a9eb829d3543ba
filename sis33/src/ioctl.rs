//! The control-request surface of a card.
//!
//! Requests come in as a number and the address of a C struct in the caller's memory, laid out
//! in the native [`Abi`]. Sample data is written straight to the buffers the caller pointed at.

use crate::{
    card::Card,
    core::{Acq, AcqDescriptor, AcqFlags, AcqList, ByteOrder, SAMPLE_WIDTH},
    error::{Error, Result},
    memory::CallerMemory,
    wire::{Abi, Request, UserPtr, Wire, WireAcq, WireAcqDesc, WireAcqList, WireTimeval},
};
use std::sync::Arc;
use tracing::debug;

/// A card as seen through its control requests
#[derive(Debug, Clone)]
pub struct ControlSurface {
    card: Arc<Card>,
    pub(crate) mem: Arc<dyn CallerMemory>,
    native: Abi,
}

impl ControlSurface {
    /// A surface taking requests in the host's layout
    #[must_use]
    pub fn new(card: Arc<Card>, mem: Arc<dyn CallerMemory>) -> Self {
        Self::with_abi(card, mem, Abi::host())
    }

    /// A surface taking requests in `native`'s layout
    #[must_use]
    pub fn with_abi(card: Arc<Card>, mem: Arc<dyn CallerMemory>, native: Abi) -> Self {
        Self { card, mem, native }
    }

    #[must_use]
    pub fn card(&self) -> &Arc<Card> {
        &self.card
    }

    #[must_use]
    pub fn native_abi(&self) -> Abi {
        self.native
    }

    /// Runs control request `cmd` on the struct at `arg`. Returns the number of events delivered
    /// for a fetch and 0 for an arm.
    /// # Errors
    /// - [`Error::UnsupportedRequest`] if `cmd` isn't a native request number
    /// - [`Error::FaultingCopy`] if the request or a buffer can't be accessed
    /// - whatever [`Card::acquire`] or [`Card::fetch`] return
    pub fn ioctl(&self, cmd: u32, arg: UserPtr) -> Result<usize> {
        match Request::from_number(cmd, self.native) {
            Some(Request::Acquire) => self.acquire(arg).map(|()| 0),
            Some(Request::Fetch) => self.fetch(arg),
            None => {
                debug!(card = self.card.index(), cmd, "Unknown control request");
                Err(Error::UnsupportedRequest(cmd))
            }
        }
    }

    fn acquire(&self, arg: UserPtr) -> Result<()> {
        let desc: WireAcqDesc = self.mem.read_wire(self.native, arg)?;
        self.card.acquire(&AcqDescriptor {
            segment: desc.segment,
            nr_events: desc.nr_events,
            ev_length: desc.ev_length,
            flags: AcqFlags::from_bits(desc.flags),
            timeout: desc.timeout.into(),
        })
    }

    fn fetch(&self, arg: UserPtr) -> Result<usize> {
        let contract = self.card.contract()?;
        let mut list: WireAcqList = self.mem.read_wire(self.native, arg)?;
        let flags = AcqFlags::from_bits(list.flags);
        flags.wait_mode(list.timeout.into())?;
        if list.n_acqs == 0 {
            return Err(Error::invalid("a fetch needs at least one event"));
        }
        let n_acqs = list.n_acqs as usize;
        let stride = WireAcq::size(self.native);

        let mut wire_acqs = Vec::new();
        wire_acqs
            .try_reserve_exact(n_acqs)
            .map_err(|_| Error::OutOfMemory)?;
        for i in 0..n_acqs {
            let acq: WireAcq = self.mem.read_wire(self.native, list.acqs.offset(i * stride))?;
            wire_acqs.push(acq);
        }

        // A buffer larger than the longest event is refused anyway, don't allocate for it
        let max_bytes = contract.ev_lengths.first().copied().unwrap_or(0) as usize * SAMPLE_WIDTH;
        let mut acqs = Vec::new();
        acqs.try_reserve_exact(n_acqs).map_err(|_| Error::OutOfMemory)?;
        for wire in &wire_acqs {
            let len = (wire.size as usize).min(max_bytes);
            let mut data = Vec::new();
            data.try_reserve_exact(len).map_err(|_| Error::OutOfMemory)?;
            data.resize(len, 0);
            acqs.push(Acq {
                data,
                size: wire.size,
                ..Default::default()
            });
        }

        let mut request = AcqList {
            segment: list.segment,
            channel: list.channel,
            acqs,
            flags,
            timeout: list.timeout.into(),
            endtime: None,
        };
        let delivered = self.card.fetch(&mut request)?;

        for (i, (acq, wire)) in request
            .acqs
            .iter()
            .zip(wire_acqs.iter_mut())
            .take(delivered)
            .enumerate()
        {
            self.mem.write(wire.data, &acq.data[..wire.size as usize])?;
            wire.nr_samples = acq.nr_samples;
            wire.first_samp = acq.first_samp;
            wire.prevticks = acq.prevticks;
            wire.be = u32::from(acq.byte_order == ByteOrder::Big);
            self.mem
                .write_wire(self.native, list.acqs.offset(i * stride), wire)?;
        }
        list.endtime = WireTimeval::from_system_time(request.endtime);
        self.mem.write_wire(self.native, arg, &list)?;
        Ok(delivered)
    }
}
