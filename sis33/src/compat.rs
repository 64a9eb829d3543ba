//! Control requests from callers with a narrower layout than ours.
//!
//! A 32-bit process on a 64-bit host lays out pointers, `long`s and 64-bit fields differently.
//! Each request is rebuilt in the native layout in staging memory the caller can reach, run
//! through [`ControlSurface::ioctl`], and its results narrowed back into the caller's structs.
//! Sample buffers are never touched here, the native path writes them in place.

use crate::{
    core::Timespec,
    error::{Error, Result},
    ioctl::ControlSurface,
    wire::{Abi, Request, UserPtr, Wire, WireAcq, WireAcqDesc, WireAcqList, WireTimeval},
};
use tracing::debug;

/// Carries a timeout across layouts through its canonical form
fn convert_timeout<T: From<Timespec>>(timeout: impl Into<Timespec>) -> T {
    T::from(timeout.into())
}

impl ControlSurface {
    /// Runs control request `cmd`, laid out for the `narrow` ABI, on the struct at `arg`.
    /// Returns what the native request returns.
    /// # Errors
    /// - [`Error::UnsupportedRequest`] if `cmd` isn't a request number of the `narrow` ABI
    /// - [`Error::FaultingCopy`] if a struct can't be read, staged or written back. Nothing runs
    ///   on the card if it happens before the native request.
    /// - [`Error::InvalidArgument`] if the event count is above what the card can capture
    /// - whatever [`ControlSurface::ioctl`] returns
    pub fn compat_ioctl(&self, narrow: Abi, cmd: u32, arg: UserPtr) -> Result<usize> {
        match Request::from_number(cmd, narrow) {
            Some(Request::Acquire) => self.compat_acquire(narrow, arg),
            Some(Request::Fetch) => self.compat_fetch(narrow, arg),
            None => {
                debug!(card = self.card().index(), cmd, "Unknown compat control request");
                Err(Error::UnsupportedRequest(cmd))
            }
        }
    }

    fn compat_acquire(&self, narrow: Abi, arg: UserPtr) -> Result<usize> {
        let native = self.native_abi();
        let desc: WireAcqDesc = self.mem.read_wire(narrow, arg)?;
        let desc = WireAcqDesc {
            timeout: convert_timeout(desc.timeout),
            ..desc
        };
        let staged = self.mem.stage_wire(native, &desc)?;
        self.ioctl(Request::Acquire.number(native), staged.addr())
    }

    fn compat_fetch(&self, narrow: Abi, arg: UserPtr) -> Result<usize> {
        let native = self.native_abi();
        let list: WireAcqList = self.mem.read_wire(narrow, arg)?;
        // Bound the caller's count before sizing anything after it
        let max_nr_events = self.card().contract()?.max_nr_events;
        if list.n_acqs > max_nr_events {
            debug!(card = self.card().index(), n_acqs = list.n_acqs, "Too many events");
            return Err(Error::invalid(format!(
                "{} events requested, the card captures at most {max_nr_events}",
                list.n_acqs
            )));
        }
        let n_acqs = list.n_acqs as usize;
        let narrow_stride = WireAcq::size(narrow);
        let native_stride = WireAcq::size(native);

        let callers: Vec<WireAcq> = (0..n_acqs)
            .map(|i| self.mem.read_wire(narrow, list.acqs.offset(i * narrow_stride)))
            .collect::<std::result::Result<_, _>>()?;
        // Both staged copies are given back on every way out of here, list first
        let staged_acqs = self
            .mem
            .stage_scoped(native_stride * n_acqs, WireAcq::align(native))?;
        for (i, acq) in callers.iter().enumerate() {
            self.mem
                .write_wire(native, staged_acqs.addr().offset(i * native_stride), acq)?;
        }
        let staged_list = self.mem.stage_wire(
            native,
            &WireAcqList {
                acqs: staged_acqs.addr(),
                timeout: convert_timeout(list.timeout),
                endtime: WireTimeval::default(),
                ..list
            },
        )?;

        let delivered = self.ioctl(Request::Fetch.number(native), staged_list.addr())?;

        for (i, caller) in callers.iter().enumerate() {
            let done: WireAcq = self
                .mem
                .read_wire(native, staged_acqs.addr().offset(i * native_stride))?;
            let narrowed = WireAcq {
                nr_samples: done.nr_samples,
                prevticks: done.prevticks,
                first_samp: done.first_samp,
                be: done.be,
                ..*caller
            };
            self.mem
                .write_wire(narrow, list.acqs.offset(i * narrow_stride), &narrowed)?;
        }
        let done: WireAcqList = self.mem.read_wire(native, staged_list.addr())?;
        self.mem.write_wire(
            narrow,
            arg,
            &WireAcqList {
                endtime: done.endtime,
                ..list
            },
        )?;
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::mock::{Call, Mock},
        card::Card,
        core::AcqFlags,
        memory::{Arena, CallerMemory, Fault},
        registry::{Registry, Slot},
        wire::{Long, WireTimespec},
    };
    use paste::paste;
    use std::{sync::Arc, time::Duration};

    const NATIVE: Abi = Abi::LP64_LE;

    struct Side {
        surface: ControlSurface,
        arena: Arc<Arena>,
        mock: Arc<Mock>,
    }

    impl Side {
        fn new(registry: &Registry) -> Self {
            let mock = Arc::new(Mock::timed(Duration::from_millis(1)));
            let card: Arc<Card> = registry.create(Slot::Auto, mock.clone()).unwrap();
            registry.register(&card, Mock::contract()).unwrap();
            let arena = Arc::new(Arena::new(1 << 16));
            let surface = ControlSurface::with_abi(card, arena.clone(), NATIVE);
            Self {
                surface,
                arena,
                mock,
            }
        }

        fn mem(&self) -> &dyn CallerMemory {
            &*self.arena
        }

        /// Issues `request` laid out in `abi`, natively when `abi` is the surface's own
        fn issue(&self, abi: Abi, request: Request, arg: UserPtr) -> Result<usize> {
            let cmd = request.number(abi);
            if abi == NATIVE {
                self.surface.ioctl(cmd, arg)
            } else {
                self.surface.compat_ioctl(abi, cmd, arg)
            }
        }

        fn put<T: Wire>(&self, abi: Abi, value: &T) -> UserPtr {
            let addr = self.arena.alloc(T::size(abi), T::align(abi)).unwrap();
            self.mem().write_wire(abi, addr, value).unwrap();
            addr
        }

        fn arm(&self, abi: Abi, desc: &WireAcqDesc) -> Result<usize> {
            let arg = self.put(abi, desc);
            self.issue(abi, Request::Acquire, arg)
        }

        /// Lays out a fetch of `n` events of `ev_length` samples, in `abi`
        fn fetch_request(
            &self,
            abi: Abi,
            segment: u32,
            channel: u32,
            n: u32,
            ev_length: u32,
        ) -> UserPtr {
            let stride = WireAcq::size(abi);
            let acqs = self
                .arena
                .alloc(stride * n as usize, WireAcq::align(abi))
                .unwrap();
            for i in 0..n as usize {
                let data = self.arena.alloc(ev_length as usize * 2, 2).unwrap();
                let acq = WireAcq {
                    data,
                    size: ev_length * 2,
                    unused: [0xaa; 4],
                    ..Default::default()
                };
                self.mem()
                    .write_wire(abi, acqs.offset(i * stride), &acq)
                    .unwrap();
            }
            self.put(
                abi,
                &WireAcqList {
                    segment,
                    channel,
                    acqs,
                    n_acqs: n,
                    flags: AcqFlags::TIMEOUT,
                    timeout: WireTimespec {
                        tv_sec: Long(2),
                        tv_nsec: Long(0),
                    },
                    ..Default::default()
                },
            )
        }

        /// The list and its events as the caller sees them, laid out in `abi`
        fn results(&self, abi: Abi, arg: UserPtr) -> (WireAcqList, Vec<(WireAcq, Vec<u8>)>) {
            let list: WireAcqList = self.mem().read_wire(abi, arg).unwrap();
            let acqs = (0..list.n_acqs as usize)
                .map(|i| {
                    let acq: WireAcq = self
                        .mem()
                        .read_wire(abi, list.acqs.offset(i * WireAcq::size(abi)))
                        .unwrap();
                    let data = self.arena.read_vec(acq.data, acq.size as usize).unwrap();
                    (acq, data)
                })
                .collect();
            (list, acqs)
        }
    }

    macro_rules! test_round_trip {
        ($abi:ident) => {
            paste! {
                #[test]
                fn [<test_round_trip_ $abi:lower>]() {
                    let registry = Registry::new().unwrap();
                    let direct = Side::new(&registry);
                    let shimmed = Side::new(&registry);
                    let narrow = Abi::$abi;
                    let desc = WireAcqDesc {
                        segment: 1,
                        nr_events: 5,
                        ev_length: 128,
                        flags: AcqFlags::TIMEOUT,
                        timeout: WireTimespec { tv_sec: Long(3), tv_nsec: Long(500) },
                        ..Default::default()
                    };
                    assert_eq!(direct.arm(NATIVE, &desc).unwrap(), 0);
                    assert_eq!(shimmed.arm(narrow, &desc).unwrap(), 0);

                    let native_arg = direct.fetch_request(NATIVE, 1, 2, 7, 128);
                    let narrow_arg = shimmed.fetch_request(narrow, 1, 2, 7, 128);
                    assert_eq!(direct.issue(NATIVE, Request::Fetch, native_arg).unwrap(), 5);
                    assert_eq!(shimmed.issue(narrow, Request::Fetch, narrow_arg).unwrap(), 5);

                    let (native_list, native_acqs) = direct.results(NATIVE, native_arg);
                    let (narrow_list, narrow_acqs) = shimmed.results(narrow, narrow_arg);
                    assert_ne!(narrow_list.endtime, WireTimeval::default());
                    // Addresses and completion times differ between the two callers, everything
                    // else must be identical
                    let strip_list = |l: WireAcqList| WireAcqList {
                        acqs: UserPtr::NULL,
                        endtime: WireTimeval::default(),
                        ..l
                    };
                    let strip_acqs = |acqs: &[(WireAcq, Vec<u8>)]| -> Vec<(WireAcq, Vec<u8>)> {
                        acqs.iter()
                            .map(|(a, d)| (WireAcq { data: UserPtr::NULL, ..*a }, d.clone()))
                            .collect()
                    };
                    assert_eq!(narrow_list.segment, 1);
                    assert_eq!(strip_list(native_list), strip_list(narrow_list));
                    assert_eq!(strip_acqs(&native_acqs), strip_acqs(&narrow_acqs));
                    assert_eq!(narrow_acqs[0].0.be, 1);
                    assert_eq!(narrow_acqs[4].0.prevticks, 4_000);
                    assert_eq!(narrow_acqs[5].0.nr_samples, 0);
                    assert_eq!(narrow_acqs[5].0.unused, [0xaa; 4]);
                }
            }
        };
    }

    test_round_trip!(ILP32_LE);
    test_round_trip!(ILP32_BE);

    #[test]
    fn test_staging_reclaimed_between_requests() {
        let registry = Registry::new().unwrap();
        let side = Side::new(&registry);
        let narrow = Abi::ILP32_LE;
        let desc = WireAcqDesc {
            nr_events: 4,
            ev_length: 64,
            flags: AcqFlags::TIMEOUT,
            timeout: WireTimespec {
                tv_sec: Long(2),
                tv_nsec: Long(0),
            },
            ..Default::default()
        };
        side.arm(narrow, &desc).unwrap();
        let arg = side.fetch_request(narrow, 0, 0, 4, 64);
        let used = side.arena.used();
        // Far more requests than the arena could stage if nothing were given back
        for _ in 0..1_000 {
            assert_eq!(side.issue(narrow, Request::Fetch, arg).unwrap(), 4);
        }
        assert_eq!(side.arena.used(), used);
        // Failing requests give their staging back too
        let bad = side.fetch_request(narrow, 0, 9, 1, 64);
        let used = side.arena.used();
        assert!(matches!(
            side.issue(narrow, Request::Fetch, bad),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(side.arena.used(), used);
    }

    #[test]
    fn test_native_number_refused() {
        let registry = Registry::new().unwrap();
        let side = Side::new(&registry);
        let arg = side.fetch_request(Abi::ILP32_LE, 0, 0, 1, 64);
        assert!(matches!(
            side.surface
                .compat_ioctl(Abi::ILP32_LE, Request::Fetch.number(NATIVE), arg),
            Err(Error::UnsupportedRequest(_))
        ));
    }

    #[test]
    fn test_hostile_count() {
        let registry = Registry::new().unwrap();
        let side = Side::new(&registry);
        let narrow = Abi::ILP32_LE;
        let arg = side.fetch_request(narrow, 0, 0, 1, 64);
        let mut list: WireAcqList = side.mem().read_wire(narrow, arg).unwrap();
        list.n_acqs = u32::MAX;
        side.mem().write_wire(narrow, arg, &list).unwrap();
        let used = side.arena.used();
        assert!(matches!(
            side.issue(narrow, Request::Fetch, arg),
            Err(Error::InvalidArgument(_))
        ));
        // Refused before staging anything
        assert_eq!(side.arena.used(), used);
    }

    #[test]
    fn test_fault_before_native_call() {
        let registry = Registry::new().unwrap();
        let side = Side::new(&registry);
        let narrow = Abi::ILP32_LE;
        side.arm(narrow, &WireAcqDesc {
            nr_events: 1,
            ev_length: 64,
            ..Default::default()
        })
        .unwrap();
        side.mock.clear_calls();
        let arg = side.fetch_request(narrow, 0, 0, 2, 64);
        let mut list: WireAcqList = side.mem().read_wire(narrow, arg).unwrap();
        // The event array runs off the end of the caller's memory
        list.acqs = UserPtr(Arena::DEFAULT_BASE + (1 << 16) - 8);
        side.mem().write_wire(narrow, arg, &list).unwrap();
        assert!(matches!(
            side.issue(narrow, Request::Fetch, arg),
            Err(Error::FaultingCopy(Fault::OutOfBounds { .. }))
        ));
        assert!(side.mock.calls().is_empty());

        assert!(matches!(
            side.issue(narrow, Request::Acquire, UserPtr::NULL),
            Err(Error::FaultingCopy(_))
        ));
        assert!(!side
            .mock
            .calls()
            .iter()
            .any(|c| matches!(c, Call::ConfigureEvent { .. })));
    }

    #[test]
    fn test_errors_pass_through() {
        let registry = Registry::new().unwrap();
        let side = Side::new(&registry);
        let narrow = Abi::ILP32_BE;
        // Nothing acquired yet
        let arg = side.fetch_request(narrow, 0, 0, 1, 64);
        assert!(matches!(
            side.issue(narrow, Request::Fetch, arg),
            Err(Error::NoData)
        ));
        let bad = WireAcqDesc {
            nr_events: 0,
            ev_length: 64,
            ..Default::default()
        };
        assert!(matches!(side.arm(narrow, &bad), Err(Error::InvalidArgument(_))));
    }
}
