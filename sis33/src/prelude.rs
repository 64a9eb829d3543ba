//! Prelude (helpful reexports) for this package

pub use crate::{
    backend::{mock::Mock, Backend},
    card::{Card, Contract, Timestamping},
    config::{CardConfig, Channel, ClockSource, Round},
    core::{Acq, AcqDescriptor, AcqFlags, AcqList, ByteOrder, Trigger, WaitMode},
    error::{Error, Result},
    ioctl::ControlSurface,
    memory::{Arena, CallerMemory},
    registry::{Registry, Slot},
    segment::SegmentState,
    wire::{Abi, Request, UserPtr},
};
