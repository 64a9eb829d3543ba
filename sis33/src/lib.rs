//! Acquisition control for the SIS33xx family of VME waveform digitizers.
//!
//! A [`Card`](card::Card) drives one board through a [`Backend`](backend::Backend) that knows its
//! registers. The sample memory of a card is split in segments: one can be filled by an
//! acquisition while the others are fetched. Cards are owned by a
//! [`Registry`](registry::Registry), and can be driven either through their typed API or
//! through the C-layout control requests of [`ControlSurface`](ioctl::ControlSurface).

pub mod acquisition;
pub mod backend;
pub mod card;
pub mod compat;
pub mod completion;
pub mod config;
pub mod core;
pub mod error;
pub mod fetch;
pub mod ioctl;
pub mod memory;
pub mod prelude;
pub mod registry;
pub mod segment;
pub mod wire;
pub mod workqueue;
