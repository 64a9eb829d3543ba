//! Binary layout of the control requests.
//!
//! A control request travels as a C struct whose layout depends on who sent it: pointers and
//! `long`s are 4 or 8 bytes wide, 64-bit fields may only be 4-aligned, and byte order follows the
//! CPU. An [`Abi`] captures those differences, and every request shape implements [`Wire`] to be
//! read or written under any of them.

use crate::core::Timespec;
use sis33_derive::{request, Wire};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("Request truncated, needed {needed} bytes but only {available} are there")]
    Truncated { needed: usize, available: usize },
    #[error("{value:#x} doesn't fit in a {width}-byte {what}")]
    Unrepresentable {
        what: &'static str,
        value: i128,
        width: usize,
    },
}

type WireResult<T> = std::result::Result<T, WireError>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PointerWidth {
    Bits32,
    Bits64,
}

impl PointerWidth {
    #[must_use]
    pub fn bytes(self) -> usize {
        match self {
            Self::Bits32 => 4,
            Self::Bits64 => 8,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// The parts of a C ABI that change the layout of a request
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Abi {
    /// Width of pointers and `long`
    pub pointer_width: PointerWidth,
    pub endian: Endian,
    /// Alignment of 64-bit integers inside structs
    pub u64_align: usize,
}

impl Abi {
    /// x86-64
    pub const LP64_LE: Self = Self {
        pointer_width: PointerWidth::Bits64,
        endian: Endian::Little,
        u64_align: 8,
    };
    /// i386, where 64-bit fields are only 4-aligned
    pub const ILP32_LE: Self = Self {
        pointer_width: PointerWidth::Bits32,
        endian: Endian::Little,
        u64_align: 4,
    };
    /// 64-bit PowerPC
    pub const LP64_BE: Self = Self {
        pointer_width: PointerWidth::Bits64,
        endian: Endian::Big,
        u64_align: 8,
    };
    /// 32-bit PowerPC, the usual VME crate controller
    pub const ILP32_BE: Self = Self {
        pointer_width: PointerWidth::Bits32,
        endian: Endian::Big,
        u64_align: 8,
    };

    /// The layout of the machine we're running on
    #[must_use]
    pub fn host() -> Self {
        let endian = if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        };
        if cfg!(target_pointer_width = "64") {
            Self {
                pointer_width: PointerWidth::Bits64,
                endian,
                u64_align: 8,
            }
        } else {
            Self {
                pointer_width: PointerWidth::Bits32,
                endian,
                u64_align: if cfg!(target_arch = "x86") { 4 } else { 8 },
            }
        }
    }

    #[must_use]
    pub fn pointer_bytes(self) -> usize {
        self.pointer_width.bytes()
    }
}

/// Rounds `offset` up to a multiple of `align`
#[must_use]
pub fn align_up(offset: usize, align: usize) -> usize {
    offset.div_ceil(align.max(1)) * align.max(1)
}

/// Serializes request fields in an [`Abi`]'s layout
#[derive(Debug)]
pub struct WireWriter {
    abi: Abi,
    buf: Vec<u8>,
}

impl WireWriter {
    #[must_use]
    pub fn new(abi: Abi) -> Self {
        Self {
            abi,
            buf: Vec::new(),
        }
    }

    #[must_use]
    pub fn abi(&self) -> Abi {
        self.abi
    }

    /// Zero-pads up to the next multiple of `align`
    pub fn align_to(&mut self, align: usize) {
        self.buf.resize(align_up(self.buf.len(), align), 0);
    }

    /// Writes the low `width` bytes of `value` in the ABI's byte order
    pub fn put_uint(&mut self, value: u64, width: usize) {
        match self.abi.endian {
            Endian::Little => self.buf.extend_from_slice(&value.to_le_bytes()[..width]),
            Endian::Big => self.buf.extend_from_slice(&value.to_be_bytes()[8 - width..]),
        }
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Deserializes request fields laid out for an [`Abi`]
#[derive(Debug)]
pub struct WireReader<'a> {
    abi: Abi,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    #[must_use]
    pub fn new(abi: Abi, buf: &'a [u8]) -> Self {
        Self { abi, buf, pos: 0 }
    }

    #[must_use]
    pub fn abi(&self) -> Abi {
        self.abi
    }

    fn take(&mut self, len: usize) -> WireResult<&'a [u8]> {
        let end = self.pos + len;
        let bytes = self.buf.get(self.pos..end).ok_or(WireError::Truncated {
            needed: end,
            available: self.buf.len(),
        })?;
        self.pos = end;
        Ok(bytes)
    }

    /// Skips padding up to the next multiple of `align`
    /// # Errors
    /// Returns an error if the padding runs past the end of the request
    pub fn align_to(&mut self, align: usize) -> WireResult<()> {
        let pad = align_up(self.pos, align) - self.pos;
        self.take(pad).map(|_| ())
    }

    /// Reads a `width`-byte unsigned integer in the ABI's byte order
    /// # Errors
    /// Returns an error if the request is too short
    pub fn get_uint(&mut self, width: usize) -> WireResult<u64> {
        let bytes = self.take(width)?;
        let mut word = [0u8; 8];
        Ok(match self.abi.endian {
            Endian::Little => {
                word[..width].copy_from_slice(bytes);
                u64::from_le_bytes(word)
            }
            Endian::Big => {
                word[8 - width..].copy_from_slice(bytes);
                u64::from_be_bytes(word)
            }
        })
    }
}

/// A value with a C layout in every [`Abi`]
pub trait Wire: Sized {
    fn align(abi: Abi) -> usize;

    /// Size including tail padding, i.e. `sizeof`
    fn size(abi: Abi) -> usize;

    /// # Errors
    /// Returns an error if a value can't be represented in the writer's ABI
    fn encode(&self, writer: &mut WireWriter) -> WireResult<()>;

    /// # Errors
    /// Returns an error if the input is too short
    fn decode(reader: &mut WireReader<'_>) -> WireResult<Self>;

    /// Encodes `self` on its own in `abi`'s layout
    /// # Errors
    /// Returns an error if a value can't be represented in that ABI
    fn to_bytes(&self, abi: Abi) -> WireResult<Vec<u8>> {
        let mut writer = WireWriter::new(abi);
        self.encode(&mut writer)?;
        Ok(writer.into_bytes())
    }

    /// Decodes a value laid out in `abi` from the start of `bytes`
    /// # Errors
    /// Returns an error if `bytes` is too short
    fn from_bytes(abi: Abi, bytes: &[u8]) -> WireResult<Self> {
        Self::decode(&mut WireReader::new(abi, bytes))
    }
}

macro_rules! wire_uint {
    ($num:ty, $align:expr) => {
        impl Wire for $num {
            fn align(abi: Abi) -> usize {
                let align: fn(Abi) -> usize = $align;
                align(abi)
            }

            fn size(_abi: Abi) -> usize {
                std::mem::size_of::<$num>()
            }

            fn encode(&self, writer: &mut WireWriter) -> WireResult<()> {
                writer.align_to(<$num as Wire>::align(writer.abi()));
                writer.put_uint(u64::from(*self), std::mem::size_of::<$num>());
                Ok(())
            }

            // Only as many bytes as the type holds are read
            #[allow(clippy::cast_possible_truncation)]
            fn decode(reader: &mut WireReader<'_>) -> WireResult<Self> {
                reader.align_to(<$num as Wire>::align(reader.abi()))?;
                let value = reader.get_uint(std::mem::size_of::<$num>())?;
                Ok(value as $num)
            }
        }
    };
}

wire_uint!(u32, |_| 4);
wire_uint!(u64, |abi: Abi| abi.u64_align);

/// A caller-space address, pointer-sized on the wire
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct UserPtr(pub u64);

impl UserPtr {
    pub const NULL: Self = Self(0);

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The address `offset` bytes further
    #[must_use]
    pub fn offset(self, offset: usize) -> Self {
        Self(self.0.wrapping_add(offset as u64))
    }
}

impl Wire for UserPtr {
    fn align(abi: Abi) -> usize {
        abi.pointer_bytes()
    }

    fn size(abi: Abi) -> usize {
        abi.pointer_bytes()
    }

    fn encode(&self, writer: &mut WireWriter) -> WireResult<()> {
        let width = writer.abi().pointer_bytes();
        if width < 8 && self.0 > u64::from(u32::MAX) {
            return Err(WireError::Unrepresentable {
                what: "pointer",
                value: i128::from(self.0),
                width,
            });
        }
        writer.align_to(width);
        writer.put_uint(self.0, width);
        Ok(())
    }

    fn decode(reader: &mut WireReader<'_>) -> WireResult<Self> {
        let width = reader.abi().pointer_bytes();
        reader.align_to(width)?;
        reader.get_uint(width).map(Self)
    }
}

/// A C `long`, sign-extended when read from a 32-bit layout
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Long(pub i64);

impl Wire for Long {
    fn align(abi: Abi) -> usize {
        abi.pointer_bytes()
    }

    fn size(abi: Abi) -> usize {
        abi.pointer_bytes()
    }

    fn encode(&self, writer: &mut WireWriter) -> WireResult<()> {
        let width = writer.abi().pointer_bytes();
        if width < 8 && i32::try_from(self.0).is_err() {
            return Err(WireError::Unrepresentable {
                what: "long",
                value: i128::from(self.0),
                width,
            });
        }
        writer.align_to(width);
        // Two's complement, the upper bytes are dropped for 32-bit layouts
        #[allow(clippy::cast_sign_loss)]
        let raw = self.0 as u64;
        writer.put_uint(raw, width);
        Ok(())
    }

    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    fn decode(reader: &mut WireReader<'_>) -> WireResult<Self> {
        let width = reader.abi().pointer_bytes();
        reader.align_to(width)?;
        let raw = reader.get_uint(width)?;
        Ok(Self(if width < 8 {
            i64::from(raw as u32 as i32)
        } else {
            raw as i64
        }))
    }
}

impl<T: Wire, const N: usize> Wire for [T; N] {
    fn align(abi: Abi) -> usize {
        T::align(abi)
    }

    fn size(abi: Abi) -> usize {
        T::size(abi) * N
    }

    fn encode(&self, writer: &mut WireWriter) -> WireResult<()> {
        self.iter().try_for_each(|v| v.encode(writer))
    }

    fn decode(reader: &mut WireReader<'_>) -> WireResult<Self> {
        let items = (0..N)
            .map(|_| T::decode(reader))
            .collect::<WireResult<Vec<T>>>()?;
        // Exactly N items were decoded above
        items.try_into().map_err(|_| WireError::Truncated {
            needed: N,
            available: 0,
        })
    }
}

/// `struct timespec`
#[derive(Wire, Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct WireTimespec {
    pub tv_sec: Long,
    pub tv_nsec: Long,
}

impl From<Timespec> for WireTimespec {
    fn from(value: Timespec) -> Self {
        Self {
            tv_sec: Long(value.seconds),
            tv_nsec: Long(value.nanoseconds),
        }
    }
}

impl From<WireTimespec> for Timespec {
    fn from(value: WireTimespec) -> Self {
        Self {
            seconds: value.tv_sec.0,
            nanoseconds: value.tv_nsec.0,
        }
    }
}

/// `struct timeval`
#[derive(Wire, Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct WireTimeval {
    pub tv_sec: Long,
    pub tv_usec: Long,
}

impl WireTimeval {
    /// Wall-clock time, all zeros for `None` or anything before the epoch
    #[must_use]
    pub fn from_system_time(time: Option<SystemTime>) -> Self {
        let since_epoch = time
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .unwrap_or_default();
        Self {
            tv_sec: Long(i64::try_from(since_epoch.as_secs()).unwrap_or(i64::MAX)),
            tv_usec: Long(i64::from(since_epoch.subsec_micros())),
        }
    }

    /// `None` for the all-zeros "never" value
    #[must_use]
    pub fn to_system_time(self) -> Option<SystemTime> {
        let secs = u64::try_from(self.tv_sec.0).ok()?;
        let micros = u64::try_from(self.tv_usec.0).ok()?;
        if secs == 0 && micros == 0 {
            return None;
        }
        UNIX_EPOCH.checked_add(Duration::from_secs(secs) + Duration::from_micros(micros))
    }
}

/// The arm request
#[request(1)]
#[derive(Wire, Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct WireAcqDesc {
    pub segment: u32,
    pub nr_events: u32,
    pub ev_length: u32,
    pub flags: u32,
    pub timeout: WireTimespec,
    pub unused: [u32; 4],
}

/// One event of a fetch, `data` points to the caller's sample buffer
#[derive(Wire, Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct WireAcq {
    pub data: UserPtr,
    pub size: u32,
    pub nr_samples: u32,
    pub prevticks: u64,
    pub first_samp: u32,
    /// Non-zero for big-endian sample words
    pub be: u32,
    pub unused: [u32; 4],
}

/// The fetch request, `acqs` points to an array of `n_acqs` [`WireAcq`]
#[request(0)]
#[derive(Wire, Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct WireAcqList {
    pub segment: u32,
    pub channel: u32,
    pub acqs: UserPtr,
    pub n_acqs: u32,
    pub flags: u32,
    pub timeout: WireTimespec,
    pub endtime: WireTimeval,
    pub unused: [u32; 4],
}

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;
const IOC_SIZE_MASK: u32 = (1 << 14) - 1;

/// The control requests a card understands
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Request {
    Fetch,
    Acquire,
}

impl Request {
    /// Type byte of the request numbers
    pub const MAGIC: u8 = b'3';

    /// The request number under `abi`, whose struct size is part of it
    #[must_use]
    pub fn number(self, abi: Abi) -> u32 {
        let (dir, nr, size) = match self {
            Self::Fetch => (IOC_READ | IOC_WRITE, WireAcqList::NR, WireAcqList::size(abi)),
            Self::Acquire => (IOC_WRITE, WireAcqDesc::NR, WireAcqDesc::size(abi)),
        };
        // Request structs are far below the 14-bit size limit
        #[allow(clippy::cast_possible_truncation)]
        let size = size as u32 & IOC_SIZE_MASK;
        (dir << 30) | (size << 16) | (u32::from(Self::MAGIC) << 8) | u32::from(nr)
    }

    /// Decodes a request number issued by a caller using `abi`
    #[must_use]
    pub fn from_number(cmd: u32, abi: Abi) -> Option<Self> {
        [Self::Fetch, Self::Acquire]
            .into_iter()
            .find(|r| r.number(abi) == cmd)
    }
}
