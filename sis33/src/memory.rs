//! The caller's address space, as seen by the control-request surface

use crate::wire::{align_up, Abi, UserPtr, Wire, WireError};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Fault {
    #[error("{len} bytes at {addr:#x} are not accessible")]
    OutOfBounds { addr: u64, len: usize },
    #[error("No staging space left for {len} bytes")]
    StagingExhausted { len: usize },
    #[error("Malformed request: {0}")]
    Layout(#[from] WireError),
}

/// Memory belonging to whoever issued a control request.
///
/// Every access is checked, a failed one is reported as a [`Fault`] and never as a crash.
pub trait CallerMemory: Send + Sync + std::fmt::Debug {
    /// Copies `buf.len()` bytes at `addr` into `buf`
    /// # Errors
    /// Returns an error if any byte of the range is inaccessible
    fn read(&self, addr: UserPtr, buf: &mut [u8]) -> Result<(), Fault>;

    /// Copies `data` to `addr`
    /// # Errors
    /// Returns an error if any byte of the range is inaccessible
    fn write(&self, addr: UserPtr, data: &[u8]) -> Result<(), Fault>;

    /// Reserves `len` bytes of scratch space the caller can access, aligned to `align`
    /// # Errors
    /// Returns an error if there is no room left
    fn stage(&self, len: usize, align: usize) -> Result<UserPtr, Fault>;

    /// Gives back the `len` bytes staged at `addr`. Staging is released in reverse order.
    fn unstage(&self, addr: UserPtr, len: usize);
}

/// Staging space that lasts for one request, released on drop
#[derive(Debug)]
pub struct Staged<'a> {
    mem: &'a dyn CallerMemory,
    addr: UserPtr,
    len: usize,
}

impl Staged<'_> {
    #[must_use]
    pub fn addr(&self) -> UserPtr {
        self.addr
    }
}

impl Drop for Staged<'_> {
    fn drop(&mut self) {
        self.mem.unstage(self.addr, self.len);
    }
}

impl dyn CallerMemory + '_ {
    /// Reads a `T` laid out in `abi` at `addr`
    /// # Errors
    /// Returns an error if the memory is inaccessible
    pub fn read_wire<T: Wire>(&self, abi: Abi, addr: UserPtr) -> Result<T, Fault> {
        let mut bytes = vec![0; T::size(abi)];
        self.read(addr, &mut bytes)?;
        Ok(T::from_bytes(abi, &bytes)?)
    }

    /// Writes `value` laid out in `abi` at `addr`
    /// # Errors
    /// Returns an error if the memory is inaccessible or `value` can't be represented in `abi`
    pub fn write_wire<T: Wire>(&self, abi: Abi, addr: UserPtr, value: &T) -> Result<(), Fault> {
        self.write(addr, &value.to_bytes(abi)?)
    }

    /// Stages `len` bytes for as long as the returned guard lives
    /// # Errors
    /// Returns an error if there is no room left
    pub fn stage_scoped(&self, len: usize, align: usize) -> Result<Staged<'_>, Fault> {
        let addr = self.stage(len, align)?;
        Ok(Staged {
            mem: self,
            addr,
            len,
        })
    }

    /// Stages a `T` laid out in `abi` for as long as the returned guard lives
    /// # Errors
    /// Returns an error if there is no room left or `value` can't be represented in `abi`
    pub fn stage_wire<T: Wire>(&self, abi: Abi, value: &T) -> Result<Staged<'_>, Fault> {
        let bytes = value.to_bytes(abi)?;
        let staged = self.stage_scoped(bytes.len(), T::align(abi))?;
        self.write(staged.addr(), &bytes)?;
        Ok(staged)
    }
}

#[derive(Debug)]
struct Heap {
    bytes: Vec<u8>,
    /// Offset of the first unallocated byte
    next: usize,
}

/// A contiguous, in-process address space with a bump allocator. Only the most recent
/// allocation can be given back, through [`CallerMemory::unstage`].
#[derive(Debug)]
pub struct Arena {
    base: u64,
    heap: Mutex<Heap>,
}

impl Arena {
    /// Where arenas start by default, keeping null and the first page inaccessible
    pub const DEFAULT_BASE: u64 = 0x1_0000;

    /// An arena of `capacity` zeroed bytes at [`Arena::DEFAULT_BASE`]
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::at(Self::DEFAULT_BASE, capacity)
    }

    /// An arena of `capacity` zeroed bytes starting at address `base`
    #[must_use]
    pub fn at(base: u64, capacity: usize) -> Self {
        Self {
            base,
            heap: Mutex::new(Heap {
                bytes: vec![0; capacity],
                next: 0,
            }),
        }
    }

    fn heap(&self) -> MutexGuard<'_, Heap> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Byte range of `len` bytes at `addr` within the arena
    fn range(
        &self,
        heap: &Heap,
        addr: UserPtr,
        len: usize,
    ) -> Result<std::ops::Range<usize>, Fault> {
        let fault = Fault::OutOfBounds { addr: addr.0, len };
        let start = addr
            .0
            .checked_sub(self.base)
            .and_then(|o| usize::try_from(o).ok())
            .ok_or(fault.clone())?;
        let end = start.checked_add(len).ok_or(fault.clone())?;
        if end > heap.bytes.len() {
            return Err(fault);
        }
        Ok(start..end)
    }

    /// Allocates `len` zeroed bytes aligned to `align`
    /// # Errors
    /// Returns an error if the arena is full
    pub fn alloc(&self, len: usize, align: usize) -> Result<UserPtr, Fault> {
        let mut heap = self.heap();
        let base = usize::try_from(self.base).map_err(|_| Fault::StagingExhausted { len })?;
        // Align the address, not just the offset
        let start = align_up(base + heap.next, align) - base;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= heap.bytes.len())
            .ok_or(Fault::StagingExhausted { len })?;
        heap.next = end;
        Ok(UserPtr(self.base + start as u64))
    }

    /// Allocates room for `data` and copies it in
    /// # Errors
    /// Returns an error if the arena is full
    pub fn alloc_bytes(&self, data: &[u8], align: usize) -> Result<UserPtr, Fault> {
        let addr = self.alloc(data.len(), align)?;
        self.write(addr, data)?;
        Ok(addr)
    }

    /// Copies `len` bytes out of the arena
    /// # Errors
    /// Returns an error if the range is outside of the arena
    pub fn read_vec(&self, addr: UserPtr, len: usize) -> Result<Vec<u8>, Fault> {
        let mut buf = vec![0; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }

    /// Bytes allocated so far
    #[must_use]
    pub fn used(&self) -> usize {
        self.heap().next
    }
}

impl CallerMemory for Arena {
    fn read(&self, addr: UserPtr, buf: &mut [u8]) -> Result<(), Fault> {
        let heap = self.heap();
        let range = self.range(&heap, addr, buf.len())?;
        buf.copy_from_slice(&heap.bytes[range]);
        Ok(())
    }

    fn write(&self, addr: UserPtr, data: &[u8]) -> Result<(), Fault> {
        let mut heap = self.heap();
        let range = self.range(&heap, addr, data.len())?;
        heap.bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn stage(&self, len: usize, align: usize) -> Result<UserPtr, Fault> {
        self.alloc(len, align)
    }

    fn unstage(&self, addr: UserPtr, len: usize) {
        let mut heap = self.heap();
        let Some(start) = addr
            .0
            .checked_sub(self.base)
            .and_then(|o| usize::try_from(o).ok())
        else {
            return;
        };
        // Anything allocated since keeps its place, the space is simply not reused
        if start.checked_add(len) == Some(heap.next) {
            heap.next = start;
        }
    }
}
