//! Bounds-checked accessor over the shared dual-port window.
//!
//! Provides volatile `read_u16()` / `write_u16()` / `read_bytes()` /
//! `write_bytes()` over the DPRAM window, confining all `unsafe` pointer
//! access to this single type. The peer mutates the window at any time, so
//! nothing here is cached and every access goes through volatile loads and
//! stores.
//!
//! The window is a single-writer-at-a-time resource: which side may write is
//! decided purely by the handshake protocol (the sender writes, raises a
//! mailbox command, and does not touch the bytes again until the peer has
//! answered). Nothing in this type enforces that turn-taking; the boot
//! sequencer's step discipline is what keeps both processors off the same
//! bytes.

use core::ptr;

/// Access-timing class of the dual-port window.
///
/// Chooses the memory-controller wait-state programming used when the window
/// was mapped. Purely electrical; protocol behavior is identical across
/// classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpeedClass {
    /// Conservative timing (longest access cycles).
    Low,
    /// Fast timing for parts qualified for short access cycles.
    High,
}

/// Attempted access outside the mapped window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OutOfBounds {
    /// Requested start offset.
    pub offset: usize,
    /// Requested length in bytes.
    pub len: usize,
    /// Window size in bytes.
    pub size: usize,
}

impl core::fmt::Display for OutOfBounds {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "window access out of bounds: offset {:#x} + {} bytes > size {:#x}",
            self.offset, self.len, self.size
        )
    }
}

impl core::error::Error for OutOfBounds {}

/// The shared dual-port memory window.
///
/// Wraps a raw base address + size pair, providing bounds-checked volatile
/// accessors. A failed bounds check performs no access at all; partial reads
/// or writes never happen.
///
/// # Usage
///
/// ```ignore
/// use dpram_link::region::{SharedRegion, SpeedClass};
///
/// let win = SharedRegion::new(0x2000_0000, 0x8000, SpeedClass::Low);
/// win.write_u16(0x7FF6, frame_size)?;
/// win.write_bytes(0, payload)?;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct SharedRegion {
    base: usize,
    size: usize,
    speed: SpeedClass,
}

impl SharedRegion {
    /// Create a new window handle.
    ///
    /// # Safety contract
    ///
    /// Caller must ensure `base..base+size` is a mapped, electrically live
    /// dual-port range (memory-controller timing and power sequencing done)
    /// for the whole lifetime of the handle and its copies.
    #[inline]
    pub const fn new(base: usize, size: usize, speed: SpeedClass) -> Self {
        Self { base, size, speed }
    }

    /// Base address of the window.
    #[inline]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Window size in bytes.
    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Access-timing class the window was mapped with.
    #[inline]
    pub const fn speed_class(&self) -> SpeedClass {
        self.speed
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) -> Result<(), OutOfBounds> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    /// Read a little-endian u16 at the given byte offset.
    pub fn read_u16(&self, offset: usize) -> Result<u16, OutOfBounds> {
        self.check(offset, 2)?;
        let p = (self.base + offset) as *const u8;
        let bytes = unsafe { [ptr::read_volatile(p), ptr::read_volatile(p.add(1))] };
        Ok(u16::from_le_bytes(bytes))
    }

    /// Write a little-endian u16 at the given byte offset.
    pub fn write_u16(&self, offset: usize, value: u16) -> Result<(), OutOfBounds> {
        self.check(offset, 2)?;
        let p = (self.base + offset) as *mut u8;
        let bytes = value.to_le_bytes();
        unsafe {
            ptr::write_volatile(p, bytes[0]);
            ptr::write_volatile(p.add(1), bytes[1]);
        }
        Ok(())
    }

    /// Copy `dst.len()` bytes out of the window starting at `offset`.
    ///
    /// The copy goes through volatile loads; the peer may have written the
    /// bytes at any time before the matching mailbox command was observed.
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<(), OutOfBounds> {
        self.check(offset, dst.len())?;
        let mut p = (self.base + offset) as *const u8;
        for b in dst.iter_mut() {
            *b = unsafe { ptr::read_volatile(p) };
            p = unsafe { p.add(1) };
        }
        Ok(())
    }

    /// Copy `src` into the window starting at `offset`.
    ///
    /// All-or-nothing: if the range does not fit, nothing is written.
    pub fn write_bytes(&self, offset: usize, src: &[u8]) -> Result<(), OutOfBounds> {
        self.check(offset, src.len())?;
        let mut p = (self.base + offset) as *mut u8;
        for &b in src {
            unsafe {
                ptr::write_volatile(p, b);
                p = p.add(1);
            }
        }
        Ok(())
    }

    /// Fill `len` bytes starting at `offset` with `value`.
    pub fn fill(&self, offset: usize, len: usize, value: u8) -> Result<(), OutOfBounds> {
        self.check(offset, len)?;
        let mut p = (self.base + offset) as *mut u8;
        for _ in 0..len {
            unsafe {
                ptr::write_volatile(p, value);
                p = p.add(1);
            }
        }
        Ok(())
    }
}
