//! Mailbox and interrupt signalling between AP and CP.
//!
//! The two processors signal each other through a pair of 16-bit hardware
//! mailbox registers (one per direction) and a GPIO "new data" line driven
//! by the CP. Both live outside the byte-addressable window; this module
//! models them as traits the platform implements.
//!
//! Interrupt discipline: the hardware interrupt callback must do nothing
//! except post the received code into a [`CommandInbox`] (or fire the
//! [`InitEndSignal`] for the distinct INIT_END acknowledgement event). The
//! boot task drains the inbox; transfer counters are never touched from
//! interrupt context.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embedded_hal::delay::DelayNs;
use heapless::Deque;

use crate::boot::Phase;

/// Command vocabulary exchanged through the mailbox registers.
///
/// Wire values must match the CP firmware bit-for-bit; never renumber.
pub mod cmd {
    /// Peer's frame-turn signal: a dump frame is available (upload), or the
    /// peer is ready for the next frame (download).
    pub const FRAME_TURN: u16 = 0xDBAB;

    /// Data has been placed in the boot buffer. Sent by whichever side just
    /// wrote a frame, in both transfer directions.
    pub const FRAME_READY: u16 = 0xDB12;

    /// CP announces the start of an exchange: its own memory upload
    /// (dump step 1) or the download copy window.
    pub const EXCHANGE_START: u16 = 0x1234;

    /// AP acknowledges dump step 1 and requests step 2.
    pub const UPLOAD_STEP2_REQ: u16 = 0xDEAD;

    /// AP triggers the final boot-start sequence.
    pub const BOOT_START: u16 = 0x4567;

    /// CP confirms the boot-start sequence finished.
    pub const BOOT_START_DONE: u16 = 0xABCD;

    /// AP's INIT_END word: a raw interrupt-mask composite rather than a
    /// command code, sent through the same AP→CP port once the IPC rings
    /// are live. The CP acknowledges on a distinct hardware event, not
    /// with a mailbox code.
    pub const INIT_END: u16 = 0x11C2;
}

/// The pair of 16-bit hardware mailbox registers.
pub trait Mailbox {
    /// Write `code` to the AP→CP register. Always succeeds at the protocol
    /// level; electrical failure is outside this model.
    fn send(&mut self, code: u16);

    /// Read and clear the CP→AP register.
    fn recv(&mut self) -> u16;
}

/// The CP-driven "new data" GPIO line and its interrupt gate.
pub trait IrqLine {
    /// Current level of the line.
    fn is_asserted(&self) -> bool;

    /// Unmask the line's interrupt.
    fn enable(&mut self);

    /// Mask the line's interrupt. The dump upload polls the line raw and
    /// keeps the interrupt path off until the final frame.
    fn disable(&mut self);
}

/// The expected signal did not arrive within the polling budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timeout;

impl core::fmt::Display for Timeout {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("timed out polling the data-ready line")
    }
}

impl core::error::Error for Timeout {}

/// Poll the data-ready line once per millisecond until asserted.
///
/// Checks the line first and sleeps after, so an already-asserted line
/// returns without waiting. `timeout_ms` is both the wall-clock budget and
/// the exact number of polls performed. This cooperative poll is the only
/// form of waiting the boot sequence uses on the line.
pub fn poll_for_interrupt<L, D>(line: &L, delay: &mut D, timeout_ms: u32) -> Result<(), Timeout>
where
    L: IrqLine,
    D: DelayNs,
{
    for _ in 0..timeout_ms {
        if line.is_asserted() {
            return Ok(());
        }
        delay.delay_ms(1);
    }
    Err(Timeout)
}

/// Capacity of the command inbox.
///
/// The boot task drains the queue every poll step (1 or 10 ms) while the
/// peer sends at most one code per handshake turn, so the queue stays
/// nearly empty in practice.
pub const INBOX_DEPTH: usize = 16;

/// Single-consumer queue carrying "peer sent code X" notifications from the
/// mailbox interrupt to the boot task.
///
/// The interrupt callback calls [`post`](Self::post) and returns; all
/// protocol reactions (including sending the next download chunk) run in
/// the boot task when it drains the queue.
pub struct CommandInbox {
    queue: Mutex<CriticalSectionRawMutex, RefCell<Deque<u16, INBOX_DEPTH>>>,
}

impl CommandInbox {
    /// Create an empty inbox.
    pub const fn new() -> Self {
        Self {
            queue: Mutex::new(RefCell::new(Deque::new())),
        }
    }

    /// Post a received code. Safe to call from interrupt context.
    ///
    /// Returns `Err(code)` if the queue is full; the caller decides whether
    /// dropping the code is acceptable.
    pub fn post(&self, code: u16) -> Result<(), u16> {
        self.queue.lock(|q| q.borrow_mut().push_back(code))
    }

    /// Take the oldest pending code, if any.
    pub fn take(&self) -> Option<u16> {
        self.queue.lock(|q| q.borrow_mut().pop_front())
    }

    /// Discard all pending codes (used when a boot step fails or the
    /// sequencer is reset).
    pub fn clear(&self) {
        self.queue.lock(|q| q.borrow_mut().clear())
    }
}

impl Default for CommandInbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Latched flag for the INIT_END acknowledgement.
///
/// The CP acknowledges the AP's INIT_END word on a distinct hardware event
/// rather than a mailbox code; the platform's handler for that event calls
/// [`notify`](Self::notify) and the boot task consumes the latch with
/// [`take`](Self::take).
pub struct InitEndSignal {
    flag: AtomicBool,
}

impl InitEndSignal {
    pub const fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }

    /// Latch the acknowledgement. Safe to call from interrupt context.
    pub fn notify(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Consume the latch, returning whether it was set.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }

    /// Drop a stale latch (used when a boot step fails or the sequencer is
    /// reset).
    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl Default for InitEndSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Meaning of a raw mailbox code in a given protocol phase.
///
/// The same wire value means different things in different phases (`0x1234`
/// opens both the dump upload and the download copy window; `0xDBAB` is
/// "frame available" while uploading but "send the next frame" while
/// downloading), so a code is never interpreted on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MailboxEvent {
    /// CP opened its memory upload (dump step 1 complete on its side).
    ExchangeStart,
    /// CP opened the download copy window.
    CopyStart,
    /// A dump frame is ready in the boot buffer.
    DumpFrameReady,
    /// CP consumed the previous download frame and wants the next.
    FrameAck,
    /// CP finished the boot-start sequence.
    BootStartDone,
    /// Code carries no meaning in the current phase.
    Unknown(u16),
}

impl MailboxEvent {
    /// Resolve a raw code against the current phase.
    pub fn resolve(phase: Phase, code: u16) -> Self {
        match (phase, code) {
            (Phase::UploadStep1, cmd::EXCHANGE_START) => Self::ExchangeStart,
            (Phase::DownloadPrep, cmd::EXCHANGE_START) => Self::CopyStart,
            (Phase::UploadStep2, cmd::FRAME_TURN) => Self::DumpFrameReady,
            (Phase::Downloading | Phase::NvLoading, cmd::FRAME_TURN) => Self::FrameAck,
            (Phase::BootStarting, cmd::BOOT_START_DONE) => Self::BootStartDone,
            (_, code) => Self::Unknown(code),
        }
    }
}
