//! Boot transfer sequencer.
//!
//! Drives the handshake that brings the CP out of reset into running
//! firmware:
//!
//! 1. *Dump upload*: the CP pushes its memory through the window one frame
//!    at a time (step 1 announce, then a step 2 read per frame).
//! 2. *Download prep*: wait for the CP to open the copy window.
//! 3. *Image download*: the firmware image goes out in frames of at most
//!    [`map::FRAME_SIZE_LIMIT`] bytes. The first frame is sent directly;
//!    every further frame is sent by the continuation that runs when the
//!    peer's `0xDBAB` ack is drained from the inbox.
//! 4. *NV load*: same frame discipline, independent counters.
//! 5. *Boot start*: the final `0x4567`/`0xABCD` exchange, then the
//!    INIT_END acknowledgement on its own hardware event.
//!
//! Every wait is a capped sleep-poll loop: 1 ms steps for the handshake
//! polls, 10 ms steps for the flag waits. A lapsed budget fails the step
//! and the operation; the caller restarts from a dump or download entry
//! point. The sequencer runs on a single task, and interrupt context only
//! posts codes into the [`CommandInbox`]. Codes posted ahead of a step stay
//! queued and resolve at entry; a failed step drops whatever is still
//! queued. The AP and CP alternate as the window's writer purely by
//! following these steps in order.

pub mod map;

use embedded_hal::delay::DelayNs;

use crate::ipc::IpcView;
use crate::mailbox::{
    cmd, poll_for_interrupt, CommandInbox, InitEndSignal, IrqLine, Mailbox, MailboxEvent,
};
use crate::region::{OutOfBounds, SharedRegion};
use map::{BootView, FRAME_SIZE_LIMIT};

//=============================================================================
// Error types
//=============================================================================

/// Boot transfer error, one distinguishable variant per failure concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootError {
    /// Window access failed.
    Region(OutOfBounds),

    /// The expected peer signal did not arrive within the step's budget.
    Timeout { phase: Phase },

    /// The peer sent a code the current phase does not expect. Fails the
    /// step like a timeout, but reported apart: it means desynchronization,
    /// not slowness.
    UnexpectedCode { phase: Phase, code: u16 },

    /// A frame larger than [`map::FRAME_SIZE_LIMIT`] was requested; nothing
    /// was written to the window.
    ChunkSizeExceeded { size: usize, limit: usize },

    /// The caller's destination buffer cannot hold the announced frame.
    BufferTooSmall { needed: usize, capacity: usize },

    /// Transfer with no bytes to move.
    EmptyTransfer,

    /// Step ordering violation: the operation entering `requested` is not
    /// legal while the sequencer is in `phase`.
    IllegalPhase { phase: Phase, requested: Phase },
}

impl From<OutOfBounds> for BootError {
    fn from(err: OutOfBounds) -> Self {
        Self::Region(err)
    }
}

impl core::fmt::Display for BootError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Region(e) => write!(f, "window access failed: {e}"),
            Self::Timeout { phase } => write!(f, "timed out waiting for the peer in {phase:?}"),
            Self::UnexpectedCode { phase, code } => {
                write!(f, "unexpected mailbox code {code:#06x} in {phase:?}")
            }
            Self::ChunkSizeExceeded { size, limit } => {
                write!(f, "frame of {size} bytes exceeds the {limit} byte limit")
            }
            Self::BufferTooSmall { needed, capacity } => {
                write!(f, "destination holds {capacity} bytes, frame needs {needed}")
            }
            Self::EmptyTransfer => f.write_str("transfer has no bytes"),
            Self::IllegalPhase { phase, requested } => {
                write!(f, "cannot enter {requested:?} from {phase:?}")
            }
        }
    }
}

impl core::error::Error for BootError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Region(e) => Some(e),
            _ => None,
        }
    }
}

//=============================================================================
// Phases
//=============================================================================

/// Protocol phase of the boot state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    Idle,
    /// Waiting for the CP to announce its memory upload.
    UploadStep1,
    /// Dump frames are being read, one per exchange.
    UploadStep2,
    /// Waiting for the CP to open the download copy window.
    DownloadPrep,
    /// Firmware image frames are in flight.
    Downloading,
    /// NV data frames are in flight.
    NvLoading,
    /// Waiting for the CP to confirm boot start.
    BootStarting,
    /// Waiting for the INIT_END acknowledgement event.
    BootStartPostProcessing,
    Complete,
    Failed,
}

impl Phase {
    /// Resolve a raw mailbox code against this phase.
    pub fn resolve_code(self, code: u16) -> MailboxEvent {
        MailboxEvent::resolve(self, code)
    }
}

/// Tag value the CP puts on the final dump frame. Other tag values carry no
/// special meaning on this path and are passed through untouched.
pub const DUMP_END_TAG: u16 = 4;

//=============================================================================
// Timeout budgets
//=============================================================================

/// Handshake polls: 200 polls of 1 ms, about 200 ms wall clock.
const HANDSHAKE_POLLS: u32 = 200;

/// Flag waits: 200 polls of 10 ms, about 2 s wall clock.
const FLAG_POLLS: u32 = 200;
const FLAG_STEP_MS: u32 = 10;

/// Whole-image copy wait: 2000 polls of 10 ms, about 20 s wall clock.
const COPY_POLLS: u32 = 2000;
const COPY_STEP_MS: u32 = 10;

//=============================================================================
// Transfer counters
//=============================================================================

/// Byte counters and sequence markers of one chunked transfer.
///
/// Lives on the boot task's stack for the duration of the transfer; the
/// interrupt path never sees it.
#[derive(Debug, Clone, Copy)]
struct Transfer {
    total: usize,
    sent: usize,
    rest: usize,
    /// Tag stamped on every frame (image downloads force the last frame's
    /// tag to 0 as the "last chunk" signal to the peer).
    tag: u16,
    /// Count stamped on the next frame; advances by one per frame from the
    /// caller-supplied start, wrapping at u16.
    count: u16,
    force_last_tag: bool,
    /// Set when the peer acks the final frame.
    done: bool,
}

impl Transfer {
    fn new(total: usize, tag: u16, start_count: u16, force_last_tag: bool) -> Self {
        Self {
            total,
            sent: 0,
            rest: total,
            tag,
            count: start_count,
            force_last_tag,
            done: false,
        }
    }

    /// Size of the next frame: `min(rest, FRAME_SIZE_LIMIT)`.
    fn next_len(&self) -> usize {
        self.rest.min(FRAME_SIZE_LIMIT)
    }

    /// Tag for the next frame.
    fn next_tag(&self) -> u16 {
        if self.force_last_tag && self.rest <= FRAME_SIZE_LIMIT {
            0
        } else {
            self.tag
        }
    }

    fn advance(&mut self, len: usize) {
        self.sent += len;
        self.rest -= len;
        self.count = self.count.wrapping_add(1);
        debug_assert_eq!(self.sent + self.rest, self.total);
    }
}

/// Metadata of one dump frame copied out for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DumpFrame {
    /// Payload bytes copied into the caller's buffer.
    pub len: usize,
    pub tag: u16,
    pub count: u16,
    /// Whether this was the final frame (`tag == DUMP_END_TAG`).
    pub last: bool,
}

//=============================================================================
// Boot sequencer
//=============================================================================

/// The boot transfer state machine.
///
/// Owns the mailbox, the data-ready line and the delay source; shares the
/// window with the (later) IPC view and the inbox/latch with the platform's
/// interrupt handlers.
///
/// # Usage
///
/// ```ignore
/// static INBOX: CommandInbox = CommandInbox::new();
/// static INIT_END: InitEndSignal = InitEndSignal::new();
///
/// let mut boot = BootSequencer::new(region, mbx, line, delay, &INBOX, &INIT_END)?;
/// boot.prepare_download()?;
/// boot.download_image(image, tag, 1)?;
/// boot.load_nv(nv, tag, 1)?;
/// boot.start_boot()?;
/// boot.send_init_end()?;
/// boot.wait_init_end()?;
/// let ipc = boot.into_ipc_view()?;
/// ```
pub struct BootSequencer<'a, M, L, D> {
    region: SharedRegion,
    view: BootView,
    mbx: M,
    line: L,
    delay: D,
    inbox: &'a CommandInbox,
    init_end: &'a InitEndSignal,
    phase: Phase,
}

impl<'a, M, L, D> BootSequencer<'a, M, L, D>
where
    M: Mailbox,
    L: IrqLine,
    D: DelayNs,
{
    /// Create a sequencer over a mapped window.
    ///
    /// Fails if the window is smaller than the boot layout
    /// ([`map::WINDOW_SIZE`] bytes).
    pub fn new(
        region: SharedRegion,
        mbx: M,
        line: L,
        delay: D,
        inbox: &'a CommandInbox,
        init_end: &'a InitEndSignal,
    ) -> Result<Self, BootError> {
        let view = BootView::new(region)?;
        debug!(
            "boot sequencer on a {} byte window at {:#x}",
            region.size(),
            region.base()
        );
        Ok(Self {
            region,
            view,
            mbx,
            line,
            delay,
            inbox,
            init_end,
            phase: Phase::Idle,
        })
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Force the phase back to `Idle`, dropping pending codes and a stale
    /// INIT_END latch.
    ///
    /// The entry points themselves keep the queue: use this when the caller
    /// wants to discard everything a previous run left behind.
    pub fn reset(&mut self) {
        self.inbox.clear();
        self.init_end.clear();
        self.phase = Phase::Idle;
    }

    //=========================================================================
    // Dump upload (CP memory to AP)
    //=========================================================================

    /// Step 1 of the dump upload: wait for the CP's exchange-start word and
    /// acknowledge it.
    ///
    /// The line's interrupt stays masked for the whole dump; frames are
    /// polled raw until the final one re-enables it.
    pub fn upload_dump_start(&mut self) -> Result<(), BootError> {
        self.rearm(Phase::UploadStep1)?;
        debug!("dump upload: waiting for the CP exchange-start word");
        self.line.disable();

        // Step 1 allows one extra direct mailbox read past the poll budget.
        if let Err(e) = self.wait_code(cmd::EXCHANGE_START, true) {
            return self.fail(e);
        }

        self.mbx.send(cmd::UPLOAD_STEP2_REQ);
        self.phase = Phase::UploadStep2;
        debug!("dump upload: step 2 requested");
        Ok(())
    }

    /// Step 2 of the dump upload: receive one frame into `dst`.
    ///
    /// Repeat until the returned [`DumpFrame::last`] is set; that final
    /// frame re-enables the line's interrupt and completes the dump.
    pub fn upload_dump_frame(&mut self, dst: &mut [u8]) -> Result<DumpFrame, BootError> {
        self.gate(Phase::UploadStep2, Phase::UploadStep2)?;

        if let Err(e) = self.wait_code(cmd::FRAME_TURN, false) {
            return self.fail(e);
        }

        let hdr = match self.view.read_header() {
            Ok(hdr) => hdr,
            Err(e) => return self.fail(e),
        };
        let len = hdr.frame_size as usize;
        if let Err(e) = self.view.read_payload(len, dst) {
            return self.fail(e);
        }
        self.mbx.send(cmd::FRAME_READY);

        let last = hdr.tag == DUMP_END_TAG;
        if last {
            self.line.enable();
            self.phase = Phase::Complete;
            debug!("dump complete at frame {}", hdr.count);
        } else {
            trace!("dump frame {}: {} bytes, tag {:#06x}", hdr.count, len, hdr.tag);
        }

        Ok(DumpFrame {
            len,
            tag: hdr.tag,
            count: hdr.count,
            last,
        })
    }

    //=========================================================================
    // Firmware download (AP to CP)
    //=========================================================================

    /// Wait for the CP to open the download copy window.
    pub fn prepare_download(&mut self) -> Result<(), BootError> {
        self.rearm(Phase::DownloadPrep)?;
        debug!("download prep: waiting for the CP copy window");

        let mut copy_start = false;
        for _ in 0..FLAG_POLLS {
            if let Err(e) = self.drain_copy_start(&mut copy_start) {
                return self.fail(e);
            }
            if copy_start {
                debug!("download prep: copy window open");
                return Ok(());
            }
            self.delay.delay_ms(FLAG_STEP_MS);
        }
        if let Err(e) = self.drain_copy_start(&mut copy_start) {
            return self.fail(e);
        }
        if copy_start {
            debug!("download prep: copy window open");
            return Ok(());
        }
        self.fail(BootError::Timeout { phase: self.phase })
    }

    /// Send the firmware image in frames and wait for the peer to ack the
    /// last one.
    ///
    /// `tag` is stamped on every frame except the final one, which is forced
    /// to 0 as the "last chunk" signal. `start_count` is stamped on the
    /// first frame and advances by one per frame.
    ///
    /// Legal only after [`prepare_download`](Self::prepare_download)
    /// succeeded. On failure nothing is resent; restart the whole transfer.
    pub fn download_image(
        &mut self,
        image: &[u8],
        tag: u16,
        start_count: u16,
    ) -> Result<(), BootError> {
        self.gate(Phase::DownloadPrep, Phase::Downloading)?;
        if image.is_empty() {
            return Err(BootError::EmptyTransfer);
        }
        self.phase = Phase::Downloading;
        info!("downloading CP image: {} bytes", image.len());

        let mut xfer = Transfer::new(image.len(), tag, start_count, true);
        if let Err(e) = self.send_frame(image, &mut xfer) {
            return self.fail(e);
        }
        self.wait_transfer(image, &mut xfer, COPY_POLLS, COPY_STEP_MS)
    }

    /// Send the NV blob in frames and wait for the peer to ack the last one.
    ///
    /// Same frame discipline as [`download_image`](Self::download_image) but
    /// with independent counters, a shorter wait budget, and no forced tag
    /// on the final frame.
    pub fn load_nv(&mut self, nv: &[u8], tag: u16, start_count: u16) -> Result<(), BootError> {
        self.gate(Phase::Complete, Phase::NvLoading)?;
        if nv.is_empty() {
            return Err(BootError::EmptyTransfer);
        }
        self.phase = Phase::NvLoading;
        info!("loading NV data: {} bytes", nv.len());

        let mut xfer = Transfer::new(nv.len(), tag, start_count, false);
        if let Err(e) = self.send_frame(nv, &mut xfer) {
            return self.fail(e);
        }
        self.wait_transfer(nv, &mut xfer, FLAG_POLLS, FLAG_STEP_MS)
    }

    //=========================================================================
    // Boot start
    //=========================================================================

    /// Trigger the CP's boot-start sequence and wait for its confirmation.
    pub fn start_boot(&mut self) -> Result<(), BootError> {
        self.gate(Phase::Complete, Phase::BootStarting)?;
        self.phase = Phase::BootStarting;
        debug!("boot start: sending the start word");
        self.mbx.send(cmd::BOOT_START);

        let mut done = false;
        for _ in 0..FLAG_POLLS {
            if let Err(e) = self.drain_boot_done(&mut done) {
                return self.fail(e);
            }
            if done {
                self.phase = Phase::BootStartPostProcessing;
                debug!("boot start confirmed");
                return Ok(());
            }
            self.delay.delay_ms(FLAG_STEP_MS);
        }
        if let Err(e) = self.drain_boot_done(&mut done) {
            return self.fail(e);
        }
        if done {
            self.phase = Phase::BootStartPostProcessing;
            debug!("boot start confirmed");
            return Ok(());
        }
        self.fail(BootError::Timeout { phase: self.phase })
    }

    /// Send the INIT_END word: the IPC rings are initialized and live.
    ///
    /// The CP acknowledges on the distinct hardware event behind
    /// [`InitEndSignal`], consumed by [`wait_init_end`](Self::wait_init_end).
    pub fn send_init_end(&mut self) -> Result<(), BootError> {
        self.gate(
            Phase::BootStartPostProcessing,
            Phase::BootStartPostProcessing,
        )?;
        self.mbx.send(cmd::INIT_END);
        Ok(())
    }

    /// Wait for the INIT_END acknowledgement and complete the boot.
    pub fn wait_init_end(&mut self) -> Result<(), BootError> {
        self.gate(
            Phase::BootStartPostProcessing,
            Phase::BootStartPostProcessing,
        )?;

        for _ in 0..FLAG_POLLS {
            if self.init_end.take() {
                self.phase = Phase::Complete;
                info!("CP boot complete");
                return Ok(());
            }
            self.delay.delay_ms(FLAG_STEP_MS);
        }
        if self.init_end.take() {
            self.phase = Phase::Complete;
            info!("CP boot complete");
            return Ok(());
        }
        self.fail(BootError::Timeout { phase: self.phase })
    }

    /// Hand the window over to steady-state IPC.
    ///
    /// Consumes the sequencer: the boot view and the IPC view are never live
    /// at the same time. Legal only in `Complete`.
    pub fn into_ipc_view(self) -> Result<IpcView, BootError> {
        if self.phase != Phase::Complete {
            return Err(BootError::IllegalPhase {
                phase: self.phase,
                requested: Phase::Complete,
            });
        }
        Ok(IpcView::new(self.region)?)
    }

    //=========================================================================
    // Internals
    //=========================================================================

    /// Entry gate for the restartable operations.
    ///
    /// Codes the CP posted ahead of the step stay queued: an announce that
    /// beats the boot task into the step still counts.
    fn rearm(&mut self, next: Phase) -> Result<(), BootError> {
        match self.phase {
            Phase::Idle | Phase::Complete | Phase::Failed => {
                self.phase = next;
                Ok(())
            }
            phase => Err(BootError::IllegalPhase {
                phase,
                requested: next,
            }),
        }
    }

    /// Entry gate for mid-sequence operations: the sequencer must be exactly
    /// in `at` to enter `requested`.
    fn gate(&self, at: Phase, requested: Phase) -> Result<(), BootError> {
        if self.phase == at {
            Ok(())
        } else {
            Err(BootError::IllegalPhase {
                phase: self.phase,
                requested,
            })
        }
    }

    /// Mark the operation failed and pass the error through.
    ///
    /// Drops whatever is still queued: a failed run's leftovers must not
    /// resolve a wait in the run that retries it.
    fn fail<T>(&mut self, err: BootError) -> Result<T, BootError> {
        match &err {
            BootError::UnexpectedCode { code, .. } => {
                warn!("peer desync in {:?}: code {:#06x}", self.phase, code)
            }
            _ => error!("boot step failed in {:?}: {:?}", self.phase, err),
        }
        self.inbox.clear();
        self.init_end.clear();
        self.phase = Phase::Failed;
        Err(err)
    }

    /// Poll the line for up to the handshake budget, then read the mailbox
    /// and match it against `expected`. With `extra_read`, a lapsed budget
    /// is followed by one more direct mailbox read before giving up.
    fn wait_code(&mut self, expected: u16, extra_read: bool) -> Result<(), BootError> {
        if poll_for_interrupt(&self.line, &mut self.delay, HANDSHAKE_POLLS).is_ok() {
            let code = self.mbx.recv();
            if code == expected {
                return Ok(());
            }
            return Err(BootError::UnexpectedCode {
                phase: self.phase,
                code,
            });
        }
        if extra_read && self.mbx.recv() == expected {
            return Ok(());
        }
        Err(BootError::Timeout { phase: self.phase })
    }

    /// Park the next frame in the window and raise FRAME_READY.
    fn send_frame(&mut self, data: &[u8], xfer: &mut Transfer) -> Result<(), BootError> {
        let len = xfer.next_len();
        let tag = xfer.next_tag();
        self.view
            .write_frame(&data[xfer.sent..xfer.sent + len], tag, xfer.count)?;
        self.mbx.send(cmd::FRAME_READY);
        trace!("frame {} out: {} bytes, tag {:#06x}", xfer.count, len, tag);
        xfer.advance(len);
        Ok(())
    }

    /// Drain the inbox during `Downloading`/`NvLoading`: every ack sends the
    /// next frame, the ack of the final frame finishes the transfer.
    fn pump_transfer(&mut self, data: &[u8], xfer: &mut Transfer) -> Result<(), BootError> {
        while let Some(code) = self.inbox.take() {
            match self.phase.resolve_code(code) {
                MailboxEvent::FrameAck => {
                    if xfer.rest > 0 {
                        self.send_frame(data, xfer)?;
                    } else {
                        xfer.done = true;
                    }
                }
                _ => {
                    return Err(BootError::UnexpectedCode {
                        phase: self.phase,
                        code,
                    })
                }
            }
        }
        Ok(())
    }

    /// Outer wait of a chunked transfer: pump the inbox every `step_ms`
    /// until the final ack lands or `polls` iterations lapse.
    fn wait_transfer(
        &mut self,
        data: &[u8],
        xfer: &mut Transfer,
        polls: u32,
        step_ms: u32,
    ) -> Result<(), BootError> {
        for _ in 0..polls {
            if let Err(e) = self.pump_transfer(data, xfer) {
                return self.fail(e);
            }
            if xfer.done {
                debug_assert_eq!(xfer.sent, xfer.total);
                self.phase = Phase::Complete;
                debug!("transfer complete: {} bytes", xfer.total);
                return Ok(());
            }
            self.delay.delay_ms(step_ms);
        }
        if let Err(e) = self.pump_transfer(data, xfer) {
            return self.fail(e);
        }
        if xfer.done {
            self.phase = Phase::Complete;
            debug!("transfer complete: {} bytes", xfer.total);
            return Ok(());
        }
        self.fail(BootError::Timeout { phase: self.phase })
    }

    /// Drain the inbox during `DownloadPrep`.
    fn drain_copy_start(&mut self, copy_start: &mut bool) -> Result<(), BootError> {
        while let Some(code) = self.inbox.take() {
            match self.phase.resolve_code(code) {
                MailboxEvent::CopyStart => *copy_start = true,
                _ => {
                    return Err(BootError::UnexpectedCode {
                        phase: self.phase,
                        code,
                    })
                }
            }
        }
        Ok(())
    }

    /// Drain the inbox during `BootStarting`.
    fn drain_boot_done(&mut self, done: &mut bool) -> Result<(), BootError> {
        while let Some(code) = self.inbox.take() {
            match self.phase.resolve_code(code) {
                MailboxEvent::BootStartDone => *done = true,
                _ => {
                    return Err(BootError::UnexpectedCode {
                        phase: self.phase,
                        code,
                    })
                }
            }
        }
        Ok(())
    }
}
