#![doc = "Host-side CP peer simulation for dpram-link."]
#![doc = ""]
#![doc = "Runs the boot sequencer against a scripted coprocessor without any"]
#![doc = "hardware: the window is a heap buffer, the mailbox registers and the"]
#![doc = "data-ready line live on a shared [`Bus`], and simulated time advances"]
#![doc = "one tick per delay call, which is when the peer gets to act. Everything"]
#![doc = "is single-threaded and deterministic, so tests can assert exact poll"]
#![doc = "counts."]

pub mod peer;

use std::cell::{Cell, Ref, RefCell};
use std::rc::Rc;

use embedded_hal::delay::DelayNs;

use dpram_link::boot::map::WINDOW_SIZE;
use dpram_link::mailbox::{CommandInbox, InitEndSignal, IrqLine, Mailbox};
use dpram_link::{BootError, BootSequencer, SharedRegion, SpeedClass};

pub use peer::{ChunkRecord, PeerConfig, SimPeer};

//=============================================================================
// Shared wiring
//=============================================================================

/// Wire-level state both ends see: the two mailbox registers and the
/// data-ready line.
#[derive(Debug)]
pub struct Bus {
    pub ap2cp: u16,
    pub cp2ap: u16,
    /// Level of the data-ready line.
    pub line_level: bool,
    /// Whether the AP has the line's interrupt unmasked.
    pub line_enabled: bool,
}

impl Default for Bus {
    fn default() -> Self {
        Self {
            ap2cp: 0,
            cp2ap: 0,
            line_level: false,
            line_enabled: true,
        }
    }
}

/// Heap-backed stand-in for the mapped DPRAM window.
pub struct SimWindow {
    buf: Box<[u8]>,
}

impl SimWindow {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; WINDOW_SIZE].into_boxed_slice(),
        }
    }

    /// Region handle both sides address the window through.
    pub fn region(&mut self) -> SharedRegion {
        SharedRegion::new(self.buf.as_mut_ptr() as usize, self.buf.len(), SpeedClass::High)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl Default for SimWindow {
    fn default() -> Self {
        Self::new()
    }
}

//=============================================================================
// AP-side hardware stand-ins
//=============================================================================

/// AP mailbox over the shared bus. Sending hands the code straight to the
/// peer, the way a mailbox interrupt would on silicon.
#[derive(Clone)]
pub struct SimMailbox<'a> {
    bus: Rc<RefCell<Bus>>,
    peer: Rc<RefCell<SimPeer<'a>>>,
}

impl<'a> Mailbox for SimMailbox<'a> {
    fn send(&mut self, code: u16) {
        self.bus.borrow_mut().ap2cp = code;
        self.peer.borrow_mut().on_ap_send(code);
    }

    fn recv(&mut self) -> u16 {
        let mut bus = self.bus.borrow_mut();
        let code = bus.cp2ap;
        bus.cp2ap = 0;
        bus.line_level = false;
        code
    }
}

/// The data-ready line as the AP sees it.
#[derive(Clone)]
pub struct SimLine {
    bus: Rc<RefCell<Bus>>,
}

impl IrqLine for SimLine {
    fn is_asserted(&self) -> bool {
        self.bus.borrow().line_level
    }

    fn enable(&mut self) {
        self.bus.borrow_mut().line_enabled = true;
    }

    fn disable(&mut self) {
        self.bus.borrow_mut().line_enabled = false;
    }
}

/// Delay source that advances simulated time: each call is one tick of the
/// peer, so everything the peer does happens while the boot task sleeps.
#[derive(Clone)]
pub struct SimDelay<'a> {
    peer: Rc<RefCell<SimPeer<'a>>>,
    calls: Rc<Cell<u32>>,
    total_ns: Rc<Cell<u64>>,
}

impl<'a> DelayNs for SimDelay<'a> {
    fn delay_ns(&mut self, ns: u32) {
        self.calls.set(self.calls.get() + 1);
        self.total_ns.set(self.total_ns.get() + u64::from(ns));
        self.peer.borrow_mut().tick();
    }
}

//=============================================================================
// Harness
//=============================================================================

/// One wired-up simulation: bus, peer and the AP-side hardware handles.
///
/// The window and the inbox/latch statics live with the caller; the harness
/// only borrows them, mirroring how a platform port shares them between the
/// boot task and its interrupt handlers.
pub struct Sim<'a> {
    bus: Rc<RefCell<Bus>>,
    peer: Rc<RefCell<SimPeer<'a>>>,
    mbx: SimMailbox<'a>,
    line: SimLine,
    delay: SimDelay<'a>,
    region: SharedRegion,
    inbox: &'a CommandInbox,
    init_end: &'a InitEndSignal,
}

impl<'a> Sim<'a> {
    /// Peer that serves the download flow: copy-window announce, frame
    /// acks, boot-start confirmation and the INIT_END event.
    pub fn with_download_peer(
        region: SharedRegion,
        cfg: PeerConfig,
        inbox: &'a CommandInbox,
        init_end: &'a InitEndSignal,
    ) -> Self {
        let bus = Rc::new(RefCell::new(Bus::default()));
        let peer = SimPeer::download(cfg, region, bus.clone(), inbox, init_end);
        Self::assemble(region, bus, peer, inbox, init_end)
    }

    /// Peer that serves a memory dump: one `(payload, tag)` entry per frame,
    /// in order. The last entry should carry the end tag.
    pub fn with_dump_peer(
        region: SharedRegion,
        frames: Vec<(Vec<u8>, u16)>,
        cfg: PeerConfig,
        inbox: &'a CommandInbox,
        init_end: &'a InitEndSignal,
    ) -> Self {
        let bus = Rc::new(RefCell::new(Bus::default()));
        let peer = SimPeer::dump(frames, cfg, region, bus.clone(), inbox, init_end);
        Self::assemble(region, bus, peer, inbox, init_end)
    }

    fn assemble(
        region: SharedRegion,
        bus: Rc<RefCell<Bus>>,
        peer: SimPeer<'a>,
        inbox: &'a CommandInbox,
        init_end: &'a InitEndSignal,
    ) -> Self {
        let peer = Rc::new(RefCell::new(peer));
        let mbx = SimMailbox {
            bus: bus.clone(),
            peer: peer.clone(),
        };
        let line = SimLine { bus: bus.clone() };
        let delay = SimDelay {
            peer: peer.clone(),
            calls: Rc::new(Cell::new(0)),
            total_ns: Rc::new(Cell::new(0)),
        };
        Self {
            bus,
            peer,
            mbx,
            line,
            delay,
            region,
            inbox,
            init_end,
        }
    }

    /// Boot sequencer wired to this simulation.
    pub fn boot(
        &self,
    ) -> Result<BootSequencer<'a, SimMailbox<'a>, SimLine, SimDelay<'a>>, BootError> {
        BootSequencer::new(
            self.region,
            self.mbx.clone(),
            self.line.clone(),
            self.delay.clone(),
            self.inbox,
            self.init_end,
        )
    }

    /// Delay calls made so far (equals elapsed peer ticks).
    pub fn delay_calls(&self) -> u32 {
        self.delay.calls.get()
    }

    /// Simulated nanoseconds slept so far.
    pub fn delay_total_ns(&self) -> u64 {
        self.delay.total_ns.get()
    }

    pub fn line_enabled(&self) -> bool {
        self.bus.borrow().line_enabled
    }

    pub fn peer(&self) -> Ref<'_, SimPeer<'a>> {
        self.peer.borrow()
    }

    /// Frames the peer has pulled out of the window, in arrival order.
    pub fn chunks(&self) -> Vec<ChunkRecord> {
        self.peer.borrow().chunks().to_vec()
    }

    /// Frame acks the peer has issued.
    pub fn acks(&self) -> u32 {
        self.peer.borrow().acks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_one_full_map() {
        let mut win = SimWindow::new();
        let region = win.region();
        assert_eq!(region.size(), WINDOW_SIZE);

        region.write_u16(0x7FF6, 0xABCD).unwrap();
        assert_eq!(&win.bytes()[0x7FF6..0x7FF8], &[0xCD, 0xAB]);
    }

    #[test]
    fn recv_reads_and_clears_the_register() {
        let inbox = CommandInbox::new();
        let init_end = InitEndSignal::new();
        let mut win = SimWindow::new();
        let sim = Sim::with_download_peer(
            win.region(),
            PeerConfig::default(),
            &inbox,
            &init_end,
        );

        {
            let mut bus = sim.bus.borrow_mut();
            bus.cp2ap = 0x1234;
            bus.line_level = true;
        }
        let mut mbx = sim.mbx.clone();
        assert_eq!(mbx.recv(), 0x1234);
        assert_eq!(mbx.recv(), 0);
        assert!(!sim.line.is_asserted());
    }
}
