//! Scripted CP-side peer.
//!
//! Reacts to AP mailbox traffic the way the modem's boot ROM does: it
//! announces the exchange, consumes or serves boot frames through the
//! window, confirms boot start and fires the INIT_END event. Reactions are
//! deferred by a configurable number of ticks so they land while the boot
//! task is asleep, and fault modes (staying silent, wrong codes, a capped
//! ack budget) drive the failure-path tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use dpram_link::boot::map::{COUNT_OFFSET, FRAME_SIZE_OFFSET, TAG_OFFSET};
use dpram_link::mailbox::{cmd, CommandInbox, InitEndSignal};
use dpram_link::region::OutOfBounds;
use dpram_link::SharedRegion;

use crate::Bus;

/// Knobs of the scripted peer.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Tick on which the peer announces the exchange (`0x1234`).
    pub announce_after: u32,
    /// Ticks between an AP command and the peer's reaction to it.
    pub reaction_ticks: u32,
    /// Stop acking frames after this many acks; `None` acks everything.
    pub max_acks: Option<u32>,
    /// Code used to ack a received frame.
    pub ack_code: u16,
    /// Code used to confirm boot start.
    pub boot_done_code: u16,
    /// Ignore the AP entirely.
    pub silent: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            announce_after: 3,
            reaction_ticks: 2,
            max_acks: None,
            ack_code: cmd::FRAME_TURN,
            boot_done_code: cmd::BOOT_START_DONE,
            silent: false,
        }
    }
}

/// One frame as the peer pulled it out of the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub payload: Vec<u8>,
    pub tag: u16,
    pub count: u16,
}

enum Action {
    Send(u16),
    ServeDumpFrame,
    FireInitEnd,
}

enum Role {
    /// Receive download/NV frames and run the boot-start exchange.
    Download,
    /// Serve scripted dump frames, one per exchange.
    Dump {
        frames: VecDeque<(Vec<u8>, u16)>,
        next_count: u16,
    },
}

pub struct SimPeer<'a> {
    role: Role,
    cfg: PeerConfig,
    region: SharedRegion,
    bus: Rc<RefCell<Bus>>,
    inbox: &'a CommandInbox,
    init_end: &'a InitEndSignal,
    tick: u32,
    announced: bool,
    pending: VecDeque<(u32, Action)>,
    chunks: Vec<ChunkRecord>,
    acks: u32,
}

impl<'a> SimPeer<'a> {
    pub(crate) fn download(
        cfg: PeerConfig,
        region: SharedRegion,
        bus: Rc<RefCell<Bus>>,
        inbox: &'a CommandInbox,
        init_end: &'a InitEndSignal,
    ) -> Self {
        Self::new(Role::Download, cfg, region, bus, inbox, init_end)
    }

    pub(crate) fn dump(
        frames: Vec<(Vec<u8>, u16)>,
        cfg: PeerConfig,
        region: SharedRegion,
        bus: Rc<RefCell<Bus>>,
        inbox: &'a CommandInbox,
        init_end: &'a InitEndSignal,
    ) -> Self {
        let role = Role::Dump {
            frames: frames.into(),
            next_count: 1,
        };
        Self::new(role, cfg, region, bus, inbox, init_end)
    }

    fn new(
        role: Role,
        cfg: PeerConfig,
        region: SharedRegion,
        bus: Rc<RefCell<Bus>>,
        inbox: &'a CommandInbox,
        init_end: &'a InitEndSignal,
    ) -> Self {
        Self {
            role,
            cfg,
            region,
            bus,
            inbox,
            init_end,
            tick: 0,
            announced: false,
            pending: VecDeque::new(),
            chunks: Vec::new(),
            acks: 0,
        }
    }

    /// Frames received so far, in arrival order.
    pub fn chunks(&self) -> &[ChunkRecord] {
        &self.chunks
    }

    /// Frame acks issued so far.
    pub fn acks(&self) -> u32 {
        self.acks
    }

    /// Advance one tick of simulated time.
    pub(crate) fn tick(&mut self) {
        self.tick += 1;
        if self.cfg.silent {
            return;
        }

        if !self.announced && self.tick >= self.cfg.announce_after {
            self.announced = true;
            log::debug!("peer: announcing exchange");
            self.cp_send(cmd::EXCHANGE_START);
        }

        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].0 <= self.tick {
                if let Some((_, action)) = self.pending.remove(i) {
                    self.run(action);
                }
            } else {
                i += 1;
            }
        }
    }

    /// React to a code the AP just put in the AP-to-CP mailbox.
    pub(crate) fn on_ap_send(&mut self, code: u16) {
        if self.cfg.silent {
            return;
        }
        match code {
            cmd::UPLOAD_STEP2_REQ => {
                if matches!(self.role, Role::Dump { .. }) {
                    self.schedule(Action::ServeDumpFrame);
                }
            }
            cmd::FRAME_READY => match self.role {
                Role::Dump { ref frames, .. } => {
                    if !frames.is_empty() {
                        self.schedule(Action::ServeDumpFrame);
                    }
                }
                Role::Download => self.take_frame(),
            },
            cmd::BOOT_START => {
                let done = self.cfg.boot_done_code;
                self.schedule(Action::Send(done));
            }
            cmd::INIT_END => self.schedule(Action::FireInitEnd),
            _ => log::debug!("peer: ignoring code {code:#06x}"),
        }
    }

    fn schedule(&mut self, action: Action) {
        self.pending
            .push_back((self.tick + self.cfg.reaction_ticks, action));
    }

    fn run(&mut self, action: Action) {
        match action {
            Action::Send(code) => self.cp_send(code),
            Action::ServeDumpFrame => self.serve_dump_frame(),
            Action::FireInitEnd => {
                log::debug!("peer: firing INIT_END acknowledgement");
                self.init_end.notify();
            }
        }
    }

    /// Put `code` in the CP-to-AP register and raise the line. With the
    /// line's interrupt unmasked this also plays the AP's handler: the code
    /// moves into the inbox and the register clears before the boot task
    /// wakes. Masked, the code parks for raw polling.
    fn cp_send(&mut self, code: u16) {
        let mut bus = self.bus.borrow_mut();
        bus.cp2ap = code;
        bus.line_level = true;
        if bus.line_enabled {
            bus.cp2ap = 0;
            bus.line_level = false;
            drop(bus);
            if self.inbox.post(code).is_err() {
                log::warn!("peer: AP inbox full, dropping {code:#06x}");
            }
        }
    }

    /// Read the frame the AP just parked and (budget permitting) ack it.
    fn take_frame(&mut self) {
        match self.read_window_frame() {
            Ok(rec) => {
                log::debug!(
                    "peer: frame {} in, {} bytes, tag {:#06x}",
                    rec.count,
                    rec.payload.len(),
                    rec.tag
                );
                self.chunks.push(rec);
                if self.cfg.max_acks.is_none_or(|m| self.acks < m) {
                    self.acks += 1;
                    let ack = self.cfg.ack_code;
                    self.schedule(Action::Send(ack));
                } else {
                    log::debug!("peer: ack budget spent, staying quiet");
                }
            }
            Err(e) => log::warn!("peer: unreadable frame in window: {e}"),
        }
    }

    fn read_window_frame(&self) -> Result<ChunkRecord, OutOfBounds> {
        let size = self.region.read_u16(FRAME_SIZE_OFFSET)? as usize;
        let tag = self.region.read_u16(TAG_OFFSET)?;
        let count = self.region.read_u16(COUNT_OFFSET)?;
        let mut payload = vec![0u8; size];
        self.region.read_bytes(0, &mut payload)?;
        Ok(ChunkRecord {
            payload,
            tag,
            count,
        })
    }

    /// Park the next scripted dump frame and raise the frame-turn code.
    fn serve_dump_frame(&mut self) {
        let next = match &mut self.role {
            Role::Dump { frames, next_count } => match frames.pop_front() {
                Some((payload, tag)) => {
                    let count = *next_count;
                    *next_count = next_count.wrapping_add(1);
                    Some((payload, tag, count))
                }
                None => None,
            },
            Role::Download => None,
        };
        let Some((payload, tag, count)) = next else {
            return;
        };

        if let Err(e) = self.write_window_frame(&payload, tag, count) {
            log::warn!("peer: cannot park dump frame: {e}");
            return;
        }
        log::debug!("peer: dump frame {count} parked, {} bytes", payload.len());
        self.cp_send(cmd::FRAME_TURN);
    }

    fn write_window_frame(&self, payload: &[u8], tag: u16, count: u16) -> Result<(), OutOfBounds> {
        self.region.write_bytes(0, payload)?;
        self.region.write_u16(FRAME_SIZE_OFFSET, payload.len() as u16)?;
        self.region.write_u16(TAG_OFFSET, tag)?;
        self.region.write_u16(COUNT_OFFSET, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpram_link::SpeedClass;

    struct Fixture {
        _window: Vec<u8>,
        region: SharedRegion,
        bus: Rc<RefCell<Bus>>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut window = vec![0u8; dpram_link::boot::map::WINDOW_SIZE];
            let region =
                SharedRegion::new(window.as_mut_ptr() as usize, window.len(), SpeedClass::Low);
            Self {
                _window: window,
                region,
                bus: Rc::new(RefCell::new(Bus::default())),
            }
        }
    }

    #[test]
    fn masked_line_parks_the_code() {
        let fx = Fixture::new();
        let inbox = CommandInbox::new();
        let init_end = InitEndSignal::new();
        fx.bus.borrow_mut().line_enabled = false;

        let mut peer =
            SimPeer::download(PeerConfig::default(), fx.region, fx.bus.clone(), &inbox, &init_end);
        peer.cp_send(cmd::EXCHANGE_START);

        let bus = fx.bus.borrow();
        assert_eq!(bus.cp2ap, cmd::EXCHANGE_START);
        assert!(bus.line_level);
        assert_eq!(inbox.take(), None);
    }

    #[test]
    fn unmasked_line_posts_straight_to_the_inbox() {
        let fx = Fixture::new();
        let inbox = CommandInbox::new();
        let init_end = InitEndSignal::new();

        let mut peer =
            SimPeer::download(PeerConfig::default(), fx.region, fx.bus.clone(), &inbox, &init_end);
        peer.cp_send(cmd::EXCHANGE_START);

        let bus = fx.bus.borrow();
        assert_eq!(bus.cp2ap, 0);
        assert!(!bus.line_level);
        assert_eq!(inbox.take(), Some(cmd::EXCHANGE_START));
    }

    #[test]
    fn announce_fires_on_the_configured_tick() {
        let fx = Fixture::new();
        let inbox = CommandInbox::new();
        let init_end = InitEndSignal::new();
        let cfg = PeerConfig {
            announce_after: 3,
            ..PeerConfig::default()
        };

        let mut peer = SimPeer::download(cfg, fx.region, fx.bus.clone(), &inbox, &init_end);
        peer.tick();
        peer.tick();
        assert_eq!(inbox.take(), None);
        peer.tick();
        assert_eq!(inbox.take(), Some(cmd::EXCHANGE_START));
        // Announced once, not every tick.
        peer.tick();
        assert_eq!(inbox.take(), None);
    }

    #[test]
    fn frame_acks_respect_the_budget() {
        let fx = Fixture::new();
        let inbox = CommandInbox::new();
        let init_end = InitEndSignal::new();
        let cfg = PeerConfig {
            reaction_ticks: 1,
            max_acks: Some(1),
            ..PeerConfig::default()
        };

        let mut peer = SimPeer::download(cfg, fx.region, fx.bus.clone(), &inbox, &init_end);
        peer.announced = true;

        fx.region.write_bytes(0, &[7; 16]).unwrap();
        fx.region.write_u16(FRAME_SIZE_OFFSET, 16).unwrap();
        fx.region.write_u16(TAG_OFFSET, 0x60).unwrap();
        fx.region.write_u16(COUNT_OFFSET, 1).unwrap();

        peer.on_ap_send(cmd::FRAME_READY);
        peer.tick();
        assert_eq!(inbox.take(), Some(cmd::FRAME_TURN));

        // Second frame is recorded but never acked.
        fx.region.write_u16(COUNT_OFFSET, 2).unwrap();
        peer.on_ap_send(cmd::FRAME_READY);
        peer.tick();
        peer.tick();
        assert_eq!(inbox.take(), None);
        assert_eq!(peer.chunks().len(), 2);
        assert_eq!(peer.acks(), 1);
    }

    #[test]
    fn silent_peer_never_reacts() {
        let fx = Fixture::new();
        let inbox = CommandInbox::new();
        let init_end = InitEndSignal::new();
        let cfg = PeerConfig {
            silent: true,
            announce_after: 1,
            ..PeerConfig::default()
        };

        let mut peer = SimPeer::download(cfg, fx.region, fx.bus.clone(), &inbox, &init_end);
        for _ in 0..10 {
            peer.tick();
        }
        peer.on_ap_send(cmd::BOOT_START);
        for _ in 0..10 {
            peer.tick();
        }
        assert_eq!(inbox.take(), None);
        assert!(!init_end.take());
    }
}
