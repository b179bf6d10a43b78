//! Steady-state IPC map over the shared window.
//!
//! Once the CP boots, the same 32 KiB window is reinterpreted: the boot
//! frame layout is gone and the bytes become two ring-buffer channels (FMT
//! for control messages, RAW for payload traffic) plus a pair of in-window
//! mailbox words. This module pins the byte offsets, the capacities and the
//! per-channel interrupt-mask bits, and exposes cursor and buffer accessors.
//! Cursor arithmetic (modulo wrap, free-space accounting) is the link
//! driver's business, not this layer's.

use crate::region::{OutOfBounds, SharedRegion};

/// Value of `magic` once the window carries a valid IPC map.
pub const MAGIC_CODE: u16 = 0x00AA;

/// Value of `access` while the map is open for traffic.
pub const ACCESS_ENABLED: u16 = 0x0001;

//=============================================================================
// Layout
//=============================================================================

// Sequentially packed, no implicit alignment. The chain below is the layout
// contract: every offset is the previous field's end.
const MAGIC_OFFSET: usize = 0;
const ACCESS_OFFSET: usize = MAGIC_OFFSET + 2;

const FMT_TX_HEAD: usize = ACCESS_OFFSET + 2;
const FMT_TX_TAIL: usize = FMT_TX_HEAD + 2;
const FMT_TX_BUFF: usize = FMT_TX_TAIL + 2;
const FMT_BUFF_SIZE: usize = 4092;
const FMT_RX_HEAD: usize = FMT_TX_BUFF + FMT_BUFF_SIZE;
const FMT_RX_TAIL: usize = FMT_RX_HEAD + 2;
const FMT_RX_BUFF: usize = FMT_RX_TAIL + 2;

const RAW_TX_HEAD: usize = FMT_RX_BUFF + FMT_BUFF_SIZE;
const RAW_TX_TAIL: usize = RAW_TX_HEAD + 2;
const RAW_TX_BUFF: usize = RAW_TX_TAIL + 2;
const RAW_BUFF_SIZE: usize = 12272;
const RAW_RX_HEAD: usize = RAW_TX_BUFF + RAW_BUFF_SIZE;
const RAW_RX_TAIL: usize = RAW_RX_HEAD + 2;
const RAW_RX_BUFF: usize = RAW_RX_TAIL + 2;

const PADDING_OFFSET: usize = RAW_RX_BUFF + RAW_BUFF_SIZE;
const PADDING_SIZE: usize = 16;

const MBX_AP2CP_OFFSET: usize = PADDING_OFFSET + PADDING_SIZE;
const MBX_CP2AP_OFFSET: usize = MBX_AP2CP_OFFSET + 2;

/// Total footprint of the IPC map.
pub const MAP_SIZE: usize = MBX_CP2AP_OFFSET + 2;

// The map must pack to the window exactly.
const _: () = ::core::assert!(MAP_SIZE == 0x8000);
const _: () = ::core::assert!(MBX_AP2CP_OFFSET == 0x7FFC);

//=============================================================================
// Channels
//=============================================================================

/// The two IPC channels multiplexed over the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelId {
    /// Formatted control messages, 4092-byte buffers.
    Fmt,
    /// Raw payload traffic, 12272-byte buffers.
    Raw,
}

impl ChannelId {
    /// Wire channel index.
    pub const fn id(self) -> u8 {
        match self {
            ChannelId::Fmt => 0,
            ChannelId::Raw => 1,
        }
    }

    /// Byte capacity of each of the channel's two buffers.
    pub const fn capacity(self) -> usize {
        match self {
            ChannelId::Fmt => FMT_BUFF_SIZE,
            ChannelId::Raw => RAW_BUFF_SIZE,
        }
    }

    /// Request-ack bit of this channel in the 16-bit mailbox word.
    pub const fn mask_req_ack(self) -> u16 {
        match self {
            ChannelId::Fmt => 0x0020,
            ChannelId::Raw => 0x0010,
        }
    }

    /// Response-ack bit of this channel in the 16-bit mailbox word.
    pub const fn mask_res_ack(self) -> u16 {
        match self {
            ChannelId::Fmt => 0x0008,
            ChannelId::Raw => 0x0004,
        }
    }

    /// Data-available bit of this channel in the 16-bit mailbox word.
    pub const fn mask_send(self) -> u16 {
        match self {
            ChannelId::Fmt => 0x0002,
            ChannelId::Raw => 0x0001,
        }
    }

    const fn layout(self) -> ChannelLayout {
        match self {
            ChannelId::Fmt => ChannelLayout {
                tx_head: FMT_TX_HEAD,
                tx_tail: FMT_TX_TAIL,
                tx_buff: FMT_TX_BUFF,
                rx_head: FMT_RX_HEAD,
                rx_tail: FMT_RX_TAIL,
                rx_buff: FMT_RX_BUFF,
                capacity: FMT_BUFF_SIZE,
            },
            ChannelId::Raw => ChannelLayout {
                tx_head: RAW_TX_HEAD,
                tx_tail: RAW_TX_TAIL,
                tx_buff: RAW_TX_BUFF,
                rx_head: RAW_RX_HEAD,
                rx_tail: RAW_RX_TAIL,
                rx_buff: RAW_RX_BUFF,
                capacity: RAW_BUFF_SIZE,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ChannelLayout {
    tx_head: usize,
    tx_tail: usize,
    tx_buff: usize,
    rx_head: usize,
    rx_tail: usize,
    rx_buff: usize,
    capacity: usize,
}

/// Cursor and buffer accessors of one channel.
///
/// TX is the AP's sending ring, RX mirrors the CP's. Head/tail values are
/// raw u16 cursors; interpreting them modulo the capacity is up to the link
/// driver. Buffer access is bounded to `[0, capacity)`.
#[derive(Debug, Clone, Copy)]
pub struct ChannelRing {
    region: SharedRegion,
    id: ChannelId,
    layout: ChannelLayout,
}

impl ChannelRing {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.layout.capacity
    }

    pub fn tx_head(&self) -> Result<u16, OutOfBounds> {
        self.region.read_u16(self.layout.tx_head)
    }

    pub fn set_tx_head(&self, value: u16) -> Result<(), OutOfBounds> {
        self.region.write_u16(self.layout.tx_head, value)
    }

    pub fn tx_tail(&self) -> Result<u16, OutOfBounds> {
        self.region.read_u16(self.layout.tx_tail)
    }

    pub fn set_tx_tail(&self, value: u16) -> Result<(), OutOfBounds> {
        self.region.write_u16(self.layout.tx_tail, value)
    }

    pub fn rx_head(&self) -> Result<u16, OutOfBounds> {
        self.region.read_u16(self.layout.rx_head)
    }

    pub fn set_rx_head(&self, value: u16) -> Result<(), OutOfBounds> {
        self.region.write_u16(self.layout.rx_head, value)
    }

    pub fn rx_tail(&self) -> Result<u16, OutOfBounds> {
        self.region.read_u16(self.layout.rx_tail)
    }

    pub fn set_rx_tail(&self, value: u16) -> Result<(), OutOfBounds> {
        self.region.write_u16(self.layout.rx_tail, value)
    }

    /// Copy `src` into the TX buffer at ring offset `at`.
    pub fn write_tx(&self, at: usize, src: &[u8]) -> Result<(), OutOfBounds> {
        self.check(at, src.len())?;
        self.region.write_bytes(self.layout.tx_buff + at, src)
    }

    /// Copy bytes out of the RX buffer at ring offset `at`.
    pub fn read_rx(&self, at: usize, dst: &mut [u8]) -> Result<(), OutOfBounds> {
        self.check(at, dst.len())?;
        self.region.read_bytes(self.layout.rx_buff + at, dst)
    }

    fn check(&self, at: usize, len: usize) -> Result<(), OutOfBounds> {
        match at.checked_add(len) {
            Some(end) if end <= self.layout.capacity => Ok(()),
            _ => Err(OutOfBounds {
                offset: at,
                len,
                size: self.layout.capacity,
            }),
        }
    }
}

//=============================================================================
// The map itself
//=============================================================================

/// IPC overlay on the shared window.
///
/// Holds no state of its own; every accessor goes straight to the window.
#[derive(Debug, Clone, Copy)]
pub struct IpcView {
    region: SharedRegion,
}

impl IpcView {
    /// Overlay the IPC map on a window.
    ///
    /// Fails if the window is smaller than [`MAP_SIZE`].
    pub fn new(region: SharedRegion) -> Result<Self, OutOfBounds> {
        if region.size() < MAP_SIZE {
            return Err(OutOfBounds {
                offset: 0,
                len: MAP_SIZE,
                size: region.size(),
            });
        }
        Ok(Self { region })
    }

    pub fn region(&self) -> SharedRegion {
        self.region
    }

    pub fn magic(&self) -> Result<u16, OutOfBounds> {
        self.region.read_u16(MAGIC_OFFSET)
    }

    pub fn set_magic(&self, value: u16) -> Result<(), OutOfBounds> {
        self.region.write_u16(MAGIC_OFFSET, value)
    }

    pub fn access(&self) -> Result<u16, OutOfBounds> {
        self.region.read_u16(ACCESS_OFFSET)
    }

    pub fn set_access(&self, value: u16) -> Result<(), OutOfBounds> {
        self.region.write_u16(ACCESS_OFFSET, value)
    }

    /// Whether the peer sees a valid, open map.
    pub fn is_ready(&self) -> Result<bool, OutOfBounds> {
        Ok(self.magic()? == MAGIC_CODE && self.access()? == ACCESS_ENABLED)
    }

    /// Descriptor of one channel.
    pub fn channel(&self, id: ChannelId) -> ChannelRing {
        ChannelRing {
            region: self.region,
            id,
            layout: id.layout(),
        }
    }

    pub fn mbx_ap2cp(&self) -> Result<u16, OutOfBounds> {
        self.region.read_u16(MBX_AP2CP_OFFSET)
    }

    pub fn set_mbx_ap2cp(&self, value: u16) -> Result<(), OutOfBounds> {
        self.region.write_u16(MBX_AP2CP_OFFSET, value)
    }

    pub fn mbx_cp2ap(&self) -> Result<u16, OutOfBounds> {
        self.region.read_u16(MBX_CP2AP_OFFSET)
    }

    pub fn set_mbx_cp2ap(&self, value: u16) -> Result<(), OutOfBounds> {
        self.region.write_u16(MBX_CP2AP_OFFSET, value)
    }

    /// Bring the map up: zero every cursor and both mailbox words, then
    /// raise `access` and finally `magic`, so the peer never observes a
    /// valid magic over stale cursors.
    pub fn reset(&self) -> Result<(), OutOfBounds> {
        for id in [ChannelId::Fmt, ChannelId::Raw] {
            let ch = self.channel(id);
            ch.set_tx_head(0)?;
            ch.set_tx_tail(0)?;
            ch.set_rx_head(0)?;
            ch.set_rx_tail(0)?;
        }
        self.set_mbx_ap2cp(0)?;
        self.set_mbx_cp2ap(0)?;
        self.set_access(ACCESS_ENABLED)?;
        self.set_magic(MAGIC_CODE)?;
        debug!("IPC map reset: magic {:#06x}, access {:#06x}", MAGIC_CODE, ACCESS_ENABLED);
        Ok(())
    }
}
