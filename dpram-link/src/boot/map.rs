//! Boot-phase overlay of the shared window.
//!
//! During firmware transfer the window holds one frame at a time: the
//! payload starts at offset 0 and three little-endian control words sit in
//! fixed slots at the top of the window, outside the payload area. The
//! sender fills payload and control words, then raises the matching mailbox
//! command; the receiver reads them only after observing that command.

use crate::region::SharedRegion;

use super::BootError;

/// Largest payload one frame may carry, in bytes.
pub const FRAME_SIZE_LIMIT: usize = 0x7C00;

/// Window size this layout is defined for.
pub const WINDOW_SIZE: usize = 0x8000;

/// Offset of the `frame_size` control word.
pub const FRAME_SIZE_OFFSET: usize = 0x7FF6;
/// Offset of the `tag` control word.
pub const TAG_OFFSET: usize = 0x7FF8;
/// Offset of the `count` control word.
pub const COUNT_OFFSET: usize = 0x7FFA;

// The control slots never overlap the payload area and fit in the window.
const _: () = ::core::assert!(FRAME_SIZE_LIMIT <= FRAME_SIZE_OFFSET);
const _: () = ::core::assert!(FRAME_SIZE_OFFSET + 2 <= TAG_OFFSET);
const _: () = ::core::assert!(TAG_OFFSET + 2 <= COUNT_OFFSET);
const _: () = ::core::assert!(COUNT_OFFSET + 2 <= WINDOW_SIZE);

/// Control words of the frame currently parked in the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FrameHeader {
    pub frame_size: u16,
    pub tag: u16,
    pub count: u16,
}

/// Boot-phase view over a [`SharedRegion`].
#[derive(Debug, Clone, Copy)]
pub struct BootView {
    region: SharedRegion,
}

impl BootView {
    /// Overlay the boot layout on `region`.
    ///
    /// The region must be at least [`WINDOW_SIZE`] bytes.
    pub fn new(region: SharedRegion) -> Result<Self, BootError> {
        if region.size() < WINDOW_SIZE {
            return Err(BootError::Region(crate::region::OutOfBounds {
                offset: 0,
                len: WINDOW_SIZE,
                size: region.size(),
            }));
        }
        Ok(Self { region })
    }

    /// Park one frame in the window: payload plus control words.
    ///
    /// Rejects payloads over [`FRAME_SIZE_LIMIT`] before any window write.
    pub fn write_frame(&self, payload: &[u8], tag: u16, count: u16) -> Result<(), BootError> {
        if payload.len() > FRAME_SIZE_LIMIT {
            error!(
                "frame payload too large: {} bytes (limit {})",
                payload.len(),
                FRAME_SIZE_LIMIT
            );
            return Err(BootError::ChunkSizeExceeded {
                size: payload.len(),
                limit: FRAME_SIZE_LIMIT,
            });
        }

        self.region.write_bytes(0, payload)?;
        self.region.write_u16(FRAME_SIZE_OFFSET, payload.len() as u16)?;
        self.region.write_u16(TAG_OFFSET, tag)?;
        self.region.write_u16(COUNT_OFFSET, count)?;
        Ok(())
    }

    /// Read the control words of the parked frame.
    pub fn read_header(&self) -> Result<FrameHeader, BootError> {
        Ok(FrameHeader {
            frame_size: self.region.read_u16(FRAME_SIZE_OFFSET)?,
            tag: self.region.read_u16(TAG_OFFSET)?,
            count: self.region.read_u16(COUNT_OFFSET)?,
        })
    }

    /// Copy the parked frame's first `len` payload bytes into `dst`.
    ///
    /// `len` normally comes from [`read_header`](Self::read_header); a value
    /// over [`FRAME_SIZE_LIMIT`] means the control words are corrupt and is
    /// rejected without touching the payload.
    pub fn read_payload(&self, len: usize, dst: &mut [u8]) -> Result<(), BootError> {
        if len > FRAME_SIZE_LIMIT {
            error!(
                "announced frame size {} exceeds limit {}",
                len, FRAME_SIZE_LIMIT
            );
            return Err(BootError::ChunkSizeExceeded {
                size: len,
                limit: FRAME_SIZE_LIMIT,
            });
        }
        if dst.len() < len {
            return Err(BootError::BufferTooSmall {
                needed: len,
                capacity: dst.len(),
            });
        }
        self.region.read_bytes(0, &mut dst[..len])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::SpeedClass;

    fn window(buf: &mut Vec<u8>) -> BootView {
        let region = SharedRegion::new(buf.as_mut_ptr() as usize, buf.len(), SpeedClass::Low);
        BootView::new(region).unwrap()
    }

    #[test]
    fn control_slots_sit_above_the_payload() {
        assert_eq!(FRAME_SIZE_LIMIT, 31744);
        assert_eq!(FRAME_SIZE_OFFSET, 0x7FF6);
        assert_eq!(TAG_OFFSET, 0x7FF8);
        assert_eq!(COUNT_OFFSET, 0x7FFA);
        assert!(FRAME_SIZE_LIMIT <= FRAME_SIZE_OFFSET);
    }

    #[test]
    fn frame_round_trips_through_the_window() {
        let mut buf = vec![0u8; WINDOW_SIZE];
        let view = window(&mut buf);

        let payload: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        view.write_frame(&payload, 0x0060, 7).unwrap();

        let hdr = view.read_header().unwrap();
        assert_eq!(
            hdr,
            FrameHeader {
                frame_size: 1000,
                tag: 0x0060,
                count: 7
            }
        );

        let mut out = vec![0u8; hdr.frame_size as usize];
        view.read_payload(hdr.frame_size as usize, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn control_words_are_little_endian_at_fixed_offsets() {
        let mut buf = vec![0u8; WINDOW_SIZE];
        let view = window(&mut buf);

        view.write_frame(&[0xAA; 4], 0xBEEF, 0x0102).unwrap();
        assert_eq!(buf[0x7FF6], 0x04);
        assert_eq!(buf[0x7FF7], 0x00);
        assert_eq!(buf[0x7FF8], 0xEF);
        assert_eq!(buf[0x7FF9], 0xBE);
        assert_eq!(buf[0x7FFA], 0x02);
        assert_eq!(buf[0x7FFB], 0x01);
    }

    #[test]
    fn oversized_frame_rejected_before_any_write() {
        let mut buf = vec![0u8; WINDOW_SIZE];
        let view = window(&mut buf);

        let payload = vec![0xFFu8; FRAME_SIZE_LIMIT + 1];
        let err = view.write_frame(&payload, 1, 1).unwrap_err();
        assert_eq!(
            err,
            BootError::ChunkSizeExceeded {
                size: FRAME_SIZE_LIMIT + 1,
                limit: FRAME_SIZE_LIMIT
            }
        );
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn full_limit_frame_is_accepted() {
        let mut buf = vec![0u8; WINDOW_SIZE];
        let view = window(&mut buf);

        let payload = vec![0x5Au8; FRAME_SIZE_LIMIT];
        view.write_frame(&payload, 2, 3).unwrap();
        assert_eq!(view.read_header().unwrap().frame_size as usize, FRAME_SIZE_LIMIT);
        assert_eq!(buf[FRAME_SIZE_LIMIT - 1], 0x5A);
    }

    #[test]
    fn corrupt_announced_size_is_rejected() {
        let mut buf = vec![0u8; WINDOW_SIZE];
        let view = window(&mut buf);

        let mut dst = vec![0u8; WINDOW_SIZE];
        let err = view.read_payload(FRAME_SIZE_LIMIT + 1, &mut dst).unwrap_err();
        assert!(matches!(err, BootError::ChunkSizeExceeded { .. }));
    }

    #[test]
    fn undersized_destination_is_rejected() {
        let mut buf = vec![0u8; WINDOW_SIZE];
        let view = window(&mut buf);

        let mut dst = [0u8; 50];
        let err = view.read_payload(100, &mut dst).unwrap_err();
        assert_eq!(
            err,
            BootError::BufferTooSmall {
                needed: 100,
                capacity: 50
            }
        );
    }

    #[test]
    fn short_region_is_rejected() {
        let mut buf = vec![0u8; WINDOW_SIZE - 1];
        let region = SharedRegion::new(buf.as_mut_ptr() as usize, buf.len(), SpeedClass::Low);
        assert!(BootView::new(region).is_err());
    }
}
