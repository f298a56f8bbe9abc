//! CAN frame representation carried through the queues.
//!
//! The queue core treats payload bytes as opaque. Only the header fields
//! (identifier and flags) take part in filtering.

use bitflags::bitflags;
use std::fmt;

/// Maximum payload of a classic CAN frame.
pub const CAN_FRAME_STANDARD_DLEN: usize = 8;
/// Maximum payload of a CAN FD frame.
pub const CAN_FRAME_FD_DLEN: usize = 64;
/// Size of the payload buffer every slot reserves.
pub const CAN_FRAME_MAX_DLEN: usize = CAN_FRAME_FD_DLEN;

/// Valid identifier bits of a standard (11-bit) frame.
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
/// Valid identifier bits of an extended (29-bit) frame.
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;
/// Or-ed into the identifier of error frames so they never look like
/// regular traffic.
pub const CAN_ERR_ID_TAG: u32 = 0x8000_0000;

bitflags! {
    /// Frame header flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u16 {
        /// 29-bit extended identifier
        const IDE = 1 << 0;
        /// Remote transmission request
        const RTR = 1 << 1;
        /// Frame returned to the ends that sent it
        const ECHO = 1 << 2;
        /// Frame originated on this node
        const LOCAL = 1 << 3;
        /// Transmission of the frame failed
        const TXERR = 1 << 4;
        /// Error frame generated by the controller
        const ERR = 1 << 5;
        /// Frames were lost before this one
        const FIFO_OVERFLOW = 1 << 6;
        /// CAN FD format
        const FDF = 1 << 7;
        /// CAN FD bit rate switch
        const BRS = 1 << 8;
        /// CAN FD error state indicator
        const ESI = 1 << 9;
    }
}

/// Frame header: identifier, flags and payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CanFrameHeader {
    /// Reception or transmission timestamp in microseconds.
    pub timestamp: u64,
    /// Arbitration identifier (11 or 29 bits, plus [`CAN_ERR_ID_TAG`]).
    pub can_id: u32,
    /// Header flags.
    pub flags: FrameFlags,
    /// Number of valid payload bytes.
    pub dlen: u16,
}

impl CanFrameHeader {
    /// Header with the given identifier; `IDE` is set when the identifier
    /// does not fit into 11 bits.
    pub fn with_id(can_id: u32) -> Self {
        let mut flags = FrameFlags::empty();
        if can_id & !CAN_SFF_MASK != 0 {
            flags |= FrameFlags::IDE;
        }
        Self {
            timestamp: 0,
            can_id,
            flags,
            dlen: 0,
        }
    }
}

/// A CAN or CAN FD frame: header plus up to 64 payload bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    /// Frame header.
    pub header: CanFrameHeader,
    /// Payload storage; only the first `header.dlen` bytes are meaningful.
    pub data: [u8; CAN_FRAME_MAX_DLEN],
}

impl Default for CanFrame {
    fn default() -> Self {
        Self {
            header: CanFrameHeader::default(),
            data: [0u8; CAN_FRAME_MAX_DLEN],
        }
    }
}

impl CanFrame {
    /// Creates a data frame. Identifiers above 11 bits select the extended
    /// format, payloads above 8 bytes select CAN FD.
    ///
    /// Returns `None` when the identifier exceeds 29 bits or the payload
    /// exceeds 64 bytes.
    pub fn new(can_id: u32, data: &[u8]) -> Option<Self> {
        if can_id & !CAN_EFF_MASK != 0 || data.len() > CAN_FRAME_MAX_DLEN {
            return None;
        }
        let mut header = CanFrameHeader::with_id(can_id);
        if data.len() > CAN_FRAME_STANDARD_DLEN {
            header.flags |= FrameFlags::FDF;
        }
        header.dlen = data.len() as u16;

        let mut frame = Self {
            header,
            ..Self::default()
        };
        frame.data[..data.len()].copy_from_slice(data);
        Some(frame)
    }

    /// Creates a remote transmission request with the given length code.
    pub fn new_remote(can_id: u32, dlen: usize) -> Option<Self> {
        if can_id & !CAN_EFF_MASK != 0 || dlen > CAN_FRAME_STANDARD_DLEN {
            return None;
        }
        let mut header = CanFrameHeader::with_id(can_id);
        header.flags |= FrameFlags::RTR;
        header.dlen = dlen as u16;
        Some(Self {
            header,
            ..Self::default()
        })
    }

    /// Arbitration identifier.
    pub fn id(&self) -> u32 {
        self.header.can_id
    }

    /// Header flags.
    pub fn flags(&self) -> FrameFlags {
        self.header.flags
    }

    /// Number of payload bytes.
    pub fn dlen(&self) -> usize {
        usize::from(self.header.dlen)
    }

    /// Valid payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.dlen().min(CAN_FRAME_MAX_DLEN)]
    }

    pub fn is_extended(&self) -> bool {
        self.header.flags.contains(FrameFlags::IDE)
    }

    pub fn is_remote(&self) -> bool {
        self.header.flags.contains(FrameFlags::RTR)
    }

    pub fn is_error(&self) -> bool {
        self.header.flags.contains(FrameFlags::ERR)
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanFrame")
            .field("can_id", &format_args!("{:#x}", self.header.can_id))
            .field("flags", &self.header.flags)
            .field("timestamp", &self.header.timestamp)
            .field("data", &self.payload())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_frame() {
        let frame = CanFrame::new(0x123, &[1, 2, 3]).expect("valid frame");
        assert_eq!(frame.id(), 0x123);
        assert_eq!(frame.payload(), &[1, 2, 3]);
        assert!(!frame.is_extended());
        assert!(!frame.flags().contains(FrameFlags::FDF));
    }

    #[test]
    fn test_extended_and_fd_selection() {
        let frame = CanFrame::new(0x18DA_F110, &[0u8; 12]).expect("valid frame");
        assert!(frame.is_extended());
        assert!(frame.flags().contains(FrameFlags::FDF));
        assert_eq!(frame.dlen(), 12);
    }

    #[test]
    fn test_rejects_out_of_range() {
        assert!(CanFrame::new(0x2000_0000, &[]).is_none());
        assert!(CanFrame::new(0x1, &[0u8; 65]).is_none());
        assert!(CanFrame::new_remote(0x1, 9).is_none());
    }

    #[test]
    fn test_remote_frame() {
        let frame = CanFrame::new_remote(0x7FF, 4).expect("valid frame");
        assert!(frame.is_remote());
        assert_eq!(frame.dlen(), 4);
        assert!(frame.payload().iter().all(|b| *b == 0));
    }
}
