//! Per-edge frame acceptance filters.

use crate::frame::{CanFrameHeader, FrameFlags};
use serde::Deserialize;

/// Whether a filter hit accepts or rejects the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterPolarity {
    #[default]
    Accept,
    Reject,
}

/// Mask/value filter over the identifier and header flags.
///
/// A frame hits the filter when the identifier bits selected by `id_mask`
/// equal those of `id`, and the flag bits selected by `flags_mask` equal
/// those of `flags`. `polarity` decides whether a hit means acceptance.
/// The default filter has empty masks and accepts everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct CanFilter {
    #[serde(default)]
    pub id: u32,
    #[serde(default)]
    pub id_mask: u32,
    #[serde(default)]
    pub flags: u16,
    #[serde(default)]
    pub flags_mask: u16,
    #[serde(default)]
    pub polarity: FilterPolarity,
}

impl CanFilter {
    /// Filter that accepts every frame.
    pub const fn accept_all() -> Self {
        Self {
            id: 0,
            id_mask: 0,
            flags: 0,
            flags_mask: 0,
            polarity: FilterPolarity::Accept,
        }
    }

    /// Filter accepting identifiers equal to `id` in the bits of `id_mask`.
    pub const fn with_mask(id: u32, id_mask: u32) -> Self {
        Self {
            id,
            id_mask,
            flags: 0,
            flags_mask: 0,
            polarity: FilterPolarity::Accept,
        }
    }

    /// Additionally constrain the header flags.
    pub fn with_flags(mut self, flags: FrameFlags, flags_mask: FrameFlags) -> Self {
        self.flags = flags.bits();
        self.flags_mask = flags_mask.bits();
        self
    }

    /// Invert the filter.
    pub fn rejecting(mut self) -> Self {
        self.polarity = FilterPolarity::Reject;
        self
    }

    /// An empty identifier mask makes the edge a catch-all; edges with an
    /// explicit mask are preferred by priority selection.
    pub fn is_catch_all(&self) -> bool {
        self.id_mask == 0
    }

    /// True when the filter explicitly selects echoed frames.
    pub fn wants_echo(&self) -> bool {
        let echo = FrameFlags::ECHO.bits();
        self.polarity == FilterPolarity::Accept
            && self.flags_mask & echo != 0
            && self.flags & echo != 0
    }

    pub fn matches(&self, can_id: u32, flags: FrameFlags) -> bool {
        let hit = ((can_id ^ self.id) & self.id_mask) == 0
            && ((flags.bits() ^ self.flags) & self.flags_mask) == 0;
        match self.polarity {
            FilterPolarity::Accept => hit,
            FilterPolarity::Reject => !hit,
        }
    }

    pub fn matches_header(&self, header: &CanFrameHeader) -> bool {
        self.matches(header.can_id, header.flags)
    }
}
