// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The session tag handed to callers.

use crate::ioctl::PxpSessionMode;
use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Identifies one incarnation of a session slot. A zero tag means no
/// session.
#[bitfield(u32)]
#[derive(PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PxpTag {
    /// The session slot.
    #[bits(7)]
    pub session_id: u8,
    #[bits(9)]
    _rsvd: u16,
    /// Rolling per-slot instance counter, never zero.
    #[bits(8)]
    pub instance_id: u8,
    #[bits(5)]
    _rsvd2: u8,
    /// Stout mode.
    pub sm: bool,
    /// Heavy mode.
    pub hm: bool,
    /// The tag refers to an allocated session.
    pub enabled: bool,
}

impl PxpTag {
    /// The tag meaning "no session".
    pub const NONE: Self = Self::new();

    /// Builds the tag for `session_id` in `mode`.
    pub fn for_session(session_id: u8, instance_id: u8, mode: PxpSessionMode) -> Self {
        Self::new()
            .with_session_id(session_id)
            .with_instance_id(instance_id)
            .with_hm(mode == PxpSessionMode::HM)
            .with_sm(mode == PxpSessionMode::SM)
            .with_enabled(true)
    }

    /// The protection mode encoded in the tag.
    pub fn mode(&self) -> PxpSessionMode {
        if self.hm() {
            PxpSessionMode::HM
        } else if self.sm() {
            PxpSessionMode::SM
        } else {
            PxpSessionMode::LM
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fw::InvalidateStreamKeyCmd;

    #[test]
    fn tag_layout() {
        let tag = PxpTag::for_session(3, 1, PxpSessionMode::HM);
        assert_eq!(tag.into_bits(), 0xc001_0003);
        assert_eq!(tag.mode(), PxpSessionMode::HM);

        let tag = PxpTag::for_session(15, 0xff, PxpSessionMode::LM);
        assert_eq!(tag.into_bits(), 0x80ff_000f);
        assert_eq!(PxpTag::NONE.into_bits(), 0);
    }

    #[test]
    fn stream_id_layout() {
        let cmd = InvalidateStreamKeyCmd::new(5);
        assert_eq!(cmd.header.status_or_stream_id, 0x15);
        assert_eq!(cmd.header.buffer_len, 12);
    }
}
