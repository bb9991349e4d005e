// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PXP firmware commands, API version 4.3.

use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// `api_version` value for PXP 4.3.
pub const PXP_APIVER_4_3: u32 = (4 << 16) | 3;

open_enum! {
    /// Firmware command identifier.
    pub enum PxpCommandId: u32 {
        /// Invalidate the key of a stream (ends a session's firmware state).
        INVALIDATE_STREAM_KEY = 0x07,
        /// Create a session.
        INIT_SESSION = 0x36,
    }
}

open_enum! {
    /// Firmware completion status.
    pub enum PxpFwStatus: u32 {
        /// Command completed.
        SUCCESS = 0,
        /// Command rejected for an unsupported API version.
        ERROR_API_VERSION = 0x1003,
        /// Firmware is still starting up; retry later.
        NOT_READY = 0x100e,
        /// The platform configuration does not permit PXP.
        PLATFCONFIG_KF1_NOVERIF = 0x101a,
        /// The platform configuration does not permit PXP.
        PLATFCONFIG_KF1_BAD = 0x101f,
    }
}

open_enum! {
    /// Protection mode requested by `INIT_SESSION`.
    pub enum PxpProtectionMode: u32 {
        /// Arbitration session for display.
        ARB = 2,
    }
}

/// Header of every firmware command and reply.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PxpCmdHeader {
    /// Always [`PXP_APIVER_4_3`].
    pub api_version: u32,
    /// The command.
    pub command_id: PxpCommandId,
    /// `stream_id` on input for stream commands, [`PxpFwStatus`] on output.
    pub status_or_stream_id: u32,
    /// Bytes following the header.
    pub buffer_len: u32,
}

const_assert_eq!(size_of::<PxpCmdHeader>(), 16);

impl PxpCmdHeader {
    /// Builds the header for a command with a `body_len` byte body.
    pub fn new(command_id: PxpCommandId, body_len: usize) -> Self {
        Self {
            api_version: PXP_APIVER_4_3,
            command_id,
            status_or_stream_id: 0,
            buffer_len: body_len as u32,
        }
    }

    /// The completion status of a reply.
    pub fn status(&self) -> PxpFwStatus {
        PxpFwStatus(self.status_or_stream_id)
    }
}

/// Stream identifier carried by stream commands.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PxpStreamId {
    /// The stream id is valid.
    pub valid: bool,
    /// Application type (0 display, 1 transcode).
    pub app_type: bool,
    /// The session slot.
    #[bits(16)]
    pub session_id: u16,
    #[bits(14)]
    _rsvd: u16,
}

/// `INIT_SESSION` input body.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct InitSessionIn {
    /// Requested protection mode.
    pub protection_mode: PxpProtectionMode,
    /// Session slot to start.
    pub session_id: u32,
}

/// `INIT_SESSION` command.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct InitSessionCmd {
    /// Command header.
    pub header: PxpCmdHeader,
    /// Command body.
    pub body: InitSessionIn,
}

impl InitSessionCmd {
    /// Builds an arbitration `INIT_SESSION` for `session_id`.
    pub fn arb(session_id: u8) -> Self {
        Self {
            header: PxpCmdHeader::new(PxpCommandId::INIT_SESSION, size_of::<InitSessionIn>()),
            body: InitSessionIn {
                protection_mode: PxpProtectionMode::ARB,
                session_id: session_id.into(),
            },
        }
    }
}

/// `INVALIDATE_STREAM_KEY` command. The body is reserved.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct InvalidateStreamKeyCmd {
    /// Command header, with the stream id in `status_or_stream_id`.
    pub header: PxpCmdHeader,
    /// Must be zero.
    pub rsvd: [u32; 3],
}

impl InvalidateStreamKeyCmd {
    /// Builds the command invalidating the display stream of `session_id`.
    pub fn new(session_id: u8) -> Self {
        let mut header = PxpCmdHeader::new(PxpCommandId::INVALIDATE_STREAM_KEY, 12);
        header.status_or_stream_id = PxpStreamId::new()
            .with_valid(true)
            .with_session_id(session_id.into())
            .into_bits();
        Self {
            header,
            rsvd: [0; 3],
        }
    }
}

/// Reply to either command: a header with the completion status.
pub type PxpCmdReply = PxpCmdHeader;
