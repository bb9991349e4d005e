// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The GSC command-streamer packet header (MTL layout).
//!
//! Every message exchanged with the GSC engine starts with a [`GscHeader`],
//! followed by a client-specific payload.

use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Value of [`GscHeader::validity_marker`] on every valid packet.
pub const GSC_HEADER_MARKER: u32 = 0xa578875a;
/// Current header version.
pub const GSC_HEADER_VERSION: u16 = 1;
/// Size of the packet buffers shared with the GSC engine.
pub const GSC_BUFFER_SIZE: usize = 16 * 1024;
/// Size of [`GscHeader`].
pub const GSC_HEADER_SIZE: usize = size_of::<GscHeader>();
/// Bits of [`GscHeader::message_size`] holding the size.
pub const GSC_MESSAGE_SIZE_MASK: u32 = 0xf_ffff;

/// Bits of a host session handle that identify the requesting client.
pub const HOST_SESSION_CLIENT_MASK: u64 = 0xf << 60;
/// Client bits for a host session handle owned by the PXP driver.
pub const HOST_SESSION_PXP_SINGLE: u64 = 1 << 60;

open_enum! {
    /// Firmware client addressed by a GSC packet.
    pub enum GscClientId: u8 {
        /// The GSC proxy relay.
        PROXY = 10,
        /// The PXP firmware client.
        PXP = 17,
    }
}

/// Flags of a [`GscHeader`].
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GscHeaderFlags {
    /// Output: the GSC is still processing; resubmit with the returned
    /// message handle.
    pub msg_pending: bool,
    /// Input: release all firmware state for the host session.
    pub session_cleanup: bool,
    #[bits(30)]
    _rsvd: u32,
}

/// Header of a GSC command-streamer packet.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, FromBytes)]
pub struct GscHeader {
    /// Always [`GSC_HEADER_MARKER`].
    pub validity_marker: u32,
    /// Destination firmware client.
    pub client_id: GscClientId,
    /// Must be zero.
    pub reserved1: u8,
    /// Always [`GSC_HEADER_VERSION`].
    pub header_version: u16,
    /// Identifies the host-side session the firmware keeps state for.
    pub host_session_handle: u64,
    /// Firmware-assigned handle used to resume a pending exchange.
    pub message_handle: u64,
    /// Total message size including this header.
    pub message_size: u32,
    /// Pending and cleanup flags.
    pub flags: GscHeaderFlags,
    /// Non-zero if the GSC rejected the packet.
    pub status: u32,
}

const_assert_eq!(size_of::<GscHeader>(), 36);

impl GscHeader {
    /// Builds the header for an outgoing packet carrying `payload_len` bytes.
    pub fn new(client_id: GscClientId, host_session_handle: u64, payload_len: usize) -> Self {
        Self {
            validity_marker: GSC_HEADER_MARKER,
            client_id,
            reserved1: 0,
            header_version: GSC_HEADER_VERSION,
            host_session_handle,
            message_handle: 0,
            message_size: (GSC_HEADER_SIZE + payload_len) as u32 & GSC_MESSAGE_SIZE_MASK,
            flags: GscHeaderFlags::new(),
            status: 0,
        }
    }

    /// The message size, with the reserved upper bits masked off.
    pub fn size(&self) -> usize {
        (self.message_size & GSC_MESSAGE_SIZE_MASK) as usize
    }
}
