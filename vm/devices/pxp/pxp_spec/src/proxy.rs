// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The GSC proxy relay protocol.
//!
//! The GSC cannot reach the CSME directly. Instead it sends relay messages to
//! the host driver, which forwards them verbatim to the CSME and returns the
//! CSME's reply, until the GSC sends an [`ProxyMsgType::END`] message.

#![expect(missing_docs)] // constants are self-explanatory

use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Size of [`ProxyHeader`].
pub const PROXY_HEADER_SIZE: usize = size_of::<ProxyHeader>();

open_enum! {
    /// Relay message type.
    pub enum ProxyMsgType: u16 {
        INVALID = 0,
        QUERY = 1,
        PAYLOAD = 2,
        END = 3,
        NOTIFICATION = 4,
    }
}

open_enum! {
    /// A relay endpoint.
    pub enum ProxyAddress: u32 {
        /// The host driver.
        KMD = 0x10000,
        GSC = 0x20000,
        CSME = 0x30000,
    }
}

/// First dword of a [`ProxyHeader`].
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ProxyHdr {
    /// A [`ProxyMsgType`].
    #[bits(16)]
    pub msg_type: u16,
    /// Bytes following the header.
    #[bits(16)]
    pub payload_length: u16,
}

/// Header of a relay message.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ProxyHeader {
    /// Type and payload length.
    pub hdr: ProxyHdr,
    /// Sending endpoint.
    pub source: ProxyAddress,
    /// Receiving endpoint.
    pub destination: ProxyAddress,
    /// Non-zero on failure.
    pub status: u32,
}

const_assert_eq!(size_of::<ProxyHeader>(), 16);

impl ProxyHeader {
    /// Builds a header.
    pub fn new(
        msg_type: ProxyMsgType,
        source: ProxyAddress,
        destination: ProxyAddress,
        payload_length: u16,
    ) -> Self {
        Self {
            hdr: ProxyHdr::new()
                .with_msg_type(msg_type.0)
                .with_payload_length(payload_length),
            source,
            destination,
            status: 0,
        }
    }

    /// The query that opens a relay exchange.
    pub fn query() -> Self {
        Self::new(ProxyMsgType::QUERY, ProxyAddress::KMD, ProxyAddress::GSC, 0)
    }

    /// The message type.
    pub fn msg_type(&self) -> ProxyMsgType {
        ProxyMsgType(self.hdr.msg_type())
    }

    /// The payload length.
    pub fn payload_length(&self) -> usize {
        self.hdr.payload_length().into()
    }

    /// Header plus payload length.
    pub fn message_size(&self) -> usize {
        PROXY_HEADER_SIZE + self.payload_length()
    }
}
