// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Packing and validation of GSC packet headers and proxy relay headers.

use pxp_backing::memory::DmaBuffer;
use pxp_spec::gsc::GSC_HEADER_MARKER;
use pxp_spec::gsc::GSC_HEADER_SIZE;
use pxp_spec::gsc::GscClientId;
use pxp_spec::gsc::GscHeader;
use pxp_spec::gsc::GscHeaderFlags;
use pxp_spec::proxy::PROXY_HEADER_SIZE;
use pxp_spec::proxy::ProxyAddress;
use pxp_spec::proxy::ProxyHeader;
use pxp_spec::proxy::ProxyMsgType;
use thiserror::Error;

/// A malformed GSC packet or relay message.
#[derive(Debug, Error)]
#[expect(missing_docs)] // fields are described by the error messages
pub enum CodecError {
    /// The packet does not start with the validity marker.
    #[error("invalid validity marker {0:#x}")]
    BadMarker(u32),
    /// The reply came from a different firmware client.
    #[error("reply addressed to client {actual:?}, expected {expected:?}")]
    BadClient {
        expected: GscClientId,
        actual: GscClientId,
    },
    /// The GSC rejected the packet.
    #[error("gsc rejected the packet with status {0:#x}")]
    GscStatus(u32),
    /// The message is shorter than its header and mandatory payload.
    #[error("message size {size} is smaller than {min}")]
    TooSmall { size: usize, min: usize },
    /// The message does not fit in the buffer.
    #[error("message size {size} exceeds {capacity}")]
    TooBig { size: usize, capacity: usize },
    /// A relay message was not on the expected hop. Never retried.
    #[error("relay message routed {from:?} -> {to:?}, expected {expected_from:?} -> {expected_to:?}")]
    Misrouted {
        from: ProxyAddress,
        to: ProxyAddress,
        expected_from: ProxyAddress,
        expected_to: ProxyAddress,
    },
    /// A relay payload runs past the received data.
    #[error("relay payload of {length} bytes exceeds {max}")]
    PayloadTooBig { length: usize, max: usize },
    /// A relay message to the driver carries a failure status.
    #[error("relay message to the driver reports status {0:#x}")]
    DriverStatus(u32),
    /// An invalid relay message type, or a payload message without payload.
    #[error("invalid relay message type {0:?}")]
    BadType(ProxyMsgType),
}

/// Writes the header of an outgoing packet carrying `payload_len` bytes and
/// returns the total packet size.
pub(crate) fn emit_header(
    buf: &DmaBuffer,
    client_id: GscClientId,
    host_session_handle: u64,
    payload_len: usize,
    cleanup: bool,
) -> Result<usize, CodecError> {
    let size = GSC_HEADER_SIZE + payload_len;
    if size > buf.len() {
        return Err(CodecError::TooBig {
            size,
            capacity: buf.len(),
        });
    }
    let mut header = GscHeader::new(client_id, host_session_handle, payload_len);
    header.flags = GscHeaderFlags::new().with_session_cleanup(cleanup);
    buf.write_obj(0, &header);
    Ok(size)
}

/// Zeroes the reply header so a new reply can be detected.
pub(crate) fn clear_header(buf: &DmaBuffer) {
    buf.fill_at(0, 0, GSC_HEADER_SIZE);
}

/// Returns true once the engine has written a reply.
pub(crate) fn reply_present(buf: &DmaBuffer) -> bool {
    buf.read_obj::<u32>(0) != 0
}

/// If `reply` is flagged pending, copies its message handle into the request
/// header in `request` so the resubmission resumes the same exchange, and
/// returns true.
pub(crate) fn check_and_update_pending(request: &DmaBuffer, reply: &GscHeader) -> bool {
    let flags = reply.flags;
    if !flags.msg_pending() {
        return false;
    }
    let mut header: GscHeader = request.read_obj(0);
    header.message_handle = reply.message_handle;
    request.write_obj(0, &header);
    true
}

/// Validates a reply header and returns the payload size.
pub(crate) fn read_out_header(
    header: &GscHeader,
    expected_client: GscClientId,
    min_payload: usize,
    capacity: usize,
) -> Result<usize, CodecError> {
    let marker = header.validity_marker;
    if marker != GSC_HEADER_MARKER {
        return Err(CodecError::BadMarker(marker));
    }
    if header.client_id != expected_client {
        return Err(CodecError::BadClient {
            expected: expected_client,
            actual: header.client_id,
        });
    }
    let status = header.status;
    if status != 0 {
        return Err(CodecError::GscStatus(status));
    }
    let size = header.size();
    let min = GSC_HEADER_SIZE + min_payload;
    if size < min {
        return Err(CodecError::TooSmall { size, min });
    }
    if size > capacity {
        return Err(CodecError::TooBig { size, capacity });
    }
    Ok(size - GSC_HEADER_SIZE)
}

/// Validates a relay header against the hop it is expected on. `max_size` is
/// the number of bytes available for the header and its payload.
pub(crate) fn validate_proxy_header(
    header: &ProxyHeader,
    from: ProxyAddress,
    to: ProxyAddress,
    max_size: usize,
) -> Result<(), CodecError> {
    if header.source != from || header.destination != to {
        return Err(CodecError::Misrouted {
            from: header.source,
            to: header.destination,
            expected_from: from,
            expected_to: to,
        });
    }
    let length = header.payload_length();
    if length + PROXY_HEADER_SIZE > max_size {
        return Err(CodecError::PayloadTooBig {
            length,
            max: max_size.saturating_sub(PROXY_HEADER_SIZE),
        });
    }
    // Only messages to the driver carry a meaningful status.
    if to == ProxyAddress::KMD && header.status != 0 {
        return Err(CodecError::DriverStatus(header.status));
    }
    match header.msg_type() {
        ProxyMsgType::INVALID => Err(CodecError::BadType(ProxyMsgType::INVALID)),
        ProxyMsgType::PAYLOAD if length == 0 => Err(CodecError::BadType(ProxyMsgType::PAYLOAD)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pxp_spec::gsc::GSC_BUFFER_SIZE;
    use test_log::test;

    fn reply(size: usize) -> GscHeader {
        GscHeader::new(GscClientId::PXP, 0x1234, size - GSC_HEADER_SIZE)
    }

    #[test]
    fn emit_header_fills_fields() {
        let buf = DmaBuffer::new(0, GSC_BUFFER_SIZE);
        let size = emit_header(&buf, GscClientId::PROXY, 0x55, 16, true).unwrap();
        assert_eq!(size, GSC_HEADER_SIZE + 16);
        let header: GscHeader = buf.read_obj(0);
        assert_eq!({ header.validity_marker }, GSC_HEADER_MARKER);
        assert_eq!(header.client_id, GscClientId::PROXY);
        assert_eq!({ header.header_version }, 1);
        assert_eq!({ header.host_session_handle }, 0x55);
        assert_eq!(header.size(), GSC_HEADER_SIZE + 16);
        assert!({ header.flags }.session_cleanup());

        assert!(matches!(
            emit_header(&buf, GscClientId::PXP, 0, GSC_BUFFER_SIZE, false),
            Err(CodecError::TooBig { .. })
        ));
    }

    #[test]
    fn pending_copies_message_handle() {
        let request = DmaBuffer::new(0, GSC_BUFFER_SIZE);
        emit_header(&request, GscClientId::PXP, 7, 0, false).unwrap();

        let mut pending = reply(GSC_HEADER_SIZE);
        pending.message_handle = 0xabcd;
        assert!(!check_and_update_pending(&request, &pending));

        pending.flags = GscHeaderFlags::new().with_msg_pending(true);
        assert!(check_and_update_pending(&request, &pending));
        let header: GscHeader = request.read_obj(0);
        assert_eq!({ header.message_handle }, 0xabcd);
        assert_eq!({ header.host_session_handle }, 7);
    }

    #[test]
    fn reply_header_validation() {
        let ok = reply(GSC_HEADER_SIZE + 16);
        assert_eq!(
            read_out_header(&ok, GscClientId::PXP, 16, GSC_BUFFER_SIZE).unwrap(),
            16
        );

        let mut bad = ok;
        bad.validity_marker = 0;
        assert!(matches!(
            read_out_header(&bad, GscClientId::PXP, 0, GSC_BUFFER_SIZE),
            Err(CodecError::BadMarker(0))
        ));

        let mut bad = ok;
        bad.status = 5;
        assert!(matches!(
            read_out_header(&bad, GscClientId::PXP, 0, GSC_BUFFER_SIZE),
            Err(CodecError::GscStatus(5))
        ));

        assert!(matches!(
            read_out_header(&ok, GscClientId::PXP, 32, GSC_BUFFER_SIZE),
            Err(CodecError::TooSmall { .. })
        ));
        assert!(matches!(
            read_out_header(&ok, GscClientId::PROXY, 0, GSC_BUFFER_SIZE),
            Err(CodecError::BadClient { .. })
        ));
        assert!(matches!(
            read_out_header(&ok, GscClientId::PXP, 0, GSC_HEADER_SIZE + 8),
            Err(CodecError::TooBig { .. })
        ));
    }

    #[test]
    fn proxy_header_validation() {
        let payload = ProxyHeader::new(
            ProxyMsgType::PAYLOAD,
            ProxyAddress::GSC,
            ProxyAddress::CSME,
            8,
        );
        validate_proxy_header(&payload, ProxyAddress::GSC, ProxyAddress::CSME, 24).unwrap();

        assert!(matches!(
            validate_proxy_header(&payload, ProxyAddress::CSME, ProxyAddress::GSC, 24),
            Err(CodecError::Misrouted { .. })
        ));
        assert!(matches!(
            validate_proxy_header(&payload, ProxyAddress::GSC, ProxyAddress::CSME, 23),
            Err(CodecError::PayloadTooBig { length: 8, .. })
        ));

        let empty = ProxyHeader::new(
            ProxyMsgType::PAYLOAD,
            ProxyAddress::GSC,
            ProxyAddress::CSME,
            0,
        );
        assert!(matches!(
            validate_proxy_header(&empty, ProxyAddress::GSC, ProxyAddress::CSME, 16),
            Err(CodecError::BadType(ProxyMsgType::PAYLOAD))
        ));

        let mut end = ProxyHeader::new(ProxyMsgType::END, ProxyAddress::GSC, ProxyAddress::KMD, 0);
        validate_proxy_header(&end, ProxyAddress::GSC, ProxyAddress::KMD, 16).unwrap();
        end.status = 3;
        assert!(matches!(
            validate_proxy_header(&end, ProxyAddress::GSC, ProxyAddress::KMD, 16),
            Err(CodecError::DriverStatus(3))
        ));

        let invalid = ProxyHeader::new(
            ProxyMsgType::INVALID,
            ProxyAddress::GSC,
            ProxyAddress::CSME,
            4,
        );
        assert!(matches!(
            validate_proxy_header(&invalid, ProxyAddress::GSC, ProxyAddress::CSME, 64),
            Err(CodecError::BadType(ProxyMsgType::INVALID))
        ));
    }
}
