// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Emulated GSC engine and CSME relay endpoint.

use crate::DeviceEvent;
use crate::DeviceState;
use crate::firmware;
use parking_lot::Mutex;
use pxp_backing::GscEngine;
use pxp_backing::SubmitError;
use pxp_backing::TransportError;
use pxp_backing::TrustAuthority;
use pxp_backing::memory::DmaBuffer;
use pxp_spec::gsc::GSC_HEADER_SIZE;
use pxp_spec::gsc::GscClientId;
use pxp_spec::gsc::GscHeader;
use pxp_spec::gsc::GscHeaderFlags;
use pxp_spec::proxy::ProxyAddress;
use pxp_spec::proxy::ProxyHeader;
use pxp_spec::proxy::ProxyMsgType;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

const GSC_TO_CSME_PAYLOAD: &[u8] = b"gsc-to-csme";
const CSME_TO_GSC_PAYLOAD: &[u8] = b"csme-to-gsc";

/// Non-zero GSC header status for packets the engine cannot route.
const GSC_STATUS_BAD_CLIENT: u32 = 0x1;

fn relay_message(
    msg_type: ProxyMsgType,
    source: ProxyAddress,
    destination: ProxyAddress,
    payload: &[u8],
    status: u32,
) -> Vec<u8> {
    let mut header = ProxyHeader::new(msg_type, source, destination, payload.len() as u16);
    header.status = status;
    let mut msg = header.as_bytes().to_vec();
    msg.extend_from_slice(payload);
    msg
}

fn end_message(status: u32) -> Vec<u8> {
    relay_message(
        ProxyMsgType::END,
        ProxyAddress::GSC,
        ProxyAddress::KMD,
        &[],
        status,
    )
}

pub(crate) struct EmulatedGsc {
    state: Arc<DeviceState>,
    proxy_rounds_left: Mutex<u32>,
}

impl EmulatedGsc {
    pub fn new(state: Arc<DeviceState>) -> Self {
        Self {
            state,
            proxy_rounds_left: Mutex::new(0),
        }
    }

    fn proxy(&self, msg: &[u8]) -> Vec<u8> {
        let Ok((header, _)) = ProxyHeader::read_from_prefix(msg) else {
            return end_message(1);
        };
        let faults = self.state.faults();
        let mut rounds_left = self.proxy_rounds_left.lock();
        match header.msg_type() {
            ProxyMsgType::QUERY => *rounds_left = faults.proxy_rounds,
            ProxyMsgType::PAYLOAD if header.source == ProxyAddress::CSME => {
                *rounds_left = rounds_left.saturating_sub(1);
            }
            msg_type => {
                tracing::debug!(?msg_type, "unexpected proxy message");
                return end_message(1);
            }
        }
        if *rounds_left == 0 {
            return end_message(0);
        }
        let destination = if faults.proxy_bad_addressing {
            ProxyAddress::KMD
        } else {
            ProxyAddress::CSME
        };
        relay_message(
            ProxyMsgType::PAYLOAD,
            ProxyAddress::GSC,
            destination,
            GSC_TO_CSME_PAYLOAD,
            0,
        )
    }
}

fn write_reply(
    response: &DmaBuffer,
    request: &GscHeader,
    flags: GscHeaderFlags,
    status: u32,
    payload: &[u8],
) {
    let mut header = GscHeader::new(
        request.client_id,
        request.host_session_handle,
        payload.len(),
    );
    header.message_handle = request.message_handle;
    header.flags = flags;
    header.status = status;
    response.write_at(GSC_HEADER_SIZE, payload);
    response.write_obj(0, &header);
}

impl GscEngine for EmulatedGsc {
    fn submit(
        &self,
        request: &DmaBuffer,
        request_len: usize,
        response: &DmaBuffer,
        _timeout: Duration,
    ) -> Result<(), SubmitError> {
        if request_len < GSC_HEADER_SIZE || request_len > request.len() {
            return Err(SubmitError::Rejected(format!(
                "bad request length {request_len}"
            )));
        }
        let header: GscHeader = request.read_obj(0);
        let flags = header.flags;
        let mut payload = vec![0; request_len - GSC_HEADER_SIZE];
        request.read_at(GSC_HEADER_SIZE, &mut payload);

        self.state.record(DeviceEvent::GscSubmit {
            client: header.client_id,
            message_handle: header.message_handle,
            host_session_handle: header.host_session_handle,
            cleanup: flags.session_cleanup(),
        });

        {
            let mut faults = self.state.faults.lock();
            if faults.gsc_no_response {
                return Ok(());
            }
            if faults.gsc_pending_replies > 0 {
                faults.gsc_pending_replies -= 1;
                drop(faults);
                let mut pending = header;
                pending.message_handle = self
                    .state
                    .next_message_handle
                    .fetch_add(1, Ordering::Relaxed);
                write_reply(
                    response,
                    &pending,
                    GscHeaderFlags::new().with_msg_pending(true),
                    0,
                    &[],
                );
                return Ok(());
            }
        }

        let (status, reply) = if flags.session_cleanup() {
            (0, Vec::new())
        } else {
            match header.client_id {
                GscClientId::PXP => (0, firmware::handle_command(&self.state, &payload)),
                GscClientId::PROXY => (0, self.proxy(&payload)),
                _ => (GSC_STATUS_BAD_CLIENT, Vec::new()),
            }
        };
        if GSC_HEADER_SIZE + reply.len() > response.len() {
            return Err(SubmitError::Rejected("reply too large".into()));
        }
        write_reply(response, &header, GscHeaderFlags::new(), status, &reply);
        Ok(())
    }
}

pub(crate) struct EmulatedCsme {
    state: Arc<DeviceState>,
}

impl EmulatedCsme {
    pub fn new(state: Arc<DeviceState>) -> Self {
        Self { state }
    }
}

impl TrustAuthority for EmulatedCsme {
    fn exchange(&self, request: &[u8], reply: &mut [u8]) -> Result<usize, TransportError> {
        self.state.record(DeviceEvent::CsmeExchange);
        let (header, _) = ProxyHeader::read_from_prefix(request)
            .map_err(|_| TransportError::Io("short relay message".into()))?;
        if header.source != ProxyAddress::GSC || header.destination != ProxyAddress::CSME {
            return Err(TransportError::Io("misrouted relay message".into()));
        }
        let msg = relay_message(
            ProxyMsgType::PAYLOAD,
            ProxyAddress::CSME,
            ProxyAddress::GSC,
            CSME_TO_GSC_PAYLOAD,
            0,
        );
        let out = reply
            .get_mut(..msg.len())
            .ok_or(TransportError::ReplyTooLarge(msg.len()))?;
        out.copy_from_slice(&msg);
        Ok(msg.len())
    }
}
