// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Emulated PXP firmware client, reachable through the GSC or a TEE link.

use crate::DeviceEvent;
use crate::DeviceState;
use pxp_backing::TeeLink;
use pxp_backing::TransportError;
use pxp_spec::fw::InitSessionIn;
use pxp_spec::fw::PXP_APIVER_4_3;
use pxp_spec::fw::PxpCmdHeader;
use pxp_spec::fw::PxpCommandId;
use pxp_spec::fw::PxpFwStatus;
use pxp_spec::fw::PxpStreamId;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

fn reply(command_id: PxpCommandId, status: PxpFwStatus) -> Vec<u8> {
    let mut header = PxpCmdHeader::new(command_id, 0);
    header.status_or_stream_id = status.0;
    header.as_bytes().to_vec()
}

/// Runs one firmware command and returns the reply. Commands the firmware
/// does not interpret are echoed back with a success status.
pub(crate) fn handle_command(state: &DeviceState, msg: &[u8]) -> Vec<u8> {
    let Ok((header, body)) = PxpCmdHeader::read_from_prefix(msg) else {
        return reply(PxpCommandId(0), PxpFwStatus::ERROR_API_VERSION);
    };
    if header.api_version != PXP_APIVER_4_3 {
        return reply(header.command_id, PxpFwStatus::ERROR_API_VERSION);
    }
    let faults = state.faults();
    if faults.fw_not_ready {
        return reply(header.command_id, PxpFwStatus::NOT_READY);
    }
    match header.command_id {
        PxpCommandId::INIT_SESSION => {
            let Ok((init, _)) = InitSessionIn::read_from_prefix(body) else {
                return reply(header.command_id, PxpFwStatus::ERROR_API_VERSION);
            };
            tracing::debug!(
                session_id = init.session_id,
                mode = ?init.protection_mode,
                "firmware init session"
            );
            if !faults.fw_ignore_init {
                state.start_session(init.session_id as u8);
            }
            reply(header.command_id, PxpFwStatus::SUCCESS)
        }
        PxpCommandId::INVALIDATE_STREAM_KEY => {
            let stream = PxpStreamId::from_bits(header.status_or_stream_id);
            let session_id = stream.session_id() as u8;
            state.record(DeviceEvent::StreamKeyInvalidated(session_id));
            state.end_session(session_id);
            reply(header.command_id, PxpFwStatus::SUCCESS)
        }
        _ => {
            let mut echo = msg.to_vec();
            echo[8..12].copy_from_slice(&PxpFwStatus::SUCCESS.0.to_le_bytes());
            echo
        }
    }
}

pub(crate) struct EmulatedTee {
    state: Arc<DeviceState>,
}

impl EmulatedTee {
    pub fn new(state: Arc<DeviceState>) -> Self {
        Self { state }
    }
}

impl TeeLink for EmulatedTee {
    fn is_bound(&self) -> bool {
        self.state.tee_bound.load(Ordering::SeqCst)
    }

    fn send_recv(
        &self,
        request: &[u8],
        reply: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        if !self.is_bound() {
            return Err(TransportError::NotConnected);
        }
        let msg = handle_command(&self.state, request);
        let out = reply
            .get_mut(..msg.len())
            .ok_or(TransportError::ReplyTooLarge(msg.len()))?;
        out.copy_from_slice(&msg);
        Ok(msg.len())
    }
}
