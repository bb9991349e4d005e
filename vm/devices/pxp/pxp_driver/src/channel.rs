// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A buffer pair for exchanging packets with one GSC firmware client.

use crate::codec;
use crate::codec::CodecError;
use crate::config::PxpConfig;
use crate::retry::PendingExhausted;
use crate::retry::RetryPolicy;
use crate::retry::poll_timeout;
use crate::retry::retry_with_backoff;
use anyhow::Context;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use pxp_backing::DmaClient;
use pxp_backing::GscEngine;
use pxp_backing::SubmitError;
use pxp_backing::memory::DmaBuffer;
use pxp_spec::gsc::GSC_BUFFER_SIZE;
use pxp_spec::gsc::GSC_HEADER_SIZE;
use pxp_spec::gsc::GscClientId;
use pxp_spec::gsc::GscHeader;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A packet exchange with the GSC failed.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The request does not fit in the channel.
    #[error("request of {0} bytes does not fit in the channel")]
    RequestTooBig(usize),
    /// The engine did not accept the submission.
    #[error("gsc submission failed")]
    Submit(#[source] SubmitError),
    /// The engine never wrote a reply.
    #[error("no reply from the gsc within {0:?}")]
    NoResponse(Duration),
    /// The engine kept flagging the reply pending.
    #[error(transparent)]
    Pending(#[from] PendingExhausted),
    /// The reply failed validation.
    #[error("malformed gsc reply")]
    Codec(#[source] CodecError),
    /// The reply payload does not fit in the caller's buffer.
    #[error("reply of {size} bytes does not fit in {capacity}")]
    ReplyTooBig {
        /// Reply payload size.
        size: usize,
        /// Caller buffer size.
        capacity: usize,
    },
}

struct ChannelBuffers {
    to_gsc: DmaBuffer,
    from_gsc: DmaBuffer,
}

/// A buffer pair bound to one GSC client. Exchanges are serialized through
/// [`RelayChannel::lock`].
pub(crate) struct RelayChannel {
    engine: Arc<dyn GscEngine>,
    client_id: GscClientId,
    buffers: Mutex<ChannelBuffers>,
    response_timeout: Duration,
    poll_interval: Duration,
    pending_retry: RetryPolicy,
}

impl RelayChannel {
    pub fn new(
        engine: Arc<dyn GscEngine>,
        dma_client: &dyn DmaClient,
        client_id: GscClientId,
        config: &PxpConfig,
    ) -> anyhow::Result<Self> {
        let to_gsc = dma_client
            .allocate_dma_buffer(GSC_BUFFER_SIZE)
            .context("failed to allocate gsc request buffer")?;
        let from_gsc = dma_client
            .allocate_dma_buffer(GSC_BUFFER_SIZE)
            .context("failed to allocate gsc reply buffer")?;
        Ok(Self {
            engine,
            client_id,
            buffers: Mutex::new(ChannelBuffers { to_gsc, from_gsc }),
            response_timeout: config.relay_response_timeout,
            poll_interval: config.poll_interval,
            pending_retry: config.pending_retry,
        })
    }

    /// The largest payload a single packet can carry.
    pub fn max_payload(&self) -> usize {
        GSC_BUFFER_SIZE - GSC_HEADER_SIZE
    }

    /// Takes exclusive use of the buffers.
    pub fn lock(&self) -> ChannelGuard<'_> {
        ChannelGuard {
            channel: self,
            buffers: self.buffers.lock(),
        }
    }
}

pub(crate) struct ChannelGuard<'a> {
    channel: &'a RelayChannel,
    buffers: MutexGuard<'a, ChannelBuffers>,
}

impl ChannelGuard<'_> {
    /// Sends `request` as one packet and copies the reply payload into
    /// `reply`, returning its length. Replies flagged pending are resubmitted
    /// with the message handle the engine supplied.
    pub fn send(
        &mut self,
        host_session_handle: u64,
        request: &[u8],
        cleanup: bool,
        reply: &mut [u8],
    ) -> Result<usize, ChannelError> {
        let channel = self.channel;
        let ChannelBuffers { to_gsc, from_gsc } = &*self.buffers;

        let request_len = codec::emit_header(
            to_gsc,
            channel.client_id,
            host_session_handle,
            request.len(),
            cleanup,
        )
        .map_err(|_| ChannelError::RequestTooBig(request.len()))?;
        to_gsc.write_at(GSC_HEADER_SIZE, request);

        let header = retry_with_backoff::<_, ChannelError>(&channel.pending_retry, |attempt| {
            codec::clear_header(from_gsc);
            channel
                .engine
                .submit(to_gsc, request_len, from_gsc, channel.response_timeout)
                .map_err(ChannelError::Submit)?;
            poll_timeout(channel.response_timeout, channel.poll_interval, || {
                codec::reply_present(from_gsc)
            })
            .map_err(|_| ChannelError::NoResponse(channel.response_timeout))?;

            let header: GscHeader = from_gsc.read_obj(0);
            if codec::check_and_update_pending(to_gsc, &header) {
                tracing::trace!(
                    attempt,
                    client = ?channel.client_id,
                    message_handle = { header.message_handle },
                    "gsc reply pending"
                );
                return Ok(None);
            }
            Ok(Some(header))
        })?;

        let len = codec::read_out_header(&header, channel.client_id, 0, from_gsc.len()).map_err(
            |err| {
                tracing::error!(
                    ?header,
                    error = &err as &dyn std::error::Error,
                    "invalid gsc reply header"
                );
                ChannelError::Codec(err)
            },
        )?;
        let capacity = reply.len();
        let out = reply.get_mut(..len).ok_or(ChannelError::ReplyTooBig {
            size: len,
            capacity,
        })?;
        from_gsc.read_at(GSC_HEADER_SIZE, out);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pxp_backing::FirmwareTransport;
    use pxp_backing::PxpDeviceBacking;
    use pxp_backing_emulated_mock::DeviceEvent;
    use pxp_backing_emulated_mock::EmulatedPxpDevice;
    use pxp_backing_emulated_mock::FaultConfiguration;
    use pxp_spec::fw::InitSessionCmd;
    use pxp_spec::fw::PxpCmdReply;
    use pxp_spec::fw::PxpFwStatus;
    use test_log::test;
    use zerocopy::FromBytes;
    use zerocopy::IntoBytes;

    fn channel(device: &EmulatedPxpDevice, client_id: GscClientId) -> RelayChannel {
        let FirmwareTransport::Gsc { engine, .. } = device.firmware_transport() else {
            panic!("expected a gsc transport");
        };
        let config = PxpConfig::new()
            .with_relay_response_timeout(Duration::from_millis(20))
            .with_pending_retry(RetryPolicy {
                max_attempts: 4,
                backoff: Duration::from_millis(1),
            });
        RelayChannel::new(engine, device.dma_client().as_ref(), client_id, &config).unwrap()
    }

    #[test]
    fn firmware_round_trip() {
        let device = EmulatedPxpDevice::new_gsc();
        let channel = channel(&device, GscClientId::PXP);
        let mut reply = [0; 64];
        let len = channel
            .lock()
            .send(0x99, InitSessionCmd::arb(0).as_bytes(), false, &mut reply)
            .unwrap();
        let (header, _) = PxpCmdReply::read_from_prefix(&reply[..len]).unwrap();
        assert_eq!(header.status(), PxpFwStatus::SUCCESS);
        assert_eq!(device.session_in_play_mask(), 1);
        assert!(matches!(
            device.gsc_submissions()[..],
            [DeviceEvent::GscSubmit {
                client: GscClientId::PXP,
                host_session_handle: 0x99,
                cleanup: false,
                ..
            }]
        ));
    }

    #[test]
    fn pending_reply_chains_message_handles() {
        let device = EmulatedPxpDevice::new_gsc();
        device.set_faults(FaultConfiguration::new().with_gsc_pending_replies(2));
        let channel = channel(&device, GscClientId::PXP);
        let mut reply = [0; 64];
        channel
            .lock()
            .send(0, InitSessionCmd::arb(0).as_bytes(), false, &mut reply)
            .unwrap();
        let handles: Vec<u64> = device
            .gsc_submissions()
            .into_iter()
            .map(|event| match event {
                DeviceEvent::GscSubmit { message_handle, .. } => message_handle,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(handles, [0, 0x1000, 0x1001]);
    }

    #[test]
    fn pending_budget_exhausted() {
        let device = EmulatedPxpDevice::new_gsc();
        device.set_faults(FaultConfiguration::new().with_gsc_pending_replies(10));
        let channel = channel(&device, GscClientId::PXP);
        let err = channel
            .lock()
            .send(0, InitSessionCmd::arb(0).as_bytes(), false, &mut [0; 64])
            .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Pending(PendingExhausted { attempts: 4 })
        ));
    }

    #[test]
    fn no_response() {
        let device = EmulatedPxpDevice::new_gsc();
        device.set_faults(FaultConfiguration::new().with_gsc_no_response());
        let channel = channel(&device, GscClientId::PXP);
        let err = channel
            .lock()
            .send(0, InitSessionCmd::arb(0).as_bytes(), false, &mut [0; 64])
            .unwrap_err();
        assert!(matches!(err, ChannelError::NoResponse(_)));
        assert_eq!(device.gsc_submissions().len(), 1);
    }

    #[test]
    fn oversized_request_rejected() {
        let device = EmulatedPxpDevice::new_gsc();
        let channel = channel(&device, GscClientId::PXP);
        let request = vec![0; channel.max_payload() + 1];
        let err = channel
            .lock()
            .send(0, &request, false, &mut [0; 64])
            .unwrap_err();
        assert!(matches!(err, ChannelError::RequestTooBig(_)));
        assert!(device.gsc_submissions().is_empty());
    }

    #[test]
    fn small_reply_buffer() {
        let device = EmulatedPxpDevice::new_gsc();
        let channel = channel(&device, GscClientId::PXP);
        let err = channel
            .lock()
            .send(0, InitSessionCmd::arb(0).as_bytes(), false, &mut [0; 4])
            .unwrap_err();
        assert!(matches!(err, ChannelError::ReplyTooBig { capacity: 4, .. }));
    }
}
