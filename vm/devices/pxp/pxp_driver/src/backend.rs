// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Firmware backends. A device reaches the PXP firmware either through the
//! GSC engine, which also needs the CSME relay, or through a legacy TEE link.

use crate::channel::ChannelError;
use crate::channel::RelayChannel;
use crate::config::PxpConfig;
use crate::proxy::RelayError;
use crate::proxy::RelayPump;
use pxp_backing::DmaClient;
use pxp_backing::FirmwareTransport;
use pxp_backing::TeeLink;
use pxp_backing::TransportError;
use pxp_spec::fw::InitSessionCmd;
use pxp_spec::fw::InvalidateStreamKeyCmd;
use pxp_spec::fw::PxpCmdReply;
use pxp_spec::fw::PxpCommandId;
use pxp_spec::fw::PxpFwStatus;
use pxp_spec::gsc::GscClientId;
use pxp_spec::gsc::HOST_SESSION_CLIENT_MASK;
use pxp_spec::gsc::HOST_SESSION_PXP_SINGLE;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// A firmware backend operation failed.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The firmware path is not established yet.
    #[error("firmware backend is not ready")]
    NotReady,
    /// The GSC packet exchange failed.
    #[error("gsc channel failure")]
    Channel(#[source] ChannelError),
    /// The CSME relay failed.
    #[error("gsc relay failure")]
    Relay(#[source] RelayError),
    /// The TEE link failed.
    #[error("tee link failure")]
    Tee(#[source] TransportError),
    /// The firmware reply is shorter than a command header.
    #[error("firmware reply of {0} bytes is too short")]
    ShortReply(usize),
    /// Firmware asked to retry later.
    #[error("firmware is not ready")]
    FirmwareNotReady,
    /// Firmware rejected a command.
    #[error("firmware command {command:?} failed with status {status:?}")]
    Firmware {
        /// The command.
        command: PxpCommandId,
        /// The firmware status.
        status: PxpFwStatus,
    },
    /// Host session handles need a GSC backend.
    #[error("host session handles are not supported by this backend")]
    HostSessionsUnsupported,
    /// The OS random number generator failed.
    #[error("failed to generate a host session handle: {0}")]
    Rng(getrandom::Error),
}

/// Which firmware path a device uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// GSC engine plus CSME relay.
    Gsc,
    /// Legacy TEE link.
    Tee,
}

/// Upper bound on a firmware command reply.
const FW_REPLY_SIZE: usize = 64;

pub(crate) trait PxpBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Returns true if firmware can be reached without further setup.
    fn is_ready(&self) -> bool;

    /// Establishes the firmware path if needed.
    fn ensure_ready(&self) -> Result<(), BackendError>;

    /// Sends an opaque firmware message and returns the reply length.
    fn send_message(
        &self,
        host_session_handle: u64,
        request: &[u8],
        reply: &mut [u8],
    ) -> Result<usize, BackendError>;

    /// Tells firmware to drop state held for `host_session_handle`.
    fn cleanup_host_session(&self, host_session_handle: u64) -> Result<(), BackendError>;

    /// Runs a relay exchange requested by the GSC.
    fn handle_relay_request(&self);

    /// The handle used for the driver's own firmware traffic.
    fn default_host_session_handle(&self) -> u64;

    fn supports_host_sessions(&self) -> bool;

    /// The longest to wait for a global termination to complete.
    fn termination_timeout(&self) -> Duration;

    fn firmware_command(&self, command: PxpCommandId, request: &[u8]) -> Result<(), BackendError> {
        let mut reply = [0; FW_REPLY_SIZE];
        let n = self.send_message(self.default_host_session_handle(), request, &mut reply)?;
        let (header, _) =
            PxpCmdReply::read_from_prefix(&reply[..n]).map_err(|_| BackendError::ShortReply(n))?;
        match header.status() {
            PxpFwStatus::SUCCESS => Ok(()),
            PxpFwStatus::NOT_READY => Err(BackendError::FirmwareNotReady),
            status => {
                if matches!(
                    status,
                    PxpFwStatus::PLATFCONFIG_KF1_NOVERIF | PxpFwStatus::PLATFCONFIG_KF1_BAD
                ) {
                    tracing::warn!(?command, ?status, "platform configuration blocks pxp");
                }
                Err(BackendError::Firmware { command, status })
            }
        }
    }

    /// Asks firmware to start the arbitration session in `session_id`.
    fn create_arb_session(&self, session_id: u8) -> Result<(), BackendError> {
        self.firmware_command(
            PxpCommandId::INIT_SESSION,
            InitSessionCmd::arb(session_id).as_bytes(),
        )
    }

    /// Tells firmware to drop the stream key of a terminated session.
    fn end_arb_fw_session(&self, session_id: u8) -> Result<(), BackendError> {
        self.firmware_command(
            PxpCommandId::INVALIDATE_STREAM_KEY,
            InvalidateStreamKeyCmd::new(session_id).as_bytes(),
        )
    }
}

/// Generates a random host session handle tagged with the PXP client.
pub(crate) fn generate_host_session_handle() -> Result<u64, BackendError> {
    let mut random = [0; 8];
    getrandom::fill(&mut random).map_err(BackendError::Rng)?;
    Ok((u64::from_le_bytes(random) & !HOST_SESSION_CLIENT_MASK) | HOST_SESSION_PXP_SINGLE)
}

/// Builds the backend for `transport`.
pub(crate) fn new_backend(
    transport: FirmwareTransport,
    dma_client: &dyn DmaClient,
    config: &PxpConfig,
) -> anyhow::Result<Box<dyn PxpBackend>> {
    let backend: Box<dyn PxpBackend> = match transport {
        FirmwareTransport::Gsc {
            engine,
            trust_authority,
        } => Box::new(GscBackend {
            pxp: RelayChannel::new(engine.clone(), dma_client, GscClientId::PXP, config)?,
            proxy: RelayPump::new(engine, trust_authority, dma_client, config)?,
            relay_ready: AtomicBool::new(false),
            host_session_handle: generate_host_session_handle()?,
            termination_timeout: config.gsc_termination_timeout,
        }),
        FirmwareTransport::Tee(link) => Box::new(TeeBackend {
            link,
            timeout: config.relay_response_timeout,
            termination_timeout: config.tee_termination_timeout,
        }),
    };
    Ok(backend)
}

struct GscBackend {
    pxp: RelayChannel,
    proxy: RelayPump,
    relay_ready: AtomicBool,
    host_session_handle: u64,
    termination_timeout: Duration,
}

impl GscBackend {
    fn run_relay(&self) -> Result<(), RelayError> {
        match self.proxy.exchange() {
            Ok(round_trips) => {
                if !self.relay_ready.swap(true, Ordering::AcqRel) {
                    tracing::info!(round_trips, "gsc relay established");
                }
                Ok(())
            }
            Err(err) => {
                self.relay_ready.store(false, Ordering::Release);
                Err(err)
            }
        }
    }
}

impl PxpBackend for GscBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Gsc
    }

    fn is_ready(&self) -> bool {
        self.relay_ready.load(Ordering::Acquire)
    }

    fn ensure_ready(&self) -> Result<(), BackendError> {
        if self.is_ready() {
            return Ok(());
        }
        self.run_relay().map_err(BackendError::Relay)
    }

    fn send_message(
        &self,
        host_session_handle: u64,
        request: &[u8],
        reply: &mut [u8],
    ) -> Result<usize, BackendError> {
        self.pxp
            .lock()
            .send(host_session_handle, request, false, reply)
            .map_err(BackendError::Channel)
    }

    fn cleanup_host_session(&self, host_session_handle: u64) -> Result<(), BackendError> {
        self.pxp
            .lock()
            .send(host_session_handle, &[], true, &mut [])
            .map_err(BackendError::Channel)?;
        Ok(())
    }

    fn handle_relay_request(&self) {
        if let Err(err) = self.run_relay() {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "gsc relay request failed"
            );
        }
    }

    fn default_host_session_handle(&self) -> u64 {
        self.host_session_handle
    }

    fn supports_host_sessions(&self) -> bool {
        true
    }

    fn termination_timeout(&self) -> Duration {
        self.termination_timeout
    }
}

struct TeeBackend {
    link: Arc<dyn TeeLink>,
    timeout: Duration,
    termination_timeout: Duration,
}

impl PxpBackend for TeeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Tee
    }

    fn is_ready(&self) -> bool {
        self.link.is_bound()
    }

    fn ensure_ready(&self) -> Result<(), BackendError> {
        if !self.is_ready() {
            return Err(BackendError::NotReady);
        }
        Ok(())
    }

    fn send_message(
        &self,
        _host_session_handle: u64,
        request: &[u8],
        reply: &mut [u8],
    ) -> Result<usize, BackendError> {
        self.link
            .send_recv(request, reply, self.timeout)
            .map_err(BackendError::Tee)
    }

    fn cleanup_host_session(&self, _host_session_handle: u64) -> Result<(), BackendError> {
        Ok(())
    }

    fn handle_relay_request(&self) {
        tracing::debug!("ignoring relay request without a gsc");
    }

    fn default_host_session_handle(&self) -> u64 {
        0
    }

    fn supports_host_sessions(&self) -> bool {
        false
    }

    fn termination_timeout(&self) -> Duration {
        self.termination_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pxp_backing::PxpDeviceBacking;
    use pxp_backing_emulated_mock::DeviceEvent;
    use pxp_backing_emulated_mock::EmulatedPxpDevice;
    use pxp_backing_emulated_mock::FaultConfiguration;
    use test_log::test;

    fn backend(device: &EmulatedPxpDevice) -> Box<dyn PxpBackend> {
        let config = PxpConfig::new().with_relay_response_timeout(Duration::from_millis(20));
        new_backend(
            device.firmware_transport(),
            device.dma_client().as_ref(),
            &config,
        )
        .unwrap()
    }

    #[test]
    fn host_session_handle_layout() {
        let handle = generate_host_session_handle().unwrap();
        assert_eq!(handle & HOST_SESSION_CLIENT_MASK, HOST_SESSION_PXP_SINGLE);
    }

    #[test]
    fn gsc_needs_relay() {
        let device = EmulatedPxpDevice::new_gsc();
        let backend = backend(&device);
        assert_eq!(backend.kind(), BackendKind::Gsc);
        assert!(!backend.is_ready());
        backend.ensure_ready().unwrap();
        assert!(backend.is_ready());
        assert!(device.events().contains(&DeviceEvent::CsmeExchange));
    }

    #[test]
    fn gsc_relay_failure_clears_ready() {
        let device = EmulatedPxpDevice::new_gsc();
        let backend = backend(&device);
        backend.ensure_ready().unwrap();
        device.set_faults(FaultConfiguration::new().with_proxy_bad_addressing());
        backend.handle_relay_request();
        assert!(!backend.is_ready());
        assert!(matches!(
            backend.ensure_ready(),
            Err(BackendError::Relay(RelayError::Protocol(_)))
        ));
    }

    #[test]
    fn gsc_arb_session_uses_driver_handle() {
        let device = EmulatedPxpDevice::new_gsc();
        let backend = backend(&device);
        backend.create_arb_session(0).unwrap();
        assert_eq!(device.session_in_play_mask(), 1);
        let handle = backend.default_host_session_handle();
        assert!(device.gsc_submissions().iter().any(|e| matches!(
            e,
            DeviceEvent::GscSubmit {
                client: GscClientId::PXP,
                host_session_handle,
                ..
            } if *host_session_handle == handle
        )));

        backend.end_arb_fw_session(0).unwrap();
        assert_eq!(device.session_in_play_mask(), 0);
        assert!(device.events().contains(&DeviceEvent::StreamKeyInvalidated(0)));
    }

    #[test]
    fn gsc_cleanup_packet() {
        let device = EmulatedPxpDevice::new_gsc();
        let backend = backend(&device);
        backend.cleanup_host_session(0x1234).unwrap();
        assert_eq!(
            device.gsc_submissions(),
            [DeviceEvent::GscSubmit {
                client: GscClientId::PXP,
                message_handle: 0,
                host_session_handle: 0x1234,
                cleanup: true,
            }]
        );
    }

    #[test]
    fn firmware_not_ready() {
        let device = EmulatedPxpDevice::new_tee();
        device.set_faults(FaultConfiguration::new().with_fw_not_ready());
        let backend = backend(&device);
        assert!(matches!(
            backend.create_arb_session(0),
            Err(BackendError::FirmwareNotReady)
        ));
    }

    #[test]
    fn tee_binding() {
        let device = EmulatedPxpDevice::new_tee();
        let backend = backend(&device);
        assert_eq!(backend.kind(), BackendKind::Tee);
        assert!(!backend.supports_host_sessions());
        backend.ensure_ready().unwrap();
        backend.create_arb_session(0).unwrap();
        assert_eq!(device.session_in_play_mask(), 1);

        device.set_tee_bound(false);
        assert!(matches!(
            backend.ensure_ready(),
            Err(BackendError::NotReady)
        ));
        assert!(matches!(
            backend.end_arb_fw_session(0),
            Err(BackendError::Tee(TransportError::NotConnected))
        ));
    }
}
