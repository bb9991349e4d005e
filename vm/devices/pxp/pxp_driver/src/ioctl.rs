// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Control operation dispatch. Every failure is reported through the closed
//! [`PxpOpStatus`] set; only user memory faults surface as errors.

use crate::backend::BackendError;
use crate::channel::ChannelError;
use crate::manager::PxpFile;
use crate::manager::TeeIoError;
use crate::proxy::RelayError;
use crate::session::SessionError;
use pxp_backing::TransportError;
use pxp_backing::UserMemory;
use pxp_backing::UserMemoryError;
use pxp_spec::ioctl::HostSessionHandleParams;
use pxp_spec::ioctl::PxpAction;
use pxp_spec::ioctl::PxpHostSessionRequest;
use pxp_spec::ioctl::PxpOpStatus;
use pxp_spec::ioctl::PxpOps;
use pxp_spec::ioctl::PxpReqState;
use pxp_spec::ioctl::PxpSessionMode;
use pxp_spec::ioctl::QueryTagParams;
use pxp_spec::ioctl::SetSessionStatusParams;
use pxp_spec::ioctl::TeeIoMessageParams;
use pxp_spec::tag::PxpTag;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

fn read_params<T: FromBytes + IntoBytes>(
    mem: &dyn UserMemory,
    addr: u64,
) -> Result<T, UserMemoryError> {
    let mut params = T::new_zeroed();
    mem.read(addr, params.as_mut_bytes())?;
    Ok(params)
}

fn write_params<T: IntoBytes + Immutable>(
    mem: &dyn UserMemory,
    addr: u64,
    params: &T,
) -> Result<(), UserMemoryError> {
    mem.write(addr, params.as_bytes())
}

fn session_status(err: &SessionError) -> PxpOpStatus {
    match err {
        SessionError::Busy
        | SessionError::NotInPlay { .. }
        | SessionError::RetryRequired { .. } => PxpOpStatus::RETRY_REQUIRED,
        SessionError::NoSlot | SessionError::Suspended => PxpOpStatus::SESSION_NOT_AVAILABLE,
        SessionError::PermissionDenied
        | SessionError::InvalidTag
        | SessionError::InvalidMode(_) => PxpOpStatus::ERROR_INVALID,
    }
}

fn backend_status(err: &BackendError) -> PxpOpStatus {
    match err {
        BackendError::Channel(ChannelError::Codec(_))
        | BackendError::Relay(RelayError::Protocol(_))
        | BackendError::HostSessionsUnsupported => PxpOpStatus::ERROR_INVALID,
        BackendError::NotReady
        | BackendError::FirmwareNotReady
        | BackendError::Relay(_)
        | BackendError::Channel(ChannelError::NoResponse(_) | ChannelError::Pending(_))
        | BackendError::Tee(TransportError::Timeout | TransportError::NotConnected) => {
            PxpOpStatus::RETRY_REQUIRED
        }
        _ => PxpOpStatus::ERROR_UNKNOWN,
    }
}

fn tee_io_status(err: &TeeIoError) -> PxpOpStatus {
    match err {
        TeeIoError::TooBig { .. } => PxpOpStatus::ERROR_INVALID,
        TeeIoError::NotReady(_) => PxpOpStatus::RETRY_REQUIRED,
        TeeIoError::HostSession(err) | TeeIoError::Backend(err) => backend_status(err),
        TeeIoError::Suspended => PxpOpStatus::SESSION_NOT_AVAILABLE,
    }
}

fn to_status<E: std::error::Error + 'static>(
    result: Result<(), E>,
    status: impl FnOnce(&E) -> PxpOpStatus,
) -> PxpOpStatus {
    match result {
        Ok(()) => PxpOpStatus::SUCCESS,
        Err(err) => {
            tracing::debug!(
                error = &err as &dyn std::error::Error,
                "pxp control operation failed"
            );
            status(&err)
        }
    }
}

impl PxpFile {
    /// Runs one control operation and stores its outcome in `ops.status`.
    pub fn pxp_ops(
        &self,
        ops: &mut PxpOps,
        mem: &dyn UserMemory,
    ) -> Result<(), UserMemoryError> {
        let status = match PxpAction(ops.action) {
            PxpAction::SET_SESSION_STATUS => self.set_session_status(ops.params, mem)?,
            PxpAction::TEE_IO_MESSAGE => self.tee_io(ops.params, mem)?,
            PxpAction::QUERY_PXP_TAG => self.query(ops.params, mem)?,
            PxpAction::HOST_SESSION_HANDLE_REQ => self.host_session(ops.params, mem)?,
            action => {
                tracing::debug!(?action, "unknown pxp action");
                PxpOpStatus::ERROR_INVALID
            }
        };
        ops.status = status.0;
        Ok(())
    }

    fn set_session_status(
        &self,
        addr: u64,
        mem: &dyn UserMemory,
    ) -> Result<PxpOpStatus, UserMemoryError> {
        let mut params: SetSessionStatusParams = read_params(mem, addr)?;
        let tag = PxpTag::from_bits(params.pxp_tag);
        let status = match PxpReqState(params.req_state) {
            PxpReqState::INIT => {
                match self.reserve_session(PxpSessionMode(params.session_mode)) {
                    Ok(tag) => {
                        params.pxp_tag = tag.into_bits();
                        write_params(mem, addr, &params)?;
                        PxpOpStatus::SUCCESS
                    }
                    Err(err) => to_status(Err(err), session_status),
                }
            }
            PxpReqState::IN_PLAY => to_status(self.mark_session_in_play(tag), session_status),
            PxpReqState::TERMINATE => to_status(self.terminate_session(tag), session_status),
            req_state => {
                tracing::debug!(?req_state, "invalid session request state");
                PxpOpStatus::ERROR_INVALID
            }
        };
        Ok(status)
    }

    fn tee_io(&self, addr: u64, mem: &dyn UserMemory) -> Result<PxpOpStatus, UserMemoryError> {
        let mut params: TeeIoMessageParams = read_params(mem, addr)?;
        let max = self.max_tee_message_size();
        if params.msg_in_size as usize > max || params.msg_out_buf_size as usize > max {
            return Ok(PxpOpStatus::ERROR_INVALID);
        }
        let mut request = vec![0; params.msg_in_size as usize];
        mem.read(params.msg_in, &mut request)?;
        let mut reply = vec![0; params.msg_out_buf_size as usize];
        let status = match self.tee_io_message(&request, &mut reply) {
            Ok(n) => {
                mem.write(params.msg_out, &reply[..n])?;
                params.msg_out_ret_size = n as u32;
                write_params(mem, addr, &params)?;
                PxpOpStatus::SUCCESS
            }
            Err(err) => to_status(Err(err), tee_io_status),
        };
        Ok(status)
    }

    fn query(&self, addr: u64, mem: &dyn UserMemory) -> Result<PxpOpStatus, UserMemoryError> {
        let mut params: QueryTagParams = read_params(mem, addr)?;
        let (tag, alive) = self.query_tag(PxpTag::from_bits(params.pxp_tag));
        params.pxp_tag = tag.into_bits();
        params.session_is_alive = alive.into();
        write_params(mem, addr, &params)?;
        Ok(PxpOpStatus::SUCCESS)
    }

    fn host_session(
        &self,
        addr: u64,
        mem: &dyn UserMemory,
    ) -> Result<PxpOpStatus, UserMemoryError> {
        let mut params: HostSessionHandleParams = read_params(mem, addr)?;
        if PxpHostSessionRequest(params.request_type) != PxpHostSessionRequest::INIT {
            return Ok(PxpOpStatus::ERROR_INVALID);
        }
        let status = match self.host_session_handle() {
            Ok(handle) => {
                params.host_session_handle = handle;
                write_params(mem, addr, &params)?;
                PxpOpStatus::SUCCESS
            }
            Err(err) => to_status(Err(err), backend_status),
        };
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecError;
    use crate::hw::HwError;
    use crate::retry::PendingExhausted;
    use crate::retry::PollTimeout;
    use pxp_spec::fw::PxpCommandId;
    use pxp_spec::fw::PxpFwStatus;
    use std::time::Duration;
    use test_log::test;

    fn hw_timeout() -> HwError {
        HwError::SessionState {
            session_id: 1,
            in_play: true,
            err: PollTimeout {
                timeout: Duration::from_millis(1),
            },
        }
    }

    #[test]
    fn session_errors_map_to_status() {
        assert_eq!(session_status(&SessionError::Busy), PxpOpStatus::RETRY_REQUIRED);
        assert_eq!(
            session_status(&SessionError::NotInPlay {
                session_id: 1,
                err: hw_timeout()
            }),
            PxpOpStatus::RETRY_REQUIRED
        );
        assert_eq!(
            session_status(&SessionError::NoSlot),
            PxpOpStatus::SESSION_NOT_AVAILABLE
        );
        assert_eq!(
            session_status(&SessionError::Suspended),
            PxpOpStatus::SESSION_NOT_AVAILABLE
        );
        assert_eq!(
            session_status(&SessionError::PermissionDenied),
            PxpOpStatus::ERROR_INVALID
        );
        assert_eq!(
            session_status(&SessionError::InvalidMode(9)),
            PxpOpStatus::ERROR_INVALID
        );
    }

    #[test]
    fn backend_errors_map_to_status() {
        assert_eq!(
            backend_status(&BackendError::FirmwareNotReady),
            PxpOpStatus::RETRY_REQUIRED
        );
        assert_eq!(
            backend_status(&BackendError::Channel(ChannelError::Pending(
                PendingExhausted { attempts: 3 }
            ))),
            PxpOpStatus::RETRY_REQUIRED
        );
        assert_eq!(
            backend_status(&BackendError::Channel(ChannelError::RequestTooBig(1))),
            PxpOpStatus::ERROR_UNKNOWN
        );
        assert_eq!(
            backend_status(&BackendError::Firmware {
                command: PxpCommandId::INIT_SESSION,
                status: PxpFwStatus::ERROR_API_VERSION,
            }),
            PxpOpStatus::ERROR_UNKNOWN
        );
        assert_eq!(
            backend_status(&BackendError::Channel(ChannelError::Codec(
                CodecError::BadMarker(0)
            ))),
            PxpOpStatus::ERROR_INVALID
        );
        assert_eq!(
            backend_status(&BackendError::Relay(RelayError::Protocol(
                CodecError::BadMarker(0)
            ))),
            PxpOpStatus::ERROR_INVALID
        );
        assert_eq!(
            backend_status(&BackendError::Relay(RelayError::RoundTripCap(3))),
            PxpOpStatus::RETRY_REQUIRED
        );
        assert_eq!(
            backend_status(&BackendError::HostSessionsUnsupported),
            PxpOpStatus::ERROR_INVALID
        );
        assert_eq!(
            tee_io_status(&TeeIoError::TooBig { size: 1, max: 0 }),
            PxpOpStatus::ERROR_INVALID
        );
    }
}
