// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! KCR register access and per-session hardware termination.

use crate::config::PxpConfig;
use crate::retry::PollTimeout;
use crate::retry::poll_timeout;
use pxp_backing::CommandStreamer;
use pxp_backing::PxpRegisterIo;
use pxp_backing::SubmitError;
use pxp_spec::cmd;
use pxp_spec::kcr;
use pxp_spec::kcr::KcrInit;
use pxp_spec::kcr::KcrStatus;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A hardware operation failed.
#[derive(Debug, Error)]
pub enum HwError {
    /// `KCR_INIT` did not latch the enable bit.
    #[error("pxp enable did not latch, KCR_INIT reads {0:#x}")]
    EnableFailed(u32),
    /// A session's in-play bit did not reach the expected value.
    #[error("session {session_id} did not reach in_play={in_play}")]
    SessionState {
        /// The session slot.
        session_id: u8,
        /// The expected state.
        in_play: bool,
        /// The poll error.
        #[source]
        err: PollTimeout,
    },
    /// The termination batch could not be run.
    #[error("termination batch for session {session_id} failed")]
    Submit {
        /// The session slot.
        session_id: u8,
        /// The submission error.
        #[source]
        err: SubmitError,
    },
}

/// Builds the command-streamer batch that terminates `session_id`.
pub(crate) fn session_termination_batch(session_id: u8) -> Vec<u32> {
    vec![
        cmd::MFX_WAIT_PXP,
        cmd::MI_FLUSH_DW,
        0,
        0,
        cmd::mi_set_appid(session_id),
        cmd::MFX_WAIT_PXP,
        cmd::MI_FLUSH_DW | cmd::MI_FLUSH_DW_PROTECTED_MEM_EN,
        0,
        0,
        cmd::MFX_WAIT_PXP,
        cmd::CRYPTO_KEY_EXCHANGE,
        0,
        cmd::MFX_WAIT_PXP,
        cmd::MI_BATCH_BUFFER_END,
    ]
}

pub(crate) struct Hardware {
    kcr: Box<dyn PxpRegisterIo>,
    streamer: Arc<dyn CommandStreamer>,
    session_timeout: Duration,
    poll_interval: Duration,
    submit_timeout: Duration,
}

impl Hardware {
    pub fn new(
        kcr: Box<dyn PxpRegisterIo>,
        streamer: Arc<dyn CommandStreamer>,
        config: &PxpConfig,
    ) -> Self {
        Self {
            kcr,
            streamer,
            session_timeout: config.session_timeout,
            poll_interval: config.poll_interval,
            submit_timeout: config.submit_timeout,
        }
    }

    /// Enables PXP, verifying the enable bit latched.
    pub fn enable(&self) -> Result<(), HwError> {
        self.kcr
            .write_u32(kcr::KCR_INIT, KcrInit::enable().into_bits());
        let init = KcrInit::from_bits(self.kcr.read_u32(kcr::KCR_INIT));
        if !init.allow_display_me_writes() {
            return Err(HwError::EnableFailed(init.into_bits()));
        }
        Ok(())
    }

    pub fn disable(&self) {
        self.kcr
            .write_u32(kcr::KCR_INIT, KcrInit::disable().into_bits());
    }

    pub fn session_in_play_mask(&self) -> u32 {
        self.kcr.read_u32(kcr::KCR_SIP)
    }

    pub fn is_session_in_play(&self, session_id: u8) -> bool {
        self.session_in_play_mask() & kcr::sip_bit(session_id) != 0
    }

    pub fn under_attack(&self) -> bool {
        KcrStatus::from_bits(self.kcr.read_u32(kcr::KCR_STATUS)).attack_detected()
    }

    pub fn global_terminate(&self) {
        self.kcr.write_u32(kcr::KCR_GLOBAL_TERMINATE, 1);
    }

    /// Polls until the in-play bit of `session_id` equals `in_play`.
    pub fn wait_for_session_state(&self, session_id: u8, in_play: bool) -> Result<(), HwError> {
        poll_timeout(self.session_timeout, self.poll_interval, || {
            self.is_session_in_play(session_id) == in_play
        })
        .map_err(|err| HwError::SessionState {
            session_id,
            in_play,
            err,
        })
    }

    /// Submits the termination batch for `session_id` without waiting for
    /// the in-play bit to clear.
    pub fn submit_session_termination(&self, session_id: u8) -> Result<(), HwError> {
        let batch = session_termination_batch(session_id);
        self.streamer
            .submit(&batch, self.submit_timeout)
            .map_err(|err| HwError::Submit { session_id, err })
    }

    /// Terminates `session_id` and waits for hardware to confirm.
    pub fn terminate_session(&self, session_id: u8) -> Result<(), HwError> {
        self.submit_session_termination(session_id)?;
        self.wait_for_session_state(session_id, false)
    }
}

#[cfg(test)]
impl Hardware {
    /// Maps an emulated device with short poll timeouts.
    pub(crate) fn emulated(device: &pxp_backing_emulated_mock::EmulatedPxpDevice) -> Self {
        use pxp_backing::PxpDeviceBacking;

        let mut device = device.clone();
        let kcr = device.map_kcr().unwrap();
        let config = PxpConfig::new()
            .with_session_timeout(Duration::from_millis(20))
            .with_poll_interval(Duration::from_millis(1));
        Self::new(Box::new(kcr), device.command_streamer(), &config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pxp_backing_emulated_mock::DeviceEvent;
    use pxp_backing_emulated_mock::EmulatedPxpDevice;
    use pxp_backing_emulated_mock::FaultConfiguration;
    use test_log::test;

    #[test]
    fn termination_batch_layout() {
        let batch = session_termination_batch(5);
        assert_eq!(batch.first(), Some(&cmd::MFX_WAIT_PXP));
        assert_eq!(batch.last(), Some(&cmd::MI_BATCH_BUFFER_END));
        assert_eq!(
            batch.iter().filter_map(|&dw| cmd::appid_session(dw)).collect::<Vec<_>>(),
            [5]
        );
        let key_exchange = batch
            .iter()
            .position(|&dw| dw == cmd::CRYPTO_KEY_EXCHANGE)
            .unwrap();
        assert_eq!(batch[key_exchange + 1], 0);
    }

    #[test]
    fn enable_reads_back() {
        let device = EmulatedPxpDevice::new_gsc();
        let hw = Hardware::emulated(&device);
        hw.enable().unwrap();
        assert!(KcrInit::from_bits(device.kcr_init()).allow_display_me_writes());
        hw.disable();
        assert!(!KcrInit::from_bits(device.kcr_init()).allow_display_me_writes());
    }

    #[test]
    fn terminate_session_waits_for_clear() {
        let device = EmulatedPxpDevice::new_gsc();
        let hw = Hardware::emulated(&device);
        device.set_session_in_play(3, true);
        hw.terminate_session(3).unwrap();
        assert!(!hw.is_session_in_play(3));
        assert!(device.events().contains(&DeviceEvent::TerminationBatch(3)));
    }

    #[test]
    fn terminate_stuck_session_times_out() {
        let device = EmulatedPxpDevice::new_gsc();
        device.set_faults(FaultConfiguration::new().with_stuck_session(4));
        let hw = Hardware::emulated(&device);
        device.set_session_in_play(4, true);
        let err = hw.terminate_session(4).unwrap_err();
        assert!(matches!(
            err,
            HwError::SessionState {
                session_id: 4,
                in_play: false,
                ..
            }
        ));
    }

    #[test]
    fn attack_status() {
        let device = EmulatedPxpDevice::new_gsc();
        let hw = Hardware::emulated(&device);
        assert!(!hw.under_attack());
        device.raise_attack();
        assert!(hw.under_attack());
        hw.global_terminate();
        assert!(!hw.under_attack());
    }
}
