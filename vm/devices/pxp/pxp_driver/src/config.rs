// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tunables for the trust manager.

use crate::retry::RetryPolicy;
use pxp_spec::ioctl::PXP_MAX_TEE_MESSAGE_SIZE;
use std::time::Duration;

/// Timeouts and limits used by the trust manager.
#[derive(Debug, Clone)]
pub struct PxpConfig {
    /// How long to wait for a session's in-play bit to change.
    pub session_timeout: Duration,
    /// Interval between register polls.
    pub poll_interval: Duration,
    /// Timeout for a command-streamer termination batch.
    pub submit_timeout: Duration,
    /// How long to wait for a GSC reply, or a TEE link reply.
    pub relay_response_timeout: Duration,
    /// Retry budget for GSC replies flagged pending.
    pub pending_retry: RetryPolicy,
    /// Upper bound on GSC/CSME round-trips in one proxy exchange.
    pub max_relay_round_trips: u32,
    /// How long to wait for a global termination to complete with a TEE
    /// backend.
    pub tee_termination_timeout: Duration,
    /// How long to wait for a global termination to complete with a GSC
    /// backend.
    pub gsc_termination_timeout: Duration,
    /// Largest caller message passed through to firmware.
    pub max_tee_message_size: usize,
}

impl Default for PxpConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_millis(250),
            poll_interval: Duration::from_millis(1),
            submit_timeout: Duration::from_millis(250),
            relay_response_timeout: Duration::from_millis(500),
            pending_retry: RetryPolicy {
                max_attempts: 100,
                backoff: Duration::from_millis(20),
            },
            max_relay_round_trips: 64,
            tee_termination_timeout: Duration::from_millis(250),
            gsc_termination_timeout: Duration::from_secs(5),
            max_tee_message_size: PXP_MAX_TEE_MESSAGE_SIZE as usize,
        }
    }
}

impl PxpConfig {
    /// Create a configuration with the default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session state poll timeout.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Set the register poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the termination batch timeout.
    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }

    /// Set the GSC/TEE reply timeout.
    pub fn with_relay_response_timeout(mut self, timeout: Duration) -> Self {
        self.relay_response_timeout = timeout;
        self
    }

    /// Set the pending-reply retry policy.
    pub fn with_pending_retry(mut self, policy: RetryPolicy) -> Self {
        self.pending_retry = policy;
        self
    }

    /// Set the proxy round-trip cap.
    pub fn with_max_relay_round_trips(mut self, max: u32) -> Self {
        self.max_relay_round_trips = max;
        self
    }

    /// Set the termination timeouts for both backends.
    pub fn with_termination_timeout(mut self, timeout: Duration) -> Self {
        self.tee_termination_timeout = timeout;
        self.gsc_termination_timeout = timeout;
        self
    }

    /// Set the largest pass-through message.
    pub fn with_max_tee_message_size(mut self, size: usize) -> Self {
        self.max_tee_message_size = size;
        self
    }
}
