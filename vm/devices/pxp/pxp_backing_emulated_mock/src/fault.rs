// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fault definitions for the emulated PXP device.

/// A buildable fault configuration.
#[derive(Debug, Clone)]
pub struct FaultConfiguration {
    /// Sessions (bitmap) whose in-play bit never clears.
    pub stuck_sessions: u32,
    /// Global termination does not raise the reset-complete interrupt.
    pub suppress_reset_complete: bool,
    /// The GSC engine never writes a reply.
    pub gsc_no_response: bool,
    /// Number of GSC replies flagged pending before a real reply.
    pub gsc_pending_replies: u32,
    /// Number of CSME round-trips the GSC proxy asks for before `End`.
    pub proxy_rounds: u32,
    /// The GSC proxy addresses its messages to the driver instead of the
    /// CSME.
    pub proxy_bad_addressing: bool,
    /// Firmware answers every command with `NOT_READY`.
    pub fw_not_ready: bool,
    /// Firmware acknowledges `INIT_SESSION` without starting the session.
    pub fw_ignore_init: bool,
    /// Command-streamer submissions time out.
    pub streamer_timeout: bool,
}

impl FaultConfiguration {
    /// Create a fault configuration describing a healthy device.
    pub fn new() -> Self {
        Self {
            stuck_sessions: 0,
            suppress_reset_complete: false,
            gsc_no_response: false,
            gsc_pending_replies: 0,
            proxy_rounds: 1,
            proxy_bad_addressing: false,
            fw_not_ready: false,
            fw_ignore_init: false,
            streamer_timeout: false,
        }
    }

    /// Keep the in-play bit of `session_id` set.
    pub fn with_stuck_session(mut self, session_id: u8) -> Self {
        self.stuck_sessions |= 1 << session_id;
        self
    }

    /// Do not raise reset-complete after a global termination.
    pub fn with_suppressed_reset_complete(mut self) -> Self {
        self.suppress_reset_complete = true;
        self
    }

    /// Never reply to GSC submissions.
    pub fn with_gsc_no_response(mut self) -> Self {
        self.gsc_no_response = true;
        self
    }

    /// Flag the next `count` GSC replies pending.
    pub fn with_gsc_pending_replies(mut self, count: u32) -> Self {
        self.gsc_pending_replies = count;
        self
    }

    /// Set the number of CSME round-trips per proxy exchange.
    pub fn with_proxy_rounds(mut self, rounds: u32) -> Self {
        self.proxy_rounds = rounds;
        self
    }

    /// Misaddress proxy messages.
    pub fn with_proxy_bad_addressing(mut self) -> Self {
        self.proxy_bad_addressing = true;
        self
    }

    /// Answer firmware commands with `NOT_READY`.
    pub fn with_fw_not_ready(mut self) -> Self {
        self.fw_not_ready = true;
        self
    }

    /// Acknowledge `INIT_SESSION` without starting the session.
    pub fn with_fw_ignore_init(mut self) -> Self {
        self.fw_ignore_init = true;
        self
    }

    /// Time out command-streamer submissions.
    pub fn with_streamer_timeout(mut self) -> Self {
        self.streamer_timeout = true;
        self
    }
}
