// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Control operations exposed to callers.
//!
//! A caller passes a [`PxpOps`] naming an action and the user address of the
//! action's parameter block. The driver writes the outcome to
//! [`PxpOps::status`] and any outputs back to the parameter block.

use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Largest message accepted by [`PxpAction::TEE_IO_MESSAGE`].
pub const PXP_MAX_TEE_MESSAGE_SIZE: u32 = 64 * 1024;

open_enum! {
    /// A control operation.
    pub enum PxpAction: u32 {
        /// [`SetSessionStatusParams`].
        SET_SESSION_STATUS = 0,
        /// [`TeeIoMessageParams`].
        TEE_IO_MESSAGE = 1,
        /// [`QueryTagParams`].
        QUERY_PXP_TAG = 2,
        /// [`HostSessionHandleParams`].
        HOST_SESSION_HANDLE_REQ = 3,
    }
}

open_enum! {
    /// Outcome of a control operation.
    pub enum PxpOpStatus: u32 {
        /// The operation completed.
        SUCCESS = 0,
        /// Transient failure; the caller should retry.
        RETRY_REQUIRED = 1,
        /// Protected content is not available right now.
        SESSION_NOT_AVAILABLE = 2,
        /// Unexpected failure.
        ERROR_UNKNOWN = 3,
        /// The request was malformed or not permitted.
        ERROR_INVALID = 4,
    }
}

open_enum! {
    /// Session protection mode.
    pub enum PxpSessionMode: u32 {
        /// Lite mode.
        LM = 0,
        /// Heavy mode.
        HM = 1,
        /// Stout mode.
        SM = 2,
    }
}

open_enum! {
    /// Requested session transition for [`PxpAction::SET_SESSION_STATUS`].
    pub enum PxpReqState: u32 {
        /// Reserve a session slot.
        INIT = 0,
        /// The caller started the session in firmware.
        IN_PLAY = 1,
        /// Terminate the session.
        TERMINATE = 2,
    }
}

open_enum! {
    /// Request type for [`PxpAction::HOST_SESSION_HANDLE_REQ`].
    pub enum PxpHostSessionRequest: u32 {
        /// Get (or create) the caller's handle.
        INIT = 0,
    }
}

/// The control operation envelope.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PxpOps {
    /// A [`PxpAction`].
    pub action: u32,
    /// Output: a [`PxpOpStatus`].
    pub status: u32,
    /// User address of the action's parameter block.
    pub params: u64,
}

/// Parameters of [`PxpAction::SET_SESSION_STATUS`].
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SetSessionStatusParams {
    /// Input for `IN_PLAY` and `TERMINATE`, output for `INIT`.
    pub pxp_tag: u32,
    /// A [`PxpSessionMode`], used by `INIT`.
    pub session_mode: u32,
    /// A [`PxpReqState`].
    pub req_state: u32,
}

/// Parameters of [`PxpAction::TEE_IO_MESSAGE`].
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TeeIoMessageParams {
    /// User address of the request.
    pub msg_in: u64,
    /// User address of the reply buffer.
    pub msg_out: u64,
    /// Request size.
    pub msg_in_size: u32,
    /// Reply buffer size.
    pub msg_out_buf_size: u32,
    /// Output: reply size.
    pub msg_out_ret_size: u32,
    /// Must be zero.
    pub rsvd: u32,
}

/// Parameters of [`PxpAction::QUERY_PXP_TAG`].
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct QueryTagParams {
    /// Output: non-zero if the session is alive.
    pub session_is_alive: u32,
    /// Input: a tag naming the slot. Output: the slot's current tag.
    pub pxp_tag: u32,
}

/// Parameters of [`PxpAction::HOST_SESSION_HANDLE_REQ`].
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HostSessionHandleParams {
    /// A [`PxpHostSessionRequest`].
    pub request_type: u32,
    /// Must be zero.
    pub rsvd: u32,
    /// Output: the caller's host session handle.
    pub host_session_handle: u64,
}

const_assert_eq!(size_of::<PxpOps>(), 16);
const_assert_eq!(size_of::<SetSessionStatusParams>(), 12);
const_assert_eq!(size_of::<TeeIoMessageParams>(), 32);
const_assert_eq!(size_of::<QueryTagParams>(), 8);
const_assert_eq!(size_of::<HostSessionHandleParams>(), 16);
