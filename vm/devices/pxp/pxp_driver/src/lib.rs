// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Trust manager for GPU protected content (PXP).
//!
//! Owns the arbitration session used by the display engine and the 15 caller
//! sessions, terminates and re-creates them after hardware teardown events,
//! and relays firmware traffic between the GSC engine and the CSME.

#![forbid(unsafe_code)]

mod backend;
mod channel;
mod codec;
mod config;
mod coordinator;
mod hw;
mod ioctl;
mod irq;
mod manager;
mod proxy;
mod retry;
mod session;


pub use backend::BackendError;
pub use backend::BackendKind;
pub use channel::ChannelError;
pub use codec::CodecError;
pub use config::PxpConfig;
pub use coordinator::PxpError;
pub use coordinator::PxpState;
pub use coordinator::TeardownKind;
pub use hw::HwError;
pub use manager::PxpFile;
pub use manager::TeeIoError;
pub use manager::TrustManager;
pub use proxy::RelayError;
pub use retry::PendingExhausted;
pub use retry::PollTimeout;
pub use retry::RetryPolicy;
pub use session::OwnerId;
pub use session::SessionError;
