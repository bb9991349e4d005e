// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interfaces between the PXP driver and the rest of the GPU stack: register
//! access, interrupt delivery, command submission, DMA memory, the firmware
//! transports and user memory.

#![forbid(unsafe_code)]

pub mod memory;

use crate::memory::DmaBuffer;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Access to the KCR register block.
pub trait PxpRegisterIo: Send + Sync {
    /// Reads a register.
    fn read_u32(&self, offset: usize) -> u32;
    /// Writes a register.
    fn write_u32(&self, offset: usize, data: u32);
}

/// Called with the KCR interrupt identity bits each time the KCR interrupt
/// fires. May run in interrupt context and must not block.
pub type InterruptHandler = Arc<dyn Fn(u32) + Send + Sync>;

/// A GPU with protected content support.
pub trait PxpDeviceBacking: 'static + Send {
    /// The register mapping type.
    type Registers: 'static + PxpRegisterIo;

    /// Returns a device identifier for logging.
    fn id(&self) -> &str;

    /// Maps the KCR register block.
    fn map_kcr(&mut self) -> anyhow::Result<Self::Registers>;

    /// Routes KCR interrupts to `handler`.
    fn connect_interrupt(&mut self, handler: InterruptHandler) -> anyhow::Result<()>;

    /// The engine used to submit session termination batches.
    fn command_streamer(&self) -> Arc<dyn CommandStreamer>;

    /// The DMA allocator for buffers shared with the GSC engine.
    fn dma_client(&self) -> Arc<dyn DmaClient>;

    /// The firmware transport this device provides.
    fn firmware_transport(&self) -> FirmwareTransport;
}

/// How the driver reaches PXP firmware.
#[derive(Clone)]
pub enum FirmwareTransport {
    /// A GSC engine, with the proxy relay to the CSME.
    Gsc {
        /// The GSC command-streamer engine.
        engine: Arc<dyn GscEngine>,
        /// The CSME side of the proxy relay.
        trust_authority: Arc<dyn TrustAuthority>,
    },
    /// A TEE link to the CSME firmware client (pre-GSC platforms).
    Tee(Arc<dyn TeeLink>),
}

/// An error from a command submission.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The engine did not complete the submission in time.
    #[error("submission timed out")]
    Timeout,
    /// The engine was reset while the submission was outstanding.
    #[error("engine reset during submission")]
    EngineReset,
    /// The submission could not be queued.
    #[error("submission rejected: {0}")]
    Rejected(String),
}

/// The command streamer of the video engine.
pub trait CommandStreamer: Send + Sync {
    /// Submits a batch of dwords and waits for it to complete.
    fn submit(&self, batch: &[u32], timeout: Duration) -> Result<(), SubmitError>;
}

/// The GSC command-streamer engine.
pub trait GscEngine: Send + Sync {
    /// Submits the packet in `request[..request_len]`. The engine writes the
    /// reply to `response`, possibly after this returns; a reply is present
    /// once the validity marker at offset zero is non-zero.
    fn submit(
        &self,
        request: &DmaBuffer,
        request_len: usize,
        response: &DmaBuffer,
        timeout: Duration,
    ) -> Result<(), SubmitError>;
}

/// An error from a firmware transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint is not bound.
    #[error("firmware endpoint not connected")]
    NotConnected,
    /// The endpoint did not answer in time.
    #[error("firmware endpoint timed out")]
    Timeout,
    /// The reply does not fit the reply buffer.
    #[error("reply of {0} bytes does not fit")]
    ReplyTooLarge(usize),
    /// Any other transport failure.
    #[error("transport failure: {0}")]
    Io(String),
}

/// The CSME endpoint of the GSC proxy relay.
pub trait TrustAuthority: Send + Sync {
    /// Sends a relay message and writes the reply into `reply`, returning
    /// the reply length.
    fn exchange(&self, request: &[u8], reply: &mut [u8]) -> Result<usize, TransportError>;
}

/// A TEE link to the PXP firmware client.
pub trait TeeLink: Send + Sync {
    /// Returns true once the firmware client is bound.
    fn is_bound(&self) -> bool;

    /// Sends a message and writes the reply into `reply`, returning the
    /// reply length.
    fn send_recv(
        &self,
        request: &[u8],
        reply: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;
}

/// Allocates memory shared with the device.
pub trait DmaClient: Send + Sync {
    /// Allocates a zeroed buffer of `len` bytes.
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<DmaBuffer>;
}

/// The set of GPU execution contexts using protected content.
pub trait ProtectedContextRegistry: Send + Sync {
    /// Schedules every protected context for abandonment. Called from the
    /// session worker, or synchronously by a final teardown, before any
    /// session is torn down.
    fn invalidate_protected_contexts(&self);
}

/// A bad user address.
#[derive(Debug, Error)]
#[error("bad user address {addr:#x} (len {len})")]
pub struct UserMemoryError {
    /// The address.
    pub addr: u64,
    /// The access length.
    pub len: usize,
}

/// The caller's address space.
pub trait UserMemory {
    /// Copies from user memory.
    fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), UserMemoryError>;
    /// Copies to user memory.
    fn write(&self, addr: u64, data: &[u8]) -> Result<(), UserMemoryError>;
}
