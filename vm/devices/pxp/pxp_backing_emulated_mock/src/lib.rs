// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An emulated PXP-capable GPU: KCR registers, the session-in-play bitmap, a
//! command streamer that executes termination batches, a GSC engine with the
//! PXP firmware client and the proxy relay, a CSME endpoint and a TEE link.
//!
//! Everything in this crate is meant for TESTING PURPOSES ONLY and it should
//! only ever be added as a dev-dependency.

#![forbid(unsafe_code)]

mod fault;
mod firmware;
mod gsc;

pub use fault::FaultConfiguration;

use crate::firmware::EmulatedTee;
use crate::gsc::EmulatedCsme;
use crate::gsc::EmulatedGsc;
use parking_lot::Mutex;
use pxp_backing::CommandStreamer;
use pxp_backing::DmaClient;
use pxp_backing::FirmwareTransport;
use pxp_backing::InterruptHandler;
use pxp_backing::ProtectedContextRegistry;
use pxp_backing::PxpDeviceBacking;
use pxp_backing::PxpRegisterIo;
use pxp_backing::SubmitError;
use pxp_backing::UserMemory;
use pxp_backing::UserMemoryError;
use pxp_backing::memory::DmaBuffer;
use pxp_spec::cmd;
use pxp_spec::gsc::GscClientId;
use pxp_spec::kcr;
use pxp_spec::kcr::KcrInterrupt;
use pxp_spec::kcr::KcrStatus;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// Something the emulated device observed or did, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// `KCR_INIT` was written; the new register value.
    KcrInit(u32),
    /// `KCR_GLOBAL_TERMINATE` was triggered.
    GlobalTerminate,
    /// Firmware started a session.
    SessionStarted(u8),
    /// A session's in-play bit cleared.
    SessionTerminated(u8),
    /// Firmware processed `INVALIDATE_STREAM_KEY` for a session.
    StreamKeyInvalidated(u8),
    /// The command streamer ran a termination batch for a session.
    TerminationBatch(u8),
    /// The protected context registry was asked to invalidate.
    ContextsInvalidated,
    /// A KCR interrupt was delivered.
    Interrupt(u32),
    /// A packet was submitted to the GSC engine.
    GscSubmit {
        /// Destination client.
        client: GscClientId,
        /// Message handle carried by the request.
        message_handle: u64,
        /// Host session handle carried by the request.
        host_session_handle: u64,
        /// The session cleanup flag was set.
        cleanup: bool,
    },
    /// A relay message was delivered to the CSME.
    CsmeExchange,
}

#[derive(Default)]
struct KcrState {
    init: u32,
    status: KcrStatus,
    sip: u32,
}

struct DeviceState {
    kcr: Mutex<KcrState>,
    interrupt: Mutex<Option<InterruptHandler>>,
    faults: Mutex<FaultConfiguration>,
    events: Mutex<Vec<DeviceEvent>>,
    next_message_handle: AtomicU64,
    tee_bound: AtomicBool,
    next_iova: AtomicU64,
}

impl DeviceState {
    fn record(&self, event: DeviceEvent) {
        tracing::trace!(?event, "device event");
        self.events.lock().push(event);
    }

    fn faults(&self) -> FaultConfiguration {
        self.faults.lock().clone()
    }

    fn raise(&self, iir: KcrInterrupt) {
        let handler = self.interrupt.lock().clone();
        self.record(DeviceEvent::Interrupt(iir.into_bits()));
        if let Some(handler) = handler {
            handler(iir.into_bits());
        } else {
            tracing::info!("interrupt ignored");
        }
    }

    fn start_session(&self, session_id: u8) {
        self.kcr.lock().sip |= kcr::sip_bit(session_id);
        self.record(DeviceEvent::SessionStarted(session_id));
    }

    fn end_session(&self, session_id: u8) {
        if self.faults().stuck_sessions & kcr::sip_bit(session_id) != 0 {
            return;
        }
        let was_set = {
            let mut regs = self.kcr.lock();
            let was_set = regs.sip & kcr::sip_bit(session_id) != 0;
            regs.sip &= !kcr::sip_bit(session_id);
            was_set
        };
        if was_set {
            self.record(DeviceEvent::SessionTerminated(session_id));
        }
    }

    fn global_terminate(&self) {
        let faults = self.faults();
        {
            let mut regs = self.kcr.lock();
            regs.sip &= faults.stuck_sessions;
            regs.status = KcrStatus::new();
        }
        self.record(DeviceEvent::GlobalTerminate);
        if !faults.suppress_reset_complete {
            self.raise(KcrInterrupt::new().with_state_reset_complete(true));
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TransportKind {
    Gsc,
    Tee,
}

/// An emulated PXP device. Clones refer to the same device, so a test can
/// keep one to drive and inspect the device while the driver owns another.
#[derive(Clone)]
pub struct EmulatedPxpDevice {
    state: Arc<DeviceState>,
    transport: TransportKind,
    contexts: Arc<EmulatedContextRegistry>,
}

impl EmulatedPxpDevice {
    fn new(transport: TransportKind) -> Self {
        let state = Arc::new(DeviceState {
            kcr: Mutex::new(KcrState::default()),
            interrupt: Mutex::new(None),
            faults: Mutex::new(FaultConfiguration::new()),
            events: Mutex::new(Vec::new()),
            next_message_handle: AtomicU64::new(0x1000),
            tee_bound: AtomicBool::new(true),
            next_iova: AtomicU64::new(0x10_0000),
        });
        let contexts = Arc::new(EmulatedContextRegistry {
            state: state.clone(),
        });
        Self {
            state,
            transport,
            contexts,
        }
    }

    /// Creates a device with a GSC engine and proxy relay.
    pub fn new_gsc() -> Self {
        Self::new(TransportKind::Gsc)
    }

    /// Creates a device with a TEE link.
    pub fn new_tee() -> Self {
        Self::new(TransportKind::Tee)
    }

    /// Replaces the fault configuration.
    pub fn set_faults(&self, faults: FaultConfiguration) {
        *self.state.faults.lock() = faults;
    }

    /// Returns everything the device observed so far.
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.state.events.lock().clone()
    }

    /// Forgets observed events.
    pub fn clear_events(&self) {
        self.state.events.lock().clear();
    }

    /// The GSC submissions observed so far.
    pub fn gsc_submissions(&self) -> Vec<DeviceEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, DeviceEvent::GscSubmit { .. }))
            .collect()
    }

    /// The current session-in-play bitmap.
    pub fn session_in_play_mask(&self) -> u32 {
        self.state.kcr.lock().sip
    }

    /// Sets or clears a session's in-play bit behind the driver's back.
    pub fn set_session_in_play(&self, session_id: u8, in_play: bool) {
        let mut regs = self.state.kcr.lock();
        if in_play {
            regs.sip |= kcr::sip_bit(session_id);
        } else {
            regs.sip &= !kcr::sip_bit(session_id);
        }
    }

    /// The current `KCR_INIT` value.
    pub fn kcr_init(&self) -> u32 {
        self.state.kcr.lock().init
    }

    /// Simulates a hardware attack: all keys are dropped and the
    /// state-terminated interrupt fires.
    pub fn raise_attack(&self) {
        {
            let mut regs = self.state.kcr.lock();
            regs.status.set_attack_detected(true);
            regs.sip = 0;
        }
        self.state
            .raise(KcrInterrupt::new().with_state_terminated(true));
    }

    /// Delivers an arbitrary KCR interrupt.
    pub fn raise_interrupt(&self, iir: KcrInterrupt) {
        self.state.raise(iir);
    }

    /// Binds or unbinds the TEE firmware client.
    pub fn set_tee_bound(&self, bound: bool) {
        self.state.tee_bound.store(bound, Ordering::SeqCst);
    }

    /// The protected context registry of this device.
    pub fn context_registry(&self) -> Arc<EmulatedContextRegistry> {
        self.contexts.clone()
    }
}

impl PxpDeviceBacking for EmulatedPxpDevice {
    type Registers = EmulatedKcr;

    fn id(&self) -> &str {
        "emulated"
    }

    fn map_kcr(&mut self) -> anyhow::Result<Self::Registers> {
        Ok(EmulatedKcr {
            state: self.state.clone(),
        })
    }

    fn connect_interrupt(&mut self, handler: InterruptHandler) -> anyhow::Result<()> {
        let mut interrupt = self.state.interrupt.lock();
        if interrupt.is_some() {
            anyhow::bail!("interrupt already connected");
        }
        *interrupt = Some(handler);
        Ok(())
    }

    fn command_streamer(&self) -> Arc<dyn CommandStreamer> {
        Arc::new(EmulatedCommandStreamer {
            state: self.state.clone(),
        })
    }

    fn dma_client(&self) -> Arc<dyn DmaClient> {
        Arc::new(EmulatedDmaClient {
            state: self.state.clone(),
        })
    }

    fn firmware_transport(&self) -> FirmwareTransport {
        match self.transport {
            TransportKind::Gsc => FirmwareTransport::Gsc {
                engine: Arc::new(EmulatedGsc::new(self.state.clone())),
                trust_authority: Arc::new(EmulatedCsme::new(self.state.clone())),
            },
            TransportKind::Tee => {
                FirmwareTransport::Tee(Arc::new(EmulatedTee::new(self.state.clone())))
            }
        }
    }
}

/// The KCR register mapping of an [`EmulatedPxpDevice`].
pub struct EmulatedKcr {
    state: Arc<DeviceState>,
}

impl PxpRegisterIo for EmulatedKcr {
    fn read_u32(&self, offset: usize) -> u32 {
        let regs = self.state.kcr.lock();
        match offset {
            kcr::KCR_INIT => regs.init,
            kcr::KCR_STATUS => regs.status.into_bits(),
            kcr::KCR_SIP => regs.sip,
            _ => 0,
        }
    }

    fn write_u32(&self, offset: usize, data: u32) {
        match offset {
            kcr::KCR_INIT => {
                let init = {
                    let mut regs = self.state.kcr.lock();
                    let mask = data >> 16;
                    regs.init = (regs.init & !mask) | (data & mask);
                    regs.init
                };
                self.state.record(DeviceEvent::KcrInit(init));
            }
            kcr::KCR_GLOBAL_TERMINATE if data & 1 != 0 => self.state.global_terminate(),
            _ => tracing::debug!(offset, data, "ignored kcr write"),
        }
    }
}

struct EmulatedCommandStreamer {
    state: Arc<DeviceState>,
}

impl CommandStreamer for EmulatedCommandStreamer {
    fn submit(&self, batch: &[u32], _timeout: Duration) -> Result<(), SubmitError> {
        if self.state.faults().streamer_timeout {
            return Err(SubmitError::Timeout);
        }
        let session = batch.iter().find_map(|&dw| cmd::appid_session(dw));
        if let Some(session_id) = session {
            if batch.contains(&cmd::CRYPTO_KEY_EXCHANGE) {
                self.state.record(DeviceEvent::TerminationBatch(session_id));
                self.state.end_session(session_id);
            }
        }
        Ok(())
    }
}

struct EmulatedDmaClient {
    state: Arc<DeviceState>,
}

impl DmaClient for EmulatedDmaClient {
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<DmaBuffer> {
        let iova = self
            .state
            .next_iova
            .fetch_add(len.next_multiple_of(4096) as u64, Ordering::Relaxed);
        Ok(DmaBuffer::new(iova, len))
    }
}

/// Records context invalidation requests as [`DeviceEvent::ContextsInvalidated`].
pub struct EmulatedContextRegistry {
    state: Arc<DeviceState>,
}

impl ProtectedContextRegistry for EmulatedContextRegistry {
    fn invalidate_protected_contexts(&self) {
        self.state.record(DeviceEvent::ContextsInvalidated);
    }
}

/// A flat user address space.
pub struct EmulatedUserMemory {
    regions: Mutex<Vec<(u64, Vec<u8>)>>,
    next: AtomicU64,
}

impl EmulatedUserMemory {
    /// Creates an empty address space.
    pub fn new() -> Self {
        Self {
            regions: Mutex::new(Vec::new()),
            next: AtomicU64::new(0x7f00_0000),
        }
    }

    /// Maps a region holding `data` and returns its address.
    pub fn alloc_bytes(&self, data: &[u8]) -> u64 {
        let addr = self
            .next
            .fetch_add((data.len() as u64 + 1).next_multiple_of(4096), Ordering::Relaxed);
        self.regions.lock().push((addr, data.to_vec()));
        addr
    }

    /// Maps a zeroed region of `len` bytes and returns its address.
    pub fn alloc(&self, len: usize) -> u64 {
        self.alloc_bytes(&vec![0; len])
    }

    /// Maps a region holding `obj` and returns its address.
    pub fn alloc_obj<T: IntoBytes + Immutable>(&self, obj: &T) -> u64 {
        self.alloc_bytes(obj.as_bytes())
    }

    /// Reads `len` bytes at `addr`.
    ///
    /// # Panics
    /// Panics if the range is not mapped.
    pub fn read_bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0; len];
        self.read(addr, &mut data).unwrap();
        data
    }

    /// Reads an object at `addr`.
    ///
    /// # Panics
    /// Panics if the range is not mapped.
    pub fn read_obj<T: FromBytes + IntoBytes>(&self, addr: u64) -> T {
        let mut obj = T::new_zeroed();
        self.read(addr, obj.as_mut_bytes()).unwrap();
        obj
    }

    fn access<R>(
        &self,
        addr: u64,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, UserMemoryError> {
        let mut regions = self.regions.lock();
        for (base, data) in regions.iter_mut() {
            if addr >= *base && addr + len as u64 <= *base + data.len() as u64 {
                let start = (addr - *base) as usize;
                return Ok(f(&mut data[start..start + len]));
            }
        }
        Err(UserMemoryError { addr, len })
    }
}

impl UserMemory for EmulatedUserMemory {
    fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), UserMemoryError> {
        self.access(addr, data.len(), |mem| data.copy_from_slice(mem))
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<(), UserMemoryError> {
        self.access(addr, data.len(), |mem| mem.copy_from_slice(data))
    }
}
