// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The trust manager and the per-caller handle.

use crate::backend::BackendError;
use crate::backend::BackendKind;
use crate::backend::PxpBackend;
use crate::backend::generate_host_session_handle;
use crate::backend::new_backend;
use crate::config::PxpConfig;
use crate::coordinator::Coordinator;
use crate::coordinator::PxpError;
use crate::coordinator::PxpState;
use crate::coordinator::TeardownKind;
use crate::hw::Hardware;
use crate::irq::EventBridge;
use crate::session::OwnerId;
use crate::session::SessionError;
use crate::session::SessionManager;
use anyhow::Context;
use parking_lot::Mutex;
use pxp_backing::ProtectedContextRegistry;
use pxp_backing::PxpDeviceBacking;
use pxp_spec::ARB_SESSION;
use pxp_spec::ioctl::PxpSessionMode;
use pxp_spec::tag::PxpTag;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use thiserror::Error;

/// A pass-through firmware message failed.
#[derive(Debug, Error)]
pub enum TeeIoError {
    /// A message exceeds the pass-through limit.
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    TooBig {
        /// The message size.
        size: usize,
        /// The limit.
        max: usize,
    },
    /// The firmware path is not established.
    #[error("firmware backend not ready")]
    NotReady(#[source] BackendError),
    /// The caller's host session handle could not be created.
    #[error("no host session handle")]
    HostSession(#[source] BackendError),
    /// The firmware exchange failed.
    #[error("firmware message failed")]
    Backend(#[source] BackendError),
    /// The device is suspended.
    #[error("device is suspended")]
    Suspended,
}

/// State shared by the trust manager, its callers, the interrupt handler and
/// the session worker.
pub(crate) struct PxpCore {
    pub config: PxpConfig,
    pub hw: Hardware,
    pub sessions: SessionManager,
    pub backend: Box<dyn PxpBackend>,
    pub coordinator: Coordinator,
    pub events: EventBridge,
    pub contexts: Arc<dyn ProtectedContextRegistry>,
    host_session_handles: Mutex<HashMap<OwnerId, u64>>,
    next_owner: AtomicU64,
}

impl PxpCore {
    fn host_session_handle(&self, owner: OwnerId) -> Result<u64, BackendError> {
        if !self.backend.supports_host_sessions() {
            return Err(BackendError::HostSessionsUnsupported);
        }
        let mut handles = self.host_session_handles.lock();
        if let Some(&handle) = handles.get(&owner) {
            return Ok(handle);
        }
        let handle = generate_host_session_handle()?;
        handles.insert(owner, handle);
        tracing::debug!(owner = owner.0, "host session handle created");
        Ok(handle)
    }

    fn close_owner(&self, owner: OwnerId) {
        self.sessions.close_owner(&self.hw, owner);
        let handle = self.host_session_handles.lock().remove(&owner);
        if let Some(handle) = handle {
            if let Err(err) = self.backend.cleanup_host_session(handle) {
                tracing::warn!(
                    owner = owner.0,
                    error = &err as &dyn std::error::Error,
                    "failed to clean up host session"
                );
            }
        }
    }
}

fn run_worker(core: Arc<PxpCore>) {
    while let Some(events) = core.events.wait_for_work() {
        core.process_events(events);
        core.events.work_done();
    }
    tracing::debug!("pxp session worker exiting");
}

/// Owns the protected session state of one device.
pub struct TrustManager {
    core: Arc<PxpCore>,
    worker: Option<JoinHandle<()>>,
}

impl TrustManager {
    /// Takes over PXP on `device`: maps the KCR registers, selects the
    /// firmware backend, hooks the interrupt, enables PXP and attempts to
    /// establish the arbitration session. Failing to establish it is not
    /// fatal; it is retried by the next operation that needs it.
    pub fn new<T: PxpDeviceBacking>(
        device: &mut T,
        contexts: Arc<dyn ProtectedContextRegistry>,
        config: PxpConfig,
    ) -> anyhow::Result<Self> {
        let kcr = device.map_kcr().context("failed to map kcr registers")?;
        let hw = Hardware::new(Box::new(kcr), device.command_streamer(), &config);
        let backend = new_backend(
            device.firmware_transport(),
            device.dma_client().as_ref(),
            &config,
        )
        .context("failed to create firmware backend")?;
        let backend_kind = backend.kind();

        let core = Arc::new(PxpCore {
            config,
            hw,
            sessions: SessionManager::new(),
            backend,
            coordinator: Coordinator::new(),
            events: EventBridge::new(),
            contexts,
            host_session_handles: Mutex::new(HashMap::new()),
            next_owner: AtomicU64::new(1),
        });

        let weak: Weak<PxpCore> = Arc::downgrade(&core);
        device
            .connect_interrupt(Arc::new(move |iir: u32| {
                if let Some(core) = weak.upgrade() {
                    core.handle_irq(iir);
                }
            }))
            .context("failed to connect pxp interrupt")?;

        let worker = std::thread::Builder::new()
            .name("pxp-session-worker".into())
            .spawn({
                let core = core.clone();
                move || run_worker(core)
            })
            .context("failed to spawn pxp session worker")?;

        let this = Self {
            core,
            worker: Some(worker),
        };

        this.core.hw.enable().context("failed to enable pxp")?;
        tracing::info!(device = device.id(), backend = ?backend_kind, "pxp enabled");

        if let Err(err) = this.core.start() {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "arbitration session not established at init"
            );
        }
        Ok(this)
    }

    /// Opens a caller handle. Sessions reserved through it are terminated
    /// when it is dropped.
    pub fn open(&self) -> PxpFile {
        let owner = OwnerId(self.core.next_owner.fetch_add(1, Ordering::Relaxed));
        PxpFile {
            core: self.core.clone(),
            owner,
        }
    }

    /// Makes sure the arbitration session is valid.
    pub fn start(&self) -> Result<(), PxpError> {
        self.core.start()
    }

    /// Terminates every session.
    pub fn terminate_global(&self, kind: TeardownKind) -> Result<(), PxpError> {
        self.core.terminate_global(kind)
    }

    /// The current arbitration lifecycle state.
    pub fn state(&self) -> PxpState {
        self.core.coordinator.state()
    }

    /// The arbitration session tag, if the session is valid.
    pub fn arbitration_tag(&self) -> Option<PxpTag> {
        self.core
            .coordinator
            .arb_is_valid()
            .then(|| self.core.coordinator.arb_tag())
    }

    /// The current protection key instance. Protected contexts capture this
    /// at creation and validate it with [`TrustManager::key_check`].
    pub fn key_instance(&self) -> u32 {
        self.core.coordinator.key_instance()
    }

    /// Fails if the key captured as `instance` is no longer current.
    pub fn key_check(&self, instance: u32) -> Result<(), PxpError> {
        self.core.key_check(instance)
    }

    /// The firmware backend in use.
    pub fn backend_kind(&self) -> BackendKind {
        self.core.backend.kind()
    }

    /// Drains the worker, tears down every session and disables PXP. Caller
    /// sessions are not restored by [`TrustManager::resume`].
    pub fn suspend(&self) -> Result<(), PxpError> {
        self.core.events.flush();
        let result = self.core.terminate_global(TeardownKind::Final);
        self.core.sessions.clear();
        self.core.hw.disable();
        self.core.coordinator.force_state(PxpState::Suspended);
        tracing::info!("pxp suspended");
        result
    }

    /// Re-enables PXP after [`TrustManager::suspend`] and re-creates the
    /// arbitration session.
    pub fn resume(&self) -> Result<(), PxpError> {
        let coordinator = &self.core.coordinator;
        coordinator.clear_final_teardown();
        coordinator.force_state(PxpState::Uninitialized);
        self.core.hw.enable().map_err(PxpError::Hardware)?;
        tracing::info!("pxp resumed");
        self.core.start()
    }

    /// Tears everything down and disables PXP.
    pub fn shutdown(mut self) {
        if let Err(err) = self.core.terminate_global(TeardownKind::Final) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "final pxp teardown failed"
            );
        }
        let backend = &self.core.backend;
        if backend.supports_host_sessions() {
            if let Err(err) = backend.cleanup_host_session(backend.default_host_session_handle()) {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to clean up driver host session"
                );
            }
        }
        self.core.hw.disable();
        self.stop_worker();
    }

    fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.core.events.shutdown();
            if worker.join().is_err() {
                tracing::error!("pxp session worker panicked");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &PxpCore {
        &self.core
    }
}

impl Drop for TrustManager {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

/// A caller's handle to the trust manager. Sessions are owned by the handle
/// that reserved them.
pub struct PxpFile {
    core: Arc<PxpCore>,
    owner: OwnerId,
}

impl PxpFile {
    /// The identity sessions reserved through this handle are owned by.
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    fn check_suspended(&self) -> Result<(), SessionError> {
        if self.core.coordinator.state() == PxpState::Suspended {
            return Err(SessionError::Suspended);
        }
        Ok(())
    }

    /// Reserves a session slot. The arbitration session is brought up first
    /// if needed.
    pub fn reserve_session(&self, mode: PxpSessionMode) -> Result<PxpTag, SessionError> {
        self.check_suspended()?;
        self.core.sessions.reconcile(&self.core.hw);
        if let Err(err) = self.core.start() {
            tracing::debug!(
                error = &err as &dyn std::error::Error,
                "arbitration session unavailable"
            );
            return Err(match err {
                PxpError::Suspended | PxpError::Terminated => SessionError::Suspended,
                _ => SessionError::Busy,
            });
        }
        self.core.sessions.reserve(&self.core.hw, self.owner, mode)
    }

    /// Marks a reserved session in play once hardware confirms it.
    pub fn mark_session_in_play(&self, tag: PxpTag) -> Result<(), SessionError> {
        self.check_suspended()?;
        self.core.sessions.reconcile(&self.core.hw);
        self.core
            .sessions
            .mark_in_play(&self.core.hw, self.owner, tag)
    }

    /// Terminates a session and frees its slot.
    pub fn terminate_session(&self, tag: PxpTag) -> Result<(), SessionError> {
        self.check_suspended()?;
        self.core.sessions.reconcile(&self.core.hw);
        self.core.sessions.terminate(&self.core.hw, self.owner, tag)
    }

    /// Looks up the slot named by `tag`. Returns the slot's current tag and
    /// whether the session is alive, or [`PxpTag::NONE`] if the slot is free.
    pub fn query_tag(&self, tag: PxpTag) -> (PxpTag, bool) {
        if tag.session_id() == ARB_SESSION {
            return self.core.query_arb_tag();
        }
        self.core.sessions.reconcile(&self.core.hw);
        self.core.sessions.query(tag)
    }

    /// Returns this caller's host session handle, creating it on first use.
    pub fn host_session_handle(&self) -> Result<u64, BackendError> {
        self.core.host_session_handle(self.owner)
    }

    pub(crate) fn max_tee_message_size(&self) -> usize {
        self.core.config.max_tee_message_size
    }

    /// Passes an opaque message to firmware on behalf of this caller and
    /// returns the reply length.
    pub fn tee_io_message(&self, request: &[u8], reply: &mut [u8]) -> Result<usize, TeeIoError> {
        if self.core.coordinator.state() == PxpState::Suspended {
            return Err(TeeIoError::Suspended);
        }
        let max = self.max_tee_message_size();
        for size in [request.len(), reply.len()] {
            if size > max {
                return Err(TeeIoError::TooBig { size, max });
            }
        }
        let backend = &self.core.backend;
        backend.ensure_ready().map_err(TeeIoError::NotReady)?;
        let handle = if backend.supports_host_sessions() {
            self.host_session_handle()
                .map_err(TeeIoError::HostSession)?
        } else {
            0
        };
        backend
            .send_message(handle, request, reply)
            .map_err(TeeIoError::Backend)
    }
}

impl Drop for PxpFile {
    fn drop(&mut self) {
        self.core.close_owner(self.owner);
    }
}
