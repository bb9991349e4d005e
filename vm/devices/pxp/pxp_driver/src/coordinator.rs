// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Global termination and the arbitration session lifecycle.
//!
//! Any event that may have compromised the keys moves the coordinator to
//! [`PxpState::Invalidated`] immediately, from the interrupt path. The
//! worker then tears down every session and, unless the teardown is final,
//! re-creates the arbitration session once hardware reports the reset
//! complete.

use crate::backend::BackendError;
use crate::hw::HwError;
use crate::irq::PxpEvents;
use crate::irq::WorkerState;
use crate::manager::PxpCore;
use parking_lot::Condvar;
use parking_lot::Mutex;
use pxp_spec::ARB_SESSION;
use pxp_spec::MAX_SESSIONS;
use pxp_spec::ioctl::PxpSessionMode;
use pxp_spec::kcr;
use pxp_spec::tag::PxpTag;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;

/// The arbitration lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PxpState {
    /// No arbitration session has been created yet.
    Uninitialized,
    /// The arbitration session is valid.
    Active,
    /// Keys may be compromised; a teardown is pending.
    Invalidated,
    /// Sessions are being terminated.
    TearingDown,
    /// The arbitration session is being re-created.
    Restarting,
    /// A final teardown completed. Nothing is re-armed.
    Terminated,
    /// The device is suspended.
    Suspended,
}

/// The kind of global termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownKind {
    /// Queue a teardown to the worker and re-create the arbitration session
    /// afterwards.
    Restart,
    /// Tear down synchronously and never re-arm.
    Final,
}

/// A trust manager operation failed.
#[derive(Debug, Error)]
pub enum PxpError {
    /// The firmware backend is not ready.
    #[error("firmware backend not ready")]
    NotReady(#[source] BackendError),
    /// A global termination did not complete in time.
    #[error("termination did not complete within {0:?}")]
    TimedOut(Duration),
    /// The arbitration session could not be re-created.
    #[error("arbitration session not established")]
    ArbitrationFailed,
    /// The hardware teardown failed.
    #[error("hardware teardown failed")]
    Teardown(#[source] HwError),
    /// The device is suspended.
    #[error("device is suspended")]
    Suspended,
    /// A final teardown has run.
    #[error("protected sessions have been shut down")]
    Terminated,
    /// Hardware could not be initialized.
    #[error("hardware initialization failed")]
    Hardware(#[source] HwError),
    /// The arbitration session is not valid.
    #[error("arbitration session is not active")]
    NotActive,
    /// The protection key changed since the caller captured it.
    #[error("protection key was rotated")]
    KeyRotated,
}

#[derive(Debug, Error)]
enum ArbError {
    #[error("arbitration session already in play")]
    AlreadyInPlay,
    #[error("firmware failed to start the arbitration session")]
    Firmware(#[source] BackendError),
    #[error("arbitration session not confirmed in play")]
    Hardware(#[source] HwError),
    #[error("superseded by a newer invalidation")]
    Superseded,
}

/// A one-shot signal that can be re-armed.
struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self {
            done: Mutex::new(true),
            cond: Condvar::new(),
        }
    }

    fn reinit(&self) {
        *self.done.lock() = false;
    }

    fn complete_all(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let mut done = self.done.lock();
        self.cond.wait_while_for(&mut done, |done| !*done, timeout);
        *done
    }
}

pub(crate) struct Coordinator {
    state: Mutex<PxpState>,
    /// Serializes arbitration session teardown and creation.
    arb_mutex: Mutex<()>,
    arb_is_valid: AtomicBool,
    arb_tag: AtomicU32,
    arb_instance: AtomicU8,
    key_instance: AtomicU32,
    /// Bumped, under the irq lock, every time keys are invalidated.
    invalidation_generation: AtomicU64,
    /// The generation the running teardown started from.
    teardown_generation: AtomicU64,
    hw_state_invalidated: AtomicBool,
    final_teardown: AtomicBool,
    termination: Completion,
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PxpState::Uninitialized),
            arb_mutex: Mutex::new(()),
            arb_is_valid: AtomicBool::new(false),
            arb_tag: AtomicU32::new(0),
            arb_instance: AtomicU8::new(0),
            key_instance: AtomicU32::new(0),
            invalidation_generation: AtomicU64::new(0),
            teardown_generation: AtomicU64::new(0),
            hw_state_invalidated: AtomicBool::new(false),
            final_teardown: AtomicBool::new(false),
            termination: Completion::new(),
        }
    }

    pub fn state(&self) -> PxpState {
        *self.state.lock()
    }

    /// Moves to `new`. Only resume leaves `Suspended` or `Terminated`.
    fn set_state(&self, new: PxpState) {
        let mut state = self.state.lock();
        if matches!(*state, PxpState::Suspended | PxpState::Terminated) {
            tracing::debug!(old = ?*state, ?new, "ignoring pxp state change");
            return;
        }
        if *state != new {
            tracing::debug!(old = ?*state, ?new, "pxp state change");
            *state = new;
        }
    }

    pub fn force_state(&self, new: PxpState) {
        *self.state.lock() = new;
    }

    pub fn arb_is_valid(&self) -> bool {
        self.arb_is_valid.load(Ordering::Acquire)
    }

    pub fn arb_tag(&self) -> PxpTag {
        PxpTag::from_bits(self.arb_tag.load(Ordering::Acquire))
    }

    pub fn key_instance(&self) -> u32 {
        self.key_instance.load(Ordering::Acquire)
    }

    pub fn clear_final_teardown(&self) {
        self.final_teardown.store(false, Ordering::Release);
    }

    /// Drops the arbitration session's validity. Called with the irq lock
    /// held so that arbitration re-creation can detect a racing invalidation.
    pub fn mark_termination_in_progress_locked(&self, _irq: &mut WorkerState) {
        self.invalidation_generation.fetch_add(1, Ordering::AcqRel);
        self.arb_is_valid.store(false, Ordering::Release);
        self.arb_tag.store(0, Ordering::Release);
        self.termination.reinit();
        self.set_state(PxpState::Invalidated);
    }
}

impl PxpCore {
    /// Interrupt entry point. Never blocks on hardware.
    pub(crate) fn handle_irq(&self, iir: u32) {
        let iir = kcr::KcrInterrupt::from_bits(iir);
        let events = PxpEvents::from_interrupt(iir);
        if events.is_empty() {
            tracing::trace!(iir = iir.into_bits(), "ignoring kcr interrupt");
            return;
        }
        {
            let mut irq = self.events.lock();
            if iir.is_termination() {
                tracing::warn!(iir = iir.into_bits(), "pxp keys invalidated by hardware");
                self.coordinator.mark_termination_in_progress_locked(&mut irq);
            }
            irq.post(events);
        }
        self.events.notify();
    }

    fn invalidate_contexts(&self) {
        tracing::debug!("invalidating protected contexts");
        self.contexts.invalidate_protected_contexts();
    }

    /// Runs one batch of worker events. Invalidation always runs first, and a
    /// termination request supersedes a completion that arrived with it.
    pub(crate) fn process_events(&self, mut events: PxpEvents) {
        tracing::trace!(events = events.into_bits(), "processing pxp events");
        if events.invalidation_required() {
            self.invalidate_contexts();
        }

        if matches!(
            self.coordinator.state(),
            PxpState::Suspended | PxpState::Terminated
        ) {
            self.coordinator.termination.complete_all();
            return;
        }

        if events.termination_request() {
            events.set_termination_complete(false);
            self.terminate_and_restart();
        }
        if events.termination_complete() {
            self.termination_complete();
        }
        if events.relay_request() {
            self.backend.handle_relay_request();
        }
    }

    fn terminate_and_restart(&self) {
        let coordinator = &self.coordinator;
        let _arb = coordinator.arb_mutex.lock();
        coordinator.teardown_generation.store(
            coordinator.invalidation_generation.load(Ordering::Acquire),
            Ordering::Release,
        );
        coordinator.hw_state_invalidated.store(true, Ordering::Release);
        coordinator.set_state(PxpState::TearingDown);
        if let Err(err) = self.teardown_hw() {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "pxp teardown failed"
            );
            coordinator.set_state(PxpState::Invalidated);
            coordinator.termination.complete_all();
        }
    }

    fn termination_complete(&self) {
        let coordinator = &self.coordinator;
        if coordinator.final_teardown.load(Ordering::Acquire) {
            coordinator.set_state(PxpState::Terminated);
            tracing::info!("pxp terminated");
        } else if coordinator.hw_state_invalidated.swap(false, Ordering::AcqRel) {
            let _arb = coordinator.arb_mutex.lock();
            coordinator.set_state(PxpState::Restarting);
            let generation = coordinator.teardown_generation.load(Ordering::Acquire);
            if let Err(err) = self.create_arb_session(generation) {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "failed to re-create the arbitration session"
                );
                coordinator.set_state(PxpState::Invalidated);
            }
        }
        coordinator.termination.complete_all();
    }

    /// Terminates every session in hardware, then triggers the global
    /// termination. Failing to clear the arbitration session is an error;
    /// caller sessions that do not clear are only logged, the global
    /// termination drops them anyway.
    fn teardown_hw(&self) -> Result<(), HwError> {
        let sip = self.hw.session_in_play_mask();
        let reserved = self.sessions.clear();
        let stale = (sip | reserved) & !kcr::sip_bit(ARB_SESSION);
        tracing::debug!(sip, reserved, "tearing down pxp sessions");

        for session_id in 1..MAX_SESSIONS as u8 {
            if stale & kcr::sip_bit(session_id) == 0 {
                continue;
            }
            if let Err(err) = self.hw.submit_session_termination(session_id) {
                tracing::warn!(
                    session_id,
                    error = &err as &dyn std::error::Error,
                    "failed to submit session termination"
                );
            }
        }

        self.hw.terminate_session(ARB_SESSION)?;
        self.hw.global_terminate();

        if let Err(err) = self.backend.end_arb_fw_session(ARB_SESSION) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "firmware did not invalidate the arbitration stream key"
            );
        }
        Ok(())
    }

    fn create_arb_session(&self, generation: u64) -> Result<(), ArbError> {
        let coordinator = &self.coordinator;
        if self.hw.is_session_in_play(ARB_SESSION) {
            return Err(ArbError::AlreadyInPlay);
        }
        self.backend
            .create_arb_session(ARB_SESSION)
            .map_err(ArbError::Firmware)?;
        self.hw
            .wait_for_session_state(ARB_SESSION, true)
            .map_err(ArbError::Hardware)?;

        let tag = {
            let _irq = self.events.lock();
            if coordinator.invalidation_generation.load(Ordering::Acquire) != generation {
                return Err(ArbError::Superseded);
            }
            let mut instance = coordinator.arb_instance.load(Ordering::Acquire).wrapping_add(1);
            if instance == 0 {
                instance = 1;
            }
            coordinator.arb_instance.store(instance, Ordering::Release);
            let tag = PxpTag::for_session(ARB_SESSION, instance, PxpSessionMode::HM);
            coordinator.arb_tag.store(tag.into_bits(), Ordering::Release);
            coordinator.key_instance.fetch_add(1, Ordering::AcqRel);
            coordinator.arb_is_valid.store(true, Ordering::Release);
            tag
        };
        coordinator.set_state(PxpState::Active);
        tracing::info!(
            tag = tag.into_bits(),
            key_instance = coordinator.key_instance(),
            "arbitration session established"
        );
        Ok(())
    }

    /// Makes sure the arbitration session is valid, re-creating it if needed.
    pub(crate) fn start(&self) -> Result<(), PxpError> {
        let coordinator = &self.coordinator;
        match coordinator.state() {
            PxpState::Suspended => return Err(PxpError::Suspended),
            PxpState::Terminated => return Err(PxpError::Terminated),
            _ => {}
        }
        self.backend.ensure_ready().map_err(PxpError::NotReady)?;

        {
            let _arb = coordinator.arb_mutex.lock();
            if coordinator.arb_is_valid() {
                return Ok(());
            }
            let in_progress = matches!(
                coordinator.state(),
                PxpState::TearingDown | PxpState::Restarting
            );
            if !in_progress {
                let mut irq = self.events.lock();
                if !irq.pending().termination_request() {
                    coordinator.mark_termination_in_progress_locked(&mut irq);
                    irq.post(
                        PxpEvents::new()
                            .with_invalidation_required(true)
                            .with_termination_request(true),
                    );
                }
            }
        }
        self.events.notify();

        let timeout = self.backend.termination_timeout();
        if !coordinator.termination.wait(timeout) {
            tracing::error!(?timeout, "pxp termination not confirmed");
            {
                let _arb = coordinator.arb_mutex.lock();
                if !coordinator.arb_is_valid() {
                    coordinator.set_state(PxpState::Invalidated);
                }
            }
            coordinator.termination.complete_all();
            return Err(PxpError::TimedOut(timeout));
        }
        if !coordinator.arb_is_valid() {
            return Err(PxpError::ArbitrationFailed);
        }
        Ok(())
    }

    /// Terminates every session. See [`TeardownKind`].
    pub(crate) fn terminate_global(&self, kind: TeardownKind) -> Result<(), PxpError> {
        let coordinator = &self.coordinator;
        match kind {
            TeardownKind::Restart => {
                {
                    let mut irq = self.events.lock();
                    coordinator.mark_termination_in_progress_locked(&mut irq);
                    irq.post(
                        PxpEvents::new()
                            .with_invalidation_required(true)
                            .with_termination_request(true),
                    );
                }
                self.events.notify();
                Ok(())
            }
            TeardownKind::Final => {
                {
                    let _arb = coordinator.arb_mutex.lock();
                    coordinator.final_teardown.store(true, Ordering::Release);
                    coordinator
                        .hw_state_invalidated
                        .store(false, Ordering::Release);
                    {
                        let mut irq = self.events.lock();
                        coordinator.mark_termination_in_progress_locked(&mut irq);
                    }
                    self.invalidate_contexts();
                    coordinator.set_state(PxpState::TearingDown);
                    if let Err(err) = self.teardown_hw() {
                        coordinator.set_state(PxpState::Invalidated);
                        coordinator.termination.complete_all();
                        return Err(PxpError::Teardown(err));
                    }
                }

                let timeout = self.backend.termination_timeout();
                if !coordinator.termination.wait(timeout) {
                    tracing::error!(?timeout, "final termination not confirmed");
                    coordinator.set_state(PxpState::Invalidated);
                    coordinator.termination.complete_all();
                    return Err(PxpError::TimedOut(timeout));
                }
                Ok(())
            }
        }
    }

    /// Fails if the arbitration key changed since `instance` was captured.
    pub(crate) fn key_check(&self, instance: u32) -> Result<(), PxpError> {
        if !self.coordinator.arb_is_valid() {
            return Err(PxpError::NotActive);
        }
        if self.coordinator.key_instance() != instance {
            return Err(PxpError::KeyRotated);
        }
        Ok(())
    }

    /// Returns the current arbitration session tag and whether it is alive.
    pub(crate) fn query_arb_tag(&self) -> (PxpTag, bool) {
        let arb_tag = self.coordinator.arb_tag();
        if self.coordinator.arb_is_valid() {
            (arb_tag, true)
        } else {
            (PxpTag::NONE, false)
        }
    }
}
