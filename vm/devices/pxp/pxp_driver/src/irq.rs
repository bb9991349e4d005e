// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hands interrupt events to the session worker.

use bitfield_struct::bitfield;
use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use pxp_spec::kcr::KcrInterrupt;

/// Work queued for the session worker.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub(crate) struct PxpEvents {
    pub invalidation_required: bool,
    pub termination_request: bool,
    pub termination_complete: bool,
    pub relay_request: bool,
    #[bits(28)]
    _rsvd: u32,
}

impl PxpEvents {
    pub fn is_empty(&self) -> bool {
        self.into_bits() == 0
    }

    pub fn union(self, other: Self) -> Self {
        Self::from_bits(self.into_bits() | other.into_bits())
    }

    /// The worker events for a KCR interrupt. Termination interrupts require
    /// invalidation before anything else.
    pub fn from_interrupt(iir: KcrInterrupt) -> Self {
        Self::new()
            .with_invalidation_required(iir.is_termination())
            .with_termination_request(iir.is_termination())
            .with_termination_complete(iir.state_reset_complete())
            .with_relay_request(iir.gsc_relay_request())
    }
}

pub(crate) struct WorkerState {
    pending: PxpEvents,
    busy: bool,
    shutdown: bool,
}

impl WorkerState {
    /// Queues `events`. The caller must call [`EventBridge::notify`] after
    /// dropping the lock.
    pub fn post(&mut self, events: PxpEvents) {
        self.pending = self.pending.union(events);
    }

    pub fn pending(&self) -> PxpEvents {
        self.pending
    }
}

/// The pending event set shared between the interrupt path and the worker.
/// The lock is only ever held briefly and never across hardware access.
pub(crate) struct EventBridge {
    state: Mutex<WorkerState>,
    wake: Condvar,
    idle: Condvar,
}

impl EventBridge {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WorkerState {
                pending: PxpEvents::new(),
                busy: false,
                shutdown: false,
            }),
            wake: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock()
    }

    pub fn notify(&self) {
        self.wake.notify_one();
    }

    pub fn post(&self, events: PxpEvents) {
        self.lock().post(events);
        self.notify();
    }

    /// Blocks until there is work and takes it. Returns `None` once the
    /// bridge is shut down.
    pub fn wait_for_work(&self) -> Option<PxpEvents> {
        let mut state = self.state.lock();
        self.wake
            .wait_while(&mut state, |state| state.pending.is_empty() && !state.shutdown);
        if state.shutdown {
            return None;
        }
        state.busy = true;
        Some(std::mem::take(&mut state.pending))
    }

    pub fn work_done(&self) {
        let mut state = self.state.lock();
        state.busy = false;
        if state.pending.is_empty() {
            self.idle.notify_all();
        }
    }

    /// Waits until the worker has drained every pending event.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        self.idle.wait_while(&mut state, |state| {
            (state.busy || !state.pending.is_empty()) && !state.shutdown
        });
    }

    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.wake.notify_all();
        self.idle.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use test_log::test;

    #[test]
    fn interrupt_translation() {
        let attack = PxpEvents::from_interrupt(KcrInterrupt::new().with_state_terminated(true));
        assert!(attack.invalidation_required());
        assert!(attack.termination_request());
        assert!(!attack.termination_complete());

        let fw = PxpEvents::from_interrupt(
            KcrInterrupt::new()
                .with_app_terminated_per_fw_req(true)
                .with_state_reset_complete(true),
        );
        assert!(fw.invalidation_required());
        assert!(fw.termination_complete());

        let relay = PxpEvents::from_interrupt(KcrInterrupt::new().with_gsc_relay_request(true));
        assert_eq!(relay, PxpEvents::new().with_relay_request(true));
        assert!(PxpEvents::from_interrupt(KcrInterrupt::new()).is_empty());
    }

    #[test]
    fn events_coalesce() {
        let bridge = EventBridge::new();
        bridge.post(PxpEvents::new().with_termination_request(true));
        bridge.post(PxpEvents::new().with_termination_complete(true));
        let events = bridge.wait_for_work().unwrap();
        assert!(events.termination_request());
        assert!(events.termination_complete());
        assert!(bridge.lock().pending().is_empty());
        bridge.work_done();
        bridge.flush();
    }

    #[test]
    fn flush_waits_for_worker() {
        let bridge = Arc::new(EventBridge::new());
        let worker = std::thread::spawn({
            let bridge = bridge.clone();
            move || {
                let mut handled = 0;
                while let Some(events) = bridge.wait_for_work() {
                    std::thread::sleep(Duration::from_millis(5));
                    handled |= events.into_bits();
                    bridge.work_done();
                }
                handled
            }
        });
        bridge.post(PxpEvents::new().with_relay_request(true));
        bridge.flush();
        assert!(bridge.lock().pending().is_empty());
        bridge.shutdown();
        assert_eq!(
            worker.join().unwrap(),
            PxpEvents::new().with_relay_request(true).into_bits()
        );
    }
}
