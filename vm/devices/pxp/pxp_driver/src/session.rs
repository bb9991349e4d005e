// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The caller session table.
//!
//! Slot [`ARB_SESSION`] belongs to the driver and is tracked by the
//! coordinator; the remaining slots are handed out to callers. Hardware, via
//! the session-in-play bitmap, is authoritative: every slot's validity is
//! confirmed against it, and hardware polling always happens with the table
//! lock dropped.

use crate::hw::Hardware;
use crate::hw::HwError;
use parking_lot::Mutex;
use pxp_spec::ARB_SESSION;
use pxp_spec::MAX_SESSIONS;
use pxp_spec::ioctl::PxpSessionMode;
use pxp_spec::kcr;
use pxp_spec::tag::PxpTag;
use thiserror::Error;

/// Identifies the caller that owns a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(pub u64);

/// A session table operation failed.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Sessions cannot be created right now.
    #[error("protected sessions are temporarily unavailable")]
    Busy,
    /// Every caller slot is in use.
    #[error("no free session slot")]
    NoSlot,
    /// The session belongs to another caller.
    #[error("session belongs to another owner")]
    PermissionDenied,
    /// The tag does not name a live session.
    #[error("tag does not name a live session")]
    InvalidTag,
    /// The requested protection mode is unknown.
    #[error("invalid session mode {0}")]
    InvalidMode(u32),
    /// Hardware did not confirm the session in play.
    #[error("session {session_id} not confirmed in play")]
    NotInPlay {
        /// The slot.
        session_id: u8,
        /// The hardware error.
        #[source]
        err: HwError,
    },
    /// A stale hardware session could not be cleared out of the slot.
    #[error("session slot {session_id} is still in play in hardware")]
    RetryRequired {
        /// The slot.
        session_id: u8,
        /// The hardware error.
        #[source]
        err: HwError,
    },
    /// The device is suspended.
    #[error("device is suspended")]
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Allocated, hardware has not confirmed the session.
    Reserved,
    /// Hardware confirmed the session.
    InPlay,
    /// A termination is running.
    Terminating,
}

#[derive(Debug, Clone, Copy)]
struct SessionSlot {
    owner: OwnerId,
    tag: PxpTag,
    state: SlotState,
}

struct SessionTable {
    slots: [Option<SessionSlot>; MAX_SESSIONS],
    instance_ids: [u8; MAX_SESSIONS],
}

impl SessionTable {
    fn new() -> Self {
        Self {
            slots: [None; MAX_SESSIONS],
            instance_ids: [0; MAX_SESSIONS],
        }
    }

    fn find_free(&self) -> Option<u8> {
        (1..MAX_SESSIONS)
            .find(|&i| self.slots[i].is_none())
            .map(|i| i as u8)
    }

    fn allocate(&mut self, session_id: u8, owner: OwnerId, mode: PxpSessionMode) -> PxpTag {
        let instance = &mut self.instance_ids[session_id as usize];
        *instance = instance.wrapping_add(1);
        if *instance == 0 {
            *instance = 1;
        }
        let tag = PxpTag::for_session(session_id, *instance, mode);
        self.slots[session_id as usize] = Some(SessionSlot {
            owner,
            tag,
            state: SlotState::Reserved,
        });
        tag
    }

    /// Finds the slot named by `tag`. The owner is checked before the tag so
    /// that a caller probing another caller's slot learns nothing more.
    fn lookup(&mut self, owner: OwnerId, tag: PxpTag) -> Result<&mut SessionSlot, SessionError> {
        let session_id = tag.session_id() as usize;
        if session_id == ARB_SESSION as usize {
            return Err(SessionError::PermissionDenied);
        }
        let slot = self
            .slots
            .get_mut(session_id)
            .and_then(Option::as_mut)
            .ok_or(SessionError::InvalidTag)?;
        if slot.owner != owner {
            return Err(SessionError::PermissionDenied);
        }
        if slot.tag != tag {
            return Err(SessionError::InvalidTag);
        }
        Ok(slot)
    }

    /// Frees `session_id` if it still holds `tag`.
    fn free_if(&mut self, session_id: u8, tag: PxpTag) -> bool {
        let slot = &mut self.slots[session_id as usize];
        if slot.is_some_and(|s| s.tag == tag) {
            *slot = None;
            true
        } else {
            false
        }
    }

    fn slots_of(&self, owner: OwnerId) -> Vec<(u8, PxpTag)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.filter(|s| s.owner == owner)
                    .map(|s| (i as u8, s.tag))
            })
            .collect()
    }

    fn reserved_mask(&self) -> u32 {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .fold(0, |mask, (i, _)| mask | kcr::sip_bit(i as u8))
    }

    /// Drops every slot and returns the mask of slots that were reserved.
    fn clear(&mut self) -> u32 {
        let mask = self.reserved_mask();
        self.slots = [None; MAX_SESSIONS];
        mask
    }

    /// Marks in-play slots whose hardware bit is clear as not in play.
    fn demote_stale(&mut self, sip: u32) -> u32 {
        let mut demoted = 0;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Some(slot) = slot {
                if slot.state == SlotState::InPlay && sip & kcr::sip_bit(i as u8) == 0 {
                    slot.state = SlotState::Reserved;
                    demoted |= kcr::sip_bit(i as u8);
                }
            }
        }
        demoted
    }
}

/// Serializes access to the session table.
pub(crate) struct SessionManager {
    table: Mutex<SessionTable>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(SessionTable::new()),
        }
    }

    /// Reserves a free slot for `owner` and returns its tag.
    pub fn reserve(
        &self,
        hw: &Hardware,
        owner: OwnerId,
        mode: PxpSessionMode,
    ) -> Result<PxpTag, SessionError> {
        if !matches!(
            mode,
            PxpSessionMode::LM | PxpSessionMode::HM | PxpSessionMode::SM
        ) {
            return Err(SessionError::InvalidMode(mode.0));
        }
        if hw.under_attack() {
            return Err(SessionError::Busy);
        }

        let (session_id, tag) = {
            let mut table = self.table.lock();
            let session_id = table.find_free().ok_or(SessionError::NoSlot)?;
            (session_id, table.allocate(session_id, owner, mode))
        };

        if hw.is_session_in_play(session_id) {
            tracing::warn!(session_id, "free slot still in play in hardware, terminating");
            if let Err(err) = hw.terminate_session(session_id) {
                self.table.lock().free_if(session_id, tag);
                return Err(SessionError::RetryRequired { session_id, err });
            }
        }

        tracing::debug!(session_id, tag = tag.into_bits(), ?mode, "session reserved");
        Ok(tag)
    }

    /// Marks a reserved session in play once hardware confirms it. Marking a
    /// session already in play succeeds.
    pub fn mark_in_play(
        &self,
        hw: &Hardware,
        owner: OwnerId,
        tag: PxpTag,
    ) -> Result<(), SessionError> {
        let session_id = {
            let mut table = self.table.lock();
            let slot = table.lookup(owner, tag)?;
            match slot.state {
                SlotState::InPlay => return Ok(()),
                SlotState::Terminating => return Err(SessionError::InvalidTag),
                SlotState::Reserved => tag.session_id(),
            }
        };

        hw.wait_for_session_state(session_id, true)
            .map_err(|err| SessionError::NotInPlay { session_id, err })?;

        let mut table = self.table.lock();
        let slot = table.lookup(owner, tag)?;
        match slot.state {
            SlotState::Terminating => Err(SessionError::InvalidTag),
            SlotState::InPlay | SlotState::Reserved => {
                slot.state = SlotState::InPlay;
                tracing::debug!(session_id, "session in play");
                Ok(())
            }
        }
    }

    /// Terminates a session and frees its slot. The slot is freed even if
    /// hardware does not confirm the termination.
    pub fn terminate(
        &self,
        hw: &Hardware,
        owner: OwnerId,
        tag: PxpTag,
    ) -> Result<(), SessionError> {
        let session_id = {
            let mut table = self.table.lock();
            let slot = table.lookup(owner, tag)?;
            if slot.state == SlotState::Terminating {
                return Err(SessionError::InvalidTag);
            }
            slot.state = SlotState::Terminating;
            tag.session_id()
        };
        self.finish_termination(hw, session_id, tag);
        Ok(())
    }

    fn finish_termination(&self, hw: &Hardware, session_id: u8, tag: PxpTag) {
        if let Err(err) = hw.terminate_session(session_id) {
            tracing::error!(
                session_id,
                error = &err as &dyn std::error::Error,
                "session termination not confirmed"
            );
        }
        self.table.lock().free_if(session_id, tag);
        tracing::debug!(session_id, "session terminated");
    }

    /// Terminates every session of `owner`.
    pub fn close_owner(&self, hw: &Hardware, owner: OwnerId) {
        let sessions = {
            let mut table = self.table.lock();
            let sessions = table.slots_of(owner);
            for &(session_id, _) in &sessions {
                if let Some(slot) = table.slots[session_id as usize].as_mut() {
                    slot.state = SlotState::Terminating;
                }
            }
            sessions
        };
        for (session_id, tag) in sessions {
            self.finish_termination(hw, session_id, tag);
        }
    }

    /// Demotes sessions that hardware no longer reports in play.
    pub fn reconcile(&self, hw: &Hardware) {
        let sip = hw.session_in_play_mask();
        let demoted = self.table.lock().demote_stale(sip);
        if demoted != 0 {
            tracing::warn!(demoted, sip, "sessions dropped by hardware");
        }
    }

    /// Looks up the slot named by `tag`. Returns the slot's current tag and
    /// whether it is in play, or [`PxpTag::NONE`] if the slot is free.
    /// Callers spot a stale tag by its instance id.
    pub fn query(&self, tag: PxpTag) -> (PxpTag, bool) {
        let table = self.table.lock();
        match table.slots.get(tag.session_id() as usize).copied().flatten() {
            Some(slot) => (slot.tag, slot.state == SlotState::InPlay),
            None => (PxpTag::NONE, false),
        }
    }

    /// Mask of slots held by callers.
    pub fn reserved_mask(&self) -> u32 {
        self.table.lock().reserved_mask()
    }

    /// Drops every caller session without touching hardware and returns the
    /// mask of slots that were reserved.
    pub fn clear(&self) -> u32 {
        self.table.lock().clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pxp_backing_emulated_mock::DeviceEvent;
    use pxp_backing_emulated_mock::EmulatedPxpDevice;
    use pxp_backing_emulated_mock::FaultConfiguration;
    use test_log::test;

    const A: OwnerId = OwnerId(1);
    const B: OwnerId = OwnerId(2);

    fn setup() -> (EmulatedPxpDevice, Hardware, SessionManager) {
        let device = EmulatedPxpDevice::new_gsc();
        let hw = Hardware::emulated(&device);
        (device, hw, SessionManager::new())
    }

    #[test]
    fn slots_are_exclusive() {
        let (_device, hw, sessions) = setup();
        let mut seen = 0;
        for i in 0..(MAX_SESSIONS - 1) {
            let owner = if i % 2 == 0 { A } else { B };
            let tag = sessions.reserve(&hw, owner, PxpSessionMode::HM).unwrap();
            let bit = kcr::sip_bit(tag.session_id());
            assert_eq!(seen & bit, 0);
            assert_ne!(tag.session_id(), ARB_SESSION);
            seen |= bit;
        }
        assert!(matches!(
            sessions.reserve(&hw, A, PxpSessionMode::HM),
            Err(SessionError::NoSlot)
        ));
        assert_eq!(sessions.reserved_mask(), 0xfffe);
    }

    #[test]
    fn tag_changes_across_reuse() {
        let (device, hw, sessions) = setup();
        let first = sessions.reserve(&hw, A, PxpSessionMode::HM).unwrap();
        assert!(first.enabled());
        assert!(first.hm());
        device.set_session_in_play(first.session_id(), true);
        sessions.mark_in_play(&hw, A, first).unwrap();
        sessions.terminate(&hw, A, first).unwrap();

        let second = sessions.reserve(&hw, B, PxpSessionMode::LM).unwrap();
        assert_eq!(second.session_id(), first.session_id());
        assert_ne!(second.instance_id(), first.instance_id());
        assert_ne!(second.instance_id(), 0);
        assert_eq!(sessions.query(first), (second, false));

        sessions.terminate(&hw, B, second).unwrap();
        assert_eq!(sessions.query(first), (PxpTag::NONE, false));
    }

    #[test]
    fn instance_id_skips_zero() {
        let mut table = SessionTable::new();
        table.instance_ids[1] = u8::MAX;
        let tag = table.allocate(1, A, PxpSessionMode::SM);
        assert_eq!(tag.instance_id(), 1);
        assert!(tag.sm());
    }

    #[test]
    fn mark_in_play_is_idempotent() {
        let (device, hw, sessions) = setup();
        let tag = sessions.reserve(&hw, A, PxpSessionMode::HM).unwrap();
        device.set_session_in_play(tag.session_id(), true);
        sessions.mark_in_play(&hw, A, tag).unwrap();
        sessions.mark_in_play(&hw, A, tag).unwrap();
        assert_eq!(sessions.query(tag), (tag, true));
    }

    #[test]
    fn mark_in_play_needs_hardware() {
        let (_device, hw, sessions) = setup();
        let tag = sessions.reserve(&hw, A, PxpSessionMode::HM).unwrap();
        let err = sessions.mark_in_play(&hw, A, tag).unwrap_err();
        assert!(matches!(err, SessionError::NotInPlay { .. }));
        assert_eq!(sessions.query(tag), (tag, false));
    }

    #[test]
    fn owners_are_isolated() {
        let (device, hw, sessions) = setup();
        let tag = sessions.reserve(&hw, A, PxpSessionMode::HM).unwrap();
        device.set_session_in_play(tag.session_id(), true);
        sessions.mark_in_play(&hw, A, tag).unwrap();
        device.clear_events();

        assert!(matches!(
            sessions.terminate(&hw, B, tag),
            Err(SessionError::PermissionDenied)
        ));
        assert!(matches!(
            sessions.mark_in_play(&hw, B, tag),
            Err(SessionError::PermissionDenied)
        ));
        assert!(device.events().is_empty());
        assert_eq!(sessions.query(tag), (tag, true));
        assert!(device.session_in_play_mask() & kcr::sip_bit(tag.session_id()) != 0);
    }

    #[test]
    fn stale_and_arb_tags_rejected() {
        let (_device, hw, sessions) = setup();
        let tag = sessions.reserve(&hw, A, PxpSessionMode::HM).unwrap();
        let stale = tag.with_instance_id(tag.instance_id().wrapping_add(7));
        assert!(matches!(
            sessions.terminate(&hw, A, stale),
            Err(SessionError::InvalidTag)
        ));
        assert!(matches!(
            sessions.terminate(&hw, A, PxpTag::for_session(9, 1, PxpSessionMode::HM)),
            Err(SessionError::InvalidTag)
        ));
        assert!(matches!(
            sessions.terminate(&hw, A, PxpTag::for_session(0, 1, PxpSessionMode::HM)),
            Err(SessionError::PermissionDenied)
        ));
    }

    #[test]
    fn terminate_frees_despite_stuck_hardware() {
        let (device, hw, sessions) = setup();
        let tag = sessions.reserve(&hw, A, PxpSessionMode::HM).unwrap();
        device.set_faults(FaultConfiguration::new().with_stuck_session(tag.session_id()));
        device.set_session_in_play(tag.session_id(), true);
        sessions.terminate(&hw, A, tag).unwrap();
        assert_eq!(sessions.reserved_mask(), 0);
        assert!(device
            .events()
            .contains(&DeviceEvent::TerminationBatch(tag.session_id())));
    }

    #[test]
    fn reserve_clears_stale_hardware_session() {
        let (device, hw, sessions) = setup();
        device.set_session_in_play(1, true);
        let tag = sessions.reserve(&hw, A, PxpSessionMode::HM).unwrap();
        assert_eq!(tag.session_id(), 1);
        assert!(device.events().contains(&DeviceEvent::TerminationBatch(1)));
        assert_eq!(device.session_in_play_mask(), 0);
    }

    #[test]
    fn reserve_retry_when_hardware_stuck() {
        let (device, hw, sessions) = setup();
        device.set_faults(FaultConfiguration::new().with_stuck_session(1));
        device.set_session_in_play(1, true);
        let err = sessions.reserve(&hw, A, PxpSessionMode::HM).unwrap_err();
        assert!(matches!(
            err,
            SessionError::RetryRequired { session_id: 1, .. }
        ));
        assert_eq!(sessions.reserved_mask(), 0);
    }

    #[test]
    fn reserve_busy_under_attack() {
        let (device, hw, sessions) = setup();
        device.raise_attack();
        assert!(matches!(
            sessions.reserve(&hw, A, PxpSessionMode::HM),
            Err(SessionError::Busy)
        ));
        assert!(matches!(
            sessions.reserve(&hw, A, PxpSessionMode(7)),
            Err(SessionError::InvalidMode(7))
        ));
    }

    #[test]
    fn reconcile_demotes_dropped_sessions() {
        let (device, hw, sessions) = setup();
        let tag = sessions.reserve(&hw, A, PxpSessionMode::HM).unwrap();
        device.set_session_in_play(tag.session_id(), true);
        sessions.mark_in_play(&hw, A, tag).unwrap();

        device.set_session_in_play(tag.session_id(), false);
        sessions.reconcile(&hw);
        assert_eq!(sessions.query(tag), (tag, false));
    }

    #[test]
    fn close_owner_only_touches_owner() {
        let (device, hw, sessions) = setup();
        let a1 = sessions.reserve(&hw, A, PxpSessionMode::HM).unwrap();
        let b1 = sessions.reserve(&hw, B, PxpSessionMode::HM).unwrap();
        let a2 = sessions.reserve(&hw, A, PxpSessionMode::LM).unwrap();
        for tag in [a1, b1, a2] {
            device.set_session_in_play(tag.session_id(), true);
        }
        sessions.close_owner(&hw, A);
        assert_eq!(sessions.query(a1), (PxpTag::NONE, false));
        assert_eq!(sessions.query(a2), (PxpTag::NONE, false));
        assert_eq!(sessions.query(b1), (b1, false));
        assert_eq!(
            device.session_in_play_mask(),
            kcr::sip_bit(b1.session_id())
        );
    }
}
