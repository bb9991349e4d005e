// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! KCR (key controller) registers, relative to the KCR MMIO base.

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Global enable. Masked register: the upper 16 bits select which of the
/// lower 16 bits a write updates.
pub const KCR_INIT: usize = 0x0f0;
/// Attack status.
pub const KCR_STATUS: usize = 0x0f4;
/// Write 1 to terminate every session and reset key state.
pub const KCR_GLOBAL_TERMINATE: usize = 0x0f8;
/// Session-in-play bitmap, one bit per slot. Authoritative.
pub const KCR_SIP: usize = 0x260;

/// `KCR_INIT` contents.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct KcrInit {
    #[bits(14)]
    _rsvd: u16,
    /// Allow display and ME writes to protected memory.
    pub allow_display_me_writes: bool,
    _rsvd2: bool,
    #[bits(14)]
    _rsvd_mask: u16,
    /// Write-enable for `allow_display_me_writes`.
    pub allow_display_me_writes_mask: bool,
    _rsvd_mask2: bool,
}

impl KcrInit {
    /// The value written to enable PXP.
    pub const fn enable() -> Self {
        Self::new()
            .with_allow_display_me_writes(true)
            .with_allow_display_me_writes_mask(true)
    }

    /// The value written to disable PXP.
    pub const fn disable() -> Self {
        Self::new().with_allow_display_me_writes_mask(true)
    }
}

/// `KCR_STATUS` contents.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct KcrStatus {
    #[bits(31)]
    _rsvd: u32,
    /// Hardware detected an attack and dropped all keys.
    pub attack_detected: bool,
}

/// KCR interrupt identity bits, as delivered to the interrupt handler.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct KcrInterrupt {
    _rsvd: bool,
    /// Hardware terminated all sessions (attack or power event).
    pub state_terminated: bool,
    /// Firmware requested termination of application sessions.
    pub app_terminated_per_fw_req: bool,
    /// A global termination has completed.
    pub state_reset_complete: bool,
    #[bits(4)]
    _rsvd2: u8,
    /// The GSC requests a proxy relay exchange.
    pub gsc_relay_request: bool,
    #[bits(23)]
    _rsvd3: u32,
}

impl KcrInterrupt {
    /// Returns true if the interrupt reports that keys were lost.
    pub fn is_termination(&self) -> bool {
        self.state_terminated() || self.app_terminated_per_fw_req()
    }
}

/// Returns the `KCR_SIP` bit for `session_id`.
pub const fn sip_bit(session_id: u8) -> u32 {
    1 << session_id
}
