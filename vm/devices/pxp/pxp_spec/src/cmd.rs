// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command-streamer instructions used to terminate a session.

#![expect(missing_docs)] // instruction names match the hardware documentation

const fn mi_instr(opcode: u32, flags: u32) -> u32 {
    (opcode << 23) | flags
}

pub const MI_BATCH_BUFFER_END: u32 = mi_instr(0x0a, 0);
pub const MI_FLUSH_DW: u32 = mi_instr(0x26, 1);
/// Flag for [`MI_FLUSH_DW`]: the flush covers protected memory.
pub const MI_FLUSH_DW_PROTECTED_MEM_EN: u32 = 1 << 22;
pub const MI_SET_APPID: u32 = mi_instr(0x0e, 0);
/// Session bits of [`MI_SET_APPID`].
pub const MI_SET_APPID_SESSION_ID_MASK: u32 = 0x7f;

pub const MFX_WAIT: u32 = (3 << 29) | (1 << 27) | (8 << 16);
/// [`MFX_WAIT`] with PXP synchronization.
pub const MFX_WAIT_PXP: u32 = MFX_WAIT | (1 << 9);

pub const CRYPTO_KEY_EXCHANGE: u32 = (3 << 29) | (0x01609 << 16);

/// Returns the `MI_SET_APPID` dword selecting `session_id`.
pub const fn mi_set_appid(session_id: u8) -> u32 {
    MI_SET_APPID | (session_id as u32 & MI_SET_APPID_SESSION_ID_MASK)
}

/// Returns the session selected by an `MI_SET_APPID` dword, if `dw` is one.
pub const fn appid_session(dw: u32) -> Option<u8> {
    if dw & !MI_SET_APPID_SESSION_ID_MASK == MI_SET_APPID {
        Some((dw & MI_SET_APPID_SESSION_ID_MASK) as u8)
    } else {
        None
    }
}
