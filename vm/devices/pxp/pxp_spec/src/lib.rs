// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Definitions for the GPU protected content (PXP) hardware and firmware
//! interfaces: KCR registers, the GSC command-streamer packet header, the
//! GSC proxy relay protocol, PXP firmware commands and the control-operation
//! parameter blocks exchanged with callers.

#![forbid(unsafe_code)]
#![no_std]

/// Defines a transparent newtype over an integer with named constants. Any bit
/// pattern is a valid value.
macro_rules! open_enum {
    (
        $(#[$a:meta])*
        $v:vis enum $name:ident: $ty:ty {
            $(
                $(#[$va:meta])*
                $variant:ident = $value:expr,
            )*
        }
    ) => {
        $(#[$a])*
        #[repr(transparent)]
        #[derive(
            Copy,
            Clone,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            zerocopy::IntoBytes,
            zerocopy::FromBytes,
            zerocopy::Immutable,
            zerocopy::KnownLayout,
        )]
        $v struct $name(pub $ty);

        impl $name {
            $(
                $(#[$va])*
                pub const $variant: $name = $name($value);
            )*
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                #[allow(unreachable_patterns)]
                match *self {
                    $(Self::$variant => f.pad(stringify!($variant)),)*
                    _ => write!(f, "{}({:#x})", stringify!($name), self.0),
                }
            }
        }
    };
}

pub mod cmd;
pub mod fw;
pub mod gsc;
pub mod ioctl;
pub mod kcr;
pub mod proxy;
pub mod tag;

/// Number of hardware session slots.
pub const MAX_SESSIONS: usize = 16;

/// The slot reserved for the driver-owned arbitration session.
pub const ARB_SESSION: u8 = 0;
