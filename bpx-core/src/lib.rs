#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod cookie;
mod error;
mod interval;
mod seq;

pub use cookie::{Cookie, CookieTable};
pub use error::{PlexError, Result};
pub use interval::{Interval, IntervalRef, IntervalTree};
pub use seq::{seq_greater, seq_max};

/// Log-2 of the sector size. All wire sectors are 512-byte units.
pub const SECTOR_SHIFT: u32 = 9;
pub const SECTOR_SIZE: u32 = 1 << SECTOR_SHIFT;

/// Largest single data payload we accept from a peer (128 KiB).
pub const MAX_BIO_SIZE: u32 = 128 * 1024;

/// Length of the authentication challenge, a multiple of 4.
pub const CHALLENGE_LEN: usize = 64;

/// UUID value of a device that has never seen a resync partner.
pub const UUID_JUST_CREATED: u64 = 4;

/// Number of history UUIDs kept per device.
pub const HISTORY_UUIDS: usize = 2;

/// Maximum peers a single device tracks bitmap slots for.
pub const MAX_PEERS: usize = 32;

/// Convert a payload size in bytes to a sector count.
#[inline]
#[must_use]
pub const fn size_to_sectors(size: u32) -> u64 {
    (size >> SECTOR_SHIFT) as u64
}
