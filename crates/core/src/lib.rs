//! # rex-core
//!
//! Shared vocabulary of the rex real-time kernel. This crate carries the
//! types that cross the boundary between the kernel proper and the code
//! embedding it: error codes, priority levels and the ready bitmap derived
//! from them, tick and wait-time encodings, and the kernel-object classes.
//!
//! ## Module Overview
//! - [`error`]    – kernel-wide error codes returned by every fallible call.
//! - [`priority`] – priority levels, bitmap coordinates, ready-set bitmap.
//! - [`time`]     – tick counter type and the wait-time sum type.
//! - [`object`]   – kernel-object classes and wait-queue ordering flags.
//!
//! The crate has no dependencies beyond `core` and compiles in both `std`
//! and `no_std` environments.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod error;
pub mod object;
pub mod priority;
pub mod time;

pub use error::{OsError, OsResult};
pub use object::{ObjectClass, WaitOrder};
pub use priority::{PrioCoords, Priority, ReadyMask};
pub use time::{Tick, Timeout};
