//! # rex-kernel
//!
//! The thread and inter-thread synchronization core of the rex real-time
//! kernel: a typed kernel-object model, fixed-priority preemptive threads
//! with per-thread one-shot timers, and a family of blocking synchronization
//! objects (counting semaphore, priority-inheritance mutex, event flag
//! group, mailbox, message queue).
//!
//! The kernel is a host-model implementation: all shared state lives behind
//! one platform mutex that stands in for the global interrupt mask of a
//! single-core target, and the context switch is modeled by a cooperative
//! dispatch loop that always runs the most urgent ready thread. A call that
//! must block suspends its thread and returns
//! [`OsError::WouldBlock`](rex_core::OsError::WouldBlock); the thread body
//! returns [`ThreadAction::Block`] and re-issues the call on its next
//! dispatch to collect the wake-up reason stamped by whoever woke it.
//!
//! ## Module Overview
//! - [`kernel`]   – kernel facade: configuration, dispatch loop, tick, sweep.
//! - [`thread`]   – thread lifecycle, state machine, contexts and actions.
//! - [`ipc`]      – the five blocking synchronization objects.
//! - [`timer`]    – the per-thread one-shot countdown timer.
//! - [`sched`]    – per-priority ready table over the two-level bitmap.
//! - [`wait`]     – ordered suspension queue embedded in every sync object.
//! - [`registry`] – typed, capacity-bounded object arenas with name lookup.
//! - [`port`]     – host stand-ins for the hardware seam (stack init/paint).
//! - [`trace`]    – single injected trace sink replacing global hook pointers.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod ipc;
pub mod kernel;
pub mod port;
pub mod registry;
pub mod sched;
mod sync;
pub mod thread;
pub mod timer;
pub mod trace;
pub mod wait;

#[cfg(feature = "event")]
pub use ipc::{Event, EventMode};
#[cfg(feature = "mailbox")]
pub use ipc::Mailbox;
#[cfg(feature = "msgqueue")]
pub use ipc::MessageQueue;
#[cfg(feature = "mutex")]
pub use ipc::Mutex;
#[cfg(feature = "semaphore")]
pub use ipc::Semaphore;
pub use kernel::{Kernel, KernelConfig};
pub use thread::{
    ThreadAction, ThreadConfig, ThreadContext, ThreadControl, ThreadId, ThreadState,
};
pub use trace::TraceEvent;
#[cfg(feature = "trace")]
pub use trace::TraceHook;

pub use rex_core::{ObjectClass, OsError, OsResult, Priority, Tick, Timeout, WaitOrder};
