//! Port layer: the concurrency primitives the hosted build needs from the host platform —
//! critical-section guard, API mailbox, semaphore, and the protocol-thread event loop — and
//! nothing else. This crate never touches pbufs, PCBs, or wire formats; it only gives the rest
//! of the stack a place to put threads.
//!
//! The `callback-only` feature mirrors `NO_SYS`: it compiles out [`thread::spawn`] and
//! [`Semaphore`]/[`Mailbox`] usage entirely from the rest of the workspace (those types still
//! exist here for the hosted/threaded build, but no-OS builds never construct them), and turns
//! [`CriticalSection`] into a zero-cost marker since there is only one execution context.

mod critical_section;
mod mbox;
mod sem;

#[cfg(not(feature = "callback-only"))]
mod thread;

pub use critical_section::{CriticalSection, ProtectedRegion};
pub use mbox::{Mailbox, MailboxSender};
pub use sem::Semaphore;

#[cfg(not(feature = "callback-only"))]
pub use thread::spawn as spawn_protocol_thread;
