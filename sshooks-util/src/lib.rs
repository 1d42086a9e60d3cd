#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
//! Runtime helpers shared by the sshooks crates.
//!
//! * [`runtime::spawn`] starts a task whose lifetime is bounded by its
//!   [`runtime::JoinHandle`]: dropping the handle aborts the task.
//! * [`time::deadline`] turns an optional duration into a future that
//!   never resolves when no duration is configured.

pub mod runtime;
pub mod time;
