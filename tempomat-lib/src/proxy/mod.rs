//! The admission pipeline: forward first, charge after, then delay or
//! reject on the way back.
//!
//! Cost is the request's elapsed service time, so it reflects work the
//! origin actually performed; the first over-budget request is always
//! admitted and the penalty lands on the return path, shaping the
//! caller's effective rate on their next attempt.

mod forwarding;
mod server;

pub use server::{run, serve};
