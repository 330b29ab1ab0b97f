#![forbid(unsafe_code)]

pub mod api;
pub mod bucket;
pub mod config;
pub mod proxy;
pub mod telemetry;

mod error;

pub use error::{Error, Result};
