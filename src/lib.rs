//! castrelay - Screen capture relay
//!
//! This crate connects to a screen capture service over an inherited
//! handle, negotiates a raw video format, pulls frames through a borrowed
//! buffer pool and relays them H.264-encoded to a consumer callback.

pub mod capture;
pub mod encode;
pub mod error;
pub mod service;
pub mod utils;

pub use error::{RelayError, Result};
