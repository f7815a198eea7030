//! Core runtime infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Component lifecycle and shutdown signalling
//! - [`time`] - Wall clock abstraction for lease expirations
//! - [`error`] - Library error type and retry classification

pub mod config;
pub mod error;
pub mod runtime;
pub mod time;
