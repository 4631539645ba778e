//! Core types, config, and errors for Parley.
//!
//! Everything that crosses a crate boundary lives here: the [`frame::Frame`]
//! that flows through a pipeline, the per-session parameters and lifecycle
//! state, membership events, and the JSON5 configuration.

pub mod config;
pub mod error;
pub mod frame;
pub mod session;
pub mod types;
