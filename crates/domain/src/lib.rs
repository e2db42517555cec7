//! `ra-domain` — shared data model, error taxonomy, and configuration for
//! every `ra-*` crate in the Red AI orchestration runtime.
//!
//! Nothing in this crate talks to the Bus, the Durable Store, or an LLM —
//! it only defines the shapes everyone else agrees on.

pub mod capability;
pub mod config;
pub mod error;
pub mod model;
pub mod stream;
pub mod tool;
pub mod trace;
