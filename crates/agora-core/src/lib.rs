//! Core types, config, errors, and persistence collaborators for Agora.

pub mod config;
pub mod context;
pub mod error;
pub mod model;
pub mod store;
