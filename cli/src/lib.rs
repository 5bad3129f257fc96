//! regsweep CLI - analyze and garbage-collect an image registry.

pub mod commands;
pub mod context;
pub mod output;
