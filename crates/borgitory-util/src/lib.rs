//! Small standalone helpers shared by the core and CLI crates.

pub mod config;
pub mod xdg;
