//! Small helpers shared by the config loader and the CLI.

pub mod duration;

pub use duration::parse_duration;
