//! # berth
//!
//! Development environments described by a `berth.yaml` next to the
//! project: containers built from declarative setup steps, persistent and
//! scratch volumes, and commands that run alone or as a supervised group.

#![warn(missing_docs)]

pub mod cli;

pub use cli::Cli;
