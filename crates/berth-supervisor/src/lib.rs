//! # berth-supervisor
//!
//! Runs the children of a `!Supervise` command as one unit.
//!
//! Every child is prepared and started concurrently in its own process
//! group. A single loop owns the group state: it reacts to child exits,
//! to signals delivered to berth, and to the shutdown deadlines.
//!
//! ```ignore
//! let supervisor = Supervisor::new(runner);
//! let status = supervisor.run(manifest, "run", &ChildFilter::default(), &[]).await?;
//! std::process::exit(status.code());
//! ```

#![warn(missing_docs)]

pub mod child;
pub mod supervisor;

pub use child::ChildState;
pub use supervisor::{ChildFilter, GroupExitStatus, Supervisor};
