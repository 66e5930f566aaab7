//! Hierarchical halt signals
//!
//! A [`HaltNode`] bundles three fire-once broadcast events used to coordinate
//! a long-running activity with the code that supervises it:
//!
//! - **ready**: the activity has begun executing
//! - **stop requested**: somebody asked the activity to stop
//! - **done**: the activity has fully terminated
//!
//! Nodes form a tree. Requesting stop on a node also requests stop on every
//! node registered downstream of it, so a supervisor can tear down a whole
//! group of activities without knowing how each one is built.
//!
//! ```text
//!            ┌──────────┐
//!            │ listener │  request_stop()
//!            └────┬─────┘
//!         ┌───────┴────────┐
//!    ┌────┴────┐      ┌────┴────┐
//!    │ pair #1 │      │ pair #2 │
//!    └────┬────┘      └────┬────┘
//!      ┌──┴──┐          ┌──┴──┐
//!      AB    BA         AB    BA
//! ```

mod node;
mod signal;

pub use node::HaltNode;
pub use signal::Signal;
