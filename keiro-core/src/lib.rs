//! # Keiro: runtime dispatch and expression evaluation
//!
//! Keiro routes named occurrences to the script handlers registered for them
//! and evaluates the MongoDB-style expressions those handlers are guarded and
//! written with.
//!
//! ## Building blocks
//!
//! - Expressions and pipelines ([`eval`]): JSON documents parsed into
//!   expression trees, evaluated against a context, and lazy cursor
//!   pipelines over in-memory values or live store queries.
//! - Registry ([`registry`]): module loading turns handler metadata into
//!   registrations, keyed by slot so a later module can replace an earlier
//!   handler, and swaps whole tables atomically on reload.
//! - Dispatch ([`dispatch`]): resolution by discriminant, guards and weight,
//!   inline execution in the caller's task or async execution as tracked,
//!   cancellable operations.
//! - Scheduling ([`schedule`]): cron-driven jobs with per-name overlap locks.
//! - Events ([`event`]): lifecycle notifications on a broadcast bus.
//!
//! [`system::Runtime`] wires these together from a [`config::RuntimeConfig`].
//!
//! ## Firing
//!
//! ```text
//! Discriminant → Resolver (match, guard, weight) → inline handlers
//!                                                → operations (worker pool)
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod eval;
pub mod event;
pub mod fault;
pub mod principal;
pub mod registry;
pub mod schedule;
pub mod store;
pub mod system;

// Re-exports
pub use error::*;
pub use fault::Fault;
pub use principal::{Principal, PrincipalKind, PrincipalResolver};
pub use system::Runtime;
