//! Shared testing utilities for the marketpilot workspace.
//!
//! Provides in-memory repository implementations that honor the same
//! state-machine semantics as the SQL backends, entity builders with
//! sensible defaults, and a scripted executor for driving the worker
//! pipeline through arbitrary outcome sequences.
//!
//! Add as a dev-dependency:
//!
//! ```toml
//! [dev-dependencies]
//! marketpilot-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod executors;
pub mod mocks;

pub use builders::*;
pub use executors::*;
pub use mocks::*;
