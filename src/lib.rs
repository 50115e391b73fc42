//! bandar library crate.
//!
//! The primary interface is the `bandar` binary. The library mounts a
//! project ports tree over an upstream collection as a copy-on-write overlay
//! and drives the port tools (test, lint, dependency listing, bulk builds)
//! against the merged view, making sure the overlay and any registered build
//! pool are released on every exit path.

pub mod archive;
pub mod check_git;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod overlay;
pub mod path_guard;
pub mod pool;
pub mod telemetry;
pub mod tree;

pub use config::{BandarConfig, ToolCommand};
pub use error::{BandarError, Result};
pub use orchestrator::{DependencyNode, LintResult, Orchestrator, TestOutcome};
pub use overlay::{Overlay, OverlayOptions};
pub use pool::BuildPool;
