//! Error types for bandar.
//!
//! [`BandarError`] is the single error type returned by the overlay, build
//! pool and orchestrator. Variants are split in two families: validation
//! failures (bad paths, bad configuration) that the user can fix by changing
//! their input, and invocation failures of the external tools bandar drives.
//! [`BandarError::exit_code`] maps the families onto the command-line exit
//! status.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the library.
pub type Result<T, E = BandarError> = std::result::Result<T, E>;

/// Errors returned by bandar operations.
#[derive(Debug, Error)]
pub enum BandarError {
    /// A path that must name an existing directory does not.
    #[error("the path '{}' does not exist or is not a directory", path.display())]
    NotADirectory {
        /// The absolute, normalized path that was checked.
        path: PathBuf,
    },

    /// A path resolved against a root lies outside (or at) that root.
    #[error("the path '{}' escapes '{}'", path.display(), root.display())]
    PathEscapesRoot {
        /// The normalized candidate path.
        path: PathBuf,
        /// The root it was expected to stay under.
        root: PathBuf,
    },

    /// One of the overlay layers is not an existing directory.
    #[error("overlay layer '{}' does not exist", path.display())]
    LayerNotFound {
        /// The offending layer.
        path: PathBuf,
    },

    /// The mount tool failed to compose the overlay.
    #[error("mounting overlay at '{}' failed{}: {detail}", mountpoint.display(), fmt_code(*exit_code))]
    MountFailed {
        /// Where the view was to be exposed.
        mountpoint: PathBuf,
        /// Captured stderr, or the spawn error.
        detail: String,
        /// Exit code of the mount tool, if it ran to completion.
        exit_code: Option<i32>,
    },

    /// The build pool could not be registered against the base collection.
    #[error("registering build pool '{name}' failed{}: {detail}", fmt_code(*exit_code))]
    RegistrationFailed {
        /// Generated or supplied pool name.
        name: String,
        /// Captured stderr, or the spawn error.
        detail: String,
        /// Exit code of the registration tool, if it ran to completion.
        exit_code: Option<i32>,
    },

    /// The bulk build command could not be started.
    #[error("bulk build '{build_id}' could not be started: {source}")]
    BuildInvocationFailed {
        /// Identifier generated for the batch.
        build_id: String,
        /// Underlying spawn or I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The lint tool could not run, or was killed instead of exiting.
    #[error("linting '{port}' failed: {detail}")]
    LintInvocationFailed {
        /// The port that was being linted.
        port: String,
        /// What went wrong.
        detail: String,
    },

    /// The dependency listing for a port exited unsuccessfully.
    #[error("listing dependencies of '{port}' failed{}: {detail}", fmt_code(*exit_code))]
    DependencyListFailed {
        /// The port whose dependencies were queried.
        port: String,
        /// Captured stderr, or the spawn error.
        detail: String,
        /// Exit code of the listing command, if it ran to completion.
        exit_code: Option<i32>,
    },

    /// The dependency graph contains a cycle.
    #[error("dependency cycle: {}", cycle.join(" -> "))]
    DependencyCycle {
        /// Ports along the cycle; the first entry is repeated at the end.
        cycle: Vec<String>,
    },

    /// An operation was attempted after the overlay was torn down.
    #[error("the overlay has already been unmounted")]
    OverlayClosed,

    /// Shutdown was requested; no new external invocations are started.
    #[error("operation cancelled by shutdown request")]
    Cancelled,

    /// An external tool could not be started at all.
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        /// The command line that was attempted.
        command: String,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file could not be read or parsed.
    #[error("invalid configuration '{}': {detail}", path.display())]
    Config {
        /// Path to the configuration file.
        path: PathBuf,
        /// Human-readable description of the problem.
        detail: String,
    },

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BandarError {
    /// `true` for errors caused by user input rather than tool failures.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::NotADirectory { .. }
                | Self::PathEscapesRoot { .. }
                | Self::LayerNotFound { .. }
                | Self::Config { .. }
        )
    }

    /// Process exit status for this error: 1 for validation errors, 2 otherwise.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        if self.is_validation() { 1 } else { 2 }
    }
}

fn fmt_code(code: Option<i32>) -> String {
    code.map_or_else(String::new, |c| format!(" (exit {c})"))
}
