//! The development overlay and the port operations run inside it.
//!
//! An [`Orchestrator`] mounts the project tree over the upstream ports
//! collection and runs tests, lint, dependency queries and bulk builds
//! against the merged view. Port paths are always resolved inside the
//! mountpoint, and every tool sees the mountpoint through the collection
//! environment variable (`PORTSDIR` by default).
//!
//! Operations take `&self` and may run from several threads at once.
//! [`Orchestrator::teardown`] refuses new operations, waits for running ones,
//! then deregisters the build pool (if one was created) and unmounts the
//! overlay, in that order.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::cleanup::{Activity, ActivityGuard};
use crate::config::{BandarConfig, ToolCommand, ToolsConfig};
use crate::error::{BandarError, Result};
use crate::overlay::{Overlay, OverlayOptions};
use crate::path_guard;
use crate::pool::BuildPool;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Classified lint output.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LintResult {
    /// Lines tagged `WARN`.
    pub warnings: Vec<String>,
    /// Lines tagged `FATAL`.
    pub errors: Vec<String>,
}

impl LintResult {
    /// Classify lint output by leading tag.
    ///
    /// Lines starting with `WARN` are warnings and lines starting with
    /// `FATAL` are errors; everything else is dropped. The tag and its colon
    /// are removed, as is every occurrence of `<mountpoint>/`.
    #[must_use]
    pub fn parse(output: &str, mountpoint: &Path) -> Self {
        let prefix = format!("{}/", mountpoint.display());
        let mut result = Self::default();
        for line in output.lines() {
            if let Some(message) = tagged(line, "WARN") {
                result.warnings.push(message.replace(&prefix, ""));
            } else if let Some(message) = tagged(line, "FATAL") {
                result.errors.push(message.replace(&prefix, ""));
            }
        }
        result
    }

    /// `true` if lint reported nothing.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty() && self.errors.is_empty()
    }
}

/// `Some(message)` if `line` starts with `tag`. A `tag:` header is stripped.
fn tagged<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(tag)?;
    Some(rest.strip_prefix(':').map_or(line, str::trim_start))
}

/// A port and the ports it depends on at run time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DependencyNode {
    /// Port path relative to the mountpoint, e.g. `www/nginx`.
    pub port: String,
    /// Direct dependencies, in the order the listing reported them.
    pub children: Vec<DependencyNode>,
}

impl DependencyNode {
    /// A node without dependencies.
    pub fn leaf(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            children: Vec::new(),
        }
    }
}

/// Result of testing one port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TestOutcome {
    /// The port as given by the caller.
    pub port: String,
    /// `true` iff the test command exited 0.
    pub passed: bool,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Owns the overlay and the lazily registered build pool.
#[derive(Debug)]
pub struct Orchestrator {
    project_dir: PathBuf,
    base_dir: PathBuf,
    tools: ToolsConfig,
    collection_env: String,
    overlay: Overlay,
    pool: Mutex<Option<Arc<BuildPool>>>,
    activity: Activity,
}

/// Held for the duration of one external invocation.
struct Busy<'a> {
    _local: ActivityGuard<'a>,
    _process: ActivityGuard<'static>,
}

impl Orchestrator {
    /// Validate both trees and mount the project over the base collection.
    ///
    /// # Errors
    /// [`BandarError::NotADirectory`] for a missing tree, or any overlay
    /// construction error.
    pub fn new(project_dir: &Path, base_dir: &Path, config: &BandarConfig) -> Result<Self> {
        let project_dir = path_guard::resolve(project_dir, None)?;
        let base_dir = path_guard::resolve(base_dir, None)?;

        let overlay = Overlay::new(
            &[&project_dir, &base_dir],
            OverlayOptions {
                max_files: config.overlay.max_files,
                mount_tool: config.tools.mount.clone(),
                unmount_tool: config.tools.unmount.clone(),
                ..OverlayOptions::default()
            },
        )?;

        Ok(Self {
            project_dir,
            base_dir,
            tools: config.tools.clone(),
            collection_env: config.collection_env.clone(),
            overlay,
            pool: Mutex::new(None),
            activity: Activity::new(),
        })
    }

    /// The project tree (highest-priority layer).
    #[must_use]
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// The upstream collection (lowest-priority layer).
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Where the merged tree is mounted.
    #[must_use]
    pub fn mountpoint(&self) -> &Path {
        self.overlay.mountpoint()
    }

    /// Where writes made through the merged tree end up.
    #[must_use]
    pub fn workspace(&self) -> &Path {
        self.overlay.workspace()
    }

    /// The build pool, if a bulk build has registered one.
    #[must_use]
    pub fn build_pool(&self) -> Option<Arc<BuildPool>> {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolve a port path to an existing directory inside the mountpoint.
    ///
    /// # Errors
    /// [`BandarError::PathEscapesRoot`] or [`BandarError::NotADirectory`].
    pub fn resolve_port(&self, port: impl AsRef<Path>) -> Result<PathBuf> {
        path_guard::resolve(port, Some(self.mountpoint()))
    }

    // --- tests -------------------------------------------------------------

    /// Run `<port> test` in one port. Returns `true` iff it exited 0.
    ///
    /// # Errors
    /// Path validation errors, [`BandarError::OverlayClosed`],
    /// [`BandarError::Cancelled`], or [`BandarError::Spawn`].
    pub fn test_port(&self, port: &str) -> Result<bool> {
        let _busy = self.begin()?;
        let dir = self.resolve_port(port)?;
        self.run_test(&dir)
    }

    /// Test several ports.
    ///
    /// Every path is validated before any test runs; the first invalid one
    /// aborts the batch. A failing test does not stop the remaining ones.
    ///
    /// # Errors
    /// As for [`Orchestrator::test_port`].
    pub fn test_ports<S: AsRef<str>>(&self, ports: &[S]) -> Result<Vec<TestOutcome>> {
        self.ensure_open()?;
        let ports: Vec<&str> = ports.iter().map(AsRef::as_ref).collect();
        let dirs = ports
            .iter()
            .map(|p| self.resolve_port(p))
            .collect::<Result<Vec<_>>>()?;

        let mut outcomes = Vec::with_capacity(dirs.len());
        for (port, dir) in ports.into_iter().zip(&dirs) {
            let _busy = self.begin()?;
            let passed = self.run_test(dir)?;
            if !passed {
                tracing::info!(port, "port test failed");
            }
            outcomes.push(TestOutcome {
                port: port.to_owned(),
                passed,
            });
        }
        Ok(outcomes)
    }

    fn run_test(&self, dir: &Path) -> Result<bool> {
        let mut cmd = self.tool(&self.tools.port, ["test"]);
        cmd.current_dir(dir);
        tracing::debug!(command = ?cmd, "running port test");
        let status = cmd.status().map_err(|source| BandarError::Spawn {
            command: format!("{} test", self.tools.port),
            source,
        })?;
        Ok(status.success())
    }

    // --- lint --------------------------------------------------------------

    /// Lint one port and classify the output.
    ///
    /// A non-zero exit only means lint found problems; being killed by a
    /// signal or failing to start is an invocation failure.
    ///
    /// # Errors
    /// Path validation errors, [`BandarError::OverlayClosed`],
    /// [`BandarError::Cancelled`], or [`BandarError::LintInvocationFailed`].
    pub fn lint_port<S: AsRef<str>>(&self, port: &str, flags: &[S]) -> Result<LintResult> {
        let _busy = self.begin()?;
        let dir = self.resolve_port(port)?;

        let flags: Vec<&str> = flags.iter().map(AsRef::as_ref).collect();
        let mut cmd = self.tool(&self.tools.lint, flags);
        cmd.arg(&dir).current_dir(self.mountpoint());
        tracing::debug!(command = ?cmd, "linting port");

        let output = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| BandarError::LintInvocationFailed {
                port: port.to_owned(),
                detail: e.to_string(),
            })?;
        if output.status.code().is_none() {
            return Err(BandarError::LintInvocationFailed {
                port: port.to_owned(),
                detail: format!("lint tool terminated abnormally ({})", output.status),
            });
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(LintResult::parse(&combined, self.mountpoint()))
    }

    /// Lint several ports in order, stopping at the first invocation error.
    ///
    /// # Errors
    /// As for [`Orchestrator::lint_port`].
    pub fn lint_ports<P, F>(&self, ports: &[P], flags: &[F]) -> Result<Vec<(String, LintResult)>>
    where
        P: AsRef<str>,
        F: AsRef<str>,
    {
        ports
            .iter()
            .map(|p| {
                let port: &str = p.as_ref();
                Ok((port.to_owned(), self.lint_port(port, flags)?))
            })
            .collect()
    }

    // --- dependency tree ---------------------------------------------------

    /// Build the run-time dependency tree of a port.
    ///
    /// Each dependency is queried separately, so a port reached along two
    /// paths is listed twice. A port that reappears on its own ancestry
    /// aborts the walk with [`BandarError::DependencyCycle`].
    ///
    /// # Errors
    /// Path validation errors for the root port, [`BandarError::OverlayClosed`],
    /// [`BandarError::Cancelled`], [`BandarError::DependencyListFailed`], or
    /// [`BandarError::DependencyCycle`].
    pub fn dependency_tree(&self, port: &str) -> Result<DependencyNode> {
        self.ensure_open()?;
        let dir = self.resolve_port(port)?;
        let root = self.port_id(&dir.to_string_lossy());
        let mut ancestry = Vec::new();
        self.walk_dependencies(root, &dir, &mut ancestry)
    }

    fn walk_dependencies(
        &self,
        port: String,
        dir: &Path,
        ancestry: &mut Vec<String>,
    ) -> Result<DependencyNode> {
        let listed = self.list_dependencies(&port, dir)?;
        ancestry.push(port);

        let mut children = Vec::with_capacity(listed.len());
        for dep in listed {
            let id = self.port_id(&dep);
            if let Some(pos) = ancestry.iter().position(|p| *p == id) {
                let mut cycle = ancestry[pos..].to_vec();
                cycle.push(id);
                return Err(BandarError::DependencyCycle { cycle });
            }
            let child_dir = self.mountpoint().join(&id);
            children.push(self.walk_dependencies(id, &child_dir, ancestry)?);
        }

        let port = ancestry.pop().unwrap_or_default();
        Ok(DependencyNode { port, children })
    }

    fn list_dependencies(&self, port: &str, dir: &Path) -> Result<Vec<String>> {
        let _busy = self.begin()?;
        let mut cmd = self.tool(&self.tools.make, ["run-depends-list"]);
        cmd.current_dir(dir);
        tracing::debug!(command = ?cmd, port, "listing dependencies");

        let output = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| BandarError::DependencyListFailed {
                port: port.to_owned(),
                detail: e.to_string(),
                exit_code: None,
            })?;
        if !output.status.success() {
            return Err(BandarError::DependencyListFailed {
                port: port.to_owned(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
                exit_code: output.status.code(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect())
    }

    /// Port identifier: the path with the mountpoint prefix removed.
    fn port_id(&self, path: &str) -> String {
        path_guard::strip_root(path, self.mountpoint()).to_owned()
    }

    // --- bulk builds -------------------------------------------------------

    /// Bulk-build `ports` in `jail_name`, registering the build pool on first
    /// use. Returns the build id.
    ///
    /// # Errors
    /// [`BandarError::OverlayClosed`], [`BandarError::Cancelled`],
    /// [`BandarError::RegistrationFailed`] or
    /// [`BandarError::BuildInvocationFailed`].
    pub fn bulk_build<S: AsRef<str>>(&self, jail_name: &str, ports: &[S]) -> Result<String> {
        let _busy = self.begin()?;
        let pool = self.ensure_pool()?;
        pool.run_bulk(jail_name, ports)
    }

    fn ensure_pool(&self) -> Result<Arc<BuildPool>> {
        let mut slot = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = slot.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(BuildPool::new(
            self.mountpoint(),
            None,
            self.tools.poudriere.clone(),
        )?);
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }

    // --- lifecycle ---------------------------------------------------------

    /// Tear down the build pool, then the overlay. Idempotent.
    ///
    /// Blocks until operations already running on other threads finish.
    pub fn teardown(&self) {
        self.activity.cancel();
        self.activity.wait_idle();
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pool) = pool {
            pool.teardown();
        }
        self.overlay.teardown();
    }

    /// `true` until teardown.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.activity.is_cancelled() && self.overlay.is_mounted()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BandarError::OverlayClosed)
        }
    }

    fn begin(&self) -> Result<Busy<'_>> {
        let local = self
            .activity
            .enter()
            .map_err(|_| BandarError::OverlayClosed)?;
        if !self.overlay.is_mounted() {
            return Err(BandarError::OverlayClosed);
        }
        let process = Activity::process().enter()?;
        Ok(Busy {
            _local: local,
            _process: process,
        })
    }

    fn tool<I, S>(&self, tool: &ToolCommand, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = tool.command(args);
        cmd.env(&self.collection_env, self.mountpoint());
        cmd
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MNT: &str = "/tmp/bandar-mnt-abc";

    #[test]
    fn lint_output_is_classified_and_stripped() {
        let output = format!(
            "WARN: {MNT}/foo/bar: message\nFATAL: {MNT}/baz: msg2\nOTHER: ignored\n"
        );
        let result = LintResult::parse(&output, Path::new(MNT));
        assert_eq!(result.warnings, ["foo/bar: message"]);
        assert_eq!(result.errors, ["baz: msg2"]);
        assert!(!result.is_clean());
    }

    #[test]
    fn lint_tag_must_lead_the_line() {
        let output = "0 fatal errors and 1 warning found.\n  WARN: indented\nFATALITY\n";
        let result = LintResult::parse(output, Path::new(MNT));
        assert!(result.warnings.is_empty());
        assert_eq!(result.errors, ["FATALITY"]);
    }

    #[test]
    fn empty_lint_output_is_clean() {
        assert!(LintResult::parse("", Path::new(MNT)).is_clean());
    }

    #[test]
    fn tagged_strips_header_only_with_colon() {
        assert_eq!(tagged("WARN: x", "WARN"), Some("x"));
        assert_eq!(tagged("WARNING x", "WARN"), Some("WARNING x"));
        assert_eq!(tagged("OK", "WARN"), None);
    }

    #[test]
    fn orchestrator_is_sync() {
        fn assert_sync<T: Sync + Send>() {}
        assert_sync::<Orchestrator>();
    }

    proptest! {
        #[test]
        fn classified_lines_never_mention_mountpoint(
            msgs in prop::collection::vec(("(WARN|FATAL|INFO)", "[a-z/]{1,12}"), 0..12)
        ) {
            let output: String = msgs
                .iter()
                .map(|(tag, path)| format!("{tag}: {MNT}/{path}: note\n"))
                .collect();
            let result = LintResult::parse(&output, Path::new(MNT));
            let expected_warn = msgs.iter().filter(|(t, _)| t == "WARN").count();
            let expected_err = msgs.iter().filter(|(t, _)| t == "FATAL").count();
            prop_assert_eq!(result.warnings.len(), expected_warn);
            prop_assert_eq!(result.errors.len(), expected_err);
            let mnt_prefix = format!("{MNT}/");
            for line in result.warnings.iter().chain(&result.errors) {
                prop_assert!(!line.contains(&mnt_prefix));
            }
        }
    }
}
