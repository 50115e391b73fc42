//! Ephemeral poudriere ports-tree registrations.
//!
//! A [`BuildPool`] registers the mounted view as a uniquely named poudriere
//! ports tree so that bulk builds run against the overlay without touching
//! any other registration:
//!
//! ```text
//! poudriere ports -c -F -f none -M <base> -p <name>      # register
//! poudriere bulk -C -j <jail> -p <name> -B <id> -f <list> # build
//! poudriere ports -d -k -p <name>                         # deregister
//! ```
//!
//! Deregistration follows the same discipline as overlay unmounting: a
//! shared flag flipped before the tool runs, a shutdown hook holding only
//! that shared state, and best-effort failure handling.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::cleanup::{Activity, CleanupRegistry, HookId};
use crate::config::ToolCommand;
use crate::error::{BandarError, Result};

const BULK_LIST_PREFIX: &str = "bandar-bulk-";

/// A fresh random identifier: 32 lowercase hex digits.
#[must_use]
pub fn generate_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

#[derive(Debug)]
struct Registration {
    name: String,
    tool: ToolCommand,
    registered: AtomicBool,
}

impl Registration {
    fn release(&self) -> bool {
        if !self.registered.swap(false, Ordering::SeqCst) {
            return false;
        }
        let mut cmd = self
            .tool
            .command(["ports", "-d", "-k", "-p", self.name.as_str()]);
        tracing::debug!(command = ?cmd, "deregistering build pool");
        match cmd.stdout(Stdio::null()).stderr(Stdio::piped()).output() {
            Ok(out) if out.status.success() => {
                tracing::info!(pool = %self.name, "build pool deregistered");
            }
            Ok(out) => tracing::warn!(
                pool = %self.name,
                exit_code = ?out.status.code(),
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "build pool deregistration failed"
            ),
            Err(e) => tracing::warn!(
                pool = %self.name,
                error = %e,
                "could not run build pool deregistration"
            ),
        }
        true
    }
}

/// A registered, uniquely named build-tree configuration.
#[derive(Debug)]
pub struct BuildPool {
    base_path: PathBuf,
    registration: Arc<Registration>,
    hook: HookId,
}

impl BuildPool {
    /// Register `base_path` as a ports tree named `name` (random if `None`).
    ///
    /// # Errors
    /// Returns [`BandarError::RegistrationFailed`] if the tool cannot run or
    /// exits unsuccessfully, or [`BandarError::Cancelled`] once process
    /// shutdown has begun.
    pub fn new(base_path: &Path, name: Option<String>, tool: ToolCommand) -> Result<Self> {
        // In flight until the cleanup hook is registered.
        let busy = Activity::process().enter()?;
        let name = name.unwrap_or_else(generate_id);
        let mut cmd = tool.command(["ports", "-c", "-F", "-f", "none", "-M"]);
        cmd.arg(base_path).args(["-p", name.as_str()]);
        tracing::debug!(command = ?cmd, "registering build pool");

        let output = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| BandarError::RegistrationFailed {
                name: name.clone(),
                detail: e.to_string(),
                exit_code: None,
            })?;
        if !output.status.success() {
            return Err(BandarError::RegistrationFailed {
                name,
                detail: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
                exit_code: output.status.code(),
            });
        }
        tracing::info!(pool = %name, base = %base_path.display(), "build pool registered");

        let registration = Arc::new(Registration {
            name,
            tool,
            registered: AtomicBool::new(true),
        });
        let hook = {
            let registration = Arc::clone(&registration);
            CleanupRegistry::global().register(move || {
                registration.release();
            })
        };
        drop(busy);

        Ok(Self {
            base_path: base_path.to_path_buf(),
            registration,
            hook,
        })
    }

    /// Registered name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.registration.name
    }

    /// Collection the pool was registered against.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// `true` until the pool has been torn down.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registration.registered.load(Ordering::SeqCst)
    }

    /// Build `members` in `jail_name` and return the generated build id.
    ///
    /// The members are written one per line, in order, to a temporary list
    /// file that is removed before this returns. The outcome of the build
    /// itself is reported by poudriere, not here.
    ///
    /// # Errors
    /// Returns [`BandarError::BuildInvocationFailed`] if the list file cannot
    /// be written or the bulk command cannot be started.
    pub fn run_bulk<S: AsRef<str>>(&self, jail_name: &str, members: &[S]) -> Result<String> {
        let build_id = generate_id();
        let invocation_failed = |source: std::io::Error| BandarError::BuildInvocationFailed {
            build_id: build_id.clone(),
            source,
        };

        let mut list = tempfile::Builder::new()
            .prefix(&format!("{BULK_LIST_PREFIX}{build_id}-"))
            .tempfile()
            .map_err(invocation_failed)?;
        for member in members {
            let member: &str = member.as_ref();
            writeln!(list, "{member}").map_err(invocation_failed)?;
        }
        list.flush().map_err(invocation_failed)?;

        let mut cmd = self.registration.tool.command([
            "bulk",
            "-C",
            "-j",
            jail_name,
            "-p",
            self.name(),
            "-B",
            build_id.as_str(),
            "-f",
        ]);
        cmd.arg(list.path());
        tracing::debug!(command = ?cmd, members = members.len(), "starting bulk build");

        let status = cmd.status().map_err(invocation_failed)?;
        tracing::info!(
            build = %build_id,
            pool = %self.name(),
            exit_code = ?status.code(),
            "bulk build finished"
        );
        drop(list);
        Ok(build_id)
    }

    /// Deregister the pool. Safe to call any number of times.
    pub fn teardown(&self) {
        self.registration.release();
        CleanupRegistry::global().unregister(self.hook);
    }
}

impl Drop for BuildPool {
    fn drop(&mut self) {
        self.teardown();
    }
}
