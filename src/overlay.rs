//! Copy-on-write overlay over the ports tree.
//!
//! An [`Overlay`] merges one writable workspace and any number of read-only
//! layers into a single view with the union filesystem tool:
//!
//! ```text
//! <mount-tool> -o cow,max_files=<N> <workspace>=RW:<layer1>=RO:...:<layerK>=RO <mountpoint>
//! ```
//!
//! # Layer priority
//! Branches are searched left to right, so the workspace shadows every
//! layer and earlier layers shadow later ones. Bandar passes the project
//! tree before the upstream collection, which lets project ports override
//! upstream ports of the same name.
//!
//! # Lifecycle
//! The view is mounted by [`Overlay::new`] and unmounted exactly once, by
//! whichever comes first of [`Overlay::teardown`], `Drop`, or the shutdown
//! hook registered with [`CleanupRegistry::global`]. The hook captures only
//! the shared [`MountHandle`], never the `Overlay` itself. Scratch
//! directories created by the overlay are removed after a successful unmount
//! and left on disk if the unmount fails, since removing a still-mounted view
//! would recurse into it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tempfile::TempDir;

use crate::cleanup::{Activity, CleanupRegistry, HookId};
use crate::config::{DEFAULT_MAX_FILES, ToolCommand};
use crate::error::{BandarError, Result};
use crate::path_guard;

const WORKSPACE_PREFIX: &str = "bandar-work-";
const MOUNTPOINT_PREFIX: &str = "bandar-mnt-";

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Construction parameters for an [`Overlay`].
#[derive(Clone, Debug)]
pub struct OverlayOptions {
    /// Existing writable directory. A fresh temporary one is created if `None`.
    pub workspace: Option<PathBuf>,
    /// Existing directory to mount on. A fresh temporary one is created if `None`.
    pub mountpoint: Option<PathBuf>,
    /// Passed to the mount tool as `max_files`; not enforced here.
    pub max_files: u64,
    /// Union filesystem mount tool.
    pub mount_tool: ToolCommand,
    /// Unmount tool, invoked as `<tool> -f <mountpoint>`.
    pub unmount_tool: ToolCommand,
}

impl Default for OverlayOptions {
    fn default() -> Self {
        Self {
            workspace: None,
            mountpoint: None,
            max_files: DEFAULT_MAX_FILES,
            mount_tool: ToolCommand::program("unionfs"),
            unmount_tool: ToolCommand::program("umount"),
        }
    }
}

// ---------------------------------------------------------------------------
// MountHandle
// ---------------------------------------------------------------------------

/// The part of an overlay needed to unmount it.
///
/// Shared between the owning [`Overlay`] and its shutdown hook.
#[derive(Debug)]
pub struct MountHandle {
    mountpoint: PathBuf,
    unmount_tool: ToolCommand,
    mounted: AtomicBool,
    /// Directories created for this overlay; removed once unmounted.
    scratch: Mutex<Vec<TempDir>>,
}

impl MountHandle {
    /// `true` until the first release.
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    /// Unmount the view. Returns `true` if this call issued the unmount.
    ///
    /// The flag is cleared before the unmount tool runs, so concurrent
    /// callers never both reach it. Failures are logged and swallowed.
    pub fn release(&self) -> bool {
        if !self.mounted.swap(false, Ordering::SeqCst) {
            return false;
        }

        let mut cmd = self.unmount_tool.command([Path::new("-f"), self.mountpoint.as_path()]);
        tracing::debug!(command = ?cmd, "unmounting overlay");
        let output = cmd.stdout(Stdio::null()).stderr(Stdio::piped()).output();

        let scratch = std::mem::take(
            &mut *self
                .scratch
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        match output {
            Ok(out) if out.status.success() => {
                tracing::info!(mountpoint = %self.mountpoint.display(), "overlay unmounted");
                drop(scratch);
            }
            Ok(out) => {
                tracing::warn!(
                    mountpoint = %self.mountpoint.display(),
                    exit_code = ?out.status.code(),
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "unmount failed; leaving overlay directories in place"
                );
                keep_all(scratch);
            }
            Err(e) => {
                tracing::warn!(
                    mountpoint = %self.mountpoint.display(),
                    error = %e,
                    "could not run unmount tool; leaving overlay directories in place"
                );
                keep_all(scratch);
            }
        }
        true
    }
}

fn keep_all(dirs: Vec<TempDir>) {
    for dir in dirs {
        let path = dir.keep();
        tracing::debug!(path = %path.display(), "kept scratch directory");
    }
}

// ---------------------------------------------------------------------------
// Overlay
// ---------------------------------------------------------------------------

/// A mounted copy-on-write view over read-only layers.
#[derive(Debug)]
pub struct Overlay {
    layers: Vec<PathBuf>,
    workspace: PathBuf,
    handle: Arc<MountHandle>,
    hook: HookId,
}

impl Overlay {
    /// Validate `layers`, prepare the workspace and mountpoint, and mount.
    ///
    /// On failure nothing stays mounted and any directory created here has
    /// been removed again.
    ///
    /// # Errors
    /// - [`BandarError::LayerNotFound`] if a layer is not an existing directory.
    /// - [`BandarError::NotADirectory`] if a supplied workspace or mountpoint
    ///   does not exist.
    /// - [`BandarError::MountFailed`] if the mount tool cannot run or exits
    ///   unsuccessfully.
    /// - [`BandarError::Cancelled`] if process shutdown has begun.
    pub fn new<P: AsRef<Path>>(layers: &[P], options: OverlayOptions) -> Result<Self> {
        let layers = layers
            .iter()
            .map(|layer| {
                path_guard::resolve(layer, None).map_err(|err| match err {
                    BandarError::NotADirectory { path } => BandarError::LayerNotFound { path },
                    other => other,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // In flight until the cleanup hook is registered.
        let busy = Activity::process().enter()?;

        let mut scratch = Vec::new();
        let workspace = scratch_dir(options.workspace.as_deref(), WORKSPACE_PREFIX, &mut scratch)?;
        let mountpoint =
            scratch_dir(options.mountpoint.as_deref(), MOUNTPOINT_PREFIX, &mut scratch)?;

        let branches = branch_list(&workspace, &layers);
        let mut cmd = options.mount_tool.command([
            "-o".to_owned(),
            format!("cow,max_files={}", options.max_files),
            branches,
            mountpoint.display().to_string(),
        ]);
        tracing::debug!(command = ?cmd, "mounting overlay");

        let output = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| BandarError::MountFailed {
                mountpoint: mountpoint.clone(),
                detail: e.to_string(),
                exit_code: None,
            })?;
        if !output.status.success() {
            return Err(BandarError::MountFailed {
                mountpoint,
                detail: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
                exit_code: output.status.code(),
            });
        }
        tracing::info!(mountpoint = %mountpoint.display(), layers = layers.len(), "overlay mounted");

        let handle = Arc::new(MountHandle {
            mountpoint,
            unmount_tool: options.unmount_tool,
            mounted: AtomicBool::new(true),
            scratch: Mutex::new(scratch),
        });
        let hook = {
            let handle = Arc::clone(&handle);
            CleanupRegistry::global().register(move || {
                handle.release();
            })
        };
        drop(busy);

        Ok(Self {
            layers,
            workspace,
            handle,
            hook,
        })
    }

    /// Read-only layers in priority order.
    #[must_use]
    pub fn layers(&self) -> &[PathBuf] {
        &self.layers
    }

    /// Directory receiving every write made through the view.
    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Where the merged view is exposed.
    #[must_use]
    pub fn mountpoint(&self) -> &Path {
        &self.handle.mountpoint
    }

    /// `true` until the overlay has been torn down.
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.handle.is_mounted()
    }

    /// Shared handle, for callers that need to release the mount from
    /// elsewhere.
    #[must_use]
    pub fn handle(&self) -> Arc<MountHandle> {
        Arc::clone(&self.handle)
    }

    /// Unmount the view. Safe to call any number of times.
    pub fn teardown(&self) {
        self.handle.release();
        CleanupRegistry::global().unregister(self.hook);
    }
}

impl Drop for Overlay {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// `<workspace>=RW:<layer>=RO:...`
fn branch_list(workspace: &Path, layers: &[PathBuf]) -> String {
    std::iter::once(format!("{}=RW", workspace.display()))
        .chain(layers.iter().map(|l| format!("{}=RO", l.display())))
        .collect::<Vec<_>>()
        .join(":")
}

fn scratch_dir(supplied: Option<&Path>, prefix: &str, owned: &mut Vec<TempDir>) -> Result<PathBuf> {
    if let Some(path) = supplied {
        return path_guard::resolve(path, None);
    }
    let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
    let path = path_guard::normalize(dir.path());
    owned.push(dir);
    Ok(path)
}
