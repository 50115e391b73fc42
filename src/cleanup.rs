//! Shutdown coordination.
//!
//! Mounted overlays and registered build pools must be released exactly once,
//! whether the owner tears them down explicitly, is dropped, or the process is
//! interrupted. Owners register a hook capturing only their resource handle
//! with the process-wide [`CleanupRegistry`]; the handle's own flag makes
//! repeated calls no-ops.
//!
//! [`Activity`] counts in-flight external invocations so that teardown can
//! wait for them before pulling the mount out from under them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::error::{BandarError, Result};

/// Exit status used after an interrupt-driven shutdown.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

type Hook = Arc<dyn Fn() + Send + Sync>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // Hooks may panic while holding nothing of ours; a poisoned map is still usable.
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// CleanupRegistry
// ---------------------------------------------------------------------------

/// Token returned by [`CleanupRegistry::register`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HookId(u64);

/// Teardown hooks to run when the process shuts down abnormally.
#[derive(Default)]
pub struct CleanupRegistry {
    hooks: Mutex<BTreeMap<HookId, Hook>>,
    next: AtomicU64,
}

impl CleanupRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by overlays, build pools and the
    /// interrupt handler.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<CleanupRegistry> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Register a hook. It must be idempotent: it may run more than once.
    pub fn register(&self, hook: impl Fn() + Send + Sync + 'static) -> HookId {
        let id = HookId(self.next.fetch_add(1, Ordering::Relaxed));
        lock(&self.hooks).insert(id, Arc::new(hook));
        id
    }

    /// Remove a hook. Unknown ids are ignored.
    pub fn unregister(&self, id: HookId) {
        lock(&self.hooks).remove(&id);
    }

    /// Number of registered hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.hooks).len()
    }

    /// `true` if no hooks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every registered hook, most recently registered first.
    ///
    /// The lock is released before any hook runs, so hooks may unregister
    /// themselves.
    pub fn run_all(&self) {
        let hooks: Vec<Hook> = lock(&self.hooks).values().rev().cloned().collect();
        for hook in hooks {
            hook();
        }
    }
}

// ---------------------------------------------------------------------------
// Activity
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ActivityState {
    active: usize,
    cancelled: bool,
}

/// Counter of in-flight operations with a join barrier.
#[derive(Default)]
pub struct Activity {
    state: Mutex<ActivityState>,
    idle: Condvar,
}

impl Activity {
    /// A fresh, idle, non-cancelled counter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide counter consulted by the interrupt handler.
    pub fn process() -> &'static Self {
        static PROCESS: OnceLock<Activity> = OnceLock::new();
        PROCESS.get_or_init(Self::new)
    }

    /// Start an operation.
    ///
    /// # Errors
    /// Returns [`BandarError::Cancelled`] once [`Activity::cancel`] was called.
    pub fn enter(&self) -> Result<ActivityGuard<'_>> {
        let mut state = lock(&self.state);
        if state.cancelled {
            return Err(BandarError::Cancelled);
        }
        state.active += 1;
        Ok(ActivityGuard { activity: self })
    }

    /// Refuse new operations from now on. Running ones are unaffected.
    pub fn cancel(&self) {
        lock(&self.state).cancelled = true;
    }

    /// `true` once [`Activity::cancel`] was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        lock(&self.state).cancelled
    }

    /// Number of operations currently running.
    #[must_use]
    pub fn active(&self) -> usize {
        lock(&self.state).active
    }

    /// Block until no operation is running.
    pub fn wait_idle(&self) {
        let state = lock(&self.state);
        drop(
            self.idle
                .wait_while(state, |s| s.active > 0)
                .unwrap_or_else(PoisonError::into_inner),
        );
    }

    fn leave(&self) {
        let mut state = lock(&self.state);
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            self.idle.notify_all();
        }
    }
}

impl std::fmt::Debug for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Activity")
            .field("active", &self.active())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Marks one running operation; dropping it ends the operation.
#[must_use = "the operation ends when the guard is dropped"]
pub struct ActivityGuard<'a> {
    activity: &'a Activity,
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        self.activity.leave();
    }
}

// ---------------------------------------------------------------------------
// Interrupt handling
// ---------------------------------------------------------------------------

/// Run every registered hook after in-flight invocations have finished.
pub fn shutdown_gracefully() {
    let activity = Activity::process();
    activity.cancel();
    tracing::info!(
        in_flight = activity.active(),
        "shutdown requested, waiting for running commands"
    );
    activity.wait_idle();
    CleanupRegistry::global().run_all();
}

/// Run every registered hook immediately.
pub fn shutdown_now() {
    Activity::process().cancel();
    CleanupRegistry::global().run_all();
}

/// Route SIGINT, SIGTERM and SIGHUP to a dedicated thread.
///
/// The signals are blocked on the calling thread and on every thread it
/// creates afterwards; call this first thing in `main`. Child processes
/// start with an empty mask, so a terminal interrupt reaches tools in flight
/// as well; shutdown waits for them to exit.
///
/// The first signal shuts down gracefully (see [`shutdown_gracefully`]) and
/// exits with [`INTERRUPTED_EXIT_CODE`]; a second signal tears everything
/// down without waiting.
///
/// # Errors
/// Returns an error if the signal mask cannot be changed or the thread cannot
/// be spawned.
pub fn install_interrupt_handler() -> std::io::Result<()> {
    use nix::sys::signal::{SigSet, Signal};

    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGHUP);
    set.thread_block().map_err(std::io::Error::from)?;

    std::thread::Builder::new()
        .name("bandar-signals".to_owned())
        .spawn(move || {
            let mut received = 0_u32;
            loop {
                let Ok(signal) = set.wait() else {
                    continue;
                };
                received += 1;
                if received == 1 {
                    tracing::warn!(%signal, "interrupted, cleaning up");
                    eprintln!("Interrupted, waiting for running commands before cleanup...");
                    let spawned = std::thread::Builder::new()
                        .name("bandar-shutdown".to_owned())
                        .spawn(|| {
                            shutdown_gracefully();
                            std::process::exit(INTERRUPTED_EXIT_CODE);
                        });
                    if spawned.is_err() {
                        shutdown_now();
                        std::process::exit(INTERRUPTED_EXIT_CODE);
                    }
                } else {
                    tracing::warn!(%signal, "interrupted again, forcing cleanup");
                    shutdown_now();
                    std::process::exit(INTERRUPTED_EXIT_CODE);
                }
            }
        })?;
    Ok(())
}
