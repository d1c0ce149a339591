// src/sandbox/mod.rs
//! Worker process sandbox
//!
//! Engaged once per worker process before the first piece of tenant code
//! runs, and irreversible for the life of the process:
//!
//! - subprocess creation is denied by driving `RLIMIT_NPROC` to zero, so
//!   every fork/exec attempt fails at the syscall boundary;
//! - `PR_SET_NO_NEW_PRIVS` blocks any later privilege escalation;
//! - with identity dropping enabled, the process switches to an
//!   unprivileged per-tenant uid/gid derived deterministically from the
//!   application id. A failed switch is irrecoverable: the worker must not
//!   run tenant code half-confined.
//!
//! Separately, [`bind_death_signal`] ties the worker to its broker at
//! bootstrap so orphaned workers die with the parent instead of leaking.
//!
//! The syscall sequence is computed first as a [`SandboxPlan`] so the
//! derivation and the idempotence contract are testable without
//! privileges.

use crate::utils::config::SandboxSettings;
use crate::utils::errors::{Result, RunnerError};
use std::sync::OnceLock;
use tracing::{info, warn};

/// The concrete restrictions the sandbox will apply for one tenant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPlan {
    /// Deny fork/exec via `RLIMIT_NPROC = 0`
    pub deny_subprocess: bool,

    /// Set `PR_SET_NO_NEW_PRIVS`
    pub no_new_privs: bool,

    /// Drop to this uid/gid pair, when identity dropping is enabled
    pub identity: Option<TenantIdentity>,
}

/// Deterministic per-tenant unprivileged identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantIdentity {
    pub uid: u32,
    pub gid: u32,
}

impl SandboxPlan {
    /// Derive the plan for one tenant from the configured settings
    pub fn derive(settings: &SandboxSettings, app_id: &str) -> Self {
        let identity = settings.drop_identity.then(|| {
            let uid = settings.base_uid + fnv1a(app_id) % settings.uid_range;
            TenantIdentity { uid, gid: uid }
        });
        Self {
            deny_subprocess: settings.deny_subprocess,
            no_new_privs: true,
            identity,
        }
    }
}

/// FNV-1a over the application id; stable across runs and platforms
fn fnv1a(text: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in text.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Application id the sandbox was engaged for, set exactly once
static ENGAGED: OnceLock<String> = OnceLock::new();

/// Narrow this process's capabilities for the given tenant.
///
/// The first call applies the full plan; every later call is a no-op that
/// never re-attempts the identity switch, regardless of the app id it is
/// given.
pub fn engage(settings: &SandboxSettings, app_id: &str) -> Result<()> {
    let mut fresh = false;
    ENGAGED.get_or_init(|| {
        fresh = true;
        app_id.to_string()
    });
    if !fresh {
        return Ok(());
    }

    let plan = SandboxPlan::derive(settings, app_id);
    info!(app_id, ?plan, "engaging sandbox");
    apply(&plan)
}

/// True once [`engage`] has run in this process
pub fn is_engaged() -> bool {
    ENGAGED.get().is_some()
}

#[cfg(target_os = "linux")]
fn apply(plan: &SandboxPlan) -> Result<()> {
    use nix::sys::resource::{setrlimit, Resource};
    use nix::unistd::{setgid, setuid, Gid, Uid};

    if plan.deny_subprocess {
        setrlimit(Resource::RLIMIT_NPROC, 0, 0).map_err(|e| {
            RunnerError::SandboxViolation(format!("could not zero RLIMIT_NPROC: {}", e))
        })?;
    }

    if plan.no_new_privs {
        // SAFETY: prctl with PR_SET_NO_NEW_PRIVS takes no pointers and only
        // affects the calling process.
        let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if rc != 0 {
            return Err(RunnerError::SandboxViolation(format!(
                "PR_SET_NO_NEW_PRIVS failed: {}",
                std::io::Error::last_os_error()
            )));
        }
    }

    if let Some(identity) = plan.identity {
        // Group first; setuid discards the permission to change groups.
        setgid(Gid::from_raw(identity.gid)).map_err(|e| {
            RunnerError::SandboxViolation(format!("setgid({}) failed: {}", identity.gid, e))
        })?;
        setuid(Uid::from_raw(identity.uid)).map_err(|e| {
            RunnerError::SandboxViolation(format!("setuid({}) failed: {}", identity.uid, e))
        })?;
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn apply(plan: &SandboxPlan) -> Result<()> {
    if plan.identity.is_some() {
        return Err(RunnerError::SandboxViolation(
            "identity dropping requires a POSIX platform".into(),
        ));
    }
    warn!("subprocess denial not supported on this platform");
    Ok(())
}

/// Die with SIGKILL when the parent (broker) process exits.
///
/// Applied at worker bootstrap, before the first frame is read. Non-fatal
/// where unsupported: the heartbeat watchdog still reaps orphans.
pub fn bind_death_signal() {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: prctl with PR_SET_PDEATHSIG only affects the calling
        // process.
        let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) };
        if rc != 0 {
            warn!(
                "PR_SET_PDEATHSIG failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}
