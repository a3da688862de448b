//! C3 — Identity Resolver (§4.3).
//!
//! Three operations: fixed-user lookup, fixed-group lookup, and
//! supplementary-group-list compilation, plus a hook for dynamic-user mode
//! to consult an external allocator. Resolution (`resolve`) and enforcement
//! (`apply`) are kept separate so the sandbox-application step (C8) can
//! resolve identity early (it needs the target uid/gid for exec-directory
//! ownership) but only apply `setgroups`/`setresgid`/`setresuid` at the
//! point in the 35-step sequence where privileges are actually dropped.
//!
//! Grounded on `services::start_service::{resolve_uid, resolve_gid,
//! resolve_supplementary_gids}` for the name-or-numeric-id lookup pattern,
//! and on the `setgroups` → `setresgid` → `setresuid` ordering the teacher's
//! `exec_helper.rs` performs just before `execve`.

use std::path::PathBuf;

use nix::unistd::{Gid, Uid};

use crate::error::{StepExitCode, StepResult};
use crate::platform::{grnam, pwnam};
use crate::step_err;

/// NGROUPS_MAX on Linux; supplementary group lists longer than this are a
/// configuration error, not a kernel-enforced truncation, so we reject
/// eagerly rather than letting `setgroups` fail late.
pub const NGROUPS_MAX: usize = 65536;

/// Paths considered suspicious enough to null out for the environment, per
/// §4.3 — a nologin shell or a root home directory would otherwise leak
/// into `$SHELL`/`$HOME` and confuse the invoked program.
const SUSPICIOUS_SHELLS: &[&str] = &["/bin/nologin", "/usr/sbin/nologin", "/sbin/nologin"];
const SUSPICIOUS_HOME: &str = "/";

/// The resolved, not-yet-applied identity for a spawn.
#[derive(Clone, Debug)]
pub struct ResolvedIdentity {
    pub uid: Uid,
    pub gid: Gid,
    pub home: Option<PathBuf>,
    pub shell: Option<PathBuf>,
    pub supplementary_gids: Vec<Gid>,
}

/// A `User=`/`Group=` value as configured: either a name to look up or
/// bare numeric text (both are accepted by systemd-style unit syntax and by
/// our own `ExecContext.user`/`group` string fields).
fn parse_uid(value: &str) -> Option<Uid> {
    value.parse::<u32>().ok().map(Uid::from_raw)
}

fn parse_gid(value: &str) -> Option<Gid> {
    value.parse::<u32>().ok().map(Gid::from_raw)
}

/// Resolves `User=` to `(uid, gid, home, shell)` via the system user
/// database, name or numeric id.
fn resolve_fixed_user(user: &str) -> StepResult<(Uid, Gid, Option<PathBuf>, Option<PathBuf>)> {
    if let Some(uid) = parse_uid(user) {
        return match pwnam::getpwuid_r(uid) {
            Ok(pw) => Ok((uid, pw.gid, Some(pw.home), Some(pw.shell))),
            Err(_) => Ok((uid, Gid::from_raw(uid.as_raw()), None, None)),
        };
    }
    let pw = pwnam::getpwnam_r(user)
        .map_err(|e| step_err!(StepExitCode::User, "failed to resolve user {user:?}: {e}"))?;
    Ok((pw.uid, pw.gid, Some(pw.home), Some(pw.shell)))
}

/// Resolves `Group=` to a gid, name or numeric id.
fn resolve_fixed_group(group: &str) -> StepResult<Gid> {
    if let Some(gid) = parse_gid(group) {
        return Ok(gid);
    }
    let gr = grnam::getgrnam_r(group)
        .map_err(|e| step_err!(StepExitCode::Group, "failed to resolve group {group:?}: {e}"))?;
    Ok(gr.gid)
}

/// Nulls out a shell/home that would leak a nologin marker or the root
/// directory into the environment (§4.3).
fn sanitize_shell(shell: Option<PathBuf>) -> Option<PathBuf> {
    shell.filter(|s| !SUSPICIOUS_SHELLS.contains(&s.to_string_lossy().as_ref()))
}

fn sanitize_home(home: Option<PathBuf>) -> Option<PathBuf> {
    home.filter(|h| h.to_string_lossy() != SUSPICIOUS_HOME)
}

/// Seeds the supplementary group list the way `initgroups()` would (every
/// group the resolved user is a member of per `/etc/group`), then appends
/// the explicitly requested groups, deduplicating and rejecting overflow of
/// `NGROUPS_MAX`.
fn compile_supplementary_gids(
    primary_user: Option<&str>,
    primary_gid: Gid,
    requested: &[String],
) -> StepResult<Vec<Gid>> {
    let mut gids: Vec<Gid> = Vec::new();

    if let Some(user) = primary_user {
        if primary_gid.as_raw() != 0 {
            if let Ok(pw) = pwnam::getpwnam_r(user) {
                if let Ok(groups) = nix::unistd::getgrouplist(
                    &std::ffi::CString::new(pw.name.as_bytes()).unwrap_or_default(),
                    pw.gid,
                ) {
                    gids.extend(groups);
                }
            }
        }
    }

    for g in requested {
        let gid = if let Some(gid) = parse_gid(g) {
            gid
        } else {
            grnam::getgrnam_r(g)
                .map_err(|e| {
                    step_err!(StepExitCode::Group, "failed to resolve supplementary group {g:?}: {e}")
                })?
                .gid
        };
        if !gids.contains(&gid) {
            gids.push(gid);
        }
    }

    if gids.len() > NGROUPS_MAX {
        return Err(step_err!(
            StepExitCode::Group,
            "supplementary group list has {} entries, exceeds NGROUPS_MAX ({})",
            gids.len(),
            NGROUPS_MAX
        ));
    }

    Ok(gids)
}

/// Resolves the full identity for a spawn: fixed user, fixed group
/// (overriding the user's primary gid when set), and the compiled
/// supplementary group list. Does not touch process credentials.
///
/// When `dynamic` is `Some`, it was already handed out by the
/// `DynamicUserAllocator` collaborator and supersedes any fixed user/group
/// lookup entirely (§4.3): there is no passwd/group entry for an allocated
/// uid, so home/shell stay unset and the supplementary-group list is built
/// from only the explicitly requested groups, without an `initgroups()`
/// seed.
pub fn resolve(
    user: Option<&str>,
    group: Option<&str>,
    supplementary_groups: &[String],
    dynamic: Option<DynamicIdentity>,
) -> StepResult<ResolvedIdentity> {
    if let Some(dynamic) = dynamic {
        let supplementary_gids = compile_supplementary_gids(None, dynamic.gid, supplementary_groups)?;
        return Ok(ResolvedIdentity {
            uid: dynamic.uid,
            gid: dynamic.gid,
            home: None,
            shell: None,
            supplementary_gids,
        });
    }

    let (uid, mut gid, home, shell) = match user {
        Some(u) => resolve_fixed_user(u)?,
        None => (
            nix::unistd::getuid(),
            nix::unistd::getgid(),
            None,
            None,
        ),
    };

    if let Some(g) = group {
        gid = resolve_fixed_group(g)?;
    }

    let supplementary_gids = compile_supplementary_gids(user, gid, supplementary_groups)?;

    Ok(ResolvedIdentity {
        uid,
        gid,
        home: sanitize_home(home),
        shell: sanitize_shell(shell),
        supplementary_gids,
    })
}

/// Applies a resolved identity to the calling process: `setgroups` then
/// `setresgid(gid, gid, gid)` then `setresuid(uid, uid, uid)`, in that
/// order — group credentials must be dropped before uid, or the process
/// loses the privilege needed to call `setgroups`/`setresgid` at all.
pub fn apply(identity: &ResolvedIdentity) -> StepResult<()> {
    apply_groups(identity)?;
    apply_uid(identity)?;
    Ok(())
}

/// Group-enforcement half of identity application: `setgroups` then
/// `setresgid`. Split out from `apply_uid` because the 35-step
/// sandbox-application sequence enforces groups well before it drops uid
/// (group credentials must go first, or the process loses the privilege
/// needed to call `setgroups`/`setresgid` at all) — the two calls are not
/// adjacent in that sequence the way a naive single `apply` would suggest.
pub fn apply_groups(identity: &ResolvedIdentity) -> StepResult<()> {
    if nix::unistd::getuid().is_root() || nix::unistd::geteuid().is_root() {
        nix::unistd::setgroups(&identity.supplementary_gids)
            .map_err(|e| step_err!(StepExitCode::Group, "setgroups failed: {e}"))?;

        set_resgid(identity.gid)
            .map_err(|e| step_err!(StepExitCode::Group, "setresgid failed: {e}"))?;
    }
    Ok(())
}

/// uid half of identity application: `setresuid` alone.
pub fn apply_uid(identity: &ResolvedIdentity) -> StepResult<()> {
    if nix::unistd::getuid().is_root() || nix::unistd::geteuid().is_root() {
        set_resuid(identity.uid)
            .map_err(|e| step_err!(StepExitCode::User, "setresuid failed: {e}"))?;
    }
    Ok(())
}

fn set_resgid(gid: Gid) -> nix::Result<()> {
    let ret = unsafe { libc::setresgid(gid.as_raw(), gid.as_raw(), gid.as_raw()) };
    if ret != 0 {
        return Err(nix::errno::Errno::last());
    }
    Ok(())
}

fn set_resuid(uid: Uid) -> nix::Result<()> {
    let ret = unsafe { libc::setresuid(uid.as_raw(), uid.as_raw(), uid.as_raw()) };
    if ret != 0 {
        return Err(nix::errno::Errno::last());
    }
    Ok(())
}

/// A free uid/gid pair handed out by the dynamic-user allocator.
#[derive(Clone, Copy, Debug)]
pub struct DynamicIdentity {
    pub uid: Uid,
    pub gid: Gid,
}

/// The abstract collaborator dynamic-user mode consults to pick a free
/// uid/gid pair with ephemeral recycling. The core only needs the ability
/// to ask for an allocation and to release one back; how ids are actually
/// picked, persisted and recycled across restarts is left to the caller's
/// implementation of this trait (§4.3 names it only as "an external
/// allocator (abstract collaborator)").
pub trait DynamicUserAllocator {
    /// Allocates a uid/gid pair for `name`. `suggested_paths` are existing
    /// exec-directory owners the core would like reused when one of them
    /// already has a stable numeric owner (avoids unnecessary recycling
    /// when a service restarts and its state directory is already owned by
    /// a previously allocated dynamic uid).
    fn allocate(
        &mut self,
        name: &str,
        suggested_paths: &[PathBuf],
    ) -> StepResult<DynamicIdentity>;

    /// Releases a previously allocated identity back to the pool. Callers
    /// may defer the actual recycling; this only signals that the core no
    /// longer holds a reference to it.
    fn release(&mut self, name: &str, identity: DynamicIdentity);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspicious_shell_is_nulled() {
        assert_eq!(sanitize_shell(Some(PathBuf::from("/bin/nologin"))), None);
        assert_eq!(
            sanitize_shell(Some(PathBuf::from("/bin/bash"))),
            Some(PathBuf::from("/bin/bash"))
        );
    }

    #[test]
    fn root_home_is_nulled() {
        assert_eq!(sanitize_home(Some(PathBuf::from("/"))), None);
        assert_eq!(
            sanitize_home(Some(PathBuf::from("/home/alice"))),
            Some(PathBuf::from("/home/alice"))
        );
    }

    #[test]
    fn numeric_group_values_parse_without_lookup() {
        assert_eq!(parse_gid("1000"), Some(Gid::from_raw(1000)));
        assert_eq!(parse_gid("not-a-number"), None);
    }

    #[test]
    fn overflowing_supplementary_group_list_is_rejected() {
        let requested: Vec<String> = (0..=NGROUPS_MAX).map(|n| n.to_string()).collect();
        let result = compile_supplementary_gids(None, Gid::from_raw(0), &requested);
        assert!(result.is_err());
    }

    #[test]
    fn dynamic_identity_supersedes_fixed_user_and_group() {
        let dynamic = DynamicIdentity {
            uid: Uid::from_raw(61234),
            gid: Gid::from_raw(61234),
        };
        let identity = resolve(Some("root"), Some("root"), &[], Some(dynamic)).unwrap();
        assert_eq!(identity.uid, dynamic.uid);
        assert_eq!(identity.gid, dynamic.gid);
        assert_eq!(identity.home, None);
        assert_eq!(identity.shell, None);
    }
}
