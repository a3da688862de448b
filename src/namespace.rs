//! C7 — Namespace Builder (§4.7).
//!
//! Decides whether a mount namespace is needed at all, compiles the flat
//! bind-mount and symlink lists the sandbox-application step (C8) will
//! apply, and drives the unshare/userns-bootstrap sub-protocols. The actual
//! `unshare(2)`/`mount(2)` sequence is delegated to a collaborator trait
//! (`NamespaceCollaborator`) exactly as §4.7 describes — this module owns
//! the decision logic and the `ENOANO` downgrade-or-fail contract around
//! that collaborator, not every mount flag's kernel-level behaviour.
//!
//! No analogue exists in the grounding codebase (`rustysd` runs services
//! unsandboxed), so the bootstrap sub-protocol is grounded directly in the
//! spec's own eventfd/pipe synchronisation description (§4.7) using the
//! same raw-fd, close-on-error style the teacher's fd-handling code favours
//! throughout `exec_helper.rs`.

use std::path::{Path, PathBuf};

use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::unistd::{ForkResult, Pid};

use crate::context::{BindMount, DirectoryClass, ExecContext, ProtectMode};
use crate::error::{StepExitCode, StepResult};
use crate::step_err;

/// A compiled bind mount ready for the collaborator to apply.
#[derive(Clone, Debug)]
pub struct CompiledBindMount {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub read_only: bool,
    pub recursive: bool,
    pub ignore_missing: bool,
    pub nosuid: bool,
}

impl From<&BindMount> for CompiledBindMount {
    fn from(m: &BindMount) -> Self {
        Self {
            source: m.source.clone(),
            destination: m.destination.clone(),
            read_only: m.read_only,
            recursive: m.recursive,
            ignore_missing: m.ignore_missing,
            nosuid: m.nosuid,
        }
    }
}

/// A compiled `src -> dst` symlink, created after all mounts settle but
/// before read-only is applied (§4.7).
#[derive(Clone, Debug)]
pub struct CompiledSymlink {
    pub source: PathBuf,
    pub destination: PathBuf,
}

/// Whether a mount namespace is required at all (§4.7's need-mount-ns
/// predicate). Each clause mirrors one bullet in the distilled spec.
#[must_use]
pub fn needs_mount_namespace(
    ctx: &ExecContext,
    runtime_tmp_present: bool,
    directory_prefixes_have_private_user_dir: bool,
) -> bool {
    let fs = &ctx.filesystem;

    fs.root_directory.is_some()
        || fs.root_image.is_some()
        || !fs.read_only_paths.is_empty()
        || !fs.read_write_paths.is_empty()
        || !fs.inaccessible_paths.is_empty()
        || !fs.exec_paths.is_empty()
        || !fs.no_exec_paths.is_empty()
        || !fs.bind_mounts.is_empty()
        || !fs.temporary_filesystems.is_empty()
        || !fs.mount_images.is_empty()
        || !fs.extension_images.is_empty()
        || !fs.extension_directories.is_empty()
        || fs.mount_propagation_private
        || (fs.private_tmp && runtime_tmp_present)
        || fs.private_devices
        || fs.private_network
        || fs.private_ipc
        || fs.private_users
        || !matches!(fs.protect_home, ProtectMode::No)
        || !matches!(fs.protect_system, ProtectMode::No)
        || !matches!(fs.protect_proc, ProtectMode::No)
        || ctx.io.log_namespace.is_some()
        || (ctx.dynamic_user && directory_prefixes_have_private_user_dir)
        || (fs.mount_api_vfs && fs.root_directory.is_some())
}

/// Compiles the flat bind-mount list (§4.7). When dynamic-user mode is on
/// and no separate rootfs is configured, appends a synthetic tmpfs mount
/// point at `prefix[T]/private/` for each directory class so the service
/// only ever sees its own sub-tree there.
pub fn compile_bind_mounts(
    ctx: &ExecContext,
    prefix_for: impl Fn(DirectoryClass) -> PathBuf,
) -> Vec<CompiledBindMount> {
    let mut mounts: Vec<CompiledBindMount> =
        ctx.filesystem.bind_mounts.iter().map(CompiledBindMount::from).collect();

    if ctx.dynamic_user && ctx.filesystem.root_directory.is_none() && ctx.filesystem.root_image.is_none() {
        for class in DirectoryClass::all() {
            if ctx.directories.get(&class).is_some_and(|c| !c.items.is_empty()) {
                let private_root = prefix_for(class).join("private");
                mounts.push(CompiledBindMount {
                    source: PathBuf::new(), // empty source marks a fresh tmpfs, not a bind
                    destination: private_root,
                    read_only: false,
                    recursive: false,
                    ignore_missing: true,
                    nosuid: true,
                });
            }
        }
    }

    mounts
}

/// Compiles the symlink list (§4.7). For dynamic-user mode without a
/// separate rootfs, adds the canonical `prefix[T]/P -> prefix[T]/private/P`
/// link for every directory item.
pub fn compile_symlinks(
    ctx: &ExecContext,
    prefix_for: impl Fn(DirectoryClass) -> PathBuf,
) -> Vec<CompiledSymlink> {
    let mut links = Vec::new();

    if ctx.dynamic_user && ctx.filesystem.root_directory.is_none() && ctx.filesystem.root_image.is_none() {
        for class in DirectoryClass::all() {
            let Some(config) = ctx.directories.get(&class) else {
                continue;
            };
            let prefix = prefix_for(class);
            for item in &config.items {
                links.push(CompiledSymlink {
                    source: prefix.join("private").join(&item.path),
                    destination: prefix.join(&item.path),
                });
            }
        }
    }

    links
}

/// The exclusive "cannot namespace in this container" sentinel from §4.7.
/// Linux reserves `ENOANO` for exactly this purpose in systemd's own
/// namespacing code, so it's adopted here unchanged as the collaborator
/// contract's distinguished error value.
pub const ENOANO: i32 = 55;

/// Decides whether an `ENOANO` from the collaborator is recoverable: only
/// when no filesystem-rearranging settings are actually present, so a
/// plain "give me a private /tmp" request degrades silently but a real
/// `RootDirectory=` is a hard failure.
#[must_use]
pub fn enoano_is_recoverable(ctx: &ExecContext) -> bool {
    let fs = &ctx.filesystem;
    fs.root_directory.is_none()
        && fs.root_image.is_none()
        && fs.bind_mounts.is_empty()
        && fs.read_only_paths.is_empty()
        && fs.read_write_paths.is_empty()
        && fs.inaccessible_paths.is_empty()
        && fs.temporary_filesystems.is_empty()
        && fs.mount_images.is_empty()
        && fs.extension_images.is_empty()
}

/// The collaborator contract from §4.7: attempt the actual
/// `unshare`/`mount` sequence, returning either success, the `ENOANO`
/// sentinel, or a fatal error.
pub trait NamespaceCollaborator {
    fn apply(
        &mut self,
        bind_mounts: &[CompiledBindMount],
        symlinks: &[CompiledSymlink],
    ) -> Result<(), NamespaceCollaboratorError>;
}

#[derive(Debug)]
pub enum NamespaceCollaboratorError {
    /// The distinguished `ENOANO` sentinel.
    CannotNamespace,
    Fatal(String),
}

/// Applies the namespace builder's decision: calls the collaborator, and on
/// `ENOANO` either downgrades silently (logs and continues unsandboxed) or
/// fails hard, per the insist-on-sandboxing predicate.
pub fn apply_namespace(
    ctx: &ExecContext,
    collaborator: &mut dyn NamespaceCollaborator,
    bind_mounts: &[CompiledBindMount],
    symlinks: &[CompiledSymlink],
    insist_on_sandboxing: bool,
) -> StepResult<()> {
    match collaborator.apply(bind_mounts, symlinks) {
        Ok(()) => Ok(()),
        Err(NamespaceCollaboratorError::CannotNamespace) => {
            if enoano_is_recoverable(ctx) && !insist_on_sandboxing {
                log::warn!("mount namespace unavailable in this container, continuing unsandboxed");
                Ok(())
            } else {
                Err(step_err!(
                    StepExitCode::Namespace,
                    "mount namespace unavailable and sandboxing settings require it"
                ))
            }
        }
        Err(NamespaceCollaboratorError::Fatal(msg)) => {
            Err(step_err!(StepExitCode::Namespace, "namespace setup failed: {msg}"))
        }
    }
}

// ---------------------------------------------------------------------------
// User-namespace bootstrap (§4.7)
// ---------------------------------------------------------------------------

/// Writes the `uid_map`/`gid_map`/`setgroups` lines for a child that has
/// already called `unshare(CLONE_NEWUSER)`, from the parent (original)
/// namespace, synchronising with an eventfd ready-signal and a pipe for
/// error propagation.
///
/// The single-line mapping `OUID OUID 1` (identity-map the owning uid) is
/// always written; `UID UID 1` (identity-map the target uid too) is
/// appended only when `CAP_SETUID` is effective in the parent, since
/// mapping an arbitrary second uid requires that capability.
pub fn bootstrap_user_namespace(
    child_pid: Pid,
    owning_uid: u32,
    target_uid: u32,
    target_gid: u32,
    cap_setuid_effective: bool,
) -> StepResult<()> {
    let proc_root = format!("/proc/{}", child_pid.as_raw());

    std::fs::write(format!("{proc_root}/setgroups"), "deny")
        .map_err(|e| step_err!(StepExitCode::Namespace, "write setgroups failed: {e}"))?;

    let mut uid_map = format!("{owning_uid} {owning_uid} 1\n");
    if cap_setuid_effective && target_uid != owning_uid {
        uid_map.push_str(&format!("{target_uid} {target_uid} 1\n"));
    }
    std::fs::write(format!("{proc_root}/uid_map"), uid_map)
        .map_err(|e| step_err!(StepExitCode::Namespace, "write uid_map failed: {e}"))?;

    std::fs::write(format!("{proc_root}/gid_map"), format!("{target_gid} {target_gid} 1\n"))
        .map_err(|e| step_err!(StepExitCode::Namespace, "write gid_map failed: {e}"))?;

    Ok(())
}

/// The two-fd handshake primitive used by the bootstrap protocol: an
/// eventfd for "I'm ready", a pipe for "here's my error, if any". Mirrors
/// the same eventfd-ready / pipe-error shape used again in the PAM keeper
/// sub-protocol (§4.8), so both are built on this one small primitive.
pub struct ReadySignal {
    pub eventfd: EventFd,
    pub error_pipe_read: std::os::fd::OwnedFd,
    pub error_pipe_write: std::os::fd::OwnedFd,
}

impl ReadySignal {
    pub fn new() -> StepResult<Self> {
        let eventfd = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC)
            .map_err(|e| step_err!(StepExitCode::Namespace, "eventfd() failed: {e}"))?;
        let (read, write) = nix::unistd::pipe()
            .map_err(|e| step_err!(StepExitCode::Namespace, "pipe() failed: {e}"))?;
        Ok(Self {
            eventfd,
            error_pipe_read: read,
            error_pipe_write: write,
        })
    }

    /// Signals readiness by writing `1` to the eventfd.
    pub fn signal_ready(&self) -> StepResult<()> {
        self.eventfd
            .write(1)
            .map_err(|e| step_err!(StepExitCode::Namespace, "eventfd write failed: {e}"))?;
        Ok(())
    }

    /// Blocks until the other side signals readiness.
    pub fn wait_ready(&self) -> StepResult<()> {
        self.eventfd
            .read()
            .map_err(|e| step_err!(StepExitCode::Namespace, "eventfd read failed: {e}"))?;
        Ok(())
    }
}

/// Performs the full bootstrap: forks a cooperating helper that stays in
/// the original namespace to write the maps for `child_pid` (which has
/// already unshared), signalling completion via `ReadySignal` and
/// propagating any write failure back through the error pipe.
pub fn run_bootstrap_helper(
    child_pid: Pid,
    owning_uid: u32,
    target_uid: u32,
    target_gid: u32,
    cap_setuid_effective: bool,
) -> StepResult<()> {
    let signal = ReadySignal::new()?;

    match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Child) => {
            let result = bootstrap_user_namespace(
                child_pid,
                owning_uid,
                target_uid,
                target_gid,
                cap_setuid_effective,
            );
            if let Err(e) = &result {
                use std::io::Write;
                let mut pipe = std::fs::File::from(
                    signal.error_pipe_write.try_clone().expect("dup error pipe"),
                );
                let _ = write!(pipe, "{e}");
            }
            let _ = signal.signal_ready();
            std::process::exit(i32::from(result.is_err()));
        }
        Ok(ForkResult::Parent { child: helper_pid, .. }) => {
            signal.wait_ready()?;
            let _ = nix::sys::wait::waitpid(helper_pid, None);

            use std::io::Read;
            let mut err_msg = String::new();
            let mut pipe = std::fs::File::from(
                signal.error_pipe_read.try_clone().expect("dup error pipe"),
            );
            let _ = pipe.read_to_string(&mut err_msg);
            if !err_msg.is_empty() {
                return Err(step_err!(StepExitCode::Namespace, "userns bootstrap failed: {err_msg}"));
            }
            Ok(())
        }
        Err(e) => Err(step_err!(StepExitCode::Namespace, "fork for userns bootstrap failed: {e}")),
    }
}

/// UTS isolation for hostname protection (§4.7, §4.8 step 14):
/// `unshare(CLONE_NEWUTS)` plus optionally setting a fixed hostname in the
/// new namespace.
pub fn isolate_uts(hostname: Option<&str>) -> StepResult<()> {
    nix::sched::unshare(nix::sched::CloneFlags::CLONE_NEWUTS)
        .map_err(|e| step_err!(StepExitCode::Namespace, "unshare(CLONE_NEWUTS) failed: {e}"))?;
    if let Some(name) = hostname {
        nix::unistd::sethostname(name)
            .map_err(|e| step_err!(StepExitCode::Namespace, "sethostname failed: {e}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Credential workspace mount protocol (§4.5/§4.7)
// ---------------------------------------------------------------------------

/// Builds the credential workspace in a private mount namespace: unshares,
/// mounts ramfs (falling back to tmpfs when ramfs isn't available) at a
/// staging path, lets `populate` write the credential files there, then
/// move-mounts the finished tmpfs onto `final_dir` so it appears exactly
/// where the rest of the pipeline expects it, invisible to anything outside
/// this process's own mount namespace.
pub fn mount_credential_workspace(
    final_dir: &Path,
    populate: impl FnOnce(&Path) -> StepResult<()>,
) -> StepResult<()> {
    use nix::mount::{mount, MsFlags};

    nix::sched::unshare(nix::sched::CloneFlags::CLONE_NEWNS)
        .map_err(|e| step_err!(StepExitCode::Credentials, "unshare(CLONE_NEWNS) for credential workspace failed: {e}"))?;
    mount(None::<&str>, "/", None::<&str>, MsFlags::MS_REC | MsFlags::MS_PRIVATE, None::<&str>)
        .map_err(|e| step_err!(StepExitCode::Credentials, "making mount tree private failed: {e}"))?;

    let staging = std::env::temp_dir().join(format!(".credentials-staging-{}", nix::unistd::getpid()));
    std::fs::create_dir_all(&staging)
        .map_err(|e| step_err!(StepExitCode::Credentials, "mkdir {staging:?} failed: {e}"))?;

    if mount(Some("ramfs"), &staging, Some("ramfs"), MsFlags::MS_NOSUID | MsFlags::MS_NODEV, None::<&str>).is_err() {
        mount(Some("tmpfs"), &staging, Some("tmpfs"), MsFlags::MS_NOSUID | MsFlags::MS_NODEV, Some("mode=0700"))
            .map_err(|e| step_err!(StepExitCode::Credentials, "mounting tmpfs credential workspace at {staging:?} failed: {e}"))?;
    }

    populate(&staging)?;

    std::fs::create_dir_all(final_dir)
        .map_err(|e| step_err!(StepExitCode::Credentials, "mkdir {final_dir:?} failed: {e}"))?;
    mount(Some(&staging), final_dir, None::<&str>, MsFlags::MS_MOVE, None::<&str>)
        .map_err(|e| step_err!(StepExitCode::Credentials, "move-mounting credential workspace onto {final_dir:?} failed: {e}"))?;
    std::fs::remove_dir(&staging).ok();

    Ok(())
}

/// Whether `path` itself needs a preparatory mkdir before a bind mount can
/// target it (systemd bind-mounts onto existing nodes; a missing
/// destination is either created or, with `ignore_missing`, skipped).
#[must_use]
pub fn destination_needs_mkdir(mount: &CompiledBindMount) -> bool {
    !mount.destination.exists() && !mount.ignore_missing
}

#[must_use]
pub fn protect_mode_is_read_only(mode: ProtectMode) -> bool {
    matches!(mode, ProtectMode::ReadOnly | ProtectMode::Strict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecContext;

    #[test]
    fn no_settings_does_not_need_mount_namespace() {
        let ctx = ExecContext::with_defaults();
        assert!(!needs_mount_namespace(&ctx, false, false));
    }

    #[test]
    fn root_directory_forces_mount_namespace() {
        let mut ctx = ExecContext::with_defaults();
        ctx.filesystem.root_directory = Some(PathBuf::from("/srv/root"));
        assert!(needs_mount_namespace(&ctx, false, false));
    }

    #[test]
    fn private_tmp_only_needs_namespace_when_runtime_tmp_present() {
        let mut ctx = ExecContext::with_defaults();
        ctx.filesystem.private_tmp = true;
        assert!(!needs_mount_namespace(&ctx, false, false));
        assert!(needs_mount_namespace(&ctx, true, false));
    }

    #[test]
    fn enoano_recoverable_only_without_fs_rearranging_settings() {
        let mut ctx = ExecContext::with_defaults();
        assert!(enoano_is_recoverable(&ctx));
        ctx.filesystem.root_image = Some(PathBuf::from("/srv/root.img"));
        assert!(!enoano_is_recoverable(&ctx));
    }

    #[test]
    fn dynamic_user_without_rootfs_compiles_symlinks_for_populated_classes() {
        let mut ctx = ExecContext::with_defaults();
        ctx.dynamic_user = true;
        let config = ctx.directories.get_mut(&DirectoryClass::State).unwrap();
        config.items.push(crate::context::DirectoryItem {
            path: PathBuf::from("svc"),
            symlinks: vec![],
            only_create: false,
        });
        let links = compile_symlinks(&ctx, crate::context::default_prefix);
        assert_eq!(links.len(), 1);
        assert!(links[0].source.ends_with("private/svc"));
    }
}
