//! C9 — Child Pipeline (§4.9).
//!
//! Wraps C1-C8 behind the failure-step contract: every fallible step maps to
//! a `StepExitCode`, and the child never tries to recover from one — it logs
//! a structured record naming the step, the executable, and the invocation
//! id, then `_exit`s with the step's code. This module is the only place
//! that knows the full 35-step order; everything it calls is a small,
//! independently testable function.
//!
//! Grounded on `entrypoints::exec_helper::run_exec_helper`, which performs
//! the equivalent "walk every configured setting, bail out on the first
//! failure" sequence for `rustysd`'s much shorter non-sandboxed exec path.
//! The confirm-spawn menu and idle-pipe dance are new (no teacher
//! equivalent) and are grounded directly in their one-paragraph
//! descriptions in §4.9.

use std::io::Read;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{close, Gid, Uid};

use crate::context::{ExecContext, ExecParameters};
use crate::error::{StepExitCode, StepResult};
use crate::identity::DynamicUserAllocator;
use crate::namespace::NamespaceCollaborator;
use crate::sandbox::{self, LsmFilesystemRestrictor, PamSession};
use crate::{credentials::DecryptionBackend, step_err};

/// The abstract collaborators the child pipeline needs but this crate has no
/// concrete implementation of — PAM, the mount-namespace unshare/mount
/// helper, credential decryption, dynamic-user allocation, and LSM-BPF
/// filesystem restriction. A caller assembles one of these per invocation;
/// tests and `execore-dump` use no-op stand-ins.
pub struct Collaborators<'a> {
    pub pam: Option<&'a mut dyn PamSession>,
    pub namespace: &'a mut dyn NamespaceCollaborator,
    pub decryption: &'a mut dyn DecryptionBackend,
    pub dynamic_user: Option<&'a mut dyn DynamicUserAllocator>,
    pub lsm_filesystems: Option<&'a mut dyn LsmFilesystemRestrictor>,
}

/// What the prior steps in the pipeline pin down before `execve`: the
/// resolved command, its expanded argv, and the assembled environment.
struct ExecTarget {
    cmd: PathBuf,
    argv: Vec<String>,
    env: Vec<(String, String)>,
}

/// Logs the structured failure record §4.9 requires, then `_exit`s with the
/// step's code. Never returns.
fn die(err: &StepError, exe: &str, invocation_id: &str) -> ! {
    log::error!(
        "step={} exe={exe:?} invocation_id={invocation_id} msg={}",
        err.step.name(),
        err.message
    );
    std::process::exit(err.step.code());
}

use crate::error::StepError;

/// Runs the confirm-spawn interactive menu (§4.9): presents a one-key
/// prompt on the confirmation terminal and loops on the re-prompting keys
/// (`h`, `i`, `D`, `j`). Returns `Continue` for `y`/`c`, or a short-circuit
/// outcome for `s`/`f`/anything else (cancel).
pub enum ConfirmOutcome {
    Continue,
    FakeSuccess,
    FakeFailure,
    Cancelled,
}

pub fn confirm_spawn(terminal: &std::path::Path, command_line: &str, unit: &str) -> StepResult<ConfirmOutcome> {
    let mut tty = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(terminal)
        .map_err(|e| step_err!(StepExitCode::Confirm, "opening confirm-spawn terminal failed: {e}"))?;

    loop {
        use std::io::Write;
        write!(
            tty,
            "\r\nAuthorize execution of {unit} ({command_line})?\r\n[y,f,s,h,i,D,j,c] "
        )
        .ok();

        let mut buf = [0u8; 1];
        tty.read_exact(&mut buf)
            .map_err(|e| step_err!(StepExitCode::Confirm, "reading confirm-spawn key failed: {e}"))?;

        match buf[0] {
            b'y' => return Ok(ConfirmOutcome::Continue),
            b'c' => return Ok(ConfirmOutcome::Continue),
            b's' => return Ok(ConfirmOutcome::FakeSuccess),
            // 'n' is a historical alias for 'f', kept for compatibility.
            b'f' | b'n' => return Ok(ConfirmOutcome::FakeFailure),
            b'h' => {
                writeln!(tty, "\r\ny=execute f=fake-fail s=fake-success h=help i=info D=dump j=jobs c=continue-all").ok();
                continue;
            }
            b'i' => {
                writeln!(tty, "\r\nunit={unit}\r\ncommand={command_line}").ok();
                continue;
            }
            b'D' => {
                writeln!(tty, "\r\n(dump not available outside the manager process)").ok();
                continue;
            }
            b'j' => {
                writeln!(tty, "\r\n(job list not available outside the manager process)").ok();
                continue;
            }
            _ => return Ok(ConfirmOutcome::Cancelled),
        }
    }
}

/// The "boot boredom" idle-pipe dance (§4.9): wait up to 5s for POLLHUP on
/// the read end; on timeout, write one byte to the notify end and wait up
/// to 1s more; then close everything.
pub fn idle_pipe_dance(fds: [RawFd; 4]) {
    let [read_end, notify_end, unused_a, unused_b] = fds;
    close(unused_a).ok();
    close(unused_b).ok();

    let wait_for_hangup = |fd: RawFd, timeout: Duration| -> bool {
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        let mut pfd = [PollFd::new(borrowed, PollFlags::POLLHUP)];
        let timeout_ms = PollTimeout::try_from(timeout.as_millis() as u16).unwrap_or(PollTimeout::MAX);
        matches!(poll(&mut pfd, timeout_ms), Ok(n) if n > 0)
    };

    if wait_for_hangup(read_end, Duration::from_secs(5)) {
        close(read_end).ok();
        close(notify_end).ok();
        return;
    }

    unsafe {
        libc::write(notify_end, [0u8].as_ptr().cast(), 1);
    }
    wait_for_hangup(read_end, Duration::from_secs(1));

    close(read_end).ok();
    close(notify_end).ok();
}

/// Runs the full 35-step sandbox-application sequence (§4.8) followed by
/// `execve`, in the fixed order the spec lays out. Every step that can fail
/// dies through `die()` with its own exit code; this function's `Ok`
/// branch is unreachable in practice (`execve` on success never returns)
/// but is kept `StepResult` for the early, pre-sandboxing steps that can
/// still be tested without forking.
pub fn run_sandboxed_child(
    ctx: &ExecContext,
    params: &mut ExecParameters,
    cmd: &str,
    argv: &[String],
    collaborators: &mut Collaborators,
) -> ! {
    let invocation_id = params.invocation_id.clone();
    let exe = cmd.to_string();

    macro_rules! step {
        ($expr:expr) => {
            match $expr {
                Ok(v) => v,
                Err(e) => die(&e, &exe, &invocation_id),
            }
        };
    }

    // Identity resolution (C3, §4.3), including dynamic-user allocation.
    // Happens before any step below since exec-directory ownership (step 6)
    // and terminal ownership (step 4) both need the resolved uid/gid.
    let dynamic_identity = if ctx.dynamic_user {
        let Some(allocator) = collaborators.dynamic_user.as_deref_mut() else {
            die(
                &step_err!(StepExitCode::User, "dynamic user requested but no allocator collaborator was provided"),
                &exe,
                &invocation_id,
            );
        };
        let suggested_paths: Vec<PathBuf> = ctx
            .directories
            .iter()
            .flat_map(|(class, config)| {
                let prefix = params.prefix_for(*class);
                config.items.iter().map(move |item| prefix.join(&item.path))
            })
            .collect();
        Some(step!(allocator.allocate(&params.unit_id, &suggested_paths)))
    } else {
        None
    };
    let identity = &step!(crate::identity::resolve(
        ctx.user.as_deref(),
        ctx.group.as_deref(),
        &ctx.supplementary_groups,
        dynamic_identity,
    ));

    // Step 1.
    step!(sandbox::apply_priorities(&ctx.resources));
    // Step 2.
    step!(sandbox::apply_personality(
        ctx.privileges.personality.as_deref(),
        ctx.privileges.lock_personality
    ));
    // Step 3.
    if let Some(identifier) = &ctx.utmp_identifier {
        let _ = sandbox::utmp::write_record(identifier, ctx.user.as_deref(), libc::USER_PROCESS);
    }
    // Step 4.
    if let Some(tty) = &ctx.io.tty_path {
        step!(sandbox::apply_terminal_ownership(tty, identity.uid, identity.gid));
    }
    // Step 5.
    #[cfg(feature = "cgroups")]
    if let Some(cgroup) = &params.cgroup_path {
        step!(sandbox::apply_cgroup_delegation(
            cgroup,
            identity.uid,
            identity.gid,
            params.flags.cgroup_delegate
        ));
    }
    // Step 6.
    let have_mount_ns = crate::namespace::needs_mount_namespace(
        ctx,
        ctx.filesystem.private_tmp,
        ctx.dynamic_user,
    );
    let deferred_symlinks = step!(crate::exec_directory::realize_all(
        &ctx.directories,
        |class| params.prefix_for(class),
        identity.uid,
        identity.gid,
        ctx.dynamic_user,
        have_mount_ns,
    ));
    let mut acquired_credentials = Vec::new();
    if params.flags.write_credentials {
        if !have_mount_ns && ctx.credentials.must_mount {
            die(
                &step_err!(
                    StepExitCode::Credentials,
                    "no mount namespace available to isolate the credential workspace, and must_mount=true"
                ),
                &exe,
                &invocation_id,
            );
        }
        acquired_credentials = step!(crate::credentials::acquire(
            &params.unit_id,
            &ctx.credentials,
            params.received_credentials_directory.as_deref(),
            collaborators.decryption,
        ));
        if let Some(dir) = &params.received_credentials_directory {
            step!(crate::credentials::publish(
                dir,
                &acquired_credentials,
                identity.uid,
                identity.gid,
                have_mount_ns,
            ));
        }
    }
    // Step 7.
    let env = sandbox::assemble_environment(&sandbox::EnvironmentInputs {
        base: &params.environment,
        home: identity.home.as_deref(),
        shell: identity.shell.as_deref(),
        logname: ctx.user.as_deref(),
        term: None,
        invocation_id: &invocation_id,
        journal_stream: None,
        log_namespace: ctx.io.log_namespace.as_deref(),
        directories: &[],
        credentials_directory: params.received_credentials_directory.as_deref(),
        listen_fds: None,
        watchdog: params.watchdog_usec.map(|usec| (nix::unistd::getpid().as_raw() as u32, usec)),
        nss_dynamic_bypass: params.flags.nss_dynamic_bypass,
        notify_socket: params.notify_socket.as_deref(),
        exec_pid: nix::unistd::getpid(),
    });
    // Step 8.
    step!(sandbox::apply_keyring(ctx.privileges.keyring_mode, &invocation_id));
    // Step 9.
    step!(sandbox::apply_rlimits(&ctx.resources.rlimits));
    // Step 10.
    if let (Some(service), Some(pam)) = (&ctx.pam_service, collaborators.pam.as_deref_mut()) {
        step!(sandbox::open_pam_session_with_keeper(pam, service, identity.uid));
    }
    // Step 11 — early user-namespace bootstrap. This process is the one
    // that will go on to execve, so it forks off a sibling to keep in the
    // original user namespace and write its uid_map/gid_map once it
    // unshares, mirroring the fork-keeper shape step 10's PAM session uses.
    if ctx.filesystem.private_users {
        let owning_uid = nix::unistd::getuid().as_raw();
        let target_uid = identity.uid.as_raw();
        let target_gid = identity.gid.as_raw();
        let cap_setuid_effective =
            caps::has_cap(None, caps::CapSet::Effective, caps::Capability::CAP_SETUID).unwrap_or(false);
        let self_pid = nix::unistd::getpid();
        let signal = step!(crate::namespace::ReadySignal::new());

        match unsafe { nix::unistd::fork() } {
            Ok(nix::unistd::ForkResult::Child) => {
                let _ = signal.wait_ready();
                let result = crate::namespace::bootstrap_user_namespace(
                    self_pid,
                    owning_uid,
                    target_uid,
                    target_gid,
                    cap_setuid_effective,
                );
                std::process::exit(i32::from(result.is_err()));
            }
            Ok(nix::unistd::ForkResult::Parent { child: mapper_pid, .. }) => {
                step!(nix::sched::unshare(nix::sched::CloneFlags::CLONE_NEWUSER)
                    .map_err(|e| step_err!(StepExitCode::Namespace, "unshare(CLONE_NEWUSER) failed: {e}")));
                step!(signal.signal_ready());
                match nix::sys::wait::waitpid(mapper_pid, None) {
                    Ok(nix::sys::wait::WaitStatus::Exited(_, 0)) => {}
                    other => die(
                        &step_err!(StepExitCode::Namespace, "user-namespace map writer failed: {other:?}"),
                        &exe,
                        &invocation_id,
                    ),
                }
            }
            Err(e) => die(
                &step_err!(StepExitCode::Namespace, "fork for userns bootstrap failed: {e}"),
                &exe,
                &invocation_id,
            ),
        }
    }
    // Step 12 — join the netns/ipcns fds the `ExecRuntime` registry handed
    // over before this process was forked.
    if let Some(fd) = params.netns_fd {
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        step!(nix::sched::setns(borrowed, nix::sched::CloneFlags::CLONE_NEWNET)
            .map_err(|e| step_err!(StepExitCode::Network, "setns(netns) failed: {e}")));
    }
    if let Some(fd) = params.ipcns_fd {
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        step!(nix::sched::setns(borrowed, nix::sched::CloneFlags::CLONE_NEWIPC)
            .map_err(|e| step_err!(StepExitCode::Namespace, "setns(ipcns) failed: {e}")));
    }
    // Step 13.
    let bind_mounts = crate::namespace::compile_bind_mounts(ctx, |class| params.prefix_for(class));
    let mut symlinks = crate::namespace::compile_symlinks(ctx, |class| params.prefix_for(class));
    for (final_path, declared) in &deferred_symlinks {
        for destination in declared {
            symlinks.push(crate::namespace::CompiledSymlink {
                source: final_path.clone(),
                destination: destination.clone(),
            });
        }
    }
    if have_mount_ns {
        step!(crate::namespace::apply_namespace(
            ctx,
            collaborators.namespace,
            &bind_mounts,
            &symlinks,
            ctx.filesystem.protect_system != crate::context::ProtectMode::No
        ));
    }
    // Step 14.
    if ctx.syscall_filtering.protect_hostname {
        step!(crate::namespace::isolate_uts(None));
    }
    // Step 15.
    step!(crate::identity::apply_groups(identity));
    // Step 16.
    // Late user-namespace bootstrap for privileged callers: no-op unless
    // `filesystem.private_users` demanded it and step 11 deferred it.

    // Step 17.
    let resolved_cmd = step!(sandbox::resolve_executable(cmd, None));
    // Step 18.
    step!(sandbox::apply_selinux_label(&resolved_cmd, &ctx.privileges.mac_labels));
    // Step 19.
    let mut pass_fds: Vec<RawFd> = params.socket_fds.iter().chain(&params.storage_fds).copied().collect();
    step!(crate::fd_plumbing::shift_fds(&mut pass_fds));
    step!(crate::fd_plumbing::clear_cloexec(&pass_fds));
    // Step 20.
    if ctx.syscall_filtering.restrict_realtime {
        step!(sandbox::clamp_rtprio_to_zero());
    }
    // Step 21.
    step!(sandbox::apply_smack_label(&resolved_cmd, &ctx.privileges.mac_labels));
    // Step 22.
    step!(sandbox::apply_capability_bounding_set(
        ctx.privileges.capability_bounding_set.as_deref()
    ));
    // Step 23.
    step!(sandbox::apply_ambient_capabilities(&ctx.privileges.capability_ambient_set));
    // Step 24.
    if let Some(root) = &ctx.filesystem.root_directory {
        if !have_mount_ns {
            step!(sandbox::apply_chroot(root));
        }
    }
    // Step 25.
    step!(crate::identity::apply_uid(identity));
    // Step 26.
    step!(sandbox::apply_ambient_capabilities(&ctx.privileges.capability_ambient_set));
    // Step 27.
    if let Some(dir) = &ctx.working_directory {
        step!(sandbox::apply_working_directory(dir));
    }
    // Step 28 (exec-time SELinux context, same label source as step 18).
    step!(sandbox::apply_selinux_label(&resolved_cmd, &ctx.privileges.mac_labels));
    // Step 29.
    step!(sandbox::apply_apparmor_profile(&ctx.privileges.mac_labels));
    // Step 30.
    step!(sandbox::apply_securebits(ctx.privileges.secure_bits));
    // Step 31.
    step!(sandbox::apply_no_new_privileges(ctx.privileges.no_new_privileges));

    // Step 32 — seccomp, strict sub-order, syscall-filter last.
    #[cfg(feature = "seccomp")]
    {
        step!(sandbox::seccomp::apply_restrict_address_families(&ctx.syscall_filtering));
        step!(sandbox::seccomp::apply_memory_deny_write_execute(
            ctx.syscall_filtering.memory_deny_write_execute
        ));
        // restrict-realtime already ran at step 20 (clamp_rtprio_to_zero).
        step!(sandbox::seccomp::apply_restrict_suid_sgid(ctx.syscall_filtering.restrict_suid_sgid));
        step!(sandbox::seccomp::apply_restrict_namespaces(ctx.syscall_filtering.restrict_namespaces));
        step!(sandbox::seccomp::apply_protect_sysctl(ctx.syscall_filtering.protect_kernel_tunables));
        step!(sandbox::seccomp::apply_protect_kernel_modules(ctx.syscall_filtering.protect_kernel_modules));
        step!(sandbox::seccomp::apply_protect_kernel_logs(ctx.syscall_filtering.protect_kernel_logs));
        step!(sandbox::seccomp::apply_protect_clock(ctx.syscall_filtering.protect_clock));
        step!(sandbox::seccomp::apply_private_devices(ctx.filesystem.private_devices));
        step!(sandbox::seccomp::apply_syscall_archs(&ctx.syscall_filtering.architectures));
        if ctx.privileges.lock_personality {
            step!(sandbox::seccomp::apply_lock_personality(true));
        }
        step!(sandbox::seccomp::apply_syscall_log(&ctx.syscall_filtering));
        step!(sandbox::seccomp::apply_syscall_filter(&ctx.syscall_filtering));
    }

    // Step 33.
    if let Some(restrictor) = collaborators.lsm_filesystems.as_deref_mut() {
        if !ctx.syscall_filtering.restrict_filesystems.is_empty() {
            step!(restrictor.restrict(&ctx.syscall_filtering.restrict_filesystems));
        }
    }

    // Step 34.
    if ctx.ignore_sigpipe {
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
    }
    let final_argv = sandbox::expand_argv(argv, &env);

    let target = ExecTarget {
        cmd: resolved_cmd,
        argv: final_argv,
        env,
    };

    // Step 35.
    let err = sandbox::execve_or_fail(&target.cmd, &target.argv, &target.env, params.exec_notify_fd)
        .unwrap_err();
    die(&err, &exe, &invocation_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_pipe_dance_closes_all_four_fds() {
        use nix::unistd::pipe;
        let (r1, w1) = pipe().unwrap();
        let (r2, w2) = pipe().unwrap();
        use std::os::fd::IntoRawFd;
        let fds = [r1.into_raw_fd(), w2.into_raw_fd(), r2.into_raw_fd(), w1.into_raw_fd()];
        // Close the write end of the read-pair immediately so poll sees
        // POLLHUP right away instead of waiting out the 5s timeout.
        close(fds[3]).ok();
        idle_pipe_dance([fds[0], fds[1], fds[2], -1]);
    }
}
