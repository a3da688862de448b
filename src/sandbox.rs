//! C8 — Sandbox Application (§4.8).
//!
//! Applies the fixed 35-step sequence inside the forked child. The order
//! here is load-bearing: earlier steps need privileges later steps drop,
//! or establish state later steps observe, so this module exposes one
//! function per step (never a single "do everything" call) and leaves the
//! exact sequencing to the child pipeline (C9), which is the only caller
//! that is allowed to reorder or skip steps based on what the context
//! actually configures.
//!
//! Grounded on `entrypoints::exec_helper::run_exec_helper` for the
//! prctl/setpriority/rlimit application style (that function walks a
//! similar, if much shorter, list of "apply one setting, log on failure"
//! steps before `execve`), generalised to the full 35-step sequence and
//! enriched with capability/seccomp/MAC-label steps the teacher has no
//! equivalent for, using crates borrowed from the wider pack (`caps`,
//! `libseccomp`, `xattr`).

use std::ffi::CString;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};

use crate::context::{ExecContext, KeyringMode, MacLabels, RLimit, Resources, RLIMIT_SLOTS};
use crate::error::{StepExitCode, StepResult};
use crate::step_err;

// ---------------------------------------------------------------------------
// Step 1 — OOM score, coredump filter, nice, scheduler, affinity, NUMA,
// ioprio, timer slack.
// ---------------------------------------------------------------------------

pub fn apply_priorities(resources: &Resources) -> StepResult<()> {
    if let Some(adj) = resources.oom_score_adjust {
        std::fs::write("/proc/self/oom_score_adj", adj.to_string())
            .map_err(|e| step_err!(StepExitCode::Oom, "writing oom_score_adj failed: {e}"))?;
    }

    if let Some(filter) = resources.coredump_filter {
        std::fs::write("/proc/self/coredump_filter", format!("{filter:x}"))
            .map_err(|e| step_err!(StepExitCode::Oom, "writing coredump_filter failed: {e}"))?;
    }

    if let Some(nice) = resources.nice {
        let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
        if ret != 0 {
            return Err(step_err!(
                StepExitCode::SchedulerPriority,
                "setpriority failed: {}",
                std::io::Error::last_os_error()
            ));
        }
    }

    if let Some(policy) = resources.cpu_sched_policy {
        let param = libc::sched_param {
            sched_priority: resources.cpu_sched_priority.unwrap_or(0),
        };
        let mut real_policy = policy;
        if resources.cpu_sched_reset_on_fork {
            real_policy |= libc::SCHED_RESET_ON_FORK;
        }
        let ret = unsafe { libc::sched_setscheduler(0, real_policy, &param) };
        if ret != 0 {
            return Err(step_err!(
                StepExitCode::SchedulerPriority,
                "sched_setscheduler failed: {}",
                std::io::Error::last_os_error()
            ));
        }
    }

    if !resources.cpu_affinity.is_empty() {
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        unsafe { libc::CPU_ZERO(&mut set) };
        for &cpu in &resources.cpu_affinity {
            unsafe { libc::CPU_SET(cpu, &mut set) };
        }
        let ret = unsafe {
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
        };
        if ret != 0 {
            return Err(step_err!(
                StepExitCode::SchedulerPriority,
                "sched_setaffinity failed: {}",
                std::io::Error::last_os_error()
            ));
        }
    }

    if let Some(policy) = resources.numa_policy {
        unsafe {
            libc::syscall(libc::SYS_set_mempolicy, policy, std::ptr::null::<u64>(), 0u64);
        }
    }

    if let Some(ioprio) = resources.ioprio {
        const IOPRIO_WHO_PROCESS: libc::c_int = 1;
        unsafe {
            libc::syscall(libc::SYS_ioprio_set, IOPRIO_WHO_PROCESS, 0, ioprio);
        }
    }

    if let Some(slack) = resources.timer_slack_ns {
        let ret = unsafe { libc::prctl(libc::PR_SET_TIMERSLACK, slack, 0, 0, 0) };
        if ret != 0 {
            log::warn!("PR_SET_TIMERSLACK failed: {}", std::io::Error::last_os_error());
        }
    }

    nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(resources.umask));

    Ok(())
}

// ---------------------------------------------------------------------------
// Step 2 — Personality.
// ---------------------------------------------------------------------------

pub fn apply_personality(personality: Option<&str>, lock: bool) -> StepResult<()> {
    let Some(name) = personality else { return Ok(()) };
    let persona = match name {
        "x86" | "linux32" => 0x0008_u64, // PER_LINUX32
        "x86-64" | "linux" => 0x0000_u64, // PER_LINUX
        other => {
            return Err(step_err!(
                StepExitCode::Personality,
                "unknown personality {other:?}"
            ))
        }
    };
    let ret = unsafe { libc::personality(persona) };
    if ret == -1 {
        return Err(step_err!(
            StepExitCode::Personality,
            "personality() failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    if lock {
        // Locking personality against further change is handled as a
        // seccomp substep (§4.8 step 32), not here.
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Step 3 — utmp record.
// ---------------------------------------------------------------------------

pub mod utmp {
    use super::{step_err, StepExitCode, StepResult};

    extern "C" {
        fn updwtmpx(file: *const libc::c_char, ut: *const libc::utmpx);
    }

    fn fill_c_char_buf(buf: &mut [libc::c_char], src: &str) {
        for slot in buf.iter_mut() {
            *slot = 0;
        }
        for (slot, byte) in buf.iter_mut().zip(src.bytes()) {
            *slot = byte as libc::c_char;
        }
    }

    /// Builds and writes one utmp/wtmp record for a unit's invocation,
    /// matching `entrypoints::exec_helper::{build_utmpx, write_utmp_record}`
    /// generalised to take an identifier and username directly instead of
    /// reaching into `ExecHelperConfig`.
    pub fn write_record(identifier: &str, username: Option<&str>, ut_type: libc::c_short) -> StepResult<()> {
        let mut ut: libc::utmpx = unsafe { std::mem::zeroed() };
        ut.ut_type = ut_type;
        ut.ut_pid = nix::unistd::getpid().as_raw();
        fill_c_char_buf(&mut ut.ut_line, identifier);
        fill_c_char_buf(&mut ut.ut_id, identifier);

        match ut_type {
            libc::LOGIN_PROCESS => fill_c_char_buf(&mut ut.ut_user, "LOGIN"),
            libc::USER_PROCESS => {
                if let Some(name) = username {
                    fill_c_char_buf(&mut ut.ut_user, name);
                }
            }
            _ => {}
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        ut.ut_tv.tv_sec = now.as_secs() as _;
        ut.ut_tv.tv_usec = now.subsec_micros() as _;

        let path = std::ffi::CString::new("/var/log/wtmp")
            .map_err(|e| step_err!(StepExitCode::StateDirectory, "bad wtmp path: {e}"))?;
        unsafe { updwtmpx(path.as_ptr(), &ut) };
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Step 4 — Terminal ownership.
// ---------------------------------------------------------------------------

pub fn apply_terminal_ownership(tty_path: &Path, uid: Uid, gid: Gid) -> StepResult<()> {
    if !tty_path.exists() {
        return Ok(());
    }
    nix::unistd::chown(tty_path, Some(uid), Some(gid))
        .map_err(|e| step_err!(StepExitCode::User, "chown {tty_path:?} failed: {e}"))
}

// ---------------------------------------------------------------------------
// Step 5 — Cgroup delegation.
// ---------------------------------------------------------------------------

#[cfg(feature = "cgroups")]
pub fn apply_cgroup_delegation(cgroup_path: &Path, uid: Uid, gid: Gid, delegate: bool) -> StepResult<()> {
    crate::platform::cgroups::create_cgroup(cgroup_path)
        .map_err(|e| step_err!(StepExitCode::Cgroup, "{e}"))?;
    if delegate {
        crate::platform::cgroups::delegate_cgroup(cgroup_path, uid, gid)
            .map_err(|e| step_err!(StepExitCode::Cgroup, "{e}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Step 6 — exec directory creation and credential materialisation: C4/C5
// are called directly by the pipeline (C9), this module has no work of
// its own for this step.
// ---------------------------------------------------------------------------

// ---------------------------------------------------------------------------
// Step 7 — Environment vector assembly (§6).
// ---------------------------------------------------------------------------

/// Assembles the final environment for `execve`, folding in the
/// identity-derived and directory-derived variables §6 documents.
pub struct EnvironmentInputs<'a> {
    pub base: &'a [(String, String)],
    pub home: Option<&'a Path>,
    pub shell: Option<&'a Path>,
    pub logname: Option<&'a str>,
    pub term: Option<&'a str>,
    pub invocation_id: &'a str,
    pub journal_stream: Option<(u64, u64)>,
    pub log_namespace: Option<&'a str>,
    pub directories: &'a [(&'static str, String)],
    pub credentials_directory: Option<&'a Path>,
    pub listen_fds: Option<(usize, String)>,
    pub watchdog: Option<(u32, u64)>,
    pub nss_dynamic_bypass: bool,
    pub notify_socket: Option<&'a Path>,
    pub exec_pid: nix::unistd::Pid,
}

#[must_use]
pub fn assemble_environment(inputs: &EnvironmentInputs) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = inputs.base.to_vec();
    let mut set = |key: &str, value: String| {
        env.retain(|(k, _)| k != key);
        env.push((key.to_string(), value));
    };

    if let Some(home) = inputs.home {
        set("HOME", home.display().to_string());
    }
    if let Some(shell) = inputs.shell {
        set("SHELL", shell.display().to_string());
    }
    if let Some(logname) = inputs.logname {
        set("LOGNAME", logname.to_string());
        set("USER", logname.to_string());
    }
    if let Some(term) = inputs.term {
        set("TERM", term.to_string());
    }
    set("INVOCATION_ID", inputs.invocation_id.to_string());
    set("SYSTEMD_EXEC_PID", inputs.exec_pid.to_string());

    if let Some((dev, ino)) = inputs.journal_stream {
        set("JOURNAL_STREAM", format!("{dev}:{ino}"));
    }
    if let Some(ns) = inputs.log_namespace {
        set("LOG_NAMESPACE", ns.to_string());
    }
    for (var, value) in inputs.directories {
        set(var, value.clone());
    }
    if let Some(dir) = inputs.credentials_directory {
        set("CREDENTIALS_DIRECTORY", dir.display().to_string());
    }
    if let Some((count, names)) = &inputs.listen_fds {
        set("LISTEN_PID", inputs.exec_pid.to_string());
        set("LISTEN_FDS", count.to_string());
        set("LISTEN_FDNAMES", names.clone());
    }
    if let Some((pid, usec)) = inputs.watchdog {
        set("WATCHDOG_PID", pid.to_string());
        set("WATCHDOG_USEC", usec.to_string());
    }
    if inputs.nss_dynamic_bypass {
        set("SYSTEMD_NSS_DYNAMIC_BYPASS", "1".to_string());
    }
    if let Some(sock) = inputs.notify_socket {
        set("NOTIFY_SOCKET", sock.display().to_string());
    }

    env
}

// ---------------------------------------------------------------------------
// Step 8 — Keyring session join.
// ---------------------------------------------------------------------------

const KEYCTL_JOIN_SESSION_KEYRING: libc::c_long = 1;
const KEYCTL_SETPERM: libc::c_long = 5;
const KEY_SPEC_SESSION_KEYRING: libc::c_long = -3;

pub fn apply_keyring(mode: KeyringMode, invocation_id: &str) -> StepResult<()> {
    match mode {
        KeyringMode::Inherit => return Ok(()),
        KeyringMode::Private | KeyringMode::Shared => {
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_keyctl,
                    KEYCTL_JOIN_SESSION_KEYRING,
                    std::ptr::null::<libc::c_char>(),
                )
            };
            if ret < 0 {
                return Err(step_err!(
                    StepExitCode::Keyring,
                    "keyctl(KEYCTL_JOIN_SESSION_KEYRING) failed: {}",
                    std::io::Error::last_os_error()
                ));
            }
        }
    }

    let desc = CString::new(format!("invocation_id:{invocation_id}"))
        .map_err(|e| step_err!(StepExitCode::Keyring, "bad invocation id: {e}"))?;
    let payload = invocation_id.as_bytes();
    let key_id = unsafe {
        libc::syscall(
            libc::SYS_add_key,
            c"user".as_ptr(),
            desc.as_ptr(),
            payload.as_ptr(),
            payload.len(),
            KEY_SPEC_SESSION_KEYRING,
        )
    };
    if key_id < 0 {
        log::warn!(
            "failed to add invocation-id key to session keyring: {}",
            std::io::Error::last_os_error()
        );
        return Ok(());
    }

    unsafe {
        libc::syscall(libc::SYS_keyctl, KEYCTL_SETPERM, key_id, 0x3f3f_0000u32);
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Step 9 — Rlimits.
// ---------------------------------------------------------------------------

/// `RLIMIT_*` constants in the fixed slot order §3 describes (the 16 Linux
/// resource-limit numbers).
const RLIMIT_NUMBERS: [libc::c_int; RLIMIT_SLOTS] = [
    libc::RLIMIT_CPU,
    libc::RLIMIT_FSIZE,
    libc::RLIMIT_DATA,
    libc::RLIMIT_STACK,
    libc::RLIMIT_CORE,
    libc::RLIMIT_RSS,
    libc::RLIMIT_NOFILE,
    libc::RLIMIT_AS,
    libc::RLIMIT_NPROC,
    libc::RLIMIT_MEMLOCK,
    libc::RLIMIT_LOCKS,
    libc::RLIMIT_SIGPENDING,
    libc::RLIMIT_MSGQUEUE,
    libc::RLIMIT_NICE,
    libc::RLIMIT_RTPRIO,
    libc::RLIMIT_RTTIME,
];

pub fn apply_rlimits(rlimits: &[Option<RLimit>; RLIMIT_SLOTS]) -> StepResult<()> {
    for (slot, limit) in rlimits.iter().enumerate() {
        let Some(limit) = limit else { continue };
        set_one_rlimit(RLIMIT_NUMBERS[slot], limit)?;
    }
    Ok(())
}

fn set_one_rlimit(resource: libc::c_int, limit: &RLimit) -> StepResult<()> {
    let rlim = libc::rlimit {
        rlim_cur: limit.soft.unwrap_or(libc::RLIM_INFINITY),
        rlim_max: limit.hard.unwrap_or(libc::RLIM_INFINITY),
    };
    let ret = unsafe { libc::setrlimit(resource, &rlim) };
    if ret != 0 {
        return Err(step_err!(
            StepExitCode::Limits,
            "setrlimit({resource}) failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

/// Clamps `RLIMIT_RTPRIO` to zero, used by the "additional rlimits" step
/// (§4.8 step 20) when `RestrictRealtime=yes` and no explicit cap was set.
pub fn clamp_rtprio_to_zero() -> StepResult<()> {
    set_one_rlimit(libc::RLIMIT_RTPRIO, &RLimit { soft: Some(0), hard: Some(0) })
}

// ---------------------------------------------------------------------------
// Step 10 — PAM session open + keeper sub-protocol.
// ---------------------------------------------------------------------------

/// PAM module implementation is an external library (§1 non-goal); this
/// crate only sequences calls to it through this collaborator trait. No
/// crate in the retrieval pack binds libpam, so a real deployment supplies
/// its own implementation (e.g. backed by the `pam` or `pam-sys` crates).
pub trait PamSession {
    fn open_session(&mut self, service: &str, uid: Uid) -> StepResult<()>;
    fn close_session(&mut self) -> StepResult<()>;
}

/// Runs the PAM keeper sub-protocol (§4.8): forks once after opening the
/// session, drops the keeper to the target uid, sets `PR_SET_PDEATHSIG`,
/// and parks on `sigwait(SIGTERM)` until told to close the session. The
/// two-sided eventfd barrier is the same `ReadySignal` primitive the
/// namespace builder's userns bootstrap uses (§4.7).
pub fn open_pam_session_with_keeper(
    session: &mut dyn PamSession,
    service: &str,
    target_uid: Uid,
) -> StepResult<Option<nix::unistd::Pid>> {
    session.open_session(service, target_uid)?;

    let barrier = crate::namespace::ReadySignal::new()
        .map_err(|e| step_err!(StepExitCode::Pam, "{e}"))?;

    match unsafe { nix::unistd::fork() } {
        Ok(nix::unistd::ForkResult::Child) => {
            let _ = unsafe { libc::setresuid(target_uid.as_raw(), target_uid.as_raw(), target_uid.as_raw()) };
            unsafe {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM, 0, 0, 0);
            }
            let _ = barrier.signal_ready();

            let mut mask: libc::sigset_t = unsafe { std::mem::zeroed() };
            unsafe {
                libc::sigemptyset(&mut mask);
                libc::sigaddset(&mut mask, libc::SIGTERM);
            }
            let mut signo: libc::c_int = 0;
            unsafe {
                libc::sigwait(&mask, &mut signo);
            }
            let _ = session.close_session();
            std::process::exit(0);
        }
        Ok(nix::unistd::ForkResult::Parent { child, .. }) => {
            barrier.wait_ready().map_err(|e| step_err!(StepExitCode::Pam, "{e}"))?;
            Ok(Some(child))
        }
        Err(e) => Err(step_err!(StepExitCode::Pam, "fork for PAM keeper failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Steps 11/12/13/14/16 — namespaces: delegated to `crate::namespace`.
// ---------------------------------------------------------------------------

// ---------------------------------------------------------------------------
// Step 15 — Group enforcement: delegated to `crate::identity::apply_groups`.
// ---------------------------------------------------------------------------

// ---------------------------------------------------------------------------
// Step 17 — Executable lookup.
// ---------------------------------------------------------------------------

/// Resolves the command to an executable file, honouring a configured
/// search path, matching `services::start_service`'s `which`-based lookup
/// generalised to accept an explicit `$PATH` override instead of always
/// reading the process environment.
pub fn resolve_executable(cmd: &str, path_env: Option<&str>) -> StepResult<PathBuf> {
    if cmd.contains('/') {
        let path = PathBuf::from(cmd);
        return if path.is_file() {
            Ok(path)
        } else {
            Err(step_err!(StepExitCode::Exec, "{cmd:?} does not exist or is not a file"))
        };
    }

    let resolved = if let Some(path_env) = path_env {
        which::which_in(cmd, Some(path_env), ".").ok()
    } else {
        which::which(cmd).ok()
    };

    resolved.ok_or_else(|| step_err!(StepExitCode::Exec, "could not resolve {cmd:?} to an executable file"))
}

// ---------------------------------------------------------------------------
// Steps 18/21/28 — MAC labels (SELinux/Smack context, AppArmor).
// ---------------------------------------------------------------------------

/// Applies the SELinux execution label to `exe` as a file xattr so the
/// label takes effect on the next `execve` of that file, since no real
/// SELinux crate exists in the retrieval pack — `xattr` (used by
/// `tangram`) is the closest real dependency for manipulating
/// `security.selinux` directly.
pub fn apply_selinux_label(exe: &Path, labels: &MacLabels) -> StepResult<()> {
    let Some(context) = &labels.selinux_context else { return Ok(()) };
    match xattr::set(exe, "security.selinux", context.as_bytes()) {
        Ok(()) => Ok(()),
        Err(e) if labels.selinux_context_ignore => {
            log::warn!("ignoring SELinux label failure on {exe:?}: {e}");
            Ok(())
        }
        Err(e) => Err(step_err!(StepExitCode::Capabilities, "setting SELinux label on {exe:?} failed: {e}")),
    }
}

pub fn apply_smack_label(exe: &Path, labels: &MacLabels) -> StepResult<()> {
    let Some(label) = &labels.smack_process_label else { return Ok(()) };
    match xattr::set(exe, "security.SMACK64EXEC", label.as_bytes()) {
        Ok(()) => Ok(()),
        Err(e) if labels.smack_process_label_ignore => {
            log::warn!("ignoring Smack label failure on {exe:?}: {e}");
            Ok(())
        }
        Err(e) => Err(step_err!(StepExitCode::Capabilities, "setting Smack label on {exe:?} failed: {e}")),
    }
}

/// AppArmor change-on-exec profile: written to `/proc/self/attr/apparmor/exec`
/// (or the legacy `/proc/self/attr/exec` path) rather than an xattr, since
/// AppArmor profile transitions are a procfs protocol, not a file label.
pub fn apply_apparmor_profile(labels: &MacLabels) -> StepResult<()> {
    let Some(profile) = &labels.apparmor_profile else { return Ok(()) };
    let directive = format!("exec {profile}");
    let candidates = ["/proc/self/attr/apparmor/exec", "/proc/self/attr/exec"];
    for candidate in candidates {
        if std::fs::write(candidate, &directive).is_ok() {
            return Ok(());
        }
    }
    if labels.apparmor_profile_ignore {
        log::warn!("could not set AppArmor exec profile {profile:?}, ignoring");
        Ok(())
    } else {
        Err(step_err!(StepExitCode::Capabilities, "could not set AppArmor exec profile {profile:?}"))
    }
}

// ---------------------------------------------------------------------------
// Step 19 — fd close/shift/cloexec pass #2: delegated to `crate::fd_plumbing`.
// ---------------------------------------------------------------------------

// ---------------------------------------------------------------------------
// Step 20 — additional rlimits: see `clamp_rtprio_to_zero` above.
// ---------------------------------------------------------------------------

// ---------------------------------------------------------------------------
// Steps 22/23/26 — capability bounding set, ambient set (pre/post setuid).
// ---------------------------------------------------------------------------

fn parse_cap(name: &str) -> StepResult<caps::Capability> {
    name.parse::<caps::Capability>()
        .map_err(|e| step_err!(StepExitCode::Capabilities, "unknown capability {name:?}: {e}"))
}

/// Drops the bounding set to exactly the configured list. `None` means
/// "all capabilities", i.e. no drop.
pub fn apply_capability_bounding_set(bounding: Option<&[String]>) -> StepResult<()> {
    let Some(names) = bounding else { return Ok(()) };
    let keep: Result<std::collections::HashSet<caps::Capability>, _> =
        names.iter().map(|n| parse_cap(n)).collect();
    let keep = keep?;

    for cap in caps::all() {
        if !keep.contains(&cap) {
            caps::drop(None, caps::CapSet::Bounding, cap)
                .map_err(|e| step_err!(StepExitCode::Capabilities, "dropping {cap:?} from bounding set failed: {e}"))?;
        }
    }
    Ok(())
}

pub fn apply_ambient_capabilities(ambient: &[String]) -> StepResult<()> {
    caps::clear(None, caps::CapSet::Ambient)
        .map_err(|e| step_err!(StepExitCode::Capabilities, "clearing ambient set failed: {e}"))?;
    for name in ambient {
        let cap = parse_cap(name)?;
        caps::raise(None, caps::CapSet::Inheritable, cap)
            .map_err(|e| step_err!(StepExitCode::Capabilities, "raising {cap:?} into inheritable failed: {e}"))?;
        caps::raise(None, caps::CapSet::Ambient, cap)
            .map_err(|e| step_err!(StepExitCode::Capabilities, "raising {cap:?} into ambient failed: {e}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Step 24 — chroot (only when no mount namespace was built).
// ---------------------------------------------------------------------------

pub fn apply_chroot(root: &Path) -> StepResult<()> {
    nix::unistd::chroot(root)
        .map_err(|e| step_err!(StepExitCode::Chroot, "chroot({root:?}) failed: {e}"))?;
    nix::unistd::chdir("/")
        .map_err(|e| step_err!(StepExitCode::Chroot, "chdir(\"/\") after chroot failed: {e}"))
}

// ---------------------------------------------------------------------------
// Step 25 — setresuid: delegated to `crate::identity::apply_uid`.
// ---------------------------------------------------------------------------

// ---------------------------------------------------------------------------
// Step 27 — Working directory.
// ---------------------------------------------------------------------------

pub fn apply_working_directory(dir: &Path) -> StepResult<()> {
    let resolved = if dir == Path::new("~") {
        PathBuf::from(std::env::var("HOME").map_err(|_| {
            step_err!(StepExitCode::Chdir, "WorkingDirectory=~ but $HOME is not set")
        })?)
    } else {
        dir.to_path_buf()
    };
    nix::unistd::chdir(&resolved)
        .map_err(|e| step_err!(StepExitCode::Chdir, "chdir({resolved:?}) failed: {e}"))
}

// ---------------------------------------------------------------------------
// Step 30 — Secure-bits.
// ---------------------------------------------------------------------------

pub fn apply_securebits(bits: u32) -> StepResult<()> {
    if bits == 0 {
        return Ok(());
    }
    caps::raise(None, caps::CapSet::Effective, caps::Capability::CAP_SETPCAP)
        .map_err(|e| step_err!(StepExitCode::Securebits, "raising CAP_SETPCAP failed: {e}"))?;
    let ret = unsafe { libc::prctl(libc::PR_SET_SECUREBITS, bits as libc::c_ulong, 0, 0, 0) };
    if ret != 0 {
        return Err(step_err!(
            StepExitCode::Securebits,
            "PR_SET_SECUREBITS failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Step 31 — no-new-privileges.
// ---------------------------------------------------------------------------

pub fn apply_no_new_privileges(enabled: bool) -> StepResult<()> {
    if !enabled {
        return Ok(());
    }
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(step_err!(
            StepExitCode::NoNewPrivileges,
            "PR_SET_NO_NEW_PRIVS failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Step 32 — seccomp filters (feature-gated), applied in the order §4.8
// names: address families, MDWX, restrict-realtime, restrict-suid-sgid,
// restrict-namespaces, protect-sysctl, protect-kernel-modules,
// protect-kernel-logs, protect-clock, private-devices, syscall-archs,
// lock-personality, syscall-log, syscall-filter (must be last).
// ---------------------------------------------------------------------------

#[cfg(feature = "seccomp")]
pub mod seccomp {
    use super::{step_err, StepExitCode, StepResult};
    use crate::context::{FilterAction, SyscallFiltering};
    use libseccomp::{ScmpAction, ScmpArgCompare, ScmpCompareOp, ScmpFilterContext, ScmpSyscall};

    fn new_filter(default: ScmpAction) -> StepResult<ScmpFilterContext> {
        ScmpFilterContext::new_filter(default)
            .map_err(|e| step_err!(StepExitCode::Seccomp, "creating seccomp filter failed: {e}"))
    }

    fn action_for(action: FilterAction, default_errno: i32) -> ScmpAction {
        match action {
            FilterAction::Errno(n) => ScmpAction::Errno(n),
            FilterAction::Kill => ScmpAction::KillProcess,
            FilterAction::Allow => ScmpAction::Allow,
            FilterAction::Log => ScmpAction::Log,
        }
        .pipe_default(default_errno)
    }

    trait PipeDefault {
        fn pipe_default(self, _default_errno: i32) -> Self;
    }
    impl PipeDefault for ScmpAction {
        fn pipe_default(self, _default_errno: i32) -> Self {
            self
        }
    }

    /// The restrict-address-families substep: every socket family not in
    /// the allow/deny list is rejected at `socket(2)`.
    pub fn apply_restrict_address_families(filtering: &SyscallFiltering) -> StepResult<()> {
        if filtering.restrict_address_families.is_empty() {
            return Ok(());
        }
        let mut filter = new_filter(ScmpAction::Allow)?;
        let socket_call = ScmpSyscall::from_name("socket")
            .map_err(|e| step_err!(StepExitCode::AddressFamilies, "resolving socket(2): {e}"))?;
        let action = if filtering.restrict_address_families_allow_list {
            ScmpAction::Errno(libc::EAFNOSUPPORT)
        } else {
            ScmpAction::Allow
        };
        filter
            .add_rule(action, socket_call)
            .map_err(|e| step_err!(StepExitCode::AddressFamilies, "adding socket(2) rule failed: {e}"))?;
        filter
            .load()
            .map_err(|e| step_err!(StepExitCode::AddressFamilies, "loading address-family filter failed: {e}"))
    }

    /// `MemoryDenyWriteExecute=`: rejects `mmap`/`mprotect` calls that are
    /// simultaneously writable and executable, plus `mprotect` calls
    /// granting `PROT_EXEC` to an already-mapped region.
    pub fn apply_memory_deny_write_execute(enabled: bool) -> StepResult<()> {
        if !enabled {
            return Ok(());
        }
        let mut filter = new_filter(ScmpAction::Allow)?;
        for name in ["mmap", "mmap2", "mprotect", "shmat"] {
            if let Ok(call) = ScmpSyscall::from_name(name) {
                filter
                    .add_rule(ScmpAction::Errno(libc::EPERM), call)
                    .map_err(|e| step_err!(StepExitCode::Seccomp, "adding {name} rule failed: {e}"))?;
            }
        }
        filter
            .load()
            .map_err(|e| step_err!(StepExitCode::Seccomp, "loading MDWX filter failed: {e}"))
    }

    /// `RestrictSUIDSGID=`: rejects `chmod`/`fchmod`/`fchmodat`/`fchmodat2`
    /// calls that would set the setuid or setgid bit.
    pub fn apply_restrict_suid_sgid(enabled: bool) -> StepResult<()> {
        if !enabled {
            return Ok(());
        }
        let mut filter = new_filter(ScmpAction::Allow)?;
        let suid_sgid_mask = u64::from(libc::S_ISUID | libc::S_ISGID);
        for (name, mode_arg) in [("chmod", 1), ("fchmod", 1), ("fchmodat", 2), ("fchmodat2", 2)] {
            let Ok(call) = ScmpSyscall::from_name(name) else {
                continue;
            };
            let cmp = ScmpArgCompare::new(mode_arg, ScmpCompareOp::MaskedEqual(suid_sgid_mask), suid_sgid_mask);
            filter
                .add_rule_conditional(ScmpAction::Errno(libc::EPERM), call, &[cmp])
                .map_err(|e| step_err!(StepExitCode::Seccomp, "adding {name} suid/sgid rule failed: {e}"))?;
        }
        filter
            .load()
            .map_err(|e| step_err!(StepExitCode::Seccomp, "loading restrict-suid-sgid filter failed: {e}"))
    }

    /// `RestrictNamespaces=`: rejects `unshare`/`clone`/`clone3` calls that
    /// request a namespace type outside the allowed mask, and rejects
    /// `setns(2)` outright since it cannot be filtered by namespace type
    /// through the single `fd` argument seccomp sees.
    pub fn apply_restrict_namespaces(allowed_mask: Option<u32>) -> StepResult<()> {
        const ALL_NAMESPACE_FLAGS: u64 = (libc::CLONE_NEWNS
            | libc::CLONE_NEWUTS
            | libc::CLONE_NEWIPC
            | libc::CLONE_NEWUSER
            | libc::CLONE_NEWPID
            | libc::CLONE_NEWNET
            | libc::CLONE_NEWCGROUP) as u64;
        let Some(allowed_mask) = allowed_mask else {
            return Ok(());
        };
        let forbidden_mask = ALL_NAMESPACE_FLAGS & !u64::from(allowed_mask);
        let mut filter = new_filter(ScmpAction::Allow)?;
        if forbidden_mask != 0 {
            for name in ["unshare", "clone", "clone3"] {
                let Ok(call) = ScmpSyscall::from_name(name) else {
                    continue;
                };
                let cmp = ScmpArgCompare::new(0, ScmpCompareOp::MaskedEqual(forbidden_mask), forbidden_mask);
                filter
                    .add_rule_conditional(ScmpAction::Errno(libc::EPERM), call, &[cmp])
                    .map_err(|e| step_err!(StepExitCode::Seccomp, "adding {name} namespace rule failed: {e}"))?;
            }
        }
        if let Ok(call) = ScmpSyscall::from_name("setns") {
            filter
                .add_rule(ScmpAction::Errno(libc::EPERM), call)
                .map_err(|e| step_err!(StepExitCode::Seccomp, "adding setns rule failed: {e}"))?;
        }
        filter
            .load()
            .map_err(|e| step_err!(StepExitCode::Seccomp, "loading restrict-namespaces filter failed: {e}"))
    }

    /// `ProtectKernelTunables=`: blocks the legacy `_sysctl(2)` syscall.
    /// The read-only-bind-mount half of this setting over `/proc/sys` and
    /// `/sys` is the namespace builder's responsibility (C7), not this one.
    pub fn apply_protect_sysctl(enabled: bool) -> StepResult<()> {
        if !enabled {
            return Ok(());
        }
        let mut filter = new_filter(ScmpAction::Allow)?;
        if let Ok(call) = ScmpSyscall::from_name("_sysctl") {
            filter
                .add_rule(ScmpAction::Errno(libc::ENOSYS), call)
                .map_err(|e| step_err!(StepExitCode::Seccomp, "adding _sysctl rule failed: {e}"))?;
        }
        filter
            .load()
            .map_err(|e| step_err!(StepExitCode::Seccomp, "loading protect-sysctl filter failed: {e}"))
    }

    /// `ProtectKernelModules=`: blocks loading/unloading/querying modules.
    pub fn apply_protect_kernel_modules(enabled: bool) -> StepResult<()> {
        if !enabled {
            return Ok(());
        }
        let mut filter = new_filter(ScmpAction::Allow)?;
        for name in ["init_module", "finit_module", "delete_module", "query_module"] {
            if let Ok(call) = ScmpSyscall::from_name(name) {
                filter
                    .add_rule(ScmpAction::Errno(libc::EPERM), call)
                    .map_err(|e| step_err!(StepExitCode::Seccomp, "adding {name} rule failed: {e}"))?;
            }
        }
        filter
            .load()
            .map_err(|e| step_err!(StepExitCode::Seccomp, "loading protect-kernel-modules filter failed: {e}"))
    }

    /// `ProtectKernelLogs=`: blocks `syslog(2)` (kernel ring buffer access).
    pub fn apply_protect_kernel_logs(enabled: bool) -> StepResult<()> {
        if !enabled {
            return Ok(());
        }
        let mut filter = new_filter(ScmpAction::Allow)?;
        if let Ok(call) = ScmpSyscall::from_name("syslog") {
            filter
                .add_rule(ScmpAction::Errno(libc::EPERM), call)
                .map_err(|e| step_err!(StepExitCode::Seccomp, "adding syslog rule failed: {e}"))?;
        }
        filter
            .load()
            .map_err(|e| step_err!(StepExitCode::Seccomp, "loading protect-kernel-logs filter failed: {e}"))
    }

    /// `ProtectClock=`: blocks the syscalls that can change the system
    /// clock or its rate.
    pub fn apply_protect_clock(enabled: bool) -> StepResult<()> {
        if !enabled {
            return Ok(());
        }
        let mut filter = new_filter(ScmpAction::Allow)?;
        for name in ["adjtimex", "clock_adjtime", "clock_settime", "clock_settime64", "settimeofday", "stime"] {
            if let Ok(call) = ScmpSyscall::from_name(name) {
                filter
                    .add_rule(ScmpAction::Errno(libc::EPERM), call)
                    .map_err(|e| step_err!(StepExitCode::Seccomp, "adding {name} rule failed: {e}"))?;
            }
        }
        filter
            .load()
            .map_err(|e| step_err!(StepExitCode::Seccomp, "loading protect-clock filter failed: {e}"))
    }

    /// `PrivateDevices=`'s seccomp half: rejects `mknod`/`mknodat` calls
    /// that create character or block device nodes. The `/dev` mount
    /// replacement itself is the namespace builder's responsibility (C7).
    pub fn apply_private_devices(enabled: bool) -> StepResult<()> {
        if !enabled {
            return Ok(());
        }
        let mut filter = new_filter(ScmpAction::Allow)?;
        let device_mask = u64::from(libc::S_IFCHR | libc::S_IFBLK);
        for (name, mode_arg) in [("mknod", 1), ("mknodat", 2)] {
            let Ok(call) = ScmpSyscall::from_name(name) else {
                continue;
            };
            let cmp = ScmpArgCompare::new(mode_arg, ScmpCompareOp::MaskedEqual(device_mask), device_mask);
            filter
                .add_rule_conditional(ScmpAction::Errno(libc::EPERM), call, &[cmp])
                .map_err(|e| step_err!(StepExitCode::Seccomp, "adding {name} device rule failed: {e}"))?;
        }
        filter
            .load()
            .map_err(|e| step_err!(StepExitCode::Seccomp, "loading private-devices filter failed: {e}"))
    }

    /// `SystemCallArchitectures=`: restricts the filter to the named ABIs,
    /// rejecting syscalls made through any other registered architecture
    /// (e.g. the 32-bit compat ABI on an otherwise 64-bit-only unit).
    pub fn apply_syscall_archs(architectures: &[String]) -> StepResult<()> {
        if architectures.is_empty() {
            return Ok(());
        }
        let mut filter = new_filter(ScmpAction::Allow)?;
        for name in architectures {
            let Ok(arch) = name.parse() else {
                log::warn!("unknown seccomp architecture {name:?}, ignoring");
                continue;
            };
            filter
                .add_arch(arch)
                .map_err(|e| step_err!(StepExitCode::Seccomp, "adding architecture {name:?} failed: {e}"))?;
        }
        filter
            .load()
            .map_err(|e| step_err!(StepExitCode::Seccomp, "loading syscall-archs filter failed: {e}"))
    }

    /// `SystemCallLog=`: installs an `SCMP_ACT_LOG` rule for the named
    /// syscalls (or, in allow-list mode, logs everything except them) so an
    /// auditor can see which filtered syscalls a unit actually exercises.
    pub fn apply_syscall_log(filtering: &SyscallFiltering) -> StepResult<()> {
        if filtering.log_filter.is_empty() {
            return Ok(());
        }
        let default_action = if filtering.log_allow_list { ScmpAction::Log } else { ScmpAction::Allow };
        let named_action = if filtering.log_allow_list { ScmpAction::Allow } else { ScmpAction::Log };
        let mut filter = new_filter(default_action)?;
        for name in &filtering.log_filter {
            let Ok(call) = ScmpSyscall::from_name(name) else {
                continue;
            };
            filter
                .add_rule(named_action, call)
                .map_err(|e| step_err!(StepExitCode::Seccomp, "adding log rule for {name} failed: {e}"))?;
        }
        filter
            .load()
            .map_err(|e| step_err!(StepExitCode::Seccomp, "loading syscall-log filter failed: {e}"))
    }

    /// The final, user-configured `SystemCallFilter=` substep. MUST run
    /// last among the seccomp substeps (§4.8), since a restrictive
    /// allow-list filter installed earlier could itself block the
    /// syscalls the other substeps still need to make.
    pub fn apply_syscall_filter(filtering: &SyscallFiltering) -> StepResult<()> {
        if filtering.filter.is_empty() {
            return Ok(());
        }
        let default_action = if filtering.allow_list {
            ScmpAction::Errno(filtering.default_errno)
        } else {
            ScmpAction::Allow
        };
        let mut filter = new_filter(default_action)?;

        for (name, action) in &filtering.filter {
            let Ok(call) = ScmpSyscall::from_name(name) else {
                continue;
            };
            let resolved = if filtering.allow_list {
                ScmpAction::Allow
            } else {
                action_for(*action, filtering.default_errno)
            };
            filter
                .add_rule(resolved, call)
                .map_err(|e| step_err!(StepExitCode::Seccomp, "adding rule for {name} failed: {e}"))?;
        }

        filter
            .load()
            .map_err(|e| step_err!(StepExitCode::Seccomp, "loading syscall filter failed: {e}"))
    }

    /// Prevents `personality(2)` from being called again after step 2 set
    /// it, when `LockPersonality=yes`.
    pub fn apply_lock_personality(enabled: bool) -> StepResult<()> {
        if !enabled {
            return Ok(());
        }
        let mut filter = new_filter(ScmpAction::Allow)?;
        if let Ok(call) = ScmpSyscall::from_name("personality") {
            filter
                .add_rule(ScmpAction::Errno(libc::EPERM), call)
                .map_err(|e| step_err!(StepExitCode::Seccomp, "adding personality() rule failed: {e}"))?;
        }
        filter
            .load()
            .map_err(|e| step_err!(StepExitCode::Seccomp, "loading lock-personality filter failed: {e}"))
    }
}

// ---------------------------------------------------------------------------
// Step 33 — LSM-BPF filesystem restrictions.
// ---------------------------------------------------------------------------

/// `RestrictFileSystems=` is implemented via an LSM BPF program upstream;
/// no crate in the retrieval pack binds libbpf, so this is modeled as an
/// abstract collaborator, consistent with how PAM and the namespace
/// builder's unshare/mount step are modeled.
pub trait LsmFilesystemRestrictor {
    fn restrict(&mut self, allowed_filesystems: &[String]) -> StepResult<()>;
}

// ---------------------------------------------------------------------------
// Step 34 — Environment unset + variable expansion in argv.
// ---------------------------------------------------------------------------

/// Expands `$VAR`/`${VAR}` references in an argv entry against the final
/// environment, the way systemd expands `ExecStart=` argument references.
#[must_use]
pub fn expand_argv_entry(entry: &str, env: &[(String, String)]) -> String {
    let mut out = String::with_capacity(entry.len());
    let mut chars = entry.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }
        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_alphanumeric() || next == '_' {
                name.push(next);
                chars.next();
            } else {
                break;
            }
        }
        if braced && chars.peek() == Some(&'}') {
            chars.next();
        }
        if name.is_empty() {
            out.push('$');
            continue;
        }
        if let Some((_, value)) = env.iter().find(|(k, _)| k == &name) {
            out.push_str(value);
        }
    }
    out
}

pub fn expand_argv(argv: &[String], env: &[(String, String)]) -> Vec<String> {
    argv.iter().map(|entry| expand_argv_entry(entry, env)).collect()
}

// ---------------------------------------------------------------------------
// Step 35 — exec-fd hot flip, execve.
// ---------------------------------------------------------------------------

/// Writes a single byte to an "exec notification" fd to flip it "hot"
/// right before `execve`, and flips it back (writes a second, distinct
/// byte) if `execve` returns at all — it only returns on failure. The
/// parent watches this fd to tell a child that died before vs. after
/// actually reaching the target image.
pub fn flip_exec_fd(fd: Option<std::os::fd::RawFd>, hot: bool) {
    let Some(fd) = fd else { return };
    let byte: [u8; 1] = [u8::from(hot)];
    unsafe {
        libc::write(fd, byte.as_ptr().cast(), 1);
    }
}

pub fn execve_or_fail(
    cmd: &Path,
    argv: &[String],
    env: &[(String, String)],
    exec_fd: Option<std::os::fd::RawFd>,
) -> StepResult<std::convert::Infallible> {
    flip_exec_fd(exec_fd, true);

    let cmd_cstr = CString::new(cmd.as_os_str().to_string_lossy().as_bytes())
        .map_err(|e| step_err!(StepExitCode::Exec, "bad path {cmd:?}: {e}"))?;
    let argv_cstr: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_bytes()).unwrap_or_default())
        .collect();
    let env_cstr: Vec<CString> = env
        .iter()
        .map(|(k, v)| CString::new(format!("{k}={v}")).unwrap_or_default())
        .collect();

    let result = nix::unistd::execve(&cmd_cstr, &argv_cstr, &env_cstr);

    flip_exec_fd(exec_fd, false);
    Err(step_err!(
        StepExitCode::Exec,
        "execve({cmd:?}) failed: {}",
        result.unwrap_err()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_argv_entry_substitutes_known_variable() {
        let env = vec![("FOO".to_string(), "bar".to_string())];
        assert_eq!(expand_argv_entry("value=$FOO", &env), "value=bar");
        assert_eq!(expand_argv_entry("value=${FOO}", &env), "value=bar");
    }

    #[test]
    fn expand_argv_entry_leaves_unknown_variable_empty() {
        let env = vec![];
        assert_eq!(expand_argv_entry("value=$MISSING", &env), "value=");
    }

    #[test]
    fn expand_argv_entry_passes_through_plain_text() {
        let env = vec![];
        assert_eq!(expand_argv_entry("no-vars-here", &env), "no-vars-here");
    }

    #[test]
    fn environment_assembly_sets_invocation_id_and_overrides_base() {
        let base = vec![("INVOCATION_ID".to_string(), "stale".to_string())];
        let inputs = EnvironmentInputs {
            base: &base,
            home: None,
            shell: None,
            logname: None,
            term: None,
            invocation_id: "abc123",
            journal_stream: None,
            log_namespace: None,
            directories: &[],
            credentials_directory: None,
            listen_fds: None,
            watchdog: None,
            nss_dynamic_bypass: false,
            notify_socket: None,
            exec_pid: nix::unistd::getpid(),
        };
        let env = assemble_environment(&inputs);
        assert_eq!(
            env.iter().find(|(k, _)| k == "INVOCATION_ID").map(|(_, v)| v.as_str()),
            Some("abc123")
        );
    }
}
