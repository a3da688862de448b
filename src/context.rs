//! The data model the whole pipeline is built around (§3, C11).
//!
//! `ExecContext` is the frozen, caller-owned description of how a program
//! should be run. It is read-only from the core's perspective: every
//! component in this crate borrows it, never mutates it. `ExecParameters`
//! carries the per-invocation inputs that accompany it (fds, prefixes,
//! flags). Both are plain serde-able structs, following the same
//! JSON-over-the-wire idiom `rustysd` already uses for its `ExecHelperConfig`.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::SystemTime;

/// One of the five kinds of per-service directory the exec-directory manager
/// (C4) owns.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DirectoryClass {
    Runtime,
    State,
    Cache,
    Logs,
    Configuration,
}

impl DirectoryClass {
    #[must_use]
    pub const fn all() -> [Self; 5] {
        [
            Self::Runtime,
            Self::State,
            Self::Cache,
            Self::Logs,
            Self::Configuration,
        ]
    }

    #[must_use]
    pub const fn env_var(self) -> &'static str {
        match self {
            Self::Runtime => "RUNTIME_DIRECTORY",
            Self::State => "STATE_DIRECTORY",
            Self::Cache => "CACHE_DIRECTORY",
            Self::Logs => "LOGS_DIRECTORY",
            Self::Configuration => "CONFIGURATION_DIRECTORY",
        }
    }
}

/// A single entry in one of the five directory lists.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct DirectoryItem {
    pub path: PathBuf,
    pub symlinks: Vec<PathBuf>,
    pub only_create: bool,
}

/// Per-class directory configuration (mode, preserve-mode, item list).
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct DirectoryConfig {
    pub mode: u32,
    pub preserve_mode: bool,
    pub items: Vec<DirectoryItem>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            mode: 0o755,
            preserve_mode: true,
            items: Vec::new(),
        }
    }
}

/// A compiled bind-mount entry (§4.7).
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct BindMount {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub read_only: bool,
    pub recursive: bool,
    pub ignore_missing: bool,
    pub nosuid: bool,
}

/// ProtectHome=/ProtectSystem=-style tri-state knobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub enum ProtectMode {
    #[default]
    No,
    Yes,
    ReadOnly,
    TmpfsUnless,
    Strict,
}

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct FilesystemView {
    pub root_directory: Option<PathBuf>,
    pub root_image: Option<PathBuf>,
    pub root_verity: Option<String>,
    pub read_only_paths: Vec<PathBuf>,
    pub read_write_paths: Vec<PathBuf>,
    pub inaccessible_paths: Vec<PathBuf>,
    pub exec_paths: Vec<PathBuf>,
    pub no_exec_paths: Vec<PathBuf>,
    pub bind_mounts: Vec<BindMount>,
    pub temporary_filesystems: Vec<(PathBuf, String)>,
    pub mount_images: Vec<PathBuf>,
    pub extension_images: Vec<PathBuf>,
    pub extension_directories: Vec<PathBuf>,
    pub protect_home: ProtectMode,
    pub protect_system: ProtectMode,
    pub protect_proc: ProtectMode,
    pub private_tmp: bool,
    pub private_devices: bool,
    pub private_network: bool,
    pub private_ipc: bool,
    pub private_users: bool,
    pub mount_api_vfs: bool,
    pub mount_propagation_private: bool,
}

/// Syscall number → disposition, part of the syscall filtering block (§3).
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub enum FilterAction {
    Errno(i32),
    Kill,
    Allow,
    Log,
}

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct SyscallFiltering {
    pub filter: BTreeMap<String, FilterAction>,
    pub allow_list: bool,
    pub default_errno: i32,
    pub architectures: Vec<String>,
    pub log_allow_list: bool,
    pub log_filter: Vec<String>,
    pub restrict_namespaces: Option<u32>,
    pub restrict_address_families: Vec<String>,
    pub restrict_address_families_allow_list: bool,
    pub restrict_filesystems: Vec<String>,
    pub memory_deny_write_execute: bool,
    pub restrict_realtime: bool,
    pub restrict_suid_sgid: bool,
    pub protect_kernel_tunables: bool,
    pub protect_kernel_modules: bool,
    pub protect_kernel_logs: bool,
    pub protect_clock: bool,
    pub protect_hostname: bool,
}

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct MacLabels {
    pub selinux_context: Option<String>,
    pub selinux_context_ignore: bool,
    pub apparmor_profile: Option<String>,
    pub apparmor_profile_ignore: bool,
    pub smack_process_label: Option<String>,
    pub smack_process_label_ignore: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum KeyringMode {
    Inherit,
    Private,
    Shared,
}

impl Default for KeyringMode {
    fn default() -> Self {
        Self::Private
    }
}

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Privileges {
    pub capability_bounding_set: Option<Vec<String>>,
    pub capability_ambient_set: Vec<String>,
    pub secure_bits: u32,
    pub no_new_privileges: bool,
    pub mac_labels: MacLabels,
    pub keyring_mode: KeyringMode,
    pub personality: Option<String>,
    pub lock_personality: bool,
}

/// One of the 16 `RLIMIT_*` slots (`RLIMIT_NOFILE` etc). `None` means "not
/// configured, inherit from the parent".
#[derive(Clone, Copy, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct RLimit {
    pub soft: Option<u64>,
    pub hard: Option<u64>,
}

pub const RLIMIT_SLOTS: usize = 16;

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Resources {
    pub rlimits: [Option<RLimit>; RLIMIT_SLOTS],
    pub nice: Option<i32>,
    pub ioprio: Option<i32>,
    pub cpu_sched_policy: Option<i32>,
    pub cpu_sched_priority: Option<i32>,
    pub cpu_sched_reset_on_fork: bool,
    pub cpu_affinity: Vec<usize>,
    pub numa_policy: Option<i32>,
    pub oom_score_adjust: Option<i32>,
    pub coredump_filter: Option<u32>,
    pub timer_slack_ns: Option<u64>,
    pub umask: u32,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            rlimits: Default::default(),
            nice: None,
            ioprio: None,
            cpu_sched_policy: None,
            cpu_sched_priority: None,
            cpu_sched_reset_on_fork: false,
            cpu_affinity: Vec::new(),
            numa_policy: None,
            oom_score_adjust: None,
            coredump_filter: None,
            timer_slack_ns: None,
            umask: 0o022,
        }
    }
}

/// The 8 stdin variants from §4.2.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ExecInput {
    Null,
    Tty,
    TtyForce,
    TtyFail,
    Socket,
    NamedFd(String),
    Data,
    File(PathBuf),
}

impl Default for ExecInput {
    fn default() -> Self {
        Self::Null
    }
}

/// The 12 stdout/stderr variants from §4.2.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ExecOutput {
    Inherit,
    Null,
    Tty,
    Kmsg,
    Journal,
    KmsgAndConsole,
    JournalAndConsole,
    Socket,
    NamedFd(String),
    File(PathBuf),
    FileAppend(PathBuf),
    FileTruncate(PathBuf),
}

impl Default for ExecOutput {
    fn default() -> Self {
        Self::Inherit
    }
}

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct IoConfig {
    pub std_input: ExecInput,
    pub std_output: ExecOutput,
    pub std_error: ExecOutput,
    pub tty_path: Option<PathBuf>,
    pub tty_reset: bool,
    pub tty_vhangup: bool,
    pub tty_vt_disallocate: bool,
    pub tty_rows: Option<u16>,
    pub tty_cols: Option<u16>,
    pub stdin_data: Vec<u8>,
    pub stdio_fd_names: Vec<(String, String)>,
    pub syslog_identifier: Option<String>,
    pub syslog_priority: i32,
    pub log_namespace: Option<String>,
    pub log_rate_limit_interval_usec: Option<u64>,
    pub log_rate_limit_burst: Option<u32>,
}

/// A `SetCredentials=` entry: inline bytes, optionally AES-GCM-sealed and
/// base64-encoded upstream of us.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SetCredential {
    pub data: Vec<u8>,
    pub size: usize,
    pub encrypted: bool,
}

/// A `LoadCredentials=` entry: a path to resolve at acquisition time (§4.5).
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct LoadCredential {
    pub path: PathBuf,
    pub encrypted: bool,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct CredentialConfig {
    pub set_credentials: BTreeMap<String, SetCredential>,
    pub load_credentials: BTreeMap<String, LoadCredential>,
    pub import_credentials: Vec<String>,
    /// Whether the credential workspace is required to live on a namespaced
    /// (ramfs/tmpfs) mount. When the mount namespace cannot be built at all
    /// (the namespace builder's `ENOANO` downgrade), the fallback is a plain
    /// directory on the host filesystem, which weakens confidentiality —
    /// that fallback is only acceptable when the caller has explicitly set
    /// this to `false`. Defaults to `true`, the strict behaviour.
    pub must_mount: bool,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            set_credentials: BTreeMap::new(),
            load_credentials: BTreeMap::new(),
            import_credentials: Vec::new(),
            must_mount: true,
        }
    }
}


/// The frozen, caller-owned description of how a program should be run
/// (§3). Every component in this crate takes `&ExecContext`, never `&mut`.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ExecContext {
    // Identity
    pub user: Option<String>,
    pub group: Option<String>,
    pub supplementary_groups: Vec<String>,
    pub dynamic_user: bool,
    pub pam_service: Option<String>,

    pub filesystem: FilesystemView,
    pub directories: BTreeMap<DirectoryClass, DirectoryConfig>,
    pub privileges: Privileges,
    pub syscall_filtering: SyscallFiltering,
    pub resources: Resources,
    pub io: IoConfig,
    pub credentials: CredentialConfig,

    pub working_directory: Option<PathBuf>,
    pub ignore_sigpipe: bool,
    pub utmp_identifier: Option<String>,
}

/// Errors surfaced while validating the invariants of §3.
#[derive(Debug)]
pub enum ContextError {
    DuplicatePath(PathBuf),
    MissingOnlyCreate(PathBuf),
    ConflictingRoot,
    BadCredentialId(String),
}

impl std::fmt::Display for ContextError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::DuplicatePath(p) => write!(fmt, "duplicate directory path: {p:?}"),
            Self::MissingOnlyCreate(p) => write!(
                fmt,
                "{p:?} is nested under another directory item but is missing only_create=true"
            ),
            Self::ConflictingRoot => {
                write!(fmt, "root_directory and root_image are mutually exclusive")
            }
            Self::BadCredentialId(id) => write!(fmt, "invalid credential id: {id}"),
        }
    }
}

impl std::error::Error for ContextError {}

/// A short identifier is non-empty, has no path separators, and no leading dot.
fn is_valid_credential_id(id: &str) -> bool {
    !id.is_empty() && !id.contains('/') && !id.starts_with('.') && id.len() <= 255
}

impl ExecContext {
    /// Checks the data-model invariants from §3 without mutating anything.
    pub fn validate(&self) -> Result<(), ContextError> {
        if self.filesystem.root_directory.is_some() && self.filesystem.root_image.is_some() {
            return Err(ContextError::ConflictingRoot);
        }

        for config in self.directories.values() {
            let mut seen: Vec<&PathBuf> = Vec::new();
            for item in &config.items {
                if seen.contains(&&item.path) {
                    return Err(ContextError::DuplicatePath(item.path.clone()));
                }
                seen.push(&item.path);
            }
            for item in &config.items {
                let has_ancestor = config
                    .items
                    .iter()
                    .any(|other| other.path != item.path && item.path.starts_with(&other.path));
                if has_ancestor && (!item.only_create || !item.symlinks.is_empty()) {
                    return Err(ContextError::MissingOnlyCreate(item.path.clone()));
                }
            }
        }

        for id in self
            .credentials
            .set_credentials
            .keys()
            .chain(self.credentials.load_credentials.keys())
        {
            if !is_valid_credential_id(id) {
                return Err(ContextError::BadCredentialId(id.clone()));
            }
        }

        Ok(())
    }
}

/// Initialises documented defaults (§4.11): umask 0022, dir-mode 0755 for all
/// five directory classes, capability-bounding-set "all" (`None` = all),
/// restrict-namespaces "initial" sentinel (`None`), syslog priority
/// `LOG_DAEMON|LOG_INFO`.
impl ExecContext {
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut directories = BTreeMap::new();
        for class in DirectoryClass::all() {
            directories.insert(class, DirectoryConfig::default());
        }
        Self {
            io: IoConfig {
                syslog_priority: (libc::LOG_DAEMON | libc::LOG_INFO) as i32,
                ..Default::default()
            },
            ignore_sigpipe: true,
            directories,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// ExecParameters
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ExecFlags {
    pub apply_sandboxing: bool,
    pub apply_tty_stdin: bool,
    pub apply_chroot: bool,
    pub control_cgroup: bool,
    pub is_control: bool,
    pub cgroup_delegate: bool,
    pub write_credentials: bool,
    pub set_watchdog: bool,
    pub nss_dynamic_bypass: bool,
    pub chown_directories: bool,
    pub pass_log_unit: bool,
}

/// Per-invocation inputs accompanying an `ExecContext` (§3). Unlike
/// `ExecContext` this is cheap to construct fresh for every spawn.
#[derive(Debug, Default)]
pub struct ExecParameters {
    pub environment: Vec<(String, String)>,
    pub socket_fds: Vec<RawFd>,
    pub storage_fds: Vec<RawFd>,
    pub fd_names: Vec<String>,
    pub stdin_fd: Option<RawFd>,
    pub stdout_fd: Option<RawFd>,
    pub stderr_fd: Option<RawFd>,
    pub exec_notify_fd: Option<RawFd>,
    pub directory_prefixes: BTreeMap<DirectoryClass, PathBuf>,
    pub received_credentials_directory: Option<PathBuf>,
    pub cgroup_path: Option<PathBuf>,
    pub flags: ExecFlags,
    pub watchdog_usec: Option<u64>,
    pub idle_pipe: Option<[RawFd; 4]>,
    pub user_lookup_fd: Option<RawFd>,
    pub notify_socket: Option<PathBuf>,
    pub selinux_context_net: bool,
    pub confirm_spawn_terminal: Option<PathBuf>,
    pub unit_id: String,
    pub invocation_id: String,
    /// A network namespace fd handed over by the `ExecRuntime` registry
    /// (`take_netns_fd`), joined with `setns(2)` at step 12 when present.
    pub netns_fd: Option<RawFd>,
    /// An IPC namespace fd handed over the same way as `netns_fd`.
    pub ipcns_fd: Option<RawFd>,
}

impl ExecParameters {
    #[must_use]
    pub fn prefix_for(&self, class: DirectoryClass) -> PathBuf {
        self.directory_prefixes
            .get(&class)
            .cloned()
            .unwrap_or_else(|| default_prefix(class))
    }
}

#[must_use]
pub fn default_prefix(class: DirectoryClass) -> PathBuf {
    match class {
        DirectoryClass::Runtime => PathBuf::from("/run"),
        DirectoryClass::State => PathBuf::from("/var/lib"),
        DirectoryClass::Cache => PathBuf::from("/var/cache"),
        DirectoryClass::Logs => PathBuf::from("/var/log"),
        DirectoryClass::Configuration => PathBuf::from("/etc"),
    }
}

// ---------------------------------------------------------------------------
// ExecStatus
// ---------------------------------------------------------------------------

/// Per-command observation record (§3): start/exit timestamps, pid, and the
/// raw sigchld/exit-status pair.
#[derive(Clone, Debug, Default)]
pub struct ExecStatus {
    pub start_timestamp: Option<SystemTime>,
    pub exit_timestamp: Option<SystemTime>,
    pub pid: Option<nix::unistd::Pid>,
    pub sigchld_code: Option<i32>,
    pub exit_status: Option<i32>,
}

impl ExecStatus {
    pub fn record_start(&mut self, pid: nix::unistd::Pid) {
        self.pid = Some(pid);
        self.start_timestamp = Some(SystemTime::now());
        self.exit_timestamp = None;
        self.sigchld_code = None;
        self.exit_status = None;
    }

    pub fn record_exit(&mut self, sigchld_code: i32, exit_status: i32) {
        self.exit_timestamp = Some(SystemTime::now());
        self.sigchld_code = Some(sigchld_code);
        self.exit_status = Some(exit_status);
    }
}

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// An immutable named byte blob published to a service (§3, glossary).
#[derive(Clone)]
pub struct Credential {
    pub id: String,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Credential")
            .field("id", &self.id)
            .field("bytes", &format_args!("<{} bytes>", self.bytes.len()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let ctx = ExecContext::with_defaults();
        assert_eq!(ctx.resources.umask, 0o022);
        assert_eq!(ctx.directories[&DirectoryClass::Runtime].mode, 0o755);
        assert!(ctx.privileges.capability_bounding_set.is_none());
        assert!(ctx.ignore_sigpipe);
    }

    #[test]
    fn conflicting_root_is_rejected() {
        let mut ctx = ExecContext::with_defaults();
        ctx.filesystem.root_directory = Some(PathBuf::from("/a"));
        ctx.filesystem.root_image = Some(PathBuf::from("/b.img"));
        assert!(matches!(ctx.validate(), Err(ContextError::ConflictingRoot)));
    }

    #[test]
    fn nested_directory_without_only_create_is_rejected() {
        let mut ctx = ExecContext::with_defaults();
        let config = ctx.directories.get_mut(&DirectoryClass::State).unwrap();
        config.items.push(DirectoryItem {
            path: PathBuf::from("foo"),
            symlinks: vec![],
            only_create: false,
        });
        config.items.push(DirectoryItem {
            path: PathBuf::from("foo/bar"),
            symlinks: vec![],
            only_create: false,
        });
        assert!(matches!(
            ctx.validate(),
            Err(ContextError::MissingOnlyCreate(_))
        ));
    }

    #[test]
    fn nested_directory_with_only_create_is_accepted() {
        let mut ctx = ExecContext::with_defaults();
        let config = ctx.directories.get_mut(&DirectoryClass::State).unwrap();
        config.items.push(DirectoryItem {
            path: PathBuf::from("foo"),
            symlinks: vec![],
            only_create: false,
        });
        config.items.push(DirectoryItem {
            path: PathBuf::from("foo/bar"),
            symlinks: vec![],
            only_create: true,
        });
        assert!(ctx.validate().is_ok());
    }

    #[test]
    fn bad_credential_id_is_rejected() {
        let mut ctx = ExecContext::with_defaults();
        ctx.credentials.set_credentials.insert(
            "../etc/passwd".to_string(),
            SetCredential {
                data: vec![],
                size: 0,
                encrypted: false,
            },
        );
        assert!(matches!(
            ctx.validate(),
            Err(ContextError::BadCredentialId(_))
        ));
    }
}
