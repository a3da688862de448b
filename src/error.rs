//! The failure-step contract shared by every stage of the child pipeline (C9).
//!
//! Every fallible step in the sandbox-application sequence (§4.8) maps to one
//! of these codes. The child never tries to recover from a fatal step: it
//! logs a structured record naming the step, the executable, and the
//! invocation id, then `_exit`s with the step's numeric value. The parent
//! reads the exit status back out of `waitpid` and maps it to diagnostics.

use std::fmt;

/// Mirrors systemd's `exit-status.h` ordering closely enough that operators
/// who already know that table recognise these numbers; the exact values are
/// local to this crate and not required to match upstream systemd's.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(i32)]
pub enum StepExitCode {
    Success = 0,
    Fds = 100,
    Stdin = 101,
    Stdout = 102,
    Stderr = 103,
    User = 104,
    Group = 105,
    Chdir = 106,
    Chroot = 107,
    Keyring = 108,
    Pam = 109,
    Limits = 110,
    Capabilities = 111,
    Securebits = 112,
    NoNewPrivileges = 113,
    AddressFamilies = 114,
    Seccomp = 115,
    Namespace = 116,
    Network = 117,
    Cgroup = 118,
    StateDirectory = 119,
    RuntimeDirectory = 120,
    CacheDirectory = 121,
    LogsDirectory = 122,
    ConfigurationDirectory = 123,
    Credentials = 124,
    Personality = 125,
    Oom = 126,
    Ioprio = 127,
    SchedulerPriority = 128,
    Exec = 200,
    Confirm = 201,
}

impl StepExitCode {
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Fds => "FDS",
            Self::Stdin => "STDIN",
            Self::Stdout => "STDOUT",
            Self::Stderr => "STDERR",
            Self::User => "USER",
            Self::Group => "GROUP",
            Self::Chdir => "CHDIR",
            Self::Chroot => "CHROOT",
            Self::Keyring => "KEYRING",
            Self::Pam => "PAM",
            Self::Limits => "LIMITS",
            Self::Capabilities => "CAPABILITIES",
            Self::Securebits => "SECUREBITS",
            Self::NoNewPrivileges => "NO_NEW_PRIVILEGES",
            Self::AddressFamilies => "ADDRESS_FAMILIES",
            Self::Seccomp => "SECCOMP",
            Self::Namespace => "NAMESPACE",
            Self::Network => "NETWORK",
            Self::Cgroup => "CGROUP",
            Self::StateDirectory => "STATE_DIRECTORY",
            Self::RuntimeDirectory => "RUNTIME_DIRECTORY",
            Self::CacheDirectory => "CACHE_DIRECTORY",
            Self::LogsDirectory => "LOGS_DIRECTORY",
            Self::ConfigurationDirectory => "CONFIGURATION_DIRECTORY",
            Self::Credentials => "CREDENTIALS",
            Self::Personality => "PERSONALITY",
            Self::Oom => "OOM",
            Self::Ioprio => "IOPRIO",
            Self::SchedulerPriority => "SCHEDULER_PRIORITY",
            Self::Exec => "EXEC",
            Self::Confirm => "CONFIRM",
        }
    }

    /// Recover a `StepExitCode` from a raw `waitpid` exit status, used by the
    /// parent (C10) to turn an opaque exit code back into diagnostics.
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Success,
            100 => Self::Fds,
            101 => Self::Stdin,
            102 => Self::Stdout,
            103 => Self::Stderr,
            104 => Self::User,
            105 => Self::Group,
            106 => Self::Chdir,
            107 => Self::Chroot,
            108 => Self::Keyring,
            109 => Self::Pam,
            110 => Self::Limits,
            111 => Self::Capabilities,
            112 => Self::Securebits,
            113 => Self::NoNewPrivileges,
            114 => Self::AddressFamilies,
            115 => Self::Seccomp,
            116 => Self::Namespace,
            117 => Self::Network,
            118 => Self::Cgroup,
            119 => Self::StateDirectory,
            120 => Self::RuntimeDirectory,
            121 => Self::CacheDirectory,
            122 => Self::LogsDirectory,
            123 => Self::ConfigurationDirectory,
            124 => Self::Credentials,
            125 => Self::Personality,
            126 => Self::Oom,
            127 => Self::Ioprio,
            128 => Self::SchedulerPriority,
            200 => Self::Exec,
            201 => Self::Confirm,
            _ => return None,
        })
    }
}

impl fmt::Display for StepExitCode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{} ({})", self.name(), self.code())
    }
}

/// A fatal pipeline failure: the step it happened at, plus a human-readable
/// cause. This is what the child logs before `_exit`ing and what the parent
/// reconstructs from the step's exit code for its own diagnostics (the cause
/// string itself does not cross the fork boundary, only the step code does).
#[derive(Debug)]
pub struct StepError {
    pub step: StepExitCode,
    pub message: String,
}

impl StepError {
    pub fn new(step: StepExitCode, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "step {}: {}", self.step, self.message)
    }
}

impl std::error::Error for StepError {}

pub type StepResult<T> = Result<T, StepError>;

/// Shorthand for constructing a `StepError` inline, mirroring the terse
/// `format!`-based error construction used throughout `exec_helper.rs`.
#[macro_export]
macro_rules! step_err {
    ($step:expr, $($arg:tt)*) => {
        $crate::error::StepError::new($step, format!($($arg)*))
    };
}
