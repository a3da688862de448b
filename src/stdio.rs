//! C2 — Stdio Wiring (§4.2).
//!
//! Resolves the configured `ExecInput`/`ExecOutput` variant for each of
//! stdin/stdout/stderr to a concrete open fd, then re-homes the result onto
//! exactly descriptor 0/1/2. The open/connect/memfd logic here is a direct
//! generalisation of `entrypoints::exec_helper::{setup_stdin, tty_reset_destructive}`
//! to the full variant set the data model exposes (socket/named-fd/data/kmsg/journal).

use std::ffi::CString;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::path::Path;

use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, UnixAddr};
use nix::unistd::{self, Pid};

use crate::context::{ExecContext, ExecInput, ExecOutput, IoConfig};
use crate::error::{StepExitCode, StepResult};
use crate::fd_plumbing::move_or_dup;
use crate::step_err;

/// `(dev, ino)` of the fd a kmsg/journal header was written to, advertised
/// to the payload as `JOURNAL_STREAM=dev:ino` (§6).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct JournalStream {
    pub dev: u64,
    pub ino: u64,
}

/// Everything C2 produces that the environment-assembly step (step 7, §4.8)
/// and the rest of the pipeline need to see.
#[derive(Default)]
pub struct StdioResult {
    pub journal_stream: Option<JournalStream>,
}

/// Retries `open(2)` on EIO, matching `open_terminal()` in `exec_helper.rs` —
/// a TTY mid-close can transiently return EIO.
fn open_terminal(path: &Path, flags: nix::fcntl::OFlag) -> StepResult<RawFd> {
    let cpath =
        CString::new(path.as_os_str().to_string_lossy().as_bytes()).map_err(|e| {
            step_err!(StepExitCode::Stdin, "invalid tty path {path:?}: {e}")
        })?;
    for attempt in 0..20u32 {
        let fd = unsafe { libc::open(cpath.as_ptr(), flags.bits()) };
        if fd >= 0 {
            return Ok(fd);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EIO) || attempt == 19 {
            return Err(step_err!(
                StepExitCode::Stdin,
                "open({path:?}) failed: {err}"
            ));
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    unreachable!()
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum TtyPolicy {
    Wait,
    ForceSteal,
    TryOnly,
}

/// Acquires the configured tty as stdin: opens it, optionally makes us a
/// session leader, and performs `TIOCSCTTY` according to `policy`. Mirrors
/// `exec_helper::setup_stdin`'s `StandardInput::{Tty,TtyForce,TtyFail}` arm.
fn acquire_tty_stdin(io: &IoConfig, policy: TtyPolicy) -> StepResult<RawFd> {
    let path = io
        .tty_path
        .as_deref()
        .unwrap_or_else(|| Path::new("/dev/console"));

    unsafe {
        let ret = libc::setsid();
        if ret == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EPERM) {
                log::warn!("setsid() failed acquiring tty stdin: {err}");
            }
        }
    }

    let fd = open_terminal(path, nix::fcntl::OFlag::O_RDWR | nix::fcntl::OFlag::O_NOCTTY)?;

    let force_arg: libc::c_int = if policy == TtyPolicy::ForceSteal { 1 } else { 0 };
    let ret = unsafe {
        let mut old_sa: libc::sigaction = std::mem::zeroed();
        let mut ignore_sa: libc::sigaction = std::mem::zeroed();
        ignore_sa.sa_sigaction = libc::SIG_IGN;
        libc::sigaction(libc::SIGHUP, &ignore_sa, &mut old_sa);
        let ret = libc::ioctl(fd, libc::TIOCSCTTY, force_arg);
        libc::sigaction(libc::SIGHUP, &old_sa, std::ptr::null_mut());
        ret
    };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        if policy == TtyPolicy::TryOnly {
            unsafe { libc::close(fd) };
            return Err(step_err!(
                StepExitCode::Stdin,
                "failed to acquire controlling terminal {path:?}: {err}"
            ));
        }
        log::warn!("TIOCSCTTY on {path:?} failed (continuing): {err}");
    }

    if let (Some(rows), Some(cols)) = (io.tty_rows, io.tty_cols) {
        let ws = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        unsafe {
            let _ = libc::ioctl(fd, libc::TIOCSWINSZ, &ws);
        }
    }

    Ok(fd)
}

/// Destructive tty reset/vhangup/disallocate, run before stdin is opened,
/// matching `exec_helper::tty_reset_destructive`.
pub fn tty_reset_destructive(io: &IoConfig) -> StepResult<()> {
    if !io.tty_reset && !io.tty_vhangup && !io.tty_vt_disallocate {
        return Ok(());
    }
    let path = io
        .tty_path
        .as_deref()
        .unwrap_or_else(|| Path::new("/dev/console"));

    let fd = open_terminal(
        path,
        nix::fcntl::OFlag::O_RDWR | nix::fcntl::OFlag::O_NOCTTY | nix::fcntl::OFlag::O_NONBLOCK,
    )?;

    if io.tty_reset {
        unsafe {
            let _ = libc::ioctl(fd, libc::TIOCNXCL);
            let mut termios: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut termios) == 0 {
                termios.c_iflag &= !(libc::IGNBRK
                    | libc::BRKINT
                    | libc::ISTRIP
                    | libc::INLCR
                    | libc::IGNCR);
                termios.c_iflag |= libc::ICRNL | libc::IMAXBEL;
                termios.c_oflag |= libc::ONLCR | libc::OPOST;
                termios.c_cflag |= libc::CREAD;
                termios.c_lflag = libc::ISIG
                    | libc::ICANON
                    | libc::IEXTEN
                    | libc::ECHO
                    | libc::ECHOE
                    | libc::ECHOK;
                let _ = libc::tcsetattr(fd, libc::TCSANOW, &termios);
            }
            let _ = libc::tcflush(fd, libc::TCIOFLUSH);
        }
    }

    if io.tty_vhangup {
        unsafe {
            if libc::ioctl(fd, libc::TIOCVHANGUP) < 0 {
                log::warn!(
                    "TIOCVHANGUP on {path:?} failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    unsafe {
        libc::close(fd);
    }

    if io.tty_vt_disallocate {
        disallocate_vt(path);
    }

    Ok(())
}

fn disallocate_vt(path: &Path) {
    let name = path.to_string_lossy();
    let Some(vt_str) = name.strip_prefix("/dev/tty") else {
        return;
    };
    let Ok(vt_num) = vt_str.parse::<libc::c_int>() else {
        return;
    };
    if vt_num <= 0 {
        return;
    }
    if let Ok(tty0_fd) = open_terminal(
        Path::new("/dev/tty0"),
        nix::fcntl::OFlag::O_RDWR | nix::fcntl::OFlag::O_NOCTTY | nix::fcntl::OFlag::O_NONBLOCK,
    ) {
        let ret = unsafe { libc::ioctl(tty0_fd, 0x5608 /* VT_DISALLOCATE */, vt_num) };
        unsafe { libc::close(tty0_fd) };
        if ret >= 0 {
            return;
        }
    }
    if let Ok(clear_fd) =
        open_terminal(path, nix::fcntl::OFlag::O_WRONLY | nix::fcntl::OFlag::O_NOCTTY)
    {
        let seq = b"\x1b[r\x1b[H\x1b[3J\x1bc";
        unsafe {
            let _ = libc::write(clear_fd, seq.as_ptr().cast(), seq.len());
            libc::close(clear_fd);
        }
    }
}

fn open_null(flags: nix::fcntl::OFlag) -> StepResult<RawFd> {
    unistd::close(0).ok();
    nix::fcntl::open(Path::new("/dev/null"), flags, nix::sys::stat::Mode::empty())
        .map_err(|e| step_err!(StepExitCode::Stdin, "open(/dev/null) failed: {e}"))
}

fn lookup_named_fd(params: &crate::context::ExecParameters, name: &str) -> StepResult<RawFd> {
    params
        .fd_names
        .iter()
        .position(|n| n == name)
        .and_then(|idx| {
            params
                .socket_fds
                .iter()
                .chain(params.storage_fds.iter())
                .nth(idx)
                .copied()
        })
        .ok_or_else(|| step_err!(StepExitCode::Stdin, "no fd named {name:?} was passed in"))
}

/// Materialises `data` into a sealed, read-only memfd, matching the `data`
/// stdin variant (§4.2, §6 "Stdin data path"). Replaces the `shmemfdrs`
/// helper the teacher codebase reaches for in the analogous "pass a blob
/// across exec" case: `memfd_create` + `F_ADD_SEALS` is the same mechanism
/// without round-tripping through a named shm object.
fn seal_data_memfd(data: &[u8]) -> StepResult<RawFd> {
    let name = CString::new("stdin-data").unwrap();
    let fd = unsafe {
        libc::syscall(
            libc::SYS_memfd_create,
            name.as_ptr(),
            libc::MFD_ALLOW_SEALING,
        ) as RawFd
    };
    if fd < 0 {
        return Err(step_err!(
            StepExitCode::Stdin,
            "memfd_create failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    let write_res = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
    if write_res < 0 || write_res as usize != data.len() {
        unsafe { libc::close(fd) };
        return Err(step_err!(
            StepExitCode::Stdin,
            "writing stdin-data into memfd failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    let seals = libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_WRITE | libc::F_SEAL_SEAL;
    unsafe {
        libc::fcntl(fd, libc::F_ADD_SEALS, seals);
    }
    Ok(fd)
}

fn resolve_input(
    ctx: &ExecContext,
    params: &crate::context::ExecParameters,
) -> StepResult<RawFd> {
    match &ctx.io.std_input {
        ExecInput::Null => open_null(nix::fcntl::OFlag::O_RDONLY),
        ExecInput::Tty => acquire_tty_stdin(&ctx.io, TtyPolicy::Wait),
        ExecInput::TtyForce => acquire_tty_stdin(&ctx.io, TtyPolicy::ForceSteal),
        ExecInput::TtyFail => acquire_tty_stdin(&ctx.io, TtyPolicy::TryOnly),
        ExecInput::Socket => params.socket_fds.first().copied().ok_or_else(|| {
            step_err!(StepExitCode::Stdin, "StandardInput=socket but no socket fd was passed")
        }),
        ExecInput::NamedFd(name) => lookup_named_fd(params, name),
        ExecInput::Data => seal_data_memfd(&ctx.io.stdin_data),
        ExecInput::File(path) => nix::fcntl::open(
            path.as_path(),
            nix::fcntl::OFlag::O_RDONLY,
            nix::sys::stat::Mode::empty(),
        )
        .map_err(|e| step_err!(StepExitCode::Stdin, "open({path:?}) failed: {e}")),
    }
}

/// Connects to the configured journal/kmsg socket and writes the 7-line
/// stream header from §6. On failure this falls back to `/dev/null`, per
/// §4.2, and the failure is logged but never fatal.
fn open_journal_stream(
    ctx: &ExecContext,
    unit_id: &str,
    is_kmsg: bool,
    want_console: bool,
) -> (RawFd, Option<JournalStream>) {
    let socket_path = if let Some(ns) = &ctx.io.log_namespace {
        format!("/run/systemd/journal.{ns}/stdout")
    } else {
        "/run/systemd/journal/stdout".to_string()
    };

    let connect_result = (|| -> nix::Result<RawFd> {
        let sock = socket::socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )?;
        let addr = UnixAddr::new(Path::new(&socket_path))?;
        socket::connect(sock.as_raw_fd(), &addr)?;
        socket::shutdown(sock.as_raw_fd(), socket::Shutdown::Read)?;
        Ok(sock.into_raw_fd())
    })();

    let Ok(fd) = connect_result else {
        log::warn!("failed to connect to journal socket {socket_path}, falling back to /dev/null");
        let null = open_null(nix::fcntl::OFlag::O_WRONLY).unwrap_or(-1);
        return (null, None);
    };

    let identifier = ctx.io.syslog_identifier.clone().unwrap_or_default();
    let is_terminal = matches!(ctx.io.std_output, ExecOutput::Tty);
    let header = format!(
        "{identifier}\n{unit}\n{priority}\n{level_prefix}\n0\n{kmsg}\n{terminal}\n",
        unit = unit_id,
        priority = ctx.io.syslog_priority,
        level_prefix = 1,
        kmsg = u8::from(is_kmsg),
        terminal = u8::from(is_terminal),
    );
    let _ = want_console;
    let write_res = unsafe { libc::write(fd, header.as_ptr().cast(), header.len()) };
    if write_res < 0 {
        log::warn!(
            "failed to write journal stream header: {}",
            std::io::Error::last_os_error()
        );
    }

    let stream = fd_identity(fd);
    (fd, stream)
}

fn fd_identity(fd: RawFd) -> Option<JournalStream> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return None;
    }
    Some(JournalStream {
        dev: stat.st_dev,
        ino: stat.st_ino,
    })
}

fn resolve_output_variant(
    variant: &ExecOutput,
    ctx: &ExecContext,
    params: &crate::context::ExecParameters,
    unit_id: &str,
) -> StepResult<(RawFd, Option<JournalStream>)> {
    match variant {
        ExecOutput::Inherit => unreachable!("Inherit resolved by caller"),
        ExecOutput::Null => Ok((open_null(nix::fcntl::OFlag::O_WRONLY)?, None)),
        ExecOutput::Tty => Ok((
            nix::fcntl::open(
                ctx.io
                    .tty_path
                    .as_deref()
                    .unwrap_or_else(|| Path::new("/dev/console")),
                nix::fcntl::OFlag::O_WRONLY | nix::fcntl::OFlag::O_NOCTTY,
                nix::sys::stat::Mode::empty(),
            )
            .map_err(|e| step_err!(StepExitCode::Stdout, "open tty for output failed: {e}"))?,
            None,
        )),
        ExecOutput::Kmsg | ExecOutput::KmsgAndConsole => {
            let (fd, js) = open_journal_stream(ctx, unit_id, true, matches!(variant, ExecOutput::KmsgAndConsole));
            Ok((fd, js))
        }
        ExecOutput::Journal | ExecOutput::JournalAndConsole => {
            let (fd, js) =
                open_journal_stream(ctx, unit_id, false, matches!(variant, ExecOutput::JournalAndConsole));
            Ok((fd, js))
        }
        ExecOutput::Socket => params.socket_fds.first().copied().ok_or_else(|| {
            step_err!(StepExitCode::Stdout, "StandardOutput=socket but no socket fd was passed")
        }).map(|fd| (fd, None)),
        ExecOutput::NamedFd(name) => Ok((lookup_named_fd(params, name)?, None)),
        ExecOutput::File(path) | ExecOutput::FileTruncate(path) => {
            open_stdio_file(path, true).map(|fd| (fd, None))
        }
        ExecOutput::FileAppend(path) => open_stdio_file(path, false).map(|fd| (fd, None)),
    }
}

/// Opens a stdout/stderr target file. When the path names an `AF_UNIX`
/// stream socket (`ENXIO` on a plain `open(2)` of a socket special file),
/// connects instead and half-shuts-down for write, per §4.2.
fn open_stdio_file(path: &Path, truncate: bool) -> StepResult<RawFd> {
    let mut oflag = nix::fcntl::OFlag::O_WRONLY | nix::fcntl::OFlag::O_CREAT;
    oflag |= if truncate {
        nix::fcntl::OFlag::O_TRUNC
    } else {
        nix::fcntl::OFlag::O_APPEND
    };
    match nix::fcntl::open(path, oflag, nix::sys::stat::Mode::from_bits_truncate(0o644)) {
        Ok(fd) => Ok(fd),
        Err(nix::errno::Errno::ENXIO) => {
            let sock = socket::socket(
                AddressFamily::Unix,
                SockType::Stream,
                SockFlag::empty(),
                None,
            )
            .map_err(|e| step_err!(StepExitCode::Stdout, "socket() failed: {e}"))?;
            let addr = UnixAddr::new(path)
                .map_err(|e| step_err!(StepExitCode::Stdout, "bad socket path {path:?}: {e}"))?;
            socket::connect(sock.as_raw_fd(), &addr)
                .map_err(|e| step_err!(StepExitCode::Stdout, "connect({path:?}) failed: {e}"))?;
            socket::shutdown(sock.as_raw_fd(), socket::Shutdown::Read).ok();
            Ok(sock.into_raw_fd())
        }
        Err(e) => Err(step_err!(StepExitCode::Stdout, "open({path:?}) failed: {e}")),
    }
}

/// Returns true if two output variants would resolve to a fd that can
/// simply be shared via dup rather than independently opened (used by
/// stderr's `inherit` resolution, §4.2).
fn outputs_are_shareable(a: &ExecOutput, b: &ExecOutput) -> bool {
    match (a, b) {
        (ExecOutput::File(p1), ExecOutput::File(p2))
        | (ExecOutput::FileAppend(p1), ExecOutput::FileAppend(p2))
        | (ExecOutput::FileTruncate(p1), ExecOutput::FileTruncate(p2)) => p1 == p2,
        (ExecOutput::NamedFd(n1), ExecOutput::NamedFd(n2)) => n1 == n2,
        (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
    }
}

/// Resolves std{in,out,err} per §4.2 and re-homes them onto exactly
/// descriptors 0/1/2. Returns the journal-stream identity if one was
/// opened (preferring stderr's over stdout's, per §4.2).
pub fn wire_stdio(
    ctx: &ExecContext,
    params: &crate::context::ExecParameters,
    is_pid1: bool,
) -> StepResult<StdioResult> {
    if matches!(
        ctx.io.std_input,
        ExecInput::Tty | ExecInput::TtyForce | ExecInput::TtyFail
    ) {
        tty_reset_destructive(&ctx.io)?;
    }

    let stdin_fd = params
        .stdin_fd
        .map(Ok)
        .unwrap_or_else(|| resolve_input(ctx, params))?;
    move_or_dup(stdin_fd, 0)
        .map_err(|e| step_err!(StepExitCode::Stdin, "failed to install stdin: {e}"))?;

    let mut stdout_journal = None;
    let stdout_fd = if let Some(fd) = params.stdout_fd {
        fd
    } else {
        match &ctx.io.std_output {
            ExecOutput::Inherit => {
                if matches!(
                    ctx.io.std_input,
                    ExecInput::Tty | ExecInput::TtyForce | ExecInput::TtyFail
                ) {
                    crate::fd_plumbing::dup_fd(0)
                        .map_err(|e| step_err!(StepExitCode::Stdout, "dup stdin for stdout: {e}"))?
                } else if is_pid1 {
                    open_null(nix::fcntl::OFlag::O_WRONLY)?
                } else {
                    crate::fd_plumbing::dup_fd(1)
                        .map_err(|e| step_err!(StepExitCode::Stdout, "dup parent stdout: {e}"))?
                }
            }
            variant => {
                let (fd, js) = resolve_output_variant(variant, ctx, params, &params.unit_id)?;
                stdout_journal = js;
                fd
            }
        }
    };
    move_or_dup(stdout_fd, 1)
        .map_err(|e| step_err!(StepExitCode::Stdout, "failed to install stdout: {e}"))?;

    let mut stderr_journal = None;
    let stderr_fd = if let Some(fd) = params.stderr_fd {
        fd
    } else {
        match &ctx.io.std_error {
            ExecOutput::Inherit => {
                if outputs_are_shareable(&ctx.io.std_output, &ExecOutput::Inherit)
                    || matches!(ctx.io.std_output, ExecOutput::Inherit)
                {
                    crate::fd_plumbing::dup_fd(1)
                        .map_err(|e| step_err!(StepExitCode::Stderr, "dup stdout for stderr: {e}"))?
                } else {
                    let (fd, js) = resolve_output_variant(&ctx.io.std_output, ctx, params, &params.unit_id)?;
                    stderr_journal = js;
                    fd
                }
            }
            variant => {
                let (fd, js) = resolve_output_variant(variant, ctx, params, &params.unit_id)?;
                stderr_journal = js;
                fd
            }
        }
    };
    move_or_dup(stderr_fd, 2)
        .map_err(|e| step_err!(StepExitCode::Stderr, "failed to install stderr: {e}"))?;

    // Prefer stderr's journal-stream identity over stdout's, per §4.2.
    let journal_stream = stderr_journal.or(stdout_journal);

    Ok(StdioResult { journal_stream })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shareable_outputs_match_same_path() {
        let a = ExecOutput::File(Path::new("/tmp/x").to_path_buf());
        let b = ExecOutput::File(Path::new("/tmp/x").to_path_buf());
        let c = ExecOutput::File(Path::new("/tmp/y").to_path_buf());
        assert!(outputs_are_shareable(&a, &b));
        assert!(!outputs_are_shareable(&a, &c));
    }

    #[test]
    fn different_variants_are_not_shareable() {
        assert!(!outputs_are_shareable(&ExecOutput::Null, &ExecOutput::Tty));
    }
}
