//! C6 — ExecRuntime (§4.6).
//!
//! Reference-counted, cross-invocation state keyed by unit id: private
//! `/tmp`/`/var/tmp` trees and the socket pairs used to hand a netns/ipcns
//! fd between sibling invocations of the same unit. Lazily created on
//! first `acquire` that needs it, torn down asynchronously once the last
//! reference drops.
//!
//! The registry itself has no direct teacher analogue (`rustysd` has no
//! equivalent of systemd's per-unit runtime object), so it's grounded in
//! the reference-counted `FDStore`-style registry pattern `rustysd` uses
//! elsewhere for shared socket-activation fds (`sockets::mod` — excluded
//! from this crate as out of scope, but its "a map keyed by name, entries
//! refcounted, sockets stored as raw fds" shape is exactly this module's
//! shape) and in the data layout spec'd directly in the glossary's
//! `ExecRuntime` entry.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::sys::socket::{self, AddressFamily, SockFlag, SockType};
use nix::sys::stat::Mode;
use nix::unistd;

use crate::error::{StepExitCode, StepResult};
use crate::step_err;

/// Sentinel path meaning "no private tmp tree"; never removed on destroy.
pub const EMPTY_SENTINEL: &str = "empty";

/// What an `acquire` call needs the runtime to provide, derived from the
/// context's filesystem/namespace settings.
#[derive(Clone, Copy, Debug, Default)]
pub struct RuntimeRequirements {
    pub private_tmp: bool,
    pub private_network: bool,
    pub private_ipc: bool,
    pub explicit_netns_path: bool,
}

impl RuntimeRequirements {
    #[must_use]
    pub fn needs_runtime(self) -> bool {
        self.private_tmp || self.private_network || self.private_ipc || self.explicit_netns_path
    }
}

/// One socket pair's two ends, used to hand a netns/ipcns fd between
/// sibling invocations via the peek-and-replace protocol (§4.6).
struct NsSocketPair {
    ends: [RawFd; 2],
}

impl NsSocketPair {
    fn new() -> StepResult<Self> {
        let (a, b) = socket::socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::empty(),
        )
        .map_err(|e| step_err!(StepExitCode::Namespace, "socketpair() failed: {e}"))?;
        let raw_a = a.as_raw_fd();
        let raw_b = b.as_raw_fd();
        std::mem::forget(a);
        std::mem::forget(b);
        Ok(Self {
            ends: [raw_a, raw_b],
        })
    }
}

impl Drop for NsSocketPair {
    fn drop(&mut self) {
        for fd in self.ends {
            let _ = unistd::close(fd);
        }
    }
}

/// Cross-invocation state for one unit (§4.6 glossary entry).
pub struct ExecRuntime {
    pub unit_id: String,
    refcount: u32,
    pub tmp_dir: Option<PathBuf>,
    pub var_tmp_dir: Option<PathBuf>,
    netns_sockets: Option<NsSocketPair>,
    ipcns_sockets: Option<NsSocketPair>,
}

impl ExecRuntime {
    /// Serializes this entry as a single reexec line, per §4.6: unknown
    /// tokens are tolerated by whatever parses it back, so this format is
    /// intentionally permissive.
    #[must_use]
    pub fn serialize(&self, fd_index: &mut dyn FnMut(RawFd) -> usize) -> String {
        let mut line = format!("exec-runtime={}", self.unit_id);
        if let Some(tmp) = &self.tmp_dir {
            line.push_str(&format!(" tmp-dir={}", tmp.display()));
        }
        if let Some(var_tmp) = &self.var_tmp_dir {
            line.push_str(&format!(" var-tmp-dir={}", var_tmp.display()));
        }
        if let Some(pair) = &self.netns_sockets {
            line.push_str(&format!(
                " netns-socket-0={} netns-socket-1={}",
                fd_index(pair.ends[0]),
                fd_index(pair.ends[1])
            ));
        }
        if let Some(pair) = &self.ipcns_sockets {
            line.push_str(&format!(
                " ipcns-socket-0={} ipcns-socket-1={}",
                fd_index(pair.ends[0]),
                fd_index(pair.ends[1])
            ));
        }
        line
    }

    /// Takes the netns fd for the caller's exclusive use. Implements the
    /// "peek, then put back" protocol from §4.6: the fd is received out of
    /// the socket pair and a fresh duplicate is immediately written back so
    /// a later sibling can still find one there.
    pub fn take_netns_fd(&mut self) -> StepResult<Option<RawFd>> {
        self.take_ns_fd(true)
    }

    pub fn take_ipcns_fd(&mut self) -> StepResult<Option<RawFd>> {
        self.take_ns_fd(false)
    }

    fn take_ns_fd(&mut self, net: bool) -> StepResult<Option<RawFd>> {
        let Some(pair) = (if net {
            &self.netns_sockets
        } else {
            &self.ipcns_sockets
        }) else {
            return Ok(None);
        };

        let recv_fd = pair.ends[0];
        let taken = recv_one_fd(recv_fd)
            .map_err(|e| step_err!(StepExitCode::Namespace, "recvmsg(MSG_PEEK) failed: {e}"))?;

        let Some(fd) = taken else {
            return Ok(None);
        };

        // "Take, then put back" — duplicate before handing the original to
        // the caller, and send the duplicate back down the pair so the
        // fd remains available to any future sibling (§4.6).
        let dup = unistd::dup(fd)
            .map_err(|e| step_err!(StepExitCode::Namespace, "dup of namespace fd failed: {e}"))?;
        send_one_fd(pair.ends[1], dup)
            .map_err(|e| step_err!(StepExitCode::Namespace, "putting namespace fd back failed: {e}"))?;

        Ok(Some(fd))
    }
}

/// A reexec line parsed back out by `parse_reexec_line`, before its fd
/// tokens have been resolved against the actual fd array the manager
/// reexec handed over.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedExecRuntime {
    pub unit_id: String,
    pub tmp_dir: Option<PathBuf>,
    pub var_tmp_dir: Option<PathBuf>,
    pub netns_socket_indices: Option<(usize, usize)>,
    pub ipcns_socket_indices: Option<(usize, usize)>,
}

/// Parses one `serialize()`d line back into its fields. Tolerates lines
/// that predate IPC-namespace sharing (no `ipcns-socket-*` tokens) and any
/// other unrecognised token, per §9's compatibility note: new
/// serialisations always write both namespace-socket pairs, but old ones
/// may be missing either or both, and that must not be treated as an error.
#[must_use]
pub fn parse_reexec_line(line: &str) -> Option<ParsedExecRuntime> {
    let mut tokens = line.split_whitespace();
    let first = tokens.next()?;
    let unit_id = first.strip_prefix("exec-runtime=")?.to_string();

    let mut parsed = ParsedExecRuntime {
        unit_id,
        ..Default::default()
    };
    let mut netns = [None; 2];
    let mut ipcns = [None; 2];

    for token in tokens {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        match key {
            "tmp-dir" => parsed.tmp_dir = Some(PathBuf::from(value)),
            "var-tmp-dir" => parsed.var_tmp_dir = Some(PathBuf::from(value)),
            "netns-socket-0" => netns[0] = value.parse::<usize>().ok(),
            "netns-socket-1" => netns[1] = value.parse::<usize>().ok(),
            "ipcns-socket-0" => ipcns[0] = value.parse::<usize>().ok(),
            "ipcns-socket-1" => ipcns[1] = value.parse::<usize>().ok(),
            // Unknown tokens (future fields from a newer version) are
            // tolerated silently, per §4.6's own stated format contract.
            _ => {}
        }
    }

    parsed.netns_socket_indices = netns[0].zip(netns[1]);
    parsed.ipcns_socket_indices = ipcns[0].zip(ipcns[1]);
    Some(parsed)
}

fn recv_one_fd(sock: RawFd) -> nix::Result<Option<RawFd>> {
    use nix::sys::socket::{ControlMessageOwned, MsgFlags};
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
    let mut data_buf = [0u8; 8];
    let mut iov = [std::io::IoSliceMut::new(&mut data_buf)];
    let message = socket::recvmsg::<()>(
        sock,
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::MSG_DONTWAIT,
    )?;
    for cmsg in message.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                return Ok(Some(fd));
            }
        }
    }
    Ok(None)
}

fn send_one_fd(sock: RawFd, fd: RawFd) -> nix::Result<()> {
    use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    let data = [0u8; 8];
    let iov = [std::io::IoSlice::new(&data)];
    sendmsg::<()>(sock, &iov, &cmsg, MsgFlags::empty(), None)?;
    Ok(())
}

fn create_private_tmp_tree(root: &Path) -> StepResult<()> {
    std::fs::create_dir_all(root)
        .map_err(|e| step_err!(StepExitCode::Namespace, "mkdir {root:?} failed: {e}"))?;
    let tmp_subdir = root.join("tmp");
    std::fs::create_dir_all(&tmp_subdir)
        .map_err(|e| step_err!(StepExitCode::Namespace, "mkdir {tmp_subdir:?} failed: {e}"))?;
    nix::sys::stat::fchmodat(
        None,
        &tmp_subdir,
        Mode::from_bits_truncate(0o1777),
        nix::sys::stat::FchmodatFlags::FollowSymlink,
    )
    .map_err(|e| step_err!(StepExitCode::Namespace, "chmod {tmp_subdir:?} failed: {e}"))?;
    Ok(())
}

/// The unit-id-keyed, refcounted registry (§4.6).
#[derive(Default)]
pub struct ExecRuntimeRegistry {
    entries: HashMap<String, ExecRuntime>,
}

impl ExecRuntimeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `acquire(id, requirements, create)`: increments and returns an
    /// existing entry; otherwise, if `create` and the requirements call
    /// for it, allocates a fresh one and registers it.
    pub fn acquire(
        &mut self,
        unit_id: &str,
        requirements: RuntimeRequirements,
        create: bool,
        runtime_root: &Path,
    ) -> StepResult<Option<&ExecRuntime>> {
        if let Some(entry) = self.entries.get_mut(unit_id) {
            entry.refcount += 1;
            return Ok(Some(&self.entries[unit_id]));
        }

        if !create || !requirements.needs_runtime() {
            return Ok(None);
        }

        let tmp_dir = runtime_root.join(format!("exec-runtime-{unit_id}-tmp"));
        let var_tmp_dir = runtime_root.join(format!("exec-runtime-{unit_id}-var-tmp"));
        create_private_tmp_tree(&tmp_dir)?;
        create_private_tmp_tree(&var_tmp_dir)?;

        let netns_sockets = requirements
            .private_network
            .then(NsSocketPair::new)
            .transpose()?;
        let ipcns_sockets = requirements
            .private_ipc
            .then(NsSocketPair::new)
            .transpose()?;

        let entry = ExecRuntime {
            unit_id: unit_id.to_string(),
            refcount: 1,
            tmp_dir: Some(tmp_dir),
            var_tmp_dir: Some(var_tmp_dir),
            netns_sockets,
            ipcns_sockets,
        };
        self.entries.insert(unit_id.to_string(), entry);
        Ok(self.entries.get(unit_id))
    }

    /// Drops one reference; when it reaches zero, removes the entry and
    /// spawns a detached worker thread to recursively remove the tmp
    /// trees (unless they are the `empty` sentinel), so destruction never
    /// blocks the caller (§4.6, spec.md line 139).
    pub fn release(&mut self, unit_id: &str, destroy: bool) {
        let Some(entry) = self.entries.get_mut(unit_id) else {
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount > 0 {
            return;
        }
        let entry = self.entries.remove(unit_id).unwrap();
        if destroy {
            spawn_async_cleanup(entry.tmp_dir);
            spawn_async_cleanup(entry.var_tmp_dir);
        }
        // netns_sockets/ipcns_sockets are closed unconditionally via Drop.
    }
}

fn spawn_async_cleanup(dir: Option<PathBuf>) {
    let Some(dir) = dir else { return };
    if dir.as_os_str() == EMPTY_SENTINEL {
        return;
    }
    std::thread::spawn(move || {
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            log::warn!("failed to clean up exec-runtime tree {dir:?}: {e}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requirements_with_nothing_set_does_not_need_runtime() {
        assert!(!RuntimeRequirements::default().needs_runtime());
    }

    #[test]
    fn private_tmp_alone_triggers_runtime_creation() {
        let reqs = RuntimeRequirements {
            private_tmp: true,
            ..Default::default()
        };
        assert!(reqs.needs_runtime());
    }

    #[test]
    fn empty_sentinel_path_is_never_removed() {
        let path = PathBuf::from(EMPTY_SENTINEL);
        assert_eq!(path.as_os_str(), EMPTY_SENTINEL);
    }

    #[test]
    fn acquire_without_create_for_unknown_unit_returns_none() {
        let mut registry = ExecRuntimeRegistry::new();
        let result = registry.acquire(
            "my.service",
            RuntimeRequirements::default(),
            false,
            Path::new("/tmp"),
        );
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn parse_round_trips_a_full_line() {
        let line = "exec-runtime=my.service tmp-dir=/run/execore/my.service/tmp \
                     var-tmp-dir=/run/execore/my.service/var-tmp \
                     netns-socket-0=3 netns-socket-1=4 ipcns-socket-0=5 ipcns-socket-1=6";
        let parsed = parse_reexec_line(line).expect("line parses");
        assert_eq!(parsed.unit_id, "my.service");
        assert_eq!(parsed.tmp_dir, Some(PathBuf::from("/run/execore/my.service/tmp")));
        assert_eq!(parsed.netns_socket_indices, Some((3, 4)));
        assert_eq!(parsed.ipcns_socket_indices, Some((5, 6)));
    }

    #[test]
    fn parse_tolerates_a_legacy_line_with_no_ipcns_tokens() {
        let line = "exec-runtime=old.service tmp-dir=/run/execore/old.service/tmp \
                     netns-socket-0=3 netns-socket-1=4";
        let parsed = parse_reexec_line(line).expect("legacy line still parses");
        assert_eq!(parsed.unit_id, "old.service");
        assert_eq!(parsed.netns_socket_indices, Some((3, 4)));
        assert_eq!(parsed.ipcns_socket_indices, None);
    }

    #[test]
    fn parse_tolerates_a_bare_line_with_only_the_unit_id() {
        let parsed = parse_reexec_line("exec-runtime=bare.service").expect("bare line parses");
        assert_eq!(parsed.unit_id, "bare.service");
        assert_eq!(parsed.tmp_dir, None);
        assert_eq!(parsed.netns_socket_indices, None);
        assert_eq!(parsed.ipcns_socket_indices, None);
    }

    #[test]
    fn parse_rejects_a_line_missing_the_exec_runtime_token() {
        assert!(parse_reexec_line("tmp-dir=/run/execore/x/tmp").is_none());
    }
}
