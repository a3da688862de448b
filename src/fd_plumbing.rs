//! C1 — Fd Plumbing (§4.1).
//!
//! Shifts an array of to-be-passed fds so they are contiguous starting at
//! descriptor 3 (the slots below 3 are stdin/stdout/stderr, wired up
//! separately by C2), clears `FD_CLOEXEC` on all of them, and optionally
//! toggles `O_NONBLOCK` on the socket-activation prefix.

use std::os::unix::io::RawFd;

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::unistd::{close, dup};

use crate::error::{StepExitCode, StepResult};
use crate::step_err;

/// The first descriptor number fds are shifted to. 0/1/2 are reserved for
/// stdio, which C2 wires up independently.
pub const FIRST_PASSED_FD: RawFd = 3;

/// Duplicate `fd` to the lowest currently-free descriptor `>= floor`.
fn dup_to_floor(fd: RawFd, floor: RawFd) -> nix::Result<RawFd> {
    // F_DUPFD returns the lowest free descriptor >= floor in one call, so
    // there's no need to probe or close candidates below floor ourselves.
    use std::os::unix::io::BorrowedFd;
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    fcntl(borrowed, FcntlArg::F_DUPFD(floor))
}

/// Implements the *shift* algorithm from §4.1: repeatedly scan the array;
/// for each entry at index `i` whose value is not `i + FIRST_PASSED_FD`,
/// duplicate it to the lowest free descriptor `>= i + FIRST_PASSED_FD`,
/// close the original, and record the new value. If a dup lands higher than
/// requested (slot busy), remember the earliest such index and restart the
/// scan from there. Each pass places at least one more fd at its final
/// slot, so the loop terminates.
pub fn shift_fds(fds: &mut [RawFd]) -> StepResult<()> {
    let mut restart_from = 0usize;
    loop {
        let mut progressed = false;
        let mut next_restart: Option<usize> = None;

        for i in restart_from..fds.len() {
            let target = i as RawFd + FIRST_PASSED_FD;
            if fds[i] == target {
                continue;
            }

            let new_fd = dup_to_floor(fds[i], target).map_err(|e| {
                step_err!(
                    StepExitCode::Fds,
                    "failed to duplicate fd {} to >= {}: {}",
                    fds[i],
                    target,
                    e
                )
            })?;
            close(fds[i]).ok();
            fds[i] = new_fd;
            progressed = true;

            if new_fd != target && next_restart.is_none() {
                next_restart = Some(i);
            }
        }

        if let Some(idx) = next_restart {
            restart_from = idx;
            continue;
        }

        if !progressed || fds.iter().enumerate().all(|(i, &fd)| fd == i as RawFd + FIRST_PASSED_FD)
        {
            break;
        }
    }
    Ok(())
}

/// Clears `FD_CLOEXEC` on every fd in `fds` so they survive `execve`.
pub fn clear_cloexec(fds: &[RawFd]) -> StepResult<()> {
    use std::os::unix::io::BorrowedFd;
    for &fd in fds {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let current = fcntl(borrowed, FcntlArg::F_GETFD())
            .map_err(|e| step_err!(StepExitCode::Fds, "F_GETFD on fd {fd} failed: {e}"))?;
        let mut flags = FdFlag::from_bits_truncate(current);
        flags.remove(FdFlag::FD_CLOEXEC);
        fcntl(borrowed, FcntlArg::F_SETFD(flags))
            .map_err(|e| step_err!(StepExitCode::Fds, "F_SETFD on fd {fd} failed: {e}"))?;
    }
    Ok(())
}

/// Toggles `O_NONBLOCK` on the given prefix of `fds` (the socket-activation
/// fds), per whatever `NonBlocking=` requested.
pub fn set_nonblocking(fds: &[RawFd], nonblocking: bool) -> StepResult<()> {
    use std::os::unix::io::BorrowedFd;
    for &fd in fds {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let current = fcntl(borrowed, FcntlArg::F_GETFL())
            .map_err(|e| step_err!(StepExitCode::Fds, "F_GETFL on fd {fd} failed: {e}"))?;
        let mut flags = OFlag::from_bits_truncate(current);
        flags.set(OFlag::O_NONBLOCK, nonblocking);
        fcntl(borrowed, FcntlArg::F_SETFL(flags))
            .map_err(|e| step_err!(StepExitCode::Fds, "F_SETFL on fd {fd} failed: {e}"))?;
    }
    Ok(())
}

/// Duplicates the open fd at `src` onto exactly descriptor `dst`, closing
/// `src` afterwards iff `src != dst`. Used by C2 to re-home resolved stdio
/// fds to descriptors 0/1/2.
pub fn move_or_dup(src: RawFd, dst: RawFd) -> nix::Result<()> {
    if src == dst {
        return Ok(());
    }
    use std::os::unix::io::BorrowedFd;
    let src_borrowed = unsafe { BorrowedFd::borrow_raw(src) };
    nix::unistd::dup2(src_borrowed.as_raw_fd(), dst)?;
    close(src)?;
    Ok(())
}

use std::os::unix::io::AsRawFd;

/// Duplicates `fd`, returning a fresh descriptor pointing at the same open
/// file description. Thin wrapper kept so callers don't need to import
/// `nix::unistd::dup` directly (matches the small-helper style `exec_helper.rs`
/// uses for raw fd bookkeeping).
pub fn dup_fd(fd: RawFd) -> nix::Result<RawFd> {
    use std::os::unix::io::BorrowedFd;
    dup(unsafe { BorrowedFd::borrow_raw(fd) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;
    use std::os::unix::io::IntoRawFd;

    #[test]
    fn shift_places_fds_contiguously_from_three() {
        // Build a handful of throwaway pipe fds, deliberately out of order
        // and overlapping with the target range, and confirm shift_fds
        // settles them at 3, 4, 5, ... with no duplicates.
        let mut raw = Vec::new();
        for _ in 0..4 {
            let (r, w) = pipe().unwrap();
            raw.push(r.into_raw_fd());
            close(w.into_raw_fd()).ok();
        }

        shift_fds(&mut raw).unwrap();

        for (i, &fd) in raw.iter().enumerate() {
            assert_eq!(fd, i as RawFd + FIRST_PASSED_FD);
        }

        for &fd in &raw {
            close(fd).ok();
        }
    }

    #[test]
    fn already_placed_fds_are_left_alone() {
        // An empty array is trivially already "shifted".
        let mut raw: Vec<RawFd> = Vec::new();
        shift_fds(&mut raw).unwrap();
        assert!(raw.is_empty());
    }
}
