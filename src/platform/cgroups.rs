//! Minimal cgroup v2 plumbing used by the sandbox-application step that
//! moves the child into its unit's cgroup and, when delegation is
//! requested, hands the subtree to the invoked user (§4.8 step "cgroup").
//!
//! Grounded on `services::fork_os_specific::{pre_fork_os_specific,
//! post_fork_os_specific}`: that code creates the cgroup directory, chowns
//! it for `Delegate=`, and writes the current pid into `cgroup.procs`. This
//! module is the same three operations, generalised to the full directory
//! model (§4.4) instead of the teacher's single hardcoded `cgroup_path` field.

use std::path::Path;

/// Creates `path` (and any missing parents) as a cgroup directory.
pub fn create_cgroup(path: &Path) -> Result<(), String> {
    std::fs::create_dir_all(path)
        .map_err(|e| format!("couldn't create cgroup {path:?}: {e}"))
}

/// Chowns the cgroup directory and its `cgroup.procs`/`cgroup.subtree_control`
/// control files to `uid:gid`, matching what `Delegate=yes` needs so the
/// invoked process can manage its own sub-cgroup hierarchy.
pub fn delegate_cgroup(
    path: &Path,
    uid: nix::unistd::Uid,
    gid: nix::unistd::Gid,
) -> Result<(), String> {
    nix::unistd::chown(path, Some(uid), Some(gid))
        .map_err(|e| format!("couldn't chown cgroup {path:?} to {uid}:{gid}: {e}"))?;
    for leaf in ["cgroup.procs", "cgroup.subtree_control", "cgroup.threads"] {
        let leaf_path = path.join(leaf);
        if leaf_path.exists() {
            nix::unistd::chown(&leaf_path, Some(uid), Some(gid)).map_err(|e| {
                format!("couldn't chown {leaf_path:?} to {uid}:{gid}: {e}")
            })?;
        }
    }
    Ok(())
}

/// Writes the calling process's pid into `<path>/cgroup.procs`, moving it
/// into that cgroup. Run after fork, before the rest of the sandbox steps.
pub fn move_self_to_cgroup(path: &Path) -> Result<(), String> {
    let pid = nix::unistd::getpid();
    move_pid_to_cgroup(path, pid)
}

pub fn move_pid_to_cgroup(path: &Path, pid: nix::unistd::Pid) -> Result<(), String> {
    let procs_file = path.join("cgroup.procs");
    std::fs::write(&procs_file, pid.to_string())
        .map_err(|e| format!("couldn't write pid {pid} into {procs_file:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_cgroup_rejects_unwritable_root() {
        let bogus = Path::new("/proc/self/this-does-not-exist/cgroup-child");
        assert!(create_cgroup(bogus).is_err());
    }
}
