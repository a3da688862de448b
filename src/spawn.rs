//! C10 — Parent Spawn (§4.10).
//!
//! Pre-fork preparation (resolving named fds, loading `EnvironmentFile=`
//! entries, composing the logged command line, pre-creating a `.control`
//! subcgroup), the fork itself, and the parent-side bookkeeping afterward
//! (cgroup move, `ExecStatus` recording).
//!
//! Grounded on `services::start_service::start_service_with_filedescriptors`,
//! which performs the same "resolve fds by name, load environment files,
//! fork, recover pid in the parent" sequence for `rustysd`'s simpler
//! non-sandboxed path; generalised here to dispatch into the full child
//! pipeline (C9) instead of re-executing a helper binary over shared memory
//! the way the teacher does (see DESIGN.md for why that indirection was
//! dropped).

use std::path::Path;

use nix::unistd::{Gid, Pid, Uid};

use crate::context::{ExecContext, ExecParameters, ExecStatus};
use crate::error::{StepExitCode, StepResult};
use crate::identity::ResolvedIdentity;
use crate::pipeline::Collaborators;
use crate::step_err;

/// Loads one `EnvironmentFile=`-style file: `KEY=VALUE` lines, blank lines
/// and `#`/`;` comments skipped, optional surrounding quotes stripped.
/// Matches `services::start_service`'s inline environment-file parser.
pub fn load_environment_file(path: &Path, optional: bool) -> Vec<(String, String)> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            if optional {
                log::trace!("optional environment file {path:?} not found: {e}");
            } else {
                log::warn!("failed to read environment file {path:?}: {e}");
            }
            return Vec::new();
        }
    };

    let mut vars = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_string();
        let value = value.trim();
        let value = if (value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\''))
        {
            value[1..value.len().saturating_sub(1)].to_string()
        } else {
            value.to_string()
        };
        vars.push((key, value));
    }
    vars
}

/// Resolves all `EnvironmentFile=` entries in order, later files and
/// `Environment=` overriding earlier ones — last-write-wins on key
/// collisions, matching how `start_service_with_filedescriptors` folds its
/// environment together.
#[must_use]
pub fn resolve_environment(
    base: &[(String, String)],
    environment_files: &[(std::path::PathBuf, bool)],
    environment: &[(String, String)],
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = base.to_vec();
    let mut set = |key: String, value: String| {
        env.retain(|(k, _)| *k != key);
        env.push((key, value));
    };

    for (path, optional) in environment_files {
        for (k, v) in load_environment_file(path, *optional) {
            set(k, v);
        }
    }
    for (k, v) in environment {
        set(k.clone(), v.clone());
    }
    env
}

/// Composes the command line as it would appear in a structured log
/// record (§4.10 "compose the command line for logging").
#[must_use]
pub fn format_command_line(cmd: &str, argv: &[String]) -> String {
    std::iter::once(cmd.to_string())
        .chain(argv.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Creates the `.control` subcgroup under `parent` when this invocation is
/// a control command and delegation is on (§4.10).
#[cfg(feature = "cgroups")]
pub fn maybe_create_control_subcgroup(
    parent: &Path,
    is_control: bool,
    delegate: bool,
) -> StepResult<Option<std::path::PathBuf>> {
    if !is_control || !delegate {
        return Ok(None);
    }
    let sub = parent.join(".control");
    crate::platform::cgroups::create_cgroup(&sub).map_err(|e| step_err!(StepExitCode::Cgroup, "{e}"))?;
    Ok(Some(sub))
}

/// Forks and dispatches: the child runs the full sandboxed pipeline (C9)
/// and never returns; the parent records the child's pid/start time into
/// `status` and, if a `.control` subcgroup was pre-created, moves the pid
/// into it (idempotent with whatever the child itself may already have
/// done in its own cgroup-delegation step).
pub fn fork_and_spawn(
    ctx: &ExecContext,
    params: &mut ExecParameters,
    cmd: &str,
    argv: &[String],
    collaborators: &mut Collaborators,
    status: &mut ExecStatus,
    control_subcgroup: Option<&Path>,
) -> StepResult<Pid> {
    match unsafe { nix::unistd::fork() } {
        Ok(nix::unistd::ForkResult::Child) => {
            crate::pipeline::run_sandboxed_child(ctx, params, cmd, argv, collaborators);
        }
        Ok(nix::unistd::ForkResult::Parent { child, .. }) => {
            status.record_start(child);
            #[cfg(feature = "cgroups")]
            if let Some(sub) = control_subcgroup {
                if let Err(e) = crate::platform::cgroups::move_pid_to_cgroup(sub, child) {
                    log::warn!("failed to move {child} into control subcgroup {sub:?}: {e}");
                }
            }
            #[cfg(not(feature = "cgroups"))]
            let _ = control_subcgroup;
            Ok(child)
        }
        Err(e) => Err(step_err!(StepExitCode::Fds, "fork failed: {e}")),
    }
}

/// Resolves `Uid`/`Gid` bookkeeping shared between directory-prefix
/// defaults and the identity resolver, used by callers assembling
/// `ExecParameters` ahead of a spawn.
#[must_use]
pub fn default_directory_owner(identity: &ResolvedIdentity, dynamic_user: bool) -> (Uid, Gid) {
    if dynamic_user {
        (identity.uid, identity.gid)
    } else {
        (Uid::from_raw(0), Gid::from_raw(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_file_parses_simple_assignments() {
        let dir = std::env::temp_dir().join(format!("execore-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("env");
        std::fs::write(&path, "# comment\nFOO=bar\nBAZ=\"quoted value\"\n\nignored-line-without-equals\n").unwrap();

        let vars = load_environment_file(&path, false);
        assert_eq!(vars, vec![
            ("FOO".to_string(), "bar".to_string()),
            ("BAZ".to_string(), "quoted value".to_string()),
        ]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_optional_environment_file_yields_empty_list() {
        let vars = load_environment_file(Path::new("/nonexistent/path/for/execore/tests"), true);
        assert!(vars.is_empty());
    }

    #[test]
    fn later_environment_entries_override_earlier_ones() {
        let base = vec![("A".to_string(), "1".to_string())];
        let env = resolve_environment(&base, &[], &[("A".to_string(), "2".to_string())]);
        assert_eq!(env.iter().find(|(k, _)| k == "A").map(|(_, v)| v.as_str()), Some("2"));
    }

    #[test]
    fn format_command_line_joins_argv_with_spaces() {
        assert_eq!(
            format_command_line("/bin/echo", &["hello".to_string(), "world".to_string()]),
            "/bin/echo hello world"
        );
    }
}
