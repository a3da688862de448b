//! C4 — ExecDirectory Manager (§4.4).
//!
//! Realises the five directory classes (`RuntimeDirectory=`, `StateDirectory=`,
//! ...) on disk ahead of the spawn: creation, dynamic-user private hosting
//! (and its reverse migration), mode/ownership application, and symlink
//! creation (immediate or deferred to after namespace setup).
//!
//! Grounded on the ownership-application pattern in
//! `entrypoints::exec_helper::run_exec_helper` (the `nix::unistd::chown`
//! calls around the credential directory) generalised to a full recursive
//! walk, since the teacher only ever chowns a single flat directory.

use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};

use crate::context::{DirectoryClass, DirectoryConfig, DirectoryItem};
use crate::error::{StepExitCode, StepResult};
use crate::step_err;

fn step_for(class: DirectoryClass) -> StepExitCode {
    match class {
        DirectoryClass::Runtime => StepExitCode::RuntimeDirectory,
        DirectoryClass::State => StepExitCode::StateDirectory,
        DirectoryClass::Cache => StepExitCode::CacheDirectory,
        DirectoryClass::Logs => StepExitCode::LogsDirectory,
        DirectoryClass::Configuration => StepExitCode::ConfigurationDirectory,
    }
}

/// Whether this class, for this item, gets hosted under `prefix/private/`
/// while dynamic-user mode is active (§4.4 step 2's predicate).
fn requires_private_hosting(class: DirectoryClass, dynamic_user: bool, preserve_mode: bool) -> bool {
    dynamic_user
        && class != DirectoryClass::Configuration
        && !(class == DirectoryClass::Runtime && !preserve_mode)
}

fn create_with_mode(path: &Path, mode: u32) -> StepResult<()> {
    fs::create_dir_all(path)
        .map_err(|e| step_err!(StepExitCode::StateDirectory, "mkdir -p {path:?} failed: {e}"))?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| step_err!(StepExitCode::StateDirectory, "chmod {path:?} failed: {e}"))
}

/// Ensures every ancestor of `path` up to (not including) `root` exists at
/// mode 0755, per "ancestors at 0755" in §4.4 step 1.
fn create_ancestors(root: &Path, path: &Path) -> StepResult<()> {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let mut cur = root.to_path_buf();
    for comp in relative.parent().into_iter().flat_map(Path::components) {
        cur.push(comp);
        if !cur.exists() {
            fs::create_dir(&cur)
                .map_err(|e| step_err!(StepExitCode::StateDirectory, "mkdir {cur:?} failed: {e}"))?;
            fs::set_permissions(&cur, fs::Permissions::from_mode(0o755)).ok();
        }
    }
    Ok(())
}

/// Recursively chowns `path` to `uid:gid`. When `strip_setid` is set
/// (dynamic-user mode), clears the setuid/setgid bits as it goes so a
/// reused numeric id can never inherit an unexpectedly privileged bit from
/// a previous occupant of that directory tree.
fn chown_recursive(path: &Path, uid: Uid, gid: Gid, strip_setid: bool) -> StepResult<()> {
    nix::unistd::chown(path, Some(uid), Some(gid))
        .map_err(|e| step_err!(StepExitCode::StateDirectory, "chown {path:?} failed: {e}"))?;

    let metadata = fs::symlink_metadata(path)
        .map_err(|e| step_err!(StepExitCode::StateDirectory, "stat {path:?} failed: {e}"))?;

    if strip_setid && metadata.is_file() {
        let mode = metadata.permissions().mode();
        let stripped = mode & !(libc::S_ISUID | libc::S_ISGID) as u32;
        if stripped != mode {
            fs::set_permissions(path, fs::Permissions::from_mode(stripped)).ok();
        }
    }

    if metadata.is_dir() {
        let entries = fs::read_dir(path)
            .map_err(|e| step_err!(StepExitCode::StateDirectory, "readdir {path:?} failed: {e}"))?;
        for entry in entries {
            let entry = entry
                .map_err(|e| step_err!(StepExitCode::StateDirectory, "readdir entry failed: {e}"))?;
            chown_recursive(&entry.path(), uid, gid, strip_setid)?;
        }
    }

    Ok(())
}

/// Creates `declared` symlinks pointing at `target`, replacing anything
/// already at that path.
fn create_symlinks(target: &Path, declared: &[PathBuf]) -> StepResult<()> {
    for link in declared {
        if let Ok(existing) = fs::symlink_metadata(link) {
            if existing.file_type().is_symlink() || existing.is_file() {
                fs::remove_file(link).ok();
            }
        }
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent).ok();
        }
        symlink(target, link)
            .map_err(|e| step_err!(StepExitCode::StateDirectory, "symlink {link:?} -> {target:?} failed: {e}"))?;
    }
    Ok(())
}

/// Migrates a directory tree from `from` to `to`, preferring a plain
/// rename (same filesystem) and falling back to a recursive copy+remove
/// when the private root lives on a different mount.
fn migrate_tree(from: &Path, to: &Path) -> StepResult<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).ok();
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            copy_tree(from, to)?;
            fs::remove_dir_all(from).ok();
            Ok(())
        }
        Err(e) => Err(step_err!(
            StepExitCode::StateDirectory,
            "migrating {from:?} to {to:?} failed: {e}"
        )),
    }
}

fn copy_tree(from: &Path, to: &Path) -> StepResult<()> {
    let metadata = fs::symlink_metadata(from)
        .map_err(|e| step_err!(StepExitCode::StateDirectory, "stat {from:?} failed: {e}"))?;
    if metadata.is_dir() {
        fs::create_dir_all(to)
            .map_err(|e| step_err!(StepExitCode::StateDirectory, "mkdir {to:?} failed: {e}"))?;
        for entry in fs::read_dir(from)
            .map_err(|e| step_err!(StepExitCode::StateDirectory, "readdir {from:?} failed: {e}"))?
        {
            let entry =
                entry.map_err(|e| step_err!(StepExitCode::StateDirectory, "readdir entry: {e}"))?;
            copy_tree(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        fs::copy(from, to)
            .map_err(|e| step_err!(StepExitCode::StateDirectory, "copy {from:?} -> {to:?} failed: {e}"))?;
    }
    Ok(())
}

/// Realises one directory item per the five-step algorithm in §4.4. `defer_symlinks`
/// is true when a mount namespace will be built later in the pipeline, in
/// which case declared symlinks are returned instead of created immediately.
pub fn realize_item(
    class: DirectoryClass,
    config: &DirectoryConfig,
    item: &DirectoryItem,
    prefix: &Path,
    uid: Uid,
    gid: Gid,
    dynamic_user: bool,
    defer_symlinks: bool,
) -> StepResult<Option<(PathBuf, Vec<PathBuf>)>> {
    let public_path = prefix.join(&item.path);
    create_ancestors(prefix, &public_path)?;

    let final_path = if requires_private_hosting(class, dynamic_user, config.preserve_mode) {
        let private_root = prefix.join("private");
        if !private_root.exists() {
            create_with_mode(&private_root, 0o700)?;
            nix::unistd::chown(&private_root, Some(Uid::from_raw(0)), Some(Gid::from_raw(0)))
                .map_err(|e| step_err!(step_for(class), "chown private root {private_root:?}: {e}"))?;
        }

        let private_path = private_root.join(&item.path);

        if public_path.exists() && !public_path.is_symlink() {
            migrate_tree(&public_path, &private_path)?;
        } else if !private_path.exists() {
            create_with_mode(&private_path, config.mode)?;
        }

        if !item.only_create {
            if public_path.exists() {
                fs::remove_file(&public_path)
                    .or_else(|_| fs::remove_dir_all(&public_path))
                    .ok();
            }
            symlink(&private_path, &public_path).map_err(|e| {
                step_err!(step_for(class), "symlink {public_path:?} -> {private_path:?}: {e}")
            })?;
        }

        private_path
    } else {
        // Reverse migration: a symlink into a private/ tree left over from a
        // prior dynamic-user configuration gets moved back out (§4.4 step 3).
        if let Ok(link_target) = fs::read_link(&public_path) {
            if link_target.starts_with(prefix.join("private")) {
                fs::remove_file(&public_path).ok();
                migrate_tree(&link_target, &public_path)?;
            }
        }

        if !public_path.exists() {
            create_with_mode(&public_path, config.mode)?;
        }

        public_path.clone()
    };

    fs::set_permissions(&final_path, fs::Permissions::from_mode(config.mode))
        .map_err(|e| step_err!(step_for(class), "chmod {final_path:?}: {e}"))?;
    chown_recursive(&final_path, uid, gid, dynamic_user)?;

    if defer_symlinks {
        Ok(Some((final_path, item.symlinks.clone())))
    } else {
        create_symlinks(&final_path, &item.symlinks)?;
        Ok(None)
    }
}

/// Realises every item across all five directory classes. Returns the
/// deferred symlink work (when `defer_symlinks` is set) so the namespace
/// builder (C7) can apply it once the mount namespace view is settled.
pub fn realize_all(
    directories: &std::collections::BTreeMap<DirectoryClass, DirectoryConfig>,
    prefixes: impl Fn(DirectoryClass) -> PathBuf,
    uid: Uid,
    gid: Gid,
    dynamic_user: bool,
    defer_symlinks: bool,
) -> StepResult<Vec<(PathBuf, Vec<PathBuf>)>> {
    let mut deferred = Vec::new();
    for (&class, config) in directories {
        let prefix = prefixes(class);
        for item in &config.items {
            if let Some(pending) = realize_item(
                class,
                config,
                item,
                &prefix,
                uid,
                gid,
                dynamic_user,
                defer_symlinks,
            )? {
                deferred.push(pending);
            }
        }
    }
    Ok(deferred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DirectoryConfig;

    fn root_required() -> bool {
        nix::unistd::getuid().is_root()
    }

    #[test]
    fn private_hosting_predicate_matches_documented_rule() {
        assert!(requires_private_hosting(DirectoryClass::State, true, true));
        assert!(!requires_private_hosting(DirectoryClass::Configuration, true, true));
        assert!(!requires_private_hosting(DirectoryClass::Runtime, true, false));
        assert!(requires_private_hosting(DirectoryClass::Runtime, true, true));
        assert!(!requires_private_hosting(DirectoryClass::State, false, true));
    }

    #[test]
    fn realize_item_creates_directory_with_configured_mode() {
        if !root_required() {
            return;
        }
        let tmp = std::env::temp_dir().join(format!("execore-test-{}", std::process::id()));
        let config = DirectoryConfig {
            mode: 0o750,
            preserve_mode: true,
            items: vec![],
        };
        let item = DirectoryItem {
            path: PathBuf::from("svc"),
            symlinks: vec![],
            only_create: false,
        };
        let result = realize_item(
            DirectoryClass::State,
            &config,
            &item,
            &tmp,
            nix::unistd::getuid(),
            nix::unistd::getgid(),
            false,
            false,
        );
        assert!(result.is_ok());
        fs::remove_dir_all(&tmp).ok();
    }
}
