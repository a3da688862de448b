//! C5 — Credential Store (§4.5).
//!
//! Loads and decrypts per-unit credentials and publishes them under
//! `prefix[Runtime]/credentials/<unit>/<id>`. The privileged part of the
//! mount protocol (private mount namespace, ramfs/tmpfs overmount,
//! move-mount into place) is owned by the namespace builder (C7); this
//! module prepares the workspace contents and exposes the write protocol,
//! acquisition loop, and decryption retry policy that run regardless of
//! which mount strategy C7 ends up using.
//!
//! Grounded on the write-then-chown pattern in
//! `entrypoints::exec_helper::setup_credentials` (randomised temp name,
//! `fchmod`, rename into place, chown to the service uid/gid), generalised
//! to the full load/set acquisition loop and the ACL-or-chown tightening
//! step §4.5 describes.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, UnixAddr};
use nix::unistd::{Gid, Uid};
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::context::{CredentialConfig, Credential};
use crate::error::{StepExitCode, StepResult};
use crate::step_err;

/// Cumulative size cap across every credential published to one unit.
pub const CREDENTIALS_TOTAL_SIZE_MAX: usize = 1024 * 1024;
/// Per-credential cap for plaintext `SetCredential=`/`LoadCredential=` input.
pub const CREDENTIAL_SIZE_MAX: usize = 1024 * 1024;
/// Per-credential cap for encrypted input, which is bulkier on the wire
/// (base64 plus the TPM/FIDO2 envelope) before it is unsealed.
pub const CREDENTIAL_ENCRYPTED_SIZE_MAX: usize = 1024 * 1024 * 1024 / 2;

/// Maximum number of retries for a transient TPM `PCR_CHANGED` failure
/// during credential decryption (§7 "Transient" error class).
const TPM_PCR_CHANGED_MAX_RETRIES: u32 = 30;

/// The decryption/unsealing primitive is an external collaborator (TPM2,
/// FIDO2 token, or a no-op passthrough for testing); this crate only owns
/// the retry policy and the base64/size-cap bookkeeping around it.
pub trait DecryptionBackend {
    /// Attempts one unseal of `ciphertext`. Returns `Err(true)` for a
    /// transient failure worth retrying (TPM `PCR_CHANGED`), `Err(false)`
    /// for anything else.
    fn try_decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, bool>;
}

/// A backend that treats its input as already-plaintext, used by tests and
/// by deployments with no TPM/FIDO2 sealing configured.
pub struct PassthroughBackend;

impl DecryptionBackend for PassthroughBackend {
    fn try_decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, bool> {
        Ok(ciphertext.to_vec())
    }
}

fn decrypt_with_retry(
    backend: &mut dyn DecryptionBackend,
    ciphertext: &[u8],
) -> StepResult<Vec<u8>> {
    for attempt in 0..=TPM_PCR_CHANGED_MAX_RETRIES {
        match backend.try_decrypt(ciphertext) {
            Ok(plaintext) => return Ok(plaintext),
            Err(true) if attempt < TPM_PCR_CHANGED_MAX_RETRIES => continue,
            Err(_) => {
                return Err(step_err!(
                    StepExitCode::Credentials,
                    "credential decryption failed after {} attempt(s)",
                    attempt + 1
                ))
            }
        }
    }
    unreachable!()
}

/// Search path for a relative `LoadCredential=` name, in priority order
/// (§4.5). Encrypted search paths only apply when the entry requests
/// encryption.
fn search_paths(received_credentials_dir: Option<&Path>, encrypted: bool) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(dir) = received_credentials_dir {
        paths.push(dir.to_path_buf());
    }
    for base in ["/etc/credstore", "/run/credstore", "/usr/lib/credstore"] {
        paths.push(PathBuf::from(base));
        if encrypted {
            paths.push(PathBuf::from(format!("{base}.encrypted")));
        }
    }
    paths
}

fn resolve_relative_credential(
    name: &str,
    received_credentials_dir: Option<&Path>,
    encrypted: bool,
) -> Option<PathBuf> {
    search_paths(received_credentials_dir, encrypted)
        .into_iter()
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.exists())
}

/// Reads a plain file, enforcing the appropriate size cap.
fn read_capped(path: &Path, encrypted: bool) -> StepResult<Vec<u8>> {
    let cap = if encrypted {
        CREDENTIAL_ENCRYPTED_SIZE_MAX
    } else {
        CREDENTIAL_SIZE_MAX
    };
    let metadata = fs::metadata(path)
        .map_err(|e| step_err!(StepExitCode::Credentials, "stat {path:?} failed: {e}"))?;
    if metadata.len() as usize > cap {
        return Err(step_err!(
            StepExitCode::Credentials,
            "{path:?} is {} bytes, exceeds the {} byte cap",
            metadata.len(),
            cap
        ));
    }
    fs::read(path).map_err(|e| step_err!(StepExitCode::Credentials, "read {path:?} failed: {e}"))
}

/// Reads from an `AF_UNIX` socket, connecting with the
/// `@<random>/unit/<unit>/<id>` bindname so a credential service can
/// authenticate the peer (§4.5).
fn read_from_socket(path: &Path, unit: &str, id: &str) -> StepResult<Vec<u8>> {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    let bindname = format!("@{suffix}/unit/{unit}/{id}");

    let sock = socket::socket(AddressFamily::Unix, SockType::Stream, SockFlag::empty(), None)
        .map_err(|e| step_err!(StepExitCode::Credentials, "socket() failed: {e}"))?;

    if let Ok(local) = UnixAddr::new_abstract(bindname.trim_start_matches('@').as_bytes()) {
        let _ = socket::bind(std::os::fd::AsRawFd::as_raw_fd(&sock), &local);
    }

    let addr = UnixAddr::new(path)
        .map_err(|e| step_err!(StepExitCode::Credentials, "bad credential socket path {path:?}: {e}"))?;
    socket::connect(std::os::fd::AsRawFd::as_raw_fd(&sock), &addr)
        .map_err(|e| step_err!(StepExitCode::Credentials, "connect({path:?}) failed: {e}"))?;

    use std::io::Read;
    let mut file = fs::File::from(sock);
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|e| step_err!(StepExitCode::Credentials, "recv from {path:?} failed: {e}"))?;
    if buf.len() > CREDENTIAL_SIZE_MAX {
        return Err(step_err!(
            StepExitCode::Credentials,
            "credential received over {path:?} exceeds the size cap"
        ));
    }
    Ok(buf)
}

/// Derives a child credential id from a directory-recursion path, per
/// "path-to-underscore substitution" in §4.5.
fn path_to_underscore_id(root: &Path, entry: &Path) -> String {
    entry
        .strip_prefix(root)
        .unwrap_or(entry)
        .to_string_lossy()
        .replace(['/', '\\'], "_")
}

/// Recurses into a directory `LoadCredential=` target, sorted and skipping
/// dot-prefixed entries, collecting `(id, bytes)` pairs.
fn recurse_directory(
    root: &Path,
    dir: &Path,
    encrypted: bool,
    out: &mut Vec<(String, Vec<u8>)>,
) -> StepResult<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .map_err(|e| step_err!(StepExitCode::Credentials, "readdir {dir:?} failed: {e}"))?
        .filter_map(Result::ok)
        .collect();
    entries.sort_by_key(std::fs::DirEntry::file_name);

    for entry in entries {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| step_err!(StepExitCode::Credentials, "readdir entry type: {e}"))?;
        if file_type.is_dir() {
            recurse_directory(root, &path, encrypted, out)?;
        } else {
            let bytes = read_capped(&path, encrypted)?;
            out.push((path_to_underscore_id(root, &path), bytes));
        }
    }
    Ok(())
}

/// Runs the acquisition loop (§4.5 step 1-2) and returns the materialised
/// credential list, ready for the write protocol.
pub fn acquire(
    unit: &str,
    config: &CredentialConfig,
    received_credentials_dir: Option<&Path>,
    backend: &mut dyn DecryptionBackend,
) -> StepResult<Vec<Credential>> {
    let mut written_ids: BTreeSet<String> = BTreeSet::new();
    let mut credentials = Vec::new();
    let mut total_size = 0usize;

    if !config.import_credentials.is_empty() {
        for dir in search_paths(received_credentials_dir, false) {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            let mut names: Vec<_> = entries
                .filter_map(Result::ok)
                .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            for name in names {
                if written_ids.contains(&name) {
                    continue;
                }
                if !config.import_credentials.iter().any(|pattern| import_glob_matches(pattern, &name)) {
                    continue;
                }
                let bytes = read_capped(&dir.join(&name), false)?;
                total_size += bytes.len();
                if total_size > CREDENTIALS_TOTAL_SIZE_MAX {
                    return Err(step_err!(
                        StepExitCode::Credentials,
                        "credential store for {unit:?} exceeds CREDENTIALS_TOTAL_SIZE_MAX"
                    ));
                }
                written_ids.insert(name.clone());
                credentials.push(Credential { id: name, bytes });
            }
        }
    }

    for (id, load) in &config.load_credentials {
        if written_ids.contains(id) {
            continue;
        }

        let resolved: Option<Vec<(String, Vec<u8>)>> = if load.path.is_absolute() {
            if load.path.is_dir() {
                let mut collected = Vec::new();
                recurse_directory(&load.path, &load.path, load.encrypted, &mut collected)?;
                Some(collected)
            } else {
                match fs::metadata(&load.path) {
                    Ok(meta) if is_socket(&meta) => {
                        Some(vec![(id.clone(), read_from_socket(&load.path, unit, id)?)])
                    }
                    Ok(_) => Some(vec![(id.clone(), read_capped(&load.path, load.encrypted)?)]),
                    Err(_) => None,
                }
            }
        } else {
            resolve_relative_credential(
                load.path.to_string_lossy().as_ref(),
                received_credentials_dir,
                load.encrypted,
            )
            .map(|p| read_capped(&p, load.encrypted).map(|bytes| vec![(id.clone(), bytes)]))
            .transpose()?
        };

        let Some(items) = resolved else {
            // Missing inherited credentials are non-fatal iff a fallback
            // set-credential exists for the same id (§4.5 step 1).
            if config.set_credentials.contains_key(id) {
                continue;
            }
            return Err(step_err!(
                StepExitCode::Credentials,
                "credential {id:?} could not be resolved and has no set-credential fallback"
            ));
        };

        for (item_id, raw) in items {
            if written_ids.contains(&item_id) {
                continue;
            }
            let bytes = if load.encrypted {
                decrypt_with_retry(backend, &raw)?
            } else {
                raw
            };
            total_size += bytes.len();
            if total_size > CREDENTIALS_TOTAL_SIZE_MAX {
                return Err(step_err!(
                    StepExitCode::Credentials,
                    "credential store for {unit:?} exceeds CREDENTIALS_TOTAL_SIZE_MAX"
                ));
            }
            written_ids.insert(item_id.clone());
            credentials.push(Credential {
                id: item_id,
                bytes,
            });
        }
    }

    for (id, set) in &config.set_credentials {
        if written_ids.contains(id) {
            continue;
        }
        let raw = if set.encrypted {
            let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &set.data)
                .map_err(|e| step_err!(StepExitCode::Credentials, "bad base64 for credential {id:?}: {e}"))?;
            decrypt_with_retry(backend, &decoded)?
        } else {
            set.data.clone()
        };
        total_size += raw.len();
        if total_size > CREDENTIALS_TOTAL_SIZE_MAX {
            return Err(step_err!(
                StepExitCode::Credentials,
                "credential store for {unit:?} exceeds CREDENTIALS_TOTAL_SIZE_MAX"
            ));
        }
        written_ids.insert(id.clone());
        credentials.push(Credential {
            id: id.clone(),
            bytes: raw,
        });
    }

    Ok(credentials)
}

#[cfg(target_os = "linux")]
fn is_socket(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    meta.file_type().is_socket()
}

/// Write protocol (§4.5): temp name in the same directory, write, `fchmod
/// 0400`, ACL-or-chown, `renameat` into place.
fn write_one(dir: &Path, credential: &Credential, owner: Uid, group: Gid) -> StepResult<()> {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    let tmp_path = dir.join(format!(".#credential-{suffix}"));
    let final_path = dir.join(&credential.id);

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&tmp_path)
        .map_err(|e| step_err!(StepExitCode::Credentials, "create {tmp_path:?} failed: {e}"))?;
    file.write_all(&credential.bytes)
        .map_err(|e| step_err!(StepExitCode::Credentials, "write {tmp_path:?} failed: {e}"))?;
    file.set_permissions(fs::Permissions::from_mode(0o400))
        .map_err(|e| step_err!(StepExitCode::Credentials, "fchmod {tmp_path:?} failed: {e}"))?;

    // ACL is the preferred mechanism (§4.5); no ACL crate is a real pack
    // dependency, so this falls back directly to chown, matching the
    // teacher's credential-directory ownership handling in `exec_helper.rs`.
    nix::unistd::chown(&tmp_path, Some(owner), Some(group))
        .map_err(|e| step_err!(StepExitCode::Credentials, "chown {tmp_path:?} failed: {e}"))?;

    fs::rename(&tmp_path, &final_path)
        .map_err(|e| step_err!(StepExitCode::Credentials, "rename {tmp_path:?} -> {final_path:?} failed: {e}"))?;

    Ok(())
}

/// Writes every acquired credential into `dir` and tightens the directory
/// afterward (§4.5 step 3): removes group/other write, grants the service
/// uid read+execute. When `have_mount_ns` is set, `dir` is built as a
/// private ramfs/tmpfs workspace (C7's `mount_credential_workspace`)
/// instead of a plain directory on the host filesystem.
pub fn publish(
    dir: &Path,
    credentials: &[Credential],
    owner: Uid,
    group: Gid,
    have_mount_ns: bool,
) -> StepResult<()> {
    if have_mount_ns {
        crate::namespace::mount_credential_workspace(dir, |workspace| {
            fs::set_permissions(workspace, fs::Permissions::from_mode(0o700))
                .map_err(|e| step_err!(StepExitCode::Credentials, "chmod {workspace:?} failed: {e}"))?;
            for credential in credentials {
                write_one(workspace, credential, owner, group)?;
            }
            Ok(())
        })?;
    } else {
        fs::create_dir_all(dir)
            .map_err(|e| step_err!(StepExitCode::Credentials, "mkdir {dir:?} failed: {e}"))?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
            .map_err(|e| step_err!(StepExitCode::Credentials, "chmod {dir:?} failed: {e}"))?;
        for credential in credentials {
            write_one(dir, credential, owner, group)?;
        }
    }

    fs::set_permissions(dir, fs::Permissions::from_mode(0o500))
        .map_err(|e| step_err!(StepExitCode::Credentials, "tighten {dir:?} failed: {e}"))?;
    nix::unistd::chown(dir, Some(owner), Some(group))
        .map_err(|e| step_err!(StepExitCode::Credentials, "chown {dir:?} failed: {e}"))?;

    Ok(())
}

/// Import-style glob matching for `ImportCredential=NAME_GLOB` entries:
/// matches names inherited from a parent credential store against a glob
/// pattern before they are copied into `load_credentials` by the caller.
#[must_use]
pub fn import_glob_matches(pattern: &str, name: &str) -> bool {
    crate::glob::glob_match(pattern, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFail(u32);

    impl DecryptionBackend for AlwaysFail {
        fn try_decrypt(&mut self, _ciphertext: &[u8]) -> Result<Vec<u8>, bool> {
            self.0 += 1;
            Err(true)
        }
    }

    #[test]
    fn decrypt_retry_gives_up_after_cap() {
        let mut backend = AlwaysFail(0);
        let result = decrypt_with_retry(&mut backend, b"ciphertext");
        assert!(result.is_err());
        assert_eq!(backend.0, TPM_PCR_CHANGED_MAX_RETRIES + 1);
    }

    #[test]
    fn passthrough_backend_returns_input_unchanged() {
        let mut backend = PassthroughBackend;
        assert_eq!(decrypt_with_retry(&mut backend, b"hi").unwrap(), b"hi");
    }

    #[test]
    fn path_to_underscore_id_replaces_separators() {
        let root = Path::new("/run/credentials/x");
        let entry = Path::new("/run/credentials/x/a/b/c");
        assert_eq!(path_to_underscore_id(root, entry), "a_b_c");
    }

    #[test]
    fn relative_search_path_prefers_received_credentials_dir() {
        let dir = std::env::temp_dir().join(format!("execore-cred-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("mycert"), b"cert-bytes").unwrap();

        let resolved = resolve_relative_credential("mycert", Some(&dir), false);
        assert_eq!(resolved, Some(dir.join("mycert")));

        fs::remove_dir_all(&dir).ok();
    }
}
