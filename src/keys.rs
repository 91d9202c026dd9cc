//! Private key loading for the SSH runner

use std::path::{Path, PathBuf};

use russh::keys::{PrivateKey, load_secret_key};
use tracing::debug;

use crate::error::ExecError;

/// Load and, if needed, decrypt a private key file.
///
/// The file must exist and must not be readable by group or others, matching
/// the checks an OpenSSH client performs. OpenSSH, PKCS#8 and PEM encodings
/// are accepted.
///
/// # Errors
/// Returns `ExecError::SshKeyError` if the file is missing, has open
/// permissions, or cannot be parsed/decrypted.
pub fn load_private_key(path: &Path, passphrase: Option<&str>) -> Result<PrivateKey, ExecError> {
    if !path.exists() {
        return Err(ExecError::SshKeyError(format!(
            "key file not found: {}",
            path.display()
        )));
    }

    validate_key_permissions(path)?;

    let key = load_secret_key(path, passphrase)
        .map_err(|e| ExecError::SshKeyError(format!("{}: {e}", path.display())))?;

    debug!(path = %path.display(), "loaded private key");

    Ok(key)
}

/// The `known_hosts` file that sits next to a private key file.
///
/// Host keys are verified against this file by default when authenticating
/// with that key, rather than against `~/.ssh/known_hosts`.
#[must_use]
pub fn sibling_known_hosts(key_path: &Path) -> PathBuf {
    key_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("known_hosts")
}

fn validate_key_permissions(path: &Path) -> Result<(), ExecError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path)
        .map_err(|e| ExecError::SshKeyError(format!("{}: {e}", path.display())))?;

    // mode & 0o77 checks group and other permissions
    let mode = metadata.permissions().mode();
    if mode & 0o77 != 0 {
        return Err(ExecError::SshKeyError(format!(
            "key file permissions too open: {} (should be 600)",
            path.display()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use super::*;

    fn write_key(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(b"not a real key").unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(mode);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn test_missing_key_file() {
        let err = load_private_key(Path::new("/nonexistent/id_ed25519"), None).unwrap_err();
        assert!(matches!(err, ExecError::SshKeyError(_)));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_open_permissions_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_key(dir.path(), "id_ed25519", 0o644);

        let err = load_private_key(&path, None).unwrap_err();
        assert!(err.to_string().contains("permissions too open"));
    }

    #[test]
    fn test_garbage_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_key(dir.path(), "id_ed25519", 0o600);

        // Permissions pass, parsing fails
        let err = load_private_key(&path, None).unwrap_err();
        assert!(matches!(err, ExecError::SshKeyError(_)));
    }

    #[test]
    fn test_sibling_known_hosts_path() {
        let hosts = sibling_known_hosts(Path::new("/home/deploy/.ssh/id_ed25519"));
        assert_eq!(hosts, PathBuf::from("/home/deploy/.ssh/known_hosts"));
    }
}
