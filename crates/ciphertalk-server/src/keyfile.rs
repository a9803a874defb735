//! Loading or creating the server's long-lived identity key.

use crate::config::ServerConfig;
use ciphertalk_core::{KeyPairManager, TalkError, TalkResult};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Environment variable holding the key passphrase.
pub const PASSPHRASE_ENV: &str = "CIPHERTALK_PASSPHRASE";

/// Resolve the server key pair from the configured key file, if any.
///
/// With a key file the passphrase is required; an existing file is imported,
/// a missing one is generated and written. Without a key file an ephemeral
/// pair is generated, protected by the passphrase or a random one.
pub fn load_server_keys(config: &ServerConfig, passphrase: Option<String>) -> TalkResult<KeyPairManager> {
    let passphrase = passphrase.filter(|p| !p.is_empty());

    let Some(path) = &config.key_file else {
        let passphrase = passphrase.unwrap_or_else(random_passphrase);
        let keys = KeyPairManager::generate(&passphrase)?;
        info!(fingerprint = %short(&keys.fingerprint()), "generated ephemeral server key");
        return Ok(keys);
    };

    let passphrase = passphrase.ok_or_else(|| {
        TalkError::Config(format!("{PASSPHRASE_ENV} must be set when keys.key_file is configured"))
    })?;

    if path.exists() {
        let text = fs::read_to_string(path)?;
        let keys = KeyPairManager::import_local_private(&text, &passphrase)?;
        info!(path = %path.display(), fingerprint = %short(&keys.fingerprint()), "loaded server key");
        Ok(keys)
    } else {
        let keys = KeyPairManager::generate(&passphrase)?;
        save_private_key(path, &keys.export_local_private()?)?;
        info!(path = %path.display(), fingerprint = %short(&keys.fingerprint()), "generated and saved server key");
        Ok(keys)
    }
}

fn save_private_key(path: &Path, armored: &str) -> TalkResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = fs::set_permissions(parent, fs::Permissions::from_mode(0o700)) {
                    warn!(path = %parent.display(), error = %e, "could not restrict key directory");
                }
            }
        }
    }

    fs::write(path, armored)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

fn random_passphrase() -> String {
    let mut bytes = [0u8; 24];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn short(fp: &str) -> &str {
    ciphertalk_core::short_fingerprint(fp, 16)
}
