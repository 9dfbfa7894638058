//! Node key material.

use std::io::Write;
use std::path::Path;

use ed25519_dalek::{SECRET_KEY_LENGTH, SigningKey};
use rand::rngs::OsRng;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::node::KeyRef;

/// Loads the ed25519 seed at `path`, or generates and stores a new one.
///
/// An existing file of the wrong length is an error rather than being
/// overwritten, so a corrupted key is never silently rotated.
pub fn load_or_generate(path: &Path) -> Result<KeyRef> {
    let key = match std::fs::read(path) {
        Ok(bytes) => {
            let seed: [u8; SECRET_KEY_LENGTH] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::InvalidKey(path.to_path_buf()))?;
            debug!("Reusing key material at {}", path.display());
            SigningKey::from_bytes(&seed)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = SigningKey::generate(&mut OsRng);
            save(path, &key)?;
            info!("Generated key material at {}", path.display());
            key
        }
        Err(e) => return Err(Error::Io("failed to read key material", e)),
    };

    Ok(KeyRef {
        path: path.to_path_buf(),
        public_key: hex::encode(key.verifying_key().as_bytes()),
    })
}

fn save(path: &Path, key: &SigningKey) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::Io("failed to create key directory", e))?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .map_err(|e| Error::Io("failed to create key file", e))?;
    file.write_all(&key.to_bytes())
        .map_err(|e| Error::Io("failed to write key file", e))?;

    Ok(())
}
