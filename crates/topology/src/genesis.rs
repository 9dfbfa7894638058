//! Genesis document shared by every validator of an instance.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::instance::Flavor;
use crate::node::{GenesisRef, NodeId};

/// A validator entry in the genesis document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisValidator {
    /// Validator node id.
    pub node_id: NodeId,

    /// Hex-encoded ed25519 public key.
    pub public_key: String,

    /// Address peers dial to reach the validator.
    pub p2p_address: String,
}

/// Initial network parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genesis {
    /// Network name.
    pub network: String,

    /// Binary flavor the network was built for.
    pub flavor: Flavor,

    /// Genesis time.
    pub genesis_time: DateTime<Utc>,

    /// Initial validator set.
    pub validators: Vec<GenesisValidator>,
}

impl Genesis {
    /// Writes the document atomically and returns a reference to it.
    pub(crate) fn write(&self, path: &Path) -> Result<GenesisRef> {
        let bytes = serde_json::to_vec_pretty(self)?;
        localnet_util::fs::write_atomic(path, &bytes)
            .map_err(|e| Error::Io("failed to write genesis", e))?;

        Ok(GenesisRef {
            path: path.to_path_buf(),
            digest: hex::encode(Sha256::digest(&bytes)),
        })
    }

    /// Whether `other` describes the same chain, ignoring the genesis time.
    #[must_use]
    pub fn same_chain(&self, other: &Self) -> bool {
        self.network == other.network
            && self.flavor == other.flavor
            && self.validators == other.validators
    }

    /// Reads a genesis document.
    ///
    /// # Errors
    ///
    /// Returns an IO error if unreadable, or [`Error::Corrupt`] if malformed.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| Error::Io("failed to read genesis", e))?;
        serde_json::from_slice(&bytes).map_err(|source| Error::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }
}
