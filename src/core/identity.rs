// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Node identity: an Ed25519 keypair, the node id it derives, and sign/verify.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use thiserror::Error;

use crate::core::types::NodeId;

/// Identity errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Filesystem error while loading or creating the key file.
    #[error("io")]
    Io,
    /// Key bytes on disk were not a valid Ed25519 PKCS#8 document.
    #[error("invalid key encoding")]
    InvalidKey,
    /// Signature verification failed.
    #[error("bad signature")]
    BadSignature,
}

fn set_private_perms_best_effort(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

/// Atomic write to disk: write to a sibling temp file, fsync, then rename over the target.
fn atomic_write_private(path: &Path, bytes: &[u8]) -> Result<(), IdentityError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|_| IdentityError::Io)?;
    }

    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");

    {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .map_err(|_| IdentityError::Io)?;
        f.write_all(bytes).map_err(|_| IdentityError::Io)?;
        let _ = f.sync_all();
    }

    set_private_perms_best_effort(&tmp);
    fs::rename(&tmp, path).map_err(|_| IdentityError::Io)?;
    set_private_perms_best_effort(path);
    Ok(())
}

/// Node identity: holds the Ed25519 keypair and the derived node id.
pub struct Identity {
    keypair: Ed25519KeyPair,
    node_id: NodeId,
}

impl Identity {
    /// Load an existing identity from `path`, or generate and persist a new one.
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            let pkcs8 = fs::read(path).map_err(|_| IdentityError::Io)?;
            let keypair =
                Ed25519KeyPair::from_pkcs8(&pkcs8).map_err(|_| IdentityError::InvalidKey)?;
            let node_id = NodeId::from_public_key(keypair.public_key().as_ref());
            return Ok(Self { keypair, node_id });
        }

        let rng = SystemRandom::new();
        let pkcs8 =
            Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| IdentityError::InvalidKey)?;
        atomic_write_private(path, pkcs8.as_ref())?;

        let keypair =
            Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).map_err(|_| IdentityError::InvalidKey)?;
        let node_id = NodeId::from_public_key(keypair.public_key().as_ref());
        Ok(Self { keypair, node_id })
    }

    /// Convenience wrapper over [`load_or_generate`](Self::load_or_generate) taking a data
    /// directory; the key file is always named `identity.key` inside it.
    pub fn open_in_dir(data_dir: &str) -> Result<Self, IdentityError> {
        let mut path = PathBuf::from(data_dir);
        path.push("identity.key");
        Self::load_or_generate(&path)
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Raw Ed25519 public key bytes (32).
    pub fn public_key_bytes(&self) -> [u8; 32] {
        let pk = self.keypair.public_key().as_ref();
        let mut out = [0u8; 32];
        out.copy_from_slice(pk);
        out
    }

    /// Sign an arbitrary byte string.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        let sig = self.keypair.sign(msg);
        let mut out = [0u8; 64];
        out.copy_from_slice(sig.as_ref());
        out
    }

    /// Verify a signature against a raw 32-byte Ed25519 public key.
    pub fn verify(pubkey: &[u8], msg: &[u8], sig: &[u8]) -> bool {
        if pubkey.len() != 32 || sig.len() != 64 {
            return false;
        }
        let key = UnparsedPublicKey::new(&ED25519, pubkey);
        key.verify(msg, sig).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_stable_for_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        let id1 = Identity::load_or_generate(&path).unwrap();
        let id2 = Identity::load_or_generate(&path).unwrap();
        assert_eq!(id1.node_id(), id2.node_id());
        assert_eq!(id1.public_key_bytes(), id2.public_key_bytes());
    }

    #[test]
    fn sign_verify_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        let id = Identity::load_or_generate(&path).unwrap();
        let msg = b"hello network";
        let sig = id.sign(msg);
        assert!(Identity::verify(&id.public_key_bytes(), msg, &sig));
        assert!(!Identity::verify(&id.public_key_bytes(), b"tampered", &sig));
    }

    #[test]
    fn node_id_differs_across_distinct_keys() {
        let dir = tempfile::tempdir().unwrap();
        let a = Identity::load_or_generate(&dir.path().join("a.key")).unwrap();
        let b = Identity::load_or_generate(&dir.path().join("b.key")).unwrap();
        assert_ne!(a.node_id(), b.node_id());
    }
}
