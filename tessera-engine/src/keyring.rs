use std::collections::HashMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::RngCore;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{Error, ErrorType};

type HmacSha256 = Hmac<Sha256>;

/// Oracle for the rotating tokenizer key.
///
/// Signing happens wherever the key material lives, which may be a remote
/// service, so both operations are suspension points. Signatures must be
/// deterministic per key.
#[async_trait]
pub trait TokenizerKeyring: Send + Sync {
    /// Identifier of the key new tokens must be computed with.
    async fn current_key_id(&self) -> Result<String, Error>;

    /// Keyed MAC of `data` under the identified key.
    async fn sign(&self, key_id: &str, data: &[u8]) -> Result<Vec<u8>, Error>;
}

struct Keys {
    current: String,
    keys: HashMap<String, Vec<u8>>,
}

/// In-memory HMAC-SHA-256 keyring.
///
/// Old generations stay available for signing so stored tokens remain
/// translatable after a rotation.
pub struct HmacKeyring {
    state: RwLock<Keys>,
}

impl HmacKeyring {
    #[must_use]
    pub fn new() -> Self {
        let (id, key) = generate();
        let mut keys = HashMap::new();
        keys.insert(id.clone(), key);
        Self {
            state: RwLock::new(Keys { current: id, keys }),
        }
    }

    /// Install a fresh key generation and make it current. Returns the new
    /// key id.
    pub fn rotate(&self) -> String {
        let (id, key) = generate();
        let mut state = self.state.write();
        state.keys.insert(id.clone(), key);
        state.current = id.clone();
        id
    }
}

impl Default for HmacKeyring {
    fn default() -> Self {
        Self::new()
    }
}

fn generate() -> (String, Vec<u8>) {
    let mut key = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    (Uuid::new_v4().to_string(), key)
}

#[async_trait]
impl TokenizerKeyring for HmacKeyring {
    async fn current_key_id(&self) -> Result<String, Error> {
        Ok(self.state.read().current.clone())
    }

    async fn sign(&self, key_id: &str, data: &[u8]) -> Result<Vec<u8>, Error> {
        let state = self.state.read();
        let key = state.keys.get(key_id).ok_or_else(|| {
            Error::from(ErrorType::UnknownTokenizerKey {
                key_id: key_id.to_string(),
            })
        })?;
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|err| ErrorType::InternalError(anyhow::Error::msg(err.to_string())))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}
