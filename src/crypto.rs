use std::collections::HashMap;
use std::fmt;

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::codec::{self, IV_LEN, TAG_LEN};
use crate::error::{CryptoError, Error, Result};

/// associated data bound into every GCM authentication tag
pub const AAD: &[u8] = b"WalGit-v1";

/// threshold parameters of the key-wrap policy: t-of-n share signatures
pub const WRAP_THRESHOLD: usize = 2;
pub const WRAP_SHARES: usize = 3;

/// per-commit data encryption key, 256-bit
///
/// never persisted in raw form; wrapped via a threshold policy before it
/// leaves the process.
#[derive(Clone, PartialEq, Eq)]
pub struct Dek([u8; 32]);

impl Dek {
    /// generate a fresh random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Dek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // key material stays out of logs
        write!(f, "Dek(..)")
    }
}

/// output of a single AES-256-GCM encryption
pub struct Encrypted {
    pub iv: [u8; IV_LEN],
    pub tag: [u8; TAG_LEN],
    pub ciphertext: Vec<u8>,
}

/// encrypt plaintext under the dek with a fresh random 96-bit iv
pub fn encrypt(plaintext: &[u8], dek: &Dek) -> Result<Encrypted> {
    let cipher = Aes256Gcm::new_from_slice(dek.as_bytes())
        .map_err(|_| Error::Crypto(CryptoError::Auth))?;

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let mut sealed = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad: AAD,
            },
        )
        .map_err(|_| Error::Crypto(CryptoError::Auth))?;

    // aead appends the tag to the ciphertext
    let tag_start = sealed.len() - TAG_LEN;
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&sealed[tag_start..]);
    sealed.truncate(tag_start);

    Ok(Encrypted {
        iv,
        tag,
        ciphertext: sealed,
    })
}

/// decrypt; authentication failure is fatal, no partial output
pub fn decrypt(iv: &[u8; IV_LEN], tag: &[u8; TAG_LEN], ciphertext: &[u8], dek: &Dek) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(dek.as_bytes())
        .map_err(|_| Error::Crypto(CryptoError::Auth))?;

    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    cipher
        .decrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: &sealed,
                aad: AAD,
            },
        )
        .map_err(|_| Error::Crypto(CryptoError::Auth))
}

/// encrypt and wrap in the `WALGIT1` wire frame
pub fn encrypt_framed(plaintext: &[u8], dek: &Dek) -> Result<Vec<u8>> {
    let enc = encrypt(plaintext, dek)?;
    Ok(codec::frame(&enc.iv, &enc.tag, &enc.ciphertext))
}

/// unframe and decrypt a `WALGIT1` payload
pub fn decrypt_framed(bytes: &[u8], dek: &Dek) -> Result<Vec<u8>> {
    let (iv, tag, ciphertext) = codec::unframe(bytes)?;
    decrypt(&iv, &tag, ciphertext, dek)
}

/// session signature obtained from the wallet collaborator before a
/// threshold unwrap; carries one signature per participating share
#[derive(Clone, Debug)]
pub struct SessionSignature {
    pub policy_id: String,
    pub share_signatures: Vec<Vec<u8>>,
}

/// threshold key-wrap client: wraps a dek under a (t, n) policy so the
/// wrapped bytes are safe to store remotely
///
/// wrapped output is opaque; the only contract is that authorized users
/// get `unwrap(wrap(x)) == x`.
#[async_trait]
pub trait KeyWrapClient: Send + Sync {
    async fn wrap_dek(&self, dek: &Dek, policy_id: &str) -> Result<Vec<u8>>;

    async fn unwrap_dek(
        &self,
        wrapped: &[u8],
        policy_id: &str,
        session: &SessionSignature,
    ) -> Result<Dek>;
}

/// in-process key-wrap client for tests and localnet
///
/// wraps under a per-policy master key; unwrap checks the threshold on the
/// session's share signatures the way the network service would.
pub struct MemoryKeyWrapClient {
    policies: RwLock<HashMap<String, [u8; 32]>>,
}

impl MemoryKeyWrapClient {
    pub fn new() -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
        }
    }

    /// create a policy, generating its master key
    pub fn register_policy(&self, policy_id: &str) {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        self.policies.write().insert(policy_id.to_string(), key);
    }

    fn master_key(&self, policy_id: &str) -> Result<Dek> {
        self.policies
            .read()
            .get(policy_id)
            .map(|k| Dek::from_bytes(*k))
            .ok_or_else(|| Error::Crypto(CryptoError::Policy(policy_id.to_string())))
    }
}

impl Default for MemoryKeyWrapClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyWrapClient for MemoryKeyWrapClient {
    async fn wrap_dek(&self, dek: &Dek, policy_id: &str) -> Result<Vec<u8>> {
        let master = self.master_key(policy_id)?;
        encrypt_framed(dek.as_bytes(), &master)
    }

    async fn unwrap_dek(
        &self,
        wrapped: &[u8],
        policy_id: &str,
        session: &SessionSignature,
    ) -> Result<Dek> {
        if session.policy_id != policy_id {
            return Err(Error::Crypto(CryptoError::Policy(policy_id.to_string())));
        }
        if session.share_signatures.len() < WRAP_THRESHOLD {
            return Err(Error::Crypto(CryptoError::Unwrap(format!(
                "{} of {} required share signatures",
                session.share_signatures.len(),
                WRAP_THRESHOLD
            ))));
        }

        let master = self.master_key(policy_id)?;
        let raw = decrypt_framed(wrapped, &master)
            .map_err(|_| Error::Crypto(CryptoError::Unwrap("threshold decrypt failed".into())))?;

        if raw.len() != 32 {
            return Err(Error::Crypto(CryptoError::Unwrap(
                "unexpected key length".into(),
            )));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&raw);
        Ok(Dek::from_bytes(bytes))
    }
}

impl MemoryKeyWrapClient {
    /// session carrying enough share signatures to clear the threshold,
    /// as the wallet collaborator returns one after user approval
    pub fn approved_session(policy_id: &str) -> SessionSignature {
        SessionSignature {
            policy_id: policy_id.to_string(),
            share_signatures: vec![vec![1u8; 64], vec![2u8; 64]],
        }
    }
}
