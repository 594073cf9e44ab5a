//! Key custody: hierarchical derivation and private-key encryption at rest.
//!
//! The vault owns two secrets loaded once at startup and read-only after:
//! the wallet mnemonic (from which every deposit and hot-wallet key derives)
//! and a 32-byte process key used to encrypt child private keys before they
//! reach the database. Decryption happens per signing operation and the
//! plaintext key is never cached.
//!
//! Stored ciphertext format: `v1:` + hex(`iv || ciphertext`), AES-256-CBC
//! with PKCS#7 padding and a random 16-byte IV. The version tag exists so a
//! key rotation can re-encrypt rows in place without a schema change.

use aes::Aes256;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use alloy::primitives::Address;
use alloy::signers::local::coins_bip39::English;
use alloy::signers::local::{MnemonicBuilder, PrivateKeySigner};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Tag prefixed to every ciphertext this version of the vault writes.
const FORMAT_V1: &str = "v1:";

const IV_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// The mnemonic or derivation path was rejected by the signer builder.
    #[error("key derivation failed at {path}: {reason}")]
    Derivation { path: String, reason: String },
    /// Stored ciphertext carries an unknown version tag.
    #[error("unknown key format (expected {FORMAT_V1} prefix)")]
    UnknownFormat,
    /// Stored ciphertext is not valid hex or is too short to hold an IV.
    #[error("malformed ciphertext: {0}")]
    Malformed(String),
    /// Padding check failed; wrong process key or corrupted row.
    #[error("decryption failed")]
    Decrypt,
    /// Decrypted bytes do not form a valid secp256k1 private key.
    #[error("stored key is not a valid signing key")]
    InvalidKey,
}

/// A freshly derived child key, ready to be encrypted and persisted.
pub struct DerivedKey {
    pub address: Address,
    /// Full derivation path including the child index.
    pub path: String,
    pub signer: PrivateKeySigner,
}

/// Process-wide key custody component. Construct once at application root.
pub struct KeyVault {
    mnemonic: String,
    base_path: String,
    cipher_key: [u8; 32],
}

impl KeyVault {
    pub fn new(mnemonic: String, base_path: String, cipher_key: [u8; 32]) -> Self {
        Self {
            mnemonic,
            base_path,
            cipher_key,
        }
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Derive the child signer at `base_path/index`.
    ///
    /// # Errors
    /// Returns [`VaultError::Derivation`] when the mnemonic or the assembled
    /// path is rejected.
    pub fn derive(&self, index: u32) -> Result<DerivedKey, VaultError> {
        let path = format!("{}/{}", self.base_path, index);
        let signer = MnemonicBuilder::<English>::default()
            .phrase(self.mnemonic.as_str())
            .derivation_path(&path)
            .map_err(|e| VaultError::Derivation {
                path: path.clone(),
                reason: e.to_string(),
            })?
            .build()
            .map_err(|e| VaultError::Derivation {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        Ok(DerivedKey {
            address: signer.address(),
            path,
            signer,
        })
    }

    /// Encrypt a child private key for storage.
    pub fn encrypt_signer(&self, signer: &PrivateKeySigner) -> String {
        self.encrypt(signer.to_bytes().as_slice())
    }

    /// Encrypt arbitrary bytes under the process key. Fresh IV per call.
    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        let iv: [u8; IV_LEN] = rand::random();
        let ciphertext = Aes256CbcEnc::new(&self.cipher_key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        let mut packed = Vec::with_capacity(IV_LEN + ciphertext.len());
        packed.extend_from_slice(&iv);
        packed.extend_from_slice(&ciphertext);
        format!("{FORMAT_V1}{}", hex::encode(packed))
    }

    /// Decrypt a stored ciphertext produced by [`KeyVault::encrypt`].
    ///
    /// # Errors
    /// - [`VaultError::UnknownFormat`] when the version tag is missing.
    /// - [`VaultError::Malformed`] on bad hex or truncated input.
    /// - [`VaultError::Decrypt`] when the padding check fails.
    pub fn decrypt(&self, stored: &str) -> Result<Vec<u8>, VaultError> {
        let body = stored.strip_prefix(FORMAT_V1).ok_or(VaultError::UnknownFormat)?;
        let packed = hex::decode(body).map_err(|e| VaultError::Malformed(e.to_string()))?;
        if packed.len() <= IV_LEN {
            return Err(VaultError::Malformed("shorter than one IV".to_string()));
        }
        let (iv, ciphertext) = packed.split_at(IV_LEN);
        let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| VaultError::Decrypt)?;
        Aes256CbcDec::new(&self.cipher_key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| VaultError::Decrypt)
    }

    /// Reconstruct a signer from a stored encrypted key.
    pub fn signer_from_encrypted(&self, stored: &str) -> Result<PrivateKeySigner, VaultError> {
        let plaintext = self.decrypt(stored)?;
        let bytes: [u8; 32] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| VaultError::InvalidKey)?;
        PrivateKeySigner::from_bytes(&bytes.into()).map_err(|_| VaultError::InvalidKey)
    }
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secrets stay out of logs.
        f.debug_struct("KeyVault")
            .field("base_path", &self.base_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MNEMONIC: &str =
        "test test test test test test test test test test test junk";

    fn vault() -> KeyVault {
        KeyVault::new(
            TEST_MNEMONIC.to_string(),
            "m/44'/60'/0'/0".to_string(),
            [7u8; 32],
        )
    }

    #[test]
    fn derivation_is_deterministic() {
        let v = vault();
        let a = v.derive(3).unwrap();
        let b = v.derive(3).unwrap();
        assert_eq!(a.address, b.address);
        assert_eq!(a.path, "m/44'/60'/0'/0/3");
    }

    #[test]
    fn derivation_index_changes_address() {
        let v = vault();
        let a = v.derive(0).unwrap();
        let b = v.derive(1).unwrap();
        assert_ne!(a.address, b.address);
    }

    #[test]
    fn derives_known_address_at_index_zero() {
        let v = vault();
        let derived = v.derive(0).unwrap();
        // First account of the standard test mnemonic.
        assert_eq!(
            derived.address.to_string().to_lowercase(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let v = vault();
        let payload = [42u8; 32];
        let stored = v.encrypt(&payload);
        assert!(stored.starts_with("v1:"));
        assert_eq!(v.decrypt(&stored).unwrap(), payload);
    }

    #[test]
    fn fresh_iv_per_encryption() {
        let v = vault();
        let payload = [1u8; 32];
        assert_ne!(v.encrypt(&payload), v.encrypt(&payload));
    }

    #[test]
    fn decrypt_rejects_wrong_key() {
        let v = vault();
        let stored = v.encrypt(&[9u8; 32]);
        let other = KeyVault::new(
            TEST_MNEMONIC.to_string(),
            "m/44'/60'/0'/0".to_string(),
            [8u8; 32],
        );
        // CBC with a wrong key fails the padding check or garbles the
        // plaintext; either way the original bytes never come back.
        match other.decrypt(&stored) {
            Ok(plaintext) => assert_ne!(plaintext, vec![9u8; 32]),
            Err(_) => {}
        }
    }

    #[test]
    fn decrypt_rejects_untagged_and_truncated() {
        let v = vault();
        assert!(matches!(v.decrypt("deadbeef"), Err(VaultError::UnknownFormat)));
        assert!(v.decrypt("v1:abcd").is_err());
        assert!(v.decrypt("v1:zzzz").is_err());
    }

    #[test]
    fn signer_round_trip() {
        let v = vault();
        let derived = v.derive(5).unwrap();
        let stored = v.encrypt_signer(&derived.signer);
        let restored = v.signer_from_encrypted(&stored).unwrap();
        assert_eq!(restored.address(), derived.address);
    }
}
