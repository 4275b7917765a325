//! FoilPics - Key Store
//!
//! Persists the vault's RSA key pair, passphrase-encrypted, as
//! `<key-dir>/foil.key`. The passphrase layer is Argon2id over
//! XChaCha20-Poly1305; the private key travels as PKCS#8 DER inside it.
//! The public key is always derived from the private key in memory and is
//! never stored separately.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use crate::error::{VaultError, VaultResult};

/// Name of the key file inside the key directory.
pub const KEY_FILE: &str = "foil.key";

const MAGIC: &[u8; 8] = b"FOILKEY\0";
const VERSION_FIELD: u16 = 1;
const KDF_ARGON2ID: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

// Argon2id work factors written into every key file.
const M_COST: u32 = 65536;
const T_COST: u32 = 3;
const P_COST: u32 = 4;

/// The vault's RSA key pair. The public half is derived, not stored.
#[derive(Clone)]
pub struct KeyPair {
    pub private: RsaPrivateKey,
    pub public: RsaPublicKey,
}

impl KeyPair {
    pub fn from_private(private: RsaPrivateKey) -> Self {
        let public = RsaPublicKey::from(&private);
        Self { private, public }
    }

    /// Generates a fresh pair of the given modulus size.
    pub fn generate(bits: usize) -> VaultResult<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| VaultError::KeyError(e.to_string()))?;
        Ok(Self::from_private(private))
    }
}

/// What the key file on disk looks like, before any unlock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFileState {
    Missing,
    NotEncrypted,
    Encrypted,
    Invalid,
}

/// Handle on the key directory.
pub struct KeyStore {
    key_file: PathBuf,
}

impl KeyStore {
    /// Opens the store, creating the directory (mode 0700 on Unix) and
    /// repairing any interrupted passphrase change first.
    pub fn open(key_dir: &Path) -> VaultResult<Self> {
        crate::config::create_private_dir(key_dir)?;
        let store = Self {
            key_file: key_dir.join(KEY_FILE),
        };
        store.recover();
        Ok(store)
    }

    pub fn key_file(&self) -> &Path {
        &self.key_file
    }

    /// Recovery protocol for an interrupted `change_passphrase`:
    /// a lone `foil.key.save` is renamed back into place, a `.save`
    /// shadowing an intact `foil.key` is deleted, and a leftover
    /// `foil.key.new` is always deleted.
    fn recover(&self) {
        let save = self.key_file.with_extension("key.save");
        let tmp = self.key_file.with_extension("key.new");
        if save.exists() {
            if self.key_file.exists() {
                log::warn!("Removing stale {}", save.display());
                let _ = fs::remove_file(&save);
            } else {
                log::warn!("Restoring {} from {}", self.key_file.display(), save.display());
                if let Err(e) = fs::rename(&save, &self.key_file) {
                    log::warn!("Failed to restore key file: {e}");
                }
            }
        }
        if tmp.exists() {
            let _ = fs::remove_file(&tmp);
        }
    }

    /// Probes the key file without retaining any key material.
    pub fn probe(&self) -> KeyFileState {
        match read_key_file(&self.key_file, "") {
            Ok(_) => KeyFileState::NotEncrypted,
            Err(VaultError::WrongPassphrase) => KeyFileState::Encrypted,
            Err(VaultError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                KeyFileState::Missing
            }
            Err(_) => KeyFileState::Invalid,
        }
    }

    /// Attempts to unlock with `passphrase`. On failure the file is left
    /// untouched; the error tells wrong-passphrase apart from a missing or
    /// invalid file.
    pub fn try_unlock(&self, passphrase: &str) -> VaultResult<KeyPair> {
        read_key_file(&self.key_file, passphrase).map(KeyPair::from_private)
    }

    /// True iff the file is passphrase-encrypted and `passphrase` opens it.
    /// A not-encrypted key file always fails this check.
    pub fn check_passphrase(&self, passphrase: &str) -> bool {
        match read_key_file(&self.key_file, "") {
            Ok(_) => {
                log::warn!("Key not encrypted");
                false
            }
            Err(VaultError::WrongPassphrase) => match read_key_file(&self.key_file, passphrase) {
                Ok(_) => true,
                Err(VaultError::WrongPassphrase) => {
                    log::debug!("Wrong passphrase");
                    false
                }
                Err(e) => {
                    log::warn!("Key invalid: {e}");
                    false
                }
            },
            Err(e) => {
                log::warn!("{e}");
                false
            }
        }
    }

    /// Re-encrypts `private` under a new passphrase using the
    /// write-new-then-rename protocol. Both the original and the temporary
    /// copy stay on disk if a rename fails; `recover` handles the pieces on
    /// the next open.
    pub fn change_passphrase(&self, private: &RsaPrivateKey, new: &str) -> VaultResult<()> {
        let tmp = self.key_file.with_extension("key.new");
        let save = self.key_file.with_extension("key.save");

        write_key_file(&tmp, private, new)?;

        let _ = fs::remove_file(&save);
        fs::rename(&self.key_file, &save)?;
        fs::rename(&tmp, &self.key_file)?;
        let _ = fs::remove_file(&save);
        log::debug!("Passphrase changed");
        Ok(())
    }
}

/// Generates an RSA key of `bits`, writes it to `key_file` encrypted under
/// `passphrase`, and returns the pair. Runs inside the generate-key task.
pub fn generate_to_file(
    key_file: &Path,
    bits: usize,
    passphrase: &SecretString,
) -> VaultResult<KeyPair> {
    log::debug!("Generating key... {bits} bits");
    let pair = KeyPair::generate(bits)?;
    write_key_file(key_file, &pair.private, passphrase.expose_secret())?;
    log::debug!("Done!");
    Ok(pair)
}

/// Writes the passphrase-encrypted key file frame.
pub fn write_key_file(path: &Path, private: &RsaPrivateKey, passphrase: &str) -> VaultResult<()> {
    let der = private
        .to_pkcs8_der()
        .map_err(|e| VaultError::KeyError(e.to_string()))?;

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let mut key = derive_key(passphrase, &salt, M_COST, T_COST, P_COST)?;
    let cipher = XChaCha20Poly1305::new_from_slice(&key)
        .map_err(|e| VaultError::CryptoFailed(e.to_string()))?;
    key.zeroize();
    let ct = cipher
        .encrypt(XNonce::from_slice(&nonce), der.as_bytes())
        .map_err(|_| VaultError::CryptoFailed("key encryption failed".into()))?;

    let mut frame = Vec::with_capacity(64 + ct.len());
    frame.extend_from_slice(MAGIC);
    frame.extend_from_slice(&VERSION_FIELD.to_le_bytes());
    frame.push(KDF_ARGON2ID);
    frame.extend_from_slice(&M_COST.to_le_bytes());
    frame.extend_from_slice(&T_COST.to_le_bytes());
    frame.extend_from_slice(&P_COST.to_le_bytes());
    frame.extend_from_slice(&salt);
    frame.extend_from_slice(&nonce);
    frame.extend_from_slice(&(ct.len() as u32).to_le_bytes());
    frame.extend_from_slice(&ct);

    let mut file = fs::File::create(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = file.set_permissions(fs::Permissions::from_mode(0o600));
    }
    file.write_all(&frame)?;
    file.sync_all()?;
    Ok(())
}

fn read_key_file(path: &Path, passphrase: &str) -> VaultResult<RsaPrivateKey> {
    let bytes = fs::read(path)?;
    if bytes.len() < MAGIC.len() + 2 + 1 + 12 + SALT_LEN + NONCE_LEN + 4 {
        return Err(VaultError::KeyInvalid("truncated key file".into()));
    }
    fn take<'a>(bytes: &'a [u8], pos: &mut usize, n: usize) -> VaultResult<&'a [u8]> {
        let end = pos
            .checked_add(n)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| VaultError::KeyInvalid("truncated key file".into()))?;
        let s = &bytes[*pos..end];
        *pos = end;
        Ok(s)
    }
    let mut pos = 0usize;

    if take(&bytes, &mut pos, MAGIC.len())? != MAGIC {
        return Err(VaultError::KeyInvalid("bad magic".into()));
    }
    let version = u16::from_le_bytes(take(&bytes, &mut pos, 2)?.try_into().unwrap());
    if version != VERSION_FIELD {
        return Err(VaultError::KeyInvalid(format!("unsupported version {version}")));
    }
    if take(&bytes, &mut pos, 1)?[0] != KDF_ARGON2ID {
        return Err(VaultError::KeyInvalid("unknown kdf".into()));
    }
    let m_cost = u32::from_le_bytes(take(&bytes, &mut pos, 4)?.try_into().unwrap());
    let t_cost = u32::from_le_bytes(take(&bytes, &mut pos, 4)?.try_into().unwrap());
    let p_cost = u32::from_le_bytes(take(&bytes, &mut pos, 4)?.try_into().unwrap());
    let salt: [u8; SALT_LEN] = take(&bytes, &mut pos, SALT_LEN)?.try_into().unwrap();
    let nonce: [u8; NONCE_LEN] = take(&bytes, &mut pos, NONCE_LEN)?.try_into().unwrap();
    let ct_len = u32::from_le_bytes(take(&bytes, &mut pos, 4)?.try_into().unwrap()) as usize;
    let ct = take(&bytes, &mut pos, ct_len)?;
    if pos != bytes.len() {
        return Err(VaultError::KeyInvalid("trailing garbage".into()));
    }

    let mut key = derive_key(passphrase, &salt, m_cost, t_cost, p_cost)?;
    let cipher = XChaCha20Poly1305::new_from_slice(&key)
        .map_err(|e| VaultError::CryptoFailed(e.to_string()))?;
    key.zeroize();
    let mut der = cipher
        .decrypt(XNonce::from_slice(&nonce), ct)
        .map_err(|_| VaultError::WrongPassphrase)?;

    let private = RsaPrivateKey::from_pkcs8_der(&der)
        .map_err(|e| VaultError::KeyInvalid(e.to_string()));
    der.zeroize();
    private
}

fn derive_key(
    passphrase: &str,
    salt: &[u8],
    m_cost: u32,
    t_cost: u32,
    p_cost: u32,
) -> VaultResult<[u8; KEY_LEN]> {
    let params = Params::new(m_cost, t_cost, p_cost, Some(KEY_LEN))
        .map_err(|e| VaultError::KeyError(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = [0u8; KEY_LEN];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut out)
        .map_err(|e| VaultError::KeyError(e.to_string()))?;
    Ok(out)
}

/// Shared 1024-bit pair so tests do not pay for key generation repeatedly.
#[cfg(test)]
pub fn test_key_pair() -> KeyPair {
    use std::sync::OnceLock;
    static PAIR: OnceLock<KeyPair> = OnceLock::new();
    PAIR.get_or_init(|| KeyPair::generate(1024).unwrap()).clone()
}
