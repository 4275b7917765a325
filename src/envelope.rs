//! FoilPics - Envelope Codec
//!
//! A single authenticated, encrypted message on disk: arbitrary payload,
//! a content-type label and an ordered list of string headers. The body is
//! AES-256-GCM under a random session key, the session key is RSA-OAEP
//! wrapped with the vault's public key, and the whole frame is signed with
//! the private key so authenticity can be proven against the public half.

use std::fs;
use std::io::Write;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::{VaultError, VaultResult};

pub const MAGIC: &[u8; 8] = b"FOILPIC\0";
pub const VERSION: u16 = 1;

/// Body cipher identifiers. Only AES-256-GCM is produced by this engine.
pub const CIPHER_AES_256_GCM: u8 = 1;

const SESSION_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;

/// Encryption options. `cipher` exists so the frame stays versionable;
/// the engine always passes the default.
#[derive(Debug, Clone, Copy)]
pub struct EncryptOptions {
    pub cipher: u8,
}

impl Default for EncryptOptions {
    fn default() -> Self {
        Self {
            cipher: CIPHER_AES_256_GCM,
        }
    }
}

/// A decrypted envelope.
///
/// Header order is preserved; duplicates are allowed on read but this
/// engine never writes them.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    signed_digest: [u8; 32],
    signature: Vec<u8>,
}

impl Envelope {
    /// First value for `name`, if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Authenticates the envelope against the vault's public key.
    pub fn verify(&self, public: &RsaPublicKey) -> bool {
        public
            .verify(
                Pkcs1v15Sign::new::<Sha256>(),
                &self.signed_digest,
                &self.signature,
            )
            .is_ok()
    }
}

/// Structural information extracted without any key material.
#[derive(Debug, Clone)]
pub struct EnvelopeInfo {
    pub version: u16,
    pub cipher: u8,
    pub content_type: String,
    pub header_count: usize,
    pub body_len: u64,
}

/// Writes one envelope to `out`.
pub fn encrypt<W: Write>(
    out: &mut W,
    payload: &[u8],
    content_type: &str,
    headers: &[(String, String)],
    private: &RsaPrivateKey,
    public: &RsaPublicKey,
    opts: &EncryptOptions,
) -> VaultResult<()> {
    if opts.cipher != CIPHER_AES_256_GCM {
        return Err(VaultError::CryptoFailed(format!(
            "unsupported cipher {}",
            opts.cipher
        )));
    }

    let mut session_key = [0u8; SESSION_KEY_LEN];
    OsRng.fill_bytes(&mut session_key);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let wrapped = public
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &session_key)
        .map_err(|e| VaultError::CryptoFailed(format!("key wrap failed: {e}")))?;

    // The frame prefix doubles as the GCM associated data, binding the
    // headers to the body.
    let mut prefix = Vec::with_capacity(128 + content_type.len());
    prefix.extend_from_slice(MAGIC);
    prefix.extend_from_slice(&VERSION.to_le_bytes());
    prefix.push(opts.cipher);
    put_bytes16(&mut prefix, content_type.as_bytes())?;
    let count = u16::try_from(headers.len())
        .map_err(|_| VaultError::CryptoFailed("too many headers".into()))?;
    prefix.extend_from_slice(&count.to_le_bytes());
    for (name, value) in headers {
        put_bytes16(&mut prefix, name.as_bytes())?;
        put_bytes32(&mut prefix, value.as_bytes())?;
    }
    put_bytes16(&mut prefix, &wrapped)?;
    prefix.extend_from_slice(&nonce);

    let cipher = Aes256Gcm::new_from_slice(&session_key)
        .map_err(|e| VaultError::CryptoFailed(e.to_string()))?;
    let body = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: payload,
                aad: &prefix,
            },
        )
        .map_err(|_| VaultError::CryptoFailed("body encryption failed".into()))?;

    let mut signed = prefix;
    signed.extend_from_slice(&(body.len() as u64).to_le_bytes());
    signed.extend_from_slice(&body);

    let digest = Sha256::digest(&signed);
    let signature = private
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|e| VaultError::CryptoFailed(format!("signing failed: {e}")))?;

    out.write_all(&signed)?;
    let sig_len = u16::try_from(signature.len())
        .map_err(|_| VaultError::CryptoFailed("oversized signature".into()))?;
    out.write_all(&sig_len.to_le_bytes())?;
    out.write_all(&signature)?;
    Ok(())
}

/// Reads and decrypts one envelope from `path`.
pub fn decrypt_file(private: &RsaPrivateKey, path: &Path) -> VaultResult<Envelope> {
    let bytes = fs::read(path)?;
    decrypt(private, &bytes)
}

/// Decrypts one envelope from an in-memory frame.
pub fn decrypt(private: &RsaPrivateKey, bytes: &[u8]) -> VaultResult<Envelope> {
    let mut r = Reader::new(bytes);
    let (cipher_id, content_type, headers) = read_prefix(&mut r)?;
    if cipher_id != CIPHER_AES_256_GCM {
        return Err(VaultError::CryptoFailed(format!(
            "unsupported cipher {cipher_id}"
        )));
    }
    let wrapped = r.bytes16()?;
    let nonce = r.take(NONCE_LEN)?;
    let prefix_end = r.pos;
    let body_len = r.u64()?;
    let body = r.take(
        usize::try_from(body_len).map_err(|_| truncated())?,
    )?;
    let signed_end = r.pos;
    let signature = r.bytes16()?;
    if !r.is_empty() {
        return Err(VaultError::CryptoFailed("trailing garbage".into()));
    }

    let session_key = private
        .decrypt(Oaep::new::<Sha256>(), wrapped)
        .map_err(|_| VaultError::CryptoFailed("key unwrap failed".into()))?;
    let gcm = Aes256Gcm::new_from_slice(&session_key)
        .map_err(|e| VaultError::CryptoFailed(e.to_string()))?;
    let payload = gcm
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: body,
                aad: &bytes[..prefix_end],
            },
        )
        .map_err(|_| VaultError::CryptoFailed("body decryption failed".into()))?;

    let digest = Sha256::digest(&bytes[..signed_end]);

    Ok(Envelope {
        content_type,
        headers,
        body: payload,
        signed_digest: digest.into(),
        signature: signature.to_vec(),
    })
}

/// Structural probe: true shape of an envelope frame, no keys required.
/// Used by the startup vault check.
pub fn parse(bytes: &[u8]) -> Option<EnvelopeInfo> {
    let mut r = Reader::new(bytes);
    let (cipher, content_type, headers) = read_prefix(&mut r).ok()?;
    let wrapped = r.bytes16().ok()?;
    if wrapped.is_empty() {
        return None;
    }
    r.take(NONCE_LEN).ok()?;
    let body_len = r.u64().ok()?;
    if body_len < GCM_TAG_LEN as u64 {
        return None;
    }
    r.take(usize::try_from(body_len).ok()?).ok()?;
    let signature = r.bytes16().ok()?;
    if signature.is_empty() || !r.is_empty() {
        return None;
    }
    Some(EnvelopeInfo {
        version: VERSION,
        cipher,
        content_type,
        header_count: headers.len(),
        body_len,
    })
}

fn read_prefix(r: &mut Reader<'_>) -> VaultResult<(u8, String, Vec<(String, String)>)> {
    let magic = r.take(MAGIC.len())?;
    if magic != MAGIC {
        return Err(VaultError::CryptoFailed("bad magic".into()));
    }
    let version = r.u16()?;
    if version != VERSION {
        return Err(VaultError::CryptoFailed(format!(
            "unsupported version {version}"
        )));
    }
    let cipher = r.u8()?;
    let content_type = read_str16(r)?;
    let count = r.u16()? as usize;
    let mut headers = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let name = read_str16(r)?;
        let value = read_str32(r)?;
        headers.push((name, value));
    }
    Ok((cipher, content_type, headers))
}

fn read_str16(r: &mut Reader<'_>) -> VaultResult<String> {
    let bytes = r.bytes16()?;
    String::from_utf8(bytes.to_vec()).map_err(|_| VaultError::CryptoFailed("bad utf-8".into()))
}

fn read_str32(r: &mut Reader<'_>) -> VaultResult<String> {
    let bytes = r.bytes32()?;
    String::from_utf8(bytes.to_vec()).map_err(|_| VaultError::CryptoFailed("bad utf-8".into()))
}

fn put_bytes16(out: &mut Vec<u8>, bytes: &[u8]) -> VaultResult<()> {
    let len =
        u16::try_from(bytes.len()).map_err(|_| VaultError::CryptoFailed("field too long".into()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn put_bytes32(out: &mut Vec<u8>, bytes: &[u8]) -> VaultResult<()> {
    let len =
        u32::try_from(bytes.len()).map_err(|_| VaultError::CryptoFailed("field too long".into()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn truncated() -> VaultError {
    VaultError::CryptoFailed("truncated envelope".into())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn take(&mut self, n: usize) -> VaultResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(truncated)?;
        if end > self.bytes.len() {
            return Err(truncated());
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> VaultResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> VaultResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> VaultResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> VaultResult<u64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    fn bytes16(&mut self) -> VaultResult<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    fn bytes32(&mut self) -> VaultResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::test_key_pair;

    fn sample_headers() -> Vec<(String, String)> {
        vec![
            ("Original-Path".into(), "/tmp/a.png".into()),
            ("Title".into(), "a".into()),
            ("Orientation".into(), "90".into()),
        ]
    }

    #[test]
    fn roundtrip_preserves_payload_and_headers() {
        let keys = test_key_pair();
        let mut frame = Vec::new();
        encrypt(
            &mut frame,
            b"picture bytes",
            "image/png",
            &sample_headers(),
            &keys.private,
            &keys.public,
            &EncryptOptions::default(),
        )
        .unwrap();

        let env = decrypt(&keys.private, &frame).unwrap();
        assert_eq!(env.body, b"picture bytes");
        assert_eq!(env.content_type, "image/png");
        assert_eq!(env.headers, sample_headers());
        assert_eq!(env.header("Title"), Some("a"));
        assert!(env.verify(&keys.public));
    }

    #[test]
    fn empty_content_type_and_headers() {
        let keys = test_key_pair();
        let mut frame = Vec::new();
        encrypt(
            &mut frame,
            b"x",
            "",
            &[],
            &keys.private,
            &keys.public,
            &EncryptOptions::default(),
        )
        .unwrap();
        let env = decrypt(&keys.private, &frame).unwrap();
        assert_eq!(env.content_type, "");
        assert!(env.headers.is_empty());
    }

    #[test]
    fn wrong_key_fails() {
        let keys = test_key_pair();
        let other = crate::keystore::KeyPair::generate(1024).unwrap();
        let mut frame = Vec::new();
        encrypt(
            &mut frame,
            b"secret",
            "image/png",
            &[],
            &keys.private,
            &keys.public,
            &EncryptOptions::default(),
        )
        .unwrap();
        assert!(decrypt(&other.private, &frame).is_err());
    }

    #[test]
    fn tampered_body_fails() {
        let keys = test_key_pair();
        let mut frame = Vec::new();
        encrypt(
            &mut frame,
            b"secret",
            "image/png",
            &[],
            &keys.private,
            &keys.public,
            &EncryptOptions::default(),
        )
        .unwrap();
        // The test key is 1024-bit, so the trailing signature field is
        // 2 + 128 bytes; the byte just before it is the last body byte.
        let n = frame.len();
        frame[n - 131] ^= 0x01;
        assert!(decrypt(&keys.private, &frame).is_err());
    }

    #[test]
    fn tampered_signature_fails_verification_only() {
        let keys = test_key_pair();
        let mut frame = Vec::new();
        encrypt(
            &mut frame,
            b"secret",
            "image/png",
            &[],
            &keys.private,
            &keys.public,
            &EncryptOptions::default(),
        )
        .unwrap();
        let n = frame.len();
        frame[n - 1] ^= 0x01;
        let env = decrypt(&keys.private, &frame).unwrap();
        assert!(!env.verify(&keys.public));
    }

    #[test]
    fn tampered_header_fails_verification_or_decrypt() {
        let keys = test_key_pair();
        let mut frame = Vec::new();
        encrypt(
            &mut frame,
            b"secret",
            "image/png",
            &sample_headers(),
            &keys.private,
            &keys.public,
            &EncryptOptions::default(),
        )
        .unwrap();
        // Flip one byte inside the header region.
        frame[24] ^= 0x01;
        match decrypt(&keys.private, &frame) {
            Err(_) => {}
            Ok(env) => assert!(!env.verify(&keys.public)),
        }
    }

    #[test]
    fn parse_accepts_real_frames_and_rejects_noise() {
        let keys = test_key_pair();
        let mut frame = Vec::new();
        encrypt(
            &mut frame,
            b"payload",
            "image/jpeg",
            &sample_headers(),
            &keys.private,
            &keys.public,
            &EncryptOptions::default(),
        )
        .unwrap();

        let info = parse(&frame).expect("valid frame");
        assert_eq!(info.cipher, CIPHER_AES_256_GCM);
        assert_eq!(info.content_type, "image/jpeg");
        assert_eq!(info.header_count, 3);

        assert!(parse(b"").is_none());
        assert!(parse(b"not an envelope at all").is_none());
        assert!(parse(&frame[..frame.len() - 1]).is_none());
        let mut bad_magic = frame.clone();
        bad_magic[0] ^= 0xff;
        assert!(parse(&bad_magic).is_none());
    }
}
