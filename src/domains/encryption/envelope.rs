use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::cipher::{BlockEncrypt, KeyIvInit, StreamCipher};
use aes_gcm::aes::{Aes256, Block};
use aes_gcm::{AesGcm, Nonce, Tag};
use argon2::{Algorithm, Argon2, Params, Version};
use ctr::Ctr32BE;
use ghash::universal_hash::UniversalHash;
use ghash::GHash;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::task;

use crate::errors::{ExportError, PipelineResult};

/// AES-256-GCM with a 16-byte IV.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

pub const SALT_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// Smallest valid envelope: header plus tag around an empty ciphertext.
pub const ENVELOPE_OVERHEAD: usize = SALT_LEN + IV_LEN + TAG_LEN;

/// File encryption buffer, a whole number of cipher blocks.
const STREAM_BUFFER: usize = 64 * 1024;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost: 19_456,
            t_cost: 2,
            p_cost: 1,
        }
    }
}

impl KdfParams {
    fn params(&self) -> PipelineResult<Params> {
        Params::new(self.m_cost, self.t_cost, self.p_cost, Some(KEY_LEN))
            .map_err(|e| ExportError::Configuration(format!("Invalid key derivation parameters: {}", e)))
    }

    pub fn validate(&self) -> PipelineResult<()> {
        self.params().map(|_| ())
    }
}

/// Derive a 256-bit key from `password` and `salt` with Argon2id.
pub fn derive_key(password: &str, salt: &[u8], kdf: &KdfParams) -> PipelineResult<[u8; KEY_LEN]> {
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, kdf.params()?);
    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| ExportError::Encryption(format!("Key derivation failed: {}", e)))?;
    Ok(key)
}

/// Seal `plaintext` into `salt ‖ iv ‖ ciphertext ‖ tag` with a fresh salt and IV.
pub fn encrypt_bytes(plaintext: &[u8], password: &str, kdf: &KdfParams) -> PipelineResult<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut iv);

    let key = derive_key(password, &salt, kdf)?;
    let cipher = Aes256Gcm16::new_from_slice(&key)
        .map_err(|e| ExportError::Encryption(format!("Invalid key length: {}", e)))?;

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::<U16>::from_slice(&iv), b"", &mut buffer)
        .map_err(|_| ExportError::Encryption("Cipher rejected the input".to_string()))?;

    let mut out = Vec::with_capacity(ENVELOPE_OVERHEAD + buffer.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&buffer);
    out.extend_from_slice(tag.as_slice());
    Ok(out)
}

/// Open an envelope produced by [`encrypt_bytes`].
pub fn decrypt_bytes(envelope: &[u8], password: &str, kdf: &KdfParams) -> PipelineResult<Vec<u8>> {
    if envelope.len() < ENVELOPE_OVERHEAD {
        return Err(ExportError::DecryptionFailed(format!(
            "Envelope is {} bytes, shorter than the {} byte minimum",
            envelope.len(),
            ENVELOPE_OVERHEAD
        )));
    }
    let (salt, rest) = envelope.split_at(SALT_LEN);
    let (iv, rest) = rest.split_at(IV_LEN);
    let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);

    let key = derive_key(password, salt, kdf)?;
    let cipher = Aes256Gcm16::new_from_slice(&key)
        .map_err(|e| ExportError::Encryption(format!("Invalid key length: {}", e)))?;

    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(Nonce::<U16>::from_slice(iv), b"", &mut buffer, Tag::from_slice(tag))
        .map_err(|_| {
            ExportError::DecryptionFailed("Authentication failed: wrong password or corrupted data".to_string())
        })?;
    Ok(buffer)
}

/// Incremental AES-256-GCM over one envelope with a 16-byte IV and no
/// associated data. Output matches the one-shot cipher byte for byte.
///
/// Every buffer except the last must be a whole number of 16-byte blocks.
struct GcmStream {
    keystream: Ctr32BE<Aes256>,
    ghash: GHash,
    tag_mask: Block,
    len: u64,
}

fn key_error(e: impl std::fmt::Display) -> ExportError {
    ExportError::Encryption(format!("Invalid key length: {}", e))
}

/// GHASH length block: associated data bits, then message bits.
fn lengths_block(aad_len: u64, message_len: u64) -> Block {
    let mut block = Block::default();
    block[..8].copy_from_slice(&(aad_len * 8).to_be_bytes());
    block[8..].copy_from_slice(&(message_len * 8).to_be_bytes());
    block
}

impl GcmStream {
    fn new(key: &[u8], iv: &[u8]) -> PipelineResult<Self> {
        let cipher = Aes256::new_from_slice(key).map_err(key_error)?;
        let mut hash_key = Block::default();
        cipher.encrypt_block(&mut hash_key);
        let ghash = GHash::new_from_slice(&hash_key).map_err(key_error)?;

        // IVs other than 96 bits are hashed into the initial counter block.
        let mut counter_hash = ghash.clone();
        counter_hash.update_padded(iv);
        counter_hash.update(&[lengths_block(0, iv.len() as u64)]);
        let initial_counter = counter_hash.finalize();

        let mut keystream = Ctr32BE::<Aes256>::new_from_slices(key, &initial_counter).map_err(key_error)?;
        let mut tag_mask = Block::default();
        keystream.apply_keystream(&mut tag_mask);

        Ok(Self {
            keystream,
            ghash,
            tag_mask,
            len: 0,
        })
    }

    fn encrypt(&mut self, buffer: &mut [u8]) {
        self.keystream.apply_keystream(buffer);
        self.ghash.update_padded(buffer);
        self.len += buffer.len() as u64;
    }

    fn decrypt(&mut self, buffer: &mut [u8]) {
        self.ghash.update_padded(buffer);
        self.keystream.apply_keystream(buffer);
        self.len += buffer.len() as u64;
    }

    fn tag(mut self) -> Block {
        self.ghash.update(&[lengths_block(0, self.len)]);
        let mut tag = self.ghash.finalize();
        for (byte, mask) in tag.iter_mut().zip(self.tag_mask.iter()) {
            *byte ^= mask;
        }
        tag
    }
}

fn tags_match(expected: &[u8], actual: &[u8]) -> bool {
    expected.len() == actual.len()
        && expected
            .iter()
            .zip(actual)
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}

/// Fill `buffer` unless the reader runs dry first.
fn read_full(reader: &mut impl Read, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn temp_beside(path: &Path) -> PipelineResult<NamedTempFile> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    Ok(NamedTempFile::new_in(dir)?)
}

fn encrypt_file_blocking(path: &Path, password: &str, kdf: &KdfParams) -> PipelineResult<u64> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut iv);
    let key = derive_key(password, &salt, kdf)?;
    let mut stream = GcmStream::new(&key, &iv)?;

    let mut input = File::open(path)?;
    let temp = temp_beside(path)?;
    let mut output = BufWriter::new(temp.reopen()?);
    output.write_all(&salt)?;
    output.write_all(&iv)?;

    let mut buffer = vec![0u8; STREAM_BUFFER];
    loop {
        let read = read_full(&mut input, &mut buffer)?;
        if read == 0 {
            break;
        }
        stream.encrypt(&mut buffer[..read]);
        output.write_all(&buffer[..read])?;
        if read < buffer.len() {
            break;
        }
    }
    let plaintext_len = stream.len;
    output.write_all(&stream.tag())?;
    output.flush()?;
    drop(output);
    temp.as_file().sync_all()?;

    let size = temp.as_file().metadata()?.len();
    if size == 0 || size != plaintext_len + ENVELOPE_OVERHEAD as u64 {
        return Err(ExportError::Encryption(format!(
            "Refusing to replace {:?} with a {} byte envelope",
            path, size
        )));
    }
    temp.persist(path).map_err(|e| ExportError::Io(e.error.to_string()))?;
    log::debug!("Encrypted {:?}: {} -> {} bytes", path, plaintext_len, size);
    Ok(size)
}

fn decrypt_file_blocking(path: &Path, password: &str, kdf: &KdfParams) -> PipelineResult<u64> {
    let total = std::fs::metadata(path)?.len();
    if total < ENVELOPE_OVERHEAD as u64 {
        return Err(ExportError::DecryptionFailed(format!(
            "Envelope is {} bytes, shorter than the {} byte minimum",
            total, ENVELOPE_OVERHEAD
        )));
    }

    let mut input = BufReader::new(File::open(path)?);
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    input.read_exact(&mut salt)?;
    input.read_exact(&mut iv)?;
    let key = derive_key(password, &salt, kdf)?;
    let mut stream = GcmStream::new(&key, &iv)?;

    // Plaintext stays in the temp file until the tag checks out.
    let temp = temp_beside(path)?;
    let mut output = BufWriter::new(temp.reopen()?);
    let mut remaining = total - ENVELOPE_OVERHEAD as u64;
    let mut buffer = vec![0u8; STREAM_BUFFER];
    while remaining > 0 {
        let want = remaining.min(STREAM_BUFFER as u64) as usize;
        input.read_exact(&mut buffer[..want])?;
        stream.decrypt(&mut buffer[..want]);
        output.write_all(&buffer[..want])?;
        remaining -= want as u64;
    }
    let mut tag = [0u8; TAG_LEN];
    input.read_exact(&mut tag)?;

    let plaintext_len = stream.len;
    if !tags_match(&stream.tag(), &tag) {
        return Err(ExportError::DecryptionFailed(
            "Authentication failed: wrong password or corrupted data".to_string(),
        ));
    }
    output.flush()?;
    drop(output);
    temp.persist(path).map_err(|e| ExportError::Io(e.error.to_string()))?;
    Ok(plaintext_len)
}

/// Encrypt the file at `path` in place, streaming in fixed-size buffers.
/// Returns the envelope size.
pub async fn encrypt_file(path: &Path, password: &str, kdf: &KdfParams) -> PipelineResult<u64> {
    let path: PathBuf = path.to_path_buf();
    let password = password.to_string();
    let kdf = *kdf;
    task::spawn_blocking(move || encrypt_file_blocking(&path, &password, &kdf)).await?
}

/// Decrypt the file at `path` in place. Returns the plaintext size.
pub async fn decrypt_file(path: &Path, password: &str, kdf: &KdfParams) -> PipelineResult<u64> {
    let path: PathBuf = path.to_path_buf();
    let password = password.to_string();
    let kdf = *kdf;
    task::spawn_blocking(move || decrypt_file_blocking(&path, &password, &kdf)).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // Cheap parameters keep the tests fast.
    fn fast() -> KdfParams {
        KdfParams {
            m_cost: 64,
            t_cost: 1,
            p_cost: 1,
        }
    }

    #[test]
    fn test_round_trip() {
        let sealed = encrypt_bytes(b"row data", "secret", &fast()).unwrap();
        assert_eq!(sealed.len(), ENVELOPE_OVERHEAD + 8);
        assert_eq!(decrypt_bytes(&sealed, "secret", &fast()).unwrap(), b"row data");
    }

    #[test]
    fn test_wrong_password_fails_authentication() {
        let sealed = encrypt_bytes(b"row data", "secret", &fast()).unwrap();
        let err = decrypt_bytes(&sealed, "guess", &fast()).unwrap_err();
        assert_eq!(err.code(), "DECRYPTION_FAILED");
    }

    #[test]
    fn test_tampered_ciphertext_is_rejected() {
        let mut sealed = encrypt_bytes(b"row data", "secret", &fast()).unwrap();
        sealed[SALT_LEN + IV_LEN] ^= 0x01;
        assert!(matches!(
            decrypt_bytes(&sealed, "secret", &fast()),
            Err(ExportError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_truncated_envelope_is_rejected() {
        let err = decrypt_bytes(&[0u8; ENVELOPE_OVERHEAD - 1], "secret", &fast()).unwrap_err();
        assert!(matches!(err, ExportError::DecryptionFailed(_)));
    }

    #[test]
    fn test_salt_and_iv_are_fresh() {
        let a = encrypt_bytes(b"same", "secret", &fast()).unwrap();
        let b = encrypt_bytes(b"same", "secret", &fast()).unwrap();
        assert_ne!(&a[..SALT_LEN], &b[..SALT_LEN]);
        assert_ne!(&a[SALT_LEN..SALT_LEN + IV_LEN], &b[SALT_LEN..SALT_LEN + IV_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_kdf_params() {
        let params = KdfParams {
            m_cost: 1,
            t_cost: 0,
            p_cost: 1,
        };
        assert_eq!(params.validate().unwrap_err().code(), "CONFIGURATION_ERROR");
        assert!(KdfParams::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_file_round_trip_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunk_00000.json");
        std::fs::write(&path, b"[{\"a\":1}]").unwrap();

        let size = encrypt_file(&path, "secret", &fast()).await.unwrap();
        assert_eq!(size, (ENVELOPE_OVERHEAD + 9) as u64);
        assert_ne!(std::fs::read(&path).unwrap(), b"[{\"a\":1}]");

        decrypt_file(&path, "secret", &fast()).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"[{\"a\":1}]");
    }

    #[tokio::test]
    async fn test_failed_decrypt_leaves_file_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunk.csv");
        std::fs::write(&path, b"a,b\n").unwrap();
        encrypt_file(&path, "secret", &fast()).await.unwrap();
        let sealed = std::fs::read(&path).unwrap();

        assert!(decrypt_file(&path, "wrong", &fast()).await.is_err());
        assert_eq!(std::fs::read(&path).unwrap(), sealed);
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_streamed_file_opens_with_one_shot_decrypt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.parquet");
        // Several buffers plus a partial block at the end
        let content = patterned(STREAM_BUFFER * 3 + 1000 + 7);
        std::fs::write(&path, &content).unwrap();

        encrypt_file(&path, "secret", &fast()).await.unwrap();
        let sealed = std::fs::read(&path).unwrap();
        assert_eq!(sealed.len(), content.len() + ENVELOPE_OVERHEAD);
        assert_eq!(decrypt_bytes(&sealed, "secret", &fast()).unwrap(), content);
    }

    #[tokio::test]
    async fn test_one_shot_envelope_opens_with_streamed_decrypt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment.json");
        let content = patterned(STREAM_BUFFER + 33);
        std::fs::write(&path, encrypt_bytes(&content, "secret", &fast()).unwrap()).unwrap();

        let size = decrypt_file(&path, "secret", &fast()).await.unwrap();
        assert_eq!(size, content.len() as u64);
        assert_eq!(std::fs::read(&path).unwrap(), content);
    }

    #[tokio::test]
    async fn test_empty_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        std::fs::write(&path, b"").unwrap();

        assert_eq!(
            encrypt_file(&path, "secret", &fast()).await.unwrap(),
            ENVELOPE_OVERHEAD as u64
        );
        assert_eq!(decrypt_file(&path, "secret", &fast()).await.unwrap(), 0);
        assert!(std::fs::read(&path).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tampered_tail_of_large_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.csv");
        std::fs::write(&path, patterned(STREAM_BUFFER * 2)).unwrap();
        encrypt_file(&path, "secret", &fast()).await.unwrap();

        let mut sealed = std::fs::read(&path).unwrap();
        let last_cipher_byte = sealed.len() - TAG_LEN - 1;
        sealed[last_cipher_byte] ^= 0x80;
        std::fs::write(&path, &sealed).unwrap();

        let err = decrypt_file(&path, "secret", &fast()).await.unwrap_err();
        assert_eq!(err.code(), "DECRYPTION_FAILED");
        assert_eq!(std::fs::read(&path).unwrap(), sealed);
    }
}
