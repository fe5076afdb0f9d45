//! Password-based envelope encryption for export artifacts.

pub mod envelope;

pub use envelope::{
    decrypt_bytes, decrypt_file, derive_key, encrypt_bytes, encrypt_file, KdfParams, ENVELOPE_OVERHEAD,
    IV_LEN, KEY_LEN, SALT_LEN, TAG_LEN,
};
