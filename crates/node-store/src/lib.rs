//! Encrypted, reference-counted node storage over an untrusted key-value
//! backend.
//!
//! Overview
//! - Content-addressable identity: every node plaintext maps to a 32-byte
//!   digest computed under the master key; equal plaintexts always map to the
//!   same digest and the same ciphertext (convergent encryption).
//! - Authenticity: nodes are sealed with AES-256-GCM and the digest is
//!   recomputed over the decrypted plaintext on every read, so any mutation
//!   by the backend surfaces as [`Error::Authenticity`].
//! - Reference counting: each stored entry carries an 8-byte big-endian
//!   count ahead of the ciphertext. The N-th [`NodeStore::release`] of a
//!   digest undoes exactly the N-th [`NodeStore::insert`]; the entry is
//!   physically removed when the count reaches zero.
//! - Fail-closed: a malformed stored value, a bad tag, or a digest mismatch
//!   aborts the operation; errors never include key material.
//!
//! The backend is untrusted and minimal: `get`/`put`/`delete` over opaque
//! byte strings. Two implementations ship here, an in-memory map for tests
//! and development and a sharded directory layout for durable single-host
//! storage.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::{fs, io, path::PathBuf};

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use sha2::digest::{FixedOutput as ShaFixedOutput, Update as ShaUpdate};
use subtle::ConstantTimeEq;
use tracing::trace;

/// 32-byte node address derived from the node plaintext under the master key.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// Digest width in bytes.
    pub const SIZE: usize = 32;

    /// Hex-encoded lowercase string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Error type for node store operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Underlying backend I/O failure, propagated unchanged.
    #[error("backend: {0}")]
    Backend(#[from] io::Error),
    /// Verification failure on read: bad tag, digest mismatch, or a stored
    /// value too mangled to carry one.
    #[error("authenticity: node failed verification")]
    Authenticity,
    /// Digest not present in the backend.
    #[error("not found")]
    NotFound,
}

/// Address-and-seal / open-and-verify for node plaintexts.
///
/// `wrap` must be deterministic: for a fixed key and plaintext, digest and
/// ciphertext are fixed. `unwrap` must reject any ciphertext that `wrap`
/// would not have produced for that digest under the same key.
pub trait CryptoWrapper: Send + Sync {
    /// Compute the digest for `plaintext` and seal it.
    fn wrap(&self, plaintext: &[u8]) -> Result<(Digest, Vec<u8>), Error>;
    /// Open `ciphertext` and verify it against `digest`.
    fn unwrap(&self, digest: &Digest, ciphertext: &[u8]) -> Result<Vec<u8>, Error>;
}

/// Convergent AEAD wrapper: keyed SHA-256 digest, digest-derived nonce,
/// AES-256-GCM ciphertext.
///
/// The digest doubles as the address and as the nonce source, so identical
/// plaintexts under the same key produce identical ciphertexts. Deterministic
/// nonces reveal duplicate nodes across writes for the same key; that is the
/// point of a deduplicating store. On `unwrap`, the AEAD tag authenticates
/// the ciphertext and the recomputed digest binds the plaintext to the
/// address, compared in constant time.
pub struct ConvergentAes {
    key: [u8; 32],
    cipher: Aes256Gcm,
}

impl ConvergentAes {
    /// Create a wrapper with the provided 32-byte master key.
    pub fn new(key: [u8; 32]) -> Self {
        #[allow(deprecated)]
        let k = aes_gcm::Key::<Aes256Gcm>::from_slice(&key);
        Self { key, cipher: Aes256Gcm::new(k) }
    }

    fn keyed_digest(&self, plaintext: &[u8]) -> Digest {
        let mut h = sha2::Sha256::default();
        ShaUpdate::update(&mut h, &self.key);
        ShaUpdate::update(&mut h, plaintext);
        let out = ShaFixedOutput::finalize_fixed(h);
        let mut d = [0u8; 32];
        d.copy_from_slice(&out);
        Digest(d)
    }
}

impl CryptoWrapper for ConvergentAes {
    fn wrap(&self, plaintext: &[u8]) -> Result<(Digest, Vec<u8>), Error> {
        let digest = self.keyed_digest(plaintext);
        #[allow(deprecated)]
        let nonce = Nonce::from_slice(&digest.0[..12]);
        let ciphertext =
            self.cipher.encrypt(nonce, plaintext).map_err(|_| Error::Authenticity)?;
        Ok((digest, ciphertext))
    }

    fn unwrap(&self, digest: &Digest, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        #[allow(deprecated)]
        let nonce = Nonce::from_slice(&digest.0[..12]);
        let plaintext =
            self.cipher.decrypt(nonce, ciphertext).map_err(|_| Error::Authenticity)?;
        let computed = self.keyed_digest(&plaintext);
        if bool::from(computed.0.ct_eq(&digest.0)) {
            Ok(plaintext)
        } else {
            Err(Error::Authenticity)
        }
    }
}

/// Minimal key-value backend consumed by the store.
///
/// Keys are fixed-width digest bytes; values are opaque byte strings. A
/// single `put`/`delete` is assumed atomic. No iteration is required.
pub trait Backend: Send + Sync {
    /// Fetch the value for `key`, or `None` if absent.
    fn get(&self, key: &[u8]) -> io::Result<Option<Vec<u8>>>;
    /// Store `value` under `key`, overwriting any previous value.
    fn put(&self, key: &[u8], value: Vec<u8>) -> io::Result<()>;
    /// Remove `key`; returns false if it was absent.
    fn delete(&self, key: &[u8]) -> io::Result<bool>;
}

/// In-memory backend for tests and development.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Total stored bytes (keys plus values).
    pub fn byte_size(&self) -> usize {
        self.lock().iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    /// Clone of the full key-value map, for exact state comparisons in tests.
    pub fn snapshot(&self) -> HashMap<Vec<u8>, Vec<u8>> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Vec<u8>, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Backend for MemoryBackend {
    fn get(&self, key: &[u8]) -> io::Result<Option<Vec<u8>>> {
        Ok(self.lock().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> io::Result<()> {
        self.lock().insert(key.to_vec(), value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> io::Result<bool> {
        Ok(self.lock().remove(key).is_some())
    }
}

/// Directory-backed backend: one file per key under sharded `aa/bb/<hex>`
/// paths, written via a temporary file, `fsync`, and atomic rename.
pub struct DirBackend {
    root: PathBuf,
}

impl DirBackend {
    /// Create or open a backend rooted at `root`.
    pub fn new(root: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Deterministic file path for a key (sharded `aa/bb/<hex>`).
    pub fn path_for(&self, key: &[u8]) -> PathBuf {
        let hex = hex::encode(key);
        let (a, b) = (&hex[0..2], &hex[2..4]);
        self.root.join(a).join(b).join(hex)
    }
}

impl Backend for DirBackend {
    fn get(&self, key: &[u8]) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> io::Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("incomplete");
        {
            use std::io::Write;
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&value)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        if let Some(parent) = path.parent() {
            if let Ok(dirf) = fs::File::open(parent) {
                let _ = dirf.sync_all();
            }
        }
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> io::Result<bool> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

const REFCOUNT_LEN: usize = 8;
const LOCK_STRIPES: usize = 64;

fn encode_value(count: u64, ciphertext: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(REFCOUNT_LEN + ciphertext.len());
    value.extend_from_slice(&count.to_be_bytes());
    value.extend_from_slice(ciphertext);
    value
}

fn decode_value(value: &[u8]) -> Result<(u64, &[u8]), Error> {
    if value.len() < REFCOUNT_LEN {
        return Err(Error::Authenticity);
    }
    let mut prefix = [0u8; REFCOUNT_LEN];
    prefix.copy_from_slice(&value[..REFCOUNT_LEN]);
    Ok((u64::from_be_bytes(prefix), &value[REFCOUNT_LEN..]))
}

/// Reference-counted, encrypted node store over a [`Backend`].
///
/// Updates to a given digest are serialized through a striped lock table, so
/// concurrent `insert`/`release` on the same digest observe the count state
/// machine as if run in some total order.
pub struct NodeStore<B: Backend, C: CryptoWrapper> {
    backend: B,
    crypto: C,
    locks: Vec<Mutex<()>>,
}

impl<B: Backend, C: CryptoWrapper> NodeStore<B, C> {
    /// Create a store over `backend` sealing nodes with `crypto`.
    pub fn new(backend: B, crypto: C) -> Self {
        Self { backend, crypto, locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect() }
    }

    /// Backend handle, mainly for inspection in tests.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn stripe(&self, digest: &Digest) -> std::sync::MutexGuard<'_, ()> {
        self.locks[digest.0[0] as usize % LOCK_STRIPES]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Seal and store `plaintext`, returning its digest. If the digest is
    /// already present, the stored ciphertext is kept and only the count is
    /// bumped.
    pub fn insert(&self, plaintext: &[u8]) -> Result<Digest, Error> {
        let (digest, ciphertext) = self.crypto.wrap(plaintext)?;
        let _guard = self.stripe(&digest);
        match self.backend.get(&digest.0)? {
            Some(value) => {
                let (count, stored) = decode_value(&value)?;
                let next = count.saturating_add(1);
                self.backend.put(&digest.0, encode_value(next, stored))?;
                trace!(digest = %digest.to_hex(), count = next, "node refcount bumped");
            }
            None => {
                self.backend.put(&digest.0, encode_value(1, &ciphertext))?;
                trace!(digest = %digest.to_hex(), "node stored");
            }
        }
        Ok(digest)
    }

    /// Retrieve and verify the plaintext for `digest`.
    pub fn fetch(&self, digest: &Digest) -> Result<Vec<u8>, Error> {
        let value = {
            let _guard = self.stripe(digest);
            self.backend.get(&digest.0)?.ok_or(Error::NotFound)?
        };
        let (_count, ciphertext) = decode_value(&value)?;
        self.crypto.unwrap(digest, ciphertext)
    }

    /// Decrement the count for `digest`, removing the entry when it reaches
    /// zero. Not idempotent: releasing an absent digest is an error.
    pub fn release(&self, digest: &Digest) -> Result<(), Error> {
        let _guard = self.stripe(digest);
        let value = self.backend.get(&digest.0)?.ok_or(Error::NotFound)?;
        let (count, ciphertext) = decode_value(&value)?;
        if count <= 1 {
            self.backend.delete(&digest.0)?;
            trace!(digest = %digest.to_hex(), "node removed");
        } else {
            self.backend.put(&digest.0, encode_value(count - 1, ciphertext))?;
            trace!(digest = %digest.to_hex(), count = count - 1, "node refcount dropped");
        }
        Ok(())
    }

    /// Current reference count for `digest`, or `None` if absent.
    pub fn refcount(&self, digest: &Digest) -> Result<Option<u64>, Error> {
        let _guard = self.stripe(digest);
        match self.backend.get(&digest.0)? {
            Some(value) => Ok(Some(decode_value(&value)?.0)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_encoding_roundtrip() {
        let v = encode_value(3, b"ct");
        assert_eq!(v.len(), REFCOUNT_LEN + 2);
        let (count, ct) = decode_value(&v).unwrap();
        assert_eq!(count, 3);
        assert_eq!(ct, b"ct");
    }

    #[test]
    fn short_value_is_rejected() {
        assert!(matches!(decode_value(&[0u8; 4]), Err(Error::Authenticity)));
    }

    #[test]
    fn wrap_is_convergent_and_keyed() {
        let w1 = ConvergentAes::new([1u8; 32]);
        let w2 = ConvergentAes::new([1u8; 32]);
        let w3 = ConvergentAes::new([2u8; 32]);
        let (d1, c1) = w1.wrap(b"node").unwrap();
        let (d2, c2) = w2.wrap(b"node").unwrap();
        let (d3, _) = w3.wrap(b"node").unwrap();
        assert_eq!(d1, d2);
        assert_eq!(c1, c2);
        assert_ne!(d1, d3);
    }

    #[test]
    fn unwrap_rejects_foreign_digest() {
        let w = ConvergentAes::new([1u8; 32]);
        let (_d1, c1) = w.wrap(b"one").unwrap();
        let (d2, _c2) = w.wrap(b"two").unwrap();
        assert!(matches!(w.unwrap(&d2, &c1), Err(Error::Authenticity)));
    }
}
