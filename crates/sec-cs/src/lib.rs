//! Secure content store (deduplicating CAS over an untrusted key-value
//! backend).
//!
//! Overview
//! - Contents are cut into chunks by a content-defined splitter and stored as
//!   a tree of encrypted nodes; chunks and whole subtrees shared between
//!   contents are stored once and reference-counted.
//! - Identity is convergent: the same bytes under the same key always produce
//!   the same node digests and the same [`Handle`], so repeated insertions
//!   cost no extra storage and a small edit to a large content adds only the
//!   nodes along one root-to-leaf path.
//! - The backend is untrusted: every node is sealed with an authenticated
//!   wrapper and verified against its digest on read. Any mutation surfaces
//!   as [`Error::Authenticity`]; the store never returns corrupted bytes.
//! - Deletion is exact: the N-th [`SecureContentStore::delete_content`] of a
//!   handle undoes the N-th [`SecureContentStore::put_content`] of the same
//!   bytes, returning the backend to its prior state once counts balance.
//!
//! Determinism guarantees
//! - Chunk boundaries, node encodings, digests, and ciphertexts are pure
//!   functions of the content, the master key, and the frozen configuration.
//! - No wall-clock input, no hash-map iteration order, no randomness.
//!
//! Usage example
//! ```rust
//! use sec_cs::{Config, ConvergentAes, MemoryBackend, SecureContentStore};
//! let store = SecureContentStore::new(
//!     Config::with_chunk_size(4096),
//!     MemoryBackend::new(),
//!     ConvergentAes::new([0x11; 32]),
//! );
//! let handle = store.put_content(b"hello").unwrap();
//! assert_eq!(store.get_content(&handle).unwrap(), b"hello");
//! store.delete_content(&handle).unwrap();
//! ```

#![deny(unsafe_code)]

mod tree;

use std::ops::Range;

use cdc::{Chunker, RecordChunker};
use tracing::{debug, trace};

pub use node_store::{
    Backend, ConvergentAes, CryptoWrapper, Digest, DirBackend, MemoryBackend, NodeStore,
};

/// Error type for content store operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Underlying backend I/O failure, propagated unchanged.
    #[error("backend: {0}")]
    Backend(#[from] std::io::Error),
    /// A node reachable from the handle failed verification; the tree is
    /// invalid and the operation aborts.
    #[error("authenticity: content failed verification")]
    Authenticity,
    /// A digest referenced during the operation is absent from the backend.
    #[error("not found")]
    NotFound,
    /// An encoded handle does not have the expected length.
    #[error("invalid handle")]
    InvalidHandle,
}

impl From<node_store::Error> for Error {
    fn from(e: node_store::Error) -> Self {
        match e {
            node_store::Error::Backend(io) => Error::Backend(io),
            node_store::Error::Authenticity => Error::Authenticity,
            node_store::Error::NotFound => Error::NotFound,
        }
    }
}

/// Caller-visible content handle: the root digest plus the content length.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Handle {
    digest: Digest,
    len: u64,
}

impl Handle {
    /// Encoded handle width: digest bytes followed by a big-endian u64
    /// length.
    pub const ENCODED_LEN: usize = Digest::SIZE + 8;

    /// Root digest of the content tree.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Content length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True for the handle of a zero-length content.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Encode to opaque bytes (`digest || length`).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&self.digest.0);
        out.extend_from_slice(&self.len.to_be_bytes());
        out
    }

    /// Decode from bytes produced by [`Handle::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(Error::InvalidHandle);
        }
        let mut d = [0u8; Digest::SIZE];
        d.copy_from_slice(&bytes[..Digest::SIZE]);
        let mut l = [0u8; 8];
        l.copy_from_slice(&bytes[Digest::SIZE..]);
        Ok(Self { digest: Digest(d), len: u64::from_be_bytes(l) })
    }
}

/// Content store configuration, frozen at construction.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Target average chunk size in bytes, for leaf chunks and internal
    /// record groups alike.
    pub avg_chunk_size: u32,
}

impl Config {
    /// Config with the given target average chunk size.
    pub fn with_chunk_size(avg_chunk_size: u32) -> Self {
        Self { avg_chunk_size }
    }
}

/// The content store façade: binds the splitter, the crypto wrapper, and the
/// refcounted node store into `put`/`get`/`delete` over whole contents.
pub struct SecureContentStore<B: Backend, C: CryptoWrapper> {
    store: NodeStore<B, C>,
    leaf_chunker: Chunker,
    node_chunker: RecordChunker,
}

impl<B: Backend, C: CryptoWrapper> SecureContentStore<B, C> {
    /// Create a store over `backend`, sealing nodes with `crypto`.
    ///
    /// # Panics
    ///
    /// Panics if `cfg.avg_chunk_size` lies outside
    /// [`cdc::AVERAGE_MIN`]..=[`cdc::AVERAGE_MAX`].
    pub fn new(cfg: Config, backend: B, crypto: C) -> Self {
        Self {
            store: NodeStore::new(backend, crypto),
            leaf_chunker: Chunker::new(cfg.avg_chunk_size),
            node_chunker: RecordChunker::new(cfg.avg_chunk_size),
        }
    }

    /// Backend handle, mainly for inspection in tests.
    pub fn backend(&self) -> &B {
        self.store.backend()
    }

    /// Store `content` and return its handle. Nodes already present from
    /// earlier insertions are shared, not rewritten.
    pub fn put_content(&self, content: &[u8]) -> Result<Handle, Error> {
        let root = tree::build(&self.store, &self.leaf_chunker, &self.node_chunker, content)?;
        debug!(len = content.len(), digest = %root.digest.to_hex(), "content stored");
        Ok(Handle { digest: root.digest, len: root.len })
    }

    /// Retrieve the exact bytes previously stored under `handle`.
    pub fn get_content(&self, handle: &Handle) -> Result<Vec<u8>, Error> {
        self.read_range(handle, 0..handle.len)
    }

    /// Retrieve `range` of the content under `handle`. The range is clamped
    /// to the content length; a random access touches O(log n) nodes.
    pub fn read_range(&self, handle: &Handle, range: Range<u64>) -> Result<Vec<u8>, Error> {
        let end = range.end.min(handle.len);
        let start = range.start.min(end);
        trace!(digest = %handle.digest.to_hex(), start, end, "content read");
        let root = tree::ChildRef { digest: handle.digest, len: handle.len };
        tree::read(&self.store, &root, start..end)
    }

    /// Undo one insertion of the content under `handle`. Nodes whose last
    /// reference this was are physically removed. Not idempotent: deleting
    /// an already-deleted handle fails with [`Error::NotFound`].
    pub fn delete_content(&self, handle: &Handle) -> Result<(), Error> {
        debug!(digest = %handle.digest.to_hex(), len = handle.len, "content delete");
        tree::delete(&self.store, handle.digest)
    }
}
