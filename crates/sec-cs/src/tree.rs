//! Chunk-tree construction and traversal over the refcounted node store.
//!
//! A content is decomposed bottom-up: the splitter cuts it into leaf chunks,
//! then each level's child records are grouped with the record-aligned
//! splitter until a single root remains. Node plaintexts are tagged so leaf
//! and internal nodes stay distinguishable after decryption, and every
//! structural quantity a parent records about a child is validated on read.

use std::ops::Range;

use cdc::{Chunker, RecordChunker};
use node_store::{Backend, CryptoWrapper, Digest, NodeStore};

use crate::Error;

const TAG_LEAF: u8 = 0x00;
const TAG_INTERNAL: u8 = 0x01;

/// A child reference as recorded inside an internal node: the child's digest
/// plus the total byte length of its subtree.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChildRef {
    pub digest: Digest,
    pub len: u64,
}

fn push_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn read_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        value |= u64::from(b & 0x7F) << shift;
        if b & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

fn encode_record(buf: &mut Vec<u8>, child: &ChildRef) {
    buf.extend_from_slice(&child.digest.0);
    push_uvarint(buf, child.len);
}

fn decode_records(payload: &[u8]) -> Result<Vec<ChildRef>, Error> {
    let mut children = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        if rest.len() < Digest::SIZE {
            return Err(Error::Authenticity);
        }
        let mut d = [0u8; Digest::SIZE];
        d.copy_from_slice(&rest[..Digest::SIZE]);
        let (len, used) = read_uvarint(&rest[Digest::SIZE..]).ok_or(Error::Authenticity)?;
        children.push(ChildRef { digest: Digest(d), len });
        rest = &rest[Digest::SIZE + used..];
    }
    if children.is_empty() {
        return Err(Error::Authenticity);
    }
    Ok(children)
}

/// Build the tree for `content` bottom-up, inserting every node, and return
/// the root reference. A zero-length content maps to a single canonical
/// empty leaf.
pub(crate) fn build<B: Backend, C: CryptoWrapper>(
    store: &NodeStore<B, C>,
    leaf_chunker: &Chunker,
    node_chunker: &RecordChunker,
    content: &[u8],
) -> Result<ChildRef, Error> {
    if content.is_empty() {
        let digest = store.insert(&[TAG_LEAF])?;
        return Ok(ChildRef { digest, len: 0 });
    }

    let mut buf = Vec::with_capacity(leaf_chunker.max_size() + 1);
    let mut level: Vec<ChildRef> = Vec::new();
    for chunk in leaf_chunker.split(content) {
        buf.clear();
        buf.push(TAG_LEAF);
        buf.extend_from_slice(&content[chunk.offset..chunk.offset + chunk.len]);
        let digest = store.insert(&buf)?;
        level.push(ChildRef { digest, len: chunk.len as u64 });
    }

    while level.len() > 1 {
        let records: Vec<Vec<u8>> = level
            .iter()
            .map(|child| {
                let mut r = Vec::with_capacity(Digest::SIZE + 10);
                encode_record(&mut r, child);
                r
            })
            .collect();
        let mut next = Vec::new();
        for group in node_chunker.split(&records) {
            let mut plaintext = vec![TAG_INTERNAL];
            let mut total = 0u64;
            for (record, child) in records[group.clone()].iter().zip(&level[group]) {
                plaintext.extend_from_slice(record);
                total += child.len;
            }
            let digest = store.insert(&plaintext)?;
            next.push(ChildRef { digest, len: total });
        }
        level = next;
    }
    Ok(level.swap_remove(0))
}

/// Read `range` (already clamped to the content length) from the tree rooted
/// at `root`. The root node is always fetched, so reading from a deleted
/// tree reports `NotFound` even for an empty range.
pub(crate) fn read<B: Backend, C: CryptoWrapper>(
    store: &NodeStore<B, C>,
    root: &ChildRef,
    range: Range<u64>,
) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity((range.end - range.start) as usize);
    walk(store, root.digest, root.len, range, &mut out)?;
    Ok(out)
}

fn walk<B: Backend, C: CryptoWrapper>(
    store: &NodeStore<B, C>,
    digest: Digest,
    node_len: u64,
    range: Range<u64>,
    out: &mut Vec<u8>,
) -> Result<(), Error> {
    let plaintext = store.fetch(&digest)?;
    let (tag, payload) = plaintext.split_first().ok_or(Error::Authenticity)?;
    match *tag {
        TAG_LEAF => {
            if payload.len() as u64 != node_len {
                return Err(Error::Authenticity);
            }
            out.extend_from_slice(&payload[range.start as usize..range.end as usize]);
            Ok(())
        }
        TAG_INTERNAL => {
            let children = decode_records(payload)?;
            let mut total = 0u64;
            for child in &children {
                total = total.checked_add(child.len).ok_or(Error::Authenticity)?;
            }
            if total != node_len {
                return Err(Error::Authenticity);
            }
            let mut offset = 0u64;
            for child in &children {
                let start = range.start.max(offset);
                let end = range.end.min(offset + child.len);
                if start < end {
                    walk(store, child.digest, child.len, start - offset..end - offset, out)?;
                }
                offset += child.len;
            }
            Ok(())
        }
        _ => Err(Error::Authenticity),
    }
}

/// Undo one insertion of the tree rooted at `digest`: visit every node the
/// matching build inserted, exactly once, and release it.
pub(crate) fn delete<B: Backend, C: CryptoWrapper>(
    store: &NodeStore<B, C>,
    digest: Digest,
) -> Result<(), Error> {
    let plaintext = store.fetch(&digest)?;
    let (tag, payload) = plaintext.split_first().ok_or(Error::Authenticity)?;
    match *tag {
        TAG_LEAF => {}
        TAG_INTERNAL => {
            for child in decode_records(payload)? {
                delete(store, child.digest)?;
            }
        }
        _ => return Err(Error::Authenticity),
    }
    store.release(&digest)?;
    Ok(())
}
