//! SHA-256 tree hash as used by the archival service to verify uploads.
//!
//! Data is split into 1 MiB chunks, each chunk is hashed, and adjacent
//! digests are hashed together level by level until one remains. An odd
//! digest at the end of a level is promoted unchanged.

use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

pub const CHUNK_SIZE: usize = 1024 * 1024;

pub type Hash = [u8; 32];

/// Incremental tree hasher. Feed it bytes in any slicing, then call
/// [`TreeHasher::finish`].
#[derive(Default)]
pub struct TreeHasher {
    leaves: Vec<Hash>,
    current: Sha256,
    filled: usize,
}

impl TreeHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (CHUNK_SIZE - self.filled).min(data.len());
            self.current.update(&data[..take]);
            self.filled += take;
            data = &data[take..];

            if self.filled == CHUNK_SIZE {
                self.flush_leaf();
            }
        }
    }

    fn flush_leaf(&mut self) {
        let hasher = std::mem::take(&mut self.current);
        self.leaves.push(hasher.finalize().into());
        self.filled = 0;
    }

    /// Digests of every complete or trailing chunk seen so far.
    pub fn into_leaves(mut self) -> Vec<Hash> {
        if self.filled > 0 || self.leaves.is_empty() {
            self.flush_leaf();
        }
        self.leaves
    }

    pub fn finish(self) -> Hash {
        combine(&self.into_leaves())
    }
}

/// Reduces leaf digests to the root digest.
pub fn combine(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return Sha256::digest(b"").into();
    }

    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => {
                    let mut hasher = Sha256::new();
                    hasher.update(left);
                    hasher.update(right);
                    hasher.finalize().into()
                }
                [single] => *single,
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
    }
    level[0]
}

pub fn tree_hash(data: &[u8]) -> Hash {
    let mut hasher = TreeHasher::new();
    hasher.update(data);
    hasher.finish()
}

pub fn tree_hash_hex(data: &[u8]) -> String {
    hex::encode(tree_hash(data))
}

/// Leaf digests of a whole file, read in chunk-sized blocks.
pub fn file_leaves(path: &Path) -> Result<Vec<Hash>> {
    let file = File::open(path).map_err(|e| Error::path(path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = TreeHasher::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let read = reader.read(&mut buffer).map_err(|e| Error::path(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.into_leaves())
}

pub fn file_tree_hash(path: &Path) -> Result<String> {
    Ok(hex::encode(combine(&file_leaves(path)?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha(data: &[u8]) -> Hash {
        Sha256::digest(data).into()
    }

    fn pair(left: &Hash, right: &Hash) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(left);
        hasher.update(right);
        hasher.finalize().into()
    }

    #[test]
    fn test_small_input_is_plain_sha256() {
        let data = b"glacier tree hash";
        assert_eq!(tree_hash(data), sha(data));
        assert_eq!(tree_hash(&[]), sha(&[]));
    }

    #[test]
    fn test_three_chunks_promote_odd_leaf() {
        let data: Vec<u8> = (0..(2 * CHUNK_SIZE + 10)).map(|i| (i % 251) as u8).collect();

        let a = sha(&data[..CHUNK_SIZE]);
        let b = sha(&data[CHUNK_SIZE..2 * CHUNK_SIZE]);
        let c = sha(&data[2 * CHUNK_SIZE..]);
        let expected = pair(&pair(&a, &b), &c);

        assert_eq!(tree_hash(&data), expected);
    }

    #[test]
    fn test_incremental_updates_match_single_update() {
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3 / 2)).map(|i| (i % 7) as u8).collect();

        let mut hasher = TreeHasher::new();
        for piece in data.chunks(4096 + 3) {
            hasher.update(piece);
        }

        assert_eq!(hasher.finish(), tree_hash(&data));
    }

    #[test]
    fn test_parts_combine_to_whole() {
        let data: Vec<u8> = (0..(4 * CHUNK_SIZE + 1)).map(|i| (i % 13) as u8).collect();

        let mut leaves = Vec::new();
        for part in data.chunks(2 * CHUNK_SIZE) {
            let mut hasher = TreeHasher::new();
            hasher.update(part);
            leaves.extend(hasher.into_leaves());
        }

        assert_eq!(combine(&leaves), tree_hash(&data));
    }
}
