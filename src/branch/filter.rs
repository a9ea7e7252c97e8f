// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Approximate-membership filter attached to a branch as a trailer
//! extension
//!
//! A bloom filter over the user keys of the branch; a negative answer
//! lets the read path skip the branch entirely. Never has a false
//! negative.

use crate::Slice;

const BIT_MASK: u8 = 0b1000_0000_u8;

/// Composite hash, feeding the double-hashing scheme
pub type CompositeHash = (u64, u64);

fn secondary_hash(h1: u64) -> u64 {
    h1.wrapping_shr(32).wrapping_mul(0x51_7c_c1_b7_27_22_0a_95)
}

/// Gets the composite hash of a key.
#[must_use]
pub fn hash_key(key: &[u8]) -> CompositeHash {
    let h1 = xxhash_rust::xxh3::xxh3_64(key);
    (h1, secondary_hash(h1))
}

/// Builds the per-branch membership filter
#[derive(Debug)]
pub struct FilterBuilder {
    bits: Vec<u8>,

    /// Bit count
    m: usize,

    /// Number of hash functions
    k: usize,
}

impl FilterBuilder {
    /// Constructs a filter that can hold `n` keys with `bpk` bits per
    /// key.
    ///
    /// 10 bits per key is a sensible default.
    #[must_use]
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub fn with_bpk(n: usize, bpk: f32) -> Self {
        use std::f32::consts::LN_2;

        assert!(bpk > 0.0);

        let n = n.max(1);
        let m = n * (bpk as usize);
        let k = ((bpk * LN_2) as usize).max(1);

        // NOTE: Round up so we don't get too little bits
        let bytes = ((m as f32) / 8.0).ceil() as usize;

        Self {
            bits: vec![0; bytes.max(1)],
            m: bytes.max(1) * 8,
            k,
        }
    }

    /// Adds a key to the filter.
    pub fn insert(&mut self, key: &[u8]) {
        self.insert_hash(hash_key(key).0);
    }

    /// Adds a key by its buffered primary hash.
    pub fn insert_hash(&mut self, h1: u64) {
        let mut h1 = h1;
        let mut h2 = secondary_hash(h1);

        for i in 1..=(self.k as u64) {
            let idx = (h1 % (self.m as u64)) as usize;

            #[allow(clippy::indexing_slicing)]
            {
                self.bits[idx / 8] |= BIT_MASK >> (idx % 8);
            }

            h1 = h1.wrapping_add(h2);
            h2 = h2.wrapping_mul(i);
        }
    }

    /// Serializes the filter into its extension blob.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.bits.len());
        out.extend_from_slice(&(self.m as u64).to_be_bytes());
        out.extend_from_slice(&(self.k as u64).to_be_bytes());
        out.extend_from_slice(&self.bits);
        out
    }
}

/// A branch's membership filter, decoded from its extension blob
#[derive(Clone, Debug)]
pub struct BranchFilter {
    bits: Slice,
    m: usize,
    k: usize,
}

impl BranchFilter {
    /// Parses the extension blob.
    pub fn decode(blob: &Slice) -> crate::Result<Self> {
        if blob.len() < 16 {
            return Err(crate::Error::Decode(
                crate::coding::DecodeError::InvalidHeader("BranchFilter"),
            ));
        }

        #[allow(clippy::indexing_slicing, clippy::expect_used)]
        let m = u64::from_be_bytes(blob[0..8].try_into().expect("sized")) as usize;
        #[allow(clippy::indexing_slicing, clippy::expect_used)]
        let k = u64::from_be_bytes(blob[8..16].try_into().expect("sized")) as usize;

        if blob.len() < 16 + m / 8 || k == 0 {
            return Err(crate::Error::Decode(
                crate::coding::DecodeError::InvalidHeader("BranchFilter"),
            ));
        }

        Ok(Self {
            bits: blob.slice(16..),
            m,
            k,
        })
    }

    /// Returns `true` if the key may be contained.
    ///
    /// Will never have a false negative.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        let (mut h1, mut h2) = hash_key(key);

        for i in 1..=(self.k as u64) {
            let idx = (h1 % (self.m as u64)) as usize;

            #[allow(clippy::indexing_slicing)]
            let set = self.bits[idx / 8] & (BIT_MASK >> (idx % 8)) > 0;

            if !set {
                return false;
            }

            h1 = h1.wrapping_add(h2);
            h2 = h2.wrapping_mul(i);
        }

        true
    }

    /// Re-encodes the filter into its extension blob form.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_blob(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.bits.len());
        out.extend_from_slice(&(self.m as u64).to_be_bytes());
        out.extend_from_slice(&(self.k as u64).to_be_bytes());
        out.extend_from_slice(&self.bits);
        out
    }

    /// Size of the filter in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Whether the filter is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn filter_no_false_negatives() {
        let keys = (0..1000)
            .map(|n| format!("key-{n}"))
            .collect::<Vec<_>>();

        let mut builder = FilterBuilder::with_bpk(keys.len(), 10.0);
        for key in &keys {
            builder.insert(key.as_bytes());
        }

        let filter = BranchFilter::decode(&Slice::from(builder.build())).unwrap();

        for key in &keys {
            assert!(filter.contains(key.as_bytes()));
        }
    }

    #[test]
    fn filter_mostly_rejects_absent_keys() {
        let mut builder = FilterBuilder::with_bpk(100, 10.0);
        for n in 0..100 {
            builder.insert(format!("key-{n}").as_bytes());
        }

        let filter = BranchFilter::decode(&Slice::from(builder.build())).unwrap();

        let false_positives = (0..1000)
            .filter(|n| filter.contains(format!("other-{n}").as_bytes()))
            .count();

        // 10 bpk gives ~1% fpr; leave lots of slack
        assert!(false_positives < 100, "{false_positives} false positives");
    }
}
