use std::collections::BTreeMap;

use context_core::SparseVector;
use sha2::{Digest, Sha256};

use crate::SparseEncoder;

/// Hashed bag-of-words encoder: tokens are lowercased, hashed into a
/// fixed index space, and weighted by term frequency. Good enough as the
/// lexical leg of rank fusion; a server-side sparse model can replace it
/// behind the same trait.
pub struct HashedSparseEncoder {
    buckets: u32,
}

impl HashedSparseEncoder {
    pub fn new(buckets: u32) -> Self {
        Self { buckets }
    }

    fn bucket(&self, token: &str) -> u32 {
        let digest = Sha256::digest(token.as_bytes());
        let raw = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
        raw % self.buckets
    }
}

impl Default for HashedSparseEncoder {
    fn default() -> Self {
        Self::new(1 << 16)
    }
}

impl SparseEncoder for HashedSparseEncoder {
    fn encode(&self, text: &str) -> SparseVector {
        let mut counts: BTreeMap<u32, f32> = BTreeMap::new();
        for token in text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| t.len() > 1)
        {
            *counts.entry(self.bucket(&token.to_lowercase())).or_insert(0.0) += 1.0;
        }

        // Dampen raw term frequency so long chunks do not dominate.
        let (indices, values) = counts
            .into_iter()
            .map(|(i, c)| (i, 1.0 + c.ln()))
            .unzip();
        SparseVector { indices, values }
    }
}
