//! Block-level prompt fingerprinting.
//!
//! Prompts are normalized to single-space word runs and split into
//! fixed-size word blocks; each complete block is hashed into a stable
//! 64-bit signature. Two prompts that diverge mid-block still share all
//! prior block signatures, which quantizes "longest common prefix" to
//! whole blocks. Words are a deliberately coarse proxy for the model's
//! tokens; the backend revalidates whatever prefix is restored.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable signature of one normalized word block.
///
/// The first 8 bytes of a SHA-256 digest: deterministic across processes
/// and Rust versions, collision-negligible at catalog sizes up to ~10^6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockSig(pub u64);

impl BlockSig {
    fn of(block: &str) -> Self {
        let digest = Sha256::digest(block.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        BlockSig(u64::from_be_bytes(head))
    }
}

/// Ordered block signatures of a prompt plus its total word count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub signatures: Vec<BlockSig>,
    pub word_count: usize,
}

impl Fingerprint {
    pub fn blocks(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

/// Concatenate message contents into the canonical prompt text.
///
/// Non-empty parts are trimmed and joined by a blank line, with the
/// optional system preamble first, in the order the backend sees them.
pub fn raw_prompt<'a>(
    parts: impl IntoIterator<Item = &'a str>,
    preamble: Option<&str>,
) -> String {
    let mut pieces: Vec<&str> = Vec::new();
    if let Some(pre) = preamble {
        let pre = pre.trim();
        if !pre.is_empty() {
            pieces.push(pre);
        }
    }
    for part in parts {
        let part = part.trim();
        if !part.is_empty() {
            pieces.push(part);
        }
    }
    pieces.join("\n\n")
}

/// Compute the fingerprint of a prompt.
///
/// Whitespace runs collapse to a single space, leading/trailing whitespace
/// is trimmed, and only complete `words_per_block`-word blocks produce a
/// signature. A trailing partial block counts toward `word_count` only.
pub fn fingerprint(text: &str, words_per_block: usize) -> Fingerprint {
    let words: Vec<&str> = text.split_whitespace().collect();
    let signatures = words
        .chunks_exact(words_per_block)
        .map(|chunk| BlockSig::of(&chunk.join(" ")))
        .collect();
    Fingerprint {
        signatures,
        word_count: words.len(),
    }
}

/// Longest common prefix of two signature sequences, in blocks.
pub fn lcp(a: &[BlockSig], b: &[BlockSig]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
