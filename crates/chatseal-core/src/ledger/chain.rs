//! In-memory chain with secondary indexes, and whole-chain verification.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::block::{meets_difficulty, Block, BlockType, GENESIS_PREVIOUS_HASH};

/// Result of walking a chain from genesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub blocks_verified: u64,
    pub first_invalid_index: Option<u64>,
    pub error_message: Option<String>,
}

impl ChainVerification {
    fn ok(blocks_verified: u64) -> Self {
        Self {
            valid: true,
            blocks_verified,
            first_invalid_index: None,
            error_message: None,
        }
    }

    fn broken(position: usize, message: String) -> Self {
        Self {
            valid: false,
            blocks_verified: position as u64,
            first_invalid_index: Some(position as u64),
            error_message: Some(message),
        }
    }
}

/// Verify a sequence of blocks as a complete chain: a genesis block first,
/// then each block linked to and indexed after its predecessor, with every
/// stored hash matching its recomputation.
///
/// The proof-of-work prefix is checked on append, not here, so history
/// mined under an earlier difficulty setting stays valid.
pub fn verify_blocks(blocks: &[Block]) -> ChainVerification {
    let Some(genesis) = blocks.first() else {
        return ChainVerification::broken(0, "chain is empty".into());
    };
    if genesis.index != 0
        || genesis.previous_hash != GENESIS_PREVIOUS_HASH
        || genesis.payload.block_type != BlockType::Genesis
    {
        return ChainVerification::broken(0, "first block is not a genesis block".into());
    }
    if !genesis.has_valid_hash() {
        return ChainVerification::broken(0, "genesis hash mismatch".into());
    }

    for (position, pair) in blocks.windows(2).enumerate() {
        let (previous, current) = (&pair[0], &pair[1]);
        if let Err(reason) = check_link(previous, current) {
            return ChainVerification::broken(position + 1, reason);
        }
    }
    ChainVerification::ok(blocks.len() as u64)
}

/// Validate a freshly mined block against the current head.
pub fn validate_successor(head: &Block, candidate: &Block, difficulty: usize) -> Result<(), String> {
    check_link(head, candidate)?;
    if !meets_difficulty(&candidate.hash, difficulty) {
        return Err(format!(
            "block {} hash {} does not meet difficulty {}",
            candidate.index, candidate.hash, difficulty
        ));
    }
    Ok(())
}

fn check_link(previous: &Block, current: &Block) -> Result<(), String> {
    if current.index != previous.index + 1 {
        return Err(format!(
            "index discontinuity: {} follows {}",
            current.index, previous.index
        ));
    }
    if current.previous_hash != previous.hash {
        return Err(format!(
            "block {} previous_hash {} does not match {}",
            current.index, current.previous_hash, previous.hash
        ));
    }
    if current.payload.block_type == BlockType::Genesis {
        return Err(format!("block {} claims to be a genesis block", current.index));
    }
    if !current.has_valid_hash() {
        return Err(format!(
            "block {} hash mismatch: computed {}, stored {}",
            current.index,
            current.calculate_hash(),
            current.hash
        ));
    }
    Ok(())
}

/// Position of a ledger entry inside the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryPosition {
    pub block: usize,
    pub entry: usize,
}

/// Blocks plus lookups by conversation and by message id. Only ever grows.
#[derive(Debug, Clone)]
pub(crate) struct Chain {
    blocks: Vec<Block>,
    by_conversation: HashMap<String, Vec<usize>>,
    by_message: HashMap<String, EntryPosition>,
}

impl Chain {
    pub fn genesis() -> Self {
        Self::from_blocks(vec![Block::genesis()])
    }

    /// Index `blocks` as given, without verifying them.
    pub fn from_blocks(blocks: Vec<Block>) -> Self {
        let mut chain = Self {
            blocks: Vec::with_capacity(blocks.len()),
            by_conversation: HashMap::new(),
            by_message: HashMap::new(),
        };
        for block in blocks {
            chain.push(block);
        }
        chain
    }

    pub fn push(&mut self, block: Block) {
        let position = self.blocks.len();
        if !block.is_genesis() {
            if let Some(conversation_id) = block.conversation_id() {
                self.by_conversation
                    .entry(conversation_id.to_string())
                    .or_default()
                    .push(position);
            }
            for (entry, record) in block.payload.entries.iter().enumerate() {
                // First record wins, matching a front-to-back scan.
                self.by_message
                    .entry(record.message_id.clone())
                    .or_insert(EntryPosition { block: position, entry });
            }
        }
        self.blocks.push(block);
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn latest(&self) -> &Block {
        // Never empty: constructed with genesis and append-only.
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn conversation_positions(&self, conversation_id: &str) -> &[usize] {
        self.by_conversation
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn entry_position(&self, message_id: &str) -> Option<EntryPosition> {
        self.by_message.get(message_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::block::{BlockPayload, LedgerEntry};
    use crate::message::MediaType;

    fn mined_after(previous: &Block, conversation: &str, message_id: &str) -> Block {
        let entry = LedgerEntry {
            message_id: message_id.into(),
            sender_id: "u1".into(),
            content_hash: "h".into(),
            is_encrypted: true,
            has_signature: true,
            media_type: MediaType::None,
            timestamp: 10.0,
        };
        let mut block = Block::candidate(
            previous.index + 1,
            10.0,
            BlockPayload::messages(conversation, vec![entry]),
            previous.hash.clone(),
        );
        block.mine(1, None).unwrap();
        block
    }

    fn sample_chain() -> Vec<Block> {
        let genesis = Block::genesis();
        let b1 = mined_after(&genesis, "c1", "m1");
        let b2 = mined_after(&b1, "c2", "m2");
        let b3 = mined_after(&b2, "c1", "m3");
        vec![genesis, b1, b2, b3]
    }

    #[test]
    fn valid_chain_verifies() {
        let result = verify_blocks(&sample_chain());
        assert!(result.valid);
        assert_eq!(result.blocks_verified, 4);
    }

    #[test]
    fn empty_chain_is_invalid() {
        assert!(!verify_blocks(&[]).valid);
    }

    #[test]
    fn payload_tamper_located() {
        let mut blocks = sample_chain();
        blocks[2].payload.entries[0].content_hash = "forged".into();
        let result = verify_blocks(&blocks);
        assert!(!result.valid);
        assert_eq!(result.first_invalid_index, Some(2));
    }

    #[test]
    fn reorder_detected() {
        let mut blocks = sample_chain();
        blocks.swap(1, 2);
        assert!(!verify_blocks(&blocks).valid);
    }

    #[test]
    fn remined_tamper_still_breaks_link() {
        let mut blocks = sample_chain();
        blocks[1].payload.entries[0].content_hash = "forged".into();
        blocks[1].mine(1, None).unwrap();
        let result = verify_blocks(&blocks);
        assert!(!result.valid);
        assert_eq!(result.first_invalid_index, Some(2));
    }

    #[test]
    fn successor_must_meet_difficulty() {
        let genesis = Block::genesis();
        let mut block = Block::candidate(1, 1.0, BlockPayload::messages("c", vec![]), genesis.hash.clone());
        block.mine(1, None).unwrap();
        assert!(validate_successor(&genesis, &block, 1).is_ok());
        // Hash with exactly one leading zero cannot satisfy 64.
        assert!(validate_successor(&genesis, &block, 64).is_err());
    }

    #[test]
    fn successor_with_wrong_index_rejected() {
        let genesis = Block::genesis();
        let mut block = Block::candidate(5, 1.0, BlockPayload::messages("c", vec![]), genesis.hash.clone());
        block.mine(0, None).unwrap();
        let err = validate_successor(&genesis, &block, 0).unwrap_err();
        assert!(err.contains("index discontinuity"));
    }

    #[test]
    fn indexes_track_conversations_and_messages() {
        let chain = Chain::from_blocks(sample_chain());
        assert_eq!(chain.conversation_positions("c1"), &[1, 3]);
        assert_eq!(chain.conversation_positions("missing"), &[] as &[usize]);
        assert_eq!(
            chain.entry_position("m2"),
            Some(EntryPosition { block: 2, entry: 0 })
        );
        assert_eq!(chain.latest().index, 3);
    }
}
