//! Integrity ledger
//!
//! An append-only proof-of-work hash chain of message content hashes,
//! persisted as JSON lines. Every append holds one mutex from reading the
//! head until the block is on disk, so blocks are totally ordered and
//! concurrent callers never mine against a stale head.

mod block;
mod chain;
mod log;

pub use block::{Block, BlockPayload, BlockType, LedgerEntry, GENESIS_PREVIOUS_HASH, MAX_DIFFICULTY};
pub use chain::{verify_blocks, ChainVerification};

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ChatSealError, Result};
use crate::message::MessageRecord;
use self::chain::{validate_successor, Chain};
use self::log::{ChainLog, LogContents};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerConfig {
    difficulty: usize,
    mining_timeout: Option<Duration>,
}

impl LedgerConfig {
    /// Difficulty above [`MAX_DIFFICULTY`] is capped.
    pub fn new(difficulty: usize) -> Self {
        let capped = difficulty.min(MAX_DIFFICULTY);
        if capped != difficulty {
            warn!(requested = difficulty, capped, "ledger difficulty capped");
        }
        Self {
            difficulty: capped,
            mining_timeout: Some(Duration::from_secs(5)),
        }
    }

    /// `None` mines without a deadline.
    pub fn with_mining_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.mining_timeout = timeout;
        self
    }

    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    pub fn mining_timeout(&self) -> Option<Duration> {
        self.mining_timeout
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self::new(2)
    }
}

/// A block that made it onto the chain.
#[derive(Debug, Clone)]
pub struct AppendReceipt {
    pub block: Block,
    /// False when the block lives only in memory: either the ledger has no
    /// log file or writing it failed.
    pub persisted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationStats {
    pub block_count: usize,
    pub message_count: usize,
    pub first_block_index: u64,
    pub last_block_index: u64,
}

/// A ledger entry together with where it was found.
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedEntry {
    pub block_index: u64,
    /// Whether the containing block still hashes to its stored hash.
    pub block_intact: bool,
    pub entry: LedgerEntry,
}

struct LedgerState {
    chain: Chain,
    /// Set after a failed write; the next successful persist rewrites the
    /// whole log instead of appending one line.
    log_behind: bool,
}

pub struct IntegrityLedger {
    config: LedgerConfig,
    log: Option<ChainLog>,
    read_only: bool,
    state: Mutex<LedgerState>,
    persistence_failures: AtomicU64,
}

impl IntegrityLedger {
    /// A ledger that lives only in memory, starting at genesis.
    pub fn in_memory(config: LedgerConfig) -> Self {
        Self {
            config,
            log: None,
            read_only: false,
            state: Mutex::new(LedgerState {
                chain: Chain::genesis(),
                log_behind: false,
            }),
            persistence_failures: AtomicU64::new(0),
        }
    }

    /// Open the log at `path`. A missing log starts a fresh chain; a log that
    /// fails to parse or verify is replaced by a genesis-only chain.
    pub fn open(path: impl AsRef<Path>, config: LedgerConfig) -> Result<Self> {
        let log = ChainLog::new(path);
        let (chain, log_behind) = load_chain(&log)?;
        info!(
            path = %log.path().display(),
            blocks = chain.blocks().len(),
            difficulty = config.difficulty(),
            log_behind,
            "ledger opened"
        );
        Ok(Self {
            config,
            log: Some(log),
            read_only: false,
            state: Mutex::new(LedgerState { chain, log_behind }),
            persistence_failures: AtomicU64::new(0),
        })
    }

    /// Open the log at `path` for queries only. The blocks are taken as
    /// stored, so a tampered log stays visible to [`Self::verify_chain`] and
    /// [`Self::find_entry`]. Nothing is ever written and appends are refused.
    ///
    /// A log that cannot be parsed at all is reported as
    /// [`ChatSealError::ChainCorruption`].
    pub fn open_read_only(path: impl AsRef<Path>, config: LedgerConfig) -> Result<Self> {
        let log = ChainLog::new(path);
        let chain = read_chain(&log)?;
        debug!(path = %log.path().display(), blocks = chain.blocks().len(), "ledger opened read-only");
        Ok(Self {
            config,
            log: Some(log),
            read_only: true,
            state: Mutex::new(LedgerState {
                chain,
                log_behind: false,
            }),
            persistence_failures: AtomicU64::new(0),
        })
    }

    /// Verify a log file without opening a ledger over it. Unlike
    /// [`IntegrityLedger::open`] this never repairs anything.
    pub fn inspect_log(path: impl AsRef<Path>) -> Result<ChainVerification> {
        match ChainLog::new(path).read()? {
            LogContents::Missing => Ok(verify_blocks(&[Block::genesis()])),
            LogContents::Blocks(blocks) => Ok(verify_blocks(&blocks)),
            LogContents::Unreadable(reason) => Ok(ChainVerification {
                valid: false,
                blocks_verified: 0,
                first_invalid_index: None,
                error_message: Some(reason),
            }),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn difficulty(&self) -> usize {
        self.config.difficulty()
    }

    pub fn path(&self) -> Option<&Path> {
        self.log.as_ref().map(ChainLog::path)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Mine and append a block recording `entries` for `conversation_id`.
    /// Blocks the calling thread for the duration of mining.
    pub fn append_blocking(&self, conversation_id: &str, entries: Vec<LedgerEntry>) -> Result<AppendReceipt> {
        if self.read_only {
            return Err(ChatSealError::AppendRejected("ledger is open read-only".into()));
        }
        let difficulty = self.config.difficulty();
        let mut state = self.state.lock();

        let head = state.chain.latest();
        let mut block = Block::candidate(
            head.index + 1,
            unix_now(),
            BlockPayload::messages(conversation_id, entries),
            head.hash.clone(),
        );

        let started = Instant::now();
        let deadline = self.config.mining_timeout().map(|timeout| started + timeout);
        let attempts = block.mine(difficulty, deadline).map_err(|timed_out| {
            warn!(
                conversation_id,
                difficulty,
                attempts = timed_out.attempts,
                "mining deadline exceeded; block discarded"
            );
            ChatSealError::MiningTimeout {
                difficulty,
                timeout_ms: self.config.mining_timeout().map(|t| t.as_millis()).unwrap_or(0),
            }
        })?;
        debug!(
            index = block.index,
            nonce = block.nonce,
            attempts,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "block mined"
        );

        if let Err(reason) = validate_successor(state.chain.latest(), &block, difficulty) {
            warn!(index = block.index, %reason, "mined block rejected; reloading chain");
            self.reload_locked(&mut state);
            return Err(ChatSealError::AppendRejected(reason));
        }

        state.chain.push(block.clone());
        let persisted = self.persist_locked(&mut state, &block);
        info!(
            index = block.index,
            nonce = block.nonce,
            conversation_id,
            entries = block.payload.entries.len(),
            persisted,
            "block appended"
        );
        Ok(AppendReceipt { block, persisted })
    }

    /// Async form of [`IntegrityLedger::append_blocking`]; mining runs on the
    /// blocking thread pool.
    pub async fn append(self: &Arc<Self>, conversation_id: impl Into<String>, entries: Vec<LedgerEntry>) -> Result<AppendReceipt> {
        let ledger = Arc::clone(self);
        let conversation_id = conversation_id.into();
        tokio::task::spawn_blocking(move || ledger.append_blocking(&conversation_id, entries))
            .await
            .map_err(|e| ChatSealError::Task(e.to_string()))?
    }

    /// Record one message in its own block. Returns the block hash, or `None`
    /// when the append failed; the failure is logged and never propagated so
    /// message delivery is not blocked by the ledger.
    pub fn record_message(&self, record: &MessageRecord) -> Option<String> {
        let entry = LedgerEntry::from_record(record, unix_now());
        match self.append_blocking(&record.conversation_id, vec![entry]) {
            Ok(receipt) => Some(receipt.block.hash),
            Err(err) => {
                warn!(
                    message_id = %record.message_id,
                    conversation_id = %record.conversation_id,
                    error = %err,
                    "failed to record message in ledger"
                );
                None
            }
        }
    }

    pub fn validate_chain(&self) -> bool {
        self.verify_chain().valid
    }

    pub fn verify_chain(&self) -> ChainVerification {
        let state = self.state.lock();
        verify_blocks(state.chain.blocks())
    }

    /// Non-genesis blocks of `conversation_id`, in chain order.
    pub fn entries_for_conversation(&self, conversation_id: &str) -> Vec<Block> {
        let state = self.state.lock();
        let blocks = state.chain.blocks();
        state
            .chain
            .conversation_positions(conversation_id)
            .iter()
            .map(|&position| blocks[position].clone())
            .collect()
    }

    pub fn conversation_stats(&self) -> BTreeMap<String, ConversationStats> {
        let state = self.state.lock();
        let mut stats: BTreeMap<String, ConversationStats> = BTreeMap::new();
        for block in state.chain.blocks().iter().filter(|b| !b.is_genesis()) {
            let Some(conversation_id) = block.conversation_id() else {
                continue;
            };
            let messages = block.payload.entries.len();
            stats
                .entry(conversation_id.to_string())
                .and_modify(|s| {
                    s.block_count += 1;
                    s.message_count += messages;
                    s.last_block_index = block.index;
                })
                .or_insert(ConversationStats {
                    block_count: 1,
                    message_count: messages,
                    first_block_index: block.index,
                    last_block_index: block.index,
                });
        }
        stats
    }

    /// Blocks with index in `range`, clamped to the chain.
    pub fn blocks(&self, range: Range<u64>) -> Vec<Block> {
        let state = self.state.lock();
        let blocks = state.chain.blocks();
        let end = (range.end.min(blocks.len() as u64)) as usize;
        let start = (range.start as usize).min(end);
        blocks[start..end].to_vec()
    }

    pub fn block(&self, index: u64) -> Option<Block> {
        let state = self.state.lock();
        state.chain.blocks().get(index as usize).cloned()
    }

    pub fn snapshot(&self) -> Vec<Block> {
        self.state.lock().chain.blocks().to_vec()
    }

    pub fn len(&self) -> usize {
        self.state.lock().chain.blocks().len()
    }

    /// Never true: the chain always holds its genesis block.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn latest(&self) -> Block {
        self.state.lock().chain.latest().clone()
    }

    /// First ledger entry recorded for `message_id`.
    pub fn find_entry(&self, message_id: &str) -> Option<LocatedEntry> {
        let state = self.state.lock();
        let position = state.chain.entry_position(message_id)?;
        let block = &state.chain.blocks()[position.block];
        Some(LocatedEntry {
            block_index: block.index,
            block_intact: block.has_valid_hash(),
            entry: block.payload.entries[position.entry].clone(),
        })
    }

    /// Discard the in-memory chain and load it again from the log.
    pub fn reload(&self) -> Result<()> {
        let Some(log) = &self.log else {
            return Ok(());
        };
        let (chain, log_behind) = if self.read_only {
            (read_chain(log)?, false)
        } else {
            load_chain(log)?
        };
        let mut state = self.state.lock();
        state.chain = chain;
        state.log_behind = log_behind;
        Ok(())
    }

    /// Number of blocks whose write to the log failed since open.
    pub fn persistence_failures(&self) -> u64 {
        self.persistence_failures.load(Ordering::Relaxed)
    }

    fn reload_locked(&self, state: &mut LedgerState) {
        let Some(log) = &self.log else {
            return;
        };
        match load_chain(log) {
            Ok((chain, log_behind)) => {
                state.chain = chain;
                state.log_behind = log_behind;
            }
            Err(err) => warn!(error = %err, "chain reload failed; keeping in-memory chain"),
        }
    }

    fn persist_locked(&self, state: &mut LedgerState, block: &Block) -> bool {
        let Some(log) = &self.log else {
            return false;
        };
        let written = if state.log_behind {
            log.rewrite(state.chain.blocks())
        } else {
            log.append(block)
        };
        match written {
            Ok(()) => {
                state.log_behind = false;
                true
            }
            Err(err) => {
                self.persistence_failures.fetch_add(1, Ordering::Relaxed);
                state.log_behind = true;
                warn!(
                    index = block.index,
                    path = %log.path().display(),
                    error = %err,
                    "failed to persist block; continuing in memory"
                );
                false
            }
        }
    }
}

/// Load the chain for appending, resetting an invalid log to genesis.
/// The flag is true when the genesis log could not be written; the next
/// persisted block then rewrites the whole log.
fn load_chain(log: &ChainLog) -> Result<(Chain, bool)> {
    let genesis = |reason: Option<String>| {
        if let Some(reason) = &reason {
            warn!(path = %log.path().display(), %reason, "ledger log invalid; resetting to genesis");
        }
        let chain = Chain::genesis();
        let behind = match log.rewrite(chain.blocks()) {
            Ok(()) => false,
            Err(err) => {
                warn!(
                    path = %log.path().display(),
                    error = %err,
                    "failed to write genesis log; continuing in memory"
                );
                true
            }
        };
        (chain, behind)
    };

    Ok(match log.read()? {
        LogContents::Missing => genesis(None),
        LogContents::Unreadable(reason) => genesis(Some(reason)),
        LogContents::Blocks(blocks) => {
            let verification = verify_blocks(&blocks);
            if verification.valid {
                (Chain::from_blocks(blocks), false)
            } else {
                genesis(Some(
                    verification
                        .error_message
                        .unwrap_or_else(|| "chain verification failed".into()),
                ))
            }
        }
    })
}

/// Load the chain exactly as stored, without verifying or writing.
fn read_chain(log: &ChainLog) -> Result<Chain> {
    match log.read()? {
        LogContents::Missing => Ok(Chain::genesis()),
        LogContents::Blocks(blocks) => Ok(Chain::from_blocks(blocks)),
        LogContents::Unreadable(reason) => Err(ChatSealError::ChainCorruption(reason)),
    }
}

/// Current time as Unix seconds with microsecond precision.
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
