//! The node surface: raw blocks and transactions in, acceptance results
//! out, plus read access to the tip, the block index and the coin set.
//!
//! `ChainState` sits behind a tokio `RwLock` with a single writer. Blocks
//! are checked without chain context on the caller, then queued to one
//! blocking worker that owns all chain mutation.

pub mod bootstrap;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use crate::chain::coins::Coin;
use crate::chain::validation;
use crate::chain::{BlockAcceptance, BlockIndexEntry, BlockUndo, ChainState, ChainStateError, ValidationError};
use crate::config::NodeConfig;
use crate::core::params::{ChainParams, MAX_BLOCK_SIZE, MAX_TX_SIZE};
use crate::core::types::{Block, Hash256, OutPoint, Transaction};
use crate::mempool::Mempool;
use crate::storage::{KeyValueStore, SledStore};

/// Blocks waiting for the chain worker
const BLOCK_QUEUE_DEPTH: usize = 64;

/// What happened to a block or transaction handed to the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptanceResult {
    Accepted(Hash256),
    Duplicate,
    Orphan { missing: Vec<Hash256> },
    /// Rejected; `ban` is set when the sender provably broke consensus rules
    Invalid { reason: String, ban: bool },
    /// The node hit a fatal error or is shutting down
    Aborted(String),
}

impl AcceptanceResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AcceptanceResult::Accepted(_))
    }
}

impl From<ValidationError> for AcceptanceResult {
    fn from(e: ValidationError) -> Self {
        match e {
            ValidationError::Duplicate => AcceptanceResult::Duplicate,
            ValidationError::Orphan { missing } => AcceptanceResult::Orphan { missing },
            other => AcceptanceResult::Invalid { ban: other.is_ban_worthy(), reason: other.reason() },
        }
    }
}

struct BlockJob {
    block: Block,
    reply: oneshot::Sender<AcceptanceResult>,
}

pub struct NodeState {
    pub chain: Arc<RwLock<ChainState>>,
    pub mempool: Arc<Mutex<Mempool>>,
    config: NodeConfig,
    params: ChainParams,
    interrupt: Arc<AtomicBool>,
    blocks: mpsc::Sender<BlockJob>,
}

impl NodeState {
    /// Open the on-disk state under `config.data_dir` and start the chain
    /// worker. Must be called inside a tokio runtime.
    pub fn open(config: NodeConfig, interrupt: Arc<AtomicBool>) -> Result<Arc<Self>, ChainStateError> {
        config.validate()?;
        let store: Arc<dyn KeyValueStore> = Arc::new(SledStore::open(config.chainstate_dir())?);
        let chain = ChainState::open(
            config.params(),
            store,
            &config.blocks_dir(),
            config.chain_state_options(),
            interrupt.clone(),
        )?;

        if config.checkblocks > 0 {
            let checked = chain.verify_db(config.checklevel, config.checkblocks)?;
            tracing::info!("🔍 Verified last {} block(s) at level {}", checked, config.checklevel);
        }

        let mut mempool = Mempool::new(config.mempool_options());
        if config.persist_mempool {
            mempool.load(&config.mempool_path(), &chain, crate::unix_time())?;
        }

        Ok(Self::start(chain, mempool, config, interrupt))
    }

    /// Wrap an already opened chain state and start the chain worker.
    pub fn start(chain: ChainState, mempool: Mempool, config: NodeConfig, interrupt: Arc<AtomicBool>) -> Arc<Self> {
        let params = chain.params().clone();
        let chain = Arc::new(RwLock::new(chain));
        let mempool = Arc::new(Mutex::new(mempool));
        let (blocks, rx) = mpsc::channel(BLOCK_QUEUE_DEPTH);

        spawn_chain_worker(chain.clone(), mempool.clone(), interrupt.clone(), rx);

        Arc::new(NodeState { chain, mempool, config, params, interrupt, blocks })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn is_shutting_down(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    // ─── Submission ──────────────────────────────────────────────────

    /// Decode and check a block, then hand it to the chain worker and wait
    /// for the verdict.
    pub async fn process_new_block(&self, bytes: &[u8]) -> AcceptanceResult {
        let block = match Block::from_bytes(bytes, MAX_BLOCK_SIZE + 1024) {
            Ok(block) => block,
            Err(e) => {
                return AcceptanceResult::Invalid { reason: format!("undecodable block: {}", e), ban: true };
            }
        };
        self.submit_block(block).await
    }

    pub async fn submit_block(&self, block: Block) -> AcceptanceResult {
        if self.is_shutting_down() {
            return AcceptanceResult::Aborted("shutting down".into());
        }
        // Context-free checks happen here so the worker only sees plausible blocks.
        if let Err(e) = validation::check_block(&block, &self.params) {
            tracing::warn!("❌ Block {} rejected: {}", hex::encode(block.hash()), e);
            return e.into();
        }

        let (reply, verdict) = oneshot::channel();
        if self.blocks.send(BlockJob { block, reply }).await.is_err() {
            return AcceptanceResult::Aborted("chain worker stopped".into());
        }
        verdict.await.unwrap_or_else(|_| AcceptanceResult::Aborted("chain worker stopped".into()))
    }

    /// Decode a transaction and try to add it to the mempool.
    pub async fn process_new_transaction(&self, bytes: &[u8]) -> AcceptanceResult {
        let tx = match Transaction::from_bytes(bytes, MAX_TX_SIZE) {
            Ok(tx) => tx,
            Err(e) => {
                return AcceptanceResult::Invalid { reason: format!("undecodable transaction: {}", e), ban: true };
            }
        };
        self.submit_transaction(tx).await
    }

    pub async fn submit_transaction(&self, tx: Transaction) -> AcceptanceResult {
        if self.is_shutting_down() {
            return AcceptanceResult::Aborted("shutting down".into());
        }
        if let Err(e) = validation::check_transaction(&tx) {
            return e.into();
        }

        let chain = self.chain.read().await;
        let mut mempool = self.mempool.lock().await;
        let txid = tx.txid();
        match mempool.accept_transaction(tx, &chain, crate::unix_time()) {
            Ok(txid) => AcceptanceResult::Accepted(txid),
            Err(ChainStateError::Validation(e)) => {
                if !matches!(e, ValidationError::Orphan { .. } | ValidationError::Duplicate) {
                    tracing::debug!("Transaction {} rejected: {}", hex::encode(txid), e);
                }
                e.into()
            }
            Err(e) => abort(&self.interrupt, e),
        }
    }

    // ─── Queries ─────────────────────────────────────────────────────

    pub async fn get_tip(&self) -> Option<BlockIndexEntry> {
        self.chain.read().await.tip().cloned()
    }

    pub async fn get_block_index_entry(&self, hash: &Hash256) -> Option<BlockIndexEntry> {
        self.chain.read().await.entry(hash).cloned()
    }

    /// Unspent coin at the tip. Does not see mempool outputs.
    pub async fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainStateError> {
        self.chain.read().await.get_coin(outpoint)
    }

    pub async fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainStateError> {
        self.chain.read().await.get_block(hash)
    }

    // ─── Subscribers ─────────────────────────────────────────────────

    pub async fn on_block_connected(&self, f: impl Fn(&Block, &BlockIndexEntry, &BlockUndo) + Send + Sync + 'static) {
        self.chain.write().await.signals_mut().subscribe_block_connected(f);
    }

    pub async fn on_block_disconnected(&self, f: impl Fn(&Block, &BlockIndexEntry) + Send + Sync + 'static) {
        self.chain.write().await.signals_mut().subscribe_block_disconnected(f);
    }

    pub async fn on_tip_updated(&self, f: impl Fn(&BlockIndexEntry) + Send + Sync + 'static) {
        self.chain.write().await.signals_mut().subscribe_tip_updated(f);
    }

    // ─── Maintenance ─────────────────────────────────────────────────

    /// Expire stale orphans and mempool entries and flush the coins cache if
    /// it grew past its budget.
    pub async fn maintain(&self) -> Result<(), ChainStateError> {
        let now = crate::unix_time();
        let mut chain = self.chain.write().await;
        let orphans = chain.expire_orphans(now);
        let expired = self.mempool.lock().await.expire(now);
        if orphans + expired > 0 {
            tracing::debug!("Expired {} orphan block(s) and {} pool transaction(s)", orphans, expired);
        }
        chain.flush_state(crate::chain::FlushMode::IfNeeded)
    }

    /// Stop accepting work, flush the chain state and save the mempool.
    pub async fn shutdown(&self) -> Result<(), ChainStateError> {
        self.interrupt.store(true, Ordering::Relaxed);
        let mut chain = self.chain.write().await;
        if chain.is_halted() {
            tracing::error!("Chain state halted, skipping final flush");
            return Ok(());
        }
        chain.flush()?;
        if self.config.persist_mempool {
            self.mempool.lock().await.save(&self.config.mempool_path())?;
        }
        tracing::info!("💾 Chain state flushed at height {}", chain.height().unwrap_or(0));
        Ok(())
    }
}

fn abort(interrupt: &AtomicBool, e: ChainStateError) -> AcceptanceResult {
    tracing::error!("💥 Fatal chain state error: {}", e);
    interrupt.store(true, Ordering::Relaxed);
    AcceptanceResult::Aborted(e.to_string())
}

/// The only task that mutates the chain. Runs on the blocking pool since
/// connecting a block is CPU and disk bound.
fn spawn_chain_worker(
    chain: Arc<RwLock<ChainState>>,
    mempool: Arc<Mutex<Mempool>>,
    interrupt: Arc<AtomicBool>,
    mut rx: mpsc::Receiver<BlockJob>,
) {
    tokio::task::spawn_blocking(move || {
        while let Some(BlockJob { block, reply }) = rx.blocking_recv() {
            let hash = block.hash();
            let result = if interrupt.load(Ordering::Relaxed) {
                AcceptanceResult::Aborted("shutting down".into())
            } else {
                let mut chain = chain.blocking_write();
                let mut pool = mempool.blocking_lock();
                match chain.process_new_block(block, Some(&mut pool)) {
                    Ok(BlockAcceptance::Accepted(hash)) => AcceptanceResult::Accepted(hash),
                    Ok(BlockAcceptance::Duplicate) => AcceptanceResult::Duplicate,
                    Ok(BlockAcceptance::Orphan { missing }) => AcceptanceResult::Orphan { missing: vec![missing] },
                    Err(ChainStateError::Validation(e)) => {
                        tracing::warn!("❌ Block {} rejected: {}", hex::encode(hash), e);
                        e.into()
                    }
                    Err(e) if !e.is_fatal() => AcceptanceResult::Invalid { reason: e.to_string(), ban: false },
                    Err(e) => abort(&interrupt, e),
                }
            };
            let _ = reply.send(result);
        }
        tracing::debug!("Chain worker stopped");
    });
}
