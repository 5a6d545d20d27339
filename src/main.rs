use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chaind::chain::{ChainState, ChainStateError};
use chaind::config::{NodeConfig, DEFAULT_DATA_DIR};
use chaind::core::params::{Network, COIN};
use chaind::core::types::Hash256;
use chaind::mempool::Mempool;
use chaind::miner::{self, MinerConfig, MineResult};
use chaind::node::{bootstrap, AcceptanceResult, NodeState};
use chaind::storage::{KeyValueStore, SledStore};

#[derive(Parser)]
#[command(name = "chaind", version)]
#[command(about = "chaind - UTXO chain-state validation and reorganization engine")]
struct Cli {
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Enable debug logging for chaind
    #[arg(long, global = true)]
    debug: bool,
    #[command(flatten)]
    overrides: Overrides,
    #[command(subcommand)]
    command: Commands,
}

/// Flags that override `chaind.json`.
#[derive(Args, Default)]
struct Overrides {
    #[arg(long, global = true, value_enum)]
    network: Option<Network>,
    /// Script verification threads (0 = auto, negative = leave cores free)
    #[arg(long, global = true, allow_hyphen_values = true)]
    par: Option<i32>,
    /// Coins cache size in MiB
    #[arg(long, global = true)]
    dbcache: Option<usize>,
    #[arg(long, global = true)]
    txindex: Option<bool>,
    #[arg(long, global = true)]
    addressindex: Option<bool>,
    #[arg(long, global = true)]
    spentindex: Option<bool>,
    #[arg(long, global = true)]
    timestampindex: Option<bool>,
    #[arg(long, global = true)]
    checkblocks: Option<u64>,
    #[arg(long, global = true)]
    checklevel: Option<u32>,
    #[arg(long, global = true)]
    stop_at_height: Option<u64>,
    #[arg(long, global = true)]
    persist_mempool: Option<bool>,
}

impl Overrides {
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(v) = self.network {
            config.network = v;
        }
        if let Some(v) = self.par {
            config.par = v;
        }
        if let Some(v) = self.dbcache {
            config.dbcache = v;
        }
        if let Some(v) = self.txindex {
            config.txindex = v;
        }
        if let Some(v) = self.addressindex {
            config.addressindex = v;
        }
        if let Some(v) = self.spentindex {
            config.spentindex = v;
        }
        if let Some(v) = self.timestampindex {
            config.timestampindex = v;
        }
        if let Some(v) = self.checkblocks {
            config.checkblocks = v;
        }
        if let Some(v) = self.checklevel {
            config.checklevel = v;
        }
        if self.stop_at_height.is_some() {
            config.stop_at_height = self.stop_at_height;
        }
        if let Some(v) = self.persist_mempool {
            config.persist_mempool = v;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default chaind.json and create the genesis state
    Init,
    /// Run the node until interrupted
    Node {
        /// Mine blocks to an anyone-can-spend script (regtest only)
        #[arg(short, long)]
        mine: bool,
        #[arg(short, long, default_value_t = 1)]
        threads: usize,
    },
    /// Show chain tip and UTXO set summary
    Info,
    /// Check the most recent blocks against their stored data
    Verify {
        #[arg(long, default_value_t = 3)]
        level: u32,
        #[arg(long, default_value_t = 6)]
        blocks: u64,
    },
    /// Rebuild the coin set and indexes from stored blocks
    ReindexChainstate,
    /// Write the active chain to a gzip bootstrap file
    Export {
        #[arg(short, long, default_value = "bootstrap.dat")]
        output: PathBuf,
    },
    /// Load blocks from a bootstrap file
    Import {
        #[arg(short, long, default_value = "bootstrap.dat")]
        input: PathBuf,
    },
    /// Mine blocks on the local chain (regtest)
    Generate {
        #[arg(default_value_t = 1)]
        count: u64,
        #[arg(short, long, default_value_t = 1)]
        threads: usize,
    },
    /// Mark a block and its descendants invalid
    Invalidate { hash: String },
    /// Clear the invalid mark from a block and its relatives
    Reconsider { hash: String },
}

fn parse_hash(s: &str) -> Result<Hash256, ChainStateError> {
    let bytes = hex::decode(s).map_err(|e| ChainStateError::Config(format!("bad block hash '{}': {}", s, e)))?;
    bytes
        .try_into()
        .map_err(|_| ChainStateError::Config(format!("block hash '{}' is not 32 bytes", s)))
}

fn format_coins(base_units: u64) -> String {
    let whole = base_units / COIN;
    let frac = base_units % COIN;
    if frac == 0 {
        format!("{}", whole)
    } else {
        format!("{}.{:08}", whole, frac).trim_end_matches('0').to_string()
    }
}

fn open_chain(config: &NodeConfig, interrupt: Arc<AtomicBool>) -> Result<ChainState, ChainStateError> {
    config.validate()?;
    let store: Arc<dyn KeyValueStore> = Arc::new(SledStore::open(config.chainstate_dir())?);
    ChainState::open(config.params(), store, &config.blocks_dir(), config.chain_state_options(), interrupt)
}

fn install_interrupt() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!("\n🛑 Shutting down gracefully...");
        flag.store(true, Ordering::SeqCst);
    }) {
        tracing::warn!("Could not install Ctrl-C handler: {}", e);
    }
    stop
}

fn main() {
    let cli = Cli::parse();

    let directive = if cli.debug { "chaind=debug" } else { "chaind=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let data_dir = cli.data_dir.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    if let Err(e) = run(cli, data_dir) {
        eprintln!("❌ {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli, data_dir: PathBuf) -> Result<(), ChainStateError> {
    let mut config = NodeConfig::load(&data_dir)?;
    cli.overrides.apply(&mut config);
    if matches!(cli.command, Commands::ReindexChainstate) {
        config.reindex_chainstate = true;
    }
    let interrupt = install_interrupt();

    match cli.command {
        Commands::Init => {
            config.save()?;
            let mut chain = open_chain(&config, interrupt)?;
            chain.flush()?;
            println!("🔨 chaind initialized!");
            println!("  Network: {}", config.network);
            println!("  Data:    {}", config.data_dir.display());
            println!("  Genesis: {}", hex::encode(chain.params().genesis_hash()));
            println!("\n  Run: chaind node");
        }

        Commands::Node { mine, threads } => {
            if mine && config.network != Network::Regtest {
                return Err(ChainStateError::Config("--mine is only available on regtest".into()));
            }
            let rt = tokio::runtime::Runtime::new().map_err(|e| ChainStateError::Config(e.to_string()))?;
            rt.block_on(run_node(config, interrupt, mine, threads))?;
        }

        Commands::Info => {
            let chain = open_chain(&config, interrupt)?;
            let tip = chain.tip().ok_or_else(|| ChainStateError::consistency("no tip"))?;
            let stats = chain.utxo_stats()?;
            println!("📊 chaind ({})", config.network);
            println!("  Height:     {}", tip.height);
            println!("  Tip:        {}", hex::encode(tip.hash));
            println!("  Chain work: {}", tip.chain_work);
            println!("  Coins:      {}", stats.coins);
            println!("  Supply:     {}", format_coins(stats.total_amount));
            println!("  IBD:        {}", chain.is_initial_block_download());
        }

        Commands::Verify { level, blocks } => {
            let chain = open_chain(&config, interrupt)?;
            let checked = chain.verify_db(level, blocks)?;
            println!("✅ Verified {} block(s) at level {}", checked, level);
        }

        Commands::ReindexChainstate => {
            let mut chain = open_chain(&config, interrupt)?;
            chain.flush()?;
            println!("✅ Chain state rebuilt to height {}", chain.height().unwrap_or(0));
        }

        Commands::Export { output } => {
            let chain = open_chain(&config, interrupt)?;
            let count = bootstrap::export_blocks(&chain, &output)?;
            println!("📸 Exported {} block(s) to {}", count, output.display());
        }

        Commands::Import { input } => {
            let mut chain = open_chain(&config, interrupt)?;
            let stats = bootstrap::import_blocks(&mut chain, None, &input)?;
            println!(
                "📸 Imported {} block(s), {} already known, {} rejected. Height {}",
                stats.accepted,
                stats.duplicate,
                stats.invalid,
                chain.height().unwrap_or(0)
            );
        }

        Commands::Generate { count, threads } => {
            let mut chain = open_chain(&config, interrupt.clone())?;
            let mut mempool = Mempool::new(config.mempool_options());
            if config.persist_mempool {
                mempool.load(&config.mempool_path(), &chain, chaind::unix_time())?;
            }
            let miner_config = MinerConfig { threads, ..MinerConfig::default() };
            let hashes = miner::generate(&mut chain, Some(&mut mempool), &miner_config, count, interrupt)?;
            chain.flush()?;
            if config.persist_mempool {
                mempool.save(&config.mempool_path())?;
            }
            for hash in &hashes {
                println!("{}", hex::encode(hash));
            }
        }

        Commands::Invalidate { hash } => {
            let hash = parse_hash(&hash)?;
            let mut chain = open_chain(&config, interrupt)?;
            chain.invalidate_block(&hash, None)?;
            chain.flush()?;
            println!("⛔ Invalidated {}. Tip is now height {}", hex::encode(hash), chain.height().unwrap_or(0));
        }

        Commands::Reconsider { hash } => {
            let hash = parse_hash(&hash)?;
            let mut chain = open_chain(&config, interrupt)?;
            chain.reconsider_block(&hash, None)?;
            chain.flush()?;
            println!("✅ Reconsidered {}. Tip is now height {}", hex::encode(hash), chain.height().unwrap_or(0));
        }
    }
    Ok(())
}

async fn run_node(
    config: NodeConfig,
    interrupt: Arc<AtomicBool>,
    mine: bool,
    threads: usize,
) -> Result<(), ChainStateError> {
    let state = NodeState::open(config, interrupt.clone())?;
    if let Some(tip) = state.get_tip().await {
        tracing::info!("🚀 Node running at height {} ({})", tip.height, hex::encode(tip.hash));
    }

    if mine {
        let s = state.clone();
        tokio::spawn(async move { mining_task(s, threads).await });
    }

    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
    let mut watch = tokio::time::interval(std::time::Duration::from_millis(200));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = state.maintain().await {
                    tracing::error!("Maintenance failed: {}", e);
                    break;
                }
                let tip = state.get_tip().await;
                let pool = state.mempool.lock().await.len();
                tracing::info!("📊 height={} mempool={}", tip.map_or(0, |t| t.height), pool);
            }
            _ = watch.tick() => {
                if interrupt.load(Ordering::Relaxed) {
                    break;
                }
            }
        }
    }

    tracing::info!("💾 Flushing chain to disk...");
    state.shutdown().await?;
    tracing::info!("👋 Shutdown complete.");
    Ok(())
}

async fn mining_task(state: Arc<NodeState>, threads: usize) {
    let config = MinerConfig { threads, ..MinerConfig::default() };
    tracing::info!("⛏️  Mining with {} thread(s)", threads);
    while !state.is_shutting_down() {
        let template = {
            let chain = state.chain.read().await;
            let pool = state.mempool.lock().await;
            miner::create_block_template(&chain, Some(&pool), &config)
        };
        let template = match template {
            Ok(t) => t,
            Err(e) => {
                tracing::error!("Block template failed: {}", e);
                break;
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        let mined = tokio::task::spawn_blocking(move || miner::mine_block_parallel(template.block, threads, stop)).await;
        let block = match mined {
            Ok(MineResult::Found(block)) => block,
            Ok(MineResult::Cancelled) | Err(_) => break,
        };
        match state.submit_block(block).await {
            AcceptanceResult::Accepted(_) => {}
            AcceptanceResult::Aborted(_) => break,
            other => tracing::warn!("Mined block not accepted: {:?}", other),
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
}
