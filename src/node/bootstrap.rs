//! Bootstrap files: the active chain as a gzip stream of blocks, used to
//! seed a new node without a peer.
//!
//! Layout: `[version:u32][height:u64][block_count:u64][genesis:32]` then
//! `[len:u32][block bytes]` for each block from genesis up, all little endian.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::Ordering;

use crate::chain::{BlockAcceptance, ChainState, ChainStateError};
use crate::core::params::MAX_BLOCK_SIZE;
use crate::core::types::Block;
use crate::mempool::Mempool;
use crate::storage::StorageError;

const BOOTSTRAP_VERSION: u32 = 1;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportStats {
    pub accepted: u64,
    pub duplicate: u64,
    pub invalid: u64,
}

fn io_err(e: std::io::Error) -> ChainStateError {
    ChainStateError::Storage(StorageError::from(e))
}

/// Write the active chain to `path`. Returns the number of blocks written.
pub fn export_blocks(chain: &ChainState, path: &Path) -> Result<u64, ChainStateError> {
    let height = chain.height().ok_or_else(|| ChainStateError::consistency("no active chain to export"))?;
    let genesis = chain.params().genesis_hash();

    let file = File::create(path).map_err(io_err)?;
    let mut encoder = flate2::write::GzEncoder::new(BufWriter::new(file), flate2::Compression::fast());
    encoder.write_all(&BOOTSTRAP_VERSION.to_le_bytes()).map_err(io_err)?;
    encoder.write_all(&height.to_le_bytes()).map_err(io_err)?;
    encoder.write_all(&(height + 1).to_le_bytes()).map_err(io_err)?;
    encoder.write_all(&genesis).map_err(io_err)?;

    for h in 0..=height {
        let hash = chain
            .hash_at_height(h)
            .ok_or_else(|| ChainStateError::consistency(format!("no active block at height {}", h)))?;
        let block = chain
            .get_block(&hash)?
            .ok_or_else(|| ChainStateError::consistency(format!("block data missing at height {}", h)))?;
        let encoded = block.to_bytes();
        encoder.write_all(&(encoded.len() as u32).to_le_bytes()).map_err(io_err)?;
        encoder.write_all(&encoded).map_err(io_err)?;
    }
    encoder.finish().map_err(io_err)?.flush().map_err(io_err)?;

    tracing::info!("📸 Exported {} block(s) to {}", height + 1, path.display());
    Ok(height + 1)
}

/// Feed every block in `path` through `process_new_block`. Blocks that fail
/// validation are counted and skipped; the import stops early when the
/// chain's interrupt flag is raised.
pub fn import_blocks(
    chain: &mut ChainState,
    mut mempool: Option<&mut Mempool>,
    path: &Path,
) -> Result<ImportStats, ChainStateError> {
    let file = File::open(path).map_err(io_err)?;
    let mut decoder = flate2::read::GzDecoder::new(BufReader::new(file));

    let mut u32_buf = [0u8; 4];
    let mut u64_buf = [0u8; 8];
    decoder.read_exact(&mut u32_buf).map_err(io_err)?;
    let version = u32::from_le_bytes(u32_buf);
    if version != BOOTSTRAP_VERSION {
        return Err(ChainStateError::Config(format!("unknown bootstrap version {}", version)));
    }
    decoder.read_exact(&mut u64_buf).map_err(io_err)?;
    let height = u64::from_le_bytes(u64_buf);
    decoder.read_exact(&mut u64_buf).map_err(io_err)?;
    let count = u64::from_le_bytes(u64_buf);
    let mut genesis = [0u8; 32];
    decoder.read_exact(&mut genesis).map_err(io_err)?;
    if genesis != chain.params().genesis_hash() {
        return Err(ChainStateError::Config(format!(
            "bootstrap file is for another network (genesis {})",
            hex::encode(genesis)
        )));
    }

    tracing::info!("📸 Importing {} block(s) up to height {} from {}", count, height, path.display());
    let interrupt = chain.interrupt_flag();
    let mut stats = ImportStats::default();
    for _ in 0..count {
        if interrupt.load(Ordering::Relaxed) {
            tracing::warn!("Import interrupted");
            break;
        }
        decoder.read_exact(&mut u32_buf).map_err(io_err)?;
        let len = u32::from_le_bytes(u32_buf) as usize;
        if len > MAX_BLOCK_SIZE {
            return Err(StorageError::Corrupt(format!("bootstrap block of {} bytes", len)).into());
        }
        let mut bytes = vec![0u8; len];
        decoder.read_exact(&mut bytes).map_err(io_err)?;
        let block = Block::from_bytes(&bytes, MAX_BLOCK_SIZE)
            .map_err(|e| StorageError::Corrupt(format!("bootstrap block: {}", e)))?;

        match chain.process_new_block(block, mempool.as_deref_mut()) {
            Ok(BlockAcceptance::Accepted(_)) => stats.accepted += 1,
            Ok(BlockAcceptance::Duplicate) => stats.duplicate += 1,
            Ok(BlockAcceptance::Orphan { missing }) => {
                tracing::warn!("Bootstrap block out of order, parent {} unknown", hex::encode(missing));
                stats.invalid += 1;
            }
            Err(ChainStateError::Validation(e)) => {
                tracing::warn!("❌ Bootstrap block rejected: {}", e);
                stats.invalid += 1;
            }
            Err(e) => return Err(e),
        }
    }
    chain.flush()?;
    tracing::info!(
        "📸 Import done: {} accepted, {} already known, {} rejected",
        stats.accepted,
        stats.duplicate,
        stats.invalid
    );
    Ok(stats)
}
