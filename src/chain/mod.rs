//! Chain state management: the block index, the coin set and its undo
//! records, block and transaction validation, and `ChainState`, which keeps
//! the active chain on the most-work valid branch.

pub mod checkqueue;
pub mod coins;
pub mod error;
pub mod index;
pub mod notify;
pub mod orphans;
pub mod sigcache;
pub mod state;
pub mod undo;
pub mod validation;
pub mod versionbits;

pub use coins::{Coin, CoinsView};
pub use error::{ChainStateError, ValidationError};
pub use index::{BlockId, BlockIndexEntry, BlockStatus};
pub use state::{BlockAcceptance, ChainState, ChainStateOptions, FlushMode, UtxoStats};
pub use undo::BlockUndo;
