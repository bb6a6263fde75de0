//! Key-value cache for attention and recurrent models.
//!
//! - [`KvCache`]: cell table, slot allocation and sequence edits
//! - [`KvStorage`]: per-layer key/value bytes
//! - [`DefragPlan`]: compaction as a copy graph
//! - [`KvCacheView`]: occupancy snapshot for diagnostics

mod cache;
mod cell;
mod defrag;
mod maintenance;
mod restore;
mod seq;
mod shift;
mod slot;
mod storage;
mod view;

pub use cache::{DiscontinuityPolicy, KvCache, KvCacheConfig};
pub use cell::KvCell;
pub use defrag::{DefragPlan, DefragRun};
pub use maintenance::{Maintenance, MaintenanceStep};
pub use restore::CellMeta;
pub use slot::gather_permutation;
pub use storage::{CacheTensor, KvStorage, LayerStorage};
pub use view::KvCacheView;

pub(crate) use seq::pos_bounds;
