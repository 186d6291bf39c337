//! Region-based generational garbage collector.
//!
//! Young objects live in two semi spaces, survivors are promoted into a
//! free-list managed old space, and objects that must not move live in the
//! non-movable, machine code, huge and snapshot spaces. Collections run on
//! a pool of worker threads; an optional concurrent mark prepares partial
//! collections while the mutator runs.

mod bitmap;
mod collector;
mod concurrent_marker;
mod evacuator;
mod free_list;
mod gc_stats;
mod heap;
mod marker;
pub mod mem_controller;
mod region;
mod roots;
mod settings;
mod space;
mod system;
mod task_pool;
mod tlab;
mod work_manager;

pub use bitmap::GcBitset;
pub use collector::GcKind;
pub use concurrent_marker::{ConcurrentMarker, MarkerState};
pub use evacuator::EvacuationWork;
pub(crate) use evacuator::Evacuator;
pub use free_list::FreeObjectList;
pub use gc_stats::{GcStats, LONG_PAUSE, PauseStats};
pub use heap::*;
pub use marker::{CompressGcMarker, Marker, NonMovableMarker, SemiGcMarker, SlotStatus};
pub use mem_controller::{MemController, MemGrowingType};
pub use region::{HeapRegionAllocator, NO_REGION, Region, RegionFlags, RegionId};
pub use roots::{GlobalHandle, GlobalHandles, Root, RootProvider};
pub use settings::HeapSettings;
pub use space::{HugeObjectSpace, LinearSpace, SemiSpace, SnapshotSpace, Space, SpaceType, SparseSpace};
pub use system::{AlignedMapping, OS_PAGE_SIZE, map_aligned, map_memory, unmap_memory};
pub use task_pool::{Task, TaskPool};
pub use tlab::Tlab;
pub use work_manager::{NodeId, WorkManager, WorkNode, WorkNodeHolder};
