//! Allocation blocks
//!
//! A block is one CIDR's worth of addresses stored as a single versioned
//! record. Allocations and releases are changes to that record, written back
//! with compare-and-swap.
//!
//! # Architecture
//!
//! ```text
//! AllocationBlock (10.0.0.0/26, affinity=host:node-a)
//!   ├─→ allocations: [0, 0, -, 1, -, ...]   one slot per ordinal
//!   ├─→ unallocated: [2, 4, 5, ...]         free-list, reuse from the front
//!   └─→ attributes:
//!         [0] {handle_id: "wl-1", secondary: {pod: "a"}}
//!         [1] {handle_id: "wl-2", secondary: {}}
//! ```
//!
//! Attribute records are interned: identical `(handle, tags)` pairs share one
//! entry, and every release compacts records that lose their last reference.
//!
//! Nothing in this module talks to a store. Operations either fully apply or
//! leave the block untouched, so a caller can always drop a block after a
//! failed compare-and-swap and recompute from a fresh read.

pub mod allocation_block;
pub mod allocations;
pub mod attributes;
pub mod free_list;
pub mod integrity;
pub mod record;

pub use allocation_block::{AllocationBlock, ReleaseOutcome};
pub use allocations::AllocationArray;
pub use attributes::{AttributeIndex, AttributeRecord, AttributeTable, HandleId, Tags};
pub use free_list::FreeList;
pub use integrity::IntegrityViolation;

/// Zero-based position of an address within its block
pub type Ordinal = u32;
