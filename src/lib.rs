// ============================================================================
// FeedMetaDB Library
// ============================================================================

pub mod coalescing;
pub mod coordination;
pub mod core;
pub mod file;
pub mod metadata;

// Re-export main types for convenience
pub use crate::coalescing::{CoalescingKey, CoalescingQueue, FlushAction};
pub use crate::coordination::{CoordinationPolicy, FileCoordinator};
pub use crate::core::{Result, StoreError};
pub use crate::file::FeedMetadataFile;
pub use crate::metadata::{ConditionalGetInfo, FeedMetadata, MetadataMapping, MetadataOwner};
