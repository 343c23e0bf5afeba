//! # Eventide Core
//!
//! Building blocks shared by the Eventide stream index:
//! - Fixed-shape index records and their binary layout
//! - Stream name hashing
//! - Error types
//! - Configuration and metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  eventide-core                  │
//! ├─────────────────────────────────────────────────┤
//! │  • types         - IndexEntry, Midpoint, Range  │
//! │  • serialization - Serializer & Codec traits    │
//! │  • hash          - StreamHasher                 │
//! │  • error         - Error handling               │
//! │  • config        - Engine configuration         │
//! │  • metrics       - Counters & timers            │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod serialization;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use hash::{Hash32, Murmur3, StreamHasher, XxHash32};
pub use serialization::{Codec, Serializer};
pub use types::{
    Direction, IndexEntry, Midpoint, Range, ENTRY_SIZE, MIDPOINT_SIZE, NO_VERSION, START_VERSION,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
