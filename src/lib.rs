//! Memory substrate for a bytecode-driven runtime.
//!
//! - [`stack`]: [`WordStack`], the growable operand/frame stack
//! - [`zone`]: [`MemoryZone`], guarded regions for the heap and the two
//!   execution stacks
//! - [`registry`]: [`ZoneRegistry`], the per-context table of zones and the
//!   register save area
//! - [`config`]: TOML configuration of sizes and overflow policy
//! - [`error`]: [`MemoryError`] and the fatal-abort primitive

pub mod config;
pub mod error;
pub mod registers;
pub mod registry;
pub mod stack;
pub mod zone;

/// The runtime's unit of storage
pub type Word = usize;

pub use config::{MemoryConfig, OverflowPolicy};
pub use error::MemoryError;
pub use registers::{RegisterFile, MAX_REGISTERS};
pub use registry::ZoneRegistry;
pub use stack::WordStack;
pub use zone::{MemoryZone, ZoneKind, ZoneState, ZoneUsage};
