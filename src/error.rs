// Memory substrate error handling

use crate::zone::ZoneKind;
use log::error;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    // Fatal: the runtime has no valid continuation without these regions
    OutOfMemory { what: String, words: usize },

    // Recoverable: a block claim or guard probe reached the guard band
    ZoneOverflow {
        zone: ZoneKind,
        address: usize,
        guard: usize,
    },
    // Overflow policy refused to grow (abort policy, or size limit reached)
    StackExhausted { zone: ZoneKind },
    // A word read back from a zone does not hold what was stored there
    Corrupted { zone: ZoneKind, address: usize },

    // Configuration errors
    ConfigError(String),
    IOError(String),
}

impl MemoryError {
    /// True for the allocation failures the driver must treat as unrecoverable
    pub fn is_fatal(&self) -> bool {
        matches!(self, MemoryError::OutOfMemory { .. })
    }

    /// True for guard band hits the caller may answer by growing the zone
    pub fn is_overflow(&self) -> bool {
        matches!(self, MemoryError::ZoneOverflow { .. })
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MemoryError::OutOfMemory { what, words } => {
                write!(f, "Unable to allocate memory: {} ({} words)", what, words)
            }
            MemoryError::ZoneOverflow {
                zone,
                address,
                guard,
            } => {
                write!(
                    f,
                    "{} overflow: access at {:#x} reached guard band at {:#x}",
                    zone, address, guard
                )
            }
            MemoryError::StackExhausted { zone } => {
                write!(f, "{} exhausted", zone)
            }
            MemoryError::Corrupted { zone, address } => {
                write!(f, "{} corrupted at {:#x}", zone, address)
            }
            MemoryError::ConfigError(msg) => {
                write!(f, "Configuration error: {}", msg)
            }
            MemoryError::IOError(msg) => {
                write!(f, "IO error: {}", msg)
            }
        }
    }
}

impl std::error::Error for MemoryError {}

impl From<std::io::Error> for MemoryError {
    fn from(error: std::io::Error) -> Self {
        MemoryError::IOError(error.to_string())
    }
}

impl From<toml::de::Error> for MemoryError {
    fn from(error: toml::de::Error) -> Self {
        MemoryError::ConfigError(error.to_string())
    }
}

/// Log the diagnostic and terminate the process.
///
/// Used when a stack buffer or zone region cannot be obtained. Nothing
/// downstream can run without those regions, so there is no unwinding.
pub fn fatal(err: &MemoryError) -> ! {
    error!("fatal: {}", err);
    eprintln!("Fatal error: {}", err);
    std::process::abort()
}
