//! Memory configuration
//!
//! Sizes are in words. Every section and key is optional:
//!
//! ```toml
//! [wordstack]
//! initial_capacity = 64
//!
//! [heap]
//! size = 65536
//! guard = 1024
//! bottom_reserve = 0
//!
//! [detstack]
//! size = 16384
//! guard = 1024
//!
//! [nondstack]
//! size = 16384
//! guard = 1024
//!
//! [overflow]
//! policy = "grow"    # or "abort"
//! increment = 16384
//! limit = 1048576
//! ```

use crate::error::MemoryError;
use crate::zone::ZoneKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// What the registry does when a zone reaches its guard band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Extend the zone and retry
    Grow,
    /// Mark the zone aborted and report it exhausted
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WordStackConfig {
    pub initial_capacity: usize,
}

impl Default for WordStackConfig {
    fn default() -> Self {
        WordStackConfig {
            initial_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ZoneConfig {
    /// Usable words, guard band excluded
    pub size: usize,
    /// Guard band words
    pub guard: usize,
    /// Words kept below the live extent
    pub bottom_reserve: usize,
}

impl ZoneConfig {
    pub fn new(size: usize, guard: usize) -> Self {
        ZoneConfig {
            size,
            guard,
            bottom_reserve: 0,
        }
    }
}

impl Default for ZoneConfig {
    fn default() -> Self {
        ZoneConfig::new(16 * 1024, 1024)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OverflowConfig {
    pub policy: OverflowPolicy,
    /// Minimum number of words added per growth
    pub increment: usize,
    /// Ceiling on a zone's usable size; no ceiling when absent
    pub limit: Option<usize>,
}

impl Default for OverflowConfig {
    fn default() -> Self {
        OverflowConfig {
            policy: OverflowPolicy::Grow,
            increment: 16 * 1024,
            limit: Some(1024 * 1024),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    pub wordstack: WordStackConfig,
    pub heap: ZoneConfig,
    pub detstack: ZoneConfig,
    pub nondstack: ZoneConfig,
    pub overflow: OverflowConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            wordstack: WordStackConfig::default(),
            heap: ZoneConfig::new(64 * 1024, 1024),
            detstack: ZoneConfig::default(),
            nondstack: ZoneConfig::default(),
            overflow: OverflowConfig::default(),
        }
    }
}

impl MemoryConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, MemoryError> {
        let config: MemoryConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            MemoryError::IOError(format!("cannot read {}: {}", path.display(), e))
        })?;
        log::debug!("loading memory configuration from {}", path.display());
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, MemoryError> {
        toml::to_string(self).map_err(|e| MemoryError::ConfigError(e.to_string()))
    }

    pub fn zone(&self, kind: ZoneKind) -> &ZoneConfig {
        match kind {
            ZoneKind::Heap => &self.heap,
            ZoneKind::DetStack => &self.detstack,
            ZoneKind::NondStack => &self.nondstack,
        }
    }

    pub fn zone_mut(&mut self, kind: ZoneKind) -> &mut ZoneConfig {
        match kind {
            ZoneKind::Heap => &mut self.heap,
            ZoneKind::DetStack => &mut self.detstack,
            ZoneKind::NondStack => &mut self.nondstack,
        }
    }

    pub fn validate(&self) -> Result<(), MemoryError> {
        for kind in ZoneKind::ALL {
            let zone = self.zone(kind);
            if zone.size == 0 {
                return Err(MemoryError::ConfigError(format!(
                    "{}: size must be non-zero",
                    kind
                )));
            }
            if zone.bottom_reserve >= zone.size {
                return Err(MemoryError::ConfigError(format!(
                    "{}: bottom_reserve {} leaves no room in {} words",
                    kind, zone.bottom_reserve, zone.size
                )));
            }
            if let Some(limit) = self.overflow.limit {
                if limit < zone.size {
                    return Err(MemoryError::ConfigError(format!(
                        "{}: size {} exceeds overflow limit {}",
                        kind, zone.size, limit
                    )));
                }
            }
        }
        if self.overflow.policy == OverflowPolicy::Grow && self.overflow.increment == 0 {
            return Err(MemoryError::ConfigError(
                "overflow increment must be non-zero when policy is grow".to_string(),
            ));
        }
        Ok(())
    }
}
