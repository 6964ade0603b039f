//! Process-wide table of zones
//!
//! [`ZoneRegistry`] owns the heap, the deterministic stack, the
//! nondeterministic stack and the register save area of one execution
//! context. It is created from a [`MemoryConfig`], brought up once with
//! [`ZoneRegistry::init`] and torn down with [`ZoneRegistry::shutdown`].
//!
//! The registry is also where the overflow policy lives: a zone only reports
//! that its guard band was reached, and [`ZoneRegistry::claim`] /
//! [`ZoneRegistry::check_guard`] decide between growing it and giving up.

use crate::config::{MemoryConfig, OverflowPolicy};
use crate::error::MemoryError;
use crate::registers::RegisterFile;
use crate::stack::WordStack;
use crate::zone::{MemoryZone, ZoneKind, ZoneState, ZoneUsage};
use indexmap::IndexMap;
use log::{debug, info, warn};
use std::fmt;
use std::ops::Range;

pub struct ZoneRegistry {
    config: MemoryConfig,
    /// Zones in creation order; teardown runs in reverse
    zones: IndexMap<ZoneKind, MemoryZone>,
    registers: RegisterFile,
}

impl ZoneRegistry {
    /// An uninitialized registry; no memory is allocated until `init`
    pub fn new(config: MemoryConfig) -> Self {
        ZoneRegistry {
            config,
            zones: IndexMap::new(),
            registers: RegisterFile::new(),
        }
    }

    /// Create and initialize in one step
    pub fn init_memory(config: MemoryConfig) -> Result<Self, MemoryError> {
        let mut registry = ZoneRegistry::new(config);
        registry.init()?;
        Ok(registry)
    }

    /// Allocate every zone. On failure the zones created so far are released
    /// and the registry stays uninitialized.
    pub fn init(&mut self) -> Result<(), MemoryError> {
        assert!(!self.is_initialized(), "memory already initialized");
        self.config.validate()?;

        for kind in ZoneKind::ALL {
            let zc = self.config.zone(kind);
            match MemoryZone::create_reserved(kind, zc.size, zc.guard, zc.bottom_reserve) {
                Ok(zone) => {
                    self.zones.insert(kind, zone);
                }
                Err(e) => {
                    self.shutdown();
                    return Err(e);
                }
            }
        }
        self.registers.reset();
        info!(
            "memory initialized: {} zones, overflow policy {:?}",
            self.zones.len(),
            self.config.overflow.policy
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        !self.zones.is_empty()
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// A word stack sized from the configuration
    pub fn new_word_stack(&self) -> WordStack {
        WordStack::new(self.config.wordstack.initial_capacity)
    }

    pub fn zone(&self, kind: ZoneKind) -> Option<&MemoryZone> {
        self.zones.get(&kind)
    }

    pub fn zone_mut(&mut self, kind: ZoneKind) -> Option<&mut MemoryZone> {
        self.zones.get_mut(&kind)
    }

    /// Lifecycle state of a zone; `Uninitialized` before `init` and after
    /// `shutdown`
    pub fn state(&self, kind: ZoneKind) -> ZoneState {
        self.zones
            .get(&kind)
            .map_or(ZoneState::Uninitialized, |z| z.state())
    }

    pub fn usage(&self, kind: ZoneKind) -> Option<ZoneUsage> {
        self.zones.get(&kind).map(|z| z.usage())
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut RegisterFile {
        &mut self.registers
    }

    /// Claim `[base, base + words)` in a zone, applying the overflow policy
    /// when the block reaches the guard band. Under `grow` the zone is
    /// extended and the claim retried once; under `abort` (or past the size
    /// limit) the zone is aborted and `StackExhausted` returned.
    pub fn claim(
        &mut self,
        kind: ZoneKind,
        base: usize,
        words: usize,
    ) -> Result<Range<usize>, MemoryError> {
        match self.expect_zone(kind).claim_block(base, words) {
            Err(MemoryError::ZoneOverflow { .. }) => {
                let needed_end = base.saturating_add(words);
                self.handle_overflow(kind, needed_end)?;
                self.expect_zone(kind).claim_block(base, words)
            }
            result => result,
        }
    }

    /// Probe a zone's guard band. Returns `Ok(true)` when the band had been
    /// written and the zone was grown: the writes since the previous check
    /// landed in the old band and must be redone.
    pub fn check_guard(&mut self, kind: ZoneKind) -> Result<bool, MemoryError> {
        match self.expect_zone(kind).probe_guard() {
            Ok(()) => Ok(false),
            Err(MemoryError::ZoneOverflow { address, .. }) => {
                self.handle_overflow(kind, address.saturating_add(1))?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Release every zone in reverse creation order
    pub fn shutdown(&mut self) {
        while let Some((kind, zone)) = self.zones.pop() {
            debug!("tearing down {}", kind);
            zone.destroy();
        }
        self.registers.reset();
        info!("memory shut down");
    }

    // Grow the zone so that `needed_end` lies below its guard band, or abort
    fn handle_overflow(&mut self, kind: ZoneKind, needed_end: usize) -> Result<(), MemoryError> {
        let overflow = self.config.overflow.clone();
        let zone = self.expect_zone(kind);

        if overflow.policy == OverflowPolicy::Abort {
            zone.abort();
            return Err(MemoryError::StackExhausted { zone: kind });
        }

        let guard = zone.guard();
        let shortfall = needed_end.saturating_sub(guard);
        let mut extra = shortfall.max(overflow.increment);
        if let Some(limit) = overflow.limit {
            let room = limit.saturating_sub(guard);
            if shortfall > room || room == 0 {
                warn!(
                    "{} cannot grow past limit of {} words (needs {})",
                    kind, limit, needed_end
                );
                zone.abort();
                return Err(MemoryError::StackExhausted { zone: kind });
            }
            extra = extra.min(room);
        }
        zone.grow(extra)
    }

    fn expect_zone(&mut self, kind: ZoneKind) -> &mut MemoryZone {
        match self.zones.get_mut(&kind) {
            Some(zone) => zone,
            None => panic!("{} used before memory initialization", kind),
        }
    }
}

impl Drop for ZoneRegistry {
    fn drop(&mut self) {
        if self.is_initialized() {
            self.shutdown();
        }
    }
}

impl fmt::Display for ZoneRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "zone        min       max       guard     end       size      used      margin    state"
        )?;
        for zone in self.zones.values() {
            let u = zone.usage();
            writeln!(
                f,
                "{:<10}  {:#08x}  {:#08x}  {:#08x}  {:#08x}  {:<8}  {:<8}  {:<8}  {}",
                u.kind.name(),
                u.min,
                u.max,
                u.guard,
                u.end,
                u.size(),
                u.high_water(),
                u.margin(),
                u.state
            )?;
        }
        write!(
            f,
            "registers   {} (total uses {})",
            self.registers.use_counts().len(),
            self.registers.use_counts().iter().sum::<crate::Word>()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZoneConfig;
    use test_log::test;

    fn small_config(policy: OverflowPolicy) -> MemoryConfig {
        let mut config = MemoryConfig::default();
        config.heap = ZoneConfig::new(64, 8);
        config.detstack = ZoneConfig::new(32, 4);
        config.nondstack = ZoneConfig::new(32, 4);
        config.overflow.policy = policy;
        config.overflow.increment = 16;
        config.overflow.limit = Some(128);
        config
    }

    #[test]
    fn test_lifecycle_states() {
        let mut registry = ZoneRegistry::new(small_config(OverflowPolicy::Grow));
        assert_eq!(registry.state(ZoneKind::Heap), ZoneState::Uninitialized);

        registry.init().unwrap();
        for kind in ZoneKind::ALL {
            assert_eq!(registry.state(kind), ZoneState::Active);
        }

        registry.shutdown();
        assert!(!registry.is_initialized());
        assert_eq!(registry.state(ZoneKind::NondStack), ZoneState::Uninitialized);
    }

    #[test]
    fn test_claim_grows_under_grow_policy() {
        let mut registry = ZoneRegistry::init_memory(small_config(OverflowPolicy::Grow)).unwrap();
        let r = registry.claim(ZoneKind::DetStack, 30, 10).unwrap();
        assert_eq!(r, 30..40);
        let usage = registry.usage(ZoneKind::DetStack).unwrap();
        // grew by the increment, which covers the 8-word shortfall
        assert_eq!(usage.guard, 48);
        assert_eq!(usage.max, 39);
        assert_eq!(usage.state, ZoneState::Active);
    }

    #[test]
    fn test_claim_grows_by_shortfall_when_larger() {
        let mut registry = ZoneRegistry::init_memory(small_config(OverflowPolicy::Grow)).unwrap();
        registry.claim(ZoneKind::Heap, 0, 100).unwrap();
        assert_eq!(registry.usage(ZoneKind::Heap).unwrap().guard, 100);
    }

    #[test]
    fn test_claim_aborts_under_abort_policy() {
        let mut registry = ZoneRegistry::init_memory(small_config(OverflowPolicy::Abort)).unwrap();
        let err = registry.claim(ZoneKind::NondStack, 30, 4).unwrap_err();
        assert_eq!(
            err,
            MemoryError::StackExhausted {
                zone: ZoneKind::NondStack
            }
        );
        assert_eq!(registry.state(ZoneKind::NondStack), ZoneState::Aborted);
        // other zones are unaffected
        assert_eq!(registry.state(ZoneKind::DetStack), ZoneState::Active);
    }

    #[test]
    fn test_limit_turns_growth_into_exhaustion() {
        let mut registry = ZoneRegistry::init_memory(small_config(OverflowPolicy::Grow)).unwrap();
        let err = registry.claim(ZoneKind::DetStack, 0, 200).unwrap_err();
        assert_eq!(
            err,
            MemoryError::StackExhausted {
                zone: ZoneKind::DetStack
            }
        );
    }

    #[test]
    fn test_check_guard_trap() {
        let mut registry = ZoneRegistry::init_memory(small_config(OverflowPolicy::Grow)).unwrap();
        assert!(!registry.check_guard(ZoneKind::Heap).unwrap());

        registry.zone_mut(ZoneKind::Heap).unwrap().write(65, 1);
        assert!(registry.check_guard(ZoneKind::Heap).unwrap());
        let usage = registry.usage(ZoneKind::Heap).unwrap();
        assert_eq!(usage.guard, 80);
        assert!(!registry.check_guard(ZoneKind::Heap).unwrap());
    }

    #[test]
    fn test_display_lists_zones() {
        let registry = ZoneRegistry::init_memory(small_config(OverflowPolicy::Grow)).unwrap();
        let text = registry.to_string();
        assert!(text.contains("heap"));
        assert!(text.contains("detstack"));
        assert!(text.contains("nondstack"));
        assert!(text.contains("registers   37"));
        let heap_row = text.lines().find(|l| l.starts_with("heap")).unwrap();
        let columns: Vec<&str> = heap_row.split_whitespace().collect();
        assert_eq!(columns[5], "64");
        assert_eq!(registry.usage(ZoneKind::Heap).unwrap().size(), 64);
    }

    #[test]
    #[should_panic(expected = "used before memory initialization")]
    fn test_claim_before_init_panics() {
        let mut registry = ZoneRegistry::new(MemoryConfig::default());
        let _ = registry.claim(ZoneKind::Heap, 0, 1);
    }
}
