//! Guarded memory zones
//!
//! A [`MemoryZone`] backs one of the runtime's execution areas (the heap, the
//! deterministic stack or the nondeterministic stack). Addresses are word
//! offsets from the start of the zone, so they stay meaningful when the zone
//! grows and its buffer moves.
//!
//! ```text
//! start      min            max          guard          end
//!   | reserve | live extent  |   free     | guard band   |
//! ```
//!
//! Invariant: `start <= min <= max <= guard <= end`.
//!
//! Single-word [`MemoryZone::read`] and [`MemoryZone::write`] never look at
//! the guard band; [`MemoryZone::store`] is the checked single-word form.
//! Overflow is detected in two ways:
//! - block claims ([`MemoryZone::claim_block`]) compare the end of the block
//!   against `guard`, the check a frame push or choice-point push performs;
//! - the guard band is filled with a sentinel, and [`MemoryZone::probe_guard`]
//!   reports the first clobbered word, standing in for a guard-page trap.
//!
//! Either way the zone moves to [`ZoneState::Overflowed`] and the caller
//! decides whether to [`MemoryZone::grow`] or [`MemoryZone::abort`].

use crate::error::MemoryError;
use crate::Word;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Sentinel written over the guard band
pub const GUARD_PATTERN: Word = 0xDEAD_BEEF;

/// The runtime's named zones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneKind {
    Heap,
    DetStack,
    NondStack,
}

impl ZoneKind {
    pub const ALL: [ZoneKind; 3] = [ZoneKind::Heap, ZoneKind::DetStack, ZoneKind::NondStack];

    pub fn name(&self) -> &'static str {
        match self {
            ZoneKind::Heap => "heap",
            ZoneKind::DetStack => "detstack",
            ZoneKind::NondStack => "nondstack",
        }
    }
}

impl fmt::Display for ZoneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle of a zone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneState {
    /// Not created yet (registry before init, or after shutdown)
    Uninitialized,
    Active,
    /// A claim or probe reached the guard band; grow or abort
    Overflowed,
    /// Terminal: the overflow policy gave up on this zone
    Aborted,
}

impl fmt::Display for ZoneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ZoneState::Uninitialized => "uninitialized",
            ZoneState::Active => "active",
            ZoneState::Overflowed => "overflowed",
            ZoneState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a zone's extents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneUsage {
    pub kind: ZoneKind,
    pub start: usize,
    pub min: usize,
    pub max: usize,
    pub guard: usize,
    pub end: usize,
    pub state: ZoneState,
}

impl ZoneUsage {
    /// Words between the bottom of the live extent and the high-water mark
    pub fn high_water(&self) -> usize {
        self.max - self.min
    }

    /// Words left before the guard band
    pub fn margin(&self) -> usize {
        self.guard - self.max
    }

    /// Usable words, guard band excluded
    pub fn size(&self) -> usize {
        self.guard - self.start
    }
}

/// One guarded region of words
#[derive(Debug)]
pub struct MemoryZone {
    kind: ZoneKind,
    /// The whole region, `[start, end)`
    words: Vec<Word>,
    min: usize,
    max: usize,
    guard: usize,
    guard_left: usize,
    state: ZoneState,
}

impl MemoryZone {
    /// Allocate a zone of `initial_size` usable words followed by a guard band
    /// of `guard_size` words.
    pub fn create(
        kind: ZoneKind,
        initial_size: usize,
        guard_size: usize,
    ) -> Result<Self, MemoryError> {
        Self::create_reserved(kind, initial_size, guard_size, 0)
    }

    /// Like [`MemoryZone::create`], keeping the bottom `bottom_reserve` words
    /// out of the live extent (`min = start + bottom_reserve`).
    pub fn create_reserved(
        kind: ZoneKind,
        initial_size: usize,
        guard_size: usize,
        bottom_reserve: usize,
    ) -> Result<Self, MemoryError> {
        if bottom_reserve > initial_size {
            return Err(MemoryError::ConfigError(format!(
                "{}: bottom reserve of {} words exceeds zone size {}",
                kind, bottom_reserve, initial_size
            )));
        }
        let total = initial_size
            .checked_add(guard_size)
            .ok_or_else(|| MemoryError::OutOfMemory {
                what: format!("{} zone", kind),
                words: usize::MAX,
            })?;

        let mut words = Vec::new();
        words
            .try_reserve_exact(total)
            .map_err(|_| MemoryError::OutOfMemory {
                what: format!("{} zone", kind),
                words: total,
            })?;
        words.resize(initial_size, 0);
        words.resize(total, GUARD_PATTERN);

        info!(
            "{} zone created: {} words, guard band {} words",
            kind, initial_size, guard_size
        );
        Ok(MemoryZone {
            kind,
            words,
            min: bottom_reserve,
            max: bottom_reserve,
            guard: initial_size,
            guard_left: guard_size,
            state: ZoneState::Active,
        })
    }

    pub fn kind(&self) -> ZoneKind {
        self.kind
    }

    pub fn state(&self) -> ZoneState {
        self.state
    }

    /// First word of the region; always 0 since addresses are offsets
    pub fn start(&self) -> usize {
        0
    }

    /// First word of the live extent
    pub fn min(&self) -> usize {
        self.min
    }

    /// Highest address noted so far
    pub fn max(&self) -> usize {
        self.max
    }

    /// First word of the guard band
    pub fn guard(&self) -> usize {
        self.guard
    }

    /// One past the last word of the region
    pub fn end(&self) -> usize {
        self.words.len()
    }

    /// Size of the guard band in words
    pub fn guard_left(&self) -> usize {
        self.guard_left
    }

    /// Words that can still be noted before the guard band is reached
    pub fn overflow_margin(&self) -> usize {
        self.guard - self.max
    }

    /// Check `start <= min <= max <= guard <= end`
    pub fn invariants_hold(&self) -> bool {
        self.start() <= self.min
            && self.min <= self.max
            && self.max <= self.guard
            && self.guard <= self.end()
            && self.end() - self.guard == self.guard_left
    }

    pub fn usage(&self) -> ZoneUsage {
        ZoneUsage {
            kind: self.kind,
            start: self.start(),
            min: self.min,
            max: self.max,
            guard: self.guard,
            end: self.end(),
            state: self.state,
        }
    }

    /// Record an access at `address`, raising the high-water mark.
    ///
    /// An address at or past the guard band is an overflow: the mark is left
    /// alone and the zone becomes `Overflowed`.
    pub fn note_access(&mut self, address: usize) -> Result<(), MemoryError> {
        if self.state == ZoneState::Aborted {
            return Err(MemoryError::StackExhausted { zone: self.kind });
        }
        assert!(
            address >= self.min,
            "{} access at {:#x} below live extent starting at {:#x}",
            self.kind,
            address,
            self.min
        );
        if address >= self.guard {
            return Err(self.overflowed(address));
        }
        if address > self.max {
            self.max = address;
        }
        debug_assert!(self.invariants_hold());
        Ok(())
    }

    /// Check that the block `[base, base + words)` lies below the guard band
    /// and note its last word. Returns the block's address range.
    ///
    /// A rejected claim leaves the high-water mark where it was.
    pub fn claim_block(&mut self, base: usize, words: usize) -> Result<Range<usize>, MemoryError> {
        if self.state == ZoneState::Aborted {
            return Err(MemoryError::StackExhausted { zone: self.kind });
        }
        assert!(
            base >= self.min,
            "{} block at {:#x} below live extent starting at {:#x}",
            self.kind,
            base,
            self.min
        );
        if words == 0 {
            if base > self.guard {
                return Err(self.overflowed(base));
            }
            return Ok(base..base);
        }
        let last = match base.checked_add(words - 1) {
            Some(last) => last,
            None => return Err(self.overflowed(usize::MAX)),
        };
        if last >= self.guard {
            return Err(self.overflowed(last));
        }
        self.note_access(last)?;
        Ok(base..last + 1)
    }

    /// Read one word. No guard check.
    #[inline]
    pub fn read(&self, address: usize) -> Word {
        self.words[address]
    }

    /// Write one word. No guard check; use `claim_block`, `store` or
    /// `probe_guard`.
    ///
    /// The guard band is part of the region, so a write there lands in the
    /// band and is caught by the next `probe_guard`. With a zero-size band
    /// there is nothing to land in: a write at `guard` is past `end` and
    /// panics. Zones without a band rely on `claim_block` or `store`.
    #[inline]
    pub fn write(&mut self, address: usize, value: Word) {
        self.words[address] = value;
    }

    /// Note the access, then write one word. An address at or past the guard
    /// band is reported as overflow for every guard size, including zero.
    pub fn store(&mut self, address: usize, value: Word) -> Result<(), MemoryError> {
        self.note_access(address)?;
        self.words[address] = value;
        Ok(())
    }

    /// Borrow a range of words, e.g. a claimed block
    pub fn slice(&self, range: Range<usize>) -> &[Word] {
        &self.words[range]
    }

    /// Borrow a range of words mutably. The borrow ends before any `grow`.
    pub fn slice_mut(&mut self, range: Range<usize>) -> &mut [Word] {
        &mut self.words[range]
    }

    /// Scan the guard band for clobbered words.
    ///
    /// Not exact: a write into the band whose value equals [`GUARD_PATTERN`]
    /// goes unnoticed, and a zone created with no band never trips. Block
    /// claims are the exact check.
    pub fn probe_guard(&mut self) -> Result<(), MemoryError> {
        if self.state == ZoneState::Aborted {
            return Err(MemoryError::StackExhausted { zone: self.kind });
        }
        let hit = self.words[self.guard..]
            .iter()
            .position(|&w| w != GUARD_PATTERN);
        match hit {
            Some(offset) => Err(self.overflowed(self.guard + offset)),
            None => Ok(()),
        }
    }

    /// Extend the zone by `extra_size` usable words. The live extent is kept,
    /// the guard band moves to the new end and is re-armed. Addresses stay
    /// valid, borrowed slices do not survive (the buffer may move).
    pub fn grow(&mut self, extra_size: usize) -> Result<(), MemoryError> {
        if self.state == ZoneState::Aborted {
            return Err(MemoryError::StackExhausted { zone: self.kind });
        }
        let old_end = self.end();
        let new_end = old_end
            .checked_add(extra_size)
            .ok_or_else(|| MemoryError::OutOfMemory {
                what: format!("{} zone growth", self.kind),
                words: usize::MAX,
            })?;
        self.words
            .try_reserve_exact(extra_size)
            .map_err(|_| MemoryError::OutOfMemory {
                what: format!("{} zone growth", self.kind),
                words: new_end,
            })?;

        // The old guard band becomes ordinary free space
        let old_guard = self.guard;
        self.words[old_guard..].fill(0);
        self.guard = new_end - self.guard_left;
        self.words.resize(self.guard, 0);
        self.words.resize(new_end, GUARD_PATTERN);

        debug!(
            "{} zone grown: guard {:#x} -> {:#x}, end {:#x} -> {:#x} ({})",
            self.kind, old_guard, self.guard, old_end, new_end, self.state
        );
        self.state = ZoneState::Active;
        debug_assert!(self.invariants_hold());
        Ok(())
    }

    /// Give up on the zone after an overflow. Terminal.
    pub fn abort(&mut self) {
        warn!(
            "{} zone aborted at high-water {:#x} of {:#x}",
            self.kind, self.max, self.guard
        );
        self.state = ZoneState::Aborted;
    }

    /// Release the region
    pub fn destroy(self) {
        debug!(
            "{} zone destroyed (high-water {} of {} words)",
            self.kind,
            self.max - self.min,
            self.guard - self.min
        );
    }

    fn overflowed(&mut self, address: usize) -> MemoryError {
        warn!(
            "{} overflow: access at {:#x}, guard band at {:#x}",
            self.kind, address, self.guard
        );
        self.state = ZoneState::Overflowed;
        MemoryError::ZoneOverflow {
            zone: self.kind,
            address,
            guard: self.guard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_create_layout() {
        let z = MemoryZone::create(ZoneKind::Heap, 100, 10).unwrap();
        assert_eq!(z.start(), 0);
        assert_eq!(z.min(), 0);
        assert_eq!(z.max(), 0);
        assert_eq!(z.guard(), 100);
        assert_eq!(z.end(), 110);
        assert_eq!(z.guard_left(), 10);
        assert_eq!(z.overflow_margin(), 100);
        assert_eq!(z.state(), ZoneState::Active);
        assert!(z.invariants_hold());
    }

    #[test]
    fn test_bottom_reserve() {
        let z = MemoryZone::create_reserved(ZoneKind::DetStack, 64, 8, 4).unwrap();
        assert_eq!(z.min(), 4);
        assert_eq!(z.max(), 4);
        assert!(z.invariants_hold());

        let err = MemoryZone::create_reserved(ZoneKind::DetStack, 4, 8, 5).unwrap_err();
        assert!(matches!(err, MemoryError::ConfigError(_)));
    }

    #[test]
    fn test_note_access_is_monotonic() {
        let mut z = MemoryZone::create(ZoneKind::DetStack, 32, 4).unwrap();
        z.note_access(10).unwrap();
        assert_eq!(z.max(), 10);
        z.note_access(3).unwrap();
        assert_eq!(z.max(), 10);
        z.note_access(31).unwrap();
        assert_eq!(z.max(), 31);
        assert_eq!(z.overflow_margin(), 1);
    }

    #[test]
    fn test_access_at_guard_overflows() {
        for guard_size in [0, 1, 16] {
            let mut z = MemoryZone::create(ZoneKind::NondStack, 16, guard_size).unwrap();
            let err = z.note_access(16).unwrap_err();
            assert_eq!(
                err,
                MemoryError::ZoneOverflow {
                    zone: ZoneKind::NondStack,
                    address: 16,
                    guard: 16
                }
            );
            assert_eq!(z.state(), ZoneState::Overflowed);
            assert_eq!(z.max(), 0);
            assert!(z.invariants_hold());
        }
    }

    #[test]
    fn test_claim_block() {
        let mut z = MemoryZone::create(ZoneKind::DetStack, 16, 4).unwrap();
        let r = z.claim_block(0, 8).unwrap();
        assert_eq!(r, 0..8);
        assert_eq!(z.max(), 7);

        z.slice_mut(r.clone()).copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(z.slice(r), &[1, 2, 3, 4, 5, 6, 7, 8]);

        // fits exactly up to the guard
        assert_eq!(z.claim_block(8, 8).unwrap(), 8..16);
        assert!(z.claim_block(16, 0).is_ok());
        assert!(z.claim_block(9, 8).unwrap_err().is_overflow());
    }

    #[test]
    fn test_probe_guard_detects_clobber() {
        let mut z = MemoryZone::create(ZoneKind::DetStack, 8, 4).unwrap();
        z.write(7, 1);
        assert!(z.probe_guard().is_ok());

        // unchecked single-word write straight into the guard band
        z.write(9, 1);
        let err = z.probe_guard().unwrap_err();
        assert_eq!(
            err,
            MemoryError::ZoneOverflow {
                zone: ZoneKind::DetStack,
                address: 9,
                guard: 8
            }
        );
        assert_eq!(z.state(), ZoneState::Overflowed);
    }

    #[test]
    fn test_grow_preserves_and_rearms() {
        let mut z = MemoryZone::create(ZoneKind::Heap, 8, 2).unwrap();
        let r = z.claim_block(0, 8).unwrap();
        for a in r {
            z.write(a, a as Word + 100);
        }
        z.write(8, 0);
        assert!(z.claim_block(8, 1).is_err());
        assert!(z.probe_guard().is_err());

        z.grow(8).unwrap();
        assert_eq!(z.state(), ZoneState::Active);
        assert_eq!(z.guard(), 16);
        assert_eq!(z.end(), 18);
        assert_eq!(z.max(), 7);
        assert!(z.probe_guard().is_ok());
        for a in 0..8 {
            assert_eq!(z.read(a), a as Word + 100);
        }
        // the old guard band is plain free space now
        assert_eq!(z.read(8), 0);
        assert_eq!(z.claim_block(8, 8).unwrap(), 8..16);
        assert!(z.invariants_hold());
    }

    #[test]
    fn test_aborted_is_terminal() {
        let mut z = MemoryZone::create(ZoneKind::NondStack, 4, 1).unwrap();
        assert!(z.claim_block(0, 5).is_err());
        z.abort();
        assert_eq!(z.state(), ZoneState::Aborted);
        assert_eq!(
            z.claim_block(0, 1).unwrap_err(),
            MemoryError::StackExhausted {
                zone: ZoneKind::NondStack
            }
        );
        assert_eq!(
            z.claim_block(0, 0).unwrap_err(),
            MemoryError::StackExhausted {
                zone: ZoneKind::NondStack
            }
        );
        assert!(z.store(0, 1).is_err());
        assert!(z.grow(16).is_err());
    }

    #[test]
    fn test_failed_claim_keeps_high_water() {
        let mut z = MemoryZone::create(ZoneKind::NondStack, 16, 4).unwrap();
        z.claim_block(0, 4).unwrap();
        assert_eq!(z.max(), 3);

        assert!(z.claim_block(10, 8).unwrap_err().is_overflow());
        assert_eq!(z.max(), 3);
        assert_eq!(z.overflow_margin(), 13);
        assert_eq!(z.usage().high_water(), 3);

        z.abort();
        assert_eq!(z.max(), 3);
        assert!(z.invariants_hold());
    }

    #[test]
    fn test_empty_claim_past_guard_overflows() {
        let mut z = MemoryZone::create(ZoneKind::DetStack, 8, 2).unwrap();
        assert_eq!(z.claim_block(8, 0).unwrap(), 8..8);
        assert!(z.claim_block(20, 0).unwrap_err().is_overflow());
        assert_eq!(z.max(), 0);
    }

    #[test]
    fn test_store_without_guard_band() {
        let mut z = MemoryZone::create(ZoneKind::Heap, 8, 0).unwrap();
        z.store(7, 5).unwrap();
        assert_eq!(z.read(7), 5);
        assert_eq!(
            z.store(8, 1).unwrap_err(),
            MemoryError::ZoneOverflow {
                zone: ZoneKind::Heap,
                address: 8,
                guard: 8
            }
        );
        assert_eq!(z.state(), ZoneState::Overflowed);
        // nothing to trip without a band
        assert!(z.probe_guard().is_ok());
    }

    #[test]
    fn test_guard_pattern_write_is_not_trapped() {
        let mut z = MemoryZone::create(ZoneKind::Heap, 8, 2).unwrap();
        z.write(8, GUARD_PATTERN);
        assert!(z.probe_guard().is_ok());
        assert!(z.store(8, GUARD_PATTERN).unwrap_err().is_overflow());
    }

    #[test]
    #[should_panic(expected = "below live extent")]
    fn test_access_below_min_panics() {
        let mut z = MemoryZone::create_reserved(ZoneKind::Heap, 16, 2, 4).unwrap();
        let _ = z.note_access(2);
    }
}
