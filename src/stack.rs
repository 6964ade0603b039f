//! High-water marked stack of words
//!
//! [`WordStack`] is the operand and frame store of the bytecode engine. It is
//! one contiguous buffer plus a stack pointer `sp`:
//!
//! ```text
//! 0            sp                 capacity
//! | live words | free capacity    |
//! ```
//!
//! The buffer doubles whenever a push or block allocation would run past the
//! current capacity, and never shrinks. Live contents keep their indices
//! across growth, which is why callers should hold on to indices (absolute or
//! relative to the top) rather than to references.
//!
//! # Handles
//!
//! [`WordStack::peek_p`] and [`WordStack::peek_rel_p`] hand out a direct
//! mutable reference into the buffer. Such a handle is only valid until the
//! next operation that may reallocate, i.e. any [`WordStack::push`] or
//! [`WordStack::alloc`]. The reference borrows the stack mutably, so the
//! compiler rejects code that keeps a handle alive across one of those calls;
//! re-derive the handle from its index afterwards.
//!
//! # Failures
//!
//! Running out of memory while creating or growing the buffer aborts the
//! process (see [`crate::error::fatal`]). Popping an empty stack, freeing more
//! words than are live, and peeking or poking outside `[0, sp)` are caller
//! bugs and panic.

use crate::error::{fatal, MemoryError};
use crate::Word;
use log::{debug, trace};

/// Growable word stack with an explicit stack pointer
#[derive(Debug, Clone)]
pub struct WordStack {
    /// Backing buffer; its length is the current capacity
    data: Vec<Word>,
    /// Number of live words, also the index of the next free slot
    sp: usize,
}

impl WordStack {
    /// Create a stack with `init_size` words of capacity, aborting the process
    /// if the buffer cannot be allocated.
    pub fn new(init_size: usize) -> Self {
        match Self::try_new(init_size) {
            Ok(stack) => stack,
            Err(e) => fatal(&e),
        }
    }

    /// Create a stack, reporting allocation failure instead of aborting
    pub fn try_new(init_size: usize) -> Result<Self, MemoryError> {
        let mut data = Vec::new();
        data.try_reserve_exact(init_size)
            .map_err(|_| MemoryError::OutOfMemory {
                what: "word stack".to_string(),
                words: init_size,
            })?;
        data.resize(init_size, 0);
        debug!("word stack created with capacity {}", init_size);
        Ok(WordStack { data, sp: 0 })
    }

    /// Current number of live words
    pub fn size(&self) -> usize {
        self.sp
    }

    /// Check if the stack holds no live words
    pub fn is_empty(&self) -> bool {
        self.sp == 0
    }

    /// Current capacity in words (never decreases)
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The live words, bottom first
    pub fn as_slice(&self) -> &[Word] {
        &self.data[..self.sp]
    }

    /// Push a word, doubling the capacity first if the stack is full.
    ///
    /// May reallocate: invalidates handles from `peek_p`/`peek_rel_p`.
    pub fn push(&mut self, x: Word) {
        if self.sp == self.data.len() {
            self.grow_to(self.sp + 1);
        }
        trace!("push {:#x} at {}", x, self.sp);
        self.data[self.sp] = x;
        self.sp += 1;
    }

    /// Pop the top word
    pub fn pop(&mut self) -> Word {
        assert!(self.sp != 0, "pop from empty word stack");
        self.sp -= 1;
        trace!("pop {:#x} from {}", self.data[self.sp], self.sp);
        self.data[self.sp]
    }

    /// Reserve `num_words` contiguous words on top of the stack and return the
    /// index of the first one. The reserved words read as zero.
    ///
    /// May reallocate: invalidates handles from `peek_p`/`peek_rel_p`.
    pub fn alloc(&mut self, num_words: usize) -> usize {
        let orig_sp = self.sp;
        let needed = match orig_sp.checked_add(num_words) {
            Some(n) => n,
            None => fatal(&MemoryError::OutOfMemory {
                what: "word stack block".to_string(),
                words: num_words,
            }),
        };
        if needed > self.data.len() {
            self.grow_to(needed);
        }
        self.data[orig_sp..needed].fill(0);
        self.sp = needed;
        trace!("alloc {} words at {}", num_words, orig_sp);
        orig_sp
    }

    /// Release the top `num_words` words. Capacity is kept.
    pub fn free(&mut self, num_words: usize) {
        assert!(
            num_words <= self.sp,
            "free of {} words from word stack holding {}",
            num_words,
            self.sp
        );
        self.sp -= num_words;
        trace!("free {} words, sp now {}", num_words, self.sp);
    }

    /// Read the word at an absolute index
    pub fn peek(&self, index: usize) -> Word {
        self.check_index(index);
        self.data[index]
    }

    /// Read the word `rel_index` positions from the top (1 is the top word)
    pub fn peek_rel(&self, rel_index: usize) -> Word {
        self.peek(self.rel_to_abs(rel_index))
    }

    /// Direct handle to the slot at an absolute index.
    ///
    /// The handle must not outlive the next `push` or `alloc`; the mutable
    /// borrow enforces this.
    pub fn peek_p(&mut self, index: usize) -> &mut Word {
        self.check_index(index);
        &mut self.data[index]
    }

    /// Direct handle to the slot `rel_index` positions from the top.
    ///
    /// Same validity rules as [`WordStack::peek_p`].
    pub fn peek_rel_p(&mut self, rel_index: usize) -> &mut Word {
        let index = self.rel_to_abs(rel_index);
        self.peek_p(index)
    }

    /// Overwrite the word at an absolute index
    pub fn poke(&mut self, index: usize, x: Word) {
        self.check_index(index);
        self.data[index] = x;
    }

    /// Overwrite the word `rel_index` positions from the top
    pub fn poke_rel(&mut self, rel_index: usize, value: Word) {
        let index = self.rel_to_abs(rel_index);
        self.poke(index, value);
    }

    /// Release the buffer. The stack is consumed.
    pub fn delete(self) {
        debug!(
            "word stack released (capacity {}, {} live words)",
            self.data.len(),
            self.sp
        );
    }

    fn check_index(&self, index: usize) {
        assert!(
            index < self.sp,
            "word stack index {} outside live range 0..{}",
            index,
            self.sp
        );
    }

    fn rel_to_abs(&self, rel_index: usize) -> usize {
        assert!(
            rel_index >= 1 && rel_index <= self.sp,
            "word stack relative index {} outside 1..={}",
            rel_index,
            self.sp
        );
        self.sp - rel_index
    }

    // Double until `needed` fits. Live words keep their indices.
    fn grow_to(&mut self, needed: usize) {
        let old_size = self.data.len();
        let mut new_size = old_size.max(1);
        while new_size < needed {
            new_size = match new_size.checked_mul(2) {
                Some(n) => n,
                None => fatal(&MemoryError::OutOfMemory {
                    what: "word stack growth".to_string(),
                    words: needed,
                }),
            };
        }
        if self.data.try_reserve_exact(new_size - old_size).is_err() {
            fatal(&MemoryError::OutOfMemory {
                what: "word stack growth".to_string(),
                words: new_size,
            });
        }
        self.data.resize(new_size, 0);
        debug!("word stack grew from {} to {} words", old_size, new_size);
    }
}
