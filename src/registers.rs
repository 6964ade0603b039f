use crate::Word;
use log::debug;

/// Number of virtual machine registers, numbered `0..MAX_REGISTERS`
pub const MAX_REGISTERS: usize = 37;

/// Register save area
///
/// Three fixed arrays of `MAX_REGISTERS` entries: the live registers, the
/// slots they are saved into, and a use counter per register. Nothing here
/// ever grows; an index outside `0..MAX_REGISTERS` is a caller bug.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    regs: [Word; MAX_REGISTERS],
    saved: [Word; MAX_REGISTERS],
    num_uses: [Word; MAX_REGISTERS],
}

impl RegisterFile {
    pub fn new() -> Self {
        RegisterFile {
            regs: [0; MAX_REGISTERS],
            saved: [0; MAX_REGISTERS],
            num_uses: [0; MAX_REGISTERS],
        }
    }

    /// Read a live register
    pub fn get(&self, reg: usize) -> Word {
        check_register(reg);
        self.regs[reg]
    }

    /// Write a live register
    pub fn set(&mut self, reg: usize, value: Word) {
        check_register(reg);
        self.regs[reg] = value;
    }

    /// Read a register's save slot
    pub fn saved(&self, reg: usize) -> Word {
        check_register(reg);
        self.saved[reg]
    }

    /// Write a register's save slot
    pub fn set_saved(&mut self, reg: usize, value: Word) {
        check_register(reg);
        self.saved[reg] = value;
    }

    /// Bump the use counter of a register
    pub fn note_use(&mut self, reg: usize) {
        check_register(reg);
        self.num_uses[reg] = self.num_uses[reg].wrapping_add(1);
    }

    pub fn uses(&self, reg: usize) -> Word {
        check_register(reg);
        self.num_uses[reg]
    }

    /// All use counters, register 0 first
    pub fn use_counts(&self) -> &[Word] {
        &self.num_uses
    }

    /// Zero every register, save slot and counter
    pub fn reset(&mut self) {
        debug!("register file reset");
        *self = RegisterFile::new();
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

fn check_register(reg: usize) {
    assert!(
        reg < MAX_REGISTERS,
        "register {} outside 0..{}",
        reg,
        MAX_REGISTERS
    );
}
