//! Post-mortem reconstruction of kernel state from a memory image.
//!
//! [`architecture`] turns the saved context of a task into a register bank,
//! [`Cursor`] walks the stack from there, and [`storage`] unwraps bios
//! through the device mapper layers that cloned them.

use crate::architecture::Architecture;
use crate::error::{Error, Result};
use crate::target::Target;
use crate::thread::RegisterBank;
use gimli::{
    BaseAddresses, CfaRule, DebugFrame, EndianSlice, LittleEndian, RegisterRule, UnwindContext,
    UnwindSection,
};
use log::{debug, trace};
use std::fmt;

pub mod architecture;
pub mod error;
pub mod image;
pub mod session;
pub mod storage;
pub mod target;
pub mod thread;

pub use crate::session::{Session, SessionConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub pc: u64,
    pub sp: Option<u64>,
    /// Containing symbol and the offset of `pc` into it.
    pub symbol: Option<(String, u64)>,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.symbol {
            Some((name, offset)) => write!(f, "{:#018x}: {}+{:#x}", self.pc, name, offset),
            None => write!(f, "{:#018x}: ???", self.pc),
        }
    }
}

/// Walks the frames of a kernel stack, newest first.
///
/// Frames covered by the supplied `.debug_frame` are unwound by their CFI;
/// anything else is unwound by following saved frame pointers.
pub struct Cursor<'a> {
    arch: &'a dyn Architecture,
    target: &'a dyn Target,
    debug_frame: Option<DebugFrame<EndianSlice<'a, LittleEndian>>>,
    pc: Option<u64>,
    registers: RegisterBank,
    unwind_ctx: UnwindContext<EndianSlice<'a, LittleEndian>>,
    caller: bool,
}

impl<'a> Cursor<'a> {
    pub fn new(
        arch: &'a dyn Architecture,
        target: &'a dyn Target,
        debug_frame: Option<&'a [u8]>,
        registers: &RegisterBank,
    ) -> Self {
        let debug_frame = debug_frame.map(|bytes| {
            let mut section = DebugFrame::new(bytes, LittleEndian);
            section.set_address_size(arch.word_size());
            section
        });
        Cursor {
            arch,
            target,
            debug_frame,
            pc: registers.get(arch.pc_register()),
            registers: registers.clone(),
            unwind_ctx: UnwindContext::new(),
            caller: false,
        }
    }

    fn next_pc(&mut self, pc: u64) -> Option<u64> {
        // Return addresses point past the call; look up the call itself.
        let lookup = if self.caller { pc.wrapping_sub(1) } else { pc };
        let caller = match self.unwind_cfi(lookup) {
            Ok(Some(caller)) => caller,
            Ok(None) => match self.unwind_frame_pointer() {
                Ok(caller) => caller,
                Err(err) => {
                    debug!("{:#x}: frame pointer walk stopped: {}", pc, err);
                    return None;
                }
            },
            Err(err) => {
                debug!("{:#x}: CFI unwind failed: {}", pc, err);
                return None;
            }
        };

        let sp = self.arch.sp_register();
        match (self.registers.get(sp), caller.get(sp)) {
            (Some(old), Some(new)) if new > old => {}
            _ => return None,
        }

        let next = caller.get(self.arch.pc_register()).filter(|pc| *pc != 0);
        self.registers = caller;
        self.caller = true;
        next
    }

    /// Returns the caller's registers, or `None` if no FDE covers `pc`.
    fn unwind_cfi(&mut self, pc: u64) -> Result<Option<RegisterBank>> {
        let section = match &self.debug_frame {
            Some(section) => section.clone(),
            None => return Ok(None),
        };
        let arch = self.arch;
        let target = self.target;
        let bases = BaseAddresses::default();

        let entry = match section.fde_for_address(&bases, pc, DebugFrame::cie_from_offset) {
            Ok(entry) => entry,
            Err(gimli::Error::NoUnwindInfoForAddress) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let row = entry.unwind_info_for_address(&section, &bases, &mut self.unwind_ctx, pc)?;

        let cfa = match row.cfa() {
            CfaRule::RegisterAndOffset { register, offset } => {
                let name = arch
                    .register_name(*register)
                    .ok_or_else(|| Error::UndefinedRegister(format!("dwarf {}", register.0)))?;
                self.registers.value(name)?.wrapping_add(*offset as u64)
            }
            CfaRule::Expression(_) => return Ok(None),
        };

        // Registers without a rule keep their value across the call.
        let mut caller = self.registers.clone();
        caller.remove(arch.pc_register());
        for (register, rule) in row.registers() {
            let name = match arch.register_name(*register) {
                Some(name) => name,
                None => continue,
            };
            let value = match rule {
                RegisterRule::Undefined => None,
                RegisterRule::SameValue => self.registers.get(name),
                RegisterRule::Offset(v) => Some(target.read_word(cfa.wrapping_add(*v as u64))?),
                RegisterRule::ValOffset(v) => Some(cfa.wrapping_add(*v as u64)),
                RegisterRule::Register(r) => arch
                    .register_name(*r)
                    .and_then(|source| self.registers.get(source)),
                RegisterRule::Expression(_)
                | RegisterRule::ValExpression(_)
                | RegisterRule::Architectural => {
                    trace!("{:#x}: no support for the rule recovering {}", pc, name);
                    None
                }
            };
            match value {
                Some(value) => caller.set(name, value),
                None => {
                    caller.remove(name);
                }
            }
        }
        caller.set(arch.sp_register(), cfa);

        let ra = entry.cie().return_address_register();
        if let Some(ra) = arch.register_name(ra).and_then(|name| caller.get(name)) {
            caller.set(arch.pc_register(), ra);
        }
        Ok(Some(caller))
    }

    fn unwind_frame_pointer(&self) -> Result<RegisterBank> {
        let word = u64::from(self.arch.word_size());
        let fp = self.registers.value(self.arch.fp_register())?;
        if fp == 0 {
            return Err(Error::UndefinedRegister(self.arch.fp_register().to_string()));
        }

        let mut caller = RegisterBank::default();
        caller.set(self.arch.pc_register(), self.target.read_word(fp.wrapping_add(word))?);
        caller.set(self.arch.fp_register(), self.target.read_word(fp)?);
        caller.set(self.arch.sp_register(), fp.wrapping_add(2 * word));
        Ok(caller)
    }
}

impl<'a> Iterator for Cursor<'a> {
    type Item = Frame;

    fn next(&mut self) -> Option<Self::Item> {
        let pc = self.pc?;
        let frame = Frame {
            pc,
            sp: self.registers.get(self.arch.sp_register()),
            symbol: self.target.symbol_for_address(pc),
        };
        trace!("{}", frame);
        self.pc = self.next_pc(pc);
        Some(frame)
    }
}

/// Collects at most `max_frames` frames starting from `registers`.
pub fn backtrace(
    arch: &dyn Architecture,
    target: &dyn Target,
    debug_frame: Option<&[u8]>,
    registers: &RegisterBank,
    max_frames: usize,
) -> Vec<Frame> {
    Cursor::new(arch, target, debug_frame, registers)
        .take(max_frames)
        .collect()
}
