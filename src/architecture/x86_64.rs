use crate::architecture::{Architecture, ArchitectureEntry};
use crate::error::Result;
use crate::target::Target;
use crate::thread::{Execution, Thread};
use gimli::Register;
use log::debug;

pub(super) const ENTRY: ArchitectureEntry = ArchitectureEntry {
    ident: "i386:x86-64",
    aliases: &["x86_64"],
    build: X86_64::build,
};

/// Where every scheduled thread is modeled as sitting.
const SCHEDULER_RETURN: &str = "thread_return";

/// Not taken from the trap-entry snapshot.
const ACTIVE_EXCLUDED: [&str; 4] = ["gs_base", "orig_ax", "rflags", "fs_base"];

/// Pushed by the context switch prologue, in order, just below the saved
/// frame pointer.
const CALLEE_SAVED: [&str; 5] = ["rbx", "r12", "r13", "r14", "r15"];

const WORD: u64 = 8;
const GDT_ENTRY_SIZE: u64 = 8;
const KERNEL_CS: u64 = 2 * GDT_ENTRY_SIZE;
const KERNEL_SS: u64 = 3 * GDT_ENTRY_SIZE;

const DWARF_REGISTERS: [(&str, Register); 17] = [
    ("rax", gimli::X86_64::RAX),
    ("rdx", gimli::X86_64::RDX),
    ("rcx", gimli::X86_64::RCX),
    ("rbx", gimli::X86_64::RBX),
    ("rsi", gimli::X86_64::RSI),
    ("rdi", gimli::X86_64::RDI),
    ("rbp", gimli::X86_64::RBP),
    ("rsp", gimli::X86_64::RSP),
    ("r8", gimli::X86_64::R8),
    ("r9", gimli::X86_64::R9),
    ("r10", gimli::X86_64::R10),
    ("r11", gimli::X86_64::R11),
    ("r12", gimli::X86_64::R12),
    ("r13", gimli::X86_64::R13),
    ("r14", gimli::X86_64::R14),
    ("r15", gimli::X86_64::R15),
    ("rip", gimli::X86_64::RA),
];

pub struct X86_64 {
    thread_return: u64,
}

impl X86_64 {
    pub fn new(target: &dyn Target) -> Result<Self> {
        let thread_return = target.lookup_symbol(SCHEDULER_RETURN)?;
        Ok(X86_64 { thread_return })
    }

    fn build(target: &dyn Target) -> Result<Box<dyn Architecture>> {
        Ok(Box::new(X86_64::new(target)?))
    }

    pub fn thread_return(&self) -> u64 {
        self.thread_return
    }
}

impl Architecture for X86_64 {
    fn ident(&self) -> &'static str {
        ENTRY.ident
    }

    fn aliases(&self) -> &'static [&'static str] {
        ENTRY.aliases
    }

    fn word_size(&self) -> u8 {
        WORD as u8
    }

    fn setup_active(&self, thread: &mut Thread) {
        let regs = match &thread.task.execution {
            Execution::Active(regs) => regs,
            Execution::Scheduled => return,
        };
        for (name, value) in regs {
            if ACTIVE_EXCLUDED.contains(&name.as_str()) {
                continue;
            }
            thread.registers.set(name, *value);
        }
    }

    fn setup_scheduled(&self, target: &dyn Target, thread: &mut Thread) -> Result<()> {
        let rsp = target.read_member(thread.task.address, "struct task_struct", "thread.sp")?;
        let rbp = target.read_word(rsp)?;

        let mut saved = [0; CALLEE_SAVED.len()];
        for (slot, value) in saved.iter_mut().enumerate() {
            *value = target.read_word(rbp.wrapping_sub((slot as u64 + 1) * WORD))?;
        }

        debug!("pid {}: saved sp {:#x}, frame {:#x}", thread.task.pid, rsp, rbp);

        let registers = &mut thread.registers;
        registers.set("rsp", rsp);
        registers.set("rbp", rbp);
        registers.set("rip", self.thread_return);
        for (name, value) in CALLEE_SAVED.iter().zip(saved) {
            registers.set(name, value);
        }
        registers.set("cs", KERNEL_CS);
        registers.set("ss", KERNEL_SS);
        Ok(())
    }

    fn pc_register(&self) -> &'static str {
        "rip"
    }

    fn sp_register(&self) -> &'static str {
        "rsp"
    }

    fn fp_register(&self) -> &'static str {
        "rbp"
    }

    fn register_name(&self, register: Register) -> Option<&'static str> {
        DWARF_REGISTERS
            .iter()
            .find(|(_, r)| *r == register)
            .map(|(name, _)| *name)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::architecture::{setup_thread, ARCHITECTURES};
    use crate::error::Error;
    use crate::image::MemoryImage;
    use crate::target::StructLayout;
    use crate::thread::{RawRegisters, Task};

    const THREAD_RETURN: u64 = 0xffff_ffff_8100_2000;
    const TASK: u64 = 0xffff_8880_0400_0000;
    const SAVED_SP: u64 = 0xffff_c900_0010_3e80;
    const SAVED_FP: u64 = 0xffff_c900_0010_3ec0;

    /// A kernel with one task parked in the scheduler.
    fn scheduled_image() -> MemoryImage {
        let mut image = MemoryImage::new();
        image
            .add_symbol(SCHEDULER_RETURN, THREAD_RETURN)
            .add_type(
                StructLayout::new("struct task_struct", 0x1000)
                    .member("pid", 0x4e8, 4)
                    .embedded("thread", 0xc40, 0x40, "struct thread_struct"),
            )
            .add_type(
                StructLayout::new("struct thread_struct", 0x40)
                    .member("sp0", 0x0, 8)
                    .member("sp", 0x8, 8),
            )
            .write_u64(TASK + 0xc48, SAVED_SP)
            .write_u64(SAVED_SP, SAVED_FP);
        for (i, value) in [0xb0, 0x120, 0x130, 0x140, 0x150].iter().enumerate() {
            image.write_u64(SAVED_FP - (i as u64 + 1) * 8, *value);
        }
        image
    }

    fn scheduled_thread() -> Thread {
        Thread::new(Task {
            address: TASK,
            pid: 42,
            comm: "kworker/0:1".into(),
            execution: Execution::Scheduled,
        })
    }

    #[test]
    fn scheduled_registers() {
        let image = scheduled_image();
        let arch = X86_64::new(&image).unwrap();
        let mut thread = scheduled_thread();
        arch.setup_scheduled(&image, &mut thread).unwrap();

        let regs = &thread.registers;
        assert_eq!(regs.get("rsp"), Some(SAVED_SP));
        assert_eq!(regs.get("rbp"), Some(SAVED_FP));
        assert_eq!(regs.get("rip"), Some(THREAD_RETURN));
        assert_eq!(regs.get("rbx"), Some(0xb0));
        assert_eq!(regs.get("r12"), Some(0x120));
        assert_eq!(regs.get("r13"), Some(0x130));
        assert_eq!(regs.get("r14"), Some(0x140));
        assert_eq!(regs.get("r15"), Some(0x150));
        assert_eq!(regs.get("cs"), Some(0x10));
        assert_eq!(regs.get("ss"), Some(0x18));
        assert_eq!(regs.len(), 10);
        assert!(matches!(regs.value("rax"), Err(Error::UndefinedRegister(_))));
    }

    #[test]
    fn every_scheduled_thread_returns_to_scheduler() {
        let mut image = scheduled_image();
        let other = TASK + 0x2000;
        let other_sp = SAVED_SP - 0x4000;
        let other_fp = other_sp + 0x30;
        image.write_u64(other + 0xc48, other_sp).write_u64(other_sp, other_fp);
        for i in 1..=5u64 {
            image.write_u64(other_fp - i * 8, 0x1000 * i);
        }

        let arch = ARCHITECTURES.build("x86_64", &image).unwrap();
        for address in [TASK, other] {
            let mut thread = scheduled_thread();
            thread.task.address = address;
            setup_thread(arch.as_ref(), &image, &mut thread).unwrap();
            assert_eq!(thread.registers.get("rip"), Some(THREAD_RETURN));
        }
    }

    #[test]
    fn active_registers_skip_exclusions() {
        let image = scheduled_image();
        let arch = X86_64::new(&image).unwrap();
        let regs: RawRegisters = [
            ("rax", 1),
            ("rbx", 2),
            ("rip", 0xffff_ffff_8100_0100),
            ("rsp", 0xffff_c900_0000_0f00),
            ("cs", 0x10),
            ("gs_base", 0xffff_8880_7fc0_0000),
            ("fs_base", 0x7f00_0000_0000),
            ("orig_ax", u64::MAX),
            ("rflags", 0x246),
        ]
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect();
        let mut thread = Thread::new(Task {
            address: TASK,
            pid: 1,
            comm: "swapper/0".into(),
            execution: Execution::Active(regs.clone()),
        });
        setup_thread(&arch, &image, &mut thread).unwrap();

        assert_eq!(thread.registers.len(), 5);
        for (name, value) in &regs {
            if ACTIVE_EXCLUDED.contains(&name.as_str()) {
                assert!(!thread.registers.is_defined(name));
            } else {
                assert_eq!(thread.registers.get(name), Some(*value));
            }
        }
    }

    #[test]
    fn missing_scheduler_symbol_is_fatal() {
        let image = MemoryImage::new();
        let err = ARCHITECTURES.build("i386:x86-64", &image).err().unwrap();
        assert!(matches!(err, Error::SymbolNotFound(ref name) if name == "thread_return"));
    }

    #[test]
    fn relocated_saved_sp_propagates() {
        let mut image = scheduled_image();
        image.add_type(StructLayout::new("struct thread_struct", 0x40).member("rsp", 0x8, 8));
        let arch = X86_64::new(&image).unwrap();
        let mut thread = scheduled_thread();
        let err = arch.setup_scheduled(&image, &mut thread).unwrap_err();
        assert!(err.is_resolution());
        assert!(thread.registers.is_empty());
    }
}
