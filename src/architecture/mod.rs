use crate::error::{Error, Result};
use crate::target::Target;
use crate::thread::{Execution, Thread};
use gimli::Register;
use log::info;
use once_cell::sync::Lazy;

mod x86_64;

pub use self::x86_64::X86_64;

/// Converts the saved kernel context of a task into registers a stack
/// unwinder can start from.
pub trait Architecture: Send + Sync {
    fn ident(&self) -> &'static str;

    fn aliases(&self) -> &'static [&'static str];

    /// Size of a machine word in bytes.
    fn word_size(&self) -> u8;

    /// Copies the register snapshot taken at trap entry into the thread's bank.
    fn setup_active(&self, thread: &mut Thread);

    /// Recovers what can be recovered for a thread parked in the scheduler.
    fn setup_scheduled(&self, target: &dyn Target, thread: &mut Thread) -> Result<()>;

    fn pc_register(&self) -> &'static str;

    fn sp_register(&self) -> &'static str;

    fn fp_register(&self) -> &'static str;

    /// Name of a DWARF register, if the unwinder tracks it.
    fn register_name(&self, register: Register) -> Option<&'static str>;
}

/// Fills the thread's register bank according to its execution state.
pub fn setup_thread(
    arch: &dyn Architecture,
    target: &dyn Target,
    thread: &mut Thread,
) -> Result<()> {
    match thread.task.execution {
        Execution::Active(_) => {
            arch.setup_active(thread);
            Ok(())
        }
        Execution::Scheduled => arch.setup_scheduled(target, thread),
    }
}

#[derive(Clone, Copy)]
pub struct ArchitectureEntry {
    pub ident: &'static str,
    pub aliases: &'static [&'static str],
    /// Builds the model for a kernel, resolving whatever symbols it needs.
    pub build: fn(&dyn Target) -> Result<Box<dyn Architecture>>,
}

impl ArchitectureEntry {
    fn answers_to(&self, name: &str) -> bool {
        self.ident == name || self.aliases.iter().any(|alias| *alias == name)
    }
}

#[derive(Default)]
pub struct ArchitectureRegistry {
    entries: Vec<ArchitectureEntry>,
}

impl ArchitectureRegistry {
    pub fn builtin() -> Self {
        let mut registry = ArchitectureRegistry::default();
        for entry in [x86_64::ENTRY] {
            if let Err(err) = registry.register(entry) {
                log::error!("{}", err);
            }
        }
        registry
    }

    pub fn register(&mut self, entry: ArchitectureEntry) -> Result<()> {
        let names = std::iter::once(&entry.ident).chain(entry.aliases);
        for name in names {
            if self.lookup(name).is_some() {
                return Err(Error::DuplicateRegistration(name.to_string()));
            }
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&ArchitectureEntry> {
        self.entries.iter().find(|entry| entry.answers_to(name))
    }

    pub fn build(&self, name: &str, target: &dyn Target) -> Result<Box<dyn Architecture>> {
        let entry = self
            .lookup(name)
            .ok_or_else(|| Error::UnknownArchitecture(name.to_string()))?;
        let arch = (entry.build)(target)?;
        info!("using architecture {} for `{}`", entry.ident, name);
        Ok(arch)
    }
}

pub static ARCHITECTURES: Lazy<ArchitectureRegistry> = Lazy::new(ArchitectureRegistry::builtin);
