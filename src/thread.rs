//! Kernel tasks and the register banks the debugger builds for them.

use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// Registers sampled at interrupt or trap entry, keyed by register name.
pub type RawRegisters = BTreeMap<String, u64>;

#[derive(Debug, Clone)]
pub enum Execution {
    /// Running on a CPU when the image was taken; its full context was saved.
    Active(RawRegisters),
    /// Switched out by the scheduler; only its kernel stack remains.
    Scheduled,
}

#[derive(Debug, Clone)]
pub struct Task {
    /// Address of the task's `struct task_struct`.
    pub address: u64,
    pub pid: u32,
    pub comm: String,
    pub execution: Execution,
}

/// Register values known for a thread. Registers that were never set are
/// unknown, not zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterBank(BTreeMap<String, u64>);

impl RegisterBank {
    pub fn set(&mut self, name: &str, value: u64) {
        self.0.insert(name.to_string(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<u64> {
        self.0.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.0.get(name).copied()
    }

    pub fn value(&self, name: &str) -> Result<u64> {
        self.get(name).ok_or_else(|| Error::UndefinedRegister(name.to_string()))
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Thread {
    pub task: Task,
    pub registers: RegisterBank,
}

impl Thread {
    pub fn new(task: Task) -> Self {
        Thread {
            task,
            registers: RegisterBank::default(),
        }
    }
}
