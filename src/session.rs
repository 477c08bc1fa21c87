//! Per-image state: the architecture model and detected structure layouts.

use crate::architecture::{self, Architecture, ARCHITECTURES};
use crate::error::Result;
use crate::storage::{self, Chain, DecodeContext, LayoutCache, DECODERS};
use crate::target::Target;
use crate::thread::Thread;
use crate::Frame;
use log::warn;
use std::env;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Overrides the architecture reported by the image.
    pub architecture: Option<String>,
    /// Most layers unwrapped from a single bio.
    pub max_chain_depth: usize,
    /// Most frames produced for a single backtrace.
    pub max_frames: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            architecture: None,
            max_chain_depth: 16,
            max_frames: 64,
        }
    }
}

impl SessionConfig {
    /// Reads `KCRASH_ARCH`, `KCRASH_MAX_CHAIN_DEPTH` and `KCRASH_MAX_FRAMES`,
    /// keeping the default for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self::from_vars(|key| env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = SessionConfig::default();
        if let Some(arch) = var("KCRASH_ARCH").filter(|arch| !arch.is_empty()) {
            config.architecture = Some(arch);
        }
        if let Some(depth) = parse_limit(&var, "KCRASH_MAX_CHAIN_DEPTH") {
            config.max_chain_depth = depth;
        }
        if let Some(frames) = parse_limit(&var, "KCRASH_MAX_FRAMES") {
            config.max_frames = frames;
        }
        config
    }
}

fn parse_limit(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    let value = var(key)?;
    match value.parse() {
        Ok(limit) => Some(limit),
        Err(err) => {
            warn!("ignoring {}={:?}: {}", key, value, err);
            None
        }
    }
}

pub struct Session<'t> {
    target: &'t dyn Target,
    arch: Box<dyn Architecture>,
    layouts: LayoutCache,
    config: SessionConfig,
    debug_frame: Option<&'t [u8]>,
}

impl<'t> Session<'t> {
    /// Picks the architecture for `arch_name`, or for the configured override.
    pub fn new(target: &'t dyn Target, arch_name: &str, config: SessionConfig) -> Result<Self> {
        let name = config.architecture.as_deref().unwrap_or(arch_name);
        let arch = ARCHITECTURES.build(name, target)?;
        Ok(Session {
            target,
            arch,
            layouts: LayoutCache::default(),
            config,
            debug_frame: None,
        })
    }

    /// Supplies the kernel's `.debug_frame` section for CFI based unwinding.
    pub fn with_debug_frame(mut self, debug_frame: &'t [u8]) -> Self {
        self.debug_frame = Some(debug_frame);
        self
    }

    pub fn architecture(&self) -> &dyn Architecture {
        self.arch.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn layouts(&self) -> &LayoutCache {
        &self.layouts
    }

    pub fn setup_thread(&self, thread: &mut Thread) -> Result<()> {
        architecture::setup_thread(self.arch.as_ref(), self.target, thread)
    }

    pub fn backtrace(&self, thread: &Thread) -> Vec<Frame> {
        crate::backtrace(
            self.arch.as_ref(),
            self.target,
            self.debug_frame,
            &thread.registers,
            self.config.max_frames,
        )
    }

    pub fn decode_bio(&self, bio: u64) -> Chain {
        let ctx = DecodeContext {
            target: self.target,
            layouts: &self.layouts,
        };
        storage::walk(&ctx, &DECODERS, bio, self.config.max_chain_depth)
    }
}
