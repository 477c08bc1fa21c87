//! Unwrapping block I/O through the layers that cloned it.
//!
//! Every stacking driver that clones a `struct bio` installs its own
//! completion callback on the clone. The callback's symbol name identifies
//! which decoder understands the clone; the decoder recovers the bio the
//! clone was made from, and [`walk`] repeats that until it reaches a bio no
//! decoder claims.

use crate::error::{Error, Result};
use crate::target::Target;
use log::{debug, warn};
use once_cell::sync::Lazy;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;

pub mod device_mapper;

const BIO: &str = "struct bio";

/// How a stacking layer attaches its tracking structure to a clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// `bi_private` points at the tracking structure.
    DirectPointer,
    /// The clone is embedded in the tracking structure.
    EmbeddedContainer,
}

/// Layouts detected for each decoder, kept for the life of a session.
#[derive(Debug, Default)]
pub struct LayoutCache {
    layouts: RefCell<HashMap<&'static str, Layout>>,
    probes: Cell<usize>,
}

impl LayoutCache {
    /// Returns the cached layout for `key`, running `probe` the first time.
    /// Failed probes are not cached.
    pub fn get_or_probe<F>(&self, key: &'static str, probe: F) -> Result<Layout>
    where
        F: FnOnce() -> Result<Layout>,
    {
        if let Some(layout) = self.layouts.borrow().get(key) {
            return Ok(*layout);
        }
        self.probes.set(self.probes.get() + 1);
        let layout = probe()?;
        debug!("{}: detected {:?} layout", key, layout);
        self.layouts.borrow_mut().insert(key, layout);
        Ok(layout)
    }

    pub fn get(&self, key: &str) -> Option<Layout> {
        self.layouts.borrow().get(key).copied()
    }

    /// Number of probes run so far, failed ones included.
    pub fn probe_count(&self) -> usize {
        self.probes.get()
    }
}

/// Everything a decoder needs to interpret a bio.
#[derive(Clone, Copy)]
pub struct DecodeContext<'a> {
    pub target: &'a dyn Target,
    pub layouts: &'a LayoutCache,
}

/// One fully interpreted layer of a bio chain.
pub trait DecodedLayer: fmt::Display + fmt::Debug {
    /// Address of the clone this layer was decoded from.
    fn bio(&self) -> u64;

    /// The bio this layer was cloned from, or `None` if there is none.
    fn advance(&self) -> Option<u64>;

    fn describe(&self) -> String {
        self.to_string()
    }
}

pub type DecodeFn = fn(&DecodeContext<'_>, u64) -> Result<Box<dyn DecodedLayer>>;

#[derive(Clone, Copy)]
pub struct DecoderEntry {
    /// Completion callback installed on the clones this decoder understands.
    pub endio: &'static str,
    pub description: &'static str,
    pub decode: DecodeFn,
}

impl fmt::Debug for DecoderEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderEntry")
            .field("endio", &self.endio)
            .field("description", &self.description)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct DecoderRegistry {
    entries: HashMap<&'static str, DecoderEntry>,
}

impl DecoderRegistry {
    pub fn builtin() -> Self {
        let mut registry = DecoderRegistry::default();
        for entry in device_mapper::BUILTIN {
            if let Err(err) = registry.register(entry) {
                log::error!("{}", err);
            }
        }
        registry
    }

    /// Registers `entry`; the first registration for a callback wins.
    pub fn register(&mut self, entry: DecoderEntry) -> Result<()> {
        if self.entries.contains_key(entry.endio) {
            return Err(Error::DuplicateRegistration(entry.endio.to_string()));
        }
        self.entries.insert(entry.endio, entry);
        Ok(())
    }

    pub fn lookup(&self, endio: &str) -> Option<&DecoderEntry> {
        self.entries.get(endio)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub static DECODERS: Lazy<DecoderRegistry> = Lazy::new(DecoderRegistry::builtin);

/// Names the completion callback of the bio at `bio`.
pub fn bio_end_io_name(target: &dyn Target, bio: u64) -> Result<Option<String>> {
    let end_io = target.read_member(bio, BIO, "bi_end_io")?;
    if end_io == 0 {
        return Ok(None);
    }
    Ok(target.function_name(end_io))
}

/// Reads the starting sector of a bio, wherever this kernel keeps it.
pub fn bio_sector(target: &dyn Target, bio: u64) -> Result<u64> {
    let layout = target.lookup_type(BIO)?;
    let path = if layout.has_member("bi_iter") {
        "bi_iter.bi_sector"
    } else {
        "bi_sector"
    };
    target.read_member(bio, BIO, path)
}

pub fn bio_device_name(target: &dyn Target, bio: u64) -> Result<String> {
    let bdev = target.read_member(bio, BIO, "bi_bdev")?;
    target.block_device_name(bdev)
}

/// Reads the `struct bio *` member at `path` of the `ty` at `addr`.
pub(crate) fn read_bio_pointer(
    target: &dyn Target,
    addr: u64,
    ty: &str,
    path: &str,
) -> Result<Option<u64>> {
    let bio = target.read_member(addr, ty, path)?;
    Ok(if bio == 0 { None } else { Some(bio) })
}

#[derive(Debug)]
pub enum ChainEntry {
    Decoded(Box<dyn DecodedLayer>),
    /// A layer whose callback was recognized but whose layout was not.
    Undecodable {
        bio: u64,
        endio: String,
        error: Error,
    },
    /// A bio whose completion callback could not be read.
    Unreadable { bio: u64, error: Error },
}

impl fmt::Display for ChainEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainEntry::Decoded(layer) => write!(f, "{}", layer),
            ChainEntry::Undecodable { bio, endio, error } => {
                write!(f, "{:x} bio: undecodable {} layer ({})", bio, endio, error)
            }
            ChainEntry::Unreadable { bio, error } => {
                write!(f, "{:x} bio: unreadable ({})", bio, error)
            }
        }
    }
}

/// Why a walk stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainEnd {
    /// Reached a bio no decoder claims.
    Origin(u64),
    /// The last decoded layer was not cloned from another bio.
    NoAncestor,
    /// The last entry is undecodable or unreadable.
    Failed,
    /// The depth limit was hit before this bio was decoded.
    Truncated(u64),
}

/// The layers of a bio, from the bio that was handed in toward its origin.
#[derive(Debug)]
pub struct Chain {
    pub layers: Vec<ChainEntry>,
    pub end: ChainEnd,
}

impl Chain {
    /// The bio no decoder claimed, when the walk got that far.
    pub fn origin(&self) -> Option<u64> {
        match self.end {
            ChainEnd::Origin(bio) => Some(bio),
            _ => None,
        }
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.layers.iter().map(ToString::to_string).collect()
    }
}

/// Unwraps `bio` one layer at a time until no registered decoder claims it.
///
/// A bio that cannot be read or decoded is recorded and ends the walk; the
/// layers resolved before it are kept. At most `max_depth` layers are decoded.
pub fn walk(
    ctx: &DecodeContext<'_>,
    registry: &DecoderRegistry,
    bio: u64,
    max_depth: usize,
) -> Chain {
    let mut layers = Vec::new();
    let mut current = bio;

    let end = loop {
        let endio = match bio_end_io_name(ctx.target, current) {
            Ok(Some(endio)) => endio,
            Ok(None) => break ChainEnd::Origin(current),
            Err(error) => {
                warn!("{:x} bio: cannot read completion callback: {}", current, error);
                layers.push(ChainEntry::Unreadable {
                    bio: current,
                    error,
                });
                break ChainEnd::Failed;
            }
        };
        let entry = match registry.lookup(&endio) {
            Some(entry) => entry,
            None => break ChainEnd::Origin(current),
        };
        if layers.len() >= max_depth {
            warn!("{:x} bio: chain truncated after {} layers", bio, max_depth);
            break ChainEnd::Truncated(current);
        }

        match (entry.decode)(ctx, current) {
            Ok(layer) => {
                debug!("{}", layer);
                let next = layer.advance();
                layers.push(ChainEntry::Decoded(layer));
                match next {
                    Some(next) => current = next,
                    None => break ChainEnd::NoAncestor,
                }
            }
            Err(error) => {
                warn!(
                    "{:x} bio: cannot decode {} layer: {}",
                    current, entry.description, error
                );
                layers.push(ChainEntry::Undecodable {
                    bio: current,
                    endio,
                    error,
                });
                break ChainEnd::Failed;
            }
        }
    };

    Chain { layers, end }
}
