//! Clones made by device mapper targets.
//!
//! Request-based targets complete clones through `end_clone_bio`, bio-based
//! targets through `clone_endio`. Both attach a tracking structure to the
//! clone, either through `bi_private` or, on newer kernels, by embedding the
//! clone itself in that structure.

use crate::error::{Error, Result};
use crate::storage::{
    bio_device_name, bio_sector, read_bio_pointer, DecodeContext, DecodedLayer, DecoderEntry,
    Layout, BIO,
};
use crate::target::Target;
use log::warn;
use std::fmt;

const RQ_CLONE_BIO_INFO: &str = "struct dm_rq_clone_bio_info";
const TARGET_IO: &str = "struct dm_target_io";
const DM_IO: &str = "struct dm_io";

pub const REQUEST_CLONE: DecoderEntry = DecoderEntry {
    endio: "end_clone_bio",
    description: "Request-based Device Mapper",
    decode: decode_request_clone,
};

pub const BIO_CLONE: DecoderEntry = DecoderEntry {
    endio: "clone_endio",
    description: "device mapper clone",
    decode: decode_bio_clone,
};

pub(crate) const BUILTIN: [DecoderEntry; 2] = [REQUEST_CLONE, BIO_CLONE];

fn decode_request_clone(ctx: &DecodeContext<'_>, bio: u64) -> Result<Box<dyn DecodedLayer>> {
    Ok(Box::new(RequestClone::decode(ctx, bio)?))
}

fn decode_bio_clone(ctx: &DecodeContext<'_>, bio: u64) -> Result<Box<dyn DecodedLayer>> {
    Ok(Box::new(BioClone::decode(ctx, bio)?))
}

/// Picks the layout of `ty` by looking for the embedded `clone` bio, falling
/// back to `legacy` for kernels that reach it through `bi_private`.
fn probe(target: &dyn Target, ty: &str, legacy: &str) -> Result<Layout> {
    let layout = target.lookup_type(ty)?;
    if layout.has_member("clone") {
        Ok(Layout::EmbeddedContainer)
    } else if layout.has_member(legacy) {
        Ok(Layout::DirectPointer)
    } else {
        Err(Error::LayoutMismatch { ty: ty.to_string() })
    }
}

/// Finds the `ty` tracking the clone at `bio`.
fn tracking_struct(target: &dyn Target, layout: Layout, bio: u64, ty: &str) -> Result<u64> {
    match layout {
        Layout::DirectPointer => target.read_member(bio, BIO, "bi_private"),
        Layout::EmbeddedContainer => target.container_of(bio, ty, "clone"),
    }
}

/// A bio cloned by a request-based device mapper target.
#[derive(Debug, Clone)]
pub struct RequestClone {
    bio: u64,
    device: String,
    info: u64,
    tio: u64,
    orig: Option<u64>,
}

impl RequestClone {
    pub fn decode(ctx: &DecodeContext<'_>, bio: u64) -> Result<Self> {
        let target = ctx.target;
        let layout = ctx.layouts.get_or_probe(REQUEST_CLONE.endio, || {
            probe(target, RQ_CLONE_BIO_INFO, "orig")
        })?;
        let info = tracking_struct(target, layout, bio, RQ_CLONE_BIO_INFO)?;

        Ok(RequestClone {
            bio,
            device: bio_device_name(target, bio)?,
            info,
            tio: target.read_member(info, RQ_CLONE_BIO_INFO, "tio")?,
            orig: read_bio_pointer(target, info, RQ_CLONE_BIO_INFO, "orig")?,
        })
    }

    /// Address of the `struct dm_rq_clone_bio_info`.
    pub fn info(&self) -> u64 {
        self.info
    }

    /// Address of the `struct dm_rq_target_io` for the request.
    pub fn tio(&self) -> u64 {
        self.tio
    }
}

impl fmt::Display for RequestClone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x} bio: {} on {}",
            self.bio, REQUEST_CLONE.description, self.device
        )
    }
}

impl DecodedLayer for RequestClone {
    fn bio(&self) -> u64 {
        self.bio
    }

    fn advance(&self) -> Option<u64> {
        self.orig
    }
}

/// Where a bio points on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extent {
    pub bio: u64,
    pub device: String,
    pub sector: u64,
}

impl Extent {
    fn read(target: &dyn Target, bio: u64) -> Result<Self> {
        Ok(Extent {
            bio,
            device: bio_device_name(target, bio)?,
            sector: bio_sector(target, bio)?,
        })
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.device, self.sector)
    }
}

/// A bio cloned by a bio-based device mapper target.
#[derive(Debug)]
pub struct BioClone {
    clone: Extent,
    tio: u64,
    io: u64,
    /// The bio this clone was made from, and where it points if that could
    /// be read.
    next: Option<(u64, Result<Extent>)>,
}

impl BioClone {
    pub fn decode(ctx: &DecodeContext<'_>, bio: u64) -> Result<Self> {
        let target = ctx.target;
        let layout = ctx
            .layouts
            .get_or_probe(BIO_CLONE.endio, || probe(target, TARGET_IO, "io"))?;
        let tio = tracking_struct(target, layout, bio, TARGET_IO)?;
        let io = target.read_member(tio, TARGET_IO, "io")?;
        let next = read_bio_pointer(target, io, DM_IO, "bio")?.map(|next| {
            let extent = Extent::read(target, next);
            if let Err(err) = &extent {
                warn!("{:x} bio: cannot locate {:x}: {}", bio, next, err);
            }
            (next, extent)
        });

        Ok(BioClone {
            clone: Extent::read(target, bio)?,
            tio,
            io,
            next,
        })
    }

    /// Address of the `struct dm_target_io`.
    pub fn tio(&self) -> u64 {
        self.tio
    }

    /// Address of the `struct dm_io` shared by all clones of the original.
    pub fn io(&self) -> u64 {
        self.io
    }

    pub fn clone_extent(&self) -> &Extent {
        &self.clone
    }

    pub fn next_extent(&self) -> Option<std::result::Result<&Extent, &Error>> {
        self.next.as_ref().map(|(_, extent)| extent.as_ref())
    }
}

impl fmt::Display for BioClone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x} bio: {}: {} -> ",
            self.clone.bio, BIO_CLONE.description, self.clone
        )?;
        match &self.next {
            Some((_, Ok(next))) => write!(f, "{}", next),
            Some((next, Err(_))) => write!(f, "{:x}[?]", next),
            None => write!(f, "(none)"),
        }
    }
}

impl DecodedLayer for BioClone {
    fn bio(&self) -> u64 {
        self.clone.bio
    }

    fn advance(&self) -> Option<u64> {
        self.next.as_ref().map(|(next, _)| *next)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::test::{fixture, CountingTarget};
    use crate::storage::{LayoutCache, DECODERS};
    use crate::target::StructLayout;

    #[test]
    fn request_clone_through_bi_private() {
        let mut fx = fixture(Layout::DirectPointer);
        let orig = fx.bio("sda", 2048, None);
        let (clone, info) = fx.rq_clone("dm-0", 0xffff_8880_0a00_0400, orig);
        assert_eq!(fx.image.read_member(clone, BIO, "bi_private").unwrap(), info);

        let layouts = LayoutCache::default();
        let ctx = fx.context(&layouts);
        let layer = RequestClone::decode(&ctx, clone).unwrap();
        assert_eq!(layer.info(), info);
        assert_eq!(layer.tio(), 0xffff_8880_0a00_0400);
        assert_eq!(layer.advance(), Some(orig));
        assert_eq!(
            layer.describe(),
            format!("{:x} bio: Request-based Device Mapper on dm-0", clone)
        );
    }

    #[test]
    fn request_clone_embedded() {
        let mut fx = fixture(Layout::EmbeddedContainer);
        let orig = fx.bio("sdb", 8, None);
        let (clone, info) = fx.rq_clone("dm-0", 0xffff_8880_0a00_0800, orig);
        assert_eq!(clone, info + 0x10);

        let layouts = LayoutCache::default();
        let ctx = fx.context(&layouts);
        let layer = RequestClone::decode(&ctx, clone).unwrap();
        assert_eq!(layer.info(), info);
        assert_eq!(layer.tio(), 0xffff_8880_0a00_0800);
        assert_eq!(layer.advance(), Some(orig));
        assert_eq!(layouts.get("end_clone_bio"), Some(Layout::EmbeddedContainer));
    }

    #[test]
    fn bio_clone_description() {
        for layout in [Layout::DirectPointer, Layout::EmbeddedContainer] {
            let mut fx = fixture(layout);
            let orig = fx.bio("dm-1", 4096, None);
            let (clone, tio, io) = fx.dm_clone_parts(orig, "sdc", 6144);

            let layouts = LayoutCache::default();
            let ctx = fx.context(&layouts);
            let layer = BioClone::decode(&ctx, clone).unwrap();
            assert_eq!(layer.tio(), tio);
            assert_eq!(layer.io(), io);
            assert_eq!(layer.advance(), Some(orig));
            assert_eq!(layer.clone_extent().device, "sdc");
            assert_eq!(layer.next_extent().unwrap().unwrap().sector, 4096);
            assert_eq!(
                layer.to_string(),
                format!("{:x} bio: device mapper clone: sdc[6144] -> dm-1[4096]", clone)
            );
        }
    }

    #[test]
    fn bio_clone_without_original() {
        let mut fx = fixture(Layout::DirectPointer);
        let clone = fx.dm_clone(0, "sdc", 16);

        let layouts = LayoutCache::default();
        let ctx = fx.context(&layouts);
        let layer = BioClone::decode(&ctx, clone).unwrap();
        assert_eq!(layer.advance(), None);
        assert!(layer.to_string().ends_with("sdc[16] -> (none)"));
    }

    #[test]
    fn unreadable_ancestor_still_advances() {
        let mut fx = fixture(Layout::EmbeddedContainer);
        let missing = 0xdead_0000_0000;
        let (clone, tio, io) = fx.dm_clone_parts(missing, "sdf", 24);

        let layouts = LayoutCache::default();
        let ctx = fx.context(&layouts);
        let layer = BioClone::decode(&ctx, clone).unwrap();
        assert_eq!(layer.tio(), tio);
        assert_eq!(layer.io(), io);
        assert_eq!(layer.advance(), Some(missing));
        assert!(matches!(layer.next_extent(), Some(Err(Error::MemoryUnavailable(_)))));
        assert_eq!(
            layer.to_string(),
            format!("{:x} bio: device mapper clone: sdf[24] -> {:x}[?]", clone, missing)
        );
    }

    #[test]
    fn probe_runs_once_per_session() {
        let mut fx = fixture(Layout::EmbeddedContainer);
        let orig = fx.bio("dm-2", 0, None);
        let clones: Vec<u64> = (0..4).map(|i| fx.dm_clone(orig, "sdd", i * 8)).collect();

        let counting = CountingTarget::new(&fx.image);
        let layouts = LayoutCache::default();
        let ctx = DecodeContext {
            target: &counting,
            layouts: &layouts,
        };
        for clone in &clones {
            BioClone::decode(&ctx, *clone).unwrap();
        }
        assert_eq!(counting.type_lookups(TARGET_IO), 1 + 2 * clones.len());
        assert_eq!(layouts.probe_count(), 1);
    }

    #[test]
    fn unknown_layout_is_a_mismatch() {
        let mut fx = fixture(Layout::DirectPointer);
        fx.image
            .add_type(StructLayout::new(TARGET_IO, 0x40).member("ti", 0x8, 8));
        let clone = fx.bio("sde", 0, Some("clone_endio"));

        let layouts = LayoutCache::default();
        let ctx = fx.context(&layouts);
        let err = BioClone::decode(&ctx, clone).unwrap_err();
        assert!(matches!(err, Error::LayoutMismatch { ref ty } if ty == TARGET_IO));
        assert_eq!(layouts.get("clone_endio"), None);
    }

    #[test]
    fn builtin_decoders() {
        assert_eq!(DECODERS.len(), 2);
        assert_eq!(
            DECODERS.lookup("end_clone_bio").unwrap().description,
            "Request-based Device Mapper"
        );
        assert_eq!(DECODERS.lookup("clone_endio").unwrap().description, "device mapper clone");
        assert!(DECODERS.lookup("bio_endio").is_none());
    }
}
