//! A sparse in-memory kernel image.

use crate::error::{Error, Result};
use crate::target::{StructLayout, Target};
use std::collections::{BTreeMap, HashMap};

const PAGE_SIZE: u64 = 4096;

/// Memory, symbols and types of a kernel, populated piecewise.
///
/// Memory is tracked in pages; a read touching a page that was never written
/// fails with [`Error::MemoryUnavailable`] rather than returning zeroes.
#[derive(Default)]
pub struct MemoryImage {
    pages: HashMap<u64, Box<[u8; PAGE_SIZE as usize]>>,
    symbols: HashMap<String, u64>,
    addresses: BTreeMap<u64, String>,
    types: HashMap<String, StructLayout>,
    block_devices: HashMap<u64, String>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_bytes(&mut self, addr: u64, bytes: &[u8]) -> &mut Self {
        for (i, byte) in bytes.iter().enumerate() {
            let addr = addr.wrapping_add(i as u64);
            let page = self
                .pages
                .entry(addr / PAGE_SIZE)
                .or_insert_with(|| Box::new([0; PAGE_SIZE as usize]));
            page[(addr % PAGE_SIZE) as usize] = *byte;
        }
        self
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> &mut Self {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    pub fn add_symbol(&mut self, name: impl Into<String>, addr: u64) -> &mut Self {
        let name = name.into();
        self.addresses.insert(addr, name.clone());
        self.symbols.insert(name, addr);
        self
    }

    pub fn add_type(&mut self, layout: StructLayout) -> &mut Self {
        self.types.insert(layout.name.clone(), layout);
        self
    }

    pub fn add_block_device(&mut self, bdev: u64, name: impl Into<String>) -> &mut Self {
        self.block_devices.insert(bdev, name.into());
        self
    }
}

impl Target for MemoryImage {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        for (i, out) in buf.iter_mut().enumerate() {
            let addr = addr.wrapping_add(i as u64);
            let page = self
                .pages
                .get(&(addr / PAGE_SIZE))
                .ok_or(Error::MemoryUnavailable(addr))?;
            *out = page[(addr % PAGE_SIZE) as usize];
        }
        Ok(())
    }

    fn lookup_symbol(&self, name: &str) -> Result<u64> {
        self.symbols
            .get(name)
            .copied()
            .ok_or_else(|| Error::SymbolNotFound(name.to_string()))
    }

    fn symbol_for_address(&self, addr: u64) -> Option<(String, u64)> {
        self.addresses
            .range(..=addr)
            .next_back()
            .map(|(base, name)| (name.clone(), addr - base))
    }

    fn lookup_type(&self, name: &str) -> Result<StructLayout> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TypeNotFound(name.to_string()))
    }

    fn block_device_name(&self, bdev: u64) -> Result<String> {
        self.block_devices
            .get(&bdev)
            .cloned()
            .ok_or(Error::MemoryUnavailable(bdev))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reads_across_page_boundary() {
        let mut image = MemoryImage::new();
        image.write_u64(PAGE_SIZE - 4, 0x1122_3344_5566_7788);
        assert_eq!(image.read_word(PAGE_SIZE - 4).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(image.read_uint(PAGE_SIZE, 4).unwrap(), 0x1122_3344);
    }

    #[test]
    fn unmapped_read_fails() {
        let image = MemoryImage::new();
        match image.read_word(0xdead_0000) {
            Err(Error::MemoryUnavailable(addr)) => assert_eq!(addr, 0xdead_0000),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn nested_members() {
        let mut image = MemoryImage::new();
        image
            .add_type(
                StructLayout::new("struct task_struct", 0x100).embedded(
                    "thread",
                    0x80,
                    0x20,
                    "struct thread_struct",
                ),
            )
            .add_type(StructLayout::new("struct thread_struct", 0x20).member("sp", 0x10, 8))
            .write_u64(0x2000 + 0x90, 0xffff_c900_0000_1000);

        let member = image.member("struct task_struct", "thread.sp").unwrap();
        assert_eq!(member.offset, 0x90);
        assert_eq!(
            image.read_member(0x2000, "struct task_struct", "thread.sp").unwrap(),
            0xffff_c900_0000_1000
        );
        assert!(image
            .member("struct task_struct", "thread.ip")
            .unwrap_err()
            .is_resolution());
    }

    #[test]
    fn container_and_symbols() {
        let mut image = MemoryImage::new();
        image
            .add_type(StructLayout::new("struct dm_target_io", 0x60).member("clone", 0x20, 0x40))
            .add_symbol("clone_endio", 0xffff_ffff_8150_0000);

        assert_eq!(
            image.container_of(0x5020, "struct dm_target_io", "clone").unwrap(),
            0x5000
        );
        assert_eq!(
            image.function_name(0xffff_ffff_8150_0000).as_deref(),
            Some("clone_endio")
        );
        assert_eq!(image.function_name(0xffff_ffff_8150_0010), None);
        assert_eq!(
            image.symbol_for_address(0xffff_ffff_8150_0010),
            Some(("clone_endio".to_string(), 0x10))
        );
    }
}
