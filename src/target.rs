//! The view of a frozen kernel that everything else in this crate reads from.
//!
//! A [`Target`] exposes raw memory, the symbol table, structure layouts and
//! block device naming. Structure layouts are looked up by name every time
//! they are needed since they change between kernel releases.

use crate::error::{Error, Result};

/// A member of a structure, with its offset from the start of the structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberLayout {
    pub name: String,
    pub offset: u64,
    pub size: u64,
    /// Name of the member's type when it is itself a structure, e.g.
    /// `struct thread_struct`.
    pub type_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    pub name: String,
    pub size: u64,
    pub members: Vec<MemberLayout>,
}

impl StructLayout {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        StructLayout {
            name: name.into(),
            size,
            members: Vec::new(),
        }
    }

    /// Adds a scalar or pointer member.
    pub fn member(mut self, name: impl Into<String>, offset: u64, size: u64) -> Self {
        self.members.push(MemberLayout {
            name: name.into(),
            offset,
            size,
            type_name: None,
        });
        self
    }

    /// Adds an embedded structure member.
    pub fn embedded(
        mut self,
        name: impl Into<String>,
        offset: u64,
        size: u64,
        type_name: impl Into<String>,
    ) -> Self {
        self.members.push(MemberLayout {
            name: name.into(),
            offset,
            size,
            type_name: Some(type_name.into()),
        });
        self
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.members.iter().any(|m| m.name == name)
    }

    pub fn get(&self, name: &str) -> Result<&MemberLayout> {
        self.members
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| Error::MissingMember {
                ty: self.name.clone(),
                member: name.to_string(),
            })
    }
}

pub trait Target {
    /// Fills `buf` with the bytes at `addr`.
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<()>;

    fn lookup_symbol(&self, name: &str) -> Result<u64>;

    /// Returns the symbol containing `addr` and the offset of `addr` into it.
    fn symbol_for_address(&self, addr: u64) -> Option<(String, u64)>;

    fn lookup_type(&self, name: &str) -> Result<StructLayout>;

    /// Formats the name of the `struct block_device` at `bdev`.
    fn block_device_name(&self, bdev: u64) -> Result<String>;

    /// Reads a little endian unsigned integer of `width` bytes.
    fn read_uint(&self, addr: u64, width: u64) -> Result<u64> {
        let mut buf = [0; 8];
        match width {
            1 | 2 | 4 | 8 => {}
            _ => return Err(Error::InvalidWidth(width)),
        }
        self.read_bytes(addr, &mut buf[..width as usize])?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_word(&self, addr: u64) -> Result<u64> {
        self.read_uint(addr, 8)
    }

    /// Resolves a dotted member path such as `thread.sp`, following embedded
    /// structures. The returned offset is relative to the start of `ty`.
    fn member(&self, ty: &str, path: &str) -> Result<MemberLayout> {
        let mut layout = self.lookup_type(ty)?;
        let mut offset = 0;
        let mut parts = path.split('.').peekable();
        while let Some(part) = parts.next() {
            let member = layout.get(part)?.clone();
            offset += member.offset;
            if parts.peek().is_none() {
                return Ok(MemberLayout { offset, ..member });
            }
            let inner = member.type_name.ok_or_else(|| Error::MissingMember {
                ty: layout.name.clone(),
                member: path.to_string(),
            })?;
            layout = self.lookup_type(&inner)?;
        }
        Err(Error::MissingMember {
            ty: ty.to_string(),
            member: path.to_string(),
        })
    }

    /// Reads the member at `path` of the `ty` located at `addr`.
    fn read_member(&self, addr: u64, ty: &str, path: &str) -> Result<u64> {
        let member = self.member(ty, path)?;
        self.read_uint(addr.wrapping_add(member.offset), member.size)
    }

    /// Computes the address of the `ty` that embeds `member` at `ptr`.
    fn container_of(&self, ptr: u64, ty: &str, member: &str) -> Result<u64> {
        let member = self.member(ty, member)?;
        Ok(ptr.wrapping_sub(member.offset))
    }

    /// Names the function starting exactly at `addr`.
    fn function_name(&self, addr: u64) -> Option<String> {
        match self.symbol_for_address(addr) {
            Some((name, 0)) => Some(name),
            _ => None,
        }
    }
}
