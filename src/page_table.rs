//! Utilities to help walk an Intel 4-level page table

use bitflags::bitflags;

use crate::addrs::{Cr3, PhysAddr, VirtAddr};

/// Mask of the physical address bits in a page table entry
const ENTRY_ADDRESS_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Various flags corresponding to a page table entry.
#[derive(Debug, Copy, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct EntryFlags {
    /// Set if this entry is present
    present: bool,

    /// Set if this entry is writable
    writable: bool,

    /// Set if this entry can be accessed from Ring 3
    user_permitted: bool,

    /// Set if this entry is for an extended page size (For example, 1GB or 2MB)
    page_size: bool,

    /// Set if execution is disabled for this entry
    execute_disable: bool,
}

impl EntryFlags {
    /// Returns `true` if the `present` bit is set in the [`EntryFlags`]
    pub fn present(&self) -> bool {
        self.present
    }

    /// Returns `true` if the `page_size` bit is set in the [`EntryFlags`]
    pub fn page_size(&self) -> bool {
        self.page_size
    }

    /// Returns `true` if the `writable` bit is set in the [`EntryFlags`]
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Returns `true` if the `user` bit is set in the [`EntryFlags`]
    pub fn user_permitted(&self) -> bool {
        self.user_permitted
    }

    /// Returns `true` if the `execute_disable` bit is not set in the [`EntryFlags`]
    pub fn executable(&self) -> bool {
        !self.execute_disable
    }
}

impl From<Entry> for EntryFlags {
    #[inline]
    fn from(entry: Entry) -> Self {
        Self {
            present: entry.0 & (1 << 0) > 0,
            writable: entry.0 & (1 << 1) > 0,
            user_permitted: entry.0 & (1 << 2) > 0,
            page_size: entry.0 & (1 << 7) > 0,
            execute_disable: entry.0 & (1 << 63) > 0,
        }
    }
}

impl From<u64> for Entry {
    fn from(val: u64) -> Self {
        Self(val)
    }
}

/// A page table entry
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct Entry(pub u64);

impl Entry {
    /// Present bit
    pub const PRESENT: u64 = 1 << 0;

    /// Writable bit
    pub const WRITABLE: u64 = 1 << 1;

    /// User accessible bit
    pub const USER: u64 = 1 << 2;

    /// Large page bit
    pub const PAGE_SIZE: u64 = 1 << 7;

    /// Execute disable bit
    pub const NO_EXECUTE: u64 = 1 << 63;

    /// Get the [`EntryFlags`] for this [`Entry`]
    #[inline]
    pub fn flags(self) -> EntryFlags {
        EntryFlags::from(self)
    }

    /// Get the [`PhysAddr`] address for this [`Entry`]
    #[inline]
    pub fn address(self) -> PhysAddr {
        PhysAddr(self.0 & ENTRY_ADDRESS_MASK)
    }
}

/// The size of the memory containing the translated address
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PageSize {
    /// A page with 1 gigabyte (1GiB), mapped by a PDPT entry
    Size1G,

    /// A page with 2 megabytes (2MiB), mapped by a PD entry
    Size2M,

    /// A page with 4 kilobytes (4KiB)
    Size4K,
}

impl PageSize {
    /// Number of bytes covered by this page size
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            PageSize::Size1G => 1024 * 1024 * 1024,
            PageSize::Size2M => 2 * 1024 * 1024,
            PageSize::Size4K => 4 * 1024,
        }
    }
}

bitflags! {
    /// Access mode a translation is validated against
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct MemoryValidate: u32 {
        /// The page must be readable
        const READ = 1;

        /// The page must be writable
        const WRITE = 2;

        /// The page must be executable
        const EXECUTE = 4;

        /// The page must be readable and writable
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();

        /// The page must be readable and executable
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

/// The permissions for a translated address
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Permissions {
    /// The page is readable
    readable: bool,

    /// The page is writable
    writable: bool,

    /// The page is executable
    executable: bool,

    /// The page is reachable from ring 3
    user: bool,
}

impl Permissions {
    /// Permissions before any page table level has restricted them
    #[must_use]
    pub fn all() -> Self {
        Self {
            readable: true,
            writable: true,
            executable: true,
            user: true,
        }
    }

    /// Narrow the permissions by the flags of one level of the walk. Access rights
    /// are the intersection of every level.
    #[inline]
    pub fn restrict(&mut self, flags: EntryFlags) {
        self.writable &= flags.writable();
        self.executable &= flags.executable();
        self.user &= flags.user_permitted();
    }

    /// Get the writable flag
    #[inline]
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Get the executable flag
    #[inline]
    pub fn executable(&self) -> bool {
        self.executable
    }

    /// Get the user flag
    #[inline]
    pub fn user(&self) -> bool {
        self.user
    }

    /// Returns `true` if these permissions satisfy the `validate` access mode
    #[must_use]
    pub fn allows(&self, validate: MemoryValidate) -> bool {
        (!validate.contains(MemoryValidate::READ) || self.readable)
            && (!validate.contains(MemoryValidate::WRITE) || self.writable)
            && (!validate.contains(MemoryValidate::EXECUTE) || self.executable)
    }
}

/// The result of a virtual address translation containing the page size and physical
/// address
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Translation {
    /// The virtual address for this translation
    pub virt_addr: VirtAddr,

    /// The physical address of the translation
    pub phys_addr: PhysAddr,

    /// The size of the translation page
    pub page_size: PageSize,

    /// [`Permissions`] for this entry
    pub perms: Permissions,
}

/// Reasons a virtual address could not be translated
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum TranslationFault {
    /// An entry on the walk did not have the present bit set
    #[error("NotPresent_{virt_addr:x?}_level{level}")]
    NotPresent {
        /// Address being translated
        virt_addr: VirtAddr,

        /// Level of the walk (0 is the PML4) where the entry was missing
        level: usize,
    },

    /// The page is mapped but does not allow the requested access
    #[error("AccessViolation_{virt_addr:x?}_{validate:?}")]
    AccessViolation {
        /// Address being translated
        virt_addr: VirtAddr,

        /// Access mode that was refused
        validate: MemoryValidate,
    },

    /// A page table on the walk is not backed by the snapshot
    #[error("TableOutsideSnapshot_{virt_addr:x?}_{table:x?}")]
    TableOutsideSnapshot {
        /// Address being translated
        virt_addr: VirtAddr,

        /// Physical address of the missing table
        table: PhysAddr,
    },
}

impl TranslationFault {
    /// Returns `true` if the walk left the physical memory of the snapshot. Such a
    /// fault can not be serviced by the guest or by paging in snapshot memory.
    #[must_use]
    pub fn is_outside_snapshot(&self) -> bool {
        matches!(self, TranslationFault::TableOutsideSnapshot { .. })
    }
}

/// Walk the 4-level page table rooted at `cr3` for `virt_addr`.
///
/// `read_entry` reads the 8 byte entry at the given physical address, returning
/// `None` if that address is not backed by physical memory.
///
/// # Errors
///
/// * An entry on the walk is not present
/// * A table on the walk is not backed by physical memory
/// * The final permissions do not allow `validate`
pub fn walk<F>(
    virt_addr: VirtAddr,
    cr3: Cr3,
    validate: MemoryValidate,
    mut read_entry: F,
) -> Result<Translation, TranslationFault>
where
    F: FnMut(PhysAddr) -> Option<u64>,
{
    // Each offset is 9 bits
    // VirtAddr: 0baaaa_aaaa_abbb_bbbb_bbcc_cccc_cccd_dddd_dddd_0000_0000_0000
    //             [Lvl1index][Lvl2index][Lvl3index][Lvl4index]
    let table_indexes = virt_addr.table_indexes();

    let mut table = cr3.root();
    let mut perms = Permissions::all();

    for (level, index) in table_indexes.iter().enumerate() {
        let entry_addr = table.offset(try_u64!(*index) * 8);
        let entry = Entry(
            read_entry(entry_addr).ok_or(TranslationFault::TableOutsideSnapshot { virt_addr, table })?,
        );

        let flags = entry.flags();
        if !flags.present() {
            return Err(TranslationFault::NotPresent { virt_addr, level });
        }

        perms.restrict(flags);

        let page_size = match (level, flags.page_size()) {
            (1, true) => Some(PageSize::Size1G),
            (2, true) => Some(PageSize::Size2M),
            (3, _) => Some(PageSize::Size4K),
            _ => None,
        };

        if let Some(page_size) = page_size {
            let offset = virt_addr.0 & (page_size.bytes() - 1);
            let base = PhysAddr(entry.address().0 & !(page_size.bytes() - 1));

            if !perms.allows(validate) {
                return Err(TranslationFault::AccessViolation { virt_addr, validate });
            }

            return Ok(Translation {
                virt_addr,
                phys_addr: base.offset(offset),
                page_size,
                perms,
            });
        }

        table = entry.address();
    }

    unreachable!("4-level walk always terminates at level 3")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const P: u64 = Entry::PRESENT;
    const W: u64 = Entry::WRITABLE;

    /// Sparse physical memory of 8 byte entries
    fn reader(entries: &HashMap<u64, u64>) -> impl FnMut(PhysAddr) -> Option<u64> + '_ {
        move |addr| {
            // Tables live in the 0x1000..0x10000 range, everything else is unbacked
            if (0x1000..0x10000).contains(&addr.0) {
                Some(*entries.get(&addr.0).unwrap_or(&0))
            } else {
                None
            }
        }
    }

    fn four_level() -> HashMap<u64, u64> {
        let mut entries = HashMap::new();
        // PML4[0] -> PDPT @ 0x2000
        entries.insert(0x1000, 0x2000 | P | W);
        // PDPT[0] -> PD @ 0x3000
        entries.insert(0x2000, 0x3000 | P | W);
        // PD[2] -> PT @ 0x4000
        entries.insert(0x3000 + 2 * 8, 0x4000 | P | W);
        // PT[1] -> 0x9000 read only
        entries.insert(0x4000 + 8, 0x9000 | P);
        // PT[2] -> 0xa000 writable, no execute
        entries.insert(0x4000 + 2 * 8, 0xa000 | P | W | Entry::NO_EXECUTE);
        entries
    }

    #[test]
    fn walk_4k() {
        let entries = four_level();
        let res = walk(
            VirtAddr(0x40_1234),
            Cr3(0x1000),
            MemoryValidate::READ,
            reader(&entries),
        )
        .unwrap();
        assert_eq!(res.phys_addr, PhysAddr(0x9234));
        assert_eq!(res.page_size, PageSize::Size4K);
        assert!(!res.perms.writable());
    }

    #[test]
    fn walk_checks_access_mode() {
        let entries = four_level();
        let err = walk(
            VirtAddr(0x40_1000),
            Cr3(0x1000),
            MemoryValidate::READ_WRITE,
            reader(&entries),
        )
        .unwrap_err();
        assert!(matches!(err, TranslationFault::AccessViolation { .. }));

        let err = walk(
            VirtAddr(0x40_2000),
            Cr3(0x1000),
            MemoryValidate::READ_EXECUTE,
            reader(&entries),
        )
        .unwrap_err();
        assert!(matches!(err, TranslationFault::AccessViolation { .. }));

        assert!(walk(
            VirtAddr(0x40_2000),
            Cr3(0x1000),
            MemoryValidate::READ_WRITE,
            reader(&entries)
        )
        .is_ok());
    }

    #[test]
    fn walk_not_present() {
        let entries = four_level();
        let err = walk(
            VirtAddr(0x40_3000),
            Cr3(0x1000),
            MemoryValidate::READ,
            reader(&entries),
        )
        .unwrap_err();
        assert_eq!(
            err,
            TranslationFault::NotPresent {
                virt_addr: VirtAddr(0x40_3000),
                level: 3
            }
        );
    }

    #[test]
    fn walk_large_pages() {
        let mut entries = four_level();
        // PD[3] -> 2M page at 0x20_0000
        entries.insert(0x3000 + 3 * 8, 0x20_0000 | P | W | Entry::PAGE_SIZE);
        // PDPT[1] -> 1G page at 0x4000_0000
        entries.insert(0x2000 + 8, 0x4000_0000 | P | Entry::PAGE_SIZE);

        let res = walk(
            VirtAddr(0x61_2345),
            Cr3(0x1000),
            MemoryValidate::READ,
            reader(&entries),
        )
        .unwrap();
        assert_eq!(res.page_size, PageSize::Size2M);
        assert_eq!(res.phys_addr, PhysAddr(0x21_2345));

        let res = walk(
            VirtAddr(0x4123_4567),
            Cr3(0x1000),
            MemoryValidate::READ,
            reader(&entries),
        )
        .unwrap();
        assert_eq!(res.page_size, PageSize::Size1G);
        assert_eq!(res.phys_addr, PhysAddr(0x4123_4567));
    }

    #[test]
    fn walk_outside_snapshot() {
        let mut entries = four_level();
        // PML4[1] -> PDPT outside of backed memory
        entries.insert(0x1000 + 8, 0x80_0000 | P | W);

        let err = walk(
            VirtAddr(0x80_0000_0000),
            Cr3(0x1000),
            MemoryValidate::READ,
            reader(&entries),
        )
        .unwrap_err();
        assert!(err.is_outside_snapshot());
    }
}
