//! Guest address types and the identity-hashed tables keyed by them

use serde::{Deserialize, Serialize};

use std::collections::{HashMap, HashSet};
use std::hash::{BuildHasherDefault, Hasher};

/// Size of a guest page in bytes
pub const PAGE_SIZE: u64 = 0x1000;

/// Mask selecting the offset into a page
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// A guest physical address (GPA)
#[repr(transparent)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    /// Return a [`PhysAddr`] `offset` byte away from `self`
    ///
    /// Example:
    ///
    /// ```
    /// # use snapemu::PhysAddr;
    /// let page = PhysAddr(0xdead_0000);
    /// let entry = page.offset(0x1234);
    /// assert!(entry.0 == 0xdead_1234);
    /// ```
    #[must_use]
    pub const fn offset(self, offset: u64) -> PhysAddr {
        PhysAddr(self.0.wrapping_add(offset))
    }

    /// Return the page that contains this [`PhysAddr`]
    ///
    /// Example:
    ///
    /// ```
    /// # use snapemu::PhysAddr;
    /// let addr = PhysAddr(0xdead_1234);
    /// assert!(addr.page().0 == 0xdead_1000);
    /// ```
    #[must_use]
    pub const fn page(self) -> PhysAddr {
        PhysAddr(self.0 & !PAGE_MASK)
    }

    /// Offset of this address into its page
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK
    }

    /// Returns `true` if this address is the start of a page
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }
}

impl std::ops::Deref for PhysAddr {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<u64> for PhysAddr {
    fn from(val: u64) -> PhysAddr {
        PhysAddr(val)
    }
}

/// A guest virtual address (GVA)
#[repr(transparent)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VirtAddr(pub u64);

impl From<u64> for VirtAddr {
    fn from(val: u64) -> VirtAddr {
        VirtAddr(val)
    }
}

impl VirtAddr {
    /// Return a [`VirtAddr`] `offset` byte away from `self`
    #[must_use]
    pub const fn offset(self, offset: u64) -> VirtAddr {
        VirtAddr(self.0.wrapping_add(offset))
    }

    /// Get the 4 page table indexes that this [`VirtAddr`] corresponds maps with when
    /// translating via a 4-level page table
    #[must_use]
    pub fn table_indexes(self) -> [usize; 4] {
        [
            try_usize!((self.0 >> 39) & 0x1ff),
            try_usize!((self.0 >> 30) & 0x1ff),
            try_usize!((self.0 >> 21) & 0x1ff),
            try_usize!((self.0 >> 12) & 0x1ff),
        ]
    }

    /// Return the page that contains this [`VirtAddr`]
    ///
    /// Example:
    ///
    /// ```
    /// # use snapemu::VirtAddr;
    /// let addr = VirtAddr(0xdead_1234);
    /// assert!(addr.page().0 == 0xdead_1000);
    /// ```
    #[must_use]
    pub const fn page(self) -> VirtAddr {
        VirtAddr(self.0 & !PAGE_MASK)
    }

    /// Offset of this address into its page
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK
    }

    /// Returns `true` if bits 63:47 are a sign extension of bit 47
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        let top = self.0 >> 47;
        top == 0 || top == 0x1_ffff
    }
}

impl std::ops::Deref for VirtAddr {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A wrapper around the cr3
#[repr(transparent)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cr3(pub u64);

impl Cr3 {
    /// Physical address of the top level page table (PML4)
    #[must_use]
    pub const fn root(self) -> PhysAddr {
        PhysAddr(self.0 & 0x000f_ffff_ffff_f000)
    }
}

impl std::ops::Deref for Cr3 {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// [`Hasher`] returning the written integer unchanged.
///
/// Guest addresses are already well distributed, page aligned keys, so mixing them
/// buys nothing over using the raw value as the hash.
#[derive(Debug, Default, Copy, Clone)]
pub struct IdentityHasher {
    /// Last value written
    hash: u64,
}

impl Hasher for IdentityHasher {
    fn finish(&self) -> u64 {
        self.hash
    }

    fn write(&mut self, bytes: &[u8]) {
        // Only reached for non-integer keys. Fold the bytes in so the hasher is
        // still total.
        for byte in bytes {
            self.hash = self.hash.rotate_left(8) ^ u64::from(*byte);
        }
    }

    fn write_u64(&mut self, val: u64) {
        self.hash = val;
    }

    fn write_usize(&mut self, val: usize) {
        self.hash = val as u64;
    }
}

/// Builder for [`IdentityHasher`]
pub type IdentityBuildHasher = BuildHasherDefault<IdentityHasher>;

/// Set of guest physical addresses
pub type GpaSet = HashSet<PhysAddr, IdentityBuildHasher>;

/// Map keyed by guest physical addresses
pub type GpaMap<V> = HashMap<PhysAddr, V, IdentityBuildHasher>;

/// Set of guest virtual addresses
pub type GvaSet = HashSet<VirtAddr, IdentityBuildHasher>;

/// Map keyed by guest virtual addresses
pub type GvaMap<V> = HashMap<VirtAddr, V, IdentityBuildHasher>;
