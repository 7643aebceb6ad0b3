//! Guest physical memory: the immutable snapshot pages, the per-run copy-on-write
//! overlay, and the translation helpers built on top of them

use anyhow::{ensure, Context, Result};

use crate::addrs::{Cr3, GpaMap, GpaSet, GvaMap, PhysAddr, VirtAddr, PAGE_MASK, PAGE_SIZE};
use crate::page_table::{self, MemoryValidate, Translation, TranslationFault};

use std::path::Path;

/// Contents of a single guest page
pub type Page = [u8; PAGE_SIZE as usize];

/// Custom errors [`Memory`] can throw
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Attempted to write to an unmapped virtual address
    #[error("WriteToUnmappedVirtualAddress_{0:x?}_{1:x?}_{2:#x}")]
    WriteToUnmappedVirtualAddress(VirtAddr, Cr3, usize),

    /// Attempted to read from an unmapped virtual address
    #[error("ReadFromUnmappedVirtualAddress_{0:x?}_{1:x?}")]
    ReadFromUnmappedVirtualAddress(VirtAddr, Cr3),

    /// A virtual address translated to physical memory outside of the snapshot
    #[error("PhysicalAddressOutsideSnapshot_{0:x?}")]
    PhysicalAddressOutsideSnapshot(PhysAddr),

    /// A snapshot page was given at an address that is not page aligned
    #[error("Snapshot page {0:x?} is not page aligned")]
    UnalignedPage(PhysAddr),

    /// A snapshot page was given with the wrong number of bytes
    #[error("Snapshot page {0:x?} has {1:#x} bytes")]
    InvalidPageLength(PhysAddr, usize),

    /// The same physical page was given twice while building a snapshot
    #[error("Snapshot page {0:x?} given twice")]
    DuplicatePage(PhysAddr),

    /// A raw physical memory dump is not a whole number of pages
    #[error("Physical memory dump of {0:#x} bytes is not a multiple of the page size")]
    RawDumpNotPageSized(usize),
}

/// Immutable physical memory of the snapshot, indexed by page
#[derive(Default)]
pub struct SnapshotMemory {
    /// Page contents keyed by page aligned physical address
    pages: GpaMap<Box<Page>>,
}

impl SnapshotMemory {
    /// Create an empty snapshot
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the page at `phys_addr` with the given `contents`
    ///
    /// # Errors
    ///
    /// * `phys_addr` is not page aligned
    /// * `contents` is not exactly one page
    /// * The page was already added
    pub fn insert_page(&mut self, phys_addr: PhysAddr, contents: &[u8]) -> Result<()> {
        ensure!(phys_addr.is_page_aligned(), Error::UnalignedPage(phys_addr));

        let page: Box<Page> = contents
            .to_vec()
            .into_boxed_slice()
            .try_into()
            .map_err(|_| Error::InvalidPageLength(phys_addr, contents.len()))?;

        ensure!(
            !self.pages.contains_key(&phys_addr),
            Error::DuplicatePage(phys_addr)
        );

        self.pages.insert(phys_addr, page);

        Ok(())
    }

    /// Build a snapshot from `(address, contents)` pairs as produced by a memory
    /// image parser
    ///
    /// # Errors
    ///
    /// * Any page fails [`SnapshotMemory::insert_page`]
    pub fn from_pages<'a, I>(pages: I) -> Result<Self>
    where
        I: IntoIterator<Item = (PhysAddr, &'a [u8])>,
    {
        let mut res = Self::new();
        for (phys_addr, contents) in pages {
            res.insert_page(phys_addr, contents)?;
        }

        Ok(res)
    }

    /// Build a snapshot from a flat physical memory dump where byte `N` is the
    /// physical address `N`
    ///
    /// # Errors
    ///
    /// * The dump is not a whole number of pages
    pub fn from_raw_dump(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() % PAGE_SIZE as usize == 0,
            Error::RawDumpNotPageSized(bytes.len())
        );

        Self::from_pages(
            bytes
                .chunks_exact(PAGE_SIZE as usize)
                .enumerate()
                .map(|(index, page)| (PhysAddr(try_u64!(index) * PAGE_SIZE), page)),
        )
    }

    /// Read a flat physical memory dump from `path`
    ///
    /// # Errors
    ///
    /// * Failed to read the file
    /// * The dump is not a whole number of pages
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read physical memory {}", path.display()))?;

        Self::from_raw_dump(&bytes)
    }

    /// Get the snapshot page containing `phys_addr`
    #[must_use]
    pub fn page(&self, phys_addr: PhysAddr) -> Option<&Page> {
        self.pages.get(&phys_addr.page()).map(|page| &**page)
    }

    /// Returns `true` if the page containing `phys_addr` is part of the snapshot
    #[must_use]
    pub fn contains(&self, phys_addr: PhysAddr) -> bool {
        self.pages.contains_key(&phys_addr.page())
    }

    /// Number of pages in the snapshot
    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns `true` if the snapshot has no pages
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Iterator over `(address, size)` chunks of a byte range split at page boundaries.
/// Virtual addresses that go across page boundaries are not necessarily contiguous
/// physically, so every access is done per chunk.
#[derive(Debug, Clone)]
pub struct PageBoundaries {
    /// Start of the next chunk
    addr: u64,

    /// Bytes left to chunk
    remaining: u64,
}

impl Iterator for PageBoundaries {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let bytes_to_end_of_page = PAGE_SIZE - (self.addr & PAGE_MASK);
        let size = bytes_to_end_of_page.min(self.remaining);
        let chunk = (self.addr, size);

        self.addr = self.addr.wrapping_add(size);
        self.remaining -= size;

        Some(chunk)
    }
}

/// Split `size` bytes starting at `addr` into page sized chunks
#[must_use]
pub fn page_boundaries(addr: u64, size: u64) -> PageBoundaries {
    PageBoundaries {
        addr,
        remaining: size,
    }
}

/// What the fault servicing path did for a single virtual page
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page translates and is already in the working set
    Resident(PhysAddr),

    /// The page translates and was pulled from the snapshot into the working set
    PagedIn(PhysAddr),

    /// The guest page tables do not map the page. The guest's own page fault handler
    /// is responsible for it.
    GuestFault(TranslationFault),

    /// The page can not be backed by snapshot memory at all
    Unresolved,
}

/// Guest memory as seen by one backend: the shared snapshot pages plus the pages
/// dirtied during the current run
pub struct Memory {
    /// Clean snapshot pages. Never written.
    snapshot: SnapshotMemory,

    /// Private copies of every page written during this run. The key set is the
    /// dirty set.
    dirty: GpaMap<Box<Page>>,

    /// Page allocations released on restore, reused for the next dirty copies
    free_pages: Vec<Box<Page>>,

    /// Physical pages handed to the emulation engine so far
    working_set: GpaSet,

    /// Cached translations of virtual pages under `tlb_cr3`
    tlb: GvaMap<Translation>,

    /// Page table root the cached translations belong to
    tlb_cr3: Cr3,
}

impl Memory {
    /// Create the memory view over a clean `snapshot`
    #[must_use]
    pub fn new(snapshot: SnapshotMemory) -> Self {
        Self {
            snapshot,
            dirty: GpaMap::default(),
            free_pages: Vec::new(),
            working_set: GpaSet::default(),
            tlb: GvaMap::default(),
            tlb_cr3: Cr3(0),
        }
    }

    /// Get the clean snapshot backing this memory
    #[must_use]
    pub fn snapshot(&self) -> &SnapshotMemory {
        &self.snapshot
    }

    /// Get the current contents of the page containing `phys_addr`: the dirty copy if
    /// there is one, otherwise the snapshot page
    #[must_use]
    pub fn page(&self, phys_addr: PhysAddr) -> Option<&Page> {
        let page = phys_addr.page();
        match self.dirty.get(&page) {
            Some(dirty) => Some(&**dirty),
            None => self.snapshot.page(page),
        }
    }

    /// Resolve `phys_addr` to the bytes from that address to the end of its page
    #[must_use]
    pub fn phys_translate(&self, phys_addr: PhysAddr) -> Option<&[u8]> {
        let offset = try_usize!(phys_addr.page_offset());
        self.page(phys_addr).map(|page| &page[offset..])
    }

    /// Resolve `phys_addr` to writable bytes, dirtying its page first
    pub fn phys_translate_mut(&mut self, phys_addr: PhysAddr) -> Option<&mut [u8]> {
        if !self.dirty_gpa(phys_addr) {
            return None;
        }

        let offset = try_usize!(phys_addr.page_offset());
        self.dirty
            .get_mut(&phys_addr.page())
            .map(|page| &mut page[offset..])
    }

    /// Mark the page containing `phys_addr` as dirty, copying the snapshot page on
    /// the first write. Returns `false` if the page is not part of the snapshot.
    pub fn dirty_gpa(&mut self, phys_addr: PhysAddr) -> bool {
        let page = phys_addr.page();
        if self.dirty.contains_key(&page) {
            return true;
        }

        let Some(clean) = self.snapshot.page(page) else {
            return false;
        };

        let mut copy = self
            .free_pages
            .pop()
            .unwrap_or_else(|| Box::new([0; PAGE_SIZE as usize]));
        copy.copy_from_slice(clean);
        self.dirty.insert(page, copy);

        true
    }

    /// Dirty every page touched by `len` bytes at `phys_addr`. Returns `false` if any
    /// of those pages is not part of the snapshot.
    pub fn dirty_physical_memory_range(&mut self, phys_addr: PhysAddr, len: u64) -> bool {
        let mut res = true;
        for (addr, _size) in page_boundaries(phys_addr.0, len) {
            res &= self.dirty_gpa(PhysAddr(addr));
        }

        res
    }

    /// Dirty every physical page backing `len` bytes at `virt_addr`. Returns `false`
    /// if any virtual page does not translate or is not part of the snapshot.
    pub fn dirty_virtual_memory_range(&mut self, virt_addr: VirtAddr, len: u64, cr3: Cr3) -> bool {
        let mut res = true;
        for (addr, _size) in page_boundaries(virt_addr.0, len) {
            match self.translate_cached(VirtAddr(addr), cr3, MemoryValidate::READ) {
                Ok(translation) => res &= self.dirty_gpa(translation.phys_addr),
                Err(fault) => {
                    log::debug!("Failed to dirty {addr:#x}: {fault}");
                    res = false;
                }
            }
        }

        res
    }

    /// Returns `true` if the page containing `phys_addr` was written this run
    #[must_use]
    pub fn is_dirty(&self, phys_addr: PhysAddr) -> bool {
        self.dirty.contains_key(&phys_addr.page())
    }

    /// Iterator over the dirty pages
    pub fn dirty_pages(&self) -> impl Iterator<Item = PhysAddr> + '_ {
        self.dirty.keys().copied()
    }

    /// Number of dirty pages
    #[must_use]
    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    /// Drop every dirty copy so all pages read back as the snapshot again. Returns
    /// the number of restored pages.
    pub fn restore_dirty_pages(&mut self) -> usize {
        let restored = self.dirty.len();

        self.free_pages
            .extend(self.dirty.drain().map(|(_page, copy)| copy));

        // Guest page tables may have been dirtied as well
        self.flush_tlb();

        restored
    }

    /// Read `buf.len()` bytes of physical memory at `phys_addr`. Bytes outside of the
    /// snapshot read as zero. Returns `false` if any byte was outside the snapshot.
    pub fn read_phys_bytes(&self, phys_addr: PhysAddr, buf: &mut [u8]) -> bool {
        let mut backed = true;
        let mut offset = 0;

        for (addr, size) in page_boundaries(phys_addr.0, try_u64!(buf.len())) {
            let size = try_usize!(size);
            let dst = &mut buf[offset..offset + size];

            match self.phys_translate(PhysAddr(addr)) {
                Some(src) => dst.copy_from_slice(&src[..size]),
                None => {
                    dst.fill(0);
                    backed = false;
                }
            }

            offset += size;
        }

        backed
    }

    /// Read a `u64` from physical memory, or `None` if it is outside the snapshot
    #[must_use]
    pub fn read_phys_u64(&self, phys_addr: PhysAddr) -> Option<u64> {
        let mut bytes = [0_u8; 8];
        self.read_phys_bytes(phys_addr, &mut bytes)
            .then(|| u64::from_le_bytes(bytes))
    }

    /// Write `buf` to physical memory at `phys_addr`, dirtying every touched page.
    /// Bytes outside the snapshot are dropped. Returns `false` if any were dropped.
    pub fn write_phys_bytes(&mut self, phys_addr: PhysAddr, buf: &[u8]) -> bool {
        let mut backed = true;
        let mut offset = 0;

        for (addr, size) in page_boundaries(phys_addr.0, try_u64!(buf.len())) {
            let size = try_usize!(size);

            match self.phys_translate_mut(PhysAddr(addr)) {
                Some(dst) => dst[..size].copy_from_slice(&buf[offset..offset + size]),
                None => backed = false,
            }

            offset += size;
        }

        backed
    }

    /// Translate `virt_addr` through the page tables rooted at `cr3`, validating the
    /// final permissions against `validate`.
    ///
    /// # Errors
    ///
    /// * The address is not mapped, or the mapping does not allow `validate`
    pub fn translate(
        &self,
        virt_addr: VirtAddr,
        cr3: Cr3,
        validate: MemoryValidate,
    ) -> Result<Translation, TranslationFault> {
        let cached = if cr3.root() == self.tlb_cr3.root() {
            self.tlb.get(&virt_addr.page())
        } else {
            None
        };

        if let Some(cached) = cached {
            if !cached.perms.allows(validate) {
                return Err(TranslationFault::AccessViolation { virt_addr, validate });
            }

            return Ok(Translation {
                virt_addr,
                phys_addr: cached.phys_addr.offset(virt_addr.page_offset()),
                ..*cached
            });
        }

        page_table::walk(virt_addr, cr3, validate, |entry| self.read_phys_u64(entry))
    }

    /// Same as [`Memory::translate`], caching the page translation on success
    ///
    /// # Errors
    ///
    /// * The address is not mapped, or the mapping does not allow `validate`
    pub fn translate_cached(
        &mut self,
        virt_addr: VirtAddr,
        cr3: Cr3,
        validate: MemoryValidate,
    ) -> Result<Translation, TranslationFault> {
        if cr3.root() != self.tlb_cr3.root() {
            self.tlb.clear();
            self.tlb_cr3 = cr3;
        }

        let translation = self.translate(virt_addr, cr3, validate)?;

        let page = virt_addr.page();
        self.tlb.entry(page).or_insert(Translation {
            virt_addr: page,
            phys_addr: translation.phys_addr.page(),
            ..translation
        });

        Ok(translation)
    }

    /// Forget every cached translation
    pub fn flush_tlb(&mut self) {
        self.tlb.clear();
    }

    /// Forget the cached translation for the page containing `virt_addr`
    pub fn flush_tlb_page(&mut self, virt_addr: VirtAddr) {
        self.tlb.remove(&virt_addr.page());
    }

    /// Read `buf.len()` bytes at `virt_addr` using the page tables at `cr3`
    ///
    /// # Errors
    ///
    /// * Part of the range is not mapped
    /// * Part of the range translates outside of the snapshot
    pub fn read_bytes(&self, virt_addr: VirtAddr, cr3: Cr3, buf: &mut [u8]) -> Result<()> {
        let mut offset = 0;

        for (addr, size) in page_boundaries(virt_addr.0, try_u64!(buf.len())) {
            let size = try_usize!(size);
            let translation = self
                .translate(VirtAddr(addr), cr3, MemoryValidate::READ)
                .context(Error::ReadFromUnmappedVirtualAddress(VirtAddr(addr), cr3))?;

            ensure!(
                self.read_phys_bytes(translation.phys_addr, &mut buf[offset..offset + size]),
                Error::PhysicalAddressOutsideSnapshot(translation.phys_addr)
            );

            offset += size;
        }

        Ok(())
    }

    /// Write `buf` at `virt_addr` using the page tables at `cr3`, dirtying every
    /// touched page. Page permissions are not checked.
    ///
    /// # Errors
    ///
    /// * Part of the range is not mapped
    /// * Part of the range translates outside of the snapshot
    pub fn write_bytes_dirty(&mut self, virt_addr: VirtAddr, cr3: Cr3, buf: &[u8]) -> Result<()> {
        let mut offset = 0;

        for (addr, size) in page_boundaries(virt_addr.0, try_u64!(buf.len())) {
            let size = try_usize!(size);
            let translation = self
                .translate_cached(VirtAddr(addr), cr3, MemoryValidate::READ)
                .context(Error::WriteToUnmappedVirtualAddress(
                    VirtAddr(addr),
                    cr3,
                    buf.len(),
                ))?;

            ensure!(
                self.write_phys_bytes(translation.phys_addr, &buf[offset..offset + size]),
                Error::PhysicalAddressOutsideSnapshot(translation.phys_addr)
            );

            offset += size;
        }

        Ok(())
    }

    /// Returns `true` if the page containing `phys_addr` was handed to the engine
    #[must_use]
    pub fn is_resident(&self, phys_addr: PhysAddr) -> bool {
        self.working_set.contains(&phys_addr.page())
    }

    /// Pull the snapshot page containing `phys_addr` into the engine working set.
    /// Returns `false` if the page is not part of the snapshot.
    pub fn page_in(&mut self, phys_addr: PhysAddr) -> bool {
        let page = phys_addr.page();
        if !self.snapshot.contains(page) {
            return false;
        }

        if self.working_set.insert(page) {
            log::debug!("Paged in {page:x?}");
        }

        true
    }

    /// Find the first page of `size` bytes at `virt_addr` that either does not
    /// translate or whose physical page is not yet in the working set
    #[must_use]
    pub fn get_first_virtual_page_to_fault(
        &self,
        virt_addr: VirtAddr,
        size: u64,
        cr3: Cr3,
    ) -> Option<VirtAddr> {
        page_boundaries(virt_addr.0, size)
            .map(|(addr, _size)| VirtAddr(addr).page())
            .find(|page| {
                self.translate(*page, cr3, MemoryValidate::READ)
                    .map_or(true, |translation| !self.is_resident(translation.phys_addr))
            })
    }

    /// Try to back the virtual page containing `virt_addr` with snapshot memory
    pub fn fault_in(&mut self, virt_addr: VirtAddr, cr3: Cr3) -> FaultOutcome {
        match self.translate_cached(virt_addr.page(), cr3, MemoryValidate::READ) {
            Ok(translation) => {
                let phys_addr = translation.phys_addr;
                if self.is_resident(phys_addr) {
                    FaultOutcome::Resident(phys_addr)
                } else if self.page_in(phys_addr) {
                    FaultOutcome::PagedIn(phys_addr)
                } else {
                    log::debug!("{virt_addr:x?} maps to {phys_addr:x?} outside the snapshot");
                    FaultOutcome::Unresolved
                }
            }
            Err(fault) if fault.is_outside_snapshot() => {
                log::debug!("Page walk for {virt_addr:x?} left the snapshot: {fault}");
                FaultOutcome::Unresolved
            }
            Err(fault) => FaultOutcome::GuestFault(fault),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_table::Entry;

    const CR3: Cr3 = Cr3(0x1000);

    /// Snapshot with 16 pages where page N is filled with byte N, and a page table
    /// mapping virtual 0x40_0000..0x40_4000 to physical 0x8000..0xc000. Physical
    /// 0xb000 is writable, the rest read only.
    fn snapshot() -> SnapshotMemory {
        let mut dump = vec![0_u8; 16 * PAGE_SIZE as usize];
        for (index, page) in dump.chunks_exact_mut(PAGE_SIZE as usize).enumerate() {
            page.fill(index as u8);
        }

        let mut set_entry = |addr: usize, val: u64| {
            dump[addr..addr + 8].copy_from_slice(&val.to_le_bytes());
        };

        // Clear the table pages before filling in entries
        for table in [0x1000, 0x2000, 0x3000, 0x4000] {
            for index in 0..512 {
                set_entry(table + index * 8, 0);
            }
        }

        set_entry(0x1000, 0x2000 | Entry::PRESENT | Entry::WRITABLE);
        set_entry(0x2000, 0x3000 | Entry::PRESENT | Entry::WRITABLE);
        set_entry(0x3000 + 2 * 8, 0x4000 | Entry::PRESENT | Entry::WRITABLE);
        for (index, phys) in [0x8000_u64, 0x9000, 0xa000].iter().enumerate() {
            set_entry(0x4000 + index * 8, phys | Entry::PRESENT);
        }
        set_entry(0x4000 + 3 * 8, 0xb000 | Entry::PRESENT | Entry::WRITABLE);

        // Virtual 0x40_5000 maps physical memory outside of the dump
        set_entry(0x4000 + 5 * 8, 0x10_0000 | Entry::PRESENT | Entry::WRITABLE);

        SnapshotMemory::from_raw_dump(&dump).unwrap()
    }

    #[test]
    fn snapshot_rejects_bad_pages() {
        let mut snapshot = SnapshotMemory::new();
        assert!(snapshot.insert_page(PhysAddr(0x1001), &[0; 0x1000]).is_err());
        assert!(snapshot.insert_page(PhysAddr(0x1000), &[0; 0x10]).is_err());
        snapshot.insert_page(PhysAddr(0x1000), &[0; 0x1000]).unwrap();
        assert!(snapshot.insert_page(PhysAddr(0x1000), &[0; 0x1000]).is_err());
        assert!(SnapshotMemory::from_raw_dump(&[0; 0x1001]).is_err());
    }

    #[test]
    fn page_boundaries_split() {
        let chunks: Vec<_> = page_boundaries(0x1ff0, 0x20).collect();
        assert_eq!(chunks, vec![(0x1ff0, 0x10), (0x2000, 0x10)]);

        let chunks: Vec<_> = page_boundaries(0x1000, 0x1000).collect();
        assert_eq!(chunks, vec![(0x1000, 0x1000)]);

        let chunks: Vec<_> = page_boundaries(0x1800, 0x2000).collect();
        assert_eq!(
            chunks,
            vec![(0x1800, 0x800), (0x2000, 0x1000), (0x3000, 0x800)]
        );

        assert_eq!(page_boundaries(0x1234, 0).count(), 0);
    }

    #[test]
    fn dirty_gpa_is_idempotent() {
        let mut memory = Memory::new(snapshot());
        for _ in 0..5 {
            assert!(memory.dirty_gpa(PhysAddr(0x8123)));
        }
        assert_eq!(memory.dirty_len(), 1);
        assert!(memory.is_dirty(PhysAddr(0x8000)));

        // Outside the snapshot
        assert!(!memory.dirty_gpa(PhysAddr(0x10_0000)));
        assert_eq!(memory.dirty_len(), 1);
    }

    #[test]
    fn dirty_ranges_touch_exact_pages() {
        let mut memory = Memory::new(snapshot());
        assert!(memory.dirty_physical_memory_range(PhysAddr(0x8ff8), 0x10));
        let mut dirty: Vec<_> = memory.dirty_pages().collect();
        dirty.sort();
        assert_eq!(dirty, vec![PhysAddr(0x8000), PhysAddr(0x9000)]);

        memory.restore_dirty_pages();
        assert!(memory.dirty_virtual_memory_range(VirtAddr(0x40_0800), 0x2000, CR3));
        let mut dirty: Vec<_> = memory.dirty_pages().collect();
        dirty.sort();
        assert_eq!(
            dirty,
            vec![PhysAddr(0x8000), PhysAddr(0x9000), PhysAddr(0xa000)]
        );
    }

    #[test]
    fn writes_go_to_private_copy() {
        let mut memory = Memory::new(snapshot());
        assert!(memory.write_phys_bytes(PhysAddr(0xbffe), &[0x41; 4]));

        let mut buf = [0; 4];
        assert!(memory.read_phys_bytes(PhysAddr(0xbffe), &mut buf));
        assert_eq!(buf, [0x41; 4]);

        // The snapshot itself is untouched
        assert_eq!(memory.snapshot().page(PhysAddr(0xb000)).unwrap()[0xffe], 0xb);
        assert_eq!(memory.snapshot().page(PhysAddr(0xc000)).unwrap()[0], 0xc);

        assert_eq!(memory.restore_dirty_pages(), 2);
        assert_eq!(memory.dirty_len(), 0);
        assert!(memory.read_phys_bytes(PhysAddr(0xbffe), &mut buf));
        assert_eq!(buf, [0xb, 0xb, 0xc, 0xc]);
    }

    #[test]
    fn reads_outside_snapshot_are_zero() {
        let mut memory = Memory::new(snapshot());
        let mut buf = [0xff; 4];
        assert!(!memory.read_phys_bytes(PhysAddr(0x10_0000), &mut buf));
        assert_eq!(buf, [0; 4]);
        assert!(!memory.write_phys_bytes(PhysAddr(0x10_0000), &buf));
        assert!(memory.phys_translate(PhysAddr(0x10_0000)).is_none());
    }

    #[test]
    fn virtual_reads_and_writes() {
        let mut memory = Memory::new(snapshot());
        memory
            .write_bytes_dirty(VirtAddr(0x40_0ffe), CR3, b"ABCD")
            .unwrap();

        let mut buf = [0; 4];
        memory.read_bytes(VirtAddr(0x40_0ffe), CR3, &mut buf).unwrap();
        assert_eq!(&buf, b"ABCD");
        assert!(memory.is_dirty(PhysAddr(0x8000)));
        assert!(memory.is_dirty(PhysAddr(0x9000)));

        assert!(memory.read_bytes(VirtAddr(0x50_0000), CR3, &mut buf).is_err());
        assert!(memory.read_bytes(VirtAddr(0x40_5000), CR3, &mut buf).is_err());
    }

    #[test]
    fn translation_cache_flush() {
        let mut memory = Memory::new(snapshot());
        let translation = memory
            .translate_cached(VirtAddr(0x40_3010), CR3, MemoryValidate::WRITE)
            .unwrap();
        assert_eq!(translation.phys_addr, PhysAddr(0xb010));

        // Unmap the page behind the cached translation
        assert!(memory.write_phys_bytes(PhysAddr(0x4000 + 3 * 8), &[0; 8]));
        assert!(memory
            .translate(VirtAddr(0x40_3010), CR3, MemoryValidate::READ)
            .is_ok());

        memory.flush_tlb_page(VirtAddr(0x40_3000));
        assert!(matches!(
            memory.translate(VirtAddr(0x40_3010), CR3, MemoryValidate::READ),
            Err(TranslationFault::NotPresent { level: 3, .. })
        ));
    }

    #[test]
    fn first_page_to_fault() {
        let mut memory = Memory::new(snapshot());
        assert_eq!(
            memory.get_first_virtual_page_to_fault(VirtAddr(0x40_0010), 0x2000, CR3),
            Some(VirtAddr(0x40_0000))
        );

        assert_eq!(
            memory.fault_in(VirtAddr(0x40_0010), CR3),
            FaultOutcome::PagedIn(PhysAddr(0x8000))
        );
        assert_eq!(
            memory.fault_in(VirtAddr(0x40_0010), CR3),
            FaultOutcome::Resident(PhysAddr(0x8000))
        );
        assert_eq!(
            memory.get_first_virtual_page_to_fault(VirtAddr(0x40_0010), 0x2000, CR3),
            Some(VirtAddr(0x40_1000))
        );

        memory.fault_in(VirtAddr(0x40_1000), CR3);
        memory.fault_in(VirtAddr(0x40_2000), CR3);
        assert_eq!(
            memory.get_first_virtual_page_to_fault(VirtAddr(0x40_0010), 0x2000, CR3),
            None
        );
    }

    #[test]
    fn fault_in_classification() {
        let mut memory = Memory::new(snapshot());
        assert!(matches!(
            memory.fault_in(VirtAddr(0x40_4000), CR3),
            FaultOutcome::GuestFault(TranslationFault::NotPresent { .. })
        ));
        assert_eq!(memory.fault_in(VirtAddr(0x40_5000), CR3), FaultOutcome::Unresolved);

        // cr3 pointing outside of the snapshot
        assert_eq!(
            memory.fault_in(VirtAddr(0x40_0000), Cr3(0x20_0000)),
            FaultOutcome::Unresolved
        );
    }
}
