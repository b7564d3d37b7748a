//! Sparse per-stage page table.
//!
//! An [`AddressSpace`] holds the authoritative mapping for exactly one
//! translation stage of one PASID (Stage-1) or of one shared Stage-2 context.
//! There is no descriptor-hierarchy walk here (spec Non-goals): the sparse
//! map keyed by page number *is* the model.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::{AccessKind, Error, Iova, Pa, PagePermissions, PageSize, Result, SecurityDomain};

/// One mapped page: physical frame, permissions, and security domain.
/// `valid` is always `true` for entries present in the map — an invalid
/// entry is simply absent, but the flag is kept in the struct to mirror the
/// spec's data model and to let callers hold a `PageEntry` snapshot that
/// self-describes as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEntry {
    pub pa: Pa,
    pub perms: PagePermissions,
    pub domain: SecurityDomain,
    pub valid: bool,
}

/// The result of a single-page translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub pa: Pa,
    pub perms: PagePermissions,
    pub domain: SecurityDomain,
}

/// An ascending, non-overlapping mapped range, in pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRange {
    pub start: Iova,
    pub end_exclusive: Iova,
}

struct Inner {
    granule: PageSize,
    output_bits: u32,
    entries: HashMap<u64, PageEntry>,
}

/// One translation stage's sparse page table. Shared ownership is intrinsic
/// to the model: a single Stage-2 [`AddressSpace`] may be attached to many
/// [`crate::stream::StreamContext`]s, and a Stage-1 [`AddressSpace`] may be
/// shared across PASIDs via `addPASID`. Callers hold this behind `Arc` (see
/// `crate::stream`); the lock here only serializes concurrent mutation
/// against concurrent reads per-instance, matching the §5 lock hierarchy
/// (AddressSpace lock is acquired after the context lock, before the TLB
/// lock).
pub struct AddressSpace {
    inner: RwLock<Inner>,
}

impl AddressSpace {
    /// Creates an empty address space with the given granule and output
    /// (physical) address width in bits.
    pub fn new(granule: PageSize, output_bits: u32) -> Self {
        Self {
            inner: RwLock::new(Inner {
                granule,
                output_bits,
                entries: HashMap::new(),
            }),
        }
    }

    fn validate_addr(value: u64, bits: u32) -> Result<()> {
        if bits < 64 && value >= (1u64 << bits) {
            Err(Error::InvalidAddress)
        } else {
            Ok(())
        }
    }

    /// Maps a single page. Replacing an existing entry is allowed.
    pub fn map_page(&self, iova: Iova, pa: Pa, perms: PagePermissions, domain: SecurityDomain) -> Result<()> {
        let mut inner = self.inner.write();
        let bits = inner.output_bits;
        Self::validate_addr(iova.value(), bits)?;
        Self::validate_addr(pa.value(), bits)?;
        if perms.is_empty_perm() {
            return Err(Error::InvalidPermissions);
        }
        let shift = inner.granule.shift();
        let page = iova.page_number(shift);
        let pa_aligned = pa.page_align(shift);
        inner.entries.insert(
            page,
            PageEntry {
                pa: pa_aligned,
                perms,
                domain,
                valid: true,
            },
        );
        Ok(())
    }

    /// Maps every 4 KiB-granule-sized page in `[start_iova, end_iova)` to
    /// the matching offset from `start_pa`. Fails without mutating state if
    /// the range is malformed, misaligned, permissions are empty, or
    /// `start_pa + size` would overflow.
    pub fn map_range(
        &self,
        start_iova: Iova,
        end_iova: Iova,
        start_pa: Pa,
        perms: PagePermissions,
        domain: SecurityDomain,
    ) -> Result<()> {
        if perms.is_empty_perm() {
            return Err(Error::InvalidPermissions);
        }
        if end_iova.value() <= start_iova.value() {
            return Err(Error::InvalidAddress);
        }
        let mut inner = self.inner.write();
        let bits = inner.output_bits;
        let shift = inner.granule.shift();
        let page_bytes = 1u64 << shift;

        if start_iova.value() % page_bytes != 0 || end_iova.value() % page_bytes != 0 {
            return Err(Error::InvalidAddress);
        }
        let size = end_iova.value() - start_iova.value();
        let end_pa = start_pa
            .value()
            .checked_add(size)
            .ok_or(Error::InvalidAddress)?;
        Self::validate_addr(start_iova.value(), bits)?;
        Self::validate_addr(end_iova.value() - 1, bits)?;
        Self::validate_addr(start_pa.value(), bits)?;
        Self::validate_addr(end_pa - 1, bits)?;

        let mut page = start_iova.value();
        let mut pa = start_pa.value();
        while page < end_iova.value() {
            inner.entries.insert(
                page >> shift,
                PageEntry {
                    pa: Pa::new(pa),
                    perms,
                    domain,
                    valid: true,
                },
            );
            page += page_bytes;
            pa += page_bytes;
        }
        Ok(())
    }

    /// Bulk map. Validates every input before mutating anything (fail-fast,
    /// all-or-nothing).
    pub fn map_pages(
        &self,
        mappings: &[(Iova, Pa, PagePermissions, SecurityDomain)],
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let bits = inner.output_bits;
        let shift = inner.granule.shift();
        for (iova, pa, perms, _domain) in mappings {
            Self::validate_addr(iova.value(), bits)?;
            Self::validate_addr(pa.value(), bits)?;
            if perms.is_empty_perm() {
                return Err(Error::InvalidPermissions);
            }
        }
        inner.entries.reserve(mappings.len());
        for (iova, pa, perms, domain) in mappings {
            let page = iova.page_number(shift);
            inner.entries.insert(
                page,
                PageEntry {
                    pa: pa.page_align(shift),
                    perms: *perms,
                    domain: *domain,
                    valid: true,
                },
            );
        }
        Ok(())
    }

    /// Removes a single page's mapping.
    pub fn unmap_page(&self, iova: Iova) -> Result<()> {
        let mut inner = self.inner.write();
        let bits = inner.output_bits;
        Self::validate_addr(iova.value(), bits)?;
        let shift = inner.granule.shift();
        let page = iova.page_number(shift);
        if inner.entries.remove(&page).is_none() {
            Err(Error::PageNotMapped)
        } else {
            Ok(())
        }
    }

    /// Bulk unmap. Validates all inputs first; fails fast if any page is
    /// unmapped, leaving the map unchanged.
    pub fn unmap_pages(&self, iovas: &[Iova]) -> Result<()> {
        let mut inner = self.inner.write();
        let bits = inner.output_bits;
        let shift = inner.granule.shift();
        for iova in iovas {
            Self::validate_addr(iova.value(), bits)?;
            if !inner.entries.contains_key(&iova.page_number(shift)) {
                return Err(Error::PageNotMapped);
            }
        }
        for iova in iovas {
            inner.entries.remove(&iova.page_number(shift));
        }
        Ok(())
    }

    /// Removes every page mapping in `[start_iova, end_iova)`. Requires at
    /// least one page in the range to have been mapped.
    pub fn unmap_range(&self, start_iova: Iova, end_iova: Iova) -> Result<()> {
        if end_iova.value() <= start_iova.value() {
            return Err(Error::InvalidAddress);
        }
        let mut inner = self.inner.write();
        let bits = inner.output_bits;
        Self::validate_addr(start_iova.value(), bits)?;
        Self::validate_addr(end_iova.value() - 1, bits)?;
        let shift = inner.granule.shift();
        let page_bytes = 1u64 << shift;
        let start_page = start_iova.page_align(shift).value();
        let mut page = start_page;
        let mut removed_any = false;
        while page < end_iova.value() {
            if inner.entries.remove(&(page >> shift)).is_some() {
                removed_any = true;
            }
            page += page_bytes;
        }
        if removed_any {
            Ok(())
        } else {
            Err(Error::PageNotMapped)
        }
    }

    /// Translates a single IOVA. Check ordering is fixed: existence, then
    /// validity, then security-domain match, then permission match. The
    /// returned PA carries the IOVA's in-page offset OR'd onto the stored
    /// page-aligned PA.
    pub fn translate_page(
        &self,
        iova: Iova,
        access: AccessKind,
        domain: SecurityDomain,
    ) -> Result<Translation> {
        let inner = self.inner.read();
        let shift = inner.granule.shift();
        let page = iova.page_number(shift);
        let entry = inner.entries.get(&page).ok_or(Error::TranslationFault)?;
        if !entry.valid {
            return Err(Error::TranslationFault);
        }
        if entry.domain != domain {
            return Err(Error::SecurityFault);
        }
        if !entry.perms.admits(access) {
            return Err(Error::PermissionFault);
        }
        let offset = iova.page_offset(shift);
        Ok(Translation {
            pa: Pa::new(entry.pa.value() | offset),
            perms: entry.perms,
            domain: entry.domain,
        })
    }

    /// Whether a page is currently mapped.
    pub fn is_page_mapped(&self, iova: Iova) -> bool {
        let inner = self.inner.read();
        let shift = inner.granule.shift();
        inner.entries.contains_key(&iova.page_number(shift))
    }

    /// The stored permissions for a mapped page, if any.
    pub fn page_permissions(&self, iova: Iova) -> Option<PagePermissions> {
        let inner = self.inner.read();
        let shift = inner.granule.shift();
        inner.entries.get(&iova.page_number(shift)).map(|e| e.perms)
    }

    /// Number of mapped pages.
    pub fn page_count(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Ascending, non-overlapping, coalesced ranges of contiguous mapped
    /// pages.
    pub fn mapped_ranges(&self) -> Vec<MappedRange> {
        let inner = self.inner.read();
        let shift = inner.granule.shift();
        let mut pages: Vec<u64> = inner.entries.keys().copied().collect();
        pages.sort_unstable();
        let mut ranges = Vec::new();
        let mut iter = pages.into_iter();
        if let Some(first) = iter.next() {
            let mut start = first;
            let mut prev = first;
            for page in iter {
                if page == prev + 1 {
                    prev = page;
                    continue;
                }
                ranges.push(MappedRange {
                    start: Iova::new(start << shift),
                    end_exclusive: Iova::new((prev + 1) << shift),
                });
                start = page;
                prev = page;
            }
            ranges.push(MappedRange {
                start: Iova::new(start << shift),
                end_exclusive: Iova::new((prev + 1) << shift),
            });
        }
        ranges
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.inner.write().entries.clear();
    }

    /// Whether any valid entry falls in `[start, end)`.
    pub fn has_overlapping_mappings(&self, start: Iova, end: Iova) -> bool {
        if end.value() <= start.value() {
            return false;
        }
        let inner = self.inner.read();
        let shift = inner.granule.shift();
        let start_page = start.page_number(shift);
        let end_page = Iova::new(end.value() - 1).page_number(shift);
        (start_page..=end_page).any(|p| inner.entries.contains_key(&p))
    }

    /// The configured granule.
    pub fn granule(&self) -> PageSize {
        self.inner.read().granule
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> AddressSpace {
        AddressSpace::new(PageSize::Size4K, 48)
    }

    #[test]
    fn map_and_translate_roundtrip() {
        let s = space();
        s.map_page(
            Iova::new(0x100000),
            Pa::new(0x200000),
            PagePermissions::READ | PagePermissions::WRITE,
            SecurityDomain::NonSecure,
        )
        .unwrap();
        let t = s
            .translate_page(Iova::new(0x100ABC), AccessKind::Read, SecurityDomain::NonSecure)
            .unwrap();
        assert_eq!(t.pa.value(), 0x200ABC);
    }

    #[test]
    fn permission_exhaustiveness() {
        let s = space();
        s.map_page(
            Iova::new(0x1000),
            Pa::new(0x2000),
            PagePermissions::READ,
            SecurityDomain::NonSecure,
        )
        .unwrap();
        assert!(s
            .translate_page(Iova::new(0x1000), AccessKind::Read, SecurityDomain::NonSecure)
            .is_ok());
        assert_eq!(
            s.translate_page(Iova::new(0x1000), AccessKind::Write, SecurityDomain::NonSecure),
            Err(Error::PermissionFault)
        );
    }

    #[test]
    fn security_mismatch_faults() {
        let s = space();
        s.map_page(Iova::new(0x1000), Pa::new(0x2000), PagePermissions::READ, SecurityDomain::Secure)
            .unwrap();
        assert_eq!(
            s.translate_page(Iova::new(0x1000), AccessKind::Read, SecurityDomain::NonSecure),
            Err(Error::SecurityFault)
        );
    }

    #[test]
    fn unmapped_page_is_translation_fault() {
        let s = space();
        assert_eq!(
            s.translate_page(Iova::new(0x5000), AccessKind::Read, SecurityDomain::NonSecure),
            Err(Error::TranslationFault)
        );
    }

    #[test]
    fn empty_permissions_rejected() {
        let s = space();
        assert_eq!(
            s.map_page(Iova::new(0x1000), Pa::new(0x2000), PagePermissions::empty(), SecurityDomain::NonSecure),
            Err(Error::InvalidPermissions)
        );
    }

    #[test]
    fn map_range_covers_every_page() {
        let s = space();
        s.map_range(
            Iova::new(0x1000),
            Iova::new(0x4000),
            Pa::new(0x10000),
            PagePermissions::READ,
            SecurityDomain::NonSecure,
        )
        .unwrap();
        assert_eq!(s.page_count(), 3);
        assert!(s.is_page_mapped(Iova::new(0x1000)));
        assert!(s.is_page_mapped(Iova::new(0x2000)));
        assert!(s.is_page_mapped(Iova::new(0x3000)));
    }

    #[test]
    fn map_range_overflow_rejected() {
        let s = space();
        let err = s.map_range(
            Iova::new(0x1000),
            Iova::new(0x3000),
            Pa::new(u64::MAX - 0x500),
            PagePermissions::READ,
            SecurityDomain::NonSecure,
        );
        assert_eq!(err, Err(Error::InvalidAddress));
    }

    #[test]
    fn unmap_range_requires_one_mapped_page() {
        let s = space();
        assert_eq!(
            s.unmap_range(Iova::new(0x1000), Iova::new(0x3000)),
            Err(Error::PageNotMapped)
        );
    }

    #[test]
    fn mapped_ranges_coalesce() {
        let s = space();
        s.map_page(Iova::new(0x1000), Pa::new(0x1000), PagePermissions::READ, SecurityDomain::NonSecure).unwrap();
        s.map_page(Iova::new(0x2000), Pa::new(0x2000), PagePermissions::READ, SecurityDomain::NonSecure).unwrap();
        s.map_page(Iova::new(0x5000), Pa::new(0x5000), PagePermissions::READ, SecurityDomain::NonSecure).unwrap();
        let ranges = s.mapped_ranges();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start.value(), 0x1000);
        assert_eq!(ranges[0].end_exclusive.value(), 0x3000);
        assert_eq!(ranges[1].start.value(), 0x5000);
        assert_eq!(ranges[1].end_exclusive.value(), 0x6000);
    }

    #[test]
    fn replacing_existing_mapping_is_allowed() {
        let s = space();
        s.map_page(Iova::new(0x1000), Pa::new(0x2000), PagePermissions::READ, SecurityDomain::NonSecure).unwrap();
        s.map_page(Iova::new(0x1000), Pa::new(0x3000), PagePermissions::READ, SecurityDomain::NonSecure).unwrap();
        let t = s.translate_page(Iova::new(0x1000), AccessKind::Read, SecurityDomain::NonSecure).unwrap();
        assert_eq!(t.pa.value(), 0x3000);
    }

    #[test]
    fn has_overlapping_mappings_scans_range() {
        let s = space();
        assert!(!s.has_overlapping_mappings(Iova::new(0), Iova::new(0x4000)));
        s.map_page(Iova::new(0x2000), Pa::new(0x2000), PagePermissions::READ, SecurityDomain::NonSecure).unwrap();
        assert!(s.has_overlapping_mappings(Iova::new(0), Iova::new(0x4000)));
    }
}
