//! Per-device stream state: PASID-to-Stage-1 map, optional shared Stage-2,
//! configuration, and the two-stage translation algorithm.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address_space::AddressSpace;
use crate::types::{
    AccessKind, Error, FaultMode, Ipa, Iova, Pa, Pasid, PagePermissions, PageSize, Result,
    SecurityDomain, PASID_MAX,
};

/// Per-stream configuration (spec.md §3/§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub translation_enabled: bool,
    pub stage1_enabled: bool,
    pub stage2_enabled: bool,
    pub fault_mode: FaultMode,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            translation_enabled: false,
            stage1_enabled: false,
            stage2_enabled: false,
            fault_mode: FaultMode::Terminate,
        }
    }
}

impl StreamConfig {
    /// Structural validity: if translation is enabled, at least one stage
    /// must be. Does not check PASID/AS state — that is `StreamContext`'s
    /// job, since it needs the PASID map to check it.
    fn validate_self(&self) -> Result<()> {
        if self.translation_enabled && !self.stage1_enabled && !self.stage2_enabled {
            return Err(Error::InvalidConfiguration);
        }
        Ok(())
    }
}

/// Per-PASID context descriptor (spec.md §3). Validated at configure-time;
/// not retained by the translation hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextDescriptor {
    pub asid: u32,
    pub ttbr0: Option<u64>,
    pub ttbr1: Option<u64>,
    pub granule: PageSize,
    pub input_size: u32,
    pub output_size: u32,
    pub domain: SecurityDomain,
}

impl ContextDescriptor {
    fn ttbr_aligned(ttbr: u64, granule: PageSize) -> bool {
        let shift = granule.shift();
        ttbr & ((1u64 << shift) - 1) == 0
    }

    /// Validates ASID width, at-least-one-valid-TTBR, TTBR alignment and
    /// output-size containment, granule support, and size ordering
    /// (spec.md §4.3 "Context-descriptor validation").
    pub fn validate(&self) -> Result<()> {
        if self.asid >= (1 << 16) {
            return Err(Error::ContextDescriptorFormatFault);
        }
        if self.ttbr0.is_none() && self.ttbr1.is_none() {
            return Err(Error::ContextDescriptorFormatFault);
        }
        for ttbr in [self.ttbr0, self.ttbr1].into_iter().flatten() {
            if !Self::ttbr_aligned(ttbr, self.granule) {
                return Err(Error::ContextDescriptorFormatFault);
            }
            if self.output_size < 64 && ttbr >= (1u64 << self.output_size) {
                return Err(Error::ContextDescriptorFormatFault);
            }
        }
        if self.output_size < self.input_size {
            return Err(Error::ContextDescriptorFormatFault);
        }
        if self.output_size == 32 && self.input_size != 32 {
            return Err(Error::ContextDescriptorFormatFault);
        }
        Ok(())
    }
}

/// Per-stream conformance-only descriptor (spec.md §4.3
/// "StreamTableEntry validation"). Not retained by the translation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTableEntry {
    pub cd_table_base: u64,
    pub cd_table_size: u32,
    pub fault_mode: FaultMode,
    pub domain: SecurityDomain,
    pub stage1_granule: PageSize,
    pub stage2_granule: PageSize,
    pub stage1_enabled: bool,
}

impl StreamTableEntry {
    /// Validates CD-table base/size and granule requirements when Stage-1
    /// is enabled.
    pub fn validate(&self) -> Result<()> {
        if self.stage1_enabled {
            if self.cd_table_base == 0 || self.cd_table_base % 64 != 0 {
                return Err(Error::ContextDescriptorFormatFault);
            }
            if self.cd_table_size == 0 {
                return Err(Error::ContextDescriptorFormatFault);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StreamStatistics {
    pub translation_count: u64,
    pub fault_count: u64,
    pub last_access_timestamp: u64,
}

struct Inner {
    pasid_map: HashMap<Pasid, Arc<AddressSpace>>,
    stage2: Option<Arc<AddressSpace>>,
    config: StreamConfig,
    enabled: bool,
    stats: StreamStatistics,
    clock: u64,
    max_pasids: usize,
    output_bits: u32,
    granule: PageSize,
}

/// One device stream's translation state (spec.md §4.3). Owned by
/// [`crate::engine::TranslationEngine`] behind the engine's map-lock; the
/// single internal mutex here protects the PASID map, configuration,
/// enabled flag, and statistics together, matching the §5 lock hierarchy
/// (one mutex per stream, acquired after the engine's map-lock and before
/// any `AddressSpace` lock).
pub struct StreamContext {
    inner: Mutex<Inner>,
}

/// Outcome of a stream-local translation, before the engine attributes a
/// fault to it.
pub struct StreamTranslation {
    pub pa: Pa,
    pub perms: PagePermissions,
    pub domain: SecurityDomain,
}

impl StreamContext {
    /// Creates a new, disabled stream context with an empty PASID map and
    /// no Stage-2 attached.
    pub fn new(output_bits: u32, granule: PageSize, max_pasids: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pasid_map: HashMap::new(),
                stage2: None,
                config: StreamConfig::default(),
                enabled: false,
                stats: StreamStatistics::default(),
                clock: 0,
                max_pasids: max_pasids.max(1),
                output_bits,
                granule,
            }),
        }
    }

    fn tick(inner: &mut Inner) -> u64 {
        let t = inner.clock;
        inner.clock += 1;
        t
    }

    // -- PASID management -------------------------------------------------

    /// Allocates a fresh Stage-1 address space for `pasid`.
    pub fn create_pasid(&self, pasid: Pasid) -> Result<()> {
        if pasid >= PASID_MAX {
            return Err(Error::InvalidPASID);
        }
        let mut inner = self.inner.lock();
        if inner.pasid_map.contains_key(&pasid) {
            return Err(Error::PASIDAlreadyExists);
        }
        if inner.pasid_map.len() >= inner.max_pasids {
            return Err(Error::PASIDLimitExceeded);
        }
        let granule = inner.granule;
        let bits = inner.output_bits;
        inner.pasid_map.insert(pasid, Arc::new(AddressSpace::new(granule, bits)));
        Ok(())
    }

    /// Attaches an externally provided Stage-1 address space, supporting
    /// shared address spaces across PASIDs. Invalid PASID is silently
    /// ignored (spec.md §9: asymmetry with `create_pasid` preserved for
    /// interface stability).
    pub fn add_pasid(&self, pasid: Pasid, space: Arc<AddressSpace>) {
        if pasid >= PASID_MAX {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.pasid_map.len() >= inner.max_pasids && !inner.pasid_map.contains_key(&pasid) {
            return;
        }
        inner.pasid_map.insert(pasid, space);
    }

    /// Drops the Stage-1 reference for `pasid`. Does not touch the TLB —
    /// that coordination happens at the engine level (spec.md §4.3/§4.5).
    pub fn remove_pasid(&self, pasid: Pasid) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.pasid_map.remove(&pasid).is_none() {
            Err(Error::PASIDNotFound)
        } else {
            Ok(())
        }
    }

    pub fn has_pasid(&self, pasid: Pasid) -> bool {
        self.inner.lock().pasid_map.contains_key(&pasid)
    }

    pub fn pasid_count(&self) -> usize {
        self.inner.lock().pasid_map.len()
    }

    pub fn clear_all_pasids(&self) {
        self.inner.lock().pasid_map.clear();
    }

    /// Attaches the shared Stage-2 address space for this stream.
    pub fn attach_stage2(&self, space: Arc<AddressSpace>) {
        self.inner.lock().stage2 = Some(space);
    }

    /// Whether a Stage-2 address space is currently attached.
    pub fn has_stage2(&self) -> bool {
        self.inner.lock().stage2.is_some()
    }

    /// Maps a page into `pasid`'s Stage-1 address space. `pasid` must
    /// already exist (via [`StreamContext::create_pasid`] or
    /// [`StreamContext::add_pasid`]).
    pub fn map_stage1_page(&self, pasid: Pasid, iova: Iova, pa: Pa, perms: PagePermissions, domain: SecurityDomain) -> Result<()> {
        let space = self.inner.lock().pasid_map.get(&pasid).cloned().ok_or(Error::PASIDNotFound)?;
        space.map_page(iova, pa, perms, domain)
    }

    pub fn unmap_stage1_page(&self, pasid: Pasid, iova: Iova) -> Result<()> {
        let space = self.inner.lock().pasid_map.get(&pasid).cloned().ok_or(Error::PASIDNotFound)?;
        space.unmap_page(iova)
    }

    /// Maps a page into this stream's shared Stage-2 address space. The
    /// space must already be attached via [`StreamContext::attach_stage2`].
    pub fn map_stage2_page(&self, ipa: Iova, pa: Pa, perms: PagePermissions, domain: SecurityDomain) -> Result<()> {
        let space = self.inner.lock().stage2.clone().ok_or(Error::PageNotMapped)?;
        space.map_page(ipa, pa, perms, domain)
    }

    // -- Configuration ------------------------------------------------------

    fn validate_against_pasids(cfg: &StreamConfig, inner: &Inner) -> Result<()> {
        cfg.validate_self()?;
        if cfg.stage1_enabled {
            for (pid, _) in inner.pasid_map.iter() {
                if *pid >= PASID_MAX {
                    return Err(Error::InvalidConfiguration);
                }
            }
        }
        // Stage-2 missing-AS is a translation-time fault, not a configuration
        // error (spec.md §3 cross-entity invariant).
        Ok(())
    }

    /// Full replace: validates first, applies on success.
    pub fn update_configuration(&self, cfg: StreamConfig) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::validate_against_pasids(&cfg, &inner)?;
        inner.config = cfg;
        Ok(())
    }

    /// Merge-then-validate-then-apply; a no-op if nothing differs.
    pub fn apply_configuration_changes(&self, changes: StreamConfigChanges) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut merged = inner.config;
        if let Some(v) = changes.translation_enabled {
            merged.translation_enabled = v;
        }
        if let Some(v) = changes.stage1_enabled {
            merged.stage1_enabled = v;
        }
        if let Some(v) = changes.stage2_enabled {
            merged.stage2_enabled = v;
        }
        if let Some(v) = changes.fault_mode {
            merged.fault_mode = v;
        }
        if merged == inner.config {
            return Ok(());
        }
        Self::validate_against_pasids(&merged, &inner)?;
        inner.config = merged;
        Ok(())
    }

    pub fn configuration(&self) -> StreamConfig {
        self.inner.lock().config
    }

    /// Enables the stream. Requires a currently-valid configuration with at
    /// least one stage enabled.
    pub fn enable(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.config.validate_self()?;
        if !inner.config.stage1_enabled && !inner.config.stage2_enabled {
            return Err(Error::ConfigurationError);
        }
        inner.enabled = true;
        Ok(())
    }

    pub fn disable(&self) {
        self.inner.lock().enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    pub fn statistics(&self) -> StreamStatistics {
        self.inner.lock().stats
    }

    pub fn reset_statistics(&self) {
        let mut inner = self.inner.lock();
        inner.stats = StreamStatistics::default();
    }

    // -- Translation ----------------------------------------------------

    /// The two-stage translation algorithm (spec.md §4.3, the eight-step
    /// pseudocode under "Translation algorithm").
    pub fn translate(&self, pasid: Pasid, iova: Iova, access: AccessKind, domain: SecurityDomain) -> Result<StreamTranslation> {
        let (config, stage1_space, stage2_space, enabled) = {
            let mut inner = self.inner.lock();
            inner.stats.translation_count += 1;
            inner.stats.last_access_timestamp = Self::tick(&mut inner);
            let config = inner.config;
            let stage1_space = inner.pasid_map.get(&pasid).cloned();
            let stage2_space = inner.stage2.clone();
            (config, stage1_space, stage2_space, inner.enabled)
        };

        if !config.stage1_enabled && !config.stage2_enabled {
            return Ok(StreamTranslation {
                pa: Pa::new(iova.value()),
                perms: PagePermissions::all(),
                domain,
            });
        }

        if config.translation_enabled && !enabled {
            self.bump_fault();
            return Err(Error::StreamDisabled);
        }

        if pasid >= PASID_MAX {
            self.bump_fault();
            return Err(Error::InvalidPASID);
        }

        let mut intermediate = iova.value();
        let mut perms = PagePermissions::all();

        if config.stage1_enabled {
            let as1 = match stage1_space {
                Some(space) => space,
                None => {
                    self.bump_fault();
                    return Err(Error::PageNotMapped);
                }
            };
            match as1.translate_page(Iova::new(intermediate), access, domain) {
                Ok(t) => {
                    intermediate = t.pa.value();
                    perms &= t.perms;
                }
                Err(e) => {
                    self.bump_fault();
                    return Err(e);
                }
            }
        }

        if config.stage2_enabled {
            let as2 = match stage2_space {
                Some(space) => space,
                None => {
                    self.bump_fault();
                    return Err(Error::PageNotMapped);
                }
            };
            match as2.translate_page(Ipa::new(intermediate).into(), access, domain) {
                Ok(t) => {
                    perms &= t.perms;
                    return Ok(StreamTranslation { pa: t.pa, perms, domain: t.domain });
                }
                Err(e) => {
                    self.bump_fault();
                    return Err(e);
                }
            }
        }

        Ok(StreamTranslation { pa: Pa::new(intermediate), perms, domain })
    }

    fn bump_fault(&self) {
        self.inner.lock().stats.fault_count += 1;
    }
}

/// A sparse patch applied by [`StreamContext::apply_configuration_changes`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamConfigChanges {
    pub translation_enabled: Option<bool>,
    pub stage1_enabled: Option<bool>,
    pub stage2_enabled: Option<bool>,
    pub fault_mode: Option<FaultMode>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SecurityDomain;

    #[test]
    fn identity_mapping_when_no_stage_enabled() {
        let ctx = StreamContext::new(48, PageSize::Size4K, 16);
        let t = ctx.translate(0, Iova::new(0x1234), AccessKind::Read, SecurityDomain::NonSecure).unwrap();
        assert_eq!(t.pa.value(), 0x1234);
    }

    #[test]
    fn pasid_zero_accepted() {
        let ctx = StreamContext::new(48, PageSize::Size4K, 16);
        ctx.create_pasid(0).unwrap();
        ctx.update_configuration(StreamConfig {
            translation_enabled: true,
            stage1_enabled: true,
            stage2_enabled: false,
            fault_mode: FaultMode::Terminate,
        })
        .unwrap();
        ctx.enable().unwrap();
        assert!(ctx.has_pasid(0));
    }

    #[test]
    fn disabled_stream_faults_when_translation_enabled() {
        let ctx = StreamContext::new(48, PageSize::Size4K, 16);
        ctx.create_pasid(1).unwrap();
        ctx.update_configuration(StreamConfig {
            translation_enabled: true,
            stage1_enabled: true,
            stage2_enabled: false,
            fault_mode: FaultMode::Terminate,
        })
        .unwrap();
        // not enabled
        let err = ctx.translate(1, Iova::new(0x1000), AccessKind::Read, SecurityDomain::NonSecure);
        assert_eq!(err.err(), Some(Error::StreamDisabled));
    }

    #[test]
    fn two_stage_composes_and_intersects_permissions() {
        let ctx = StreamContext::new(48, PageSize::Size4K, 16);
        ctx.create_pasid(1).unwrap();
        let stage2 = Arc::new(AddressSpace::new(PageSize::Size4K, 48));
        stage2
            .map_page(Iova::new(0x2000000), Pa::new(0x3000000), PagePermissions::READ, SecurityDomain::NonSecure)
            .unwrap();
        ctx.attach_stage2(stage2);
        ctx.update_configuration(StreamConfig {
            translation_enabled: true,
            stage1_enabled: true,
            stage2_enabled: true,
            fault_mode: FaultMode::Terminate,
        })
        .unwrap();
        ctx.enable().unwrap();

        // Fetch stage-1 space via create_pasid, map it directly through add_pasid path.
        let as1 = Arc::new(AddressSpace::new(PageSize::Size4K, 48));
        as1.map_page(
            Iova::new(0x1000000),
            Pa::new(0x2000000),
            PagePermissions::READ | PagePermissions::WRITE,
            SecurityDomain::NonSecure,
        )
        .unwrap();
        ctx.add_pasid(1, as1);

        let t = ctx.translate(1, Iova::new(0x1000040), AccessKind::Read, SecurityDomain::NonSecure).unwrap();
        assert_eq!(t.pa.value(), 0x3000040);
        // Stage-1 grants R+W, Stage-2 grants R only: intersection is R only.
        assert!(t.perms.contains(PagePermissions::READ));
        assert!(!t.perms.contains(PagePermissions::WRITE));
    }

    #[test]
    fn missing_stage2_at_translate_time_is_translation_fault_not_config_error() {
        let ctx = StreamContext::new(48, PageSize::Size4K, 16);
        ctx.create_pasid(1).unwrap();
        ctx.update_configuration(StreamConfig {
            translation_enabled: true,
            stage1_enabled: false,
            stage2_enabled: true,
            fault_mode: FaultMode::Terminate,
        })
        .unwrap();
        ctx.enable().unwrap();
        let err = ctx.translate(1, Iova::new(0x1000), AccessKind::Read, SecurityDomain::NonSecure);
        assert_eq!(err.err(), Some(Error::PageNotMapped));
    }

    #[test]
    fn context_descriptor_requires_one_valid_ttbr() {
        let cd = ContextDescriptor {
            asid: 1,
            ttbr0: None,
            ttbr1: None,
            granule: PageSize::Size4K,
            input_size: 48,
            output_size: 48,
            domain: SecurityDomain::NonSecure,
        };
        assert_eq!(cd.validate(), Err(Error::ContextDescriptorFormatFault));
    }

    #[test]
    fn context_descriptor_checks_ttbr_alignment() {
        let cd = ContextDescriptor {
            asid: 1,
            ttbr0: Some(0x1001), // not 4K-aligned
            ttbr1: None,
            granule: PageSize::Size4K,
            input_size: 48,
            output_size: 48,
            domain: SecurityDomain::NonSecure,
        };
        assert_eq!(cd.validate(), Err(Error::ContextDescriptorFormatFault));
    }

    #[test]
    fn stream_table_entry_requires_aligned_nonzero_cd_table_base() {
        let ste = StreamTableEntry {
            cd_table_base: 0,
            cd_table_size: 16,
            fault_mode: FaultMode::Terminate,
            domain: SecurityDomain::NonSecure,
            stage1_granule: PageSize::Size4K,
            stage2_granule: PageSize::Size4K,
            stage1_enabled: true,
        };
        assert_eq!(ste.validate(), Err(Error::ContextDescriptorFormatFault));
    }
}
