//! The top-level SMMU controller: owns every stream, the shared TLB, the
//! fault queue, and the engine configuration, and exposes the public
//! translate/configure/invalidate surface (spec.md §4.5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::address_space::AddressSpace;
use crate::config::EngineConfig;
use crate::fault::{FaultQueue, FaultRecord, FaultStatistics, Syndrome};
use crate::stream::{ContextDescriptor, StreamConfig, StreamConfigChanges, StreamContext, StreamStatistics, StreamTableEntry};
use crate::tlb::{Tlb, TlbEntry, TlbStatistics};
use crate::types::{
    AccessKind, Error, FaultLevel, FaultType, Iova, Pa, Pasid, PagePermissions, PageSize, Result, SecurityDomain, Stage,
    StreamId, STREAM_ID_MAX,
};

struct Inner {
    streams: HashMap<StreamId, Arc<StreamContext>>,
    config: EngineConfig,
    granule: PageSize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStatistics {
    pub stream_count: usize,
    pub total_translations: u64,
    pub total_faults: u64,
}

/// The whole SMMUv3 model. Create one per simulated device topology; streams
/// are created lazily on the first [`TranslationEngine::configure_stream`]
/// call for a given `StreamId`.
pub struct TranslationEngine {
    inner: RwLock<Inner>,
    tlb: Tlb,
    faults: FaultQueue,
    translations: AtomicU64,
}

impl TranslationEngine {
    /// Builds an engine from a validated [`EngineConfig`].
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let tlb_size = config.tlb_cache_size as usize;
        let queue_size = config.event_queue_size as usize;
        Ok(Self {
            inner: RwLock::new(Inner {
                streams: HashMap::new(),
                config,
                granule: PageSize::Size4K,
            }),
            tlb: Tlb::new(tlb_size),
            faults: FaultQueue::new(queue_size),
            translations: AtomicU64::new(0),
        })
    }

    /// Builds an engine from the named `Default` profile.
    pub fn with_default_profile() -> Self {
        Self::new(EngineConfig::profile_default()).expect("default profile always validates")
    }

    /// The page granule used for every `AddressSpace` this engine creates.
    /// Changing it does not retroactively resize already-created streams.
    pub fn set_granule(&self, granule: PageSize) {
        self.inner.write().granule = granule;
    }

    pub fn granule(&self) -> PageSize {
        self.inner.read().granule
    }

    pub fn configuration(&self) -> EngineConfig {
        self.inner.read().config
    }

    /// Replaces the engine-wide configuration. Does not retroactively resize
    /// the TLB or fault queue — call [`TranslationEngine::set_max_queue_size`]
    /// / [`TranslationEngine::set_max_cache_size`] for that.
    pub fn reconfigure(&self, config: EngineConfig) -> Result<()> {
        config.validate()?;
        self.inner.write().config = config;
        Ok(())
    }

    fn stream_output_bits(&self) -> u32 {
        self.inner.read().config.max_pa_size
    }

    /// Range-checks `sid` against the type-level StreamID width. The
    /// engine-wide `max_stream_count` is a capacity limit on how many
    /// distinct streams may be configured at once (`StreamLimitExceeded`,
    /// enforced in `configure_stream`), not a bound on which `StreamId`
    /// values are well-formed.
    fn check_sid(&self, sid: StreamId) -> Result<()> {
        if sid >= STREAM_ID_MAX {
            return Err(Error::InvalidStreamID);
        }
        Ok(())
    }

    fn stream(&self, sid: StreamId) -> Result<Arc<StreamContext>> {
        self.inner.read().streams.get(&sid).cloned().ok_or(Error::StreamNotConfigured)
    }

    // -- Configuration surface -----------------------------------------

    /// Creates the stream on first use (up to `max_stream_count`) and
    /// applies `cfg`. Subsequent calls on an existing stream just replace
    /// its configuration.
    pub fn configure_stream(&self, sid: StreamId, cfg: StreamConfig) -> Result<()> {
        self.check_sid(sid)?;
        let ctx = {
            let mut inner = self.inner.write();
            if !inner.streams.contains_key(&sid) {
                if inner.streams.len() >= inner.config.max_stream_count as usize {
                    return Err(Error::StreamLimitExceeded);
                }
                let bits = inner.config.max_pa_size;
                let granule = inner.granule;
                let max_pasids = inner.config.max_pasid_count as usize;
                inner.streams.insert(sid, Arc::new(StreamContext::new(bits, granule, max_pasids)));
            }
            inner.streams.get(&sid).cloned().unwrap()
        };
        ctx.update_configuration(cfg)?;
        log::debug!("stream {sid} configured: {cfg:?}");
        Ok(())
    }

    /// Merge-patches an existing stream's configuration.
    pub fn apply_configuration_changes(&self, sid: StreamId, changes: StreamConfigChanges) -> Result<()> {
        self.stream(sid)?.apply_configuration_changes(changes)
    }

    pub fn stream_configuration(&self, sid: StreamId) -> Result<StreamConfig> {
        Ok(self.stream(sid)?.configuration())
    }

    pub fn enable_stream(&self, sid: StreamId) -> Result<()> {
        self.stream(sid)?.enable()
    }

    pub fn disable_stream(&self, sid: StreamId) -> Result<()> {
        self.stream(sid)?.disable();
        Ok(())
    }

    pub fn is_stream_enabled(&self, sid: StreamId) -> Result<bool> {
        Ok(self.stream(sid)?.is_enabled())
    }

    /// Validates a [`ContextDescriptor`] against the documented rules
    /// without attaching it to any stream — conformance checking only.
    pub fn validate_context_descriptor(&self, cd: &ContextDescriptor) -> Result<()> {
        cd.validate()
    }

    /// Validates a [`StreamTableEntry`] without attaching it — conformance
    /// checking only.
    pub fn validate_stream_table_entry(&self, ste: &StreamTableEntry) -> Result<()> {
        ste.validate()
    }

    // -- PASID / mapping surface ----------------------------------------

    pub fn create_stream_pasid(&self, sid: StreamId, pasid: Pasid) -> Result<()> {
        self.stream(sid)?.create_pasid(pasid)
    }

    pub fn remove_stream_pasid(&self, sid: StreamId, pasid: Pasid) -> Result<()> {
        self.stream(sid)?.remove_pasid(pasid)?;
        self.tlb.invalidate_pasid(sid, pasid);
        Ok(())
    }

    pub fn has_stream_pasid(&self, sid: StreamId, pasid: Pasid) -> Result<bool> {
        Ok(self.stream(sid)?.has_pasid(pasid))
    }

    pub fn stream_pasid_count(&self, sid: StreamId) -> Result<usize> {
        Ok(self.stream(sid)?.pasid_count())
    }

    pub fn clear_stream_pasids(&self, sid: StreamId) -> Result<()> {
        self.stream(sid)?.clear_all_pasids();
        self.tlb.invalidate_stream(sid);
        Ok(())
    }

    /// Invalidates the cached entry for `(sid, pasid, page)` under every
    /// security domain. A page's stored domain can change across a remap
    /// (`map_page` replaces an existing entry per §4.1), and the single-key
    /// TLB invalidation is keyed on domain too, so a remap that only
    /// invalidates the new domain would leave a stale entry cached under the
    /// old one — exactly the `unmap_page` case already had to handle.
    fn invalidate_page_all_domains(&self, sid: StreamId, pasid: Pasid, page: u64) {
        self.tlb.invalidate(sid, pasid, page, SecurityDomain::NonSecure);
        self.tlb.invalidate(sid, pasid, page, SecurityDomain::Secure);
        self.tlb.invalidate(sid, pasid, page, SecurityDomain::Realm);
    }

    /// Maps a Stage-1 page for `(sid, pasid)`. `pasid` must already have
    /// been created via [`TranslationEngine::create_stream_pasid`].
    pub fn map_page(&self, sid: StreamId, pasid: Pasid, iova: Iova, pa: Pa, perms: PagePermissions, domain: SecurityDomain) -> Result<()> {
        let ctx = self.stream(sid)?;
        ctx.map_stage1_page(pasid, iova, pa, perms, domain)?;
        let page = iova.page_number(self.inner.read().granule.shift());
        self.invalidate_page_all_domains(sid, pasid, page);
        Ok(())
    }

    pub fn unmap_page(&self, sid: StreamId, pasid: Pasid, iova: Iova) -> Result<()> {
        let ctx = self.stream(sid)?;
        ctx.unmap_stage1_page(pasid, iova)?;
        let page = iova.page_number(self.inner.read().granule.shift());
        self.invalidate_page_all_domains(sid, pasid, page);
        Ok(())
    }

    /// Attaches a freshly created Stage-2 address space to `sid` via the
    /// named entry point (spec.md §9 Open Question, resolved in DESIGN.md).
    pub fn attach_stage2(&self, sid: StreamId) -> Result<()> {
        let ctx = self.stream(sid)?;
        let bits = self.stream_output_bits();
        let granule = self.granule();
        ctx.attach_stage2(Arc::new(AddressSpace::new(granule, bits)));
        Ok(())
    }

    /// Maps a Stage-2 page for `sid` through the dedicated entry point. An
    /// equivalent effect is reachable via `map_page(sid, 0, ...)` once a
    /// Stage-2 address space has been attached under PASID 0 convention;
    /// this method is the named alternative spec.md §9 calls out.
    pub fn map_stage2_page(&self, sid: StreamId, ipa: Iova, pa: Pa, perms: PagePermissions, domain: SecurityDomain) -> Result<()> {
        let ctx = self.stream(sid)?;
        if !ctx.has_stage2() {
            self.attach_stage2(sid)?;
        }
        let ctx = self.stream(sid)?;
        ctx.map_stage2_page(ipa, pa, perms, domain)?;
        self.tlb.invalidate_stream(sid);
        Ok(())
    }

    // -- Translation ------------------------------------------------------

    /// Translates one access. TLB hit re-checks permissions against the
    /// cached entry before trusting it — a cache hit never bypasses the
    /// permission check, only the Stage-1/Stage-2 walk (spec.md §8 Scenario
    /// F). On miss, dispatches to the stream's two-stage algorithm, inserts
    /// the result on success, and records an attributed fault on failure.
    pub fn translate(&self, sid: StreamId, pasid: Pasid, iova: Iova, access: AccessKind, domain: SecurityDomain) -> Result<Pa> {
        self.check_sid(sid)?;
        if pasid >= crate::types::PASID_MAX {
            return Err(Error::InvalidPASID);
        }
        self.translations.fetch_add(1, Ordering::Relaxed);

        let granule = self.granule();
        let shift = granule.shift();
        let page = iova.page_number(shift);
        let offset = iova.page_offset(shift);

        if let Ok(cached) = self.tlb.lookup(sid, pasid, page, domain) {
            if cached.perms.admits(access) {
                log::trace!("tlb hit sid={sid} pasid={pasid} page={page:#x}");
                return Ok(Pa::new((cached.pa_page << shift) | offset));
            }
            // Stage is read off the cached entry, not the stream's config, so
            // a permission fault on a hit never touches the per-stream lock.
            self.record_permission_fault(sid, pasid, iova.value(), access, cached.stage, domain);
            return Err(Error::PermissionFault);
        }

        let ctx = self.stream(sid)?;
        let stage = Self::stage_for_config(ctx.configuration());
        match ctx.translate(pasid, iova, access, domain) {
            Ok(t) => {
                self.tlb.insert(TlbEntry {
                    sid,
                    pasid,
                    iova_page: page,
                    pa_page: t.pa.page_number(shift),
                    perms: t.perms,
                    domain: t.domain,
                    valid: true,
                    timestamp: 0,
                    stage,
                });
                Ok(t.pa)
            }
            Err(err) => {
                self.record_fault_for_error(sid, pasid, iova.value(), access, stage, domain, err);
                Err(err)
            }
        }
    }

    /// Maps a stream's enabled-stage combination onto the syndrome/fault
    /// `Stage` tag (spec.md §4.5 step 5: "the stage ... based on which stage
    /// rejected"). With both stages enabled the fault is attributed to
    /// `BothStages` regardless of which one actually rejected the access —
    /// the three-variant enum carries no finer distinction than that.
    fn stage_for_config(cfg: StreamConfig) -> Stage {
        match (cfg.stage1_enabled, cfg.stage2_enabled) {
            (true, true) => Stage::BothStages,
            (false, true) => Stage::Stage2Only,
            _ => Stage::Stage1Only,
        }
    }

    fn record_permission_fault(&self, sid: StreamId, pasid: Pasid, address: u64, access: AccessKind, stage: Stage, domain: SecurityDomain) {
        self.faults.record_permission_fault(sid, pasid, address, access, stage, domain);
    }

    fn record_fault_for_error(&self, sid: StreamId, pasid: Pasid, address: u64, access: AccessKind, stage: Stage, domain: SecurityDomain, err: Error) {
        let Some(fault_type) = err.as_fault_type() else {
            return;
        };
        let level = match fault_type {
            FaultType::Level0TranslationFault => FaultLevel::Level0,
            FaultType::Level2TranslationFault => FaultLevel::Level2,
            FaultType::Level3TranslationFault => FaultLevel::Level3,
            _ => FaultLevel::Level1,
        };
        let syndrome = Syndrome::build(fault_type, pasid, stage, level, access, 0);
        self.faults.record_fault(FaultRecord {
            sid,
            pasid,
            address,
            access,
            fault_type,
            stage,
            level,
            syndrome,
            domain,
            timestamp: 0,
        });
    }

    // -- Invalidation surface ---------------------------------------------

    pub fn invalidate_page(&self, sid: StreamId, pasid: Pasid, iova: Iova, domain: SecurityDomain) {
        let shift = self.granule().shift();
        self.tlb.invalidate(sid, pasid, iova.page_number(shift), domain);
    }

    pub fn invalidate_stream(&self, sid: StreamId) {
        self.tlb.invalidate_stream(sid);
    }

    pub fn invalidate_pasid(&self, sid: StreamId, pasid: Pasid) {
        self.tlb.invalidate_pasid(sid, pasid);
    }

    pub fn invalidate_security_domain(&self, domain: SecurityDomain) {
        self.tlb.invalidate_by_security_domain(domain);
    }

    pub fn invalidate_all(&self) {
        self.tlb.invalidate_all();
    }

    // -- Statistics / event interface --------------------------------------

    pub fn tlb_statistics(&self) -> TlbStatistics {
        self.tlb.atomic_statistics()
    }

    pub fn reset_tlb_statistics(&self) {
        self.tlb.reset_statistics();
    }

    /// Resets the TLB's hit/miss counters and every configured stream's
    /// per-stream statistics (spec.md §4.5 `resetStatistics`).
    pub fn reset_statistics(&self) {
        self.tlb.reset_statistics();
        for ctx in self.inner.read().streams.values() {
            ctx.reset_statistics();
        }
    }

    pub fn set_max_cache_size(&self, n: usize) {
        self.tlb.set_max_size(n);
    }

    pub fn fault_statistics(&self) -> FaultStatistics {
        self.faults.statistics()
    }

    pub fn fault_events(&self) -> Vec<FaultRecord> {
        self.faults.events()
    }

    pub fn clear_fault_events(&self) {
        self.faults.clear_events();
    }

    pub fn has_fault_events(&self) -> bool {
        self.faults.has_events()
    }

    pub fn faults_by_stream(&self, sid: StreamId) -> Vec<FaultRecord> {
        self.faults.faults_by_stream(sid)
    }

    pub fn faults_by_pasid(&self, pasid: Pasid) -> Vec<FaultRecord> {
        self.faults.faults_by_pasid(pasid)
    }

    pub fn set_max_queue_size(&self, n: usize) {
        self.faults.set_max_queue_size(n);
    }

    pub fn stream_statistics(&self, sid: StreamId) -> Result<StreamStatistics> {
        Ok(self.stream(sid)?.statistics())
    }

    pub fn statistics(&self) -> EngineStatistics {
        let inner = self.inner.read();
        EngineStatistics {
            stream_count: inner.streams.len(),
            total_translations: self.translations.load(Ordering::Relaxed),
            total_faults: self.faults.statistics().total_faults,
        }
    }
}
