//! Property tests for the ten universal invariants (spec.md §8).

use proptest::prelude::*;

use smmuv3_sim::{
    AccessKind, AddressSpace, EngineConfig, Error, FaultMode, Iova, Pa, PagePermissions, PageSize, SecurityDomain,
    StreamConfig, TranslationEngine,
};

fn perm_strategy() -> impl Strategy<Value = PagePermissions> {
    (any::<bool>(), any::<bool>(), any::<bool>()).prop_filter_map("at least one bit set", |(r, w, x)| {
        let mut p = PagePermissions::empty();
        if r {
            p |= PagePermissions::READ;
        }
        if w {
            p |= PagePermissions::WRITE;
        }
        if x {
            p |= PagePermissions::EXECUTE;
        }
        if p.is_empty() {
            None
        } else {
            Some(p)
        }
    })
}

fn access_strategy() -> impl Strategy<Value = AccessKind> {
    prop_oneof![Just(AccessKind::Read), Just(AccessKind::Write), Just(AccessKind::Execute)]
}

proptest! {
    /// 1. Round-trip mapping: translate(iova) after map_page(iova, pa, perms)
    /// returns stored_pa + (iova mod pagesize) for every admitted access.
    #[test]
    fn round_trip_mapping(page in 0u64..0x1_0000, offset in 0u64..0x1000, pa_page in 0u64..0x1_0000, perms in perm_strategy(), access in access_strategy()) {
        let space = AddressSpace::new(PageSize::Size4K, 48);
        let iova = Iova::new(page * 0x1000 + offset);
        let pa = Pa::new(pa_page * 0x1000);
        space.map_page(iova, pa, perms, SecurityDomain::NonSecure).unwrap();
        let result = space.translate_page(iova, access, SecurityDomain::NonSecure);
        if perms.admits(access) {
            let t = result.unwrap();
            prop_assert_eq!(t.pa.value(), pa.value() + offset);
        } else {
            prop_assert_eq!(result, Err(Error::PermissionFault));
        }
    }

    /// 2. Permission exhaustiveness, restated directly over all three access
    /// kinds for one mapping.
    #[test]
    fn permission_exhaustiveness(page in 0u64..0x1000, perms in perm_strategy()) {
        let space = AddressSpace::new(PageSize::Size4K, 48);
        let iova = Iova::new(page * 0x1000);
        space.map_page(iova, Pa::new(0x1000), perms, SecurityDomain::NonSecure).unwrap();
        for access in [AccessKind::Read, AccessKind::Write, AccessKind::Execute] {
            let result = space.translate_page(iova, access, SecurityDomain::NonSecure);
            prop_assert_eq!(result.is_ok(), perms.admits(access));
        }
    }

    /// 5. Security isolation: mismatched domain always faults with
    /// SecurityFault, regardless of permissions.
    #[test]
    fn security_isolation(page in 0u64..0x1000, perms in perm_strategy()) {
        let space = AddressSpace::new(PageSize::Size4K, 48);
        let iova = Iova::new(page * 0x1000);
        space.map_page(iova, Pa::new(0x2000), perms, SecurityDomain::Secure).unwrap();
        let result = space.translate_page(iova, AccessKind::Read, SecurityDomain::NonSecure);
        prop_assert_eq!(result, Err(Error::SecurityFault));
    }

    /// 9. PASID 0 is accepted everywhere a valid PASID is required.
    #[test]
    fn pasid_zero_always_accepted(page in 0u64..0x1000) {
        let engine = TranslationEngine::new(EngineConfig::profile_default()).unwrap();
        engine.configure_stream(1, StreamConfig {
            translation_enabled: true,
            stage1_enabled: true,
            stage2_enabled: false,
            fault_mode: FaultMode::Terminate,
        }).unwrap();
        prop_assert!(engine.create_stream_pasid(1, 0).is_ok());
        engine.enable_stream(1).unwrap();
        let iova = Iova::new(page * 0x1000);
        engine.map_page(1, 0, iova, Pa::new(0x5000), PagePermissions::READ, SecurityDomain::NonSecure).unwrap();
        prop_assert!(engine.translate(1, 0, iova, AccessKind::Read, SecurityDomain::NonSecure).is_ok());
    }
}

/// 3. Stream isolation: two streams with identical PASID numbering and the
/// same IOVA but distinct mappings never return each other's PA.
#[test]
fn stream_isolation() {
    let engine = TranslationEngine::new(EngineConfig::profile_default()).unwrap();
    for (sid, pa) in [(10u32, 0x200000u64), (20u32, 0x300000u64)] {
        engine
            .configure_stream(
                sid,
                StreamConfig {
                    translation_enabled: true,
                    stage1_enabled: true,
                    stage2_enabled: false,
                    fault_mode: FaultMode::Terminate,
                },
            )
            .unwrap();
        engine.create_stream_pasid(sid, 1).unwrap();
        engine.enable_stream(sid).unwrap();
        engine.map_page(sid, 1, Iova::new(0x100000), Pa::new(pa), PagePermissions::READ, SecurityDomain::NonSecure).unwrap();
    }
    let pa1 = engine.translate(10, 1, Iova::new(0x100000), AccessKind::Read, SecurityDomain::NonSecure).unwrap();
    let pa2 = engine.translate(20, 1, Iova::new(0x100000), AccessKind::Read, SecurityDomain::NonSecure).unwrap();
    assert_ne!(pa1.value(), pa2.value());
}

/// 4. PASID isolation: the same story within one stream, across PASIDs.
#[test]
fn pasid_isolation() {
    let engine = TranslationEngine::new(EngineConfig::profile_default()).unwrap();
    engine
        .configure_stream(
            30,
            StreamConfig {
                translation_enabled: true,
                stage1_enabled: true,
                stage2_enabled: false,
                fault_mode: FaultMode::Terminate,
            },
        )
        .unwrap();
    engine.create_stream_pasid(30, 1).unwrap();
    engine.create_stream_pasid(30, 2).unwrap();
    engine.enable_stream(30).unwrap();
    engine.map_page(30, 1, Iova::new(0x100000), Pa::new(0x200000), PagePermissions::READ, SecurityDomain::NonSecure).unwrap();
    engine.map_page(30, 2, Iova::new(0x100000), Pa::new(0x300000), PagePermissions::READ, SecurityDomain::NonSecure).unwrap();
    let pa1 = engine.translate(30, 1, Iova::new(0x100000), AccessKind::Read, SecurityDomain::NonSecure).unwrap();
    let pa2 = engine.translate(30, 2, Iova::new(0x100000), AccessKind::Read, SecurityDomain::NonSecure).unwrap();
    assert_ne!(pa1.value(), pa2.value());
}

/// 6. TLB correctness: hits + misses == total_lookups in every snapshot.
#[test]
fn tlb_hits_plus_misses_equals_total_lookups() {
    let engine = TranslationEngine::new(EngineConfig::profile_default()).unwrap();
    engine
        .configure_stream(
            40,
            StreamConfig {
                translation_enabled: true,
                stage1_enabled: true,
                stage2_enabled: false,
                fault_mode: FaultMode::Terminate,
            },
        )
        .unwrap();
    engine.create_stream_pasid(40, 1).unwrap();
    engine.enable_stream(40).unwrap();
    for page in 0..20u64 {
        engine.map_page(40, 1, Iova::new(page * 0x1000), Pa::new(page * 0x1000), PagePermissions::READ, SecurityDomain::NonSecure).unwrap();
    }
    for _ in 0..3 {
        for page in 0..20u64 {
            let _ = engine.translate(40, 1, Iova::new(page * 0x1000), AccessKind::Read, SecurityDomain::NonSecure);
        }
    }
    let stats = engine.tlb_statistics();
    assert_eq!(stats.hits + stats.misses, stats.total_lookups);
}

/// 7. Invalidation coherence: a lookup right after a covering invalidation
/// is always a miss.
#[test]
fn invalidation_coherence() {
    let engine = TranslationEngine::new(EngineConfig::profile_default()).unwrap();
    engine
        .configure_stream(
            50,
            StreamConfig {
                translation_enabled: true,
                stage1_enabled: true,
                stage2_enabled: false,
                fault_mode: FaultMode::Terminate,
            },
        )
        .unwrap();
    engine.create_stream_pasid(50, 1).unwrap();
    engine.enable_stream(50).unwrap();
    engine.map_page(50, 1, Iova::new(0x1000), Pa::new(0x1000), PagePermissions::READ, SecurityDomain::NonSecure).unwrap();
    engine.translate(50, 1, Iova::new(0x1000), AccessKind::Read, SecurityDomain::NonSecure).unwrap();
    engine.invalidate_stream(50);
    let misses_before = engine.tlb_statistics().misses;
    engine.translate(50, 1, Iova::new(0x1000), AccessKind::Read, SecurityDomain::NonSecure).unwrap();
    assert_eq!(engine.tlb_statistics().misses, misses_before + 1);
}

/// 8. Two-stage permission intersection: the observable permissions are the
/// bitwise AND of Stage-1 and Stage-2 grants.
#[test]
fn two_stage_permission_intersection() {
    let engine = TranslationEngine::new(EngineConfig::profile_default()).unwrap();
    engine
        .configure_stream(
            60,
            StreamConfig {
                translation_enabled: true,
                stage1_enabled: true,
                stage2_enabled: true,
                fault_mode: FaultMode::Terminate,
            },
        )
        .unwrap();
    engine.create_stream_pasid(60, 1).unwrap();
    engine.map_page(60, 1, Iova::new(0x1000000), Pa::new(0x2000000), PagePermissions::READ | PagePermissions::WRITE, SecurityDomain::NonSecure).unwrap();
    engine.create_stream_pasid(60, 0).unwrap();
    engine.attach_stage2(60).unwrap();
    engine.map_stage2_page(60, Iova::new(0x2000000), Pa::new(0x3000000), PagePermissions::READ, SecurityDomain::NonSecure).unwrap();
    engine.enable_stream(60).unwrap();

    assert!(engine.translate(60, 1, Iova::new(0x1000000), AccessKind::Read, SecurityDomain::NonSecure).is_ok());
    assert!(engine.translate(60, 1, Iova::new(0x1000000), AccessKind::Write, SecurityDomain::NonSecure).is_err());
}

/// 10. Queue overflow tail-drop: after N+1 faults into a bound-N queue,
/// exactly N records remain and the oldest surviving one is #2 (1-indexed).
#[test]
fn queue_overflow_tail_drop() {
    use smmuv3_sim::FaultQueue;
    let q = FaultQueue::new(4);
    for i in 0..5u64 {
        q.record_translation_fault(1, 1, 0x1000 + i, AccessKind::Read, smmuv3_sim::Stage::Stage1Only, smmuv3_sim::FaultLevel::Level1, SecurityDomain::NonSecure);
    }
    let events = q.events();
    assert_eq!(events.len(), 4);
    assert_eq!(events[0].address, 0x1000 + 1);
}
