//! Fault detection, syndrome packing, and the bounded fault queue.
//!
//! The syndrome is a 32-bit packed value. It is declared with
//! `tock_registers::register_bitfields!` and read back through an
//! `InMemoryRegister` — the same bitfield idiom this crate's MMIO register
//! definitions use elsewhere in the ecosystem, just applied to a plain
//! in-memory value instead of a memory-mapped one, so the bit layout stays
//! declarative instead of hand-assembled with shifts.

use std::collections::VecDeque;

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::InMemoryRegister;
use tock_registers::register_bitfields;

use crate::types::{AccessKind, FaultLevel, FaultType, Pasid, SecurityDomain, Stage, StreamId};

register_bitfields! {
    u32,
    /// Packed fault syndrome. Layout fixed by spec.md §4.4:
    /// - bits[7:0]   fault-type code
    /// - bits[27:8]  20-bit PASID
    /// - bits[31:28] 4-bit sub-reason / error-code
    pub SYNDROME [
        SUB_REASON OFFSET(28) NUMBITS(4) [],
        PASID OFFSET(8) NUMBITS(20) [],
        FAULT_CODE OFFSET(0) NUMBITS(8) [],
    ]
}

/// Structured decomposition of a fault syndrome, carried alongside the
/// packed 32-bit value for callers that want the raw register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Syndrome {
    pub packed: u32,
    pub stage: Stage,
    pub level: FaultLevel,
    pub privilege: bool,
    pub access_class: AccessKind,
    pub is_write: bool,
    pub context_descriptor_index: u32,
}

impl Syndrome {
    /// Packs a syndrome from its constituent fields. `sub_reason` is an
    /// implementation-defined 4-bit refinement code (here, the fault
    /// level cast to its ordinal); `pasid` is truncated to 20 bits.
    pub fn build(
        fault_type: FaultType,
        pasid: Pasid,
        stage: Stage,
        level: FaultLevel,
        access: AccessKind,
        context_descriptor_index: u32,
    ) -> Self {
        let reg: InMemoryRegister<u32, SYNDROME::Register> = InMemoryRegister::new(0);
        reg.write(
            SYNDROME::FAULT_CODE.val(fault_type.code() as u32)
                + SYNDROME::PASID.val((pasid & 0x000F_FFFF) as u32)
                + SYNDROME::SUB_REASON.val(level as u32),
        );
        Self {
            packed: reg.get(),
            stage,
            level,
            privilege: false,
            access_class: access,
            is_write: matches!(access, AccessKind::Write),
            context_descriptor_index,
        }
    }

    /// Decodes the 8-bit fault-type code field from the packed value.
    pub fn fault_code(self) -> u8 {
        let reg: InMemoryRegister<u32, SYNDROME::Register> = InMemoryRegister::new(self.packed);
        reg.read(SYNDROME::FAULT_CODE) as u8
    }

    /// Decodes the 20-bit PASID field from the packed value.
    pub fn pasid_field(self) -> Pasid {
        let reg: InMemoryRegister<u32, SYNDROME::Register> = InMemoryRegister::new(self.packed);
        reg.read(SYNDROME::PASID)
    }
}

/// One recorded fault, attributed to a specific stream/PASID/address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    pub sid: StreamId,
    pub pasid: Pasid,
    pub address: u64,
    pub access: AccessKind,
    pub fault_type: FaultType,
    pub stage: Stage,
    pub level: FaultLevel,
    pub syndrome: Syndrome,
    pub domain: SecurityDomain,
    pub timestamp: u64,
}

/// Lifetime fault counters, computed by scanning the current queue contents
/// plus totals retained across overflow tail-drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaultStatistics {
    pub total_faults: u64,
    pub translation_faults: u64,
    pub permission_faults: u64,
}

struct Inner {
    events: VecDeque<FaultRecord>,
    bound: usize,
    next_timestamp: u64,
    total_faults: u64,
    translation_faults: u64,
    permission_faults: u64,
}

/// A bounded FIFO of fault records with tail-drop overflow policy
/// (spec.md §4.4). No operation on this type can fail; overflow silently
/// drops the oldest record.
pub struct FaultQueue {
    inner: parking_lot::Mutex<Inner>,
}

impl FaultQueue {
    /// Creates an empty queue bounded to `bound` entries.
    pub fn new(bound: usize) -> Self {
        Self {
            inner: parking_lot::Mutex::new(Inner {
                events: VecDeque::new(),
                bound: bound.max(1),
                next_timestamp: 0,
                total_faults: 0,
                translation_faults: 0,
                permission_faults: 0,
            }),
        }
    }

    /// A monotonically increasing, single-thread-ordered stand-in for a
    /// wall-clock timestamp. Only non-decreasing order from one thread is
    /// guaranteed; no cross-thread ordering is implied.
    fn next_timestamp(inner: &mut Inner) -> u64 {
        let ts = inner.next_timestamp;
        inner.next_timestamp += 1;
        ts
    }

    /// Appends a fault record, stamping its timestamp with the queue's
    /// monotonic clock and tail-dropping the oldest entry if the queue is
    /// now over its bound.
    pub fn record_fault(&self, mut record: FaultRecord) {
        let mut inner = self.inner.lock();
        record.timestamp = Self::next_timestamp(&mut inner);
        inner.total_faults += 1;
        match record.fault_type {
            FaultType::PermissionFault => inner.permission_faults += 1,
            FaultType::TranslationFault
            | FaultType::Level0TranslationFault
            | FaultType::Level1TranslationFault
            | FaultType::Level2TranslationFault
            | FaultType::Level3TranslationFault => inner.translation_faults += 1,
            _ => {}
        }
        inner.events.push_back(record);
        while inner.events.len() > inner.bound {
            inner.events.pop_front();
            log::warn!("fault queue overflow, dropped oldest record");
        }
    }

    /// Convenience constructor + insertion for a translation fault.
    pub fn record_translation_fault(
        &self,
        sid: StreamId,
        pasid: Pasid,
        address: u64,
        access: AccessKind,
        stage: Stage,
        level: FaultLevel,
        domain: SecurityDomain,
    ) {
        let fault_type = FaultType::at_level(level);
        let syndrome = Syndrome::build(fault_type, pasid, stage, level, access, 0);
        self.record_fault(FaultRecord {
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

    /// Convenience constructor + insertion for a permission fault.
    pub fn record_permission_fault(
        &self,
        sid: StreamId,
        pasid: Pasid,
        address: u64,
        access: AccessKind,
        stage: Stage,
        domain: SecurityDomain,
    ) {
        let syndrome = Syndrome::build(FaultType::PermissionFault, pasid, stage, FaultLevel::Level1, access, 0);
        self.record_fault(FaultRecord {
            sid,
            pasid,
            address,
            access,
            fault_type: FaultType::PermissionFault,
            stage,
            level: FaultLevel::Level1,
            syndrome,
            domain,
            timestamp: 0,
        });
    }

    /// A snapshot copy of every currently queued record, oldest first.
    pub fn events(&self) -> Vec<FaultRecord> {
        self.inner.lock().events.iter().copied().collect()
    }

    /// Drops every queued record. Lifetime counters are unaffected.
    pub fn clear_events(&self) {
        self.inner.lock().events.clear();
    }

    /// Whether any record is currently queued.
    pub fn has_events(&self) -> bool {
        !self.inner.lock().events.is_empty()
    }

    /// Number of records currently queued.
    pub fn event_count(&self) -> usize {
        self.inner.lock().events.len()
    }

    /// Records attributed to the given stream, oldest first.
    pub fn faults_by_stream(&self, sid: StreamId) -> Vec<FaultRecord> {
        self.inner.lock().events.iter().filter(|r| r.sid == sid).copied().collect()
    }

    /// Records attributed to the given PASID, oldest first.
    pub fn faults_by_pasid(&self, pasid: Pasid) -> Vec<FaultRecord> {
        self.inner.lock().events.iter().filter(|r| r.pasid == pasid).copied().collect()
    }

    /// Records with `timestamp` in `[now - window, now]`.
    pub fn recent_faults(&self, now: u64, window: u64) -> Vec<FaultRecord> {
        let floor = now.saturating_sub(window);
        self.inner
            .lock()
            .events
            .iter()
            .filter(|r| r.timestamp >= floor && r.timestamp <= now)
            .copied()
            .collect()
    }

    /// Adjusts the bound, tail-dropping until the queue is back in bounds.
    pub fn set_max_queue_size(&self, n: usize) {
        let mut inner = self.inner.lock();
        inner.bound = n.max(1);
        while inner.events.len() > inner.bound {
            inner.events.pop_front();
        }
    }

    /// Lifetime counters, unaffected by `clear_events`.
    pub fn statistics(&self) -> FaultStatistics {
        let inner = self.inner.lock();
        FaultStatistics {
            total_faults: inner.total_faults,
            translation_faults: inner.translation_faults,
            permission_faults: inner.permission_faults,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_record(ts_filler: u64) -> FaultRecord {
        FaultRecord {
            sid: 1,
            pasid: 1,
            address: 0x1000 + ts_filler,
            access: AccessKind::Read,
            fault_type: FaultType::TranslationFault,
            stage: Stage::Stage1Only,
            level: FaultLevel::Level1,
            syndrome: Syndrome::build(FaultType::TranslationFault, 1, Stage::Stage1Only, FaultLevel::Level1, AccessKind::Read, 0),
            domain: SecurityDomain::NonSecure,
            timestamp: 0,
        }
    }

    #[test]
    fn syndrome_packs_and_unpacks() {
        let syn = Syndrome::build(FaultType::PermissionFault, 0x12345, Stage::BothStages, FaultLevel::Level2, AccessKind::Write, 0);
        assert_eq!(syn.fault_code(), FaultType::PermissionFault.code());
        assert_eq!(syn.pasid_field(), 0x12345 & 0xF_FFFF);
    }

    #[test]
    fn overflow_tail_drops_oldest() {
        let q = FaultQueue::new(4);
        for i in 0..5 {
            q.record_fault(dummy_record(i));
        }
        let events = q.events();
        assert_eq!(events.len(), 4);
        // oldest surviving record is the one pushed minus (N-1) = index 1
        assert_eq!(events[0].address, 0x1000 + 1);
        assert_eq!(events[3].address, 0x1000 + 4);
    }

    #[test]
    fn filters_by_stream_and_pasid() {
        let q = FaultQueue::new(16);
        q.record_translation_fault(1, 1, 0x1000, AccessKind::Read, Stage::Stage1Only, FaultLevel::Level1, SecurityDomain::NonSecure);
        q.record_translation_fault(2, 1, 0x2000, AccessKind::Read, Stage::Stage1Only, FaultLevel::Level1, SecurityDomain::NonSecure);
        assert_eq!(q.faults_by_stream(1).len(), 1);
        assert_eq!(q.faults_by_pasid(1).len(), 2);
    }

    #[test]
    fn statistics_count_by_kind() {
        let q = FaultQueue::new(16);
        q.record_translation_fault(1, 1, 0x1000, AccessKind::Read, Stage::Stage1Only, FaultLevel::Level1, SecurityDomain::NonSecure);
        q.record_permission_fault(1, 1, 0x1000, AccessKind::Write, Stage::Stage1Only, SecurityDomain::NonSecure);
        let stats = q.statistics();
        assert_eq!(stats.total_faults, 2);
        assert_eq!(stats.translation_faults, 1);
        assert_eq!(stats.permission_faults, 1);
    }
}
