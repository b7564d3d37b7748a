//! Software model of the ARM System Memory Management Unit, Architecture v3
//! (SMMUv3), written in Rust.
//!
//! This crate translates I/O virtual addresses (IOVA) produced by simulated
//! DMA-capable devices into physical addresses (PA), enforcing per-stream and
//! per-PASID isolation, two-stage (Stage-1/Stage-2) virtualization
//! translation, permission and security-domain checks, a tagged translation
//! cache, and a bounded fault-reporting pipeline. It is a simulation and
//! conformance-testing model, not a hardware driver: there is no MMIO, no
//! descriptor-hierarchy walk, and no interrupt handling here.
//!
//! The module layout follows the engine's own dependency order, leaves
//! first:
//!
//! - [`types`] — identifiers, newtypes, permissions, and the crate-wide
//!   [`types::Result`]/[`types::Error`].
//! - [`address_space`] — the sparse per-stage page table.
//! - [`tlb`] — the bounded, multi-indexed translation cache.
//! - [`fault`] — syndrome packing and the bounded fault queue.
//! - [`stream`] — per-device stream state and the two-stage translation
//!   algorithm.
//! - [`config`] — structured configuration, named profiles, and the
//!   key=value persisted-state format.
//! - [`engine`] — [`engine::TranslationEngine`], the public façade.

#[macro_use]
extern crate log;

pub mod address_space;
pub mod config;
pub mod engine;
pub mod fault;
pub mod stream;
pub mod tlb;
pub mod types;

pub use address_space::{AddressSpace, MappedRange, PageEntry, Translation};
pub use config::EngineConfig;
pub use engine::{EngineStatistics, TranslationEngine};
pub use fault::{FaultQueue, FaultRecord, FaultStatistics, Syndrome};
pub use stream::{ContextDescriptor, StreamConfig, StreamConfigChanges, StreamContext, StreamStatistics, StreamTableEntry, StreamTranslation};
pub use tlb::{CacheKey, Tlb, TlbEntry, TlbStatistics};
pub use types::{
    AccessKind, Error, FaultLevel, FaultMode, FaultType, Ipa, Iova, Pa, Pasid, PagePermissions, PageSize, Result,
    SecurityDomain, Stage, StreamId, PASID_MAX, STREAM_ID_MAX,
};
