//! Shared identifiers, value types, and the unified result type.
//!
//! Chapter references in comments throughout this crate are to the ARM
//! SMMUv3 architecture specification, kept because the syndrome and
//! permission semantics they describe are exactly what this module encodes
//! in the type system.

use core::fmt;

/// A device stream's identity at the MMU boundary. Bounded at runtime by
/// `EngineConfig::max_stream_count` (spec default range 1..=1,048,576), not by
/// the Rust type width.
pub type StreamId = u32;

/// Process Address Space Identifier: a 20-bit sub-identifier selecting a
/// per-process address space within one stream. `0` is a valid
/// kernel/hypervisor context and must never be rejected by range checks.
pub type Pasid = u32;

/// Upper bound of a 20-bit PASID: `2^20`.
pub const PASID_MAX: Pasid = 1 << 20;

/// Upper bound of a 32-bit StreamID space used by the `Minimal`/`Default`
/// profiles; `EngineConfig::max_stream_count` may set a tighter bound.
pub const STREAM_ID_MAX: StreamId = 1 << 20;

macro_rules! def_address_newtype {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub u64);

        impl $name {
            /// Wraps a raw 64-bit value.
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw value.
            pub const fn value(self) -> u64 {
                self.0
            }

            /// Virtual/physical page number at the given granule, i.e.
            /// `addr >> granule_shift`.
            pub const fn page_number(self, granule_shift: u32) -> u64 {
                self.0 >> granule_shift
            }

            /// In-page offset at the given granule.
            pub const fn page_offset(self, granule_shift: u32) -> u64 {
                self.0 & ((1u64 << granule_shift) - 1)
            }

            /// The page-aligned address at the given granule.
            pub const fn page_align(self, granule_shift: u32) -> Self {
                Self(self.0 & !((1u64 << granule_shift) - 1))
            }

            /// `true` if every bit above `bits` is zero.
            pub const fn fits_in_bits(self, bits: u32) -> bool {
                if bits >= 64 {
                    true
                } else {
                    self.0 < (1u64 << bits)
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(0x{:x})", stringify!($name), self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

def_address_newtype!(Iova, "I/O Virtual Address: what the DMA-capable device issues.");
def_address_newtype!(Ipa, "Intermediate Physical Address: Stage-1 output, Stage-2 input.");
def_address_newtype!(Pa, "Physical Address: the final translation result.");

impl From<Ipa> for Iova {
    /// Stage-2 treats the prior stage's output as its own input address
    /// space; this conversion is how `crate::stream` feeds a Stage-1 result
    /// into a Stage-2 lookup.
    fn from(ipa: Ipa) -> Self {
        Iova::new(ipa.value())
    }
}

bitflags::bitflags! {
    /// Per-page access permissions. At least one bit must be set for any
    /// stored mapping; the all-zero value is used only as an intermediate
    /// during permission-intersection arithmetic.
    #[derive(Default)]
    pub struct PagePermissions: u8 {
        const READ    = 0b001;
        const WRITE   = 0b010;
        const EXECUTE = 0b100;
    }
}

impl PagePermissions {
    /// `true` if no permission bit is set.
    pub const fn is_empty_perm(self) -> bool {
        self.bits() == 0
    }

    /// Whether this permission set admits the given access kind.
    pub const fn admits(self, access: AccessKind) -> bool {
        match access {
            AccessKind::Read => self.contains(Self::READ),
            AccessKind::Write => self.contains(Self::WRITE),
            AccessKind::Execute => self.contains(Self::EXECUTE),
        }
    }
}

/// Partitions address spaces and cache entries by security state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityDomain {
    NonSecure,
    Secure,
    Realm,
}

impl Default for SecurityDomain {
    fn default() -> Self {
        Self::NonSecure
    }
}

/// The kind of access a translation request is made on behalf of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// Which translation stage(s) produced or rejected a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Stage1Only,
    Stage2Only,
    BothStages,
}

/// Translation-table walk depth at which a fault was detected. The model does
/// not walk descriptor hierarchies (spec Non-goals), so this is a
/// classification heuristic rather than an observed walk depth: unmapped
/// pages are attributed to level 1 by convention, matching real SMMUv3 event
/// records for a leaf-not-present condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultLevel {
    Level0,
    Level1,
    Level2,
    Level3,
}

/// The closed fault-type taxonomy (spec.md §4.4 / §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultType {
    TranslationFault,
    PermissionFault,
    SecurityFault,
    AddressSizeFault,
    Level0TranslationFault,
    Level1TranslationFault,
    Level2TranslationFault,
    Level3TranslationFault,
    ContextDescriptorFormatFault,
    AccessFault,
}

impl FaultType {
    /// The per-level translation-fault variant for a given [`FaultLevel`].
    pub const fn at_level(level: FaultLevel) -> Self {
        match level {
            FaultLevel::Level0 => Self::Level0TranslationFault,
            FaultLevel::Level1 => Self::Level1TranslationFault,
            FaultLevel::Level2 => Self::Level2TranslationFault,
            FaultLevel::Level3 => Self::Level3TranslationFault,
        }
    }

    /// 8-bit fault-type code packed into syndrome bits[7:0]. Stable across
    /// versions (spec.md §6, "Boundary formats").
    pub const fn code(self) -> u8 {
        match self {
            Self::TranslationFault => 0x01,
            Self::PermissionFault => 0x02,
            Self::SecurityFault => 0x03,
            Self::AddressSizeFault => 0x04,
            Self::Level0TranslationFault => 0x10,
            Self::Level1TranslationFault => 0x11,
            Self::Level2TranslationFault => 0x12,
            Self::Level3TranslationFault => 0x13,
            Self::ContextDescriptorFormatFault => 0x20,
            Self::AccessFault => 0x21,
        }
    }
}

/// `Terminate` fails the transaction immediately; `Stall` queues it awaiting
/// software handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultMode {
    Terminate,
    Stall,
}

impl Default for FaultMode {
    fn default() -> Self {
        Self::Terminate
    }
}

/// Page granule (translation page size). 4 KiB unless configured otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageSize {
    Size4K,
    Size16K,
    Size64K,
}

impl Default for PageSize {
    fn default() -> Self {
        Self::Size4K
    }
}

impl PageSize {
    /// `log2` of the page size, i.e. the page-number shift.
    pub const fn shift(self) -> u32 {
        match self {
            Self::Size4K => 12,
            Self::Size16K => 14,
            Self::Size64K => 16,
        }
    }

    /// Page size in bytes.
    pub const fn bytes(self) -> u64 {
        1u64 << self.shift()
    }
}

/// The closed error taxonomy (spec.md §7). Every fallible operation in this
/// crate returns [`Result<T>`] wrapping this type; nothing panics on bad
/// caller input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("stream ID out of configured range")]
    InvalidStreamID,
    #[error("PASID out of 20-bit range")]
    InvalidPASID,
    #[error("address does not fit the configured address size")]
    InvalidAddress,
    #[error("permission set must have at least one bit set")]
    InvalidPermissions,
    #[error("security domain value is not recognized")]
    InvalidSecurityDomain,
    #[error("configuration value violates a documented constraint")]
    InvalidConfiguration,
    #[error("configuration text could not be parsed")]
    ParseError,

    #[error("stream has not been configured")]
    StreamNotConfigured,
    #[error("stream is disabled while translation is enabled")]
    StreamDisabled,
    #[error("no such PASID attached to this stream")]
    PASIDNotFound,
    #[error("PASID already exists on this stream")]
    PASIDAlreadyExists,
    #[error("no mapping exists at this page")]
    PageNotMapped,
    #[error("no TLB entry exists for this key")]
    CacheEntryNotFound,
    #[error("fault could not be recorded")]
    FaultHandlingError,

    #[error("translation fault: no valid mapping")]
    TranslationFault,
    #[error("permission fault: access not admitted by stored permissions")]
    PermissionFault,
    #[error("security fault: request domain does not match stored domain")]
    SecurityFault,
    #[error("address size fault: address exceeds configured output size")]
    AddressSizeFault,
    #[error("level 0 translation fault")]
    Level0TranslationFault,
    #[error("level 1 translation fault")]
    Level1TranslationFault,
    #[error("level 2 translation fault")]
    Level2TranslationFault,
    #[error("level 3 translation fault")]
    Level3TranslationFault,
    #[error("context descriptor is malformed")]
    ContextDescriptorFormatFault,
    #[error("access fault")]
    AccessFault,

    #[error("configured stream limit exceeded")]
    StreamLimitExceeded,
    #[error("configured PASID limit exceeded")]
    PASIDLimitExceeded,

    #[error("internal invariant violation")]
    InternalError,
    #[error("configuration operation could not complete")]
    ConfigurationError,
}

impl Error {
    /// Maps a translation-class error onto the [`FaultType`] recorded for it.
    /// Returns `None` for errors that never produce a [`FaultRecord`]
    /// (crate::fault::FaultRecord) — input-validity and resource-state errors
    /// are surfaced to the caller directly without going through the fault
    /// pipeline.
    pub const fn as_fault_type(self) -> Option<FaultType> {
        match self {
            Self::TranslationFault | Self::PageNotMapped => Some(FaultType::TranslationFault),
            Self::PermissionFault => Some(FaultType::PermissionFault),
            Self::SecurityFault => Some(FaultType::SecurityFault),
            Self::AddressSizeFault => Some(FaultType::AddressSizeFault),
            Self::Level0TranslationFault => Some(FaultType::Level0TranslationFault),
            Self::Level1TranslationFault => Some(FaultType::Level1TranslationFault),
            Self::Level2TranslationFault => Some(FaultType::Level2TranslationFault),
            Self::Level3TranslationFault => Some(FaultType::Level3TranslationFault),
            Self::ContextDescriptorFormatFault => Some(FaultType::ContextDescriptorFormatFault),
            Self::AccessFault => Some(FaultType::AccessFault),
            Self::StreamDisabled | Self::StreamNotConfigured => Some(FaultType::TranslationFault),
            _ => None,
        }
    }
}

/// The unified result type used by every fallible operation in this crate.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pasid_zero_is_in_range() {
        assert!((0 as Pasid) < PASID_MAX);
    }

    #[test]
    fn permission_admits_matches_bits() {
        let p = PagePermissions::READ | PagePermissions::WRITE;
        assert!(p.admits(AccessKind::Read));
        assert!(p.admits(AccessKind::Write));
        assert!(!p.admits(AccessKind::Execute));
    }

    #[test]
    fn page_number_and_offset_roundtrip() {
        let iova = Iova::new(0x100_0ABC);
        let shift = PageSize::Size4K.shift();
        let pn = iova.page_number(shift);
        let off = iova.page_offset(shift);
        assert_eq!((pn << shift) | off, iova.value());
    }

    #[test]
    fn fits_in_bits_bounds() {
        let pa = Pa::new((1u64 << 32) - 1);
        assert!(pa.fits_in_bits(32));
        let pa2 = Pa::new(1u64 << 32);
        assert!(!pa2.fits_in_bits(32));
    }
}
