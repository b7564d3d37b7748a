//! Engine configuration: structured values, named profiles, and the
//! persisted-state key=value parser (spec.md §6).
//!
//! This module is the core's only awareness that persistence exists. It
//! never touches a filesystem — [`parse`] takes a `&str` a caller has
//! already read from wherever they like, and [`EngineConfig::to_text`] hands
//! back a `String` a caller can write wherever they like.

use crate::types::{Error, Result};

/// Documented validation ranges (spec.md §4.5 / §6).
const QUEUE_SIZE_RANGE: (u32, u32) = (16, 65_536);
const CACHE_SIZE_RANGE: (u32, u32) = (64, 1_048_576);
const ADDRESS_BITS_RANGE: (u32, u32) = (32, 52);
const THREAD_COUNT_RANGE: (u32, u32) = (1, 256);
const TIMEOUT_MS_RANGE: (u64, u64) = (10, 5 * 60 * 1000);

/// The structured configuration value [`crate::engine::TranslationEngine`]
/// is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub event_queue_size: u32,
    pub command_queue_size: u32,
    pub pri_queue_size: u32,
    pub tlb_cache_size: u32,
    pub cache_max_age: u64,
    pub enable_caching: bool,
    pub max_iova_size: u32,
    pub max_pa_size: u32,
    pub max_stream_count: u32,
    pub max_pasid_count: u32,
    pub max_memory_usage: u64,
    pub max_thread_count: u32,
    pub timeout_ms: u64,
    pub enable_resource_tracking: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::profile_default()
    }
}

impl EngineConfig {
    /// Balanced general-purpose settings.
    pub fn profile_default() -> Self {
        Self {
            event_queue_size: 1024,
            command_queue_size: 1024,
            pri_queue_size: 256,
            tlb_cache_size: 4096,
            cache_max_age: 60_000,
            enable_caching: true,
            max_iova_size: 48,
            max_pa_size: 48,
            max_stream_count: 65_536,
            max_pasid_count: 1_048_576,
            max_memory_usage: 256 * 1024 * 1024,
            max_thread_count: 16,
            timeout_ms: 5_000,
            enable_resource_tracking: true,
        }
    }

    /// Larger queues and cache, tuned for throughput over footprint.
    pub fn profile_high_performance() -> Self {
        Self {
            event_queue_size: 65_536,
            command_queue_size: 65_536,
            pri_queue_size: 4_096,
            tlb_cache_size: 1_048_576,
            cache_max_age: 300_000,
            enable_caching: true,
            max_iova_size: 52,
            max_pa_size: 52,
            max_stream_count: 1_048_576,
            max_pasid_count: 1_048_576,
            max_memory_usage: 4 * 1024 * 1024 * 1024,
            max_thread_count: 256,
            timeout_ms: 10_000,
            enable_resource_tracking: false,
        }
    }

    /// Smallest queues and cache the documented ranges allow.
    pub fn profile_low_memory() -> Self {
        Self {
            event_queue_size: 16,
            command_queue_size: 16,
            pri_queue_size: 16,
            tlb_cache_size: 64,
            cache_max_age: 10_000,
            enable_caching: true,
            max_iova_size: 32,
            max_pa_size: 32,
            max_stream_count: 256,
            max_pasid_count: 256,
            max_memory_usage: 4 * 1024 * 1024,
            max_thread_count: 1,
            timeout_ms: 1_000 * 60,
            enable_resource_tracking: true,
        }
    }

    /// Minimal viable configuration: caching disabled, single thread.
    pub fn profile_minimal() -> Self {
        Self {
            event_queue_size: 16,
            command_queue_size: 16,
            pri_queue_size: 16,
            tlb_cache_size: 64,
            cache_max_age: 1_000,
            enable_caching: false,
            max_iova_size: 32,
            max_pa_size: 32,
            max_stream_count: 16,
            max_pasid_count: 16,
            max_memory_usage: 1024 * 1024,
            max_thread_count: 1,
            timeout_ms: 10,
            enable_resource_tracking: false,
        }
    }

    /// Wide stream/PASID fan-out, moderate cache, long timeouts.
    pub fn profile_server() -> Self {
        Self {
            event_queue_size: 32_768,
            command_queue_size: 32_768,
            pri_queue_size: 2_048,
            tlb_cache_size: 262_144,
            cache_max_age: 120_000,
            enable_caching: true,
            max_iova_size: 52,
            max_pa_size: 48,
            max_stream_count: 1_048_576,
            max_pasid_count: 1_048_576,
            max_memory_usage: 1024 * 1024 * 1024,
            max_thread_count: 128,
            timeout_ms: 30_000,
            enable_resource_tracking: true,
        }
    }

    /// Small, fixed resource footprint for constrained targets.
    pub fn profile_embedded() -> Self {
        Self {
            event_queue_size: 64,
            command_queue_size: 64,
            pri_queue_size: 32,
            tlb_cache_size: 256,
            cache_max_age: 30_000,
            enable_caching: true,
            max_iova_size: 36,
            max_pa_size: 36,
            max_stream_count: 64,
            max_pasid_count: 64,
            max_memory_usage: 2 * 1024 * 1024,
            max_thread_count: 2,
            timeout_ms: 2_000,
            enable_resource_tracking: true,
        }
    }

    /// Verbose resource tracking, short timeouts, small caches to surface
    /// eviction/invalidation bugs quickly.
    pub fn profile_development() -> Self {
        Self {
            event_queue_size: 256,
            command_queue_size: 256,
            pri_queue_size: 64,
            tlb_cache_size: 128,
            cache_max_age: 5_000,
            enable_caching: true,
            max_iova_size: 48,
            max_pa_size: 48,
            max_stream_count: 1_024,
            max_pasid_count: 4_096,
            max_memory_usage: 64 * 1024 * 1024,
            max_thread_count: 8,
            timeout_ms: 1_000,
            enable_resource_tracking: true,
        }
    }

    fn in_range_u32(v: u32, range: (u32, u32)) -> bool {
        v >= range.0 && v <= range.1
    }

    fn in_range_u64(v: u64, range: (u64, u64)) -> bool {
        v >= range.0 && v <= range.1
    }

    /// Checks every field against the documented ranges (spec.md §4.5/§6).
    pub fn validate(&self) -> Result<()> {
        if !Self::in_range_u32(self.event_queue_size, QUEUE_SIZE_RANGE)
            || !Self::in_range_u32(self.command_queue_size, QUEUE_SIZE_RANGE)
            || !Self::in_range_u32(self.pri_queue_size, QUEUE_SIZE_RANGE)
        {
            return Err(Error::InvalidConfiguration);
        }
        if !Self::in_range_u32(self.tlb_cache_size, CACHE_SIZE_RANGE) {
            return Err(Error::InvalidConfiguration);
        }
        if !Self::in_range_u32(self.max_iova_size, ADDRESS_BITS_RANGE)
            || !Self::in_range_u32(self.max_pa_size, ADDRESS_BITS_RANGE)
        {
            return Err(Error::InvalidConfiguration);
        }
        if !Self::in_range_u32(self.max_thread_count, THREAD_COUNT_RANGE) {
            return Err(Error::InvalidConfiguration);
        }
        if !Self::in_range_u64(self.timeout_ms, TIMEOUT_MS_RANGE) {
            return Err(Error::InvalidConfiguration);
        }
        if self.max_stream_count == 0 || self.max_pasid_count == 0 {
            return Err(Error::InvalidConfiguration);
        }
        if self.max_memory_usage == 0 {
            return Err(Error::InvalidConfiguration);
        }
        Ok(())
    }

    /// Serializes back to the key=value format [`parse`] accepts.
    pub fn to_text(&self) -> String {
        format!(
            "event_queue_size={}\ncommand_queue_size={}\npri_queue_size={}\ntlb_cache_size={}\ncache_max_age={}\nenable_caching={}\nmax_iova_size={}\nmax_pa_size={}\nmax_stream_count={}\nmax_pasid_count={}\nmax_memory_usage={}\nmax_thread_count={}\ntimeout_ms={}\nenable_resource_tracking={}\n",
            self.event_queue_size,
            self.command_queue_size,
            self.pri_queue_size,
            self.tlb_cache_size,
            self.cache_max_age,
            self.enable_caching,
            self.max_iova_size,
            self.max_pa_size,
            self.max_stream_count,
            self.max_pasid_count,
            self.max_memory_usage,
            self.max_thread_count,
            self.timeout_ms,
            self.enable_resource_tracking,
        )
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::ParseError),
    }
}

fn parse_u32(value: &str) -> Result<u32> {
    value.parse().map_err(|_| Error::ParseError)
}

fn parse_u64(value: &str) -> Result<u64> {
    value.parse().map_err(|_| Error::ParseError)
}

/// Parses the key=value persisted-state format (spec.md §6). Starts from
/// [`EngineConfig::profile_default`] and overwrites only the keys present in
/// `text`, so a partial config (e.g. just `tlb_cache_size=8192`) is valid
/// input. Blank lines and lines starting with `#` are skipped. Malformed
/// lines produce [`Error::ParseError`]; a value parsed successfully but out
/// of range produces [`Error::InvalidConfiguration`] once the whole document
/// has been read.
pub fn parse(text: &str) -> Result<EngineConfig> {
    let mut cfg = EngineConfig::profile_default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or(Error::ParseError)?;
        let key = key.trim();
        let value = value.trim();
        if value.is_empty() {
            return Err(Error::ParseError);
        }
        match key {
            "event_queue_size" => cfg.event_queue_size = parse_u32(value)?,
            "command_queue_size" => cfg.command_queue_size = parse_u32(value)?,
            "pri_queue_size" => cfg.pri_queue_size = parse_u32(value)?,
            "tlb_cache_size" => cfg.tlb_cache_size = parse_u32(value)?,
            "cache_max_age" => cfg.cache_max_age = parse_u64(value)?,
            "enable_caching" => cfg.enable_caching = parse_bool(value)?,
            "max_iova_size" => cfg.max_iova_size = parse_u32(value)?,
            "max_pa_size" => cfg.max_pa_size = parse_u32(value)?,
            "max_stream_count" => cfg.max_stream_count = parse_u32(value)?,
            "max_pasid_count" => cfg.max_pasid_count = parse_u32(value)?,
            "max_memory_usage" => cfg.max_memory_usage = parse_u64(value)?,
            "max_thread_count" => cfg.max_thread_count = parse_u32(value)?,
            "timeout_ms" => cfg.timeout_ms = parse_u64(value)?,
            "enable_resource_tracking" => cfg.enable_resource_tracking = parse_bool(value)?,
            _ => return Err(Error::ParseError),
        }
    }
    cfg.validate()?;
    Ok(cfg)
}
