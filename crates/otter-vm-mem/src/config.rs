//! Memory subsystem configuration
//!
//! Every knob has a default; `MemConfig::from_env` lets the embedder override
//! the allocator mode and pool budget:
//! - `OTTER_INTERNAL_ALLOCATOR`: `tiered` (default, also `panda`) or `malloc`
//! - `OTTER_MEM_POOL_LIMIT`: pool budget in bytes

use std::time::Duration;

use crate::error::{MemError, Result};
use crate::tier::free_list::FREE_LIST_MAX_SIZE;
use crate::tier::run_slots::RUN_SLOTS_MAX_SIZE;

/// Environment variable selecting the internal allocator mode
pub const ALLOCATOR_KIND_ENV: &str = "OTTER_INTERNAL_ALLOCATOR";

/// Environment variable holding the pool budget in bytes
pub const POOL_LIMIT_ENV: &str = "OTTER_MEM_POOL_LIMIT";

/// Backend used by the internal allocator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternalAllocatorKind {
    /// Size-tiered pool allocators (small / large / humongous)
    #[default]
    Tiered,
    /// Every request forwarded to the global allocator
    Malloc,
}

impl InternalAllocatorKind {
    /// Parse from string (case-insensitive). Returns `None` for unknown names.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tiered" | "panda" | "pool" | "default" => Some(Self::Tiered),
            "malloc" | "system" => Some(Self::Malloc),
            _ => None,
        }
    }
}

/// Internal allocator configuration
#[derive(Debug, Clone)]
pub struct InternalAllocatorConfig {
    /// Backend mode
    pub kind: InternalAllocatorKind,
    /// Largest aligned size served by the small tier (default: 256B)
    pub small_max_size: usize,
    /// Largest aligned size served by the large tier (default: 64KB)
    pub large_max_size: usize,
}

impl Default for InternalAllocatorConfig {
    fn default() -> Self {
        Self {
            kind: InternalAllocatorKind::Tiered,
            small_max_size: RUN_SLOTS_MAX_SIZE,
            large_max_size: FREE_LIST_MAX_SIZE,
        }
    }
}

impl InternalAllocatorConfig {
    /// Check tier limits against what the tier allocators can serve
    pub fn validate(&self) -> Result<()> {
        let small = self.small_max_size;
        let large = self.large_max_size;
        if small == 0 || small >= large || small > RUN_SLOTS_MAX_SIZE || large > FREE_LIST_MAX_SIZE
        {
            return Err(MemError::InvalidTierLimits { small, large });
        }
        Ok(())
    }
}

/// Pool manager configuration
#[derive(Debug, Clone)]
pub struct PoolManagerConfig {
    /// Total bytes the pool manager may hand out (default: 256MB)
    pub limit_bytes: usize,
}

impl Default for PoolManagerConfig {
    fn default() -> Self {
        Self {
            limit_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Card table configuration
#[derive(Debug, Clone)]
pub struct CardTableConfig {
    /// log2 of the card size (default: 9, i.e. 512B cards)
    pub card_bits: u32,
}

impl Default for CardTableConfig {
    fn default() -> Self {
        Self { card_bits: 9 }
    }
}

impl CardTableConfig {
    /// Card size in bytes
    #[inline]
    pub fn card_size(&self) -> usize {
        1usize << self.card_bits
    }
}

/// GC statistics configuration
#[derive(Debug, Clone)]
pub struct GcStatsConfig {
    /// Wall-clock width of one bucket of the GC-count histogram (default: 1s)
    pub histogram_period: Duration,
}

impl Default for GcStatsConfig {
    fn default() -> Self {
        Self {
            histogram_period: Duration::from_secs(1),
        }
    }
}

/// Aggregate configuration for the memory subsystem
#[derive(Debug, Clone, Default)]
pub struct MemConfig {
    /// Internal allocator settings
    pub internal_allocator: InternalAllocatorConfig,
    /// Pool manager settings
    pub pool_manager: PoolManagerConfig,
    /// Card table settings
    pub card_table: CardTableConfig,
    /// GC statistics settings
    pub gc_stats: GcStatsConfig,
}

impl MemConfig {
    /// Defaults overridden by `OTTER_INTERNAL_ALLOCATOR` / `OTTER_MEM_POOL_LIMIT`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup(ALLOCATOR_KIND_ENV) {
            config.internal_allocator.kind = InternalAllocatorKind::from_str_loose(&raw)
                .ok_or(MemError::InvalidEnv {
                    var: ALLOCATOR_KIND_ENV,
                    value: raw.clone(),
                })?;
        }

        if let Some(raw) = lookup(POOL_LIMIT_ENV) {
            config.pool_manager.limit_bytes =
                raw.trim().parse().map_err(|_| MemError::InvalidEnv {
                    var: POOL_LIMIT_ENV,
                    value: raw.clone(),
                })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check every section
    pub fn validate(&self) -> Result<()> {
        self.internal_allocator.validate()?;
        if self.pool_manager.limit_bytes == 0 {
            return Err(MemError::ZeroPoolLimit);
        }
        if self.card_table.card_bits >= usize::BITS {
            return Err(MemError::InvalidCardSize(0));
        }
        if self.gc_stats.histogram_period.is_zero() {
            return Err(MemError::ZeroHistogramPeriod);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MemConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.card_table.card_size(), 512);
        assert_eq!(config.internal_allocator.kind, InternalAllocatorKind::Tiered);
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!(
            InternalAllocatorKind::from_str_loose("MALLOC"),
            Some(InternalAllocatorKind::Malloc)
        );
        assert_eq!(
            InternalAllocatorKind::from_str_loose(" panda "),
            Some(InternalAllocatorKind::Tiered)
        );
        assert_eq!(InternalAllocatorKind::from_str_loose("jemalloc"), None);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = MemConfig::from_lookup(|var| match var {
            ALLOCATOR_KIND_ENV => Some("malloc".to_string()),
            POOL_LIMIT_ENV => Some("4096".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.internal_allocator.kind, InternalAllocatorKind::Malloc);
        assert_eq!(config.pool_manager.limit_bytes, 4096);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = MemConfig::from_lookup(|var| {
            (var == POOL_LIMIT_ENV).then(|| "lots".to_string())
        })
        .unwrap_err();
        assert_eq!(
            err,
            MemError::InvalidEnv {
                var: POOL_LIMIT_ENV,
                value: "lots".to_string()
            }
        );

        let err = MemConfig::from_lookup(|var| {
            (var == POOL_LIMIT_ENV).then(|| "0".to_string())
        })
        .unwrap_err();
        assert_eq!(err, MemError::ZeroPoolLimit);
    }

    #[test]
    fn test_invalid_tier_limits() {
        let config = InternalAllocatorConfig {
            small_max_size: 1024,
            large_max_size: 512,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MemError::InvalidTierLimits { .. })
        ));
    }
}
