//! Cache tier identification and targeting.

use serde::{Deserialize, Serialize};

/// Identifies a cache tier, as a result source or an operation target.
///
/// As a completion source, `None` means the image came from the network.
/// As a store/remove/clear target, `None` is a no-op and `Both` addresses
/// the memory and disk tiers together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CacheType {
    /// No tier; as a source, the image came from the network.
    #[default]
    None,
    /// The in-memory tier.
    Memory,
    /// The on-disk tier.
    Disk,
    /// Both tiers (target only).
    Both,
}

impl CacheType {
    /// Returns true if this target addresses the memory tier.
    #[must_use]
    pub const fn includes_memory(self) -> bool {
        matches!(self, Self::Memory | Self::Both)
    }

    /// Returns true if this target addresses the disk tier.
    #[must_use]
    pub const fn includes_disk(self) -> bool {
        matches!(self, Self::Disk | Self::Both)
    }
}
