//! Live pricing and provider configuration.
//!
//! The [`Catalog`] holds the current [`Snapshot`] behind an atomically
//! swappable pointer. Readers take a cheap `Arc` clone and never lock;
//! the [`ReloadController`] is the only writer.

pub mod pricing;
pub mod registry;
pub mod reload;
pub mod snapshot;

pub use pricing::{Cost, PricingEntry, PricingTable};
pub use registry::{Deployment, ProviderBinding, ProviderEndpoint, ProviderRegistry};
pub use reload::{ReloadController, ReloadSummary};
pub use snapshot::Snapshot;

use std::sync::Arc;

use arc_swap::ArcSwap;

/// Versioned pointer to the active snapshot.
pub struct Catalog {
    current: ArcSwap<Snapshot>,
}

impl Catalog {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            current: ArcSwap::new(Arc::new(snapshot)),
        }
    }

    /// The snapshot active right now. Hold on to it for the whole request.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Replace the active snapshot in one pointer swap.
    pub fn publish(&self, snapshot: Snapshot) {
        self.current.store(Arc::new(snapshot));
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("version", &self.version())
            .finish()
    }
}
