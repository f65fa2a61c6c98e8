//! Node composition.
//!
//! `VerityNode` wires a store, a scheduler, and a facade together and
//! accepts transports. It is the embedder's entry point; everything it
//! does is reachable through the parts it exposes.

use crate::config::SchedulerOptions;
use crate::facade::RetrievalFacade;
use crate::scheduler::RequestScheduler;
use crate::store::{AddCubeOptions, CubeStore, MemoryCubeStore};
use crate::transport::ByteLink;
use std::sync::Arc;
use verity_core::cube::{CubeFields, CubeInfo};
use verity_core::error::{Result, VerityError};

/// One Verity node: store + scheduler + facade.
pub struct VerityNode {
    store: MemoryCubeStore,
    scheduler: RequestScheduler,
    facade: RetrievalFacade,
}

impl VerityNode {
    #[must_use]
    pub fn new(options: SchedulerOptions) -> Self {
        let store = MemoryCubeStore::new();
        let shared: Arc<dyn CubeStore> = Arc::new(store.clone());
        let scheduler = RequestScheduler::spawn(shared.clone(), options);
        let facade = RetrievalFacade::new(shared, scheduler.clone());
        Self {
            store,
            scheduler,
            facade,
        }
    }

    #[must_use]
    pub fn store(&self) -> &MemoryCubeStore {
        &self.store
    }

    #[must_use]
    pub fn scheduler(&self) -> &RequestScheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn facade(&self) -> &RetrievalFacade {
        &self.facade
    }

    /// Hand a connected transport endpoint to the scheduler.
    pub fn connect(&self, link: ByteLink) {
        self.scheduler.connect(link);
    }

    /// Connect two nodes over an in-process duplex.
    pub fn link_with(&self, other: &Self) {
        let (ours, theirs) = ByteLink::pair();
        self.connect(ours);
        other.connect(theirs);
    }

    /// Build and store a locally authored cube. Peers learn of it through
    /// the store's `cube_added` fan-out.
    pub fn publish(&self, fields: CubeFields) -> Result<CubeInfo> {
        let blob = fields.build()?;
        let info = CubeInfo::decode(blob)?;
        self.store
            .add_cube(info, AddCubeOptions::local())
            .ok_or_else(|| VerityError::bad_cube("record lost the contest against a stored version"))
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}
