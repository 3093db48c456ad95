use crate::aggregation::PipelineAggregator;
use crate::numbering::DocumentNumbering;
use crate::offers::OfferLifecycle;
use crate::projects::ProjectLifecycle;
use crate::retry::RetryPolicy;
use crate::sequence::SequenceAllocator;
use pipeline_store::PipelineStore;
use pipeline_types::{CompanyDirectory, DEFAULT_WIN_SUFFIX};
use std::sync::Arc;

/// Settings shared by every workflow.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub directory: CompanyDirectory,
    pub retry: RetryPolicy,
    pub win_suffix: String,
}

impl EngineSettings {
    pub fn new(directory: CompanyDirectory) -> Self {
        Self {
            directory,
            retry: RetryPolicy::default(),
            win_suffix: DEFAULT_WIN_SUFFIX.to_string(),
        }
    }
}

/// All pipeline workflows over one store.
pub struct PipelineEngine {
    store: Arc<dyn PipelineStore>,
    numbering: Arc<DocumentNumbering>,
    projects: Arc<ProjectLifecycle>,
    offers: OfferLifecycle,
    aggregates: PipelineAggregator,
}

impl PipelineEngine {
    pub fn new(store: Arc<dyn PipelineStore>, settings: EngineSettings) -> Self {
        let numbering = Arc::new(DocumentNumbering::new(
            store.clone(),
            settings.directory,
            settings.retry,
            settings.win_suffix,
        ));
        let projects = Arc::new(ProjectLifecycle::new(store.clone(), numbering.clone()));
        let offers = OfferLifecycle::new(store.clone(), numbering.clone(), projects.clone());
        let aggregates = PipelineAggregator::new(store.clone());
        Self {
            store,
            numbering,
            projects,
            offers,
            aggregates,
        }
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    pub fn sequences(&self) -> &SequenceAllocator {
        self.numbering.allocator()
    }

    pub fn numbering(&self) -> &DocumentNumbering {
        &self.numbering
    }

    pub fn offers(&self) -> &OfferLifecycle {
        &self.offers
    }

    pub fn projects(&self) -> &ProjectLifecycle {
        &self.projects
    }

    pub fn aggregates(&self) -> &PipelineAggregator {
        &self.aggregates
    }
}
