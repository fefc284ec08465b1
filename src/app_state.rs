use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, RwLock};

use crate::{
    catalog::DocumentCatalog,
    config::AppConfig,
    indexer::DocumentIndexer,
    llm::Reasoner,
    pipeline::RetrievalPipeline,
    tree_store::TreeIndexStore,
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub catalog: Arc<RwLock<DocumentCatalog>>,
    pub pipeline: Arc<RetrievalPipeline>,
    pub indexer: Arc<DocumentIndexer>,
    pub status: Arc<Mutex<Status>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub is_busy: bool,
    pub message: String,
    pub progress: f32, // Valor entre 0.0 y 1.0
}

impl AppState {
    /// Monta el estado compartido; pipeline e indexador usan la misma caché de árboles.
    pub fn new(
        config: AppConfig,
        catalog: DocumentCatalog,
        reasoner: Reasoner,
        shutdown_sender: Option<oneshot::Sender<()>>,
    ) -> Self {
        let store = Arc::new(TreeIndexStore::new(config.search.tree_cache_enabled));
        let pipeline = RetrievalPipeline::new(reasoner.clone(), store.clone(), config.search.clone());
        let indexer = DocumentIndexer::new(
            reasoner,
            store,
            config.trees_dir.clone(),
            config.ingest_output_dir.clone(),
        );

        Self {
            config,
            catalog: Arc::new(RwLock::new(catalog)),
            pipeline: Arc::new(pipeline),
            indexer: Arc::new(indexer),
            status: Arc::new(Mutex::new(Status {
                is_busy: false,
                message: "Servidor listo.".to_string(),
                progress: 0.0,
            })),
            shutdown_sender: Arc::new(Mutex::new(shutdown_sender)),
        }
    }
}
