//! Consulta multi-documento sobre índices en árbol.
//!
//! Flujo:
//!   1. Reescritura de la consulta (opcional; su fallo aborta la petición).
//!   2. Selección de documentos del catálogo (fail-open).
//!   3. Búsqueda de nodos en cada documento, en paralelo (fail-open por documento).
//!   4. Agregación en un único sobre de respuesta. Si la búsqueda por nodos
//!      falla como lote, se recurre al sobre de sólo documentos.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tracing::{error, info, warn};

use crate::{
    aggregator::{self, SearchResponse},
    config::SearchConfig,
    error::Result,
    llm::Reasoner,
    models::DocumentRecord,
    normalizer::QueryNormalizer,
    selector::DocumentSelector,
    tree_search::{scorer_for, NodeScorer, NodeSearchEngine},
    tree_store::TreeIndexStore,
};

/// Opciones por petición; lo no indicado toma el valor de `SearchConfig`.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub max_documents: Option<usize>,
    pub max_nodes_per_doc: Option<usize>,
    pub include_nodes: Option<bool>,
    pub rewrite: Option<bool>,
    pub timeout: Option<Duration>,
}

pub struct RetrievalPipeline {
    normalizer: QueryNormalizer,
    selector: DocumentSelector,
    engine: Arc<NodeSearchEngine>,
    defaults: SearchConfig,
}

impl RetrievalPipeline {
    pub fn new(reasoner: Reasoner, store: Arc<TreeIndexStore>, defaults: SearchConfig) -> Self {
        let scorer = scorer_for(defaults.node_scoring);
        Self::with_scorer(reasoner, store, defaults, scorer)
    }

    pub fn with_scorer(
        reasoner: Reasoner,
        store: Arc<TreeIndexStore>,
        defaults: SearchConfig,
        scorer: Arc<dyn NodeScorer>,
    ) -> Self {
        Self {
            normalizer: QueryNormalizer::new(reasoner.clone()),
            selector: DocumentSelector::new(reasoner.clone()),
            engine: Arc::new(NodeSearchEngine::new(
                reasoner,
                store,
                scorer,
                defaults.preview_max_length,
            )),
            defaults,
        }
    }

    pub fn store(&self) -> &Arc<TreeIndexStore> {
        self.engine.store()
    }

    pub fn defaults(&self) -> &SearchConfig {
        &self.defaults
    }

    /// Lanza la consulta completa sobre los documentos `catalog`.
    ///
    /// Sólo devuelve error si falla la reescritura de la consulta.
    pub async fn search(
        &self,
        catalog: &[DocumentRecord],
        query: &str,
        options: &SearchOptions,
    ) -> Result<SearchResponse> {
        // 1) Reescritura
        let rewrite = options.rewrite.unwrap_or(self.defaults.rewrite_enabled);
        let search_query = if rewrite {
            self.normalizer.rewrite(query).await?
        } else {
            query.to_string()
        };

        // 2) Selección de documentos
        let max_documents = options.max_documents.unwrap_or(self.defaults.max_documents);
        let selected_ids = self.selector.select(&search_query, catalog, max_documents).await;

        let by_id: HashMap<&str, &DocumentRecord> =
            catalog.iter().map(|doc| (doc.doc_id.as_str(), doc)).collect();
        let relevant: Vec<DocumentRecord> = selected_ids
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).map(|doc| (*doc).clone()))
            .collect();

        let mut response = if relevant.is_empty() {
            info!("Ningún documento relevante para '{}'", search_query);
            SearchResponse::no_documents(query)
        } else if options.include_nodes.unwrap_or(self.defaults.tree_search_enabled) {
            // 3) + 4) Búsqueda por nodos
            self.search_with_nodes(query, &search_query, &relevant, options).await
        } else {
            self.search_documents_only(query, &relevant).await
        };

        if search_query != query {
            response.rewritten_query = Some(search_query);
        }
        Ok(response)
    }

    async fn search_with_nodes(
        &self,
        query: &str,
        search_query: &str,
        relevant: &[DocumentRecord],
        options: &SearchOptions,
    ) -> SearchResponse {
        let ids: Vec<String> = relevant.iter().map(|doc| doc.doc_id.clone()).collect();
        let metadata: HashMap<String, DocumentRecord> = relevant
            .iter()
            .map(|doc| (doc.doc_id.clone(), doc.clone()))
            .collect();
        let max_nodes = options
            .max_nodes_per_doc
            .unwrap_or(self.defaults.max_nodes_per_doc);
        let timeout = options.timeout.unwrap_or(self.defaults.timeout);

        match self
            .engine
            .search_nodes(search_query, &ids, &metadata, max_nodes, Some(timeout))
            .await
        {
            Ok(outcomes) => aggregator::aggregate_nodes(query, relevant, outcomes),
            Err(err) => {
                error!("Error en la búsqueda por nodos: {}; se devuelven secciones", err);
                self.search_documents_only(query, relevant).await
            }
        }
    }

    async fn search_documents_only(&self, query: &str, relevant: &[DocumentRecord]) -> SearchResponse {
        let mut trees = HashMap::new();
        for doc in relevant {
            match self.store().load_async(doc).await {
                Ok(Some(tree)) => {
                    trees.insert(doc.doc_id.clone(), tree);
                }
                Ok(None) => {}
                Err(err) => warn!("Árbol ilegible para {}: {}", doc.doc_id, err),
            }
        }
        aggregator::aggregate_sections(query, relevant, &trees, self.defaults.max_sections_per_doc)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use super::*;
    use crate::{
        aggregator::{DocumentResult, CANNOT_ANSWER_MESSAGE},
        error::Error,
        llm::testing::{reasoner, ScriptedClient},
        tree_store::fixtures::nested_tree,
    };

    fn record(dir: &Path, doc_id: &str) -> DocumentRecord {
        let tree_path = dir.join(format!("{doc_id}_tree.json"));
        fs::write(&tree_path, nested_tree().to_string()).expect("tree");
        DocumentRecord {
            doc_id: doc_id.to_string(),
            filename: format!("{doc_id}.pdf"),
            filepath: format!("/docs/{doc_id}.pdf"),
            description: format!("About {doc_id}"),
            file_type: "pdf".to_string(),
            file_size: 0,
            created_at: "2024-01-01T00:00:00".to_string(),
            tree_path,
        }
    }

    fn pipeline(client: Arc<ScriptedClient>) -> RetrievalPipeline {
        RetrievalPipeline::new(
            reasoner(client),
            Arc::new(TreeIndexStore::new(true)),
            SearchConfig::default(),
        )
    }

    fn reply_for(prompt: &str) -> crate::error::Result<String> {
        if prompt.contains("rewritten_query") {
            Ok("{\"analysis\": \"ok\", \"rewritten_query\": \"quarterly filing rules\"}".into())
        } else if prompt.contains("\"answer\"") {
            Ok("{\"thinking\": \"\", \"answer\": [\"alpha\"]}".into())
        } else {
            Ok("{\"thinking\": \"\", \"node_list\": [\"0006\", \"0004\"]}".into())
        }
    }

    #[tokio::test]
    async fn full_flow_with_nodes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = vec![record(dir.path(), "alpha"), record(dir.path(), "beta")];
        let pipeline = pipeline(ScriptedClient::new(reply_for));

        let response = pipeline
            .search(&catalog, "filings?", &SearchOptions::default())
            .await
            .expect("search");

        assert_eq!(response.rewritten_query.as_deref(), Some("quarterly filing rules"));
        assert_eq!(response.selected_documents.len(), 1);
        let DocumentResult::Nodes(result) = &response.results[0] else {
            panic!("expected node-level result");
        };
        assert_eq!(result.nodes.len(), 2);
        assert_eq!(result.nodes[0].path, vec!["Regulations", "Reporting", "Quarterly filings"]);
        assert!((result.search_confidence - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rewrite_failure_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = vec![record(dir.path(), "alpha")];
        let pipeline = pipeline(ScriptedClient::new(|_| Ok("{}".into())));
        let err = pipeline
            .search(&catalog, "q", &SearchOptions::default())
            .await
            .expect_err("must fail");
        assert!(matches!(err, Error::Contract { .. }));
    }

    #[tokio::test]
    async fn node_failures_yield_cannot_answer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = vec![record(dir.path(), "alpha")];
        let pipeline = pipeline(ScriptedClient::new(|prompt| {
            if prompt.contains("\"answer\"") {
                Ok("{\"answer\": [\"alpha\"]}".into())
            } else {
                Err(Error::ReasoningCall { message: "503".into() })
            }
        }));
        let options = SearchOptions {
            rewrite: Some(false),
            ..SearchOptions::default()
        };

        let response = pipeline.search(&catalog, "q", &options).await.expect("search");
        assert_eq!(response.message, CANNOT_ANSWER_MESSAGE);
        assert!(response.rewritten_query.is_none());
    }

    #[tokio::test]
    async fn sections_mode_with_missing_tree_cannot_answer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut alpha = record(dir.path(), "alpha");
        alpha.tree_path = dir.path().join("missing_tree.json");
        let pipeline = pipeline(ScriptedClient::new(|_| Ok("{\"answer\": [\"alpha\"]}".into())));
        let options = SearchOptions {
            rewrite: Some(false),
            include_nodes: Some(false),
            ..SearchOptions::default()
        };

        let response = pipeline.search(&[alpha], "q", &options).await.expect("search");
        assert_eq!(response.message, CANNOT_ANSWER_MESSAGE);
        assert!(!response.has_answers());
        assert_eq!(response.selected_documents.len(), 1);
    }

    #[tokio::test]
    async fn batch_timeout_falls_back_to_sections() {
        struct SlowClient;

        impl crate::llm::ReasoningClient for SlowClient {
            fn complete<'a>(
                &'a self,
                prompt: &'a str,
            ) -> futures::future::BoxFuture<'a, crate::error::Result<String>> {
                Box::pin(async move {
                    if prompt.contains("\"answer\"") {
                        Ok("{\"answer\": [\"alpha\"]}".to_string())
                    } else {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok("{\"node_list\": []}".to_string())
                    }
                })
            }
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = vec![record(dir.path(), "alpha")];
        let pipeline = RetrievalPipeline::new(
            Reasoner::new(Arc::new(SlowClient), crate::llm::testing::instant_policy(1)),
            Arc::new(TreeIndexStore::new(true)),
            SearchConfig::default(),
        );
        let options = SearchOptions {
            rewrite: Some(false),
            timeout: Some(Duration::from_millis(20)),
            ..SearchOptions::default()
        };

        let response = pipeline.search(&catalog, "q", &options).await.expect("search");
        assert!(!response.tree_search_enabled);
        let DocumentResult::Sections(result) = &response.results[0] else {
            panic!("expected document-level result");
        };
        assert_eq!(result.sections.len(), 2);
    }
}
