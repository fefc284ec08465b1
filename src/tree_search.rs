//! Búsqueda de nodos relevantes dentro del árbol de cada documento.
//!
//! Flujo por documento:
//!   1. Cargar el árbol canónico (caché de `TreeIndexStore`).
//!   2. Serializar el árbol simplificado en el prompt y pedir `node_list`.
//!   3. Resolver los ids devueltos contra el mapa de nodos, descartando los inventados.
//!   4. Puntuar cada nodo con el `NodeScorer` configurado.
//!
//! `search_nodes` lanza una tarea por documento y las espera todas a la vez.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::{
    config::NodeScoring,
    error::{Error, Result, StageOutcome},
    llm::Reasoner,
    models::{DocumentRecord, DocumentSearchOutcome, NodeSearchResult, TreeNode},
    tree_store::{TreeIndex, TreeIndexStore},
};

/// Puntuación y explicación asignadas a un nodo seleccionado.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeScore {
    pub relevance: f64,
    pub reasoning: String,
}

/// Estrategia de puntuación de los nodos que devuelve el LLM.
pub trait NodeScorer: Send + Sync {
    /// `rank` es la posición (0-based) del nodo en la respuesta del LLM.
    fn score(&self, node: &TreeNode, rank: usize, selected: usize, thinking: Option<&str>) -> NodeScore;
}

/// Misma puntuación y explicación fija para todos los nodos.
#[derive(Debug, Clone)]
pub struct ConstantScorer {
    pub relevance: f64,
    pub reasoning: String,
}

impl Default for ConstantScorer {
    fn default() -> Self {
        Self {
            relevance: 0.8,
            reasoning: "Selected by LLM as relevant to query".to_string(),
        }
    }
}

impl NodeScorer for ConstantScorer {
    fn score(&self, _node: &TreeNode, _rank: usize, _selected: usize, _thinking: Option<&str>) -> NodeScore {
        NodeScore {
            relevance: self.relevance.clamp(0.0, 1.0),
            reasoning: self.reasoning.clone(),
        }
    }
}

/// Decae linealmente con la posición en la respuesta y reutiliza el
/// razonamiento del LLM como explicación.
#[derive(Debug, Clone, Default)]
pub struct RankScorer;

impl NodeScorer for RankScorer {
    fn score(&self, _node: &TreeNode, rank: usize, selected: usize, thinking: Option<&str>) -> NodeScore {
        let relevance = if selected == 0 {
            0.0
        } else {
            1.0 - rank as f64 / selected as f64 * 0.5
        };
        let reasoning = thinking
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| format!("Rank {} of {}: {}", rank + 1, selected, t))
            .unwrap_or_else(|| format!("Rank {} of {} selected by LLM", rank + 1, selected));
        NodeScore {
            relevance: relevance.clamp(0.0, 1.0),
            reasoning,
        }
    }
}

pub fn scorer_for(mode: NodeScoring) -> Arc<dyn NodeScorer> {
    match mode {
        NodeScoring::Constant => Arc::new(ConstantScorer::default()),
        NodeScoring::Rank => Arc::new(RankScorer),
    }
}

/// Confianza por saturación: nodos seleccionados frente al máximo pedido.
pub fn search_confidence(selected: usize, max_nodes: usize) -> f64 {
    if max_nodes == 0 {
        return 0.0;
    }
    (selected as f64 / max_nodes as f64).min(1.0)
}

#[derive(Debug, Deserialize)]
struct NodeSelectionReply {
    #[serde(default)]
    thinking: Option<String>,
    node_list: Option<Vec<Value>>,
}

pub struct NodeSearchEngine {
    reasoner: Reasoner,
    store: Arc<TreeIndexStore>,
    scorer: Arc<dyn NodeScorer>,
    preview_max_length: usize,
}

impl NodeSearchEngine {
    pub fn new(
        reasoner: Reasoner,
        store: Arc<TreeIndexStore>,
        scorer: Arc<dyn NodeScorer>,
        preview_max_length: usize,
    ) -> Self {
        Self {
            reasoner,
            store,
            scorer,
            preview_max_length,
        }
    }

    pub fn store(&self) -> &Arc<TreeIndexStore> {
        &self.store
    }

    /// Nodos relevantes de un árbol, en el orden del LLM y como mucho `max_nodes`.
    pub async fn analyze(
        &self,
        query: &str,
        doc_name: &str,
        tree: &TreeIndex,
        max_nodes: usize,
    ) -> StageOutcome<Vec<NodeSearchResult>> {
        if tree.is_empty() || max_nodes == 0 {
            return StageOutcome::Empty;
        }

        let prompt = match build_node_prompt(query, doc_name, tree) {
            Ok(prompt) => prompt,
            Err(err) => return StageOutcome::Failed(err),
        };
        let reply: NodeSelectionReply = match self.reasoner.call_json(&prompt).await {
            Ok(reply) => reply,
            Err(err) => return StageOutcome::Failed(err),
        };
        let Some(node_list) = reply.node_list else {
            return StageOutcome::Failed(Error::contract("la respuesta no contiene 'node_list'"));
        };

        let ids: Vec<String> = node_list.into_iter().filter_map(node_id_of).collect();
        StageOutcome::from_items(self.resolve_nodes(tree, &ids, reply.thinking.as_deref(), max_nodes))
    }

    fn resolve_nodes(
        &self,
        tree: &TreeIndex,
        ids: &[String],
        thinking: Option<&str>,
        max_nodes: usize,
    ) -> Vec<NodeSearchResult> {
        let node_map = tree.node_map();
        let mut seen = std::collections::HashSet::new();
        let nodes: Vec<&TreeNode> = ids
            .iter()
            .filter_map(|id| match node_map.get(id.as_str()) {
                Some(node) => Some(*node),
                None => {
                    debug!("node_id inexistente descartado: {}", id);
                    None
                }
            })
            .filter(|node| seen.insert(node.node_id.as_str()))
            .take(max_nodes)
            .collect();

        let selected = nodes.len();
        nodes
            .into_iter()
            .enumerate()
            .map(|(rank, node)| {
                let score = self.scorer.score(node, rank, selected, thinking);
                NodeSearchResult {
                    node_id: node.node_id.clone(),
                    title: node.title.clone(),
                    path: node.path.clone(),
                    relevance_score: score.relevance.clamp(0.0, 1.0),
                    reasoning: score.reasoning,
                    content_preview: preview(node.summary.as_deref(), self.preview_max_length),
                    text: node.text.clone().filter(|t| !t.is_empty()),
                }
            })
            .collect()
    }

    /// Analiza un documento. Nunca falla: cualquier error produce un resultado vacío.
    pub async fn analyze_document(
        &self,
        query: &str,
        record: &DocumentRecord,
        max_nodes: usize,
    ) -> DocumentSearchOutcome {
        let started = Instant::now();

        let tree = match self.store.load_async(record).await {
            Ok(Some(tree)) => tree,
            Ok(None) => {
                return DocumentSearchOutcome::empty(
                    &record.doc_id,
                    &record.filename,
                    started.elapsed().as_secs_f64(),
                )
            }
            Err(err) => {
                error!("Error cargando el árbol de {}: {}", record.doc_id, err);
                return DocumentSearchOutcome::empty(
                    &record.doc_id,
                    &record.filename,
                    started.elapsed().as_secs_f64(),
                );
            }
        };

        let doc_name = tree.doc_name.as_deref().unwrap_or(&record.filename);
        let nodes = match self.analyze(query, doc_name, &tree, max_nodes).await {
            StageOutcome::Failed(err) => {
                error!("Error analizando los nodos de {}: {}", record.doc_id, err);
                Vec::new()
            }
            outcome => outcome.unwrap_or_empty(),
        };

        DocumentSearchOutcome {
            document_id: record.doc_id.clone(),
            document_name: record.filename.clone(),
            search_confidence: search_confidence(nodes.len(), max_nodes),
            relevant_nodes: nodes,
            total_nodes_analyzed: tree.total_nodes(),
            processing_time: started.elapsed().as_secs_f64(),
        }
    }

    /// Busca nodos en varios documentos a la vez, una tarea por documento.
    ///
    /// Los ids sin metadatos se ignoran. Una tarea que aborta (pánico) se
    /// registra y se excluye. Si se supera `timeout` se cancelan las tareas
    /// pendientes y se devuelve `Error::SearchTimeout`.
    pub async fn search_nodes(
        self: &Arc<Self>,
        query: &str,
        document_ids: &[String],
        document_metadata: &HashMap<String, DocumentRecord>,
        max_nodes_per_doc: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<DocumentSearchOutcome>> {
        let started = Instant::now();
        let mut tasks = JoinSet::new();

        for (position, doc_id) in document_ids.iter().enumerate() {
            let Some(record) = document_metadata.get(doc_id).cloned() else {
                warn!("Documento {} sin metadatos; se omite", doc_id);
                continue;
            };
            let engine = Arc::clone(self);
            let query = query.to_string();
            tasks.spawn(async move {
                let outcome = engine.analyze_document(&query, &record, max_nodes_per_doc).await;
                (position, outcome)
            });
        }

        if tasks.is_empty() {
            warn!("No hay documentos válidos que analizar");
            return Ok(Vec::new());
        }

        let collect = async {
            let mut finished = Vec::with_capacity(tasks.len());
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(entry) => finished.push(entry),
                    Err(err) => error!("Error procesando un documento: {}", err),
                }
            }
            finished
        };

        let mut finished = match timeout {
            Some(limit) => match tokio::time::timeout(limit, collect).await {
                Ok(finished) => finished,
                Err(_) => {
                    // Al soltar el JoinSet se abortan las tareas pendientes.
                    warn!("La búsqueda de nodos superó {:?}; se cancelan las tareas", limit);
                    return Err(Error::SearchTimeout(limit));
                }
            },
            None => collect.await,
        };

        finished.sort_by_key(|(position, _)| *position);
        let outcomes: Vec<DocumentSearchOutcome> = finished.into_iter().map(|(_, o)| o).collect();
        info!(
            "Procesados {} documentos en {:.2}s",
            outcomes.len(),
            started.elapsed().as_secs_f64()
        );
        Ok(outcomes)
    }
}

/// Acepta ids como cadenas o como números.
fn node_id_of(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => {
            warn!("node_id con tipo inesperado descartado: {}", other);
            None
        }
    }
}

fn preview(summary: Option<&str>, max_chars: usize) -> String {
    let Some(summary) = summary.map(str::trim).filter(|s| !s.is_empty()) else {
        return String::new();
    };
    match summary.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &summary[..cut]),
        None => summary.to_string(),
    }
}

fn simplify(node: &TreeNode) -> Value {
    let mut entry = Map::new();
    entry.insert("title".into(), json!(node.title));
    entry.insert("node_id".into(), json!(node.node_id));
    entry.insert("start_index".into(), json!(node.start_index.unwrap_or(0)));
    entry.insert("end_index".into(), json!(node.end_index.unwrap_or(0)));
    if let Some(summary) = node.summary.as_deref().filter(|s| !s.is_empty()) {
        entry.insert("summary".into(), json!(summary));
    }
    if !node.children.is_empty() {
        entry.insert(
            "nodes".into(),
            Value::Array(node.children.iter().map(simplify).collect()),
        );
    }
    Value::Object(entry)
}

pub fn build_node_prompt(query: &str, doc_name: &str, tree: &TreeIndex) -> Result<String> {
    let simplified: Vec<Value> = tree.roots.iter().map(simplify).collect();
    let structure = serde_json::to_string_pretty(&simplified)?;
    Ok(format!(
        r#"You are given a query and the tree structure of a document.
You need to find all nodes that are likely to contain the answer.

Query: {query}

Document name: {doc_name}

Document tree structure: {structure}

Each node has a title, a node_id, a start_index/end_index range, an optional summary and optional child nodes.

Reply in the following JSON format:
{{
  "thinking": "<your reasoning about which nodes are relevant>",
  "node_list": ["node_id1", "node_id2"]
}}

List the most relevant nodes first. Return [] if no node is relevant.
Directly return the final JSON structure. Do not output anything else."#
    ))
}
