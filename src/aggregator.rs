//! Construcción del sobre de respuesta a partir de los resultados por documento.
//!
//! Los dos modos (búsqueda por nodos y sólo documentos) producen el mismo
//! sobre; cambia únicamente el contenido de cada entrada de `results`.

use std::collections::HashMap;

use serde::Serialize;

use crate::{
    models::{DocumentRecord, DocumentSearchOutcome, NodeSearchResult},
    tree_store::TreeIndex,
};

pub const NO_DOCUMENTS_MESSAGE: &str = "No relevant documents found for the query";
pub const CANNOT_ANSWER_MESSAGE: &str =
    "Sorry, the indexed knowledge base does not contain enough information to answer this question.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectedDocument {
    pub doc_id: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Section {
    pub node_id: String,
    pub title: String,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_index: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeLevelResult {
    pub doc_id: String,
    pub filename: String,
    pub description: String,
    pub search_confidence: f64,
    pub total_nodes_analyzed: usize,
    pub processing_time: f64,
    pub nodes: Vec<NodeSearchResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentLevelResult {
    pub doc_id: String,
    pub filename: String,
    pub description: String,
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DocumentResult {
    Nodes(NodeLevelResult),
    Sections(DocumentLevelResult),
}

impl DocumentResult {
    pub fn doc_id(&self) -> &str {
        match self {
            Self::Nodes(result) => &result.doc_id,
            Self::Sections(result) => &result.doc_id,
        }
    }

    fn has_content(&self) -> bool {
        match self {
            Self::Nodes(result) => !result.nodes.is_empty(),
            Self::Sections(result) => !result.sections.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewritten_query: Option<String>,
    pub selected_documents: Vec<SelectedDocument>,
    pub results: Vec<DocumentResult>,
    pub tree_search_enabled: bool,
    pub message: String,
}

impl SearchResponse {
    /// Sobre para una consulta que no encontró documentos.
    pub fn no_documents(query: &str) -> Self {
        Self {
            query: query.to_string(),
            rewritten_query: None,
            selected_documents: Vec::new(),
            results: Vec::new(),
            tree_search_enabled: false,
            message: NO_DOCUMENTS_MESSAGE.to_string(),
        }
    }

    /// Hay al menos un nodo o sección que devolver.
    pub fn has_answers(&self) -> bool {
        self.results.iter().any(DocumentResult::has_content)
    }
}

fn selected(documents: &[DocumentRecord]) -> Vec<SelectedDocument> {
    documents
        .iter()
        .map(|doc| SelectedDocument {
            doc_id: doc.doc_id.clone(),
            filename: doc.filename.clone(),
        })
        .collect()
}

/// Combina los resultados de la búsqueda por nodos con los metadatos del catálogo.
/// Ordena por confianza descendente.
pub fn aggregate_nodes(
    query: &str,
    documents: &[DocumentRecord],
    outcomes: Vec<DocumentSearchOutcome>,
) -> SearchResponse {
    let descriptions: HashMap<&str, &str> = documents
        .iter()
        .map(|doc| (doc.doc_id.as_str(), doc.description.as_str()))
        .collect();

    let mut results: Vec<NodeLevelResult> = outcomes
        .into_iter()
        .map(|outcome| NodeLevelResult {
            description: descriptions
                .get(outcome.document_id.as_str())
                .map(|d| d.to_string())
                .unwrap_or_default(),
            doc_id: outcome.document_id,
            filename: outcome.document_name,
            search_confidence: outcome.search_confidence,
            total_nodes_analyzed: outcome.total_nodes_analyzed,
            processing_time: outcome.processing_time,
            nodes: outcome.relevant_nodes,
        })
        .collect();
    results.sort_by(|a, b| b.search_confidence.total_cmp(&a.search_confidence));

    let analyzed = results.len();
    let mut response = SearchResponse {
        query: query.to_string(),
        rewritten_query: None,
        selected_documents: selected(documents),
        results: results.into_iter().map(DocumentResult::Nodes).collect(),
        tree_search_enabled: true,
        message: format!("Found relevant nodes in {analyzed} document(s) using tree search"),
    };
    if !response.has_answers() {
        response.message = CANNOT_ANSWER_MESSAGE.to_string();
    }
    response
}

/// Sobre de sólo documentos: las secciones de primer nivel de cada árbol.
/// `trees` puede no contener un documento (árbol ausente): se devuelve sin secciones.
pub fn aggregate_sections(
    query: &str,
    documents: &[DocumentRecord],
    trees: &HashMap<String, std::sync::Arc<TreeIndex>>,
    max_sections_per_doc: usize,
) -> SearchResponse {
    let results: Vec<DocumentResult> = documents
        .iter()
        .map(|doc| {
            let sections = trees
                .get(&doc.doc_id)
                .map(|tree| top_level_sections(tree, max_sections_per_doc))
                .unwrap_or_default();
            DocumentResult::Sections(DocumentLevelResult {
                doc_id: doc.doc_id.clone(),
                filename: doc.filename.clone(),
                description: doc.description.clone(),
                sections,
            })
        })
        .collect();

    let mut response = SearchResponse {
        query: query.to_string(),
        rewritten_query: None,
        selected_documents: selected(documents),
        results,
        tree_search_enabled: false,
        message: format!("Found relevant information in {} document(s)", documents.len()),
    };
    if !response.has_answers() {
        response.message = CANNOT_ANSWER_MESSAGE.to_string();
    }
    response
}

pub fn top_level_sections(tree: &TreeIndex, limit: usize) -> Vec<Section> {
    tree.roots
        .iter()
        .take(limit)
        .map(|node| Section {
            node_id: node.node_id.clone(),
            title: node.title.clone(),
            summary: node.summary.clone().unwrap_or_default(),
            start_index: node.start_index,
            end_index: node.end_index,
        })
        .collect()
}
