//! Modelos de dominio (metadatos de documentos, nodos del árbol y resultados).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Representa un documento registrado en el catálogo.
/// `tree_path` apunta al fichero JSON con el árbol ya construido.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub doc_id: String,
    pub filename: String,
    pub filepath: String,
    #[serde(default)]
    pub description: String,
    pub file_type: String,
    #[serde(default)]
    pub file_size: u64,
    pub created_at: String,
    #[serde(alias = "tree_reference")]
    pub tree_path: PathBuf,
}

/// Nodo canónico del árbol de un documento.
///
/// `path` contiene los títulos desde la raíz hasta este nodo (inclusive),
/// así que `path.len()` es siempre la profundidad + 1.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    pub node_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_index: Option<u64>,
    pub path: Vec<String>,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn depth(&self) -> usize {
        self.path.len().saturating_sub(1)
    }
}

/// Nodo relevante devuelto por la búsqueda en árbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSearchResult {
    pub node_id: String,
    pub title: String,
    pub path: Vec<String>,
    pub relevance_score: f64,
    pub reasoning: String,
    pub content_preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Resultado de analizar un documento concreto.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentSearchOutcome {
    pub document_id: String,
    pub document_name: String,
    pub relevant_nodes: Vec<NodeSearchResult>,
    pub search_confidence: f64,
    pub total_nodes_analyzed: usize,
    /// Segundos.
    pub processing_time: f64,
}

impl DocumentSearchOutcome {
    /// Documento analizado sin nodos relevantes (o imposible de analizar).
    pub fn empty(document_id: &str, document_name: &str, processing_time: f64) -> Self {
        Self {
            document_id: document_id.to_string(),
            document_name: document_name.to_string(),
            relevant_nodes: Vec::new(),
            search_confidence: 0.0,
            total_nodes_analyzed: 0,
            processing_time,
        }
    }
}
