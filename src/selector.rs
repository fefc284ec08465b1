//! Selección de los documentos del catálogo relevantes para una consulta.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::{
    error::{Error, StageOutcome},
    llm::Reasoner,
    models::DocumentRecord,
};

#[derive(Debug, Deserialize)]
struct SelectionReply {
    #[serde(default)]
    thinking: Option<String>,
    answer: Option<Vec<String>>,
}

#[derive(Serialize)]
struct CandidateEntry<'a> {
    doc_id: &'a str,
    doc_name: &'a str,
    doc_description: &'a str,
}

#[derive(Clone)]
pub struct DocumentSelector {
    reasoner: Reasoner,
}

impl DocumentSelector {
    pub fn new(reasoner: Reasoner) -> Self {
        Self { reasoner }
    }

    /// Devuelve como mucho `limit` doc_ids, en el orden del LLM.
    /// Cualquier fallo degrada a una lista vacía.
    pub async fn select(&self, query: &str, candidates: &[DocumentRecord], limit: usize) -> Vec<String> {
        match self.try_select(query, candidates, limit).await {
            StageOutcome::Failed(err) => {
                error!("Error en la selección de documentos: {}", err);
                Vec::new()
            }
            outcome => outcome.unwrap_or_empty(),
        }
    }

    pub async fn try_select(
        &self,
        query: &str,
        candidates: &[DocumentRecord],
        limit: usize,
    ) -> StageOutcome<Vec<String>> {
        if candidates.is_empty() || limit == 0 {
            return StageOutcome::Empty;
        }

        let prompt = match build_selection_prompt(query, candidates) {
            Ok(prompt) => prompt,
            Err(err) => return StageOutcome::Failed(err),
        };
        let reply: SelectionReply = match self.reasoner.call_json(&prompt).await {
            Ok(reply) => reply,
            Err(err) => return StageOutcome::Failed(err),
        };
        let Some(answer) = reply.answer else {
            warn!("Respuesta de selección sin campo 'answer'");
            return StageOutcome::Failed(Error::contract("la respuesta no contiene 'answer'"));
        };
        if let Some(thinking) = reply.thinking {
            debug!("Razonamiento de selección: {}", thinking);
        }

        StageOutcome::from_items(filter_known_ids(answer, candidates, limit))
    }
}

/// Descarta ids inventados y duplicados antes de truncar a `limit`.
fn filter_known_ids(answer: Vec<String>, candidates: &[DocumentRecord], limit: usize) -> Vec<String> {
    let known: HashSet<&str> = candidates.iter().map(|d| d.doc_id.as_str()).collect();
    let mut seen = HashSet::new();
    let mut selected = Vec::new();
    for doc_id in answer {
        if !known.contains(doc_id.as_str()) {
            warn!("El LLM devolvió un doc_id inexistente: {}", doc_id);
            continue;
        }
        if seen.insert(doc_id.clone()) {
            selected.push(doc_id);
        }
    }
    selected.truncate(limit);
    selected
}

fn build_selection_prompt(query: &str, candidates: &[DocumentRecord]) -> Result<String, Error> {
    let entries: Vec<CandidateEntry<'_>> = candidates
        .iter()
        .map(|d| CandidateEntry {
            doc_id: &d.doc_id,
            doc_name: &d.filename,
            doc_description: &d.description,
        })
        .collect();
    let documents = serde_json::to_string_pretty(&entries)?;

    Ok(format!(
        r#"You are given a list of documents with their IDs, file names, and descriptions. Your task is to select documents that may contain information relevant to answering the user query.

Query: {query}

Documents: {documents}

Response Format:
{{
    "thinking": "<Your reasoning for document selection>",
    "answer": <JSON list of relevant doc_ids, e.g. ["doc_id1", "doc_id2"]. Return [] if no documents are relevant.>
}}

Return only the JSON structure, with no additional output."#
    ))
}
