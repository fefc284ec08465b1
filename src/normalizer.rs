//! Reescritura de la consulta del usuario en una consulta apta para recuperación.

use chrono::{DateTime, Datelike, Local};
use serde::Deserialize;
use tracing::info;

use crate::{
    error::{Error, Result},
    llm::Reasoner,
};

#[derive(Debug, Deserialize)]
struct RewriteReply {
    #[serde(default)]
    analysis: Option<String>,
    #[serde(default)]
    rewritten_query: Option<String>,
}

#[derive(Clone)]
pub struct QueryNormalizer {
    reasoner: Reasoner,
}

impl QueryNormalizer {
    pub fn new(reasoner: Reasoner) -> Self {
        Self { reasoner }
    }

    /// Reescribe `original_query` resolviendo expresiones temporales relativas
    /// respecto a la fecha actual.
    pub async fn rewrite(&self, original_query: &str) -> Result<String> {
        self.rewrite_at(original_query, Local::now()).await
    }

    pub async fn rewrite_at(&self, original_query: &str, now: DateTime<Local>) -> Result<String> {
        let prompt = build_rewrite_prompt(original_query, now);
        let reply: RewriteReply = self.reasoner.call_json(&prompt).await?;

        let rewritten = reply
            .rewritten_query
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .ok_or_else(|| Error::contract("la respuesta no contiene 'rewritten_query'"))?;

        if let Some(analysis) = reply.analysis {
            info!("Consulta reescrita: '{}' → '{}' ({})", original_query, rewritten, analysis);
        }
        Ok(rewritten)
    }
}

pub fn build_rewrite_prompt(original_query: &str, now: DateTime<Local>) -> String {
    let current_date = now.format("%Y-%m-%d %H:%M");
    let current_year = now.year();
    format!(
        r#"You are a query understanding assistant. Rewrite the user's conversational question into a clear query suited for document retrieval.

Current date and time: {current_date}
Current year: {current_year}

Original question: {original_query}

Identify colloquial wording, vague references and informal terms, then rewrite the question as a precise retrieval query.
Rules:
1. Convert relative time expressions ("last year", "this month", "yesterday") into absolute dates or years using the current date above.
2. Keep the core intent and every key detail of the original question.
3. Use precise, retrieval-friendly wording.

Reply format:
{{
    "analysis": "<analysis of the original question, including any time conversion>",
    "rewritten_query": "<the rewritten query>"
}}

Return only the JSON structure, with no additional output."#
    )
}
