//! Carga y gestión de configuración de la aplicación (LLM + rutas + búsqueda).

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
    Ollama,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            other => Err(Error::config(format!("Proveedor LLM no soportado: {other}"))),
        }
    }
}

/// Estrategia de puntuación por nodo seleccionado.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeScoring {
    Constant,
    Rank,
}

impl NodeScoring {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "constant" => Ok(Self::Constant),
            "rank" => Ok(Self::Rank),
            other => Err(Error::config(format!("NODE_SCORING no soportado: {other}"))),
        }
    }
}

/// Parámetros por defecto de la búsqueda.
#[derive(Clone, Debug)]
pub struct SearchConfig {
    pub rewrite_enabled: bool,
    pub tree_search_enabled: bool,
    pub tree_cache_enabled: bool,
    pub max_documents: usize,
    pub max_nodes_per_doc: usize,
    pub max_sections_per_doc: usize,
    pub timeout: Duration,
    pub preview_max_length: usize,
    pub node_scoring: NodeScoring,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            rewrite_enabled: true,
            tree_search_enabled: true,
            tree_cache_enabled: true,
            max_documents: 3,
            max_nodes_per_doc: 5,
            max_sections_per_doc: 5,
            timeout: Duration::from_secs(120),
            preview_max_length: 200,
            node_scoring: NodeScoring::Constant,
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,

    pub llm_provider: LlmProvider,
    pub llm_chat_model: String,
    pub llm_temperature: f64,
    pub llm_max_retries: u32,
    pub llm_retry_delay: Duration,

    pub catalog_path: PathBuf,
    pub trees_dir: PathBuf,
    pub ingest_output_dir: PathBuf,

    pub search: SearchConfig,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que `from_env`, pero leyendo cada clave con `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server_addr = lookup("SERVER_ADDR").unwrap_or_else(|| "127.0.0.1:3322".to_string());

        let llm_provider_str = lookup("LLM_PROVIDER").unwrap_or_else(|| "openai".to_string());
        let llm_provider = LlmProvider::from_str(&llm_provider_str)?;
        let llm_chat_model =
            lookup("LLM_CHAT_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());
        let llm_temperature: f64 = parse_or(&lookup, "LLM_TEMPERATURE", 0.0)?;
        let llm_max_retries: u32 = parse_or(&lookup, "LLM_MAX_RETRIES", 3)?;
        let llm_retry_delay = Duration::from_millis(parse_or(&lookup, "LLM_RETRY_DELAY_MS", 1000)?);

        let catalog_path = lookup("CATALOG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(default_catalog_path);
        let trees_dir = match lookup("TREES_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => catalog_path
                .parent()
                .map(|parent| parent.join("trees"))
                .unwrap_or_else(|| PathBuf::from("trees")),
        };
        let ingest_output_dir = lookup("PAGEINDEX_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./results"));

        let defaults = SearchConfig::default();
        let search = SearchConfig {
            rewrite_enabled: parse_or(&lookup, "QUERY_REWRITE_ENABLED", defaults.rewrite_enabled)?,
            tree_search_enabled: parse_or(
                &lookup,
                "TREE_SEARCH_ENABLED",
                defaults.tree_search_enabled,
            )?,
            tree_cache_enabled: parse_or(&lookup, "TREE_CACHE_ENABLED", defaults.tree_cache_enabled)?,
            max_documents: parse_or(&lookup, "SEARCH_MAX_DOCUMENTS", defaults.max_documents)?,
            max_nodes_per_doc: parse_or(
                &lookup,
                "SEARCH_MAX_NODES_PER_DOC",
                defaults.max_nodes_per_doc,
            )?,
            max_sections_per_doc: parse_or(
                &lookup,
                "SEARCH_MAX_SECTIONS_PER_DOC",
                defaults.max_sections_per_doc,
            )?,
            timeout: Duration::from_secs(parse_or(
                &lookup,
                "SEARCH_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )?),
            preview_max_length: parse_or(
                &lookup,
                "PREVIEW_MAX_LENGTH",
                defaults.preview_max_length,
            )?,
            node_scoring: match lookup("NODE_SCORING") {
                Some(raw) => NodeScoring::from_str(&raw)?,
                None => defaults.node_scoring,
            },
        };

        let cfg = Self {
            server_addr,
            llm_provider,
            llm_chat_model,
            llm_temperature,
            llm_max_retries,
            llm_retry_delay,
            catalog_path,
            trees_dir,
            ingest_output_dir,
            search,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.llm_max_retries == 0 {
            return Err(Error::config("LLM_MAX_RETRIES debe ser mayor que cero."));
        }
        if !(0.0..=2.0).contains(&self.llm_temperature) {
            return Err(Error::config("LLM_TEMPERATURE debe estar entre 0.0 y 2.0."));
        }
        if self.search.preview_max_length == 0 {
            return Err(Error::config("PREVIEW_MAX_LENGTH debe ser mayor que cero."));
        }
        if self.search.timeout.is_zero() {
            return Err(Error::config("SEARCH_TIMEOUT_SECS debe ser mayor que cero."));
        }
        if self.llm_chat_model.trim().is_empty() {
            return Err(Error::config("LLM_CHAT_MODEL no puede estar vacío."));
        }
        Ok(())
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::config(format!("Valor inválido para {key}: {raw}"))),
        None => Ok(default),
    }
}

fn default_catalog_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tree-rag")
        .join("cross_document_index.json")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let cfg = AppConfig::from_lookup(lookup_from(&[("CATALOG_PATH", "/tmp/idx/catalog.json")]))
            .expect("config");
        assert_eq!(cfg.llm_provider, LlmProvider::OpenAI);
        assert_eq!(cfg.llm_max_retries, 3);
        assert_eq!(cfg.llm_retry_delay, Duration::from_millis(1000));
        assert_eq!(cfg.trees_dir, PathBuf::from("/tmp/idx/trees"));
        assert_eq!(cfg.search.max_nodes_per_doc, 5);
        assert_eq!(cfg.search.node_scoring, NodeScoring::Constant);
        assert!(cfg.search.tree_search_enabled);
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = AppConfig::from_lookup(lookup_from(&[
            ("LLM_MAX_RETRIES", "5"),
            ("TREE_SEARCH_ENABLED", "false"),
            ("NODE_SCORING", "rank"),
            ("SEARCH_TIMEOUT_SECS", "10"),
        ]))
        .expect("config");
        assert_eq!(cfg.llm_max_retries, 5);
        assert!(!cfg.search.tree_search_enabled);
        assert_eq!(cfg.search.node_scoring, NodeScoring::Rank);
        assert_eq!(cfg.search.timeout, Duration::from_secs(10));
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        let err = AppConfig::from_lookup(lookup_from(&[("LLM_MAX_RETRIES", "many")]))
            .expect_err("must fail");
        assert!(matches!(err, Error::Configuration { .. }));

        let err = AppConfig::from_lookup(lookup_from(&[("LLM_MAX_RETRIES", "0")]))
            .expect_err("must fail");
        assert!(matches!(err, Error::Configuration { .. }));

        let err = AppConfig::from_lookup(lookup_from(&[("LLM_PROVIDER", "bard")]))
            .expect_err("must fail");
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
