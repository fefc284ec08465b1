//! Abstracción sobre Rig para las llamadas de razonamiento.
//!
//! Todas las etapas (reescritura, selección de documentos, búsqueda en árbol y
//! descripción de documentos) envían un prompt y esperan un objeto JSON como
//! respuesta. Aquí viven el cliente concreto, la política de reintentos y la
//! limpieza/parseo de esas respuestas.

use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use rig::completion::Prompt;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::{
    config::{AppConfig, LlmProvider},
    error::{Error, Result},
};

const SYSTEM_PROMPT: &str = r#"
You are a retrieval assistant working over document tables of contents.
Follow the requested reply format exactly and return a single JSON object.
Do not include explanations outside the JSON.
"#;

/// Punto final remoto de razonamiento: prompt de entrada, texto libre de salida.
pub trait ReasoningClient: Send + Sync {
    fn complete<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String>>;
}

/// Gestor de LLMs basado en Rig.
#[derive(Debug, Clone)]
pub struct LlmManager {
    pub provider: LlmProvider,
    pub chat_model: String,
    pub temperature: f64,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        Ok(Self {
            provider: cfg.llm_provider.clone(),
            chat_model: cfg.llm_chat_model.clone(),
            temperature: cfg.llm_temperature,
        })
    }

    async fn complete_with_openai(&self, prompt: &str) -> Result<String> {
        use rig::providers::openai;
        // Trait para client.agent(...)
        use rig::client::CompletionClient as _;

        let client = openai::Client::from_env();

        let model_name = if self.chat_model.is_empty() {
            "gpt-4o-mini"
        } else {
            self.chat_model.as_str()
        };

        let agent = client
            .agent(model_name)
            .preamble(SYSTEM_PROMPT)
            .temperature(self.temperature)
            .build();

        debug!("Llamada al LLM (modelo {}, {} caracteres de prompt)", model_name, prompt.len());
        agent.prompt(prompt).await.map_err(|e| Error::ReasoningCall {
            message: e.to_string(),
        })
    }
}

impl ReasoningClient for LlmManager {
    fn complete<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            match self.provider {
                LlmProvider::OpenAI => self.complete_with_openai(prompt).await,
                ref other => Err(Error::ReasoningCall {
                    message: format!("Proveedor LLM {:?} aún no implementado para chat", other),
                }),
            }
        })
    }
}

/// Reintentos con backoff exponencial alrededor de la llamada de red.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_attempts: cfg.llm_max_retries.max(1),
            initial_delay: cfg.llm_retry_delay,
            ..Self::default()
        }
    }

    /// Espera tras el intento `attempt` (0-based) fallido.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.initial_delay
            .mul_f64(self.backoff_factor.powi(attempt as i32))
    }
}

/// Cliente de razonamiento compuesto con su política de reintentos.
#[derive(Clone)]
pub struct Reasoner {
    client: Arc<dyn ReasoningClient>,
    policy: RetryPolicy,
}

impl Reasoner {
    pub fn new(client: Arc<dyn ReasoningClient>, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Llama al LLM reintentando sólo los fallos de la llamada en sí.
    pub async fn call(&self, prompt: &str) -> Result<String> {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.client.complete(prompt).await {
                Ok(response) => {
                    if attempt > 0 {
                        debug!("Llamada al LLM completada tras {} intentos", attempt + 1);
                    }
                    return Ok(response);
                }
                Err(err) if attempt + 1 >= attempts => {
                    error!("La llamada al LLM falló tras {} intentos: {}", attempts, err);
                    return Err(match err {
                        Error::ReasoningCall { .. } => err,
                        other => Error::ReasoningCall {
                            message: other.to_string(),
                        },
                    });
                }
                Err(err) => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        "Fallo en la llamada al LLM (intento {}/{}), reintentando en {:?}: {}",
                        attempt + 1,
                        attempts,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Llama al LLM y parsea la respuesta como JSON. Un fallo de parseo no se reintenta.
    pub async fn call_json<T: DeserializeOwned>(&self, prompt: &str) -> Result<T> {
        let response = self.call(prompt).await?;
        parse_json_reply(&response)
    }
}

/// Elimina la valla markdown (```json ... ```) que algunos modelos añaden.
pub fn strip_code_fence(response: &str) -> &str {
    let trimmed = response.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```JSON"))
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .trim()
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

pub fn parse_json_reply<T: DeserializeOwned>(response: &str) -> Result<T> {
    let json_response = strip_code_fence(response);
    serde_json::from_str(json_response).map_err(|e| {
        warn!("No se pudo parsear el JSON de la respuesta del LLM. Error: {}. Respuesta: '{}'", e, response);
        Error::contract(format!("{e}"))
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use futures::future::BoxFuture;

    use super::{Reasoner, ReasoningClient, RetryPolicy};
    use crate::error::Result;

    type Script = dyn Fn(&str) -> Result<String> + Send + Sync;

    /// Cliente en proceso que responde con un closure y cuenta las llamadas.
    pub struct ScriptedClient {
        script: Box<Script>,
        pub calls: AtomicUsize,
    }

    impl ScriptedClient {
        pub fn new<F>(script: F) -> Arc<Self>
        where
            F: Fn(&str) -> Result<String> + Send + Sync + 'static,
        {
            Arc::new(Self {
                script: Box::new(script),
                calls: AtomicUsize::new(0),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ReasoningClient for ScriptedClient {
        fn complete<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = (self.script)(prompt);
            Box::pin(async move { reply })
        }
    }

    pub fn instant_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: std::time::Duration::ZERO,
            backoff_factor: 2.0,
        }
    }

    pub fn reasoner(client: Arc<ScriptedClient>) -> Reasoner {
        Reasoner::new(client, instant_policy(3))
    }
}
