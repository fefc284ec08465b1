//! Taxonomía de errores del núcleo de recuperación.

use std::{path::PathBuf, time::Duration};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Problemas de configuración; fatales al arrancar.
    #[error("Configuración inválida: {message}")]
    Configuration { message: String },

    /// Fallo de la llamada remota de razonamiento (auth, red, límites, timeout).
    #[error("Fallo en la llamada al LLM: {message}")]
    ReasoningCall { message: String },

    /// La respuesta del LLM no cumple el contrato JSON esperado.
    #[error("Respuesta del LLM no válida: {message}")]
    Contract { message: String },

    #[error("No se pudo cargar el árbol {}: {message}", path.display())]
    TreeLoad { path: PathBuf, message: String },

    #[error("No se pudo cargar el catálogo {}: {message}", path.display())]
    CatalogLoad { path: PathBuf, message: String },

    #[error("No se pudo escribir el catálogo {}: {source}", path.display())]
    CatalogWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Tipo de documento no soportado: {}", path.display())]
    UnsupportedDocument { path: PathBuf },

    #[error("La búsqueda de nodos superó el límite de {0:?}")]
    SearchTimeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn contract(message: impl Into<String>) -> Self {
        Self::Contract { message: message.into() }
    }
}

/// Resultado de una etapa con política fail-open.
///
/// Distingue "la llamada funcionó pero no encontró nada" de "la llamada
/// falló", aunque ambos casos terminen degradando a un resultado vacío.
#[derive(Debug)]
pub enum StageOutcome<T> {
    Found(T),
    Empty,
    Failed(Error),
}

impl<T> StageOutcome<T> {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl<T: Default> StageOutcome<T> {
    /// Degrada a `T::default()` cuando no hay datos o la etapa falló.
    pub fn unwrap_or_empty(self) -> T {
        match self {
            Self::Found(value) => value,
            Self::Empty | Self::Failed(_) => T::default(),
        }
    }
}

impl<T> StageOutcome<Vec<T>> {
    /// `Found` con lista vacía se normaliza a `Empty`.
    pub fn from_items(items: Vec<T>) -> Self {
        if items.is_empty() {
            Self::Empty
        } else {
            Self::Found(items)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_vec_is_classified_as_empty() {
        let outcome: StageOutcome<Vec<u8>> = StageOutcome::from_items(Vec::new());
        assert!(outcome.is_empty());
        assert!(!outcome.is_failed());
    }

    #[test]
    fn failed_stage_degrades_to_default() {
        let outcome: StageOutcome<Vec<String>> = StageOutcome::Failed(Error::contract("sin campo"));
        assert!(outcome.is_failed());
        assert!(outcome.unwrap_or_empty().is_empty());
    }
}
