//! Alta de documentos en el catálogo a partir de los árboles que genera el
//! proceso de ingesta externo (`<stem>_structure.json`).

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::UNIX_EPOCH,
};

use mime_guess::MimeGuess;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::{
    app_state::Status,
    catalog::{timestamp, DocumentCatalog},
    error::{Error, Result},
    llm::Reasoner,
    models::DocumentRecord,
    tree_store::{TreeIndex, TreeIndexStore},
};

/// Resumen de los resultados de un alta por directorio.
#[derive(Debug, Default)]
pub struct IndexingSummary {
    pub files_scanned: u32,
    pub files_indexed: u32,
    pub files_skipped: u32,
    pub doc_ids: Vec<String>,
}

/// Implementa cómo se mostrará el resumen como texto.
impl std::fmt::Display for IndexingSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Resumen: {} ficheros escaneados, {} indexados, {} omitidos.",
            self.files_scanned, self.files_indexed, self.files_skipped
        )
    }
}

/// Registra documentos en el catálogo.
pub struct DocumentIndexer {
    reasoner: Reasoner,
    store: Arc<TreeIndexStore>,
    trees_dir: PathBuf,
    ingest_output_dir: PathBuf,
}

impl DocumentIndexer {
    pub fn new(
        reasoner: Reasoner,
        store: Arc<TreeIndexStore>,
        trees_dir: PathBuf,
        ingest_output_dir: PathBuf,
    ) -> Self {
        Self {
            reasoner,
            store,
            trees_dir,
            ingest_output_dir,
        }
    }

    /// Ruta por defecto del árbol generado por la ingesta para `source`.
    pub fn default_tree_source(&self, source: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        self.ingest_output_dir.join(format!("{stem}_structure.json"))
    }

    /// Registra un documento y devuelve su doc_id.
    ///
    /// Si ya existe y no se fuerza el reproceso, devuelve el id existente sin
    /// tocar nada. El lock del catálogo sólo se toma para leer y para escribir,
    /// nunca durante la llamada al LLM.
    pub async fn register_document(
        &self,
        catalog: &RwLock<DocumentCatalog>,
        source: &Path,
        tree_source: Option<&Path>,
        force: bool,
    ) -> Result<String> {
        let metadata = fs::metadata(source)?;
        let doc_id = generate_doc_id(source, &metadata);
        if !force && catalog.read().await.contains(&doc_id) {
            info!("El documento {} ya existe en el catálogo", doc_id);
            return Ok(doc_id);
        }

        let file_type = detect_file_type(source)?;
        let tree_source = tree_source
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_tree_source(source));
        let raw_tree = fs::read_to_string(&tree_source).map_err(|e| Error::TreeLoad {
            path: tree_source.clone(),
            message: e.to_string(),
        })?;
        let tree = TreeIndex::parse(&raw_tree).map_err(|message| Error::TreeLoad {
            path: tree_source.clone(),
            message,
        })?;

        let description = match tree
            .doc_description
            .as_deref()
            .map(str::trim)
            .filter(|d| d.chars().count() > 10)
        {
            Some(existing) => existing.to_string(),
            None => self.describe(&tree).await,
        };

        fs::create_dir_all(&self.trees_dir)?;
        let tree_path = self.trees_dir.join(format!("{doc_id}_tree.json"));
        fs::write(&tree_path, raw_tree)?;

        let filename = source
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| doc_id.clone());
        let record = DocumentRecord {
            doc_id: doc_id.clone(),
            filename: filename.clone(),
            filepath: source.to_string_lossy().to_string(),
            description,
            file_type,
            file_size: metadata.len(),
            created_at: timestamp(),
            tree_path,
        };

        catalog.write().await.add(record)?;
        self.store.invalidate(&doc_id);
        info!("Documento {} ({}) añadido al índice", doc_id, filename);
        Ok(doc_id)
    }

    /// Recorre un directorio registrando cada documento soportado. Los fallos
    /// individuales se registran y se cuentan, sin detener el lote.
    pub async fn register_directory(
        &self,
        catalog: &RwLock<DocumentCatalog>,
        root: &Path,
        status_arc: Option<Arc<Mutex<Status>>>,
    ) -> Result<IndexingSummary> {
        if !root.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("La ruta no es un directorio: {}", root.display()),
            )));
        }

        let mut summary = IndexingSummary::default();
        let file_entries: Vec<_> = WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| detect_file_type(e.path()).is_ok())
            .collect();
        let total_files = file_entries.len().max(1) as f32;

        for (index, entry) in file_entries.iter().enumerate() {
            summary.files_scanned += 1;
            let path = entry.path();
            let filename_str = path.file_name().unwrap_or_default().to_string_lossy();

            if let Some(status_arc) = &status_arc {
                if let Ok(mut status) = status_arc.lock() {
                    status.message = format!(
                        "[{}/{}] Procesando: {}...",
                        index + 1,
                        file_entries.len(),
                        filename_str
                    );
                    status.progress = (index + 1) as f32 / total_files;
                }
            }

            match self.register_document(catalog, path, None, false).await {
                Ok(doc_id) => {
                    summary.files_indexed += 1;
                    summary.doc_ids.push(doc_id);
                }
                Err(err) => {
                    summary.files_skipped += 1;
                    error!("Error registrando {}: {}", path.display(), err);
                }
            }
        }

        info!("{}", summary);
        Ok(summary)
    }

    /// Descripción de una frase generada a partir del título y las secciones
    /// de primer nivel. Si el LLM falla, se usa una descripción por título.
    async fn describe(&self, tree: &TreeIndex) -> String {
        let title = tree.doc_name.as_deref().unwrap_or("Unknown Document");
        let sections: Vec<String> = tree
            .roots
            .iter()
            .take(5)
            .filter(|node| !node.title.is_empty())
            .map(|node| match node.summary.as_deref().filter(|s| !s.is_empty()) {
                Some(summary) => format!("{}: {}", node.title, summary),
                None => node.title.clone(),
            })
            .collect();

        let prompt = build_description_prompt(title, &sections);
        match self.reasoner.call(&prompt).await {
            Ok(response) => {
                let description = response.trim().trim_matches('"').trim_matches('\'').trim();
                if description.is_empty() {
                    fallback_description(title, sections.len())
                } else {
                    description.to_string()
                }
            }
            Err(err) => {
                warn!("No se pudo generar la descripción de '{}': {}", title, err);
                fallback_description(title, sections.len())
            }
        }
    }
}

fn fallback_description(title: &str, sections: usize) -> String {
    format!("Document titled '{title}' covering {sections} main sections")
}

fn build_description_prompt(title: &str, sections: &[String]) -> String {
    let sections_text = if sections.is_empty() {
        "No sections available".to_string()
    } else {
        sections.join("\n")
    };
    format!(
        r#"You are given a table of contents structure of a document.
Your task is to generate a one-sentence description for the document that makes it easy to distinguish from other documents.

Document title: {title}
Document tree structure:
{sections_text}

Directly return the description, do not include any other text."#
    )
}

/// Id estable y corto: 12 caracteres hex de un UUID v5 sobre ruta, mtime y tamaño.
pub fn generate_doc_id(path: &Path, metadata: &fs::Metadata) -> String {
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    let key = format!("{}_{}_{}", path.display(), mtime, metadata.len());
    let uuid = Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes());
    uuid.simple().to_string()[..12].to_string()
}

/// `pdf` o `markdown`; el resto de tipos no se admite.
pub fn detect_file_type(path: &Path) -> Result<String> {
    let guess = MimeGuess::from_path(path).first_raw();
    match guess {
        Some("application/pdf") => Ok("pdf".to_string()),
        Some("text/markdown") | Some("text/x-markdown") => Ok("markdown".to_string()),
        _ => match path.extension().and_then(|e| e.to_str()).map(str::to_lowercase) {
            Some(ext) if ext == "md" || ext == "markdown" => Ok("markdown".to_string()),
            _ => Err(Error::UnsupportedDocument {
                path: path.to_path_buf(),
            }),
        },
    }
}
