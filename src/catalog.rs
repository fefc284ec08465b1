//! Catálogo de documentos persistido en un único fichero JSON.
//!
//! Se carga una vez al arrancar; cada alta o baja reescribe el fichero entero.
//! Se asume un único escritor lógico.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    error::{Error, Result},
    models::DocumentRecord,
};

#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    index_created_at: String,
    index_updated_at: String,
    documents: Vec<DocumentRecord>,
}

#[derive(Debug)]
pub struct DocumentCatalog {
    path: PathBuf,
    created_at: String,
    updated_at: String,
    documents: Vec<DocumentRecord>,
}

impl DocumentCatalog {
    /// Abre el catálogo. Si el fichero no existe se empieza con uno vacío
    /// (se creará en la primera alta); si existe y es inválido es un error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            info!("Catálogo {} inexistente; se crea uno vacío.", path.display());
            let now = timestamp();
            return Ok(Self {
                path,
                created_at: now.clone(),
                updated_at: now,
                documents: Vec::new(),
            });
        }
        Self::load(path)
    }

    /// Carga estricta: un fichero ausente también es `Error::CatalogLoad`.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let raw = fs::read_to_string(&path).map_err(|e| Error::CatalogLoad {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let file: CatalogFile = serde_json::from_str(&raw).map_err(|e| Error::CatalogLoad {
            path: path.clone(),
            message: e.to_string(),
        })?;

        let mut documents: Vec<DocumentRecord> = Vec::with_capacity(file.documents.len());
        for record in file.documents {
            if let Some(existing) = documents.iter_mut().find(|d| d.doc_id == record.doc_id) {
                warn!("doc_id repetido en el catálogo: {}; se conserva el último", record.doc_id);
                *existing = record;
            } else {
                documents.push(record);
            }
        }

        info!("Catálogo cargado con {} documentos", documents.len());
        Ok(Self {
            path,
            created_at: file.index_created_at,
            updated_at: file.index_updated_at,
            documents,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    pub fn updated_at(&self) -> &str {
        &self.updated_at
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn list_documents(&self) -> &[DocumentRecord] {
        &self.documents
    }

    pub fn get_document(&self, doc_id: &str) -> Option<&DocumentRecord> {
        self.documents.iter().find(|d| d.doc_id == doc_id)
    }

    pub fn contains(&self, doc_id: &str) -> bool {
        self.get_document(doc_id).is_some()
    }

    /// Inserta (o reemplaza, si se reprocesa) un documento y reescribe el fichero.
    pub fn add(&mut self, record: DocumentRecord) -> Result<()> {
        let doc_id = record.doc_id.clone();
        match self.documents.iter_mut().find(|d| d.doc_id == record.doc_id) {
            Some(existing) => *existing = record,
            None => self.documents.push(record),
        }
        self.save()?;
        info!("Documento {} añadido al catálogo", doc_id);
        Ok(())
    }

    /// Elimina un documento y su fichero de árbol. `false` si no existía.
    pub fn remove(&mut self, doc_id: &str) -> Result<bool> {
        let Some(position) = self.documents.iter().position(|d| d.doc_id == doc_id) else {
            return Ok(false);
        };

        // Primero el catálogo; el árbol sólo se borra si la baja quedó persistida.
        let removed = self.documents.remove(position);
        if let Err(err) = self.save() {
            self.documents.insert(position, removed);
            return Err(err);
        }

        if removed.tree_path.exists() {
            if let Err(err) = fs::remove_file(&removed.tree_path) {
                warn!(
                    "No se pudo borrar el árbol {}: {}",
                    removed.tree_path.display(),
                    err
                );
            }
        }
        info!("Documento {} eliminado del catálogo", doc_id);
        Ok(true)
    }

    /// Reescribe el fichero completo del catálogo.
    pub fn save(&mut self) -> Result<()> {
        self.updated_at = timestamp();
        let file = CatalogFile {
            index_created_at: self.created_at.clone(),
            index_updated_at: self.updated_at.clone(),
            documents: self.documents.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| Error::CatalogWrite {
                path: self.path.clone(),
                source,
            })?;
        }
        fs::write(&self.path, json).map_err(|source| Error::CatalogWrite {
            path: self.path.clone(),
            source,
        })?;
        info!("Catálogo guardado con {} documentos", self.documents.len());
        Ok(())
    }
}

pub(crate) fn timestamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}
