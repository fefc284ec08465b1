//! Carga, normalización y caché de los árboles de cada documento.
//!
//! Los árboles persistidos llegan en dos formatos heredados:
//!   - anidado: nodos bajo `nodes` (o `children`) en la raíz y en cada nodo;
//!   - `structure`: nodos bajo `structure` en la raíz, anidando bajo `nodes`.
//!
//! Ambos se convierten aquí, en un único recorrido en profundidad, a
//! [`TreeIndex`], así que el resto del sistema nunca ve la diferencia.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::Path,
    sync::{Arc, RwLock},
};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    models::{DocumentRecord, TreeNode},
};

/// Formato del que procede un árbol ya normalizado.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeEncoding {
    Nested,
    Structure,
}

#[derive(Debug, Deserialize)]
struct RawTreeFile {
    #[serde(default)]
    doc_id: Option<String>,
    #[serde(default)]
    doc_name: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    doc_description: Option<String>,
    #[serde(default)]
    structure: Option<Vec<RawNode>>,
    #[serde(default)]
    nodes: Option<Vec<RawNode>>,
    #[serde(default)]
    children: Option<Vec<RawNode>>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    #[serde(default)]
    node_id: Option<Value>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    start_index: Option<Value>,
    #[serde(default)]
    end_index: Option<Value>,
    #[serde(default)]
    nodes: Option<Vec<RawNode>>,
    #[serde(default)]
    children: Option<Vec<RawNode>>,
}

/// Árbol canónico de un documento.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeIndex {
    pub doc_id: Option<String>,
    pub doc_name: Option<String>,
    pub doc_description: Option<String>,
    pub encoding: TreeEncoding,
    pub roots: Vec<TreeNode>,
    total_nodes: usize,
}

impl TreeIndex {
    /// Parsea el JSON de un árbol en cualquiera de los dos formatos.
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let file: RawTreeFile = serde_json::from_str(raw).map_err(|e| e.to_string())?;

        let (encoding, raw_roots) = match (file.structure, file.nodes, file.children) {
            (Some(structure), _, _) => (TreeEncoding::Structure, structure),
            (None, Some(nodes), _) => (TreeEncoding::Nested, nodes),
            (None, None, Some(children)) => (TreeEncoding::Nested, children),
            (None, None, None) => {
                return Err("falta la clave 'structure', 'nodes' o 'children'".to_string())
            }
        };

        let mut builder = Canonicalizer::new(&raw_roots);
        let roots = builder.walk(raw_roots, &[]);

        Ok(Self {
            doc_id: file.doc_id,
            doc_name: file.doc_name.or(file.title),
            doc_description: file.doc_description,
            encoding,
            roots,
            total_nodes: builder.visited,
        })
    }

    /// Número total de nodos del árbol, a cualquier profundidad.
    pub fn total_nodes(&self) -> usize {
        self.total_nodes
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Recorrido en profundidad (preorden) de todos los nodos.
    pub fn iter(&self) -> impl Iterator<Item = &TreeNode> {
        let mut stack: Vec<&TreeNode> = self.roots.iter().rev().collect();
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            stack.extend(node.children.iter().rev());
            Some(node)
        })
    }

    /// Mapa node_id → nodo. Si un id se repite se conserva la primera aparición.
    pub fn node_map(&self) -> HashMap<&str, &TreeNode> {
        let mut map = HashMap::with_capacity(self.total_nodes);
        for node in self.iter() {
            map.entry(node.node_id.as_str()).or_insert(node);
        }
        map
    }

    /// Texto agregado de los nodos indicados, en el orden pedido.
    pub fn extract_node_text(&self, node_ids: &[String]) -> String {
        let map = self.node_map();
        node_ids
            .iter()
            .filter_map(|id| map.get(id.as_str()))
            .map(|node| format_node(node))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }
}

fn format_node(node: &TreeNode) -> String {
    let mut parts = vec![format!("Title: {}", node.title), format!("Node ID: {}", node.node_id)];
    if let (Some(start), Some(end)) = (node.start_index, node.end_index) {
        parts.push(format!("Range: {start}-{end}"));
    }
    if let Some(summary) = node.summary.as_deref().filter(|s| !s.is_empty()) {
        parts.push(format!("Summary: {summary}"));
    }
    if let Some(text) = node.text.as_deref().filter(|s| !s.is_empty()) {
        parts.push(format!("Content:\n{text}"));
    }
    parts.join("\n")
}

/// Ids de nodo como cadena o número; el resto de tipos se descarta.
fn node_id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => None,
        other => {
            warn!("node_id con tipo inesperado ignorado: {}", other);
            None
        }
    }
}

/// Localizador de página/línea como entero, float o cadena numérica.
fn locator(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn collect_explicit_ids(raw: &[RawNode], ids: &mut HashSet<String>) {
    for node in raw {
        if let Some(id) = node.node_id.as_ref().and_then(node_id_text) {
            ids.insert(id);
        }
        for children in [&node.nodes, &node.children].into_iter().flatten() {
            collect_explicit_ids(children, ids);
        }
    }
}

struct Canonicalizer {
    visited: usize,
    seen: HashSet<String>,
    explicit: HashSet<String>,
}

impl Canonicalizer {
    fn new(raw_roots: &[RawNode]) -> Self {
        let mut explicit = HashSet::new();
        collect_explicit_ids(raw_roots, &mut explicit);
        Self {
            visited: 0,
            seen: HashSet::new(),
            explicit,
        }
    }

    /// `node_{n}` por orden de visita, saltando los ids ya usados en el árbol.
    fn fallback_id(&self) -> String {
        (self.visited..)
            .map(|n| format!("node_{n}"))
            .find(|candidate| !self.seen.contains(candidate) && !self.explicit.contains(candidate))
            .unwrap_or_default()
    }

    fn walk(&mut self, raw: Vec<RawNode>, parent_path: &[String]) -> Vec<TreeNode> {
        raw.into_iter()
            .map(|node| self.convert(node, parent_path))
            .collect()
    }

    fn convert(&mut self, raw: RawNode, parent_path: &[String]) -> TreeNode {
        // Ids ausentes: mismo esquema que el indexador original, por orden de visita.
        let node_id = raw
            .node_id
            .as_ref()
            .and_then(node_id_text)
            .unwrap_or_else(|| self.fallback_id());
        self.visited += 1;
        if !self.seen.insert(node_id.clone()) {
            warn!("node_id duplicado en el árbol: {}", node_id);
        }

        let title = raw.title.unwrap_or_default();
        let mut path = parent_path.to_vec();
        path.push(title.clone());

        let mut raw_children = raw.nodes.unwrap_or_default();
        raw_children.extend(raw.children.unwrap_or_default());
        let children = self.walk(raw_children, &path);

        TreeNode {
            node_id,
            title,
            summary: raw.summary,
            text: raw.text,
            start_index: locator(raw.start_index.as_ref()),
            end_index: locator(raw.end_index.as_ref()),
            path,
            children,
        }
    }
}

/// Almacén de árboles con caché en memoria por doc_id.
///
/// La caché vive lo que vive el proceso; sólo `clear_cache` la vacía.
#[derive(Debug, Default)]
pub struct TreeIndexStore {
    cache_enabled: bool,
    cache: RwLock<HashMap<String, Arc<TreeIndex>>>,
}

impl TreeIndexStore {
    pub fn new(cache_enabled: bool) -> Self {
        Self {
            cache_enabled,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Carga el árbol de un documento.
    ///
    /// `Ok(None)` si el fichero no existe: el documento se trata como vacío.
    /// Un fichero presente pero corrupto es un `Error::TreeLoad`.
    pub fn load(&self, record: &DocumentRecord) -> Result<Option<Arc<TreeIndex>>> {
        if self.cache_enabled {
            if let Some(tree) = self.cached(&record.doc_id) {
                debug!("Árbol de {} servido desde caché", record.doc_id);
                return Ok(Some(tree));
            }
        }

        let loaded = load_tree_file(&record.tree_path)?;
        Ok(self.remember(record, loaded))
    }

    /// Como `load`, pero la lectura en frío del fichero va a `spawn_blocking`
    /// para no bloquear el runtime.
    pub async fn load_async(&self, record: &DocumentRecord) -> Result<Option<Arc<TreeIndex>>> {
        if self.cache_enabled {
            if let Some(tree) = self.cached(&record.doc_id) {
                debug!("Árbol de {} servido desde caché", record.doc_id);
                return Ok(Some(tree));
            }
        }

        let path = record.tree_path.clone();
        let loaded = tokio::task::spawn_blocking(move || load_tree_file(&path))
            .await
            .map_err(|e| Error::TreeLoad {
                path: record.tree_path.clone(),
                message: e.to_string(),
            })??;
        Ok(self.remember(record, loaded))
    }

    fn remember(&self, record: &DocumentRecord, loaded: Option<TreeIndex>) -> Option<Arc<TreeIndex>> {
        let Some(tree) = loaded else {
            warn!(
                "No se encontró el árbol del documento {} ({})",
                record.filename,
                record.tree_path.display()
            );
            return None;
        };
        let tree = Arc::new(tree);

        if self.cache_enabled {
            // Dos cargas concurrentes del mismo doc_id escriben el mismo valor.
            if let Ok(mut cache) = self.cache.write() {
                cache.insert(record.doc_id.clone(), tree.clone());
            }
        }
        Some(tree)
    }

    pub fn cached(&self, doc_id: &str) -> Option<Arc<TreeIndex>> {
        self.cache.read().ok()?.get(doc_id).cloned()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().map(|cache| cache.len()).unwrap_or(0)
    }

    /// Descarta un único árbol (p. ej. al eliminar o reprocesar un documento).
    pub fn invalidate(&self, doc_id: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(doc_id);
        }
    }

    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
        info!("Caché de árboles vaciada");
    }
}

/// Lee y normaliza un fichero de árbol. `Ok(None)` si no existe.
pub fn load_tree_file(path: &Path) -> Result<Option<TreeIndex>> {
    if path.as_os_str().is_empty() || !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| Error::TreeLoad {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    TreeIndex::parse(&raw).map(Some).map_err(|message| Error::TreeLoad {
        path: path.to_path_buf(),
        message,
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::{json, Value};

    /// Árbol de ejemplo en formato anidado (`nodes` + `children`).
    pub fn nested_tree() -> Value {
        json!({
            "doc_id": "abc",
            "doc_name": "manual.pdf",
            "nodes": [
                {
                    "node_id": "0001", "title": "Introduction", "summary": "Overview of the manual",
                    "start_index": 1, "end_index": 3,
                    "children": [
                        { "node_id": "0002", "title": "Scope", "summary": "What is covered",
                          "start_index": 1, "end_index": 2 },
                        { "node_id": "0003", "title": "Audience", "text": "Engineers." }
                    ]
                },
                {
                    "node_id": "0004", "title": "Regulations", "summary": "Financial rules",
                    "start_index": 4, "end_index": 9,
                    "children": [
                        { "node_id": "0005", "title": "Reporting",
                          "children": [ { "node_id": "0006", "title": "Quarterly filings" } ] }
                    ]
                }
            ]
        })
    }

    /// El mismo árbol en formato `structure` (anidando bajo `nodes`).
    pub fn structure_tree() -> Value {
        json!({
            "doc_id": "abc",
            "doc_name": "manual.pdf",
            "structure": [
                {
                    "node_id": "0001", "title": "Introduction", "summary": "Overview of the manual",
                    "start_index": 1, "end_index": 3,
                    "nodes": [
                        { "node_id": "0002", "title": "Scope", "summary": "What is covered",
                          "start_index": 1, "end_index": 2 },
                        { "node_id": "0003", "title": "Audience", "text": "Engineers." }
                    ]
                },
                {
                    "node_id": "0004", "title": "Regulations", "summary": "Financial rules",
                    "start_index": 4, "end_index": 9,
                    "nodes": [
                        { "node_id": "0005", "title": "Reporting",
                          "nodes": [ { "node_id": "0006", "title": "Quarterly filings" } ] }
                    ]
                }
            ]
        })
    }

    /// Formato anidado con `children` tanto en la raíz como en cada nodo.
    pub fn children_tree() -> Value {
        json!({
            "doc_name": "manual.pdf",
            "children": [
                {
                    "node_id": "0001", "title": "Introduction", "summary": "Overview of the manual",
                    "start_index": 1, "end_index": 3,
                    "children": [
                        { "node_id": "0002", "title": "Scope", "summary": "What is covered",
                          "start_index": 1, "end_index": 2 },
                        { "node_id": "0003", "title": "Audience", "text": "Engineers." }
                    ]
                },
                {
                    "node_id": "0004", "title": "Regulations", "summary": "Financial rules",
                    "start_index": 4, "end_index": 9,
                    "children": [
                        { "node_id": "0005", "title": "Reporting",
                          "children": [ { "node_id": "0006", "title": "Quarterly filings" } ] }
                    ]
                }
            ]
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{fixtures::*, *};

    fn record(doc_id: &str, tree_path: PathBuf) -> DocumentRecord {
        DocumentRecord {
            doc_id: doc_id.to_string(),
            filename: format!("{doc_id}.pdf"),
            filepath: format!("/docs/{doc_id}.pdf"),
            description: String::new(),
            file_type: "pdf".to_string(),
            file_size: 0,
            created_at: "2024-01-01T00:00:00".to_string(),
            tree_path,
        }
    }

    fn canonical(map: HashMap<&str, &TreeNode>) -> Vec<(String, String, Vec<String>)> {
        let mut entries: Vec<_> = map
            .into_iter()
            .map(|(id, node)| (id.to_string(), node.title.clone(), node.path.clone()))
            .collect();
        entries.sort();
        entries
    }

    #[test]
    fn both_encodings_yield_identical_node_maps() {
        let nested = TreeIndex::parse(&nested_tree().to_string()).expect("nested");
        let structure = TreeIndex::parse(&structure_tree().to_string()).expect("structure");

        assert_eq!(nested.encoding, TreeEncoding::Nested);
        assert_eq!(structure.encoding, TreeEncoding::Structure);
        assert_eq!(canonical(nested.node_map()), canonical(structure.node_map()));
        assert_eq!(nested.roots, structure.roots);
        assert_eq!(nested.total_nodes(), 6);
        assert_eq!(structure.total_nodes(), 6);
    }

    #[test]
    fn top_level_children_key_matches_structure() {
        let children = TreeIndex::parse(&children_tree().to_string()).expect("children");
        let structure = TreeIndex::parse(&structure_tree().to_string()).expect("structure");

        assert_eq!(children.encoding, TreeEncoding::Nested);
        assert_eq!(canonical(children.node_map()), canonical(structure.node_map()));
        assert_eq!(children.total_nodes(), 6);
    }

    #[test]
    fn numeric_ids_and_locators_are_accepted() {
        let raw = serde_json::json!({
            "structure": [
                { "node_id": 1, "title": "A", "start_index": "3", "end_index": 7.0,
                  "nodes": [ { "node_id": 2.5, "title": "B", "start_index": 4 } ] },
                { "node_id": " 0003 ", "title": "C", "end_index": "n/a" }
            ]
        });
        let tree = TreeIndex::parse(&raw.to_string()).expect("tree");
        let map = tree.node_map();

        assert_eq!(map["1"].start_index, Some(3));
        assert_eq!(map["1"].end_index, Some(7));
        assert_eq!(map["2.5"].path, vec!["A", "B"]);
        assert_eq!(map["2.5"].start_index, Some(4));
        assert_eq!(map["0003"].end_index, None);
    }

    #[test]
    fn fallback_ids_skip_explicit_ones() {
        let raw = serde_json::json!({
            "nodes": [
                { "title": "Untitled id" },
                { "node_id": "node_0", "title": "Explicit" },
                { "node_id": "node_2", "title": "Also explicit" },
                { "title": "Second untitled" }
            ]
        });
        let tree = TreeIndex::parse(&raw.to_string()).expect("tree");
        let ids: Vec<_> = tree.iter().map(|n| n.node_id.as_str()).collect();

        assert_eq!(ids, vec!["node_1", "node_0", "node_2", "node_3"]);
        let map = tree.node_map();
        assert_eq!(map.len(), 4);
        assert_eq!(map["node_0"].title, "Explicit");
    }

    #[test]
    fn paths_follow_depth() {
        let tree = TreeIndex::parse(&structure_tree().to_string()).expect("tree");
        let map = tree.node_map();
        assert_eq!(
            map["0006"].path,
            vec!["Regulations", "Reporting", "Quarterly filings"]
        );
        for node in tree.iter() {
            assert_eq!(node.path.len(), node.depth() + 1);
            assert_eq!(node.path.last(), Some(&node.title));
        }
    }

    #[test]
    fn iteration_is_depth_first_in_tree_order() {
        let tree = TreeIndex::parse(&nested_tree().to_string()).expect("tree");
        let ids: Vec<_> = tree.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["0001", "0002", "0003", "0004", "0005", "0006"]);
    }

    #[test]
    fn missing_node_ids_get_positional_fallback() {
        let raw = serde_json::json!({
            "structure": [ { "title": "A", "nodes": [ { "title": "B" } ] } ]
        });
        let tree = TreeIndex::parse(&raw.to_string()).expect("tree");
        let ids: Vec<_> = tree.iter().map(|n| n.node_id.clone()).collect();
        assert_eq!(ids, vec!["node_0", "node_1"]);
    }

    #[test]
    fn duplicate_ids_keep_first_occurrence() {
        let raw = serde_json::json!({
            "nodes": [ { "node_id": "1", "title": "First" }, { "node_id": "1", "title": "Second" } ]
        });
        let tree = TreeIndex::parse(&raw.to_string()).expect("tree");
        assert_eq!(tree.node_map()["1"].title, "First");
        assert_eq!(tree.total_nodes(), 2);
    }

    #[test]
    fn rejects_files_without_any_node_key() {
        let err = TreeIndex::parse("{\"doc_name\": \"x\"}").expect_err("must fail");
        assert!(err.contains("structure"));
    }

    #[test]
    fn extracts_text_of_selected_nodes() {
        let tree = TreeIndex::parse(&nested_tree().to_string()).expect("tree");
        let text = tree.extract_node_text(&["0003".to_string(), "missing".to_string(), "0004".to_string()]);
        assert!(text.contains("Content:\nEngineers."));
        assert!(text.contains("Range: 4-9"));
        assert_eq!(text.matches("---").count(), 1);
    }

    #[test]
    fn missing_file_is_not_found_not_error() {
        let store = TreeIndexStore::new(true);
        let loaded = store
            .load(&record("ghost", PathBuf::from("/definitely/not/here.json")))
            .expect("no error");
        assert!(loaded.is_none());
        assert_eq!(store.cached_len(), 0);
    }

    #[test]
    fn corrupt_file_is_tree_load_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").expect("write");
        let store = TreeIndexStore::new(true);
        let err = store.load(&record("bad", path)).expect_err("must fail");
        assert!(matches!(err, Error::TreeLoad { .. }));
    }

    #[test]
    fn caches_by_doc_id_until_cleared() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("abc_tree.json");
        fs::write(&path, nested_tree().to_string()).expect("write");

        let store = TreeIndexStore::new(true);
        let rec = record("abc", path.clone());
        let first = store.load(&rec).expect("load").expect("tree");
        fs::remove_file(&path).expect("remove");

        let second = store.load(&rec).expect("load").expect("cached tree");
        assert!(Arc::ptr_eq(&first, &second));

        store.clear_cache();
        assert!(store.load(&rec).expect("load").is_none());
    }

    #[tokio::test]
    async fn async_load_reads_off_runtime_and_shares_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("abc_tree.json");
        fs::write(&path, structure_tree().to_string()).expect("write");

        let store = TreeIndexStore::new(true);
        let rec = record("abc", path.clone());
        let first = store.load_async(&rec).await.expect("load").expect("tree");
        assert_eq!(first.total_nodes(), 6);
        fs::remove_file(&path).expect("remove");

        let cached = store.load(&rec).expect("load").expect("cached tree");
        assert!(Arc::ptr_eq(&first, &cached));

        store.invalidate("abc");
        assert!(store.load_async(&rec).await.expect("load").is_none());
    }

    #[test]
    fn disabled_cache_always_reads_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("abc_tree.json");
        fs::write(&path, nested_tree().to_string()).expect("write");

        let store = TreeIndexStore::new(false);
        let rec = record("abc", path);
        store.load(&rec).expect("load").expect("tree");
        assert_eq!(store.cached_len(), 0);
    }
}
