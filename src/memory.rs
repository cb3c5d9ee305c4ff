//! Hybrid memory: embedding-indexed knowledge for retrieval plus a
//! deterministic page+command action cache for fast-path replay.
//!
//! Both halves are plain JSON files under the data directory, rewritten in
//! full after every mutation. A missing or unreadable file loads as empty.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::llm::EmbeddingBackend;

/// Paragraphs shorter than this are not worth a chunk.
const MIN_PARAGRAPH_CHARS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub source: String,
}

/// A retrieved chunk with its similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeHit {
    pub text: String,
    pub source: String,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Click,
    Type,
}

/// A previously resolved low-level action, safe to replay on the same page
/// for the same command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAction {
    pub locator: String,
    pub action: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Page identity used in cache keys: the URL without its query string.
pub fn normalize_page(page: &str) -> &str {
    page.split('?').next().unwrap_or_default().trim()
}

pub fn normalize_command(command: &str) -> String {
    command.trim().to_lowercase()
}

pub fn cache_key(page: &str, command: &str) -> String {
    format!("{}|{}", normalize_page(page), normalize_command(command))
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a * mag_b > 0.0 {
        dot / (mag_a * mag_b)
    } else {
        0.0
    }
}

fn load_json<T: DeserializeOwned + Default>(path: &Path) -> T {
    if !path.exists() {
        return T::default();
    }
    let parsed = std::fs::File::open(path)
        .map_err(crate::error::Error::from)
        .and_then(|file| Ok(serde_json::from_reader::<_, T>(BufReader::new(file))?));
    match parsed {
        Ok(value) => value,
        Err(e) => {
            warn!("Treating unreadable {} as empty: {}", path.display(), e);
            T::default()
        }
    }
}

fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;

    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}

pub struct MemoryStore {
    embedder: Arc<dyn EmbeddingBackend>,
    knowledge_path: PathBuf,
    cache_path: PathBuf,
    similarity_threshold: f32,
    knowledge: Mutex<Vec<KnowledgeChunk>>,
    actions: Mutex<BTreeMap<String, CachedAction>>,
}

impl MemoryStore {
    /// Load both halves from the configured data directory.
    pub fn open(config: &AgentConfig, embedder: Arc<dyn EmbeddingBackend>) -> Self {
        let knowledge_path = config.knowledge_path();
        let cache_path = config.cache_path();

        let knowledge: Vec<KnowledgeChunk> = load_json(&knowledge_path);
        let actions: BTreeMap<String, CachedAction> = load_json(&cache_path);
        info!(
            "Memory loaded: {} knowledge chunks, {} cached actions",
            knowledge.len(),
            actions.len()
        );

        Self {
            embedder,
            knowledge_path,
            cache_path,
            similarity_threshold: config.similarity_threshold,
            knowledge: Mutex::new(knowledge),
            actions: Mutex::new(actions),
        }
    }

    pub fn knowledge_len(&self) -> usize {
        self.knowledge.lock().len()
    }

    pub fn action_len(&self) -> usize {
        self.actions.lock().len()
    }

    /// Embed and store `text`. Returns the new chunk id, or `None` when the
    /// text is blank or embedding failed (silently skipped).
    pub async fn add_knowledge(&self, text: &str, source: &str) -> Result<Option<String>> {
        if text.trim().is_empty() {
            return Ok(None);
        }

        let embedding = match self.embedder.embed(text).await {
            Ok(v) if !v.is_empty() => v,
            Ok(_) => return Ok(None),
            Err(e) => {
                debug!("Skipping knowledge from {}: {}", source, e);
                return Ok(None);
            }
        };

        let id = Uuid::new_v4().to_string();
        let mut knowledge = self.knowledge.lock();
        let mut next = knowledge.clone();
        next.push(KnowledgeChunk {
            id: id.clone(),
            text: text.to_string(),
            embedding,
            source: source.to_string(),
        });
        // Memory only follows the file once the write succeeded.
        save_json(&self.knowledge_path, next.as_slice())?;
        *knowledge = next;
        Ok(Some(id))
    }

    /// Split a document into paragraphs and store each one. Returns how many
    /// chunks were stored.
    pub async fn ingest_document(&self, text: &str, source: &str) -> Result<usize> {
        let mut stored = 0;
        for paragraph in text
            .split("\n\n")
            .map(str::trim)
            .filter(|p| p.chars().count() > MIN_PARAGRAPH_CHARS)
        {
            if self.add_knowledge(paragraph, source).await?.is_some() {
                stored += 1;
            }
        }
        Ok(stored)
    }

    /// Ingest every `.txt` and `.md` file directly inside `dir`.
    pub async fn ingest_directory(&self, dir: &Path) -> Result<usize> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut stored = 0;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_text = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("txt") | Some("md")
            );
            if !is_text {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            let content = tokio::fs::read_to_string(&path).await?;
            let count = self.ingest_document(&content, &format!("file:{}", name)).await?;
            info!("Ingested {} chunks from {}", count, name);
            stored += count;
        }
        Ok(stored)
    }

    /// Chunks whose cosine similarity to `query` exceeds the threshold, best
    /// first, at most `limit`. Equal scores keep insertion order.
    pub async fn query_knowledge(&self, query: &str, limit: usize) -> Vec<KnowledgeHit> {
        let empty = self.knowledge.lock().is_empty();
        if empty {
            return Vec::new();
        }

        let query_vec = match self.embedder.embed(query).await {
            Ok(v) if !v.is_empty() => v,
            Ok(_) => return Vec::new(),
            Err(e) => {
                warn!("Knowledge query embedding failed: {}", e);
                return Vec::new();
            }
        };

        let knowledge = self.knowledge.lock();
        let mut hits: Vec<KnowledgeHit> = knowledge
            .iter()
            .map(|chunk| KnowledgeHit {
                text: chunk.text.clone(),
                source: chunk.source.clone(),
                score: cosine_similarity(&query_vec, &chunk.embedding),
            })
            .filter(|hit| hit.score > self.similarity_threshold)
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        hits
    }

    pub fn clear_knowledge(&self) -> Result<()> {
        let mut knowledge = self.knowledge.lock();
        save_json::<[KnowledgeChunk]>(&self.knowledge_path, &[])?;
        knowledge.clear();
        Ok(())
    }

    /// Store `action` for `(page, command)`, replacing any previous entry.
    pub fn save_action(&self, page: &str, command: &str, action: CachedAction) -> Result<()> {
        let key = cache_key(page, command);
        debug!("Caching fast-path action for {}", key);

        let mut actions = self.actions.lock();
        let mut next = actions.clone();
        next.insert(key, action);
        save_json(&self.cache_path, &next)?;
        *actions = next;
        Ok(())
    }

    pub fn get_action(&self, page: &str, command: &str) -> Option<CachedAction> {
        self.actions.lock().get(&cache_key(page, command)).cloned()
    }

    pub fn clear_actions(&self) -> Result<()> {
        let mut actions = self.actions.lock();
        save_json(&self.cache_path, &BTreeMap::<String, CachedAction>::new())?;
        actions.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Embeds known texts to fixed vectors; anything else fails.
    struct TableEmbedder(HashMap<String, Vec<f32>>);

    #[async_trait]
    impl EmbeddingBackend for TableEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.0
                .get(text)
                .cloned()
                .ok_or_else(|| Error::Backend("no embedding".into()))
        }
    }

    /// Embeds any text to a fresh random vector.
    struct NoiseEmbedder;

    #[async_trait]
    impl EmbeddingBackend for NoiseEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok((0..8).map(|_| rand::random::<f32>() * 2.0 - 1.0).collect())
        }
    }

    fn table(entries: &[(&str, Vec<f32>)]) -> Arc<dyn EmbeddingBackend> {
        Arc::new(TableEmbedder(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        ))
    }

    fn store_in(dir: &Path, embedder: Arc<dyn EmbeddingBackend>) -> MemoryStore {
        MemoryStore::open(&AgentConfig::new().with_data_dir(dir), embedder)
    }

    #[tokio::test]
    async fn test_query_filters_and_orders() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(
            dir.path(),
            table(&[
                ("cpa alto", vec![1.0, 0.0]),
                ("ctr bom", vec![0.9, 0.1]),
                ("ortogonal", vec![0.0, 1.0]),
                ("query", vec![1.0, 0.0]),
            ]),
        );

        store.add_knowledge("ortogonal", "t").await.unwrap();
        store.add_knowledge("ctr bom", "t").await.unwrap();
        store.add_knowledge("cpa alto", "t").await.unwrap();

        let hits = store.query_knowledge("query", 5).await;
        let texts: Vec<_> = hits.iter().map(|h| h.text.as_str()).collect();
        assert_eq!(texts, vec!["cpa alto", "ctr bom"]);

        let capped = store.query_knowledge("query", 1).await;
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].text, "cpa alto");
    }

    #[tokio::test]
    async fn test_ties_keep_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(
            dir.path(),
            table(&[
                ("first", vec![1.0, 0.0]),
                ("second", vec![2.0, 0.0]),
                ("q", vec![1.0, 0.0]),
            ]),
        );
        store.add_knowledge("first", "a").await.unwrap();
        store.add_knowledge("second", "b").await.unwrap();

        let hits = store.query_knowledge("q", 2).await;
        assert_eq!(hits[0].text, "first");
        assert_eq!(hits[1].text, "second");
    }

    #[tokio::test]
    async fn test_query_threshold_property() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), Arc::new(NoiseEmbedder));
        for i in 0..60 {
            store.add_knowledge(&format!("chunk {}", i), "noise").await.unwrap();
        }

        for _ in 0..50 {
            let hits = store.query_knowledge("anything", 10).await;
            assert!(hits.len() <= 10);
            assert!(hits.iter().all(|h| h.score > 0.3));
            assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
        }
    }

    #[tokio::test]
    async fn test_failed_embedding_is_silent_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), table(&[]));

        let id = store.add_knowledge("unknown text", "t").await.unwrap();
        assert!(id.is_none());
        assert_eq!(store.knowledge_len(), 0);
        assert!(store.query_knowledge("unknown text", 3).await.is_empty());
        assert!(!dir.path().join("library_db.json").exists());
    }

    #[tokio::test]
    async fn test_knowledge_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = table(&[("fato", vec![0.5, 0.5])]);
        {
            let store = store_in(dir.path(), embedder.clone());
            store.add_knowledge("fato", "maestro_chat").await.unwrap();
        }

        let reopened = store_in(dir.path(), embedder);
        assert_eq!(reopened.knowledge_len(), 1);
        let hits = reopened.query_knowledge("fato", 2).await;
        assert_eq!(hits[0].source, "maestro_chat");
    }

    #[tokio::test]
    async fn test_ingest_document_splits_paragraphs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), Arc::new(NoiseEmbedder));

        let doc = "Primeiro paragrafo longo.\n\ncurto\n\nSegundo paragrafo longo.";
        let stored = store.ingest_document(doc, "file:notes.txt").await.unwrap();
        assert_eq!(stored, 2);
        assert_eq!(store.knowledge_len(), 2);
    }

    #[test]
    fn test_action_cache_normalization() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), table(&[]));
        let action = CachedAction {
            locator: "//*[@id='x']".into(),
            action: ActionKind::Click,
            text: None,
        };

        store
            .save_action("https://x.com/page?foo=1", "Baixar Relatorio", action.clone())
            .unwrap();

        assert_eq!(
            store.get_action("https://x.com/page?bar=2", "baixar relatorio"),
            Some(action)
        );
        assert_eq!(store.get_action("https://x.com/other", "baixar relatorio"), None);
        assert_eq!(store.get_action("https://x.com/page", "baixar"), None);
    }

    #[test]
    fn test_save_action_overwrites_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let first = CachedAction {
            locator: "/html[1]/body[1]/button[1]".into(),
            action: ActionKind::Click,
            text: None,
        };
        let second = CachedAction {
            locator: "/html[1]/body[1]/input[1]".into(),
            action: ActionKind::Type,
            text: Some("psicologo".into()),
        };
        {
            let store = store_in(dir.path(), table(&[]));
            store.save_action("https://a.com", "buscar", first).unwrap();
            store.save_action("https://a.com", "BUSCAR", second.clone()).unwrap();
            assert_eq!(store.action_len(), 1);
        }

        let reopened = store_in(dir.path(), table(&[]));
        assert_eq!(reopened.get_action("https://a.com", "buscar"), Some(second));
    }

    #[test]
    fn test_corrupted_files_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("action_cache.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("library_db.json"), "[1, 2").unwrap();

        let store = store_in(dir.path(), table(&[]));
        assert_eq!(store.action_len(), 0);
        assert_eq!(store.knowledge_len(), 0);
    }

    #[test]
    fn test_clear_actions_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), table(&[]));
        store
            .save_action(
                "https://a.com",
                "abrir",
                CachedAction {
                    locator: "//a".into(),
                    action: ActionKind::Click,
                    text: None,
                },
            )
            .unwrap();

        store.clear_actions().unwrap();
        let raw = std::fs::read_to_string(dir.path().join("action_cache.json")).unwrap();
        assert_eq!(raw.trim(), "{}");
    }

    #[tokio::test]
    async fn test_clear_knowledge_empties_store_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), table(&[("fato", vec![1.0, 0.0])]));
        store.add_knowledge("fato", "t").await.unwrap();

        store.clear_knowledge().unwrap();
        assert_eq!(store.knowledge_len(), 0);
        assert!(store.query_knowledge("fato", 2).await.is_empty());
        let raw = std::fs::read_to_string(dir.path().join("library_db.json")).unwrap();
        assert_eq!(raw.trim(), "[]");
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), table(&[("fato", vec![1.0, 0.0])]));
        let kept = CachedAction {
            locator: "//a".into(),
            action: ActionKind::Click,
            text: None,
        };
        store.save_action("https://a.com", "abrir", kept.clone()).unwrap();

        // A directory where the files belong makes every write fail.
        std::fs::remove_file(dir.path().join("action_cache.json")).unwrap();
        std::fs::create_dir(dir.path().join("action_cache.json")).unwrap();
        std::fs::create_dir(dir.path().join("library_db.json")).unwrap();

        let new_action = CachedAction {
            locator: "//button".into(),
            action: ActionKind::Click,
            text: None,
        };
        assert!(store.save_action("https://a.com", "enviar", new_action).is_err());
        assert_eq!(store.get_action("https://a.com", "enviar"), None);
        assert_eq!(store.action_len(), 1);

        assert!(store.clear_actions().is_err());
        assert_eq!(store.get_action("https://a.com", "abrir"), Some(kept));

        assert!(store.add_knowledge("fato", "t").await.is_err());
        assert_eq!(store.knowledge_len(), 0);
        assert!(store.query_knowledge("fato", 2).await.is_empty());
    }

    #[test]
    fn test_cosine_similarity_edge_cases() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) < 0.0);
    }
}
