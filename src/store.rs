use std::{fs::File, io::BufWriter, path::Path, sync::Arc};

use rusqlite::{params, Connection};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

pub const CONTENT_TYPE: &str = "documentation";
const DEFAULT_CATEGORY: &str = "general";
const DEFAULT_SUBCATEGORY: &str = "overview";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("db error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Document {
    pub url: String,
    pub title: String,
    pub content: String,
    pub content_type: String,
    pub category: String,
    pub subcategory: String,
    pub content_hash: String,
    pub word_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ExportedDocument {
    pub url: String,
    pub title: String,
    pub content: String,
    pub category: String,
    pub subcategory: String,
    pub word_count: i64,
    pub scraped_at: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct StoreSummary {
    pub total_docs: i64,
    pub total_words: i64,
    pub avg_words_per_doc: f64,
    pub categories: i64,
    pub min_words: i64,
    pub max_words: i64,
}

/// SQLite-backed `documents` table keyed by URL.
#[derive(Clone)]
pub struct DocumentStore {
    conn: Arc<Mutex<Connection>>,
}

impl DocumentStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT UNIQUE NOT NULL,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                content_type TEXT NOT NULL DEFAULT 'documentation',
                scraped_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                word_count INTEGER NOT NULL DEFAULT 0,
                category TEXT,
                subcategory TEXT,
                content_hash TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_documents_url ON documents(url);
            CREATE INDEX IF NOT EXISTS idx_documents_category ON documents(category);
            CREATE INDEX IF NOT EXISTS idx_documents_content_hash ON documents(content_hash);
            "#,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Every URL already stored; used to seed the visited set.
    pub async fn known_urls(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT url FROM documents")?;
        let urls = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(urls)
    }

    /// Writes all documents in one transaction, replacing rows with the same
    /// URL. Any failure rolls the whole batch back.
    pub async fn upsert_batch(&self, docs: &[Document]) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT OR REPLACE INTO documents (
                    url, title, content, content_type, word_count,
                    category, subcategory, content_hash
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )?;
            for doc in docs {
                stmt.execute(params![
                    doc.url,
                    doc.title,
                    doc.content,
                    doc.content_type,
                    doc.word_count as i64,
                    doc.category,
                    doc.subcategory,
                    doc.content_hash,
                ])?;
            }
        }
        tx.commit()?;
        Ok(docs.len())
    }

    #[cfg(test)]
    pub async fn get(&self, url: &str) -> Result<Option<Document>, StoreError> {
        use rusqlite::OptionalExtension;

        let conn = self.conn.lock().await;
        let doc = conn
            .query_row(
                r#"
                SELECT url, title, content, content_type, word_count,
                       category, subcategory, content_hash
                FROM documents WHERE url = ?1
                "#,
                params![url],
                |row| {
                    Ok(Document {
                        url: row.get(0)?,
                        title: row.get(1)?,
                        content: row.get(2)?,
                        content_type: row.get(3)?,
                        word_count: row.get::<_, i64>(4)?.max(0) as usize,
                        category: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                        subcategory: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                        content_hash: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(doc)
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    /// Dumps documentation rows as a pretty JSON array, grouped by category.
    pub async fn export_json(&self, path: impl AsRef<Path>) -> Result<usize, StoreError> {
        let docs = {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare(
                r#"
                SELECT url, title, content, category, subcategory, word_count, scraped_at
                FROM documents
                WHERE content_type = 'documentation'
                ORDER BY category, subcategory, title
                "#,
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ExportedDocument {
                    url: row.get(0)?,
                    title: row.get(1)?,
                    content: row.get(2)?,
                    category: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    subcategory: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                    word_count: row.get(5)?,
                    scraped_at: row.get(6)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &docs)?;
        Ok(docs.len())
    }

    pub async fn summary(&self) -> Result<StoreSummary, StoreError> {
        let conn = self.conn.lock().await;
        let summary = conn.query_row(
            r#"
            SELECT COUNT(*), SUM(word_count), AVG(word_count),
                   COUNT(DISTINCT category), MIN(word_count), MAX(word_count)
            FROM documents
            "#,
            [],
            |row| {
                Ok(StoreSummary {
                    total_docs: row.get(0)?,
                    total_words: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    avg_words_per_doc: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                    categories: row.get(3)?,
                    min_words: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                    max_words: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
                })
            },
        )?;
        Ok(summary)
    }

    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<(), StoreError> {
        self.conn.lock().await.execute_batch(sql)?;
        Ok(())
    }
}

pub fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Category and subcategory are the first two path segments after an
/// optional `xx-yy` locale segment.
pub fn categorize(url: &str) -> (String, String) {
    let segments: Vec<String> = Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .map(|s| s.filter(|seg| !seg.is_empty()).map(str::to_string).collect())
        })
        .unwrap_or_default();

    let skip = usize::from(segments.first().is_some_and(|seg| is_locale(seg)));
    let mut rest = segments.iter().skip(skip).take(2);
    let category = rest.next().cloned().unwrap_or_else(|| DEFAULT_CATEGORY.to_string());
    let subcategory = rest
        .next()
        .cloned()
        .unwrap_or_else(|| DEFAULT_SUBCATEGORY.to_string());
    (category, subcategory)
}

// `en-us`, `pt-br`, `zh-hans`, `sr-latn`...
fn is_locale(segment: &str) -> bool {
    match segment.split_once('-') {
        Some((lang, region)) => {
            lang.len() == 2
                && lang.bytes().all(|b| b.is_ascii_lowercase())
                && (2..=4).contains(&region.len())
                && region.bytes().all(|b| b.is_ascii_alphabetic())
        }
        None => false,
    }
}

pub fn build_document(url: &str, title: String, content: String) -> Document {
    let (category, subcategory) = categorize(url);
    Document {
        url: url.to_string(),
        title,
        content_type: CONTENT_TYPE.to_string(),
        category,
        subcategory,
        content_hash: hash_content(&content),
        word_count: content.split_whitespace().count(),
        content,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(url: &str, body: &str) -> Document {
        build_document(url, format!("Title for {url}"), body.to_string())
    }

    #[test]
    fn document_fields_are_derived_from_url_and_content() {
        let d = build_document(
            "https://learn.microsoft.com/en-us/azure/app-service/overview",
            "App Service".into(),
            "Azure App Service hosts web apps".into(),
        );
        assert_eq!(d.category, "azure");
        assert_eq!(d.subcategory, "app-service");
        assert_eq!(d.word_count, 6);
        assert_eq!(d.content_type, "documentation");
        assert_eq!(d.content_hash, hash_content("Azure App Service hosts web apps"));
        assert_eq!(d.content_hash.len(), 64);
    }

    #[test]
    fn categorize_falls_back_for_short_paths() {
        assert_eq!(
            categorize("https://site.example/docs/"),
            ("docs".to_string(), "overview".to_string())
        );
        assert_eq!(
            categorize("https://learn.microsoft.com/en-us/"),
            ("general".to_string(), "overview".to_string())
        );
        assert_eq!(
            categorize("garbage"),
            ("general".to_string(), "overview".to_string())
        );
    }

    #[test]
    fn script_locales_are_not_categories() {
        assert_eq!(
            categorize("https://learn.microsoft.com/zh-hans/azure/functions/"),
            ("azure".to_string(), "functions".to_string())
        );
        assert_eq!(
            categorize("https://learn.microsoft.com/pt-br/dotnet/"),
            ("dotnet".to_string(), "overview".to_string())
        );
        // only a leading segment is treated as a locale
        assert_eq!(
            categorize("https://learn.microsoft.com/en-us/ai-ml/ml-ops"),
            ("ai-ml".to_string(), "ml-ops".to_string())
        );
        assert!(!is_locale("app-service"));
    }

    #[tokio::test]
    async fn upsert_replaces_rows_with_same_url() {
        let store = DocumentStore::open_in_memory().unwrap();
        store
            .upsert_batch(&[doc("https://a.test/x", "first"), doc("https://a.test/y", "other")])
            .await
            .unwrap();
        store.upsert_batch(&[doc("https://a.test/x", "second version")]).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
        let got = store.get("https://a.test/x").await.unwrap().unwrap();
        assert_eq!(got.content, "second version");
        assert_eq!(got.word_count, 2);
        assert!(store.get("https://a.test/missing").await.unwrap().is_none());

        let mut known = store.known_urls().await.unwrap();
        known.sort();
        assert_eq!(known, vec!["https://a.test/x", "https://a.test/y"]);
    }

    #[tokio::test]
    async fn failed_batch_leaves_no_partial_rows() {
        let store = DocumentStore::open_in_memory().unwrap();
        store
            .execute_raw(
                "CREATE TRIGGER reject_bad BEFORE INSERT ON documents \
                 WHEN NEW.url LIKE '%bad%' BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .await
            .unwrap();

        let result = store
            .upsert_batch(&[doc("https://a.test/good", "ok"), doc("https://a.test/bad", "no")])
            .await;
        assert!(result.is_err());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn summary_and_export_reflect_stored_rows() {
        let store = DocumentStore::open_in_memory().unwrap();
        assert_eq!(store.summary().await.unwrap(), StoreSummary::default());

        store
            .upsert_batch(&[
                doc("https://learn.microsoft.com/en-us/azure/storage/intro", "one two three"),
                doc("https://learn.microsoft.com/en-us/sql/relational-databases/x", "one"),
            ])
            .await
            .unwrap();

        let summary = store.summary().await.unwrap();
        assert_eq!(summary.total_docs, 2);
        assert_eq!(summary.total_words, 4);
        assert_eq!(summary.categories, 2);
        assert_eq!(summary.min_words, 1);
        assert_eq!(summary.max_words, 3);
        assert!((summary.avg_words_per_doc - 2.0).abs() < f64::EPSILON);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("documents.json");
        assert_eq!(store.export_json(&path).await.unwrap(), 2);
        let exported: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(exported[0]["category"], "azure");
        assert_eq!(exported[1]["category"], "sql");
        assert!(exported[0]["scraped_at"].is_string());
    }
}
