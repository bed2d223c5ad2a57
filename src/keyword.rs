//! Keyword index.
//!
//! A tantivy index over path/title/content/tags, owned by the indexer
//! worker and mutated with the delete-term-then-add discipline. Retrieval
//! returns raw per-token hit counts; the scorer maps those onto the fuzzy
//! keyword score.

use crate::error::{EngineError, EngineResult};
use std::collections::HashMap;
use std::path::Path;
use tantivy::collector::DocSetCollector;
use tantivy::query::{FuzzyTermQuery, TermQuery};
use tantivy::schema::{
    Field, IndexRecordOption, Schema, Value, STORED, STRING, TEXT,
};
use tantivy::{Index, IndexReader, IndexWriter, TantivyDocument, Term};

/// Heap for a batch writer; writers live only for the duration of one
/// mutation batch so the index lock is free between batches.
const WRITER_HEAP_BYTES: usize = 15_000_000;

/// Tokens per query actually evaluated; anything beyond is ignored.
const MAX_QUERY_TOKENS: usize = 16;

#[derive(Debug, Clone)]
pub struct KeywordSchema {
    pub path: Field,
    pub title: Field,
    pub content: Field,
    pub tags: Field,
    schema: Schema,
}

impl KeywordSchema {
    pub fn build() -> Self {
        let mut builder = Schema::builder();
        let path = builder.add_text_field("path", STRING | STORED);
        let title = builder.add_text_field("title", TEXT | STORED);
        let content = builder.add_text_field("content", TEXT);
        let tags = builder.add_text_field("tags", TEXT);
        let schema = builder.build();
        Self {
            path,
            title,
            content,
            tags,
            schema,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }
}

/// Per-document outcome of a keyword retrieval pass.
#[derive(Debug, Clone, Default)]
pub struct KeywordDocHits {
    /// Distinct query tokens that matched the content or tags.
    pub hits: usize,
    /// Whether any query token matched the title.
    pub title_match: bool,
}

pub struct KeywordIndex {
    schema: KeywordSchema,
    index: Index,
    reader: IndexReader,
}

impl KeywordIndex {
    pub fn open(dir: &Path) -> EngineResult<Self> {
        std::fs::create_dir_all(dir)?;
        let schema = KeywordSchema::build();
        let index = if dir.join("meta.json").exists() {
            Index::open_in_dir(dir)
                .map_err(|e| EngineError::Fatal(format!("Failed to open keyword index: {e}")))?
        } else {
            Index::create_in_dir(dir, schema.schema().clone())
                .map_err(|e| EngineError::Fatal(format!("Failed to create keyword index: {e}")))?
        };
        let reader = index
            .reader()
            .map_err(|e| EngineError::Fatal(format!("Failed to create keyword reader: {e}")))?;
        Ok(Self {
            schema,
            index,
            reader,
        })
    }

    /// One writer per mutation batch; tantivy allows a single writer at a
    /// time and the worker serialises batches anyway.
    pub fn begin_batch(&self) -> EngineResult<IndexWriter> {
        self.index
            .writer(WRITER_HEAP_BYTES)
            .map_err(|e| EngineError::Fatal(format!("Failed to create keyword writer: {e}")))
    }

    pub fn upsert_into(
        &self,
        writer: &mut IndexWriter,
        path: &str,
        title: Option<&str>,
        content: &str,
        tags: &[String],
    ) -> EngineResult<()> {
        self.delete_in(writer, path);
        let mut doc = TantivyDocument::new();
        doc.add_text(self.schema.path, path);
        if let Some(title) = title {
            doc.add_text(self.schema.title, title);
        }
        doc.add_text(self.schema.content, content);
        if !tags.is_empty() {
            doc.add_text(self.schema.tags, tags.join(" "));
        }
        writer
            .add_document(doc)
            .map_err(|e| EngineError::Fatal(format!("Keyword add failed: {e}")))?;
        Ok(())
    }

    pub fn delete_in(&self, writer: &mut IndexWriter, path: &str) {
        let term = Term::from_field_text(self.schema.path, path);
        writer.delete_term(term);
    }

    /// Commits the batch and refreshes the reader. The writer is consumed,
    /// releasing the index lock.
    pub fn commit_batch(&mut self, mut writer: IndexWriter) -> EngineResult<()> {
        writer
            .commit()
            .map_err(|e| EngineError::Fatal(format!("Keyword commit failed: {e}")))?;
        drop(writer);
        self.reader
            .reload()
            .map_err(|e| EngineError::Fatal(format!("Keyword reader reload failed: {e}")))?;
        Ok(())
    }

    pub fn clear(&mut self) -> EngineResult<()> {
        let mut writer = self.begin_batch()?;
        writer
            .delete_all_documents()
            .map_err(|e| EngineError::Fatal(format!("Keyword clear failed: {e}")))?;
        self.commit_batch(writer)
    }

    pub fn doc_count(&self) -> usize {
        self.reader.searcher().num_docs() as usize
    }

    /// Counts, per document, how many distinct query tokens hit the content
    /// or tags, and whether any token hits the title. Short queries widen
    /// each token with a distance-1 fuzzy match.
    pub fn collect_hits(
        &self,
        tokens: &[String],
        fuzzy: bool,
    ) -> EngineResult<HashMap<String, KeywordDocHits>> {
        let searcher = self.reader.searcher();
        let mut out: HashMap<String, KeywordDocHits> = HashMap::new();

        for token in tokens.iter().take(MAX_QUERY_TOKENS) {
            // A token hitting both content and tags counts once per doc.
            let mut body_paths: std::collections::HashSet<String> =
                std::collections::HashSet::new();
            for field in [self.schema.content, self.schema.tags] {
                for address in self.field_matches(&searcher, field, token, fuzzy)? {
                    if let Some(path) = self.path_of(&searcher, address)? {
                        body_paths.insert(path);
                    }
                }
            }
            for path in body_paths {
                out.entry(path).or_default().hits += 1;
            }
            for address in self.field_matches(&searcher, self.schema.title, token, fuzzy)? {
                if let Some(path) = self.path_of(&searcher, address)? {
                    out.entry(path).or_default().title_match = true;
                }
            }
        }
        Ok(out)
    }

    fn field_matches(
        &self,
        searcher: &tantivy::Searcher,
        field: Field,
        token: &str,
        fuzzy: bool,
    ) -> EngineResult<std::collections::HashSet<tantivy::DocAddress>> {
        let term = Term::from_field_text(field, token);
        let result = if fuzzy {
            searcher.search(&FuzzyTermQuery::new(term, 1, true), &DocSetCollector)
        } else {
            searcher.search(
                &TermQuery::new(term, IndexRecordOption::Basic),
                &DocSetCollector,
            )
        };
        result.map_err(|e| EngineError::Transient(format!("keyword search: {e}")))
    }

    fn path_of(
        &self,
        searcher: &tantivy::Searcher,
        address: tantivy::DocAddress,
    ) -> EngineResult<Option<String>> {
        let doc: TantivyDocument = searcher
            .doc(address)
            .map_err(|e| EngineError::Transient(format!("keyword doc fetch: {e}")))?;
        Ok(doc
            .get_first(self.schema.path)
            .and_then(|v| v.as_str())
            .map(str::to_string))
    }
}

/// Shared query tokenizer: lowercase alphanumeric runs, single chars
/// dropped. Matches tantivy's default tokenizer closely enough for term
/// lookups.
pub fn tokenize(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1 || t.chars().next().is_some_and(|c| c.is_numeric()))
        .map(|t| t.to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}
