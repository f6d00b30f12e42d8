//! In-memory BM25 index over chunk tokens, one per partition.
//!
//! Postings are persisted by the metadata store alongside each chunk generation; the
//! in-memory index is hydrated from them on first use and then updated incrementally as
//! files are replaced or removed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use sift_store::sqlite::LexicalDoc;
use sift_store::{Chunk, ChunkId, ChunkKind, PartitionKey, SqliteStore};
use tokio::sync::Mutex;

use crate::error::Result;

/// Split text into lowercase terms.
///
/// Splits on every non-alphanumeric character (so `snake_case` splits on `_`) and on case
/// changes inside identifiers: `parseConfig` yields `parse`, `config`, and `HTTPServer`
/// yields `http`, `server`.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        if !word.is_empty() {
            split_identifier(word, &mut tokens);
        }
    }
    tokens
}

fn split_identifier(word: &str, out: &mut Vec<String>) {
    let chars: Vec<char> = word.chars().collect();
    let mut start = 0;
    for i in 1..chars.len() {
        let (prev, cur) = (chars[i - 1], chars[i]);
        let lower_to_upper = (prev.is_lowercase() || prev.is_numeric()) && cur.is_uppercase();
        let acronym_end = prev.is_uppercase()
            && cur.is_uppercase()
            && chars.get(i + 1).is_some_and(|n| n.is_lowercase());
        if lower_to_upper || acronym_end {
            out.push(chars[start..i].iter().collect::<String>().to_lowercase());
            start = i;
        }
    }
    out.push(chars[start..].iter().collect::<String>().to_lowercase());
}

/// Term frequencies of a text, sorted by term, plus its token count.
#[must_use]
pub fn term_counts(text: &str) -> (Vec<(String, u32)>, u32) {
    let tokens = tokenize(text);
    let count = u32::try_from(tokens.len()).unwrap_or(u32::MAX);
    let mut counts: BTreeMap<String, u32> = BTreeMap::new();
    for token in tokens {
        *counts.entry(token).or_default() += 1;
    }
    (counts.into_iter().collect(), count)
}

/// BM25 constants.
#[derive(Debug, Clone, Copy)]
pub struct Bm25 {
    pub k1: f64,
    pub b: f64,
}

impl Default for Bm25 {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

/// Filterable attributes of an indexed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocMeta {
    pub path: String,
    pub language: String,
    pub kind: ChunkKind,
    pub symbol_name: Option<String>,
}

impl DocMeta {
    #[must_use]
    pub fn of(chunk: &Chunk) -> Self {
        Self {
            path: chunk.file_path.clone(),
            language: chunk.language.clone(),
            kind: chunk.kind,
            symbol_name: chunk.symbol_name.clone(),
        }
    }
}

impl From<&LexicalDoc> for DocMeta {
    fn from(doc: &LexicalDoc) -> Self {
        Self {
            path: doc.file_path.clone(),
            language: doc.language.clone(),
            kind: doc.kind,
            symbol_name: doc.symbol_name.clone(),
        }
    }
}

/// Restricts which documents may score.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocFilter<'a> {
    pub path_prefix: Option<&'a str>,
    pub language: Option<&'a str>,
    pub kind: Option<ChunkKind>,
    pub symbol_name: Option<&'a str>,
}

impl DocFilter<'_> {
    fn matches(&self, meta: &DocMeta) -> bool {
        self.path_prefix.is_none_or(|p| meta.path.starts_with(p))
            && self.language.is_none_or(|l| meta.language == l)
            && self.kind.is_none_or(|k| meta.kind == k)
            && self
                .symbol_name
                .is_none_or(|n| meta.symbol_name.as_deref() == Some(n))
    }
}

#[derive(Debug, Clone)]
struct DocEntry {
    len: u32,
    terms: Vec<String>,
    meta: DocMeta,
}

/// Inverted index for one partition.
#[derive(Debug, Default)]
pub struct LexicalIndex {
    postings: HashMap<String, BTreeMap<ChunkId, u32>>,
    docs: HashMap<ChunkId, DocEntry>,
    total_len: u64,
}

impl LexicalIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted postings.
    #[must_use]
    pub fn from_docs(docs: Vec<LexicalDoc>) -> Self {
        let mut index = Self::new();
        for doc in docs {
            let meta = DocMeta::from(&doc);
            index.insert(doc.chunk_id, meta, &doc.terms, doc.token_count);
        }
        index
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &ChunkId) -> bool {
        self.docs.contains_key(id)
    }

    /// Insert pre-counted terms, replacing any previous entry with the same id. Cost is
    /// proportional to the number of distinct terms.
    pub fn insert(&mut self, id: ChunkId, meta: DocMeta, terms: &[(String, u32)], token_count: u32) {
        self.remove(&id);
        for (term, tf) in terms {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(id.clone(), *tf);
        }
        self.total_len += u64::from(token_count);
        self.docs.insert(
            id,
            DocEntry {
                len: token_count,
                terms: terms.iter().map(|(t, _)| t.clone()).collect(),
                meta,
            },
        );
    }

    /// Drop a chunk's postings. Returns `false` if it was not indexed.
    pub fn remove(&mut self, id: &ChunkId) -> bool {
        let Some(doc) = self.docs.remove(id) else {
            return false;
        };
        for term in &doc.terms {
            if let Some(list) = self.postings.get_mut(term) {
                list.remove(id);
                if list.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        self.total_len -= u64::from(doc.len);
        true
    }

    /// BM25 score of every matching document. Query terms are deduplicated; documents
    /// without any query term are absent from the result.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn score(
        &self,
        query_terms: &[String],
        params: Bm25,
        filter: &DocFilter<'_>,
    ) -> HashMap<ChunkId, f64> {
        let mut scores: HashMap<ChunkId, f64> = HashMap::new();
        if self.docs.is_empty() {
            return scores;
        }
        let n = self.docs.len() as f64;
        let avg_len = (self.total_len as f64 / n).max(1.0);

        let mut seen = Vec::with_capacity(query_terms.len());
        for term in query_terms {
            if seen.contains(&term) {
                continue;
            }
            seen.push(term);
            let Some(list) = self.postings.get(term) else {
                continue;
            };
            let df = list.len() as f64;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            for (id, tf) in list {
                let Some(doc) = self.docs.get(id) else {
                    continue;
                };
                if !filter.matches(&doc.meta) {
                    continue;
                }
                let tf = f64::from(*tf);
                let norm = params.k1 * (1.0 - params.b + params.b * f64::from(doc.len) / avg_len);
                *scores.entry(id.clone()).or_default() += idf * tf * (params.k1 + 1.0) / (tf + norm);
            }
        }
        scores
    }
}

pub type SharedIndex = Arc<RwLock<LexicalIndex>>;

/// Lazily hydrated lexical indexes keyed by partition.
#[derive(Debug, Default)]
pub(crate) struct LexicalCache {
    partitions: Mutex<HashMap<PartitionKey, SharedIndex>>,
}

impl LexicalCache {
    /// The partition's index, loading it from the store on first use.
    pub(crate) async fn get(&self, store: &SqliteStore, key: &PartitionKey) -> Result<SharedIndex> {
        let mut partitions = self.partitions.lock().await;
        if let Some(index) = partitions.get(key) {
            return Ok(Arc::clone(index));
        }
        let docs = store.lexical_docs(key).await?;
        tracing::debug!(partition = %key, docs = docs.len(), "hydrated lexical index");
        let index = Arc::new(RwLock::new(LexicalIndex::from_docs(docs)));
        partitions.insert(key.clone(), Arc::clone(&index));
        Ok(index)
    }
}

pub(crate) fn read(index: &SharedIndex) -> std::sync::RwLockReadGuard<'_, LexicalIndex> {
    index.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write(index: &SharedIndex) -> std::sync::RwLockWriteGuard<'_, LexicalIndex> {
    index.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(raw: &str) -> ChunkId {
        ChunkId::from_raw(raw)
    }

    fn meta(path: &str) -> DocMeta {
        DocMeta {
            path: path.into(),
            language: "python".into(),
            kind: ChunkKind::Function,
            symbol_name: None,
        }
    }

    fn add(index: &mut LexicalIndex, raw: &str, path: &str, text: &str) {
        let (terms, len) = term_counts(text);
        index.insert(id(raw), meta(path), &terms, len);
    }

    fn terms(query: &str) -> Vec<String> {
        tokenize(query)
    }

    #[test]
    fn tokenize_splits_case_and_underscores() {
        assert_eq!(tokenize("parseConfig"), vec!["parse", "config"]);
        assert_eq!(tokenize("parse_config"), vec!["parse", "config"]);
        assert_eq!(tokenize("HTTPServer.start()"), vec!["http", "server", "start"]);
        assert_eq!(tokenize("def login(user_id):"), vec!["def", "login", "user", "id"]);
        assert_eq!(tokenize("utf8Decode"), vec!["utf8", "decode"]);
    }

    #[test]
    fn tokenize_empty_and_symbols() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("()[]{} -- ::").is_empty());
    }

    #[test]
    fn term_counts_are_sorted() {
        let (counts, len) = term_counts("b a b");
        assert_eq!(counts, vec![("a".into(), 1), ("b".into(), 2)]);
        assert_eq!(len, 3);
    }

    #[test]
    fn exact_term_ranks_matching_chunk_first() {
        let mut index = LexicalIndex::new();
        add(&mut index, "a", "auth.py", "def login(): pass");
        add(&mut index, "b", "main.py", "def run(): start()");
        add(&mut index, "c", "util.py", "def helper(): return 1");
        let scores = index.score(&terms("login"), Bm25::default(), &DocFilter::default());
        assert_eq!(scores.len(), 1);
        assert!(scores[&id("a")] > 0.0);
    }

    #[test]
    fn rarer_terms_weigh_more() {
        let mut index = LexicalIndex::new();
        add(&mut index, "a", "a.py", "common rare");
        add(&mut index, "b", "b.py", "common other");
        add(&mut index, "c", "c.py", "common thing");
        let scores = index.score(&terms("common rare"), Bm25::default(), &DocFilter::default());
        assert!(scores[&id("a")] > scores[&id("b")]);
    }

    #[test]
    fn duplicate_query_terms_count_once() {
        let mut index = LexicalIndex::new();
        add(&mut index, "a", "a.py", "login");
        add(&mut index, "b", "b.py", "logout");
        let once = index.score(&terms("login"), Bm25::default(), &DocFilter::default());
        let twice = index.score(&terms("login login"), Bm25::default(), &DocFilter::default());
        assert!((once[&id("a")] - twice[&id("a")]).abs() < 1e-12);
    }

    #[test]
    fn filter_restricts_paths_and_language() {
        let mut index = LexicalIndex::new();
        add(&mut index, "a", "src/auth.py", "login");
        add(&mut index, "b", "tests/test_auth.py", "login");
        let filter = DocFilter {
            path_prefix: Some("src/"),
            ..DocFilter::default()
        };
        let scores = index.score(&terms("login"), Bm25::default(), &filter);
        assert_eq!(scores.keys().collect::<Vec<_>>(), vec![&id("a")]);

        let filter = DocFilter {
            language: Some("rust"),
            ..DocFilter::default()
        };
        assert!(index.score(&terms("login"), Bm25::default(), &filter).is_empty());
    }

    #[test]
    fn filter_restricts_kind_and_symbol_name() {
        let mut index = LexicalIndex::new();
        let (login_terms, login_len) = term_counts("def login(): session");
        let login = DocMeta {
            symbol_name: Some("login".into()),
            ..meta("auth.py")
        };
        index.insert(id("a"), login, &login_terms, login_len);
        let (window_terms, window_len) = term_counts("session = None");
        let window = DocMeta {
            kind: ChunkKind::ModuleWindow,
            ..meta("auth.py")
        };
        index.insert(id("b"), window, &window_terms, window_len);

        let functions = DocFilter {
            kind: Some(ChunkKind::Function),
            ..DocFilter::default()
        };
        let scores = index.score(&terms("session"), Bm25::default(), &functions);
        assert_eq!(scores.keys().collect::<Vec<_>>(), vec![&id("a")]);

        let named = DocFilter {
            symbol_name: Some("logout"),
            ..DocFilter::default()
        };
        assert!(index.score(&terms("session"), Bm25::default(), &named).is_empty());
        let named = DocFilter {
            symbol_name: Some("login"),
            ..DocFilter::default()
        };
        assert_eq!(index.score(&terms("session"), Bm25::default(), &named).len(), 1);
    }

    #[test]
    fn remove_then_reinsert_restores_scores() {
        let mut index = LexicalIndex::new();
        add(&mut index, "a", "a.py", "alpha beta");
        add(&mut index, "b", "b.py", "beta gamma");
        let before = index.score(&terms("beta"), Bm25::default(), &DocFilter::default());

        assert!(index.remove(&id("b")));
        assert!(!index.remove(&id("b")));
        assert!(!index.contains(&id("b")));
        assert!(index.score(&terms("gamma"), Bm25::default(), &DocFilter::default()).is_empty());

        add(&mut index, "b", "b.py", "beta gamma");
        let after = index.score(&terms("beta"), Bm25::default(), &DocFilter::default());
        assert_eq!(before, after);
    }

    #[test]
    fn reinsert_same_id_replaces_terms() {
        let mut index = LexicalIndex::new();
        add(&mut index, "a", "a.py", "old words");
        add(&mut index, "a", "a.py", "new words");
        assert_eq!(index.len(), 1);
        assert!(index.score(&terms("old"), Bm25::default(), &DocFilter::default()).is_empty());
        assert!(!index.score(&terms("new"), Bm25::default(), &DocFilter::default()).is_empty());
    }

    #[test]
    fn empty_index_scores_nothing() {
        let index = LexicalIndex::new();
        assert!(index.is_empty());
        assert!(index.score(&terms("x"), Bm25::default(), &DocFilter::default()).is_empty());
    }

    #[test]
    fn from_docs_matches_incremental_build() {
        let (terms_a, len_a) = term_counts("def login(): pass");
        let docs = vec![LexicalDoc {
            chunk_id: id("a"),
            file_path: "auth.py".into(),
            language: "python".into(),
            kind: ChunkKind::Function,
            symbol_name: None,
            token_count: len_a,
            terms: terms_a,
        }];
        let hydrated = LexicalIndex::from_docs(docs);
        let mut built = LexicalIndex::new();
        add(&mut built, "a", "auth.py", "def login(): pass");
        let q = terms("login");
        assert_eq!(
            hydrated.score(&q, Bm25::default(), &DocFilter::default()),
            built.score(&q, Bm25::default(), &DocFilter::default())
        );
    }

    proptest! {
        #[test]
        fn tokens_are_lowercase_alphanumeric(text in "[ -~]{0,64}") {
            for token in tokenize(&text) {
                prop_assert!(!token.is_empty());
                prop_assert!(token.chars().all(char::is_alphanumeric));
                prop_assert_eq!(token.clone(), token.to_lowercase());
            }
        }

        #[test]
        fn snake_and_camel_agree(a in "[a-z]{1,8}", b in "[a-z]{1,8}") {
            let camel = format!("{a}{}{}", b[..1].to_uppercase(), &b[1..]);
            let snake = format!("{a}_{b}");
            prop_assert_eq!(tokenize(&camel), tokenize(&snake));
        }

        #[test]
        fn scores_are_positive(words in proptest::collection::vec("[a-z]{1,6}", 1..20)) {
            let mut index = LexicalIndex::new();
            add(&mut index, "a", "a.py", &words.join(" "));
            add(&mut index, "b", "b.py", "unrelated filler");
            let scores = index.score(&words, Bm25::default(), &DocFilter::default());
            prop_assert!(scores.values().all(|s| *s > 0.0));
        }
    }
}
