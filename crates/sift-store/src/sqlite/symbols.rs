use std::collections::HashMap;

use super::{SqliteStore, line_from_db};
use crate::error::StoreError;
use crate::types::{
    CallEdge, Callee, ChunkId, NameRef, PartitionKey, RepoId, Snapshot, Symbol, SymbolId,
};

type SymbolRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    i64,
    Option<String>,
    String,
);

type LocatedRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    i64,
    Option<String>,
    String,
);

type EdgeRow = (String, String, Option<String>, String, String, i64);

const SYMBOL_COLUMNS: &str = "symbol_id, name, qualname, kind, file_path, language, \
                              start_line, end_line, parent_id, chunk_id";

const EDGE_COLUMNS: &str = "caller_id, callee_name, callee_id, chunk_id, file_path, line";

fn symbol_from_row(row: SymbolRow) -> Result<Symbol, StoreError> {
    let (id, name, qualname, kind, file_path, language, start, end, parent, chunk_id) = row;
    Ok(Symbol {
        id: SymbolId::from_raw(id),
        name,
        qualname,
        kind: kind.parse()?,
        file_path,
        language,
        start_line: line_from_db(start)?,
        end_line: line_from_db(end)?,
        parent: parent.map(SymbolId::from_raw),
        chunk_id: ChunkId::from_raw(chunk_id),
    })
}

fn split_located(row: LocatedRow) -> (String, String, SymbolRow) {
    let (repo, snapshot, id, name, qualname, kind, file_path, language, start, end, parent, chunk) =
        row;
    (
        repo,
        snapshot,
        (id, name, qualname, kind, file_path, language, start, end, parent, chunk),
    )
}

fn edge_from_row(row: EdgeRow) -> Result<CallEdge, StoreError> {
    let (caller, callee_name, callee_id, chunk_id, file_path, line) = row;
    let callee = match callee_id {
        Some(id) => Callee::Resolved {
            symbol_id: SymbolId::from_raw(id),
        },
        None => Callee::Unresolved {
            name: callee_name.clone(),
        },
    };
    Ok(CallEdge {
        caller: SymbolId::from_raw(caller),
        callee_name,
        callee,
        chunk_id: ChunkId::from_raw(chunk_id),
        file_path,
        line: line_from_db(line)?,
    })
}

fn unique_id<'a>(ids: Option<&Vec<&'a str>>) -> Option<&'a str> {
    match ids.map(Vec::as_slice) {
        Some([only]) => Some(*only),
        _ => None,
    }
}

/// Parameters of a symbol lookup.
#[derive(Debug, Clone, Copy)]
pub struct SymbolFilter<'a> {
    /// Case-insensitive substring of the symbol name.
    pub name: &'a str,
    pub language: Option<&'a str>,
    pub path_prefix: Option<&'a str>,
    pub limit: usize,
}

/// A symbol together with the partition it was found in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedSymbol {
    pub key: PartitionKey,
    pub symbol: Symbol,
}

impl SqliteStore {
    /// Symbols whose name contains `filter.name`, exact matches first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub async fn find_symbols(
        &self,
        key: &PartitionKey,
        filter: &SymbolFilter<'_>,
    ) -> Result<Vec<Symbol>, StoreError> {
        let sql = format!(
            "SELECT {SYMBOL_COLUMNS} FROM symbols \
             WHERE repo_id = ?1 AND snapshot = ?2 \
               AND instr(lower(name), lower(?3)) > 0 \
               AND (?4 IS NULL OR language = ?4) \
               AND (?5 IS NULL OR substr(file_path, 1, length(?5)) = ?5) \
             ORDER BY (lower(name) = lower(?3)) DESC, file_path, start_line \
             LIMIT ?6"
        );
        let rows: Vec<SymbolRow> = sqlx::query_as(&sql)
            .bind(key.repo.as_str())
            .bind(key.snapshot.as_str())
            .bind(filter.name)
            .bind(filter.language)
            .bind(filter.path_prefix)
            .bind(i64::try_from(filter.limit)?)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(symbol_from_row).collect()
    }

    /// Look a symbol up by id in any partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub async fn symbol(&self, id: &SymbolId) -> Result<Option<LocatedSymbol>, StoreError> {
        let sql = format!(
            "SELECT repo_id, snapshot, {SYMBOL_COLUMNS} FROM symbols WHERE symbol_id = ?"
        );
        let row: Option<LocatedRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some((repo, snapshot, rest)) = row.map(split_located) else {
            return Ok(None);
        };
        let symbol = symbol_from_row(rest)?;
        Ok(Some(LocatedSymbol {
            key: PartitionKey::new(RepoId::from_raw(repo), Snapshot::parse(&snapshot)),
            symbol,
        }))
    }

    /// All symbols of a partition ordered by file and line.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub async fn symbols_in_partition(&self, key: &PartitionKey) -> Result<Vec<Symbol>, StoreError> {
        let sql = format!(
            "SELECT {SYMBOL_COLUMNS} FROM symbols WHERE repo_id = ? AND snapshot = ? \
             ORDER BY file_path, start_line, symbol_id"
        );
        let rows: Vec<SymbolRow> = sqlx::query_as(&sql)
            .bind(key.repo.as_str())
            .bind(key.snapshot.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(symbol_from_row).collect()
    }

    /// All call edges of a partition ordered by file and line.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub async fn call_edges_in_partition(
        &self,
        key: &PartitionKey,
    ) -> Result<Vec<CallEdge>, StoreError> {
        let sql = format!(
            "SELECT {EDGE_COLUMNS} FROM call_edges WHERE repo_id = ? AND snapshot = ? \
             ORDER BY file_path, line, id"
        );
        let rows: Vec<EdgeRow> = sqlx::query_as(&sql)
            .bind(key.repo.as_str())
            .bind(key.snapshot.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(edge_from_row).collect()
    }

    /// Call edges whose callee name ends in `name`, filtered by the calling file.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub async fn references(
        &self,
        key: &PartitionKey,
        name: &str,
        path_prefix: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CallEdge>, StoreError> {
        let sql = format!(
            "SELECT {EDGE_COLUMNS} FROM call_edges \
             WHERE repo_id = ?1 AND snapshot = ?2 AND callee_base = ?3 \
               AND (?4 IS NULL OR substr(file_path, 1, length(?4)) = ?4) \
             ORDER BY file_path, line, id LIMIT ?5"
        );
        let rows: Vec<EdgeRow> = sqlx::query_as(&sql)
            .bind(key.repo.as_str())
            .bind(key.snapshot.as_str())
            .bind(name)
            .bind(path_prefix)
            .bind(i64::try_from(limit)?)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(edge_from_row).collect()
    }

    /// Every read of `name`, filtered by file, in source order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is malformed.
    pub async fn name_references(
        &self,
        key: &PartitionKey,
        name: &str,
        path_prefix: Option<&str>,
        limit: usize,
    ) -> Result<Vec<NameRef>, StoreError> {
        let rows: Vec<(String, String, i64, i64, String)> = sqlx::query_as(
            "SELECT name, file_path, line, col, context FROM name_refs \
             WHERE repo_id = ?1 AND snapshot = ?2 AND name = ?3 \
               AND (?4 IS NULL OR substr(file_path, 1, length(?4)) = ?4) \
             ORDER BY file_path, line, col LIMIT ?5",
        )
        .bind(key.repo.as_str())
        .bind(key.snapshot.as_str())
        .bind(name)
        .bind(path_prefix)
        .bind(i64::try_from(limit)?)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(name, file_path, line, col, context)| {
                Ok(NameRef {
                    name,
                    file_path,
                    line: line_from_db(line)?,
                    column: line_from_db(col)?,
                    context,
                })
            })
            .collect()
    }

    /// Recompute the resolved target of every call edge in a partition.
    ///
    /// A callee resolves to the unique symbol with its base name in the caller's file,
    /// else to the unique symbol with that name in the partition, else stays unresolved.
    /// Returns the number of edges whose target changed.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails; the transaction is rolled back.
    pub async fn resolve_call_edges(&self, key: &PartitionKey) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;

        let symbols: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT symbol_id, name, file_path FROM symbols WHERE repo_id = ? AND snapshot = ?",
        )
        .bind(key.repo.as_str())
        .bind(key.snapshot.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let mut by_name: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut by_file: HashMap<(&str, &str), Vec<&str>> = HashMap::new();
        for (id, name, path) in &symbols {
            by_name.entry(name.as_str()).or_default().push(id.as_str());
            by_file
                .entry((name.as_str(), path.as_str()))
                .or_default()
                .push(id.as_str());
        }

        let edges: Vec<(i64, String, String, Option<String>)> = sqlx::query_as(
            "SELECT id, callee_base, file_path, callee_id FROM call_edges \
             WHERE repo_id = ? AND snapshot = ?",
        )
        .bind(key.repo.as_str())
        .bind(key.snapshot.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let mut changed = 0usize;
        for (row_id, base, path, current) in &edges {
            let target = unique_id(by_file.get(&(base.as_str(), path.as_str())))
                .or_else(|| unique_id(by_name.get(base.as_str())));
            if target == current.as_deref() {
                continue;
            }
            sqlx::query("UPDATE call_edges SET callee_id = ? WHERE id = ?")
                .bind(target)
                .bind(*row_id)
                .execute(&mut *tx)
                .await?;
            changed += 1;
        }

        tx.commit().await?;
        if changed > 0 {
            tracing::debug!(partition = %key, changed, "call edges re-resolved");
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{generation, key, memory_store};
    use super::*;

    #[tokio::test]
    async fn find_symbols_substring_exact_first() {
        let store = memory_store().await;
        let k = key(Snapshot::WorkingTree);
        store
            .replace_file(&k, &generation(&k, "a.py", "login_user", &[]))
            .await
            .unwrap();
        store
            .replace_file(&k, &generation(&k, "b.py", "login", &[]))
            .await
            .unwrap();

        let filter = SymbolFilter {
            name: "LOGIN",
            language: None,
            path_prefix: None,
            limit: 10,
        };
        let found = store.find_symbols(&k, &filter).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "login");

        let filter = SymbolFilter {
            path_prefix: Some("a."),
            ..filter
        };
        let found = store.find_symbols(&k, &filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "login_user");

        let filter = SymbolFilter {
            language: Some("rust"),
            path_prefix: None,
            ..filter
        };
        assert!(store.find_symbols(&k, &filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn symbol_lookup_reports_partition() {
        let store = memory_store().await;
        let k = key(Snapshot::Commit("abc".into()));
        let g = generation(&k, "auth.py", "login", &[]);
        store.replace_file(&k, &g).await.unwrap();

        let located = store.symbol(&g.symbols[0].id).await.unwrap().unwrap();
        assert_eq!(located.key, k);
        assert_eq!(located.symbol, g.symbols[0]);
        assert!(
            store
                .symbol(&SymbolId::from_raw("nope"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn resolve_unique_name_across_files() {
        let store = memory_store().await;
        let k = key(Snapshot::WorkingTree);
        let auth = generation(&k, "auth.py", "login", &[]);
        store.replace_file(&k, &auth).await.unwrap();
        store
            .replace_file(&k, &generation(&k, "main.py", "run", &["login", "print"]))
            .await
            .unwrap();

        assert_eq!(store.resolve_call_edges(&k).await.unwrap(), 1);
        assert_eq!(store.resolve_call_edges(&k).await.unwrap(), 0);

        let refs = store.references(&k, "login", None, 10).await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(
            refs[0].callee,
            Callee::Resolved {
                symbol_id: auth.symbols[0].id.clone()
            }
        );

        let edges = store.call_edges_in_partition(&k).await.unwrap();
        let print = edges.iter().find(|e| e.callee_name == "print").unwrap();
        assert_eq!(
            print.callee,
            Callee::Unresolved {
                name: "print".into()
            }
        );
    }

    #[tokio::test]
    async fn ambiguous_name_stays_unresolved() {
        let store = memory_store().await;
        let k = key(Snapshot::WorkingTree);
        store
            .replace_file(&k, &generation(&k, "a.py", "helper", &[]))
            .await
            .unwrap();
        store
            .replace_file(&k, &generation(&k, "b.py", "helper", &[]))
            .await
            .unwrap();
        store
            .replace_file(&k, &generation(&k, "main.py", "run", &["helper"]))
            .await
            .unwrap();

        assert_eq!(store.resolve_call_edges(&k).await.unwrap(), 0);
        let refs = store.references(&k, "helper", None, 10).await.unwrap();
        assert!(matches!(refs[0].callee, Callee::Unresolved { .. }));
    }

    #[tokio::test]
    async fn dotted_callee_matches_base_name() {
        let store = memory_store().await;
        let k = key(Snapshot::WorkingTree);
        store
            .replace_file(&k, &generation(&k, "auth.py", "login", &[]))
            .await
            .unwrap();
        store
            .replace_file(&k, &generation(&k, "main.py", "run", &["self.auth.login"]))
            .await
            .unwrap();
        store.resolve_call_edges(&k).await.unwrap();

        let refs = store
            .references(&k, "login", Some("main"), 10)
            .await
            .unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].callee_name, "self.auth.login");
        assert!(
            store
                .references(&k, "login", Some("tests/"), 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn name_references_follow_file_generations() {
        let store = memory_store().await;
        let k = key(Snapshot::WorkingTree);
        store
            .replace_file(&k, &generation(&k, "main.py", "run", &["self.auth.login"]))
            .await
            .unwrap();
        store
            .replace_file(&k, &generation(&k, "cli.py", "main", &["login"]))
            .await
            .unwrap();

        let refs = store.name_references(&k, "login", None, 10).await.unwrap();
        let files: Vec<&str> = refs.iter().map(|r| r.file_path.as_str()).collect();
        assert_eq!(files, ["cli.py", "main.py"]);
        assert_eq!(refs[1].context, "def run(): self.auth.login");

        let refs = store
            .name_references(&k, "login", Some("main"), 10)
            .await
            .unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(store.name_references(&k, "login", None, 1).await.unwrap().len(), 1);

        store
            .replace_file(&k, &generation(&k, "main.py", "run", &[]))
            .await
            .unwrap();
        store.remove_file(&k, "cli.py").await.unwrap();
        assert!(store.name_references(&k, "login", None, 10).await.unwrap().is_empty());
    }
}
