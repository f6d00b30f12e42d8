//! Content-addressed chunking: tree-sitter regions for structural languages, overlapping
//! line windows for everything else.

use serde::{Deserialize, Serialize};
use sift_store::{
    CallEdge, Callee, Chunk, ChunkId, ChunkKind, NameRef, PartitionKey, Symbol, SymbolId,
};
use tree_sitter::{Node, Parser};

use crate::languages::Lang;
use crate::python;

/// Chunker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Definitions larger than this many characters are split into line windows.
    pub max_chunk_chars: usize,
    /// Maximum lines per window (default: 220).
    pub window_lines: usize,
    /// Lines shared by neighbouring windows of one split region (default: 40).
    pub window_overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 8000,
            window_lines: 220,
            window_overlap: 40,
        }
    }
}

/// Output of chunking one file.
#[derive(Debug, Clone)]
pub enum Chunked {
    /// Structural parse succeeded.
    Parsed {
        chunks: Vec<Chunk>,
        symbols: Vec<Symbol>,
        calls: Vec<CallEdge>,
        name_refs: Vec<NameRef>,
    },
    /// Language without a structural chunker.
    Windowed { chunks: Vec<Chunk> },
    /// Structural parse failed; the file was windowed instead.
    Degraded {
        chunks: Vec<Chunk>,
        parse_error: String,
    },
}

impl Chunked {
    #[must_use]
    pub fn chunks(&self) -> &[Chunk] {
        match self {
            Self::Parsed { chunks, .. }
            | Self::Windowed { chunks }
            | Self::Degraded { chunks, .. } => chunks,
        }
    }

    #[must_use]
    pub fn parse_error(&self) -> Option<&str> {
        match self {
            Self::Degraded { parse_error, .. } => Some(parse_error),
            _ => None,
        }
    }

    /// Split into chunks, symbols, call edges and name references.
    #[must_use]
    pub fn into_parts(self) -> (Vec<Chunk>, Vec<Symbol>, Vec<CallEdge>, Vec<NameRef>) {
        match self {
            Self::Parsed {
                chunks,
                symbols,
                calls,
                name_refs,
            } => (chunks, symbols, calls, name_refs),
            Self::Windowed { chunks } | Self::Degraded { chunks, .. } => {
                (chunks, Vec::new(), Vec::new(), Vec::new())
            }
        }
    }
}

/// Shared state for building the chunks of one file.
struct FileCtx<'a> {
    key: &'a PartitionKey,
    path: &'a str,
    text: &'a str,
    lang: Lang,
    lines: Vec<&'a str>,
    config: &'a ChunkerConfig,
}

impl<'a> FileCtx<'a> {
    fn new(
        key: &'a PartitionKey,
        path: &'a str,
        text: &'a str,
        lang: Lang,
        config: &'a ChunkerConfig,
    ) -> Self {
        Self {
            key,
            path,
            text,
            lang,
            lines: text.lines().collect(),
            config,
        }
    }

    fn line_count(&self) -> usize {
        self.lines.len()
    }

    fn is_blank(&self, line: usize) -> bool {
        self.lines[line - 1].trim().is_empty()
    }

    /// Characters of lines `start..=end` joined by newlines.
    fn span_chars(&self, start: usize, end: usize) -> usize {
        self.lines[start - 1..end]
            .iter()
            .map(|l| l.len() + 1)
            .sum::<usize>()
            .saturating_sub(1)
    }

    /// Build a chunk for lines `start..=end`, or `None` if they are all blank.
    fn chunk(
        &self,
        start: usize,
        end: usize,
        kind: ChunkKind,
        symbol: Option<&str>,
    ) -> Option<Chunk> {
        let text = self.lines[start - 1..end].join("\n");
        if text.trim().is_empty() {
            return None;
        }
        let content_hash = blake3_hex(&text);
        let start_line = to_line(start);
        let end_line = to_line(end);
        Some(Chunk {
            id: ChunkId::derive(self.key, self.path, start_line, end_line, &content_hash),
            file_path: self.path.to_owned(),
            language: self.lang.id().to_owned(),
            kind,
            start_line,
            end_line,
            text,
            content_hash,
            symbol_name: symbol.map(str::to_owned),
        })
    }

    /// Line windows over `start..=end`, each turned into a chunk.
    fn windows(
        &self,
        start: usize,
        end: usize,
        overlap: usize,
        kind: ChunkKind,
        symbol: Option<&str>,
        out: &mut Vec<Chunk>,
    ) {
        let spans = line_windows(
            &self.lines,
            start,
            end,
            self.config.window_lines,
            self.config.max_chunk_chars,
            overlap,
        );
        out.extend(
            spans
                .into_iter()
                .filter_map(|(s, e)| self.chunk(s, e, kind, symbol)),
        );
    }

    /// Module-level code between definitions: trimmed, then non-overlapping windows.
    fn gap(&self, start: usize, end: usize, out: &mut Vec<Chunk>) {
        let (mut lo, mut hi) = (start, end);
        while lo <= hi && self.is_blank(lo) {
            lo += 1;
        }
        while hi >= lo && hi > 0 && self.is_blank(hi) {
            hi -= 1;
        }
        if lo <= hi {
            self.windows(lo, hi, 0, ChunkKind::ModuleWindow, None, out);
        }
    }

    fn whole_file_windows(&self) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        if self.line_count() > 0 {
            self.windows(
                1,
                self.line_count(),
                self.config.window_overlap,
                ChunkKind::LineWindow,
                None,
                &mut chunks,
            );
        }
        chunks
    }
}

/// Chunk one file of a partition.
///
/// Never fails: a structural parse error degrades to line windows and is reported in
/// [`Chunked::Degraded`]. Identical input yields identical chunk boundaries and ids.
#[must_use]
pub fn chunk_file(
    key: &PartitionKey,
    path: &str,
    text: &str,
    lang: Lang,
    config: &ChunkerConfig,
) -> Chunked {
    let ctx = FileCtx::new(key, path, text, lang, config);
    let Some(grammar) = lang.grammar() else {
        return Chunked::Windowed {
            chunks: ctx.whole_file_windows(),
        };
    };

    let mut parser = Parser::new();
    if let Err(e) = parser.set_language(&grammar) {
        return Chunked::Degraded {
            chunks: ctx.whole_file_windows(),
            parse_error: format!("set_language failed: {e}"),
        };
    }
    let Some(tree) = parser.parse(text, None) else {
        return Chunked::Degraded {
            chunks: ctx.whole_file_windows(),
            parse_error: "parser returned no tree".into(),
        };
    };
    let root = tree.root_node();
    if root.has_error() {
        return Chunked::Degraded {
            chunks: ctx.whole_file_windows(),
            parse_error: describe_syntax_error(root),
        };
    }

    let chunks = structural_chunks(&ctx, root);
    let mut outline = python::outline(root, text);
    let name_refs = std::mem::take(&mut outline.names)
        .into_iter()
        .map(|name| NameRef {
            name: name.name,
            file_path: path.to_owned(),
            line: name.line,
            column: name.column,
            context: name.context,
        })
        .collect();
    let (symbols, calls) = link_outline(&ctx, &chunks, outline);
    Chunked::Parsed {
        chunks,
        symbols,
        calls,
        name_refs,
    }
}

fn structural_chunks(ctx: &FileCtx<'_>, root: Node<'_>) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut next_free = 1;
    let mut cursor = root.walk();

    for child in root.named_children(&mut cursor) {
        let Some((kind, name)) = definition_of(child, ctx) else {
            continue;
        };
        let start = (child.start_position().row + 1).max(next_free);
        let end = usize::try_from(python::last_line(child))
            .unwrap_or(usize::MAX)
            .min(ctx.line_count());
        if start > end {
            continue;
        }
        if start > next_free {
            ctx.gap(next_free, start - 1, &mut chunks);
        }

        if ctx.span_chars(start, end) > ctx.config.max_chunk_chars {
            ctx.windows(
                start,
                end,
                ctx.config.window_overlap,
                ChunkKind::LineWindow,
                name.as_deref(),
                &mut chunks,
            );
        } else if let Some(chunk) = ctx.chunk(start, end, kind, name.as_deref()) {
            chunks.push(chunk);
        }
        next_free = end + 1;
    }

    if next_free <= ctx.line_count() {
        ctx.gap(next_free, ctx.line_count(), &mut chunks);
    }
    chunks
}

/// Chunk kind and name of a top-level definition node.
fn definition_of(node: Node<'_>, ctx: &FileCtx<'_>) -> Option<(ChunkKind, Option<String>)> {
    let def = match node.kind() {
        "decorated_definition" => node.child_by_field_name("definition")?,
        "function_definition" | "class_definition" => node,
        _ => return None,
    };
    let kind = match def.kind() {
        "class_definition" => ChunkKind::Class,
        "function_definition" => ChunkKind::Function,
        _ => return None,
    };
    let name = def
        .child_by_field_name("name")
        .and_then(|n| ctx.text.get(n.byte_range()))
        .map(str::to_owned);
    Some((kind, name))
}

/// Turn definition and call sites into symbols and edges bound to their chunks.
fn link_outline(
    ctx: &FileCtx<'_>,
    chunks: &[Chunk],
    outline: python::PythonOutline,
) -> (Vec<Symbol>, Vec<CallEdge>) {
    let mut ids: Vec<Option<SymbolId>> = Vec::with_capacity(outline.defs.len());
    let mut symbols = Vec::with_capacity(outline.defs.len());

    for def in outline.defs {
        let Some(chunk) = chunk_containing(chunks, def.start_line) else {
            ids.push(None);
            continue;
        };
        let id = SymbolId::derive(
            ctx.key,
            ctx.path,
            &def.qualname,
            def.kind,
            def.start_line,
            def.end_line,
        );
        ids.push(Some(id.clone()));
        symbols.push(Symbol {
            id,
            name: def.name,
            qualname: def.qualname,
            kind: def.kind,
            file_path: ctx.path.to_owned(),
            language: ctx.lang.id().to_owned(),
            start_line: def.start_line,
            end_line: def.end_line,
            parent: def.parent.and_then(|p| ids.get(p).cloned().flatten()),
            chunk_id: chunk.id.clone(),
        });
    }

    let calls = outline
        .calls
        .into_iter()
        .filter_map(|call| {
            let caller = ids.get(call.caller).cloned().flatten()?;
            let chunk = chunk_containing(chunks, call.line)?;
            Some(CallEdge {
                caller,
                callee: Callee::Unresolved {
                    name: call.callee.clone(),
                },
                callee_name: call.callee,
                chunk_id: chunk.id.clone(),
                file_path: ctx.path.to_owned(),
                line: call.line,
            })
        })
        .collect();

    (symbols, calls)
}

fn chunk_containing(chunks: &[Chunk], line: u32) -> Option<&Chunk> {
    chunks
        .iter()
        .find(|c| c.start_line <= line && line <= c.end_line)
}

fn describe_syntax_error(root: Node<'_>) -> String {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_error() || node.is_missing() {
            let pos = node.start_position();
            return format!("syntax error at line {}, column {}", pos.row + 1, pos.column + 1);
        }
        if node.has_error() {
            let mut cursor = node.walk();
            let mut children: Vec<Node<'_>> = node.children(&mut cursor).collect();
            children.reverse();
            stack.extend(children);
        }
    }
    "syntax error".into()
}

/// Split lines `lo..=hi` (1-indexed, inclusive) into windows of at most `window_lines`
/// lines and `max_chars` characters. Neighbouring windows share up to `overlap` lines,
/// never more than half a window, and every window starts at least one line after the
/// previous one.
pub(crate) fn line_windows(
    lines: &[&str],
    lo: usize,
    hi: usize,
    window_lines: usize,
    max_chars: usize,
    overlap: usize,
) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    if lo == 0 || lo > hi || hi > lines.len() {
        return spans;
    }
    let window_lines = window_lines.max(1);
    let mut start = lo;
    loop {
        let mut end = start;
        let mut chars = lines[start - 1].len();
        while end < hi && end + 1 - start < window_lines {
            let next = lines[end].len() + 1;
            if chars + next > max_chars {
                break;
            }
            chars += next;
            end += 1;
        }
        spans.push((start, end));
        if end >= hi {
            break;
        }
        let back = overlap.min((end + 1 - start) / 2);
        start = (end + 1 - back).max(start + 1);
    }
    spans
}

fn to_line(line: usize) -> u32 {
    u32::try_from(line).unwrap_or(u32::MAX)
}

pub(crate) fn blake3_hex(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sift_store::{RepoId, Snapshot, SymbolKind};

    fn key() -> PartitionKey {
        PartitionKey::new(RepoId::from_raw("repo"), Snapshot::WorkingTree)
    }

    fn config() -> ChunkerConfig {
        ChunkerConfig::default()
    }

    fn spans(chunks: &[Chunk]) -> Vec<(u32, u32, ChunkKind)> {
        chunks
            .iter()
            .map(|c| (c.start_line, c.end_line, c.kind))
            .collect()
    }

    #[test]
    fn windows_respect_line_limit_and_overlap() {
        let lines = vec!["x"; 10];
        let spans = line_windows(&lines, 1, 10, 4, 1000, 2);
        assert_eq!(spans, vec![(1, 4), (3, 6), (5, 8), (7, 10)]);
    }

    #[test]
    fn windows_respect_char_limit() {
        let lines = vec!["aaaa"; 6];
        // two lines: 4 + 1 + 4 = 9 chars
        let spans = line_windows(&lines, 1, 6, 100, 9, 0);
        assert_eq!(spans, vec![(1, 2), (3, 4), (5, 6)]);
    }

    #[test]
    fn overlap_capped_at_half_window() {
        let lines = vec!["x"; 6];
        let spans = line_windows(&lines, 1, 6, 2, 1000, 10);
        assert_eq!(spans, vec![(1, 2), (2, 3), (3, 4), (4, 5), (5, 6)]);
    }

    #[test]
    fn oversized_line_still_advances() {
        let long = "y".repeat(50);
        let lines = vec![long.as_str(), long.as_str(), long.as_str()];
        let spans = line_windows(&lines, 1, 3, 10, 10, 5);
        assert_eq!(spans, vec![(1, 1), (2, 2), (3, 3)]);
    }

    #[test]
    fn empty_range_yields_nothing() {
        let lines = vec!["x"; 3];
        assert!(line_windows(&lines, 3, 2, 10, 100, 0).is_empty());
        assert!(line_windows(&lines, 0, 2, 10, 100, 0).is_empty());
    }

    #[test]
    fn non_structural_file_is_windowed() {
        let text = (1..=500).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let chunked = chunk_file(&key(), "notes.txt", &text, Lang::Text, &config());
        let Chunked::Windowed { chunks } = chunked else {
            panic!("expected windowed output");
        };
        assert_eq!(
            spans(&chunks),
            vec![
                (1, 220, ChunkKind::LineWindow),
                (181, 400, ChunkKind::LineWindow),
                (361, 500, ChunkKind::LineWindow),
            ]
        );
        assert!(chunks.iter().all(|c| c.language == "text"));
    }

    #[test]
    fn empty_file_has_no_chunks() {
        let chunked = chunk_file(&key(), "empty.py", "", Lang::Python, &config());
        assert!(chunked.chunks().is_empty());
        let chunked = chunk_file(&key(), "blank.txt", "\n\n  \n", Lang::Text, &config());
        assert!(chunked.chunks().is_empty());
    }

    #[test]
    fn chunk_ids_are_deterministic() {
        let text = "import os\n\ndef login():\n    pass\n";
        let a = chunk_file(&key(), "auth.py", text, Lang::Python, &config());
        let b = chunk_file(&key(), "auth.py", text, Lang::Python, &config());
        let ids = |c: &Chunked| c.chunks().iter().map(|c| c.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&a), ids(&b));
        assert!(!ids(&a).is_empty());
    }

    #[test]
    fn chunk_ids_depend_on_snapshot() {
        let text = "def login():\n    pass\n";
        let other = PartitionKey::new(RepoId::from_raw("repo"), Snapshot::Commit("abc".into()));
        let a = chunk_file(&key(), "auth.py", text, Lang::Python, &config());
        let b = chunk_file(&other, "auth.py", text, Lang::Python, &config());
        assert_ne!(a.chunks()[0].id, b.chunks()[0].id);
    }

    #[cfg(feature = "lang-python")]
    mod python_files {
        use super::*;

        const MODULE: &str = "\
import os
import sys


@app.route(\"/\")
def index():
    return render()

CONSTANT = 3

class Session:
    def login(self, user):
        return check(user)

    def logout(self):
        pass

x = 1
";

        #[test]
        fn regions_align_to_definitions() {
            let chunked = chunk_file(&key(), "app.py", MODULE, Lang::Python, &config());
            let Chunked::Parsed { chunks, .. } = &chunked else {
                panic!("expected parsed output");
            };
            assert_eq!(
                spans(chunks),
                vec![
                    (1, 2, ChunkKind::ModuleWindow),
                    (5, 7, ChunkKind::Function),
                    (9, 9, ChunkKind::ModuleWindow),
                    (11, 16, ChunkKind::Class),
                    (18, 18, ChunkKind::ModuleWindow),
                ]
            );
            assert_eq!(chunks[1].symbol_name.as_deref(), Some("index"));
            assert!(chunks[1].text.starts_with("@app.route"));
            assert_eq!(chunks[3].symbol_name.as_deref(), Some("Session"));
        }

        #[test]
        fn chunks_do_not_overlap() {
            let chunked = chunk_file(&key(), "app.py", MODULE, Lang::Python, &config());
            for pair in chunked.chunks().windows(2) {
                assert!(pair[0].end_line < pair[1].start_line);
            }
        }

        #[test]
        fn symbols_bound_to_defining_chunk() {
            let chunked = chunk_file(&key(), "app.py", MODULE, Lang::Python, &config());
            let (chunks, symbols, calls, name_refs) = chunked.into_parts();
            let session = symbols.iter().find(|s| s.name == "Session").unwrap();
            let login = symbols.iter().find(|s| s.name == "login").unwrap();
            assert_eq!(login.kind, SymbolKind::Method);
            assert_eq!(login.qualname, "Session.login");
            assert_eq!(login.parent.as_ref(), Some(&session.id));
            assert_eq!(login.chunk_id, chunks[3].id);

            let check = calls.iter().find(|c| c.callee_name == "check").unwrap();
            assert_eq!(check.caller, login.id);
            assert_eq!(check.chunk_id, chunks[3].id);
            assert_eq!(check.line, 13);
            assert!(matches!(&check.callee, Callee::Unresolved { name } if name == "check"));

            let read = name_refs.iter().find(|r| r.name == "check").unwrap();
            assert_eq!(read.file_path, "app.py");
            assert_eq!(read.line, 13);
            assert!(read.context.contains("check("));
        }

        #[test]
        fn oversized_definition_splits_into_overlapping_windows() {
            let mut text = String::from("def big():\n");
            for i in 0..40 {
                text.push_str(&format!("    value_{i} = compute({i})\n"));
            }
            let config = ChunkerConfig {
                max_chunk_chars: 300,
                window_lines: 10,
                window_overlap: 3,
            };
            let chunked = chunk_file(&key(), "big.py", &text, Lang::Python, &config);
            let Chunked::Parsed { chunks, symbols, .. } = &chunked else {
                panic!("expected parsed output");
            };
            assert!(chunks.len() > 1);
            assert!(chunks.iter().all(|c| c.kind == ChunkKind::LineWindow));
            assert!(chunks.iter().all(|c| c.symbol_name.as_deref() == Some("big")));
            assert!(chunks.iter().all(|c| c.text.len() <= 300));
            for pair in chunks.windows(2) {
                assert!(pair[1].start_line > pair[0].start_line);
                assert!(pair[1].start_line <= pair[0].end_line + 1);
            }
            assert_eq!(chunks.last().unwrap().end_line, 41);
            assert_eq!(symbols[0].chunk_id, chunks[0].id);
        }

        #[test]
        fn syntax_error_degrades_to_windows() {
            let text = "def broken(:\n    pass\n";
            let chunked = chunk_file(&key(), "bad.py", text, Lang::Python, &config());
            let Chunked::Degraded { chunks, parse_error } = &chunked else {
                panic!("expected degraded output");
            };
            assert!(parse_error.contains("syntax error"));
            assert_eq!(spans(chunks), vec![(1, 2, ChunkKind::LineWindow)]);
            let (_, symbols, calls, name_refs) = chunked.into_parts();
            assert!(symbols.is_empty() && calls.is_empty() && name_refs.is_empty());
        }
    }
}
