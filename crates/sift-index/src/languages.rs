//! Language detection and tree-sitter grammar registry.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Detected file language. Only languages with a grammar are chunked structurally; the rest
/// fall back to line windows but keep their label for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    Python,
    Rust,
    JavaScript,
    TypeScript,
    Go,
    Java,
    C,
    Cpp,
    Ruby,
    Bash,
    Toml,
    Json,
    Yaml,
    Markdown,
    Text,
}

impl Lang {
    /// Identifier stored with chunks and used by search filters.
    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Rust => "rust",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Go => "go",
            Self::Java => "java",
            Self::C => "c",
            Self::Cpp => "cpp",
            Self::Ruby => "ruby",
            Self::Bash => "bash",
            Self::Toml => "toml",
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Markdown => "markdown",
            Self::Text => "text",
        }
    }

    /// Get the tree-sitter grammar. Returns `None` if the language has no structural
    /// chunker or the corresponding feature is not enabled.
    #[must_use]
    pub fn grammar(self) -> Option<tree_sitter::Language> {
        match self {
            #[cfg(feature = "lang-python")]
            Self::Python => Some(tree_sitter_python::LANGUAGE.into()),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }

    #[must_use]
    pub fn is_structural(self) -> bool {
        self.grammar().is_some()
    }
}

impl std::fmt::Display for Lang {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Detect language from file name and extension. Unknown files are [`Lang::Text`].
#[must_use]
pub fn detect_language(path: &Path) -> Lang {
    if path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| matches!(n, "Makefile" | "Dockerfile" | "Justfile"))
    {
        return Lang::Text;
    }
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return Lang::Text;
    };
    match ext.to_ascii_lowercase().as_str() {
        "py" | "pyi" => Lang::Python,
        "rs" => Lang::Rust,
        "js" | "jsx" | "mjs" | "cjs" => Lang::JavaScript,
        "ts" | "tsx" | "mts" | "cts" => Lang::TypeScript,
        "go" => Lang::Go,
        "java" => Lang::Java,
        "c" | "h" => Lang::C,
        "cc" | "cpp" | "cxx" | "hpp" | "hh" => Lang::Cpp,
        "rb" => Lang::Ruby,
        "sh" | "bash" | "zsh" => Lang::Bash,
        "toml" => Lang::Toml,
        "json" | "jsonc" => Lang::Json,
        "yaml" | "yml" => Lang::Yaml,
        "md" | "markdown" => Lang::Markdown,
        _ => Lang::Text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_python() {
        assert_eq!(detect_language(Path::new("pkg/auth.py")), Lang::Python);
        assert_eq!(detect_language(Path::new("stubs/auth.pyi")), Lang::Python);
    }

    #[test]
    fn detect_is_case_insensitive() {
        assert_eq!(detect_language(Path::new("LEGACY.PY")), Lang::Python);
    }

    #[test]
    fn unknown_extension_is_text() {
        assert_eq!(detect_language(Path::new("notes.xyz")), Lang::Text);
        assert_eq!(detect_language(Path::new("Makefile")), Lang::Text);
        assert_eq!(detect_language(Path::new("LICENSE")), Lang::Text);
    }

    #[test]
    fn lang_id_roundtrip_via_serde() {
        let json = serde_json::to_string(&Lang::TypeScript).unwrap();
        assert_eq!(json, "\"typescript\"");
        assert_eq!(Lang::TypeScript.id(), "typescript");
    }

    #[cfg(feature = "lang-python")]
    #[test]
    fn only_python_is_structural() {
        assert!(Lang::Python.is_structural());
        assert!(!Lang::Rust.is_structural());
        assert!(!Lang::Text.is_structural());
    }

    #[test]
    fn display_matches_id() {
        assert_eq!(Lang::Cpp.to_string(), "cpp");
    }
}
