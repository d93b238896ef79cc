//! Text-scan fallback used when the semantic path is unavailable.
//!
//! Walks the workspace with `ignore` (honouring `.gitignore`), looks only at
//! files with the ecosystem's extensions, and finds symbols with per-language
//! line regexes. Results are deterministic: files are visited in path order.

use std::path::{Path, PathBuf};
use std::{fmt, fs};
use std::sync::Arc;

use ignore::WalkBuilder;
use regex::Regex;

use codescout_types::{Location, Position, Range, SymbolKind, SymbolRecord};

use crate::protocol::path_to_file_uri;
use crate::types::FallbackSettings;

/// Directories never scanned, in addition to ignore-file rules.
pub const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    "target",
    "node_modules",
    "dist",
    "build",
    "out",
    "__pycache__",
    ".venv",
    "vendor",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Language {
    Rust,
    Python,
    TypeScript,
    Go,
    Java,
    Generic,
}

impl Language {
    fn from_language_id(id: &str) -> Self {
        match id {
            "rust" => Self::Rust,
            "python" => Self::Python,
            "typescript" | "javascript" | "typescriptreact" | "javascriptreact" => {
                Self::TypeScript
            }
            "go" => Self::Go,
            "java" => Self::Java,
            _ => Self::Generic,
        }
    }

    fn patterns(self) -> &'static [(&'static str, SymbolKind)] {
        match self {
            Self::Rust => &[
                (
                    r#"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:default\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?(?:extern\s+"[^"]*"\s+)?fn\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)"#,
                    SymbolKind::Function,
                ),
                (
                    r"^\s*(?:pub(?:\([^)]*\))?\s+)?struct\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)",
                    SymbolKind::Struct,
                ),
                (
                    r"^\s*(?:pub(?:\([^)]*\))?\s+)?enum\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)",
                    SymbolKind::Enum,
                ),
                (
                    r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:unsafe\s+)?trait\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)",
                    SymbolKind::Interface,
                ),
                (
                    r"^\s*(?:pub(?:\([^)]*\))?\s+)?type\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)",
                    SymbolKind::TypeParameter,
                ),
                (
                    r"^\s*(?:pub(?:\([^)]*\))?\s+)?mod\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)",
                    SymbolKind::Module,
                ),
                (
                    r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:const|static)\s+(?:mut\s+)?(?P<name>[A-Za-z_][A-Za-z0-9_]*)\s*:",
                    SymbolKind::Constant,
                ),
                (
                    r"^\s*macro_rules!\s*(?P<name>[A-Za-z_][A-Za-z0-9_]*)",
                    SymbolKind::Function,
                ),
            ],
            Self::Python => &[
                (r"^\s*class\s+(?P<name>[A-Za-z_]\w*)", SymbolKind::Class),
                (
                    r"^\s+(?:async\s+)?def\s+(?P<name>[A-Za-z_]\w*)",
                    SymbolKind::Method,
                ),
                (
                    r"^(?:async\s+)?def\s+(?P<name>[A-Za-z_]\w*)",
                    SymbolKind::Function,
                ),
                (r"^(?P<name>[A-Z][A-Z0-9_]*)\s*(?::[^=]+)?=", SymbolKind::Constant),
            ],
            Self::TypeScript => &[
                (
                    r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\*?\s+(?P<name>[A-Za-z_$][\w$]*)",
                    SymbolKind::Function,
                ),
                (
                    r"^\s*(?:export\s+)?(?:default\s+)?(?:abstract\s+)?class\s+(?P<name>[A-Za-z_$][\w$]*)",
                    SymbolKind::Class,
                ),
                (
                    r"^\s*(?:export\s+)?interface\s+(?P<name>[A-Za-z_$][\w$]*)",
                    SymbolKind::Interface,
                ),
                (
                    r"^\s*(?:export\s+)?type\s+(?P<name>[A-Za-z_$][\w$]*)\s*(?:<[^=]*>)?\s*=",
                    SymbolKind::TypeParameter,
                ),
                (
                    r"^\s*(?:export\s+)?(?:const\s+)?enum\s+(?P<name>[A-Za-z_$][\w$]*)",
                    SymbolKind::Enum,
                ),
                (
                    r"^\s*(?:export\s+)?const\s+(?P<name>[A-Za-z_$][\w$]*)",
                    SymbolKind::Constant,
                ),
                (
                    r"^\s*(?:export\s+)?(?:let|var)\s+(?P<name>[A-Za-z_$][\w$]*)",
                    SymbolKind::Variable,
                ),
            ],
            Self::Go => &[
                (
                    r"^func\s+\([^)]*\)\s*(?P<name>[A-Za-z_]\w*)",
                    SymbolKind::Method,
                ),
                (r"^func\s+(?P<name>[A-Za-z_]\w*)", SymbolKind::Function),
                (
                    r"^type\s+(?P<name>[A-Za-z_]\w*)\s+struct\b",
                    SymbolKind::Struct,
                ),
                (
                    r"^type\s+(?P<name>[A-Za-z_]\w*)\s+interface\b",
                    SymbolKind::Interface,
                ),
                (r"^type\s+(?P<name>[A-Za-z_]\w*)", SymbolKind::Class),
                (r"^const\s+(?P<name>[A-Za-z_]\w*)", SymbolKind::Constant),
                (r"^var\s+(?P<name>[A-Za-z_]\w*)", SymbolKind::Variable),
            ],
            Self::Java => &[
                (
                    r"^\s*(?:(?:public|private|protected|static|final|abstract|sealed)\s+)*class\s+(?P<name>[A-Za-z_]\w*)",
                    SymbolKind::Class,
                ),
                (
                    r"^\s*(?:(?:public|private|protected|static)\s+)*@?interface\s+(?P<name>[A-Za-z_]\w*)",
                    SymbolKind::Interface,
                ),
                (
                    r"^\s*(?:(?:public|private|protected|static)\s+)*enum\s+(?P<name>[A-Za-z_]\w*)",
                    SymbolKind::Enum,
                ),
                (
                    r"^\s*(?:(?:public|private|protected|static)\s+)*record\s+(?P<name>[A-Za-z_]\w*)",
                    SymbolKind::Struct,
                ),
                (
                    r"^\s*(?:(?:public|private|protected|static|final|abstract|synchronized|native|default)\s+)+[\w<>\[\],.?\s]+?\s+(?P<name>[A-Za-z_]\w*)\s*\(",
                    SymbolKind::Method,
                ),
            ],
            Self::Generic => &[
                (
                    r"\b(?:function|func|fn|def|sub|proc)\s+(?P<name>[A-Za-z_]\w*)",
                    SymbolKind::Function,
                ),
                (
                    r"\b(?:class|struct|interface|trait|enum|module)\s+(?P<name>[A-Za-z_]\w*)",
                    SymbolKind::Class,
                ),
            ],
        }
    }
}

struct SymbolPattern {
    regex: Regex,
    kind: SymbolKind,
}

fn compile(language: Language) -> Vec<SymbolPattern> {
    language
        .patterns()
        .iter()
        .filter_map(|(source, kind)| match Regex::new(source) {
            Ok(regex) => Some(SymbolPattern { regex, kind: *kind }),
            Err(e) => {
                tracing::error!(pattern = source, "Invalid fallback pattern: {e}");
                None
            }
        })
        .collect()
}

/// UTF-16 length of `text`, as LSP counts characters.
fn utf16_len(text: &str) -> u32 {
    u32::try_from(text.encode_utf16().count()).unwrap_or(u32::MAX)
}

/// Byte offset of a UTF-16 column within `line`, clamped to the line end.
fn byte_offset(line: &str, character: u32) -> usize {
    let mut units = 0u32;
    for (idx, ch) in line.char_indices() {
        if units >= character {
            return idx;
        }
        units += u32::try_from(ch.len_utf16()).unwrap_or(2);
    }
    line.len()
}

fn is_ident_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '$'
}

/// Identifier under (or immediately before) `character` on `line`.
fn identifier_at(line: &str, character: u32) -> Option<&str> {
    let offset = byte_offset(line, character);
    let start = line[..offset]
        .char_indices()
        .rev()
        .take_while(|(_, c)| is_ident_char(*c))
        .last()
        .map_or(offset, |(i, _)| i);
    let end = line[offset..]
        .char_indices()
        .find(|(_, c)| !is_ident_char(*c))
        .map_or(line.len(), |(i, _)| offset + i);
    let ident = &line[start..end];
    (!ident.is_empty() && !ident.starts_with(|c: char| c.is_ascii_digit())).then_some(ident)
}

/// Regex-based symbol and reference search over one workspace.
#[derive(Clone)]
pub struct TextScanner {
    root: PathBuf,
    extensions: Arc<[String]>,
    patterns: Arc<[SymbolPattern]>,
    settings: FallbackSettings,
}

impl fmt::Debug for TextScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextScanner")
            .field("root", &self.root)
            .field("extensions", &self.extensions)
            .finish_non_exhaustive()
    }
}

impl TextScanner {
    #[must_use]
    pub fn new(
        root: impl Into<PathBuf>,
        language_id: &str,
        extensions: &[String],
        settings: FallbackSettings,
    ) -> Self {
        let extensions: Vec<String> = extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        Self {
            root: root.into(),
            extensions: extensions.into(),
            patterns: compile(Language::from_language_id(language_id)).into(),
            settings,
        }
    }

    fn handles(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                self.extensions
                    .iter()
                    .any(|want| want.eq_ignore_ascii_case(ext))
            })
    }

    /// Candidate files in path order, within the count and size caps.
    fn files(&self) -> Vec<PathBuf> {
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(false)
            .git_ignore(true)
            .git_global(false)
            .git_exclude(true)
            .require_git(false)
            .filter_entry(|entry| {
                let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
                !(is_dir && EXCLUDED_DIRS.iter().any(|d| entry.file_name() == *d))
            })
            .sort_by_file_path(|a, b| a.cmp(b));

        let mut files = Vec::new();
        for entry in builder.build().flatten() {
            if files.len() >= self.settings.max_files {
                tracing::debug!(max = self.settings.max_files, "Fallback file cap reached");
                break;
            }
            if !entry.file_type().is_some_and(|t| t.is_file()) || !self.handles(entry.path()) {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(u64::MAX);
            if size > self.settings.max_file_bytes {
                continue;
            }
            files.push(entry.into_path());
        }
        files
    }

    fn read(path: &Path) -> Option<String> {
        match fs::read_to_string(path) {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::trace!(path = %path.display(), "Skipping unreadable file: {e}");
                None
            }
        }
    }

    fn symbols_in(&self, path: &Path, text: &str) -> Vec<SymbolRecord> {
        let Ok(uri) = path_to_file_uri(path) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let Ok(line_no) = u32::try_from(line_no) else {
                break;
            };
            for pattern in self.patterns.iter() {
                let Some(name) = pattern.regex.captures(line).and_then(|c| c.name("name")) else {
                    continue;
                };
                let range = Range::on_line(
                    line_no,
                    utf16_len(&line[..name.start()]),
                    utf16_len(name.as_str()),
                );
                out.push(SymbolRecord::new(
                    name.as_str(),
                    pattern.kind,
                    Location::new(uri.as_str(), range),
                ));
                break;
            }
        }
        out
    }

    /// Symbols declared in one document.
    #[must_use]
    pub fn scan_document(&self, path: &Path) -> Vec<SymbolRecord> {
        Self::read(path)
            .map(|text| self.symbols_in(path, &text))
            .unwrap_or_default()
    }

    /// Symbols across the workspace whose name contains `query`, case-insensitively.
    #[must_use]
    pub fn scan_workspace(&self, query: &str) -> Vec<SymbolRecord> {
        let needle = query.to_lowercase();
        self.files()
            .iter()
            .filter_map(|path| Self::read(path).map(|text| (path, text)))
            .flat_map(|(path, text)| self.symbols_in(path, &text))
            .filter(|s| s.name().to_lowercase().contains(&needle))
            .collect()
    }

    /// Whole-word occurrences of the identifier at `position` in `path`.
    #[must_use]
    pub fn scan_references(
        &self,
        path: &Path,
        position: Position,
        include_declaration: bool,
    ) -> Vec<Location> {
        let Some(text) = Self::read(path) else {
            return Vec::new();
        };
        let Some(line) = text.lines().nth(position.line as usize) else {
            return Vec::new();
        };
        let Some(ident) = identifier_at(line, position.character) else {
            return Vec::new();
        };
        let Ok(word) = Regex::new(&format!(r"\b{}\b", regex::escape(ident))) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for file in self.files() {
            let Some(text) = Self::read(&file) else {
                continue;
            };
            let Ok(uri) = path_to_file_uri(&file) else {
                continue;
            };
            let declarations: Vec<Range> = if include_declaration {
                Vec::new()
            } else {
                self.symbols_in(&file, &text)
                    .into_iter()
                    .filter(|s| s.name() == ident)
                    .map(|s| s.location().range)
                    .collect()
            };
            for (line_no, line) in text.lines().enumerate() {
                let Ok(line_no) = u32::try_from(line_no) else {
                    break;
                };
                for m in word.find_iter(line) {
                    let range =
                        Range::on_line(line_no, utf16_len(&line[..m.start()]), utf16_len(m.as_str()));
                    if !declarations.contains(&range) {
                        out.push(Location::new(uri.as_str(), range));
                    }
                }
            }
        }
        out
    }

    pub async fn document_symbols(&self, path: PathBuf) -> Vec<SymbolRecord> {
        let scanner = self.clone();
        run_blocking(move || scanner.scan_document(&path)).await
    }

    pub async fn workspace_symbols(&self, query: String) -> Vec<SymbolRecord> {
        let scanner = self.clone();
        run_blocking(move || scanner.scan_workspace(&query)).await
    }

    pub async fn references(
        &self,
        path: PathBuf,
        position: Position,
        include_declaration: bool,
    ) -> Vec<Location> {
        let scanner = self.clone();
        run_blocking(move || scanner.scan_references(&path, position, include_declaration)).await
    }
}

async fn run_blocking<T, F>(f: F) -> Vec<T>
where
    T: Send + 'static,
    F: FnOnce() -> Vec<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(out) => out,
        Err(e) => {
            tracing::warn!("Fallback scan task failed: {e}");
            Vec::new()
        }
    }
}
