//! Symbol and location types shared by the semantic and fallback paths.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Zero-based line/character position, as in LSP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    #[must_use]
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

/// Half-open range between two positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    #[must_use]
    pub const fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    /// Range covering `len` characters on a single line.
    #[must_use]
    pub const fn on_line(line: u32, character: u32, len: u32) -> Self {
        Self {
            start: Position::new(line, character),
            end: Position::new(line, character + len),
        }
    }

    #[must_use]
    pub fn contains(&self, pos: Position) -> bool {
        self.start <= pos && pos < self.end
    }
}

/// A range inside one document, identified by its URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub uri: String,
    pub range: Range,
}

impl Location {
    #[must_use]
    pub fn new(uri: impl Into<String>, range: Range) -> Self {
        Self {
            uri: uri.into(),
            range,
        }
    }
}

/// Kind of a symbol, numbered as in the LSP `SymbolKind` enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    File = 1,
    Module = 2,
    Namespace = 3,
    Package = 4,
    Class = 5,
    Method = 6,
    Property = 7,
    Field = 8,
    Constructor = 9,
    Enum = 10,
    Interface = 11,
    Function = 12,
    Variable = 13,
    Constant = 14,
    String = 15,
    Number = 16,
    Boolean = 17,
    Array = 18,
    Object = 19,
    Key = 20,
    Null = 21,
    EnumMember = 22,
    Struct = 23,
    Event = 24,
    Operator = 25,
    TypeParameter = 26,
}

impl SymbolKind {
    /// Convert from the LSP numeric kind.
    ///
    /// Returns `None` for values outside the LSP-defined range; the boundary
    /// code decides the fallback policy.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        Some(match value {
            1 => Self::File,
            2 => Self::Module,
            3 => Self::Namespace,
            4 => Self::Package,
            5 => Self::Class,
            6 => Self::Method,
            7 => Self::Property,
            8 => Self::Field,
            9 => Self::Constructor,
            10 => Self::Enum,
            11 => Self::Interface,
            12 => Self::Function,
            13 => Self::Variable,
            14 => Self::Constant,
            15 => Self::String,
            16 => Self::Number,
            17 => Self::Boolean,
            18 => Self::Array,
            19 => Self::Object,
            20 => Self::Key,
            21 => Self::Null,
            22 => Self::EnumMember,
            23 => Self::Struct,
            24 => Self::Event,
            25 => Self::Operator,
            26 => Self::TypeParameter,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn as_lsp(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Module => "module",
            Self::Namespace => "namespace",
            Self::Package => "package",
            Self::Class => "class",
            Self::Method => "method",
            Self::Property => "property",
            Self::Field => "field",
            Self::Constructor => "constructor",
            Self::Enum => "enum",
            Self::Interface => "interface",
            Self::Function => "function",
            Self::Variable => "variable",
            Self::Constant => "constant",
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Key => "key",
            Self::Null => "null",
            Self::EnumMember => "enum_member",
            Self::Struct => "struct",
            Self::Event => "event",
            Self::Operator => "operator",
            Self::TypeParameter => "type_parameter",
        }
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A symbol definition found either by a language server or by the text scan.
///
/// Fields are private; records are never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolRecord {
    name: String,
    kind: SymbolKind,
    location: Location,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl SymbolRecord {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: SymbolKind, location: Location) -> Self {
        Self {
            name: name.into(),
            kind,
            location,
            container_name: None,
            detail: None,
        }
    }

    #[must_use]
    pub fn with_container(mut self, container: Option<String>) -> Self {
        self.container_name = container.filter(|c| !c.is_empty());
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: Option<String>) -> Self {
        self.detail = detail.filter(|d| !d.is_empty());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> SymbolKind {
        self.kind
    }

    #[must_use]
    pub fn location(&self) -> &Location {
        &self.location
    }

    #[must_use]
    pub fn container_name(&self) -> Option<&str> {
        self.container_name.as_deref()
    }

    #[must_use]
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

/// Where an answer came from.
///
/// Fallback answers are lower precision; `reason` names the session failure
/// that forced the fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultSource {
    Semantic,
    Fallback { reason: String },
}

impl ResultSource {
    #[must_use]
    pub fn fallback(reason: impl fmt::Display) -> Self {
        Self::Fallback {
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_kind_from_lsp_known_values() {
        assert_eq!(SymbolKind::from_lsp(12), Some(SymbolKind::Function));
        assert_eq!(SymbolKind::from_lsp(23), Some(SymbolKind::Struct));
        assert_eq!(SymbolKind::from_lsp(26), Some(SymbolKind::TypeParameter));
    }

    #[test]
    fn symbol_kind_from_lsp_unknown_returns_none() {
        assert_eq!(SymbolKind::from_lsp(0), None);
        assert_eq!(SymbolKind::from_lsp(27), None);
    }

    #[test]
    fn symbol_kind_numbering_matches_lsp() {
        for n in 1..=26 {
            let kind = SymbolKind::from_lsp(n).unwrap();
            assert_eq!(u64::from(kind.as_lsp()), n);
        }
    }

    #[test]
    fn range_contains_is_half_open() {
        let range = Range::on_line(3, 4, 5);
        assert!(range.contains(Position::new(3, 4)));
        assert!(range.contains(Position::new(3, 8)));
        assert!(!range.contains(Position::new(3, 9)));
        assert!(!range.contains(Position::new(2, 5)));
    }

    #[test]
    fn symbol_record_drops_empty_optionals() {
        let loc = Location::new("file:///a.rs", Range::on_line(0, 3, 4));
        let sym = SymbolRecord::new("main", SymbolKind::Function, loc)
            .with_container(Some(String::new()))
            .with_detail(Some("fn()".to_string()));
        assert_eq!(sym.container_name(), None);
        assert_eq!(sym.detail(), Some("fn()"));

        let json = serde_json::to_value(&sym).unwrap();
        assert!(json.get("containerName").is_none());
        assert_eq!(json["detail"], "fn()");
        assert_eq!(json["kind"], "function");
    }

    #[test]
    fn result_source_tags() {
        let json = serde_json::to_value(ResultSource::fallback("not ready")).unwrap();
        assert_eq!(json["kind"], "fallback");
        assert_eq!(json["reason"], "not ready");
        assert!(!ResultSource::Semantic.is_fallback());
    }
}
