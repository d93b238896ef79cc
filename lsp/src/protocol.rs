//! LSP message types for JSON-RPC communication.
//!
//! Every method the session speaks is a marker type implementing [`LspRequest`]
//! or [`LspNotification`], so params and results have one shape each and are
//! validated where frames enter or leave the session.

use std::path::{Path, PathBuf};
use std::process;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use codescout_types::{Location, Position, Range, SymbolKind, SymbolRecord};

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

// ============================================================================
// Envelope
// ============================================================================

/// JSON-RPC id. Our own requests always use numbers; servers may use strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => u64::try_from(*n).ok(),
            Self::String(_) => None,
        }
    }
}

/// Error object carried by a JSON-RPC error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub const METHOD_NOT_FOUND: i64 = -32601;

/// A classified inbound JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Server-to-client request; must be answered.
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        outcome: Result<Value, ResponseError>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("malformed JSON-RPC envelope: {0}")]
    Malformed(String),
    #[error("unsupported jsonrpc version {0:?}")]
    Version(String),
    #[error("message has neither a method nor a result/error")]
    Unroutable,
}

#[derive(Deserialize)]
struct RawMessage {
    jsonrpc: Option<String>,
    id: Option<RequestId>,
    method: Option<String>,
    #[serde(default, deserialize_with = "present")]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    error: Option<ResponseError>,
}

/// Keeps an explicit `null` as `Some(Value::Null)` so `"result": null` still
/// marks a response.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<Value> for Message {
    type Error = MessageError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let raw: RawMessage =
            serde_json::from_value(value).map_err(|e| MessageError::Malformed(e.to_string()))?;

        if let Some(version) = raw.jsonrpc
            && version != "2.0"
        {
            return Err(MessageError::Version(version));
        }

        match (raw.id, raw.method) {
            (Some(id), Some(method)) => Ok(Self::Request {
                id,
                method,
                params: raw.params,
            }),
            (None, Some(method)) => Ok(Self::Notification {
                method,
                params: raw.params,
            }),
            (Some(id), None) => match (raw.error, raw.result) {
                (Some(error), _) => Ok(Self::Response {
                    id,
                    outcome: Err(error),
                }),
                (None, Some(result)) => Ok(Self::Response {
                    id,
                    outcome: Ok(result),
                }),
                (None, None) => Err(MessageError::Unroutable),
            },
            (None, None) => Err(MessageError::Unroutable),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct OutgoingRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> OutgoingRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct OutgoingNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> OutgoingNotification<'a> {
    pub fn new(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Reply to a server-to-client request.
#[derive(Debug, Serialize)]
pub(crate) struct OutgoingResponse {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl OutgoingResponse {
    pub fn result(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn method_not_found(id: RequestId, method: &str) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(ResponseError {
                code: METHOD_NOT_FOUND,
                message: format!("Method not found: {method}"),
                data: None,
            }),
        }
    }
}

/// Params that serialize to `null` are omitted from the frame.
pub(crate) fn params_value<P: Serialize>(params: &P) -> Result<Option<Value>, serde_json::Error> {
    let value = serde_json::to_value(params)?;
    Ok((!value.is_null()).then_some(value))
}

// ============================================================================
// Method markers
// ============================================================================

pub trait LspRequest {
    const METHOD: &'static str;
    type Params: Serialize + Send + Sync;
    type Result: DeserializeOwned;
}

pub trait LspNotification {
    const METHOD: &'static str;
    type Params: Serialize + Send + Sync;
}

pub enum Initialize {}
pub enum Shutdown {}
pub enum DocumentSymbolRequest {}
pub enum References {}
pub enum WorkspaceSymbolRequest {}

pub enum Initialized {}
pub enum Exit {}
pub enum DidOpenTextDocument {}
pub enum DidCloseTextDocument {}

impl LspRequest for Initialize {
    const METHOD: &'static str = "initialize";
    type Params = InitializeParams;
    type Result = InitializeResult;
}

impl LspRequest for Shutdown {
    const METHOD: &'static str = "shutdown";
    type Params = ();
    type Result = Value;
}

impl LspRequest for DocumentSymbolRequest {
    const METHOD: &'static str = "textDocument/documentSymbol";
    type Params = DocumentSymbolParams;
    type Result = Option<DocumentSymbolResponse>;
}

impl LspRequest for References {
    const METHOD: &'static str = "textDocument/references";
    type Params = ReferenceParams;
    type Result = Option<Vec<Location>>;
}

impl LspRequest for WorkspaceSymbolRequest {
    const METHOD: &'static str = "workspace/symbol";
    type Params = WorkspaceSymbolParams;
    type Result = Option<WorkspaceSymbolResponse>;
}

impl LspNotification for Initialized {
    const METHOD: &'static str = "initialized";
    type Params = InitializedParams;
}

impl LspNotification for Exit {
    const METHOD: &'static str = "exit";
    type Params = ();
}

impl LspNotification for DidOpenTextDocument {
    const METHOD: &'static str = "textDocument/didOpen";
    type Params = DidOpenTextDocumentParams;
}

impl LspNotification for DidCloseTextDocument {
    const METHOD: &'static str = "textDocument/didClose";
    type Params = DidCloseTextDocumentParams;
}

// ============================================================================
// Params
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub process_id: u32,
    pub root_uri: String,
    pub capabilities: Value,
    pub workspace_folders: Vec<WorkspaceFolder>,
    pub client_info: ClientInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceFolder {
    pub uri: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: &'static str,
    pub version: &'static str,
}

impl InitializeParams {
    /// Declares only what the adapters use: document symbols (hierarchical),
    /// references, and workspace symbol search.
    pub fn new(root_uri: &str, workspace_name: &str) -> Self {
        Self {
            process_id: process::id(),
            root_uri: root_uri.to_string(),
            capabilities: serde_json::json!({
                "textDocument": {
                    "synchronization": {
                        "dynamicRegistration": false,
                        "willSave": false,
                        "willSaveWaitUntil": false,
                        "didSave": false
                    },
                    "documentSymbol": {
                        "dynamicRegistration": false,
                        "hierarchicalDocumentSymbolSupport": true
                    },
                    "references": {
                        "dynamicRegistration": false
                    }
                },
                "workspace": {
                    "symbol": {
                        "dynamicRegistration": false
                    },
                    "workspaceFolders": true,
                    "configuration": true
                },
                "window": {
                    "workDoneProgress": true
                }
            }),
            workspace_folders: vec![WorkspaceFolder {
                uri: root_uri.to_string(),
                name: workspace_name.to_string(),
            }],
            client_info: ClientInfo {
                name: "codescout",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InitializedParams {}

#[derive(Debug, Clone, Serialize)]
pub struct TextDocumentIdentifier {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextDocumentItem {
    pub uri: String,
    pub language_id: String,
    pub version: i32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DidOpenTextDocumentParams {
    pub text_document: TextDocumentItem,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DidCloseTextDocumentParams {
    pub text_document: TextDocumentIdentifier,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSymbolParams {
    pub text_document: TextDocumentIdentifier,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceContext {
    pub include_declaration: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceParams {
    pub text_document: TextDocumentIdentifier,
    pub position: Position,
    pub context: ReferenceContext,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceSymbolParams {
    pub query: String,
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    pub server_info: Option<ServerInfo>,
}

/// The subset of server capabilities the adapters look at.
///
/// Providers may be `true` or an options object; absence or `false` means
/// unsupported.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    pub document_symbol_provider: Option<Value>,
    pub references_provider: Option<Value>,
    pub workspace_symbol_provider: Option<Value>,
}

fn provider_enabled(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null | Value::Bool(false)) => false,
        Some(_) => true,
    }
}

impl ServerCapabilities {
    #[must_use]
    pub fn document_symbols(&self) -> bool {
        provider_enabled(self.document_symbol_provider.as_ref())
    }

    #[must_use]
    pub fn references(&self) -> bool {
        provider_enabled(self.references_provider.as_ref())
    }

    #[must_use]
    pub fn workspace_symbols(&self) -> bool {
        provider_enabled(self.workspace_symbol_provider.as_ref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSymbol {
    pub name: String,
    pub detail: Option<String>,
    pub kind: u64,
    pub range: Range,
    pub selection_range: Range,
    #[serde(default)]
    pub children: Option<Vec<DocumentSymbol>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInformation {
    pub name: String,
    pub kind: u64,
    pub location: Location,
    pub container_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DocumentSymbolResponse {
    Nested(Vec<DocumentSymbol>),
    Flat(Vec<SymbolInformation>),
}

/// `workspace/symbol` may return a location without a range.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WorkspaceSymbolLocation {
    Full(Location),
    UriOnly { uri: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSymbol {
    pub name: String,
    pub kind: u64,
    pub container_name: Option<String>,
    pub location: WorkspaceSymbolLocation,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WorkspaceSymbolResponse {
    Flat(Vec<SymbolInformation>),
    Workspace(Vec<WorkspaceSymbol>),
}

/// Servers occasionally report kinds outside the LSP range; those map to
/// `Variable` rather than dropping the symbol.
fn kind_or_default(kind: u64) -> SymbolKind {
    SymbolKind::from_lsp(kind).unwrap_or(SymbolKind::Variable)
}

impl SymbolInformation {
    fn into_record(self) -> SymbolRecord {
        SymbolRecord::new(self.name, kind_or_default(self.kind), self.location)
            .with_container(self.container_name)
    }
}

fn flatten_nested(
    uri: &str,
    symbols: Vec<DocumentSymbol>,
    container: Option<&str>,
    out: &mut Vec<SymbolRecord>,
) {
    for symbol in symbols {
        let record = SymbolRecord::new(
            symbol.name.clone(),
            kind_or_default(symbol.kind),
            Location::new(uri, symbol.selection_range),
        )
        .with_container(container.map(str::to_string))
        .with_detail(symbol.detail);
        out.push(record);
        if let Some(children) = symbol.children {
            flatten_nested(uri, children, Some(&symbol.name), out);
        }
    }
}

impl DocumentSymbolResponse {
    /// Flatten into records; nested children carry their parent's name as container.
    #[must_use]
    pub fn into_records(self, uri: &str) -> Vec<SymbolRecord> {
        match self {
            Self::Nested(symbols) => {
                let mut out = Vec::new();
                flatten_nested(uri, symbols, None, &mut out);
                out
            }
            Self::Flat(symbols) => symbols
                .into_iter()
                .map(SymbolInformation::into_record)
                .collect(),
        }
    }
}

impl WorkspaceSymbolResponse {
    #[must_use]
    pub fn into_records(self) -> Vec<SymbolRecord> {
        match self {
            Self::Flat(symbols) => symbols
                .into_iter()
                .map(SymbolInformation::into_record)
                .collect(),
            Self::Workspace(symbols) => symbols
                .into_iter()
                .map(|s| {
                    let location = match s.location {
                        WorkspaceSymbolLocation::Full(loc) => loc,
                        WorkspaceSymbolLocation::UriOnly { uri } => {
                            Location::new(uri, Range::on_line(0, 0, 0))
                        }
                    };
                    SymbolRecord::new(s.name, kind_or_default(s.kind), location)
                        .with_container(s.container_name)
                })
                .collect(),
        }
    }
}

// ============================================================================
// URIs
// ============================================================================

pub fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}
