//! Wire types and constants for the CLI sync API

use serde::{Deserialize, Serialize};

use crate::manifest::{Manifest, ManifestEntry};

pub const TOOL_NAME: &str = "agentsync";

pub fn user_agent() -> String {
    format!("{}/{}", TOOL_NAME, env!("CARGO_PKG_VERSION"))
}

pub mod endpoints {
    pub const HANDSHAKE: &str = "/api/cli/upload/handshake";
    pub const COMPLETE: &str = "/api/cli/upload/complete";
    pub const PATCHES: &str = "/api/cli/patches";
}

// Retry defaults for blob uploads
pub mod retry {
    pub const MAX_ATTEMPTS: u32 = 4;
    pub const BASE_DELAY_MS: u64 = 500;
    pub const MAX_DELAY_MS: u64 = 8_000;
    /// Ceiling on a server-requested `Retry-After` wait
    pub const MAX_RETRY_AFTER_SECS: u64 = 60;
}

pub const DEFAULT_CONCURRENCY: usize = 4;

/// Status of a patch the server still expects the client to apply
pub const PATCH_STATUS_PROPOSED: &str = "PROPOSED";

/// Which project a snapshot belongs to; at least one field must be set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectIdentity {
    pub id: Option<String>,
    pub slug: Option<String>,
    pub name: Option<String>,
}

impl ProjectIdentity {
    pub fn is_empty(&self) -> bool {
        [&self.id, &self.slug, &self.name]
            .iter()
            .all(|v| v.as_deref().map_or(true, |s| s.trim().is_empty()))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestPayload<'a> {
    pub hash: &'a str,
    pub entries: &'a [ManifestEntry],
}

impl<'a> From<&'a Manifest> for ManifestPayload<'a> {
    fn from(m: &'a Manifest) -> Self {
        Self {
            hash: &m.hash,
            entries: &m.entries,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_slug: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_snapshot_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<&'a str>,
    pub manifest: ManifestPayload<'a>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    Direct,
    Presigned,
    Multipart,
    #[serde(other)]
    Unknown,
}

impl UploadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadMode::Direct => "direct",
            UploadMode::Presigned => "presigned",
            UploadMode::Multipart => "multipart",
            UploadMode::Unknown => "unknown",
        }
    }
}

impl Default for UploadMode {
    fn default() -> Self {
        Self::Direct
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPlan {
    #[serde(default)]
    pub mode: UploadMode,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub missing_blobs: Vec<String>,
    #[serde(default)]
    pub upload: UploadPlan,
    #[serde(default)]
    pub error: Option<String>,
}

/// Handshake result once the snapshot id is known to be present
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub snapshot_id: String,
    pub missing_blobs: Vec<String>,
    pub upload: UploadPlan,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobUploadRequest {
    pub snapshot_id: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub content_base64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobUploadResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub blob_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest<'a> {
    pub snapshot_id: &'a str,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub missing_blobs: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    pub id: String,
    #[serde(default)]
    pub snapshot_id: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub base_blob_hash: Option<String>,
    #[serde(default)]
    pub patch_format: Option<String>,
    #[serde(default)]
    pub patch_body: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub applied_at: Option<String>,
}

impl Patch {
    pub fn is_proposed(&self) -> bool {
        self.status == PATCH_STATUS_PROPOSED
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PatchListResponse {
    #[serde(default)]
    pub patches: Vec<Patch>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PatchResponse {
    #[serde(default)]
    pub patch: Option<Patch>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Best-effort content type for the blob register call
pub fn content_type_for(path: &str) -> Option<&'static str> {
    let ext = path.rsplit_once('.')?.1.to_ascii_lowercase();
    Some(match ext.as_str() {
        "md" | "mdc" | "markdown" => "text/markdown",
        "txt" => "text/plain",
        "json" => "application/json",
        "yaml" | "yml" => "application/yaml",
        "toml" => "application/toml",
        _ => return None,
    })
}
