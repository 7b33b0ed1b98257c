pub static MEDIA_TYPE_MODEL_INDEX: &str = "application/vnd.modelx.model.index.v1.json";
pub static MEDIA_TYPE_MODEL_MANIFEST: &str = "application/vnd.modelx.model.manifest.v1.json";
pub static MEDIA_TYPE_MODEL_CONFIG: &str = "application/vnd.modelx.model.config.v1.yaml";
pub static MEDIA_TYPE_MODEL_FILE: &str = "application/vnd.modelx.model.file.v1";
pub static MEDIA_TYPE_MODEL_DIRECTORY: &str = "application/vnd.modelx.model.directory.v1.tar+gz";
pub static CONTENT_TYPE_JSON: &str = "application/json";
pub static CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

pub static REGISTRY_INDEX_FILENAME: &str = "index.json";
pub static ANNOTATION_DESCRIPTION: &str = "modelx.model.description";

/// Repository names are exactly two slash-separated lowercase segments.
pub static NAME_REGEX: &str = r"^[a-z0-9]+(?:[._-][a-z0-9]+)*/(?:[a-z0-9]+(?:[._-][a-z0-9]+)*)$";
pub static REFERENCE_REGEX: &str = r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$";
pub static DIGEST_REGEX: &str =
    r"^[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}$";

/// sha256 of zero bytes. Blobs with this digest are never transferred.
pub static EMPTY_FILE_DIGEST: &str =
    "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

lazy_static::lazy_static! {
    static ref DIGEST_PATTERN: regex::Regex = regex::Regex::new(DIGEST_REGEX).unwrap();
    static ref NAME_PATTERN: regex::Regex = regex::Regex::new(NAME_REGEX).unwrap();
    static ref REFERENCE_PATTERN: regex::Regex = regex::Regex::new(REFERENCE_REGEX).unwrap();
}

pub fn is_valid_repository_name(name: &str) -> bool {
    NAME_PATTERN.is_match(name)
}

pub fn is_valid_reference(reference: &str) -> bool {
    REFERENCE_PATTERN.is_match(reference)
}

/// `<algorithm>:<hex>` content address. The canonical algorithm is sha256.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    pub fn parse(raw: &str) -> Result<Self, ErrorInfo> {
        if !DIGEST_PATTERN.is_match(raw) {
            return Err(ErrorInfo::digest_invalid(raw));
        }
        Ok(Self(raw.to_lowercase()))
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(format!("sha256:{:x}", hasher.finalize()))
    }

    pub fn algorithm(&self) -> &str {
        self.0.split(':').next().unwrap_or("")
    }

    pub fn hex(&self) -> &str {
        self.0.split(':').nth(1).unwrap_or("")
    }

    /// Leading hex characters, used as a display name in progress output.
    pub fn short(&self) -> &str {
        let hex = self.hex();
        &hex[..hex.len().min(8)]
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_empty_file(&self) -> bool {
        self.0 == EMPTY_FILE_DIGEST
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Digest {
    type Err = ErrorInfo;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Incremental sha256 over a stream of chunks.
pub struct Digester(Sha256);

impl Digester {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Digest {
        Digest(format!("sha256:{:x}", self.0.finalize()))
    }
}

impl Default for Digester {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    #[serde(default, skip_serializing_if = "Digest::is_empty")]
    pub digest: Digest,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: i64,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub mode: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

pub fn sort_descriptors(descriptors: &mut [Descriptor]) {
    descriptors.sort_by(|a, b| a.name.cmp(&b.name));
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    pub config: Descriptor,
    pub blobs: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl Manifest {
    pub fn new() -> Self {
        Self {
            schema_version: 1,
            media_type: MEDIA_TYPE_MODEL_MANIFEST.to_string(),
            config: Descriptor::default(),
            blobs: Vec::new(),
            annotations: None,
        }
    }

    /// Config size plus the size of every blob.
    pub fn total_size(&self) -> i64 {
        self.config.size + self.blobs.iter().map(|b| b.size).sum::<i64>()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub schema_version: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl Index {
    pub fn new() -> Self {
        Self {
            schema_version: 1,
            media_type: MEDIA_TYPE_MODEL_INDEX.to_string(),
            manifests: Vec::new(),
            annotations: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationPurpose {
    Upload,
    Download,
}

impl fmt::Display for LocationPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => write!(f, "upload"),
            Self::Download => write!(f, "download"),
        }
    }
}

impl FromStr for LocationPurpose {
    type Err = ErrorInfo;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(Self::Upload),
            "download" => Ok(Self::Download),
            other => Err(ErrorInfo::parameter_invalid(&format!(
                "purpose: {other}"
            ))),
        }
    }
}

/// Side-channel transfer descriptor: "do not move bytes through the
/// registry; use this provider instead".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobLocation {
    pub provider: String,
    pub purpose: LocationPurpose,
    #[serde(default)]
    pub properties: serde_json::Value,
}

/// One presigned part of an s3 location. A single-part location is a plain
/// presigned object URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedPart {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_header: Option<HashMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "is_zero_i32")]
    pub part_number: i32,
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3LocationProperties {
    #[serde(default)]
    pub multipart: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upload_id: String,
    #[serde(default)]
    pub parts: Vec<PresignedPart>,
}

/// The modelx.yaml model configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub framework: String,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<serde_json::Value>,
    #[serde(default)]
    pub maintainers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
    #[serde(default)]
    pub model_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrCode {
    #[serde(rename = "BLOB_UNKNOWN")]
    BlobUnknown,
    #[serde(rename = "BLOB_UPLOAD_INVALID")]
    BlobUploadInvalid,
    #[serde(rename = "DIGEST_INVALID")]
    DigestInvalid,
    #[serde(rename = "MANIFEST_BLOB_UNKNOWN")]
    ManifestBlobUnknown,
    #[serde(rename = "MANIFEST_INVALID")]
    ManifestInvalid,
    #[serde(rename = "MANIFEST_UNKNOWN")]
    ManifestUnknown,
    #[serde(rename = "NAME_INVALID")]
    NameInvalid,
    #[serde(rename = "NAME_UNKNOWN")]
    NameUnknown,
    #[serde(rename = "SIZE_INVALID")]
    SizeInvalid,
    #[serde(rename = "UNAUTHORIZED")]
    Unauthorized,
    #[serde(rename = "DENIED")]
    Denied,
    #[serde(rename = "UNSUPPORTED")]
    Unsupported,
    #[serde(rename = "TOOMANYREQUESTS")]
    TooManyRequests,
    #[serde(rename = "CONFIG_INVALID")]
    ConfigInvalid,
    #[serde(rename = "INVALID_PARAMETER")]
    InvalidParameter,
    #[serde(rename = "INDEX_UNKNOWN")]
    IndexUnknown,
    #[serde(rename = "INTERNAL")]
    Internal,
    #[serde(other, rename = "UNKNOWN")]
    Unknown,
}

impl ErrCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BlobUnknown => 404,
            Self::BlobUploadInvalid => 400,
            Self::DigestInvalid => 400,
            Self::ManifestBlobUnknown => 404,
            Self::ManifestInvalid => 400,
            Self::ManifestUnknown => 404,
            Self::NameInvalid => 400,
            Self::NameUnknown => 404,
            Self::SizeInvalid => 400,
            Self::Unauthorized => 401,
            Self::Denied => 403,
            Self::Unsupported => 501,
            Self::TooManyRequests => 429,
            Self::ConfigInvalid => 400,
            Self::InvalidParameter => 400,
            Self::IndexUnknown => 404,
            Self::Internal => 500,
            Self::Unknown => 400,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::BlobUnknown => "blob unknown to registry",
            Self::BlobUploadInvalid => "blob upload invalid",
            Self::DigestInvalid => "provided digest did not match content",
            Self::ManifestBlobUnknown => "manifest references a blob unknown to registry",
            Self::ManifestInvalid => "manifest invalid",
            Self::ManifestUnknown => "manifest unknown to registry",
            Self::NameInvalid => "invalid repository name",
            Self::NameUnknown => "repository name not known to registry",
            Self::SizeInvalid => "provided length did not match content length",
            Self::Unauthorized => "authentication required",
            Self::Denied => "requested access to the resource is denied",
            Self::Unsupported => "the operation is unsupported",
            Self::TooManyRequests => "too many requests",
            Self::ConfigInvalid => "registry configuration invalid",
            Self::InvalidParameter => "invalid query or path parameter",
            Self::IndexUnknown => "index unknown to registry",
            Self::Internal => "internal error",
            Self::Unknown => "unknown error",
        }
    }
}

/// Wire error body shared by server responses and client decoding. The
/// http status never crosses the wire in the body; clients fill it from
/// the response status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(skip)]
    pub http_status: u16,
    pub code: ErrCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{:?}: {}", self.code, self.message)
        } else {
            write!(f, "{:?}: {} ({})", self.code, self.message, self.detail)
        }
    }
}

impl std::error::Error for ErrorInfo {}

impl ErrorInfo {
    pub fn new(code: ErrCode, message: impl Into<String>) -> Self {
        Self {
            http_status: code.http_status(),
            code,
            message: message.into(),
            detail: String::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn is_code(&self, code: ErrCode) -> bool {
        self.code == code
    }

    pub fn unauthorized(msg: &str) -> Self {
        Self::new(ErrCode::Unauthorized, msg)
    }

    pub fn unsupported(msg: &str) -> Self {
        Self::new(ErrCode::Unsupported, msg)
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(ErrCode::Internal, err.to_string())
    }

    pub fn digest_invalid(got: &str) -> Self {
        Self::new(ErrCode::DigestInvalid, format!("digest invalid: {got}"))
    }

    pub fn index_unknown(repository: &str) -> Self {
        Self::new(ErrCode::IndexUnknown, format!("index: {repository} not found"))
    }

    pub fn blob_unknown(digest: &Digest) -> Self {
        Self::new(ErrCode::BlobUnknown, format!("blob: {digest} not found"))
    }

    pub fn manifest_unknown(reference: &str) -> Self {
        Self::new(
            ErrCode::ManifestUnknown,
            format!("manifest: {reference} not found"),
        )
    }

    pub fn manifest_invalid(err: impl fmt::Display) -> Self {
        Self::new(ErrCode::ManifestInvalid, err.to_string())
    }

    pub fn name_invalid(name: &str) -> Self {
        Self::new(ErrCode::NameInvalid, format!("repository name invalid: {name}"))
    }

    pub fn size_invalid(msg: &str) -> Self {
        Self::new(ErrCode::SizeInvalid, format!("content length: {msg}"))
    }

    pub fn parameter_invalid(msg: &str) -> Self {
        Self::new(ErrCode::InvalidParameter, msg)
    }

    pub fn config_invalid(msg: &str) -> Self {
        Self::new(ErrCode::ConfigInvalid, msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_from_bytes() {
        let digest = Digest::from_bytes(b"hello world");
        assert_eq!(
            digest.as_str(),
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(digest.algorithm(), "sha256");
        assert_eq!(digest.short(), "b94d27b9");
    }

    #[test]
    fn test_empty_digest() {
        let digest = Digest::from_bytes(b"");
        assert_eq!(digest.as_str(), EMPTY_FILE_DIGEST);
        assert!(digest.is_empty_file());
    }

    #[test]
    fn test_digester_matches_from_bytes() {
        let mut digester = Digester::new();
        digester.update(b"hello ");
        digester.update(b"world");
        assert_eq!(digester.finalize(), Digest::from_bytes(b"hello world"));
    }

    #[test]
    fn test_digest_parse() {
        assert!(Digest::parse(EMPTY_FILE_DIGEST).is_ok());
        assert!(Digest::parse("sha256:xyz").is_err());
        assert!(Digest::parse("e3b0c44298fc1c149afbf4c8996fb924").is_err());
        assert!(Digest::parse("sha256+b64:0123456789abcdef0123456789abcdef").is_ok());
    }

    #[test]
    fn test_repository_name_regex() {
        assert!(is_valid_repository_name("library/bert"));
        assert!(is_valid_repository_name("my-org/gpt-2.large"));
        assert!(!is_valid_repository_name("bert"));
        assert!(!is_valid_repository_name("UPPER/case"));
        assert!(!is_valid_repository_name("a/b/c"));
        assert!(!is_valid_repository_name("a//b"));
    }

    #[test]
    fn test_reference_regex() {
        assert!(is_valid_reference("latest"));
        assert!(is_valid_reference("v1.2.3_rc-1"));
        assert!(!is_valid_reference(".hidden"));
        assert!(!is_valid_reference(""));
    }

    #[test]
    fn test_manifest_json_shape() {
        let mut manifest = Manifest::new();
        manifest.config = Descriptor {
            name: "modelx.yaml".to_string(),
            media_type: MEDIA_TYPE_MODEL_CONFIG.to_string(),
            digest: Digest::from_bytes(b"cfg"),
            size: 3,
            ..Default::default()
        };
        let raw = serde_json::to_string(&manifest).unwrap();
        assert!(raw.contains("\"schemaVersion\":1"));
        assert!(raw.contains("\"mediaType\""));
        // empty optionals are omitted
        assert!(!raw.contains("annotations"));
        assert!(!raw.contains("urls"));

        let back: Manifest = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, manifest);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let raw = r#"{"schemaVersion":1,"config":{"name":"c"},"blobs":[],"futureField":true}"#;
        let manifest: Manifest = serde_json::from_str(raw).unwrap();
        assert_eq!(manifest.config.name, "c");
    }

    #[test]
    fn test_error_code_wire_tags() {
        let info = ErrorInfo::manifest_unknown("v1");
        let raw = serde_json::to_string(&info).unwrap();
        assert!(raw.contains("\"MANIFEST_UNKNOWN\""));
        assert!(!raw.contains("http_status"));

        let decoded: ErrorInfo = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded.code, ErrCode::ManifestUnknown);
        assert_eq!(decoded.http_status, 0);
    }

    #[test]
    fn test_unknown_error_code_decodes() {
        let raw = r#"{"code":"SOMETHING_NEW","message":"m"}"#;
        let decoded: ErrorInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(decoded.code, ErrCode::Unknown);
    }

    #[test]
    fn test_sort_descriptors() {
        let mut descriptors = vec![
            Descriptor { name: "b".into(), ..Default::default() },
            Descriptor { name: "a".into(), ..Default::default() },
            Descriptor { name: "a.txt".into(), ..Default::default() },
        ];
        sort_descriptors(&mut descriptors);
        let names: Vec<_> = descriptors.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "a.txt", "b"]);
    }

    #[test]
    fn test_model_config_yaml_fields() {
        let raw = r#"{"description":"a model","framework":"torch","task":"nlp","tags":["t"],"maintainers":["me"],"modelFiles":["weights.bin"],"config":{"inputs":{}}}"#;
        let config: ModelConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.description, "a model");
        assert_eq!(config.model_files, vec!["weights.bin"]);
    }
}
