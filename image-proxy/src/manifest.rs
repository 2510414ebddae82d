//! Image manifests, indexes and their normalisation to OCI.
//!
//! Registries serve a mix of OCI and Docker documents. Callers of the proxy
//! only ever see OCI image manifests: an index is resolved to the entry for
//! the target platform, and a Docker schema 2 manifest is rewritten with the
//! equivalent OCI media types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{ProxyError, ProxyResult};

/// Well known media types.
pub mod media_types {
    /// OCI image manifest
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    /// OCI image index
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    /// OCI image configuration
    pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    /// Uncompressed OCI layer
    pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
    /// Gzip compressed OCI layer
    pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    /// Zstd compressed OCI layer
    pub const OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
    /// Uncompressed layer which must not be pushed
    pub const OCI_LAYER_NONDISTRIBUTABLE: &str =
        "application/vnd.oci.image.layer.nondistributable.v1.tar";
    /// Gzip compressed layer which must not be pushed
    pub const OCI_LAYER_NONDISTRIBUTABLE_GZIP: &str =
        "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";

    /// Docker schema 2 manifest
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    /// Docker schema 2 manifest list
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    /// Docker schema 1 manifest
    pub const DOCKER_SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";
    /// Signed Docker schema 1 manifest
    pub const DOCKER_SCHEMA1_SIGNED: &str =
        "application/vnd.docker.distribution.manifest.v1+prettyjws";
    /// Docker image configuration
    pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    /// Docker uncompressed layer
    pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
    /// Docker gzip compressed layer
    pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
    /// Docker foreign (non-distributable) layer
    pub const DOCKER_LAYER_FOREIGN_GZIP: &str =
        "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
}

/// The kinds of manifest document we know how to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    /// An OCI image manifest
    OciManifest,
    /// An OCI image index
    OciIndex,
    /// A Docker schema 2 manifest
    DockerManifest,
    /// A Docker schema 2 manifest list
    DockerManifestList,
    /// A Docker schema 1 manifest, which cannot be converted
    DockerSchema1,
}

impl ManifestKind {
    fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type {
            media_types::OCI_MANIFEST => Some(ManifestKind::OciManifest),
            media_types::OCI_INDEX => Some(ManifestKind::OciIndex),
            media_types::DOCKER_MANIFEST => Some(ManifestKind::DockerManifest),
            media_types::DOCKER_MANIFEST_LIST => Some(ManifestKind::DockerManifestList),
            media_types::DOCKER_SCHEMA1 | media_types::DOCKER_SCHEMA1_SIGNED => {
                Some(ManifestKind::DockerSchema1)
            }
            _ => None,
        }
    }

    /// Whether this document lists per-platform manifests.
    pub fn is_index(&self) -> bool {
        matches!(self, ManifestKind::OciIndex | ManifestKind::DockerManifestList)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Outline {
    schema_version: Option<u32>,
    media_type: Option<String>,
    manifests: Option<serde_json::Value>,
}

/// Work out what kind of document `bytes` holds.
///
/// A declared media type (e.g. from `Content-Type`) wins when it is one we
/// recognise. Otherwise the document itself is inspected.
pub fn detect(declared: Option<&str>, bytes: &[u8]) -> ProxyResult<ManifestKind> {
    if let Some(kind) = declared.and_then(ManifestKind::from_media_type) {
        return Ok(kind);
    }

    let outline: Outline = serde_json::from_slice(bytes).map_err(invalid)?;
    if let Some(media_type) = outline.media_type.as_deref() {
        return ManifestKind::from_media_type(media_type)
            .ok_or_else(|| ProxyError::manifest(format!("unsupported media type {media_type}")));
    }

    match outline.schema_version {
        Some(1) => Ok(ManifestKind::DockerSchema1),
        Some(2) if outline.manifests.is_some() => Ok(ManifestKind::OciIndex),
        Some(2) => Ok(ManifestKind::OciManifest),
        Some(other) => Err(ProxyError::manifest(format!(
            "unsupported schema version {other}"
        ))),
        None => Err(ProxyError::manifest("document has no schemaVersion")),
    }
}

/// A reference to content by digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Type of the referenced content
    pub media_type: String,

    /// Digest of the referenced content
    pub digest: Digest,

    /// Size of the referenced content in bytes
    pub size: u64,

    /// Alternate download locations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,

    /// Arbitrary metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// Platform of the referenced manifest, in an index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,

    /// Artifact type of the referenced manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
}

/// Operating system and CPU architecture an image runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture, e.g. `amd64`
    pub architecture: String,

    /// Operating system, e.g. `linux`
    pub os: String,

    /// Operating system version
    #[serde(
        rename = "os.version",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub os_version: Option<String>,

    /// Required operating system features
    #[serde(
        rename = "os.features",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub os_features: Vec<String>,

    /// CPU variant, e.g. `v8`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Create a platform from an OS and architecture.
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Platform {
            architecture: architecture.into(),
            os: os.into(),
            os_version: None,
            os_features: Vec::new(),
            variant: None,
        }
    }

    /// The platform this process is running on, in OCI terms.
    pub fn host() -> Self {
        Platform::new(host_os(), host_arch())
    }

    /// Platform matching is exact on OS and architecture.
    pub fn matches(&self, other: &Platform) -> bool {
        self.os == other.os && self.architecture == other.architecture
    }
}

fn host_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

fn host_arch() -> &'static str {
    oci_arch(std::env::consts::ARCH, cfg!(target_endian = "little"))
}

fn oci_arch(arch: &str, little_endian: bool) -> &str {
    match arch {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        "powerpc64" if little_endian => "ppc64le",
        "powerpc64" => "ppc64",
        "loongarch64" => "loong64",
        other => other,
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

/// Parses `os/arch` or `os/arch/variant`.
impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        let os = parts.next().filter(|p| !p.is_empty());
        let arch = parts.next().filter(|p| !p.is_empty());
        let variant = parts.next().filter(|p| !p.is_empty());

        match (os, arch, parts.next()) {
            (Some(os), Some(arch), None) => {
                let mut platform = Platform::new(os, arch);
                platform.variant = variant.map(str::to_owned);
                Ok(platform)
            }
            _ => Err(format!("expected os/arch[/variant], got {s:?}")),
        }
    }
}

/// An image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Always 2
    pub schema_version: u32,

    /// Media type of this document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// Artifact type, for non-image artifacts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    /// The image configuration
    pub config: Descriptor,

    /// Filesystem layers, base first
    #[serde(default)]
    pub layers: Vec<Descriptor>,

    /// Manifest this one refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,

    /// Arbitrary metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// A multi-platform image index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Always 2
    pub schema_version: u32,

    /// Media type of this document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// Per-platform manifests
    pub manifests: Vec<Descriptor>,

    /// Arbitrary metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ImageIndex {
    /// Parse an index document.
    pub fn parse(bytes: &[u8]) -> ProxyResult<Self> {
        serde_json::from_slice(bytes).map_err(invalid)
    }

    /// The first entry whose platform matches `target` exactly.
    pub fn select(&self, target: &Platform) -> ProxyResult<&Descriptor> {
        self.manifests
            .iter()
            .find(|d| d.platform.as_ref().is_some_and(|p| p.matches(target)))
            .ok_or_else(|| ProxyError::NoMatchingPlatform(target.clone()))
    }
}

/// The manifest served to callers.
#[derive(Debug, Clone)]
pub struct ManifestResult {
    /// Digest of the manifest as the source served it, before conversion
    pub digest: Digest,

    /// The OCI manifest, serialized
    pub manifest: Bytes,

    /// The OCI manifest, parsed
    pub parsed: ImageManifest,
}

fn invalid(error: serde_json::Error) -> ProxyError {
    ProxyError::manifest(error.to_string())
}

/// Convert a single-image manifest of kind `kind` into an OCI manifest.
///
/// OCI manifests are passed through byte for byte.
pub fn to_oci(kind: ManifestKind, bytes: &Bytes) -> ProxyResult<(ImageManifest, Bytes)> {
    match kind {
        ManifestKind::OciManifest => {
            let manifest: ImageManifest = serde_json::from_slice(bytes).map_err(invalid)?;
            Ok((manifest, bytes.clone()))
        }
        ManifestKind::DockerManifest => {
            let docker: ImageManifest = serde_json::from_slice(bytes).map_err(invalid)?;
            let manifest = convert_docker(docker)?;
            let serialized = serde_json::to_vec(&manifest).map_err(invalid)?;
            Ok((manifest, Bytes::from(serialized)))
        }
        ManifestKind::DockerSchema1 => Err(ProxyError::manifest(
            "docker schema 1 manifests cannot be converted to OCI",
        )),
        ManifestKind::OciIndex | ManifestKind::DockerManifestList => Err(ProxyError::manifest(
            "expected an image manifest, found an index",
        )),
    }
}

fn convert_docker(mut manifest: ImageManifest) -> ProxyResult<ImageManifest> {
    manifest.media_type = Some(media_types::OCI_MANIFEST.to_owned());

    manifest.config.media_type = match manifest.config.media_type.as_str() {
        media_types::DOCKER_CONFIG | media_types::OCI_CONFIG => media_types::OCI_CONFIG.to_owned(),
        other => {
            return Err(ProxyError::manifest(format!(
                "unsupported config media type {other}"
            )))
        }
    };

    for layer in &mut manifest.layers {
        layer.media_type = oci_layer_type(&layer.media_type)?.to_owned();
    }

    Ok(manifest)
}

fn oci_layer_type(media_type: &str) -> ProxyResult<&'static str> {
    use media_types::*;

    Ok(match media_type {
        DOCKER_LAYER_GZIP | OCI_LAYER_GZIP => OCI_LAYER_GZIP,
        DOCKER_LAYER | OCI_LAYER => OCI_LAYER,
        DOCKER_LAYER_FOREIGN_GZIP | OCI_LAYER_NONDISTRIBUTABLE_GZIP => {
            OCI_LAYER_NONDISTRIBUTABLE_GZIP
        }
        OCI_LAYER_NONDISTRIBUTABLE => OCI_LAYER_NONDISTRIBUTABLE,
        OCI_LAYER_ZSTD => OCI_LAYER_ZSTD,
        other => {
            return Err(ProxyError::manifest(format!(
                "unsupported layer media type {other}"
            )))
        }
    })
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn detect_prefers_declared_type() {
        let bytes = br#"{"schemaVersion":2,"manifests":[]}"#;
        assert_eq!(
            detect(Some(media_types::DOCKER_MANIFEST_LIST), bytes).unwrap(),
            ManifestKind::DockerManifestList
        );
        assert_eq!(detect(None, bytes).unwrap(), ManifestKind::OciIndex);
        assert_eq!(
            detect(Some("application/json"), bytes).unwrap(),
            ManifestKind::OciIndex
        );
    }

    #[test]
    fn detect_schema1() {
        let bytes = br#"{"schemaVersion":1,"name":"library/busybox"}"#;
        assert_eq!(detect(None, bytes).unwrap(), ManifestKind::DockerSchema1);
        assert!(matches!(
            to_oci(ManifestKind::DockerSchema1, &Bytes::from_static(bytes)),
            Err(ProxyError::ManifestDecode(_))
        ));
    }

    #[test]
    fn detect_rejects_garbage() {
        assert!(matches!(
            detect(None, b"not json"),
            Err(ProxyError::ManifestDecode(_))
        ));
        assert!(matches!(
            detect(None, br#"{"mediaType":"text/plain"}"#),
            Err(ProxyError::ManifestDecode(_))
        ));
    }

    #[test]
    fn docker_manifest_converts_to_oci() {
        let original = docker_manifest(b"{}", b"layer");
        let (manifest, bytes) = to_oci(ManifestKind::DockerManifest, &original).unwrap();

        assert_eq!(manifest.media_type.as_deref(), Some(media_types::OCI_MANIFEST));
        assert_eq!(manifest.config.media_type, media_types::OCI_CONFIG);
        assert_eq!(manifest.layers[0].media_type, media_types::OCI_LAYER_GZIP);
        assert_eq!(manifest.layers[0].digest, Digest::sha256(b"layer"));

        // The converted document is a different byte string.
        assert_ne!(Digest::sha256(&bytes), Digest::sha256(&original));
        let reparsed: ImageManifest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reparsed, manifest);
    }

    #[test]
    fn foreign_layers_become_nondistributable() {
        assert_eq!(
            oci_layer_type(media_types::DOCKER_LAYER_FOREIGN_GZIP).unwrap(),
            media_types::OCI_LAYER_NONDISTRIBUTABLE_GZIP
        );
        assert!(oci_layer_type("application/vnd.docker.plugin.v1+json").is_err());
    }

    #[test]
    fn oci_manifest_passes_through_unchanged() {
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(media_types::OCI_MANIFEST.into()),
            artifact_type: None,
            config: descriptor(media_types::OCI_CONFIG, b"{}"),
            layers: vec![descriptor(media_types::OCI_LAYER_GZIP, b"x")],
            subject: None,
            annotations: Some([("org.example".to_owned(), "kept".to_owned())].into()),
        };
        let bytes = Bytes::from(serde_json::to_vec_pretty(&manifest).unwrap());

        let (parsed, out) = to_oci(ManifestKind::OciManifest, &bytes).unwrap();
        assert_eq!(parsed, manifest);
        assert_eq!(out, bytes);
    }

    #[test]
    fn index_selects_first_exact_match() {
        let mut amd64 = descriptor(media_types::OCI_MANIFEST, b"amd64");
        amd64.platform = Some(Platform::new("linux", "amd64"));
        let mut arm64 = descriptor(media_types::OCI_MANIFEST, b"arm64");
        arm64.platform = Some(Platform::new("linux", "arm64"));
        let mut arm64_again = descriptor(media_types::OCI_MANIFEST, b"arm64 again");
        arm64_again.platform = Some(Platform::new("linux", "arm64"));
        let unlabelled = descriptor(media_types::OCI_MANIFEST, b"attestation");

        let index = ImageIndex {
            schema_version: 2,
            media_type: None,
            manifests: vec![unlabelled, amd64, arm64.clone(), arm64_again],
            annotations: None,
        };

        let selected = index.select(&Platform::new("linux", "arm64")).unwrap();
        assert_eq!(selected, &arm64);

        let err = index.select(&Platform::new("windows", "arm64")).unwrap_err();
        assert!(matches!(err, ProxyError::NoMatchingPlatform(ref p) if p.os == "windows"));
        assert_eq!(err.to_string(), "no manifest for platform windows/arm64");
    }

    #[test]
    fn platform_strings() {
        let platform: Platform = "linux/arm64/v8".parse().unwrap();
        assert_eq!(platform.variant.as_deref(), Some("v8"));
        assert_eq!(platform.to_string(), "linux/arm64/v8");
        assert!("linux".parse::<Platform>().is_err());
        assert!("linux/".parse::<Platform>().is_err());
        assert!("a/b/c/d".parse::<Platform>().is_err());
    }

    #[test]
    fn host_platform_uses_oci_names() {
        let host = Platform::host();
        assert_ne!(host.architecture, "x86_64");
        assert_ne!(host.architecture, "aarch64");
    }

    #[test]
    fn powerpc_names_follow_endianness() {
        assert_eq!(oci_arch("powerpc64", true), "ppc64le");
        assert_eq!(oci_arch("powerpc64", false), "ppc64");
        assert_eq!(oci_arch("s390x", false), "s390x");
    }

    #[test]
    fn index_parse_errors_are_decode_errors() {
        assert!(matches!(
            ImageIndex::parse(b"[1, 2"),
            Err(ProxyError::ManifestDecode(_))
        ));
    }

    #[test]
    fn platform_serde_uses_dotted_names() {
        let mut platform = Platform::new("windows", "amd64");
        platform.os_version = Some("10.0.17763".into());
        let json = serde_json::to_value(&platform).unwrap();
        assert_eq!(json["os.version"], "10.0.17763");
        assert!(json.get("variant").is_none());
    }
}
