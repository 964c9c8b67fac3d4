use std::collections::HashMap;
use std::env::consts::{ARCH as CURRENT_ARCH, OS as CURRENT_OS};
use std::hash::{Hash, Hasher};

use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::oci::digest::Digest;

pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_DESCRIPTOR: &str = "application/vnd.oci.descriptor.v1+json";

// Docker compatibility pair, accepted when fetching manifests.
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Annotation key associating a reference name with an index entry.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

pub const IMAGE_LAYOUT_FILE: &str = "oci-layout";
pub const IMAGE_LAYOUT_VERSION: &str = "1.0.0";
pub const IMAGE_INDEX_FILE: &str = "index.json";
pub const IMAGE_BLOBS_DIR: &str = "blobs";

/// A structured pointer to a blob.
///
/// Equality and hashing ignore `platform`; two descriptors naming the same
/// bytes compare equal regardless of the platform entry they came from.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,

    #[serde(rename = "digest")]
    pub digest: Digest,

    #[serde(rename = "size")]
    pub size: u64,

    #[serde(rename = "urls", skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,

    #[serde(rename = "annotations", skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,

    #[serde(rename = "data", skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    #[serde(rename = "platform", skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Descriptor {
        Descriptor {
            media_type: media_type.into(),
            digest,
            size,
            urls: None,
            annotations: None,
            data: None,
            platform: None,
        }
    }

    pub fn is_manifest(&self) -> bool {
        self.media_type == MEDIA_TYPE_MANIFEST || self.media_type == MEDIA_TYPE_DOCKER_MANIFEST
    }

    pub fn is_index(&self) -> bool {
        self.media_type == MEDIA_TYPE_INDEX || self.media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
    }

    /// The `org.opencontainers.image.ref.name` annotation, if present.
    pub fn ref_name(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|annotations| annotations.get(ANNOTATION_REF_NAME))
            .map(String::as_str)
    }

    /// A copy of this descriptor carrying the given reference name annotation.
    pub fn with_ref_name(&self, name: impl Into<String>) -> Descriptor {
        let mut copy = self.clone();
        copy.annotations
            .get_or_insert_with(HashMap::new)
            .insert(ANNOTATION_REF_NAME.to_string(), name.into());
        copy
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        self.media_type == other.media_type
            && self.digest == other.digest
            && self.size == other.size
            && self.urls == other.urls
            && self.annotations == other.annotations
            && self.data == other.data
    }
}

impl Eq for Descriptor {}

impl Hash for Descriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.media_type.hash(state);
        self.digest.hash(state);
        self.size.hash(state);
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    #[serde(rename = "architecture")]
    pub architecture: String,

    #[serde(rename = "os")]
    pub os: String,

    #[serde(rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,

    #[serde(rename = "os.features", skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,

    #[serde(rename = "variant", skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Predicate applied to index entries when resolving a multi-platform image.
#[derive(Debug, Clone)]
pub struct PlatformSelector {
    os: String,
    architecture: String,
    variant: Option<String>,
}

impl PlatformSelector {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> PlatformSelector {
        PlatformSelector {
            os: os.into(),
            architecture: architecture.into(),
            variant: None,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> PlatformSelector {
        self.variant = Some(variant.into());
        self
    }

    /// Selector for the platform this process runs on, mapped to the
    /// `GOOS`/`GOARCH` names manifests use.
    pub fn host() -> PlatformSelector {
        let architecture = match CURRENT_ARCH {
            "x86_64" => "amd64",
            "x86" => "386",
            "aarch64" => "arm64",
            other => other,
        };
        PlatformSelector::new(CURRENT_OS, architecture)
    }

    pub fn matches(&self, platform: Option<&Platform>) -> bool {
        let platform = match platform {
            Some(platform) => platform,
            None => return false,
        };
        if platform.os != self.os || platform.architecture != self.architecture {
            return false;
        }
        match &self.variant {
            Some(variant) => platform.variant.as_deref() == Some(variant.as_str()),
            None => true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    #[serde(rename = "config")]
    pub config: Descriptor,

    #[serde(rename = "layers")]
    pub layers: Vec<Descriptor>,

    #[serde(rename = "annotations", skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Index {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    #[serde(rename = "manifests")]
    pub manifests: Vec<Descriptor>,

    #[serde(rename = "annotations", skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl Index {
    pub fn empty() -> Index {
        Index {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_INDEX.to_string()),
            manifests: Vec::new(),
            annotations: None,
        }
    }

    /// First entry matching the selector, or `PlatformNotFound`.
    pub fn select(&self, selector: &PlatformSelector) -> Result<&Descriptor> {
        self.manifests
            .iter()
            .find(|entry| selector.matches(entry.platform.as_ref()))
            .ok_or(Error::PlatformNotFound)
    }
}

/// Marker content of the `oci-layout` file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LayoutMarker {
    #[serde(rename = "imageLayoutVersion")]
    pub image_layout_version: String,
}

/// Either document a manifest endpoint can return.
#[derive(Debug, Clone)]
pub enum ManifestVariant {
    Manifest(Manifest),
    Index(Index),
}

impl ManifestVariant {
    /// Decode manifest bytes according to their declared media type.
    pub fn from_bytes(media_type: &str, location: &str, bytes: &[u8]) -> Result<ManifestVariant> {
        match media_type {
            MEDIA_TYPE_MANIFEST | MEDIA_TYPE_DOCKER_MANIFEST => {
                Ok(ManifestVariant::Manifest(serde_json::from_slice(bytes)?))
            }
            MEDIA_TYPE_INDEX | MEDIA_TYPE_DOCKER_MANIFEST_LIST => {
                Ok(ManifestVariant::Index(serde_json::from_slice(bytes)?))
            }
            other => Err(Error::UnsupportedManifest {
                media_type: other.to_string(),
                location: location.to_string(),
            }),
        }
    }
}
