use std::convert::TryFrom;
use std::io;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use http::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LINK, RANGE};
use http::{Method, Request, StatusCode};
use hyper::Body;
use serde_derive::Deserialize;

use crate::error::{Error, FailureResponse, Result};
use crate::oci::digest::{Algorithm, Digest};
use crate::oci::image::{
    Descriptor, ManifestVariant, PlatformSelector, MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_INDEX, MEDIA_TYPE_MANIFEST,
};
use crate::oci::reference::Reference;
use crate::transfer::progress::ByteStream;

pub mod transport;
mod upload;

use transport::{HttpTransport, Transport};

/// Accept set sent when fetching manifests: the OCI pair plus the Docker
/// compatibility pair.
const MANIFEST_ACCEPT: [&str; 4] = [
    MEDIA_TYPE_MANIFEST,
    MEDIA_TYPE_INDEX,
    MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST,
];

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// URL scheme used to reach the registry, `https` unless talking to a
    /// local plain-text registry.
    pub scheme: String,
    /// Preferred chunk length for chunked uploads when the server does not
    /// declare `OCI-Chunk-Min-Length`; also the threshold below which blobs
    /// are pushed with a single monolithic request.
    pub chunk_length: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            scheme: "https".to_string(),
            chunk_length: 5 * 1024 * 1024,
        }
    }
}

/// Protocol client for a single registry host.
#[derive(Clone)]
pub struct Registry {
    host: String,
    config: RegistryConfig,
    transport: Arc<dyn Transport>,
}

impl Registry {
    pub fn new(host: impl Into<String>) -> Registry {
        Registry::with_transport(host, Arc::new(HttpTransport::default()))
    }

    pub fn with_transport(host: impl Into<String>, transport: Arc<dyn Transport>) -> Registry {
        Registry {
            host: host.into(),
            config: RegistryConfig::default(),
            transport,
        }
    }

    pub fn with_config(mut self, config: RegistryConfig) -> Registry {
        self.config = config;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn chunk_length(&self) -> usize {
        self.config.chunk_length
    }

    fn url(&self, path: &str) -> String {
        format!("{}://{}{}", self.config.scheme, self.host, path)
    }

    /// Turn a possibly relative `Location` value into an absolute URL.
    fn absolute(&self, location: &str) -> String {
        if location.starts_with('/') {
            self.url(location)
        } else {
            location.to_string()
        }
    }

    pub(crate) async fn send(&self, request: Request<Body>) -> Result<http::Response<Body>> {
        self.transport.send(request).await
    }

    /// Whether the registry answers the version check endpoint. Both `200`
    /// and `401` mean a distribution endpoint is listening.
    pub async fn ping(&self) -> Result<bool> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(self.url("/v2/"))
            .body(Body::empty())?;
        let response = self.send(request).await?;
        Ok(matches!(
            response.status(),
            StatusCode::OK | StatusCode::UNAUTHORIZED
        ))
    }

    /// Lazily paginated repository catalog; each item is one page of names.
    pub fn catalog(&self) -> impl Stream<Item = Result<Vec<String>>> + Send {
        let registry = self.clone();
        let first = registry.url(&format!("/v2/_catalog?n={}", DEFAULT_PAGE_SIZE));
        paginate(registry, first, |bytes| {
            let page: CatalogPage = serde_json::from_slice(&bytes)?;
            Ok(page.repositories)
        })
    }

    /// Client scoped to one repository of this registry.
    pub fn repository(&self, name: &str) -> Result<Repository> {
        Reference::validate_repository(name)?;
        Ok(Repository {
            registry: self.clone(),
            name: name.to_string(),
        })
    }
}

#[derive(Deserialize)]
struct CatalogPage {
    repositories: Vec<String>,
}

#[derive(Deserialize)]
struct TagsPage {
    #[allow(dead_code)]
    name: String,
    tags: Option<Vec<String>>,
}

/// Result of a blob `HEAD` request.
#[derive(Debug, Clone)]
pub struct BlobInfo {
    pub size: u64,
    pub accepts_ranges: bool,
}

/// Registry operations scoped to one repository.
#[derive(Clone)]
pub struct Repository {
    registry: Registry,
    name: String,
}

impl Repository {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn url(&self, suffix: &str) -> String {
        self.registry.url(&format!("/v2/{}{}", self.name, suffix))
    }

    /// Lazily paginated tag listing; each item is one page of tags.
    pub fn tags(&self) -> impl Stream<Item = Result<Vec<String>>> + Send {
        let registry = self.registry.clone();
        let first = self.url(&format!("/tags/list?n={}", DEFAULT_PAGE_SIZE));
        paginate(registry, first, |bytes| {
            let page: TagsPage = serde_json::from_slice(&bytes)?;
            Ok(page.tags.unwrap_or_default())
        })
    }

    /// `HEAD` a manifest, returning the descriptor advertised by the
    /// registry.
    pub async fn manifest_descriptor(&self, reference: &str) -> Result<Descriptor> {
        let url = self.url(&format!("/manifests/{}", reference));
        let request = Request::builder()
            .method(Method::HEAD)
            .uri(&url)
            .header(ACCEPT, MANIFEST_ACCEPT.join(", "))
            .body(Body::empty())?;
        let response = self.registry.send(request).await?;
        if !response.status().is_success() {
            return Err(failure(response).await);
        }

        let media_type = header_str(response.headers(), CONTENT_TYPE.as_str())
            .ok_or_else(|| Error::Generic("response is missing Content-Type".to_string()))?;
        let size = header_str(response.headers(), CONTENT_LENGTH.as_str())
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or_else(|| Error::Generic("response is missing Content-Length".to_string()))?;
        let digest = header_str(response.headers(), "docker-content-digest")
            .ok_or_else(|| {
                Error::Generic("response is missing Docker-Content-Digest".to_string())
            })
            .and_then(|value| Digest::try_from(value.as_str()))?;

        Ok(Descriptor::new(media_type, digest, size))
    }

    /// Fetch manifest content, returning the verified descriptor and the raw
    /// bytes exactly as served.
    pub async fn manifest(&self, reference: &str) -> Result<(Descriptor, Vec<u8>)> {
        log::debug!(
            "fetching manifest for `{}` with reference `{}`",
            self.name,
            reference
        );
        let url = self.url(&format!("/manifests/{}", reference));
        let request = Request::builder()
            .method(Method::GET)
            .uri(&url)
            .header(ACCEPT, MANIFEST_ACCEPT.join(", "))
            .body(Body::empty())?;
        let response = self.registry.send(request).await?;
        if !response.status().is_success() {
            return Err(failure(response).await);
        }

        let media_type = header_str(response.headers(), CONTENT_TYPE.as_str())
            .ok_or_else(|| Error::Generic("response is missing Content-Type".to_string()))?;
        let bytes = hyper::body::to_bytes(response.into_body()).await?.to_vec();

        // Content is always verified against the digest used to request it;
        // a tag request adopts the computed digest.
        let digest = match Digest::try_from(reference) {
            Ok(requested) => {
                let calculated = Digest::compute(requested.algorithm(), &bytes);
                if calculated != requested {
                    return Err(Error::DigestMismatch {
                        expected: requested.to_string(),
                        actual: calculated.to_string(),
                    });
                }
                requested
            }
            Err(_) => Digest::compute(Algorithm::SHA256, &bytes),
        };

        Ok((
            Descriptor::new(media_type, digest, bytes.len() as u64),
            bytes,
        ))
    }

    /// Resolve a tag or digest to the descriptor of a single-platform
    /// manifest, applying `selector` when the reference names an index.
    pub async fn resolve(
        &self,
        reference: &str,
        selector: &PlatformSelector,
    ) -> Result<Descriptor> {
        let (descriptor, bytes) = self.manifest(reference).await?;
        let location = format!("{}/{}:{}", self.registry.host(), self.name, reference);
        match ManifestVariant::from_bytes(&descriptor.media_type, &location, &bytes)? {
            ManifestVariant::Manifest(_) => Ok(descriptor),
            ManifestVariant::Index(index) => {
                log::debug!("resolving platform from index for `{}`", location);
                Ok(index.select(selector)?.clone())
            }
        }
    }

    /// Upload manifest content under a tag or its digest.
    pub async fn put_manifest(
        &self,
        descriptor: &Descriptor,
        reference: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let target = match reference {
            Some(reference) => reference.to_string(),
            None => descriptor.digest.to_string(),
        };
        log::debug!("pushing manifest `{}/{}`", self.name, target);
        let request = Request::builder()
            .method(Method::PUT)
            .uri(self.url(&format!("/manifests/{}", target)))
            .header(CONTENT_TYPE, descriptor.media_type.as_str())
            .header(CONTENT_LENGTH, bytes.len())
            .body(Body::from(bytes))?;
        let response = self.registry.send(request).await?;
        if !response.status().is_success() {
            return Err(failure(response).await);
        }
        Ok(())
    }

    pub async fn delete_manifest(&self, digest: &Digest) -> Result<()> {
        let request = Request::builder()
            .method(Method::DELETE)
            .uri(self.url(&format!("/manifests/{}", digest)))
            .body(Body::empty())?;
        let response = self.registry.send(request).await?;
        if !response.status().is_success() {
            return Err(failure(response).await);
        }
        Ok(())
    }

    /// `HEAD` a blob; `None` when the registry does not have it.
    pub async fn blob_info(&self, digest: &Digest) -> Result<Option<BlobInfo>> {
        let request = Request::builder()
            .method(Method::HEAD)
            .uri(self.url(&format!("/blobs/{}", digest)))
            .body(Body::empty())?;
        let response = self.registry.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(failure(response).await);
        }

        let size = header_str(response.headers(), CONTENT_LENGTH.as_str())
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);
        let accepts_ranges = header_str(response.headers(), "accept-ranges")
            .map_or(false, |value| value == "bytes");
        Ok(Some(BlobInfo {
            size,
            accepts_ranges,
        }))
    }

    pub async fn blob_exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.blob_info(digest).await?.is_some())
    }

    /// Open a blob content stream, optionally from a byte offset.
    ///
    /// Returns the stream together with the offset it actually starts at: a
    /// server that ignores the `Range` header answers `200` from byte zero
    /// and the caller must restart its write accordingly.
    pub async fn blob_stream(&self, digest: &Digest, offset: u64) -> Result<(ByteStream, u64)> {
        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(self.url(&format!("/blobs/{}", digest)));
        if offset > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", offset));
        }
        let response = self.registry.send(builder.body(Body::empty())?).await?;

        let start = match response.status() {
            StatusCode::PARTIAL_CONTENT => offset,
            StatusCode::OK => 0,
            StatusCode::NOT_FOUND => {
                return Err(Error::BlobNotFound(digest.to_string()));
            }
            _ => return Err(failure(response).await),
        };
        if offset > 0 && start == 0 {
            log::debug!("registry ignored the range request for `{}`", digest);
        }

        let stream = response
            .into_body()
            .map(|chunk| chunk.map_err(|error| io::Error::new(io::ErrorKind::Other, error)));
        Ok((Box::pin(stream), start))
    }

    pub async fn delete_blob(&self, digest: &Digest) -> Result<()> {
        let request = Request::builder()
            .method(Method::DELETE)
            .uri(self.url(&format!("/blobs/{}", digest)))
            .body(Body::empty())?;
        let response = self.registry.send(request).await?;
        if !response.status().is_success() {
            return Err(failure(response).await);
        }
        Ok(())
    }
}

pub(crate) fn header_str(headers: &http::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Extract the `rel="next"` target from `Link` headers.
fn next_link(headers: &http::HeaderMap) -> Option<String> {
    for value in headers.get_all(LINK) {
        let value = match value.to_str() {
            Ok(value) => value,
            Err(_) => continue,
        };
        for segment in value.split(',') {
            let mut parts = segment.split(';');
            let target = match parts.next() {
                Some(target) => target.trim(),
                None => continue,
            };
            if !target.starts_with('<') || !target.ends_with('>') {
                continue;
            }
            let is_next = parts.any(|parameter| {
                let parameter = parameter.trim();
                parameter == "rel=\"next\"" || parameter == "rel=next"
            });
            if is_next {
                return Some(target[1..target.len() - 1].to_string());
            }
        }
    }
    None
}

/// Follow a paginated listing endpoint until its `Link` header runs out.
fn paginate<T, P>(
    registry: Registry,
    first: String,
    parse: P,
) -> impl Stream<Item = Result<Vec<T>>> + Send
where
    T: Send,
    P: Fn(bytes::Bytes) -> Result<Vec<T>> + Send + Sync + 'static,
{
    futures_util::stream::try_unfold((Some(first), parse), move |(state, parse)| {
        let registry = registry.clone();
        async move {
            let url = match state {
                Some(url) => url,
                None => return Ok(None),
            };
            let request = Request::builder()
                .method(Method::GET)
                .uri(&url)
                .body(Body::empty())?;
            let response = registry.send(request).await?;
            if !response.status().is_success() {
                return Err(failure(response).await);
            }

            let next = next_link(response.headers()).map(|link| registry.absolute(&link));
            let bytes = hyper::body::to_bytes(response.into_body()).await?;
            let page = parse(bytes)?;
            Ok(Some((page, (next, parse))))
        }
    })
}

/// Map an unsuccessful response to an error, decoding the distribution-spec
/// error body when one is present.
pub(crate) async fn failure(response: http::Response<Body>) -> Error {
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body())
        .await
        .unwrap_or_default();

    match serde_json::from_slice::<FailureResponse>(&bytes) {
        Ok(body) if !body.errors.is_empty() => Error::Registry(body),
        _ => {
            let message = String::from_utf8_lossy(&bytes).trim().to_string();
            let message = if message.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("unknown failure")
                    .to_string()
            } else {
                message
            };
            Error::Http {
                status: status.as_u16(),
                message,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn parses_next_link() {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static("</v2/_catalog?last=busybox&n=100>; rel=\"next\""),
        );
        assert_eq!(
            next_link(&headers),
            Some("/v2/_catalog?last=busybox&n=100".to_string())
        );
    }

    #[test]
    fn ignores_unrelated_links() {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static("<https://docs.example.com>; rel=\"help\""),
        );
        assert_eq!(next_link(&headers), None);
        assert_eq!(next_link(&http::HeaderMap::new()), None);
    }

    #[test]
    fn picks_next_among_multiple_links() {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(
                "<https://docs.example.com>; rel=\"help\", </v2/repo/tags/list?last=v2>; rel=next",
            ),
        );
        assert_eq!(
            next_link(&headers),
            Some("/v2/repo/tags/list?last=v2".to_string())
        );
    }

    #[test]
    fn decodes_registry_error_body() {
        let body = br#"{"errors":[{"code":"MANIFEST_UNKNOWN","message":"manifest unknown","detail":{"Tag":"missing"}}]}"#;
        let decoded: FailureResponse = serde_json::from_slice(body).unwrap();
        assert_eq!(decoded.errors.len(), 1);
        assert_eq!(decoded.errors[0].code, "MANIFEST_UNKNOWN");
        assert_eq!(decoded.to_string(), "MANIFEST_UNKNOWN (manifest unknown)");
    }

    #[test]
    fn builds_urls_from_host_and_scheme() {
        let registry = Registry::new("localhost:5000").with_config(RegistryConfig {
            scheme: "http".to_string(),
            ..RegistryConfig::default()
        });
        assert_eq!(
            registry.url("/v2/library/app/manifests/latest"),
            "http://localhost:5000/v2/library/app/manifests/latest"
        );
        assert_eq!(
            registry.absolute("/v2/library/app/blobs/uploads/abc"),
            "http://localhost:5000/v2/library/app/blobs/uploads/abc"
        );
        assert_eq!(
            registry.absolute("https://cdn.example.com/upload"),
            "https://cdn.example.com/upload"
        );
    }

    #[test]
    fn repository_names_are_validated() {
        let registry = Registry::new("localhost:5000");
        assert!(registry.repository("library/app").is_ok());
        assert!(matches!(
            registry.repository("Library/App"),
            Err(Error::InvalidRepository(_))
        ));
    }
}
