use bytes::{Bytes, BytesMut};
use async_stream::try_stream;
use futures_util::StreamExt;
use http::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use http::{Method, Request, StatusCode};
use hyper::Body;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::oci::digest::Digest;
use crate::oci::image::Descriptor;
use crate::registry::{failure, header_str, Repository};
use crate::transfer::progress::{ByteStream, ProgressStream};

const OCTET_STREAM: &str = "application/octet-stream";
const CHUNK_MIN_LENGTH_HEADER: &str = "oci-chunk-min-length";

enum UploadStart {
    /// The registry satisfied a cross-repository mount; no bytes move.
    Mounted,
    Session {
        location: String,
        chunk_min: Option<usize>,
    },
}

impl Repository {
    /// Upload a blob, choosing a monolithic `PUT` below the server-declared
    /// minimum chunk length and chunked `PATCH` requests above it.
    ///
    /// Progress items are incremental byte counts; a blob the registry
    /// already stores emits a single item equal to `descriptor.size`. A
    /// failed chunk is retried once from the offset the server reports for
    /// the upload session.
    pub fn upload_blob(&self, descriptor: &Descriptor, source: ByteStream) -> ProgressStream {
        self.upload_blob_from(descriptor, None, source)
    }

    /// Like [`Repository::upload_blob`], first attempting a cross-repository
    /// mount from `mount_from` within the same registry.
    pub fn upload_blob_from(
        &self,
        descriptor: &Descriptor,
        mount_from: Option<String>,
        mut source: ByteStream,
    ) -> ProgressStream {
        let repository = self.clone();
        let descriptor = descriptor.clone();
        Box::pin(try_stream! {
            if repository.blob_exists(&descriptor.digest).await? {
                log::debug!(
                    "blob `{}` already present in `{}`, skipping upload",
                    descriptor.digest,
                    repository.name()
                );
                yield descriptor.size;
                return;
            }

            let started = repository
                .start_upload(&descriptor.digest, mount_from.as_deref())
                .await?;
            let (mut location, chunk_min) = match started {
                UploadStart::Mounted => {
                    log::debug!(
                        "blob `{}` mounted into `{}`",
                        descriptor.digest,
                        repository.name()
                    );
                    yield descriptor.size;
                    return;
                }
                UploadStart::Session {
                    location,
                    chunk_min,
                } => (location, chunk_min),
            };

            let threshold = chunk_min.unwrap_or_else(|| repository.registry().chunk_length());

            if (descriptor.size as usize) < threshold {
                // Monolithic upload: a single PUT streaming the whole body,
                // with progress tapped off the request stream.
                let url = append_digest(&location, &descriptor.digest);
                let (tap, mut progress) = mpsc::unbounded_channel::<u64>();
                let counting = source.map(move |item| {
                    if let Ok(chunk) = &item {
                        let _ = tap.send(chunk.len() as u64);
                    }
                    item
                });
                let request = Request::builder()
                    .method(Method::PUT)
                    .uri(&url)
                    .header(CONTENT_TYPE, OCTET_STREAM)
                    .header(CONTENT_LENGTH, descriptor.size)
                    .body(Body::wrap_stream(counting))?;

                let mut pending = Box::pin(repository.registry().send(request));
                loop {
                    enum Step {
                        Sent(u64),
                        Finished(Result<http::Response<Body>>),
                    }
                    let step = tokio::select! {
                        biased;
                        Some(sent) = progress.recv() => Step::Sent(sent),
                        response = &mut pending => Step::Finished(response),
                    };
                    match step {
                        Step::Sent(sent) => yield sent,
                        Step::Finished(response) => {
                            let response = response?;
                            if !response.status().is_success() {
                                Err(failure(response).await)?
                            }
                            break;
                        }
                    }
                }
                while let Ok(sent) = progress.try_recv() {
                    yield sent;
                }
            } else {
                let mut buffer = BytesMut::with_capacity(threshold);
                let mut offset = 0u64;

                while let Some(chunk) = source.next().await {
                    buffer.extend_from_slice(&chunk?);
                    while buffer.len() >= threshold {
                        let body = buffer.split_to(threshold).freeze();
                        let sent = repository
                            .patch_chunk(&mut location, offset, body)
                            .await?;
                        offset += sent;
                        yield sent;
                    }
                }
                if !buffer.is_empty() {
                    let body = buffer.split().freeze();
                    let sent = repository
                        .patch_chunk(&mut location, offset, body)
                        .await?;
                    offset += sent;
                    yield sent;
                }

                repository.finalize_upload(&location, &descriptor.digest).await?;
            }
            log::debug!(
                "uploaded blob `{}` to `{}`",
                descriptor.digest,
                repository.name()
            );
        })
    }

    async fn start_upload(
        &self,
        digest: &Digest,
        mount_from: Option<&str>,
    ) -> Result<UploadStart> {
        let url = match mount_from {
            Some(from) => self.url(&format!("/blobs/uploads/?mount={}&from={}", digest, from)),
            None => self.url("/blobs/uploads/"),
        };
        let request = Request::builder()
            .method(Method::POST)
            .uri(&url)
            .header(CONTENT_LENGTH, 0)
            .body(Body::empty())?;
        let response = self.registry().send(request).await?;

        match response.status() {
            StatusCode::CREATED => Ok(UploadStart::Mounted),
            StatusCode::ACCEPTED => {
                let location = header_str(response.headers(), LOCATION.as_str())
                    .map(|location| self.registry().absolute(&location))
                    .ok_or_else(|| {
                        Error::Generic("upload start did not return a Location".to_string())
                    })?;
                let chunk_min = header_str(response.headers(), CHUNK_MIN_LENGTH_HEADER)
                    .and_then(|value| value.parse::<usize>().ok());
                Ok(UploadStart::Session {
                    location,
                    chunk_min,
                })
            }
            _ => Err(failure(response).await),
        }
    }

    /// Send one chunk, retrying once from the offset the server reports when
    /// the first attempt fails.
    async fn patch_chunk(
        &self,
        location: &mut String,
        start: u64,
        body: Bytes,
    ) -> Result<u64> {
        let length = body.len() as u64;
        match self.try_patch(location, start, body.clone()).await {
            Ok(next) => {
                if let Some(next) = next {
                    *location = next;
                }
                Ok(length)
            }
            Err(error) => {
                log::debug!(
                    "chunk upload failed, querying the session offset: {}",
                    error
                );
                let committed = self.upload_offset(location).await?;
                if committed < start || committed > start + length {
                    return Err(error);
                }
                if committed == start + length {
                    // The registry received the whole chunk after all.
                    return Ok(length);
                }

                let remainder = body.slice((committed - start) as usize..);
                let next = self.try_patch(location, committed, remainder).await?;
                if let Some(next) = next {
                    *location = next;
                }
                Ok(length)
            }
        }
    }

    async fn try_patch(
        &self,
        location: &str,
        start: u64,
        body: Bytes,
    ) -> Result<Option<String>> {
        let end = start + body.len() as u64 - 1;
        log::trace!("uploading chunk range `{}-{}`", start, end);
        let request = Request::builder()
            .method(Method::PATCH)
            .uri(location)
            .header(CONTENT_TYPE, OCTET_STREAM)
            .header(CONTENT_LENGTH, body.len())
            .header(CONTENT_RANGE, format!("{}-{}", start, end))
            .body(Body::from(body))?;
        let response = self.registry().send(request).await?;
        if !response.status().is_success() {
            return Err(failure(response).await);
        }
        Ok(header_str(response.headers(), LOCATION.as_str())
            .map(|location| self.registry().absolute(&location)))
    }

    /// Number of bytes the server has committed for an upload session,
    /// recovered from the `Range: 0-<last>` response header.
    async fn upload_offset(&self, location: &str) -> Result<u64> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(location)
            .body(Body::empty())?;
        let response = self.registry().send(request).await?;
        if !response.status().is_success() && response.status() != StatusCode::NO_CONTENT {
            return Err(failure(response).await);
        }
        Ok(header_str(response.headers(), RANGE.as_str())
            .and_then(|value| parse_committed_range(&value))
            .unwrap_or(0))
    }

    async fn finalize_upload(&self, location: &str, digest: &Digest) -> Result<()> {
        let request = Request::builder()
            .method(Method::PUT)
            .uri(append_digest(location, digest))
            .header(CONTENT_LENGTH, 0)
            .body(Body::empty())?;
        let response = self.registry().send(request).await?;
        if !response.status().is_success() {
            return Err(failure(response).await);
        }
        Ok(())
    }
}

fn append_digest(location: &str, digest: &Digest) -> String {
    if location.contains('?') {
        format!("{}&digest={}", location, digest)
    } else {
        format!("{}?digest={}", location, digest)
    }
}

/// Parse `0-<last>` into the number of committed bytes.
fn parse_committed_range(value: &str) -> Option<u64> {
    let (start, last) = value.split_once('-')?;
    if start.trim() != "0" {
        return None;
    }
    last.trim().parse::<u64>().ok().map(|last| last + 1)
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use super::*;

    #[test]
    fn appends_digest_to_plain_and_query_locations() {
        let digest =
            Digest::try_from(format!("sha256:{}", "a".repeat(64)).as_str()).unwrap();
        assert_eq!(
            append_digest("https://r.io/v2/repo/blobs/uploads/1", &digest),
            format!("https://r.io/v2/repo/blobs/uploads/1?digest={}", digest)
        );
        assert_eq!(
            append_digest("https://r.io/v2/repo/blobs/uploads/1?state=x", &digest),
            format!(
                "https://r.io/v2/repo/blobs/uploads/1?state=x&digest={}",
                digest
            )
        );
    }

    #[test]
    fn parses_committed_range() {
        assert_eq!(parse_committed_range("0-0"), Some(1));
        assert_eq!(parse_committed_range("0-41943039"), Some(41943040));
        assert_eq!(parse_committed_range("100-200"), None);
        assert_eq!(parse_committed_range("garbage"), None);
    }
}
