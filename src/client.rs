use std::collections::HashMap;

use async_stream::try_stream;
use bytes::Bytes;
use futures_util::{Stream, StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::oci::digest::Digest;
use crate::oci::image::{Descriptor, Manifest, ManifestVariant, PlatformSelector};
use crate::oci::reference::Reference;
use crate::registry::{Registry, Repository};
use crate::transfer::progress::{ByteStream, ProgressStream};
use crate::transfer::TransferCoordinator;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound on concurrently transferred blobs.
    pub concurrency: usize,
    /// Repository to attempt cross-repository mounts from when pushing.
    pub mount_from: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            concurrency: 3,
            mount_from: None,
        }
    }
}

/// Pull and push whole artifacts between one registry and a local layout.
///
/// Blob transfers are deduplicated per descriptor through a
/// [`TransferCoordinator`], so concurrent pulls sharing layers move each
/// blob over the network at most once.
#[derive(Clone)]
pub struct Client {
    registry: Registry,
    layout: Layout,
    coordinator: TransferCoordinator,
    config: ClientConfig,
}

impl Client {
    pub fn new(registry: Registry, layout: Layout) -> Client {
        Client {
            registry,
            layout,
            coordinator: TransferCoordinator::new(),
            config: ClientConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Client {
        self.config = config;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Pull the artifact named by `reference` into the layout.
    ///
    /// The returned stream yields overall progress as integer percentages,
    /// emitted on change, ending with `100` after the reference has been
    /// tagged and validated. Completed blobs survive a failed or cancelled
    /// pull; partial transfers are cleaned up.
    pub fn pull(
        &self,
        reference: &Reference,
        selector: &PlatformSelector,
    ) -> impl Stream<Item = Result<u8>> + Send {
        let client = self.clone();
        let reference = reference.clone();
        let selector = selector.clone();
        try_stream! {
            ensure(reference.registry() == client.registry.host(), || {
                Error::Generic(format!(
                    "reference `{}` does not name registry `{}`",
                    reference,
                    client.registry.host()
                ))
            })?;
            let repository = client.registry.repository(reference.repository())?;

            log::info!("pulling `{}`", reference);
            let (manifest_descriptor, manifest, manifest_bytes) =
                resolve_pull_manifest(&repository, &selector, &reference).await?;

            // The manifest blob goes through the same verified pipeline as
            // any other content.
            let mut store = client
                .layout
                .push(&manifest_descriptor, single_chunk(manifest_bytes));
            while let Some(item) = store.next().await {
                item?;
            }
            drop(store);

            // Work set: config plus layers, one transfer per distinct digest.
            let mut expected = HashMap::new();
            let mut units = Vec::new();
            for unit in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
                if expected.insert(unit.digest.clone(), unit.size).is_none() {
                    units.push(unit.clone());
                }
            }

            let (sender, receiver) = mpsc::channel(64);
            let concurrency = client.config.concurrency.max(1);
            let driver = {
                let client = client.clone();
                let repository = repository.clone();
                async move {
                    futures_util::stream::iter(units)
                        .map(|unit| {
                            let client = client.clone();
                            let repository = repository.clone();
                            let sender = sender.clone();
                            async move { client.pull_unit(repository, unit, sender).await }
                        })
                        .buffer_unordered(concurrency)
                        .try_collect::<Vec<()>>()
                        .await
                        .map(|_| ())
                }
            };

            let mut progress = Box::pin(transfer_progress(driver, receiver, expected));
            while let Some(item) = progress.next().await {
                yield item?;
            }
            drop(progress);

            client.layout.tag(&manifest_descriptor, &reference).await?;
            let resolved = client.layout.resolve(&reference)?;
            ensure(resolved.digest == manifest_descriptor.digest, || {
                Error::IncompletePull(reference.to_string())
            })?;
            log::info!("pulled `{}`", reference);
            yield 100;
        }
    }

    /// Push the artifact tagged as `reference` in the layout to the
    /// registry: blobs first with bounded parallelism, then manifests,
    /// children before the root.
    pub fn push(&self, reference: &Reference) -> impl Stream<Item = Result<u8>> + Send {
        let client = self.clone();
        let reference = reference.clone();
        try_stream! {
            ensure(reference.registry() == client.registry.host(), || {
                Error::Generic(format!(
                    "reference `{}` does not name registry `{}`",
                    reference,
                    client.registry.host()
                ))
            })?;
            let repository = client.registry.repository(reference.repository())?;
            let root = client.layout.resolve(&reference)?;

            log::info!("pushing `{}`", reference);
            let location = format!("{}/{}", client.registry.host(), reference.repository());
            let root_bytes = client.layout.read_blob(&root).await?;

            let mut manifests: Vec<(Descriptor, Vec<u8>)> = Vec::new();
            let mut expected = HashMap::new();
            let mut units = Vec::new();
            match ManifestVariant::from_bytes(&root.media_type, &location, &root_bytes)? {
                ManifestVariant::Manifest(manifest) => {
                    collect_blob_units(&manifest, &mut expected, &mut units);
                }
                ManifestVariant::Index(index) => {
                    for child in &index.manifests {
                        let child_bytes = client.layout.read_blob(child).await?;
                        match ManifestVariant::from_bytes(
                            &child.media_type,
                            &location,
                            &child_bytes,
                        )? {
                            ManifestVariant::Manifest(manifest) => {
                                collect_blob_units(&manifest, &mut expected, &mut units)
                            }
                            ManifestVariant::Index(_) => Err(Error::UnsupportedManifest {
                                media_type: child.media_type.clone(),
                                location: location.clone(),
                            })?,
                        }
                        manifests.push((child.clone(), child_bytes));
                    }
                }
            }
            manifests.push((root.clone(), root_bytes));

            let (sender, receiver) = mpsc::channel(64);
            let concurrency = client.config.concurrency.max(1);
            let driver = {
                let client = client.clone();
                let repository = repository.clone();
                async move {
                    futures_util::stream::iter(units)
                        .map(|unit| {
                            let client = client.clone();
                            let repository = repository.clone();
                            let sender = sender.clone();
                            async move { client.push_unit(repository, unit, sender).await }
                        })
                        .buffer_unordered(concurrency)
                        .try_collect::<Vec<()>>()
                        .await
                        .map(|_| ())
                }
            };

            let mut progress = Box::pin(transfer_progress(driver, receiver, expected));
            while let Some(item) = progress.next().await {
                yield item?;
            }
            drop(progress);

            let count = manifests.len();
            for (position, (descriptor, bytes)) in manifests.into_iter().enumerate() {
                let tag = if position + 1 == count {
                    reference.tag()
                } else {
                    None
                };
                repository.put_manifest(&descriptor, tag, bytes).await?;
            }
            log::info!("pushed `{}`", reference);
            yield 100;
        }
    }

    /// Transfer one blob from the registry into the layout, forwarding its
    /// progress. Deduplicated per descriptor through the coordinator.
    async fn pull_unit(
        self,
        repository: Repository,
        descriptor: Descriptor,
        sender: mpsc::Sender<(Digest, u64)>,
    ) -> Result<()> {
        let producer_client = self.clone();
        let producer_descriptor = descriptor.clone();
        let mut progress = self.coordinator.transfer(&descriptor, move || {
            producer_client.fetch_unit(repository, producer_descriptor)
        });
        while let Some(item) = progress.next().await {
            let bytes = item?;
            if sender.send((descriptor.digest.clone(), bytes)).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// The producer side of a pull: local fast paths, then a (possibly
    /// ranged) registry fetch streamed through the layout's verified write.
    fn fetch_unit(self, repository: Repository, descriptor: Descriptor) -> ProgressStream {
        Box::pin(try_stream! {
            match self.layout.exists(&descriptor).await {
                Ok(true) => {
                    log::debug!("blob `{}` already in the layout", descriptor.digest);
                    yield descriptor.size;
                    return;
                }
                Ok(false) => {}
                Err(Error::SizeMismatch { expected, actual }) => {
                    log::warn!(
                        "blob `{}` has `{}` bytes on disk, expected `{}`, fetching again",
                        descriptor.digest,
                        actual,
                        expected
                    );
                    self.layout.reset(&descriptor).await?;
                }
                Err(error) => Err(error)?,
            }

            if let Some(data) = descriptor.data.clone() {
                let bytes = base64::decode(&data).map_err(|error| {
                    Error::Generic(format!("could not decode inline descriptor data: {}", error))
                })?;
                log::debug!(
                    "materializing `{}` from inline descriptor data",
                    descriptor.digest
                );
                let mut store = self.layout.push(&descriptor, single_chunk(bytes));
                while let Some(item) = store.next().await {
                    yield item?;
                }
                return;
            }

            let resume = self.layout.resume_point(&descriptor).await?;
            let (resume_path, offset) = match resume {
                Some((path, offset)) => {
                    let info = repository.blob_info(&descriptor.digest).await?;
                    let ranged = matches!(info, Some(info) if info.accepts_ranges);
                    if ranged {
                        (Some(path), offset)
                    } else {
                        (None, 0)
                    }
                }
                None => (None, 0),
            };

            let (stream, start) = repository.blob_stream(&descriptor.digest, offset).await?;
            // A registry that ignored the range request restarts the write.
            let resume_path = if start == 0 { None } else { resume_path };

            let mut store = self.layout.push_from(&descriptor, resume_path, stream);
            while let Some(item) = store.next().await {
                yield item?;
            }
        })
    }

    /// Transfer one blob from the layout to the registry, forwarding its
    /// progress. Deduplicated per descriptor through the coordinator.
    async fn push_unit(
        self,
        repository: Repository,
        descriptor: Descriptor,
        sender: mpsc::Sender<(Digest, u64)>,
    ) -> Result<()> {
        let producer_layout = self.layout.clone();
        let producer_repository = repository;
        let producer_descriptor = descriptor.clone();
        let mount_from = self.config.mount_from.clone();
        let mut progress = self.coordinator.transfer(&descriptor, move || {
            Box::pin(try_stream! {
                let source = producer_layout.blob_stream(&producer_descriptor).await?;
                let mut upload = producer_repository.upload_blob_from(
                    &producer_descriptor,
                    mount_from,
                    source,
                );
                while let Some(item) = upload.next().await {
                    yield item?;
                }
            })
        });
        while let Some(item) = progress.next().await {
            let bytes = item?;
            if sender.send((descriptor.digest.clone(), bytes)).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Resolve the single-platform manifest a pull will materialize: either the
/// referenced manifest itself, or the selected entry of a referenced index.
async fn resolve_pull_manifest(
    repository: &Repository,
    selector: &PlatformSelector,
    reference: &Reference,
) -> Result<(Descriptor, Manifest, Vec<u8>)> {
    let target = reference.target_or_latest();
    let location = format!("{}/{}", reference.registry(), reference.repository());
    let (descriptor, bytes) = repository.manifest(&target).await?;

    match ManifestVariant::from_bytes(&descriptor.media_type, &location, &bytes)? {
        ManifestVariant::Manifest(manifest) => Ok((descriptor, manifest, bytes)),
        ManifestVariant::Index(index) => {
            let selected = index.select(selector)?.clone();
            log::debug!(
                "selected manifest `{}` from index `{}`",
                selected.digest,
                descriptor.digest
            );
            let (child_descriptor, child_bytes) =
                repository.manifest(&selected.digest.to_string()).await?;
            match ManifestVariant::from_bytes(
                &child_descriptor.media_type,
                &location,
                &child_bytes,
            )? {
                ManifestVariant::Manifest(manifest) => {
                    Ok((child_descriptor, manifest, child_bytes))
                }
                ManifestVariant::Index(_) => Err(Error::UnsupportedManifest {
                    media_type: child_descriptor.media_type,
                    location,
                }),
            }
        }
    }
}

fn collect_blob_units(
    manifest: &Manifest,
    expected: &mut HashMap<Digest, u64>,
    units: &mut Vec<Descriptor>,
) {
    for unit in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
        if expected.insert(unit.digest.clone(), unit.size).is_none() {
            units.push(unit.clone());
        }
    }
}

/// Merge per-descriptor byte deltas into an on-change percentage stream.
///
/// The driver future fans out the individual transfers; it runs as a task so
/// dropping the stream aborts the whole fan-out. Values above `99` are left
/// to the caller, which emits the terminal `100` after post-transfer work.
fn transfer_progress(
    driver: impl std::future::Future<Output = Result<()>> + Send + 'static,
    mut receiver: mpsc::Receiver<(Digest, u64)>,
    expected: HashMap<Digest, u64>,
) -> impl Stream<Item = Result<u8>> + Send {
    try_stream! {
        let total: u64 = expected.values().sum();
        let mut done: HashMap<Digest, u64> = HashMap::new();
        let mut transferred = 0u64;
        let mut last = None;

        let mut task = TaskGuard::new(tokio::spawn(driver));
        while let Some((digest, bytes)) = receiver.recv().await {
            let cap = match expected.get(&digest) {
                Some(cap) => *cap,
                None => continue,
            };
            let seen = done.entry(digest).or_insert(0);
            let counted = bytes.min(cap.saturating_sub(*seen));
            if counted == 0 {
                continue;
            }
            *seen += counted;
            transferred += counted;

            let percent = percent(transferred, total);
            if last != Some(percent) && percent < 100 {
                last = Some(percent);
                yield percent;
            }
        }
        task.join().await?;
    }
}

fn percent(transferred: u64, total: u64) -> u8 {
    if total == 0 {
        100
    } else {
        ((transferred * 100) / total) as u8
    }
}

fn ensure<F>(condition: bool, error: F) -> Result<()>
where
    F: FnOnce() -> Error,
{
    if condition {
        Ok(())
    } else {
        Err(error())
    }
}

fn single_chunk(bytes: Vec<u8>) -> ByteStream {
    Box::pin(futures_util::stream::once(async move {
        Ok(Bytes::from(bytes))
    }))
}

/// Aborts the fan-out task when the progress stream is dropped mid-pull.
struct TaskGuard {
    handle: Option<JoinHandle<Result<()>>>,
}

impl TaskGuard {
    fn new(handle: JoinHandle<Result<()>>) -> TaskGuard {
        TaskGuard {
            handle: Some(handle),
        }
    }

    async fn join(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(error) => Err(Error::Generic(format!("transfer task failed: {}", error))),
            },
            None => Ok(()),
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::convert::TryFrom;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use http::{Method, Request, Response, StatusCode};
    use hyper::Body;

    use super::*;
    use crate::oci::digest::Algorithm;
    use crate::oci::image::{
        Index, Platform, MEDIA_TYPE_CONFIG, MEDIA_TYPE_INDEX, MEDIA_TYPE_MANIFEST,
    };
    use crate::registry::transport::Transport;
    use crate::registry::RegistryConfig;

    const LAYER_MEDIA_TYPE: &str = "application/octet-stream";
    const HOST: &str = "registry.example.com";

    /// In-memory registry behind the [`Transport`] seam, covering the
    /// endpoints the orchestration exercises.
    #[derive(Default)]
    struct FakeRegistry {
        manifests: Mutex<HashMap<String, (String, Vec<u8>)>>,
        blobs: Mutex<HashMap<String, Vec<u8>>>,
        uploads: Mutex<HashMap<String, Vec<u8>>>,
        upload_counter: AtomicUsize,
        blob_fetches: AtomicUsize,
        upload_starts: AtomicUsize,
    }

    impl FakeRegistry {
        fn put_manifest(&self, repository: &str, reference: &str, media_type: &str, bytes: &[u8]) {
            let digest = Digest::compute(Algorithm::SHA256, bytes).to_string();
            let mut manifests = self.manifests.lock().unwrap();
            manifests.insert(
                format!("{}@{}", repository, reference),
                (media_type.to_string(), bytes.to_vec()),
            );
            manifests.insert(
                format!("{}@{}", repository, digest),
                (media_type.to_string(), bytes.to_vec()),
            );
        }

        fn put_blob(&self, bytes: &[u8]) -> Descriptor {
            let digest = Digest::compute(Algorithm::SHA256, bytes);
            self.blobs
                .lock()
                .unwrap()
                .insert(digest.to_string(), bytes.to_vec());
            Descriptor::new(LAYER_MEDIA_TYPE, digest, bytes.len() as u64)
        }

        fn has_blob(&self, digest: &Digest) -> bool {
            self.blobs.lock().unwrap().contains_key(&digest.to_string())
        }

        fn response(status: StatusCode) -> http::response::Builder {
            Response::builder().status(status)
        }
    }

    #[async_trait]
    impl Transport for Arc<FakeRegistry> {
        async fn send(&self, request: Request<Body>) -> crate::error::Result<Response<Body>> {
            let method = request.method().clone();
            let path = request.uri().path().to_string();
            let query = request.uri().query().unwrap_or("").to_string();
            let body = hyper::body::to_bytes(request.into_body())
                .await
                .unwrap_or_default();

            if let Some(rest) = path.strip_prefix("/v2/") {
                if let Some(position) = rest.find("/manifests/") {
                    let repository = &rest[..position];
                    let reference = &rest[position + "/manifests/".len()..];
                    return Ok(self.manifest_endpoint(&method, repository, reference, &body));
                }
                if let Some(position) = rest.find("/blobs/uploads/") {
                    let repository = &rest[..position];
                    let session = &rest[position + "/blobs/uploads/".len()..];
                    return Ok(self.upload_endpoint(&method, repository, session, &query, &body));
                }
                if let Some(position) = rest.find("/blobs/") {
                    let digest = &rest[position + "/blobs/".len()..];
                    return Ok(self.blob_endpoint(&method, digest));
                }
            }
            Ok(FakeRegistry::response(StatusCode::NOT_FOUND)
                .body(Body::empty())
                .unwrap())
        }
    }

    impl FakeRegistry {
        fn manifest_endpoint(
            &self,
            method: &Method,
            repository: &str,
            reference: &str,
            body: &[u8],
        ) -> Response<Body> {
            match *method {
                Method::GET | Method::HEAD => {
                    let manifests = self.manifests.lock().unwrap();
                    match manifests.get(&format!("{}@{}", repository, reference)) {
                        Some((media_type, bytes)) => {
                            let digest = Digest::compute(Algorithm::SHA256, bytes);
                            let payload = if *method == Method::HEAD {
                                Body::empty()
                            } else {
                                Body::from(bytes.clone())
                            };
                            Self::response(StatusCode::OK)
                                .header("content-type", media_type.as_str())
                                .header("content-length", bytes.len())
                                .header("docker-content-digest", digest.to_string())
                                .body(payload)
                                .unwrap()
                        }
                        None => Self::response(StatusCode::NOT_FOUND)
                            .body(Body::from(
                                r#"{"errors":[{"code":"MANIFEST_UNKNOWN","message":"manifest unknown"}]}"#,
                            ))
                            .unwrap(),
                    }
                }
                Method::PUT => {
                    let media_type = "application/vnd.oci.image.manifest.v1+json";
                    self.put_manifest(repository, reference, media_type, body);
                    Self::response(StatusCode::CREATED).body(Body::empty()).unwrap()
                }
                _ => Self::response(StatusCode::METHOD_NOT_ALLOWED)
                    .body(Body::empty())
                    .unwrap(),
            }
        }

        fn blob_endpoint(&self, method: &Method, digest: &str) -> Response<Body> {
            let blobs = self.blobs.lock().unwrap();
            match blobs.get(digest) {
                Some(bytes) => {
                    let payload = if *method == Method::HEAD {
                        Body::empty()
                    } else {
                        self.blob_fetches.fetch_add(1, Ordering::SeqCst);
                        Body::from(bytes.clone())
                    };
                    Self::response(StatusCode::OK)
                        .header("content-length", bytes.len())
                        .header("accept-ranges", "bytes")
                        .body(payload)
                        .unwrap()
                }
                None => Self::response(StatusCode::NOT_FOUND)
                    .body(Body::empty())
                    .unwrap(),
            }
        }

        fn upload_endpoint(
            &self,
            method: &Method,
            repository: &str,
            session: &str,
            query: &str,
            body: &[u8],
        ) -> Response<Body> {
            match *method {
                Method::POST => {
                    self.upload_starts.fetch_add(1, Ordering::SeqCst);
                    let session = self.upload_counter.fetch_add(1, Ordering::SeqCst);
                    self.uploads
                        .lock()
                        .unwrap()
                        .insert(session.to_string(), Vec::new());
                    Self::response(StatusCode::ACCEPTED)
                        .header(
                            "location",
                            format!("/v2/{}/blobs/uploads/{}", repository, session),
                        )
                        .body(Body::empty())
                        .unwrap()
                }
                Method::PATCH => {
                    let mut uploads = self.uploads.lock().unwrap();
                    let buffer = uploads.get_mut(session).unwrap();
                    buffer.extend_from_slice(body);
                    Self::response(StatusCode::ACCEPTED)
                        .header(
                            "location",
                            format!("/v2/{}/blobs/uploads/{}", repository, session),
                        )
                        .body(Body::empty())
                        .unwrap()
                }
                Method::PUT => {
                    let expected = query
                        .split('&')
                        .find_map(|parameter| parameter.strip_prefix("digest="))
                        .unwrap_or("");
                    let mut buffer = self
                        .uploads
                        .lock()
                        .unwrap()
                        .remove(session)
                        .unwrap_or_default();
                    buffer.extend_from_slice(body);

                    let calculated = Digest::compute(Algorithm::SHA256, &buffer).to_string();
                    if calculated != expected {
                        return Self::response(StatusCode::BAD_REQUEST)
                            .body(Body::from(
                                r#"{"errors":[{"code":"DIGEST_INVALID","message":"digest invalid"}]}"#,
                            ))
                            .unwrap();
                    }
                    self.blobs.lock().unwrap().insert(calculated, buffer);
                    Self::response(StatusCode::CREATED).body(Body::empty()).unwrap()
                }
                _ => Self::response(StatusCode::METHOD_NOT_ALLOWED)
                    .body(Body::empty())
                    .unwrap(),
            }
        }
    }

    fn descriptor_for(media_type: &str, bytes: &[u8]) -> Descriptor {
        Descriptor::new(
            media_type,
            Digest::compute(Algorithm::SHA256, bytes),
            bytes.len() as u64,
        )
    }

    fn manifest_for(config: &Descriptor, layers: &[&Descriptor]) -> Vec<u8> {
        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_MANIFEST.to_string()),
            config: config.clone(),
            layers: layers.iter().map(|layer| (*layer).clone()).collect(),
            annotations: None,
        };
        serde_json::to_vec(&manifest).unwrap()
    }

    fn selector() -> PlatformSelector {
        PlatformSelector::new("linux", "amd64")
    }

    async fn client_for(fake: &Arc<FakeRegistry>) -> (Client, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::open(dir.path()).await.unwrap();
        let registry = Registry::with_transport(HOST, Arc::new(fake.clone()));
        (Client::new(registry, layout), dir)
    }

    /// Stores config, two layers and a manifest in the fake registry,
    /// tagged `library/app:1.0`. Returns the manifest descriptor.
    fn seed_fake(fake: &FakeRegistry) -> (Descriptor, Vec<Descriptor>) {
        let mut config = fake.put_blob(br#"{"os":"linux"}"#);
        config.media_type = MEDIA_TYPE_CONFIG.to_string();
        let layer_one = fake.put_blob(b"first layer content");
        let layer_two = fake.put_blob(b"second layer content");

        let manifest_bytes = manifest_for(&config, &[&layer_one, &layer_two]);
        fake.put_manifest("library/app", "1.0", MEDIA_TYPE_MANIFEST, &manifest_bytes);
        let manifest = descriptor_for(MEDIA_TYPE_MANIFEST, &manifest_bytes);
        (manifest, vec![config, layer_one, layer_two])
    }

    fn reference(value: &str) -> Reference {
        Reference::try_from(value).unwrap()
    }

    async fn run_to_end(stream: impl Stream<Item = Result<u8>> + Send) -> Result<Vec<u8>> {
        futures_util::pin_mut!(stream);
        let mut percents = Vec::new();
        while let Some(item) = stream.next().await {
            percents.push(item?);
        }
        Ok(percents)
    }

    #[tokio::test]
    async fn pull_materializes_and_tags_artifact() -> anyhow::Result<()> {
        let fake = Arc::new(FakeRegistry::default());
        let (manifest, blobs) = seed_fake(&fake);
        let (client, _dir) = client_for(&fake).await;

        let reference = reference(&format!("{}/library/app:1.0", HOST));
        let percents = run_to_end(client.pull(&reference, &selector())).await?;

        assert_eq!(percents.last(), Some(&100));
        assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]));

        for blob in &blobs {
            assert!(client.layout().exists(blob).await?);
        }
        assert_eq!(client.layout().resolve(&reference)?.digest, manifest.digest);
        Ok(())
    }

    #[tokio::test]
    async fn repeated_pull_transfers_nothing() -> anyhow::Result<()> {
        let fake = Arc::new(FakeRegistry::default());
        seed_fake(&fake);
        let (client, _dir) = client_for(&fake).await;

        let reference = reference(&format!("{}/library/app:1.0", HOST));
        run_to_end(client.pull(&reference, &selector())).await?;
        let fetched_once = fake.blob_fetches.load(Ordering::SeqCst);
        assert_eq!(fetched_once, 3);

        let percents = run_to_end(client.pull(&reference, &selector())).await?;
        assert_eq!(fake.blob_fetches.load(Ordering::SeqCst), fetched_once);
        assert_eq!(percents.last(), Some(&100));
        Ok(())
    }

    #[tokio::test]
    async fn pull_selects_platform_from_index() -> anyhow::Result<()> {
        let fake = Arc::new(FakeRegistry::default());
        let mut config = fake.put_blob(br#"{"os":"linux"}"#);
        config.media_type = MEDIA_TYPE_CONFIG.to_string();
        let layer = fake.put_blob(b"platform layer");

        let manifest_bytes = manifest_for(&config, &[&layer]);
        let mut manifest = descriptor_for(MEDIA_TYPE_MANIFEST, &manifest_bytes);
        fake.put_manifest(
            "library/app",
            &manifest.digest.to_string(),
            MEDIA_TYPE_MANIFEST,
            &manifest_bytes,
        );

        manifest.platform = Some(Platform {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            os_version: None,
            os_features: None,
            variant: None,
        });
        let index = Index {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_INDEX.to_string()),
            manifests: vec![manifest.clone()],
            annotations: None,
        };
        let index_bytes = serde_json::to_vec(&index)?;
        fake.put_manifest("library/app", "multi", MEDIA_TYPE_INDEX, &index_bytes);

        let (client, _dir) = client_for(&fake).await;
        let reference = reference(&format!("{}/library/app:multi", HOST));
        let percents = run_to_end(client.pull(&reference, &selector())).await?;
        assert_eq!(percents.last(), Some(&100));
        assert_eq!(client.layout().resolve(&reference)?.digest, manifest.digest);

        let missing = run_to_end(client.pull(
            &reference,
            &PlatformSelector::new("linux", "riscv64"),
        ))
        .await;
        assert!(matches!(missing, Err(Error::PlatformNotFound)));
        Ok(())
    }

    #[tokio::test]
    async fn push_uploads_blobs_and_manifest() -> anyhow::Result<()> {
        let fake = Arc::new(FakeRegistry::default());
        let (client, _dir) = client_for(&fake).await;
        let layout = client.layout().clone();

        let config_bytes = br#"{"os":"linux"}"#.to_vec();
        let config = descriptor_for(MEDIA_TYPE_CONFIG, &config_bytes);
        run_push(&layout, &config, &config_bytes).await?;

        let layer_bytes = b"layer for upload".to_vec();
        let layer = descriptor_for(LAYER_MEDIA_TYPE, &layer_bytes);
        run_push(&layout, &layer, &layer_bytes).await?;

        let manifest_bytes = manifest_for(&config, &[&layer]);
        let manifest = descriptor_for(MEDIA_TYPE_MANIFEST, &manifest_bytes);
        run_push(&layout, &manifest, &manifest_bytes).await?;

        let reference = reference(&format!("{}/library/app:2.0", HOST));
        layout.tag(&manifest, &reference).await?;

        let percents = run_to_end(client.push(&reference)).await?;
        assert_eq!(percents.last(), Some(&100));

        assert!(fake.has_blob(&config.digest));
        assert!(fake.has_blob(&layer.digest));
        assert!(fake
            .manifests
            .lock()
            .unwrap()
            .contains_key("library/app@2.0"));
        Ok(())
    }

    #[tokio::test]
    async fn push_skips_blobs_already_present() -> anyhow::Result<()> {
        let fake = Arc::new(FakeRegistry::default());
        let (client, _dir) = client_for(&fake).await;
        let layout = client.layout().clone();

        let config_bytes = br#"{"os":"linux"}"#.to_vec();
        let config = descriptor_for(MEDIA_TYPE_CONFIG, &config_bytes);
        run_push(&layout, &config, &config_bytes).await?;
        fake.put_blob(&config_bytes);

        let manifest_bytes = manifest_for(&config, &[]);
        let manifest = descriptor_for(MEDIA_TYPE_MANIFEST, &manifest_bytes);
        run_push(&layout, &manifest, &manifest_bytes).await?;

        let reference = reference(&format!("{}/library/app:3.0", HOST));
        layout.tag(&manifest, &reference).await?;

        run_to_end(client.push(&reference)).await?;
        assert_eq!(fake.upload_starts.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn push_uses_chunked_uploads_above_threshold() -> anyhow::Result<()> {
        let fake = Arc::new(FakeRegistry::default());
        let dir = tempfile::tempdir()?;
        let layout = Layout::open(dir.path()).await?;
        let registry = Registry::with_transport(HOST, Arc::new(fake.clone())).with_config(
            RegistryConfig {
                chunk_length: 8,
                ..RegistryConfig::default()
            },
        );
        let client = Client::new(registry, layout.clone());

        let config_bytes = br#"{"os":"linux"}"#.to_vec();
        let config = descriptor_for(MEDIA_TYPE_CONFIG, &config_bytes);
        run_push(&layout, &config, &config_bytes).await?;

        let layer_bytes = b"a blob well above the configured chunk length".to_vec();
        let layer = descriptor_for(LAYER_MEDIA_TYPE, &layer_bytes);
        run_push(&layout, &layer, &layer_bytes).await?;

        let manifest_bytes = manifest_for(&config, &[&layer]);
        let manifest = descriptor_for(MEDIA_TYPE_MANIFEST, &manifest_bytes);
        run_push(&layout, &manifest, &manifest_bytes).await?;

        let reference = reference(&format!("{}/library/app:4.0", HOST));
        layout.tag(&manifest, &reference).await?;

        let percents = run_to_end(client.push(&reference)).await?;
        assert_eq!(percents.last(), Some(&100));
        assert!(fake.has_blob(&layer.digest));
        assert!(fake.has_blob(&config.digest));
        Ok(())
    }

    async fn run_push(layout: &Layout, descriptor: &Descriptor, bytes: &[u8]) -> Result<()> {
        let mut stream = layout.push(descriptor, single_chunk(bytes.to_vec()));
        while let Some(item) = stream.next().await {
            item?;
        }
        Ok(())
    }
}
