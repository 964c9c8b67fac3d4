use std::collections::{HashMap, HashSet};
use std::convert::TryFrom;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_stream::try_stream;
use futures_util::StreamExt;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::OwnedMutexGuard;
use tokio_util::io::ReaderStream;

use crate::error::{Error, Result};
use crate::oci::digest::Digest;
use crate::oci::image::{
    Descriptor, Index, LayoutMarker, Manifest, IMAGE_BLOBS_DIR, IMAGE_INDEX_FILE,
    IMAGE_LAYOUT_FILE, IMAGE_LAYOUT_VERSION,
};
use crate::oci::reference::Reference;
use crate::transfer::progress::{ByteStream, ProgressStream};

mod index;

use index::IndexState;

const CHUNK_SIZE: usize = 64 * 1024;

type LockMap = Arc<Mutex<HashMap<Descriptor, Arc<tokio::sync::Mutex<()>>>>>;

/// An on-disk store conforming to the OCI image layout:
///
/// ```text
/// <root>/
///   oci-layout
///   index.json
///   blobs/<algorithm>/<hex>
/// ```
///
/// Blobs are published atomically: content streams into a nonce-suffixed
/// staging file, is verified against its descriptor, and only then renamed to
/// its content address. A partial blob is never observable at its final path.
#[derive(Clone)]
pub struct Layout {
    root: PathBuf,
    index: Arc<IndexState>,
    pushing: LockMap,
}

impl Layout {
    /// Open the layout at `root`, creating the directory skeleton, the
    /// `oci-layout` marker and an empty `index.json` as needed.
    pub async fn open(root: impl AsRef<Path>) -> Result<Layout> {
        Layout::open_with(root, false).await
    }

    /// Like [`Layout::open`], additionally verifying size and digest of every
    /// manifest listed in the index before returning.
    pub async fn open_strict(root: impl AsRef<Path>) -> Result<Layout> {
        Layout::open_with(root, true).await
    }

    async fn open_with(root: impl AsRef<Path>, strict: bool) -> Result<Layout> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(IMAGE_BLOBS_DIR)).await?;

        let marker_path = root.join(IMAGE_LAYOUT_FILE);
        match fs::read(&marker_path).await {
            Ok(bytes) => {
                let marker: LayoutMarker =
                    serde_json::from_slice(&bytes).map_err(|error| Error::InvalidLayout {
                        path: root.clone(),
                        reason: format!("could not parse the layout marker: {}", error),
                    })?;
                if marker.image_layout_version != IMAGE_LAYOUT_VERSION {
                    return Err(Error::InvalidLayout {
                        path: root,
                        reason: format!(
                            "unsupported layout version `{}`",
                            marker.image_layout_version
                        ),
                    });
                }
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                let marker = LayoutMarker {
                    image_layout_version: IMAGE_LAYOUT_VERSION.to_string(),
                };
                fs::write(&marker_path, serde_json::to_vec(&marker)?).await?;
            }
            Err(error) => return Err(error.into()),
        }

        let index = IndexState::load_or_create(root.join(IMAGE_INDEX_FILE)).await?;
        let layout = Layout {
            root,
            index: Arc::new(index),
            pushing: Arc::new(Mutex::new(HashMap::new())),
        };

        if strict {
            for descriptor in layout.index.snapshot().manifests.iter() {
                layout.verify_blob(descriptor).await?;
            }
        }

        Ok(layout)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot of the top-level manifest descriptors.
    pub fn manifests(&self) -> Vec<Descriptor> {
        self.index.snapshot().manifests.clone()
    }

    fn algorithm_dir(&self, digest: &Digest) -> PathBuf {
        self.root
            .join(IMAGE_BLOBS_DIR)
            .join(digest.algorithm().to_string())
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.algorithm_dir(digest).join(digest.encoded())
    }

    fn staging_name(digest: &Digest) -> String {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        format!(".staging-{}-{}", digest.encoded(), nonce)
    }

    /// Whether the blob for `descriptor` is present with the expected length.
    ///
    /// A blob present with a different length reports [`Error::SizeMismatch`]
    /// so callers can detect and repair a corrupted partial write.
    pub async fn exists(&self, descriptor: &Descriptor) -> Result<bool> {
        let path = self.blob_path(&descriptor.digest);
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.len() == descriptor.size => Ok(true),
            Ok(metadata) => Err(Error::SizeMismatch {
                expected: descriptor.size,
                actual: metadata.len(),
            }),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// Read a blob fully into memory. Intended for manifests and configs.
    pub async fn read_blob(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        match fs::read(self.blob_path(&descriptor.digest)).await {
            Ok(bytes) => Ok(bytes),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                Err(Error::BlobNotFound(descriptor.digest.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Stream a blob's bytes from disk.
    pub async fn blob_stream(&self, descriptor: &Descriptor) -> Result<ByteStream> {
        match fs::File::open(self.blob_path(&descriptor.digest)).await {
            Ok(file) => Ok(Box::pin(ReaderStream::new(file))),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                Err(Error::BlobNotFound(descriptor.digest.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn acquire_push(&self, descriptor: &Descriptor) -> PushPermit {
        let lock = {
            let mut pushing = self.pushing.lock().unwrap();
            pushing
                .entry(descriptor.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = lock.clone().lock_owned().await;
        PushPermit {
            pushing: self.pushing.clone(),
            descriptor: descriptor.clone(),
            lock,
            guard: Some(guard),
        }
    }

    /// Stream `source` into the store as the content of `descriptor`.
    ///
    /// Progress items are incremental byte counts; a blob that is already
    /// present emits a single item equal to `descriptor.size`. Pushes of the
    /// same descriptor are serialized; the staging file is removed on failure
    /// or cancellation, and the final path appears only after size and digest
    /// have been verified.
    pub fn push(&self, descriptor: &Descriptor, source: ByteStream) -> ProgressStream {
        self.push_from(descriptor, None, source)
    }

    /// Like [`Layout::push`], seeding the write from an abandoned staging
    /// file previously located with [`Layout::resume_point`]. The seed prefix
    /// is re-hashed and reported as a single progress item; `source` must
    /// supply the bytes following it.
    pub fn push_from(
        &self,
        descriptor: &Descriptor,
        resume: Option<PathBuf>,
        mut source: ByteStream,
    ) -> ProgressStream {
        let layout = self.clone();
        let descriptor = descriptor.clone();
        Box::pin(try_stream! {
            let _permit = layout.acquire_push(&descriptor).await;

            if layout.exists(&descriptor).await? {
                log::debug!("blob `{}` already present, skipping write", descriptor.digest);
                yield descriptor.size;
                return;
            }

            let staging_dir = layout.algorithm_dir(&descriptor.digest);
            fs::create_dir_all(&staging_dir).await?;

            let mut seed = None;
            if let Some(path) = resume {
                if fs::metadata(&path).await.is_ok() {
                    seed = Some(path);
                }
            }
            let (path, mut file, seeded) = match seed {
                Some(path) => {
                    let file = fs::OpenOptions::new()
                        .read(true)
                        .append(true)
                        .open(&path)
                        .await?;
                    (path, file, true)
                }
                None => {
                    let path = staging_dir.join(Layout::staging_name(&descriptor.digest));
                    let file = fs::File::create(&path).await?;
                    (path, file, false)
                }
            };
            let mut guard = StagingGuard::new(path.clone());

            let mut hasher = descriptor.digest.algorithm().hasher();
            let mut received = 0u64;

            if seeded {
                let mut buffer = vec![0u8; CHUNK_SIZE];
                loop {
                    let count = file.read(&mut buffer).await?;
                    if count == 0 {
                        break;
                    }
                    hasher.update(&buffer[..count]);
                    received += count as u64;
                }
                if received > 0 {
                    log::debug!("resuming `{}` at byte `{}`", descriptor.digest, received);
                    yield received;
                }
            }

            while let Some(chunk) = source.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                hasher.update(&chunk);
                received += chunk.len() as u64;
                yield chunk.len() as u64;
            }
            file.sync_all().await?;
            drop(file);

            verify_content(&descriptor, received, hasher.finalize())?;

            fs::rename(&path, layout.blob_path(&descriptor.digest)).await?;
            guard.disarm();
            log::debug!("published blob `{}`", descriptor.digest);
        })
    }

    /// Delete the blob file at its final path without consulting references.
    /// Intended to clear a corrupted publish detected through the
    /// [`Error::SizeMismatch`] signal of [`Layout::exists`].
    pub async fn reset(&self, descriptor: &Descriptor) -> Result<()> {
        match fs::remove_file(self.blob_path(&descriptor.digest)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Locate the largest abandoned staging file for `descriptor`, returning
    /// its path and length. Smaller or oversized leftovers are cleared out.
    /// Returns `None` while a push of the same digest is in flight.
    pub async fn resume_point(&self, descriptor: &Descriptor) -> Result<Option<(PathBuf, u64)>> {
        {
            let pushing = self.pushing.lock().unwrap();
            if pushing.keys().any(|key| key.digest == descriptor.digest) {
                return Ok(None);
            }
        }

        let dir = self.algorithm_dir(&descriptor.digest);
        let prefix = format!(".staging-{}-", descriptor.digest.encoded());
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        let mut best: Option<(PathBuf, u64)> = None;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(prefix.as_str()) {
                continue;
            }
            let length = entry.metadata().await?.len();
            if length == 0 || length >= descriptor.size {
                let _ = fs::remove_file(entry.path()).await;
                continue;
            }
            match &best {
                Some((_, best_length)) if *best_length >= length => {
                    let _ = fs::remove_file(entry.path()).await;
                }
                _ => {
                    if let Some((previous, _)) = best.replace((entry.path(), length)) {
                        let _ = fs::remove_file(previous).await;
                    }
                }
            }
        }
        Ok(best)
    }

    /// Associate `reference` with `descriptor` in the top-level index,
    /// replacing any entry carrying the same reference name.
    pub async fn tag(&self, descriptor: &Descriptor, reference: &Reference) -> Result<()> {
        if !self.exists(descriptor).await? {
            return Err(Error::BlobNotFound(descriptor.digest.to_string()));
        }

        let name = reference.to_string();
        log::debug!("tagging `{}` as `{}`", descriptor.digest, name);
        let entry = descriptor.with_ref_name(name.as_str());
        self.index
            .update(move |manifests| {
                manifests.retain(|existing| existing.ref_name() != Some(name.as_str()));
                manifests.push(entry);
            })
            .await
    }

    /// Drop the index entry named `reference`, leaving all blobs in place.
    pub async fn untag(&self, reference: &Reference) -> Result<bool> {
        let name = reference.to_string();
        let present = self
            .index
            .snapshot()
            .manifests
            .iter()
            .any(|entry| entry.ref_name() == Some(name.as_str()));
        if !present {
            return Ok(false);
        }

        self.index
            .update(move |manifests| {
                manifests.retain(|existing| existing.ref_name() != Some(name.as_str()));
            })
            .await?;
        Ok(true)
    }

    /// Find the index entry named like `reference`, or carrying its digest.
    pub fn resolve(&self, reference: &Reference) -> Result<Descriptor> {
        let name = reference.to_string();
        self.index
            .snapshot()
            .manifests
            .iter()
            .find(|entry| {
                entry.ref_name() == Some(name.as_str())
                    || reference
                        .digest()
                        .map_or(false, |digest| &entry.digest == digest)
            })
            .cloned()
            .ok_or(Error::DescriptorNotFound(name))
    }

    /// Find the first index entry satisfying `predicate`.
    pub fn resolve_with<P>(&self, predicate: P) -> Result<Descriptor>
    where
        P: Fn(&Descriptor) -> bool,
    {
        self.index
            .snapshot()
            .manifests
            .iter()
            .find(|entry| predicate(entry))
            .cloned()
            .ok_or_else(|| Error::DescriptorNotFound("no matching index entry".to_string()))
    }

    /// Remove a manifest root together with the blobs only it references, or
    /// a single unreferenced blob. Removal is refused while the descriptor is
    /// being pushed or while a tagged manifest still references it.
    pub async fn remove(&self, descriptor: &Descriptor) -> Result<bool> {
        if self.pushing.lock().unwrap().contains_key(descriptor) {
            return Err(Error::UnableToRemove {
                digest: descriptor.digest.to_string(),
                reason: "a push of this descriptor is in progress".to_string(),
            });
        }

        let snapshot = self.manifests();
        let is_root = snapshot
            .iter()
            .any(|entry| entry.digest == descriptor.digest);

        if is_root {
            let (removed_roots, kept_roots): (Vec<Descriptor>, Vec<Descriptor>) = snapshot
                .into_iter()
                .partition(|entry| entry.digest == descriptor.digest);
            let candidates = self.reachable_from(&removed_roots).await?;
            let kept = self.reachable_from(&kept_roots).await?;

            let digest = descriptor.digest.clone();
            self.index
                .update(move |manifests| manifests.retain(|entry| entry.digest != digest))
                .await?;

            for digest in candidates.difference(&kept) {
                log::debug!("removing blob `{}`", digest);
                match fs::remove_file(self.blob_path(digest)).await {
                    Ok(()) => {}
                    Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                    Err(error) => return Err(error.into()),
                }
            }
            return Ok(true);
        }

        let referenced = self.reachable_from(&snapshot).await?;
        if referenced.contains(&descriptor.digest) {
            return Err(Error::UnableToRemove {
                digest: descriptor.digest.to_string(),
                reason: "the blob is referenced by a tagged manifest".to_string(),
            });
        }
        match fs::remove_file(self.blob_path(&descriptor.digest)).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// Delete every blob not reachable from the index, returning the digests
    /// removed. Refused while any push is in flight, so a blob about to be
    /// published can never be collected. Staging files are not collected.
    pub async fn gc(&self) -> Result<Vec<Digest>> {
        if !self.pushing.lock().unwrap().is_empty() {
            return Err(Error::Generic("downloads are in progress".to_string()));
        }

        let roots = self.manifests();
        let reachable = self.reachable_from(&roots).await?;

        let mut removed = Vec::new();
        let blobs_dir = self.root.join(IMAGE_BLOBS_DIR);
        let mut algorithms = match fs::read_dir(&blobs_dir).await {
            Ok(read_dir) => read_dir,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(removed),
            Err(error) => return Err(error.into()),
        };

        while let Some(algorithm_dir) = algorithms.next_entry().await? {
            if !algorithm_dir.file_type().await?.is_dir() {
                continue;
            }
            let algorithm = algorithm_dir.file_name().to_string_lossy().to_string();
            let mut entries = fs::read_dir(algorithm_dir.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_name = entry.file_name().to_string_lossy().to_string();
                let digest =
                    match Digest::try_from(format!("{}:{}", algorithm, file_name).as_str()) {
                        Ok(digest) => digest,
                        // Staging and foreign files are not blob content.
                        Err(_) => continue,
                    };
                if reachable.contains(&digest) {
                    continue;
                }
                log::info!("removing unreferenced blob `{}`", digest);
                fs::remove_file(entry.path()).await?;
                removed.push(digest);
            }
        }
        Ok(removed)
    }

    /// Digests reachable from `roots` through manifest and index blobs,
    /// visiting each distinct digest once.
    async fn reachable_from(&self, roots: &[Descriptor]) -> Result<HashSet<Digest>> {
        let mut visited = HashSet::new();
        let mut stack: Vec<Descriptor> = roots.to_vec();
        while let Some(descriptor) = stack.pop() {
            if !visited.insert(descriptor.digest.clone()) {
                continue;
            }
            if descriptor.is_index() {
                let bytes = self.read_blob(&descriptor).await?;
                let nested: Index = serde_json::from_slice(&bytes)?;
                stack.extend(nested.manifests);
            } else if descriptor.is_manifest() {
                let bytes = self.read_blob(&descriptor).await?;
                let manifest: Manifest = serde_json::from_slice(&bytes)?;
                visited.insert(manifest.config.digest.clone());
                for layer in manifest.layers {
                    visited.insert(layer.digest);
                }
            }
        }
        Ok(visited)
    }

    async fn verify_blob(&self, descriptor: &Descriptor) -> Result<()> {
        if !self.exists(descriptor).await? {
            return Err(Error::BlobNotFound(descriptor.digest.to_string()));
        }

        let mut file = fs::File::open(self.blob_path(&descriptor.digest)).await?;
        let mut hasher = descriptor.digest.algorithm().hasher();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let count = file.read(&mut buffer).await?;
            if count == 0 {
                break;
            }
            hasher.update(&buffer[..count]);
        }

        let calculated = hasher.finalize();
        if calculated != descriptor.digest {
            return Err(Error::DigestMismatch {
                expected: descriptor.digest.to_string(),
                actual: calculated.to_string(),
            });
        }
        Ok(())
    }
}

fn verify_content(descriptor: &Descriptor, received: u64, calculated: Digest) -> Result<()> {
    if received != descriptor.size {
        return Err(Error::SizeMismatch {
            expected: descriptor.size,
            actual: received,
        });
    }
    if calculated != descriptor.digest {
        return Err(Error::DigestMismatch {
            expected: descriptor.digest.to_string(),
            actual: calculated.to_string(),
        });
    }
    Ok(())
}

/// Holds the per-descriptor push lock; dropping releases the lock and clears
/// the map entry once no other pusher is waiting on it.
struct PushPermit {
    pushing: LockMap,
    descriptor: Descriptor,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PushPermit {
    fn drop(&mut self) {
        let mut pushing = self.pushing.lock().unwrap();
        self.guard.take();
        // The map entry and this permit hold the only references once no
        // other pusher is waiting on the lock.
        if Arc::strong_count(&self.lock) == 2 {
            pushing.remove(&self.descriptor);
        }
    }
}

/// Deletes the staging file unless the write was published.
struct StagingGuard {
    path: Option<PathBuf>,
}

impl StagingGuard {
    fn new(path: PathBuf) -> StagingGuard {
        StagingGuard { path: Some(path) }
    }

    fn disarm(&mut self) {
        self.path.take();
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}
