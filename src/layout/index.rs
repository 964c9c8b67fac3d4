use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::oci::image::{Descriptor, Index};

/// Top-level index state with snapshot reads and atomic persistence.
///
/// Mutators serialize on a single async lock, rebuild the manifest list and
/// swap in a fresh snapshot only after `index.json` has been durably
/// replaced. Readers clone the current snapshot and iterate it without
/// blocking writers.
pub struct IndexState {
    path: PathBuf,
    snapshot: Mutex<Arc<Index>>,
    writer: tokio::sync::Mutex<()>,
}

impl IndexState {
    /// Read `index.json` at `path`, or create an empty one.
    pub async fn load_or_create(path: PathBuf) -> Result<IndexState> {
        let index = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|error| Error::InvalidLayout {
                path: path.clone(),
                reason: format!("could not parse index.json: {}", error),
            })?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                let index = Index::empty();
                write_atomically(&path, &index).await?;
                index
            }
            Err(error) => return Err(error.into()),
        };

        Ok(IndexState {
            path,
            snapshot: Mutex::new(Arc::new(index)),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    /// Current index snapshot; stable while mutations proceed.
    pub fn snapshot(&self) -> Arc<Index> {
        self.snapshot.lock().unwrap().clone()
    }

    /// Mutate the manifest list and persist the result atomically.
    pub async fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<Descriptor>),
    {
        let _guard = self.writer.lock().await;

        let mut index = (*self.snapshot()).clone();
        mutate(&mut index.manifests);
        write_atomically(&self.path, &index).await?;

        *self.snapshot.lock().unwrap() = Arc::new(index);
        Ok(())
    }
}

async fn write_atomically(path: &PathBuf, index: &Index) -> Result<()> {
    let staging = match path.parent() {
        Some(parent) => parent.join(".index.json.staging"),
        None => PathBuf::from(".index.json.staging"),
    };

    let bytes = serde_json::to_vec(index)?;
    let mut file = fs::File::create(&staging).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&staging, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use super::*;
    use crate::oci::digest::Digest;
    use crate::oci::image::MEDIA_TYPE_MANIFEST;

    fn descriptor(fill: char) -> Descriptor {
        let digest =
            Digest::try_from(format!("sha256:{}", fill.to_string().repeat(64)).as_str()).unwrap();
        Descriptor::new(MEDIA_TYPE_MANIFEST, digest, 5)
    }

    #[tokio::test]
    async fn persists_and_reloads() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("index.json");

        let state = IndexState::load_or_create(path.clone()).await?;
        state.update(|manifests| manifests.push(descriptor('a'))).await?;

        let reloaded = IndexState::load_or_create(path).await?;
        assert_eq!(reloaded.snapshot().manifests, vec![descriptor('a')]);
        Ok(())
    }

    #[tokio::test]
    async fn snapshot_is_stable_across_updates() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let state = IndexState::load_or_create(dir.path().join("index.json")).await?;
        state.update(|manifests| manifests.push(descriptor('a'))).await?;

        let before = state.snapshot();
        state.update(|manifests| manifests.push(descriptor('b'))).await?;

        assert_eq!(before.manifests.len(), 1);
        assert_eq!(state.snapshot().manifests.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn rejects_corrupt_index() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("index.json");
        fs::write(&path, b"not json").await?;

        assert!(matches!(
            IndexState::load_or_create(path).await,
            Err(Error::InvalidLayout { .. })
        ));
        Ok(())
    }
}
