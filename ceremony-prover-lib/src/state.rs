use crate::error::{Error, Result};
use crate::types::{ArtifactLocator, ArtifactRef, CeremonyInstance, CircuitInfo};
use sha2::{Digest, Sha256};
use sled::Db;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const DB_SUBDIR: &str = "store_db";
const ARTIFACTS_SUBDIR: &str = "artifacts";
const VERSIONS_TREE_NAME: &[u8] = b"artifact_versions";
const CEREMONY_TREE_NAME: &[u8] = b"ceremonies";
const CIRCUIT_TREE_NAME: &[u8] = b"circuit_info";
const TEMP_PREFIX: &str = ".tmp";

/// Durable, versioned storage for ceremony artifacts and service metadata.
///
/// Artifact bytes live on the filesystem, one content-addressed file per
/// version; the version index, ceremony records and circuit registry live in
/// Sled. A version becomes visible only once its file has been atomically
/// renamed into place *and* the index entry is flushed, so a crash at any
/// point leaves the previously committed version intact.
#[derive(Debug, Clone)] // Clone is cheap because Db is Arc-based
pub struct ParameterStore {
    db: Db,
    artifacts_path: PathBuf,
    versions_tree: sled::Tree,
    ceremony_tree: sled::Tree,
    circuit_tree: sled::Tree,
    // Serializes read-modify-write of the version index
    index_lock: Arc<Mutex<()>>,
}

impl ParameterStore {
    /// Creates or opens a `ParameterStore` rooted at the given base path.
    ///
    /// Leftover temp files from an interrupted write are removed.
    pub fn new(base_path: PathBuf) -> Result<Self> {
        let db_path = base_path.join(DB_SUBDIR);
        let artifacts_path = base_path.join(ARTIFACTS_SUBDIR);

        fs::create_dir_all(&db_path).map_err(Error::IoError)?;
        fs::create_dir_all(&artifacts_path).map_err(Error::IoError)?;

        let db = sled::open(&db_path)
            .map_err(|e| Error::StateError(format!("Failed to open sled DB: {}", e)))?;
        let versions_tree = db.open_tree(VERSIONS_TREE_NAME)?;
        let ceremony_tree = db.open_tree(CEREMONY_TREE_NAME)?;
        let circuit_tree = db.open_tree(CIRCUIT_TREE_NAME)?;

        let store = Self {
            db,
            artifacts_path,
            versions_tree,
            ceremony_tree,
            circuit_tree,
            index_lock: Arc::new(Mutex::new(())),
        };
        store.sweep_temp_files()?;
        Ok(store)
    }

    // --- Artifacts ---

    /// Commits `data` as a new version of `slot`.
    ///
    /// The write is durable before this returns. Earlier versions stay
    /// retrievable by reference until pruned.
    pub fn put(&self, slot: &str, data: &[u8]) -> Result<ArtifactRef> {
        if slot.is_empty() {
            return Err(Error::InvalidInput("slot name is empty".to_string()));
        }
        let digest = hex::encode(Sha256::digest(data));
        let dir = self.slot_dir(slot);
        fs::create_dir_all(&dir)?;
        let final_path = dir.join(format!("{}.bin", digest));
        // A same-named file is reused only if it really holds these bytes
        if !file_matches(&final_path, &digest)? {
            write_atomically(&dir, &final_path, data)?;
        }

        let _guard = self.index_lock.lock()?;
        // A concurrent prune may have removed a shared file
        if !final_path.exists() {
            write_atomically(&dir, &final_path, data)?;
        }
        let mut versions = self.versions(slot)?;
        let artifact = ArtifactRef {
            slot: slot.to_string(),
            version: versions.last().map(|v| v.version + 1).unwrap_or(1),
            digest,
            size: data.len() as u64,
        };
        versions.push(artifact.clone());
        self.write_versions(slot, &versions)?;
        debug!(%slot, version = artifact.version, size = artifact.size, "Committed artifact");
        Ok(artifact)
    }

    /// Reads a committed artifact, verifying its digest.
    pub fn get(&self, locator: impl Into<ArtifactLocator>) -> Result<Vec<u8>> {
        let artifact = self.resolve(locator.into())?;
        let path = self.artifact_path(&artifact);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!(
                    "artifact `{}` v{} is indexed but its file is missing",
                    artifact.slot, artifact.version
                )));
            }
            Err(e) => return Err(Error::IoError(e)),
        };
        if hex::encode(Sha256::digest(&data)) != artifact.digest {
            warn!(slot = %artifact.slot, version = artifact.version, "Artifact digest mismatch");
            return Err(Error::CorruptArtifact {
                slot: artifact.slot,
                version: artifact.version,
            });
        }
        Ok(data)
    }

    /// [`put`](Self::put) on the blocking pool; artifacts can be gigabytes.
    pub async fn put_async(&self, slot: &str, data: Vec<u8>) -> Result<ArtifactRef> {
        let store = self.clone();
        let slot = slot.to_string();
        tokio::task::spawn_blocking(move || store.put(&slot, &data))
            .await
            .map_err(|e| Error::Internal(format!("artifact write task failed: {}", e)))?
    }

    /// [`get`](Self::get) on the blocking pool.
    pub async fn get_async(&self, locator: impl Into<ArtifactLocator>) -> Result<Vec<u8>> {
        let store = self.clone();
        let locator = locator.into();
        tokio::task::spawn_blocking(move || store.get(locator))
            .await
            .map_err(|e| Error::Internal(format!("artifact read task failed: {}", e)))?
    }

    /// Whether `slot` has at least one committed version.
    pub fn exists(&self, slot: &str) -> Result<bool> {
        Ok(self.latest(slot)?.is_some())
    }

    pub fn latest(&self, slot: &str) -> Result<Option<ArtifactRef>> {
        Ok(self.versions(slot)?.pop())
    }

    /// All committed versions of `slot`, oldest first.
    pub fn versions(&self, slot: &str) -> Result<Vec<ArtifactRef>> {
        match self.versions_tree.get(slot.as_bytes())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    /// Drops all but the newest `keep` versions of `slot`. Returns how many were removed.
    pub fn prune(&self, slot: &str, keep: usize) -> Result<usize> {
        let _guard = self.index_lock.lock()?;
        let mut versions = self.versions(slot)?;
        if versions.len() <= keep {
            return Ok(0);
        }
        let kept = versions.split_off(versions.len() - keep);
        let dropped = versions;
        self.write_versions(slot, &kept)?;
        for artifact in &dropped {
            if kept.iter().any(|k| k.digest == artifact.digest) {
                continue;
            }
            match fs::remove_file(self.artifact_path(artifact)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::IoError(e)),
            }
        }
        debug!(%slot, removed = dropped.len(), "Pruned artifact versions");
        Ok(dropped.len())
    }

    fn resolve(&self, locator: ArtifactLocator) -> Result<ArtifactRef> {
        match locator {
            ArtifactLocator::Slot(slot) => self
                .latest(&slot)?
                .ok_or_else(|| Error::NotFound(format!("no committed artifact in slot `{}`", slot))),
            ArtifactLocator::Ref(wanted) => self
                .versions(&wanted.slot)?
                .into_iter()
                .find(|v| *v == wanted)
                .ok_or_else(|| {
                    Error::NotFound(format!(
                        "artifact `{}` v{} is not committed",
                        wanted.slot, wanted.version
                    ))
                }),
        }
    }

    fn write_versions(&self, slot: &str, versions: &[ArtifactRef]) -> Result<()> {
        let bytes = bincode::serialize(versions)?;
        self.versions_tree.insert(slot.as_bytes(), bytes)?;
        self.db
            .flush()
            .map_err(|e| Error::StateError(format!("Failed to flush sled DB: {}", e)))?;
        Ok(())
    }

    /// Slot names are arbitrary strings; their directory is keyed by hash.
    fn slot_dir(&self, slot: &str) -> PathBuf {
        self.artifacts_path
            .join(hex::encode(Sha256::digest(slot.as_bytes())))
    }

    fn artifact_path(&self, artifact: &ArtifactRef) -> PathBuf {
        self.slot_dir(&artifact.slot)
            .join(format!("{}.bin", artifact.digest))
    }

    fn sweep_temp_files(&self) -> Result<()> {
        for slot_dir in fs::read_dir(&self.artifacts_path)? {
            let slot_dir = slot_dir?.path();
            if !slot_dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&slot_dir)? {
                let entry = entry?;
                if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                    debug!(path = %entry.path().display(), "Removing interrupted write");
                    fs::remove_file(entry.path())?;
                }
            }
        }
        Ok(())
    }

    // --- Ceremony records ---

    pub fn load_ceremony(&self, instance_id: &str) -> Result<Option<CeremonyInstance>> {
        match self.ceremony_tree.get(instance_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn save_ceremony(&self, instance: &CeremonyInstance) -> Result<()> {
        let bytes = bincode::serialize(instance)?;
        self.ceremony_tree
            .insert(instance.instance_id.as_bytes(), bytes)?;
        self.db
            .flush()
            .map_err(|e| Error::StateError(format!("Failed to flush sled DB: {}", e)))?;
        Ok(())
    }

    // --- Circuit registry ---

    /// Stores (or replaces) a circuit registration.
    pub fn store_circuit(&self, info: &CircuitInfo) -> Result<()> {
        let info_bytes = bincode::serialize(info)?;
        self.circuit_tree
            .insert(info.name.as_bytes(), info_bytes)
            .map_err(|e| Error::StateError(format!("Failed to insert into sled tree: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| Error::StateError(format!("Failed to flush sled DB: {}", e)))?;
        Ok(())
    }

    pub fn get_circuit_info(&self, name: &str) -> Result<Option<CircuitInfo>> {
        match self.circuit_tree.get(name.as_bytes())? {
            Some(info_bytes) => Ok(Some(bincode::deserialize(&info_bytes)?)),
            None => Ok(None),
        }
    }

    /// Every registered circuit, ordered by name.
    pub fn list_circuits(&self) -> Result<Vec<CircuitInfo>> {
        self.circuit_tree
            .iter()
            .values()
            .map(|value| {
                let bytes = value
                    .map_err(|e| Error::StateError(format!("Sled value iteration failed: {}", e)))?;
                Ok(bincode::deserialize(&bytes)?)
            })
            .collect()
    }
}

fn file_matches(path: &Path, digest: &str) -> Result<bool> {
    match fs::read(path) {
        Ok(existing) => Ok(hex::encode(Sha256::digest(&existing)) == digest),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::IoError(e)),
    }
}

/// Write-to-temp, fsync, rename. Readers see the old file or the whole new one.
fn write_atomically(dir: &Path, final_path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(final_path).map_err(|e| Error::IoError(e.error))?;
    #[cfg(unix)]
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}
