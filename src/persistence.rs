//! On-disk layout for a retrieval index.
//!
//! A location is a directory holding exactly two artifacts:
//!
//! ```text
//! vectors.bin     binary vector artifact (header + f32 LE rows)
//! metadata.json   JSON array of {"text", "meta"} records, same order
//! ```
//!
//! `vectors.bin` layout:
//!
//! ```text
//! Offset   Size    Type        Description
//! ─────────────────────────────────────────────
//! 0x00     8       [u8; 8]     Magic: "MRAGVEC1"
//! 0x08     4       u32 LE      D: Dimension
//! 0x0C     8       u64 LE      N: Number of vectors
//! 0x14     32      [u8; 32]    SHA-256 of the paired metadata.json
//! 0x34     N*D*4   [f32]       Vector data (Little Endian)
//! ```
//!
//! The digest ties the pair together: a vector artifact never validates
//! against metadata from a different save.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::error::IndexError;
use crate::metadata_store::Chunk;

pub const VECTORS_FILE: &str = "vectors.bin";
pub const METADATA_FILE: &str = "metadata.json";
/// Holds the last committed metadata while a save swaps the pair.
pub const PREVIOUS_METADATA_FILE: &str = "metadata.json.prev";

pub const MAGIC: [u8; 8] = *b"MRAGVEC1";
pub const HEADER_SIZE: usize = 52;

/// Paths of the paired artifacts under one location.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub dir: PathBuf,
    pub vectors: PathBuf,
    pub metadata: PathBuf,
    pub previous_metadata: PathBuf,
}

impl ArtifactPaths {
    pub fn new(location: impl AsRef<Path>) -> Self {
        let dir = location.as_ref().to_path_buf();
        Self {
            vectors: dir.join(VECTORS_FILE),
            metadata: dir.join(METADATA_FILE),
            previous_metadata: dir.join(PREVIOUS_METADATA_FILE),
            dir,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorHeader {
    pub dimension: u32,
    pub count: u64,
    pub metadata_digest: [u8; 32],
}

impl VectorHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&self.dimension.to_le_bytes());
        buf[12..20].copy_from_slice(&self.count.to_le_bytes());
        buf[20..52].copy_from_slice(&self.metadata_digest);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexError> {
        if bytes.len() < HEADER_SIZE {
            return Err(IndexError::CorruptIndex(format!(
                "vector artifact too small for header: {} bytes",
                bytes.len()
            )));
        }
        if bytes[0..8] != MAGIC {
            return Err(IndexError::CorruptIndex(
                "invalid magic bytes in vector artifact".to_string(),
            ));
        }

        let dimension = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let mut count = [0u8; 8];
        count.copy_from_slice(&bytes[12..20]);
        let mut metadata_digest = [0u8; 32];
        metadata_digest.copy_from_slice(&bytes[20..52]);

        Ok(Self {
            dimension,
            count: u64::from_le_bytes(count),
            metadata_digest,
        })
    }

    /// Expected artifact size, or `None` if the header describes an impossible file.
    fn file_size(&self) -> Option<usize> {
        let floats = (self.count as usize).checked_mul(self.dimension as usize)?;
        floats
            .checked_mul(std::mem::size_of::<f32>())?
            .checked_add(HEADER_SIZE)
    }
}

/// Everything read back from one location.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub dimension: usize,
    pub vectors: Vec<f32>,
    pub records: Vec<Chunk>,
}

pub fn metadata_digest(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

pub fn encode_metadata(records: &[Chunk]) -> Result<Vec<u8>, IndexError> {
    serde_json::to_vec_pretty(records)
        .map_err(|e| IndexError::CorruptIndex(format!("failed to serialize metadata: {e}")))
}

pub fn encode_vectors(dimension: usize, data: &[f32], metadata: &[u8]) -> Vec<u8> {
    let count = if dimension == 0 { 0 } else { data.len() / dimension };
    let header = VectorHeader {
        dimension: dimension as u32,
        count: count as u64,
        metadata_digest: metadata_digest(metadata),
    };

    let mut buf = Vec::with_capacity(HEADER_SIZE + data.len() * std::mem::size_of::<f32>());
    buf.extend_from_slice(&header.to_bytes());
    for value in data {
        buf.extend_from_slice(&value.to_le_bytes());
    }
    buf
}

pub fn decode_vectors(bytes: &[u8]) -> Result<(VectorHeader, Vec<f32>), IndexError> {
    let header = VectorHeader::from_bytes(bytes)?;
    let expected = header.file_size().ok_or_else(|| {
        IndexError::CorruptIndex(format!(
            "header describes an impossible artifact: {} vectors of dimension {}",
            header.count, header.dimension
        ))
    })?;
    if bytes.len() != expected {
        return Err(IndexError::CorruptIndex(format!(
            "vector artifact truncated or padded: expected {} bytes, got {}",
            expected,
            bytes.len()
        )));
    }

    let data = bytes[HEADER_SIZE..]
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok((header, data))
}

/// A staging file next to its target. Removed on drop unless committed.
struct StagedFile {
    path: PathBuf,
    committed: bool,
}

impl StagedFile {
    async fn write(target: &Path, bytes: &[u8]) -> Result<Self, IndexError> {
        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("artifact");
        let staged = Self {
            path: target.with_file_name(format!("{name}.{}.tmp", Uuid::new_v4())),
            committed: false,
        };

        let mut file = tokio::fs::File::create(&staged.path)
            .await
            .map_err(|e| IndexError::persistence(&staged.path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| IndexError::persistence(&staged.path, e))?;
        file.sync_all()
            .await
            .map_err(|e| IndexError::persistence(&staged.path, e))?;
        Ok(staged)
    }

    async fn commit(mut self, target: &Path) -> Result<(), IndexError> {
        tokio::fs::rename(&self.path, target)
            .await
            .map_err(|e| IndexError::persistence(target, e))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed
            && let Err(e) = std::fs::remove_file(&self.path)
        {
            tracing::debug!(path = ?self.path, error = %e, "Failed to remove staged file");
        }
    }
}

async fn exists(path: &Path) -> Result<bool, IndexError> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| IndexError::persistence(path, e))
}

/// Commit a new artifact pair.
///
/// Both artifacts are staged and synced before anything visible changes.
/// The vector artifact is renamed last and is the commit point; until then
/// the previous metadata stays reachable as `metadata.json` or
/// `metadata.json.prev`.
pub async fn write_pair(
    paths: &ArtifactPaths,
    vectors: &[u8],
    metadata: &[u8],
) -> Result<(), IndexError> {
    tokio::fs::create_dir_all(&paths.dir)
        .await
        .map_err(|e| IndexError::persistence(&paths.dir, e))?;

    let staged_metadata = StagedFile::write(&paths.metadata, metadata).await?;
    let staged_vectors = StagedFile::write(&paths.vectors, vectors).await?;

    let had_previous = set_aside_committed_metadata(paths).await?;

    if let Err(err) = staged_metadata.commit(&paths.metadata).await {
        if had_previous {
            restore_previous(paths).await;
        }
        return Err(err);
    }

    if let Err(err) = staged_vectors.commit(&paths.vectors).await {
        if had_previous {
            restore_previous(paths).await;
        } else if let Err(e) = tokio::fs::remove_file(&paths.metadata).await {
            tracing::warn!(path = ?paths.metadata, error = %e, "Failed to remove uncommitted metadata");
        }
        return Err(err);
    }

    if exists(&paths.previous_metadata).await? {
        if let Err(e) = tokio::fs::remove_file(&paths.previous_metadata).await {
            tracing::warn!(path = ?paths.previous_metadata, error = %e, "Failed to remove previous metadata");
        }
    }
    Ok(())
}

/// Which metadata file the current `vectors.bin` was committed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommittedMetadata {
    Current,
    /// A previous save was interrupted after setting the metadata aside.
    Previous,
    /// No readable vector artifact, or neither file matches it.
    Unknown,
}

async fn read_header(path: &Path) -> std::io::Result<[u8; HEADER_SIZE]> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = [0u8; HEADER_SIZE];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn matches_digest(path: &Path, digest: &[u8; 32]) -> Result<bool, IndexError> {
    if !exists(path).await? {
        return Ok(false);
    }
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| IndexError::persistence(path, e))?;
    Ok(&metadata_digest(&bytes) == digest)
}

async fn committed_metadata(paths: &ArtifactPaths) -> Result<CommittedMetadata, IndexError> {
    let header = match read_header(&paths.vectors).await {
        Ok(bytes) => match VectorHeader::from_bytes(&bytes) {
            Ok(header) => header,
            Err(_) => return Ok(CommittedMetadata::Unknown),
        },
        Err(e) => {
            tracing::debug!(path = ?paths.vectors, error = %e, "No readable vector header");
            return Ok(CommittedMetadata::Unknown);
        }
    };

    if matches_digest(&paths.metadata, &header.metadata_digest).await? {
        Ok(CommittedMetadata::Current)
    } else if matches_digest(&paths.previous_metadata, &header.metadata_digest).await? {
        Ok(CommittedMetadata::Previous)
    } else {
        Ok(CommittedMetadata::Unknown)
    }
}

/// Move the committed metadata to the `.prev` path before the new pair is
/// renamed in. Returns whether a backup exists there afterwards.
///
/// After an interrupted save `.prev` already holds the committed copy and
/// `metadata.json` is a leftover that must not replace it.
async fn set_aside_committed_metadata(paths: &ArtifactPaths) -> Result<bool, IndexError> {
    match committed_metadata(paths).await? {
        CommittedMetadata::Previous => {
            if exists(&paths.metadata).await? {
                tracing::warn!(
                    path = ?paths.metadata,
                    "Discarding metadata left by an interrupted save"
                );
                tokio::fs::remove_file(&paths.metadata)
                    .await
                    .map_err(|e| IndexError::persistence(&paths.metadata, e))?;
            }
        }
        CommittedMetadata::Current | CommittedMetadata::Unknown => {
            if exists(&paths.metadata).await? {
                tokio::fs::rename(&paths.metadata, &paths.previous_metadata)
                    .await
                    .map_err(|e| IndexError::persistence(&paths.previous_metadata, e))?;
            }
        }
    }
    exists(&paths.previous_metadata).await
}

async fn restore_previous(paths: &ArtifactPaths) {
    if let Err(e) = tokio::fs::rename(&paths.previous_metadata, &paths.metadata).await {
        tracing::error!(
            path = ?paths.previous_metadata,
            error = %e,
            "Failed to restore previous metadata; it remains at the .prev path"
        );
    }
}

/// Read the committed pair at `paths`. `Ok(None)` means nothing was saved there.
pub async fn read_pair(paths: &ArtifactPaths) -> Result<Option<Snapshot>, IndexError> {
    if !exists(&paths.vectors).await? {
        return Ok(None);
    }

    let mut candidates = Vec::with_capacity(2);
    for path in [&paths.metadata, &paths.previous_metadata] {
        if exists(path).await? {
            candidates.push(path);
        }
    }
    if candidates.is_empty() {
        return Ok(None);
    }

    let vector_bytes = tokio::fs::read(&paths.vectors)
        .await
        .map_err(|e| IndexError::persistence(&paths.vectors, e))?;
    let (header, vectors) = decode_vectors(&vector_bytes)?;

    for path in candidates {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| IndexError::persistence(path, e))?;
        if metadata_digest(&bytes) != header.metadata_digest {
            tracing::warn!(path = ?path, "Metadata does not match vector artifact digest");
            continue;
        }
        if path == &paths.previous_metadata {
            tracing::warn!(
                path = ?path,
                "Recovered metadata from an interrupted save"
            );
        }

        let records: Vec<Chunk> = serde_json::from_slice(&bytes).map_err(|e| {
            IndexError::CorruptIndex(format!("unparseable metadata at {path:?}: {e}"))
        })?;
        if records.len() as u64 != header.count {
            return Err(IndexError::CorruptIndex(format!(
                "{} metadata records for {} vectors",
                records.len(),
                header.count
            )));
        }

        return Ok(Some(Snapshot {
            dimension: header.dimension as usize,
            vectors,
            records,
        }));
    }

    Err(IndexError::CorruptIndex(format!(
        "no metadata in {:?} matches the vector artifact",
        paths.dir
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_store::Tags;

    fn records(texts: &[&str]) -> Vec<Chunk> {
        texts.iter().map(|t| Chunk::new(*t, Tags::new())).collect()
    }

    async fn save(paths: &ArtifactPaths, dimension: usize, data: &[f32], texts: &[&str]) {
        let metadata = encode_metadata(&records(texts)).unwrap();
        let vectors = encode_vectors(dimension, data, &metadata);
        write_pair(paths, &vectors, &metadata).await.unwrap();
    }

    fn tmp_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(".tmp"))
            .collect()
    }

    #[test]
    fn test_header_round_trip() {
        let header = VectorHeader {
            dimension: 384,
            count: 12,
            metadata_digest: [7u8; 32],
        };
        assert_eq!(VectorHeader::from_bytes(&header.to_bytes()).unwrap(), header);
    }

    #[test]
    fn test_decode_rejects_bad_magic_and_truncation() {
        let metadata = encode_metadata(&records(&["a"])).unwrap();
        let mut bytes = encode_vectors(2, &[1.0, 2.0], &metadata);

        let truncated = &bytes[..bytes.len() - 1];
        assert!(matches!(
            decode_vectors(truncated),
            Err(IndexError::CorruptIndex(_))
        ));

        bytes[0] = b'X';
        assert!(matches!(
            decode_vectors(&bytes),
            Err(IndexError::CorruptIndex(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_location_is_nothing_to_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(temp_dir.path().join("never_saved"));
        assert!(read_pair(&paths).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_only_one_artifact_is_nothing_to_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(temp_dir.path());
        std::fs::write(&paths.metadata, b"[]").unwrap();
        assert!(read_pair(&paths).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_then_read_pair() {
        let temp_dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(temp_dir.path().join("db"));

        save(&paths, 2, &[1.0, 2.0, 3.0, 4.0], &["first", "second"]).await;

        let snapshot = read_pair(&paths).await.unwrap().unwrap();
        assert_eq!(snapshot.dimension, 2);
        assert_eq!(snapshot.vectors, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(snapshot.records, records(&["first", "second"]));
        assert!(tmp_files(&paths.dir).is_empty());
        assert!(!paths.previous_metadata.exists());
    }

    #[tokio::test]
    async fn test_mismatched_pair_is_corrupt() {
        let temp_dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(temp_dir.path());

        save(&paths, 1, &[1.0], &["original"]).await;
        std::fs::write(
            &paths.metadata,
            serde_json::to_vec_pretty(&records(&["tampered"])).unwrap(),
        )
        .unwrap();

        assert!(matches!(
            read_pair(&paths).await,
            Err(IndexError::CorruptIndex(_))
        ));
    }

    #[tokio::test]
    async fn test_interrupted_save_recovers_previous_pair() {
        let temp_dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(temp_dir.path());

        save(&paths, 1, &[1.0], &["committed"]).await;

        // Simulate a crash after the metadata swap but before the vector commit.
        std::fs::rename(&paths.metadata, &paths.previous_metadata).unwrap();
        std::fs::write(
            &paths.metadata,
            encode_metadata(&records(&["committed", "uncommitted"])).unwrap(),
        )
        .unwrap();

        let snapshot = read_pair(&paths).await.unwrap().unwrap();
        assert_eq!(snapshot.records, records(&["committed"]));
        assert_eq!(snapshot.vectors, vec![1.0]);
    }

    /// Leave the directory as a crash between the metadata swap and the
    /// vector commit would: committed metadata at `.prev`, new metadata in place.
    fn interrupt_save(paths: &ArtifactPaths, uncommitted: &[&str]) {
        std::fs::rename(&paths.metadata, &paths.previous_metadata).unwrap();
        std::fs::write(&paths.metadata, encode_metadata(&records(uncommitted)).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_second_interrupted_save_keeps_committed_pair() {
        let temp_dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(temp_dir.path());

        save(&paths, 1, &[1.0], &["committed"]).await;
        interrupt_save(&paths, &["committed", "first attempt"]);
        assert_eq!(committed_metadata(&paths).await.unwrap(), CommittedMetadata::Previous);

        // The next save sets metadata aside and then crashes before its vector commit.
        assert!(set_aside_committed_metadata(&paths).await.unwrap());
        std::fs::write(
            &paths.metadata,
            encode_metadata(&records(&["committed", "second attempt"])).unwrap(),
        )
        .unwrap();

        let snapshot = read_pair(&paths).await.unwrap().unwrap();
        assert_eq!(snapshot.records, records(&["committed"]));
        assert_eq!(snapshot.vectors, vec![1.0]);
    }

    #[tokio::test]
    async fn test_save_after_interrupted_save_commits_new_pair() {
        let temp_dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(temp_dir.path());

        save(&paths, 1, &[1.0], &["committed"]).await;
        interrupt_save(&paths, &["committed", "lost"]);
        save(&paths, 1, &[1.0, 3.0], &["committed", "saved"]).await;

        let snapshot = read_pair(&paths).await.unwrap().unwrap();
        assert_eq!(snapshot.records, records(&["committed", "saved"]));
        assert!(!paths.previous_metadata.exists());
        assert!(tmp_files(&paths.dir).is_empty());
    }

    #[tokio::test]
    async fn test_failed_vector_commit_restores_previous_metadata() {
        let temp_dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(temp_dir.path());

        save(&paths, 1, &[1.0], &["committed"]).await;
        let committed_bytes = std::fs::read(&paths.metadata).unwrap();

        // A directory in place of vectors.bin makes the final rename fail.
        std::fs::remove_file(&paths.vectors).unwrap();
        std::fs::create_dir(&paths.vectors).unwrap();
        std::fs::write(paths.vectors.join("blocker"), b"x").unwrap();

        let metadata = encode_metadata(&records(&["committed", "new"])).unwrap();
        let vectors = encode_vectors(1, &[1.0, 2.0], &metadata);
        let err = write_pair(&paths, &vectors, &metadata).await.unwrap_err();

        assert!(matches!(err, IndexError::PersistenceFailure { .. }));
        assert_eq!(std::fs::read(&paths.metadata).unwrap(), committed_bytes);
        assert!(!paths.previous_metadata.exists());
        assert!(tmp_files(&paths.dir).is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_both_artifacts() {
        let temp_dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(temp_dir.path());

        save(&paths, 1, &[1.0], &["one"]).await;
        save(&paths, 1, &[1.0, 2.0], &["one", "two"]).await;

        let snapshot = read_pair(&paths).await.unwrap().unwrap();
        assert_eq!(snapshot.records.len(), 2);
        assert_eq!(snapshot.vectors, vec![1.0, 2.0]);
        assert!(!paths.previous_metadata.exists());
        assert!(tmp_files(&paths.dir).is_empty());
    }

    #[tokio::test]
    async fn test_count_mismatch_is_corrupt() {
        let temp_dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(temp_dir.path());

        let metadata = encode_metadata(&records(&["one", "two"])).unwrap();
        let vectors = encode_vectors(1, &[1.0], &metadata);
        write_pair(&paths, &vectors, &metadata).await.unwrap();

        assert!(matches!(
            read_pair(&paths).await,
            Err(IndexError::CorruptIndex(_))
        ));
    }
}
