//! Flat-file face database.
//!
//! Records live in memory as a row-major `N x 512` embedding buffer plus a
//! parallel label list; the two always have the same length. On disk they are
//! two postcard files, `embeddings.bin` (an `Array2<f32>`) and `labels.bin`
//! (a `Vec<String>`).
//!
//! Saving is journaled so the pair is replaced as a unit:
//!
//! 1. both payloads are written to `*.tmp` files and fsynced
//! 2. an empty `commit` marker is created
//! 3. each temporary is renamed over its live file
//! 4. the marker is removed
//!
//! Loading first finishes a save that got past step 2 and discards
//! temporaries from one that did not. Both that recovery and `save` touch
//! the same files, so they only run under the directory's `DatabaseLock`.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use facerec_vision::{Embedding, EMBEDDING_DIM};
use ndarray::{Array2, ArrayView1, ArrayView2};

use crate::error::{Error, Result};
use crate::lock::DatabaseLock;

pub const EMBEDDINGS_FILE: &str = "embeddings.bin";
pub const LABELS_FILE: &str = "labels.bin";
const COMMIT_MARKER: &str = "commit";
const TMP_SUFFIX: &str = "tmp";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaceDatabase {
    embeddings: Vec<f32>,
    labels: Vec<String>,
}

fn tmp_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.{}", name, TMP_SUFFIX))
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl FaceDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// All embeddings as an `N x 512` matrix.
    pub fn matrix(&self) -> ArrayView2<'_, f32> {
        ArrayView2::from_shape((self.len(), EMBEDDING_DIM), &self.embeddings)
            .expect("embedding buffer always holds len * EMBEDDING_DIM values")
    }

    pub fn record(&self, index: usize) -> Option<(ArrayView1<'_, f32>, &str)> {
        let label = self.labels.get(index)?;
        let row = &self.embeddings[index * EMBEDDING_DIM..(index + 1) * EMBEDDING_DIM];
        Some((ArrayView1::from(row), label.as_str()))
    }

    /// Add one record. Labels are not keys; duplicates simply add samples.
    pub fn append(&mut self, embedding: &Embedding, label: &str) -> Result<()> {
        self.append_slice(embedding.as_slice(), label)
    }

    pub fn append_slice(&mut self, embedding: &[f32], label: &str) -> Result<()> {
        if embedding.len() != EMBEDDING_DIM {
            return Err(Error::DimensionMismatch {
                expected: EMBEDDING_DIM,
                got: embedding.len(),
            });
        }
        self.embeddings.extend_from_slice(embedding);
        self.labels.push(label.to_string());
        Ok(())
    }

    /// Drop records past `len`; used to discard an unsaved enrollment.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.embeddings.truncate(len * EMBEDDING_DIM);
        self.labels.truncate(len);
    }

    /// Sample count per label, in order of first enrollment.
    pub fn label_counts(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<(String, usize)> = Vec::new();
        for label in &self.labels {
            match counts.iter_mut().find(|(l, _)| l == label) {
                Some((_, n)) => *n += 1,
                None => counts.push((label.clone(), 1)),
            }
        }
        counts
    }

    pub(crate) fn encode(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let embeddings = postcard::to_allocvec(&self.matrix())?;
        let labels = postcard::to_allocvec(&self.labels)?;
        Ok((embeddings, labels))
    }

    /// Load the database stored in `dir`, waiting for any session holding
    /// its lock to finish.
    ///
    /// Missing files yield an empty database; a lone file or a row/label
    /// count mismatch is `CorruptDatabase`.
    pub fn load(dir: &Path) -> Result<Self> {
        let lock = DatabaseLock::acquire(dir)?;
        Self::load_locked(&lock)
    }

    /// Load the database guarded by an already held `lock`.
    pub fn load_locked(lock: &DatabaseLock) -> Result<Self> {
        let dir = lock.dir();
        recover(dir)?;

        let emb_path = dir.join(EMBEDDINGS_FILE);
        let lab_path = dir.join(LABELS_FILE);
        match (emb_path.exists(), lab_path.exists()) {
            (false, false) => {
                log::info!("no face database in {}, starting empty", dir.display());
                return Ok(Self::new());
            }
            (true, false) => return Err(Error::corrupt(dir, format!("{} is missing", LABELS_FILE))),
            (false, true) => {
                return Err(Error::corrupt(dir, format!("{} is missing", EMBEDDINGS_FILE)))
            }
            (true, true) => {}
        }

        let emb_bytes = std::fs::read(&emb_path).map_err(|e| Error::io(&emb_path, e))?;
        let lab_bytes = std::fs::read(&lab_path).map_err(|e| Error::io(&lab_path, e))?;
        let matrix: Array2<f32> = postcard::from_bytes(&emb_bytes)
            .map_err(|e| Error::corrupt(dir, format!("decoding {}: {}", EMBEDDINGS_FILE, e)))?;
        let labels: Vec<String> = postcard::from_bytes(&lab_bytes)
            .map_err(|e| Error::corrupt(dir, format!("decoding {}: {}", LABELS_FILE, e)))?;

        if matrix.ncols() != EMBEDDING_DIM {
            return Err(Error::corrupt(
                dir,
                format!(
                    "embeddings have {} columns, expected {}",
                    matrix.ncols(),
                    EMBEDDING_DIM
                ),
            ));
        }
        if matrix.nrows() != labels.len() {
            return Err(Error::corrupt(
                dir,
                format!(
                    "{} embeddings but {} labels",
                    matrix.nrows(),
                    labels.len()
                ),
            ));
        }

        log::info!(
            "loaded {} face record(s) from {}",
            labels.len(),
            dir.display()
        );
        Ok(Self {
            embeddings: matrix.iter().copied().collect(),
            labels,
        })
    }

    /// Replace the stored pair in `dir` with the in-memory state. The caller
    /// must hold the directory's `DatabaseLock`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let (emb_bytes, lab_bytes) = self.encode()?;
        let partial = |source: std::io::Error| Error::PartialWrite {
            dir: dir.to_path_buf(),
            source,
        };

        std::fs::create_dir_all(dir).map_err(partial)?;
        let marker = dir.join(COMMIT_MARKER);
        let files = [(EMBEDDINGS_FILE, &emb_bytes), (LABELS_FILE, &lab_bytes)];

        for (name, bytes) in files {
            write_synced(&tmp_path(dir, name), bytes).map_err(partial)?;
        }
        write_synced(&marker, &[]).map_err(partial)?;
        sync_dir(dir).map_err(partial)?;

        for (name, _) in files {
            std::fs::rename(tmp_path(dir, name), dir.join(name)).map_err(partial)?;
        }
        sync_dir(dir).map_err(partial)?;
        std::fs::remove_file(&marker).map_err(partial)?;
        sync_dir(dir).map_err(partial)?;

        log::info!("saved {} face record(s) to {}", self.len(), dir.display());
        Ok(())
    }
}

/// Bring `dir` back to a committed state after an interrupted save.
fn recover(dir: &Path) -> Result<()> {
    let marker = dir.join(COMMIT_MARKER);
    let names = [EMBEDDINGS_FILE, LABELS_FILE];

    if marker.exists() {
        log::warn!("completing interrupted save in {}", dir.display());
        for name in names {
            let tmp = tmp_path(dir, name);
            if tmp.exists() {
                std::fs::rename(&tmp, dir.join(name)).map_err(|e| Error::io(&tmp, e))?;
            }
        }
        sync_dir(dir).map_err(|e| Error::io(dir, e))?;
        std::fs::remove_file(&marker).map_err(|e| Error::io(&marker, e))?;
        return Ok(());
    }

    for name in names {
        let tmp = tmp_path(dir, name);
        if tmp.exists() {
            log::warn!("discarding uncommitted {}", tmp.display());
            remove_if_exists(&tmp).map_err(|e| Error::io(&tmp, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[axis] = 1.0;
        v
    }

    fn sample_db(n: usize) -> FaceDatabase {
        let mut db = FaceDatabase::new();
        for i in 0..n {
            let label = if i % 2 == 0 { "alice" } else { "bob" };
            db.append_slice(&unit(i), label).unwrap();
        }
        db
    }

    #[test]
    fn test_append_keeps_lengths_equal() {
        let mut db = FaceDatabase::new();
        for i in 0..5 {
            db.append_slice(&unit(i), "alice").unwrap();
            assert_eq!(db.matrix().nrows(), db.labels().len());
        }
        assert_eq!(db.len(), 5);
        assert_eq!(db.label_counts(), vec![("alice".to_string(), 5)]);
    }

    #[test]
    fn test_append_rejects_wrong_dimension() {
        let mut db = FaceDatabase::new();
        let err = db.append_slice(&[1.0; 128], "alice").unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: EMBEDDING_DIM,
                got: 128
            }
        ));
        assert!(db.is_empty());
        assert_eq!(db.matrix().nrows(), 0);
    }

    #[test]
    fn test_record_lookup() {
        let db = sample_db(3);
        let (row, label) = db.record(1).unwrap();
        assert_eq!(label, "bob");
        assert_eq!(row[1], 1.0);
        assert!(db.record(3).is_none());
    }

    #[test]
    fn test_label_counts_in_first_seen_order() {
        let mut db = sample_db(5);
        db.append_slice(&unit(9), "carol").unwrap();
        assert_eq!(
            db.label_counts(),
            vec![
                ("alice".to_string(), 3),
                ("bob".to_string(), 2),
                ("carol".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db = FaceDatabase::load(dir.path()).unwrap();
        assert!(db.is_empty());
    }

    #[test]
    fn test_save_load_save_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let db = sample_db(4);
        db.save(dir.path()).unwrap();
        let emb_a = std::fs::read(dir.path().join(EMBEDDINGS_FILE)).unwrap();
        let lab_a = std::fs::read(dir.path().join(LABELS_FILE)).unwrap();

        let loaded = FaceDatabase::load(dir.path()).unwrap();
        assert_eq!(loaded, db);
        loaded.save(dir.path()).unwrap();

        assert_eq!(std::fs::read(dir.path().join(EMBEDDINGS_FILE)).unwrap(), emb_a);
        assert_eq!(std::fs::read(dir.path().join(LABELS_FILE)).unwrap(), lab_a);
        assert!(!dir.path().join(COMMIT_MARKER).exists());
    }

    #[test]
    fn test_empty_database_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        FaceDatabase::new().save(dir.path()).unwrap();
        assert!(FaceDatabase::load(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_count_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let (emb, _) = sample_db(10).encode().unwrap();
        let labels: Vec<String> = (0..9).map(|i| format!("p{}", i)).collect();
        std::fs::write(dir.path().join(EMBEDDINGS_FILE), emb).unwrap();
        std::fs::write(
            dir.path().join(LABELS_FILE),
            postcard::to_allocvec(&labels).unwrap(),
        )
        .unwrap();

        let err = FaceDatabase::load(dir.path()).unwrap_err();
        match err {
            Error::CorruptDatabase { reason, .. } => {
                assert!(reason.contains("10 embeddings but 9 labels"))
            }
            other => panic!("expected CorruptDatabase, got {:?}", other),
        }
    }

    #[test]
    fn test_lone_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let (emb, _) = sample_db(2).encode().unwrap();
        std::fs::write(dir.path().join(EMBEDDINGS_FILE), emb).unwrap();
        assert!(matches!(
            FaceDatabase::load(dir.path()),
            Err(Error::CorruptDatabase { .. })
        ));
    }

    #[test]
    fn test_wrong_width_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let narrow = Array2::<f32>::zeros((2, 128));
        std::fs::write(
            dir.path().join(EMBEDDINGS_FILE),
            postcard::to_allocvec(&narrow).unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join(LABELS_FILE),
            postcard::to_allocvec(&vec!["a".to_string(), "b".to_string()]).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            FaceDatabase::load(dir.path()),
            Err(Error::CorruptDatabase { .. })
        ));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(EMBEDDINGS_FILE), b"\xff\xff\xff").unwrap();
        std::fs::write(dir.path().join(LABELS_FILE), b"\xff").unwrap();
        assert!(matches!(
            FaceDatabase::load(dir.path()),
            Err(Error::CorruptDatabase { .. })
        ));
    }

    #[test]
    fn test_committed_save_is_rolled_forward() {
        let dir = tempfile::tempdir().unwrap();
        sample_db(3).save(dir.path()).unwrap();

        // crash after the embeddings rename, before the labels rename
        let newer = sample_db(5);
        let (emb, lab) = newer.encode().unwrap();
        std::fs::write(dir.path().join(EMBEDDINGS_FILE), emb).unwrap();
        std::fs::write(tmp_path(dir.path(), LABELS_FILE), lab).unwrap();
        std::fs::write(dir.path().join(COMMIT_MARKER), b"").unwrap();

        let loaded = FaceDatabase::load(dir.path()).unwrap();
        assert_eq!(loaded, newer);
        assert!(!dir.path().join(COMMIT_MARKER).exists());
        assert!(!tmp_path(dir.path(), LABELS_FILE).exists());
    }

    #[test]
    fn test_uncommitted_save_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let committed = sample_db(3);
        committed.save(dir.path()).unwrap();

        // crash before the commit marker
        let (emb, lab) = sample_db(5).encode().unwrap();
        std::fs::write(tmp_path(dir.path(), EMBEDDINGS_FILE), emb).unwrap();
        std::fs::write(tmp_path(dir.path(), LABELS_FILE), &lab[..lab.len() / 2]).unwrap();

        let loaded = FaceDatabase::load(dir.path()).unwrap();
        assert_eq!(loaded, committed);
        assert!(!tmp_path(dir.path(), EMBEDDINGS_FILE).exists());
        assert!(!tmp_path(dir.path(), LABELS_FILE).exists());
    }
}
