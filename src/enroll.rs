use std::path::Path;

use crate::error::{Error, Result};
use crate::storage::FaceDatabase;
use crate::Detection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollState {
    WaitingForLabel,
    Capturing,
    Saving,
    Done,
}

/// Collects `target` samples of one person into a database.
#[derive(Debug)]
pub struct Enrollment {
    state: EnrollState,
    label: Option<String>,
    target: usize,
    collected: usize,
    saved: bool,
}

impl Enrollment {
    pub fn new(target: usize) -> Result<Self> {
        if target == 0 {
            return Err(Error::Validation(
                "sample target must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            state: EnrollState::WaitingForLabel,
            label: None,
            target,
            collected: 0,
            saved: false,
        })
    }

    /// Accept the person's label. Blank input leaves the flow waiting.
    pub fn set_label(&mut self, raw: &str) -> Result<()> {
        if self.state != EnrollState::WaitingForLabel {
            return Err(Error::Validation(format!(
                "label already set to {:?}",
                self.label.as_deref().unwrap_or_default()
            )));
        }
        let label = raw.trim();
        if label.is_empty() {
            return Err(Error::Validation(
                "a name is required to enroll a face".to_string(),
            ));
        }
        self.label = Some(label.to_string());
        self.state = EnrollState::Capturing;
        Ok(())
    }

    pub fn state(&self) -> EnrollState {
        self.state
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn collected(&self) -> usize {
        self.collected
    }

    /// Append samples from one frame.
    ///
    /// Returns, per detection, the running count after its sample was taken,
    /// or `None` when the target had already been reached.
    pub fn record(
        &mut self,
        db: &mut FaceDatabase,
        detections: &[Detection],
    ) -> Result<Vec<Option<usize>>> {
        let label = match (self.state, &self.label) {
            (EnrollState::WaitingForLabel, _) | (_, None) => {
                return Err(Error::Validation("no label set".to_string()))
            }
            (EnrollState::Capturing, Some(label)) => label.clone(),
            _ => return Ok(vec![None; detections.len()]),
        };

        let mut progress = Vec::with_capacity(detections.len());
        for detection in detections {
            if self.collected >= self.target {
                progress.push(None);
                continue;
            }
            db.append(&detection.embedding, &label)?;
            self.collected += 1;
            progress.push(Some(self.collected));
        }

        if self.collected >= self.target {
            log::debug!("collected {} samples for {}", self.collected, label);
            self.state = EnrollState::Saving;
        }
        Ok(progress)
    }

    /// Persist once the target is reached. Returns whether a save happened.
    pub fn save_once(&mut self, db: &FaceDatabase, dir: &Path) -> Result<bool> {
        if self.state != EnrollState::Saving || self.saved {
            return Ok(false);
        }
        db.save(dir)?;
        self.saved = true;
        self.state = EnrollState::Done;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facerec_vision::{BoundingBox, Embedding, EMBEDDING_DIM};

    fn detection(axis: usize) -> Detection {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[axis] = 1.0;
        Detection {
            bounding_box: BoundingBox {
                x1: 0.0,
                y1: 0.0,
                x2: 10.0,
                y2: 10.0,
            },
            score: 0.9,
            embedding: Embedding::from_raw(v),
        }
    }

    #[test]
    fn test_zero_target_is_rejected() {
        assert!(matches!(Enrollment::new(0), Err(Error::Validation(_))));
    }

    #[test]
    fn test_blank_label_keeps_waiting() {
        let mut e = Enrollment::new(3).unwrap();
        assert!(matches!(e.set_label("   "), Err(Error::Validation(_))));
        assert_eq!(e.state(), EnrollState::WaitingForLabel);
        e.set_label("  alice ").unwrap();
        assert_eq!(e.state(), EnrollState::Capturing);
        assert_eq!(e.label(), Some("alice"));
    }

    #[test]
    fn test_record_before_label_is_rejected() {
        let mut e = Enrollment::new(3).unwrap();
        let mut db = FaceDatabase::new();
        assert!(e.record(&mut db, &[detection(0)]).is_err());
        assert!(db.is_empty());
    }

    #[test]
    fn test_stops_at_target_mid_frame() {
        let mut e = Enrollment::new(3).unwrap();
        e.set_label("alice").unwrap();
        let mut db = FaceDatabase::new();

        let p = e.record(&mut db, &[detection(0), detection(1)]).unwrap();
        assert_eq!(p, vec![Some(1), Some(2)]);
        assert_eq!(e.state(), EnrollState::Capturing);

        let p = e.record(&mut db, &[detection(2), detection(3)]).unwrap();
        assert_eq!(p, vec![Some(3), None]);
        assert_eq!(e.state(), EnrollState::Saving);
        assert_eq!(db.len(), 3);

        // no mutation after the target
        let p = e.record(&mut db, &[detection(4)]).unwrap();
        assert_eq!(p, vec![None]);
        assert_eq!(db.len(), 3);
    }

    #[test]
    fn test_frame_without_faces_changes_nothing() {
        let mut e = Enrollment::new(2).unwrap();
        e.set_label("alice").unwrap();
        let mut db = FaceDatabase::new();
        assert!(e.record(&mut db, &[]).unwrap().is_empty());
        assert_eq!(e.collected(), 0);
        assert_eq!(e.state(), EnrollState::Capturing);
    }

    #[test]
    fn test_saves_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut e = Enrollment::new(1).unwrap();
        e.set_label("alice").unwrap();
        let mut db = FaceDatabase::new();

        assert!(!e.save_once(&db, dir.path()).unwrap());
        e.record(&mut db, &[detection(0)]).unwrap();
        assert!(e.save_once(&db, dir.path()).unwrap());
        assert_eq!(e.state(), EnrollState::Done);
        assert!(!e.save_once(&db, dir.path()).unwrap());

        assert_eq!(FaceDatabase::load(dir.path()).unwrap().len(), 1);
    }
}
