use crate::matcher::{Identity, MatchResult, Matcher};
use crate::storage::FaceDatabase;
use crate::Detection;

/// Per-frame identification against a database fixed for the session.
#[derive(Debug)]
pub struct Recognition {
    matcher: Matcher,
    hits: Vec<(String, usize)>,
    unknown: usize,
    in_view: Vec<String>,
}

impl Recognition {
    pub fn new(matcher: Matcher) -> Self {
        Self {
            matcher,
            hits: Vec::new(),
            unknown: 0,
            in_view: Vec::new(),
        }
    }

    pub fn identify(&mut self, db: &FaceDatabase, detections: &[Detection]) -> Vec<MatchResult> {
        let results: Vec<MatchResult> = detections
            .iter()
            .map(|d| {
                let result = self.matcher.match_embedding(&d.embedding, db);
                log::debug!("face scored {:.3} -> {}", result.score, result.identity);
                self.tally(&result.identity);
                result
            })
            .collect();

        let names: Vec<String> = results.iter().map(|r| r.identity.to_string()).collect();
        if names != self.in_view {
            if names.is_empty() {
                log::info!("no faces in view");
            } else {
                log::info!("in view: {}", names.join(", "));
            }
            self.in_view = names;
        }
        results
    }

    /// Identities from the latest frame, in detection order.
    pub fn in_view(&self) -> &[String] {
        &self.in_view
    }

    fn tally(&mut self, identity: &Identity) {
        match identity {
            Identity::Unknown => self.unknown += 1,
            Identity::Known(label) => match self.hits.iter_mut().find(|(l, _)| l == label) {
                Some((_, n)) => *n += 1,
                None => self.hits.push((label.clone(), 1)),
            },
        }
    }

    /// Faces matched per label, in order first seen.
    pub fn hits(&self) -> &[(String, usize)] {
        &self.hits
    }

    pub fn unknown(&self) -> usize {
        self.unknown
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
                x2: 4.0,
                y2: 4.0,
            },
            score: 0.9,
            embedding: Embedding::from_raw(v),
        }
    }

    #[test]
    fn test_identifies_each_face() {
        let mut db = FaceDatabase::new();
        db.append(&detection(0).embedding, "alice").unwrap();
        db.append(&detection(1).embedding, "bob").unwrap();

        let mut r = Recognition::new(Matcher::default());
        let results = r.identify(&db, &[detection(1), detection(7), detection(1)]);
        let names: Vec<String> = results.iter().map(|m| m.identity.to_string()).collect();
        assert_eq!(names, vec!["bob", "UNKNOWN", "bob"]);
        assert_eq!(r.hits(), &[("bob".to_string(), 2)]);
        assert_eq!(r.unknown(), 1);
    }

    #[test]
    fn test_tracks_faces_in_view() {
        let mut db = FaceDatabase::new();
        db.append(&detection(0).embedding, "alice").unwrap();

        let mut r = Recognition::new(Matcher::default());
        r.identify(&db, &[detection(0), detection(3)]);
        assert_eq!(r.in_view(), &["alice".to_string(), "UNKNOWN".to_string()]);
        r.identify(&db, &[]);
        assert!(r.in_view().is_empty());
    }

    #[test]
    fn test_empty_database_reports_unknown() {
        let db = FaceDatabase::new();
        let mut r = Recognition::new(Matcher::default());
        let results = r.identify(&db, &[detection(0)]);
        assert_eq!(results[0].identity, Identity::Unknown);
    }
}
