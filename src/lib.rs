pub mod config;
pub mod enroll;
pub mod error;
pub mod lock;
pub mod matcher;
pub mod preview;
pub mod recognize;
pub mod session;
pub mod storage;

pub use error::{Error, Result};
pub use session::{Mode, RunOptions, Session, SessionOutcome, StopSignal};
pub use storage::FaceDatabase;

// Re-export vision types for convenience
pub use facerec_vision::{annotate, face, pipeline, video, Detection, Embedding, Pipeline};
