pub mod annotate;
pub mod face;
pub mod model;
pub mod pipeline;
pub mod video;
pub mod yunet;

// Re-export commonly used types
pub use annotate::Annotator;
pub use face::{BoundingBox, Detection, Embedding, Face, EMBEDDING_DIM};
pub use pipeline::{EmbeddingProvider, Pipeline};
pub use video::{Camera, FrameSource};
