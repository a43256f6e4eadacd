pub mod local;
pub mod provider;
pub mod registry;
pub mod resilient;
pub mod worker;

pub use local::LocalTensorBackend;
pub use provider::{
  Capabilities, EmbeddingBackend, EmbeddingError, EmbeddingVector, Lifecycle, Provider, ServiceKind,
  cosine_similarity, parse_model_id,
};
pub use registry::BackendRegistry;
pub use resilient::{Resilient, RetryPolicy};
pub use worker::WorkerBackend;
