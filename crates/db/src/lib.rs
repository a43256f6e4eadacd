pub mod chunks;
pub mod connection;
pub mod documents;
pub mod embeddings;
pub mod file_states;
pub mod schema;
pub mod store;

pub use connection::{DbError, FolderDb, Result, folder_db_path};
pub use embeddings::EmbeddingHit;
pub use schema::{chunks_schema, documents_schema, embeddings_schema, file_states_schema};
pub use store::{SearchHit, SearchOptions};
