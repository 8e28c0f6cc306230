pub mod cache;
pub mod embeddings;
pub mod guard;
pub mod vectorstore;
