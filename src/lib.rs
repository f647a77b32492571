pub mod answer;
pub mod chunking;
pub mod completion;
pub mod config;
pub mod context;
pub mod database;
pub mod document;
pub mod embeddings;
pub mod error;
pub mod memory_index;
pub mod openai;
pub mod rag;
pub mod retrieval;
pub mod retry;
pub mod server;
pub mod session;
