pub mod app;
pub mod chat;
pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod normalize;
pub mod openai;
pub mod pool;
pub mod provider;
pub mod sink;
pub mod tokenizer;
pub mod upstream;
