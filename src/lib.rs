pub mod approval;
pub mod bot;
pub mod config;
pub mod dedup;
pub mod enrich;
pub mod events;
pub mod gateway;
pub mod http;
pub mod llm;
pub mod model;
pub mod queue;
pub mod sources;
pub mod stream;
pub mod transform;
