pub mod app;
pub mod assembly;
pub mod asset;
pub mod client;
pub mod conf;
pub mod deploy;
pub mod error;
pub mod graph;
pub mod resource;
pub mod stack;
pub mod synth;
pub mod template;
pub mod token;
