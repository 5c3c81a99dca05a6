#![recursion_limit = "256"]

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod graph;
pub mod inference;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod projection;
pub mod seq2seq;
pub mod session;
pub mod training;
pub mod vocabulary;
