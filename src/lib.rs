pub mod audit;
pub mod config;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod hasher;
pub mod loader;
pub mod normalizer;
pub mod pipeline;
pub mod source;
pub mod stations;
pub mod units;
