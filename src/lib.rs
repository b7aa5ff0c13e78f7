//! llmserve: serving core for disaggregated prefill/decode LLM inference.
//!
//! Admits sequences from many tenants under weighted fair share, keeps their
//! KV pages in a tiered cache:
//!   device memory (hot) → host memory (warm) → local storage (cool) → remote object (cold)
//! places prefill and decode work near the pages it needs, and moves pages
//! between workers over a chain of fallback transports.

pub mod budget;
pub mod cache;
pub mod config;
pub mod inference;
pub mod metrics;
pub mod placement;
pub mod scheduler;
pub mod server;
pub mod transfer;
