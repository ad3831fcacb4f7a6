#![doc = include_str!("../README.md")]

pub mod carousel;
pub mod chunker;
pub mod concurrency;
pub mod consumer;
pub mod producer;
pub mod queue;
pub mod stream_service;
