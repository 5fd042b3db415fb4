//! Core crate for the satsr super-resolution service.

pub mod blocks;
pub mod config;
pub mod enhancer;
pub mod generator;
pub mod logging;
pub mod ops;
pub mod pipeline;
pub mod server;
pub mod weights;
