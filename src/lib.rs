//! Cell and spheroid counting for microscopy images.
//!
//! Thin wrapper around ONNX segmentation models: runs inference once per
//! image, caches the converted detection table, and re-applies confidence
//! and size filters plus overlay rendering on every call.

pub mod config;
pub mod convert;
pub mod detection;
pub mod engine;
pub mod filter;
pub mod model;
pub mod onnx_session;
pub mod overlay;
pub mod postprocessing;
pub mod preprocessing;
pub mod segmenter;
pub mod tiling;
