//! HTTP surface and process wiring of the sync completion tracker.

pub mod app;
pub mod settings;
