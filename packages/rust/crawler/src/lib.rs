//! Page-visiting collaborator for web-reading plugins.
//!
//! This crate provides:
//! - [`fetcher`]: bounded, cached, SSRF-guarded page visits
//! - [`render`]: HTML → text conversion and link extraction

pub mod fetcher;
pub mod render;

pub use fetcher::{Page, PageFetcher, is_ssrf_target, normalize_str, normalize_url, same_origin};
pub use render::{PageLink, RenderedPage};
