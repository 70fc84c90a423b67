//! restream library crate.
//!
//! Turns on-demand HTTP requests for a web page's video into one shared capture
//! and transcode pipeline per source, served as HLS or fragmented MP4.

pub mod api;
pub mod capture;
pub mod config;
pub mod error;
pub mod logging;
pub mod session;
pub mod transcoder;
pub mod utils;

pub use error::{Error, Result};
