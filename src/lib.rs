//! Curator - keeps curated Plex collections and their local bookkeeping in sync

pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod services;

pub use error::{CollectionError, Result};
