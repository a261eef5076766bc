// src/repo/mod.rs
//! Thin domain layers over [`crate::store::Store`].

pub mod items;
pub mod publications;

pub use items::{ItemRepository, StoreBatch};
pub use publications::{PublicationRepository, PublishOutcome, PublishSkip};
