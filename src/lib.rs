//! # FoilPics
//!
//! A private, on-disk vault of encrypted pictures. Plaintext images are
//! imported from user storage, individually encrypted and authenticated
//! under a passphrase-protected RSA key pair, and decrypted back on
//! demand. A compact thumbnail is produced at import time and stored as a
//! separate encrypted artifact, so a gallery renders without touching the
//! full images.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     VAULT ENGINE                         │
//! │  ┌────────────┐  ┌─────────────┐  ┌──────────────────┐   │
//! │  │  KEY STORE │  │   CATALOG   │  │   WORKER POOL    │   │
//! │  │  foil.key  │  │  + .info    │  │   (1-2 threads)  │   │
//! │  └─────┬──────┘  └──────┬──────┘  └────────┬─────────┘   │
//! │        │                │                  │             │
//! │  ┌─────┴────────────────┴──────────────────┴──────────┐  │
//! │  │                 ENVELOPE CODEC                      │  │
//! │  │    AES-256-GCM body, RSA-OAEP wrap, RSA signature   │  │
//! │  └─────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! All catalog and state mutation happens on the thread driving
//! [`PicsEngine`]; crypto, image work and file I/O run on the worker pool
//! and report back through an event queue drained on that same thread.

pub mod catalog;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod keystore;
pub mod media;
pub mod observer;
pub mod pool;
pub mod tasks;

pub use catalog::{Catalog, Entry, VaultOrder};
pub use config::EngineConfig;
pub use engine::{FoilState, PicsEngine};
pub use error::{VaultError, VaultResult};
pub use keystore::{KeyFileState, KeyPair, KeyStore};
pub use observer::{
    ImageReplyHandle, ImageRequest, Role, SourceCleanup, ThumbnailSink, VaultObserver,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
