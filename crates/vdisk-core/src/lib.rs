//! # vdisk core
//!
//! Bridges random-access filesystem calls to a sequential, content-addressed
//! object store. The namespace itself is stored as an object in the same
//! store and found again through a small local pointer record.
//!
//! ## Features
//!
//! - **Node**: the folder/file tree, serialized as one JSON document
//! - **ContentStore trait**: the object store boundary, with an in-memory
//!   implementation for tests and a local-directory one for real mounts
//! - **UploadSession**: offset writes in, bounded push stream out
//! - **Downloader**: pull stream in, offset reads out, optional local
//!   counter-mode decryption
//! - **TreeGateway / SharedTree**: fail-open load, pointer-safe save, one
//!   lock around every mutation
//! - **Dispatcher**: the filesystem verbs, with a per-handle state machine
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vdisk_core::{
//!     Dispatcher, DispatcherOptions, FileSystemOps, MemoryStore, PointerRecord, SharedTree,
//!     TreeGateway,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(MemoryStore::new());
//!     let gateway = TreeGateway::new(store.clone(), PointerRecord::new("data.dat"), "vdisk-index.json");
//!     let ops = Dispatcher::new(SharedTree::new(gateway), store, DispatcherOptions::default());
//!
//!     ops.create_directory("/Docs").await.unwrap();
//!     assert_eq!(ops.find_files("/").await.unwrap().len(), 1);
//! }
//! ```

pub mod cipher;
pub mod config;
pub mod dispatch;
pub mod download;
pub mod error;
pub mod gateway;
pub mod session;
pub mod shared_tree;
pub mod store;
pub mod tree;
pub mod upload;

// Re-exports
pub use cipher::CtrCipher;
pub use config::VdiskConfig;
pub use dispatch::{
    Access, DiskSpace, Dispatcher, DispatcherOptions, Disposition, FileInfo, FileSystemOps,
    KeepAlive, NoKeepAlive, OpenInfo, is_valid_name,
};
pub use download::{DownloadMode, Downloader};
pub use error::{ConfigError, FsError, FsResult, StoreError};
pub use gateway::{PointerRecord, TreeGateway};
pub use session::{HandleId, HandleState, Session, SessionRegistry};
pub use shared_tree::{SaveOutcome, SaveStats, SharedTree, TreeStore};
pub use store::{
    BlobDirStore, BlobDirStoreConfig, ContentRef, ContentStore, MemoryStore, MemoryStoreOptions,
    ObjectReader, UploadSource,
};
pub use tree::{Node, TreeError, UNKNOWN_HASH};
pub use upload::{UploadOptions, UploadSession};
