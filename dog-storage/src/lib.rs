//! # dog-storage: Bounded-memory object storage client
//!
//! `dog-storage` stores and retrieves objects in S3-compatible services through five
//! calls (save, open, download, exists, delete) while keeping memory use bounded by
//! `part_size * concurrency`, whatever the size of the object.
//!
//! ## Key Features
//!
//! - **Part-based transfers**: uploads are split into fixed-size parts and committed
//!   atomically; downloads fetch ranges in parallel into a positional sink
//! - **Content sniffing**: detect the media type from the first 512 bytes without
//!   altering the stored bytes
//! - **Stable errors**: backend failures collapse into `NotFound`, `SniffRead`, and
//!   `Transfer`, with the backend's cause kept as `source`
//! - **Cancellation**: every call takes a [`StorageCtx`] carrying a cancellation token
//!   and an optional deadline
//! - **Backend agnostic**: S3 through the AWS SDK, or [`MemoryGateway`] for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dog_storage::prelude::*;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // 1. Connect using S3_* environment variables
//! let storage = ObjectStorage::connect(S3Config::from_env()?).await?;
//!
//! // 2. Every call gets its own context
//! let ctx = StorageCtx::new().with_timeout(Duration::from_secs(30));
//!
//! // 3. Save with content-type detection
//! let receipt = storage
//!     .save_bytes(&ctx, "a/b.txt", "hello world", SaveOptions::new().with_auto_content_type())
//!     .await?;
//! assert_eq!(receipt.content_type.as_deref(), Some("text/plain; charset=utf-8"));
//!
//! // 4. Read it back
//! let data = storage.open(&ctx, "a/b.txt").await?.read_to_end().await?;
//! assert_eq!(&data[..], b"hello world");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  ObjectStorage   │  ← save / open / download / exists / delete
//! ├────────┬─────────┤
//! │ sniff  │ upload  │  ← content detection, part pipelines
//! │        │ download│
//! ├────────┴─────────┤
//! │  ObjectGateway   │  ← S3Gateway, MemoryGateway
//! └──────────────────┘
//!          │
//!     translate       ← every backend error becomes a StorageError
//! ```

mod config;
mod download;
mod error;
mod gateway;
mod memory_gateway;
mod s3_gateway;
pub mod sniff;
mod storage;
mod translate;
mod types;
mod upload;

// Re-export main types for clean API
pub use config::{S3Config, StorageConfig, TransferConfig, MIN_PART_SIZE};
pub use download::{FileSink, MemorySink, WriteAt};
pub use error::{BoxError, Cancelled, Operation, PipelineError, StorageError, StorageResult};
pub use gateway::{CompletedPart, GatewayCapabilities, ObjectBody, ObjectGateway, PutOutput};
pub use memory_gateway::{Fault, GatewayStats, MemoryGateway, MemoryGatewayError};
pub use s3_gateway::S3Gateway;
pub use sniff::{detect_content_type, sniff_stream, Sniffed};
pub use storage::{is_cancelled_read, ObjectReader, ObjectStorage};
pub use translate::{classify, translate, translate_exists, ErrorClass, ErrorSignal, GatewayError, GatewayResult};
pub use types::{ByteStream, ObjectInfo, SaveOptions, SaveReceipt, StorageCtx};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        ByteStream, ObjectStorage, ObjectReader, S3Config, SaveOptions, SaveReceipt, StorageConfig,
        StorageCtx, StorageError, StorageResult, TransferConfig, WriteAt,
    };
}
