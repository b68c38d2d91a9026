pub mod archive;
pub mod envelope;
pub mod error;
pub mod store;
pub mod treehash;
pub mod types;

pub use archive::{ArchiveBuilder, BuiltArchive, ChangeStats};
pub use envelope::Envelope;
pub use error::{Error, ErrorKind, Result};
pub use store::{MetadataStore, StoreKind, open_store};
pub use types::*;
