pub mod buffer;
mod commit;
pub mod disk;
pub mod entry;
pub mod error;
pub mod header;
pub mod skim;
pub mod wire;

pub use buffer::LargeBuffer;
pub use disk::Disk;
pub use entry::{Entry, EntryKind, Handle, Payload};
pub use error::{Result, TevdError};
pub use skim::{NameCodec, Skimmer, Utf8Lossy};
