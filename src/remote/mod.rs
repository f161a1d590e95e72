pub mod document;
pub mod memory;
pub mod traits;

pub use document::{decode_collection, encode_collection, wire_key, DataShapeError, Decoded, RawSnapshot};
pub use memory::MemoryRemote;
pub use traits::{RemoteStore, TransportError};
