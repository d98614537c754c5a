pub mod assertion;
pub mod canonical;
pub mod db;
pub mod error;
pub mod fs;
pub mod memory;

pub use assertion::{
    decode_stream, encode_stream, AccountContent, AccountKeyContent, Assertion,
    AssertionContent, ModelContent, SerialContent, SerialRequestContent, MEDIA_TYPE,
};
pub use canonical::canonical_bytes;
pub use db::AssertionDb;
pub use error::AssertError;
pub use fs::FsAssertionDb;
pub use memory::MemoryAssertionDb;
