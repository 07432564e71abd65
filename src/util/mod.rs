pub mod address;
pub mod finalizable_processor;
pub mod logger;
pub mod opaque_pointer;
pub mod options;
#[cfg(test)]
pub(crate) mod test_util;

pub use self::address::Address;
pub use self::address::ByteOffset;
pub use self::address::ByteSize;
pub use self::address::ObjectReference;
pub use self::address::BYTES_IN_ADDRESS;
pub use self::opaque_pointer::*;
