//! Bencode encoding and decoding ([BEP-3]).
//!
//! Every extension payload that travels over a peer connection is bencoded:
//! the libtorrent-style handshake, peer exchange volleys, metadata block
//! headers and all vendor-dialect messages. Metadata data messages append raw
//! bytes after the dictionary, so besides [`decode`] (which rejects trailing
//! data) there is [`decode_prefix`], which reports how much input the value
//! consumed.
//!
//! ```
//! use peerwire::bencode::{decode_prefix, encode, Value};
//!
//! let mut dict = Value::dict();
//! dict.insert("piece", 3u32);
//! let mut wire = encode(&dict).unwrap();
//! wire.extend_from_slice(b"raw block");
//!
//! let (value, used) = decode_prefix(&wire).unwrap();
//! assert_eq!(value.get(b"piece").and_then(Value::as_integer), Some(3));
//! assert_eq!(&wire[used..], b"raw block");
//! ```
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod decode;
mod encode;
mod error;
mod value;

pub use decode::{decode, decode_prefix};
pub use encode::encode;
pub use error::BencodeError;
pub use value::Value;
