//! History-log processing: block framing, parsing, and size splitting

mod framer;
mod parser;
mod splitter;

pub use framer::BlockFramer;
pub use parser::{ParseError, parse_block};
pub use splitter::{MAX_CHUNK_BYTES, split_event};
