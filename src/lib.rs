pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod header;
pub mod session;
pub mod stream;
pub mod stream_id;

pub use codec::Codec;
pub use config::{Config, ConfigBuilder};
pub use error::{Result, YamuxError};
pub use frame::Frame;
pub use header::{Flags, FrameType, GoAwayCode, Header, HEADER_SIZE, PROTO_VERSION};
pub use session::Session;
pub use stream::{Stream, StreamState};
pub use stream_id::StreamIdGenerator;
