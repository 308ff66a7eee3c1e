#![deny(unsafe_code)]

//! Wire layer for tether: the dynamic value model, the flatten codec that
//! preserves shared and cyclic references, and the frame types multiplexed
//! over a single full-duplex socket.

pub mod codec;
pub mod frame;
pub mod stream;
pub mod value;

pub use codec::{
    CodecError, NoStreams, StreamBinder, TAG_ABSENT, TAG_BYTES, TAG_MAP, TAG_STREAM, Transform,
    Transforms, flatten, unflatten,
};
pub use frame::{
    ErrorValue, Message, PING, PONG, ParsedFrame, RawKind, StreamFrame, classify,
};
pub use stream::{
    STREAM_BUFFER, StreamClosed, StreamError, StreamSender, ValueStream, stream_channel,
};
pub use value::{OpaqueValue, Value, ValueCell};
