#![doc = include_str!("../README.md")]

pub mod channel;
pub mod dispatch;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod heartbeat;
pub mod hooks;
pub mod ids;
pub mod limits;
pub mod pending;
pub mod stream;

pub use channel::{acquire_channel, clear_channel_pool, Channel, Delivery, MessageSource, PooledChannel};
pub use dispatch::{Dispatcher, SendOutcome};
pub use endpoint::{drain_all, EndpointHub, EndpointOptions, OriginPolicy};
pub use envelope::{
    decode_envelope, encode_envelope, AckRef, DecodeError, EncodeError, Encoding, Envelope,
    EnvelopeType, ErrorPayload, Role, UnknownEncoding,
};
pub use error::{ErrorCode, RpcError, StreamError, TransportError, ValidationError};
pub use heartbeat::Heartbeat;
pub use hooks::{HookRegistry, Listener};
pub use ids::{generate_endpoint_id, generate_id, generate_request_id, generate_stream_id};
pub use pending::PendingOps;
pub use stream::{
    ReaderOptions, StreamBinding, StreamKind, StreamMode, StreamReader, StreamRegistry, StreamState,
    StreamStateMachine, StreamWriter, WriterOptions,
};
