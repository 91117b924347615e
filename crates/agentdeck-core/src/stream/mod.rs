//! Event stream: server-push notifications over SSE.

mod client;
mod notification;

pub use client::{
    spawn_stream, ConnectionState, EventStreamClient, Handler, HandlerSlot, StreamError,
    StreamHandle,
};
pub use notification::{decode, Inbound, NotificationKind, StreamNotification};
