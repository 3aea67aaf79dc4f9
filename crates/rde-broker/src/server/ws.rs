//! WebSocket adapters
//!
//! Binary messages carry the payload in both uses: encoded mux frames on
//! agent connections, raw user bytes on interactive connections. Text and
//! ping/pong messages are ignored; a close message ends the stream.

use std::io;
use std::pin::Pin;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::future;
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, StreamExt};
use tokio_util::io::{CopyToBytes, SinkWriter, StreamReader};

/// Incoming binary payloads
pub type MessageStream = BoxStream<'static, io::Result<Bytes>>;

/// Outgoing binary payloads
pub type MessageSink = Pin<Box<dyn Sink<Bytes, Error = io::Error> + Send>>;

/// Split a WebSocket into a binary message stream and sink
pub fn split(socket: WebSocket) -> (MessageStream, MessageSink) {
    let (sink, stream) = socket.split();

    let stream = stream
        .take_while(|message| future::ready(!matches!(message, Ok(Message::Close(_)))))
        .filter_map(|message| {
            future::ready(match message {
                Ok(Message::Binary(data)) => Some(Ok(Bytes::from(data))),
                Ok(_) => None,
                Err(e) => Some(Err(io::Error::other(e))),
            })
        })
        .boxed();

    let sink = sink
        .sink_map_err(io::Error::other)
        .with(|data: Bytes| future::ready(Ok::<_, io::Error>(Message::Binary(data.to_vec()))));

    (stream, Box::pin(sink))
}

/// A WebSocket as a pair of byte-stream halves
pub fn byte_halves(socket: WebSocket) -> (StreamReader<MessageStream, Bytes>, SinkWriter<CopyToBytes<MessageSink>>) {
    let (stream, sink) = split(socket);
    (StreamReader::new(stream), SinkWriter::new(CopyToBytes::new(sink)))
}
