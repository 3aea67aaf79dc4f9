//! Transport adapters for [`MuxSession`](super::MuxSession)

use std::io;

use bytes::{Bytes, BytesMut};
use futures::{Sink, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Split a byte stream into length-delimited messages usable as a mux transport
pub fn length_delimited<T>(
    io: T,
) -> (
    impl Stream<Item = io::Result<Bytes>> + Send + 'static,
    impl Sink<Bytes, Error = io::Error> + Send + 'static,
)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (sink, stream) = Framed::new(io, LengthDelimitedCodec::new()).split::<Bytes>();
    (stream.map(|chunk| chunk.map(BytesMut::freeze)), sink)
}
