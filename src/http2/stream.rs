//! HTTP/2 stream tunnel implementing AsyncRead + AsyncWrite
//!
//! An extended CONNECT stream carries the WebSocket byte stream in DATA
//! frames. `Http2Stream` wraps h2's receive half and, once the 200 response
//! has been sent, the send half, so the tunnel can be installed on an
//! [`EndPoint`](crate::channel::EndPoint) like any other byte channel.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use h2::server::SendResponse;
use h2::{RecvStream, SendStream};
use http::Response;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Send half of the tunnel
enum SendHalf {
    /// Response headers not sent yet
    Pending(SendResponse<Bytes>),
    Open(SendStream<Bytes>),
    Closed,
}

/// A wrapper around h2 send/receive streams that implements AsyncRead + AsyncWrite
pub struct Http2Stream {
    send: SendHalf,
    recv: RecvStream,
    recv_buf: BytesMut,
    /// Track if we've received END_STREAM
    recv_eof: bool,
    /// Track if we need to reserve capacity
    capacity_needed: usize,
}

impl Http2Stream {
    /// Tunnel for an accepted CONNECT stream whose response is still pending
    pub fn new(respond: SendResponse<Bytes>, recv: RecvStream) -> Self {
        Self {
            send: SendHalf::Pending(respond),
            recv,
            recv_buf: BytesMut::with_capacity(64 * 1024),
            recv_eof: false,
            capacity_needed: 0,
        }
    }

    /// Whether response headers have been sent
    pub fn is_committed(&self) -> bool {
        !matches!(self.send, SendHalf::Pending(_))
    }

    /// Send the response headers, opening the send half
    ///
    /// A non-2xx response ends the stream; the tunnel is then read-only.
    pub fn send_response(&mut self, response: Response<()>) -> io::Result<()> {
        let SendHalf::Pending(respond) = &mut self.send else {
            return Err(io::Error::other("HTTP/2 response already sent"));
        };

        let end_of_stream = !response.status().is_success();
        let send = respond
            .send_response(response, end_of_stream)
            .map_err(io::Error::other)?;

        self.send = if end_of_stream {
            SendHalf::Closed
        } else {
            SendHalf::Open(send)
        };
        Ok(())
    }
}

impl AsyncRead for Http2Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // First, try to satisfy from the internal buffer
        if !self.recv_buf.is_empty() {
            let to_copy = std::cmp::min(buf.remaining(), self.recv_buf.len());
            buf.put_slice(&self.recv_buf.split_to(to_copy));
            return Poll::Ready(Ok(()));
        }

        if self.recv_eof {
            return Poll::Ready(Ok(()));
        }

        match Pin::new(&mut self.recv).poll_data(cx) {
            Poll::Ready(Some(Ok(mut data))) => {
                // Release flow control capacity back to sender
                let len = data.len();
                let _ = self.recv.flow_control().release_capacity(len);

                let to_copy = std::cmp::min(buf.remaining(), data.len());
                buf.put_slice(&data.split_to(to_copy));

                if data.has_remaining() {
                    self.recv_buf.extend_from_slice(data.chunk());
                }

                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Ready(None) => {
                self.recv_eof = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for Http2Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let this = self.get_mut();
        let send = match &mut this.send {
            SendHalf::Open(send) => send,
            SendHalf::Pending(_) => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "HTTP/2 response not sent",
                )));
            }
            SendHalf::Closed => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "HTTP/2 stream closed",
                )));
            }
        };

        if this.capacity_needed > 0 || send.capacity() == 0 {
            send.reserve_capacity(buf.len());
        }

        match send.poll_capacity(cx) {
            Poll::Ready(Some(Ok(capacity))) => {
                let to_send = std::cmp::min(capacity, buf.len());
                let data = Bytes::copy_from_slice(&buf[..to_send]);
                send.send_data(data, false).map_err(io::Error::other)?;
                this.capacity_needed = 0;
                Poll::Ready(Ok(to_send))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "HTTP/2 stream closed",
            ))),
            Poll::Pending => {
                this.capacity_needed = buf.len();
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // h2 handles flushing internally at the connection level
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let SendHalf::Open(send) = &mut self.send {
            // Empty DATA frame with END_STREAM
            send.send_data(Bytes::new(), true)
                .map_err(io::Error::other)?;
        }
        self.send = SendHalf::Closed;
        Poll::Ready(Ok(()))
    }
}

impl std::fmt::Debug for Http2Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Stream")
            .field("committed", &self.is_committed())
            .field("recv_buf_len", &self.recv_buf.len())
            .field("recv_eof", &self.recv_eof)
            .field("capacity_needed", &self.capacity_needed)
            .finish()
    }
}
