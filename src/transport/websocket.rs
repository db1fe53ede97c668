//! Browser transport over a WebSocket.
//!
//! Implements [`MessageRead`] and [`MessageWrite`] for the two halves of a
//! split [`WebSocketStream`]:
//!
//! | Frame | Read side | Write side |
//! |-------|-----------|------------|
//! | Text | payload | used for UTF-8 payloads |
//! | Binary | payload | used for anything else |
//! | Ping / Pong | skipped | - |
//! | Close | [`Error::TransportClosed`] | - |

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::trace;

use crate::bridge::{MessageRead, MessageWrite};
use crate::error::{Error, Result};

// ============================================================================
// Read Half
// ============================================================================

#[async_trait]
impl<S> MessageRead for SplitStream<WebSocketStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_message(&mut self) -> Result<Vec<u8>> {
        loop {
            match self.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.as_bytes().to_vec()),
                Some(Ok(Message::Binary(data))) => return Ok(data.to_vec()),
                Some(Ok(Message::Close(frame))) => {
                    trace!(?frame, "Close frame received");
                    return Err(Error::TransportClosed);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Err(Error::TransportClosed),
            }
        }
    }
}

// ============================================================================
// Write Half
// ============================================================================

#[async_trait]
impl<S> MessageWrite for SplitSink<WebSocketStream<S>, Message>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_message(&mut self, data: &[u8]) -> Result<()> {
        let message = match std::str::from_utf8(data) {
            Ok(text) => Message::text(text.to_owned()),
            Err(_) => Message::binary(data.to_vec()),
        };

        self.send(message).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        SinkExt::close(self).await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::duplex;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn pair() -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (server, client)
    }

    #[tokio::test]
    async fn test_text_and_binary_payloads() {
        let (server, mut client) = pair().await;
        let (_sink, mut stream) = server.split();

        client
            .send(Message::text("4.sync,1.0;"))
            .await
            .expect("send text");
        client
            .send(Message::binary(vec![0xff, 0x00]))
            .await
            .expect("send binary");

        assert_eq!(stream.read_message().await.expect("text"), b"4.sync,1.0;");
        assert_eq!(stream.read_message().await.expect("binary"), [0xff, 0x00]);
    }

    #[tokio::test]
    async fn test_close_frame_is_transport_closed() {
        let (server, mut client) = pair().await;
        let (_sink, mut stream) = server.split();

        client.close(None).await.expect("close");

        let err = stream.read_message().await.unwrap_err();
        assert!(err.is_transport_closed());
    }

    #[tokio::test]
    async fn test_utf8_written_as_text() {
        let (server, mut client) = pair().await;
        let (mut sink, _stream) = server.split();

        sink.write_message("4.name,2.é;".as_bytes())
            .await
            .expect("write");

        match client.next().await {
            Some(Ok(Message::Text(text))) => assert_eq!(text.as_str(), "4.name,2.é;"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_write_after_close_is_transport_closed() {
        let (server, _client) = pair().await;
        let (mut sink, _stream) = server.split();

        MessageWrite::close(&mut sink).await.expect("close");

        let err = sink.write_message(b"3.nop;").await.unwrap_err();
        assert!(err.is_transport_closed());
    }
}
