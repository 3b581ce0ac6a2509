use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,

    #[error("Websocket error: {0}")]
    Websocket(String),
}

/// One migration websocket, seen as an ordered stream of binary frames.
///
/// The data plane never cares which side of which transport a frame came
/// from: the source's pool writes into `control`/`filesystem`/`state`
/// channels, the sink's pool reads from them. Server-accepted sockets,
/// client-dialled sockets and the in-memory test pair all satisfy this.
#[async_trait]
pub trait Channel: Send {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), ChannelError>;

    /// Next frame, or `None` once the peer closed cleanly.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, ChannelError>;

    async fn close(&mut self) -> Result<(), ChannelError>;
}

/// Channel over a websocket accepted by our own REST listener.
pub struct ServerChannel {
    stream: rocket_ws::stream::DuplexStream,
}

impl ServerChannel {
    pub fn new(stream: rocket_ws::stream::DuplexStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl Channel for ServerChannel {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), ChannelError> {
        self.stream
            .send(rocket_ws::Message::Binary(frame))
            .await
            .map_err(|e| ChannelError::Websocket(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(ChannelError::Websocket(e.to_string())),
                Some(Ok(rocket_ws::Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(rocket_ws::Message::Text(text))) => return Ok(Some(text.into_bytes())),
                Some(Ok(rocket_ws::Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue, // ping/pong
            }
        }
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        let _ = self.stream.send(rocket_ws::Message::Close(None)).await;
        Ok(())
    }
}

type ClientStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Channel over a websocket we dialled towards a peer operation.
pub struct ClientChannel {
    stream: ClientStream,
}

impl ClientChannel {
    pub fn new(stream: ClientStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl Channel for ClientChannel {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), ChannelError> {
        self.stream
            .send(tokio_tungstenite::tungstenite::Message::Binary(frame))
            .await
            .map_err(|e| ChannelError::Websocket(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        use tokio_tungstenite::tungstenite::Message;
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(ChannelError::Websocket(e.to_string())),
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.into_bytes())),
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        let _ = self
            .stream
            .send(tokio_tungstenite::tungstenite::Message::Close(None))
            .await;
        Ok(())
    }
}

/// In-memory channel pair. Local pool-to-pool copies run the same transfer
/// code as a cross-member migration, just over this instead of a socket.
pub struct MemChannel {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl MemChannel {
    pub fn pair() -> (MemChannel, MemChannel) {
        let (tx_a, rx_a) = mpsc::channel(64);
        let (tx_b, rx_b) = mpsc::channel(64);
        (
            MemChannel {
                tx: Some(tx_a),
                rx: rx_b,
            },
            MemChannel {
                tx: Some(tx_b),
                rx: rx_a,
            },
        )
    }
}

#[async_trait]
impl Channel for MemChannel {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), ChannelError> {
        match &self.tx {
            Some(tx) => tx.send(frame).await.map_err(|_| ChannelError::Closed),
            None => Err(ChannelError::Closed),
        }
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        self.tx.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mem_channel_round_trip() {
        let (mut a, mut b) = MemChannel::pair();
        a.send(b"hello".to_vec()).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Some(b"hello".to_vec()));
        a.close().await.unwrap();
        assert_eq!(b.recv().await.unwrap(), None);
    }
}
