//! Length-framed TCP consumer.
//!
//! Frames are `u32` little-endian payload length followed by the payload.
//! The consumer keeps one persistent connection and reconnects on the next
//! poll after any failure; a broken stream is a timeout from the caller's
//! point of view, never a fatal error.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::{BusConsumer, BusError, StartOffset};

/// Upper bound on a single frame; anything larger is a corrupt stream.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

const OFFSET_TAG_TAIL: u8 = 1;
const OFFSET_TAG_COMMITTED: u8 = 2;

pub struct TcpBusConsumer {
    address: String,
    offset: Option<StartOffset>,
    stream: Option<TcpStream>,
}

impl TcpBusConsumer {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            offset: None,
            stream: None,
        }
    }

    async fn connect(&mut self) -> Result<(), BusError> {
        let offset = self.offset.ok_or(BusError::NotConnected)?;
        let mut stream = TcpStream::connect(&self.address).await?;

        // subscription header: tag byte + 8-byte offset argument
        let (tag, arg) = match offset {
            StartOffset::Tail(n) => (OFFSET_TAG_TAIL, n),
            StartOffset::Committed(pos) => (OFFSET_TAG_COMMITTED, pos),
        };
        let mut hello = [0u8; 9];
        hello[0] = tag;
        hello[1..9].copy_from_slice(&arg.to_le_bytes());
        stream.write_all(&hello).await?;

        debug!(address = %self.address, "connected to bus");
        self.stream = Some(stream);
        Ok(())
    }

    async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>, BusError> {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            // clean EOF between frames: upstream went away, re-poll later
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf);
        if len == 0 || len > MAX_FRAME_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad frame length {len}"),
            )
            .into());
        }
        let mut payload = vec![0u8; len as usize];
        stream.read_exact(&mut payload).await?;
        Ok(Some(payload))
    }
}

#[async_trait]
impl BusConsumer for TcpBusConsumer {
    async fn setup(&mut self, offset: StartOffset) -> Result<(), BusError> {
        self.offset = Some(offset);
        if let Err(e) = self.connect().await {
            // first connect may race service start; consume() will retry
            warn!(address = %self.address, "bus connect failed, will retry: {e}");
        }
        Ok(())
    }

    async fn consume(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, BusError> {
        if self.offset.is_none() {
            return Err(BusError::NotConnected);
        }
        if self.stream.is_none() {
            if let Err(e) = self.connect().await {
                warn!(address = %self.address, "bus reconnect failed: {e}");
                tokio::time::sleep(timeout).await;
                return Ok(None);
            }
        }

        let stream = self.stream.as_mut().expect("connected above");
        match tokio::time::timeout(timeout, Self::read_frame(stream)).await {
            Ok(Ok(Some(payload))) => Ok(Some(payload)),
            Ok(Ok(None)) => {
                self.stream = None;
                Ok(None)
            }
            Ok(Err(e)) => {
                warn!(address = %self.address, "bus read failed: {e}");
                self.stream = None;
                Ok(None)
            }
            // timeout: keep the connection, just report no record
            Err(_) => Ok(None),
        }
    }

    async fn check_alive(&self) -> bool {
        if self.stream.is_some() {
            return true;
        }
        TcpStream::connect(&self.address).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn frame_server(payloads: Vec<Vec<u8>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut hello = [0u8; 9];
            socket.read_exact(&mut hello).await.unwrap();
            for payload in payloads {
                socket
                    .write_all(&(payload.len() as u32).to_le_bytes())
                    .await
                    .unwrap();
                socket.write_all(&payload).await.unwrap();
            }
        });
        address
    }

    #[tokio::test]
    async fn test_frames_round_trip() {
        let address = frame_server(vec![vec![1, 2, 3], vec![4]]).await;
        let mut bus = TcpBusConsumer::new(address);
        bus.setup(StartOffset::Tail(100)).await.unwrap();

        let mut got = Vec::new();
        while got.len() < 2 {
            if let Some(payload) = bus.consume(Duration::from_millis(200)).await.unwrap() {
                got.push(payload);
            }
        }
        assert_eq!(got, vec![vec![1, 2, 3], vec![4]]);
    }

    #[tokio::test]
    async fn test_peer_gone_is_nonfatal() {
        let address = frame_server(vec![vec![9]]).await;
        let mut bus = TcpBusConsumer::new(address);
        bus.setup(StartOffset::Committed(0)).await.unwrap();

        let first = bus.consume(Duration::from_millis(200)).await.unwrap();
        assert_eq!(first, Some(vec![9]));

        // server task is done; subsequent polls see EOF, not an error
        let next = bus.consume(Duration::from_millis(50)).await.unwrap();
        assert_eq!(next, None);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_times_out() {
        let mut bus = TcpBusConsumer::new("127.0.0.1:1");
        bus.setup(StartOffset::Tail(0)).await.unwrap();
        assert_eq!(bus.consume(Duration::from_millis(10)).await.unwrap(), None);
        assert!(!bus.check_alive().await);
    }
}
