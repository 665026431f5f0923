//! In-process bus used by tests and by pools embedding the engine.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{BusConsumer, BusError, StartOffset};

/// Producer handle; clone freely.
#[derive(Clone)]
pub struct MemoryBusSender {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl MemoryBusSender {
    pub fn send(&self, record: Vec<u8>) {
        // a dropped consumer just means the record goes nowhere
        let _ = self.tx.send(record);
    }
}

/// Consumer side of an in-process record queue.
pub struct MemoryBus {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ready: bool,
}

impl MemoryBus {
    pub fn channel() -> (MemoryBusSender, MemoryBus) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MemoryBusSender { tx }, MemoryBus { rx, ready: false })
    }
}

#[async_trait]
impl BusConsumer for MemoryBus {
    async fn setup(&mut self, _offset: StartOffset) -> Result<(), BusError> {
        self.ready = true;
        Ok(())
    }

    async fn consume(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, BusError> {
        if !self.ready {
            return Err(BusError::NotConnected);
        }
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(record)) => Ok(Some(record)),
            // sender dropped: end of stream, non-fatal
            Ok(None) => Ok(None),
            Err(_) => Ok(None),
        }
    }

    async fn check_alive(&self) -> bool {
        self.ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_consume_before_setup_fails() {
        let (_tx, mut bus) = MemoryBus::channel();
        assert!(matches!(
            bus.consume(Duration::from_millis(1)).await,
            Err(BusError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_records_arrive_in_order() {
        let (tx, mut bus) = MemoryBus::channel();
        bus.setup(StartOffset::Tail(0)).await.unwrap();

        tx.send(vec![1]);
        tx.send(vec![2]);

        assert_eq!(
            bus.consume(Duration::from_millis(10)).await.unwrap(),
            Some(vec![1])
        );
        assert_eq!(
            bus.consume(Duration::from_millis(10)).await.unwrap(),
            Some(vec![2])
        );
    }

    #[tokio::test]
    async fn test_timeout_yields_none() {
        let (_tx, mut bus) = MemoryBus::channel();
        bus.setup(StartOffset::Tail(0)).await.unwrap();
        assert_eq!(bus.consume(Duration::from_millis(5)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_closed_stream_is_nonfatal() {
        let (tx, mut bus) = MemoryBus::channel();
        bus.setup(StartOffset::Tail(0)).await.unwrap();
        drop(tx);
        assert_eq!(bus.consume(Duration::from_millis(5)).await.unwrap(), None);
    }
}
