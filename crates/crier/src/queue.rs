//! The single inbound queue feeding a participant driver.
//!
//! Everything a participant consumes (peer messages, disconnect
//! notifications, the oracle's go-back signal) arrives as an [`Inbound`]
//! tuple on one bounded multi-producer queue. The bound is the engine's
//! backpressure: a transport or processor that outruns the driver blocks.

use crate::message::{Inbound, Message, ServerId};
use tokio::sync::mpsc;

/// Producer half, handed to transports, the oracle, and the local handle.
#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<Inbound>,
}

pub fn bounded(depth: usize) -> (QueueSender, mpsc::Receiver<Inbound>) {
    let (tx, rx) = mpsc::channel(depth);
    (QueueSender { tx }, rx)
}

impl QueueSender {
    /// Enqueue a peer message, waiting when the queue is full. A closed
    /// queue (the participant is gone) is silently dropped.
    pub async fn message(&self, from: ServerId, message: Message) {
        let _ = self.tx.send(Inbound::Message { from, message }).await;
    }

    /// The transport lost its connection to `peer`.
    pub async fn disconnected(&self, peer: ServerId) {
        let _ = self.tx.send(Inbound::Disconnected { peer }).await;
    }

    /// The election oracle wants the current round abandoned.
    pub async fn go_back(&self) {
        let _ = self.tx.send(Inbound::GoBack).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Zxid;

    #[tokio::test]
    async fn tuples_preserve_fifo_order() {
        let (tx, mut rx) = bounded(8);
        tx.message("s2".to_string(), Message::Heartbeat).await;
        tx.message("s2".to_string(), Message::Commit { zxid: Zxid::new(1, 1) })
            .await;
        tx.disconnected("s3".to_string()).await;
        tx.go_back().await;

        assert!(matches!(
            rx.recv().await,
            Some(Inbound::Message { message: Message::Heartbeat, .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(Inbound::Message { message: Message::Commit { .. }, .. })
        ));
        assert!(
            matches!(rx.recv().await, Some(Inbound::Disconnected { peer }) if peer == "s3")
        );
        assert!(matches!(rx.recv().await, Some(Inbound::GoBack)));
    }

    #[tokio::test]
    async fn bounded_send_applies_backpressure() {
        let (tx, mut rx) = bounded(1);
        tx.message("s1".to_string(), Message::Heartbeat).await;

        // A second send must wait until the consumer drains one tuple.
        let pending = tokio::spawn({
            let tx = tx.clone();
            async move { tx.message("s1".to_string(), Message::QueryLeader).await }
        });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        rx.recv().await.unwrap();
        pending.await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(Inbound::Message { message: Message::QueryLeader, .. })
        ));
    }
}
