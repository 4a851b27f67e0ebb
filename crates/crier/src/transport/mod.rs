//! The framed byte-channel between named peers.
//!
//! The engine relies on a narrow contract: for each ordered pair of
//! servers, messages are delivered in send order or not at all, without
//! duplication; a lost connection surfaces as a `Disconnected` tuple on
//! the receiver's inbound queue; and `clear` tears a connection down so a
//! later send may reconnect.

pub mod mem;
pub mod tcp;

use crate::message::{Message, ServerId};

#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Best-effort ordered send. A failure is not reported here; it
    /// surfaces as a `Disconnected` tuple once the loss is observed.
    async fn send(&self, to: &ServerId, message: Message);

    /// Force teardown of the connection to `peer`. A subsequent send is
    /// free to establish a fresh connection.
    async fn clear(&self, peer: &ServerId);
}
