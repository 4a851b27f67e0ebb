//! TCP transport: length-delimited frames carrying JSON-serialized
//! messages. Each direction of a pair is its own connection; a connection
//! opens with a single handshake frame naming the dialing server.

use super::Transport;
use crate::message::{Message, ServerId};
use crate::queue::QueueSender;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

const MAX_FRAME: usize = 1 << 27; // 128 MiB: bounds a snapshot transfer.

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME)
        .new_codec()
}

pub struct TcpTransport {
    self_id: ServerId,
    inbound: QueueSender,
    local_addr: std::net::SocketAddr,
    addrs: Mutex<BTreeMap<ServerId, String>>,
    conns: Arc<Mutex<HashMap<ServerId, mpsc::Sender<Message>>>>,
}

impl TcpTransport {
    /// Binds `listen_addr` and starts accepting peer connections, feeding
    /// inbound frames to `inbound` until `cancel` fires.
    pub async fn start(
        self_id: ServerId,
        listen_addr: &str,
        addrs: BTreeMap<ServerId, String>,
        inbound: QueueSender,
        cancel: CancellationToken,
    ) -> io::Result<Arc<TcpTransport>> {
        let listener = TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let transport = Arc::new(TcpTransport {
            self_id,
            inbound: inbound.clone(),
            local_addr,
            addrs: Mutex::new(addrs),
            conns: Arc::new(Mutex::new(HashMap::new())),
        });

        tokio::spawn(accept_loop(listener, inbound, cancel));
        Ok(transport)
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Record (or replace) the dial address of a peer.
    pub fn set_peer(&self, id: ServerId, addr: String) {
        self.addrs.lock().unwrap().insert(id, addr);
    }

    fn outbound(&self, to: &ServerId) -> Option<mpsc::Sender<Message>> {
        let mut conns = self.conns.lock().unwrap();
        if let Some(tx) = conns.get(to) {
            if !tx.is_closed() {
                return Some(tx.clone());
            }
            conns.remove(to);
        }
        let addr = self.addrs.lock().unwrap().get(to).cloned()?;

        let (tx, rx) = mpsc::channel(256);
        conns.insert(to.clone(), tx.clone());
        tokio::spawn(write_loop(
            self.self_id.clone(),
            to.clone(),
            addr,
            rx,
            self.inbound.clone(),
            self.conns.clone(),
        ));
        Some(tx)
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, to: &ServerId, message: Message) {
        let Some(tx) = self.outbound(to) else {
            tracing::debug!(to = %to, "no address for peer; dropping message");
            self.inbound.disconnected(to.clone()).await;
            return;
        };
        if tx.send(message).await.is_err() {
            // The write loop died between lookup and send; its teardown
            // already surfaced the disconnect.
            tracing::trace!(to = %to, "outbound connection closed while sending");
        }
    }

    async fn clear(&self, peer: &ServerId) {
        // Dropping the sender ends the write loop, which closes the socket.
        self.conns.lock().unwrap().remove(peer);
        tracing::debug!(peer = %peer, "cleared connection");
    }
}

async fn accept_loop(listener: TcpListener, inbound: QueueSender, cancel: CancellationToken) {
    loop {
        let socket = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, _)) => socket,
                Err(err) => {
                    tracing::warn!(%err, "failed to accept connection");
                    continue;
                }
            },
            _ = cancel.cancelled() => return,
        };
        let _ = socket.set_nodelay(true);
        tokio::spawn(read_loop(socket, inbound.clone(), cancel.clone()));
    }
}

async fn read_loop(socket: TcpStream, inbound: QueueSender, cancel: CancellationToken) {
    let mut frames = FramedRead::new(socket, codec());

    // The handshake frame names the dialing peer.
    let peer: ServerId = match frames.next().await {
        Some(Ok(frame)) => match serde_json::from_slice(&frame) {
            Ok(peer) => peer,
            Err(err) => {
                tracing::warn!(%err, "bad handshake frame; dropping connection");
                return;
            }
        },
        _ => return,
    };
    tracing::debug!(peer = %peer, "accepted peer connection");

    loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            _ = cancel.cancelled() => return,
        };
        match frame {
            Some(Ok(frame)) => match serde_json::from_slice::<Message>(&frame) {
                Ok(message) => inbound.message(peer.clone(), message).await,
                Err(err) => {
                    tracing::warn!(peer = %peer, %err, "undecodable frame; dropping connection");
                    break;
                }
            },
            Some(Err(err)) => {
                tracing::debug!(peer = %peer, %err, "connection read failed");
                break;
            }
            None => break,
        }
    }
    inbound.disconnected(peer).await;
}

async fn write_loop(
    self_id: ServerId,
    peer: ServerId,
    addr: String,
    mut rx: mpsc::Receiver<Message>,
    inbound: QueueSender,
    conns: Arc<Mutex<HashMap<ServerId, mpsc::Sender<Message>>>>,
) {
    let result = async {
        let socket = TcpStream::connect(&addr).await?;
        let _ = socket.set_nodelay(true);
        let mut frames = FramedWrite::new(socket, codec());

        let handshake = serde_json::to_vec(&self_id).expect("server id serializes");
        frames.send(Bytes::from(handshake)).await?;

        while let Some(message) = rx.recv().await {
            let frame = serde_json::to_vec(&message).expect("messages serialize");
            frames.send(Bytes::from(frame)).await?;
        }
        Ok::<(), io::Error>(())
    }
    .await;

    conns.lock().unwrap().remove(&peer);
    if let Err(err) = result {
        tracing::debug!(peer = %peer, %err, "connection write failed");
        inbound.disconnected(peer).await;
    }
}
