//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use spoke::prelude::*;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

/// Starts a server on a random loopback port.
pub async fn start_server() -> ServerMessenger {
    ServerMessenger::builder()
        .name("host")
        .build()
        .await
        .expect("server should build")
}

pub async fn join(server: &ServerMessenger, name: &str) -> ClientMessenger {
    ClientMessenger::builder("127.0.0.1", server.local_addr().port(), name)
        .connect()
        .await
        .expect("client should connect")
}

/// Polls `cond` until it holds, or panics after [`WAIT`].
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Application payloads received by one messenger, with the sender's name.
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<(String, Vec<u8>)>,
}

impl Inbox {
    pub fn attach(messenger: &impl Messenger) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        messenger.add_message_listener(Arc::new(move |payload: &Payload, from: &Node| {
            if let Payload::Application(bytes) = payload {
                let _ = tx.send((from.name().to_string(), bytes.clone()));
            }
        }));
        Self { rx }
    }

    pub async fn next(&mut self) -> (String, Vec<u8>) {
        tokio::time::timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("listener dropped")
    }

    /// Asserts nothing arrives for a little while.
    pub async fn assert_quiet(&mut self) {
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(self.rx.try_recv().is_err(), "unexpected message");
    }
}

/// Connection events seen by one messenger.
pub struct Membership {
    rx: mpsc::UnboundedReceiver<(bool, Node)>,
}

struct MembershipListener {
    tx: mpsc::UnboundedSender<(bool, Node)>,
}

impl ConnectionListener for MembershipListener {
    fn connection_added(&self, node: &Node) {
        let _ = self.tx.send((true, node.clone()));
    }

    fn connection_removed(&self, node: &Node) {
        let _ = self.tx.send((false, node.clone()));
    }
}

impl Membership {
    pub fn attach(messenger: &impl Messenger) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        messenger.add_connection_listener(Arc::new(MembershipListener { tx }));
        Self { rx }
    }

    /// Next event: `(true, node)` for added, `(false, node)` for removed.
    pub async fn next(&mut self) -> (bool, Node) {
        tokio::time::timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for a connection event")
            .expect("listener dropped")
    }
}
