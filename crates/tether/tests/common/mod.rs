//! Fake parent process listening on a Unix socket in a temp dir.

#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use tether::{Message, MessageType};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixListener;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

const WAIT: Duration = Duration::from_secs(5);

pub struct Parent {
    listener: UnixListener,
    path: PathBuf,
    _dir: tempfile::TempDir,
}

impl Parent {
    pub fn bind() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parent.sock");
        let listener = UnixListener::bind(&path).unwrap();
        Self {
            listener,
            path,
            _dir: dir,
        }
    }

    /// Socket path to use as `server_name`.
    pub fn server_name(&self) -> String {
        self.path.display().to_string()
    }

    pub async fn accept(&self) -> Connection {
        let (stream, _) = tokio::time::timeout(WAIT, self.listener.accept())
            .await
            .expect("child did not connect in time")
            .unwrap();
        let (reader, writer) = stream.into_split();
        Connection {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }
}

pub struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Connection {
    /// Next frame, or `None` once the child closes the connection.
    pub async fn next(&mut self) -> Option<Message> {
        let line = tokio::time::timeout(WAIT, self.lines.next_line())
            .await
            .expect("no frame from child in time")
            .unwrap()?;
        Some(Message::from_frame(line.as_bytes()).unwrap())
    }

    pub async fn recv(&mut self) -> Message {
        self.next().await.expect("connection closed")
    }

    /// Skip heartbeats, status reports and anything else until `kind` arrives.
    pub async fn recv_kind(&mut self, kind: MessageType) -> Message {
        loop {
            let message = self.recv().await;
            if message.kind == kind {
                return message;
            }
        }
    }

    /// Read until the child closes the connection.
    pub async fn expect_closed(&mut self) {
        while self.next().await.is_some() {}
    }

    pub async fn send(&mut self, message: &Message) {
        self.writer
            .write_all(&message.to_frame().unwrap())
            .await
            .unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }
}

/// Message from the parent to `receiver`.
pub fn from_parent(kind: MessageType, topic: &str, receiver: &str) -> Message {
    Message::new(kind, topic)
        .with_sender("main_process")
        .with_receiver(receiver)
}

pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
