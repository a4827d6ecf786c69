#![allow(dead_code)]

use std::time::Duration;

use godot_dap_core::codec::{self, Event, Message, Request, Response};
use godot_dap_core::{DapConfig, Timeouts};
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;

/// Scriptable stand-in for Godot's DAP server.
pub struct MockPeer {
    listener: TcpListener,
    port: u16,
}

impl MockPeer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock peer");
        let port = listener.local_addr().expect("local addr").port();
        Self { listener, port }
    }

    pub fn config(&self) -> DapConfig {
        DapConfig::new(
            "127.0.0.1",
            self.port,
            Timeouts {
                connect: Duration::from_secs(2),
                command: Duration::from_secs(2),
                read: Duration::from_secs(1),
            },
        )
    }

    pub async fn accept(&self) -> PeerConnection {
        let (stream, _) = self.listener.accept().await.expect("accept client");
        let (read_half, write_half) = stream.into_split();
        PeerConnection {
            reader: BufReader::new(read_half),
            writer: write_half,
            seq: 1000,
        }
    }
}

pub struct PeerConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    seq: u64,
}

impl PeerConnection {
    pub async fn next_request(&mut self) -> Request {
        let frame = codec::read_frame(&mut self.reader)
            .await
            .expect("read frame from client");
        match codec::decode(&frame).expect("decode client frame") {
            Message::Request(request) => request,
            other => panic!("expected a request, got {other:?}"),
        }
    }

    pub async fn expect_request(&mut self, command: &str) -> Request {
        let request = self.next_request().await;
        assert_eq!(request.command, command, "unexpected request: {request:?}");
        request
    }

    /// None if the client sends nothing within `wait`.
    pub async fn try_next_request(&mut self, wait: Duration) -> Option<Request> {
        tokio::time::timeout(wait, self.next_request()).await.ok()
    }

    pub async fn respond(&mut self, request: &Request, body: Value) {
        self.respond_with(request, true, None, body).await;
    }

    pub async fn respond_error(&mut self, request: &Request, message: &str) {
        self.respond_with(request, false, Some(message.to_string()), Value::Null)
            .await;
    }

    pub async fn respond_with(
        &mut self,
        request: &Request,
        success: bool,
        message: Option<String>,
        body: Value,
    ) {
        self.seq += 1;
        let response = Response {
            seq: self.seq,
            request_seq: request.seq,
            success,
            command: request.command.clone(),
            message,
            body,
        };
        self.send(Message::Response(response)).await;
    }

    pub async fn send_event(&mut self, name: &str, body: Value) {
        self.send(Message::Event(Event::new(name, body))).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write raw bytes");
        self.writer.flush().await.expect("flush raw bytes");
    }

    async fn send(&mut self, message: Message) {
        let frame = codec::encode(&message).expect("encode peer message");
        self.send_raw(&frame).await;
    }

    /// Answers `initialize` the way Godot does and sends `initialized`.
    pub async fn handshake(&mut self) {
        let request = self.expect_request("initialize").await;
        assert_eq!(request.arguments["adapterID"], "godot");
        self.respond(
            &request,
            json!({
                "supportsConfigurationDoneRequest": true,
                "supportsSetVariable": true,
                "supportsEvaluateForHovers": true
            }),
        )
        .await;
        self.send_event("initialized", json!({})).await;
    }

    pub async fn shutdown(mut self) {
        let _ = self.writer.shutdown().await;
    }
}
