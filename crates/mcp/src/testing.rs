//! In-process fake tool server for tests.
//!
//! Speaks the same newline-delimited JSON-RPC as a real server over a
//! `tokio::io::duplex` pipe and records every `tools/call` it receives, in
//! arrival order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, duplex, split};

use crate::error::ConnectError;
use crate::launch::{Connector, Transport};
use crate::protocol::Tool;

/// What the fake does when one of its tools is called.
#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Reply with this text.
    Reply(String),
    /// Reply with `isError: true` and this text.
    Fail(String),
    /// Never reply.
    Hang,
    /// Close the pipe as if the process died.
    Exit,
}

/// How the fake answers `initialize`.
#[derive(Debug, Clone, Copy, Default)]
enum Handshake {
    #[default]
    Accept,
    Reject,
    Stall,
    Delay(Duration),
}

/// A tool call the fake received.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub tool: String,
    pub arguments: Value,
}

#[derive(Default)]
struct State {
    tools: Vec<Tool>,
    behaviours: HashMap<String, Behaviour>,
    calls: Vec<RecordedCall>,
    handshake: Handshake,
    connections: usize,
}

/// Scriptable tool server. Clones share state.
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<State>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export a tool accepting any object. Calls echo their arguments.
    pub fn with_tool(self, name: &str) -> Self {
        self.with_tool_schema(name, json!({ "type": "object" }))
    }

    pub fn with_tool_schema(self, name: &str, schema: Value) -> Self {
        self.state().tools.push(Tool {
            name: name.to_string(),
            description: Some(format!("fake {name}")),
            input_schema: schema,
        });
        self
    }

    pub fn reply(self, tool: &str, text: &str) -> Self {
        self.behave(tool, Behaviour::Reply(text.to_string()))
    }

    pub fn fail(self, tool: &str, message: &str) -> Self {
        self.behave(tool, Behaviour::Fail(message.to_string()))
    }

    pub fn hang(self, tool: &str) -> Self {
        self.behave(tool, Behaviour::Hang)
    }

    pub fn exit_on(self, tool: &str) -> Self {
        self.behave(tool, Behaviour::Exit)
    }

    /// Answer `initialize` with a JSON-RPC error.
    pub fn reject_handshake(self) -> Self {
        self.state().handshake = Handshake::Reject;
        self
    }

    /// Never answer `initialize`.
    pub fn stall_handshake(self) -> Self {
        self.state().handshake = Handshake::Stall;
        self
    }

    /// Answer `initialize` only after `delay`.
    pub fn slow_handshake(self, delay: Duration) -> Self {
        self.state().handshake = Handshake::Delay(delay);
        self
    }

    /// Answer `initialize` immediately from now on.
    pub fn accept_handshake(&self) {
        self.state().handshake = Handshake::Accept;
    }

    pub fn behave(self, tool: &str, behaviour: Behaviour) -> Self {
        self.state().behaviours.insert(tool.to_string(), behaviour);
        self
    }

    /// Calls received so far, in arrival order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    /// How many times a client has connected.
    pub fn connection_count(&self) -> usize {
        self.state().connections
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            server: self.clone(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn serve(self, io: DuplexStream) {
        let (read, mut write) = split(io);
        let mut lines = BufReader::new(read).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(request) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let Some(id) = request.get("id").cloned() else {
                continue; // notification
            };
            let method = request["method"].as_str().unwrap_or_default();

            let handshake = self.state().handshake;
            let reply = match method {
                "initialize" => match handshake {
                    Handshake::Stall => continue,
                    Handshake::Reject => json!({
                        "jsonrpc": "2.0", "id": id,
                        "error": { "code": -32600, "message": "unsupported client" }
                    }),
                    Handshake::Delay(delay) => {
                        tokio::time::sleep(delay).await;
                        initialize_reply(id)
                    }
                    Handshake::Accept => initialize_reply(id),
                },
                "tools/list" => json!({
                    "jsonrpc": "2.0", "id": id,
                    "result": { "tools": self.state().tools.clone() }
                }),
                "tools/call" => {
                    let tool = request["params"]["name"].as_str().unwrap_or_default().to_string();
                    let arguments = request["params"]["arguments"].clone();
                    let behaviour = {
                        let mut state = self.state();
                        state.calls.push(RecordedCall {
                            tool: tool.clone(),
                            arguments: arguments.clone(),
                        });
                        state.behaviours.get(&tool).cloned()
                    };
                    match behaviour {
                        Some(Behaviour::Hang) => continue,
                        Some(Behaviour::Exit) => return,
                        Some(Behaviour::Fail(message)) => json!({
                            "jsonrpc": "2.0", "id": id,
                            "result": { "content": [{ "type": "text", "text": message }], "isError": true }
                        }),
                        Some(Behaviour::Reply(text)) => json!({
                            "jsonrpc": "2.0", "id": id,
                            "result": { "content": [{ "type": "text", "text": text }] }
                        }),
                        None => json!({
                            "jsonrpc": "2.0", "id": id,
                            "result": { "content": [{ "type": "text", "text": arguments.to_string() }] }
                        }),
                    }
                }
                other => json!({
                    "jsonrpc": "2.0", "id": id,
                    "error": { "code": -32601, "message": format!("method not found: {other}") }
                }),
            };

            let mut bytes = reply.to_string().into_bytes();
            bytes.push(b'\n');
            if write.write_all(&bytes).await.is_err() {
                return;
            }
        }
    }
}

fn initialize_reply(id: Value) -> Value {
    json!({
        "jsonrpc": "2.0", "id": id,
        "result": {
            "protocolVersion": crate::protocol::PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "fake", "version": "0.0.0" }
        }
    })
}

/// Connector handing out a fresh pipe to the fake on every connect.
pub struct FakeConnector {
    server: FakeServer,
}

impl Connector for FakeConnector {
    fn open(&self, _server: &str) -> Result<Transport, ConnectError> {
        self.server.state().connections += 1;
        let (client_io, server_io) = duplex(256 * 1024);
        tokio::spawn(self.server.clone().serve(server_io));
        let (reader, writer) = split(client_io);
        Ok(Transport::from_streams(reader, writer))
    }
}
