//! In-process scripted Skyhash server for connection and pool tests.
//!
//! Requests are decoded with the crate's own reader. Besides a small key/value
//! store it understands a few verbs that misbehave on purpose:
//!
//! - `BREAK` closes the socket without replying
//! - `PACKETERR` replies with a packet error code
//! - `BADCOUNT` replies with one entry too many
//! - `SLEEP <ms>` replies `Okay` after a delay

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::skyhash::{
    append_batch_header, append_value, ResponseCode, ResponseReader, Value, PROTOCOL_VERSION,
};

pub struct MockServer {
    addr: SocketAddr,
    state: Arc<MockState>,
}

struct MockState {
    version: String,
    credentials: Option<(String, String)>,
    store: Mutex<HashMap<String, Value>>,
    accepted: AtomicUsize,
}

pub struct MockServerBuilder {
    version: String,
    credentials: Option<(String, String)>,
}

impl MockServerBuilder {
    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn credentials(mut self, username: &str, token: &str) -> Self {
        self.credentials = Some((username.to_string(), token.to_string()));
        self
    }

    pub async fn start(self) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState {
            version: self.version,
            credentials: self.credentials,
            store: Mutex::new(HashMap::new()),
            accepted: AtomicUsize::new(0),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, accept_state.clone()));
            }
        });

        MockServer { addr, state }
    }
}

impl MockServer {
    pub fn builder() -> MockServerBuilder {
        MockServerBuilder {
            version: PROTOCOL_VERSION.to_string(),
            credentials: None,
        }
    }

    pub async fn start() -> Self {
        Self::builder().start().await
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// Number of connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }
}

enum Reply {
    Value(Value),
    Sleep(Duration),
    Twice(Value),
    Hangup,
}

async fn serve(stream: TcpStream, state: Arc<MockState>) {
    let (mut reader_half, mut writer) = stream.into_split();
    let mut reader = ResponseReader::new();

    loop {
        let Ok(entries) = reader.read(&mut reader_half).await else {
            return;
        };

        let mut body = BytesMut::new();
        let mut count = 0;
        for entry in entries {
            let segments: Vec<String> = match &entry.value {
                Value::AnyArray(items) => items
                    .iter()
                    .map(|v| v.as_str().unwrap_or_default().to_string())
                    .collect(),
                _ => return,
            };

            let value = match respond(&state, &segments) {
                Reply::Value(value) => value,
                Reply::Sleep(delay) => {
                    tokio::time::sleep(delay).await;
                    Value::ResponseCode(ResponseCode::Okay)
                }
                Reply::Twice(value) => {
                    append_value(&mut body, &value, true).unwrap();
                    count += 1;
                    value
                }
                Reply::Hangup => return,
            };
            append_value(&mut body, &value, true).unwrap();
            count += 1;
        }

        let mut out = BytesMut::new();
        append_batch_header(&mut out, count);
        out.put_slice(&body);
        if writer.write_all(&out).await.is_err() {
            return;
        }
    }
}

fn respond(state: &MockState, segments: &[String]) -> Reply {
    let okay = Value::ResponseCode(ResponseCode::Okay);
    let args: Vec<&str> = segments.iter().map(String::as_str).collect();

    match args.as_slice() {
        ["SYS", "INFO", "PROTOCOL"] => Reply::Value(state.version.clone().into()),
        ["SYS", "INFO", "VERSION"] => Reply::Value("0.7.7".into()),
        ["HEYA"] => Reply::Value("HEY!".into()),
        ["HEYA", echo] => Reply::Value((*echo).into()),
        ["AUTH", "LOGIN", user, token] => match &state.credentials {
            Some((u, t)) if u == user && t == token => Reply::Value(okay),
            _ => Reply::Value(Value::ResponseCode(ResponseCode::BadCredentials)),
        },
        ["USE", "missing"] => Reply::Value(Value::ErrorString("container-not-found".into())),
        ["USE", _] => Reply::Value(okay),
        ["SET", key, value] => {
            let mut store = state.store.lock();
            if store.contains_key(*key) {
                Reply::Value(Value::ResponseCode(ResponseCode::OverwriteError))
            } else {
                store.insert(key.to_string(), (*value).into());
                Reply::Value(okay)
            }
        }
        ["GET", key] => Reply::Value(
            state
                .store
                .lock()
                .get(*key)
                .cloned()
                .unwrap_or(Value::ResponseCode(ResponseCode::Nil)),
        ),
        ["DEL", keys @ ..] => {
            let mut store = state.store.lock();
            let removed = keys.iter().filter(|k| store.remove(**k).is_some()).count();
            Reply::Value(Value::UnsignedInt64(removed as u64))
        }
        ["EXISTS", keys @ ..] => {
            let store = state.store.lock();
            let found = keys.iter().filter(|k| store.contains_key(**k)).count();
            Reply::Value(Value::UnsignedInt64(found as u64))
        }
        ["SLEEP", ms] => Reply::Sleep(Duration::from_millis(ms.parse().unwrap_or(0))),
        ["BADCOUNT"] => Reply::Twice(okay),
        ["PACKETERR"] => Reply::Value(Value::ResponseCode(ResponseCode::PacketError)),
        ["BREAK"] => Reply::Hangup,
        _ => Reply::Value(Value::ErrorString("unknown-action".into())),
    }
}
