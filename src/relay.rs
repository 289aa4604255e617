//! Relay wire protocol: connecting, framing client requests, and parsing
//! relay responses.

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use url::Url;

use crate::event::Event;

/// Blanket trait for boxed async read/write streams.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

pub type RelaySocket = WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>;

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
pub async fn connect_ws(relay: &str, tor_socks: Option<&str>) -> Result<RelaySocket> {
    let url = Url::parse(relay)?;
    let host = url.host_str().ok_or_else(|| anyhow!("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("missing port"))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async(req, stream).await?;
    Ok(ws)
}

/// `["REQ", sub, {kinds, since}]`.
pub fn req(sub: &str, kinds: &[u32], since: Option<u64>) -> Message {
    let mut filter = json!({ "kinds": kinds });
    if let Some(since) = since {
        filter["since"] = json!(since);
    }
    Message::Text(json!(["REQ", sub, filter]).to_string())
}

/// `["CLOSE", sub]`.
pub fn close(sub: &str) -> Message {
    Message::Text(json!(["CLOSE", sub]).to_string())
}

/// `["EVENT", event]`.
pub fn publish(ev: &Event) -> Message {
    Message::Text(json!(["EVENT", ev]).to_string())
}

/// A message received from a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event { sub: String, event: Event },
    Eose(String),
    Notice(String),
    Ok {
        id: String,
        accepted: bool,
        message: String,
    },
    Closed { sub: String, message: String },
}

impl RelayMessage {
    /// Parse one text frame. Unknown or malformed frames yield `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let val: Value = serde_json::from_str(text).ok()?;
        let arr = val.as_array()?;
        let str_at = |i: usize| arr.get(i).and_then(Value::as_str).map(str::to_string);
        match arr.first()?.as_str()? {
            "EVENT" => {
                let event = serde_json::from_value(arr.get(2)?.clone()).ok()?;
                Some(RelayMessage::Event {
                    sub: str_at(1)?,
                    event,
                })
            }
            "EOSE" => Some(RelayMessage::Eose(str_at(1)?)),
            "NOTICE" => Some(RelayMessage::Notice(str_at(1).unwrap_or_default())),
            "OK" => Some(RelayMessage::Ok {
                id: str_at(1)?,
                accepted: arr.get(2)?.as_bool()?,
                message: str_at(3).unwrap_or_default(),
            }),
            "CLOSED" => Some(RelayMessage::Closed {
                sub: str_at(1)?,
                message: str_at(2).unwrap_or_default(),
            }),
            _ => None,
        }
    }
}
