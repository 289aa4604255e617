//! Publish gateway: turn a user action into a signed event, broadcast it, and
//! report whether it is already visible in the local store.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, bail};
use futures_util::{future::join_all, SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::{
    event::{Event, Tag, UnsignedEvent, KIND_DELETION, KIND_METADATA, KIND_TEXT_NOTE},
    fanin::EventSink,
    ingest::Ingestor,
    model::{Direction, Limits, MetadataContent, PostContent, VoteContent},
    relay::{self, RelayMessage},
    signer::{SignError, Signer},
    store::{Store, StoreError},
    visibility::Visibility,
};

/// A user action waiting to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Draft {
    Post {
        title: String,
        body: String,
        channel: String,
    },
    Comment {
        parent: String,
        body: String,
    },
    Vote {
        target: String,
        direction: Direction,
    },
    Profile {
        name: Option<String>,
        about: Option<String>,
    },
    Delete {
        targets: Vec<String>,
    },
}

/// Successful publish. Both variants mean at least one relay accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Published {
    Visible { id: String },
    /// Accepted by a relay but not yet materialized locally.
    NotYetVisible { id: String },
}

impl Published {
    pub fn id(&self) -> &str {
        match self {
            Published::Visible { id } | Published::NotYetVisible { id } => id,
        }
    }

    pub fn is_visible(&self) -> bool {
        matches!(self, Published::Visible { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("invalid draft: {0}")]
    Invalid(&'static str),
    #[error("already voted on {0}")]
    AlreadyVoted(String),
    #[error("post {0} not found")]
    NotFound(String),
    #[error("post {0} belongs to another author")]
    NotOwner(String),
    #[error(transparent)]
    Sign(#[from] SignError),
    #[error("encoding content: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no relays configured")]
    NoRelays,
    #[error("no relay accepted the event: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub relays: Vec<String>,
    pub tor_socks: Option<String>,
    pub ack_timeout: Duration,
    pub visibility_timeout: Duration,
    /// Feed accepted events straight into the local pipeline instead of
    /// waiting for a relay subscription to echo them back.
    pub local_echo: bool,
}

pub struct Gateway {
    cfg: GatewayConfig,
    ingestor: Ingestor,
    limits: Limits,
    sink: Option<EventSink>,
}

impl Gateway {
    pub fn new(cfg: GatewayConfig, ingestor: Ingestor, limits: Limits) -> Self {
        Self {
            cfg,
            ingestor,
            limits,
            sink: None,
        }
    }

    /// Route local echoes through a running fan-in so they are serialized
    /// with relay traffic.
    pub fn with_sink(mut self, sink: EventSink) -> Self {
        self.sink = Some(sink);
        self
    }

    fn store(&self) -> &Arc<dyn Store> {
        self.ingestor.store()
    }

    fn visibility(&self) -> &Visibility {
        self.ingestor.visibility()
    }

    /// Validate `draft` for `author` and encode it as an unsigned event.
    pub fn prepare(&self, author: &str, draft: Draft) -> Result<UnsignedEvent, PublishError> {
        let (kind, tags, content) = match draft {
            Draft::Post {
                title,
                body,
                channel,
            } => {
                let content = PostContent {
                    title,
                    body,
                    channel,
                    parent: String::new(),
                }
                .normalized(&self.limits)
                .ok_or(PublishError::Invalid("a post needs a title and a body"))?;
                (KIND_TEXT_NOTE, vec![], serde_json::to_string(&content)?)
            }
            Draft::Comment { parent, body } => {
                if self.store().get_post(&parent)?.is_none() {
                    return Err(PublishError::NotFound(parent));
                }
                let content = PostContent {
                    parent,
                    body,
                    ..PostContent::default()
                }
                .normalized(&self.limits)
                .ok_or(PublishError::Invalid("a comment needs a body"))?;
                (KIND_TEXT_NOTE, vec![], serde_json::to_string(&content)?)
            }
            Draft::Vote { target, direction } => {
                if target.is_empty() {
                    return Err(PublishError::Invalid("a vote needs a target"));
                }
                if self.store().has_voted(author, &target)? {
                    return Err(PublishError::AlreadyVoted(target));
                }
                let content = VoteContent {
                    target,
                    direction: direction == Direction::Up,
                };
                (KIND_TEXT_NOTE, vec![], serde_json::to_string(&content)?)
            }
            Draft::Profile { name, about } => {
                let content = MetadataContent { name, about };
                let (name, about) = content
                    .normalized(&self.limits)
                    .ok_or(PublishError::Invalid("a profile needs a valid name or an about"))?;
                let content = MetadataContent {
                    name: Some(name),
                    about: Some(about),
                };
                (KIND_METADATA, vec![], serde_json::to_string(&content)?)
            }
            Draft::Delete { targets } => {
                if targets.is_empty() {
                    return Err(PublishError::Invalid("nothing to delete"));
                }
                for target in &targets {
                    match self.store().get_post(target)? {
                        None => return Err(PublishError::NotFound(target.clone())),
                        Some(post) if post.author != author => {
                            return Err(PublishError::NotOwner(target.clone()))
                        }
                        Some(_) => {}
                    }
                }
                let tags = targets.into_iter().map(Tag::event).collect();
                (KIND_DELETION, tags, String::new())
            }
        };
        Ok(UnsignedEvent {
            pubkey: author.to_string(),
            kind,
            created_at: unix_now(),
            tags,
            content,
        })
    }

    /// Sign and broadcast `draft`, then wait a bounded time for it to show up
    /// in the local store.
    pub async fn publish(
        &self,
        signer: &dyn Signer,
        draft: Draft,
    ) -> Result<Published, PublishError> {
        let unsigned = self.prepare(&signer.public_key(), draft)?;
        let ev = signer.sign(unsigned)?;
        // Register before broadcasting so the notification cannot be missed.
        let watch = self.visibility().watch(&ev.id);
        let accepted = self.broadcast(&ev).await?;
        tracing::info!(id = %ev.id, accepted, "published");
        if self.cfg.local_echo {
            self.echo(ev.clone()).await;
        }
        let id = ev.id;
        if watch.wait(self.cfg.visibility_timeout).await {
            Ok(Published::Visible { id })
        } else {
            tracing::info!(id = %id, "published but not yet visible locally");
            Ok(Published::NotYetVisible { id })
        }
    }

    /// Publish a root post followed by its author's own upvote.
    ///
    /// The upvote is best effort; its failure is logged and does not undo
    /// the post.
    pub async fn submit_post(
        &self,
        signer: &dyn Signer,
        title: String,
        body: String,
        channel: String,
    ) -> Result<Published, PublishError> {
        let post = self
            .publish(
                signer,
                Draft::Post {
                    title,
                    body,
                    channel,
                },
            )
            .await?;
        let upvote = Draft::Vote {
            target: post.id().to_string(),
            direction: Direction::Up,
        };
        if let Err(e) = self.publish(signer, upvote).await {
            tracing::warn!(id = %post.id(), error = %e, "self-upvote failed");
        }
        Ok(post)
    }

    /// Send `ev` to every relay at once. Succeeds if at least one accepts.
    async fn broadcast(&self, ev: &Event) -> Result<usize, PublishError> {
        if self.cfg.relays.is_empty() {
            return Err(PublishError::NoRelays);
        }
        let results = join_all(self.cfg.relays.iter().map(|url| self.send_to(url, ev))).await;
        let mut accepted = 0;
        let mut reasons = Vec::new();
        for (url, result) in self.cfg.relays.iter().zip(results) {
            match result {
                Ok(()) => accepted += 1,
                Err(e) => {
                    tracing::warn!(relay = %url, id = %ev.id, error = %e, "relay did not accept");
                    reasons.push(format!("{url}: {e}"));
                }
            }
        }
        if accepted == 0 {
            return Err(PublishError::Rejected(reasons.join("; ")));
        }
        Ok(accepted)
    }

    async fn send_to(&self, url: &str, ev: &Event) -> anyhow::Result<()> {
        tokio::time::timeout(
            self.cfg.ack_timeout,
            deliver(url, self.cfg.tor_socks.as_deref(), ev),
        )
        .await
        .map_err(|_| anyhow!("no acknowledgement within {:?}", self.cfg.ack_timeout))?
    }

    async fn echo(&self, ev: Event) {
        let outcome = match &self.sink {
            Some(sink) => sink.submit(ev).await.ok_or_else(|| anyhow!("fan-in stopped")),
            None => {
                let ingestor = self.ingestor.clone();
                tokio::task::spawn_blocking(move || ingestor.ingest(&ev))
                    .await
                    .map_err(anyhow::Error::from)
                    .and_then(|r| r.map_err(anyhow::Error::from))
            }
        };
        match outcome {
            Ok(outcome) => tracing::debug!(?outcome, "local echo"),
            Err(e) => tracing::warn!(error = %e, "local echo failed"),
        }
    }
}

/// Send `ev` over a fresh connection and wait for the matching `OK`.
async fn deliver(url: &str, tor_socks: Option<&str>, ev: &Event) -> anyhow::Result<()> {
    let mut ws = relay::connect_ws(url, tor_socks).await?;
    ws.send(relay::publish(ev)).await?;
    let (accepted, message) = loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => match RelayMessage::parse(&text) {
                Some(RelayMessage::Ok {
                    id,
                    accepted,
                    message,
                }) if id == ev.id => break (accepted, message),
                Some(RelayMessage::Notice(notice)) => {
                    tracing::info!(relay = %url, %notice, "relay notice");
                }
                _ => {}
            },
            Some(Ok(Message::Close(_))) | None => bail!("closed before acknowledging"),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    };
    let _ = ws.close(None).await;
    if !accepted {
        bail!("rejected: {message}");
    }
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::{net::TcpListener, task::JoinHandle};
    use tokio_tungstenite::accept_async;

    use super::*;
    use crate::{signer::KeypairSigner, store::SqliteStore};

    const ALICE: &str = "0101010101010101010101010101010101010101010101010101010101010101";
    const BOB: &str = "0202020202020202020202020202020202020202020202020202020202020202";

    /// Fake relay answering every EVENT with `["OK", id, accept, ...]`.
    async fn acking_relay(accept: bool) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut ws = accept_async(stream).await.unwrap();
                    while let Some(Ok(Message::Text(txt))) = ws.next().await {
                        let frame: serde_json::Value = serde_json::from_str(&txt).unwrap();
                        let id = frame[1]["id"].as_str().unwrap_or_default().to_string();
                        let reply = json!(["OK", id, accept, if accept { "" } else { "blocked: test" }]);
                        ws.send(Message::Text(reply.to_string())).await.unwrap();
                    }
                });
            }
        });
        (url, server)
    }

    fn gateway(relays: Vec<String>) -> Gateway {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let ingestor = Ingestor::new(store, Visibility::new(), Limits::default());
        let cfg = GatewayConfig {
            relays,
            tor_socks: None,
            ack_timeout: Duration::from_secs(2),
            visibility_timeout: Duration::from_secs(2),
            local_echo: true,
        };
        Gateway::new(cfg, ingestor, Limits::default())
    }

    fn post(title: &str) -> Draft {
        Draft::Post {
            title: title.into(),
            body: "body".into(),
            channel: "News".into(),
        }
    }

    #[tokio::test]
    async fn accepted_post_becomes_visible() {
        let (url, relay) = acking_relay(true).await;
        let gw = gateway(vec![url]);
        let alice = KeypairSigner::from_hex(ALICE).unwrap();

        let published = gw.publish(&alice, post("hello")).await.unwrap();
        assert!(published.is_visible());
        let stored = gw.store().get_post(published.id()).unwrap().unwrap();
        assert_eq!(stored.author, alice.public_key());
        assert_eq!(stored.channel, "news");
        relay.abort();
    }

    #[tokio::test]
    async fn one_accepting_relay_is_enough() {
        let (good, a) = acking_relay(true).await;
        let (bad, b) = acking_relay(false).await;
        let gw = gateway(vec![bad, good]);
        let alice = KeypairSigner::from_hex(ALICE).unwrap();
        assert!(gw.publish(&alice, post("mixed")).await.is_ok());
        a.abort();
        b.abort();
    }

    #[tokio::test]
    async fn every_relay_rejecting_is_an_error() {
        let (bad, relay) = acking_relay(false).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);
        let gw = gateway(vec![bad, dead]);
        let alice = KeypairSigner::from_hex(ALICE).unwrap();

        let err = gw.publish(&alice, post("nope")).await.unwrap_err();
        match err {
            PublishError::Rejected(reason) => assert!(reason.contains("blocked: test")),
            other => panic!("unexpected error {other}"),
        }
        assert!(gw.store().fetch_posts(&Default::default()).unwrap().is_empty());
        relay.abort();
    }

    #[tokio::test]
    async fn no_relays_configured() {
        let gw = gateway(vec![]);
        let alice = KeypairSigner::from_hex(ALICE).unwrap();
        assert!(matches!(
            gw.publish(&alice, post("x")).await,
            Err(PublishError::NoRelays)
        ));
    }

    #[tokio::test]
    async fn without_echo_the_publish_is_not_yet_visible() {
        let (url, relay) = acking_relay(true).await;
        let mut gw = gateway(vec![url]);
        gw.cfg.local_echo = false;
        gw.cfg.visibility_timeout = Duration::from_millis(50);
        let alice = KeypairSigner::from_hex(ALICE).unwrap();

        let published = gw.publish(&alice, post("quiet")).await.unwrap();
        assert!(matches!(published, Published::NotYetVisible { .. }));
        relay.abort();
    }

    #[tokio::test]
    async fn submit_post_adds_a_self_upvote() {
        let (url, relay) = acking_relay(true).await;
        let gw = gateway(vec![url]);
        let alice = KeypairSigner::from_hex(ALICE).unwrap();

        let published = gw
            .submit_post(&alice, "title".into(), "body".into(), "rust".into())
            .await
            .unwrap();
        let stored = gw.store().get_post(published.id()).unwrap().unwrap();
        assert_eq!(stored.score, 1);
        assert_eq!(
            gw.store().get_user(&alice.public_key()).unwrap().unwrap().reputation,
            1
        );
        assert!(matches!(
            gw.publish(
                &alice,
                Draft::Vote {
                    target: published.id().into(),
                    direction: Direction::Down
                }
            )
            .await,
            Err(PublishError::AlreadyVoted(_))
        ));
        relay.abort();
    }

    #[tokio::test]
    async fn comments_land_in_the_thread() {
        let (url, relay) = acking_relay(true).await;
        let gw = gateway(vec![url]);
        let alice = KeypairSigner::from_hex(ALICE).unwrap();
        let bob = KeypairSigner::from_hex(BOB).unwrap();

        let root = gw.publish(&alice, post("thread")).await.unwrap();
        let reply = gw
            .publish(
                &bob,
                Draft::Comment {
                    parent: root.id().into(),
                    body: "first".into(),
                },
            )
            .await
            .unwrap();
        let thread_root = gw.store().root_of(reply.id()).unwrap().unwrap();
        assert_eq!(thread_root.id, root.id());
        assert_eq!(gw.store().get_post(root.id()).unwrap().unwrap().children, 1);

        let orphan = Draft::Comment {
            parent: "missing".into(),
            body: "hello?".into(),
        };
        assert!(matches!(
            gw.publish(&bob, orphan).await,
            Err(PublishError::NotFound(_))
        ));
        relay.abort();
    }

    #[tokio::test]
    async fn deletion_checks_ownership() {
        let (url, relay) = acking_relay(true).await;
        let gw = gateway(vec![url]);
        let alice = KeypairSigner::from_hex(ALICE).unwrap();
        let bob = KeypairSigner::from_hex(BOB).unwrap();
        let root = gw.publish(&alice, post("mine")).await.unwrap();

        let steal = Draft::Delete {
            targets: vec![root.id().into()],
        };
        assert!(matches!(
            gw.publish(&bob, steal.clone()).await,
            Err(PublishError::NotOwner(_))
        ));
        let unknown = Draft::Delete {
            targets: vec!["missing".into()],
        };
        assert!(matches!(
            gw.publish(&alice, unknown).await,
            Err(PublishError::NotFound(_))
        ));

        gw.publish(&alice, steal).await.unwrap();
        assert!(gw.store().get_post(root.id()).unwrap().is_none());
        relay.abort();
    }

    #[tokio::test]
    async fn profile_is_sanitized() {
        let (url, relay) = acking_relay(true).await;
        let gw = gateway(vec![url]);
        let alice = KeypairSigner::from_hex(ALICE).unwrap();
        let profile = Draft::Profile {
            name: Some("al!ce".into()),
            about: Some("hi".into()),
        };
        gw.publish(&alice, profile).await.unwrap();
        let meta = gw.store().get_metadata(&alice.public_key()).unwrap().unwrap();
        assert_eq!(meta.name, "alce");
        relay.abort();
    }

    #[test]
    fn invalid_drafts_are_refused_before_signing() {
        let gw = gateway(vec![]);
        let empty = Draft::Post {
            title: "  ".into(),
            body: "body".into(),
            channel: String::new(),
        };
        assert!(matches!(
            gw.prepare("pk", empty),
            Err(PublishError::Invalid(_))
        ));
        let no_target = Draft::Vote {
            target: String::new(),
            direction: Direction::Up,
        };
        assert!(matches!(
            gw.prepare("pk", no_target),
            Err(PublishError::Invalid(_))
        ));
        let prepared = gw.prepare("pk", post("ok")).unwrap();
        assert_eq!(prepared.kind, KIND_TEXT_NOTE);
        let content: PostContent = serde_json::from_str(&prepared.content).unwrap();
        assert_eq!(content.channel, "news");
    }
}
