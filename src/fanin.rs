//! Relay subscription fan-in.
//!
//! One task per relay holds a subscription open and forwards every inbound
//! event into a bounded queue. A single blocking writer drains the queue,
//! de-duplicates by id across relays, and runs each event through the
//! [`Ingestor`]. Relay loops reconnect on their own until shutdown.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Result};
use futures_util::{future::join_all, SinkExt, StreamExt};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::sleep,
};
use tokio_tungstenite::tungstenite::Message;

use crate::{
    event::Event,
    ingest::{IngestOutcome, Ingestor},
    relay::{self, RelayMessage, RelaySocket},
};

/// Subscription id used on every relay.
pub const SUBSCRIPTION_ID: &str = "relayboard";

const QUEUE_DEPTH: usize = 1024;
const CURSOR_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct FanInConfig {
    pub relays: Vec<String>,
    pub kinds: Vec<u32>,
    pub tor_socks: Option<String>,
    pub reconnect_delay: Duration,
    pub seen_capacity: usize,
    /// How long a vote may wait for its target before it is dropped.
    pub pending_vote_ttl: Duration,
}

/// Bounded set of recently ingested ids; the oldest id is forgotten first.
pub struct SeenIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Remember `id`. Returns false if it was already known.
    pub fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

enum Command {
    Ingest {
        /// Relay the event came from; `None` for locally injected events.
        relay: Option<String>,
        event: Event,
        reply: Option<oneshot::Sender<IngestOutcome>>,
    },
    /// The relay sent EOSE: everything stored up to now has been delivered.
    CaughtUp(String),
    /// The relay's session ended; progress not yet confirmed by EOSE is void.
    Disconnected(String),
    Stop,
}

/// Handle for pushing events into the writer from outside the relay loops.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Command>,
}

impl EventSink {
    /// Queue `event` behind everything already received and wait for its
    /// outcome. `None` once the writer has stopped.
    pub async fn submit(&self, event: Event) -> Option<IngestOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Ingest {
                relay: None,
                event,
                reply: Some(reply),
            })
            .await
            .ok()?;
        rx.await.ok()
    }
}

/// Counters reported by the writer when it exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub received: u64,
    pub duplicates: u64,
    pub applied: u64,
    pub dropped: u64,
    pub failed: u64,
}

pub struct FanInHandle {
    shutdown: watch::Sender<bool>,
    relays: Vec<JoinHandle<()>>,
    writer: JoinHandle<WriterStats>,
    sink: EventSink,
    reachable: usize,
}

impl FanInHandle {
    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    /// Relays that accepted a connection at startup.
    pub fn reachable(&self) -> usize {
        self.reachable
    }

    /// Close every subscription, then let the writer drain what was queued.
    pub async fn shutdown(self) -> Result<WriterStats> {
        let _ = self.shutdown.send(true);
        for task in self.relays {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "relay task ended abnormally");
            }
        }
        let _ = self.sink.tx.send(Command::Stop).await;
        let stats = self.writer.await?;
        tracing::info!(?stats, "fan-in stopped");
        Ok(stats)
    }
}

/// Connect to every relay and start ingesting.
///
/// Fails when no relay is configured or none is reachable. Relays that fail
/// the first connection keep retrying in the background.
pub async fn start(cfg: FanInConfig, ingestor: Ingestor) -> Result<FanInHandle> {
    if cfg.relays.is_empty() {
        bail!("no relays configured");
    }
    let attempts = join_all(
        cfg.relays
            .iter()
            .map(|url| relay::connect_ws(url, cfg.tor_socks.as_deref())),
    )
    .await;
    let mut sockets = Vec::with_capacity(attempts.len());
    for (url, attempt) in cfg.relays.iter().zip(attempts) {
        match attempt {
            Ok(ws) => sockets.push(Some(ws)),
            Err(e) => {
                tracing::warn!(relay = %url, error = %e, "relay unreachable");
                sockets.push(None);
            }
        }
    }
    let reachable = sockets.iter().filter(|s| s.is_some()).count();
    if reachable == 0 {
        bail!("none of the {} configured relays are reachable", cfg.relays.len());
    }
    tracing::info!(reachable, configured = cfg.relays.len(), "relays connected");

    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    let capacity = cfg.seen_capacity;
    let ttl = cfg.pending_vote_ttl;
    let writer_ingestor = ingestor.clone();
    let writer =
        tokio::task::spawn_blocking(move || run_writer(writer_ingestor, rx, capacity, ttl));

    let (shutdown, shutdown_rx) = watch::channel(false);
    let relays = cfg
        .relays
        .iter()
        .zip(sockets)
        .map(|(url, socket)| {
            let ctx = RelayLoop {
                url: url.clone(),
                cfg: cfg.clone(),
                ingestor: ingestor.clone(),
                tx: tx.clone(),
                shutdown: shutdown_rx.clone(),
            };
            tokio::spawn(ctx.run(socket))
        })
        .collect();

    Ok(FanInHandle {
        shutdown,
        relays,
        writer,
        sink: EventSink { tx },
        reachable,
    })
}

/// Resolve once shutdown has been requested or the handle is gone.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

enum SessionEnd {
    Shutdown,
    Closed,
}

struct RelayLoop {
    url: String,
    cfg: FanInConfig,
    ingestor: Ingestor,
    tx: mpsc::Sender<Command>,
    shutdown: watch::Receiver<bool>,
}

impl RelayLoop {
    async fn run(mut self, mut socket: Option<RelaySocket>) {
        loop {
            if *self.shutdown.borrow() {
                return;
            }
            let ws = match socket.take() {
                Some(ws) => ws,
                None => match relay::connect_ws(&self.url, self.cfg.tor_socks.as_deref()).await {
                    Ok(ws) => {
                        tracing::info!(relay = %self.url, "reconnected");
                        ws
                    }
                    Err(e) => {
                        tracing::warn!(relay = %self.url, error = %e, "connect failed");
                        if self.pause().await {
                            return;
                        }
                        continue;
                    }
                },
            };
            let end = self.session(ws).await;
            let _ = self.tx.send(Command::Disconnected(self.url.clone())).await;
            match end {
                Ok(SessionEnd::Shutdown) => return,
                Ok(SessionEnd::Closed) => tracing::info!(relay = %self.url, "relay closed"),
                Err(e) => tracing::warn!(relay = %self.url, error = %e, "relay session failed"),
            }
            if self.pause().await {
                return;
            }
        }
    }

    /// Sleep for the reconnect delay. Returns true if shutdown came first.
    async fn pause(&mut self) -> bool {
        tokio::select! {
            _ = stopped(&mut self.shutdown) => true,
            _ = sleep(self.cfg.reconnect_delay) => false,
        }
    }

    async fn session(&mut self, mut ws: RelaySocket) -> Result<SessionEnd> {
        let since = match self.ingestor.store().cursor(&self.url) {
            Ok(since) => since,
            Err(e) => {
                tracing::warn!(relay = %self.url, error = %e, "reading cursor");
                None
            }
        };
        ws.send(relay::req(SUBSCRIPTION_ID, &self.cfg.kinds, since))
            .await?;
        tracing::debug!(relay = %self.url, ?since, "subscribed");

        loop {
            let msg = tokio::select! {
                _ = stopped(&mut self.shutdown) => {
                    let _ = ws.send(relay::close(SUBSCRIPTION_ID)).await;
                    let _ = ws.close(None).await;
                    return Ok(SessionEnd::Shutdown);
                }
                msg = ws.next() => msg,
            };
            let text = match msg {
                None | Some(Ok(Message::Close(_))) => return Ok(SessionEnd::Closed),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(_)) => continue,
            };
            match RelayMessage::parse(&text) {
                Some(RelayMessage::Event { event, .. }) => {
                    let cmd = Command::Ingest {
                        relay: Some(self.url.clone()),
                        event,
                        reply: None,
                    };
                    if self.tx.send(cmd).await.is_err() {
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                Some(RelayMessage::Eose(_)) => {
                    tracing::debug!(relay = %self.url, "caught up");
                    if self.tx.send(Command::CaughtUp(self.url.clone())).await.is_err() {
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                Some(RelayMessage::Notice(notice)) => {
                    tracing::info!(relay = %self.url, %notice, "relay notice");
                }
                Some(RelayMessage::Closed { message, .. }) => {
                    tracing::warn!(relay = %self.url, %message, "subscription closed by relay");
                    return Ok(SessionEnd::Closed);
                }
                Some(RelayMessage::Ok { .. }) => {}
                None => tracing::trace!(relay = %self.url, "ignoring frame"),
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Newest `created_at` per relay, written back to the store periodically.
///
/// Until a relay's session reaches EOSE its progress is only provisional:
/// backfill arrives newest first, so a session cut short would otherwise
/// save a `since` past history it never delivered.
struct Cursors {
    provisional: HashMap<String, u64>,
    live: HashSet<String>,
    /// Relays whose current session lost an event to a store failure.
    tainted: HashSet<String>,
    pending: HashMap<String, u64>,
    last_flush: Instant,
}

impl Cursors {
    fn new() -> Self {
        Self {
            provisional: HashMap::new(),
            live: HashSet::new(),
            tainted: HashSet::new(),
            pending: HashMap::new(),
            last_flush: Instant::now(),
        }
    }

    fn advance(&mut self, relay: &str, created_at: u64) {
        if self.tainted.contains(relay) {
            return;
        }
        // Relays echo whatever clock the author had; never resume from the future.
        let ts = created_at.min(unix_now());
        let target = if self.live.contains(relay) {
            &mut self.pending
        } else {
            &mut self.provisional
        };
        let entry = target.entry(relay.to_string()).or_insert(ts);
        *entry = (*entry).max(ts);
    }

    fn caught_up(&mut self, relay: &str) {
        if self.tainted.contains(relay) {
            return;
        }
        if let Some(ts) = self.provisional.remove(relay) {
            let entry = self.pending.entry(relay.to_string()).or_insert(ts);
            *entry = (*entry).max(ts);
        }
        self.live.insert(relay.to_string());
    }

    fn disconnected(&mut self, relay: &str) {
        if self.provisional.remove(relay).is_some() {
            tracing::debug!(relay = %relay, "discarding progress from an unfinished backfill");
        }
        self.live.remove(relay);
        self.tainted.remove(relay);
    }

    /// Stop moving `relay`'s cursor until its next session re-requests the gap.
    fn failed(&mut self, relay: &str) {
        self.provisional.remove(relay);
        self.tainted.insert(relay.to_string());
    }

    fn flush(&mut self, ingestor: &Ingestor) {
        for (relay, since) in self.pending.drain() {
            if let Err(e) = ingestor.store().save_cursor(&relay, since) {
                tracing::warn!(relay = %relay, error = %e, "saving cursor");
            }
        }
        self.last_flush = Instant::now();
    }

    fn flush_if_due(&mut self, ingestor: &Ingestor) {
        if self.last_flush.elapsed() >= CURSOR_FLUSH_INTERVAL {
            self.flush(ingestor);
        }
    }
}

fn prune_pending(ingestor: &Ingestor, ttl: Duration) {
    match ingestor.store().prune_pending_votes(ttl) {
        Ok(0) => {}
        Ok(n) => tracing::debug!(votes = n, "pruned votes whose target never arrived"),
        Err(e) => tracing::warn!(error = %e, "pruning parked votes"),
    }
}

fn run_writer(
    ingestor: Ingestor,
    mut rx: mpsc::Receiver<Command>,
    capacity: usize,
    ttl: Duration,
) -> WriterStats {
    let mut seen = SeenIds::new(capacity);
    let mut cursors = Cursors::new();
    let mut stats = WriterStats::default();
    let mut stopping = false;
    prune_pending(&ingestor, ttl);
    let mut last_prune = Instant::now();

    loop {
        // After Stop, only drain what is already queued.
        let cmd = if stopping {
            match rx.try_recv() {
                Ok(cmd) => cmd,
                Err(_) => break,
            }
        } else {
            match rx.blocking_recv() {
                Some(cmd) => cmd,
                None => break,
            }
        };
        match cmd {
            Command::Stop => stopping = true,
            Command::CaughtUp(relay) => {
                cursors.caught_up(&relay);
                cursors.flush(&ingestor);
            }
            Command::Disconnected(relay) => cursors.disconnected(&relay),
            Command::Ingest {
                relay,
                event,
                reply,
            } => {
                let outcome = write_one(&ingestor, &mut seen, &mut stats, &event);
                if let Some(relay) = &relay {
                    match outcome {
                        Some(IngestOutcome::Untrusted) => {}
                        Some(_) => cursors.advance(relay, event.created_at),
                        None => cursors.failed(relay),
                    }
                }
                if let (Some(reply), Some(outcome)) = (reply, outcome) {
                    let _ = reply.send(outcome);
                }
            }
        }
        cursors.flush_if_due(&ingestor);
        if last_prune.elapsed() >= PRUNE_INTERVAL {
            prune_pending(&ingestor, ttl);
            last_prune = Instant::now();
        }
    }
    cursors.flush(&ingestor);
    stats
}

/// De-duplicate and ingest one event. `None` when the store write failed.
fn write_one(
    ingestor: &Ingestor,
    seen: &mut SeenIds,
    stats: &mut WriterStats,
    event: &Event,
) -> Option<IngestOutcome> {
    stats.received += 1;
    if seen.contains(&event.id) {
        stats.duplicates += 1;
        return Some(IngestOutcome::Conflict);
    }
    match ingestor.ingest(event) {
        Ok(outcome) => {
            // A forged copy must not shadow the genuine event.
            if outcome != IngestOutcome::Untrusted {
                seen.insert(&event.id);
            }
            match outcome {
                IngestOutcome::Applied(_) => stats.applied += 1,
                IngestOutcome::Untrusted | IngestOutcome::Malformed => stats.dropped += 1,
                _ => {}
            }
            Some(outcome)
        }
        Err(e) => {
            stats.failed += 1;
            tracing::error!(id = %event.id, error = %e, "store write failed");
            None
        }
    }
}
