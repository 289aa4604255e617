//! Per-event ingestion: verify, classify, write, notify.

use std::sync::Arc;

use crate::{
    classify::{classify, Entity},
    event::Event,
    model::Limits,
    store::{Store, StoreError, WriteOutcome},
    visibility::Visibility,
};

/// What happened to one ingested event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Materialized; carries the entity kind.
    Applied(&'static str),
    /// Already materialized.
    Conflict,
    /// A second vote by the same voter on the same target; the earlier vote
    /// stands.
    AlreadyVoted,
    /// Recorded but waiting on an event that has not arrived yet.
    Deferred,
    /// Valid but without effect.
    Skipped,
    /// Id or signature did not check out.
    Untrusted,
    /// Content fits no known entity.
    Malformed,
}

impl IngestOutcome {
    pub fn label(self) -> &'static str {
        match self {
            IngestOutcome::Applied(_) => "applied",
            IngestOutcome::Conflict => "conflict",
            IngestOutcome::AlreadyVoted => "already-voted",
            IngestOutcome::Deferred => "deferred",
            IngestOutcome::Skipped => "skipped",
            IngestOutcome::Untrusted => "untrusted",
            IngestOutcome::Malformed => "malformed",
        }
    }

    /// Whether the event's effect is now reflected in the store.
    pub fn is_visible(self) -> bool {
        matches!(
            self,
            IngestOutcome::Applied(_) | IngestOutcome::Conflict | IngestOutcome::Deferred
        )
    }
}

#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn Store>,
    visibility: Visibility,
    limits: Limits,
}

impl Ingestor {
    pub fn new(store: Arc<dyn Store>, visibility: Visibility, limits: Limits) -> Self {
        Self {
            store,
            visibility,
            limits,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn visibility(&self) -> &Visibility {
        &self.visibility
    }

    /// Run one event through the pipeline.
    ///
    /// Untrusted and malformed input is dropped with a debug log rather than
    /// reported as an error; only store failures are errors.
    pub fn ingest(&self, ev: &Event) -> Result<IngestOutcome, StoreError> {
        if let Err(e) = ev.verify() {
            tracing::debug!(id = %ev.id, error = %e, "dropping untrusted event");
            return Ok(IngestOutcome::Untrusted);
        }
        let entity = match classify(ev, &self.limits) {
            Ok(entity) => entity,
            Err(e) => {
                tracing::debug!(id = %ev.id, error = %e, "dropping malformed event");
                return Ok(IngestOutcome::Malformed);
            }
        };
        let kind = entity.kind_name();
        let written = match &entity {
            Entity::Post(post) => self.store.insert_post(post)?,
            Entity::Vote(vote) => self.store.insert_vote(vote)?,
            Entity::Metadata(meta) => self.store.upsert_metadata(meta)?,
            Entity::Deletion(deletion) => {
                let mut combined = WriteOutcome::Skipped;
                for target in &deletion.targets {
                    match self.store.delete_post(target, &deletion.author)? {
                        WriteOutcome::Applied => combined = WriteOutcome::Applied,
                        WriteOutcome::Deferred if combined == WriteOutcome::Skipped => {
                            combined = WriteOutcome::Deferred
                        }
                        _ => {}
                    }
                }
                combined
            }
        };
        let outcome = match written {
            WriteOutcome::Applied => IngestOutcome::Applied(kind),
            WriteOutcome::Conflict => IngestOutcome::Conflict,
            WriteOutcome::AlreadyVoted => IngestOutcome::AlreadyVoted,
            WriteOutcome::Deferred => IngestOutcome::Deferred,
            WriteOutcome::Skipped => IngestOutcome::Skipped,
        };
        tracing::trace!(id = %ev.id, kind, ?outcome, "ingested");
        if outcome.is_visible() {
            self.visibility.notify(&ev.id);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        event::{tests::signed, Tag, KIND_DELETION, KIND_METADATA, KIND_TEXT_NOTE},
        store::SqliteStore,
    };

    const TS: u64 = 1_700_000_000;

    fn ingestor() -> Ingestor {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        Ingestor::new(store, Visibility::new(), Limits::default())
    }

    fn post_event(secret: u8) -> Event {
        signed(
            secret,
            KIND_TEXT_NOTE,
            TS,
            vec![],
            r#"{"title":"Hello","body":"world","channel":"news"}"#,
        )
    }

    #[test]
    fn post_is_materialized_once() {
        let ing = ingestor();
        let ev = post_event(1);
        assert_eq!(ing.ingest(&ev).unwrap(), IngestOutcome::Applied("post"));
        assert_eq!(ing.ingest(&ev).unwrap(), IngestOutcome::Conflict);
        let post = ing.store().get_post(&ev.id).unwrap().unwrap();
        assert_eq!(post.author, ev.pubkey);
        assert_eq!(post.channel, "news");
    }

    #[test]
    fn tampered_events_are_untrusted() {
        let ing = ingestor();
        let mut ev = post_event(1);
        ev.content = r#"{"title":"Forged","body":"world"}"#.into();
        assert_eq!(ing.ingest(&ev).unwrap(), IngestOutcome::Untrusted);
        assert!(ing.store().get_post(&ev.id).unwrap().is_none());
    }

    #[test]
    fn unparseable_content_is_malformed() {
        let ing = ingestor();
        let ev = signed(1, KIND_TEXT_NOTE, TS, vec![], "just some text");
        assert_eq!(ing.ingest(&ev).unwrap(), IngestOutcome::Malformed);
    }

    #[test]
    fn votes_and_metadata() {
        let ing = ingestor();
        let post = post_event(1);
        ing.ingest(&post).unwrap();
        let up = signed(
            2,
            KIND_TEXT_NOTE,
            TS,
            vec![],
            &format!(r#"{{"target":"{}","direction":true}}"#, post.id),
        );
        assert_eq!(ing.ingest(&up).unwrap(), IngestOutcome::Applied("vote"));
        assert_eq!(ing.store().get_post(&post.id).unwrap().unwrap().score, 1);

        let profile = signed(1, KIND_METADATA, TS, vec![], r#"{"name":"al ice","about":"hi"}"#);
        assert_eq!(ing.ingest(&profile).unwrap(), IngestOutcome::Applied("metadata"));
        let meta = ing.store().get_metadata(&post.pubkey).unwrap().unwrap();
        assert_eq!(meta.name, "alice");
        assert_eq!(ing.store().get_user(&post.pubkey).unwrap().unwrap().reputation, 1);
    }

    #[test]
    fn deletion_needs_the_author() {
        let ing = ingestor();
        let post = post_event(1);
        ing.ingest(&post).unwrap();

        let foreign = signed(2, KIND_DELETION, TS + 1, vec![Tag::event(&post.id)], "");
        assert_eq!(ing.ingest(&foreign).unwrap(), IngestOutcome::Skipped);
        assert!(ing.store().get_post(&post.id).unwrap().is_some());

        let own = signed(1, KIND_DELETION, TS + 1, vec![Tag::event(&post.id)], "");
        assert_eq!(ing.ingest(&own).unwrap(), IngestOutcome::Applied("deletion"));
        assert!(ing.store().get_post(&post.id).unwrap().is_none());
        assert_eq!(ing.ingest(&post).unwrap(), IngestOutcome::Skipped);
    }

    #[test]
    fn every_deletion_target_is_processed() {
        let ing = ingestor();
        let a = post_event(1);
        let b = signed(1, KIND_TEXT_NOTE, TS + 5, vec![], r#"{"title":"B","body":"b"}"#);
        ing.ingest(&a).unwrap();
        ing.ingest(&b).unwrap();
        let del = signed(
            1,
            KIND_DELETION,
            TS + 10,
            vec![Tag::event(&a.id), Tag::event(&b.id)],
            "",
        );
        ing.ingest(&del).unwrap();
        assert!(ing.store().get_post(&a.id).unwrap().is_none());
        assert!(ing.store().get_post(&b.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn second_vote_by_the_same_voter_is_not_visible() {
        let ing = ingestor();
        let post = post_event(1);
        ing.ingest(&post).unwrap();
        let vote = |created_at, direction: bool| {
            signed(
                2,
                KIND_TEXT_NOTE,
                created_at,
                vec![],
                &format!(r#"{{"target":"{}","direction":{direction}}}"#, post.id),
            )
        };
        let up = vote(TS + 1, true);
        assert_eq!(ing.ingest(&up).unwrap(), IngestOutcome::Applied("vote"));
        // The same event again is a replay and stays visible.
        assert_eq!(ing.ingest(&up).unwrap(), IngestOutcome::Conflict);

        let down = vote(TS + 2, false);
        let watch = ing.visibility().watch(&down.id);
        assert_eq!(ing.ingest(&down).unwrap(), IngestOutcome::AlreadyVoted);
        assert!(!watch.wait(Duration::from_millis(20)).await);
        assert_eq!(ing.store().get_post(&post.id).unwrap().unwrap().score, 1);
        assert_eq!(IngestOutcome::AlreadyVoted.label(), "already-voted");
    }

    #[tokio::test]
    async fn successful_ingest_wakes_watchers() {
        let ing = ingestor();
        let ev = post_event(1);
        let watch = ing.visibility().watch(&ev.id);
        ing.ingest(&ev).unwrap();
        assert!(watch.wait(Duration::from_millis(100)).await);

        let bad = signed(1, KIND_TEXT_NOTE, TS, vec![], "nope");
        let watch = ing.visibility().watch(&bad.id);
        ing.ingest(&bad).unwrap();
        assert!(!watch.wait(Duration::from_millis(20)).await);
    }
}
