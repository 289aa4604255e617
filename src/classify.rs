//! Classification of verified events into domain entities.
//!
//! Deletions are recognised by kind. Everything else is decoded against an
//! ordered list of content schemas and the first one that both decodes and
//! passes its validity check wins. Votes are tried before posts; content that
//! satisfies both is a vote.

use serde::de::DeserializeOwned;

use crate::{
    event::{Event, KIND_DELETION, KIND_METADATA, KIND_TEXT_NOTE},
    model::{
        Deletion, Direction, Limits, Metadata, MetadataContent, Post, PostContent, Vote,
        VoteContent,
    },
    ranking::rank,
};

/// A verified event folded into its domain meaning.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Post(Post),
    Vote(Vote),
    Metadata(Metadata),
    Deletion(Deletion),
}

impl Entity {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Entity::Post(p) if p.is_comment() => "comment",
            Entity::Post(_) => "post",
            Entity::Vote(_) => "vote",
            Entity::Metadata(_) => "metadata",
            Entity::Deletion(_) => "deletion",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifyError {
    #[error("deletion without any e-tag target")]
    EmptyDeletion,
    #[error("kind {0} content matches no known schema")]
    NoSchema(u32),
}

/// One content schema: the event kind it applies to and how to extract it.
struct Schema {
    name: &'static str,
    kind: u32,
    extract: fn(&Event, &Limits) -> Option<Entity>,
}

/// Precedence order; earlier entries win.
const SCHEMAS: &[Schema] = &[
    Schema {
        name: "vote",
        kind: KIND_TEXT_NOTE,
        extract: vote_from_event,
    },
    Schema {
        name: "post",
        kind: KIND_TEXT_NOTE,
        extract: post_from_event,
    },
    Schema {
        name: "metadata",
        kind: KIND_METADATA,
        extract: metadata_from_event,
    },
];

/// Classify a verified event.
pub fn classify(ev: &Event, limits: &Limits) -> Result<Entity, ClassifyError> {
    if ev.kind == KIND_DELETION {
        let targets = ev.referenced_ids();
        if targets.is_empty() {
            return Err(ClassifyError::EmptyDeletion);
        }
        return Ok(Entity::Deletion(Deletion {
            author: ev.pubkey.clone(),
            targets,
        }));
    }
    for schema in SCHEMAS.iter().filter(|s| s.kind == ev.kind) {
        if let Some(entity) = (schema.extract)(ev, limits) {
            tracing::trace!(id = %ev.id, schema = schema.name, "classified event");
            return Ok(entity);
        }
    }
    Err(ClassifyError::NoSchema(ev.kind))
}

fn decode<T: DeserializeOwned>(ev: &Event) -> Option<T> {
    serde_json::from_str(&ev.content).ok()
}

fn vote_from_event(ev: &Event, _limits: &Limits) -> Option<Entity> {
    let content: VoteContent = decode(ev)?;
    if content.target.is_empty() {
        return None;
    }
    Some(Entity::Vote(Vote {
        voter: ev.pubkey.clone(),
        target: content.target,
        channel: String::new(),
        direction: Direction::from_up(content.direction),
        created_at: ev.created_at,
    }))
}

fn post_from_event(ev: &Event, limits: &Limits) -> Option<Entity> {
    let content = decode::<PostContent>(ev)?.normalized(limits)?;
    Some(Entity::Post(Post {
        id: ev.id.clone(),
        score: 0,
        children: 0,
        author: ev.pubkey.clone(),
        created_at: ev.created_at,
        title: content.title,
        body: content.body,
        channel: content.channel,
        parent: content.parent,
        ranking: rank(0, ev.created_at),
    }))
}

fn metadata_from_event(ev: &Event, limits: &Limits) -> Option<Entity> {
    let (name, about) = decode::<MetadataContent>(ev)?.normalized(limits)?;
    Some(Entity::Metadata(Metadata {
        pubkey: ev.pubkey.clone(),
        name,
        about,
        created_at: ev.created_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;

    fn event(kind: u32, content: &str, tags: Vec<Tag>) -> Event {
        Event {
            id: "e1".into(),
            pubkey: "author".into(),
            kind,
            created_at: 1_700_000_000,
            tags,
            content: content.into(),
            sig: String::new(),
        }
    }

    fn classify_one(kind: u32, content: &str) -> Result<Entity, ClassifyError> {
        classify(&event(kind, content, vec![]), &Limits::default())
    }

    #[test]
    fn root_post() {
        let Entity::Post(p) = classify_one(1, r#"{"title":"Hi","body":"there","channel":"News"}"#).unwrap()
        else {
            panic!("expected post");
        };
        assert_eq!(p.id, "e1");
        assert_eq!(p.author, "author");
        assert_eq!(p.channel, "news");
        assert!(!p.is_comment());
        assert_eq!(p.ranking, rank(0, 1_700_000_000));
    }

    #[test]
    fn comment() {
        let entity = classify_one(1, r#"{"body":"reply","parent":"p0"}"#).unwrap();
        assert_eq!(entity.kind_name(), "comment");
    }

    #[test]
    fn vote_wins_over_post() {
        let content = r#"{"title":"t","body":"b","target":"p0","direction":true}"#;
        let Entity::Vote(v) = classify_one(1, content).unwrap() else {
            panic!("expected vote");
        };
        assert_eq!(v.target, "p0");
        assert_eq!(v.direction, Direction::Up);
        assert_eq!(v.voter, "author");
    }

    #[test]
    fn downvote_when_direction_absent() {
        let Entity::Vote(v) = classify_one(1, r#"{"target":"p0"}"#).unwrap() else {
            panic!("expected vote");
        };
        assert_eq!(v.direction, Direction::Down);
    }

    #[test]
    fn empty_target_falls_through_to_post() {
        let entity = classify_one(1, r#"{"target":"","title":"t","body":"b"}"#).unwrap();
        assert_eq!(entity.kind_name(), "post");
    }

    #[test]
    fn metadata_only_for_its_kind() {
        let content = r#"{"name":"alice","about":"hi"}"#;
        assert_eq!(classify_one(0, content).unwrap().kind_name(), "metadata");
        assert_eq!(classify_one(1, content), Err(ClassifyError::NoSchema(1)));
    }

    #[test]
    fn malformed_content() {
        assert_eq!(classify_one(1, "hello world"), Err(ClassifyError::NoSchema(1)));
        assert_eq!(classify_one(1, r#"{"title":"only"}"#), Err(ClassifyError::NoSchema(1)));
        assert_eq!(classify_one(7, r#"{"target":"x"}"#), Err(ClassifyError::NoSchema(7)));
    }

    #[test]
    fn deletion_by_kind() {
        let ev = event(5, "", vec![Tag::event("p1"), Tag::event("p2")]);
        let Entity::Deletion(d) = classify(&ev, &Limits::default()).unwrap() else {
            panic!("expected deletion");
        };
        assert_eq!(d.author, "author");
        assert_eq!(d.targets, vec!["p1".to_string(), "p2".to_string()]);

        let empty = event(5, r#"{"target":"p1"}"#, vec![]);
        assert_eq!(
            classify(&empty, &Limits::default()),
            Err(ClassifyError::EmptyDeletion)
        );
    }
}
