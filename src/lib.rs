//! Local, queryable replica of a link-sharing board whose content lives as
//! signed events on independent relays.
//!
//! Events flow from relay subscriptions ([`fanin`]) through verification and
//! classification ([`ingest`]) into a SQLite materialization ([`store`]).
//! User actions go the other way through the [`publish`] gateway.

pub mod classify;
pub mod config;
pub mod event;
pub mod fanin;
pub mod ingest;
pub mod model;
pub mod publish;
pub mod ranking;
pub mod relay;
pub mod signer;
pub mod store;
pub mod tree;
pub mod visibility;
