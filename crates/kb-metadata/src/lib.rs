//! Metadata Store Adapter (C2): a transactional store for documents,
//! versions, users, orgs, roles, shares, tasks and tool tokens — a
//! durable-enough store behind a trait, kept in memory behind per-table
//! locks since this crate has no real relational driver dependency to
//! reach for.

pub mod memory;
pub mod store;

pub use memory::InMemoryMetadataStore;
pub use store::{DocumentFilter, MetadataStore, TaskFilter};
