//! YouTrack terminal client core: a retrying REST client and an
//! offline-first issue cache with optimistic updates.

pub mod cache;
pub mod config;
pub mod logging;
pub mod youtrack;
