//! # Shopfinder Core
//!
//! Storage-agnostic logic for Shopfinder: the shop model, geohash encoding
//! and proximity expansion, the keyword and advanced-query grammars, and
//! the [`ShopStore`](store::ShopStore) contract every backend implements.
//!
//! This crate does no I/O. Database, search-index and HTTP concerns live in
//! the `shopfinder` crate, which depends on this one.

pub mod error;
pub mod geohash;
pub mod keyword;
pub mod models;
pub mod proximity;
pub mod query;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use models::{Coord, Location, Shop, ShopStatus};
