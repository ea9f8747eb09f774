//! # Shopfinder
//!
//! A directory of shops with three interchangeable storage backends, a
//! TTL query cache, and a geocode backfill pipeline.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────┐   ┌─────────────┐   ┌──────────────────────────┐
//!  │ CLI/HTTP │──▶│ CachedStore │──▶│ dyn ShopStore            │
//!  └──────────┘   │  (TTL)      │   │ SQLite+geohash / PostGIS │
//!       │         └─────────────┘   │ / tantivy                │
//!       │                ▲          └──────────────────────────┘
//!       ▼                │ flush             ▲
//!  ┌──────────┐          │                   │ update_shop_info
//!  │ Enricher │──────────┴───────────────────┘
//!  │ N workers│──▶ Geocoder (Google / Bing)
//!  └──────────┘
//! ```
//!
//! The storage-agnostic pieces (model, geohash, proximity, query grammar,
//! the [`ShopStore`](shopfinder_core::store::ShopStore) trait) live in the
//! `shopfinder-core` crate.
//!
//! ## Quick Start
//!
//! ```bash
//! shopfinder init
//! shopfinder import shops.json
//! shopfinder nearest 22.2819 114.1582 --radius 1km
//! shopfinder search 咖啡
//! shopfinder query 'district:中環 -tag:連鎖'
//! shopfinder fill-info
//! shopfinder serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`backend`] | Backend selection, import and index migration |
//! | [`sqlite_store`] | SQLite store with geohash proximity |
//! | [`postgis_store`] | PostGIS store with native distance search |
//! | [`tantivy_store`] | Search-index store |
//! | [`cache`] | TTL cache and the caching store decorator |
//! | [`session`] | Admin add-shop wizard state |
//! | [`geocode`] | Geocoder providers |
//! | [`enrich`] | Bounded-concurrency geocode backfill |
//! | [`server`] | HTTP API |
//! | [`commands`] | CLI command implementations |
//! | [`db`] | Database connections |
//! | [`migrate`] | Schema migrations |

pub mod backend;
pub mod cache;
pub mod commands;
pub mod config;
pub mod db;
pub mod enrich;
pub mod geocode;
pub mod migrate;
pub mod postgis_store;
pub mod server;
pub mod session;
pub mod sqlite_store;
pub mod tantivy_store;

pub use shopfinder_core;
