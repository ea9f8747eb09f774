//! Storage abstraction for Shopfinder.
//!
//! The [`ShopStore`] trait is the single contract every backend fulfils:
//! plain SQL with geohash columns, SQL with a spatial extension, and a
//! search index. Search semantics are identical across implementations;
//! only the query translation differs.
//!
//! Implementations must be `Send + Sync` so one handle can be shared by
//! every request handler and pipeline worker.

pub mod memory;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::models::{Shop, ShopStatus};

/// Abstract storage backend for Shopfinder.
///
/// All read operations hide closed shops.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`nearest_shops`](ShopStore::nearest_shops) | Shops within a radius, `distance` populated |
/// | [`shops_with_keyword`](ShopStore::shops_with_keyword) | Free-text keyword search, see [`crate::keyword`] |
/// | [`adv_query`](ShopStore::adv_query) | Structured query, see [`crate::query`] |
/// | [`shop_by_id`](ShopStore::shop_by_id) | Exact lookup |
/// | [`shop_missing_info`](ShopStore::shop_missing_info) | Enrichment candidates |
/// | [`update_shop_info`](ShopStore::update_shop_info) | Atomic bulk write of address and location |
/// | [`shop_count`](ShopStore::shop_count) | Number of stored shops |
/// | [`districts`](ShopStore::districts) | Distinct districts of open shops |
/// | [`suggest_keyword`](ShopStore::suggest_keyword) | Fuzzy tag correction |
/// | [`insert_shop`](ShopStore::insert_shop) | Add a shop, returning its new id |
/// | [`set_status`](ShopStore::set_status) | Open or close a shop |
/// | [`all_shops`](ShopStore::all_shops) | Every shop, closed included |
#[async_trait]
pub trait ShopStore: Send + Sync {
    /// Shops within `radius` (`"500m"`, `"1km"`) of the point.
    ///
    /// Returns an empty vec when nothing is in range.
    async fn nearest_shops(&self, lat: f64, lon: f64, radius: &str) -> StoreResult<Vec<Shop>>;

    async fn shops_with_keyword(&self, text: &str) -> StoreResult<Vec<Shop>>;

    /// Rejects queries without a required term with `Validation`.
    async fn adv_query(&self, query: &str) -> StoreResult<Vec<Shop>>;

    /// `NotFound` if no shop has `id`. Closed shops are still returned.
    async fn shop_by_id(&self, id: i64) -> StoreResult<Shop>;

    /// Open shops with no location that are not online-only.
    async fn shop_missing_info(&self) -> StoreResult<Vec<Shop>>;

    /// Write address and location of every shop in one transaction.
    ///
    /// Returns the number of rows written. An unknown id fails the whole
    /// batch with `NotFound` and nothing is written.
    async fn update_shop_info(&self, shops: &[Shop]) -> StoreResult<u64>;

    async fn shop_count(&self) -> StoreResult<u64>;

    async fn districts(&self) -> StoreResult<Vec<String>>;

    async fn suggest_keyword(&self, key: &str) -> StoreResult<Vec<String>>;

    async fn insert_shop(&self, shop: &Shop) -> StoreResult<i64>;

    async fn set_status(&self, id: i64, status: ShopStatus) -> StoreResult<()>;

    async fn all_shops(&self) -> StoreResult<Vec<Shop>>;

    /// Tag maintenance, for stores that support it.
    fn tag_maintenance(&self) -> Option<&dyn TagMaintenance> {
        None
    }

    /// Release pools and index handles. Called once on shutdown.
    async fn close(&self) {}
}

/// Optional capability: derive tags for shops that have none.
#[async_trait]
pub trait TagMaintenance: Send + Sync {
    /// Give every untagged shop the tags `[district, type]`.
    ///
    /// Returns how many shops were tagged.
    async fn refresh_tags(&self) -> StoreResult<u64>;
}
