//! In-memory [`ShopStore`] implementation for tests.
//!
//! Shops live in a `BTreeMap` behind a `parking_lot::RwLock`. Proximity
//! search is exact (haversine over every located shop), so results are
//! always sorted nearest-first.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::keyword::{self, KeywordQuery};
use crate::models::{Coord, Shop, ShopStatus};
use crate::proximity;
use crate::query::AdvQuery;

use super::{ShopStore, TagMaintenance};

/// In-memory store, seeded directly or through [`ShopStore::insert_shop`].
pub struct InMemoryStore {
    shops: RwLock<BTreeMap<i64, Shop>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            shops: RwLock::new(BTreeMap::new()),
        }
    }

    /// Seed with shops, keeping their ids. Shops with id 0 get fresh ids.
    pub fn with_shops(shops: impl IntoIterator<Item = Shop>) -> Self {
        let store = Self::new();
        {
            let mut map = store.shops.write();
            for mut shop in shops {
                if shop.id == 0 {
                    shop.id = next_id(&map);
                }
                shop.tags = keyword::normalize_tags(&shop.tags);
                map.insert(shop.id, shop);
            }
        }
        store
    }

    fn open_shops<F>(&self, mut keep: F) -> Vec<Shop>
    where
        F: FnMut(&Shop) -> bool,
    {
        self.shops
            .read()
            .values()
            .filter(|s| !s.is_closed() && keep(s))
            .cloned()
            .collect()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn next_id(map: &BTreeMap<i64, Shop>) -> i64 {
    map.keys().next_back().copied().unwrap_or(0) + 1
}

#[async_trait]
impl ShopStore for InMemoryStore {
    async fn nearest_shops(&self, lat: f64, lon: f64, radius: &str) -> StoreResult<Vec<Shop>> {
        let metres = proximity::parse_radius(radius)?;
        let origin = Coord::new(lat, lon);
        if !origin.is_valid() {
            return Err(StoreError::validation(format!("invalid point ({lat}, {lon})")));
        }

        let mut found: Vec<Shop> = self
            .open_shops(|s| s.coord().is_some())
            .into_iter()
            .filter_map(|mut s| {
                let d = proximity::haversine_m(origin, s.coord()?);
                (d <= metres).then(|| {
                    s.distance = Some(d);
                    s
                })
            })
            .collect();
        found.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(Ordering::Equal));
        Ok(found)
    }

    async fn shops_with_keyword(&self, text: &str) -> StoreResult<Vec<Shop>> {
        let query = KeywordQuery::parse(text)?;
        Ok(self.open_shops(|s| query.matches(s)))
    }

    async fn adv_query(&self, query: &str) -> StoreResult<Vec<Shop>> {
        let query = AdvQuery::parse(query)?;
        let mut found = self.open_shops(|s| query.matches(s));
        found.sort_by_key(|s| std::cmp::Reverse(query.should_hits(s)));
        Ok(found)
    }

    async fn shop_by_id(&self, id: i64) -> StoreResult<Shop> {
        self.shops
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn shop_missing_info(&self) -> StoreResult<Vec<Shop>> {
        Ok(self.open_shops(|s| s.needs_geocode()))
    }

    async fn update_shop_info(&self, shops: &[Shop]) -> StoreResult<u64> {
        let mut map = self.shops.write();
        if let Some(missing) = shops.iter().find(|s| !map.contains_key(&s.id)) {
            return Err(StoreError::NotFound(missing.id));
        }
        for shop in shops {
            if let Some(stored) = map.get_mut(&shop.id) {
                stored.address = shop.address.clone();
                stored.location = shop.location.clone();
            }
        }
        Ok(shops.len() as u64)
    }

    async fn shop_count(&self) -> StoreResult<u64> {
        Ok(self.shops.read().len() as u64)
    }

    async fn districts(&self) -> StoreResult<Vec<String>> {
        let set: BTreeSet<String> = self
            .open_shops(|s| !s.district.trim().is_empty())
            .into_iter()
            .map(|s| s.district)
            .collect();
        Ok(set.into_iter().collect())
    }

    async fn suggest_keyword(&self, key: &str) -> StoreResult<Vec<String>> {
        let vocab: BTreeSet<String> = self
            .shops
            .read()
            .values()
            .flat_map(|s| s.tags.iter().cloned())
            .collect();
        Ok(keyword::suggest(key, vocab))
    }

    async fn insert_shop(&self, shop: &Shop) -> StoreResult<i64> {
        let mut map = self.shops.write();
        let id = next_id(&map);
        let mut stored = shop.clone();
        stored.id = id;
        stored.distance = None;
        stored.tags = keyword::normalize_tags(&shop.tags);
        map.insert(id, stored);
        Ok(id)
    }

    async fn set_status(&self, id: i64, status: ShopStatus) -> StoreResult<()> {
        match self.shops.write().get_mut(&id) {
            Some(shop) => {
                shop.status = status;
                Ok(())
            }
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn all_shops(&self) -> StoreResult<Vec<Shop>> {
        Ok(self.shops.read().values().cloned().collect())
    }

    fn tag_maintenance(&self) -> Option<&dyn TagMaintenance> {
        Some(self)
    }
}

#[async_trait]
impl TagMaintenance for InMemoryStore {
    async fn refresh_tags(&self) -> StoreResult<u64> {
        let mut tagged = 0;
        for shop in self.shops.write().values_mut() {
            if !shop.tags.is_empty() {
                continue;
            }
            let tags = keyword::default_tags(shop);
            if !tags.is_empty() {
                shop.tags = tags;
                tagged += 1;
            }
        }
        Ok(tagged)
    }
}
