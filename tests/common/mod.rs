//! Shared fixture: ten Hong Kong shops covering every location and listing
//! state, inserted in order so they get ids 1 to 10.

#![allow(dead_code)]

use shopfinder_core::models::{Coord, Location, Shop, ShopStatus};
use shopfinder_core::store::ShopStore;

/// Query point in Central.
pub const ORIGIN: (f64, f64) = (22.2819, 114.1582);

fn shop(
    name: &str,
    kind: &str,
    district: &str,
    tags: &[&str],
    location: Location,
) -> Shop {
    let mut s = Shop::new(name, kind, district);
    s.address = Some(format!("{district} street"));
    s.tags = tags.iter().map(|t| t.to_string()).collect();
    s.location = location;
    s
}

fn at(lat: f64, lon: f64) -> Location {
    Location::Coord(Coord::new(lat, lon))
}

pub fn fixture() -> Vec<Shop> {
    let mut zine = shop("Zine Shop", "書店", "網店", &["書店", "獨立"], Location::Online);
    zine.address = None;
    zine.url = Some("https://zine.example".into());

    let mut closed = shop("Closed Cafe", "咖啡", "中環", &["咖啡"], at(22.2821, 114.1580));
    closed.status = ShopStatus::Closed;

    let mut ghost = shop("Ghost Books", "書店", "旺角", &["書店"], Location::Missing);
    ghost.address = None;

    let mut corner = shop("咖啡 Corner", "咖啡", "網店", &[], Location::Online);
    corner.address = None;
    corner.url = Some("https://corner.example".into());

    vec![
        // 1: ~5 m from ORIGIN
        shop("Kiss Cafe", "咖啡", "中環", &["咖啡", "甜品"], at(22.28195, 114.15825)),
        // 2: ~1.6 km
        shop("白宮咖啡廳", "茶餐廳", "灣仔", &["港式"], at(22.2770, 114.1730)),
        // 3
        zine,
        // 4: ~0.9 km
        shop("侘寂珈琲 WabiSabi", "咖啡", "上環", &["咖啡"], at(22.2855, 114.1500)),
        // 5
        closed,
        // 6: unlisted, never geocoded
        ghost,
        // 7: listed, never geocoded
        shop("旺角咖啡室", "咖啡", "旺角", &[], Location::Missing),
        // 8: ~110 m
        shop("Tea House", "茶", "中環", &["茶", "甜品"], at(22.2825, 114.1590)),
        // 9: ~4.3 km
        shop("Mong Kok Bakery", "麵包", "旺角", &["麵包", "甜品"], at(22.3190, 114.1700)),
        // 10
        corner,
    ]
}

/// Insert the fixture; panics unless ids come back as 1..=10.
pub async fn seed(store: &dyn ShopStore) {
    for (i, s) in fixture().iter().enumerate() {
        let id = store.insert_shop(s).await.unwrap();
        assert_eq!(id, i as i64 + 1, "fixture ids must be sequential");
    }
}

pub fn ids(shops: &[Shop]) -> Vec<i64> {
    shops.iter().map(|s| s.id).collect()
}

pub fn sorted_ids(shops: &[Shop]) -> Vec<i64> {
    let mut ids = ids(shops);
    ids.sort();
    ids
}
