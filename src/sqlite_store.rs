//! SQLite-backed [`ShopStore`] with manually indexed geohashes.
//!
//! Locations are stored as 12-character geohashes. Radius search has no
//! spatial index to lean on, so it expands the query point into the
//! 1/9/25-cell set from [`proximity::area`] and matches rows on their
//! 7-character prefix. Rows are not filtered by exact distance: a shop just
//! across a cell edge can come back even if it is slightly outside the
//! radius. Results are unordered within the covered cells, but each shop's
//! `distance` is filled in.
//!
//! Tags live in a `shop_tags` side table.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use shopfinder_core::keyword::{self, KeywordQuery};
use shopfinder_core::models::{Coord, Location, Shop, ShopStatus};
use shopfinder_core::proximity::{self, PRECISION};
use shopfinder_core::query::{AdvQuery, Field, Occur, Term};
use shopfinder_core::store::{ShopStore, TagMaintenance};
use shopfinder_core::{StoreError, StoreResult};

use crate::db::{self, non_blank, store_err};
use crate::migrate;

const TAG_SEPARATOR: char = '\u{1f}';

const SELECT_SHOPS: &str = r#"
    SELECT s.shop_id, s.name, s.type, s.district, s.address, s.url, s.notes,
           s.geohash, s.online, s.status,
           (SELECT group_concat(t.tag, char(31)) FROM shop_tags t
             WHERE t.shop_id = s.shop_id) AS tags
    FROM shops s
"#;

/// SQLite implementation of the [`ShopStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the database at `path`, creating the schema if needed.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect_sqlite(path).await?;
        migrate::migrate_sqlite(&pool).await?;
        Ok(Self::new(pool))
    }

    async fn fetch(&self, mut qb: QueryBuilder<'_, Sqlite>) -> StoreResult<Vec<Shop>> {
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(row_to_shop).collect()
    }
}

fn row_to_shop(row: &SqliteRow) -> StoreResult<Shop> {
    let geohash: Option<String> = row.try_get("geohash").map_err(store_err)?;
    let online: bool = row.try_get("online").map_err(store_err)?;
    let status: String = row.try_get("status").map_err(store_err)?;
    let tags: Option<String> = row.try_get("tags").map_err(store_err)?;

    let location = match Location::from_geohash(geohash.as_deref()) {
        Location::Missing if online => Location::Online,
        other => other,
    };

    Ok(Shop {
        id: row.try_get("shop_id").map_err(store_err)?,
        name: row.try_get("name").map_err(store_err)?,
        kind: row.try_get("type").map_err(store_err)?,
        district: row.try_get("district").map_err(store_err)?,
        address: row.try_get("address").map_err(store_err)?,
        url: row.try_get("url").map_err(store_err)?,
        notes: row.try_get("notes").map_err(store_err)?,
        tags: keyword::normalize_tags(tags.as_deref().unwrap_or("").split(TAG_SEPARATOR)),
        location,
        status: status.parse().map_err(StoreError::Query)?,
        distance: None,
    })
}

fn select_shops() -> QueryBuilder<'static, Sqlite> {
    QueryBuilder::new(SELECT_SHOPS)
}

fn push_tag_exists(qb: &mut QueryBuilder<'_, Sqlite>, tag: &str) {
    qb.push("EXISTS (SELECT 1 FROM shop_tags t WHERE t.shop_id = s.shop_id AND t.tag = ");
    qb.push_bind(tag.to_string());
    qb.push(")");
}

fn push_term(qb: &mut QueryBuilder<'_, Sqlite>, term: &Term) {
    let text = term.text.clone();
    match term.field {
        Field::Name => {
            qb.push("instr(s.name_key, ");
            qb.push_bind(text);
            qb.push(") > 0");
        }
        Field::District => {
            qb.push("s.district_key = ");
            qb.push_bind(text);
        }
        Field::Type => {
            qb.push("s.type_key = ");
            qb.push_bind(text);
        }
        Field::Tag => push_tag_exists(qb, &text),
        Field::Any => {
            qb.push("(");
            push_tag_exists(qb, &text);
            qb.push(" OR instr(s.name_key, ");
            qb.push_bind(text.clone());
            qb.push(") > 0 OR s.district_key = ");
            qb.push_bind(text.clone());
            qb.push(" OR s.type_key = ");
            qb.push_bind(text);
            qb.push(")");
        }
    }
}

async fn replace_tags(
    conn: &mut sqlx::SqliteConnection,
    shop_id: i64,
    tags: &[String],
) -> StoreResult<()> {
    sqlx::query("DELETE FROM shop_tags WHERE shop_id = ?")
        .bind(shop_id)
        .execute(&mut *conn)
        .await
        .map_err(store_err)?;
    for tag in keyword::normalize_tags(tags) {
        sqlx::query("INSERT OR IGNORE INTO shop_tags (shop_id, tag) VALUES (?, ?)")
            .bind(shop_id)
            .bind(tag)
            .execute(&mut *conn)
            .await
            .map_err(store_err)?;
    }
    Ok(())
}

#[async_trait]
impl ShopStore for SqliteStore {
    async fn nearest_shops(&self, lat: f64, lon: f64, radius: &str) -> StoreResult<Vec<Shop>> {
        let cells = proximity::area(lat, lon, radius)?;
        debug!(cells = cells.len(), radius, "geohash proximity search");

        let mut qb = select_shops();
        qb.push(format!(
            " WHERE s.status <> 'closed' AND s.geohash IS NOT NULL AND substr(s.geohash, 1, {PRECISION}) IN ("
        ));
        let mut list = qb.separated(", ");
        for cell in cells {
            list.push_bind(cell);
        }
        list.push_unseparated(") ORDER BY s.geohash");

        let origin = Coord::new(lat, lon);
        let mut shops = self.fetch(qb).await?;
        for shop in &mut shops {
            shop.distance = shop.coord().map(|c| proximity::haversine_m(origin, c));
        }
        Ok(shops)
    }

    async fn shops_with_keyword(&self, text: &str) -> StoreResult<Vec<Shop>> {
        let query = KeywordQuery::parse(text)?;

        let mut qb = select_shops();
        qb.push(
            " WHERE s.status <> 'closed' AND (s.address IS NOT NULL OR s.url IS NOT NULL) AND ",
        );
        match &query {
            KeywordQuery::Single(term) => {
                qb.push("(");
                push_tag_exists(&mut qb, term);
                qb.push(" OR s.district_key = ");
                qb.push_bind(term.clone());
                qb.push(" OR instr(s.name_key, ");
                qb.push_bind(term.clone());
                qb.push(") > 0)");
            }
            KeywordQuery::AllTags(terms) => {
                let mut first = true;
                for term in terms {
                    if !first {
                        qb.push(" AND ");
                    }
                    first = false;
                    push_tag_exists(&mut qb, term);
                }
            }
        }
        qb.push(" ORDER BY s.shop_id");
        self.fetch(qb).await
    }

    async fn adv_query(&self, query: &str) -> StoreResult<Vec<Shop>> {
        let query = AdvQuery::parse(query)?;

        let mut qb = select_shops();
        qb.push(" WHERE s.status <> 'closed'");
        for clause in query.clauses() {
            match clause.occur {
                Occur::Must => {
                    qb.push(" AND ");
                    push_term(&mut qb, &clause.term);
                }
                Occur::MustNot => {
                    qb.push(" AND NOT ");
                    push_term(&mut qb, &clause.term);
                }
                Occur::Should => {}
            }
        }

        qb.push(" ORDER BY (0");
        for term in query.terms(Occur::Should) {
            qb.push(" + (");
            push_term(&mut qb, term);
            qb.push(")");
        }
        qb.push(") DESC, s.shop_id");
        self.fetch(qb).await
    }

    async fn shop_by_id(&self, id: i64) -> StoreResult<Shop> {
        let mut qb = select_shops();
        qb.push(" WHERE s.shop_id = ");
        qb.push_bind(id);
        self.fetch(qb)
            .await?
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound(id))
    }

    async fn shop_missing_info(&self) -> StoreResult<Vec<Shop>> {
        let mut qb = select_shops();
        qb.push(
            " WHERE s.geohash IS NULL AND s.online = 0 AND s.status <> 'closed' ORDER BY s.shop_id",
        );
        self.fetch(qb).await
    }

    async fn update_shop_info(&self, shops: &[Shop]) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        for shop in shops {
            let result = sqlx::query(
                "UPDATE shops SET address = ?, geohash = ?, online = ? WHERE shop_id = ?",
            )
            .bind(non_blank(&shop.address))
            .bind(shop.stored_geohash())
            .bind(shop.location == Location::Online)
            .bind(shop.id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

            if result.rows_affected() == 0 {
                // dropping the transaction rolls back earlier rows
                return Err(StoreError::NotFound(shop.id));
            }
        }

        tx.commit().await.map_err(store_err)?;
        Ok(shops.len() as u64)
    }

    async fn shop_count(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM shops")
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(count as u64)
    }

    async fn districts(&self) -> StoreResult<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT district FROM shops WHERE status <> 'closed' AND district <> '' ORDER BY district",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)
    }

    async fn suggest_keyword(&self, key: &str) -> StoreResult<Vec<String>> {
        let vocab: Vec<String> = sqlx::query_scalar("SELECT DISTINCT tag FROM shop_tags")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(keyword::suggest(key, vocab))
    }

    async fn insert_shop(&self, shop: &Shop) -> StoreResult<i64> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let result = sqlx::query(
            r#"
            INSERT INTO shops (name, type, district, address, url, notes, geohash,
                               name_key, type_key, district_key, online, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&shop.name)
        .bind(&shop.kind)
        .bind(&shop.district)
        .bind(non_blank(&shop.address))
        .bind(non_blank(&shop.url))
        .bind(non_blank(&shop.notes))
        .bind(shop.stored_geohash())
        .bind(shop.name.to_lowercase())
        .bind(shop.kind.to_lowercase())
        .bind(shop.district.to_lowercase())
        .bind(shop.location == Location::Online)
        .bind(shop.status.as_str())
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        let id = result.last_insert_rowid();
        replace_tags(&mut tx, id, &shop.tags).await?;
        tx.commit().await.map_err(store_err)?;
        Ok(id)
    }

    async fn set_status(&self, id: i64, status: ShopStatus) -> StoreResult<()> {
        let result = sqlx::query("UPDATE shops SET status = ? WHERE shop_id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn all_shops(&self) -> StoreResult<Vec<Shop>> {
        let mut qb = select_shops();
        qb.push(" ORDER BY s.shop_id");
        self.fetch(qb).await
    }

    fn tag_maintenance(&self) -> Option<&dyn TagMaintenance> {
        Some(self)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl TagMaintenance for SqliteStore {
    async fn refresh_tags(&self) -> StoreResult<u64> {
        let mut qb = select_shops();
        qb.push(" WHERE NOT EXISTS (SELECT 1 FROM shop_tags t WHERE t.shop_id = s.shop_id)");
        let untagged = self.fetch(qb).await?;

        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let mut tagged = 0;
        for shop in &untagged {
            let tags = keyword::default_tags(shop);
            if tags.is_empty() {
                continue;
            }
            replace_tags(&mut tx, shop.id, &tags).await?;
            tagged += 1;
        }
        tx.commit().await.map_err(store_err)?;
        Ok(tagged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shopfinder_core::geohash::{self, Direction};
    use tempfile::TempDir;

    async fn store(tmp: &TempDir) -> SqliteStore {
        SqliteStore::open(&tmp.path().join("shops.sqlite"))
            .await
            .unwrap()
    }

    fn located(name: &str, hash: &str) -> Shop {
        let mut shop = Shop::new(name, "咖啡", "中環");
        shop.address = Some("1 Queen's Road".into());
        shop.location = Location::Geohash(hash.into());
        shop
    }

    #[tokio::test]
    async fn insert_and_read_back() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;

        let mut shop = located("Kiss Cafe", "wecnvgmrs4qd");
        shop.tags = vec!["Coffee".into(), "咖啡".into()];
        shop.url = Some("  ".into());
        let id = store.insert_shop(&shop).await.unwrap();

        let got = store.shop_by_id(id).await.unwrap();
        assert_eq!(got.name, "Kiss Cafe");
        assert_eq!(got.tags, vec!["coffee", "咖啡"]);
        assert_eq!(got.url, None);
        assert_eq!(got.location, Location::Geohash("wecnvgmrs4qd".into()));
        assert!(matches!(
            store.shop_by_id(id + 1).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn online_shops_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let mut shop = Shop::new("Zine Online", "書店", "");
        shop.location = Location::Online;
        let id = store.insert_shop(&shop).await.unwrap();
        assert_eq!(store.shop_by_id(id).await.unwrap().location, Location::Online);
        assert!(store.shop_missing_info().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn nearest_matches_cell_prefix_without_exact_filter() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let center = "wecpk8t";
        let neighbor = geohash::neighbor(center, Direction::East).unwrap();

        store.insert_shop(&located("here", &format!("{center}zzzzz"))).await.unwrap();
        store.insert_shop(&located("next door", &format!("{neighbor}00000"))).await.unwrap();
        let mut closed = located("closed", &format!("{center}00000"));
        closed.status = ShopStatus::Closed;
        store.insert_shop(&closed).await.unwrap();

        let c = geohash::decode(center).unwrap();

        let one = store.nearest_shops(c.lat, c.lon, "70m").await.unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].name, "here");
        assert!(one[0].distance.is_some());

        let nine = store.nearest_shops(c.lat, c.lon, "150m").await.unwrap();
        let mut names: Vec<_> = nine.iter().map(|s| s.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["here", "next door"]);
    }

    #[tokio::test]
    async fn failed_batch_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let id = store.insert_shop(&Shop::new("a", "咖啡", "中環")).await.unwrap();

        let mut ok = store.shop_by_id(id).await.unwrap();
        ok.address = Some("somewhere".into());
        ok.location = Location::Coord(Coord::new(22.28, 114.15));
        let mut ghost = ok.clone();
        ghost.id = 4242;

        let err = store.update_shop_info(&[ok.clone(), ghost]).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(4242)));
        assert_eq!(store.shop_by_id(id).await.unwrap().location, Location::Missing);

        assert_eq!(store.update_shop_info(&[ok]).await.unwrap(), 1);
        let got = store.shop_by_id(id).await.unwrap();
        assert!(got.location.has_physical_location());
        assert_eq!(got.address.as_deref(), Some("somewhere"));
    }

    #[tokio::test]
    async fn refresh_tags_fills_untagged_shops() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp).await;
        let id = store.insert_shop(&Shop::new("a", "Bakery", "西環")).await.unwrap();
        let tagged = store.tag_maintenance().unwrap().refresh_tags().await.unwrap();
        assert_eq!(tagged, 1);
        assert_eq!(store.shop_by_id(id).await.unwrap().tags, vec!["bakery", "西環"]);
        assert_eq!(store.tag_maintenance().unwrap().refresh_tags().await.unwrap(), 0);
    }
}
