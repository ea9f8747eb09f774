//! PostgreSQL + PostGIS [`ShopStore`].
//!
//! Locations are `geography(Point, 4326)` values, so radius search is an
//! indexed `ST_DWithin` with exact `ST_Distance` ordering. Tags are a
//! `TEXT[]` column with a GIN index. Keyword results are ranked with
//! `ts_rank` over the `simple` text search configuration.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use shopfinder_core::keyword::{self, KeywordQuery};
use shopfinder_core::models::{Coord, Location, Shop, ShopStatus};
use shopfinder_core::proximity;
use shopfinder_core::query::{AdvQuery, Field, Occur, Term};
use shopfinder_core::store::{ShopStore, TagMaintenance};
use shopfinder_core::{StoreError, StoreResult};

use crate::config::PostgisConfig;
use crate::db::{self, non_blank, store_err};
use crate::migrate;

const SHOP_COLUMNS: &str = r#"
    s.shop_id, s.name, s.type, s.district, s.address, s.url, s.notes,
    s.online, s.status, s.tags,
    ST_Y(s.geog::geometry) AS lat, ST_X(s.geog::geometry) AS lon
"#;

const SEARCH_DOCUMENT: &str =
    "to_tsvector('simple', s.name || ' ' || s.district || ' ' || s.type || ' ' || array_to_string(s.tags, ' '))";

/// PostGIS implementation of the [`ShopStore`] trait.
pub struct PostgisStore {
    pool: PgPool,
}

impl PostgisStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and create the schema (and the postgis extension) if needed.
    pub async fn open(config: &PostgisConfig) -> Result<Self> {
        let pool = db::connect_postgis(config).await?;
        migrate::migrate_postgis(&pool).await?;
        Ok(Self::new(pool))
    }

    async fn fetch(&self, mut qb: QueryBuilder<'_, Postgres>) -> StoreResult<Vec<Shop>> {
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(row_to_shop).collect()
    }
}

fn select_shops() -> QueryBuilder<'static, Postgres> {
    QueryBuilder::new(format!("SELECT {SHOP_COLUMNS} FROM shops s"))
}

fn row_to_shop(row: &PgRow) -> StoreResult<Shop> {
    let lat: Option<f64> = row.try_get("lat").map_err(store_err)?;
    let lon: Option<f64> = row.try_get("lon").map_err(store_err)?;
    let online: bool = row.try_get("online").map_err(store_err)?;
    let status: String = row.try_get("status").map_err(store_err)?;
    let tags: Vec<String> = row.try_get("tags").map_err(store_err)?;

    let location = match (lat, lon) {
        (Some(lat), Some(lon)) => Location::Coord(Coord::new(lat, lon)),
        _ if online => Location::Online,
        _ => Location::Missing,
    };

    Ok(Shop {
        id: row.try_get("shop_id").map_err(store_err)?,
        name: row.try_get("name").map_err(store_err)?,
        kind: row.try_get("type").map_err(store_err)?,
        district: row.try_get("district").map_err(store_err)?,
        address: row.try_get("address").map_err(store_err)?,
        url: row.try_get("url").map_err(store_err)?,
        notes: row.try_get("notes").map_err(store_err)?,
        tags: keyword::normalize_tags(&tags),
        location,
        status: status.parse().map_err(StoreError::Query)?,
        distance: row.try_get::<f64, _>("dist").ok(),
    })
}

fn push_term(qb: &mut QueryBuilder<'_, Postgres>, term: &Term) {
    let text = term.text.clone();
    match term.field {
        Field::Name => {
            qb.push("strpos(lower(s.name), ");
            qb.push_bind(text);
            qb.push(") > 0");
        }
        Field::District => {
            qb.push("lower(s.district) = ");
            qb.push_bind(text);
        }
        Field::Type => {
            qb.push("lower(s.type) = ");
            qb.push_bind(text);
        }
        Field::Tag => {
            qb.push_bind(text);
            qb.push(" = ANY(s.tags)");
        }
        Field::Any => {
            qb.push("(");
            qb.push_bind(text.clone());
            qb.push(" = ANY(s.tags) OR strpos(lower(s.name), ");
            qb.push_bind(text.clone());
            qb.push(") > 0 OR lower(s.district) = ");
            qb.push_bind(text.clone());
            qb.push(" OR lower(s.type) = ");
            qb.push_bind(text);
            qb.push(")");
        }
    }
}

fn coord_binds(shop: &Shop) -> (Option<f64>, Option<f64>) {
    match shop.coord() {
        Some(c) => (Some(c.lat), Some(c.lon)),
        None => (None, None),
    }
}

#[async_trait]
impl ShopStore for PostgisStore {
    async fn nearest_shops(&self, lat: f64, lon: f64, radius: &str) -> StoreResult<Vec<Shop>> {
        let metres = proximity::parse_radius(radius)?;
        if !Coord::new(lat, lon).is_valid() {
            return Err(StoreError::validation(format!("invalid point ({lat}, {lon})")));
        }

        let sql = format!(
            r#"
            SELECT {SHOP_COLUMNS}, ST_Distance(s.geog, p.pt) AS dist
            FROM shops s,
                 (SELECT ST_SetSRID(ST_MakePoint($1, $2), 4326)::geography AS pt) p
            WHERE s.status <> 'closed'
              AND s.geog IS NOT NULL
              AND ST_DWithin(s.geog, p.pt, $3)
            ORDER BY dist
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(lon)
            .bind(lat)
            .bind(metres)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(row_to_shop).collect()
    }

    async fn shops_with_keyword(&self, text: &str) -> StoreResult<Vec<Shop>> {
        let query = KeywordQuery::parse(text)?;

        let mut qb = select_shops();
        qb.push(" WHERE s.status <> 'closed' AND (s.address IS NOT NULL OR s.url IS NOT NULL) AND ");
        match &query {
            KeywordQuery::Single(term) => {
                qb.push("(");
                qb.push_bind(term.clone());
                qb.push(" = ANY(s.tags) OR lower(s.district) = ");
                qb.push_bind(term.clone());
                qb.push(" OR strpos(lower(s.name), ");
                qb.push_bind(term.clone());
                qb.push(") > 0)");
            }
            KeywordQuery::AllTags(terms) => {
                qb.push("s.tags @> ");
                qb.push_bind(terms.clone());
                qb.push("::text[]");
            }
        }

        let rank_text = match &query {
            KeywordQuery::Single(term) => term.clone(),
            KeywordQuery::AllTags(terms) => terms.join(" "),
        };
        qb.push(format!(" ORDER BY ts_rank({SEARCH_DOCUMENT}, plainto_tsquery('simple', "));
        qb.push_bind(rank_text);
        qb.push(")) DESC, s.shop_id");
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
            qb.push(")::int");
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
        qb.push(" WHERE s.geog IS NULL AND NOT s.online AND s.status <> 'closed' ORDER BY s.shop_id");
        self.fetch(qb).await
    }

    async fn update_shop_info(&self, shops: &[Shop]) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        for shop in shops {
            let (lat, lon) = coord_binds(shop);
            let result = sqlx::query(
                r#"
                UPDATE shops
                SET address = $1,
                    geog = ST_SetSRID(ST_MakePoint($2::float8, $3::float8), 4326)::geography,
                    online = $4
                WHERE shop_id = $5
                "#,
            )
            .bind(non_blank(&shop.address))
            .bind(lon)
            .bind(lat)
            .bind(shop.location == Location::Online)
            .bind(shop.id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

            if result.rows_affected() == 0 {
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
        let mut districts = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT district FROM shops WHERE status <> 'closed' AND district <> ''",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        // byte order, independent of the database collation
        districts.sort();
        Ok(districts)
    }

    async fn suggest_keyword(&self, key: &str) -> StoreResult<Vec<String>> {
        let vocab: Vec<String> = sqlx::query_scalar("SELECT DISTINCT unnest(tags) FROM shops")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(keyword::suggest(key, vocab))
    }

    async fn insert_shop(&self, shop: &Shop) -> StoreResult<i64> {
        let (lat, lon) = coord_binds(shop);
        sqlx::query_scalar(
            r#"
            INSERT INTO shops (name, type, district, address, url, notes, geog, online, status, tags)
            VALUES ($1, $2, $3, $4, $5, $6,
                    ST_SetSRID(ST_MakePoint($7::float8, $8::float8), 4326)::geography,
                    $9, $10, $11)
            RETURNING shop_id
            "#,
        )
        .bind(&shop.name)
        .bind(&shop.kind)
        .bind(&shop.district)
        .bind(non_blank(&shop.address))
        .bind(non_blank(&shop.url))
        .bind(non_blank(&shop.notes))
        .bind(lon)
        .bind(lat)
        .bind(shop.location == Location::Online)
        .bind(shop.status.as_str())
        .bind(keyword::normalize_tags(&shop.tags))
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)
    }

    async fn set_status(&self, id: i64, status: ShopStatus) -> StoreResult<()> {
        let result = sqlx::query("UPDATE shops SET status = $1 WHERE shop_id = $2")
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
impl TagMaintenance for PostgisStore {
    async fn refresh_tags(&self) -> StoreResult<u64> {
        let mut qb = select_shops();
        qb.push(" WHERE cardinality(s.tags) = 0");
        let untagged = self.fetch(qb).await?;

        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let mut tagged = 0;
        for shop in &untagged {
            let tags = keyword::default_tags(shop);
            if tags.is_empty() {
                continue;
            }
            sqlx::query("UPDATE shops SET tags = $1 WHERE shop_id = $2")
                .bind(tags)
                .bind(shop.id)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
            tagged += 1;
        }
        tx.commit().await.map_err(store_err)?;
        Ok(tagged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unqualified_term_checks_every_field() {
        let mut qb = select_shops();
        let term = Term {
            field: Field::Any,
            text: "咖啡".into(),
        };
        push_term(&mut qb, &term);
        let sql = qb.sql();
        assert!(sql.contains("$1 = ANY(s.tags)"));
        assert!(sql.contains("strpos(lower(s.name), $2) > 0"));
        assert!(sql.contains("lower(s.district) = $3"));
        assert!(sql.contains("lower(s.type) = $4"));
    }

    #[test]
    fn missing_coordinates_bind_as_null() {
        let shop = Shop::new("a", "b", "c");
        assert_eq!(coord_binds(&shop), (None, None));
        let mut located = shop.clone();
        located.location = Location::Coord(Coord::new(22.3, 114.2));
        assert_eq!(coord_binds(&located), (Some(22.3), Some(114.2)));
    }
}
