//! Schema creation for the SQL backends. Every statement is idempotent.

use anyhow::Result;
use sqlx::{PgPool, SqlitePool};

pub async fn migrate_sqlite(pool: &SqlitePool) -> Result<()> {
    // Create shops table. The *_key columns hold Unicode-lowercased copies,
    // since SQLite's lower() only folds ASCII.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS shops (
            shop_id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            type TEXT NOT NULL,
            district TEXT NOT NULL DEFAULT '',
            address TEXT,
            url TEXT,
            notes TEXT,
            geohash TEXT,
            name_key TEXT NOT NULL DEFAULT '',
            type_key TEXT NOT NULL DEFAULT '',
            district_key TEXT NOT NULL DEFAULT '',
            online INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'open'
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Proximity search matches on the 7-character prefix
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_shops_geohash7 ON shops(substr(geohash, 1, 7))",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS shop_tags (
            shop_id INTEGER NOT NULL,
            tag TEXT NOT NULL,
            PRIMARY KEY (shop_id, tag),
            FOREIGN KEY (shop_id) REFERENCES shops(shop_id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_shop_tags_tag ON shop_tags(tag)")
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn migrate_postgis(pool: &PgPool) -> Result<()> {
    sqlx::query("CREATE EXTENSION IF NOT EXISTS postgis")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS shops (
            shop_id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL,
            type TEXT NOT NULL,
            district TEXT NOT NULL DEFAULT '',
            address TEXT,
            url TEXT,
            notes TEXT,
            geog geography(Point, 4326),
            online BOOLEAN NOT NULL DEFAULT FALSE,
            status TEXT NOT NULL DEFAULT 'open',
            tags TEXT[] NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_shops_geog ON shops USING GIST (geog)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_shops_tags ON shops USING GIN (tags)")
        .execute(pool)
        .await?;

    Ok(())
}
