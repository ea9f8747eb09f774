//! Backend selection and bulk copy between backends.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use shopfinder_core::models::Shop;
use shopfinder_core::store::ShopStore;

use crate::config::{BackendKind, Config};
use crate::postgis_store::PostgisStore;
use crate::sqlite_store::SqliteStore;
use crate::tantivy_store::TantivyStore;

/// Open the backend named by `[backend] kind`, creating its schema or
/// index if needed.
pub async fn open_backend(config: &Config) -> Result<Arc<dyn ShopStore>> {
    let store: Arc<dyn ShopStore> = match config.backend.kind {
        BackendKind::Sqlite => {
            let sqlite = config
                .sqlite
                .as_ref()
                .context("backend.kind is 'sqlite' but [sqlite] is missing")?;
            Arc::new(SqliteStore::open(&sqlite.path).await?)
        }
        BackendKind::Postgis => {
            let postgis = config
                .postgis
                .as_ref()
                .context("backend.kind is 'postgis' but [postgis] is missing")?;
            Arc::new(PostgisStore::open(postgis).await?)
        }
        BackendKind::Tantivy => {
            let tantivy = config
                .tantivy
                .as_ref()
                .context("backend.kind is 'tantivy' but [tantivy] is missing")?;
            let path = tantivy.path.clone();
            let store = tokio::task::spawn_blocking(move || TantivyStore::open(&path)).await??;
            Arc::new(store)
        }
    };
    info!(backend = ?config.backend.kind, "backend opened");
    Ok(store)
}

/// Read a JSON array of shops from `path` and insert each one.
///
/// Ids in the file are ignored; the backend assigns new ones. Returns the
/// assigned ids in file order.
pub async fn import_shops(store: &dyn ShopStore, path: &Path) -> Result<Vec<i64>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let shops: Vec<Shop> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse shops from {}", path.display()))?;

    let mut ids = Vec::with_capacity(shops.len());
    for shop in &shops {
        if shop.name.trim().is_empty() {
            anyhow::bail!("shop #{} in {} has no name", ids.len() + 1, path.display());
        }
        ids.push(store.insert_shop(shop).await?);
    }
    info!(count = ids.len(), path = %path.display(), "shops imported");
    Ok(ids)
}

/// Copy every shop from `source` into the tantivy index at `dir`, keeping
/// ids. Existing documents with the same ids are replaced.
pub async fn migrate_index(source: &dyn ShopStore, dir: &Path) -> Result<u64> {
    let shops = source.all_shops().await?;
    let dir = dir.to_path_buf();
    let index = tokio::task::spawn_blocking(move || TantivyStore::open(&dir)).await??;
    let copied = index.load(shops).await?;
    index.close().await;
    info!(copied, "shops copied into search index");
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shopfinder_core::store::memory::InMemoryStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn import_assigns_fresh_ids() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("shops.json");
        std::fs::write(
            &path,
            r#"[
                {"id": 40, "name": "Kiss Cafe", "type": "咖啡", "district": "中環", "tags": ["咖啡"]},
                {"name": "Zine Shop", "type": "書店", "district": "網店", "location": "online"}
            ]"#,
        )
        .unwrap();

        let store = InMemoryStore::new();
        let ids = import_shops(&store, &path).await.unwrap();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(store.shop_by_id(1).await.unwrap().name, "Kiss Cafe");
    }

    #[tokio::test]
    async fn import_rejects_nameless_shop() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("shops.json");
        std::fs::write(&path, r#"[{"name": " ", "type": "咖啡", "district": "中環"}]"#).unwrap();

        let store = InMemoryStore::new();
        assert!(import_shops(&store, &path).await.is_err());
        assert_eq!(store.shop_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn migrate_index_copies_everything() {
        let tmp = TempDir::new().unwrap();
        let mut a = Shop::new("a", "咖啡", "中環");
        a.id = 3;
        let mut b = Shop::new("b", "書店", "旺角");
        b.id = 8;
        let source = InMemoryStore::with_shops([a, b]);

        let copied = migrate_index(&source, tmp.path()).await.unwrap();
        assert_eq!(copied, 2);

        let index = TantivyStore::open(tmp.path()).unwrap();
        assert_eq!(index.shop_by_id(8).await.unwrap().name, "b");
    }
}
