//! CLI command implementations.
//!
//! Each `run_*` function opens the configured backend, does one thing,
//! closes the backend whether or not that worked, and prints a
//! human-readable result to stdout. Progress and warnings go
//! through `tracing` to stderr.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use shopfinder_core::models::{Location, Shop};

use crate::backend::{self, open_backend};
use crate::config::Config;
use crate::enrich::Enricher;
use crate::geocode::create_geocoder;

pub async fn run_init(config: &Config) -> Result<()> {
    let store = open_backend(config).await?;
    store.close().await;
    println!("Backend initialized successfully.");
    Ok(())
}

pub async fn run_import(config: &Config, path: &Path) -> Result<()> {
    let store = open_backend(config).await?;
    let result = backend::import_shops(store.as_ref(), path).await;
    store.close().await;
    println!("Imported {} shops.", result?.len());
    Ok(())
}

pub async fn run_nearest(config: &Config, lat: f64, lon: f64, radius: &str) -> Result<()> {
    let store = open_backend(config).await?;
    let result = store.nearest_shops(lat, lon, radius).await;
    store.close().await;
    print_shops(&result?);
    Ok(())
}

pub async fn run_search(config: &Config, text: &str) -> Result<()> {
    let store = open_backend(config).await?;
    let result = store.shops_with_keyword(text).await;
    store.close().await;
    print_shops(&result?);
    Ok(())
}

pub async fn run_query(config: &Config, expr: &str) -> Result<()> {
    let store = open_backend(config).await?;
    let result = store.adv_query(expr).await;
    store.close().await;
    print_shops(&result?);
    Ok(())
}

pub async fn run_get(config: &Config, id: i64) -> Result<()> {
    let store = open_backend(config).await?;
    let result = store.shop_by_id(id).await;
    store.close().await;
    let shop = result?;

    println!("--- Shop ---");
    println!("id:         {}", shop.id);
    println!("name:       {}", shop.name);
    println!("type:       {}", shop.kind);
    println!("district:   {}", shop.district);
    println!("status:     {}", shop.status);
    if let Some(address) = &shop.address {
        println!("address:    {}", address);
    }
    if let Some(url) = &shop.url {
        println!("url:        {}", url);
    }
    println!("location:   {}", describe_location(&shop.location));
    if !shop.tags.is_empty() {
        println!("tags:       {}", shop.tags.join(" "));
    }
    if let Some(notes) = &shop.notes {
        println!();
        println!("{}", notes);
    }
    Ok(())
}

pub async fn run_suggest(config: &Config, key: &str) -> Result<()> {
    let store = open_backend(config).await?;
    let result = store.suggest_keyword(key).await;
    store.close().await;
    let suggestions = result?;
    if suggestions.is_empty() {
        println!("No suggestions.");
    }
    for s in suggestions {
        println!("{}", s);
    }
    Ok(())
}

pub async fn run_districts(config: &Config) -> Result<()> {
    let store = open_backend(config).await?;
    let result = store.districts().await;
    store.close().await;
    for d in result? {
        println!("{}", d);
    }
    Ok(())
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let store = open_backend(config).await?;
    let counts: Result<(u64, usize, usize)> = async {
        Ok((
            store.shop_count().await?,
            store.shop_missing_info().await?.len(),
            store.districts().await?.len(),
        ))
    }
    .await;
    store.close().await;
    let (total, missing, districts) = counts?;

    println!("Shopfinder backend stats");
    println!("========================");
    println!();
    println!("  Backend:        {:?}", config.backend.kind);
    println!("  Shops:          {}", total);
    println!("  Missing info:   {}", missing);
    println!("  Districts:      {}", districts);
    Ok(())
}

pub async fn run_fill_info(config: &Config) -> Result<()> {
    let geocoder = create_geocoder(&config.geocoder)?;
    let store = open_backend(config).await?;
    tracing::info!(geocoder = geocoder.name(), "filling missing shop info");

    let enricher = Enricher::new(Arc::clone(&store), geocoder, &config.enrich);
    let finished = match enricher.start() {
        Ok(mut run) => {
            while let Some(err) = run.next_error().await {
                eprintln!("  ! {}", err);
            }
            run.finish().await
        }
        Err(e) => Err(e.into()),
    };
    store.close().await;
    let (report, _) = finished?;

    println!(
        "Geocoded {} of {} shops ({} failed), retagged {}.",
        report.written, report.candidates, report.failed, report.tagged
    );
    // Failed items do not fail the run.
    if let Err(e) = report.check() {
        tracing::warn!(error = %e, "some shops were not enriched");
    }
    Ok(())
}

pub async fn run_migrate_index(config: &Config, dir: &Path) -> Result<()> {
    let store = open_backend(config).await?;
    let result = backend::migrate_index(store.as_ref(), dir).await;
    store.close().await;
    println!("Copied {} shops into {}.", result?, dir.display());
    Ok(())
}

fn print_shops(shops: &[Shop]) {
    if shops.is_empty() {
        println!("No results.");
        return;
    }
    for (i, shop) in shops.iter().enumerate() {
        match shop.distance {
            Some(d) => println!("{}. [{:.0}m] {} ({})", i + 1, d, shop.name, shop.district),
            None => println!("{}. {} ({})", i + 1, shop.name, shop.district),
        }
        if let Some(address) = &shop.address {
            println!("    {}", address);
        }
        println!("    id: {}", shop.id);
    }
}

fn describe_location(location: &Location) -> String {
    match location {
        Location::Missing => "missing".to_string(),
        Location::Online => "online only".to_string(),
        other => match other.to_coord() {
            Some(c) => format!("{:.6}, {:.6}", c.lat, c.lon),
            None => "invalid".to_string(),
        },
    }
}
