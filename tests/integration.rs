//! The `shopfinder` binary end to end on SQLite and tantivy.

mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn shopfinder_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_shopfinder"))
}

fn write_config(root: &Path, name: &str, backend: &str) -> PathBuf {
    let config_content = format!(
        r#"[backend]
kind = "{backend}"

[sqlite]
path = "{root}/data/shops.sqlite"

[tantivy]
path = "{root}/data/index"

[geocoder]
provider = "disabled"

[server]
bind = "127.0.0.1:7399"
"#,
        root = root.display()
    );
    let config_path = root.join(name);
    fs::write(&config_path, config_content).unwrap();
    config_path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    fs::write(
        root.join("shops.json"),
        serde_json::to_string_pretty(&common::fixture()).unwrap(),
    )
    .unwrap();

    let config_path = write_config(&root, "shopfinder.toml", "sqlite");
    (tmp, config_path)
}

fn run_shopfinder(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = shopfinder_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run shopfinder binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn import_fixture(tmp: &TempDir, config_path: &Path) {
    let json = tmp.path().join("shops.json");
    let (stdout, stderr, success) = run_shopfinder(config_path, &["import", json.to_str().unwrap()]);
    assert!(success, "import failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Imported 10 shops"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_shopfinder(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, success) = run_shopfinder(&config_path, &["init"]);
    assert!(success, "Second init failed (not idempotent)");
}

#[test]
fn test_import_and_search() {
    let (tmp, config_path) = setup_test_env();
    import_fixture(&tmp, &config_path);

    let (stdout, _, success) = run_shopfinder(&config_path, &["search", "咖啡"]);
    assert!(success);
    assert!(stdout.contains("Kiss Cafe"));
    assert!(stdout.contains("旺角咖啡室"));
    assert!(!stdout.contains("Closed Cafe"));

    let (stdout, _, _) = run_shopfinder(&config_path, &["search", "沒有"]);
    assert!(stdout.contains("No results."));

    let (stdout, _, success) = run_shopfinder(
        &config_path,
        &["nearest", "22.2819", "114.1582", "--radius", "150m"],
    );
    assert!(success);
    assert!(stdout.contains("Kiss Cafe"));
    assert!(stdout.contains("Tea House"));
    assert!(!stdout.contains("Mong Kok Bakery"));

    let (stdout, _, success) = run_shopfinder(&config_path, &["get", "3"]);
    assert!(success);
    assert!(stdout.contains("Zine Shop"));
    assert!(stdout.contains("online only"));

    let (_, stderr, success) = run_shopfinder(&config_path, &["get", "999"]);
    assert!(!success);
    assert!(stderr.contains("999"));
}

#[test]
fn test_query_rejects_exclusion_only() {
    let (tmp, config_path) = setup_test_env();
    import_fixture(&tmp, &config_path);

    let (stdout, _, success) = run_shopfinder(&config_path, &["query", "district:旺角 type:咖啡"]);
    assert!(success);
    assert!(stdout.contains("旺角咖啡室"));

    let (_, stderr, success) = run_shopfinder(&config_path, &["query", "-連鎖"]);
    assert!(!success);
    assert!(stderr.contains("required term"));
}

#[test]
fn test_stats_and_districts() {
    let (tmp, config_path) = setup_test_env();
    import_fixture(&tmp, &config_path);

    let (stdout, _, success) = run_shopfinder(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Shops:          10"));
    assert!(stdout.contains("Missing info:   2"));

    let (stdout, _, _) = run_shopfinder(&config_path, &["districts"]);
    assert_eq!(stdout.lines().count(), 5);

    let (stdout, _, _) = run_shopfinder(&config_path, &["suggest", "甜點"]);
    assert_eq!(stdout.trim(), "甜品");
}

#[test]
fn test_fill_info_without_geocoder_reports_every_shop() {
    let (tmp, config_path) = setup_test_env();
    import_fixture(&tmp, &config_path);

    let (stdout, stderr, success) = run_shopfinder(&config_path, &["fill-info"]);
    assert!(success, "failed items must not fail the run: {}", stderr);
    assert!(stdout.contains("Geocoded 0 of 2 shops (2 failed)"));
    assert!(stderr.contains("disabled"));
}

#[test]
fn test_migrate_index_then_search_index() {
    let (tmp, config_path) = setup_test_env();
    import_fixture(&tmp, &config_path);

    let index_dir = tmp.path().join("data").join("index");
    let (stdout, stderr, success) = run_shopfinder(
        &config_path,
        &["migrate-index", index_dir.to_str().unwrap()],
    );
    assert!(success, "migrate failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Copied 10 shops"));

    let tantivy_config = write_config(tmp.path(), "tantivy.toml", "tantivy");
    let (stdout, _, success) = run_shopfinder(&tantivy_config, &["search", "wabi"]);
    assert!(success);
    assert!(stdout.contains("WabiSabi"));

    let (stdout, _, _) = run_shopfinder(&tantivy_config, &["get", "10"]);
    assert!(stdout.contains("咖啡 Corner"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_shopfinder(&tmp.path().join("nope.toml"), &["stats"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
