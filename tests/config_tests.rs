//! # Configuration Tests
//!
//! TOML loading, defaults for omitted keys, validation and derived values.

use gatehouse::{GatehouseError, ServerConfig};
use std::io::Write;
use std::time::{Duration, Instant};

#[test]
fn test_defaults() {
    let t = Instant::now();

    let config = ServerConfig::default();
    assert_eq!(config.port, 3306);
    assert_eq!(config.max_connections, 151);
    assert_eq!(config.admission_slack, 1);
    assert_eq!(config.admin_port, None);
    assert!(!config.enable_dedicated_dispatchers);
    assert_eq!(config.shutdown_grace_period(), Duration::from_secs(2));
    assert!(config.validate().is_ok());

    let overhead = t.elapsed();
    println!("test_defaults: Testing Overhead = {:?}", overhead);
}

#[test]
fn test_load_from_file_fills_missing_keys() {
    let t = Instant::now();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
host = "0.0.0.0"
port = 4406
admin_port = 4407
max_connections = 500
enable_dedicated_dispatchers = true
num_dispatchers = 4
dispatcher_queue_capacity = 64
shutdown_grace_period_ms = 250
"#
    )
    .unwrap();

    let config = ServerConfig::load(file.path()).expect("valid file");
    assert_eq!(config.host, "0.0.0.0");
    assert_eq!(config.port, 4406);
    assert_eq!(config.admin_port, Some(4407));
    assert_eq!(config.max_connections, 500);
    assert_eq!(config.effective_num_dispatchers(), 4);
    assert_eq!(config.shutdown_grace_period(), Duration::from_millis(250));
    // Untouched keys keep their defaults.
    assert_eq!(config.num_registry_shards, 8);
    assert_eq!(config.force_close_retries, 3);
    assert_eq!(config.admin_addr().unwrap().unwrap().port(), 4407);

    let overhead = t.elapsed();
    println!("test_load_from_file_fills_missing_keys: Testing Overhead = {:?}", overhead);
}

#[test]
fn test_validation_errors() {
    let t = Instant::now();

    let bad = [
        "num_listen_shards = 0",
        "num_registry_shards = 0",
        "enable_dedicated_dispatchers = true\ndispatcher_queue_capacity = 100",
        "port = 3306\nadmin_port = 3306",
        "host = \"not-an-ip\"",
    ];
    for raw in bad {
        match ServerConfig::from_toml_str(raw) {
            Err(GatehouseError::Config(_)) => {}
            other => panic!("{:?} should be rejected, got {:?}", raw, other),
        }
    }
    assert!(matches!(
        ServerConfig::from_toml_str("port = \"three\""),
        Err(GatehouseError::Config(_))
    ));
    assert!(matches!(
        ServerConfig::load("/nonexistent/gatehouse.toml"),
        Err(GatehouseError::Config(_))
    ));

    let overhead = t.elapsed();
    println!("test_validation_errors: Testing Overhead = {:?}", overhead);
}

/// Without an explicit cap, idle workers scale with the connection limit.
#[test]
fn test_derived_idle_cap() {
    let t = Instant::now();

    let mut config = ServerConfig::default();
    assert_eq!(config.effective_max_idle_threads(), 9);

    config.max_connections = 100_000;
    assert_eq!(config.effective_max_idle_threads(), 100);

    config.max_idle_threads = Some(3);
    assert_eq!(config.effective_max_idle_threads(), 3);

    let overhead = t.elapsed();
    println!("test_derived_idle_cap: Testing Overhead = {:?}", overhead);
}
