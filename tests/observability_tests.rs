use listener_idempotency::config::IdempotencySettings;
use listener_idempotency::idempotency::{IdempotencyGuard, InMemoryIdempotencyStore, RecordIdentity};
use listener_idempotency::observability::{
    get_metrics, init_logging, init_metrics, CheckOutcome, LatencyTimer, LogConfig, LogFormat,
    MarkerOutcome,
};
use std::sync::Arc;

#[test]
fn test_log_config_default() {
    let config = LogConfig::default();
    assert_eq!(config.level, "info");
    assert_eq!(config.format, LogFormat::Pretty);
    assert!(config.include_target);
    assert!(!config.include_file);
    assert!(!config.include_line);
}

#[test]
fn test_init_logging_only_installs_once() {
    let config = LogConfig {
        level: "debug".to_string(),
        format: LogFormat::Compact,
        ..LogConfig::default()
    };

    init_logging(&config);
    assert!(!init_logging(&config));
}

#[test]
fn test_latency_timer_is_monotonic() {
    let timer = LatencyTimer::new();
    let first = timer.elapsed_ms();
    let second = timer.elapsed_ms();
    assert!(second >= first);
}

#[tokio::test]
async fn test_guard_decisions_are_exported() {
    let installers: Vec<_> = (0..8).map(|_| std::thread::spawn(init_metrics)).collect();
    for installer in installers {
        assert!(installer.join().unwrap().is_ok());
    }
    let handle = init_metrics().expect("recorder installed");

    let guard = IdempotencyGuard::new(
        &IdempotencySettings::default(),
        Arc::new(InMemoryIdempotencyStore::default()),
    );
    let identity = || RecordIdentity::new(["obs-message1"]);

    guard.check("obs-orders", identity).await.unwrap();
    guard.persist("obs-orders", 60, identity).await;
    guard.check("obs-orders", identity).await.unwrap();
    get_metrics().record_check("obs-direct", CheckOutcome::Error);
    get_metrics().record_marker("obs-direct", MarkerOutcome::Failed);

    let rendered = handle.render();
    assert!(rendered.contains("idempotency_checks_total"));
    assert!(rendered.contains("idempotency_markers_total"));
    assert!(rendered.contains("obs-orders"));
    assert!(rendered.contains(r#"outcome="skipped""#));
    assert!(rendered.contains(r#"outcome="recorded""#));
    assert!(rendered.contains(r#"outcome="error""#));
}
