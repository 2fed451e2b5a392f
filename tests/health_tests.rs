mod common;

use berth::events::{Event, EventBus};
use berth::health::{HealthMonitor, MonitorConfig};
use berth::types::{GroupStatus, HealthState, TransportKind};
use common::FakeRuntime;
use std::collections::HashMap;
use std::sync::Arc;

fn monitor() -> (Arc<FakeRuntime>, HealthMonitor, EventBus) {
    let runtime = Arc::new(FakeRuntime::new());
    let events = EventBus::new();
    let monitor = HealthMonitor::new(runtime.clone(), events.clone());
    (runtime, monitor, events)
}

fn stdio_config(container_id: &str) -> MonitorConfig {
    MonitorConfig::new(container_id, "/mcp", TransportKind::Stdio, HashMap::new())
}

#[tokio::test]
async fn stdio_server_with_running_container_is_healthy() {
    let (runtime, monitor, _) = monitor();
    runtime.set_running("ctr-a", true);

    monitor.register("a", stdio_config("ctr-a")).await;
    let result = monitor.check("a").await.unwrap();

    assert_eq!(result.status, HealthState::Healthy);
    assert!(result.container_running);
    assert!(result.endpoint_reachable);
    assert!(result.capabilities_match);
    assert!(result.observed_capabilities.is_empty());
}

#[tokio::test]
async fn stopped_container_is_unhealthy() {
    let (runtime, monitor, _) = monitor();
    runtime.set_running("ctr-a", false);

    monitor.register("a", stdio_config("ctr-a")).await;
    let result = monitor.check("a").await.unwrap();

    assert_eq!(result.status, HealthState::Unhealthy);
    assert!(!result.container_running);
    assert!(result.error.as_deref().unwrap_or("").contains("not running"));
}

#[tokio::test]
async fn sse_server_without_published_ports_is_unreachable() {
    let (runtime, monitor, _) = monitor();
    runtime.set_running("ctr-a", true);

    let config = MonitorConfig::new("ctr-a", "/mcp", TransportKind::Sse, HashMap::new());
    monitor.register("a", config).await;
    let result = monitor.check("a").await.unwrap();

    assert_eq!(result.status, HealthState::Unhealthy);
    assert!(result.container_running);
    assert!(!result.endpoint_reachable);
    assert!(result.error.as_deref().unwrap().contains("No exposed ports"));
}

#[tokio::test]
async fn stdio_server_cannot_satisfy_expected_capabilities() {
    let (runtime, monitor, _) = monitor();
    runtime.set_running("ctr-a", true);

    let expected = HashMap::from([("tools".to_string(), serde_json::json!(true))]);
    let config = MonitorConfig::new("ctr-a", "/mcp", TransportKind::Stdio, expected);
    monitor.register("a", config).await;
    let result = monitor.check("a").await.unwrap();

    // stdio probes observe no capabilities, so a non-empty expected set
    // can never match.
    assert_eq!(result.status, HealthState::Unhealthy);
    assert!(result.endpoint_reachable);
    assert!(!result.capabilities_match);
}

#[tokio::test]
async fn checking_unregistered_server_is_an_error() {
    let (_, monitor, _) = monitor();
    assert!(monitor.check("ghost").await.is_err());
}

#[tokio::test]
async fn unhealthy_notification_fires_at_threshold_and_refires() {
    let (runtime, monitor, events) = monitor();
    runtime.set_running("ctr-a", false);
    let mut rx = events.subscribe();

    let mut config = stdio_config("ctr-a");
    config.failure_threshold = 2;
    monitor.register("a", config).await;

    monitor.check("a").await.unwrap();
    monitor.check("a").await.unwrap();
    monitor.check("a").await.unwrap();

    let mut unhealthy_counts = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Event::HealthChanged {
            health: HealthState::Unhealthy,
            failure_count,
            ..
        } = event
        {
            unhealthy_counts.push(failure_count);
        }
    }
    // Below threshold is silent; at and above it every check notifies.
    assert_eq!(unhealthy_counts, vec![2, 3]);
}

#[tokio::test]
async fn recovery_requires_consecutive_healthy_checks() {
    let (runtime, monitor, events) = monitor();
    runtime.set_running("ctr-a", false);
    let mut rx = events.subscribe();

    let mut config = stdio_config("ctr-a");
    config.failure_threshold = 1;
    config.recovery_threshold = 2;
    monitor.register("a", config).await;

    monitor.check("a").await.unwrap();

    runtime.set_running("ctr-a", true);
    monitor.check("a").await.unwrap();

    let mut recovered = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Event::HealthChanged {
            health: HealthState::Healthy,
            recovery_count,
            ..
        } = event
        {
            recovered.push(recovery_count);
        }
    }
    assert!(recovered.is_empty());

    monitor.check("a").await.unwrap();
    while let Ok(event) = rx.try_recv() {
        if let Event::HealthChanged {
            health: HealthState::Healthy,
            recovery_count,
            ..
        } = event
        {
            recovered.push(recovery_count);
        }
    }
    assert_eq!(recovered, vec![2]);
}

#[tokio::test]
async fn history_is_bounded_and_limit_is_honored() {
    let (runtime, monitor, _) = monitor();
    runtime.set_running("ctr-a", true);

    monitor.register("a", stdio_config("ctr-a")).await;
    for _ in 0..5 {
        monitor.check("a").await.unwrap();
    }

    assert_eq!(monitor.server_history("a", None).await.len(), 5);
    assert_eq!(monitor.server_history("a", Some(2)).await.len(), 2);
    assert!(monitor.server_health("a").await.is_some());
}

#[tokio::test]
async fn unregister_discards_state() {
    let (runtime, monitor, _) = monitor();
    runtime.set_running("ctr-a", true);

    monitor.register("a", stdio_config("ctr-a")).await;
    monitor.check("a").await.unwrap();
    monitor.unregister("a").await;

    assert!(monitor.server_health("a").await.is_none());
    assert!(monitor.check("a").await.is_err());
}

#[tokio::test]
async fn group_health_aggregates_member_classes() {
    let (runtime, monitor, _) = monitor();
    runtime.set_running("ctr-up", true);
    runtime.set_running("ctr-down", false);

    monitor.register("up", stdio_config("ctr-up")).await;
    monitor.register("down", stdio_config("ctr-down")).await;
    monitor.check("up").await.unwrap();
    monitor.check("down").await.unwrap();

    monitor
        .start_group_monitoring("g", vec!["up".to_string(), "down".to_string()])
        .await;

    let health = monitor.group_health("g").await.unwrap();
    assert_eq!(health.total_servers, 2);
    assert_eq!(health.healthy_servers, 1);
    assert_eq!(health.failed_servers, 1);
    assert_eq!(health.overall, GroupStatus::Degraded);
    assert!(health.average_response_time_ms.is_some());

    assert!(monitor.group_health("missing").await.is_err());

    monitor.shutdown().await;
}
