//! Integration coverage for the registry's session map (spec.md §4.8,
//! scenario 6: "registry destroy() with several active sessions").

mod support;

use std::sync::Arc;
use std::time::Duration;

use clsp_client::{ClspError, GlobalConfig, Registry, SurfaceConfig};
use support::FakeSurface;
use support::init_tracing;

fn fast_config() -> GlobalConfig {
    GlobalConfig {
        show_next_video_delay: Duration::from_millis(5),
        connection_change_play_delay: Duration::from_millis(5),
        ..GlobalConfig::default()
    }
}

fn config_for(container: &str) -> SurfaceConfig {
    SurfaceConfig {
        container_element_id: Some(container.to_owned()),
        ..Default::default()
    }
}

#[tokio::test]
async fn destroy_tears_down_every_active_session_and_rejects_further_creates() {
    init_tracing();
    let registry = Registry::spawn(Arc::new(FakeSurface::new()), fast_config());
    let handle = registry.handle();

    let mut ids = Vec::new();
    for i in 0..3 {
        let id = handle.create(config_for(&format!("container-{i}"))).await.unwrap();
        ids.push(id);
    }

    for &id in &ids {
        assert!(handle.has(id).await);
        assert!(handle.get(id).await.is_some());
    }

    handle.destroy().await;

    for &id in &ids {
        assert!(!handle.has(id).await);
        assert!(handle.get(id).await.is_none());
    }

    let err = handle.create(config_for("late")).await.unwrap_err();
    assert!(matches!(err, ClspError::AlreadyDestroyed));
}

#[tokio::test]
async fn removing_an_unknown_or_already_removed_id_is_a_noop() {
    init_tracing();
    let registry = Registry::spawn(Arc::new(FakeSurface::new()), fast_config());
    let handle = registry.handle();

    let id = handle.create(config_for("c")).await.unwrap();
    handle.remove(id).await;
    handle.remove(id).await;
    assert!(!handle.has(id).await);
}

#[tokio::test]
async fn sessions_created_after_one_another_get_distinct_ids() {
    init_tracing();
    let registry = Registry::spawn(Arc::new(FakeSurface::new()), fast_config());
    let handle = registry.handle();

    let a = handle.create(config_for("a")).await.unwrap();
    let b = handle.create(config_for("b")).await.unwrap();
    assert_ne!(a, b);
    assert!(handle.has(a).await);
    assert!(handle.has(b).await);
}
