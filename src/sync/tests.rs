//! Integration Tests for Sync Module
//!
//! End-to-end tests against a mock HTTP backend:
//! - Queue replay ordering and bookkeeping
//! - Conflict surfacing (HTTP 409)
//! - Retry budget exhaustion across passes
//! - Best-effort cache refresh
//! - Cache-first reads with stale fallback
//! - Direct submits and their offline/transient fallbacks
//! - Reconnect-triggered sync

#[cfg(test)]
mod integration_tests {
    use super::super::*;
    use crate::cache::{CacheStore, CachedEntry};
    use crate::connectivity::ConnectivityMonitor;
    use crate::models::EntityKind;
    use crate::net::ApiClient;
    use crate::queue::{ActionKind, HttpMethod, NewAction, OfflineQueue};
    use crate::store::Store;
    use mockito::{Matcher, Mock, Server};
    use std::sync::Arc;
    use std::time::Duration;

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Manager bound to the mock server, plus a store handle for seeding
    /// state behind its back.
    fn manager_for(server: &Server) -> (SyncManager, Store) {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = Store::in_memory().expect("Failed to open in-memory store");
        let api = Arc::new(ApiClient::new(&server.url()).expect("Failed to build API client"));
        let manager = SyncManager::new(
            api,
            CacheStore::new(store.clone()),
            OfflineQueue::new(store.clone()),
            ConnectivityMonitor::new(),
            store.clone(),
            3,
        );
        (manager, store)
    }

    /// Mocks for the three collection refreshes every sync pass performs.
    async fn mock_collections(server: &mut Server) -> Vec<Mock> {
        let members = server
            .mock("GET", "/members/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id": 1, "first_name": "Miriam", "last_name": "Okafor"}]"#)
            .expect_at_least(0)
            .create_async()
            .await;
        let events = server
            .mock("GET", "/events/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id": 5, "title": "Potluck Dinner", "starts_at": "2026-04-12T18:00:00Z"}]"#)
            .expect_at_least(0)
            .create_async()
            .await;
        let announcements = server
            .mock("GET", "/announcements/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[{"id": 3, "title": "Roof fund update", "body": "We reached the goal.", "published_at": "2026-03-20T09:00:00Z"}]"#,
            )
            .expect_at_least(0)
            .create_async()
            .await;
        vec![members, events, announcements]
    }

    fn rsvp_action(event_id: i64) -> NewAction {
        let mut data = serde_json::Map::new();
        data.insert("event_id".to_string(), serde_json::json!(event_id));
        NewAction {
            kind: ActionKind::Register,
            endpoint: format!("/events/{}/rsvp", event_id),
            method: HttpMethod::Post,
            data,
        }
    }

    // ========================================================================
    // Queue Replay
    // ========================================================================

    #[tokio::test]
    async fn test_sync_replays_queued_actions() {
        let mut server = Server::new_async().await;
        let (manager, _store) = manager_for(&server);

        manager
            .queue()
            .enqueue(rsvp_action(5))
            .await
            .expect("Failed to enqueue rsvp");
        let mut confirm_data = serde_json::Map::new();
        confirm_data.insert("assignment_id".to_string(), serde_json::json!(9));
        manager
            .queue()
            .enqueue(NewAction {
                kind: ActionKind::Confirm,
                endpoint: "/assignments/9/confirm".to_string(),
                method: HttpMethod::Post,
                data: confirm_data,
            })
            .await
            .expect("Failed to enqueue confirm");

        let rsvp = server
            .mock("POST", "/events/5/rsvp")
            .match_body(Matcher::Json(serde_json::json!({"event_id": 5})))
            .with_status(200)
            .with_body(r#"{"status": "registered"}"#)
            .create_async()
            .await;
        let confirm = server
            .mock("POST", "/assignments/9/confirm")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;
        let _collections = mock_collections(&mut server).await;

        let result = manager.sync_all().await;

        assert!(result.success);
        assert_eq!(result.synced, 2);
        assert_eq!(result.failed, 0);
        assert!(result.conflicts.is_empty());
        assert!(manager.queue().is_empty().await);
        rsvp.assert_async().await;
        confirm.assert_async().await;
        // A clean pass records its completion time.
        assert!(manager.last_sync().is_some());
    }

    #[tokio::test]
    async fn test_offline_sync_makes_no_requests() {
        let mut server = Server::new_async().await;
        let (manager, _store) = manager_for(&server);
        manager.monitor().report(false, false);

        manager
            .queue()
            .enqueue(rsvp_action(5))
            .await
            .expect("Failed to enqueue");

        let untouched = server
            .mock("POST", "/events/5/rsvp")
            .expect(0)
            .create_async()
            .await;

        let result = manager.sync_all().await;

        assert!(!result.success);
        assert_eq!(result.synced, 0);
        assert_eq!(manager.queue().len().await, 1);
        untouched.assert_async().await;
        assert!(manager.last_sync().is_none());
    }

    // ========================================================================
    // Conflicts
    // ========================================================================

    #[tokio::test]
    async fn test_conflict_is_surfaced_and_not_retried() {
        let mut server = Server::new_async().await;
        let (manager, _store) = manager_for(&server);

        let mut data = serde_json::Map::new();
        data.insert("phone".to_string(), serde_json::json!("555-0100"));
        manager
            .queue()
            .enqueue(NewAction {
                kind: ActionKind::ProfileUpdate,
                endpoint: "/members/7/profile".to_string(),
                method: HttpMethod::Put,
                data,
            })
            .await
            .expect("Failed to enqueue profile update");

        let rejected = server
            .mock("PUT", "/members/7/profile")
            .match_body(Matcher::Json(serde_json::json!({"phone": "555-0100"})))
            .with_status(409)
            .with_header("content-type", "application/json")
            .with_body(r#"{"phone": "555-0199", "updated_at": "2026-03-19T08:00:00Z"}"#)
            .expect(1)
            .create_async()
            .await;
        let _collections = mock_collections(&mut server).await;

        let result = manager.sync_all().await;

        assert!(result.success);
        assert_eq!(result.synced, 0);
        assert_eq!(result.failed, 1);
        assert_eq!(result.conflicts.len(), 1);
        let conflict = &result.conflicts[0];
        assert_eq!(conflict.kind, ActionKind::ProfileUpdate);
        assert_eq!(conflict.local_data, serde_json::json!({"phone": "555-0100"}));
        assert_eq!(conflict.server_data["phone"], "555-0199");
        assert!(manager.queue().is_empty().await);

        // A second pass must not touch the endpoint again.
        let second = manager.sync_all().await;
        assert!(second.conflicts.is_empty());
        rejected.assert_async().await;
    }

    // ========================================================================
    // Retry Budget
    // ========================================================================

    #[tokio::test]
    async fn test_transient_failures_exhaust_retry_budget() {
        let mut server = Server::new_async().await;
        let (manager, _store) = manager_for(&server);

        manager
            .queue()
            .enqueue(rsvp_action(5))
            .await
            .expect("Failed to enqueue");

        let flaky = server
            .mock("POST", "/events/5/rsvp")
            .with_status(500)
            .with_body(r#"{"error": "temporarily unavailable"}"#)
            .expect(3)
            .create_async()
            .await;
        let _collections = mock_collections(&mut server).await;

        // First two passes burn retries without counting the action as failed.
        for attempt in 1..=2u32 {
            let result = manager.sync_all().await;
            assert!(result.success);
            assert_eq!(result.synced, 0);
            assert_eq!(result.failed, 0, "attempt {} should not be terminal", attempt);
            assert!(!result.errors.is_empty());
            let queued = manager.queue().list().await;
            assert_eq!(queued.len(), 1);
            assert_eq!(queued[0].retry_count, attempt);
        }

        // Third failure exhausts the budget and drops the action.
        let result = manager.sync_all().await;
        assert!(result.success);
        assert_eq!(result.failed, 1);
        assert!(result.conflicts.is_empty());
        assert!(manager.queue().is_empty().await);
        flaky.assert_async().await;
    }

    // ========================================================================
    // Cache Refresh
    // ========================================================================

    #[tokio::test]
    async fn test_refresh_failure_is_best_effort() {
        let mut server = Server::new_async().await;
        let (manager, _store) = manager_for(&server);

        let _members_down = server
            .mock("GET", "/members/")
            .with_status(500)
            .with_body(r#"{"error": "boom"}"#)
            .create_async()
            .await;
        let _events = server
            .mock("GET", "/events/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id": 5, "title": "Potluck Dinner", "starts_at": "2026-04-12T18:00:00Z"}]"#)
            .create_async()
            .await;
        let _announcements = server
            .mock("GET", "/announcements/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[]"#)
            .create_async()
            .await;

        let result = manager.sync_all().await;

        // One collection failing does not fail the pass or block the others.
        assert!(result.success);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("members"));
        assert!(manager
            .cache()
            .get::<serde_json::Value>(EntityKind::Events)
            .await
            .is_some());
        assert!(manager
            .cache()
            .get::<serde_json::Value>(EntityKind::Announcements)
            .await
            .is_some());
        assert!(manager
            .cache()
            .get::<serde_json::Value>(EntityKind::Members)
            .await
            .is_none());
        // A server-side refresh failure is not a storage problem.
        assert!(manager.last_sync().is_some());
    }

    // ========================================================================
    // Cache-First Reads
    // ========================================================================

    #[tokio::test]
    async fn test_read_through_fetches_once_then_serves_cache() {
        let mut server = Server::new_async().await;
        let (manager, _store) = manager_for(&server);

        let fetch = server
            .mock("GET", "/members/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id": 1, "first_name": "Miriam", "last_name": "Okafor"}]"#)
            .expect(1)
            .create_async()
            .await;

        let first = manager.members().await.expect("First read should fetch");
        assert!(!first.is_stale);
        assert_eq!(first.data.len(), 1);
        assert_eq!(first.data[0].first_name, "Miriam");

        let second = manager.members().await.expect("Second read should hit cache");
        assert!(!second.is_stale);
        fetch.assert_async().await;
    }

    #[tokio::test]
    async fn test_read_through_refreshes_stale_cache() {
        let mut server = Server::new_async().await;
        let (manager, store) = manager_for(&server);

        // Seed an envelope two days old; the member window is 24 hours.
        let envelope = CachedEntry {
            data: serde_json::json!([{"id": 1, "first_name": "Old", "last_name": "Record"}]),
            timestamp: chrono::Utc::now().timestamp_millis() - 2 * 24 * 3600 * 1000,
        };
        store
            .set(EntityKind::Members.cache_key(), &envelope)
            .expect("Failed to seed cache");

        let _fresh = server
            .mock("GET", "/members/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id": 1, "first_name": "Miriam", "last_name": "Okafor"}]"#)
            .create_async()
            .await;

        let cached = manager.members().await.expect("Read should refresh");

        assert!(!cached.is_stale);
        assert_eq!(cached.data[0].first_name, "Miriam");
    }

    #[tokio::test]
    async fn test_read_through_serves_stale_on_server_error() {
        let mut server = Server::new_async().await;
        let (manager, store) = manager_for(&server);

        let envelope = CachedEntry {
            data: serde_json::json!([{"id": 1, "first_name": "Old", "last_name": "Record"}]),
            timestamp: chrono::Utc::now().timestamp_millis() - 2 * 24 * 3600 * 1000,
        };
        store
            .set(EntityKind::Members.cache_key(), &envelope)
            .expect("Failed to seed cache");

        let _down = server
            .mock("GET", "/members/")
            .with_status(500)
            .with_body(r#"{"error": "boom"}"#)
            .create_async()
            .await;

        let cached = manager
            .members()
            .await
            .expect("Stale data should be served when the refresh fails");

        assert!(cached.is_stale);
        assert_eq!(cached.data[0].first_name, "Old");
    }

    // ========================================================================
    // Submits
    // ========================================================================

    #[tokio::test]
    async fn test_submit_applies_directly_when_online() {
        let mut server = Server::new_async().await;
        let (manager, _store) = manager_for(&server);

        let _accepted = server
            .mock("POST", "/events/5/rsvp")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status": "registered"}"#)
            .create_async()
            .await;

        let outcome = manager
            .submit(rsvp_action(5))
            .await
            .expect("Submit should succeed");

        match outcome {
            SubmitOutcome::Applied(value) => assert_eq!(value["status"], "registered"),
            other => panic!("Expected Applied, got {:?}", other),
        }
        assert!(manager.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_submit_queues_on_transient_failure() {
        let mut server = Server::new_async().await;
        let (manager, _store) = manager_for(&server);

        let _unavailable = server
            .mock("POST", "/events/5/rsvp")
            .with_status(503)
            .with_body(r#"{"error": "maintenance"}"#)
            .create_async()
            .await;

        let outcome = manager
            .submit(rsvp_action(5))
            .await
            .expect("Transient failure should queue, not error");

        assert!(matches!(outcome, SubmitOutcome::Queued { .. }));
        assert_eq!(manager.queue().len().await, 1);
    }

    #[tokio::test]
    async fn test_submit_queues_on_rate_limit() {
        let mut server = Server::new_async().await;
        let (manager, _store) = manager_for(&server);

        let _throttled = server
            .mock("POST", "/events/5/rsvp")
            .with_status(429)
            .with_body(r#"{"error": "slow down"}"#)
            .create_async()
            .await;

        let outcome = manager
            .submit(rsvp_action(5))
            .await
            .expect("Rate limiting should queue, not error");

        // 429 clears on its own; the replay path owns it like any 5xx.
        assert!(matches!(outcome, SubmitOutcome::Queued { .. }));
        assert_eq!(manager.queue().len().await, 1);
    }

    #[tokio::test]
    async fn test_submit_surfaces_deterministic_rejection() {
        let mut server = Server::new_async().await;
        let (manager, _store) = manager_for(&server);

        let _rejected = server
            .mock("POST", "/events/5/rsvp")
            .with_status(400)
            .with_body(r#"{"error": "event is full"}"#)
            .create_async()
            .await;

        let result = manager.submit(rsvp_action(5)).await;

        // A 400 would fail identically on replay; it must not be queued.
        assert!(matches!(result, Err(SyncError::Api(_))));
        assert!(manager.queue().is_empty().await);
    }

    // ========================================================================
    // Reconnect Trigger
    // ========================================================================

    #[tokio::test]
    async fn test_reconnect_triggers_sync_pass() {
        let mut server = Server::new_async().await;
        let (manager, _store) = manager_for(&server);
        manager.monitor().report(false, false);

        manager
            .queue()
            .enqueue(rsvp_action(5))
            .await
            .expect("Failed to enqueue");

        let rsvp = server
            .mock("POST", "/events/5/rsvp")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;
        let _collections = mock_collections(&mut server).await;

        let _watch = manager.watch_connectivity();
        manager.monitor().report(true, true);

        // The reconnect handler runs the pass on a spawned task.
        let mut drained = false;
        for _ in 0..200 {
            if manager.queue().is_empty().await {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(drained, "Reconnect should have replayed the queued action");
        rsvp.assert_async().await;
    }

    #[tokio::test]
    async fn test_reconnect_off_runtime_skips_pass_without_panicking() {
        let mut server = Server::new_async().await;
        let (manager, _store) = manager_for(&server);
        manager.monitor().report(false, false);

        manager
            .queue()
            .enqueue(rsvp_action(5))
            .await
            .expect("Failed to enqueue");

        let untouched = server
            .mock("POST", "/events/5/rsvp")
            .expect(0)
            .create_async()
            .await;

        let _watch = manager.watch_connectivity();

        // Platform shells deliver reachability callbacks on their own
        // threads, with no runtime on the stack.
        let monitor = manager.monitor().clone();
        let reporter = std::thread::spawn(move || {
            monitor.report(true, true);
        });
        reporter.join().expect("Reporting thread panicked");

        assert!(manager.monitor().is_online());
        // No runtime on the reporting thread, so no pass was scheduled and
        // the action stays queued for the next trigger.
        assert_eq!(manager.queue().len().await, 1);
        untouched.assert_async().await;
    }
}
