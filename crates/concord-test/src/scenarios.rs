//! End-to-end session scenarios over real engines
//!
//! Replicas are connected by handing operation histories across directly;
//! the engine's duplicate filter makes repeated exchanges harmless.

use concord_runtime::{SyncEngine, SyncReport};

/// Hand everything `from` has logged to `to` and wait for it to settle
pub async fn exchange(from: &SyncEngine, to: &SyncEngine) -> SyncReport {
    let report = to.synchronize(from.operation_history(None));
    to.wait_idle().await;
    report
}

/// Exchange in both directions
pub async fn sync_pair(a: &SyncEngine, b: &SyncEngine) {
    exchange(a, b).await;
    exchange(b, a).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{ConcordError, EntityId, EntityType, OperationDraft, Timestamp};
    use concord_runtime::{EngineConfig, EngineEvent, PolicyConfig};
    use concord_state::StateSnapshot;
    use serde_json::{json, Value};

    fn engine(actor: &str, policy: PolicyConfig) -> SyncEngine {
        SyncEngine::new(actor, EngineConfig::default().with_policy(policy)).unwrap()
    }

    fn create(id: &str, payload: Value, ts: i64) -> OperationDraft {
        OperationDraft::create(EntityType::Token, id, payload).with_timestamp(Timestamp(ts))
    }

    fn update(id: &str, payload: Value, ts: i64) -> OperationDraft {
        OperationDraft::update(EntityType::Token, id, payload).with_timestamp(Timestamp(ts))
    }

    /// A creates T, then A and B edit it concurrently (B later)
    async fn two_actor_token(policy: PolicyConfig) -> (SyncEngine, SyncEngine) {
        let a = engine("A", policy.clone());
        let b = engine("B", policy);

        a.apply_local_operation(create("T", json!({"x": 0, "y": 0}), 1_000)).unwrap();
        a.wait_idle().await;
        exchange(&a, &b).await;

        a.apply_local_operation(update("T", json!({"y": 9}), 2_000)).unwrap();
        b.apply_local_operation(update("T", json!({"x": 5}), 3_000)).unwrap();
        a.wait_idle().await;
        b.wait_idle().await;

        sync_pair(&a, &b).await;
        (a, b)
    }

    #[tokio::test]
    async fn test_two_actor_token_merge() {
        let (a, b) = two_actor_token(PolicyConfig::Merge).await;
        let token = EntityId::new("T");
        assert_eq!(a.entity(&token), Some(json!({"x": 5, "y": 9})));
        assert_eq!(a.state(), b.state());
    }

    #[tokio::test]
    async fn test_two_actor_token_last_writer_wins() {
        let (a, b) = two_actor_token(PolicyConfig::LastWriterWins).await;
        let token = EntityId::new("T");
        assert_eq!(a.entity(&token), Some(json!({"x": 5, "y": 0})));
        assert_eq!(b.entity(&token), Some(json!({"x": 5, "y": 0})));
        assert_eq!(a.stats().superseded + b.stats().superseded, 1);
    }

    #[tokio::test]
    async fn test_repeated_exchange_is_idempotent() {
        let (a, b) = two_actor_token(PolicyConfig::Merge).await;
        let before = b.state();
        let report = exchange(&a, &b).await;
        assert_eq!(report.accepted, 0);
        assert_eq!(report.duplicates, a.operation_history(None).len());
        assert_eq!(b.state(), before);
    }

    #[tokio::test]
    async fn test_manual_resolution_on_both_replicas() {
        let a = engine("A", PolicyConfig::Manual);
        let b = engine("B", PolicyConfig::Manual);
        a.apply_local_operation(create("T", json!({"x": 0}), 1)).unwrap();
        a.wait_idle().await;
        exchange(&a, &b).await;

        let from_a = a.apply_local_operation(update("T", json!({"x": 1}), 2)).unwrap();
        let from_b = b.apply_local_operation(update("T", json!({"x": 2}), 3)).unwrap();
        a.wait_idle().await;
        b.wait_idle().await;
        sync_pair(&a, &b).await;

        // Each replica parks the other side's edit
        let parked_on_a = a.pending_manual_operations();
        let parked_on_b = b.pending_manual_operations();
        assert_eq!(parked_on_a.len(), 1);
        assert_eq!(parked_on_a[0].operation.id, from_b.id);
        assert_eq!(parked_on_b[0].operation.id, from_a.id);

        // Both sides pick B's edit
        a.resolve_conflict(&from_b.id, Some(from_b.clone())).unwrap();
        b.resolve_conflict(&from_a.id, Some(from_b.clone())).unwrap();
        a.wait_idle().await;
        b.wait_idle().await;

        assert_eq!(a.entity(&"T".into()), Some(json!({"x": 2})));
        assert_eq!(a.state(), b.state());
        assert!(a.pending_manual_operations().is_empty());
    }

    #[tokio::test]
    async fn test_undo_propagates_to_peer() {
        let a = engine("A", PolicyConfig::LastWriterWins);
        let b = engine("B", PolicyConfig::LastWriterWins);
        a.apply_local_operation(create("T", json!({"x": 0}), 1)).unwrap();
        a.apply_local_operation(update("T", json!({"x": 5, "hp": 3}), 2)).unwrap();
        a.wait_idle().await;
        exchange(&a, &b).await;
        assert_eq!(b.entity(&"T".into()), Some(json!({"x": 5, "hp": 3})));

        let inverse = a.undo_last_operation().unwrap();
        a.wait_idle().await;
        // The inverse alone: its dependency is already on B
        b.apply_remote_operation(inverse).unwrap();
        b.wait_idle().await;

        assert_eq!(b.entity(&"T".into()), Some(json!({"x": 0})));
        assert_eq!(a.state(), b.state());
    }

    #[tokio::test]
    async fn test_dependent_waits_for_its_dependency_on_peer() {
        let a = engine("A", PolicyConfig::LastWriterWins);
        let b = engine("B", PolicyConfig::LastWriterWins);
        let created = a.apply_local_operation(create("T", json!({"x": 0}), 1)).unwrap();
        let dependent = a
            .apply_local_operation(
                update("T", json!({"x": 1}), 2).with_dependencies(vec![created.id.clone()]),
            )
            .unwrap();
        a.wait_idle().await;

        b.apply_remote_operation(dependent).unwrap();
        b.wait_idle().await;
        assert_eq!(b.deferred_operations().len(), 1);
        assert_eq!(b.entity(&"T".into()), None);

        b.apply_remote_operation(created).unwrap();
        b.wait_idle().await;
        assert!(b.deferred_operations().is_empty());
        assert_eq!(b.entity(&"T".into()), Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn test_snapshot_bootstraps_a_late_joiner() {
        let a = engine("A", PolicyConfig::Merge);
        a.apply_local_operation(create("T", json!({"x": 0}), 1)).unwrap();
        a.apply_local_operation(update("T", json!({"x": 2}), 2)).unwrap();
        a.wait_idle().await;

        let wire = a.create_snapshot().to_json().unwrap();
        let late = engine("C", PolicyConfig::Merge);
        late.load_snapshot(StateSnapshot::from_json(&wire).unwrap());
        assert_eq!(late.state(), a.state());

        // Live traffic continues on top of the snapshot
        a.apply_local_operation(update("T", json!({"y": 4}), 3)).unwrap();
        a.wait_idle().await;
        let report = exchange(&a, &late).await;
        assert_eq!(report.accepted, 1);
        assert_eq!(late.entity(&"T".into()), Some(json!({"x": 2, "y": 4})));

        let own = late.apply_local_operation(update("T", json!({"x": 9}), 4)).unwrap();
        assert_eq!(own.sequence(), 1);
        assert_eq!(own.vector_clock.get(&"A".into()), 3);
    }

    #[tokio::test]
    async fn test_peer_subscriber_sees_remote_edits() {
        let a = engine("A", PolicyConfig::LastWriterWins);
        let b = engine("B", PolicyConfig::LastWriterWins);
        let mut events = b.subscribe();

        a.apply_local_operation(create("T", json!({"x": 0}), 1)).unwrap();
        a.apply_local_operation(update("T", json!({"x": "bad"}), 2)).unwrap();
        a.apply_local_operation(OperationDraft::update(EntityType::Token, "T", json!(7))).unwrap();
        a.wait_idle().await;
        exchange(&a, &b).await;

        let received = events.drain();
        let applied = received
            .iter()
            .filter(|e| matches!(e, EngineEvent::OperationApplied { .. }))
            .count();
        assert_eq!(applied, 2);
        let failed: Vec<&ConcordError> = received
            .iter()
            .filter_map(|e| match e {
                EngineEvent::OperationFailed { error, .. } => Some(error),
                _ => None,
            })
            .collect();
        assert!(matches!(failed.as_slice(), [ConcordError::Apply { .. }]));
        assert_eq!(b.entity(&"T".into()), Some(json!({"x": "bad"})));
    }
}
