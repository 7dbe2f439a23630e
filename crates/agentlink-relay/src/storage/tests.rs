//! Storage layer tests for the relay.

use agentlink_core::db::unix_timestamp;

use super::db::RelayDatabase;
use super::queries::PairingError;

async fn test_db() -> RelayDatabase {
    RelayDatabase::open_in_memory().await.unwrap()
}

async fn seed_agent(db: &RelayDatabase, id: &str) {
    db.upsert_agent(id, id, "hash", None, false).await.unwrap();
}

// === Agent tests ===

#[tokio::test]
async fn upsert_creates_then_updates() {
    let db = test_db().await;

    let agent = db
        .upsert_agent("a1", "Agent One", "hash1", None, false)
        .await
        .unwrap();
    assert_eq!(agent.id, "a1");
    assert_eq!(agent.display_name, "Agent One");

    let agent = db
        .upsert_agent("a1", "Renamed", "hash1", Some("t1"), false)
        .await
        .unwrap();
    assert_eq!(agent.display_name, "Renamed");
    assert_eq!(agent.tenant_id.as_deref(), Some("t1"));
}

#[tokio::test]
async fn upsert_with_wrong_secret_fails() {
    let db = test_db().await;
    seed_agent(&db, "a1").await;

    let err = db
        .upsert_agent("a1", "Agent One", "other-hash", None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, super::DatabaseError::Conflict(_)));

    // Secret is unchanged
    let agent = db.get_agent("a1").await.unwrap();
    assert_eq!(agent.secret_hash, "hash");
}

#[tokio::test]
async fn upsert_secret_reset_allowed_with_flag() {
    let db = test_db().await;
    seed_agent(&db, "a1").await;

    let agent = db
        .upsert_agent("a1", "Agent One", "new-hash", None, true)
        .await
        .unwrap();
    assert_eq!(agent.secret_hash, "new-hash");
}

#[tokio::test]
async fn tenant_listing_groups_null_separately() {
    let db = test_db().await;
    db.upsert_agent("a1", "A", "h", Some("t1"), false).await.unwrap();
    db.upsert_agent("a2", "B", "h", Some("t1"), false).await.unwrap();
    db.upsert_agent("a3", "C", "h", None, false).await.unwrap();

    let t1 = db.list_agents_by_tenant(Some("t1")).await.unwrap();
    assert_eq!(t1.len(), 2);

    let untenanted = db.list_agents_by_tenant(None).await.unwrap();
    assert_eq!(untenanted.len(), 1);
    assert_eq!(untenanted[0].id, "a3");
}

// === Pairing tests ===

#[tokio::test]
async fn issue_pairing_replaces_previous() {
    let db = test_db().await;
    seed_agent(&db, "a1").await;
    let expires = unix_timestamp() + 600;

    db.issue_pairing("a1", "CODE2345", expires).await.unwrap();
    db.issue_pairing("a1", "CODE6789", expires).await.unwrap();

    assert!(db.get_pairing("CODE2345").await.unwrap().is_none());
    assert!(db.get_pairing("CODE6789").await.unwrap().is_some());
}

#[tokio::test]
async fn issue_pairing_code_collision_surfaces() {
    let db = test_db().await;
    seed_agent(&db, "a1").await;
    seed_agent(&db, "a2").await;
    let expires = unix_timestamp() + 600;

    db.issue_pairing("a1", "SAMECODE", expires).await.unwrap();
    let err = db.issue_pairing("a2", "SAMECODE", expires).await.unwrap_err();
    assert!(err.is_unique_violation());
}

#[tokio::test]
async fn consume_pairing_lifecycle() {
    let db = test_db().await;
    seed_agent(&db, "a1").await;
    let now = unix_timestamp();

    db.issue_pairing("a1", "CODE2345", now + 600).await.unwrap();

    let agent = db.consume_pairing("CODE2345", now, 5).await.unwrap();
    assert_eq!(agent.id, "a1");

    // One attempt charged; the code survives until delete_pairing.
    let pairing = db.get_pairing("CODE2345").await.unwrap().unwrap();
    assert_eq!(pairing.attempts, 1);

    assert!(db.delete_pairing("CODE2345").await.unwrap());
    let err = db.consume_pairing("CODE2345", now, 5).await.unwrap_err();
    assert!(matches!(err, PairingError::Invalid));
}

#[tokio::test]
async fn consume_expired_pairing_deletes_it() {
    let db = test_db().await;
    seed_agent(&db, "a1").await;
    let now = unix_timestamp();

    db.issue_pairing("a1", "CODE2345", now - 1).await.unwrap();

    let err = db.consume_pairing("CODE2345", now, 5).await.unwrap_err();
    assert!(matches!(err, PairingError::Expired));
    assert!(db.get_pairing("CODE2345").await.unwrap().is_none());
}

#[tokio::test]
async fn consume_pairing_attempt_budget() {
    let db = test_db().await;
    seed_agent(&db, "a1").await;
    let now = unix_timestamp();

    db.issue_pairing("a1", "CODE2345", now + 600).await.unwrap();

    for _ in 0..5 {
        db.consume_pairing("CODE2345", now, 5).await.unwrap();
    }

    let err = db.consume_pairing("CODE2345", now, 5).await.unwrap_err();
    assert!(matches!(err, PairingError::AttemptsExceeded));
    assert!(db.get_pairing("CODE2345").await.unwrap().is_none());
}

// === Device and refresh-token tests ===

#[tokio::test]
async fn create_device_and_store_token() {
    let db = test_db().await;
    seed_agent(&db, "a1").await;
    let now = unix_timestamp();

    let device = db
        .create_device("d1", "a1", "work laptop", None, now)
        .await
        .unwrap();
    assert_eq!(device.agent_id, "a1");
    assert_eq!(device.revoked, 0);

    db.store_refresh_token("rt-hash", "d1", "a1", now + 3600)
        .await
        .unwrap();

    let found = db.find_refresh_token("rt-hash", now).await.unwrap();
    assert!(found.is_some());
    assert_eq!(found.unwrap().device_id, "d1");
}

#[tokio::test]
async fn expired_refresh_token_not_found() {
    let db = test_db().await;
    seed_agent(&db, "a1").await;
    let now = unix_timestamp();
    db.create_device("d1", "a1", "lab", None, now).await.unwrap();

    db.store_refresh_token("rt-hash", "d1", "a1", now - 1)
        .await
        .unwrap();

    assert!(db.find_refresh_token("rt-hash", now).await.unwrap().is_none());
}

#[tokio::test]
async fn rotation_is_atomic_and_single_use() {
    let db = test_db().await;
    seed_agent(&db, "a1").await;
    let now = unix_timestamp();
    db.create_device("d1", "a1", "lab", None, now).await.unwrap();
    db.store_refresh_token("old", "d1", "a1", now + 3600)
        .await
        .unwrap();

    let rotated = db
        .rotate_refresh_token("old", "new", "d1", "a1", now + 7200)
        .await
        .unwrap();
    assert!(rotated);
    assert!(db.find_refresh_token("old", now).await.unwrap().is_none());
    assert!(db.find_refresh_token("new", now).await.unwrap().is_some());

    // Rotating the old digest again must fail and must not insert anything.
    let rotated = db
        .rotate_refresh_token("old", "newer", "d1", "a1", now + 7200)
        .await
        .unwrap();
    assert!(!rotated);
    assert!(db.find_refresh_token("newer", now).await.unwrap().is_none());
}

#[tokio::test]
async fn revoke_device_drops_its_tokens() {
    let db = test_db().await;
    seed_agent(&db, "a1").await;
    let now = unix_timestamp();
    db.create_device("d1", "a1", "lab", None, now).await.unwrap();
    db.store_refresh_token("rt", "d1", "a1", now + 3600)
        .await
        .unwrap();

    assert!(db.revoke_device("d1").await.unwrap());
    assert_eq!(db.get_device("d1").await.unwrap().revoked, 1);
    assert!(db.find_refresh_token("rt", now).await.unwrap().is_none());
}

// === Account tests ===

#[tokio::test]
async fn account_session_upsert_replaces() {
    let db = test_db().await;
    let now = unix_timestamp();
    db.create_account("acc1", "a@example.com", "google")
        .await
        .unwrap();

    db.upsert_session("s1", "acc1", now + 3600).await.unwrap();
    db.upsert_session("s2", "acc1", now + 3600).await.unwrap();

    assert!(db.resolve_session("s1", now).await.unwrap().is_none());
    let account = db.resolve_session("s2", now).await.unwrap().unwrap();
    assert_eq!(account.id, "acc1");
}

#[tokio::test]
async fn expired_session_does_not_resolve() {
    let db = test_db().await;
    let now = unix_timestamp();
    db.create_account("acc1", "a@example.com", "google")
        .await
        .unwrap();
    db.upsert_session("s1", "acc1", now - 1).await.unwrap();

    assert!(db.resolve_session("s1", now).await.unwrap().is_none());
}

#[tokio::test]
async fn account_agent_links() {
    let db = test_db().await;
    db.create_account("acc1", "a@example.com", "google")
        .await
        .unwrap();

    db.link_account_agent("acc1", "a1").await.unwrap();
    db.link_account_agent("acc1", "a1").await.unwrap(); // idempotent
    db.link_account_agent("acc1", "a2").await.unwrap();

    assert_eq!(db.count_account_agents("acc1").await.unwrap(), 2);
    assert!(db.is_account_agent_linked("acc1", "a1").await.unwrap());
    assert!(!db.is_account_agent_linked("acc1", "a3").await.unwrap());

    db.replace_account_agents("acc1", &["a3".to_string()])
        .await
        .unwrap();
    assert_eq!(db.list_account_agents("acc1").await.unwrap(), vec!["a3"]);
}

#[tokio::test]
async fn billing_update_transitions_plan() {
    let db = test_db().await;
    db.create_account("acc1", "a@example.com", "google")
        .await
        .unwrap();

    db.update_account_billing("acc1", Some("cus_1"), Some("sub_1"), "pro", Some("active"))
        .await
        .unwrap();

    let account = db.get_account("acc1").await.unwrap();
    assert_eq!(account.plan, "pro");
    assert_eq!(account.subscription_status.as_deref(), Some("active"));

    let by_customer = db.find_account_by_customer("cus_1").await.unwrap().unwrap();
    assert_eq!(by_customer.id, "acc1");

    // Downgrade keeps the stored customer id.
    db.update_account_billing("acc1", None, None, "free", Some("canceled"))
        .await
        .unwrap();
    let account = db.get_account("acc1").await.unwrap();
    assert_eq!(account.plan, "free");
    assert_eq!(account.stripe_customer_id.as_deref(), Some("cus_1"));
}

// === Rate counter and cleanup tests ===

#[tokio::test]
async fn rate_check_window_behavior() {
    let db = test_db().await;
    let now = unix_timestamp();

    for _ in 0..5 {
        assert!(db.rate_check("ip:pairing", 5, 60, now).await.unwrap());
    }
    assert!(!db.rate_check("ip:pairing", 5, 60, now).await.unwrap());

    // A later window resets the counter.
    assert!(db.rate_check("ip:pairing", 5, 60, now + 61).await.unwrap());
}

#[tokio::test]
async fn cleanup_removes_expired_rows() {
    let db = test_db().await;
    seed_agent(&db, "a1").await;
    let now = unix_timestamp();
    db.create_device("d1", "a1", "lab", None, now).await.unwrap();

    db.store_refresh_token("dead", "d1", "a1", now - 10)
        .await
        .unwrap();
    db.store_refresh_token("live", "d1", "a1", now + 3600)
        .await
        .unwrap();
    db.issue_pairing("a1", "OLDCODE2", now - 10).await.unwrap();
    db.rate_check("stale", 5, 60, now - 7200).await.unwrap();

    let stats = db.cleanup(now).await.unwrap();
    assert_eq!(stats.refresh_tokens, 1);
    assert_eq!(stats.pairings, 1);
    assert_eq!(stats.rate_counters, 1);
    assert!(stats.total() >= 3);

    assert!(db.find_refresh_token("live", now).await.unwrap().is_some());
}
