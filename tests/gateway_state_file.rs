#![cfg(feature = "gateway")]

use std::sync::Arc;

use async_trait::async_trait;
use chat_gateway::Message;
use chat_gateway::gateway::{
    ApiKeyRecord, AuthFailure, ChatBackend, Clock, Gateway, GatewayConfig, GatewayError,
    KeyedChatRequest, KEYS_FILE, ManualClock, STATS_FILE,
};
use tokio_util::sync::CancellationToken;

const START: u64 = 1_700_000_000;
const DAY: u64 = 24 * 60 * 60;

struct EchoBackend;

#[async_trait]
impl ChatBackend for EchoBackend {
    async fn chat(&self, _model: &str, _messages: &[Message]) -> Result<String, GatewayError> {
        Ok("ok".to_string())
    }
}

fn gateway_in(dir: &std::path::Path, clock: Arc<ManualClock>) -> Gateway {
    Gateway::new(GatewayConfig::default(), EchoBackend)
        .with_clock(clock)
        .with_state_dir(dir)
}

#[test]
fn issued_keys_survive_a_restart_and_expire_on_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(START));

    let issued = gateway_in(dir.path(), clock.clone())
        .issue_key(Some(30))
        .unwrap();
    assert!(dir.path().join(KEYS_FILE).exists());

    let reloaded = gateway_in(dir.path(), clock.clone());
    assert_eq!(reloaded.credentials().len(), 1);
    let record = reloaded.authenticate(Some(&issued.key)).unwrap();
    assert_eq!(record, issued);

    clock.advance(30 * DAY - 1);
    reloaded.authenticate(Some(&issued.key)).unwrap();

    clock.advance(1);
    let err = reloaded.authenticate(Some(&issued.key)).unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Unauthorized(AuthFailure::ExpiredKey)
    ));
}

#[test]
fn revocation_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(START));

    let gateway = gateway_in(dir.path(), clock.clone());
    let keep = gateway.issue_key(None).unwrap();
    let revoked = gateway.issue_key(None).unwrap();
    assert!(gateway.revoke_key(&revoked.key).unwrap());

    let reloaded = gateway_in(dir.path(), clock);
    assert!(reloaded.credentials().contains(&keep.key));
    assert!(!reloaded.credentials().contains(&revoked.key));
}

#[tokio::test]
async fn call_statistics_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(START));

    let gateway = gateway_in(dir.path(), clock.clone());
    let key = gateway.issue_key(None).unwrap().key;
    for _ in 0..3 {
        gateway
            .handle(
                KeyedChatRequest {
                    key: Some(key.clone()),
                    message: Some("hi".to_string()),
                    model: None,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }
    drop(gateway);

    let raw: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join(STATS_FILE)).unwrap()).unwrap();
    assert_eq!(raw[&key]["total_calls"], 3);
    assert_eq!(raw[&key]["calls_today"], 3);
    assert!(raw[&key]["last_call"].is_string());

    clock.advance(DAY);
    let reloaded = gateway_in(dir.path(), clock.clone());
    let stats = reloaded.stats().get(&key).unwrap();
    assert_eq!(stats.total_calls, 3);
    // A new day: the daily counter reads as zero until the next call resets it.
    assert_eq!(stats.calls_on(clock.now()), 0);

    let summary = reloaded.stats().summary(clock.now());
    assert_eq!(summary.total_calls, 3);
    assert_eq!(summary.today_calls, 0);
    assert_eq!(summary.active_api_keys, 1);
}

#[test]
fn malformed_state_files_fall_back_to_empty() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(KEYS_FILE), "{not json").unwrap();
    std::fs::write(dir.path().join(STATS_FILE), "[]").unwrap();

    let gateway = gateway_in(dir.path(), Arc::new(ManualClock::new(START)));
    assert!(gateway.credentials().is_empty());
    assert!(gateway.stats().all().is_empty());

    // The next mutation overwrites the bad file with a valid one.
    let issued = gateway.issue_key(None).unwrap();
    let raw = std::fs::read(dir.path().join(KEYS_FILE)).unwrap();
    let records: Vec<ApiKeyRecord> = serde_json::from_slice(&raw).unwrap();
    assert_eq!(records, vec![issued]);
}

#[test]
fn records_that_expire_before_creation_are_skipped_on_load() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join(KEYS_FILE),
        r#"[
            {"key": "sk-good", "created_at": "2024-01-01T00:00:00Z", "expires_at": "2025-01-01T00:00:00Z"},
            {"key": "sk-bad", "created_at": "2024-01-01T00:00:00Z", "expires_at": "2023-01-01T00:00:00Z"}
        ]"#,
    )
    .unwrap();

    let gateway = gateway_in(dir.path(), Arc::new(ManualClock::new(START)));
    assert!(gateway.credentials().contains("sk-good"));
    assert!(!gateway.credentials().contains("sk-bad"));
}
