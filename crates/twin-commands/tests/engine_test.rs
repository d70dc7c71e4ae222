//! Reconciliation engine tests on a paused clock.

mod common;

use std::time::Duration;

use common::{harness, harness_with_window, window_at, FIRMWARE};
use twin_commands::{SetDesiredOutcome, SetDesiredRequest};
use twin_core::{ConfigStore, DocType, Error, ValidationError};

const DEVICE: &str = "70b3d5e75e000001";

fn roffset(value: &str) -> SetDesiredRequest {
    SetDesiredRequest::new(DEVICE, 0, "roffset", value)
}

async fn settle(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

#[tokio::test(start_paused = true)]
async fn test_set_desired_sends_encoded_command() {
    let h = harness().await;
    h.liveness.register(DEVICE, 1);

    let outcome = h.engine.set_desired("alice", roffset("2500")).await.unwrap();
    assert_eq!(outcome, SetDesiredOutcome::Transmitted);

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].device_id, DEVICE);
    assert_eq!(sent[0].field_index, 3);
    assert_eq!(sent[0].firmware, FIRMWARE);
    assert_eq!(sent[0].retry_count, 0);
    assert_eq!(sent[0].payload, vec![0x00, 0x00, 0x09, 0xC4]);

    let value = h
        .store
        .desired_reported(DEVICE, 0, "roffset")
        .await
        .unwrap();
    assert_eq!(value.desired.as_deref(), Some("2500"));

    assert_eq!(
        h.telemetry.event_messages(),
        vec!["Changed roffset from  to 2500 slot 0".to_string()]
    );

    // First resend goes out right after the first check
    settle(26).await;
    assert_eq!(h.transport.retry_counts(), vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_audit_message_carries_previous_value() {
    let h = harness().await;
    h.liveness.register(DEVICE, 1);

    h.engine.set_desired("alice", roffset("100")).await.unwrap();
    h.engine.set_desired("bob", roffset("200")).await.unwrap();

    let messages = h.telemetry.event_messages();
    assert_eq!(messages[1], "Changed roffset from 100 to 200 slot 0");
    assert_eq!(h.telemetry.events.lock().unwrap()[1].user, "bob");
}

#[tokio::test(start_paused = true)]
async fn test_reported_value_stops_chain() {
    let h = harness().await;
    h.liveness.register(DEVICE, 1);

    h.engine.set_desired("alice", roffset("2500")).await.unwrap();

    let decoded = h
        .engine
        .update_reported(DEVICE, 0, 3, &[0x00, 0x00, 0x09, 0xC4])
        .await
        .unwrap();
    assert_eq!(decoded, "2500");

    settle(20_000).await;
    assert_eq!(h.transport.sent().len(), 1);
    assert_eq!(h.engine.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_non_canonical_values_converge() {
    let h = harness().await;
    h.liveness.register(DEVICE, 1);

    let installd = SetDesiredRequest::new(DEVICE, 0, "installd", "true");
    h.engine.set_desired("alice", installd).await.unwrap();
    h.engine.set_desired("alice", roffset("0250")).await.unwrap();
    let txpower = SetDesiredRequest::new(DEVICE, 0, "txpower", "-010");
    h.engine.set_desired("alice", txpower).await.unwrap();

    let sent = h.transport.sent();
    assert_eq!(sent[0].payload, vec![0x00, 0x01]);
    assert_eq!(sent[1].payload, vec![0x00, 0x00, 0x00, 0xFA]);
    assert_eq!(sent[2].payload, vec![0xFF, 0xF6]);

    let value = h.store.desired_reported(DEVICE, 0, "installd").await.unwrap();
    assert_eq!(value.desired.as_deref(), Some("1"));
    assert_eq!(
        h.telemetry.event_messages()[1],
        "Changed roffset from  to 250 slot 0"
    );

    h.engine.update_reported(DEVICE, 0, 2, &[0x00, 0x01]).await.unwrap();
    h.engine
        .update_reported(DEVICE, 0, 3, &[0x00, 0x00, 0x00, 0xFA])
        .await
        .unwrap();
    h.engine.update_reported(DEVICE, 0, 4, &[0xFF, 0xF6]).await.unwrap();

    for name in ["installd", "roffset", "txpower"] {
        let value = h.store.desired_reported(DEVICE, 0, name).await.unwrap();
        assert!(!value.is_inconsistent(), "{} still inconsistent", name);
    }
    assert!(h.store.inconsistent_devices().await.unwrap().is_empty());

    settle(20_000).await;
    assert_eq!(h.transport.retry_counts(), vec![0, 0, 0]);
    assert_eq!(h.engine.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_general_field_resends_up_to_limit() {
    let h = harness().await;
    h.liveness.register(DEVICE, 1);

    h.engine.set_desired("alice", roffset("2500")).await.unwrap();

    // 25 + 2 * 540 + 4 * 3420 seconds of checks
    settle(14_784).await;
    assert_eq!(h.transport.retry_counts(), vec![0, 1, 2, 3, 4, 5, 6]);

    settle(20_000).await;
    assert_eq!(h.transport.retry_counts(), vec![0, 1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(h.engine.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_control_field_resends_three_times() {
    let h = harness().await;
    h.liveness.register(DEVICE, 1);

    let request = SetDesiredRequest::new(DEVICE, 0, "installd", "1");
    h.engine.set_desired("alice", request).await.unwrap();

    settle(31).await;
    assert_eq!(h.transport.retry_counts(), vec![0, 1]);

    settle(10_000).await;
    let sent = h.transport.sent();
    assert_eq!(h.transport.retry_counts(), vec![0, 1, 2, 3]);
    assert!(sent.iter().all(|c| c.payload == vec![0x00, 0x01]));
    assert_eq!(h.engine.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_late_resends_wait_for_window() {
    // Minute 3 of the ten-minute block, outside the 6,8 window
    let h = harness_with_window(window_at(3, 0)).await;
    h.liveness.register(DEVICE, 1);

    h.engine.set_desired("alice", roffset("2500")).await.unwrap();

    // Retry 1 is immediate, retry 2 waits at least 180 s after its check
    settle(25 + 540 + 179).await;
    assert_eq!(h.transport.retry_counts(), vec![0, 1]);

    settle(61).await;
    assert_eq!(h.transport.retry_counts(), vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_unregistered_device_is_deferred() {
    let h = harness().await;
    h.liveness.known_unregistered(DEVICE, 100);

    let outcome = h.engine.set_desired("alice", roffset("2500")).await.unwrap();
    assert_eq!(outcome, SetDesiredOutcome::Deferred);

    settle(1_000).await;
    assert!(h.transport.sent().is_empty());
    assert_eq!(h.engine.outstanding(), 0);

    let value = h
        .store
        .desired_reported(DEVICE, 0, "roffset")
        .await
        .unwrap();
    assert_eq!(value.pending(), Some("2500"));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_values_change_nothing() {
    let h = harness().await;
    h.liveness.register(DEVICE, 1);

    let err = h.engine.set_desired("alice", roffset("3500")).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::OutOfRange { value: 3500, .. })
    ));

    let err = h.engine.set_desired("alice", roffset("abc")).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::InvalidValue { .. })
    ));

    let err = h
        .engine
        .set_desired("alice", SetDesiredRequest::new(DEVICE, 0, "", "1"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::MissingFieldName)
    ));

    let err = h
        .engine
        .set_desired("alice", SetDesiredRequest::new(DEVICE, 0, "nosuchfield", "1"))
        .await
        .unwrap_err();
    assert!(!err.is_validation());

    assert!(h.transport.sent().is_empty());
    assert!(h.telemetry.event_messages().is_empty());
    assert!(h.store.device_config(DEVICE, 0).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_update_reported_decodes_without_sending() {
    let h = harness().await;
    h.liveness.register(DEVICE, 1);

    let value = h
        .engine
        .update_reported(DEVICE, 0, 4, &[0xFF, 0xF6])
        .await
        .unwrap();
    assert_eq!(value, "-10");

    let value = h
        .engine
        .update_reported(DEVICE, 0, 1, b"6,8\0")
        .await
        .unwrap();
    assert_eq!(value, "6,8");
    assert_eq!(h.store.reserved_minutes(DEVICE).await.unwrap(), "6,8");

    settle(1_000).await;
    assert!(h.transport.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_update_reported_rejects_short_payload() {
    let h = harness().await;

    let err = h
        .engine
        .update_reported(DEVICE, 0, 3, &[0x01])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Decode(_)));

    let value = h
        .store
        .desired_reported(DEVICE, 0, "roffset")
        .await
        .unwrap();
    assert_eq!(value.reported, None);
}

#[tokio::test(start_paused = true)]
async fn test_schedule_check_resumes_at_retry_count() {
    let h = harness().await;
    let field = h
        .store
        .schema_by_name("roffset", FIRMWARE, DocType::Main)
        .await
        .unwrap();
    h.store.set_desired(DEVICE, 0, &field, "40").await.unwrap();

    h.engine.schedule_check(DEVICE, 0, 3, 5).await.unwrap();

    settle(20_000).await;
    assert_eq!(h.transport.retry_counts(), vec![6, 7]);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_check_waits_for_window() {
    let h = harness_with_window(window_at(3, 0)).await;
    let field = h
        .store
        .schema_by_name("roffset", FIRMWARE, DocType::Main)
        .await
        .unwrap();
    h.store.set_desired(DEVICE, 0, &field, "40").await.unwrap();

    let started = h
        .engine
        .check_consistency_all_fields_for_device(DEVICE, 0)
        .await
        .unwrap();
    assert_eq!(started, 1);

    settle(179).await;
    assert!(h.transport.sent().is_empty());

    settle(61).await;
    let sent = h.transport.sent();
    assert_eq!(sent[0].retry_count, 0);
    assert_eq!(sent[0].payload, vec![0, 0, 0, 40]);
}

#[tokio::test(start_paused = true)]
async fn test_consistent_fields_start_nothing() {
    let h = harness().await;
    let field = h
        .store
        .schema_by_name("txpower", FIRMWARE, DocType::Main)
        .await
        .unwrap();
    h.store.set_desired(DEVICE, 0, &field, "5").await.unwrap();
    h.store.set_reported(DEVICE, 0, &field, "5").await.unwrap();

    let started = h
        .engine
        .check_consistency_all_fields_for_device(DEVICE, 0)
        .await
        .unwrap();
    assert_eq!(started, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_without_drain_cancels_chains() {
    let h = harness().await;
    h.liveness.register(DEVICE, 1);

    h.engine.set_desired("alice", roffset("2500")).await.unwrap();
    assert_eq!(h.engine.outstanding(), 1);

    h.engine.shutdown(false).await;
    assert!(h.engine.is_shutting_down());
    assert_eq!(h.engine.outstanding(), 0);

    settle(20_000).await;
    assert_eq!(h.transport.retry_counts(), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn test_drain_finishes_current_step_only() {
    let h = harness().await;
    h.liveness.register(DEVICE, 1);

    h.engine.set_desired("alice", roffset("2500")).await.unwrap();
    h.engine.shutdown(true).await;

    assert_eq!(h.engine.outstanding(), 0);
    assert_eq!(h.transport.retry_counts(), vec![0, 1]);
}
