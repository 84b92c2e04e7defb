mod common;

use common::{call, click_fields, click_request, spawn_app};
use futures::future::join_all;
use tolov_core::domain::{CancelReason, Provider, TransactionState};

const ORDER: &str = "prem_7_1700000000";

fn prepare_id(response: &serde_json::Value) -> String {
    response["merchant_prepare_id"].as_i64().unwrap().to_string()
}

#[tokio::test]
async fn test_click_two_phase_payment() {
    let t = spawn_app(&[7]).await;

    let prepared = t
        .click(&click_fields("0", "5001", ORDER, "10000", None, "0"))
        .await;
    assert_eq!(prepared["error"], 0);
    assert_eq!(prepared["click_trans_id"], 5001);
    assert_eq!(prepared["merchant_trans_id"], ORDER);
    let prepare_id = prepare_id(&prepared);

    let row = t.core.inspect(Provider::Click, "5001").await.unwrap();
    assert_eq!(row.state, TransactionState::Created);
    assert_eq!(row.amount_minor, 1_000_000);

    let completed = t
        .click(&click_fields("1", "5001", ORDER, "10000", Some(&prepare_id), "0"))
        .await;
    assert_eq!(completed["error"], 0);
    assert_eq!(completed["merchant_confirm_id"].to_string(), prepare_id);
    assert_eq!(t.balance(7).await, 10_000);

    let replay = t
        .click(&click_fields("1", "5001", ORDER, "10000", Some(&prepare_id), "0"))
        .await;
    assert_eq!(replay["error"], -4);
    assert_eq!(t.balance(7).await, 10_000);
}

#[tokio::test]
async fn test_bad_signature_makes_no_core_call() {
    let t = spawn_app(&[7]).await;

    let mut fields = click_fields("0", "5001", ORDER, "10000", None, "0");
    for (name, value) in fields.iter_mut() {
        if *name == "sign_string" {
            *value = "0".repeat(32);
        }
    }

    let response = t.click(&fields).await;
    assert_eq!(response["error"], -1);
    assert!(response.get("merchant_prepare_id").is_none());
    assert!(t.repo.is_empty().await);
}

#[tokio::test]
async fn test_prepare_rejections() {
    let t = spawn_app(&[7]).await;

    let small = t.click(&click_fields("0", "5001", ORDER, "999", None, "0")).await;
    assert_eq!(small["error"], -2);

    let unknown_user = t
        .click(&click_fields("0", "5002", "prem_8_1700000000", "10000", None, "0"))
        .await;
    assert_eq!(unknown_user["error"], -5);

    let unknown_action = t.click(&click_fields("2", "5003", ORDER, "10000", None, "0")).await;
    assert_eq!(unknown_action["error"], -3);

    assert!(t.repo.is_empty().await);
}

#[tokio::test]
async fn test_prepare_for_paid_order_is_already_paid() {
    let t = spawn_app(&[7]).await;
    let prepared = t.click(&click_fields("0", "5001", ORDER, "10000", None, "0")).await;
    let id = prepare_id(&prepared);
    t.click(&click_fields("1", "5001", ORDER, "10000", Some(&id), "0")).await;

    let again = t.click(&click_fields("0", "5002", ORDER, "10000", None, "0")).await;
    assert_eq!(again["error"], -4);
}

#[tokio::test]
async fn test_complete_rejections() {
    let t = spawn_app(&[7]).await;

    let unknown = t
        .click(&click_fields("1", "6000", ORDER, "10000", Some("1"), "0"))
        .await;
    assert_eq!(unknown["error"], -6);

    let prepared = t.click(&click_fields("0", "5001", ORDER, "10000", None, "0")).await;
    let id = prepare_id(&prepared);

    let wrong_prepare = t
        .click(&click_fields("1", "5001", ORDER, "10000", Some("999"), "0"))
        .await;
    assert_eq!(wrong_prepare["error"], -6);

    let wrong_amount = t
        .click(&click_fields("1", "5001", ORDER, "20000", Some(&id), "0"))
        .await;
    assert_eq!(wrong_amount["error"], -2);

    assert_eq!(t.balance(7).await, 0);
}

#[tokio::test]
async fn test_click_reported_failure_cancels() {
    let t = spawn_app(&[7]).await;
    let prepared = t.click(&click_fields("0", "5001", ORDER, "10000", None, "0")).await;
    let id = prepare_id(&prepared);

    let failed = t
        .click(&click_fields("1", "5001", ORDER, "10000", Some(&id), "-5017"))
        .await;
    assert_eq!(failed["error"], -9);

    let row = t.core.inspect(Provider::Click, "5001").await.unwrap();
    assert_eq!(row.state, TransactionState::CancelledBeforeConfirm);
    assert_eq!(t.balance(7).await, 0);

    let retry = t
        .click(&click_fields("1", "5001", ORDER, "10000", Some(&id), "0"))
        .await;
    assert_eq!(retry["error"], -9);
}

#[tokio::test]
async fn test_complete_after_expiry_is_cancelled() {
    let t = spawn_app(&[7]).await;
    let prepared = t.click(&click_fields("0", "5001", ORDER, "10000", None, "0")).await;
    let id = prepare_id(&prepared);

    t.clock.advance(43_200_001);
    let completed = t
        .click(&click_fields("1", "5001", ORDER, "10000", Some(&id), "0"))
        .await;
    assert_eq!(completed["error"], -9);
    assert_eq!(t.balance(7).await, 0);
}

#[tokio::test]
async fn test_abandoned_prepare_does_not_block_order() {
    let t = spawn_app(&[7]).await;
    let first = t.click(&click_fields("0", "5001", ORDER, "10000", None, "0")).await;
    assert_eq!(first["error"], 0);

    t.clock.advance(5 * 24 * 60 * 60 * 1000);
    let second = t.click(&click_fields("0", "5002", ORDER, "10000", None, "0")).await;
    assert_eq!(second["error"], 0);

    let abandoned = t.core.inspect(Provider::Click, "5001").await.unwrap();
    assert_eq!(abandoned.state, TransactionState::CancelledBeforeConfirm);
    assert_eq!(abandoned.cancel_reason, Some(CancelReason::Timeout));

    let id = prepare_id(&second);
    let completed = t
        .click(&click_fields("1", "5002", ORDER, "10000", Some(&id), "0"))
        .await;
    assert_eq!(completed["error"], 0);
    assert_eq!(t.balance(7).await, 10_000);
}

#[tokio::test]
async fn test_prepare_rejects_fractional_sum() {
    let t = spawn_app(&[7]).await;
    let prepared = t.click(&click_fields("0", "5001", ORDER, "10000.5", None, "0")).await;
    assert_eq!(prepared["error"], -2);
    assert!(t.repo.is_empty().await);
}

#[tokio::test]
async fn test_prepare_rejects_malformed_click_trans_id() {
    let t = spawn_app(&[7]).await;
    let too_long = "9".repeat(65);
    let prepared = t.click(&click_fields("0", &too_long, ORDER, "10000", None, "0")).await;
    assert_eq!(prepared["error"], -8);
    assert!(t.repo.is_empty().await);
}

#[tokio::test]
async fn test_failure_after_success_keeps_payment() {
    let t = spawn_app(&[7]).await;
    let prepared = t.click(&click_fields("0", "5001", ORDER, "10000", None, "0")).await;
    let id = prepare_id(&prepared);
    t.click(&click_fields("1", "5001", ORDER, "10000", Some(&id), "0")).await;

    let late_failure = t
        .click(&click_fields("1", "5001", ORDER, "10000", Some(&id), "-5017"))
        .await;
    assert_eq!(late_failure["error"], -4);

    let row = t.core.inspect(Provider::Click, "5001").await.unwrap();
    assert_eq!(row.state, TransactionState::Confirmed);
    assert_eq!(t.balance(7).await, 10_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_completes_succeed_once() {
    let t = spawn_app(&[7]).await;
    let prepared = t.click(&click_fields("0", "5001", ORDER, "10000", None, "0")).await;
    let id = prepare_id(&prepared);

    let completes = (0..8).map(|_| {
        let app = t.app.clone();
        let request = click_request(&click_fields("1", "5001", ORDER, "10000", Some(&id), "0"));
        tokio::spawn(call(app, request))
    });
    let codes: Vec<i64> = join_all(completes)
        .await
        .into_iter()
        .map(|joined| joined.unwrap()["error"].as_i64().unwrap())
        .collect();

    assert_eq!(codes.iter().filter(|code| **code == 0).count(), 1);
    assert!(codes.iter().all(|code| *code == 0 || *code == -4));
    assert_eq!(t.balance(7).await, 10_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_success_and_failure_never_reverse_a_payment() {
    for round in 0..10 {
        let t = spawn_app(&[7]).await;
        let click_id = format!("{}", 6000 + round);
        let prepared = t.click(&click_fields("0", &click_id, ORDER, "10000", None, "0")).await;
        let id = prepare_id(&prepared);

        let completes = (0..6).map(|i| {
            let app = t.app.clone();
            let error = if i % 2 == 0 { "0" } else { "-5017" };
            let request =
                click_request(&click_fields("1", &click_id, ORDER, "10000", Some(&id), error));
            tokio::spawn(call(app, request))
        });
        let codes: Vec<i64> = join_all(completes)
            .await
            .into_iter()
            .map(|joined| joined.unwrap()["error"].as_i64().unwrap())
            .collect();

        let row = t.core.inspect(Provider::Click, &click_id).await.unwrap();
        match row.state {
            TransactionState::Confirmed => {
                assert_eq!(codes.iter().filter(|code| **code == 0).count(), 1);
                assert!(codes.iter().all(|code| *code == 0 || *code == -4));
                assert_eq!(t.balance(7).await, 10_000);
            }
            TransactionState::CancelledBeforeConfirm => {
                assert!(codes.iter().all(|code| *code == -9));
                assert_eq!(t.balance(7).await, 0);
            }
            other => panic!("unexpected state {:?} after racing completes", other),
        }
    }
}
