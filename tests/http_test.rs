mod common;

use {
    axum::{
        Router,
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    },
    common::*,
    course_pay::{domain::payment::PaymentStatus, transport::http::router},
    serde_json::{Value, json},
    std::time::Duration,
    tower::ServiceExt,
    tower_http::timeout::TimeoutLayer,
};

const TOKEN: &str = "op-secret";

fn app(h: &Harness) -> Router {
    router(h.state(Some(TOKEN)))
}

async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn admin(mut req: Request<Body>, token: &str) -> Request<Body> {
    req.headers_mut()
        .insert("x-admin-token", token.parse().unwrap());
    req
}

fn purchase() -> Value {
    json!({
        "courseId": "course_9",
        "courseName": "Anatomia Humana",
        "amount": "1.00",
        "method": "pix",
        "userId": "user_1",
        "userEmail": "ana@example.com",
        "userName": "Ana Souza",
    })
}

// ── Health ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_check() {
    let h = Harness::new();
    let response = app(&h)
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), 64).await.unwrap();
    assert_eq!(&bytes[..], b"ok");
}

// ── POST /payments ─────────────────────────────────────────────────────────

#[tokio::test]
async fn create_pix_payment_returns_qr_code() {
    let h = Harness::new();

    let (status, body) = send(app(&h), post_json("/payments", purchase())).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["method"], "pix");
    assert_eq!(body["amount"], "1.00");
    assert_eq!(body["currency"], "BRL");
    assert_eq!(body["artifacts"]["type"], "pix");
    assert!(body["artifacts"]["qrCode"].as_str().is_some());
    assert_eq!(h.store.len(), 1);
}

#[tokio::test]
async fn numeric_amounts_are_accepted() {
    let h = Harness::new();
    let mut body = purchase();
    body["amount"] = json!(149.9);

    let (status, body) = send(app(&h), post_json("/payments", body)).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["amount"], "149.90");
}

#[tokio::test]
async fn create_card_payment_returns_redirect() {
    let h = Harness::new();
    let mut body = purchase();
    body["method"] = json!("card");

    let (status, body) = send(app(&h), post_json("/payments", body)).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["artifacts"]["type"], "checkout");
    assert!(body["artifacts"]["redirectUrl"].as_str().is_some());
    assert!(body["providerPaymentId"].is_null());
    assert_eq!(body["checkoutId"], "pref-1");
}

#[tokio::test]
async fn missing_field_is_a_validation_error() {
    let h = Harness::new();
    let mut body = purchase();
    body.as_object_mut().unwrap().remove("userEmail");

    let (status, body) = send(app(&h), post_json("/payments", body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "validation_error");
    assert!(h.store.is_empty());
    assert_eq!(h.provider.create_calls(), 0);
}

#[tokio::test]
async fn malformed_json_is_a_validation_error() {
    let h = Harness::new();
    let req = Request::post("/payments")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();

    let (status, body) = send(app(&h), req).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "validation_error");
}

#[tokio::test]
async fn provider_outage_is_retriable_for_the_client() {
    let h = Harness::new();
    h.provider.set_unavailable(true);

    let (status, body) = send(app(&h), post_json("/payments", purchase())).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error_code"], "provider_unavailable");
    assert!(h.store.is_empty());
}

// ── GET /payments/{id}/status ──────────────────────────────────────────────

#[tokio::test]
async fn polling_reconciles_an_approved_payment() {
    let h = Harness::new();
    let id = h.create_pix("user_1", "course_9").await;
    h.provider.set_status(id.as_str(), PaymentStatus::Approved);

    let uri = format!("/payments/{id}/status");
    let (status, body) = send(app(&h), Request::get(&uri).body(Body::empty()).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "approved");
    assert!(body["approvedAt"].as_str().is_some());
    assert_eq!(h.dispatched(), (1, 1, 1));
}

#[tokio::test]
async fn pending_status_has_no_approval_time() {
    let h = Harness::new();
    let id = h.create_pix("user_1", "course_9").await;

    let uri = format!("/payments/{id}/status");
    let (status, body) = send(app(&h), Request::get(&uri).body(Body::empty()).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "pending" }));
}

#[tokio::test]
async fn polling_is_cached_within_the_ttl() {
    let h = Harness::new();
    let id = h.create_pix("user_1", "course_9").await;
    let uri = format!("/payments/{id}/status");

    for _ in 0..3 {
        let (status, _) = send(app(&h), Request::get(&uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(h.provider.fetch_calls(), 1);

    h.clock.advance(chrono::Duration::seconds(4));
    send(app(&h), Request::get(&uri).body(Body::empty()).unwrap()).await;
    assert_eq!(h.provider.fetch_calls(), 2);
}

#[tokio::test]
async fn settled_payments_are_answered_locally() {
    let h = Harness::new();
    let id = h.create_pix("user_1", "course_9").await;
    h.reconciler
        .reconcile(&id, PaymentStatus::Approved, "webhook")
        .await
        .unwrap();

    let uri = format!("/payments/{id}/status");
    let (status, body) = send(app(&h), Request::get(&uri).body(Body::empty()).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "approved");
    assert_eq!(h.provider.fetch_calls(), 0);
}

#[tokio::test]
async fn provider_outage_during_poll_shows_stored_status() {
    let h = Harness::new();
    let id = h.create_pix("user_1", "course_9").await;
    h.provider.set_unavailable(true);

    let uri = format!("/payments/{id}/status");
    let (status, body) = send(app(&h), Request::get(&uri).body(Body::empty()).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
}

#[tokio::test]
async fn unknown_payment_is_not_found() {
    let h = Harness::new();

    let (status, body) = send(
        app(&h),
        Request::get("/payments/ghost-123/status")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "not_found");
    assert!(h.store.is_empty());
}

// ── POST /webhook ──────────────────────────────────────────────────────────

#[tokio::test]
async fn webhook_fetches_authoritative_status() {
    let h = Harness::new();
    let id = h.create_pix("user_1", "course_9").await;
    h.provider.set_status(id.as_str(), PaymentStatus::Approved);

    let (status, body) = send(
        app(&h),
        post_json(
            "/webhook",
            json!({ "type": "payment", "data": { "id": id.as_str() } }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true }));
    h.wait_for_status(&id, PaymentStatus::Approved).await;
    assert_eq!(h.dispatched(), (1, 1, 1));
}

#[tokio::test]
async fn draining_finishes_in_flight_webhooks() {
    let h = Harness::new();
    let id = h.create_pix("user_1", "course_9").await;
    h.provider.set_status(id.as_str(), PaymentStatus::Approved);
    h.mailer.set_delay(Duration::from_millis(100));

    let (status, _) = send(
        app(&h),
        post_json(
            "/webhook",
            json!({ "type": "payment", "data": { "id": id.as_str() } }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    h.tasks.drain().await;
    assert!(h.tasks.is_empty());
    assert!(h.record(&id).await.is_settled());
    assert_eq!(h.dispatched(), (1, 1, 1));
}

#[tokio::test]
async fn webhook_never_trusts_the_pushed_status() {
    let h = Harness::new();
    let id = h.create_pix("user_1", "course_9").await;

    let (status, _) = send(
        app(&h),
        post_json(
            "/webhook",
            json!({
                "type": "payment",
                "action": "payment.updated",
                "status": "approved",
                "data": { "id": id.as_str(), "status": "approved" },
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.provider.fetch_calls(), 1);
    assert_eq!(h.record(&id).await.status(), PaymentStatus::Pending);
    assert_eq!(h.dispatched(), (0, 0, 0));
}

#[tokio::test]
async fn webhook_accepts_numeric_ids() {
    let h = Harness::new();
    h.provider.set_status("123456789", PaymentStatus::Approved);

    let (status, _) = send(
        app(&h),
        post_json("/webhook", json!({ "type": "payment", "data": { "id": 123456789 } })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn webhook_without_data_id_is_rejected() {
    let h = Harness::new();

    let (status, body) = send(app(&h), post_json("/webhook", json!({ "type": "payment" }))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "validation_error");
}

#[tokio::test]
async fn webhook_for_unknown_payment_still_succeeds() {
    let h = Harness::new();

    let (status, body) = send(
        app(&h),
        post_json("/webhook", json!({ "type": "payment", "data": { "id": "ghost-123" } })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn webhook_ignores_other_topics() {
    let h = Harness::new();

    let (status, _) = send(
        app(&h),
        post_json(
            "/webhook",
            json!({ "type": "merchant_order", "data": { "id": "555" } }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(h.provider.fetch_calls(), 0);
}

// ── Admin ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn admin_routes_are_disabled_without_a_token() {
    let h = Harness::new();
    let app = router(h.state(None));

    let (status, body) = send(
        app,
        admin(
            Request::get("/admin/payments?email=ana@example.com")
                .body(Body::empty())
                .unwrap(),
            TOKEN,
        ),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_code"], "admin_disabled");
}

#[tokio::test]
async fn admin_routes_reject_a_wrong_token() {
    let h = Harness::new();

    let (status, _) = send(
        app(&h),
        admin(post_json("/admin/payments/mp-pix-1/approve", json!({})), "nope"),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_grant_creates_an_approved_free_record() {
    let h = Harness::new();

    let (status, body) = send(
        app(&h),
        admin(
            post_json(
                "/admin/grants",
                json!({
                    "userId": "user_7",
                    "userEmail": "caio@example.com",
                    "userName": "Caio",
                    "courseId": "course_2",
                    "courseName": "Bioquímica",
                }),
            ),
            TOKEN,
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "approved");
    assert_eq!(body["method"], "admin");
    assert_eq!(body["money"]["amount"], 0);
    assert_eq!(
        body["sideEffectsApplied"],
        json!(["entitlement", "invoice", "email"])
    );
    assert!(
        body["providerPaymentId"]
            .as_str()
            .unwrap()
            .starts_with("admin-")
    );
    assert_eq!(h.provider.create_calls(), 0);
}

#[tokio::test]
async fn admin_force_approve_runs_the_reconciler() {
    let h = Harness::new();
    let id = h.create_pix("user_1", "course_9").await;
    let uri = format!("/admin/payments/{id}/approve");

    let (status, body) = send(app(&h), admin(post_json(&uri, json!({})), TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["transition"], "advanced");
    assert_eq!(body["record"]["status"], "approved");

    let (status, body) = send(app(&h), admin(post_json(&uri, json!({})), TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["transition"], "unchanged");
    assert_eq!(body["applied"], json!([]));
    assert_eq!(h.dispatched(), (1, 1, 1));
}

#[tokio::test]
async fn request_timeout_does_not_cancel_the_reconcile() {
    let h = Harness::new();
    let id = h.create_pix("user_1", "course_9").await;
    h.mailer.set_delay(Duration::from_millis(300));
    let app = app(&h).layer(TimeoutLayer::new(Duration::from_millis(50)));

    let uri = format!("/admin/payments/{id}/approve");
    let (status, _) = send(app, admin(post_json(&uri, json!({})), TOKEN)).await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);

    h.tasks.drain().await;
    assert!(h.record(&id).await.is_settled());
    assert_eq!(h.dispatched(), (1, 1, 1));
    assert_eq!(h.mailer.attempts(), 1);
}

#[tokio::test]
async fn admin_approve_of_unknown_payment_is_not_found() {
    let h = Harness::new();

    let (status, _) = send(
        app(&h),
        admin(post_json("/admin/payments/ghost-123/approve", json!({})), TOKEN),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn admin_rerun_retries_missing_side_effects() {
    let h = Harness::new();
    let id = h.create_pix("user_1", "course_9").await;
    h.provider.set_status(id.as_str(), PaymentStatus::Approved);
    h.mailer.fail_next(1);
    h.reconciler
        .reconcile(&id, PaymentStatus::Approved, "webhook")
        .await
        .unwrap();

    let uri = format!("/admin/payments/{id}/reconcile");
    let (status, body) = send(app(&h), admin(post_json(&uri, json!({})), TOKEN)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["applied"], json!(["email"]));
    assert_eq!(body["failed"], json!([]));
    assert_eq!(h.dispatched(), (1, 1, 1));
}

#[tokio::test]
async fn admin_lookup_lists_records_for_an_email() {
    let h = Harness::new();
    h.create_pix("user_1", "course_9").await;
    h.create_pix("user_1", "course_3").await;

    let (status, body) = send(
        app(&h),
        admin(
            Request::get("/admin/payments?email=ANA@example.com")
                .body(Body::empty())
                .unwrap(),
            TOKEN,
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);

    let (status, _) = send(
        app(&h),
        admin(
            Request::get("/admin/payments").body(Body::empty()).unwrap(),
            TOKEN,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
