//! Black-box scenarios from the inventory core's testable-properties list,
//! driven through the real HTTP layer: empty-start add, idempotent reserve
//! replay, concurrent-race floor(supply/qty) success count, admin oversell
//! rejection, and a reserve/return/consume round trip.

use axum::body::{to_bytes, Body};
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use inventory_core::auth::AuthVerifier;
use inventory_core::codes;
use inventory_core::config::Config;
use inventory_core::db::Db;
use inventory_core::middleware::{RateLimitConfig, RateLimitLayer};
use inventory_core::{build_router, AppState};
use jsonwebtoken::jwk::{AlgorithmParameters, CommonParameters, Jwk, JwkSet, RSAKeyParameters, RSAKeyType};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tower::ServiceExt;
use uuid::Uuid;

// Test-only RSA-2048 keypair. Never used outside this file.
const TEST_PRIVATE_KEY_PEM: &str = include_str!("fixtures/test_key.pem");
const TEST_KEY_ID: &str = "test-key-1";
const TEST_MODULUS_N: &str = "vYXVyHxfQEvFgkOB5d7_TJxR2oaKZkm0GUOutGPnzbV2vtkeIKUHj0XXQ2gcgOm2VAqXs8nIag6YEWhiKZc_aMjHyGfQJ3rFKvppM6vlMtiFI7tDFpYE3_Xa5U4T6_bm160-I9eo5pohGwQMFWpW_NLm3zEhIOlpxJ_S4w67n0j9jUjrQfw5uJlSrSIGWS8TiP4ZRHJKiKiEUuiLQO8qEo6BdQVOnUhbrXopJDSK9HJKcdhkSm7iCHW6MJTaeGQEcdXEE8CWmt_VkdBX2Aenj6sSs8yh-U5Mb744Bk1sSu_RHyfu7mKpAR-WxGvPUaMNh8_kafsKqK_sEgqiixolyw";
const TEST_EXPONENT_E: &str = "AQAB";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TestClaims {
    sub: Uuid,
    exp: usize,
    roles: Vec<String>,
}

fn test_jwks() -> JwkSet {
    let jwk = Jwk {
        common: CommonParameters {
            key_id: Some(TEST_KEY_ID.to_string()),
            ..Default::default()
        },
        algorithm: AlgorithmParameters::RSA(RSAKeyParameters {
            key_type: RSAKeyType::RSA,
            n: TEST_MODULUS_N.to_string(),
            e: TEST_EXPONENT_E.to_string(),
        }),
    };
    JwkSet { keys: vec![jwk] }
}

fn mint_token(user_id: Uuid, roles: &[&str]) -> String {
    let exp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as usize
        + 3600;
    let claims = TestClaims {
        sub: user_id,
        exp,
        roles: roles.iter().map(|r| r.to_string()).collect(),
    };
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(TEST_KEY_ID.to_string());
    let key = EncodingKey::from_rsa_pem(TEST_PRIVATE_KEY_PEM.as_bytes()).unwrap();
    encode(&header, &claims, &key).unwrap()
}

struct Fixture {
    router: axum::Router,
    item_id: Uuid,
}

async fn setup() -> Fixture {
    let db = Db::open_in_memory().unwrap();
    let item_id = seed_item(&db).await;

    let config = Config {
        database_path: ":memory:".to_string(),
        public_bind_addr: "127.0.0.1:0".to_string(),
        internal_bind_addr: "127.0.0.1:0".to_string(),
        auth_jwks_url: "https://auth.invalid/jwks".to_string(),
        auth_issuer: None,
        auth_revocation_url: None,
        production_recipe_source_url: None,
        classifier_cache_ttl: Duration::from_secs(60),
        balance_cache_ttl: Duration::from_secs(3600),
    };

    let verifier = AuthVerifier::for_testing(test_jwks(), None);
    let state = AppState::build(db.clone(), config, verifier);

    // Generous enough that scenario_3's 50 concurrent requests from one IP
    // exercise the reservation engine's own concurrency control, not the
    // rate limiter's.
    let rate_limiter = RateLimitLayer::new(RateLimitConfig {
        max_requests: 10_000,
        window: Duration::from_secs(60),
        burst: 0,
    });

    let router = build_router(state, rate_limiter);

    Fixture { router, item_id }
}

/// Item-specific classifiers (`item_class`, `collections`, `quality_levels`)
/// aren't part of the fixed seed data, since a real deployment's catalog
/// defines its own per-game vocabulary there.
async fn seed_item(db: &Db) -> Uuid {
    let conn = db.conn.lock().await;

    let item_class_classifier = Uuid::new_v4();
    conn.execute(
        "INSERT INTO classifiers (id, code) VALUES (?1, 'item_class')",
        params![item_class_classifier.to_string()],
    )
    .unwrap();
    let item_class = Uuid::new_v4();
    conn.execute(
        "INSERT INTO classifier_items (id, classifier_id, code) VALUES (?1, ?2, 'resource')",
        params![item_class.to_string(), item_class_classifier.to_string()],
    )
    .unwrap();

    let collections_classifier = Uuid::new_v4();
    conn.execute(
        "INSERT INTO classifiers (id, code) VALUES (?1, 'collections')",
        params![collections_classifier.to_string()],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO classifier_items (id, classifier_id, code) VALUES (?1, ?2, 'base')",
        params![Uuid::new_v4().to_string(), collections_classifier.to_string()],
    )
    .unwrap();

    let quality_classifier = Uuid::new_v4();
    conn.execute(
        "INSERT INTO classifiers (id, code) VALUES (?1, 'quality_levels')",
        params![quality_classifier.to_string()],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO classifier_items (id, classifier_id, code) VALUES (?1, ?2, 'base')",
        params![Uuid::new_v4().to_string(), quality_classifier.to_string()],
    )
    .unwrap();

    let item_id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO items (id, item_class_id, item_type_id, quality_levels_classifier_id, collections_classifier_id)
         VALUES (?1, ?2, ?2, ?3, ?4)",
        params![
            item_id.to_string(),
            item_class.to_string(),
            quality_classifier.to_string(),
            collections_classifier.to_string()
        ],
    )
    .unwrap();

    item_id
}

fn json_request(method: &str, uri: &str, token: &str, body: Option<Value>) -> Request<Body> {
    let body = match body {
        Some(v) => Body::from(v.to_string()),
        None => Body::empty(),
    };
    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {token}"))
        .body(body)
        .unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 0))));
    request
}

async fn send(router: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn inventory(router: &axum::Router, token: &str, section: &str) -> Value {
    let (status, body) = send(
        router,
        json_request("GET", &format!("/inventory?section={section}"), token, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "GET /inventory failed: {body:?}");
    body
}

fn quantity_for(inventory: &Value, item_id: Uuid) -> i64 {
    inventory["items"]
        .as_array()
        .unwrap()
        .iter()
        .find(|row| row["item_id"] == item_id.to_string())
        .and_then(|row| row["quantity"].as_i64())
        .unwrap_or(0)
}

#[tokio::test]
async fn scenario_1_empty_start_add() {
    let fixture = setup().await;
    let user_id = Uuid::new_v4();
    let admin_token = mint_token(Uuid::new_v4(), &["admin"]);
    let player_token = mint_token(user_id, &[]);

    let (status, _) = send(
        &fixture.router,
        json_request(
            "POST",
            "/inventory/add-items",
            &admin_token,
            Some(json!({
                "user_id": user_id,
                "operation_id": Uuid::new_v4(),
                "items": [{
                    "item_id": fixture.item_id,
                    "collection": null,
                    "quality_level": null,
                    "quantity": 100,
                }],
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let main = inventory(&fixture.router, &player_token, codes::SECTION_MAIN).await;
    assert_eq!(quantity_for(&main, fixture.item_id), 100);
}

#[tokio::test]
async fn scenario_2_reserve_is_idempotent() {
    let fixture = setup().await;
    let user_id = Uuid::new_v4();
    let admin_token = mint_token(Uuid::new_v4(), &["admin"]);
    let player_token = mint_token(user_id, &[]);

    send(
        &fixture.router,
        json_request(
            "POST",
            "/inventory/add-items",
            &admin_token,
            Some(json!({
                "user_id": user_id,
                "operation_id": Uuid::new_v4(),
                "items": [{"item_id": fixture.item_id, "collection": null, "quality_level": null, "quantity": 100}],
            })),
        ),
    )
    .await;

    let operation_id = Uuid::new_v4();
    let reserve_body = json!({
        "operation_id": operation_id,
        "items": [{"item_id": fixture.item_id, "collection": null, "quality_level": null, "quantity": 40}],
    });

    let (status1, first) = send(
        &fixture.router,
        json_request("POST", "/inventory/reserve", &player_token, Some(reserve_body.clone())),
    )
    .await;
    assert_eq!(status1, StatusCode::OK);

    let (status2, second) = send(
        &fixture.router,
        json_request("POST", "/inventory/reserve", &player_token, Some(reserve_body)),
    )
    .await;
    assert_eq!(status2, StatusCode::OK);
    assert_eq!(first["operation_ids"], second["operation_ids"]);

    let (status, status_body) = send(
        &fixture.router,
        json_request(
            "GET",
            &format!("/inventory/reservation-status/{operation_id}"),
            &player_token,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(status_body["status"], "active");
    assert_eq!(status_body["user_id"], user_id.to_string());

    let main = inventory(&fixture.router, &player_token, codes::SECTION_MAIN).await;
    let factory = inventory(&fixture.router, &player_token, codes::SECTION_FACTORY).await;
    assert_eq!(quantity_for(&main, fixture.item_id), 60);
    assert_eq!(quantity_for(&factory, fixture.item_id), 40);
}

#[tokio::test]
async fn scenario_3_concurrent_reserve_race_floor() {
    let fixture = setup().await;
    let user_id = Uuid::new_v4();
    let admin_token = mint_token(Uuid::new_v4(), &["admin"]);
    let player_token = mint_token(user_id, &[]);

    send(
        &fixture.router,
        json_request(
            "POST",
            "/inventory/add-items",
            &admin_token,
            Some(json!({
                "user_id": user_id,
                "operation_id": Uuid::new_v4(),
                "items": [{"item_id": fixture.item_id, "collection": null, "quality_level": null, "quantity": 10}],
            })),
        ),
    )
    .await;

    let mut handles = Vec::new();
    for _ in 0..50 {
        let router = fixture.router.clone();
        let token = player_token.clone();
        let item_id = fixture.item_id;
        handles.push(tokio::spawn(async move {
            let request = json_request(
                "POST",
                "/inventory/reserve",
                &token,
                Some(json!({
                    "operation_id": Uuid::new_v4(),
                    "items": [{"item_id": item_id, "collection": null, "quality_level": null, "quantity": 3}],
                })),
            );
            router.oneshot(request).await.unwrap().status()
        }));
    }

    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap() == StatusCode::OK {
            successes += 1;
        }
    }

    // floor(10/3) = 3
    assert_eq!(successes, 3);

    let main = inventory(&fixture.router, &player_token, codes::SECTION_MAIN).await;
    assert_eq!(quantity_for(&main, fixture.item_id), 1);
}

#[tokio::test]
async fn scenario_4_admin_oversell_rejected() {
    let fixture = setup().await;
    let user_id = Uuid::new_v4();
    let admin_token = mint_token(Uuid::new_v4(), &["admin"]);
    let player_token = mint_token(user_id, &[]);

    send(
        &fixture.router,
        json_request(
            "POST",
            "/inventory/add-items",
            &admin_token,
            Some(json!({
                "user_id": user_id,
                "operation_id": Uuid::new_v4(),
                "items": [{"item_id": fixture.item_id, "collection": null, "quality_level": null, "quantity": 5}],
            })),
        ),
    )
    .await;

    let (status, _) = send(
        &fixture.router,
        json_request(
            "POST",
            "/admin/inventory/adjust",
            &admin_token,
            Some(json!({
                "user_id": user_id,
                "section": codes::SECTION_MAIN,
                "items": [{"item_id": fixture.item_id, "collection": null, "quality_level": null, "quantity_change": -6}],
                "reason": "oversell test",
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let main = inventory(&fixture.router, &player_token, codes::SECTION_MAIN).await;
    assert_eq!(quantity_for(&main, fixture.item_id), 5);
}

#[tokio::test]
async fn reserve_exact_balance_succeeds_one_more_fails() {
    let fixture = setup().await;
    let user_id = Uuid::new_v4();
    let admin_token = mint_token(Uuid::new_v4(), &["admin"]);
    let player_token = mint_token(user_id, &[]);

    send(
        &fixture.router,
        json_request(
            "POST",
            "/inventory/add-items",
            &admin_token,
            Some(json!({
                "user_id": user_id,
                "operation_id": Uuid::new_v4(),
                "items": [{"item_id": fixture.item_id, "collection": null, "quality_level": null, "quantity": 10}],
            })),
        ),
    )
    .await;

    let (exact_status, _) = send(
        &fixture.router,
        json_request(
            "POST",
            "/inventory/reserve",
            &player_token,
            Some(json!({
                "operation_id": Uuid::new_v4(),
                "items": [{"item_id": fixture.item_id, "collection": null, "quality_level": null, "quantity": 10}],
            })),
        ),
    )
    .await;
    assert_eq!(exact_status, StatusCode::OK);

    let (one_more_status, _) = send(
        &fixture.router,
        json_request(
            "POST",
            "/inventory/reserve",
            &player_token,
            Some(json!({
                "operation_id": Uuid::new_v4(),
                "items": [{"item_id": fixture.item_id, "collection": null, "quality_level": null, "quantity": 1}],
            })),
        ),
    )
    .await;
    assert_eq!(one_more_status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn return_then_consume_round_trip() {
    let fixture = setup().await;
    let user_id = Uuid::new_v4();
    let admin_token = mint_token(Uuid::new_v4(), &["admin"]);
    let player_token = mint_token(user_id, &[]);

    send(
        &fixture.router,
        json_request(
            "POST",
            "/inventory/add-items",
            &admin_token,
            Some(json!({
                "user_id": user_id,
                "operation_id": Uuid::new_v4(),
                "items": [{"item_id": fixture.item_id, "collection": null, "quality_level": null, "quantity": 50}],
            })),
        ),
    )
    .await;

    let op_id = Uuid::new_v4();
    let (reserve_status, _) = send(
        &fixture.router,
        json_request(
            "POST",
            "/inventory/reserve",
            &player_token,
            Some(json!({
                "operation_id": op_id,
                "items": [{"item_id": fixture.item_id, "collection": null, "quality_level": null, "quantity": 20}],
            })),
        ),
    )
    .await;
    assert_eq!(reserve_status, StatusCode::OK);

    let (return_status, _) = send(
        &fixture.router,
        json_request(
            "POST",
            "/inventory/return-reserve",
            &player_token,
            Some(json!({ "operation_id": op_id })),
        ),
    )
    .await;
    assert_eq!(return_status, StatusCode::OK);

    let main = inventory(&fixture.router, &player_token, codes::SECTION_MAIN).await;
    let factory = inventory(&fixture.router, &player_token, codes::SECTION_FACTORY).await;
    assert_eq!(quantity_for(&main, fixture.item_id), 50);
    assert_eq!(quantity_for(&factory, fixture.item_id), 0);

    // A finalized reservation cannot be finalized again.
    let (second_return_status, _) = send(
        &fixture.router,
        json_request(
            "POST",
            "/inventory/return-reserve",
            &player_token,
            Some(json!({ "operation_id": op_id })),
        ),
    )
    .await;
    assert_eq!(second_return_status, StatusCode::CONFLICT);

    // Another user can't return it either, even knowing the operation id —
    // it's reported as not-found rather than leaking that it belongs to
    // someone else.
    let other_token = mint_token(Uuid::new_v4(), &[]);
    let (other_status, _) = send(
        &fixture.router,
        json_request(
            "POST",
            "/inventory/return-reserve",
            &other_token,
            Some(json!({ "operation_id": op_id })),
        ),
    )
    .await;
    assert_eq!(other_status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn consume_drains_factory_balance() {
    let fixture = setup().await;
    let user_id = Uuid::new_v4();
    let admin_token = mint_token(Uuid::new_v4(), &["admin"]);
    let player_token = mint_token(user_id, &[]);

    send(
        &fixture.router,
        json_request(
            "POST",
            "/inventory/add-items",
            &admin_token,
            Some(json!({
                "user_id": user_id,
                "operation_id": Uuid::new_v4(),
                "items": [{"item_id": fixture.item_id, "collection": null, "quality_level": null, "quantity": 50}],
            })),
        ),
    )
    .await;

    let op_id = Uuid::new_v4();
    send(
        &fixture.router,
        json_request(
            "POST",
            "/inventory/reserve",
            &player_token,
            Some(json!({
                "operation_id": op_id,
                "items": [{"item_id": fixture.item_id, "collection": null, "quality_level": null, "quantity": 20}],
            })),
        ),
    )
    .await;

    let (consume_status, _) = send(
        &fixture.router,
        json_request(
            "POST",
            "/inventory/consume-reserve",
            &player_token,
            Some(json!({ "operation_id": op_id })),
        ),
    )
    .await;
    assert_eq!(consume_status, StatusCode::OK);

    let (status, status_body) = send(
        &fixture.router,
        json_request(
            "GET",
            &format!("/inventory/reservation-status/{op_id}"),
            &player_token,
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(status_body["status"], "consumed");

    let factory = inventory(&fixture.router, &player_token, codes::SECTION_FACTORY).await;
    assert_eq!(quantity_for(&factory, fixture.item_id), 0);
}
