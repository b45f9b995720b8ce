use anyhow::Result;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use tochka_exchange::config::ExchangeConfig;
use tochka_exchange::engine::Exchange;
use tochka_exchange::server::{create_router, AppState};
use tochka_exchange::storage::InMemoryStorage;

const ADMIN_TOKEN: &str = "test-admin-token";

async fn test_app() -> Result<Router> {
    let exchange = Arc::new(Exchange::new(
        Arc::new(InMemoryStorage::new()),
        ExchangeConfig::default(),
    ));
    exchange.bootstrap(ADMIN_TOKEN).await?;
    Ok(create_router(AppState::new(exchange)))
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> Result<(StatusCode, Value)> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("TOKEN {token}"));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))?,
        None => builder.body(Body::empty())?,
    };

    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await?;
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    Ok((status, value))
}

async fn register(app: &Router, name: &str) -> Result<(String, String)> {
    let (status, user) = call(
        app,
        Method::POST,
        "/api/v1/public/register",
        None,
        Some(json!({ "name": name })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    Ok((
        user["id"].as_str().unwrap_or_default().to_string(),
        user["api_key"].as_str().unwrap_or_default().to_string(),
    ))
}

async fn deposit(app: &Router, user_id: &str, ticker: &str, amount: i64) -> Result<()> {
    let (status, body) = call(
        app,
        Method::POST,
        "/api/v1/admin/balance/deposit",
        Some(ADMIN_TOKEN),
        Some(json!({ "user_id": user_id, "ticker": ticker, "amount": amount })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK, "{body}");
    Ok(())
}

async fn list_memcoin(app: &Router) -> Result<()> {
    let (status, _) = call(
        app,
        Method::POST,
        "/api/v1/admin/instrument",
        Some(ADMIN_TOKEN),
        Some(json!({ "name": "Meme Coin", "ticker": "MEMCOIN" })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn test_health_and_seeded_instruments() -> Result<()> {
    let app = test_app().await?;

    let (status, body) = call(&app, Method::GET, "/health", None, None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "healthy" }));

    let (status, body) = call(&app, Method::GET, "/api/v1/public/instrument", None, None).await?;
    assert_eq!(status, StatusCode::OK);
    let tickers: Vec<&str> = body
        .as_array()
        .map(|items| items.iter().filter_map(|i| i["ticker"].as_str()).collect())
        .unwrap_or_default();
    assert!(tickers.contains(&"RUB"));
    assert!(tickers.contains(&"USD"));
    Ok(())
}

#[tokio::test]
async fn test_register_returns_user_with_key() -> Result<()> {
    let app = test_app().await?;

    let (status, user) = call(
        &app,
        Method::POST,
        "/api/v1/public/register",
        None,
        Some(json!({ "name": "Alice" })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(user["name"], "Alice");
    assert_eq!(user["role"], "USER");
    assert!(user["api_key"].as_str().unwrap_or_default().starts_with("key-"));

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/v1/public/register",
        None,
        Some(json!({ "name": "Al" })),
    )
    .await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["detail"].is_string());
    Ok(())
}

#[tokio::test]
async fn test_malformed_body_is_unprocessable() -> Result<()> {
    let app = test_app().await?;
    let (_, key) = register(&app, "Mallory").await?;

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/v1/order",
        Some(&key),
        Some(json!({ "direction": "HOLD", "ticker": "MEMCOIN", "qty": 1 })),
    )
    .await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["detail"].is_string());
    Ok(())
}

#[tokio::test]
async fn test_authentication_and_authorization() -> Result<()> {
    let app = test_app().await?;
    let (_, key) = register(&app, "Bob").await?;

    let (status, _) = call(&app, Method::GET, "/api/v1/balance", None, None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(&app, Method::GET, "/api/v1/balance", Some("nope"), None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/api/v1/balance")
        .header(header::AUTHORIZATION, format!("Bearer {key}"))
        .body(Body::empty())?;
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let (status, balances) = call(&app, Method::GET, "/api/v1/balance", Some(&key), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(balances.is_object());

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/v1/admin/instrument",
        Some(&key),
        Some(json!({ "name": "Meme Coin", "ticker": "MEMCOIN" })),
    )
    .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["detail"].is_string());
    Ok(())
}

#[tokio::test]
async fn test_instrument_administration() -> Result<()> {
    let app = test_app().await?;
    list_memcoin(&app).await?;

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/v1/admin/instrument",
        Some(ADMIN_TOKEN),
        Some(json!({ "name": "Again", "ticker": "MEMCOIN" })),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/v1/admin/instrument",
        Some(ADMIN_TOKEN),
        Some(json!({ "name": "Lower", "ticker": "lower" })),
    )
    .await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = call(
        &app,
        Method::DELETE,
        "/api/v1/admin/instrument/MEMCOIN",
        Some(ADMIN_TOKEN),
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(
        &app,
        Method::DELETE,
        "/api/v1/admin/instrument/MEMCOIN",
        Some(ADMIN_TOKEN),
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_limit_and_market_orders_trade() -> Result<()> {
    let app = test_app().await?;
    list_memcoin(&app).await?;

    let (seller_id, seller) = register(&app, "Seller").await?;
    let (buyer_id, buyer) = register(&app, "Buyer").await?;
    deposit(&app, &seller_id, "MEMCOIN", 10).await?;
    deposit(&app, &buyer_id, "RUB", 1000).await?;

    let (status, placed) = call(
        &app,
        Method::POST,
        "/api/v1/order",
        Some(&seller),
        Some(json!({ "direction": "SELL", "ticker": "MEMCOIN", "qty": 5, "price": 100 })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(placed["success"], true);
    let sell_id = placed["order_id"].as_str().unwrap_or_default().to_string();

    let (status, book) = call(
        &app,
        Method::GET,
        "/api/v1/public/orderbook/MEMCOIN",
        None,
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(book["ask_levels"], json!([{ "price": 100, "qty": 5 }]));
    assert_eq!(book["bid_levels"], json!([]));

    let (status, placed) = call(
        &app,
        Method::POST,
        "/api/v1/order",
        Some(&buyer),
        Some(json!({ "direction": "BUY", "ticker": "MEMCOIN", "qty": 3 })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    let buy_id = placed["order_id"].as_str().unwrap_or_default().to_string();

    let (_, buyer_balances) = call(&app, Method::GET, "/api/v1/balance", Some(&buyer), None).await?;
    assert_eq!(buyer_balances["MEMCOIN"], 3);
    assert_eq!(buyer_balances["RUB"], 700);

    let (_, seller_balances) = call(&app, Method::GET, "/api/v1/balance", Some(&seller), None).await?;
    assert_eq!(seller_balances["MEMCOIN"], 7);
    assert_eq!(seller_balances["RUB"], 300);

    let (status, sell_order) = call(
        &app,
        Method::GET,
        &format!("/api/v1/order/{sell_id}"),
        Some(&seller),
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sell_order["status"], "PARTIALLY_EXECUTED");
    assert_eq!(sell_order["filled"], 3);
    assert_eq!(sell_order["body"]["price"], 100);

    let (_, buy_order) = call(
        &app,
        Method::GET,
        &format!("/api/v1/order/{buy_id}"),
        Some(&buyer),
        None,
    )
    .await?;
    assert_eq!(buy_order["status"], "EXECUTED");
    assert!(buy_order.get("filled").is_none());

    // Orders are private to their owner.
    let (status, _) = call(
        &app,
        Method::GET,
        &format!("/api/v1/order/{sell_id}"),
        Some(&buyer),
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, trades) = call(
        &app,
        Method::GET,
        "/api/v1/public/transactions/MEMCOIN?limit=5",
        None,
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    let trades = trades.as_array().cloned().unwrap_or_default();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0]["amount"], 3);
    assert_eq!(trades[0]["price"], 100);
    assert_eq!(trades[0]["ticker"], "MEMCOIN");

    let (_, orders) = call(&app, Method::GET, "/api/v1/order", Some(&seller), None).await?;
    assert_eq!(orders.as_array().map(Vec::len), Some(1));
    Ok(())
}

#[tokio::test]
async fn test_funds_are_checked_and_reserved() -> Result<()> {
    let app = test_app().await?;
    list_memcoin(&app).await?;
    let (user_id, key) = register(&app, "Trader").await?;
    deposit(&app, &user_id, "RUB", 500).await?;
    deposit(&app, &user_id, "MEMCOIN", 4).await?;

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/v1/order",
        Some(&key),
        Some(json!({ "direction": "BUY", "ticker": "MEMCOIN", "qty": 10, "price": 100 })),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap_or_default().contains("insufficient"));

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/v1/order",
        Some(&key),
        Some(json!({ "direction": "SELL", "ticker": "MEMCOIN", "qty": 3, "price": 50 })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);

    // Three of four units are held by the resting sell.
    let (status, _) = call(
        &app,
        Method::POST,
        "/api/v1/admin/balance/withdraw",
        Some(ADMIN_TOKEN),
        Some(json!({ "user_id": user_id, "ticker": "MEMCOIN", "amount": 2 })),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/v1/admin/balance/withdraw",
        Some(ADMIN_TOKEN),
        Some(json!({ "user_id": user_id, "ticker": "MEMCOIN", "amount": 1 })),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/v1/order",
        Some(&key),
        Some(json!({ "direction": "BUY", "ticker": "RUB", "qty": 1, "price": 1 })),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/v1/order",
        Some(&key),
        Some(json!({ "direction": "BUY", "ticker": "NOPE", "qty": 1, "price": 1 })),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_cancel_order() -> Result<()> {
    let app = test_app().await?;
    list_memcoin(&app).await?;
    let (user_id, key) = register(&app, "Canceller").await?;
    deposit(&app, &user_id, "RUB", 1000).await?;

    let (_, placed) = call(
        &app,
        Method::POST,
        "/api/v1/order",
        Some(&key),
        Some(json!({ "direction": "BUY", "ticker": "MEMCOIN", "qty": 2, "price": 10 })),
    )
    .await?;
    let order_id = placed["order_id"].as_str().unwrap_or_default().to_string();
    let uri = format!("/api/v1/order/{order_id}");

    let (status, body) = call(&app, Method::DELETE, &uri, Some(&key), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true }));

    let (_, order) = call(&app, Method::GET, &uri, Some(&key), None).await?;
    assert_eq!(order["status"], "CANCELLED");

    let (status, _) = call(&app, Method::DELETE, &uri, Some(&key), None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, book) = call(
        &app,
        Method::GET,
        "/api/v1/public/orderbook/MEMCOIN",
        None,
        None,
    )
    .await?;
    assert_eq!(book["bid_levels"], json!([]));

    let (status, body) = call(&app, Method::DELETE, "/api/v1/order/not-a-uuid", Some(&key), None).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "Invalid order_id format");
    Ok(())
}

#[tokio::test]
async fn test_admin_balance_errors() -> Result<()> {
    let app = test_app().await?;
    let (user_id, _) = register(&app, "Carol").await?;

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/v1/admin/balance/deposit",
        Some(ADMIN_TOKEN),
        Some(json!({ "user_id": user_id, "ticker": "RUB", "amount": 0 })),
    )
    .await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/v1/admin/balance/deposit",
        Some(ADMIN_TOKEN),
        Some(json!({ "user_id": user_id, "ticker": "NOPE", "amount": 5 })),
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/v1/admin/balance/deposit",
        Some(ADMIN_TOKEN),
        Some(json!({ "user_id": uuid::Uuid::new_v4().to_string(), "ticker": "RUB", "amount": 5 })),
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/v1/admin/balance/deposit",
        Some(ADMIN_TOKEN),
        Some(json!({ "user_id": "42", "ticker": "RUB", "amount": 5 })),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "Invalid user_id format");
    Ok(())
}

#[tokio::test]
async fn test_delete_user_revokes_key() -> Result<()> {
    let app = test_app().await?;
    let (user_id, key) = register(&app, "Dave").await?;

    let (status, deleted) = call(
        &app,
        Method::DELETE,
        &format!("/api/v1/admin/user/{user_id}"),
        Some(ADMIN_TOKEN),
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["id"], user_id.as_str());

    let (status, _) = call(&app, Method::GET, "/api/v1/balance", Some(&key), None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(
        &app,
        Method::DELETE,
        &format!("/api/v1/admin/user/{user_id}"),
        Some(ADMIN_TOKEN),
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_query_limits() -> Result<()> {
    let app = test_app().await?;

    let (status, _) = call(
        &app,
        Method::GET,
        "/api/v1/public/orderbook/MEMCOIN?limit=-1",
        None,
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, trades) = call(
        &app,
        Method::GET,
        "/api/v1/public/transactions/MEMCOIN?limit=1000",
        None,
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(trades, json!([]));

    for uri in [
        "/api/v1/public/orderbook/USD?limit=abc",
        "/api/v1/public/transactions/USD?limit=1.5",
    ] {
        let (status, body) = call(&app, Method::GET, uri, None, None).await?;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{uri}");
        assert!(body["detail"].is_string(), "{uri}: {body}");
    }
    Ok(())
}

#[tokio::test]
async fn test_deposit_overflow_is_rejected() -> Result<()> {
    let app = test_app().await?;
    let (user_id, api_key) = register(&app, "Whale").await?;
    deposit(&app, &user_id, "RUB", i64::MAX).await?;

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/v1/admin/balance/deposit",
        Some(ADMIN_TOKEN),
        Some(json!({ "user_id": user_id, "ticker": "RUB", "amount": 1 })),
    )
    .await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["detail"], "balance overflows");

    let (status, balances) = call(&app, Method::GET, "/api/v1/balance", Some(&api_key), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(balances["RUB"], json!(i64::MAX));
    Ok(())
}
