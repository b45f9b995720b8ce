use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

use super::auth::{AdminUser, AuthUser};
use super::error::{ApiJson, ApiQuery};
use super::models::{
    CreateOrderBody, CreateOrderResponse, DepositWithdrawBody, InstrumentView, LimitQuery,
    NewUser, OkResponse, OrderView, TransactionView, UserView,
};
use super::AppState;
use crate::domain::L2OrderBook;
use crate::error::{ExchangeError, Result};

fn parse_uuid(raw: &str, field: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ExchangeError::BadRequest(format!("Invalid {field} format")))
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

pub async fn metrics() -> Response {
    match crate::metrics::render() {
        Some(body) => ([(CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

// ----- public -------------------------------------------------------------

pub async fn register(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<NewUser>,
) -> Result<Json<UserView>> {
    let user = state.exchange.register(&body.name).await?;
    Ok(Json(user.into()))
}

pub async fn list_instruments(State(state): State<AppState>) -> Result<Json<Vec<InstrumentView>>> {
    let instruments = state.exchange.list_instruments().await?;
    Ok(Json(instruments.into_iter().map(Into::into).collect()))
}

pub async fn orderbook(
    State(state): State<AppState>,
    Path(ticker): Path<String>,
    ApiQuery(query): ApiQuery<LimitQuery>,
) -> Result<Json<L2OrderBook>> {
    let book = state.exchange.orderbook(&ticker, query.limit).await?;
    Ok(Json(book))
}

pub async fn transactions(
    State(state): State<AppState>,
    Path(ticker): Path<String>,
    ApiQuery(query): ApiQuery<LimitQuery>,
) -> Result<Json<Vec<TransactionView>>> {
    let trades = state.exchange.transactions(&ticker, query.limit).await?;
    Ok(Json(trades.into_iter().map(Into::into).collect()))
}

// ----- authenticated ------------------------------------------------------

pub async fn balances(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<BTreeMap<String, i64>>> {
    Ok(Json(state.exchange.balances(&user).await?))
}

pub async fn create_order(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ApiJson(body): ApiJson<CreateOrderBody>,
) -> Result<Json<CreateOrderResponse>> {
    let order_id = state.exchange.place_order(&user, body.into()).await?;
    Ok(Json(CreateOrderResponse {
        success: true,
        order_id,
    }))
}

pub async fn list_orders(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<OrderView>>> {
    let orders = state.exchange.list_orders(&user).await?;
    Ok(Json(orders.into_iter().map(Into::into).collect()))
}

pub async fn get_order(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(order_id): Path<String>,
) -> Result<Json<OrderView>> {
    let order_id = parse_uuid(&order_id, "order_id")?;
    let order = state.exchange.get_order(&user, order_id).await?;
    Ok(Json(order.into()))
}

pub async fn cancel_order(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(order_id): Path<String>,
) -> Result<Json<OkResponse>> {
    let order_id = parse_uuid(&order_id, "order_id")?;
    state.exchange.cancel_order(&user, order_id).await?;
    Ok(Json(OkResponse::ok()))
}

// ----- admin --------------------------------------------------------------

pub async fn delete_user(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(user_id): Path<String>,
) -> Result<Json<UserView>> {
    let user_id = parse_uuid(&user_id, "user_id")?;
    let user = state.exchange.delete_user(user_id).await?;
    Ok(Json(user.into()))
}

pub async fn add_instrument(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    ApiJson(body): ApiJson<InstrumentView>,
) -> Result<Json<OkResponse>> {
    state
        .exchange
        .add_instrument(&body.name, &body.ticker)
        .await?;
    Ok(Json(OkResponse::ok()))
}

pub async fn delete_instrument(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    Path(ticker): Path<String>,
) -> Result<Json<OkResponse>> {
    state.exchange.delete_instrument(&ticker).await?;
    Ok(Json(OkResponse::ok()))
}

pub async fn deposit(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    ApiJson(body): ApiJson<DepositWithdrawBody>,
) -> Result<Json<OkResponse>> {
    let user_id = parse_uuid(&body.user_id, "user_id")?;
    state
        .exchange
        .deposit(user_id, &body.ticker, body.amount)
        .await?;
    Ok(Json(OkResponse::ok()))
}

pub async fn withdraw(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    ApiJson(body): ApiJson<DepositWithdrawBody>,
) -> Result<Json<OkResponse>> {
    let user_id = parse_uuid(&body.user_id, "user_id")?;
    state
        .exchange
        .withdraw(user_id, &body.ticker, body.amount)
        .await?;
    Ok(Json(OkResponse::ok()))
}
