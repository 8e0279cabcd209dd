/// HTTP control surfaces.
///
/// Two listeners, one router each: the admin API (user/mode/schedule/
/// payment administration, X-Api-Token) and the internal proxy API
/// (health + targeted port reload, X-Proxy-Token). An empty configured
/// token disables the check for that surface.
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::control::ControlPlane;

#[derive(Clone)]
pub struct ApiState {
    control: Arc<ControlPlane>,
    token: Arc<String>,
    token_header: &'static str,
}

impl ApiState {
    fn deny(&self, headers: &HeaderMap) -> Option<Response> {
        if self.token.is_empty() {
            return None;
        }
        let presented = headers
            .get(self.token_header)
            .and_then(|v| v.to_str().ok());
        if presented == Some(self.token.as_str()) {
            None
        } else {
            Some(
                (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"})))
                    .into_response(),
            )
        }
    }
}

pub fn admin_router(control: Arc<ControlPlane>, token: String) -> Router {
    let state = ApiState {
        control,
        token: Arc::new(token),
        token_header: "X-Api-Token",
    };
    Router::new()
        .route("/health", get(health))
        .route("/freerange", get(freerange))
        .route("/users", get(list_users))
        .route("/admin/add-user", post(add_user))
        .route("/admin/set-port", post(set_port))
        .route("/admin/set-subscription", post(set_subscription))
        .route("/admin/extend-subscription", post(extend_subscription))
        .route("/users/:tg_id/modes", get(list_modes).post(add_mode))
        .route("/users/:tg_id/set-login", post(set_login))
        .route("/users/:tg_id/modes/:mode_id/activate", post(activate_mode))
        .route("/users/:tg_id/modes/:mode_id", delete(delete_mode))
        .route("/users/:tg_id/schedules", get(list_schedules).post(add_schedule))
        .route("/users/:tg_id/schedules/:schedule_id", delete(delete_schedule))
        .route("/admin/payments", get(list_payments))
        .route("/admin/payment-update", post(payment_update))
        .route("/proxy/reload-port", post(reload_port))
        .with_state(state)
}

/// The surface the admin API of a split deployment calls back into.
pub fn proxy_router(control: Arc<ControlPlane>, token: String) -> Router {
    let state = ApiState {
        control,
        token: Arc::new(token),
        token_header: "X-Proxy-Token",
    };
    Router::new()
        .route("/health", get(health))
        .route("/reload-port", post(reload_port))
        .with_state(state)
}

async fn health(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if let Some(deny) = state.deny(&headers) {
        return deny;
    }
    Json(json!({"status": "ok"})).into_response()
}

async fn freerange(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if let Some(deny) = state.deny(&headers) {
        return deny;
    }
    match state.control.free_ports().await {
        Ok(ports) => Json(json!({"free_ports": ports})).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn list_users(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if let Some(deny) = state.deny(&headers) {
        return deny;
    }
    match state.control.list_users().await {
        Ok(users) => {
            let data: Vec<_> = users
                .iter()
                .map(|u| {
                    json!({
                        "id": u.id,
                        "tg_id": u.tg_id,
                        "username": u.username,
                        "role": u.role.as_str(),
                        "port": u.port,
                        "login": u.login,
                        "timezone": u.timezone,
                        "subscription_until": u.subscription_until.to_rfc3339(),
                    })
                })
                .collect();
            Json(json!({"users": data})).into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct AddUserBody {
    tg_id: i64,
    username: Option<String>,
    port: u16,
    login: String,
}

async fn add_user(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<AddUserBody>,
) -> Response {
    if let Some(deny) = state.deny(&headers) {
        return deny;
    }
    match state
        .control
        .add_user(body.tg_id, body.username, body.port, &body.login)
        .await
    {
        Ok(user) => Json(json!({"result": "created", "user_id": user.id})).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct SetPortBody {
    tg_id: i64,
    port: u16,
}

async fn set_port(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<SetPortBody>,
) -> Response {
    if let Some(deny) = state.deny(&headers) {
        return deny;
    }
    match state.control.set_port(body.tg_id, body.port).await {
        Ok(change) => Json(json!({
            "result": "updated",
            "old_port": change.old_port,
            "new_port": change.new_port,
            "reload_errors": change.reload_errors,
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct SetSubscriptionBody {
    tg_id: i64,
    date: String,
}

async fn set_subscription(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<SetSubscriptionBody>,
) -> Response {
    if let Some(deny) = state.deny(&headers) {
        return deny;
    }
    match state.control.set_subscription(body.tg_id, &body.date).await {
        Ok(_) => Json(json!({"result": "updated"})).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct ExtendSubscriptionBody {
    tg_id: i64,
    #[serde(default = "default_months")]
    months: u32,
}

fn default_months() -> u32 {
    1
}

async fn extend_subscription(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<ExtendSubscriptionBody>,
) -> Response {
    if let Some(deny) = state.deny(&headers) {
        return deny;
    }
    match state
        .control
        .extend_subscription(body.tg_id, body.months)
        .await
    {
        Ok(until) => {
            Json(json!({"result": "updated", "until": until.to_rfc3339()})).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn list_modes(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(tg_id): Path<i64>,
) -> Response {
    if let Some(deny) = state.deny(&headers) {
        return deny;
    }
    match state.control.list_modes(tg_id).await {
        Ok(modes) => {
            let data: Vec<_> = modes
                .iter()
                .map(|m| {
                    json!({
                        "id": m.id,
                        "name": m.name,
                        "host": m.host,
                        "port": m.port,
                        "alias": m.alias,
                        "is_active": m.is_active,
                    })
                })
                .collect();
            Json(json!({"modes": data})).into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct SetLoginBody {
    login: String,
}

async fn set_login(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(tg_id): Path<i64>,
    Json(body): Json<SetLoginBody>,
) -> Response {
    if let Some(deny) = state.deny(&headers) {
        return deny;
    }
    match state.control.set_login(tg_id, &body.login).await {
        Ok(()) => Json(json!({"result": "updated"})).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct AddModeBody {
    name: String,
    host: String,
    port: u16,
    alias: String,
}

async fn add_mode(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(tg_id): Path<i64>,
    Json(body): Json<AddModeBody>,
) -> Response {
    if let Some(deny) = state.deny(&headers) {
        return deny;
    }
    match state
        .control
        .add_mode(tg_id, &body.name, &body.host, body.port, &body.alias)
        .await
    {
        Ok(mode) => Json(json!({"result": "created", "mode_id": mode.id})).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn activate_mode(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((tg_id, mode_id)): Path<(i64, i64)>,
) -> Response {
    if let Some(deny) = state.deny(&headers) {
        return deny;
    }
    match state.control.activate_mode(tg_id, mode_id).await {
        Ok(()) => Json(json!({"result": "activated"})).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn delete_mode(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((tg_id, mode_id)): Path<(i64, i64)>,
) -> Response {
    if let Some(deny) = state.deny(&headers) {
        return deny;
    }
    match state.control.delete_mode(tg_id, mode_id).await {
        Ok(()) => Json(json!({"result": "deleted"})).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn list_schedules(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(tg_id): Path<i64>,
) -> Response {
    if let Some(deny) = state.deny(&headers) {
        return deny;
    }
    match state.control.list_schedules(tg_id).await {
        Ok(schedules) => {
            let data: Vec<_> = schedules
                .iter()
                .map(|s| {
                    json!({
                        "id": s.id,
                        "mode_id": s.mode_id,
                        "start_time": s.start_time,
                        "end_time": s.end_time,
                    })
                })
                .collect();
            Json(json!({"schedules": data})).into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct AddScheduleBody {
    mode_id: i64,
    start_time: String,
    end_time: String,
}

async fn add_schedule(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(tg_id): Path<i64>,
    Json(body): Json<AddScheduleBody>,
) -> Response {
    if let Some(deny) = state.deny(&headers) {
        return deny;
    }
    match state
        .control
        .add_schedule(tg_id, body.mode_id, &body.start_time, &body.end_time)
        .await
    {
        Ok(s) => Json(json!({"result": "created", "schedule_id": s.id})).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn delete_schedule(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((tg_id, schedule_id)): Path<(i64, i64)>,
) -> Response {
    if let Some(deny) = state.deny(&headers) {
        return deny;
    }
    match state.control.delete_schedule(tg_id, schedule_id).await {
        Ok(()) => Json(json!({"result": "deleted"})).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn list_payments(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if let Some(deny) = state.deny(&headers) {
        return deny;
    }
    match state.control.list_payments().await {
        Ok(requests) => {
            let data: Vec<_> = requests
                .iter()
                .map(|p| {
                    json!({
                        "id": p.id,
                        "user_id": p.user_id,
                        "method": p.method.as_str(),
                        "file_id": p.file_id,
                        "created_at": p.created_at.to_rfc3339(),
                    })
                })
                .collect();
            Json(json!({"requests": data})).into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct PaymentUpdateBody {
    id: i64,
    action: String,
}

async fn payment_update(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<PaymentUpdateBody>,
) -> Response {
    if let Some(deny) = state.deny(&headers) {
        return deny;
    }
    match state.control.update_payment(body.id, &body.action).await {
        Ok(()) => Json(json!({"result": "updated"})).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct ReloadPortBody {
    port: u16,
}

async fn reload_port(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<ReloadPortBody>,
) -> Response {
    if let Some(deny) = state.deny(&headers) {
        return deny;
    }
    match state.control.reload_port(body.port).await {
        Ok(()) => Json(json!({"result": "reloaded", "port": body.port})).into_response(),
        Err(e) => e.into_response(),
    }
}
