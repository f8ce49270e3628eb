use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth::password;
use crate::auth::policy::{self, canonical_id, Decision};
use crate::auth::token;
use crate::db::models::User;
use crate::error::{AppError, AppResult};
use crate::extractors::{AdminUser, AuthenticatedUser, JsonBody};
use crate::state::AppState;
use crate::store::users::{self, NewUser};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/me", get(me))
        .route("/api/auth/users", get(list_users))
        .route("/api/auth/users/{id}", delete(delete_user))
}

// -- Request / response types --

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub password: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub is_admin_login: bool,
}

#[derive(Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: User,
}

fn present(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn issue(state: &AppState, user_id: &str, hours: u64) -> AppResult<String> {
    state
        .tokens
        .issue_token(user_id, token::hours(hours))
        .map_err(|e| AppError::Internal(e.to_string()))
}

// -- Handlers --

/// POST /api/auth/register: create an identity and sign it in
async fn register(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<RegisterRequest>,
) -> AppResult<(StatusCode, Json<AuthResponse>)> {
    let (Some(username), Some(email), Some(first_name), Some(last_name), Some(plaintext)) = (
        present(req.username),
        present(req.email),
        present(req.first_name),
        present(req.last_name),
        req.password.filter(|p| !p.is_empty()),
    ) else {
        return Err(AppError::Validation("All fields are required".into()));
    };

    let cost = state.config.auth.bcrypt_cost;
    let password_hash = tokio::task::spawn_blocking(move || password::hash_password(&plaintext, cost))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .map_err(|e| AppError::Internal(format!("Password hashing failed: {}", e)))?;

    let user = {
        let conn = state.db.get()?;
        users::create_user(
            &conn,
            NewUser {
                username,
                email,
                first_name,
                last_name,
                password_hash,
            },
        )?
    };
    tracing::info!(user_id = %user.id, username = %user.username, "User registered");

    let token = issue(&state, &user.id, state.config.auth.register_token_hours)?;
    Ok((StatusCode::CREATED, Json(AuthResponse { token, user })))
}

/// POST /api/auth/login: exchange credentials for a token
async fn login(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<LoginRequest>,
) -> AppResult<Json<AuthResponse>> {
    let (Some(email), Some(plaintext)) = (present(req.email), req.password.filter(|p| !p.is_empty()))
    else {
        return Err(AppError::Validation("Email and password are required".into()));
    };

    let invalid = || AppError::Unauthenticated("Invalid email or password".into());

    let user = {
        let conn = state.db.get()?;
        users::find_by_email(&conn, &email)?
    }
    .ok_or_else(invalid)?;

    let hash = user.password_hash.clone();
    let matches = tokio::task::spawn_blocking(move || password::verify_password(&plaintext, &hash))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    if !matches {
        return Err(invalid());
    }

    if let Decision::Deny(_) = policy::authorize_login(req.is_admin_login, &user) {
        tracing::warn!(user_id = %user.id, "Admin login refused for non-admin");
        return Err(AppError::Forbidden(
            "Admin access required for admin login".into(),
        ));
    }

    let hours = if req.is_admin_login {
        state.config.auth.admin_login_token_hours
    } else {
        state.config.auth.login_token_hours
    };
    let token = issue(&state, &user.id, hours)?;
    Ok(Json(AuthResponse { token, user }))
}

/// GET /api/auth/me
async fn me(State(state): State<AppState>, auth: AuthenticatedUser) -> AppResult<Json<Value>> {
    let conn = state.db.get()?;
    let user = users::find_by_id(&conn, &auth.id)?
        .ok_or_else(|| AppError::Unauthenticated("User not found".into()))?;
    Ok(Json(json!({ "user": user })))
}

/// GET /api/auth/users: admin only
async fn list_users(State(state): State<AppState>, _admin: AdminUser) -> AppResult<Json<Vec<User>>> {
    let conn = state.db.get()?;
    let all = users::list_users(&conn)?;
    tracing::debug!("Listed {} users for admin", all.len());
    Ok(Json(all))
}

/// DELETE /api/auth/users/{id}: admin only, removes the user's posts too
async fn delete_user(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    if uuid::Uuid::parse_str(id.trim()).is_err() {
        return Err(AppError::Validation("Invalid user ID format".into()));
    }
    let id = canonical_id(&id);

    let report = {
        let mut conn = state.db.get()?;
        users::delete_user_cascade(&mut conn, &id)?
    };

    for image in &report.images {
        state.uploads.remove(image).await;
    }

    tracing::info!(
        user_id = %id,
        admin_id = %admin.actor.id(),
        posts_deleted = report.posts_deleted,
        "Deleted user and their posts"
    );

    Ok(Json(json!({
        "message": "User and their posts deleted successfully",
        "postsDeleted": report.posts_deleted,
    })))
}
