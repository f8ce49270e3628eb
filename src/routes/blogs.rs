use axum::extract::multipart::{Multipart, MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::policy::{canonical_id, Actor, Rule};
use crate::db::models::PostView;
use crate::error::{AppError, AppResult};
use crate::extractors::{AdminUser, AuthenticatedUser, JsonBody};
use crate::state::AppState;
use crate::store::posts::{self, PostPatch};
use crate::uploads::{self, PendingImage, IMAGE_FIELD};

/// Room for the text fields and multipart framing on top of the image cap.
const FORM_OVERHEAD_BYTES: usize = 64 * 1024;

pub fn router(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        .route(
            "/api/blogs",
            get(list_posts)
                .post(create_post)
                .layer(DefaultBodyLimit::max(max_upload_bytes + FORM_OVERHEAD_BYTES)),
        )
        .route(
            "/api/blogs/{id}",
            get(get_post).put(admin_edit).delete(admin_delete),
        )
        .route("/api/blogs/{id}/user", put(owner_edit).delete(owner_delete))
        .route("/api/blogs/{id}/like", post(like))
        .route("/api/blogs/{id}/share", post(share))
        .route("/api/blogs/{id}/comment", post(comment))
}

#[derive(Deserialize)]
pub struct CommentRequest {
    #[serde(default)]
    pub content: String,
}

/// Text fields and optional image collected from a create form.
#[derive(Default)]
struct CreateForm {
    title: String,
    content: String,
    image: Option<PendingImage>,
}

async fn read_create_form(mut multipart: Multipart, max_bytes: usize) -> AppResult<CreateForm> {
    let mut form = CreateForm::default();

    let parse_error = |e: MultipartError| uploads::multipart_error(e, max_bytes);

    while let Some(mut field) = multipart.next_field().await.map_err(parse_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "title" => form.title = field.text().await.map_err(parse_error)?,
            "content" => form.content = field.text().await.map_err(parse_error)?,
            IMAGE_FIELD => {
                let Some(image) = uploads::accept_image(&mut field, max_bytes).await? else {
                    continue;
                };
                if form.image.is_some() {
                    return Err(AppError::Validation("Only one image may be attached".into()));
                }
                form.image = Some(image);
            }
            _ => {}
        }
    }

    Ok(form)
}

// -- Handlers --

async fn list_posts(State(state): State<AppState>) -> AppResult<Json<Vec<PostView>>> {
    let conn = state.db.get()?;
    Ok(Json(posts::list_post_views(&conn)?))
}

async fn get_post(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<PostView>> {
    let id = canonical_id(&id);
    let conn = state.db.get()?;
    Ok(Json(posts::post_view(&conn, &id)?))
}

/// POST /api/blogs: multipart `title`, `content`, optional `image`
async fn create_post(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    multipart: Result<Multipart, MultipartRejection>,
) -> AppResult<(StatusCode, Json<PostView>)> {
    let multipart = multipart.map_err(|e| AppError::Validation(e.body_text()))?;
    let form = read_create_form(multipart, state.uploads.max_bytes()).await?;

    if form.title.trim().is_empty() || form.content.trim().is_empty() {
        return Err(AppError::Validation("Title and content are required".into()));
    }

    let image_path = match form.image {
        Some(ref image) => Some(state.uploads.store(image).await?),
        None => None,
    };

    let created = insert_post(&state, &user.id, &form, image_path.as_deref());

    match created {
        Ok(view) => {
            tracing::info!(
                post_id = %view.id,
                user_id = %user.id,
                has_image = view.image.is_some(),
                "Post created"
            );
            Ok((StatusCode::CREATED, Json(view)))
        }
        Err(e) => {
            if let Some(ref path) = image_path {
                state.uploads.remove(path).await;
            }
            Err(e)
        }
    }
}

fn insert_post(
    state: &AppState,
    author_id: &str,
    form: &CreateForm,
    image_path: Option<&str>,
) -> AppResult<PostView> {
    let conn = state.db.get()?;
    let post = posts::create_post(&conn, author_id, &form.title, &form.content, image_path)?;
    posts::post_view(&conn, &post.id)
}

fn edit(
    state: &AppState,
    id: &str,
    actor: &Actor,
    rule: Rule,
    patch: PostPatch,
) -> AppResult<Json<PostView>> {
    let conn = state.db.get()?;
    Ok(Json(posts::edit_post(&conn, id, actor, rule, patch)?))
}

async fn remove(state: &AppState, id: &str, actor: &Actor, rule: Rule) -> AppResult<Json<Value>> {
    let image = {
        let conn = state.db.get()?;
        posts::remove_post(&conn, id, actor, rule)?
    };
    if let Some(path) = image {
        state.uploads.remove(&path).await;
    }
    Ok(Json(json!({ "message": "Blog deleted successfully" })))
}

/// PUT /api/blogs/{id}/user: author only
async fn owner_edit(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    JsonBody(patch): JsonBody<PostPatch>,
) -> AppResult<Json<PostView>> {
    let id = canonical_id(&id);
    edit(&state, &id, &user.actor(), Rule::Owner, patch)
}

/// DELETE /api/blogs/{id}/user: author only
async fn owner_delete(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let id = canonical_id(&id);
    remove(&state, &id, &user.actor(), Rule::Owner).await
}

/// PUT /api/blogs/{id}: admin only
async fn admin_edit(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<String>,
    JsonBody(patch): JsonBody<PostPatch>,
) -> AppResult<Json<PostView>> {
    let id = canonical_id(&id);
    edit(&state, &id, &admin.actor, Rule::Admin, patch)
}

/// DELETE /api/blogs/{id}: admin only
async fn admin_delete(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let id = canonical_id(&id);
    remove(&state, &id, &admin.actor, Rule::Admin).await
}

async fn like(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> AppResult<Json<PostView>> {
    let id = canonical_id(&id);
    let conn = state.db.get()?;
    posts::like_post(&conn, &id, &user.id)?;
    Ok(Json(posts::post_view(&conn, &id)?))
}

async fn share(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> AppResult<Json<PostView>> {
    let id = canonical_id(&id);
    let conn = state.db.get()?;
    posts::share_post(&conn, &id, &user.id)?;
    Ok(Json(posts::post_view(&conn, &id)?))
}

async fn comment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<CommentRequest>,
) -> AppResult<Json<PostView>> {
    let id = canonical_id(&id);
    let conn = state.db.get()?;
    posts::add_comment(&conn, &id, &user.id, &req.content)?;
    Ok(Json(posts::post_view(&conn, &id)?))
}
