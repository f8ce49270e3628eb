use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;

use crate::auth::policy::{can_mutate, Action, Actor, Rule};
use crate::db::models::{AuthorSummary, CommentView, CommenterSummary, Post, PostView};
use crate::error::{AppError, AppResult};
use crate::store::{identity_gone, new_id, now};

const POST_COLUMNS: &str = "id, author_id, title, content, image, created_at, updated_at";

/// Fields an edit may change. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostPatch {
    pub title: Option<String>,
    pub content: Option<String>,
}

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<Post> {
    Ok(Post {
        id: row.get(0)?,
        author_id: row.get(1)?,
        title: row.get(2)?,
        content: row.get(3)?,
        image: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn blog_not_found() -> AppError {
    AppError::NotFound("Blog not found".into())
}

/// Trimmed, non-empty text or a validation error.
fn required(value: &str, message: &str) -> AppResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation(message.to_string()));
    }
    Ok(trimmed.to_string())
}

pub fn create_post(
    conn: &Connection,
    author_id: &str,
    title: &str,
    content: &str,
    image: Option<&str>,
) -> AppResult<Post> {
    let title = required(title, "Title and content are required")?;
    let content = required(content, "Title and content are required")?;
    let ts = now();

    let post = Post {
        id: new_id(),
        author_id: author_id.to_string(),
        title,
        content,
        image: image.map(str::to_string),
        created_at: ts.clone(),
        updated_at: ts,
    };

    conn.execute(
        &format!("INSERT INTO posts ({POST_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
        params![
            post.id,
            post.author_id,
            post.title,
            post.content,
            post.image,
            post.created_at,
            post.updated_at
        ],
    )
    .map_err(identity_gone)?;

    Ok(post)
}

pub fn find_post(conn: &Connection, id: &str) -> AppResult<Option<Post>> {
    Ok(conn
        .query_row(
            &format!("SELECT {POST_COLUMNS} FROM posts WHERE id = ?1"),
            params![id],
            post_from_row,
        )
        .optional()?)
}

pub fn load_post(conn: &Connection, id: &str) -> AppResult<Post> {
    find_post(conn, id)?.ok_or_else(blog_not_found)
}

/// Apply an edit on behalf of `actor`, subject to `rule`.
pub fn edit_post(
    conn: &Connection,
    post_id: &str,
    actor: &Actor,
    rule: Rule,
    patch: PostPatch,
) -> AppResult<PostView> {
    let post = load_post(conn, post_id)?;
    can_mutate(actor, &post.author_id, rule, Action::Edit)
        .into_result()
        .inspect_err(|_| {
            tracing::warn!(post_id = %post_id, user_id = %actor.id(), "Edit refused");
        })?;

    let title = match patch.title {
        Some(t) => required(&t, "Title cannot be empty")?,
        None => post.title,
    };
    let content = match patch.content {
        Some(c) => required(&c, "Content cannot be empty")?,
        None => post.content,
    };

    conn.execute(
        "UPDATE posts SET title = ?1, content = ?2, updated_at = ?3 WHERE id = ?4",
        params![title, content, now(), post_id],
    )?;
    tracing::info!(post_id = %post_id, user_id = %actor.id(), ?rule, "Post edited");

    post_view(conn, post_id)
}

/// Delete a post on behalf of `actor`, subject to `rule`. Returns the
/// post's image path, if any, for the caller to clean up.
pub fn remove_post(
    conn: &Connection,
    post_id: &str,
    actor: &Actor,
    rule: Rule,
) -> AppResult<Option<String>> {
    let post = load_post(conn, post_id)?;
    can_mutate(actor, &post.author_id, rule, Action::Delete)
        .into_result()
        .inspect_err(|_| {
            tracing::warn!(post_id = %post_id, user_id = %actor.id(), "Delete refused");
        })?;

    conn.execute("DELETE FROM posts WHERE id = ?1", params![post_id])?;
    tracing::info!(post_id = %post_id, user_id = %actor.id(), ?rule, "Post deleted");

    Ok(post.image)
}

/// Idempotent: liking twice leaves a single like.
pub fn like_post(conn: &Connection, post_id: &str, user_id: &str) -> AppResult<()> {
    load_post(conn, post_id)?;
    conn.execute(
        "INSERT OR IGNORE INTO post_likes (post_id, user_id, created_at) VALUES (?1, ?2, ?3)",
        params![post_id, user_id, now()],
    )
    .map_err(identity_gone)?;
    Ok(())
}

/// Idempotent, like [`like_post`].
pub fn share_post(conn: &Connection, post_id: &str, user_id: &str) -> AppResult<()> {
    load_post(conn, post_id)?;
    conn.execute(
        "INSERT OR IGNORE INTO post_shares (post_id, user_id, created_at) VALUES (?1, ?2, ?3)",
        params![post_id, user_id, now()],
    )
    .map_err(identity_gone)?;
    Ok(())
}

/// Always appends.
pub fn add_comment(conn: &Connection, post_id: &str, user_id: &str, content: &str) -> AppResult<()> {
    load_post(conn, post_id)?;
    let content = required(content, "Comment content is required")?;
    conn.execute(
        "INSERT INTO comments (id, post_id, user_id, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![new_id(), post_id, user_id, content, now()],
    )
    .map_err(identity_gone)?;
    Ok(())
}

pub fn post_view(conn: &Connection, post_id: &str) -> AppResult<PostView> {
    let post = load_post(conn, post_id)?;
    resolve(conn, post)
}

/// All posts, newest first.
pub fn list_post_views(conn: &Connection) -> AppResult<Vec<PostView>> {
    let posts = {
        let mut stmt = conn.prepare(&format!(
            "SELECT {POST_COLUMNS} FROM posts ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map([], post_from_row)?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    posts.into_iter().map(|post| resolve(conn, post)).collect()
}

fn resolve(conn: &Connection, post: Post) -> AppResult<PostView> {
    let author = conn
        .query_row(
            "SELECT id, username, first_name, last_name FROM users WHERE id = ?1",
            params![post.author_id],
            |row| {
                Ok(AuthorSummary {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    first_name: row.get(2)?,
                    last_name: row.get(3)?,
                })
            },
        )
        .optional()?;

    let likes = identity_ids(conn, "post_likes", &post.id)?;
    let shares = identity_ids(conn, "post_shares", &post.id)?;

    let comments = {
        let mut stmt = conn.prepare(
            "SELECT c.id, u.id, u.username, c.content, c.created_at
             FROM comments c
             LEFT JOIN users u ON u.id = c.user_id
             WHERE c.post_id = ?1
             ORDER BY c.created_at ASC, c.rowid ASC",
        )?;
        let rows = stmt.query_map(params![post.id], |row| {
            let user_id: Option<String> = row.get(1)?;
            let username: Option<String> = row.get(2)?;
            Ok(CommentView {
                id: row.get(0)?,
                user: user_id
                    .zip(username)
                    .map(|(id, username)| CommenterSummary { id, username }),
                content: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    Ok(PostView {
        id: post.id,
        title: post.title,
        content: post.content,
        image: post.image,
        author,
        likes,
        shares,
        comments,
        created_at: post.created_at,
        updated_at: post.updated_at,
    })
}

fn identity_ids(conn: &Connection, table: &str, post_id: &str) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT user_id FROM {table} WHERE post_id = ?1 ORDER BY created_at ASC, rowid ASC"
    ))?;
    let rows = stmt.query_map(params![post_id], |row| row.get(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing;
    use crate::store::users::fixtures::user;

    #[test]
    fn create_rejects_blank_title_or_content() {
        let (_tmp, pool) = testing::pool();
        let conn = pool.get().unwrap();
        let alice = user(&conn, "alice");

        assert!(matches!(
            create_post(&conn, &alice.id, "   ", "body", None),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            create_post(&conn, &alice.id, "title", "", None),
            Err(AppError::Validation(_))
        ));
        assert!(list_post_views(&conn).unwrap().is_empty());
    }

    #[test]
    fn post_without_image_has_none_and_resolved_author() {
        let (_tmp, pool) = testing::pool();
        let conn = pool.get().unwrap();
        let alice = user(&conn, "alice");

        let post = create_post(&conn, &alice.id, " Hello ", "World", None).unwrap();
        let view = post_view(&conn, &post.id).unwrap();
        assert_eq!(view.title, "Hello");
        assert!(view.image.is_none());
        assert_eq!(view.author.unwrap().username, "alice");

        let json = serde_json::to_value(post_view(&conn, &post.id).unwrap()).unwrap();
        assert!(json["image"].is_null());
        assert!(json.get("createdAt").is_some());
    }

    #[test]
    fn create_by_vanished_identity_is_unauthenticated() {
        let (_tmp, pool) = testing::pool();
        let conn = pool.get().unwrap();
        assert!(matches!(
            create_post(&conn, "ghost", "t", "c", None),
            Err(AppError::Unauthenticated(_))
        ));
    }

    #[test]
    fn like_and_share_are_idempotent() {
        let (_tmp, pool) = testing::pool();
        let conn = pool.get().unwrap();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        let post = create_post(&conn, &alice.id, "t", "c", None).unwrap();

        like_post(&conn, &post.id, &bob.id).unwrap();
        like_post(&conn, &post.id, &bob.id).unwrap();
        like_post(&conn, &post.id, &alice.id).unwrap();
        share_post(&conn, &post.id, &bob.id).unwrap();
        share_post(&conn, &post.id, &bob.id).unwrap();

        let view = post_view(&conn, &post.id).unwrap();
        assert_eq!(view.likes, vec![bob.id.clone(), alice.id.clone()]);
        assert_eq!(view.shares, vec![bob.id]);
    }

    #[test]
    fn like_on_missing_post_is_not_found() {
        let (_tmp, pool) = testing::pool();
        let conn = pool.get().unwrap();
        let alice = user(&conn, "alice");
        assert!(matches!(
            like_post(&conn, "nope", &alice.id),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn comments_append_in_order() {
        let (_tmp, pool) = testing::pool();
        let conn = pool.get().unwrap();
        let alice = user(&conn, "alice");
        let post = create_post(&conn, &alice.id, "t", "c", None).unwrap();

        add_comment(&conn, &post.id, &alice.id, "first").unwrap();
        add_comment(&conn, &post.id, &alice.id, "first").unwrap();
        add_comment(&conn, &post.id, &alice.id, "second").unwrap();
        assert!(matches!(
            add_comment(&conn, &post.id, &alice.id, "  "),
            Err(AppError::Validation(_))
        ));

        let view = post_view(&conn, &post.id).unwrap();
        let texts: Vec<_> = view.comments.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(texts, vec!["first", "first", "second"]);
        assert_eq!(view.comments[0].user.as_ref().unwrap().id, alice.id);
    }

    #[test]
    fn edit_is_partial_and_owner_checked() {
        let (_tmp, pool) = testing::pool();
        let conn = pool.get().unwrap();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        let post = create_post(&conn, &alice.id, "title", "content", None).unwrap();

        let denied = edit_post(
            &conn,
            &post.id,
            &Actor::Authenticated(bob.id.clone()),
            Rule::Owner,
            PostPatch {
                title: Some("hijacked".into()),
                content: None,
            },
        );
        assert!(matches!(denied, Err(AppError::Forbidden(_))));

        let view = edit_post(
            &conn,
            &post.id,
            &Actor::Authenticated(alice.id.clone()),
            Rule::Owner,
            PostPatch {
                title: Some("new title".into()),
                content: None,
            },
        )
        .unwrap();
        assert_eq!(view.title, "new title");
        assert_eq!(view.content, "content");
        assert_eq!(view.author.unwrap().id, alice.id);
    }

    #[test]
    fn admin_rule_edits_any_post() {
        let (_tmp, pool) = testing::pool();
        let conn = pool.get().unwrap();
        let alice = user(&conn, "alice");
        let admin = user(&conn, "admin");
        let post = create_post(&conn, &alice.id, "title", "content", None).unwrap();

        let view = edit_post(
            &conn,
            &post.id,
            &Actor::Admin(admin.id.clone()),
            Rule::Admin,
            PostPatch {
                title: None,
                content: Some("moderated".into()),
            },
        )
        .unwrap();
        assert_eq!(view.content, "moderated");
        assert_eq!(view.author.unwrap().id, alice.id);
    }

    #[test]
    fn remove_returns_image_and_respects_owner() {
        let (_tmp, pool) = testing::pool();
        let conn = pool.get().unwrap();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        let post = create_post(&conn, &alice.id, "t", "c", Some("/uploads/x.png")).unwrap();

        assert!(matches!(
            remove_post(&conn, &post.id, &Actor::Authenticated(bob.id), Rule::Owner),
            Err(AppError::Forbidden(_))
        ));
        let image =
            remove_post(&conn, &post.id, &Actor::Authenticated(alice.id), Rule::Owner).unwrap();
        assert_eq!(image.as_deref(), Some("/uploads/x.png"));
        assert!(find_post(&conn, &post.id).unwrap().is_none());
    }

    #[test]
    fn list_is_newest_first() {
        let (_tmp, pool) = testing::pool();
        let conn = pool.get().unwrap();
        let alice = user(&conn, "alice");
        let first = create_post(&conn, &alice.id, "first", "c", None).unwrap();
        let second = create_post(&conn, &alice.id, "second", "c", None).unwrap();

        let ids: Vec<_> = list_post_views(&conn)
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }
}
