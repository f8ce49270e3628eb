use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::models::User;
use crate::error::{AppError, AppResult};
use crate::store::{is_constraint_violation, new_id, now};

const USER_COLUMNS: &str =
    "id, username, email, password_hash, first_name, last_name, is_admin, created_at";

const DUPLICATE_USER: &str = "User with this email or username already exists";

pub struct NewUser {
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password_hash: String,
}

/// What a cascading identity delete removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeReport {
    pub posts_deleted: usize,
    /// Public paths of images that belonged to the deleted posts.
    pub images: Vec<String>,
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        first_name: row.get(4)?,
        last_name: row.get(5)?,
        is_admin: row.get(6)?,
        created_at: row.get(7)?,
    })
}

/// Emails are matched case-insensitively.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn create_user(conn: &Connection, new: NewUser) -> AppResult<User> {
    let email = normalize_email(&new.email);

    let taken: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM users WHERE email = ?1 OR username = ?2",
        params![email, new.username],
        |row| row.get(0),
    )?;
    if taken {
        return Err(AppError::Validation(DUPLICATE_USER.into()));
    }

    let user = User {
        id: new_id(),
        username: new.username,
        email,
        password_hash: new.password_hash,
        first_name: new.first_name,
        last_name: new.last_name,
        is_admin: false,
        created_at: now(),
    };

    conn.execute(
        &format!("INSERT INTO users ({USER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
        params![
            user.id,
            user.username,
            user.email,
            user.password_hash,
            user.first_name,
            user.last_name,
            user.is_admin,
            user.created_at
        ],
    )
    .map_err(|e| {
        // Lost a race with a concurrent registration
        if is_constraint_violation(&e) {
            AppError::Validation(DUPLICATE_USER.into())
        } else {
            e.into()
        }
    })?;

    Ok(user)
}

pub fn find_by_id(conn: &Connection, id: &str) -> AppResult<Option<User>> {
    Ok(conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![id],
            user_from_row,
        )
        .optional()?)
}

pub fn find_by_email(conn: &Connection, email: &str) -> AppResult<Option<User>> {
    Ok(conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
            params![normalize_email(email)],
            user_from_row,
        )
        .optional()?)
}

pub fn list_users(conn: &Connection) -> AppResult<Vec<User>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {USER_COLUMNS} FROM users ORDER BY created_at ASC"
    ))?;
    let users = stmt
        .query_map([], user_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

/// Set or clear the admin flag. Returns false when no account has that email.
pub fn set_admin(conn: &Connection, email: &str, is_admin: bool) -> AppResult<bool> {
    let rows = conn.execute(
        "UPDATE users SET is_admin = ?1 WHERE email = ?2",
        params![is_admin, normalize_email(email)],
    )?;
    Ok(rows > 0)
}

/// Delete an identity and every post it authored, as one transaction.
///
/// Posts go first: should the transaction be lost mid-way on a store without
/// rollback, an orphaned identity can be deleted again, whereas orphaned
/// posts would reference a vanished author.
pub fn delete_user_cascade(conn: &mut Connection, id: &str) -> AppResult<CascadeReport> {
    let tx = conn.transaction()?;

    let exists: bool = tx.query_row(
        "SELECT COUNT(*) > 0 FROM users WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(AppError::NotFound("User not found".into()));
    }

    let images: Vec<String> = {
        let mut stmt =
            tx.prepare("SELECT image FROM posts WHERE author_id = ?1 AND image IS NOT NULL")?;
        let rows = stmt.query_map(params![id], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let result = tx
        .execute("DELETE FROM posts WHERE author_id = ?1", params![id])
        .and_then(|posts_deleted| {
            tx.execute("DELETE FROM users WHERE id = ?1", params![id])?;
            Ok(posts_deleted)
        });

    let posts_deleted = match result {
        Ok(n) => n,
        Err(e) => {
            tracing::error!(user_id = %id, "Cascade delete failed, rolled back: {}", e);
            return Err(AppError::Internal(format!(
                "Deleting user {} and their posts failed; nothing was removed: {}",
                id, e
            )));
        }
    };

    tx.commit().map_err(|e| {
        tracing::error!(user_id = %id, "Cascade delete commit failed: {}", e);
        AppError::Internal(format!(
            "Deleting user {} could not be committed; verify the user and their posts: {}",
            id, e
        ))
    })?;

    Ok(CascadeReport {
        posts_deleted,
        images,
    })
}


#[cfg(test)]
mod tests {
    use super::fixtures::user;
    use super::*;
    use crate::store::posts;
    use crate::store::testing;

    #[test]
    fn created_user_is_not_admin_and_findable() {
        let (_tmp, pool) = testing::pool();
        let conn = pool.get().unwrap();
        let alice = user(&conn, "alice");

        assert!(!alice.is_admin);
        let found = find_by_id(&conn, &alice.id).unwrap().unwrap();
        assert_eq!(found.username, "alice");
        let by_email = find_by_email(&conn, " ALICE@example.com ").unwrap().unwrap();
        assert_eq!(by_email.id, alice.id);
    }

    #[test]
    fn duplicate_email_or_username_is_rejected() {
        let (_tmp, pool) = testing::pool();
        let conn = pool.get().unwrap();
        user(&conn, "alice");

        let same_username = create_user(
            &conn,
            NewUser {
                username: "alice".into(),
                email: "other@example.com".into(),
                first_name: "A".into(),
                last_name: "B".into(),
                password_hash: "h".into(),
            },
        );
        assert!(matches!(same_username, Err(AppError::Validation(_))));

        let same_email = create_user(
            &conn,
            NewUser {
                username: "other".into(),
                email: "Alice@Example.com".into(),
                first_name: "A".into(),
                last_name: "B".into(),
                password_hash: "h".into(),
            },
        );
        assert!(matches!(same_email, Err(AppError::Validation(_))));
    }

    #[test]
    fn set_admin_flags_existing_account_only() {
        let (_tmp, pool) = testing::pool();
        let conn = pool.get().unwrap();
        let alice = user(&conn, "alice");

        assert!(set_admin(&conn, "alice@example.com", true).unwrap());
        assert!(find_by_id(&conn, &alice.id).unwrap().unwrap().is_admin);
        assert!(!set_admin(&conn, "nobody@example.com", true).unwrap());
    }

    #[test]
    fn cascade_removes_user_and_exactly_their_posts() {
        let (_tmp, pool) = testing::pool();
        let mut conn = pool.get().unwrap();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");

        for i in 0..3 {
            posts::create_post(&conn, &alice.id, &format!("a{}", i), "body", None).unwrap();
        }
        posts::create_post(&conn, &alice.id, "pic", "body", Some("/uploads/1-1.png")).unwrap();
        let bobs = posts::create_post(&conn, &bob.id, "b", "body", None).unwrap();
        posts::like_post(&conn, &bobs.id, &alice.id).unwrap();
        posts::add_comment(&conn, &bobs.id, &alice.id, "nice").unwrap();

        let report = delete_user_cascade(&mut conn, &alice.id).unwrap();
        assert_eq!(report.posts_deleted, 4);
        assert_eq!(report.images, vec!["/uploads/1-1.png".to_string()]);

        assert!(find_by_id(&conn, &alice.id).unwrap().is_none());
        let remaining = posts::list_post_views(&conn).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, bobs.id);
        // Alice's like is gone, her comment stays without an author
        assert!(remaining[0].likes.is_empty());
        assert_eq!(remaining[0].comments.len(), 1);
        assert!(remaining[0].comments[0].user.is_none());
    }

    #[test]
    fn cascade_on_unknown_user_is_not_found() {
        let (_tmp, pool) = testing::pool();
        let mut conn = pool.get().unwrap();
        assert!(matches!(
            delete_user_cascade(&mut conn, "missing"),
            Err(AppError::NotFound(_))
        ));
    }
}
