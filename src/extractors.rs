use axum::extract::{FromRequest, FromRequestParts, Request};
use axum::http::header;
use axum::http::request::Parts;
use axum::Json;
use serde::de::DeserializeOwned;

use crate::auth::policy::{self, Actor};
use crate::auth::TokenVerdict;
use crate::error::AppError;
use crate::state::AppState;
use crate::store::users;

/// Identity resolved from a valid bearer token.
///
/// Only the token is checked; the identity record is not loaded.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: String,
}

impl AuthenticatedUser {
    pub fn actor(&self) -> Actor {
        Actor::Authenticated(self.id.clone())
    }
}

/// Returns 401 "No token provided" without a bearer token and
/// 401 "Invalid token" when it does not verify.
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| AppError::Unauthenticated("No token provided".into()))?;

        match state.tokens.verify_token(token) {
            TokenVerdict::Valid(id) => Ok(AuthenticatedUser { id }),
            TokenVerdict::Invalid(reason) => {
                tracing::debug!(?reason, "Rejected bearer token");
                Err(AppError::Unauthenticated("Invalid token".into()))
            }
        }
    }
}

/// An authenticated identity whose admin flag was just read from the store.
#[derive(Debug, Clone)]
pub struct AdminUser {
    pub actor: Actor,
}

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user = AuthenticatedUser::from_request_parts(parts, state).await?;

        let record = {
            let conn = state.db.get()?;
            users::find_by_id(&conn, &user.id)?
        };

        let actor = policy::require_admin(&user.id, record.as_ref())?;
        Ok(AdminUser { actor })
    }
}

/// The credential carried by the `Authorization` header. A value without
/// the `Bearer ` scheme is passed through whole so it fails verification.
fn bearer_token(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(header::AUTHORIZATION)?;
    // Opaque bytes are present but can never verify
    let value = value.to_str().unwrap_or("\u{fffd}");
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    (!token.is_empty()).then_some(token)
}

/// JSON request body whose parse failures surface as 400 `{message}`.
#[derive(Debug, Clone)]
pub struct JsonBody<T>(pub T);

impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(JsonBody(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts_with(auth: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = auth {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn bearer_token_is_extracted() {
        let parts = parts_with(Some("Bearer abc.def.ghi"));
        assert_eq!(bearer_token(&parts), Some("abc.def.ghi"));
    }

    #[test]
    fn missing_or_empty_bearer_is_none() {
        assert_eq!(bearer_token(&parts_with(None)), None);
        assert_eq!(bearer_token(&parts_with(Some("Bearer "))), None);
        assert_eq!(bearer_token(&parts_with(Some(""))), None);
    }

    #[test]
    fn other_schemes_are_passed_through_for_verification() {
        assert_eq!(
            bearer_token(&parts_with(Some("Basic dXNlcg=="))),
            Some("Basic dXNlcg==")
        );
        assert_eq!(bearer_token(&parts_with(Some("abc.def.ghi"))), Some("abc.def.ghi"));
    }
}
