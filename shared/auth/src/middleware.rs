use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{request::Parts, HeaderMap},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use skillbridge_common::{AppError, UserRole};

use crate::jwt::{Claims, JwtService};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub email: String,
    pub roles: Vec<UserRole>,
    pub active_role: Option<UserRole>,
}

impl TryFrom<Claims> for AuthenticatedUser {
    type Error = AppError;

    fn try_from(claims: Claims) -> Result<Self, Self::Error> {
        Ok(Self {
            user_id: claims.user_id()?,
            email: claims.email,
            roles: claims.roles,
            active_role: claims.active_role,
        })
    }
}

/// Validates the bearer token and yields the calling user.
#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    JwtService: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(user) = parts.extensions.get::<AuthenticatedUser>() {
            return Ok(user.clone());
        }

        let token = extract_token_from_headers(&parts.headers)
            .ok_or_else(|| AppError::Authentication("Missing bearer token".to_string()))?;

        let jwt_service = JwtService::from_ref(state);
        let claims = jwt_service.validate_token(&token).map_err(|err| {
            tracing::debug!(error = %err, path = %parts.uri.path(), "Rejected bearer token");
            err
        })?;
        let user = AuthenticatedUser::try_from(claims)?;

        parts.extensions.insert(user.clone());
        Ok(user)
    }
}

/// Extract JWT token from Authorization header
pub fn extract_token_from_headers(headers: &HeaderMap) -> Option<String> {
    let auth_header = headers.get("Authorization")?;
    let auth_str = auth_header.to_str().ok()?;

    auth_str
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, Request};
    use skillbridge_common::JwtConfig;

    fn jwt_config() -> JwtConfig {
        JwtConfig {
            secret: "middleware-secret".to_string(),
            expiration_hours: 1,
            issuer: "skillbridge".to_string(),
        }
    }

    fn parts_with(authorization: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/contracts");
        if let Some(value) = authorization {
            builder = builder.header("Authorization", value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn valid_token_yields_the_caller() {
        let config = jwt_config();
        let service = JwtService::new(&config);
        let user_id = Uuid::new_v4();
        let claims = Claims::new(
            user_id,
            "coach@example.com".to_string(),
            vec![UserRole::Coach],
            Some(UserRole::Coach),
            &config,
        );
        let token = service.generate_token(&claims).unwrap();

        let mut parts = parts_with(Some(&format!("Bearer {}", token)));
        let user = AuthenticatedUser::from_request_parts(&mut parts, &service).await.unwrap();

        assert_eq!(user.user_id, user_id);
        assert_eq!(user.active_role, Some(UserRole::Coach));
        assert!(parts.extensions.get::<AuthenticatedUser>().is_some());
    }

    #[tokio::test]
    async fn missing_or_forged_tokens_are_rejected() {
        let service = JwtService::new(&jwt_config());

        let mut parts = parts_with(None);
        let err = AuthenticatedUser::from_request_parts(&mut parts, &service).await.unwrap_err();
        assert!(matches!(err, AppError::Authentication(_)));

        let mut parts = parts_with(Some("Bearer not.a.token"));
        let err = AuthenticatedUser::from_request_parts(&mut parts, &service).await.unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[test]
    fn bearer_token_is_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(extract_token_from_headers(&headers).as_deref(), Some("abc.def"));
    }

    #[test]
    fn other_schemes_are_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Basic dXNlcg=="));
        assert!(extract_token_from_headers(&headers).is_none());

        headers.insert("Authorization", HeaderValue::from_static("Bearer "));
        assert!(extract_token_from_headers(&headers).is_none());
    }
}
