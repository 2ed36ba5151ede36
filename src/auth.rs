//! Bearer-token claim verification (§6 "Authentication").
//!
//! Issuance lives in the out-of-scope JWT service (§1); this module only
//! verifies an already-issued token and extracts the caller identity, the
//! way `cp5337-sx9`'s foundation crate decodes claims with `jsonwebtoken`.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Cliente,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Claims {
    pub id: String,
    pub correo: String,
    pub rol: Role,
    pub exp: usize,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.rol == Role::Admin
    }

    /// §4.1 step 1 / §6: a caller may act on a resource if they own it or
    /// are an admin.
    pub fn can_access(&self, owner_user_id: &str) -> bool {
        self.is_admin() || self.id == owner_user_id
    }
}

#[derive(Debug)]
pub struct AuthError(pub String);

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, self.0).into_response()
    }
}

/// Decoding key shared across requests; built once from the configured
/// secret at startup and stored in `AppState`.
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| AuthError(format!("invalid token: {e}")))
    }
}

impl<S> FromRequestParts<S> for Claims
where
    S: Send + Sync,
    crate::rest::AppState: axum::extract::FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        use axum::extract::FromRef;
        let app_state = crate::rest::AppState::from_ref(state);

        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AuthError("missing Authorization header".into()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AuthError("Authorization header must be a Bearer token".into()))?;

        app_state.jwt.verify(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token_for(id: &str, rol: Role) -> String {
        let claims = Claims {
            id: id.into(),
            correo: format!("{id}@example.com"),
            rol,
            exp: 9_999_999_999,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(b"secret")).unwrap()
    }

    #[test]
    fn verifies_and_decodes_valid_token() {
        let verifier = JwtVerifier::new("secret");
        let token = token_for("u1", Role::Cliente);
        let claims = verifier.verify(&token).unwrap();
        assert_eq!(claims.id, "u1");
        assert!(!claims.is_admin());
    }

    #[test]
    fn rejects_token_signed_with_wrong_key() {
        let verifier = JwtVerifier::new("different-secret");
        let token = token_for("u1", Role::Cliente);
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn admin_can_access_any_owner() {
        let admin = Claims {
            id: "a1".into(),
            correo: "a@example.com".into(),
            rol: Role::Admin,
            exp: 0,
        };
        assert!(admin.can_access("someone-else"));

        let cliente = Claims {
            id: "u1".into(),
            correo: "u@example.com".into(),
            rol: Role::Cliente,
            exp: 0,
        };
        assert!(cliente.can_access("u1"));
        assert!(!cliente.can_access("u2"));
    }
}
