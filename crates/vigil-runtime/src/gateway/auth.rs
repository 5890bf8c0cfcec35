use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use vigil_core::audit::AuditActor;

use super::response::ApiError;

/// Claims carried by admin JWTs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: String,
    /// Session id.
    #[serde(default)]
    pub sid: String,
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
}

/// Authenticated principal attached to each request, combining JWT claims
/// with request metadata. Handlers forward it into audit appends.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub user_email: String,
    pub user_role: String,
    pub session_id: String,
    pub client_ip: String,
    pub user_agent: String,
}

impl Principal {
    /// Principal for requests that presented no (valid) token.
    pub fn anonymous(client_ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            user_id: String::new(),
            user_email: String::new(),
            user_role: String::new(),
            session_id: String::new(),
            client_ip: client_ip.into(),
            user_agent: user_agent.into(),
        }
    }

    /// Whether a valid token backed this request.
    pub fn is_authenticated(&self) -> bool {
        !self.user_id.is_empty()
    }

    /// Roles allowed to hit write endpoints.
    pub fn can_write(&self) -> bool {
        self.is_authenticated()
            && !matches!(self.user_role.as_str(), "viewer" | "readonly" | "read_only")
    }

    /// Actor fields for the audit ledger.
    pub fn audit_actor(&self) -> AuditActor {
        AuditActor::new(&self.user_id, &self.user_email, &self.user_role)
    }

    /// Rate-limit bucket key: by user when authenticated, by ip otherwise.
    pub fn bucket_key(&self) -> String {
        if self.is_authenticated() {
            format!("user:{}", self.user_id)
        } else {
            format!("ip:{}", self.client_ip)
        }
    }
}

/// JWT validation middleware state.
#[derive(Clone)]
pub struct AuthMiddleware {
    decoding_key: DecodingKey,
}

impl AuthMiddleware {
    pub fn new(jwt_secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
        }
    }

    /// Validate a bearer token into claims.
    pub fn validate_token(&self, token: &str) -> Result<Claims, ApiError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 60;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    ApiError::unauthorized("token expired")
                }
                _ => ApiError::unauthorized("invalid token"),
            }
        })?;

        Ok(data.claims)
    }
}

/// Extract the bearer token, validate it, and attach a [`Principal`] to the
/// request. Requests without a valid token carry an anonymous principal;
/// write handlers reject those.
pub async fn auth_middleware(
    State(auth): State<Arc<AuthMiddleware>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim);

    let client_ip = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .unwrap_or("unknown")
        .trim()
        .to_string();

    let user_agent = req
        .headers()
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let principal = token
        .and_then(|token| auth.validate_token(token).ok())
        .map(|claims| Principal {
            user_id: claims.sub,
            user_email: claims.email,
            user_role: claims.role,
            session_id: claims.sid,
            client_ip: client_ip.clone(),
            user_agent: user_agent.clone(),
        })
        .unwrap_or_else(|| Principal::anonymous(client_ip, user_agent));

    let mut req = req;
    req.extensions_mut().insert(principal);

    next.run(req).await
}

/// Check a principal against a write endpoint: authenticated and not
/// read-only.
pub fn require_writer(principal: &Principal) -> Result<&Principal, ApiError> {
    if !principal.is_authenticated() {
        return Err(ApiError::unauthorized("authentication required"));
    }
    if !principal.can_write() {
        return Err(ApiError::forbidden("read-only principals cannot write"));
    }
    Ok(principal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims(expired: bool) -> Claims {
        let now = chrono::Utc::now().timestamp();
        Claims {
            sub: "u-1".to_string(),
            email: "admin@example.com".to_string(),
            role: "admin".to_string(),
            sid: "sess-1".to_string(),
            exp: if expired { now - 3600 } else { now + 3600 },
            iat: now,
        }
    }

    fn principal(role: &str) -> Principal {
        Principal {
            user_id: "u-1".to_string(),
            user_email: "admin@example.com".to_string(),
            user_role: role.to_string(),
            session_id: "sess-1".to_string(),
            client_ip: "10.0.0.1".to_string(),
            user_agent: "curl/8.0".to_string(),
        }
    }

    #[test]
    fn test_valid_token() {
        let auth = AuthMiddleware::new("secret");
        let claims = auth.validate_token(&token(&claims(false), "secret")).unwrap();
        assert_eq!(claims.sub, "u-1");
        assert_eq!(claims.role, "admin");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let auth = AuthMiddleware::new("secret");
        assert!(auth.validate_token(&token(&claims(false), "other")).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let auth = AuthMiddleware::new("secret");
        let err = auth.validate_token(&token(&claims(true), "secret")).unwrap_err();
        assert!(err.message.contains("expired"));
    }

    #[test]
    fn test_garbage_token_rejected() {
        let auth = AuthMiddleware::new("secret");
        assert!(auth.validate_token("not-a-jwt").is_err());
    }

    #[test]
    fn test_write_roles() {
        assert!(principal("admin").can_write());
        assert!(principal("operator").can_write());
        assert!(!principal("viewer").can_write());
        assert!(!principal("readonly").can_write());
        assert!(!Principal::anonymous("10.0.0.1", "curl").can_write());
    }

    #[test]
    fn test_require_writer() {
        let anonymous = Principal::anonymous("10.0.0.1", "curl");
        let err = require_writer(&anonymous).unwrap_err();
        assert_eq!(err.error, "UNAUTHORIZED");

        let viewer = principal("viewer");
        let err = require_writer(&viewer).unwrap_err();
        assert_eq!(err.error, "FORBIDDEN");

        let admin = principal("admin");
        assert!(require_writer(&admin).is_ok());
    }

    #[test]
    fn test_bucket_keys() {
        assert_eq!(principal("admin").bucket_key(), "user:u-1");
        assert_eq!(
            Principal::anonymous("10.0.0.1", "curl").bucket_key(),
            "ip:10.0.0.1"
        );
    }

    #[test]
    fn test_audit_actor_mapping() {
        let actor = principal("admin").audit_actor();
        assert_eq!(actor.user_id, "u-1");
        assert_eq!(actor.user_email, "admin@example.com");
        assert_eq!(actor.user_role, "admin");
    }
}
