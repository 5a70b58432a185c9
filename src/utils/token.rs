use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};

use crate::middleware::auth::Claims;
use crate::models::actor::Actor;

/// Signs an HS256 bearer token for `actor`, valid for `ttl`.
pub fn issue_token(
    actor: &Actor,
    secret: &str,
    ttl: Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: actor.id.to_string(),
        exp: (Utc::now() + ttl).timestamp() as usize,
        role: Some(actor.role.as_str().to_string()),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}
