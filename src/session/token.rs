//! Self-describing access tokens.
//!
//! When the registered-token lookup misses and a JWT key is configured,
//! the document id from the handshake is parsed as a JWS compact token:
//! HMAC-SHA-256 only, `sub` is the real document id, the custom claims
//! `u` and `p` carry the user id and permission letters, and `exp` is
//! enforced with zero leeway.

use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, errors::ErrorKind};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::store::{Permissions, TokenGrant};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    u: String,
    #[serde(default)]
    p: String,
    exp: i64,
}

pub fn decode_token(
    jwt_key: &str,
    key_is_base64: bool,
    token: &str,
) -> Result<TokenGrant, StoreError> {
    let key = if key_is_base64 {
        base64::engine::general_purpose::STANDARD
            .decode(jwt_key)
            .map_err(|_| StoreError::SignatureInvalid)?
    } else {
        jwt_key.as_bytes().to_vec()
    };

    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.set_required_spec_claims(&["exp", "sub"]);

    let data = jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(&key), &validation)
        .map_err(|err| {
            debug!("token rejected: {err}");
            match err.kind() {
                ErrorKind::ExpiredSignature => StoreError::TokenExpired,
                ErrorKind::InvalidSignature => StoreError::SignatureInvalid,
                _ => StoreError::Missing,
            }
        })?;

    Ok(TokenGrant {
        doc_id: data.claims.sub,
        user_id: data.claims.u,
        permissions: Permissions::parse(&data.claims.p),
    })
}
