use actix_web::{dev::Payload, Error, FromRequest, HttpRequest};
use actix_web_httpauth::extractors::bearer::BearerAuth;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::env;
use std::future::{ready, Ready};

use crate::models::Id;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Id, // chat user id
    pub exp: usize,
}

fn secret() -> Option<String> {
    env::var("JWT_SECRET").ok().filter(|s| !s.is_empty())
}

/// Validate a JWT and return its claims.
fn decode_jwt(token: &str) -> Option<Claims> {
    let secret = secret()?;
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map(|data| data.claims)
        .ok()
}

/// Extractor for the calling user. The raw token is kept so the backend
/// gateway can act on the user's behalf.
#[derive(Debug, Clone)]
pub struct SessionUser {
    pub user_id: Id,
    pub token: String,
}

impl FromRequest for SessionUser {
    type Error = Error;
    type Future = Ready<Result<Self, Error>>;

    fn from_request(req: &HttpRequest, pl: &mut Payload) -> Self::Future {
        if let Ok(bearer) = BearerAuth::from_request(req, pl).into_inner() {
            return match decode_jwt(bearer.token()) {
                Some(claims) => ready(Ok(SessionUser { user_id: claims.sub, token: bearer.token().to_string() })),
                None => ready(Err(actix_web::error::ErrorUnauthorized("Invalid JWT"))),
            };
        }
        ready(Err(actix_web::error::ErrorUnauthorized("Authorization required")))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TokenError {
    #[error("JWT_SECRET not set")]
    MissingSecret,
    #[error(transparent)]
    Encode(#[from] jsonwebtoken::errors::Error),
}

/// Issue a 24h token for `user_id`.
pub fn create_jwt(user_id: Id) -> Result<String, TokenError> {
    let secret = secret().ok_or(TokenError::MissingSecret)?;
    let exp = (chrono::Utc::now() + chrono::Duration::hours(24)).timestamp() as usize;
    let claims = Claims { sub: user_id, exp };
    Ok(encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))?)
}
