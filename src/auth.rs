use actix_web::{
    cookie::{Cookie, SameSite},
    dev::Payload,
    http::header::AUTHORIZATION,
    web, FromRequest, HttpRequest,
};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{Duration, Utc};
use futures_util::future::{ready, Ready};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::{AppError, Result};
use crate::models::Role;

pub const SESSION_COOKIE: &str = "session";

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))?
        .to_string();

    Ok(password_hash)
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| AppError::Internal(format!("Invalid password hash format: {}", e)))?;

    Ok(Argon2::default().verify_password(password.as_bytes(), &parsed_hash).is_ok())
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: Uuid,
    role: Role,
    iat: i64,
    exp: i64,
}

/// Signs and checks session tokens. There is no server-side session table:
/// a token is valid until it expires.
#[derive(Clone)]
pub struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    hours: i64,
    secure_cookies: bool,
}

impl SessionKeys {
    pub fn new(config: &AuthConfig) -> Self {
        let secret = config.session_secret.as_bytes();
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            hours: config.session_hours,
            secure_cookies: config.secure_cookies,
        }
    }

    pub fn issue(&self, user_id: Uuid, role: Role) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id,
            role,
            iat: now.timestamp(),
            exp: (now + Duration::hours(self.hours)).timestamp(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    pub fn verify(&self, token: &str) -> Result<LoggedUser> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))?;
        Ok(LoggedUser {
            user_id: data.claims.sub,
            role: data.claims.role,
            expire_ts: data.claims.exp,
        })
    }

    pub fn session_cookie(&self, token: String) -> Cookie<'static> {
        Cookie::build(SESSION_COOKIE, token)
            .path("/")
            .secure(self.secure_cookies)
            .http_only(true)
            .same_site(SameSite::Strict)
            .max_age(time::Duration::hours(self.hours))
            .finish()
    }

    pub fn removal_cookie(&self) -> Cookie<'static> {
        Cookie::build(SESSION_COOKIE, "")
            .path("/")
            .max_age(time::Duration::seconds(0))
            .finish()
    }
}

// Extractor for authenticated callers, admin or student
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedUser {
    pub user_id: Uuid,
    pub role: Role,
    pub expire_ts: i64,
}

impl LoggedUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins see every student; a student only sees themselves.
    pub fn ensure_can_access(&self, student_id: Uuid) -> Result<()> {
        if self.is_admin() || self.user_id == student_id {
            Ok(())
        } else {
            Err(AppError::Forbidden("Not allowed to access another student's fees".to_string()))
        }
    }
}

/// An explicit `Authorization: Bearer` header wins over the cookie.
fn bearer_token(req: &HttpRequest) -> Option<String> {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_owned())
        .filter(|t| !t.is_empty());
    header.or_else(|| req.cookie(SESSION_COOKIE).map(|c| c.value().to_owned()))
}

impl FromRequest for LoggedUser {
    type Error = AppError;
    type Future = Ready<std::result::Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let Some(keys) = req.app_data::<web::Data<SessionKeys>>() else {
            tracing::error!("SessionKeys missing from app data");
            return ready(Err(AppError::Internal("session keys not configured".to_string())));
        };

        match bearer_token(req) {
            Some(token) => match keys.verify(&token) {
                Ok(user) => {
                    tracing::debug!("Session valid for {} ({:?})", user.user_id, user.role);
                    ready(Ok(user))
                }
                Err(e) => {
                    tracing::debug!("Session rejected: {}", e);
                    ready(Err(AppError::Unauthorized("Invalid or expired session".to_string())))
                }
            },
            None => {
                tracing::debug!("Session cookie missing.");
                ready(Err(AppError::Unauthorized("Authentication credentials missing".to_string())))
            }
        }
    }
}

/// A `LoggedUser` holding the admin role.
#[derive(Debug, Clone)]
pub struct AdminUser(pub LoggedUser);

impl FromRequest for AdminUser {
    type Error = AppError;
    type Future = Ready<std::result::Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let user = match LoggedUser::from_request(req, payload).into_inner() {
            Ok(user) => user,
            Err(e) => return ready(Err(e)),
        };
        if user.is_admin() {
            ready(Ok(AdminUser(user)))
        } else {
            tracing::warn!("Student {} attempted an admin action", user.user_id);
            ready(Err(AppError::Forbidden("Admin access required".to_string())))
        }
    }
}
