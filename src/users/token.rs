use chrono::{DateTime, Duration, Utc};
use sha2::Sha256;
use jwt::{Header, Registered, Token};
use std::fmt;

use super::models::User;
use crate::types::ApiError;

/// What a token may be used for; carried in the `aud` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Auth,
    Verify,
    Reset,
}

impl Purpose {
    pub fn audience(self) -> &'static str {
        match self {
            Purpose::Auth => "auth",
            Purpose::Verify => "verify",
            Purpose::Reset => "reset",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    Malformed,
    BadSignature,
    WrongPurpose,
    Expired,
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match *self {
            TokenError::Malformed => "malformed token",
            TokenError::BadSignature => "invalid token signature",
            TokenError::WrongPurpose => "token cannot be used here",
            TokenError::Expired => "token has expired",
        };
        f.write_str(msg)
    }
}

// The password hash is part of the key, so changing the password revokes
// every token issued before.
fn signing_key(secret: &str, user: &User) -> Vec<u8> {
    let mut key = Vec::with_capacity(secret.len() + user.password_hash.len());
    key.extend_from_slice(secret.as_bytes());
    key.extend_from_slice(user.password_hash.as_bytes());
    key
}

pub fn issue(
    user: &User,
    purpose: Purpose,
    secret: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<String, ApiError> {
    let claims = Registered {
        iss: Some(user.email.clone()),
        sub: Some(user.id.to_string()),
        aud: Some(purpose.audience().to_owned()),
        exp: Some((now + ttl).timestamp().max(0) as u64),
        iat: Some(now.timestamp().max(0) as u64),
        ..Default::default()
    };
    Token::new(Header::default(), claims)
        .signed(&signing_key(secret, user), Sha256::default())
        .map_err(|_| ApiError::Internal)
}

/// A parsed token whose signature has not been checked yet. The subject is
/// needed first to look up the signing key.
pub struct DecodedToken {
    token: Token<Header, Registered>,
    pub user_id: i32,
}

pub fn decode(raw: &str) -> Result<DecodedToken, TokenError> {
    let token = Token::<Header, Registered>::parse(raw).map_err(|_| TokenError::Malformed)?;
    let user_id = token
        .claims
        .sub
        .as_ref()
        .and_then(|sub| sub.parse::<i32>().ok())
        .ok_or(TokenError::Malformed)?;
    Ok(DecodedToken { token, user_id })
}

impl DecodedToken {
    pub fn verify(
        &self,
        user: &User,
        purpose: Purpose,
        secret: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TokenError> {
        if !self.token.verify(&signing_key(secret, user), Sha256::default()) {
            return Err(TokenError::BadSignature);
        }
        let claims = &self.token.claims;
        if claims.iss.as_deref() != Some(user.email.as_str()) {
            return Err(TokenError::BadSignature);
        }
        if claims.aud.as_deref() != Some(purpose.audience()) {
            return Err(TokenError::WrongPurpose);
        }
        match claims.exp {
            Some(exp) if (exp as i64) > now.timestamp() => Ok(()),
            _ => Err(TokenError::Expired),
        }
    }
}

/// Extracts the JWT from an `Authorization: Token ..` or `Bearer ..` header.
pub fn from_header(header: &str) -> Option<&str> {
    let header = header.trim();
    let token = header
        .strip_prefix("Token ")
        .or_else(|| header.strip_prefix("Bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::models::sample;

    const SECRET: &str = "test-secret";

    #[test]
    fn issued_tokens_verify_for_their_purpose() {
        let user = sample(42, "ada");
        let now = Utc::now();
        let raw = issue(&user, Purpose::Auth, SECRET, Duration::hours(1), now).unwrap();

        let decoded = decode(&raw).unwrap();
        assert_eq!(decoded.user_id, 42);
        assert_eq!(decoded.verify(&user, Purpose::Auth, SECRET, now), Ok(()));
        assert_eq!(
            decoded.verify(&user, Purpose::Reset, SECRET, now),
            Err(TokenError::WrongPurpose)
        );
    }

    #[test]
    fn password_change_revokes_tokens() {
        let mut user = sample(3, "grace");
        let now = Utc::now();
        let raw = issue(&user, Purpose::Reset, SECRET, Duration::minutes(30), now).unwrap();
        user.new_password("brand new pass 9").unwrap();

        let decoded = decode(&raw).unwrap();
        assert_eq!(
            decoded.verify(&user, Purpose::Reset, SECRET, now),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn other_secrets_are_rejected() {
        let user = sample(3, "grace");
        let now = Utc::now();
        let raw = issue(&user, Purpose::Auth, SECRET, Duration::hours(1), now).unwrap();
        let decoded = decode(&raw).unwrap();
        assert_eq!(
            decoded.verify(&user, Purpose::Auth, "someone-else", now),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let user = sample(5, "linus");
        let issued = Utc::now() - Duration::hours(3);
        let raw = issue(&user, Purpose::Verify, SECRET, Duration::hours(1), issued).unwrap();
        let decoded = decode(&raw).unwrap();
        assert_eq!(
            decoded.verify(&user, Purpose::Verify, SECRET, Utc::now()),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn garbage_is_malformed() {
        assert_eq!(decode("not-a-jwt").err(), Some(TokenError::Malformed));
    }

    #[test]
    fn header_prefixes() {
        assert_eq!(from_header("Token abc.def.ghi"), Some("abc.def.ghi"));
        assert_eq!(from_header("Bearer abc"), Some("abc"));
        assert_eq!(from_header("Token   "), None);
        assert_eq!(from_header("Basic Zm9vOmJhcg=="), None);
    }
}
