use chrono::{DateTime, Utc};
use crypto::pbkdf2::{pbkdf2_check, pbkdf2_simple};
use diesel::prelude::*;
use std::borrow::Cow;
use std::io::Result as IoResult;

use crate::db::schema::users;
use crate::profile::Profile;
use crate::types::ApiError;

const PBKDF2_ROUNDS: u32 = 10_000;

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, AsChangeset)]
#[diesel(table_name = users, treat_none_as_null = true)]
pub struct User {
    pub id: i32,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub bio: Option<String>,
    pub image: Option<String>,
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
    pub notifications_enabled: bool,
}

impl User {
    pub fn make_password(password: &str) -> IoResult<String> {
        pbkdf2_simple(password, PBKDF2_ROUNDS)
    }

    pub fn new_password(&mut self, password: &str) -> IoResult<()> {
        self.password_hash = Self::make_password(password)?;
        Ok(())
    }

    pub fn verify_password(&self, password_to_verify: &str) -> Result<bool, ApiError> {
        pbkdf2_check(password_to_verify, &self.password_hash).map_err(|_| ApiError::Internal)
    }

    pub fn profile(&self, following: bool) -> Profile<'static> {
        Profile {
            username: Cow::Owned(self.username.clone()),
            bio: self.bio.clone().map(Cow::Owned),
            image: self.image.clone().map(Cow::Owned),
            following,
        }
    }

    pub fn load_by_id(user_id: i32, connection: &mut PgConnection) -> QueryResult<User> {
        users::table
            .find(user_id)
            .select(User::as_select())
            .get_result(connection)
    }

    pub fn load_by_name(name: &str, connection: &mut PgConnection) -> Result<User, ApiError> {
        users::table
            .filter(users::username.eq(name))
            .select(User::as_select())
            .get_result(connection)
            .map_err(|e| e.into())
    }

    pub fn load_by_email(email: &str, connection: &mut PgConnection) -> QueryResult<Option<User>> {
        users::table
            .filter(users::email.eq(email.to_lowercase()))
            .select(User::as_select())
            .get_result(connection)
            .optional()
    }
}

#[derive(Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

/// The authenticated user as returned by the auth endpoints.
#[derive(Debug, Serialize)]
pub struct AuthUser<'a> {
    pub email: &'a str,
    pub token: String,
    pub username: &'a str,
    pub bio: Option<&'a str>,
    pub image: Option<&'a str>,
    pub verified: bool,
    pub subscribed: bool,
}

impl<'a> AuthUser<'a> {
    pub fn new(user: &'a User, token: String) -> Self {
        AuthUser {
            email: &user.email,
            token,
            username: &user.username,
            bio: user.bio.as_deref(),
            image: user.image.as_deref(),
            verified: user.is_verified,
            subscribed: user.notifications_enabled,
        }
    }
}

#[cfg(test)]
pub(crate) fn sample(id: i32, username: &str) -> User {
    User {
        id,
        username: username.to_owned(),
        email: format!("{}@example.com", username),
        password_hash: User::make_password("correct horse 1").unwrap(),
        bio: None,
        image: None,
        is_verified: true,
        created_at: Utc::now(),
        notifications_enabled: true,
    }
}
