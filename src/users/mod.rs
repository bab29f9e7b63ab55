use chrono::{Duration, Utc};
use diesel::insert_into;
use diesel::prelude::*;
use diesel::result::Error as DieselError;
use diesel::update as diesel_update;
use rocket::http::Status;
use rocket::outcome::Outcome;
use rocket::request::{self, FromRequest};
use rocket::response::status::Created;
use rocket::serde::json::{Json, Value};
use rocket::{Request, State};
use serde_json::json;

use crate::config::Settings;
use crate::db::schema::users;
use crate::db::DbConnection;
use crate::types::{ApiError, ApiResult, Validate, ValidationError};

pub mod models;
pub mod token;
mod utils;

use self::models::{AuthUser, NewUser, User};
use self::token::{Purpose, TokenError};
use self::utils::*;

#[derive(Debug, Deserialize)]
struct RegistrationDetails {
    username: String,
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
pub struct Registration {
    user: RegistrationDetails,
}

impl Validate for Registration {
    type Error = ApiError;
    fn validate(mut self, connection: &mut PgConnection) -> Result<Self, Self::Error> {
        let mut errors = ValidationError::default();
        self.user.email = self.user.email.trim().to_lowercase();
        self.user.username = self.user.username.trim().to_owned();

        collect(&mut errors, validate_email(&self.user.email, None, connection))?;
        collect(&mut errors, validate_username(&self.user.username, None, connection))?;
        if let Err(e) = validate_password(&self.user.password) {
            errors.merge(e);
        }

        errors.into_result()?;
        Ok(self)
    }
}

fn auth_token(user: &User, settings: &Settings) -> Result<String, ApiError> {
    token::issue(
        user,
        Purpose::Auth,
        &settings.secret_key,
        Duration::hours(settings.auth_token_ttl_hours),
        Utc::now(),
    )
}

fn user_json(user: &User, settings: &Settings) -> Result<Value, ApiError> {
    let token = auth_token(user, settings)?;
    Ok(json!({ "user": AuthUser::new(user, token) }))
}

// Mail delivery is out of scope; the link goes to the log instead.
fn send_verification_link(user: &User, settings: &Settings) -> Result<(), ApiError> {
    let token = token::issue(
        user,
        Purpose::Verify,
        &settings.secret_key,
        Duration::hours(settings.verify_token_ttl_hours),
        Utc::now(),
    )?;
    let link = settings.link(&format!("api/users/verify/{}", token));
    tracing::info!(user_id = user.id, email = %user.email, %link, "verification link issued");
    Ok(())
}

fn send_reset_link(user: &User, settings: &Settings) -> Result<(), ApiError> {
    let token = token::issue(
        user,
        Purpose::Reset,
        &settings.secret_key,
        Duration::minutes(settings.reset_token_ttl_minutes),
        Utc::now(),
    )?;
    let link = settings.link(&format!("api/users/password_reset/{}", token));
    tracing::info!(user_id = user.id, email = %user.email, %link, "password reset link issued");
    Ok(())
}

fn invalid_token(e: TokenError) -> ApiError {
    ValidationError::from("token", e.to_string()).into()
}

/// Resolves a verification or reset token to the user it was issued for.
fn user_for_token(
    raw: &str,
    purpose: Purpose,
    settings: &Settings,
    connection: &mut PgConnection,
) -> Result<User, ApiError> {
    let decoded = token::decode(raw).map_err(invalid_token)?;
    let user = match User::load_by_id(decoded.user_id, connection) {
        Ok(user) => user,
        Err(DieselError::NotFound) => return Err(invalid_token(TokenError::BadSignature)),
        Err(e) => return Err(e.into()),
    };
    decoded
        .verify(&user, purpose, &settings.secret_key, Utc::now())
        .map_err(invalid_token)?;
    Ok(user)
}

/// Creates an unverified account and sends its verification link.
pub fn register_user(
    conn: &mut PgConnection,
    settings: &Settings,
    registration: Registration,
) -> Result<User, ApiError> {
    let registration = registration.validate(conn)?;
    let new_user = NewUser {
        username: registration.user.username,
        email: registration.user.email,
        password_hash: User::make_password(&registration.user.password)?,
    };

    let user: User = insert_into(users::table)
        .values(&new_user)
        .returning(User::as_returning())
        .get_result(conn)?;
    tracing::info!(user_id = user.id, username = %user.username, "user registered");
    send_verification_link(&user, settings)?;
    Ok(user)
}

#[post("/", format = "json", data = "<registration>")]
pub async fn register(
    connection: DbConnection,
    settings: &State<Settings>,
    registration: Json<Registration>,
) -> Result<Created<Json<Value>>, ApiError> {
    let settings = settings.inner().clone();
    let registration = registration.into_inner();
    let body = connection
        .run(move |conn| {
            let user = register_user(conn, &settings, registration)?;
            user_json(&user, &settings)
        })
        .await?;
    Ok(Created::new("/api/user").body(Json(body)))
}

#[derive(Debug, Deserialize)]
struct LoginDetails {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct Login {
    user: LoginDetails,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for User {
    type Error = ApiError;

    async fn from_request(request: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        let raw = match request
            .headers()
            .get_one("Authorization")
            .and_then(token::from_header)
        {
            Some(raw) => raw,
            None => return Outcome::Error((Status::Unauthorized, ApiError::Unauthorized)),
        };
        let decoded = match token::decode(raw) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::debug!(error = %e, "rejected authorization token");
                return Outcome::Error((Status::Unauthorized, ApiError::Unauthorized));
            }
        };
        let secret = match request.rocket().state::<Settings>() {
            Some(settings) => settings.secret_key.clone(),
            None => return Outcome::Error((Status::InternalServerError, ApiError::Internal)),
        };
        let connection = match request.guard::<DbConnection>().await {
            Outcome::Success(connection) => connection,
            _ => return Outcome::Error((Status::ServiceUnavailable, ApiError::Internal)),
        };

        let user_id = decoded.user_id;
        let loaded = connection
            .run(move |conn| User::load_by_id(user_id, conn).map_err(ApiError::from))
            .await;
        match loaded {
            Ok(user) => match decoded.verify(&user, Purpose::Auth, &secret, Utc::now()) {
                Ok(()) => Outcome::Success(user),
                Err(e) => {
                    tracing::debug!(user_id, error = %e, "rejected authorization token");
                    Outcome::Error((Status::Unauthorized, ApiError::Unauthorized))
                }
            },
            Err(ApiError::Diesel(DieselError::NotFound)) => {
                Outcome::Error((Status::Unauthorized, ApiError::Unauthorized))
            }
            Err(e) => Outcome::Error((Status::InternalServerError, e)),
        }
    }
}

/// Checks the credentials of a verified account.
pub fn login_user(conn: &mut PgConnection, login: &Login) -> Result<User, ApiError> {
    let user = User::load_by_email(login.user.email.trim(), conn)?.ok_or(ApiError::NotFound)?;
    if !user.verify_password(&login.user.password)? {
        return Err(ValidationError::from("password", "Invalid password").into());
    }
    if !user.is_verified {
        return Err(ValidationError::from("email", "email is not verified").into());
    }
    tracing::debug!(user_id = user.id, "user logged in");
    Ok(user)
}

#[post("/login", format = "json", data = "<login>")]
pub async fn login(
    connection: DbConnection,
    settings: &State<Settings>,
    login: Json<Login>,
) -> ApiResult<Value> {
    let settings = settings.inner().clone();
    connection
        .run(move |conn| {
            let user = login_user(conn, &login)?;
            user_json(&user, &settings)
        })
        .await
        .map(Json)
}

pub fn verify_email(conn: &mut PgConnection, settings: &Settings, token: &str) -> Result<User, ApiError> {
    let mut user = user_for_token(token, Purpose::Verify, settings, conn)?;
    if !user.is_verified {
        diesel_update(&user)
            .set(users::is_verified.eq(true))
            .execute(conn)?;
        user.is_verified = true;
        tracing::info!(user_id = user.id, "email verified");
    }
    Ok(user)
}

#[get("/verify/<token>")]
pub async fn verify(
    connection: DbConnection,
    settings: &State<Settings>,
    token: String,
) -> ApiResult<Value> {
    let settings = settings.inner().clone();
    connection
        .run(move |conn| {
            let user = verify_email(conn, &settings, &token)?;
            user_json(&user, &settings)
        })
        .await
        .map(Json)
}

#[derive(Debug, Deserialize)]
struct EmailDetails {
    email: String,
}

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    user: EmailDetails,
}

pub fn resend_verification_link(
    conn: &mut PgConnection,
    settings: &Settings,
    email: &str,
) -> Result<(), ApiError> {
    let user = User::load_by_email(email.trim(), conn)?.ok_or(ApiError::NotFound)?;
    if user.is_verified {
        return Err(ValidationError::from("email", "email is already verified").into());
    }
    send_verification_link(&user, settings)
}

#[post("/verify", format = "json", data = "<request>")]
pub async fn resend_verification(
    connection: DbConnection,
    settings: &State<Settings>,
    request: Json<EmailRequest>,
) -> ApiResult<Value> {
    let settings = settings.inner().clone();
    connection
        .run(move |conn| resend_verification_link(conn, &settings, &request.user.email))
        .await?;
    Ok(Json(json!({ "message": "verification link sent" })))
}

/// Sends a reset link when the email belongs to an account. Unknown emails
/// succeed silently.
pub fn send_password_reset(conn: &mut PgConnection, settings: &Settings, email: &str) -> Result<(), ApiError> {
    match User::load_by_email(email.trim(), conn)? {
        Some(user) => send_reset_link(&user, settings)?,
        None => tracing::debug!("password reset requested for unknown email"),
    }
    Ok(())
}

#[post("/password_reset", format = "json", data = "<request>")]
pub async fn request_password_reset(
    connection: DbConnection,
    settings: &State<Settings>,
    request: Json<EmailRequest>,
) -> ApiResult<Value> {
    let settings = settings.inner().clone();
    connection
        .run(move |conn| send_password_reset(conn, &settings, &request.user.email))
        .await?;
    Ok(Json(json!({
        "message": "if the email is registered, a reset link has been sent"
    })))
}

#[derive(Debug, Deserialize)]
struct PasswordDetails {
    password: String,
}

#[derive(Debug, Deserialize)]
pub struct PasswordReset {
    user: PasswordDetails,
}

/// Replaces the password of the account a reset token was issued for. The new
/// hash invalidates the token.
pub fn change_password(
    conn: &mut PgConnection,
    settings: &Settings,
    token: &str,
    password: &str,
) -> Result<(), ApiError> {
    let mut user = user_for_token(token, Purpose::Reset, settings, conn)?;
    validate_password(password)?;
    user.new_password(password)?;
    diesel_update(&user)
        .set(users::password_hash.eq(&user.password_hash))
        .execute(conn)?;
    tracing::info!(user_id = user.id, "password reset");
    Ok(())
}

#[put("/password_reset/<token>", format = "json", data = "<reset>")]
pub async fn reset_password(
    connection: DbConnection,
    settings: &State<Settings>,
    token: String,
    reset: Json<PasswordReset>,
) -> ApiResult<Value> {
    let settings = settings.inner().clone();
    connection
        .run(move |conn| change_password(conn, &settings, &token, &reset.user.password))
        .await?;
    Ok(Json(json!({ "message": "password has been reset" })))
}

#[get("/user")]
pub async fn current(user: User, settings: &State<Settings>) -> ApiResult<Value> {
    user_json(&user, settings).map(Json)
}

#[derive(Debug, Deserialize)]
pub struct UpdateUser {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub image: Option<String>,
    pub bio: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub user: UpdateUser,
}

/// Applies a partial profile update. A new email must be verified again.
pub fn update_user(
    conn: &mut PgConnection,
    settings: &Settings,
    mut user: User,
    update: UpdateUser,
) -> Result<User, ApiError> {
    let mut error = ValidationError::default();
    let mut email_changed = false;

    if let Some(bio) = update.bio {
        user.bio = Some(bio).filter(|b| !b.trim().is_empty());
    }
    if let Some(image) = update.image {
        user.image = Some(image).filter(|i| !i.trim().is_empty());
    }

    if let Some(new_email) = update.email {
        let new_email = new_email.trim().to_lowercase();
        if new_email != user.email {
            collect(&mut error, validate_email(&new_email, Some(user.id), conn))?;
            user.email = new_email;
            user.is_verified = false;
            email_changed = true;
        }
    }

    if let Some(new_username) = update.username {
        let new_username = new_username.trim().to_owned();
        if new_username != user.username {
            collect(&mut error, validate_username(&new_username, Some(user.id), conn))?;
            user.username = new_username;
        }
    }

    if let Some(new_password) = update.password {
        match validate_password(&new_password) {
            Err(e) => error.merge(e),
            Ok(()) => user.new_password(&new_password)?,
        }
    }

    error.into_result()?;
    diesel_update(&user).set(&user).execute(conn)?;
    if email_changed {
        send_verification_link(&user, settings)?;
    }
    Ok(user)
}

#[put("/user", format = "json", data = "<update>")]
pub async fn update(
    user: User,
    connection: DbConnection,
    settings: &State<Settings>,
    update: Json<Update>,
) -> ApiResult<Value> {
    let settings = settings.inner().clone();
    let update = update.into_inner().user;
    connection
        .run(move |conn| {
            let user = update_user(conn, &settings, user, update)?;
            user_json(&user, &settings)
        })
        .await
        .map(Json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;

    fn settings() -> Settings {
        Settings::default()
    }

    fn registration(username: &str, email: &str) -> Registration {
        serde_json::from_value(json!({
            "user": { "username": username, "email": email, "password": "correct horse 1" }
        }))
        .unwrap()
    }

    fn credentials(email: &str, password: &str) -> Login {
        serde_json::from_value(json!({ "user": { "email": email, "password": password } })).unwrap()
    }

    fn issue(user: &User, purpose: Purpose) -> String {
        token::issue(user, purpose, &settings().secret_key, Duration::hours(1), Utc::now()).unwrap()
    }

    fn no_changes() -> UpdateUser {
        UpdateUser {
            username: None,
            email: None,
            password: None,
            image: None,
            bio: None,
        }
    }

    #[test]
    fn login_waits_for_email_verification() {
        let Some(mut conn) = testing::connection() else { return };
        let user = register_user(&mut conn, &settings(), registration("ada", " Ada@Example.com ")).unwrap();
        assert_eq!(user.email, "ada@example.com");
        assert!(!user.is_verified);

        let login = credentials("ada@example.com", "correct horse 1");
        match login_user(&mut conn, &login) {
            Err(ApiError::Validation(e)) => {
                assert_eq!(e.messages("email"), ["email is not verified".to_owned()])
            }
            other => panic!("expected a validation error, got {:?}", other),
        }

        let verified = verify_email(&mut conn, &settings(), &issue(&user, Purpose::Verify)).unwrap();
        assert!(verified.is_verified);
        assert_eq!(login_user(&mut conn, &login).unwrap().id, user.id);
        assert!(matches!(
            resend_verification_link(&mut conn, &settings(), "ada@example.com"),
            Err(ApiError::Validation(_))
        ));
    }

    #[test]
    fn wrong_passwords_and_unknown_emails_are_refused() {
        let Some(mut conn) = testing::connection() else { return };
        testing::user(&mut conn, "ada");

        assert!(matches!(
            login_user(&mut conn, &credentials("ada@example.com", "wrong horse 1")),
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            login_user(&mut conn, &credentials("nobody@example.com", "correct horse 1")),
            Err(ApiError::NotFound)
        ));
    }

    #[test]
    fn registration_rejects_taken_names_and_emails() {
        let Some(mut conn) = testing::connection() else { return };
        testing::user(&mut conn, "ada");

        match register_user(&mut conn, &settings(), registration("ada", "ada@example.com")) {
            Err(ApiError::Validation(e)) => {
                assert!(!e.messages("email").is_empty());
                assert!(!e.messages("username").is_empty());
            }
            other => panic!("expected a validation error, got {:?}", other),
        }
    }

    #[test]
    fn reset_tokens_work_once() {
        let Some(mut conn) = testing::connection() else { return };
        let ada = testing::user(&mut conn, "ada");
        let token = issue(&ada, Purpose::Reset);

        assert!(matches!(
            change_password(&mut conn, &settings(), &issue(&ada, Purpose::Verify), "brand new pass 2"),
            Err(ApiError::Validation(_))
        ));
        change_password(&mut conn, &settings(), &token, "brand new pass 2").unwrap();
        assert!(matches!(
            change_password(&mut conn, &settings(), &token, "another pass 3"),
            Err(ApiError::Validation(_))
        ));
        assert_eq!(
            login_user(&mut conn, &credentials("ada@example.com", "brand new pass 2")).unwrap().id,
            ada.id
        );
        send_password_reset(&mut conn, &settings(), "nobody@example.com").unwrap();
    }

    #[test]
    fn updates_check_uniqueness_against_other_users() {
        let Some(mut conn) = testing::connection() else { return };
        let ada = testing::user(&mut conn, "ada");
        testing::user(&mut conn, "grace");

        let same = UpdateUser {
            email: Some("ada@example.com".to_owned()),
            username: Some("ada".to_owned()),
            bio: Some("engines".to_owned()),
            ..no_changes()
        };
        let kept = update_user(&mut conn, &settings(), ada.clone(), same).unwrap();
        assert!(kept.is_verified);
        assert_eq!(kept.bio.as_deref(), Some("engines"));

        let taken = UpdateUser {
            email: Some("grace@example.com".to_owned()),
            ..no_changes()
        };
        assert!(matches!(
            update_user(&mut conn, &settings(), kept.clone(), taken),
            Err(ApiError::Validation(_))
        ));

        let moved = UpdateUser {
            email: Some("countess@example.com".to_owned()),
            ..no_changes()
        };
        let moved = update_user(&mut conn, &settings(), kept, moved).unwrap();
        assert!(!moved.is_verified);
        assert!(!User::load_by_id(ada.id, &mut conn).unwrap().is_verified);
    }
}
