use diesel::dsl::exists;
use diesel::prelude::*;
use diesel::select;
use regex::Regex;

use crate::db::schema::users;
use crate::types::{ApiError, ValidationError};

lazy_static! {
    static ref EMAIL_RE: Regex = {
        let pattern = r"\A[a-z0-9!#$%&'*+/=?^_`{|}~-]+(?:\.[a-z0-9!#$%&'*+/=?^_`{|}~-]+)*@(?:[a-z0-9](?:[a-z0-9-]*[a-z0-9])?\.)+[a-z0-9](?:[a-z0-9-]*[a-z0-9])?\z";
        Regex::new(pattern).unwrap()
    };
    static ref USERNAME_RE: Regex = Regex::new(r"\A[A-Za-z0-9_-]{3,32}\z").unwrap();
}

pub const MIN_PASSWORD_LEN: usize = 8;

pub fn validate_email_re(email: &str) -> Result<(), ValidationError> {
    if !EMAIL_RE.is_match(email) {
        Err(ValidationError::from(
            "email",
            format!("Invalid email: {}", email),
        ))
    } else {
        Ok(())
    }
}

pub fn validate_username_re(username: &str) -> Result<(), ValidationError> {
    if !USERNAME_RE.is_match(username) {
        Err(ValidationError::from(
            "username",
            "Username must be 3-32 letters, digits, '_' or '-'",
        ))
    } else {
        Ok(())
    }
}

pub fn validate_password(password: &str) -> Result<(), ValidationError> {
    let mut errors = ValidationError::default();
    if password.chars().count() < MIN_PASSWORD_LEN {
        errors.add_error(
            "password",
            format!("Password must be at least {} characters", MIN_PASSWORD_LEN),
        );
    }
    let has_letter = password.chars().any(char::is_alphabetic);
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !(has_letter && has_digit) {
        errors.add_error("password", "Password must contain letters and digits");
    }
    errors.into_result()
}

/// Format check plus uniqueness against every user except `except`.
pub fn validate_email(
    email_to_validate: &str,
    except: Option<i32>,
    connection: &mut PgConnection,
) -> Result<(), ApiError> {
    let mut errors = ValidationError::default();
    if let Err(e) = validate_email_re(email_to_validate) {
        errors.merge(e);
    }

    let taken = users::table
        .filter(users::email.eq(email_to_validate))
        .filter(users::id.ne(except.unwrap_or(0)));
    let email_exists = select(exists(taken)).get_result::<bool>(connection)?;
    if email_exists {
        errors.add_error("email", "Email already exists");
    }
    errors.into_result().map_err(|e| e.into())
}

pub fn validate_username(
    username_to_validate: &str,
    except: Option<i32>,
    connection: &mut PgConnection,
) -> Result<(), ApiError> {
    let mut errors = ValidationError::default();
    if let Err(e) = validate_username_re(username_to_validate) {
        errors.merge(e);
    }

    let taken = users::table
        .filter(users::username.eq(username_to_validate))
        .filter(users::id.ne(except.unwrap_or(0)));
    let username_exists = select(exists(taken)).get_result::<bool>(connection)?;
    if username_exists {
        errors.add_error("username", "Username already exists");
    }
    errors.into_result().map_err(|e| e.into())
}

/// Collects field errors into `errors`; anything else is returned.
pub fn collect(errors: &mut ValidationError, result: Result<(), ApiError>) -> Result<(), ApiError> {
    match result {
        Ok(()) => Ok(()),
        Err(ApiError::Validation(e)) => {
            errors.merge(e);
            Ok(())
        }
        Err(other) => Err(other),
    }
}
