#[macro_use]
extern crate rocket;
#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate serde_derive;

mod article;
mod comment;
mod config;
mod db;
mod notify;
mod profile;
mod rating;
mod reaction;
mod types;
mod users;
mod utils;

use rocket::serde::json::Value;
use rocket::{Build, Request, Rocket};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::db::Pool;

fn error_body(field: &str, message: &str) -> Value {
    json!({ "errors": { field: [message] } })
}

#[catch(400)]
fn bad_request() -> Value {
    error_body("body", "malformed request")
}

#[catch(401)]
fn unauthorized() -> Value {
    error_body("token", "missing or invalid authorization token")
}

#[catch(403)]
fn forbidden() -> Value {
    error_body("permission", "you are not allowed to do this")
}

#[catch(404)]
fn not_found() -> Value {
    error_body("entity", "not found")
}

#[catch(422)]
fn handle_422(req: &Request) -> Value {
    tracing::debug!(uri = %req.uri(), "unprocessable request body");
    error_body("body", "request body could not be parsed")
}

#[catch(500)]
fn internal_error() -> Value {
    error_body("server", "internal server error")
}

#[catch(503)]
fn unavailable() -> Value {
    error_body("server", "service unavailable")
}

pub fn build(pool: Pool, settings: Settings) -> Rocket<Build> {
    rocket::build()
        .manage(pool)
        .manage(settings)
        .mount(
            "/api/users",
            routes![
                users::register,
                users::login,
                users::verify,
                users::resend_verification,
                users::request_password_reset,
                users::reset_password,
            ],
        )
        .mount("/api", routes![users::current, users::update])
        .mount(
            "/api",
            routes![
                profile::list,
                profile::profile,
                profile::follow,
                profile::unfollow,
                profile::list_followers,
                profile::list_following,
            ],
        )
        .mount("/api", routes![article::tags])
        .mount(
            "/api",
            routes![
                notify::list,
                notify::get,
                notify::read,
                notify::read_all,
                notify::delete,
                notify::subscribe,
                notify::unsubscribe,
            ],
        )
        .mount(
            "/api/articles",
            routes![
                article::list,
                article::feed,
                article::get,
                article::create,
                article::update,
                article::delete,
                article::favorite,
                article::unfavorite,
                comment::list,
                comment::add,
                comment::get,
                comment::edit,
                comment::delete,
                rating::rate,
                rating::summary,
                reaction::like,
                reaction::dislike,
            ],
        )
        .register(
            "/",
            catchers![
                bad_request,
                unauthorized,
                forbidden,
                not_found,
                handle_422,
                internal_error,
                unavailable,
            ],
        )
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,authors_haven=debug"));
    // Rocket may already own the global logger in tests.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[rocket::main]
async fn main() -> Result<(), rocket::Error> {
    dotenv::dotenv().ok();
    init_tracing();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };
    let pool = match db::init_pool(&settings) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "failed to create database pool");
            std::process::exit(1);
        }
    };

    tracing::info!(public_url = %settings.public_url, "starting authors haven");
    let _rocket = build(pool, settings).launch().await?;
    Ok(())
}
