use diesel::pg::PgConnection;
use diesel::r2d2::ConnectionManager;
use rocket::http::Status;
use rocket::outcome::Outcome;
use rocket::request::{self, FromRequest};
use rocket::{Request, State};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use crate::config::Settings;
use crate::types::ApiError;

pub mod schema;

// An alias to the type for a pool of Diesel Postgres connections.
pub type Pool = r2d2::Pool<ConnectionManager<PgConnection>>;

pub struct DbConnection(pub r2d2::PooledConnection<ConnectionManager<PgConnection>>);

error_chain! {
    foreign_links {
        R2D2(r2d2::Error);
    }
}

/// Attempts to retrieve a single connection from the managed database pool. If
/// no pool is currently managed, fails with an `InternalServerError` status. If
/// no connections are available, fails with a `ServiceUnavailable` status.
#[rocket::async_trait]
impl<'r> FromRequest<'r> for DbConnection {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> request::Outcome<DbConnection, ()> {
        let pool = match request.guard::<&State<Pool>>().await {
            Outcome::Success(pool) => pool.inner().clone(),
            _ => return Outcome::Error((Status::InternalServerError, ())),
        };
        // r2d2 blocks while waiting for a free connection.
        match rocket::tokio::task::spawn_blocking(move || pool.get()).await {
            Ok(Ok(conn)) => Outcome::Success(DbConnection(conn)),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "database pool exhausted");
                Outcome::Error((Status::ServiceUnavailable, ()))
            }
            Err(_) => Outcome::Error((Status::InternalServerError, ())),
        }
    }
}

impl DbConnection {
    /// Runs `work` with this connection on the blocking thread pool, so Diesel
    /// calls and password hashing never stall the async workers.
    pub async fn run<F, T>(self, work: F) -> std::result::Result<T, ApiError>
    where
        F: FnOnce(&mut PgConnection) -> std::result::Result<T, ApiError> + Send + 'static,
        T: Send + 'static,
    {
        let mut connection = self;
        rocket::tokio::task::spawn_blocking(move || work(&mut *connection))
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "blocking database task failed");
                ApiError::Internal
            })?
    }
}

// For the convenience of using an &mut DbConnection as an &mut PgConnection.
impl Deref for DbConnection {
    type Target = PgConnection;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for DbConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

pub fn init_pool(settings: &Settings) -> Result<Pool> {
    let manager = ConnectionManager::<PgConnection>::new(settings.database_url.as_str());
    let pool = Pool::builder()
        .max_size(settings.pool_size)
        .connection_timeout(Duration::from_secs(settings.pool_timeout_secs))
        .build(manager)?;
    Ok(pool)
}

/// Builds a pool without opening any connection up front.
pub fn lazy_pool(settings: &Settings) -> Pool {
    let manager = ConnectionManager::<PgConnection>::new(settings.database_url.as_str());
    Pool::builder()
        .max_size(settings.pool_size)
        .connection_timeout(Duration::from_secs(settings.pool_timeout_secs))
        .build_unchecked(manager)
}

/// Fixtures for tests that talk to a real Postgres.
///
/// Set `TEST_DATABASE_URL` to run them; without it they return early. Each
/// connection lives inside a transaction that is never committed and gets
/// the migrations applied to a private schema, so the target database is
/// left untouched.
#[cfg(test)]
pub mod testing {
    use chrono::Utc;
    use diesel::connection::SimpleConnection;
    use diesel::prelude::*;
    use diesel::{insert_into, update};

    use super::schema::{articles, followers, users};
    use crate::article::Article;
    use crate::users::models::User;

    const MIGRATIONS: [&str; 4] = [
        include_str!("../../migrations/2024-03-01-000000_create_users/up.sql"),
        include_str!("../../migrations/2024-03-02-000000_create_articles/up.sql"),
        include_str!("../../migrations/2024-03-03-000000_create_notifications/up.sql"),
        include_str!("../../migrations/2024-03-04-000000_add_notification_preferences/up.sql"),
    ];

    lazy_static! {
        static ref PASSWORD_HASH: String =
            User::make_password("correct horse 1").expect("hashing works");
    }

    pub fn connection() -> Option<PgConnection> {
        let url = match std::env::var("TEST_DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                eprintln!("TEST_DATABASE_URL is not set, skipping database test");
                return None;
            }
        };
        let mut conn = PgConnection::establish(&url).expect("TEST_DATABASE_URL is reachable");
        conn.begin_test_transaction().expect("test transaction starts");
        conn.batch_execute(
            "create schema authors_haven_test;
             set local search_path to authors_haven_test;",
        )
        .expect("test schema is created");
        for migration in MIGRATIONS.iter() {
            conn.batch_execute(migration).expect("migration applies");
        }
        Some(conn)
    }

    /// A verified user whose password is `correct horse 1`.
    pub fn user(conn: &mut PgConnection, username: &str) -> User {
        insert_into(users::table)
            .values((
                users::username.eq(username),
                users::email.eq(format!("{}@example.com", username)),
                users::password_hash.eq(PASSWORD_HASH.as_str()),
                users::is_verified.eq(true),
            ))
            .returning(User::as_returning())
            .get_result(conn)
            .expect("user is inserted")
    }

    pub fn unverified(conn: &mut PgConnection, user: &User) -> User {
        update(user)
            .set(users::is_verified.eq(false))
            .returning(User::as_returning())
            .get_result(conn)
            .expect("user is updated")
    }

    pub fn article(conn: &mut PgConnection, author: &User, slug: &str, tags: &[&str]) -> Article {
        let now = Utc::now();
        insert_into(articles::table)
            .values((
                articles::author_id.eq(author.id),
                articles::slug.eq(slug),
                articles::title.eq(slug),
                articles::description.eq("description"),
                articles::body.eq("body"),
                articles::tag_list.eq(tags.iter().map(|t| t.to_string()).collect::<Vec<_>>()),
                articles::created_at.eq(now),
                articles::updated_at.eq(now),
            ))
            .returning(Article::as_returning())
            .get_result(conn)
            .expect("article is inserted")
    }

    pub fn follow(conn: &mut PgConnection, follower: &User, followed: &User) {
        insert_into(followers::table)
            .values((
                followers::user_id.eq(followed.id),
                followers::follower_id.eq(follower.id),
            ))
            .execute(conn)
            .expect("follow is inserted");
    }
}
