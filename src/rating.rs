use chrono::Utc;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Double, Integer, Nullable};
use diesel::{insert_into, sql_query};
use rocket::serde::json::Json;

use crate::article::{reach_response, Article, ReachArticleResponse};
use crate::db::schema::ratings;
use crate::db::DbConnection;
use crate::types::{ApiError, ApiResult, ValidationError};
use crate::users::models::User;

pub const MIN_SCORE: i32 = 1;
pub const MAX_SCORE: i32 = 5;

static SELECT_RATING_SUMMARY: &str = "select round(avg(score)::numeric, 2)::float8 as average,
       count(*) as count,
       max(score) filter (where user_id = $2::integer) as score
  from ratings
 where article_id = $1";

pub fn check_score(score: i32) -> Result<(), ValidationError> {
    if (MIN_SCORE..=MAX_SCORE).contains(&score) {
        Ok(())
    } else {
        Err(ValidationError::from(
            "score",
            format!("score must be between {} and {}", MIN_SCORE, MAX_SCORE),
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct RatingDetails {
    score: i32,
}

#[derive(Debug, Deserialize)]
pub struct RateArticle {
    rating: RatingDetails,
}

#[derive(Debug, Serialize, QueryableByName, PartialEq)]
pub struct RatingSummary {
    #[diesel(sql_type = Nullable<Double>)]
    average: Option<f64>,
    #[diesel(sql_type = BigInt)]
    count: i64,
    /// The viewer's own score.
    #[diesel(sql_type = Nullable<Integer>)]
    score: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct RatingResponse {
    rating: RatingSummary,
}

/// Stores the user's score; rating again replaces the earlier one.
pub fn rate_article(
    conn: &mut PgConnection,
    user: &User,
    slug: &str,
    score: i32,
) -> Result<ReachArticleResponse, ApiError> {
    check_score(score)?;
    let article = Article::load_by_slug(slug, conn)?;
    if article.author_id == user.id {
        return Err(ApiError::Forbidden);
    }

    let now = Utc::now();
    insert_into(ratings::table)
        .values((
            ratings::article_id.eq(article.id),
            ratings::user_id.eq(user.id),
            ratings::score.eq(score),
            ratings::created_at.eq(now),
            ratings::updated_at.eq(now),
        ))
        .on_conflict((ratings::article_id, ratings::user_id))
        .do_update()
        .set((ratings::score.eq(score), ratings::updated_at.eq(now)))
        .execute(conn)?;
    tracing::debug!(article_id = article.id, user_id = user.id, score, "article rated");

    reach_response(conn, &article.slug, Some(user.id))
}

pub fn rating_summary(
    conn: &mut PgConnection,
    slug: &str,
    viewer: Option<i32>,
) -> Result<RatingSummary, ApiError> {
    let article = Article::load_by_slug(slug, conn)?;
    sql_query(SELECT_RATING_SUMMARY)
        .bind::<Integer, _>(article.id)
        .bind::<Nullable<Integer>, _>(viewer)
        .get_result::<RatingSummary>(conn)
        .map_err(|e| e.into())
}

#[post("/<slug>/rating", format = "json", data = "<rate>")]
pub async fn rate(
    user: User,
    connection: DbConnection,
    slug: String,
    rate: Json<RateArticle>,
) -> ApiResult<ReachArticleResponse> {
    let score = rate.rating.score;
    connection
        .run(move |conn| rate_article(conn, &user, &slug, score))
        .await
        .map(Json)
}

#[get("/<slug>/rating")]
pub async fn summary(
    current_user: Option<User>,
    connection: DbConnection,
    slug: String,
) -> ApiResult<RatingResponse> {
    let viewer = current_user.map(|u| u.id);
    let rating = connection
        .run(move |conn| rating_summary(conn, &slug, viewer))
        .await?;
    Ok(Json(RatingResponse { rating }))
}
