use diesel::dsl::exists;
use diesel::prelude::*;
use diesel::{delete, insert_into, select};
use rocket::serde::json::Json;
use std::borrow::Cow;
use std::collections::HashSet;

use crate::db::schema::{followers, users};
use crate::db::DbConnection;
use crate::notify::{self, Event, Kind};
use crate::types::*;
use crate::users::models::User;

#[derive(Debug, Serialize)]
pub struct ProfileResponse<'a> {
    profile: Profile<'a>,
}

#[derive(Debug, Serialize)]
pub struct ProfilesResponse<'a> {
    profiles: Vec<Profile<'a>>,
}

#[derive(Debug, Serialize)]
pub struct Profile<'a> {
    pub username: Cow<'a, str>,
    pub bio: Option<Cow<'a, str>>,
    pub image: Option<Cow<'a, str>>,
    pub following: bool,
}

/// Whether `follower_id` follows `user_id`.
pub fn is_following(
    connection: &mut PgConnection,
    follower_id: i32,
    user_id: i32,
) -> QueryResult<bool> {
    select(exists(
        followers::table
            .filter(followers::user_id.eq(user_id))
            .filter(followers::follower_id.eq(follower_id)),
    ))
    .get_result::<bool>(connection)
}

/// The subset of `user_ids` that `follower_id` follows.
pub fn followed_among(
    connection: &mut PgConnection,
    follower_id: i32,
    user_ids: &[i32],
) -> QueryResult<HashSet<i32>> {
    let followed = followers::table
        .filter(followers::follower_id.eq(follower_id))
        .filter(followers::user_id.eq_any(user_ids))
        .select(followers::user_id)
        .load::<i32>(connection)?;
    Ok(followed.into_iter().collect())
}

fn profiles_for(
    connection: &mut PgConnection,
    people: Vec<User>,
    viewer: Option<i32>,
) -> QueryResult<Vec<Profile<'static>>> {
    let followed = match viewer {
        Some(viewer) => {
            let ids = people.iter().map(|u| u.id).collect::<Vec<_>>();
            followed_among(connection, viewer, &ids)?
        }
        None => HashSet::new(),
    };
    Ok(people
        .iter()
        .map(|u| u.profile(followed.contains(&u.id)))
        .collect())
}

pub fn load_profile(
    connection: &mut PgConnection,
    name: &str,
    viewer: Option<i32>,
) -> Result<Profile<'static>, ApiError> {
    let user = User::load_by_name(name, connection)?;
    let following = match viewer {
        Some(viewer) => is_following(connection, viewer, user.id)?,
        None => false,
    };
    Ok(user.profile(following))
}

/// Every profile, ordered by username.
pub fn all_profiles(
    connection: &mut PgConnection,
    viewer: i32,
    page: Page,
) -> QueryResult<Vec<Profile<'static>>> {
    let people = users::table
        .order(users::username.asc())
        .limit(page.limit)
        .offset(page.offset)
        .select(User::as_select())
        .load::<User>(connection)?;
    profiles_for(connection, people, Some(viewer))
}

pub fn follow_user(
    connection: &mut PgConnection,
    current: &User,
    name: &str,
) -> Result<Profile<'static>, ApiError> {
    let follow = User::load_by_name(name, connection)?;
    if follow.id == current.id {
        return Err(ValidationError::from("username", "You cannot follow yourself").into());
    }

    let inserted = insert_into(followers::table)
        .values((
            followers::user_id.eq(follow.id),
            followers::follower_id.eq(current.id),
        ))
        .on_conflict((followers::user_id, followers::follower_id))
        .do_nothing()
        .execute(connection)?;
    if inserted > 0 {
        tracing::debug!(follower = current.id, followed = follow.id, "follow created");
        notify::notify(connection, &[follow.id], &Event::new(current.id, Kind::Followed))?;
    }
    Ok(follow.profile(true))
}

pub fn unfollow_user(
    connection: &mut PgConnection,
    current: &User,
    name: &str,
) -> Result<Profile<'static>, ApiError> {
    let follow = User::load_by_name(name, connection)?;
    delete(
        followers::table
            .filter(followers::user_id.eq(follow.id))
            .filter(followers::follower_id.eq(current.id)),
    )
    .execute(connection)?;
    Ok(follow.profile(false))
}

/// Who follows `name`.
pub fn followers_of(
    connection: &mut PgConnection,
    name: &str,
    viewer: Option<i32>,
) -> Result<Vec<Profile<'static>>, ApiError> {
    let user = User::load_by_name(name, connection)?;
    let people = followers::table
        .inner_join(users::table.on(users::id.eq(followers::follower_id)))
        .filter(followers::user_id.eq(user.id))
        .order(users::username.asc())
        .select(User::as_select())
        .load::<User>(connection)?;
    Ok(profiles_for(connection, people, viewer)?)
}

/// Whom `name` follows.
pub fn followed_by(
    connection: &mut PgConnection,
    name: &str,
    viewer: Option<i32>,
) -> Result<Vec<Profile<'static>>, ApiError> {
    let user = User::load_by_name(name, connection)?;
    let people = followers::table
        .inner_join(users::table.on(users::id.eq(followers::user_id)))
        .filter(followers::follower_id.eq(user.id))
        .order(users::username.asc())
        .select(User::as_select())
        .load::<User>(connection)?;
    Ok(profiles_for(connection, people, viewer)?)
}

#[get("/profiles?<limit>&<offset>")]
pub async fn list(
    user: User,
    connection: DbConnection,
    limit: Option<i64>,
    offset: Option<i64>,
) -> ApiResult<ProfilesResponse<'static>> {
    let page = Page::new(limit, offset);
    let profiles = connection
        .run(move |conn| Ok(all_profiles(conn, user.id, page)?))
        .await?;
    Ok(Json(ProfilesResponse { profiles }))
}

#[get("/profiles/<name>")]
pub async fn profile(
    current_user: Option<User>,
    connection: DbConnection,
    name: String,
) -> ApiResult<ProfileResponse<'static>> {
    let viewer = current_user.map(|u| u.id);
    let profile = connection
        .run(move |conn| load_profile(conn, &name, viewer))
        .await?;
    Ok(Json(ProfileResponse { profile }))
}

#[post("/profiles/<name>/follow")]
pub async fn follow(
    current: User,
    connection: DbConnection,
    name: String,
) -> ApiResult<ProfileResponse<'static>> {
    let profile = connection
        .run(move |conn| follow_user(conn, &current, &name))
        .await?;
    Ok(Json(ProfileResponse { profile }))
}

#[delete("/profiles/<name>/follow")]
pub async fn unfollow(
    current: User,
    connection: DbConnection,
    name: String,
) -> ApiResult<ProfileResponse<'static>> {
    let profile = connection
        .run(move |conn| unfollow_user(conn, &current, &name))
        .await?;
    Ok(Json(ProfileResponse { profile }))
}

#[get("/profiles/<name>/followers")]
pub async fn list_followers(
    current_user: Option<User>,
    connection: DbConnection,
    name: String,
) -> ApiResult<ProfilesResponse<'static>> {
    let viewer = current_user.map(|u| u.id);
    let profiles = connection
        .run(move |conn| followers_of(conn, &name, viewer))
        .await?;
    Ok(Json(ProfilesResponse { profiles }))
}

#[get("/profiles/<name>/following")]
pub async fn list_following(
    current_user: Option<User>,
    connection: DbConnection,
    name: String,
) -> ApiResult<ProfilesResponse<'static>> {
    let viewer = current_user.map(|u| u.id);
    let profiles = connection
        .run(move |conn| followed_by(conn, &name, viewer))
        .await?;
    Ok(Json(ProfilesResponse { profiles }))
}
