use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::{delete as diesel_delete, insert_into, update as diesel_update};
use rocket::response::status::Created;
use rocket::serde::json::Json;
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::article::Article;
use crate::db::schema::{comments, users};
use crate::db::DbConnection;
use crate::notify::{self, Event, Kind};
use crate::profile::{followed_among, Profile};
use crate::types::{ApiError, ApiResult, ValidationError};
use crate::users::models::User;
use crate::utils::serialize_date;

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Associations, PartialEq)]
#[diesel(belongs_to(Article), table_name = comments)]
pub struct Comment {
    pub id: i32,
    pub article_id: i32,
    pub user_id: i32,
    pub parent_id: Option<i32>,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CommentView<'r> {
    id: i32,
    parent_id: Option<i32>,
    #[serde(serialize_with = "serialize_date")]
    created_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_date")]
    updated_at: DateTime<Utc>,
    body: String,
    author: Profile<'r>,
    #[serde(skip_serializing_if = "Option::is_none")]
    replies: Option<Vec<CommentView<'r>>>,
}

impl<'r> From<(Comment, Profile<'r>)> for CommentView<'r> {
    fn from(comment_and_profile: (Comment, Profile<'r>)) -> Self {
        let (comment, profile) = comment_and_profile;
        CommentView {
            id: comment.id,
            parent_id: comment.parent_id,
            author: profile,
            created_at: comment.created_at,
            updated_at: comment.updated_at,
            body: comment.body,
            replies: None,
        }
    }
}

/// Nests replies under their parents. Input order is kept at both levels;
/// replies whose parent is missing are dropped.
pub fn thread(views: Vec<CommentView>) -> Vec<CommentView> {
    let (mut roots, replies): (Vec<_>, Vec<_>) =
        views.into_iter().partition(|c| c.parent_id.is_none());
    let index = roots
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id, i))
        .collect::<HashMap<_, _>>();
    for root in roots.iter_mut() {
        root.replies = Some(Vec::new());
    }
    for reply in replies {
        let slot = reply.parent_id.and_then(|parent| index.get(&parent).copied());
        if let Some(i) = slot {
            roots[i].replies.get_or_insert_with(Vec::new).push(reply);
        }
    }
    roots
}

/// A reply must target a top-level comment on the same article.
pub fn check_reply_target(parent: &Comment, article_id: i32) -> Result<(), ValidationError> {
    if parent.article_id != article_id {
        return Err(ValidationError::from(
            "parentId",
            "parent comment belongs to another article",
        ));
    }
    if parent.parent_id.is_some() {
        return Err(ValidationError::from(
            "parentId",
            "replies cannot be nested more than one level",
        ));
    }
    Ok(())
}

fn check_body(body: &str) -> Result<String, ValidationError> {
    let body = body.trim();
    if body.is_empty() {
        Err(ValidationError::from("body", "comment body cannot be empty"))
    } else {
        Ok(body.to_owned())
    }
}

#[derive(Insertable)]
#[diesel(table_name = comments)]
pub struct NewComment {
    article_id: i32,
    user_id: i32,
    parent_id: Option<i32>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    body: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentBody {
    body: String,
    #[serde(default)]
    parent_id: Option<i32>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CommentContainer<T> {
    comment: T,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CommentsContainer<T> {
    comments: T,
}

fn load_for_article(
    conn: &mut PgConnection,
    article: &Article,
    comment_id: i32,
) -> Result<Comment, ApiError> {
    Comment::belonging_to(article)
        .filter(comments::id.eq(comment_id))
        .select(Comment::as_select())
        .first(conn)
        .map_err(|e| e.into())
}

fn views_with_authors(
    conn: &mut PgConnection,
    data: Vec<(Comment, User)>,
    viewer: Option<i32>,
) -> QueryResult<Vec<CommentView<'static>>> {
    let followed = match viewer {
        Some(viewer) => {
            let authors = data.iter().map(|(_, author)| author.id).collect::<Vec<_>>();
            followed_among(conn, viewer, &authors)?
        }
        None => Default::default(),
    };
    Ok(data
        .into_iter()
        .map(|(comment, author)| {
            let profile = author.profile(followed.contains(&author.id));
            CommentView::from((comment, profile))
        })
        .collect())
}

/// Adds a comment or a reply and notifies whoever it concerns.
pub fn add_comment(
    conn: &mut PgConnection,
    user: &User,
    slug: &str,
    details: CommentBody,
) -> Result<CommentView<'static>, ApiError> {
    let body = check_body(&details.body)?;
    let article = Article::load_by_slug(slug, conn)?;

    let parent = match details.parent_id {
        Some(parent_id) => {
            let parent = comments::table
                .find(parent_id)
                .select(Comment::as_select())
                .first::<Comment>(conn)
                .optional()?
                .ok_or_else(|| ValidationError::from("parentId", "parent comment does not exist"))?;
            check_reply_target(&parent, article.id)?;
            Some(parent)
        }
        None => None,
    };

    let now = Utc::now();
    let new_comment = NewComment {
        article_id: article.id,
        user_id: user.id,
        parent_id: parent.as_ref().map(|p| p.id),
        created_at: now,
        updated_at: now,
        body,
    };

    let comment = conn.transaction::<_, ApiError, _>(|conn| {
        let comment: Comment = insert_into(comments::table)
            .values(&new_comment)
            .returning(Comment::as_returning())
            .get_result(conn)?;

        if let Some(parent) = &parent {
            let reply = Event::new(user.id, Kind::Replied)
                .on_article(article.id)
                .on_comment(comment.id);
            notify::notify(conn, &[parent.user_id], &reply)?;
        }
        // A reply to the author's own comment already reached them.
        if parent.as_ref().map(|p| p.user_id) != Some(article.author_id) {
            let commented = Event::new(user.id, Kind::Commented)
                .on_article(article.id)
                .on_comment(comment.id);
            notify::notify(conn, &[article.author_id], &commented)?;
        }
        Ok(comment)
    })?;

    Ok((comment, user.profile(false)).into())
}

/// The article's comments, threaded, oldest first.
pub fn comments_for(
    conn: &mut PgConnection,
    slug: &str,
    viewer: Option<i32>,
) -> Result<Vec<CommentView<'static>>, ApiError> {
    let article = Article::load_by_slug(slug, conn)?;
    let data = Comment::belonging_to(&article)
        .inner_join(users::table)
        .order((comments::created_at.asc(), comments::id.asc()))
        .select((Comment::as_select(), User::as_select()))
        .load::<(Comment, User)>(conn)?;
    Ok(thread(views_with_authors(conn, data, viewer)?))
}

/// One comment; a top-level comment comes with its replies.
pub fn comment_by_id(
    conn: &mut PgConnection,
    slug: &str,
    id: i32,
    viewer: Option<i32>,
) -> Result<CommentView<'static>, ApiError> {
    let article = Article::load_by_slug(slug, conn)?;
    let data = Comment::belonging_to(&article)
        .inner_join(users::table)
        .filter(comments::id.eq(id).or(comments::parent_id.eq(id)))
        .order((comments::created_at.asc(), comments::id.asc()))
        .select((Comment::as_select(), User::as_select()))
        .load::<(Comment, User)>(conn)?;

    let mut views = views_with_authors(conn, data, viewer)?;
    let position = views.iter().position(|c| c.id == id).ok_or(ApiError::NotFound)?;
    if views[position].parent_id.is_some() {
        return Ok(views.swap_remove(position));
    }
    thread(views).into_iter().next().ok_or(ApiError::NotFound)
}

pub fn edit_comment(
    conn: &mut PgConnection,
    user: &User,
    slug: &str,
    id: i32,
    details: CommentBody,
) -> Result<CommentView<'static>, ApiError> {
    let body = check_body(&details.body)?;
    let article = Article::load_by_slug(slug, conn)?;
    let comment = load_for_article(conn, &article, id)?;
    if comment.user_id != user.id {
        return Err(ApiError::Forbidden);
    }

    let comment: Comment = diesel_update(&comment)
        .set((comments::body.eq(body), comments::updated_at.eq(Utc::now())))
        .returning(Comment::as_returning())
        .get_result(conn)?;
    Ok((comment, user.profile(false)).into())
}

/// Deletes a comment; its replies go with it.
pub fn delete_comment(conn: &mut PgConnection, user: &User, slug: &str, id: i32) -> Result<(), ApiError> {
    let article = Article::load_by_slug(slug, conn)?;
    let comment = load_for_article(conn, &article, id)?;
    if comment.user_id != user.id {
        return Err(ApiError::Forbidden);
    }
    diesel_delete(&comment).execute(conn)?;
    Ok(())
}

#[post("/<slug>/comments", data = "<details>", format = "json")]
pub async fn add(
    user: User,
    conn: DbConnection,
    slug: String,
    details: Json<CommentContainer<CommentBody>>,
) -> Result<Created<Json<CommentContainer<CommentView<'static>>>>, ApiError> {
    let details = details.into_inner().comment;
    let location_slug = slug.clone();
    let comment = conn
        .run(move |conn| add_comment(conn, &user, &slug, details))
        .await?;
    let location = format!("/api/articles/{}/comments/{}", location_slug, comment.id);
    Ok(Created::new(location).body(Json(CommentContainer { comment })))
}

#[get("/<slug>/comments")]
pub async fn list(
    current_user: Option<User>,
    conn: DbConnection,
    slug: String,
) -> ApiResult<CommentsContainer<Vec<CommentView<'static>>>> {
    let viewer = current_user.map(|u| u.id);
    let comments = conn.run(move |conn| comments_for(conn, &slug, viewer)).await?;
    Ok(Json(CommentsContainer { comments }))
}

#[get("/<slug>/comments/<id>")]
pub async fn get(
    current_user: Option<User>,
    conn: DbConnection,
    slug: String,
    id: i32,
) -> ApiResult<CommentContainer<CommentView<'static>>> {
    let viewer = current_user.map(|u| u.id);
    let comment = conn
        .run(move |conn| comment_by_id(conn, &slug, id, viewer))
        .await?;
    Ok(Json(CommentContainer { comment }))
}

#[put("/<slug>/comments/<id>", data = "<details>", format = "json")]
pub async fn edit(
    user: User,
    conn: DbConnection,
    slug: String,
    id: i32,
    details: Json<CommentContainer<CommentBody>>,
) -> ApiResult<CommentContainer<CommentView<'static>>> {
    let details = details.into_inner().comment;
    let comment = conn
        .run(move |conn| edit_comment(conn, &user, &slug, id, details))
        .await?;
    Ok(Json(CommentContainer { comment }))
}

#[delete("/<slug>/comments/<id>")]
pub async fn delete(user: User, conn: DbConnection, slug: String, id: i32) -> ApiResult<Value> {
    conn.run(move |conn| delete_comment(conn, &user, &slug, id)).await?;
    Ok(Json(json!({ "comment": { "id": id, "deleted": true } })))
}
