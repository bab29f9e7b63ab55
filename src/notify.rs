//! Notification feed: rows are written by the other modules when something
//! happens to a user's content or relationships, and read back here.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::{delete as diesel_delete, insert_into, update as diesel_update};
use rocket::serde::json::Json;
use serde_json::{json, Value};

use crate::db::schema::{articles, notifications, users};
use crate::db::DbConnection;
use crate::types::{ApiError, ApiResult, Page, ValidationError};
use crate::users::models::User;
use crate::utils::serialize_date;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Followed,
    ArticlePublished,
    Commented,
    Replied,
    Favorited,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Followed => "followed",
            Kind::ArticlePublished => "article_published",
            Kind::Commented => "commented",
            Kind::Replied => "replied",
            Kind::Favorited => "favorited",
        }
    }

    pub fn parse(kind: &str) -> Option<Kind> {
        match kind {
            "followed" => Some(Kind::Followed),
            "article_published" => Some(Kind::ArticlePublished),
            "commented" => Some(Kind::Commented),
            "replied" => Some(Kind::Replied),
            "favorited" => Some(Kind::Favorited),
            _ => None,
        }
    }

    pub fn message(self, actor: &str, article_title: Option<&str>) -> String {
        let title = article_title.unwrap_or("an article");
        match self {
            Kind::Followed => format!("{} started following you", actor),
            Kind::ArticlePublished => format!("{} published \"{}\"", actor, title),
            Kind::Commented => format!("{} commented on \"{}\"", actor, title),
            Kind::Replied => format!("{} replied to your comment on \"{}\"", actor, title),
            Kind::Favorited => format!("{} favorited \"{}\"", actor, title),
        }
    }
}

/// Something a user did that others should hear about.
#[derive(Debug, Clone)]
pub struct Event {
    pub actor_id: i32,
    pub kind: Kind,
    pub article_id: Option<i32>,
    pub comment_id: Option<i32>,
}

impl Event {
    pub fn new(actor_id: i32, kind: Kind) -> Event {
        Event {
            actor_id,
            kind,
            article_id: None,
            comment_id: None,
        }
    }

    pub fn on_article(mut self, article_id: i32) -> Event {
        self.article_id = Some(article_id);
        self
    }

    pub fn on_comment(mut self, comment_id: i32) -> Event {
        self.comment_id = Some(comment_id);
        self
    }
}

#[derive(Debug, Insertable, PartialEq)]
#[diesel(table_name = notifications)]
pub struct NewNotification {
    pub recipient_id: i32,
    pub actor_id: i32,
    pub kind: &'static str,
    pub article_id: Option<i32>,
    pub comment_id: Option<i32>,
}

/// One row per distinct recipient; the actor never notifies themself.
pub fn rows_for(recipients: &[i32], event: &Event) -> Vec<NewNotification> {
    let mut rows: Vec<NewNotification> = Vec::with_capacity(recipients.len());
    for &recipient_id in recipients {
        if recipient_id == event.actor_id || rows.iter().any(|r| r.recipient_id == recipient_id) {
            continue;
        }
        rows.push(NewNotification {
            recipient_id,
            actor_id: event.actor_id,
            kind: event.kind.as_str(),
            article_id: event.article_id,
            comment_id: event.comment_id,
        });
    }
    rows
}

/// Writes `event` for every recipient who still wants notifications.
pub fn notify(connection: &mut PgConnection, recipients: &[i32], event: &Event) -> QueryResult<usize> {
    if recipients.is_empty() {
        return Ok(0);
    }
    let subscribed = users::table
        .filter(users::id.eq_any(recipients))
        .filter(users::notifications_enabled.eq(true))
        .select(users::id)
        .load::<i32>(connection)?;
    let rows = rows_for(&subscribed, event);
    if rows.is_empty() {
        return Ok(0);
    }
    let written = insert_into(notifications::table)
        .values(&rows)
        .execute(connection)?;
    tracing::debug!(kind = event.kind.as_str(), actor = event.actor_id, written, "notifications written");
    Ok(written)
}

#[derive(Debug, Queryable)]
struct NotificationRow {
    id: i32,
    kind: String,
    is_read: bool,
    created_at: DateTime<Utc>,
    actor: String,
    article_slug: Option<String>,
    article_title: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationView {
    pub id: i32,
    pub kind: String,
    pub message: String,
    pub actor: String,
    pub article: Option<String>,
    pub read: bool,
    #[serde(serialize_with = "serialize_date")]
    pub created_at: DateTime<Utc>,
}

impl From<NotificationRow> for NotificationView {
    fn from(row: NotificationRow) -> Self {
        let message = match Kind::parse(&row.kind) {
            Some(kind) => kind.message(&row.actor, row.article_title.as_deref()),
            None => format!("{} did something", row.actor),
        };
        NotificationView {
            id: row.id,
            kind: row.kind,
            message,
            actor: row.actor,
            article: row.article_slug,
            read: row.is_read,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationList {
    pub notifications: Vec<NotificationView>,
    pub unread_count: i64,
}

#[derive(Debug, Serialize)]
pub struct NotificationResponse {
    notification: NotificationView,
}

// Rows addressed to `recipient_id`, with actor name and article attached.
macro_rules! inbox {
    ($recipient_id:expr) => {
        notifications::table
            .inner_join(users::table.on(users::id.eq(notifications::actor_id)))
            .left_join(articles::table.on(notifications::article_id.eq(articles::id.nullable())))
            .filter(notifications::recipient_id.eq($recipient_id))
            .select((
                notifications::id,
                notifications::kind,
                notifications::is_read,
                notifications::created_at,
                users::username,
                articles::slug.nullable(),
                articles::title.nullable(),
            ))
    };
}

pub fn list_notifications(
    connection: &mut PgConnection,
    recipient_id: i32,
    unread_only: bool,
    page: Page,
) -> QueryResult<NotificationList> {
    let mut query = inbox!(recipient_id).into_boxed();
    if unread_only {
        query = query.filter(notifications::is_read.eq(false));
    }
    let rows = query
        .order((notifications::created_at.desc(), notifications::id.desc()))
        .limit(page.limit)
        .offset(page.offset)
        .load::<NotificationRow>(connection)?;

    let unread_count = notifications::table
        .filter(notifications::recipient_id.eq(recipient_id))
        .filter(notifications::is_read.eq(false))
        .count()
        .get_result::<i64>(connection)?;

    Ok(NotificationList {
        notifications: rows.into_iter().map(NotificationView::from).collect(),
        unread_count,
    })
}

/// Loads one notification and marks it read.
pub fn open_notification(
    connection: &mut PgConnection,
    recipient_id: i32,
    id: i32,
) -> Result<NotificationView, ApiError> {
    let row = inbox!(recipient_id)
        .filter(notifications::id.eq(id))
        .first::<NotificationRow>(connection)
        .optional()?
        .ok_or(ApiError::NotFound)?;
    if !row.is_read {
        mark_read(connection, recipient_id, id)?;
    }
    let mut view = NotificationView::from(row);
    view.read = true;
    Ok(view)
}

pub fn mark_read(connection: &mut PgConnection, recipient_id: i32, id: i32) -> Result<(), ApiError> {
    let updated = diesel_update(
        notifications::table
            .filter(notifications::id.eq(id))
            .filter(notifications::recipient_id.eq(recipient_id)),
    )
    .set(notifications::is_read.eq(true))
    .execute(connection)?;
    if updated == 0 {
        return Err(ApiError::NotFound);
    }
    Ok(())
}

pub fn mark_all_read(connection: &mut PgConnection, recipient_id: i32) -> QueryResult<usize> {
    diesel_update(
        notifications::table
            .filter(notifications::recipient_id.eq(recipient_id))
            .filter(notifications::is_read.eq(false)),
    )
    .set(notifications::is_read.eq(true))
    .execute(connection)
}

pub fn delete_notification(connection: &mut PgConnection, recipient_id: i32, id: i32) -> Result<(), ApiError> {
    let deleted = diesel_delete(
        notifications::table
            .filter(notifications::id.eq(id))
            .filter(notifications::recipient_id.eq(recipient_id)),
    )
    .execute(connection)?;
    if deleted == 0 {
        return Err(ApiError::NotFound);
    }
    Ok(())
}

/// Turns notifications on or off for `user_id`. Asking for the state the
/// user is already in is an error.
pub fn set_subscription(connection: &mut PgConnection, user_id: i32, enabled: bool) -> Result<(), ApiError> {
    let changed = diesel_update(
        users::table
            .filter(users::id.eq(user_id))
            .filter(users::notifications_enabled.eq(!enabled)),
    )
    .set(users::notifications_enabled.eq(enabled))
    .execute(connection)?;
    if changed == 0 {
        let message = if enabled {
            "You are already subscribed"
        } else {
            "You are not subscribed"
        };
        return Err(ValidationError::from("notifications", message).into());
    }
    tracing::debug!(user_id, enabled, "notification subscription changed");
    Ok(())
}

#[get("/notifications?<unread>&<limit>&<offset>")]
pub async fn list(
    user: User,
    connection: DbConnection,
    unread: Option<bool>,
    limit: Option<i64>,
    offset: Option<i64>,
) -> ApiResult<NotificationList> {
    let page = Page::new(limit, offset);
    let unread_only = unread.unwrap_or(false);
    connection
        .run(move |conn| Ok(list_notifications(conn, user.id, unread_only, page)?))
        .await
        .map(Json)
}

#[get("/notifications/<id>")]
pub async fn get(user: User, connection: DbConnection, id: i32) -> ApiResult<NotificationResponse> {
    let notification = connection
        .run(move |conn| open_notification(conn, user.id, id))
        .await?;
    Ok(Json(NotificationResponse { notification }))
}

#[put("/notifications/<id>/read")]
pub async fn read(user: User, connection: DbConnection, id: i32) -> ApiResult<Value> {
    connection.run(move |conn| mark_read(conn, user.id, id)).await?;
    Ok(Json(json!({ "notification": { "id": id, "read": true } })))
}

#[put("/notifications/read")]
pub async fn read_all(user: User, connection: DbConnection) -> ApiResult<Value> {
    let updated = connection
        .run(move |conn| Ok(mark_all_read(conn, user.id)?))
        .await?;
    Ok(Json(json!({ "marked": updated })))
}

#[delete("/notifications/<id>")]
pub async fn delete(user: User, connection: DbConnection, id: i32) -> ApiResult<Value> {
    connection
        .run(move |conn| delete_notification(conn, user.id, id))
        .await?;
    Ok(Json(json!({ "notification": { "id": id, "deleted": true } })))
}

#[put("/notifications/subscribe")]
pub async fn subscribe(user: User, connection: DbConnection) -> ApiResult<Value> {
    connection
        .run(move |conn| set_subscription(conn, user.id, true))
        .await?;
    Ok(Json(json!({ "message": "You have successfully subscribed" })))
}

#[put("/notifications/unsubscribe")]
pub async fn unsubscribe(user: User, connection: DbConnection) -> ApiResult<Value> {
    connection
        .run(move |conn| set_subscription(conn, user.id, false))
        .await?;
    Ok(Json(json!({ "message": "You have successfully unsubscribed" })))
}
