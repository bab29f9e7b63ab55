use chrono::{DateTime, Utc};
use diesel::dsl::exists;
use diesel::prelude::*;
use diesel::sql_types::{Array, BigInt, Bool, Double, Integer, Nullable, Text, Timestamptz};
use diesel::{delete as diesel_delete, insert_into, select, sql_query, update as diesel_update};
use rocket::response::status::Created;
use rocket::serde::json::Json;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde_json::{json, Value};
use slug::slugify;
use std::borrow::Cow;

use crate::db::schema::{articles, favorites, followers};
use crate::db::DbConnection;
use crate::notify::{self, Event, Kind};
use crate::profile::Profile;
use crate::types::*;
use crate::users::models::User;
use crate::utils::{normalize_tags, serialize_date};

// Filters shared by the page query and its count. Every filter is a nullable
// bind that disables itself when null.
macro_rules! reach_filters {
    () => {
        " from articles
       inner join users on users.id = articles.author_id
 where ($2::text is null or articles.slug = $2::text)
   and ($3::text is null or users.username = $3::text)
   and ($4::text is null or $4::text = any(articles.tag_list))
   and ($5::text is null or exists(
         select 1 from favorites fa inner join users fu on fu.id = fa.user_id
          where fa.article_id = articles.id and fu.username = $5::text))
   and (not $6::boolean or exists(
         select 1 from followers f
          where f.user_id = articles.author_id and f.follower_id = $1::integer))"
    };
}

// One query serves single reads, filtered lists and the feed.
static SELECT_REACH_ARTICLES: &str = concat!(
    "select articles.id as id,
       articles.slug as slug,
       articles.title as title,
       articles.description as description,
       articles.body as body,
       articles.tag_list as tag_list,
       articles.created_at as created_at,
       articles.updated_at as updated_at,
       users.username as author_name,
       users.bio as author_bio,
       users.image as author_image,
       exists(select 1 from followers f
               where f.user_id = articles.author_id and f.follower_id = $1::integer) as followed,
       (select count(*) from favorites fa where fa.article_id = articles.id) as favorites_count,
       exists(select 1 from favorites fa
               where fa.article_id = articles.id and fa.user_id = $1::integer) as favorited,
       (select count(*) from reactions r
         where r.article_id = articles.id and r.is_like) as likes_count,
       (select count(*) from reactions r
         where r.article_id = articles.id and not r.is_like) as dislikes_count,
       (select r.is_like from reactions r
         where r.article_id = articles.id and r.user_id = $1::integer) as reaction,
       (select round(avg(ra.score)::numeric, 2)::float8 from ratings ra
         where ra.article_id = articles.id) as average_rating,
       (select count(*) from ratings ra where ra.article_id = articles.id) as ratings_count",
    reach_filters!(),
    "
 order by articles.created_at desc, articles.id desc
 limit $7 offset $8"
);

// Counted separately so a page past the end still reports the total.
static COUNT_REACH_ARTICLES: &str = concat!("select count(*) as total", reach_filters!());

#[derive(Debug, Clone, Identifiable, Queryable, Selectable, PartialEq)]
#[diesel(table_name = articles)]
pub struct Article {
    pub id: i32,
    pub author_id: i32,
    pub slug: String,
    pub title: String,
    pub description: String,
    pub body: String,
    pub tag_list: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Article {
    pub fn load_by_slug(slug: &str, connection: &mut PgConnection) -> Result<Article, ApiError> {
        articles::table
            .filter(articles::slug.eq(slug))
            .select(Article::as_select())
            .get_result(connection)
            .map_err(|e| e.into())
    }
}

#[derive(Debug, Serialize)]
pub struct ReachArticleResponse {
    article: ReachArticle,
}

impl From<ReachArticle> for ReachArticleResponse {
    fn from(article: ReachArticle) -> Self {
        ReachArticleResponse { article }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReachArticlesResponse {
    articles: Vec<ReachArticle>,
    articles_count: i64,
}

#[derive(Debug, QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    total: i64,
}

/// An article joined with its author and the per-viewer counters.
#[derive(Debug, QueryableByName)]
pub struct ReachArticle {
    #[diesel(sql_type = Integer)]
    id: i32,
    #[diesel(sql_type = Text)]
    slug: String,
    #[diesel(sql_type = Text)]
    title: String,
    #[diesel(sql_type = Text)]
    description: String,
    #[diesel(sql_type = Text)]
    body: String,
    #[diesel(sql_type = Array<Text>)]
    tag_list: Vec<String>,
    #[diesel(sql_type = Timestamptz)]
    created_at: DateTime<Utc>,
    #[diesel(sql_type = Timestamptz)]
    updated_at: DateTime<Utc>,
    #[diesel(sql_type = Text)]
    author_name: String,
    #[diesel(sql_type = Nullable<Text>)]
    author_bio: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    author_image: Option<String>,
    #[diesel(sql_type = Bool)]
    followed: bool,
    #[diesel(sql_type = BigInt)]
    favorites_count: i64,
    #[diesel(sql_type = Bool)]
    favorited: bool,
    #[diesel(sql_type = BigInt)]
    likes_count: i64,
    #[diesel(sql_type = BigInt)]
    dislikes_count: i64,
    #[diesel(sql_type = Nullable<Bool>)]
    reaction: Option<bool>,
    #[diesel(sql_type = Nullable<Double>)]
    average_rating: Option<f64>,
    #[diesel(sql_type = BigInt)]
    ratings_count: i64,
}

struct Date<'a>(&'a DateTime<Utc>);

impl<'a> Serialize for Date<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serialize_date(self.0, serializer)
    }
}

impl Serialize for ReachArticle {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let profile = Profile {
            username: Cow::Borrowed(&self.author_name),
            bio: self.author_bio.as_deref().map(Cow::Borrowed),
            following: self.followed,
            image: self.author_image.as_deref().map(Cow::Borrowed),
        };
        let reaction = self.reaction.map(|like| if like { "like" } else { "dislike" });

        let mut s = serializer.serialize_struct("ReachArticle", 15)?;
        s.serialize_field("slug", &self.slug)?;
        s.serialize_field("title", &self.title)?;
        s.serialize_field("description", &self.description)?;
        s.serialize_field("body", &self.body)?;
        s.serialize_field("tagList", &self.tag_list)?;
        s.serialize_field("createdAt", &Date(&self.created_at))?;
        s.serialize_field("updatedAt", &Date(&self.updated_at))?;
        s.serialize_field("favorited", &self.favorited)?;
        s.serialize_field("favoritesCount", &self.favorites_count)?;
        s.serialize_field("likesCount", &self.likes_count)?;
        s.serialize_field("dislikesCount", &self.dislikes_count)?;
        s.serialize_field("reaction", &reaction)?;
        s.serialize_field("averageRating", &self.average_rating)?;
        s.serialize_field("ratingsCount", &self.ratings_count)?;
        s.serialize_field("author", &profile)?;
        s.end()
    }
}


/// Filters for [`SELECT_REACH_ARTICLES`].
#[derive(Debug, Clone)]
pub struct ArticleQuery {
    pub viewer: Option<i32>,
    pub slug: Option<String>,
    pub author: Option<String>,
    pub tag: Option<String>,
    pub favorited: Option<String>,
    pub feed: bool,
    pub page: Page,
}

impl ArticleQuery {
    pub fn new(viewer: Option<i32>, page: Page) -> Self {
        ArticleQuery {
            viewer,
            slug: None,
            author: None,
            tag: None,
            favorited: None,
            feed: false,
            page,
        }
    }

    pub fn load(&self, connection: &mut PgConnection) -> QueryResult<Vec<ReachArticle>> {
        sql_query(SELECT_REACH_ARTICLES)
            .bind::<Nullable<Integer>, _>(self.viewer)
            .bind::<Nullable<Text>, _>(self.slug.as_deref())
            .bind::<Nullable<Text>, _>(self.author.as_deref())
            .bind::<Nullable<Text>, _>(self.tag.as_deref())
            .bind::<Nullable<Text>, _>(self.favorited.as_deref())
            .bind::<Bool, _>(self.feed)
            .bind::<BigInt, _>(self.page.limit)
            .bind::<BigInt, _>(self.page.offset)
            .load::<ReachArticle>(connection)
    }

    /// Number of matches ignoring the page window.
    pub fn count(&self, connection: &mut PgConnection) -> QueryResult<i64> {
        sql_query(COUNT_REACH_ARTICLES)
            .bind::<Nullable<Integer>, _>(self.viewer)
            .bind::<Nullable<Text>, _>(self.slug.as_deref())
            .bind::<Nullable<Text>, _>(self.author.as_deref())
            .bind::<Nullable<Text>, _>(self.tag.as_deref())
            .bind::<Nullable<Text>, _>(self.favorited.as_deref())
            .bind::<Bool, _>(self.feed)
            .get_result::<CountRow>(connection)
            .map(|row| row.total)
    }
}

pub fn list_articles(
    connection: &mut PgConnection,
    query: &ArticleQuery,
) -> QueryResult<ReachArticlesResponse> {
    let articles = query.load(connection)?;
    let articles_count = query.count(connection)?;
    Ok(ReachArticlesResponse {
        articles,
        articles_count,
    })
}

/// Loads one article as seen by `viewer`.
pub fn load_reach(
    connection: &mut PgConnection,
    slug: &str,
    viewer: Option<i32>,
) -> Result<ReachArticle, ApiError> {
    let mut query = ArticleQuery::new(viewer, Page::new(Some(1), None));
    query.slug = Some(slug.to_owned());
    query
        .load(connection)?
        .into_iter()
        .next()
        .ok_or(ApiError::NotFound)
}

pub fn reach_response(
    connection: &mut PgConnection,
    slug: &str,
    viewer: Option<i32>,
) -> Result<ReachArticleResponse, ApiError> {
    load_reach(connection, slug, viewer).map(ReachArticleResponse::from)
}

/// Slugifies `title` and checks `taken` with `-1`, `-2`, ... suffixes until a
/// free slug is found.
pub fn unique_slug<F>(title: &str, mut taken: F) -> QueryResult<String>
where
    F: FnMut(&str) -> QueryResult<bool>,
{
    let mut base = slugify(title);
    if base.is_empty() {
        base = "article".to_owned();
    }
    let mut candidate = base.clone();
    let mut suffix = 0u32;
    while taken(&candidate)? {
        suffix += 1;
        candidate = format!("{}-{}", base, suffix);
    }
    Ok(candidate)
}

fn slug_taken(connection: &mut PgConnection, candidate: &str, except: Option<i32>) -> QueryResult<bool> {
    let same_slug = articles::table
        .filter(articles::slug.eq(candidate))
        .filter(articles::id.ne(except.unwrap_or(0)));
    select(exists(same_slug)).get_result::<bool>(connection)
}

fn check_author(article: &Article, user: &User) -> Result<(), ApiError> {
    if article.author_id == user.id {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

#[derive(Insertable)]
#[diesel(table_name = articles)]
pub struct NewArticle {
    author_id: i32,
    slug: String,
    title: String,
    description: String,
    body: String,
    tag_list: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleDetails {
    title: String,
    description: String,
    body: String,
    #[serde(default)]
    tag_list: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateArticle {
    article: ArticleDetails,
}

fn require_text(error: &mut ValidationError, field: &str, value: &str) {
    if value.trim().is_empty() {
        error.add_error(field, format!("{} cannot be empty", field));
    }
}

impl Validate for CreateArticle {
    type Error = ValidationError;
    fn validate(self, _connection: &mut PgConnection) -> Result<Self, ValidationError> {
        let mut error = ValidationError::default();
        require_text(&mut error, "title", &self.article.title);
        require_text(&mut error, "description", &self.article.description);
        require_text(&mut error, "body", &self.article.body);
        error.into_result()?;
        Ok(self)
    }
}

/// Publishes an article and tells the author's followers about it.
pub fn create_article(
    connection: &mut PgConnection,
    author: &User,
    create: CreateArticle,
) -> Result<Article, ApiError> {
    let create = create.validate(connection)?.article;
    let now = Utc::now();

    let article = connection.transaction::<_, ApiError, _>(|conn| {
        let slug = unique_slug(&create.title, |candidate| slug_taken(conn, candidate, None))?;
        let new_article = NewArticle {
            author_id: author.id,
            slug,
            title: create.title.trim().to_owned(),
            description: create.description.trim().to_owned(),
            body: create.body,
            tag_list: normalize_tags(create.tag_list),
            created_at: now,
            updated_at: now,
        };
        let article: Article = insert_into(articles::table)
            .values(&new_article)
            .returning(Article::as_returning())
            .get_result(conn)?;

        let audience = followers::table
            .filter(followers::user_id.eq(author.id))
            .select(followers::follower_id)
            .load::<i32>(conn)?;
        let event = Event::new(author.id, Kind::ArticlePublished).on_article(article.id);
        notify::notify(conn, &audience, &event)?;
        Ok(article)
    })?;

    tracing::info!(article_id = article.id, slug = %article.slug, author = author.id, "article published");
    Ok(article)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDetails {
    title: Option<String>,
    description: Option<String>,
    body: Option<String>,
    tag_list: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateArticle {
    article: UpdateDetails,
}

#[derive(Debug, AsChangeset)]
#[diesel(table_name = articles)]
struct ArticleChanges {
    slug: Option<String>,
    title: Option<String>,
    description: Option<String>,
    body: Option<String>,
    tag_list: Option<Vec<String>>,
    updated_at: DateTime<Utc>,
}

/// Applies a partial edit; a new title moves the article to a new slug.
pub fn update_article(
    connection: &mut PgConnection,
    user: &User,
    slug: &str,
    update: UpdateDetails,
) -> Result<Article, ApiError> {
    let article = Article::load_by_slug(slug, connection)?;
    check_author(&article, user)?;

    let mut error = ValidationError::default();
    for (field, value) in [
        ("title", &update.title),
        ("description", &update.description),
        ("body", &update.body),
    ] {
        if let Some(value) = value {
            require_text(&mut error, field, value);
        }
    }
    error.into_result()?;

    let title = update.title.map(|t| t.trim().to_owned());
    let new_slug = match &title {
        Some(title) if *title != article.title => Some(unique_slug(title, |candidate| {
            slug_taken(connection, candidate, Some(article.id))
        })?),
        _ => None,
    };
    let changes = ArticleChanges {
        slug: new_slug.filter(|s| *s != article.slug),
        title,
        description: update.description.map(|d| d.trim().to_owned()),
        body: update.body,
        tag_list: update.tag_list.map(normalize_tags),
        updated_at: Utc::now(),
    };
    let updated: Article = diesel_update(&article)
        .set(&changes)
        .returning(Article::as_returning())
        .get_result(connection)?;
    Ok(updated)
}

pub fn delete_article(connection: &mut PgConnection, user: &User, slug: &str) -> Result<Article, ApiError> {
    let article = Article::load_by_slug(slug, connection)?;
    check_author(&article, user)?;
    diesel_delete(&article).execute(connection)?;
    tracing::info!(article_id = article.id, slug = %article.slug, "article deleted");
    Ok(article)
}

/// Favorites or unfavorites; repeating either is a no-op.
pub fn set_favorite(
    connection: &mut PgConnection,
    user: &User,
    slug: &str,
    favorite: bool,
) -> Result<ReachArticle, ApiError> {
    let article = Article::load_by_slug(slug, connection)?;
    let mine = favorites::table
        .filter(favorites::user_id.eq(user.id))
        .filter(favorites::article_id.eq(article.id));

    if favorite {
        let inserted = insert_into(favorites::table)
            .values((
                favorites::user_id.eq(user.id),
                favorites::article_id.eq(article.id),
            ))
            .on_conflict((favorites::article_id, favorites::user_id))
            .do_nothing()
            .execute(connection)?;
        if inserted > 0 {
            let event = Event::new(user.id, Kind::Favorited).on_article(article.id);
            notify::notify(connection, &[article.author_id], &event)?;
        }
    } else {
        diesel_delete(mine).execute(connection)?;
    }

    load_reach(connection, &article.slug, Some(user.id))
}

#[derive(Debug, QueryableByName)]
struct TagRow {
    #[diesel(sql_type = Text)]
    tag: String,
}

pub fn all_tags(connection: &mut PgConnection) -> QueryResult<Vec<String>> {
    let rows = sql_query("select distinct unnest(tag_list) as tag from articles order by tag")
        .load::<TagRow>(connection)?;
    Ok(rows.into_iter().map(|row| row.tag).collect())
}

#[get("/?<tag>&<author>&<favorited>&<limit>&<offset>")]
pub async fn list(
    current_user: Option<User>,
    connection: DbConnection,
    tag: Option<String>,
    author: Option<String>,
    favorited: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
) -> ApiResult<ReachArticlesResponse> {
    let mut query = ArticleQuery::new(current_user.map(|u| u.id), Page::new(limit, offset));
    query.tag = tag.map(|t| t.trim().to_lowercase());
    query.author = author;
    query.favorited = favorited;
    connection
        .run(move |conn| Ok(list_articles(conn, &query)?))
        .await
        .map(Json)
}

#[get("/feed?<limit>&<offset>")]
pub async fn feed(
    user: User,
    connection: DbConnection,
    limit: Option<i64>,
    offset: Option<i64>,
) -> ApiResult<ReachArticlesResponse> {
    let mut query = ArticleQuery::new(Some(user.id), Page::new(limit, offset));
    query.feed = true;
    connection
        .run(move |conn| Ok(list_articles(conn, &query)?))
        .await
        .map(Json)
}

#[get("/<slug>")]
pub async fn get(
    current_user: Option<User>,
    connection: DbConnection,
    slug: String,
) -> ApiResult<ReachArticleResponse> {
    let viewer = current_user.map(|u| u.id);
    connection
        .run(move |conn| reach_response(conn, &slug, viewer))
        .await
        .map(Json)
}

#[post("/", format = "json", data = "<create>")]
pub async fn create(
    user: User,
    connection: DbConnection,
    create: Json<CreateArticle>,
) -> Result<Created<Json<ReachArticleResponse>>, ApiError> {
    let create = create.into_inner();
    let response = connection
        .run(move |conn| {
            let article = create_article(conn, &user, create)?;
            reach_response(conn, &article.slug, Some(user.id))
        })
        .await?;
    let location = format!("/api/articles/{}", response.article.slug);
    Ok(Created::new(location).body(Json(response)))
}

#[put("/<slug>", format = "json", data = "<update>")]
pub async fn update(
    user: User,
    connection: DbConnection,
    slug: String,
    update: Json<UpdateArticle>,
) -> ApiResult<ReachArticleResponse> {
    let update = update.into_inner().article;
    connection
        .run(move |conn| {
            let updated = update_article(conn, &user, &slug, update)?;
            reach_response(conn, &updated.slug, Some(user.id))
        })
        .await
        .map(Json)
}

#[delete("/<slug>")]
pub async fn delete(user: User, connection: DbConnection, slug: String) -> ApiResult<Value> {
    let article = connection
        .run(move |conn| delete_article(conn, &user, &slug))
        .await?;
    Ok(Json(json!({ "article": { "slug": article.slug, "deleted": true } })))
}

#[post("/<slug>/favorite")]
pub async fn favorite(
    user: User,
    connection: DbConnection,
    slug: String,
) -> ApiResult<ReachArticleResponse> {
    connection
        .run(move |conn| set_favorite(conn, &user, &slug, true))
        .await
        .map(|article| Json(article.into()))
}

#[delete("/<slug>/favorite")]
pub async fn unfavorite(
    user: User,
    connection: DbConnection,
    slug: String,
) -> ApiResult<ReachArticleResponse> {
    connection
        .run(move |conn| set_favorite(conn, &user, &slug, false))
        .await
        .map(|article| Json(article.into()))
}

#[get("/tags")]
pub async fn tags(connection: DbConnection) -> ApiResult<Value> {
    let tags = connection.run(|conn| Ok(all_tags(conn)?)).await?;
    Ok(Json(json!({ "tags": tags })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;
    use chrono::TimeZone;
    use std::collections::HashSet;

    #[test]
    fn first_free_slug_is_the_plain_slug() {
        let slug = unique_slug("Hello, World!", |_| Ok(false)).unwrap();
        assert_eq!(slug, "hello-world");
    }

    #[test]
    fn taken_slugs_get_numbered_suffixes() {
        let taken: HashSet<&str> = ["hello-world", "hello-world-1", "hello-world-2"]
            .into_iter()
            .collect();
        let mut tried = Vec::new();
        let slug = unique_slug("Hello World", |candidate| {
            tried.push(candidate.to_owned());
            Ok(taken.contains(candidate))
        })
        .unwrap();
        assert_eq!(slug, "hello-world-3");
        assert_eq!(tried.len(), 4);
    }

    #[test]
    fn titles_without_slug_characters_fall_back() {
        assert_eq!(unique_slug("!!!", |_| Ok(false)).unwrap(), "article");
    }

    #[test]
    fn slug_lookup_errors_propagate() {
        let result = unique_slug("x", |_| Err(diesel::result::Error::NotFound));
        assert!(result.is_err());
    }

    fn sample_reach() -> ReachArticle {
        let at = Utc.with_ymd_and_hms(2024, 5, 2, 8, 0, 0).unwrap();
        ReachArticle {
            id: 1,
            slug: "rust-in-production".to_owned(),
            title: "Rust in production".to_owned(),
            description: "notes".to_owned(),
            body: "body".to_owned(),
            tag_list: vec!["rust".to_owned()],
            created_at: at,
            updated_at: at,
            author_name: "ada".to_owned(),
            author_bio: None,
            author_image: None,
            followed: true,
            favorites_count: 2,
            favorited: false,
            likes_count: 3,
            dislikes_count: 1,
            reaction: Some(false),
            average_rating: Some(4.5),
            ratings_count: 2,
        }
    }

    #[test]
    fn reach_article_json_shape() {
        let value = serde_json::to_value(ReachArticleResponse::from(sample_reach())).unwrap();
        let article = &value["article"];
        assert_eq!(article["slug"], "rust-in-production");
        assert_eq!(article["tagList"], json!(["rust"]));
        assert_eq!(article["createdAt"], "2024-05-02T08:00:00.000Z");
        assert_eq!(article["favoritesCount"], 2);
        assert_eq!(article["likesCount"], 3);
        assert_eq!(article["dislikesCount"], 1);
        assert_eq!(article["reaction"], "dislike");
        assert_eq!(article["averageRating"], 4.5);
        assert_eq!(article["author"]["username"], "ada");
        assert_eq!(article["author"]["following"], true);
        assert!(article.get("id").is_none());
    }

    #[test]
    fn unrated_articles_have_null_average() {
        let mut reach = sample_reach();
        reach.average_rating = None;
        reach.reaction = None;
        let value = serde_json::to_value(&reach).unwrap();
        assert!(value["averageRating"].is_null());
        assert!(value["reaction"].is_null());
    }

    #[test]
    fn only_the_author_may_edit() {
        let author = crate::users::models::sample(1, "ada");
        let other = crate::users::models::sample(2, "grace");
        let at = Utc::now();
        let article = Article {
            id: 10,
            author_id: 1,
            slug: "s".to_owned(),
            title: "t".to_owned(),
            description: "d".to_owned(),
            body: "b".to_owned(),
            tag_list: Vec::new(),
            created_at: at,
            updated_at: at,
        };
        assert!(check_author(&article, &author).is_ok());
        assert!(matches!(check_author(&article, &other), Err(ApiError::Forbidden)));
    }

    #[test]
    fn blank_fields_fail_create_validation() {
        let mut error = ValidationError::default();
        require_text(&mut error, "title", "   ");
        require_text(&mut error, "body", "text");
        assert_eq!(error.messages("title"), ["title cannot be empty".to_owned()]);
        assert!(error.messages("body").is_empty());
    }

    fn create_request(title: &str, tags: &[&str]) -> CreateArticle {
        CreateArticle {
            article: ArticleDetails {
                title: title.to_owned(),
                description: "about".to_owned(),
                body: "text".to_owned(),
                tag_list: tags.iter().map(|t| t.to_string()).collect(),
            },
        }
    }

    #[test]
    fn articles_count_survives_paging_past_the_end() {
        let Some(mut conn) = testing::connection() else { return };
        let ada = testing::user(&mut conn, "ada");
        for slug in ["one", "two", "three"] {
            testing::article(&mut conn, &ada, slug, &["rust"]);
        }

        let first = list_articles(&mut conn, &ArticleQuery::new(None, Page::new(Some(2), None))).unwrap();
        assert_eq!(first.articles.len(), 2);
        assert_eq!(first.articles_count, 3);

        let past_end =
            list_articles(&mut conn, &ArticleQuery::new(None, Page::new(Some(20), Some(3)))).unwrap();
        assert!(past_end.articles.is_empty());
        assert_eq!(past_end.articles_count, 3);

        let mut tagged = ArticleQuery::new(None, Page::new(None, Some(5)));
        tagged.tag = Some("rust".to_owned());
        let tagged = list_articles(&mut conn, &tagged).unwrap();
        assert!(tagged.articles.is_empty());
        assert_eq!(tagged.articles_count, 3);
    }

    #[test]
    fn list_filters_by_tag_author_and_favorited() {
        let Some(mut conn) = testing::connection() else { return };
        let ada = testing::user(&mut conn, "ada");
        let grace = testing::user(&mut conn, "grace");
        testing::article(&mut conn, &ada, "engines", &["math"]);
        testing::article(&mut conn, &grace, "compilers", &["rust"]);
        set_favorite(&mut conn, &ada, "compilers", true).unwrap();

        let mut by_tag = ArticleQuery::new(None, Page::new(None, None));
        by_tag.tag = Some("math".to_owned());
        let found = list_articles(&mut conn, &by_tag).unwrap();
        assert_eq!(found.articles_count, 1);
        assert_eq!(found.articles[0].slug, "engines");

        let mut by_author = ArticleQuery::new(None, Page::new(None, None));
        by_author.author = Some("grace".to_owned());
        assert_eq!(list_articles(&mut conn, &by_author).unwrap().articles[0].slug, "compilers");

        let mut favorited = ArticleQuery::new(None, Page::new(None, None));
        favorited.favorited = Some("ada".to_owned());
        let found = list_articles(&mut conn, &favorited).unwrap();
        assert_eq!(found.articles_count, 1);
        assert_eq!(found.articles[0].slug, "compilers");
    }

    #[test]
    fn feed_only_shows_followed_authors() {
        let Some(mut conn) = testing::connection() else { return };
        let ada = testing::user(&mut conn, "ada");
        let grace = testing::user(&mut conn, "grace");
        let linus = testing::user(&mut conn, "linus");
        testing::follow(&mut conn, &ada, &grace);
        testing::article(&mut conn, &grace, "followed-post", &[]);
        testing::article(&mut conn, &linus, "other-post", &[]);

        let mut feed = ArticleQuery::new(Some(ada.id), Page::new(None, None));
        feed.feed = true;
        let found = list_articles(&mut conn, &feed).unwrap();
        assert_eq!(found.articles_count, 1);
        assert_eq!(found.articles[0].slug, "followed-post");
        assert!(found.articles[0].followed);
    }

    #[test]
    fn favorites_are_idempotent_and_notify_once() {
        let Some(mut conn) = testing::connection() else { return };
        let ada = testing::user(&mut conn, "ada");
        let grace = testing::user(&mut conn, "grace");
        testing::article(&mut conn, &ada, "engines", &[]);

        set_favorite(&mut conn, &grace, "engines", true).unwrap();
        let twice = set_favorite(&mut conn, &grace, "engines", true).unwrap();
        assert!(twice.favorited);
        assert_eq!(twice.favorites_count, 1);

        let notified = crate::notify::list_notifications(&mut conn, ada.id, false, Page::new(None, None))
            .unwrap();
        assert_eq!(notified.unread_count, 1);

        let removed = set_favorite(&mut conn, &grace, "engines", false).unwrap();
        assert!(!removed.favorited);
        assert_eq!(removed.favorites_count, 0);
        set_favorite(&mut conn, &grace, "engines", false).unwrap();
    }

    #[test]
    fn colliding_titles_get_suffixed_slugs() {
        let Some(mut conn) = testing::connection() else { return };
        let ada = testing::user(&mut conn, "ada");
        let first = create_article(&mut conn, &ada, create_request("Hello World", &[" Rust "])).unwrap();
        let second = create_article(&mut conn, &ada, create_request("Hello, World!", &[])).unwrap();
        assert_eq!(first.slug, "hello-world");
        assert_eq!(first.tag_list, vec!["rust".to_owned()]);
        assert_eq!(second.slug, "hello-world-1");
    }

    #[test]
    fn retitling_keeps_the_slug_when_it_still_fits() {
        let Some(mut conn) = testing::connection() else { return };
        let ada = testing::user(&mut conn, "ada");
        create_article(&mut conn, &ada, create_request("Hello World", &[])).unwrap();

        let same = UpdateDetails {
            title: Some("Hello, World!".to_owned()),
            description: None,
            body: None,
            tag_list: None,
        };
        let updated = update_article(&mut conn, &ada, "hello-world", same).unwrap();
        assert_eq!(updated.slug, "hello-world");
        assert_eq!(updated.title, "Hello, World!");

        let renamed = UpdateDetails {
            title: Some("Goodbye".to_owned()),
            description: None,
            body: None,
            tag_list: None,
        };
        let updated = update_article(&mut conn, &ada, "hello-world", renamed).unwrap();
        assert_eq!(updated.slug, "goodbye");
        assert!(matches!(Article::load_by_slug("hello-world", &mut conn), Err(ApiError::Diesel(_))));
    }

    #[test]
    fn strangers_cannot_edit_or_delete() {
        let Some(mut conn) = testing::connection() else { return };
        let ada = testing::user(&mut conn, "ada");
        let grace = testing::user(&mut conn, "grace");
        testing::article(&mut conn, &ada, "engines", &[]);
        let edit = UpdateDetails {
            title: None,
            description: None,
            body: Some("mine now".to_owned()),
            tag_list: None,
        };
        assert!(matches!(update_article(&mut conn, &grace, "engines", edit), Err(ApiError::Forbidden)));
        assert!(matches!(delete_article(&mut conn, &grace, "engines"), Err(ApiError::Forbidden)));
        assert!(delete_article(&mut conn, &ada, "engines").is_ok());
    }

    #[test]
    fn publishing_notifies_followers() {
        let Some(mut conn) = testing::connection() else { return };
        let ada = testing::user(&mut conn, "ada");
        let grace = testing::user(&mut conn, "grace");
        testing::follow(&mut conn, &grace, &ada);
        create_article(&mut conn, &ada, create_request("Engines", &[])).unwrap();

        let inbox = crate::notify::list_notifications(&mut conn, grace.id, true, Page::new(None, None))
            .unwrap();
        assert_eq!(inbox.unread_count, 1);
        assert_eq!(inbox.notifications[0].kind, "article_published");
    }

    #[test]
    fn tags_are_distinct_and_sorted() {
        let Some(mut conn) = testing::connection() else { return };
        let ada = testing::user(&mut conn, "ada");
        testing::article(&mut conn, &ada, "a", &["web", "rust"]);
        testing::article(&mut conn, &ada, "b", &["rust"]);
        assert_eq!(all_tags(&mut conn).unwrap(), vec!["rust".to_owned(), "web".to_owned()]);
    }
}
