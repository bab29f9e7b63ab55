use diesel::prelude::*;
use diesel::{delete as diesel_delete, insert_into, update as diesel_update};
use rocket::serde::json::Json;

use crate::article::{reach_response, Article, ReachArticleResponse};
use crate::db::schema::reactions;
use crate::db::DbConnection;
use crate::types::{ApiError, ApiResult};
use crate::users::models::User;

/// How a like/dislike request changes the stored reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Add,
    Remove,
    Switch,
}

/// Same reaction twice undoes it; the opposite one replaces it.
pub fn resolve(existing: Option<bool>, like: bool) -> Change {
    match existing {
        None => Change::Add,
        Some(current) if current == like => Change::Remove,
        Some(_) => Change::Switch,
    }
}

/// Applies a like or dislike. The first reaction goes in through an insert that
/// ignores conflicts, so two concurrent first requests cannot both add a row;
/// anything already stored is then resolved under its row lock.
pub fn react(
    connection: &mut PgConnection,
    user: &User,
    slug: &str,
    like: bool,
) -> Result<ReachArticleResponse, ApiError> {
    let article = Article::load_by_slug(slug, connection)?;

    let change = connection.transaction::<_, ApiError, _>(|conn| {
        let mine = || {
            reactions::table
                .filter(reactions::article_id.eq(article.id))
                .filter(reactions::user_id.eq(user.id))
        };
        loop {
            let inserted = insert_into(reactions::table)
                .values((
                    reactions::article_id.eq(article.id),
                    reactions::user_id.eq(user.id),
                    reactions::is_like.eq(like),
                ))
                .on_conflict((reactions::article_id, reactions::user_id))
                .do_nothing()
                .execute(conn)?;
            if inserted == 1 {
                return Ok(Change::Add);
            }

            let existing = mine()
                .select(reactions::is_like)
                .for_update()
                .first::<bool>(conn)
                .optional()?;
            // Gone between the insert and the lock; try the insert again.
            let Some(existing) = existing else { continue };

            let change = resolve(Some(existing), like);
            match change {
                Change::Add => {}
                Change::Remove => {
                    diesel_delete(mine()).execute(conn)?;
                }
                Change::Switch => {
                    diesel_update(mine())
                        .set(reactions::is_like.eq(like))
                        .execute(conn)?;
                }
            }
            return Ok(change);
        }
    })?;
    tracing::debug!(article_id = article.id, user_id = user.id, like, ?change, "reaction toggled");

    reach_response(connection, &article.slug, Some(user.id))
}

#[post("/<slug>/like")]
pub async fn like(user: User, connection: DbConnection, slug: String) -> ApiResult<ReachArticleResponse> {
    connection
        .run(move |conn| react(conn, &user, &slug, true))
        .await
        .map(Json)
}

#[post("/<slug>/dislike")]
pub async fn dislike(
    user: User,
    connection: DbConnection,
    slug: String,
) -> ApiResult<ReachArticleResponse> {
    connection
        .run(move |conn| react(conn, &user, &slug, false))
        .await
        .map(Json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;

    fn stored(conn: &mut PgConnection, user: &User) -> Option<bool> {
        reactions::table
            .filter(reactions::user_id.eq(user.id))
            .select(reactions::is_like)
            .first(conn)
            .optional()
            .unwrap()
    }

    fn counts(conn: &mut PgConnection, like: bool) -> i64 {
        reactions::table
            .filter(reactions::is_like.eq(like))
            .count()
            .get_result(conn)
            .unwrap()
    }

    #[test]
    fn first_reaction_is_added() {
        assert_eq!(resolve(None, true), Change::Add);
        assert_eq!(resolve(None, false), Change::Add);
    }

    #[test]
    fn repeating_a_reaction_removes_it() {
        assert_eq!(resolve(Some(true), true), Change::Remove);
        assert_eq!(resolve(Some(false), false), Change::Remove);
    }

    #[test]
    fn opposite_reaction_switches() {
        assert_eq!(resolve(Some(true), false), Change::Switch);
        assert_eq!(resolve(Some(false), true), Change::Switch);
    }

    #[test]
    fn reactions_toggle_and_switch() {
        let Some(mut conn) = testing::connection() else { return };
        let ada = testing::user(&mut conn, "ada");
        let grace = testing::user(&mut conn, "grace");
        testing::article(&mut conn, &ada, "engines", &[]);

        react(&mut conn, &grace, "engines", true).unwrap();
        assert_eq!(stored(&mut conn, &grace), Some(true));
        assert_eq!(counts(&mut conn, true), 1);

        react(&mut conn, &grace, "engines", false).unwrap();
        assert_eq!(stored(&mut conn, &grace), Some(false));
        assert_eq!((counts(&mut conn, true), counts(&mut conn, false)), (0, 1));

        react(&mut conn, &grace, "engines", false).unwrap();
        assert_eq!(stored(&mut conn, &grace), None);

        react(&mut conn, &ada, "engines", true).unwrap();
        react(&mut conn, &grace, "engines", true).unwrap();
        assert_eq!(counts(&mut conn, true), 2);
    }

    #[test]
    fn reacting_to_a_missing_article_fails() {
        let Some(mut conn) = testing::connection() else { return };
        let ada = testing::user(&mut conn, "ada");
        assert!(matches!(
            react(&mut conn, &ada, "missing", true),
            Err(ApiError::Diesel(diesel::result::Error::NotFound))
        ));
    }
}
