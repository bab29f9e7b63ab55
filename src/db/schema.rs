diesel::table! {
    articles (id) {
        id -> Int4,
        author_id -> Int4,
        slug -> Text,
        title -> Text,
        description -> Text,
        body -> Text,
        tag_list -> Array<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    comments (id) {
        id -> Int4,
        article_id -> Int4,
        user_id -> Int4,
        parent_id -> Nullable<Int4>,
        body -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    favorites (id) {
        id -> Int4,
        article_id -> Int4,
        user_id -> Int4,
    }
}

diesel::table! {
    followers (id) {
        id -> Int4,
        user_id -> Int4,
        follower_id -> Int4,
    }
}

diesel::table! {
    notifications (id) {
        id -> Int4,
        recipient_id -> Int4,
        actor_id -> Int4,
        kind -> Text,
        article_id -> Nullable<Int4>,
        comment_id -> Nullable<Int4>,
        is_read -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    ratings (id) {
        id -> Int4,
        article_id -> Int4,
        user_id -> Int4,
        score -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    reactions (id) {
        id -> Int4,
        article_id -> Int4,
        user_id -> Int4,
        is_like -> Bool,
    }
}

diesel::table! {
    users (id) {
        id -> Int4,
        username -> Varchar,
        email -> Text,
        password_hash -> Text,
        bio -> Nullable<Text>,
        image -> Nullable<Text>,
        is_verified -> Bool,
        created_at -> Timestamptz,
        notifications_enabled -> Bool,
    }
}

diesel::joinable!(articles -> users (author_id));
diesel::joinable!(comments -> articles (article_id));
diesel::joinable!(comments -> users (user_id));
diesel::joinable!(favorites -> articles (article_id));
diesel::joinable!(ratings -> articles (article_id));
diesel::joinable!(reactions -> articles (article_id));

diesel::allow_tables_to_appear_in_same_query!(
    articles,
    comments,
    favorites,
    followers,
    notifications,
    ratings,
    reactions,
    users,
);
