table! {
    series (id) {
        id -> Uuid,
        title -> Text,
        alt_titles -> Array<Text>,
        series_type -> Text,
        content_rating -> Text,
        latest_chapter -> Nullable<Float8>,
        total_follows -> Int8,
        best_cover_url -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    series_sources (id) {
        id -> Uuid,
        series_id -> Uuid,
        source_name -> Text,
        source_id -> Text,
        source_url -> Nullable<Text>,
        cover_url -> Nullable<Text>,
        trust_score -> Int4,
        sync_priority -> Text,
        last_success_at -> Nullable<Timestamptz>,
        last_checked_at -> Nullable<Timestamptz>,
        next_check_at -> Nullable<Timestamptz>,
        failure_count -> Int4,
        source_chapter_count -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    logical_chapters (id) {
        id -> Uuid,
        series_id -> Uuid,
        chapter_number -> Float8,
        chapter_title -> Nullable<Text>,
        volume_number -> Nullable<Float8>,
        published_at -> Nullable<Timestamptz>,
        first_seen_at -> Timestamptz,
    }
}

table! {
    chapter_sources (id) {
        id -> Uuid,
        series_source_id -> Uuid,
        chapter_id -> Uuid,
        chapter_url -> Text,
        chapter_title -> Nullable<Text>,
        scanlation_group -> Nullable<Text>,
        language -> Nullable<Text>,
        source_published_at -> Nullable<Timestamptz>,
        discovered_at -> Timestamptz,
        is_available -> Bool,
    }
}

table! {
    users (id) {
        id -> Uuid,
        is_premium -> Bool,
        content_rating_cap -> Text,
        created_at -> Timestamptz,
    }
}

table! {
    library_entries (user_id, series_id) {
        user_id -> Uuid,
        series_id -> Uuid,
        status -> Text,
        notify_new_chapters -> Bool,
        preferred_source -> Nullable<Text>,
        last_read_chapter -> Nullable<Float8>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    user_chapter_reads (user_id, series_id, chapter_number) {
        user_id -> Uuid,
        series_id -> Uuid,
        chapter_number -> Float8,
        read_at -> Timestamptz,
    }
}

table! {
    notifications (id) {
        id -> Uuid,
        user_id -> Uuid,
        kind -> Text,
        series_id -> Uuid,
        logical_chapter_id -> Nullable<Uuid>,
        metadata -> Jsonb,
        read_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

joinable!(series_sources -> series (series_id));
joinable!(logical_chapters -> series (series_id));
joinable!(chapter_sources -> series_sources (series_source_id));
joinable!(chapter_sources -> logical_chapters (chapter_id));
joinable!(library_entries -> series (series_id));
joinable!(notifications -> series (series_id));
joinable!(notifications -> logical_chapters (logical_chapter_id));

allow_tables_to_appear_in_same_query!(
    series,
    series_sources,
    logical_chapters,
    chapter_sources,
    users,
    library_entries,
    user_chapter_reads,
    notifications,
);
