//! Relational schema bootstrap.
//!
//! Applied idempotently at startup. Every record table is unique on
//! `(author, rkey)` so duplicate creates collapse into no-ops, and every
//! relation stores internal repo/post ids, never DIDs or URIs.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS repos (
    id BIGSERIAL PRIMARY KEY,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    did TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS posts (
    id BIGSERIAL PRIMARY KEY,
    author BIGINT NOT NULL,
    rkey TEXT NOT NULL,
    cid TEXT NOT NULL DEFAULT '',
    not_found BOOLEAN NOT NULL DEFAULT false,
    raw BYTEA,
    created TIMESTAMPTZ NOT NULL DEFAULT 'epoch',
    indexed TIMESTAMPTZ NOT NULL DEFAULT 'epoch',
    reposting BIGINT NOT NULL DEFAULT 0,
    reply_to BIGINT NOT NULL DEFAULT 0,
    reply_to_usr BIGINT NOT NULL DEFAULT 0,
    in_thread BIGINT NOT NULL DEFAULT 0,
    UNIQUE (author, rkey)
);
CREATE INDEX IF NOT EXISTS posts_reply_to_idx ON posts (reply_to);
CREATE INDEX IF NOT EXISTS posts_in_thread_idx ON posts (in_thread);
CREATE INDEX IF NOT EXISTS posts_author_created_idx ON posts (author, created);

CREATE TABLE IF NOT EXISTS likes (
    id BIGSERIAL PRIMARY KEY,
    created TIMESTAMPTZ NOT NULL,
    indexed TIMESTAMPTZ NOT NULL,
    author BIGINT NOT NULL,
    rkey TEXT NOT NULL,
    subject BIGINT NOT NULL,
    cid TEXT NOT NULL DEFAULT '',
    UNIQUE (author, rkey)
);
CREATE INDEX IF NOT EXISTS likes_subject_idx ON likes (subject);

CREATE TABLE IF NOT EXISTS reposts (
    id BIGSERIAL PRIMARY KEY,
    created TIMESTAMPTZ NOT NULL,
    indexed TIMESTAMPTZ NOT NULL,
    author BIGINT NOT NULL,
    rkey TEXT NOT NULL,
    subject BIGINT NOT NULL,
    UNIQUE (author, rkey)
);
CREATE INDEX IF NOT EXISTS reposts_subject_idx ON reposts (subject);

CREATE TABLE IF NOT EXISTS follows (
    id BIGSERIAL PRIMARY KEY,
    created TIMESTAMPTZ NOT NULL,
    indexed TIMESTAMPTZ NOT NULL,
    author BIGINT NOT NULL,
    rkey TEXT NOT NULL,
    subject BIGINT NOT NULL,
    UNIQUE (author, rkey)
);
CREATE INDEX IF NOT EXISTS follows_author_idx ON follows (author);
CREATE INDEX IF NOT EXISTS follows_subject_idx ON follows (subject);

CREATE TABLE IF NOT EXISTS blocks (
    id BIGSERIAL PRIMARY KEY,
    created TIMESTAMPTZ NOT NULL,
    indexed TIMESTAMPTZ NOT NULL,
    author BIGINT NOT NULL,
    rkey TEXT NOT NULL,
    subject BIGINT NOT NULL,
    UNIQUE (author, rkey)
);

CREATE TABLE IF NOT EXISTS lists (
    id BIGSERIAL PRIMARY KEY,
    created TIMESTAMPTZ NOT NULL DEFAULT 'epoch',
    indexed TIMESTAMPTZ NOT NULL DEFAULT 'epoch',
    author BIGINT NOT NULL,
    rkey TEXT NOT NULL,
    raw BYTEA,
    UNIQUE (author, rkey)
);

CREATE TABLE IF NOT EXISTS list_items (
    id BIGSERIAL PRIMARY KEY,
    created TIMESTAMPTZ NOT NULL,
    indexed TIMESTAMPTZ NOT NULL,
    author BIGINT NOT NULL,
    rkey TEXT NOT NULL,
    subject BIGINT NOT NULL,
    list BIGINT NOT NULL,
    UNIQUE (author, rkey)
);

CREATE TABLE IF NOT EXISTS list_blocks (
    id BIGSERIAL PRIMARY KEY,
    created TIMESTAMPTZ NOT NULL,
    indexed TIMESTAMPTZ NOT NULL,
    author BIGINT NOT NULL,
    rkey TEXT NOT NULL,
    list BIGINT NOT NULL,
    UNIQUE (author, rkey)
);

CREATE TABLE IF NOT EXISTS starter_packs (
    id BIGSERIAL PRIMARY KEY,
    created TIMESTAMPTZ NOT NULL,
    indexed TIMESTAMPTZ NOT NULL,
    author BIGINT NOT NULL,
    rkey TEXT NOT NULL,
    raw BYTEA,
    list BIGINT NOT NULL,
    UNIQUE (author, rkey)
);

CREATE TABLE IF NOT EXISTS feed_generators (
    id BIGSERIAL PRIMARY KEY,
    created TIMESTAMPTZ NOT NULL,
    indexed TIMESTAMPTZ NOT NULL,
    author BIGINT NOT NULL,
    rkey TEXT NOT NULL,
    did TEXT NOT NULL DEFAULT '',
    UNIQUE (author, rkey)
);

CREATE TABLE IF NOT EXISTS thread_gates (
    id BIGSERIAL PRIMARY KEY,
    created TIMESTAMPTZ NOT NULL,
    indexed TIMESTAMPTZ NOT NULL,
    author BIGINT NOT NULL,
    rkey TEXT NOT NULL,
    post BIGINT NOT NULL,
    UNIQUE (author, rkey)
);

CREATE TABLE IF NOT EXISTS post_gates (
    id BIGSERIAL PRIMARY KEY,
    created TIMESTAMPTZ NOT NULL,
    indexed TIMESTAMPTZ NOT NULL,
    author BIGINT NOT NULL,
    rkey TEXT NOT NULL,
    subject BIGINT NOT NULL,
    raw BYTEA,
    UNIQUE (author, rkey)
);

CREATE TABLE IF NOT EXISTS profiles (
    id BIGSERIAL PRIMARY KEY,
    indexed TIMESTAMPTZ NOT NULL DEFAULT 'epoch',
    repo BIGINT NOT NULL UNIQUE,
    rev TEXT NOT NULL DEFAULT '',
    raw BYTEA
);

CREATE TABLE IF NOT EXISTS sync_infos (
    id BIGSERIAL PRIMARY KEY,
    repo BIGINT NOT NULL UNIQUE,
    follows_synced BOOLEAN NOT NULL DEFAULT false,
    rev TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS notifications (
    id BIGSERIAL PRIMARY KEY,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    for_repo BIGINT NOT NULL,
    author BIGINT NOT NULL,
    kind TEXT NOT NULL,
    source TEXT NOT NULL,
    source_cid TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS notifications_for_idx ON notifications (for_repo, id);

CREATE TABLE IF NOT EXISTS notification_seens (
    id BIGSERIAL PRIMARY KEY,
    repo BIGINT NOT NULL UNIQUE,
    seen_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS sequence_trackers (
    key TEXT PRIMARY KEY,
    int_val BIGINT NOT NULL
);
"#;
