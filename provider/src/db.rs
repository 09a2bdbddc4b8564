use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

/// A single shared connection: every connection to `sqlite::memory:` is its own database.
pub async fn connect_in_memory() -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "
        CREATE TABLE connections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            public_key TEXT NOT NULL,
            return_url TEXT NOT NULL,
            platform TEXT NOT NULL,
            push_token TEXT,
            access_token TEXT UNIQUE,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
    ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "
        CREATE TABLE authorizations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            connection_id INTEGER NOT NULL REFERENCES connections(id),
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            authorization_code TEXT,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );
    ",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "
        CREATE TABLE consents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            connection_id INTEGER NOT NULL REFERENCES connections(id),
            tpp_name TEXT NOT NULL,
            consent_type TEXT NOT NULL,
            accounts TEXT NOT NULL,
            shared_data TEXT,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );
    ",
    )
    .execute(pool)
    .await?;

    Ok(())
}
