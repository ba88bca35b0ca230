use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Sparkler DB: running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE waiting_queue (
                participant_id  TEXT PRIMARY KEY,
                enqueued_at     INTEGER NOT NULL,
                revision        TEXT NOT NULL
            );

            CREATE INDEX idx_waiting_enqueued
                ON waiting_queue(enqueued_at);

            CREATE TABLE rooms (
                id              TEXT PRIMARY KEY,
                participant_a   TEXT NOT NULL,
                participant_b   TEXT NOT NULL,
                created_at      INTEGER NOT NULL,
                state           TEXT NOT NULL DEFAULT 'active',
                ended_at        INTEGER,
                revision        TEXT NOT NULL
            );

            CREATE INDEX idx_rooms_participant_a ON rooms(participant_a, state);
            CREATE INDEX idx_rooms_participant_b ON rooms(participant_b, state);

            CREATE TABLE messages (
                id              TEXT PRIMARY KEY,
                room_id         TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
                sender_id       TEXT NOT NULL,
                content         TEXT NOT NULL,
                sequence        INTEGER NOT NULL,
                created_at      INTEGER NOT NULL,
                UNIQUE(room_id, sequence)
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
