// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lazy actor stub rows.

use crate::error::Result;
use sqlx::SqliteConnection;
use tracing::debug;

/// Make sure a stub row exists for `actor_id`.
///
/// Tolerates a concurrent insert of the same actor. Returns `true` if this
/// call created the row.
pub async fn ensure_actor_exists(conn: &mut SqliteConnection, actor_id: &str) -> Result<bool> {
    let exists: Option<(String,)> = sqlx::query_as("SELECT did FROM actors WHERE did = ?")
        .bind(actor_id)
        .fetch_optional(&mut *conn)
        .await?;
    if exists.is_some() {
        return Ok(false);
    }

    let inserted = sqlx::query(
        "INSERT INTO actors (did, handle, display_name, created_at) VALUES (?, NULL, NULL, ?) \
         ON CONFLICT(did) DO NOTHING",
    )
    .bind(actor_id)
    .bind(super::now_millis())
    .execute(&mut *conn)
    .await?
    .rows_affected()
        == 1;

    if inserted {
        debug!(actor = %actor_id, "Provisioned actor stub");
    }
    Ok(inserted)
}
