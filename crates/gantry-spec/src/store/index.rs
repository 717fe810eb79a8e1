//! SQLite index over specs and cards.
//!
//! The index is a cache for queries; `meta.last_event_id` records how far
//! it has folded the log. Any inconsistency found at recovery is resolved
//! by rebuilding from state.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use ulid::Ulid;

use crate::event::{EventPayload, SpecEvent};
use crate::types::{OptionalField, SpecState};

use super::StoreError;

#[derive(Debug, Clone)]
pub struct IndexedCard {
    pub card_id: String,
    pub card_type: String,
    pub title: String,
    pub body: Option<String>,
    pub lane: String,
    pub order: f64,
}

pub async fn open(path: &Path) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;
    init_schema(&pool).await?;
    Ok(pool)
}

async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS specs (
            spec_id    TEXT PRIMARY KEY,
            title      TEXT NOT NULL,
            one_liner  TEXT NOT NULL,
            goal       TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cards (
            card_id    TEXT PRIMARY KEY,
            spec_id    TEXT NOT NULL REFERENCES specs(spec_id),
            card_type  TEXT NOT NULL,
            title      TEXT NOT NULL,
            body       TEXT,
            lane       TEXT NOT NULL,
            card_order REAL NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn last_event_id(pool: &SqlitePool) -> Result<Option<u64>, StoreError> {
    let row = sqlx::query("SELECT value FROM meta WHERE key = 'last_event_id'")
        .fetch_optional(pool)
        .await?;
    Ok(row.and_then(|r| r.get::<String, _>(0).parse().ok()))
}

pub async fn set_last_event_id(pool: &SqlitePool, event_id: u64) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO meta (key, value) VALUES ('last_event_id', ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(event_id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// Fold one event into the index.
pub async fn apply_event(pool: &SqlitePool, event: &SpecEvent) -> Result<(), StoreError> {
    let spec_id = event.spec_id.to_string();
    match &event.payload {
        EventPayload::SpecCreated {
            title,
            one_liner,
            goal,
            created_at,
        } => {
            sqlx::query(
                "INSERT OR REPLACE INTO specs (spec_id, title, one_liner, goal, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&spec_id)
            .bind(title)
            .bind(one_liner)
            .bind(goal)
            .bind(created_at.to_rfc3339())
            .bind(created_at.to_rfc3339())
            .execute(pool)
            .await?;
        }
        EventPayload::SpecCoreUpdated { updated_at, .. } => {
            sqlx::query("UPDATE specs SET updated_at = ? WHERE spec_id = ?")
                .bind(updated_at.to_rfc3339())
                .bind(&spec_id)
                .execute(pool)
                .await?;
        }
        EventPayload::CardCreated { card } => {
            sqlx::query(
                "INSERT OR REPLACE INTO cards
                 (card_id, spec_id, card_type, title, body, lane, card_order, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(card.card_id.to_string())
            .bind(&spec_id)
            .bind(&card.card_type)
            .bind(&card.title)
            .bind(&card.body)
            .bind(&card.lane)
            .bind(card.order)
            .bind(card.created_at.to_rfc3339())
            .bind(card.updated_at.to_rfc3339())
            .execute(pool)
            .await?;
        }
        EventPayload::CardUpdated {
            card_id,
            title,
            body,
            updated_at,
            ..
        } => {
            if let Some(title) = title {
                sqlx::query("UPDATE cards SET title = ? WHERE card_id = ?")
                    .bind(title)
                    .bind(card_id.to_string())
                    .execute(pool)
                    .await?;
            }
            match body {
                OptionalField::Absent => {}
                OptionalField::Null => {
                    sqlx::query("UPDATE cards SET body = NULL WHERE card_id = ?")
                        .bind(card_id.to_string())
                        .execute(pool)
                        .await?;
                }
                OptionalField::Present(body) => {
                    sqlx::query("UPDATE cards SET body = ? WHERE card_id = ?")
                        .bind(body)
                        .bind(card_id.to_string())
                        .execute(pool)
                        .await?;
                }
            }
            sqlx::query("UPDATE cards SET updated_at = ? WHERE card_id = ?")
                .bind(updated_at.to_rfc3339())
                .bind(card_id.to_string())
                .execute(pool)
                .await?;
        }
        EventPayload::CardMoved {
            card_id,
            lane,
            order,
            updated_at,
            ..
        } => {
            sqlx::query(
                "UPDATE cards SET lane = ?, card_order = ?, updated_at = ? WHERE card_id = ?",
            )
            .bind(lane)
            .bind(order)
            .bind(updated_at.to_rfc3339())
            .bind(card_id.to_string())
            .execute(pool)
            .await?;
        }
        EventPayload::CardDeleted { card_id } => {
            sqlx::query("DELETE FROM cards WHERE card_id = ?")
                .bind(card_id.to_string())
                .execute(pool)
                .await?;
        }
        EventPayload::UndoApplied {
            inverse_payloads, ..
        } => {
            // Re-apply inverse payloads as synthetic events sharing the
            // envelope of the undo event.
            for inverse in inverse_payloads {
                let synthetic = SpecEvent {
                    event_id: event.event_id,
                    spec_id: event.spec_id,
                    timestamp: event.timestamp,
                    payload: inverse.clone(),
                };
                Box::pin(apply_event(pool, &synthetic)).await?;
            }
        }
        // Transcript, questions, steps, and snapshot markers are not
        // indexed.
        _ => {}
    }
    set_last_event_id(pool, event.event_id).await
}

/// Drop and repopulate all rows for a spec from authoritative state.
pub async fn rebuild(pool: &SqlitePool, spec_id: Ulid, state: &SpecState) -> Result<(), StoreError> {
    let spec_id_str = spec_id.to_string();
    sqlx::query("DELETE FROM cards WHERE spec_id = ?")
        .bind(&spec_id_str)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM specs WHERE spec_id = ?")
        .bind(&spec_id_str)
        .execute(pool)
        .await?;

    if let Some(core) = &state.core {
        sqlx::query(
            "INSERT INTO specs (spec_id, title, one_liner, goal, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&spec_id_str)
        .bind(&core.title)
        .bind(&core.one_liner)
        .bind(&core.goal)
        .bind(core.created_at.to_rfc3339())
        .bind(core.updated_at.to_rfc3339())
        .execute(pool)
        .await?;
    }

    for card in state.cards.values() {
        sqlx::query(
            "INSERT INTO cards
             (card_id, spec_id, card_type, title, body, lane, card_order, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(card.card_id.to_string())
        .bind(&spec_id_str)
        .bind(&card.card_type)
        .bind(&card.title)
        .bind(&card.body)
        .bind(&card.lane)
        .bind(card.order)
        .bind(card.created_at.to_rfc3339())
        .bind(card.updated_at.to_rfc3339())
        .execute(pool)
        .await?;
    }

    set_last_event_id(pool, state.last_event_id).await
}

pub async fn cards_for_spec(
    pool: &SqlitePool,
    spec_id: Ulid,
) -> Result<Vec<IndexedCard>, StoreError> {
    let rows = sqlx::query(
        "SELECT card_id, card_type, title, body, lane, card_order
         FROM cards WHERE spec_id = ? ORDER BY lane, card_order",
    )
    .bind(spec_id.to_string())
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| IndexedCard {
            card_id: row.get(0),
            card_type: row.get(1),
            title: row.get(2),
            body: row.get(3),
            lane: row.get(4),
            order: row.get(5),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Card;

    async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(&dir.path().join("index.db")).await.unwrap();
        (dir, pool)
    }

    fn card(id: u64, lane: &str, order: f64) -> Card {
        Card {
            card_id: Ulid::from_parts(id, 0),
            card_type: "idea".into(),
            title: format!("card {id}"),
            body: Some("body".into()),
            lane: lane.into(),
            order,
            refs: vec![],
            created_at: chrono::Utc::now(),
            created_by: "agent".into(),
            updated_at: chrono::Utc::now(),
            updated_by: "agent".into(),
        }
    }

    fn event(id: u64, payload: EventPayload) -> SpecEvent {
        SpecEvent {
            event_id: id,
            spec_id: Ulid::from_parts(9, 9),
            timestamp: chrono::Utc::now(),
            payload,
        }
    }

    #[tokio::test]
    async fn meta_round_trip() {
        let (_dir, pool) = test_pool().await;
        assert_eq!(last_event_id(&pool).await.unwrap(), None);
        set_last_event_id(&pool, 17).await.unwrap();
        assert_eq!(last_event_id(&pool).await.unwrap(), Some(17));
        set_last_event_id(&pool, 18).await.unwrap();
        assert_eq!(last_event_id(&pool).await.unwrap(), Some(18));
    }

    #[tokio::test]
    async fn card_lifecycle_in_index() {
        let (_dir, pool) = test_pool().await;
        let spec_id = Ulid::from_parts(9, 9);

        apply_event(
            &pool,
            &event(
                1,
                EventPayload::SpecCreated {
                    title: "t".into(),
                    one_liner: "o".into(),
                    goal: "g".into(),
                    created_at: chrono::Utc::now(),
                },
            ),
        )
        .await
        .unwrap();

        let c = card(1, "Ideas", 1.0);
        apply_event(&pool, &event(2, EventPayload::CardCreated { card: c.clone() }))
            .await
            .unwrap();

        apply_event(
            &pool,
            &event(
                3,
                EventPayload::CardUpdated {
                    card_id: c.card_id,
                    title: Some("renamed".into()),
                    body: OptionalField::Null,
                    updated_at: chrono::Utc::now(),
                    updated_by: "agent".into(),
                },
            ),
        )
        .await
        .unwrap();

        let cards = cards_for_spec(&pool, spec_id).await.unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].title, "renamed");
        assert_eq!(cards[0].body, None);
        assert_eq!(last_event_id(&pool).await.unwrap(), Some(3));

        apply_event(
            &pool,
            &event(4, EventPayload::CardDeleted { card_id: c.card_id }),
        )
        .await
        .unwrap();
        assert!(cards_for_spec(&pool, spec_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rebuild_replaces_rows() {
        let (_dir, pool) = test_pool().await;
        let spec_id = Ulid::from_parts(9, 9);

        // Seed stale rows.
        apply_event(
            &pool,
            &event(
                1,
                EventPayload::CardCreated {
                    card: card(99, "Ideas", 1.0),
                },
            ),
        )
        .await
        .ok();

        let mut state = SpecState::new();
        state.last_event_id = 10;
        let fresh = card(1, "Plan", 2.0);
        state.cards.insert(fresh.card_id, fresh);

        rebuild(&pool, spec_id, &state).await.unwrap();

        let cards = cards_for_spec(&pool, spec_id).await.unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].lane, "Plan");
        assert_eq!(last_event_id(&pool).await.unwrap(), Some(10));
    }
}
