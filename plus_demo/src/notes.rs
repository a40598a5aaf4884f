//! `/notes` JSON API.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Json;
use axumplus::application::AppState;
use axumplus::{get_or_create, Blueprint, HttpError};
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::Deserialize;
use uuid::Uuid;

use crate::models::schema::notes;
use crate::models::{NewNote, NewTag, Note, NoteChanges, NoteStatus, Tag};

pub fn blueprint() -> Blueprint {
    Blueprint::new("notes")
        .route("/", get(list_notes).post(create_note))
        .route(
            "/{uuid}",
            get(get_note).put(update_note).delete(delete_note),
        )
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub status: Option<NoteStatus>,
}

#[derive(Debug, Deserialize)]
pub struct CreateNote {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub status: NoteStatus,
    /// Tag name, created on first use.
    pub tag: Option<String>,
}

async fn list_notes(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Note>>, HttpError> {
    let mut conn = state.db.conn().await?;
    let notes = load_notes(&mut conn, params.status).await?;
    Ok(Json(notes))
}

async fn create_note(
    State(state): State<AppState>,
    Json(req): Json<CreateNote>,
) -> Result<(StatusCode, Json<Note>), HttpError> {
    let mut conn = state.db.conn().await?;
    let note = insert_note(&mut conn, req).await?;
    tracing::info!(note = %note.uuid, "Created note");
    Ok((StatusCode::CREATED, Json(note)))
}

async fn get_note(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<Json<Note>, HttpError> {
    let mut conn = state.db.conn().await?;
    let note = find_note(&mut conn, uuid).await?;
    Ok(Json(note))
}

/// Archived notes are read-only.
async fn update_note(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
    Json(changes): Json<NoteChanges>,
) -> Result<Json<Note>, HttpError> {
    let mut conn = state.db.conn().await?;
    let note = find_note(&mut conn, uuid).await?;
    if note.status == NoteStatus::Archived {
        return Err(HttpError::Forbidden);
    }
    if changes.is_empty() {
        return Ok(Json(note));
    }
    let note = save_changes(&mut conn, uuid, changes).await?;
    Ok(Json(note))
}

async fn delete_note(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<StatusCode, HttpError> {
    let mut conn = state.db.conn().await?;
    let deleted = diesel::delete(notes::table.find(uuid))
        .execute(&mut *conn)
        .await?;
    if deleted == 0 {
        return Err(HttpError::NotFound);
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── queries ──

async fn load_notes(
    conn: &mut AsyncPgConnection,
    status: Option<NoteStatus>,
) -> QueryResult<Vec<Note>> {
    let mut query = notes::table
        .select(Note::as_select())
        .order(notes::created.desc())
        .into_boxed();
    if let Some(status) = status {
        query = query.filter(notes::status.eq(status));
    }
    query.load(conn).await
}

async fn find_note(conn: &mut AsyncPgConnection, uuid: Uuid) -> QueryResult<Note> {
    notes::table
        .find(uuid)
        .select(Note::as_select())
        .first(conn)
        .await
}

async fn save_changes(
    conn: &mut AsyncPgConnection,
    uuid: Uuid,
    changes: NoteChanges,
) -> QueryResult<Note> {
    diesel::update(notes::table.find(uuid))
        .set(&changes)
        .returning(Note::as_returning())
        .get_result(conn)
        .await
}

/// Insert a note, creating its tag in the same transaction.
pub async fn insert_note(
    conn: &mut AsyncPgConnection,
    req: CreateNote,
) -> axumplus::Result<Note> {
    conn.transaction::<_, axumplus::Error, _>(|conn| {
        async move {
            let tag_uuid = match req.tag {
                Some(name) => {
                    let (tag, created) = get_or_create::<Tag>(conn, NewTag { name }).await?;
                    if created {
                        tracing::debug!(tag = %tag.name, "Created tag");
                    }
                    Some(tag.uuid)
                }
                None => None,
            };

            let note = diesel::insert_into(notes::table)
                .values(NewNote {
                    title: req.title,
                    body: req.body,
                    status: req.status,
                    tag_uuid,
                })
                .returning(Note::as_returning())
                .get_result(conn)
                .await?;
            Ok(note)
        }
        .scope_boxed()
    })
    .await
}
