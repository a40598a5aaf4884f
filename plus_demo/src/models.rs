//! Tags and notes, both built on the base model.

use std::io::Write;

use async_trait::async_trait;
use axumplus::models::{Column, EnumType};
use axumplus::{DbEnum, GetOrCreate, Model};
use chrono::{DateTime, Utc};
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::pg::{Pg, PgValue};
use diesel::prelude::*;
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod schema {
    diesel::table! {
        tags (uuid) {
            uuid -> Uuid,
            created -> Nullable<Timestamptz>,
            modified -> Nullable<Timestamptz>,
            name -> Varchar,
        }
    }

    diesel::table! {
        use diesel::sql_types::*;
        use crate::models::NoteStatusType;

        notes (uuid) {
            uuid -> Uuid,
            created -> Nullable<Timestamptz>,
            modified -> Nullable<Timestamptz>,
            title -> Varchar,
            body -> Text,
            status -> NoteStatusType,
            tag_uuid -> Nullable<Uuid>,
        }
    }

    diesel::joinable!(notes -> tags (tag_uuid));
    diesel::allow_tables_to_appear_in_same_query!(notes, tags);
}

use schema::{notes, tags};

// ── tags ──

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = tags)]
pub struct Tag {
    pub uuid: Uuid,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub name: String,
}

#[derive(Debug, Clone, Insertable, Deserialize)]
#[diesel(table_name = tags)]
pub struct NewTag {
    pub name: String,
}

impl Model for Tag {
    const TABLE: &'static str = "tags";

    fn columns() -> Vec<Column> {
        vec![Column::new("name", "VARCHAR(64) NOT NULL")]
    }

    fn constraints() -> Vec<String> {
        vec!["UNIQUE (name)".to_string()]
    }
}

#[async_trait]
impl GetOrCreate for Tag {
    type Fields = NewTag;

    async fn find_by(conn: &mut AsyncPgConnection, fields: &NewTag) -> QueryResult<Option<Self>> {
        tags::table
            .filter(tags::name.eq(&fields.name))
            .select(Tag::as_select())
            .first(conn)
            .await
            .optional()
    }

    async fn create_from(conn: &mut AsyncPgConnection, fields: NewTag) -> QueryResult<Self> {
        diesel::insert_into(tags::table)
            .values(&fields)
            .returning(Tag::as_returning())
            .get_result(conn)
            .await
    }
}

// ── notes ──

#[derive(diesel::query_builder::QueryId, Clone, Debug, diesel::sql_types::SqlType)]
#[diesel(postgres_type(name = "note_status"))]
pub struct NoteStatusType;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsExpression, FromSqlRow, Serialize, Deserialize)]
#[diesel(sql_type = NoteStatusType)]
#[serde(rename_all = "lowercase")]
pub enum NoteStatus {
    #[default]
    Draft,
    Published,
    Archived,
}

impl NoteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Archived => "archived",
        }
    }
}

impl DbEnum for NoteStatus {
    const NAME: &'static str = "NoteStatus";
    const LABELS: &'static [&'static str] = &["draft", "published", "archived"];
}

impl ToSql<NoteStatusType, Pg> for NoteStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        out.write_all(self.as_str().as_bytes())?;
        Ok(IsNull::No)
    }
}

impl FromSql<NoteStatusType, Pg> for NoteStatus {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        match bytes.as_bytes() {
            b"draft" => Ok(Self::Draft),
            b"published" => Ok(Self::Published),
            b"archived" => Ok(Self::Archived),
            other => Err(format!("unknown note_status: {}", String::from_utf8_lossy(other)).into()),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = notes)]
pub struct Note {
    pub uuid: Uuid,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub title: String,
    pub body: String,
    pub status: NoteStatus,
    pub tag_uuid: Option<Uuid>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = notes)]
pub struct NewNote {
    pub title: String,
    pub body: String,
    pub status: NoteStatus,
    pub tag_uuid: Option<Uuid>,
}

#[derive(Debug, Default, AsChangeset, Deserialize)]
#[diesel(table_name = notes)]
pub struct NoteChanges {
    pub title: Option<String>,
    pub body: Option<String>,
    pub status: Option<NoteStatus>,
}

impl NoteChanges {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.body.is_none() && self.status.is_none()
    }
}

impl Model for Note {
    const TABLE: &'static str = "notes";

    fn columns() -> Vec<Column> {
        vec![
            Column::new("title", "VARCHAR(255) NOT NULL"),
            Column::new("body", "TEXT NOT NULL DEFAULT ''"),
            Column::new("status", "note_status NOT NULL DEFAULT 'draft'"),
            Column::new("tag_uuid", "UUID REFERENCES tags (uuid) ON DELETE SET NULL"),
        ]
    }

    fn enums() -> Vec<EnumType> {
        vec![NoteStatus::enum_type()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_type_name_matches_schema() {
        let ty = NoteStatus::enum_type();
        assert_eq!(ty.name, "note_status");
        assert_eq!(ty.labels, ["draft", "published", "archived"]);
        for label in NoteStatus::LABELS {
            let status: NoteStatus = serde_json::from_str(&format!("\"{label}\"")).unwrap();
            assert_eq!(status.as_str(), *label);
        }
    }

    #[test]
    fn note_table_references_tags() {
        let table = Note::table_def();
        let sql = table.create_sql();
        assert!(sql.starts_with("CREATE TABLE notes ("));
        assert!(sql.contains("uuid UUID PRIMARY KEY DEFAULT uuid_generate_v4()"));
        assert!(sql.contains("REFERENCES tags (uuid)"));
        assert_eq!(table.enums, vec![NoteStatus::enum_type()]);
        assert_eq!(table.after_create().len(), 1);
    }
}
