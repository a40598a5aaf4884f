//! Notes service: a small JSON API on top of axumplus.
//!
//! ```text
//! axumplus-demo db upgrade
//! axumplus-demo seed
//! axumplus-demo runserver --port 8000
//! ```

mod app;
mod models;
mod notes;
mod pages;

use axumplus::{get_manager, App};

use crate::models::NoteStatus;
use crate::notes::CreateNote;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let root = std::env::current_dir()?;
    get_manager(app::application(root))
        .command("seed", "Insert a few sample notes", seed)
        .run()
        .await
}

async fn seed(app: App) -> anyhow::Result<()> {
    let mut conn = app.db().conn().await?;
    let samples = [
        ("Welcome", "Notes are stored in PostgreSQL.", NoteStatus::Published),
        ("Ideas", "", NoteStatus::Draft),
    ];
    for (title, body, status) in samples {
        let note = notes::insert_note(
            &mut conn,
            CreateNote {
                title: title.to_string(),
                body: body.to_string(),
                status,
                tag: Some("sample".to_string()),
            },
        )
        .await?;
        println!("Created note {} ({})", note.title, note.uuid);
    }
    Ok(())
}
