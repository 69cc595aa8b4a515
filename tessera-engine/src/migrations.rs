use rust_embed::RustEmbed;
use sqlx::SqlitePool;

use crate::error::{Error, ErrorType};

#[derive(RustEmbed)]
#[folder = "migrations/"]
struct Migrations;

/// Apply the schema scripts in filename order.
pub async fn migrate(pool: &SqlitePool) -> Result<(), Error> {
    let mut filenames: Vec<_> = Migrations::iter().collect();
    filenames.sort();

    for filename in filenames {
        let script = Migrations::get(filename.as_ref()).ok_or_else(|| {
            ErrorType::InternalError(anyhow::Error::msg(format!(
                "missing migration script `{filename}`"
            )))
        })?;
        let script = std::str::from_utf8(script.data.as_ref())
            .map_err(|_| ErrorType::BadData(format!("migration script `{filename}` is not utf-8")))?;

        // The sqlite driver prepares one statement at a time.
        for statement in script.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(pool).await?;
        }
    }
    Ok(())
}
