use cbag_core::config::{AppConfig, LoadOptions, SessionStoreKind};
use cbag_db::{connect_with_config, migrations};

use crate::commands::{block_on, CommandResult};

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "migrate",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    if config.sessions.store == SessionStoreKind::Memory {
        return CommandResult::skipped(
            "migrate",
            "sessions.store is `memory`: histories live in process and there is no schema to migrate; \
             set sessions.store = \"sqlite\" to persist them",
        );
    }

    let migrated = block_on("migrate", async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| CommandResult::failure("migrate", "db_connectivity", error.to_string(), 4))?;
        let applied = migrations::run_pending(&pool).await;
        pool.close().await;
        applied.map_err(|error| CommandResult::failure("migrate", "migration", error.to_string(), 5))
    });

    match migrated {
        Ok(Ok(())) => CommandResult::success(
            "migrate",
            format!(
                "session store `{}` is at schema version {}",
                config.database.url,
                migrations::latest_version().unwrap_or_default()
            ),
        ),
        Ok(Err(failure)) | Err(failure) => failure,
    }
}
