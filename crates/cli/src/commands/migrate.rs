use crate::commands::{block_on, CommandResult};
use ragway_core::config::{AppConfig, LoadOptions};
use ragway_db::{connect, migrations};

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

    let outcome = block_on(async {
        let pool =
            connect(&config.database).await.map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        let version = migrations::applied_version(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        pool.close().await;
        Ok::<Option<i64>, (&'static str, String, u8)>(version)
    });

    match outcome {
        Err(message) => CommandResult::failure("migrate", "runtime_init", message, 3),
        Ok(Ok(Some(version))) => CommandResult::success(
            "migrate",
            format!("applied pending migrations; schema version {version}"),
        ),
        Ok(Ok(None)) => CommandResult::success("migrate", "no migrations to apply"),
        Ok(Err((error_class, message, exit_code))) => {
            CommandResult::failure("migrate", error_class, message, exit_code)
        }
    }
}
