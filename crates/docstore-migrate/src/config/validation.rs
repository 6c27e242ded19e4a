//! Configuration validation.

use super::Config;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Store validation
    if config.store.path.as_os_str().is_empty() {
        return Err(MigrateError::Config("store.path is required".into()));
    }
    if config.store.hard_cap == 0 {
        return Err(MigrateError::Config(
            "store.hard_cap must be at least 1".into(),
        ));
    }

    // Migration config validation - only check if explicitly set
    let migration = &config.migration;
    if let Some(size) = migration.max_batch_size {
        if size == 0 || size >= config.store.hard_cap {
            return Err(MigrateError::Config(format!(
                "migration.max_batch_size must be between 1 and {} (below store.hard_cap), got {}",
                config.store.hard_cap - 1,
                size
            )));
        }
    } else if migration.get_max_batch_size() >= config.store.hard_cap {
        return Err(MigrateError::Config(format!(
            "store.hard_cap {} requires an explicit migration.max_batch_size below it",
            config.store.hard_cap
        )));
    }
    if let Some(0) = migration.page_size {
        return Err(MigrateError::Config(
            "migration.page_size must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.delete_page_size {
        return Err(MigrateError::Config(
            "migration.delete_page_size must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.workers {
        return Err(MigrateError::Config(
            "migration.workers must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.max_retries {
        return Err(MigrateError::Config(
            "migration.max_retries must be at least 1".into(),
        ));
    }

    // Plan validation
    config.plan.validate()?;

    Ok(())
}
