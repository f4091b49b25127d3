//! CLI command implementations.
//!
//! | Module     | Commands handled          |
//! |------------|---------------------------|
//! | `serve`    | `Serve`                   |
//! | `validate` | `Validate`                |
//! | `run`      | `Run`, `Status`           |
//! | `targets`  | `Targets`                 |

pub mod run;
pub mod serve;
pub mod targets;
pub mod validate;

pub use run::{cmd_run, cmd_status};
pub use serve::cmd_serve;
pub use targets::cmd_targets;
pub use validate::cmd_validate;

use anyhow::{Context, Result};
use autoctf::config::AppConfig;
use autoctf::store::{DbHandle, Store};

/// Open the configured store without wiring any external clients.
pub fn open_store(config: &AppConfig) -> Result<DbHandle> {
    let store = Store::new(&config.database.path)
        .with_context(|| format!("Failed to open database at {}", config.database.path.display()))?;
    Ok(DbHandle::new(store))
}
