//! Index-task dispatch interfaces consumed by the master.

mod dispatcher;
mod scd;

pub use dispatcher::{IndexService, ScdDispatcher, SCD_BACKUP_DIR};
pub use scd::{is_scd_filename, ScdShardingConfig};
