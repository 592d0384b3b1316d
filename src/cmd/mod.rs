//! CLI command implementations.
//!
//! | Module   | Commands handled   |
//! |----------|--------------------|
//! | `run`    | `Run`, `Resume`    |
//! | `status` | `Status`, `Report` |
//! | `config` | `Config`           |

pub mod config;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use run::cmd_run;
pub use status::{cmd_report, cmd_status};
