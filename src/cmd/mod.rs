//! CLI command implementations.
//!
//! | Module     | Commands handled |
//! |------------|------------------|
//! | `serve`    | `Serve`          |
//! | `init_db`  | `InitDb`         |
//! | `config`   | `Config`         |
//! | `inspect`  | `Inspect`        |

pub mod config;
pub mod init_db;
pub mod inspect;
pub mod serve;

pub use config::cmd_config;
pub use init_db::cmd_init_db;
pub use inspect::cmd_inspect;
pub use serve::cmd_serve;
