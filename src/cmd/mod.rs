//! CLI command implementations.
//!
//! | Module    | Commands handled          |
//! |-----------|---------------------------|
//! | `serve`   | `Serve`                   |
//! | `db`      | `InitDb`                  |
//! | `config`  | `Config`                  |
//! | `token`   | `Token`                   |

pub mod config;
pub mod db;
pub mod serve;
pub mod token;

pub use config::cmd_config;
pub use db::cmd_init_db;
pub use serve::cmd_serve;
pub use token::cmd_token;
