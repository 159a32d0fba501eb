pub mod error;
pub mod storage;
pub mod utils;

pub use error::AppError;
pub use storage::db::SurrealDbClient;
pub use storage::repository::Repository;
pub use utils::config::{get_config, EnvConfig};
