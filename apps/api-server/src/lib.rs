mod error;
mod routes;
mod standalone;

pub use error::ApiError;
pub use routes::{router, AppState, CaptionQuery, IMAGE_FIELD};
pub use standalone::{start_server, ServerConfig};
