mod error;
mod handlers;
mod helpers;
mod router;
mod types;

pub use error::unparsable;
pub use router::handle_request;
pub use types::{AppState, Request, Settings};
