mod admin;
mod documents;
mod upload;

pub use admin::{admin_purge, health};
pub use documents::{access_key, delete_document, list_versions, trigger_snapshot};
pub use upload::upload_ws;
