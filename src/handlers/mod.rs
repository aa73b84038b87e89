pub mod bucket_handlers;
pub mod caller;
pub mod health_handlers;
pub mod object_handlers;
pub mod upload_handlers;
