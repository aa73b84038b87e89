pub mod bucket_service;
pub mod credentials_service;
pub mod object_service;
pub mod presign;
pub mod upload_service;
