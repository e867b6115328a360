pub mod health;
pub mod internal;
pub mod media;
pub mod schema;
