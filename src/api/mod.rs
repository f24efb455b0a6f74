pub mod routes;

// Re-export route handlers for convenience
pub use routes::bell;
pub use routes::music;
pub use routes::state;
