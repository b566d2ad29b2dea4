pub mod models;
pub mod normalize;
pub mod notifications;
pub mod retry;
pub mod settings;
pub mod store;
