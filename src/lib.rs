pub mod access;
pub mod automod;
pub mod config;
pub mod mentions;
pub mod moderation;
pub mod notifications;
pub mod pipeline;
pub mod shared;
pub mod tests;
pub mod trending;
