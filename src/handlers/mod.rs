pub mod auth_handlers;
pub mod health_handlers;
pub mod playback_handlers;
pub mod song_handlers;
