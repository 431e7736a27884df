pub mod announcer;
pub mod audio;
pub mod downloader;
pub mod events;
pub mod gatherer;
pub mod listeners;
pub mod player;
pub mod proxy;
pub mod queue;
pub mod retry;
pub mod suggestions;
