pub mod checkins;
pub mod daemon;
pub mod logs;
pub mod messages;
pub mod sessions;
pub mod snapshot;
pub mod watch;
