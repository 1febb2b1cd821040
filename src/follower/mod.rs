pub mod watcher;

pub use watcher::{spawn_stdin, FollowError, FollowMode, Follower, RawLine};
