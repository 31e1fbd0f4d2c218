pub mod client;
pub mod label_index;
pub mod watch;
