pub mod config;
pub mod endpoint;
pub mod labels;
pub mod manifest;
pub mod pod;
pub mod selector;
pub mod service;
pub mod statefulset;
pub mod validate;
pub mod volume;
