pub mod endpoint;
pub mod error;
pub mod local;
pub mod ordinal;
pub mod provider;
pub mod publish;
pub mod statefulset;
