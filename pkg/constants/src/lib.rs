//! Centralized constants for the memberd project.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod controller;
pub mod paths;
pub mod state;
