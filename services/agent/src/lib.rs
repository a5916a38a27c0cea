pub mod collaborators;
pub mod config;
pub mod gestures;
pub mod orchestrator;
