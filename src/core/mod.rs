//! Core infrastructure shared by the formula loader and the installer

pub mod config;
pub mod error;
pub mod lock;
pub mod output;
