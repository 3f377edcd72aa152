//! Types shared by the screen recorder client and the upload server.

pub mod config;
pub mod protocol;
