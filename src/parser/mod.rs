//! Email parsing: staging MIME parts as provided files.

pub mod eml;
