//! `mailstash`: an ephemeral decoded-content file service for mail clients.
//!
//! Decrypted message parts are written to short-lived temp files and handed
//! out as opaque `content://` references. Opening a reference yields the
//! decoded bytes (base64 and quoted-printable are undone on the fly), and
//! old files are swept away when the device goes idle or memory runs low.

pub mod cleanup;
pub mod config;
pub mod decode;
pub mod error;
pub mod gateway;
pub mod parser;
pub mod pipe;
pub mod provider;
pub mod reference;
pub mod signal;
pub mod store;
