#![deny(unsafe_code)]
#![warn(missing_docs)]

//! IPMI v2.0 over LAN: RMCP+ packet engine and SDR repository cache.
//!
//! The crate implements:
//! - a bit-level field codec driven by message templates ([`field`])
//! - RMCP+ packet assembly with every standard authentication, integrity
//!   and confidentiality algorithm ([`protocol`], [`CipherSuite`])
//! - Open Session and RAKP 1-4 key exchange behind a blocking [`Client`]
//! - ASF presence ping ([`rmcp::ping`])
//! - the SDR reservation protocol and the SDR cache file ([`sdr`])
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use ipmi_sdr::{Client, PrivilegeLevel};
//!
//! fn main() -> ipmi_sdr::Result<()> {
//!     let client = Client::builder("192.0.2.10:623".parse().expect("addr"))
//!         .username("admin")
//!         .password("password")
//!         .privilege_level(PrivilegeLevel::User)
//!         .timeout(Duration::from_secs(2))
//!         .build()?;
//!
//!     let summary = client.sdr().create_cache("/tmp/bmc.sdr")?;
//!     println!("cached {} records", summary.records_written);
//!     client.close_session()
//! }
//! ```

mod client;
pub mod commands;
mod crypto;
mod debug;
mod error;
pub mod field;
mod observe;
pub mod protocol;
mod rakp;
pub mod rmcp;
pub mod sdr;
mod security;
mod session;
mod transport;
mod types;

pub use crate::client::{Client, ClientBuilder, SdrService};
pub use crate::error::{Error, Result};
pub use crate::security::{
    AuthenticationAlgorithm, CipherSuite, ConfidentialityAlgorithm, IntegrityAlgorithm,
    SecurityContext,
};
pub use crate::transport::{CommandChannel, Transport};
pub use crate::types::{
    PrivilegeLevel, RawResponse, SdrChunk, SdrOperationSupport, SdrRepositoryInfo,
};
