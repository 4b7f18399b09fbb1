//! postal-scan: scan-first mail delivery.
//!
//! Staged messages are classified by a language model before they reach a
//! mailbox. SAFE mail is delivered over LMTP; everything else, including every
//! message the classifier could not judge, goes to quarantine.

pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod safety;
pub mod store;
