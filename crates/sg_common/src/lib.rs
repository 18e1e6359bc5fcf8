//! Canonical, cross-crate types for the StageGate marketplace services.
//!
//! This crate is **dependency-light** and **stable**: every StageGate service
//! and CLI tool imports its account/token identifiers from here instead of
//! re-declaring them, so values survive service boundaries without lossy
//! conversions.

pub mod types;

pub use types::{
    Address, Amount, BlockNumber, ListingKey, SgCommonError, TicketTier, TokenId,
};
