//! Core data types for Verimail

pub mod token;
pub mod user;
