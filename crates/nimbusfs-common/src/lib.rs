#![warn(missing_docs)]

//! NimbusFS shared subsystem: configuration properties used by every server binary

pub mod properties;

pub use properties::Properties;
