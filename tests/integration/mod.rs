//! Integration testing framework for the delivery oracle
//!
//! Drives a shell-script subject through the controller and relays generated
//! messages into sink files through every supported transport.


// Re-export commonly used types for convenience
pub use infrastructure::{Fault, Relay, SubjectHarness};
