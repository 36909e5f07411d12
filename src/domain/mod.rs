//! Domain layer: value objects, records, pure settlement rules and the ports the
//! application layer talks to.

pub mod balance;
pub mod entitlement;
pub mod ports;
pub mod records;
pub mod settlement;
