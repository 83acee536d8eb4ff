#![forbid(unsafe_code)]

pub mod common;
pub mod ph1cool;
pub mod ph1harm;
pub mod ph1loop;
pub mod ph1mode;
pub mod ph1sess;
pub mod ph1shape;

pub use common::{
    ceil_secs_until, ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate,
    NS_PER_SECOND,
};
