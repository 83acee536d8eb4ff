#![forbid(unsafe_code)]

pub mod ph1auth;
pub mod ph1cool;
pub mod ph1harm;
pub mod ph1loop;
pub mod ph1mode;
pub mod ph1shape;
pub mod provider;
