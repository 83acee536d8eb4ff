#![forbid(unsafe_code)]

pub mod app_ingress;
pub mod collab;
pub mod ph1cool;
pub mod ph1harm;
pub mod ph1sess;
