#![forbid(unsafe_code)]

pub mod operator_cli;
