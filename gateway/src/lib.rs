#![cfg_attr(not(test), no_std)]

pub mod bridge;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod frame;
pub mod gpio;
pub mod radio;
pub mod supervisor;
