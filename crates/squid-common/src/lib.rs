#![no_std]

pub mod tick;
pub mod wire;
mod devlog;

pub use log as __log;
