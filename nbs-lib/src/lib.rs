#![doc = include_str!("../README.md")]

mod error;

pub mod application;
pub mod link;
pub mod presentation;
pub mod queue;
mod stack;
pub mod transport;

pub use error::{Error, Result};
pub use stack::{Stack, StackOptions};
