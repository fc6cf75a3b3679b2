#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod error;
pub mod ipc;
pub mod worker;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;
