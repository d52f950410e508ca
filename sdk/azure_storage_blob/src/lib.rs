#![doc = include_str!("../README.md")]

pub mod block_blob;
pub mod conditions;
pub mod models;
pub mod seekable;
pub mod writer;
