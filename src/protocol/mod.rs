// src/protocol/mod.rs

pub mod resp;

pub use resp::{RespFrame, RespFrameCodec};
