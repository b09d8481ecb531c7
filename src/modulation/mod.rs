//! Shared types for radio channel / modulation configuration

pub mod lora;
