//! Wire protocol between the task and its worker subprocess.
//!
//! One ordered byte stream per direction: stdin carries commands and records
//! multiplexed through the frame prefix, stdout carries result frames in the
//! same framing.

pub mod codec;
pub mod protocol;
