//! Seekable, buffered playback of recorded logs.
//!
//! A [`playback::Player`] merges one or more [`source::IterableSource`]s into
//! a single timeline and reports [`playback::PlayerState`] snapshots to one
//! listener.

pub mod config;
pub mod core;
pub mod error;
pub mod input;
pub mod playback;
pub mod source;
