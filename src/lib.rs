//! chatreel renders text-message conversations into voiced chat videos.
//!
//! Stages, leaf first: [`bubble`] paints frames, [`reveal`] drives it into
//! per-turn slide-in groups, [`speech`] voices each turn, [`timeline`]
//! merges both into one timed sequence and [`encoding`] writes the MP4.
//! [`pipeline`] runs them in order; [`jobs`] and [`api`] put that behind an
//! HTTP job queue.

pub mod api;
pub mod avatar;
pub mod bubble;
pub mod config;
pub mod conversation;
pub mod dialogue;
pub mod encoding;
pub mod error;
pub mod font_assets;
pub mod frames;
pub mod jobs;
pub mod layout;
pub mod pipeline;
pub mod probe;
pub mod reveal;
pub mod speech;
pub mod timeline;
