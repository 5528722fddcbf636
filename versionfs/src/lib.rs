//! versionfs: a stackable FUSE overlay that keeps a bounded history of
//! prior versions of every file written through it.
#[macro_use]
extern crate log;

pub mod backend;
pub mod config;
pub mod control;
pub mod error;
pub mod fuse;
pub mod overlay;
pub mod version;
