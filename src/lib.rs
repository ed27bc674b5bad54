//! Build the OSG stage 2 tarball: install packages into a staging root, patch
//! and fix them up for relocation, write the package manifest and pack the
//! result.

pub mod archive;
pub mod builder;
pub mod config;
pub mod error;
pub mod fixups;
pub mod installer;
pub mod manifest;
pub mod patch;
pub mod process;
pub mod runtime;
pub mod scripts;

pub use builder::Stage2Builder;
pub use config::{BuildFile, BuildOptions};
pub use error::{BuildError, Result};
