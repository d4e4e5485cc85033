//! # Migrator Core
//!
//! The pure logic behind `build-migrator`: captured make/ninja logs go in,
//! a CMake project comes out.
//!
//! ```text
//! build commands -> logs -> parsers -> BuildObjectModel -> optimizers -> generator
//! ```
//!
//! - [`builder`] runs build commands and captures their console output
//! - [`parsers`] turn log lines into targets inside a [`context::ParserContext`]
//! - [`model`] holds the Build Object Model and its JSON form
//! - [`optimizers`] rewrite the model
//! - [`generator`] renders the model as CMake
//! - [`migrator`] ties the stages together
//!
//! All collections that reach an output are ordered, so the same logs always
//! produce the same model and the same CMake files.

pub mod builder;
pub mod context;
pub mod error;
pub mod generator;
pub mod migrator;
pub mod model;
pub mod optimizers;
pub mod parsers;
pub mod paths;
pub mod platform;
pub mod settings;
pub mod tokenizer;

pub use error::{MigratorError, Result};
pub use migrator::BuildMigrator;
pub use model::{BuildObjectModel, Flag, Language, LibRef, Module, ModuleType, SourceFile, Target, TargetKind};
pub use platform::Platform;
pub use settings::{BuildCommandSpec, Settings, Stage};
