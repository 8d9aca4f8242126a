//! # plink_engine
//!
//! Template inheritance engine for Plink.
//!
//! Templates are executable bodies that emit text and mark named regions
//! ("blocks"). A template may extend another; its blocks are then handed to
//! the parent, which renders them wherever it asks for them. Chains of any
//! length are resolved recursively, with the most derived definition of a
//! block winning.
//!
//! - [`Block`]: named, appendable text buffer
//! - [`Template`]: block capture stack, block map and extends link
//! - [`Environment`]: template factory, cache and shared variables
//! - [`Script`]: the directive syntax used for templates on disk
//!
//! ## Example
//!
//! ```rust,no_run
//! use plink_engine::{Environment, Variables};
//!
//! let env = Environment::new("templates", ".tpl");
//! env.set("site", "Plink");
//!
//! let mut vars = Variables::new();
//! vars.insert("user".to_string(), "ada".into());
//!
//! let html = env.render("home", vars).unwrap();
//! ```

pub mod block;
pub mod config;
pub mod environment;
pub mod error;
pub mod loader;
pub mod script;
pub mod template;

pub use block::{escape, Block};
pub use config::{EnvironmentConfig, DEFAULT_MAX_DEPTH};
pub use environment::{Environment, Filter, Variables};
pub use error::{TemplateError, TemplateResult};
pub use loader::{FileLoader, MemoryLoader, TemplateBody, TemplateLoader};
pub use script::{Instruction, Script};
pub use template::{Template, ANONYMOUS_BLOCK_WARNING, CONTENT_BLOCK};
