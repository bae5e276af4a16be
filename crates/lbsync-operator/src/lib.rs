//! Kubernetes surface of lbsync
//!
//! Watches Gateway API resources, translates them into desired-state models
//! for the pipeline, and writes sync outcomes back as status conditions.

#![deny(missing_docs)]

pub mod cli;
pub mod gateway;
pub mod source;
pub mod status;
pub mod translator;

pub use cli::Cli;
pub use source::KubeEventSource;
pub use status::KubeStatusWriter;
pub use translator::{GatewayTranslator, KubeResourceReader, ResourceReader};
