#![doc = include_str!("../README.md")]

use std::future::Future;
use std::pin::Pin;

pub mod config;
pub mod discipline;
pub mod engine;
pub mod error;
pub mod httpreq;
pub mod jail;
pub mod location;
pub mod script;
pub mod watch;

/// dyn-compatible Future 타입 별칭
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// --- 주요 타입 re-export ---

pub use config::{Config, Decoder, Registry};
pub use discipline::Discipline;
pub use engine::{Engine, EngineOptions};
pub use error::PipelineError;
pub use jail::{DynJail, Jail, Mailer};
pub use location::{LocationLookup, LocationSources};
pub use watch::{DynWatch, Watch, WatchMode};
