#![forbid(unsafe_code)]

//! Layers: the update orchestrator and per-frame render loop around a viz.
//!
//! A [`Layer`] owns one committed (source, viz, metadata) triple. [`Layer::update`] and
//! [`Layer::blend_to_viz`] replace it asynchronously; the host drives drawing through
//! [`Layer::pre_frame`] and [`Layer::frame`].

use thiserror::Error;
use vx_expr::{CompileError, EvalError};
use vx_shader::ShaderError;

mod host;
mod layer;
mod source;
mod viz;

pub use host::{HostError, HostMap};
pub use layer::{Layer, LayerEvent, LayerState, ListenerId, PendingUpdate};
pub use source::{DataSource, FeatureSink, ImageLoader, NoImages, SourceError, Viewport};
pub use viz::Viz;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required property '{0}'")]
    MissingRequired(&'static str),
    #[error("incorrect type: {0}")]
    IncorrectType(String),
    #[error("incorrect value: {0}")]
    IncorrectValue(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LayerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// A newer update was issued before this one could commit.
    #[error("another update finished before this one")]
    Stale,
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Shader(#[from] ShaderError),
    #[error(transparent)]
    Eval(#[from] EvalError),
}
