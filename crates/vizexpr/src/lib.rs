#![forbid(unsafe_code)]

//! Umbrella crate for the vizexpr workspace.
//!
//! ```
//! use std::sync::Arc;
//! use vizexpr::{ColumnStats, ExprArena, Metadata, Value, Viz, parse_expr, render_where};
//!
//! let viz = Viz::parse("width: linear($price, 0, 100) * 10\nfilter: between($price, 10, 20)")
//!     .expect("valid viz");
//! assert_eq!(
//!     render_where(viz.filter_predicate().as_ref()),
//!     "WHERE (price BETWEEN 10 AND 20)"
//! );
//!
//! let metadata = Arc::new(
//!     Metadata::new(vec![ColumnStats::numeric("price", 0.0, 100.0, 50.0, 500.0, 10.0)], Vec::new())
//!         .expect("metadata"),
//! );
//! let mut arena = ExprArena::new();
//! let spread = parse_expr(&mut arena, "globalMax($price) - globalMin($price)").expect("parse");
//! arena.compile(spread, &metadata).expect("compile");
//! assert_eq!(arena.evaluate(spread).expect("eval"), Value::Number(100.0));
//! ```

pub use vx_expr::{
    AggregateOp, BinaryOp, Channel, CompareOp, CompileError, Cubic, EaseOut, EvalError,
    ExprArena, ExprId, ExprKind, Interpolator, IntoExpr, Linear, LogicalOp, ParseError,
    ParsedViz, UnaryOp, parse_expr, parse_viz,
};
pub use vx_filter::{FilterPredicate, FilterValue, Operand, render_where, translate_filter};
pub use vx_layer::{
    DataSource, FeatureSink, HostError, HostMap, ImageLoader, Layer, LayerError, LayerEvent,
    LayerState, NoImages, PendingUpdate, SourceError, ValidationError, Viewport, Viz,
};
pub use vx_metadata::{ColumnStats, Feature, FeatureBatch, GeomType, Metadata, MetadataError};
pub use vx_runtime::{Clock, EngineConfig, ManualClock, RuntimeError, SystemClock};
pub use vx_shader::{
    CompiledShader, GlCall, GlContext, ProgramCache, ProgramHandle, RecordingGl, ShaderError,
    ShaderTemplate, compile_shader, point_template,
};
pub use vx_types::{Color, TypeError, Value, ValueType};
