#![forbid(unsafe_code)]

//! Visualization expression trees.
//!
//! Nodes live in an [`ExprArena`] and are addressed by [`ExprId`]. Identity is index equality,
//! which is what the shader generator keys uniforms and program caches on. Every node kind
//! supports the same protocol:
//!
//! - [`ExprArena::compile`] binds property references to a [`Metadata`] snapshot and resolves types,
//! - [`ExprArena::evaluate`] / [`ExprArena::evaluate_feature`] compute values on the CPU,
//! - [`ExprArena::emit_shader`] produces GLSL preface and inline fragments.

use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vx_metadata::Metadata;
use vx_runtime::{Clock, EngineConfig, SystemClock};
use vx_types::{Color, TypeError, Value, ValueType};

mod aggregate;
mod blend;
mod compile;
mod eval;
mod glsl;
mod parser;

pub use aggregate::{ViewportAccumulator, percentile_from_sorted};
pub use blend::{Cubic, EaseOut, Interpolator, Linear};
pub use glsl::{BindingResolver, ShaderCode, UniformKind, UniformValue, glsl_float, uniform_name};
pub use parser::{ParseError, ParsedViz, parse_expr, parse_viz, parse_viz_in};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(u32);

impl ExprId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Process-unique identity of an arena, so identity-keyed caches never confuse two trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaId(u64);

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Not,
    Abs,
    Floor,
    Ceil,
    Sqrt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CompareOp {
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "rank", rename_all = "snake_case")]
pub enum AggregateOp {
    Min,
    Max,
    Avg,
    Sum,
    Count,
    /// Rank in `[0, 100]`.
    Percentile(f64),
}

impl AggregateOp {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Avg => "avg",
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Percentile(_) => "percentile",
        }
    }
}

/// Top-level visual channel a tree feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Channel {
    Color,
    Width,
    StrokeColor,
    StrokeWidth,
    Filter,
}

impl Channel {
    pub const ALL: [Self; 5] = [
        Self::Color,
        Self::Width,
        Self::StrokeColor,
        Self::StrokeWidth,
        Self::Filter,
    ];

    /// Name used in viz strings and shader template anchors.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Color => "color",
            Self::Width => "width",
            Self::StrokeColor => "strokeColor",
            Self::StrokeWidth => "strokeWidth",
            Self::Filter => "filter",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    #[must_use]
    pub fn expected_type(self) -> ValueType {
        match self {
            Self::Color | Self::StrokeColor => ValueType::Color,
            Self::Width | Self::StrokeWidth | Self::Filter => ValueType::Number,
        }
    }

    /// Discrete channels step instead of interpolating when blended.
    #[must_use]
    pub fn is_discrete(self) -> bool {
        matches!(self, Self::Filter)
    }
}

/// Node kinds. Runtime state (aggregate results, animation clocks, blend settlement) lives
/// inline in the variant that owns it.
#[derive(Debug, Clone)]
pub enum ExprKind {
    Constant(Value),
    Property {
        name: String,
    },
    /// Seconds since the UNIX epoch at evaluation time. Never known to a server.
    Now,
    Unary {
        op: UnaryOp,
        input: ExprId,
    },
    Binary {
        op: BinaryOp,
        left: ExprId,
        right: ExprId,
    },
    Logical {
        op: LogicalOp,
        left: ExprId,
        right: ExprId,
    },
    Compare {
        op: CompareOp,
        left: ExprId,
        right: ExprId,
    },
    Between {
        input: ExprId,
        lower: ExprId,
        upper: ExprId,
    },
    In {
        input: ExprId,
        values: Vec<ExprId>,
        negated: bool,
    },
    GlobalAggregate {
        op: AggregateOp,
        input: ExprId,
        value: f64,
    },
    ViewportAggregate {
        op: AggregateOp,
        input: ExprId,
        accumulator: ViewportAccumulator,
        value: f64,
    },
    Blend {
        from: ExprId,
        to: ExprId,
        mix: ExprId,
        discrete: bool,
        settled: bool,
    },
    Animate {
        duration_ms: f64,
        start_ms: f64,
    },
    Ease {
        interpolator: Rc<dyn Interpolator>,
        input: ExprId,
    },
    Linear {
        input: ExprId,
        min: ExprId,
        max: ExprId,
    },
    Ramp {
        input: ExprId,
        palette: Vec<Value>,
    },
    Buckets {
        input: ExprId,
        breakpoints: Vec<ExprId>,
    },
    Root {
        channel: Channel,
        input: ExprId,
    },
}

impl ExprKind {
    /// Children in a fixed order; [`Self::children_mut`] yields the same order.
    #[must_use]
    pub fn children(&self) -> Vec<ExprId> {
        match self {
            Self::Constant(_) | Self::Property { .. } | Self::Now | Self::Animate { .. } => {
                Vec::new()
            }
            Self::Unary { input, .. }
            | Self::GlobalAggregate { input, .. }
            | Self::ViewportAggregate { input, .. }
            | Self::Ease { input, .. }
            | Self::Ramp { input, .. }
            | Self::Root { input, .. } => vec![*input],
            Self::Binary { left, right, .. }
            | Self::Logical { left, right, .. }
            | Self::Compare { left, right, .. } => vec![*left, *right],
            Self::Between {
                input,
                lower,
                upper,
            } => vec![*input, *lower, *upper],
            Self::Linear { input, min, max } => vec![*input, *min, *max],
            Self::In { input, values, .. } => {
                std::iter::once(*input).chain(values.iter().copied()).collect()
            }
            Self::Buckets { input, breakpoints } => std::iter::once(*input)
                .chain(breakpoints.iter().copied())
                .collect(),
            Self::Blend { from, to, mix, .. } => vec![*from, *to, *mix],
        }
    }

    fn children_mut(&mut self) -> Vec<&mut ExprId> {
        match self {
            Self::Constant(_) | Self::Property { .. } | Self::Now | Self::Animate { .. } => {
                Vec::new()
            }
            Self::Unary { input, .. }
            | Self::GlobalAggregate { input, .. }
            | Self::ViewportAggregate { input, .. }
            | Self::Ease { input, .. }
            | Self::Ramp { input, .. }
            | Self::Root { input, .. } => vec![input],
            Self::Binary { left, right, .. }
            | Self::Logical { left, right, .. }
            | Self::Compare { left, right, .. } => vec![left, right],
            Self::Between {
                input,
                lower,
                upper,
            } => vec![input, lower, upper],
            Self::Linear { input, min, max } => vec![input, min, max],
            Self::In { input, values, .. } => {
                std::iter::once(input).chain(values.iter_mut()).collect()
            }
            Self::Buckets { input, breakpoints } => {
                std::iter::once(input).chain(breakpoints.iter_mut()).collect()
            }
            Self::Blend { from, to, mix, .. } => vec![from, to, mix],
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Constant(_) => "constant",
            Self::Property { .. } => "property",
            Self::Now => "now",
            Self::Unary { .. } => "unary",
            Self::Binary { .. } => "binary",
            Self::Logical { op: LogicalOp::And, .. } => "and",
            Self::Logical { op: LogicalOp::Or, .. } => "or",
            Self::Compare { .. } => "comparison",
            Self::Between { .. } => "between",
            Self::In { negated: false, .. } => "in",
            Self::In { negated: true, .. } => "nin",
            Self::GlobalAggregate { .. } => "global aggregate",
            Self::ViewportAggregate { .. } => "viewport aggregate",
            Self::Blend { .. } => "blend",
            Self::Animate { .. } => "animate",
            Self::Ease { .. } => "ease",
            Self::Linear { .. } => "linear",
            Self::Ramp { .. } => "ramp",
            Self::Buckets { .. } => "buckets",
            Self::Root { .. } => "root",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    kind: ExprKind,
    ty: Option<ValueType>,
    parent: Option<ExprId>,
}

impl Node {
    #[must_use]
    pub fn kind(&self) -> &ExprKind {
        &self.kind
    }

    /// Resolved type, present once the node is compiled.
    #[must_use]
    pub fn value_type(&self) -> Option<ValueType> {
        self.ty
    }

    #[must_use]
    pub fn parent(&self) -> Option<ExprId> {
        self.parent
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompileError {
    #[error("unknown property {name:?}: it is not present in the dataset metadata")]
    UnknownProperty { name: String },
    #[error("type mismatch in `{context}`: expected {expected}, found {found}")]
    TypeMismatch {
        context: &'static str,
        expected: &'static str,
        found: String,
    },
    #[error("invalid argument to `{operator}`: {detail}")]
    InvalidArgument {
        operator: &'static str,
        detail: String,
    },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("expression node {0} has not been compiled")]
    NotCompiled(ExprId),
    #[error("property {name:?} can only be evaluated against a feature")]
    RequiresFeature { name: String },
    #[error("feature has no value for property {name:?}")]
    MissingProperty { name: String },
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Owner of expression nodes.
///
/// Ids are only meaningful for the arena that produced them. A clone keeps the arena id and
/// every node id: it is a staging copy meant to replace the original once work on it succeeds.
#[derive(Debug, Clone)]
pub struct ExprArena {
    id: ArenaId,
    nodes: Vec<Node>,
    clock: Rc<dyn Clock>,
    config: EngineConfig,
    metadata: Option<Arc<Metadata>>,
}

impl Default for ExprArena {
    fn default() -> Self {
        Self::new()
    }
}

impl ExprArena {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Rc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(clock: Rc<dyn Clock>) -> Self {
        Self {
            id: ArenaId(NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed)),
            nodes: Vec::new(),
            clock,
            config: EngineConfig::default(),
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn id(&self) -> ArenaId {
        self.id
    }

    #[must_use]
    pub fn clock(&self) -> &Rc<dyn Clock> {
        &self.clock
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Metadata snapshot of the latest compile.
    #[must_use]
    pub fn metadata(&self) -> Option<&Arc<Metadata>> {
        self.metadata.as_ref()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The node behind `id`, or `None` when `id` was not produced by this arena.
    #[must_use]
    pub fn get(&self, id: ExprId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    #[must_use]
    pub fn contains(&self, id: ExprId) -> bool {
        id.index() < self.nodes.len()
    }

    /// # Panics
    ///
    /// Panics if `id` belongs to another arena; use [`Self::get`] for ids of unknown origin.
    #[must_use]
    pub fn node(&self, id: ExprId) -> &Node {
        &self.nodes[id.index()]
    }

    /// # Panics
    ///
    /// Same as [`Self::node`].
    #[must_use]
    pub fn kind(&self, id: ExprId) -> &ExprKind {
        &self.nodes[id.index()].kind
    }

    #[must_use]
    pub fn children(&self, id: ExprId) -> Vec<ExprId> {
        self.kind(id).children()
    }

    #[must_use]
    pub fn value_type(&self, id: ExprId) -> Option<ValueType> {
        self.nodes[id.index()].ty
    }

    #[must_use]
    pub fn is_compiled(&self, id: ExprId) -> bool {
        self.nodes[id.index()].ty.is_some()
    }

    /// Appends a node and adopts its children.
    pub fn push(&mut self, kind: ExprKind) -> ExprId {
        let id = ExprId(self.nodes.len() as u32);
        for child in kind.children() {
            let node = &mut self.nodes[child.index()];
            debug_assert!(
                node.parent.is_none(),
                "expression node {child} already has a parent; trees cannot share nodes"
            );
            node.parent = Some(id);
        }
        self.nodes.push(Node {
            kind,
            ty: None,
            parent: None,
        });
        id
    }

    pub(crate) fn kind_mut(&mut self, id: ExprId) -> &mut ExprKind {
        &mut self.nodes[id.index()].kind
    }

    /// Points `parent` at `new` wherever it referenced `old`.
    pub fn replace_child(&mut self, parent: ExprId, old: ExprId, new: ExprId) {
        let mut replaced = false;
        for slot in self.nodes[parent.index()].kind.children_mut() {
            if *slot == old {
                *slot = new;
                replaced = true;
            }
        }
        if replaced {
            self.nodes[old.index()].parent = None;
            self.nodes[new.index()].parent = Some(parent);
            self.nodes[parent.index()].ty = None;
        }
    }

    /// All nodes of the subtree rooted at `root`, parents before children.
    #[must_use]
    pub fn descendants(&self, root: ExprId) -> Vec<ExprId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            let mut children = self.children(id);
            children.reverse();
            stack.extend(children);
        }
        out
    }

    /// Property names referenced by a tree, which is what a source needs to fetch.
    #[must_use]
    pub fn property_names(&self, root: ExprId) -> BTreeSet<String> {
        self.descendants(root)
            .into_iter()
            .filter_map(|id| match self.kind(id) {
                ExprKind::Property { name } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Deep-copies a subtree of `other` into this arena, carrying resolved types and runtime state.
    pub fn import(&mut self, other: &Self, root: ExprId) -> ExprId {
        let mut kind = other.kind(root).clone();
        let mapped = other
            .children(root)
            .into_iter()
            .map(|child| self.import(other, child))
            .collect::<Vec<_>>();
        for (slot, id) in kind.children_mut().into_iter().zip(mapped) {
            *slot = id;
        }
        let id = self.push(kind);
        self.nodes[id.index()].ty = other.value_type(root);
        id
    }

    /// Copies a subtree within this arena; the copy is unparented.
    pub fn duplicate(&mut self, root: ExprId) -> ExprId {
        let mut kind = self.kind(root).clone();
        let copies = self
            .children(root)
            .into_iter()
            .map(|child| self.duplicate(child))
            .collect::<Vec<_>>();
        for (slot, id) in kind.children_mut().into_iter().zip(copies) {
            *slot = id;
        }
        let id = self.push(kind);
        self.nodes[id.index()].ty = self.nodes[root.index()].ty;
        id
    }

    // ── builders ───────────────────────────────────────────────────────

    pub fn constant(&mut self, value: Value) -> ExprId {
        self.push(ExprKind::Constant(value))
    }

    pub fn number(&mut self, value: f64) -> ExprId {
        self.constant(Value::Number(value))
    }

    pub fn category(&mut self, value: impl Into<String>) -> ExprId {
        self.constant(Value::Category(value.into()))
    }

    pub fn color(&mut self, value: Color) -> ExprId {
        self.constant(Value::Color(value))
    }

    pub fn date_ms(&mut self, epoch_ms: f64) -> ExprId {
        self.constant(Value::Date(epoch_ms))
    }

    /// The `true` filter.
    pub fn truthy(&mut self) -> ExprId {
        self.constant(Value::bool(true))
    }

    /// The `false` filter.
    pub fn falsy(&mut self) -> ExprId {
        self.constant(Value::bool(false))
    }

    pub fn property(&mut self, name: impl Into<String>) -> ExprId {
        self.push(ExprKind::Property { name: name.into() })
    }

    pub fn now(&mut self) -> ExprId {
        self.push(ExprKind::Now)
    }

    pub fn unary(&mut self, op: UnaryOp, input: impl IntoExpr) -> ExprId {
        let input = input.into_expr(self);
        self.push(ExprKind::Unary { op, input })
    }

    pub fn not(&mut self, input: impl IntoExpr) -> ExprId {
        self.unary(UnaryOp::Not, input)
    }

    pub fn binary(&mut self, op: BinaryOp, left: impl IntoExpr, right: impl IntoExpr) -> ExprId {
        let left = left.into_expr(self);
        let right = right.into_expr(self);
        self.push(ExprKind::Binary { op, left, right })
    }

    pub fn add(&mut self, left: impl IntoExpr, right: impl IntoExpr) -> ExprId {
        self.binary(BinaryOp::Add, left, right)
    }

    pub fn mul(&mut self, left: impl IntoExpr, right: impl IntoExpr) -> ExprId {
        self.binary(BinaryOp::Mul, left, right)
    }

    pub fn and(&mut self, left: impl IntoExpr, right: impl IntoExpr) -> ExprId {
        let left = left.into_expr(self);
        let right = right.into_expr(self);
        self.push(ExprKind::Logical {
            op: LogicalOp::And,
            left,
            right,
        })
    }

    pub fn or(&mut self, left: impl IntoExpr, right: impl IntoExpr) -> ExprId {
        let left = left.into_expr(self);
        let right = right.into_expr(self);
        self.push(ExprKind::Logical {
            op: LogicalOp::Or,
            left,
            right,
        })
    }

    pub fn compare(&mut self, op: CompareOp, left: impl IntoExpr, right: impl IntoExpr) -> ExprId {
        let left = left.into_expr(self);
        let right = right.into_expr(self);
        self.push(ExprKind::Compare { op, left, right })
    }

    pub fn lt(&mut self, left: impl IntoExpr, right: impl IntoExpr) -> ExprId {
        self.compare(CompareOp::Lt, left, right)
    }

    pub fn gt(&mut self, left: impl IntoExpr, right: impl IntoExpr) -> ExprId {
        self.compare(CompareOp::Gt, left, right)
    }

    pub fn eq(&mut self, left: impl IntoExpr, right: impl IntoExpr) -> ExprId {
        self.compare(CompareOp::Eq, left, right)
    }

    pub fn between(
        &mut self,
        input: impl IntoExpr,
        lower: impl IntoExpr,
        upper: impl IntoExpr,
    ) -> ExprId {
        let input = input.into_expr(self);
        let lower = lower.into_expr(self);
        let upper = upper.into_expr(self);
        self.push(ExprKind::Between {
            input,
            lower,
            upper,
        })
    }

    pub fn in_values<V: IntoExpr>(
        &mut self,
        input: impl IntoExpr,
        values: impl IntoIterator<Item = V>,
    ) -> ExprId {
        self.membership(input, values, false)
    }

    pub fn not_in_values<V: IntoExpr>(
        &mut self,
        input: impl IntoExpr,
        values: impl IntoIterator<Item = V>,
    ) -> ExprId {
        self.membership(input, values, true)
    }

    fn membership<V: IntoExpr>(
        &mut self,
        input: impl IntoExpr,
        values: impl IntoIterator<Item = V>,
        negated: bool,
    ) -> ExprId {
        let input = input.into_expr(self);
        let values = values
            .into_iter()
            .map(|value| value.into_expr(self))
            .collect();
        self.push(ExprKind::In {
            input,
            values,
            negated,
        })
    }

    pub fn global(&mut self, op: AggregateOp, input: impl IntoExpr) -> ExprId {
        let input = input.into_expr(self);
        self.push(ExprKind::GlobalAggregate {
            op,
            input,
            value: f64::NAN,
        })
    }

    pub fn viewport(&mut self, op: AggregateOp, input: impl IntoExpr) -> ExprId {
        let input = input.into_expr(self);
        self.push(ExprKind::ViewportAggregate {
            op,
            input,
            accumulator: ViewportAccumulator::default(),
            value: f64::NAN,
        })
    }

    pub fn blend(&mut self, from: impl IntoExpr, to: impl IntoExpr, mix: impl IntoExpr) -> ExprId {
        let from = from.into_expr(self);
        let to = to.into_expr(self);
        let mix = mix.into_expr(self);
        self.push(ExprKind::Blend {
            from,
            to,
            mix,
            discrete: false,
            settled: false,
        })
    }

    /// A `0 → 1` ramp over `duration_ms`, starting now.
    pub fn animate(&mut self, duration_ms: f64) -> ExprId {
        let start_ms = self.clock.now_ms();
        self.push(ExprKind::Animate {
            duration_ms,
            start_ms,
        })
    }

    pub fn ease(&mut self, interpolator: Rc<dyn Interpolator>, input: impl IntoExpr) -> ExprId {
        let input = input.into_expr(self);
        self.push(ExprKind::Ease {
            interpolator,
            input,
        })
    }

    pub fn linear(
        &mut self,
        input: impl IntoExpr,
        min: impl IntoExpr,
        max: impl IntoExpr,
    ) -> ExprId {
        let input = input.into_expr(self);
        let min = min.into_expr(self);
        let max = max.into_expr(self);
        self.push(ExprKind::Linear { input, min, max })
    }

    pub fn ramp(&mut self, input: impl IntoExpr, palette: Vec<Value>) -> ExprId {
        let input = input.into_expr(self);
        self.push(ExprKind::Ramp { input, palette })
    }

    pub fn buckets<V: IntoExpr>(
        &mut self,
        input: impl IntoExpr,
        breakpoints: impl IntoIterator<Item = V>,
    ) -> ExprId {
        let input = input.into_expr(self);
        let breakpoints = breakpoints
            .into_iter()
            .map(|value| value.into_expr(self))
            .collect();
        self.push(ExprKind::Buckets { input, breakpoints })
    }

    pub fn root(&mut self, channel: Channel, input: impl IntoExpr) -> ExprId {
        let input = input.into_expr(self);
        self.push(ExprKind::Root { channel, input })
    }
}

/// Anything that can become a node: existing ids and plain literals.
pub trait IntoExpr {
    fn into_expr(self, arena: &mut ExprArena) -> ExprId;
}

impl IntoExpr for ExprId {
    fn into_expr(self, _arena: &mut ExprArena) -> ExprId {
        self
    }
}

impl IntoExpr for f64 {
    fn into_expr(self, arena: &mut ExprArena) -> ExprId {
        arena.number(self)
    }
}

impl IntoExpr for i32 {
    fn into_expr(self, arena: &mut ExprArena) -> ExprId {
        arena.number(f64::from(self))
    }
}

impl IntoExpr for bool {
    fn into_expr(self, arena: &mut ExprArena) -> ExprId {
        arena.constant(Value::bool(self))
    }
}

impl IntoExpr for &str {
    fn into_expr(self, arena: &mut ExprArena) -> ExprId {
        arena.category(self)
    }
}

impl IntoExpr for Color {
    fn into_expr(self, arena: &mut ExprArena) -> ExprId {
        arena.color(self)
    }
}

impl IntoExpr for Value {
    fn into_expr(self, arena: &mut ExprArena) -> ExprId {
        arena.constant(self)
    }
}

#[cfg(test)]
mod tests {
    use super::{AggregateOp, Channel, ExprArena, ExprKind};

    #[test]
    fn builders_adopt_children_and_record_parents() {
        let mut arena = ExprArena::new();
        let price = arena.property("price");
        let filter = arena.between(price, 10, 20);
        let root = arena.root(Channel::Filter, filter);

        assert_eq!(arena.node(price).parent(), Some(filter));
        assert_eq!(arena.node(filter).parent(), Some(root));
        assert_eq!(arena.children(filter).len(), 3);
        assert_eq!(arena.descendants(root).len(), 5);
        assert!(!arena.is_compiled(root));
    }

    #[test]
    fn import_copies_subtrees_into_fresh_ids() {
        let mut source = ExprArena::new();
        let a = source.property("a");
        let b = source.property("b");
        let sum = source.add(a, b);

        let mut target = ExprArena::new();
        target.number(1.0);
        let copied = target.import(&source, sum);

        assert_ne!(source.id(), target.id());
        assert_eq!(target.len(), 4);
        assert_eq!(
            target.property_names(copied).into_iter().collect::<Vec<_>>(),
            vec!["a".to_owned(), "b".to_owned()]
        );
        assert!(matches!(target.kind(copied), ExprKind::Binary { .. }));
    }

    #[test]
    fn replace_child_rewires_parent_links() {
        let mut arena = ExprArena::new();
        let one = arena.number(1.0);
        let root = arena.root(Channel::Width, one);
        let two = arena.number(2.0);
        arena.replace_child(root, one, two);

        assert_eq!(arena.children(root), vec![two]);
        assert_eq!(arena.node(two).parent(), Some(root));
        assert_eq!(arena.node(one).parent(), None);
    }

    #[test]
    fn channels_and_aggregate_ops_serialize_by_name() {
        let json = serde_json::to_string(&Channel::StrokeWidth).expect("json");
        assert_eq!(json, r#""strokeWidth""#);
        let op = serde_json::to_string(&AggregateOp::Percentile(30.0)).expect("json");
        assert_eq!(op, r#"{"op":"percentile","rank":30.0}"#);
        let back: AggregateOp = serde_json::from_str(r#"{"op":"max"}"#).expect("parse");
        assert_eq!(back, AggregateOp::Max);
    }

    #[test]
    fn ids_from_another_arena_are_not_found() {
        let mut big = ExprArena::new();
        big.number(1.0);
        let foreign = big.number(2.0);
        let small = ExprArena::new();
        assert!(small.get(foreign).is_none());
        assert!(!small.contains(foreign));
        assert!(big.get(foreign).is_some());
    }

    #[test]
    fn channel_names_round_trip() {
        for channel in Channel::ALL {
            assert_eq!(Channel::from_name(channel.name()), Some(channel));
        }
        assert_eq!(Channel::from_name("symbol"), None);
    }
}
