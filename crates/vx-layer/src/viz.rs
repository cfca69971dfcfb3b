use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::sync::Arc;

use vx_expr::{
    Channel, CompileError, EvalError, ExprArena, ExprId, ExprKind, Interpolator, ParseError,
    ParsedViz, parse_viz_in,
};
use vx_filter::{FilterPredicate, translate_filter};
use vx_metadata::{GeomType, Metadata};
use vx_types::{Color, Value};

use crate::ValidationError;

/// A set of channel expressions drawn together.
///
/// `Viz` is a shared handle: clones refer to the same trees. A viz can be bound to at most
/// one layer. Every channel always has a root; channels the user left out get generic
/// defaults, which are swapped for geometry-specific ones the first time the geometry type is
/// known.
#[derive(Debug, Clone)]
pub struct Viz {
    inner: Rc<VizInner>,
}

#[derive(Debug)]
struct VizInner {
    state: RefCell<VizState>,
    bound_layer: Cell<Option<u64>>,
}

#[derive(Debug, Clone)]
pub(crate) struct VizState {
    pub(crate) arena: ExprArena,
    roots: BTreeMap<Channel, ExprId>,
    variables: BTreeMap<String, ExprId>,
    defaulted: BTreeSet<Channel>,
    geom_defaults: Option<GeomType>,
    images: Vec<String>,
}

impl Default for Viz {
    fn default() -> Self {
        Self::from_state(ExprArena::new(), BTreeMap::new(), BTreeMap::new())
    }
}

impl Viz {
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        Self::parse_in(ExprArena::new(), input)
    }

    /// Parses into an existing (typically clock-configured) arena.
    pub fn parse_in(arena: ExprArena, input: &str) -> Result<Self, ParseError> {
        parse_viz_in(arena, input).map(Self::from_parsed)
    }

    #[must_use]
    pub fn from_parsed(parsed: ParsedViz) -> Self {
        Self::from_state(parsed.arena, parsed.roots, parsed.variables)
    }

    /// Builds a viz from ids in `arena`. Ids that are not roots are wrapped in one.
    pub fn from_roots(
        mut arena: ExprArena,
        roots: impl IntoIterator<Item = (Channel, ExprId)>,
    ) -> Result<Self, ValidationError> {
        let mut by_channel = BTreeMap::new();
        for (channel, id) in roots {
            let Some(node) = arena.get(id) else {
                return Err(ValidationError::IncorrectValue(format!(
                    "expression {id} given for channel '{}' does not belong to the arena",
                    channel.name()
                )));
            };
            let root = match node.kind() {
                ExprKind::Root { channel: found, .. } if *found == channel => id,
                ExprKind::Root { channel: found, .. } => {
                    return Err(ValidationError::IncorrectType(format!(
                        "'{}' root given for channel '{}'",
                        found.name(),
                        channel.name()
                    )));
                }
                _ => arena.root(channel, id),
            };
            if by_channel.insert(channel, root).is_some() {
                return Err(ValidationError::IncorrectValue(format!(
                    "channel '{}' given twice",
                    channel.name()
                )));
            }
        }
        Ok(Self::from_state(arena, by_channel, BTreeMap::new()))
    }

    fn from_state(
        mut arena: ExprArena,
        mut roots: BTreeMap<Channel, ExprId>,
        variables: BTreeMap<String, ExprId>,
    ) -> Self {
        let mut defaulted = BTreeSet::new();
        for channel in Channel::ALL {
            if !roots.contains_key(&channel) {
                let value = generic_default(channel);
                let input = arena.constant(value);
                roots.insert(channel, arena.root(channel, input));
                defaulted.insert(channel);
            }
        }
        Self {
            inner: Rc::new(VizInner {
                state: RefCell::new(VizState {
                    arena,
                    roots,
                    variables,
                    defaulted,
                    geom_defaults: None,
                    images: Vec::new(),
                }),
                bound_layer: Cell::new(None),
            }),
        }
    }

    /// Image URLs to load before the viz can be drawn.
    #[must_use]
    pub fn with_images(self, urls: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.inner
            .state
            .borrow_mut()
            .images
            .extend(urls.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn image_urls(&self) -> Vec<String> {
        self.inner.state.borrow().images.clone()
    }

    #[must_use]
    pub fn root(&self, channel: Channel) -> Option<ExprId> {
        self.inner.state.borrow().roots.get(&channel).copied()
    }

    /// Roots in channel order.
    #[must_use]
    pub fn roots(&self) -> Vec<(Channel, ExprId)> {
        self.inner.state.borrow().roots_vec()
    }

    #[must_use]
    pub fn variables(&self) -> BTreeMap<String, ExprId> {
        self.inner.state.borrow().variables.clone()
    }

    /// True while the channel still holds a default the user never set.
    #[must_use]
    pub fn is_default(&self, channel: Channel) -> bool {
        self.inner.state.borrow().defaulted.contains(&channel)
    }

    /// Every property read by any channel.
    #[must_use]
    pub fn property_names(&self) -> BTreeSet<String> {
        let state = self.inner.state.borrow();
        state
            .roots
            .values()
            .flat_map(|root| state.arena.property_names(*root))
            .collect()
    }

    /// The part of the filter a data source can apply itself.
    #[must_use]
    pub fn filter_predicate(&self) -> Option<FilterPredicate> {
        let state = self.inner.state.borrow();
        let filter = state.roots.get(&Channel::Filter)?;
        translate_filter(&state.arena, *filter)
    }

    #[must_use]
    pub fn is_animated(&self) -> bool {
        let state = self.inner.state.borrow();
        state
            .roots
            .values()
            .any(|root| state.arena.is_animated(*root))
    }

    /// Feature-independent value of a channel, for legends.
    pub fn evaluate(&self, channel: Channel) -> Result<Option<Value>, EvalError> {
        let state = self.inner.state.borrow();
        state
            .roots
            .get(&channel)
            .map(|root| state.arena.evaluate(*root))
            .transpose()
    }

    pub fn with_arena<R>(&self, f: impl FnOnce(&ExprArena) -> R) -> R {
        f(&self.inner.state.borrow().arena)
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Replaces still-defaulted channels with defaults for `geom_type`. Only the first call
    /// has an effect.
    pub fn set_defaults_if_required(&self, geom_type: GeomType) -> Result<(), CompileError> {
        self.inner
            .state
            .borrow_mut()
            .set_defaults_if_required(geom_type)
    }

    /// Applies geometry defaults and compiles against `metadata` on a copy of the trees. The
    /// viz itself is unchanged until the copy is [installed](Self::install).
    pub(crate) fn prepare(
        &self,
        geom_type: GeomType,
        metadata: &Arc<Metadata>,
    ) -> Result<VizState, CompileError> {
        let mut staged = self.inner.state.borrow().clone();
        staged.set_defaults_if_required(geom_type)?;
        staged.compile(metadata)?;
        Ok(staged)
    }

    pub(crate) fn install(&self, staged: VizState) {
        *self.inner.state.borrow_mut() = staged;
    }

    pub(crate) fn bound_layer(&self) -> Option<u64> {
        self.inner.bound_layer.get()
    }

    pub(crate) fn bind(&self, layer: u64) {
        self.inner.bound_layer.set(Some(layer));
    }

    pub(crate) fn unbind(&self) {
        self.inner.bound_layer.set(None);
    }

    pub(crate) fn with_state_mut<R>(&self, f: impl FnOnce(&mut VizState) -> R) -> R {
        f(&mut self.inner.state.borrow_mut())
    }

    /// Starts a transition from `old` on every channel both vizzes share and adopts `old`'s
    /// variables.
    pub(crate) fn blend_from(
        &self,
        old: &Self,
        duration_ms: f64,
        interpolator: &Rc<dyn Interpolator>,
    ) {
        if self.ptr_eq(old) {
            return;
        }
        let old = old.inner.state.borrow();
        let mut state = self.inner.state.borrow_mut();
        for (name, id) in &old.variables {
            let imported = state.arena.import(&old.arena, *id);
            state.variables.insert(name.clone(), imported);
        }
        for (channel, root) in state.roots_vec() {
            if let Some(old_root) = old.roots.get(&channel) {
                state.arena.blend_root_from(
                    root,
                    &old.arena,
                    *old_root,
                    duration_ms,
                    Rc::clone(interpolator),
                );
            }
        }
    }
}

impl VizState {
    pub(crate) fn roots_vec(&self) -> Vec<(Channel, ExprId)> {
        self.roots.iter().map(|(c, id)| (*c, *id)).collect()
    }

    fn compile(&mut self, metadata: &Arc<Metadata>) -> Result<(), CompileError> {
        for (_, root) in self.roots_vec() {
            self.arena.compile(root, metadata)?;
        }
        Ok(())
    }

    pub(crate) fn set_defaults_if_required(
        &mut self,
        geom_type: GeomType,
    ) -> Result<(), CompileError> {
        if self.geom_defaults.is_some() {
            return Ok(());
        }
        self.geom_defaults = Some(geom_type);
        let metadata = self.arena.metadata().cloned();
        for channel in self.defaulted.clone() {
            let Some(value) = geom_default(geom_type, channel) else {
                continue;
            };
            let input = self.arena.constant(value);
            let root = self.arena.root(channel, input);
            if let Some(metadata) = &metadata {
                self.arena.compile(root, metadata)?;
            }
            self.roots.insert(channel, root);
        }
        Ok(())
    }
}

fn generic_default(channel: Channel) -> Value {
    match channel {
        Channel::Color | Channel::StrokeColor => Value::Color(Color::from_rgba8(0.0, 0.0, 0.0, 1.0)),
        Channel::Width => Value::Number(1.0),
        Channel::StrokeWidth => Value::Number(0.0),
        Channel::Filter => Value::bool(true),
    }
}

fn geom_default(geom_type: GeomType, channel: Channel) -> Option<Value> {
    let rgb = |r, g, b| Some(Value::Color(Color::from_rgba8(r, g, b, 1.0)));
    match (geom_type, channel) {
        (GeomType::Point, Channel::Color) => rgb(238.0, 77.0, 90.0),
        (GeomType::Point, Channel::Width) => Some(Value::Number(7.0)),
        (GeomType::Point, Channel::StrokeColor) => rgb(34.0, 34.0, 34.0),
        (GeomType::Point, Channel::StrokeWidth) => Some(Value::Number(1.0)),
        (GeomType::Line, Channel::Color) => rgb(76.0, 200.0, 163.0),
        (GeomType::Line, Channel::Width) => Some(Value::Number(1.5)),
        (GeomType::Polygon, Channel::Color) => rgb(130.0, 109.0, 186.0),
        (GeomType::Polygon, Channel::StrokeColor) => rgb(255.0, 255.0, 255.0),
        (GeomType::Polygon, Channel::StrokeWidth) => Some(Value::Number(1.0)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use vx_expr::{Channel, ExprArena};
    use vx_metadata::{ColumnStats, GeomType, Metadata};
    use vx_types::{Color, Value};

    use super::Viz;
    use crate::ValidationError;

    fn metadata() -> Arc<Metadata> {
        Arc::new(
            Metadata::new(
                vec![ColumnStats::numeric("price", 0.0, 100.0, 50.0, 500.0, 10.0)],
                Vec::new(),
            )
            .expect("metadata"),
        )
    }

    fn compile(viz: &Viz) {
        viz.with_state_mut(|state| state.compile(&metadata()))
            .expect("compile");
    }

    #[test]
    fn missing_channels_get_generic_defaults() {
        let viz = Viz::parse("width: 3").expect("parse");
        compile(&viz);
        assert_eq!(viz.roots().len(), Channel::ALL.len());
        assert!(!viz.is_default(Channel::Width));
        assert!(viz.is_default(Channel::Color));
        assert_eq!(
            viz.evaluate(Channel::Width).expect("eval"),
            Some(Value::Number(3.0))
        );
        assert_eq!(
            viz.evaluate(Channel::Filter).expect("eval"),
            Some(Value::Number(1.0))
        );
    }

    #[test]
    fn geometry_defaults_apply_once_and_spare_user_channels() {
        let viz = Viz::parse("width: 3").expect("parse");
        compile(&viz);
        viz.set_defaults_if_required(GeomType::Line)
            .expect("defaults");
        assert_eq!(
            viz.evaluate(Channel::Color).expect("eval"),
            Some(Value::Color(Color::from_rgba8(76.0, 200.0, 163.0, 1.0)))
        );
        assert_eq!(
            viz.evaluate(Channel::Width).expect("eval"),
            Some(Value::Number(3.0))
        );

        viz.set_defaults_if_required(GeomType::Point)
            .expect("defaults");
        assert_eq!(
            viz.evaluate(Channel::Color).expect("eval"),
            Some(Value::Color(Color::from_rgba8(76.0, 200.0, 163.0, 1.0)))
        );
    }

    #[test]
    fn from_roots_wraps_inputs_and_rejects_foreign_roots() {
        let mut arena = ExprArena::new();
        let width = arena.number(4.0);
        let viz = Viz::from_roots(arena, [(Channel::Width, width)]).expect("viz");
        compile(&viz);
        assert_eq!(
            viz.evaluate(Channel::Width).expect("eval"),
            Some(Value::Number(4.0))
        );

        let mut arena = ExprArena::new();
        let width = arena.number(4.0);
        let root = arena.root(Channel::Width, width);
        assert!(matches!(
            Viz::from_roots(arena, [(Channel::StrokeWidth, root)]),
            Err(ValidationError::IncorrectType(_))
        ));

        let mut other = ExprArena::new();
        other.number(1.0);
        let foreign = other.number(2.0);
        assert!(matches!(
            Viz::from_roots(ExprArena::new(), [(Channel::Width, foreign)]),
            Err(ValidationError::IncorrectValue(_))
        ));
    }

    #[test]
    fn property_names_and_pushdown_come_from_all_channels() {
        let viz = Viz::parse("width: $size\nfilter: $price > 10").expect("parse");
        let names: Vec<_> = viz.property_names().into_iter().collect();
        assert_eq!(names, ["price", "size"]);
        let predicate = viz.filter_predicate().expect("pushable");
        assert_eq!(predicate.to_sql(), "price > 10");
    }
}
