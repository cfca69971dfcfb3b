use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::executor::block_on;
use futures::future::{self, FutureExt, LocalBoxFuture};
use glam::Mat4;
use vx_expr::{Channel, CompileError, ExprArena, Linear};
use vx_filter::render_where;
use vx_layer::{
    DataSource, FeatureSink, HostError, HostMap, Layer, LayerError, LayerEvent, LayerState,
    SourceError, ValidationError, Viewport, Viz,
};
use vx_metadata::{ColumnStats, Feature, FeatureBatch, GeomType, Metadata};
use vx_runtime::{EngineConfig, ManualClock};
use vx_shader::{GlCall, GlContext, ProgramHandle, RecordingGl};
use vx_types::Value;

// ── doubles ──────────────────────────────────────────────────────────────

type MetadataReply = oneshot::Sender<Result<Arc<Metadata>, SourceError>>;

struct MockSource {
    metadata: Arc<Metadata>,
    deferred: bool,
    pending: RefCell<Vec<Option<MetadataReply>>>,
    freed: Cell<u32>,
    sink: RefCell<Option<FeatureSink>>,
    data_requests: RefCell<Vec<(f64, Viewport)>>,
    needs_new_metadata: Cell<bool>,
    filters: RefCell<Vec<String>>,
}

impl MockSource {
    fn immediate() -> Rc<Self> {
        Rc::new(Self::with(false))
    }

    fn deferred() -> Rc<Self> {
        Rc::new(Self::with(true))
    }

    /// An immediate source answering with `metadata`.
    fn serving(metadata: Metadata) -> Rc<Self> {
        Rc::new(Self {
            metadata: Arc::new(metadata),
            ..Self::with(false)
        })
    }

    fn with(deferred: bool) -> Self {
        Self {
            metadata: metadata(),
            deferred,
            pending: RefCell::new(Vec::new()),
            freed: Cell::new(0),
            sink: RefCell::new(None),
            data_requests: RefCell::new(Vec::new()),
            needs_new_metadata: Cell::new(false),
            filters: RefCell::new(Vec::new()),
        }
    }

    /// Answers the `index`-th metadata request.
    fn reply(&self, index: usize) {
        let tx = self.pending.borrow_mut()[index]
            .take()
            .expect("request is pending");
        tx.send(Ok(Arc::clone(&self.metadata)))
            .expect("receiver alive");
    }

    fn push(&self, features: Vec<Feature>) {
        let sink = self.sink.borrow().clone().expect("layer bound");
        sink.on_batch_added(FeatureBatch::new(GeomType::Point, features));
        sink.on_data_loaded();
    }
}

impl DataSource for MockSource {
    fn request_metadata(
        &self,
        viz: &Viz,
    ) -> LocalBoxFuture<'static, Result<Arc<Metadata>, SourceError>> {
        self.filters
            .borrow_mut()
            .push(render_where(viz.filter_predicate().as_ref()));
        if !self.deferred {
            return future::ready(Ok(Arc::clone(&self.metadata))).boxed_local();
        }
        let (tx, rx) = oneshot::channel();
        self.pending.borrow_mut().push(Some(tx));
        async move {
            rx.await
                .unwrap_or_else(|_| Err(SourceError::Request("dropped".to_owned())))
        }
        .boxed_local()
    }

    fn request_data(&self, zoom: f64, viewport: Viewport) {
        self.data_requests.borrow_mut().push((zoom, viewport));
    }

    fn bind_layer(&self, sink: FeatureSink) {
        *self.sink.borrow_mut() = Some(sink);
    }

    fn requires_new_metadata(&self, _viz: &Viz) -> bool {
        self.needs_new_metadata.get()
    }

    fn free(&self) {
        self.freed.set(self.freed.get() + 1);
    }
}

#[derive(Default)]
struct MockHost {
    style_loaded: Cell<bool>,
    fail_with: RefCell<Option<String>>,
    added: RefCell<Vec<(String, Option<String>)>>,
    removed: RefCell<Vec<String>>,
    load_callbacks: RefCell<Vec<Box<dyn FnOnce()>>>,
    repaints: Cell<u32>,
    visibility: RefCell<Vec<(String, bool)>>,
}

impl MockHost {
    fn loaded() -> Rc<Self> {
        let host = Self::default();
        host.style_loaded.set(true);
        Rc::new(host)
    }

    fn finish_loading(&self) {
        self.style_loaded.set(true);
        let callbacks = std::mem::take(&mut *self.load_callbacks.borrow_mut());
        for callback in callbacks {
            callback();
        }
    }
}

impl HostMap for MockHost {
    fn add_layer(&self, layer_id: &str, before: Option<&str>) -> Result<(), HostError> {
        if let Some(message) = self.fail_with.borrow().clone() {
            return Err(HostError::Other(message));
        }
        if !self.style_loaded.get() {
            return Err(HostError::StyleNotLoaded);
        }
        self.added
            .borrow_mut()
            .push((layer_id.to_owned(), before.map(str::to_owned)));
        Ok(())
    }

    fn remove_layer(&self, layer_id: &str) {
        self.removed.borrow_mut().push(layer_id.to_owned());
    }

    fn on_load(&self, callback: Box<dyn FnOnce()>) {
        self.load_callbacks.borrow_mut().push(callback);
    }

    fn trigger_repaint(&self) {
        self.repaints.set(self.repaints.get() + 1);
    }

    fn zoom(&self) -> f64 {
        4.0
    }

    fn set_visibility(&self, layer_id: &str, visible: bool) {
        self.visibility
            .borrow_mut()
            .push((layer_id.to_owned(), visible));
    }
}

fn metadata() -> Arc<Metadata> {
    Arc::new(
        Metadata::new(
            vec![
                ColumnStats::numeric("price", 0.0, 10.0, 5.0, 50.0, 10.0),
                ColumnStats::categorical("kind", &["red", "blue"]),
            ],
            Vec::new(),
        )
        .expect("metadata"),
    )
}

fn viz(input: &str) -> Viz {
    Viz::parse(input).expect("viz parses")
}

struct Harness {
    layer: Layer,
    source: Rc<MockSource>,
    host: Rc<MockHost>,
    gl: Rc<RefCell<RecordingGl>>,
}

/// A layer attached to a loaded host with its initial update committed.
fn attached(initial_viz: Viz) -> Harness {
    let source = MockSource::immediate();
    let (layer, initial) = Layer::new("layer", source.clone(), initial_viz).expect("valid layer");
    let host = MockHost::loaded();
    let gl = Rc::new(RefCell::new(RecordingGl::new()));
    layer.on_attach(host.clone(), gl.clone());
    block_on(initial).expect("initial update");
    Harness {
        layer,
        source,
        host,
        gl,
    }
}

fn same_source(layer: &Layer, source: &Rc<MockSource>) -> bool {
    let expected: Rc<dyn DataSource> = source.clone();
    layer
        .source()
        .is_some_and(|current| Rc::ptr_eq(&current, &expected))
}

fn last_uniform_value(gl: &RecordingGl) -> Option<f32> {
    gl.calls.iter().rev().find_map(|call| match call {
        GlCall::Uniform1f { value, .. } => Some(*value),
        _ => None,
    })
}

// ── update orchestration ────────────────────────────────────────────────

#[test]
fn initial_update_waits_for_the_host_context() {
    let source = MockSource::immediate();
    let (layer, initial) = Layer::new("layer", source.clone(), viz("width: 2")).expect("valid");
    let mut initial = initial;
    assert!((&mut initial).now_or_never().is_none());
    assert!(layer.viz().is_none());

    let gl: Rc<RefCell<dyn GlContext>> = Rc::new(RefCell::new(RecordingGl::new()));
    layer.on_attach(MockHost::loaded(), gl);
    block_on(initial).expect("commits once attached");
    assert!(same_source(&layer, &source));
    assert!(layer.metadata().is_some());
}

#[test]
fn newest_update_wins_even_when_an_older_reply_arrives_first() {
    let h = attached(viz("width: 1"));
    let (source_a, source_b) = (MockSource::deferred(), MockSource::deferred());
    let viz_a = viz("width: 2");
    let viz_b = viz("width: 3");

    let update_a = h.layer.update(source_a.clone(), viz_a).expect("valid");
    let update_b = h.layer.update(source_b.clone(), viz_b.clone()).expect("valid");

    source_a.reply(0);
    assert_eq!(block_on(update_a), Err(LayerError::Stale));
    assert!(same_source(&h.layer, &h.source));

    source_b.reply(0);
    block_on(update_b).expect("newest update commits");
    assert!(same_source(&h.layer, &source_b));
    assert!(h.layer.viz().expect("committed").ptr_eq(&viz_b));
    assert_eq!(h.source.freed.get(), 1);
    assert_eq!(source_a.freed.get(), 0);
}

#[test]
fn stale_update_cannot_overwrite_a_newer_commit() {
    let h = attached(viz("width: 1"));
    let (source_a, source_b) = (MockSource::deferred(), MockSource::deferred());
    let update_a = h.layer.update(source_a.clone(), viz("width: 2")).expect("valid");
    let update_b = h.layer.update(source_b.clone(), viz("width: 3")).expect("valid");

    source_b.reply(0);
    block_on(update_b).expect("commits");
    source_a.reply(0);
    assert_eq!(block_on(update_a), Err(LayerError::Stale));
    assert!(same_source(&h.layer, &source_b));
    assert_eq!(
        h.layer
            .viz()
            .expect("committed")
            .evaluate(Channel::Width)
            .expect("eval"),
        Some(Value::Number(3.0))
    );
}

#[test]
fn compile_errors_preserve_the_committed_state() {
    let h = attached(viz("width: 1"));
    let committed = h.layer.viz().expect("committed");
    let err = block_on(
        h.layer
            .update(h.source.clone(), viz("width: $missing"))
            .expect("valid"),
    )
    .expect_err("must fail");
    assert_eq!(
        err,
        LayerError::Compile(CompileError::UnknownProperty {
            name: "missing".to_owned()
        })
    );
    assert!(h.layer.viz().expect("still committed").ptr_eq(&committed));
    assert_eq!(h.source.freed.get(), 0);
}

#[test]
fn compile_errors_leave_a_recommitted_viz_untouched() {
    let h = attached(viz("width: globalMax($price)\nfilter: $kind == 'red'"));
    let committed = h.layer.viz().expect("committed");
    let committed_metadata = h.layer.metadata().expect("committed metadata");
    let other = MockSource::serving(
        Metadata::new(
            vec![ColumnStats::numeric("price", 0.0, 999.0, 1.0, 999.0, 3.0)],
            Vec::new(),
        )
        .expect("metadata"),
    );

    let err = block_on(h.layer.update(other.clone(), committed.clone()).expect("valid"))
        .expect_err("kind is unknown to the new source");
    assert_eq!(
        err,
        LayerError::Compile(CompileError::UnknownProperty {
            name: "kind".to_owned()
        })
    );
    assert_eq!(
        committed.evaluate(Channel::Width).expect("eval"),
        Some(Value::Number(10.0))
    );
    assert!(same_source(&h.layer, &h.source));
    assert!(Arc::ptr_eq(
        &h.layer.metadata().expect("still committed"),
        &committed_metadata
    ));
    assert_eq!((h.source.freed.get(), other.freed.get()), (0, 0));
}

#[test]
fn reupdating_the_same_source_does_not_free_it() {
    let h = attached(viz("width: 1"));
    block_on(h.layer.update(h.source.clone(), viz("width: 2")).expect("valid")).expect("commits");
    assert_eq!(h.source.freed.get(), 0);
}

#[test]
fn source_receives_the_pushed_down_filter() {
    let h = attached(viz("filter: $price > 10 and $price < now()"));
    assert_eq!(
        h.source.filters.borrow().last().map(String::as_str),
        Some("WHERE (price > 10)")
    );
}

#[test]
fn validation_rejects_empty_ids_and_shared_vizzes() {
    let source = MockSource::immediate();
    assert!(matches!(
        Layer::new("", source.clone(), viz("width: 1")),
        Err(LayerError::Validation(ValidationError::IncorrectValue(_)))
    ));

    let shared = viz("width: 1");
    let (_first, _pending) = Layer::new("first", source.clone(), shared.clone()).expect("valid");
    assert!(matches!(
        Layer::new("second", source, shared),
        Err(LayerError::Validation(ValidationError::IncorrectValue(_)))
    ));
}

// ── blending ─────────────────────────────────────────────────────────────

#[test]
fn blend_to_viz_interpolates_from_the_committed_viz() {
    let clock = Rc::new(ManualClock::new(0.0));
    let in_clock = |input: &str| {
        Viz::parse_in(ExprArena::with_clock(clock.clone()), input).expect("viz parses")
    };
    let h = attached(in_clock("width: 10"));
    let target = in_clock("width: 20");

    block_on(
        h.layer
            .blend_to_viz(target.clone(), 100.0, Rc::new(Linear))
            .expect("valid"),
    )
    .expect("commits");
    assert!(h.layer.viz().expect("committed").ptr_eq(&target));
    assert!(h.layer.is_animated());

    clock.set(50.0);
    assert_eq!(
        target.evaluate(Channel::Width).expect("eval"),
        Some(Value::Number(15.0))
    );
    clock.set(150.0);
    assert_eq!(
        target.evaluate(Channel::Width).expect("eval"),
        Some(Value::Number(20.0))
    );
    assert!(!h.layer.is_animated());
}

#[test]
fn blend_falls_back_to_update_when_new_metadata_is_needed() {
    let clock = Rc::new(ManualClock::new(0.0));
    let h = attached(viz("width: 10"));
    h.source.needs_new_metadata.set(true);
    let target =
        Viz::parse_in(ExprArena::with_clock(clock), "width: 20").expect("viz parses");
    block_on(
        h.layer
            .blend_to_viz(target.clone(), 100.0, Rc::new(Linear))
            .expect("valid"),
    )
    .expect("commits");
    assert_eq!(
        target.evaluate(Channel::Width).expect("eval"),
        Some(Value::Number(20.0))
    );
    assert!(!h.layer.is_animated());
}

#[test]
fn blend_requires_a_committed_source() {
    let (layer, _pending) =
        Layer::new("layer", MockSource::immediate(), viz("width: 1")).expect("valid");
    assert_eq!(
        layer
            .blend_to_viz(viz("width: 2"), 100.0, Rc::new(Linear))
            .err(),
        Some(LayerError::Validation(ValidationError::MissingRequired(
            "source"
        )))
    );
}

#[test]
fn blend_to_uses_the_configured_duration() {
    let clock = Rc::new(ManualClock::new(0.0));
    let in_clock = |input: &str| {
        Viz::parse_in(ExprArena::with_clock(clock.clone()), input).expect("viz parses")
    };
    let source = MockSource::immediate();
    let (layer, initial) = Layer::with_config(
        "layer",
        source,
        in_clock("width: 0"),
        EngineConfig::default().with_default_blend_ms(200.0),
    )
    .expect("valid layer");
    layer.on_attach(
        MockHost::loaded(),
        Rc::new(RefCell::new(RecordingGl::new())),
    );
    block_on(initial).expect("initial update");

    let target = in_clock("width: 100");
    block_on(layer.blend_to(target.clone()).expect("valid")).expect("commits");
    assert!(layer.is_animated());

    clock.set(50.0);
    assert_eq!(
        target.evaluate(Channel::Width).expect("eval"),
        Some(Value::Number(6.25))
    );
    clock.set(250.0);
    assert_eq!(
        target.evaluate(Channel::Width).expect("eval"),
        Some(Value::Number(100.0))
    );
    assert!(!layer.is_animated());
}

#[test]
fn blend_supersedes_an_earlier_pending_update() {
    let h = attached(viz("width: 1"));
    let deferred = MockSource::deferred();
    let update = h.layer.update(deferred.clone(), viz("width: 3")).expect("valid");
    let target = viz("width: 2");
    block_on(
        h.layer
            .blend_to_viz(target.clone(), 100.0, Rc::new(Linear))
            .expect("valid"),
    )
    .expect("blend commits");

    deferred.reply(0);
    assert_eq!(block_on(update), Err(LayerError::Stale));
    assert!(h.layer.viz().expect("committed").ptr_eq(&target));
    assert!(same_source(&h.layer, &h.source));
    assert_eq!(deferred.freed.get(), 0);
}

#[test]
fn later_update_on_the_same_source_supersedes_a_blend() {
    let h = attached(viz("width: 1"));
    let blend = h
        .layer
        .blend_to_viz(viz("width: 2"), 100.0, Rc::new(Linear))
        .expect("valid");
    let newest = viz("width: 3");
    block_on(h.layer.update(h.source.clone(), newest.clone()).expect("valid")).expect("commits");

    assert_eq!(block_on(blend), Err(LayerError::Stale));
    assert!(h.layer.viz().expect("committed").ptr_eq(&newest));
    assert_eq!(
        newest.evaluate(Channel::Width).expect("eval"),
        Some(Value::Number(3.0))
    );
}

#[test]
fn blend_is_stale_when_the_source_changes_meanwhile() {
    let h = attached(viz("width: 1"));
    let blend = h
        .layer
        .blend_to_viz(viz("width: 2"), 100.0, Rc::new(Linear))
        .expect("valid");
    let other = MockSource::immediate();
    block_on(h.layer.update(other.clone(), viz("width: 3")).expect("valid")).expect("commits");
    assert_eq!(block_on(blend), Err(LayerError::Stale));
    assert!(same_source(&h.layer, &other));
}

// ── host integration ─────────────────────────────────────────────────────

#[test]
fn add_to_waits_for_the_style_to_load() {
    let source = MockSource::immediate();
    let (layer, _pending) = Layer::new("layer", source, viz("width: 1")).expect("valid");
    let host = Rc::new(MockHost::default());
    layer.add_to(host.clone(), Some("water")).expect("deferred");
    assert!(host.added.borrow().is_empty());

    host.finish_loading();
    assert_eq!(
        host.added.borrow().as_slice(),
        [("layer".to_owned(), Some("water".to_owned()))]
    );
}

#[test]
fn add_to_surfaces_other_host_errors() {
    let (layer, _pending) =
        Layer::new("layer", MockSource::immediate(), viz("width: 1")).expect("valid");
    let host = MockHost::loaded();
    *host.fail_with.borrow_mut() = Some("no such layer: roads".to_owned());
    match layer.add_to(host, Some("roads")) {
        Err(LayerError::Runtime(message)) => assert!(message.contains("no such layer: roads")),
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn visibility_and_removal_go_through_the_host() {
    let h = attached(viz("width: 1"));
    h.layer.hide();
    assert!(!h.layer.is_visible());
    h.layer.pre_frame(&Mat4::IDENTITY);
    assert!(h.source.data_requests.borrow().is_empty());

    h.layer.show();
    h.layer.pre_frame(&Mat4::IDENTITY);
    let requests = h.source.data_requests.borrow();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, 4.0);
    drop(requests);

    h.layer.remove();
    assert_eq!(
        h.host.visibility.borrow().as_slice(),
        [("layer".to_owned(), false), ("layer".to_owned(), true)]
    );
    assert_eq!(h.host.removed.borrow().as_slice(), ["layer".to_owned()]);
}

// ── frames ───────────────────────────────────────────────────────────────

#[test]
fn frames_fire_loaded_once_and_updated_every_paint() {
    let h = attached(viz("width: 2"));
    let loaded = Rc::new(Cell::new(0));
    let updated = Rc::new(Cell::new(0));
    {
        let loaded = Rc::clone(&loaded);
        h.layer.on(LayerEvent::Loaded, move || loaded.set(loaded.get() + 1));
    }
    let updated_listener = {
        let updated = Rc::clone(&updated);
        h.layer
            .on(LayerEvent::Updated, move || updated.set(updated.get() + 1))
    };

    h.layer.frame(&Mat4::IDENTITY).expect("frame");
    assert_eq!(h.layer.state(), LayerState::Init);
    assert_eq!((loaded.get(), updated.get()), (0, 0));
    assert_eq!(h.gl.borrow().draws(), 0);

    h.source.push(vec![Feature::new().with("price", 1.0)]);
    h.layer.frame(&Mat4::IDENTITY).expect("frame");
    h.layer.frame(&Mat4::IDENTITY).expect("frame");
    assert_eq!(h.layer.state(), LayerState::Loaded);
    assert_eq!((loaded.get(), updated.get()), (1, 2));
    assert_eq!(h.gl.borrow().draws(), 2);
    assert_eq!(h.gl.borrow().links(), 1);
    assert_eq!(h.layer.cached_programs(), 1);

    assert!(h.layer.off(updated_listener));
    h.layer.frame(&Mat4::IDENTITY).expect("frame");
    assert_eq!(updated.get(), 2);
}

#[test]
fn viewport_aggregates_cover_visible_unfiltered_features() {
    let h = attached(viz("width: viewportMax($price)\nfilter: $price < 3"));
    h.source.push(vec![
        Feature::new().with("price", 1.0),
        Feature::new().with("price", 2.0),
        Feature::new().with("price", 5.0),
    ]);
    h.layer.frame(&Mat4::IDENTITY).expect("frame");
    assert_eq!(last_uniform_value(&h.gl.borrow()), Some(2.0));
}

#[test]
fn viewport_count_accepts_categorical_properties() {
    let h = attached(viz("width: viewportCount($kind)"));
    h.source.push(vec![
        Feature::new().with("kind", "red"),
        Feature::new().with("kind", "blue"),
    ]);
    h.layer.frame(&Mat4::IDENTITY).expect("frame");
    assert_eq!(last_uniform_value(&h.gl.borrow()), Some(2.0));
}

#[test]
fn programs_are_relinked_when_metadata_changes() {
    let current = viz("filter: $kind == 'blue'");
    let h = attached(current.clone());
    h.source.push(vec![Feature::new().with("kind", "blue")]);
    h.layer.frame(&Mat4::IDENTITY).expect("frame");
    assert_eq!(h.gl.borrow().links(), 1);

    let reordered = MockSource::serving(
        Metadata::new(
            vec![
                ColumnStats::numeric("price", 0.0, 10.0, 5.0, 50.0, 10.0),
                ColumnStats::categorical("kind", &["blue", "red"]),
            ],
            Vec::new(),
        )
        .expect("metadata"),
    );
    block_on(h.layer.update(reordered.clone(), current).expect("valid")).expect("commits");
    reordered.push(vec![Feature::new().with("kind", "blue")]);
    h.layer.frame(&Mat4::IDENTITY).expect("frame");

    let gl = h.gl.borrow();
    assert_eq!(gl.links(), 2);
    assert_ne!(
        gl.sources(ProgramHandle(1)).expect("first program"),
        gl.sources(ProgramHandle(2)).expect("relinked program")
    );
    assert_eq!(
        gl.calls.iter().rev().find(|call| matches!(call, GlCall::Draw(_))),
        Some(&GlCall::Draw(ProgramHandle(2)))
    );
}

#[test]
fn features_outside_the_viewport_do_not_aggregate() {
    let h = attached(viz("width: viewportMax($price)"));
    h.source.push(vec![
        Feature::new().with("price", 1.0).at(0.0, 0.0),
        Feature::new().with("price", 9.0).at(50.0, 50.0),
    ]);
    h.layer.frame(&Mat4::IDENTITY).expect("frame");
    assert_eq!(last_uniform_value(&h.gl.borrow()), Some(1.0));
}

#[test]
fn animated_vizzes_keep_requesting_repaints() {
    let clock = Rc::new(ManualClock::new(0.0));
    let animated =
        Viz::parse_in(ExprArena::with_clock(clock.clone()), "width: animate(1000) * 10")
            .expect("viz parses");
    let h = attached(animated);
    h.source.push(vec![Feature::new().with("price", 1.0)]);

    let before = h.host.repaints.get();
    h.layer.frame(&Mat4::IDENTITY).expect("frame");
    assert_eq!(h.host.repaints.get(), before + 1);

    clock.set(2000.0);
    h.layer.frame(&Mat4::IDENTITY).expect("frame");
    assert_eq!(h.host.repaints.get(), before + 1);
}

#[test]
fn switching_sources_drops_delivered_features() {
    let h = attached(viz("width: 1"));
    h.source.push(vec![Feature::new().with("price", 1.0)]);
    assert_eq!(h.layer.num_features(), 1);
    let other = MockSource::immediate();
    block_on(h.layer.update(other, viz("width: 1")).expect("valid")).expect("commits");
    assert_eq!(h.layer.num_features(), 0);
}
