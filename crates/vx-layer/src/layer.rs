use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::channel::oneshot;
use futures::future::{FutureExt, LocalBoxFuture, Shared};
use glam::Mat4;
use vx_expr::{Channel, Cubic, Interpolator};
use vx_metadata::Metadata;
use vx_runtime::EngineConfig;
use vx_shader::{GlContext, ProgramCache, ShaderTemplate, point_template};

use crate::host::{HostError, HostMap};
use crate::source::{DataSource, FeatureSink, FeatureStore, ImageLoader, NoImages, Viewport};
use crate::viz::{Viz, VizState};
use crate::{LayerError, ValidationError};

static NEXT_LAYER_UID: AtomicU64 = AtomicU64::new(1);

/// Future returned by [`Layer::update`] and [`Layer::blend_to_viz`].
pub type PendingUpdate = LocalBoxFuture<'static, Result<(), LayerError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    /// No frame with features has been drawn yet.
    Init,
    Loaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerEvent {
    /// First frame drawn with features. Fired once.
    Loaded,
    /// Every painted frame.
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(usize);

struct Committed {
    source: Rc<dyn DataSource>,
    viz: Viz,
    metadata: Arc<Metadata>,
}

struct LayerInner {
    id: String,
    uid: u64,
    state: Cell<LayerState>,
    visible: Cell<bool>,
    generation: Cell<u64>,
    committed: RefCell<Option<Committed>>,
    images: RefCell<Rc<dyn ImageLoader>>,
    host: Rc<RefCell<Option<Rc<dyn HostMap>>>>,
    gl: RefCell<Option<Rc<RefCell<dyn GlContext>>>>,
    context_tx: RefCell<Option<oneshot::Sender<()>>>,
    context: Shared<oneshot::Receiver<()>>,
    features: Rc<RefCell<FeatureStore>>,
    programs: RefCell<ProgramCache>,
    template: RefCell<ShaderTemplate>,
    config: EngineConfig,
    listeners: RefCell<Vec<(ListenerId, LayerEvent, Rc<dyn Fn()>)>>,
    next_listener: Cell<usize>,
}

/// A rendering unit: one committed (source, viz, metadata) triple drawn by a host map.
///
/// `Layer` is a cheap handle; clones share state. Updates are linearized by a generation
/// counter: an update that finishes after a newer one was issued fails with
/// [`LayerError::Stale`] and commits nothing.
#[derive(Clone)]
pub struct Layer {
    inner: Rc<LayerInner>,
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.get())
            .field("generation", &self.inner.generation.get())
            .field("visible", &self.inner.visible.get())
            .finish_non_exhaustive()
    }
}

impl Layer {
    /// Creates a layer and starts its first update.
    ///
    /// The returned future resolves once the layer has been attached to a host and the
    /// initial metadata arrived.
    pub fn new(
        id: impl Into<String>,
        source: Rc<dyn DataSource>,
        viz: Viz,
    ) -> Result<(Self, PendingUpdate), LayerError> {
        Self::with_config(id, source, viz, EngineConfig::default())
    }

    pub fn with_config(
        id: impl Into<String>,
        source: Rc<dyn DataSource>,
        viz: Viz,
        config: EngineConfig,
    ) -> Result<(Self, PendingUpdate), LayerError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ValidationError::IncorrectValue(
                "'id' property must be not empty".to_owned(),
            )
            .into());
        }
        config
            .validate()
            .map_err(|err| LayerError::Runtime(err.to_string()))?;
        let (context_tx, context_rx) = oneshot::channel();
        let layer = Self {
            inner: Rc::new(LayerInner {
                id,
                uid: NEXT_LAYER_UID.fetch_add(1, Ordering::Relaxed),
                state: Cell::new(LayerState::Init),
                visible: Cell::new(true),
                generation: Cell::new(0),
                committed: RefCell::new(None),
                images: RefCell::new(Rc::new(NoImages)),
                host: Rc::new(RefCell::new(None)),
                gl: RefCell::new(None),
                context_tx: RefCell::new(Some(context_tx)),
                context: context_rx.shared(),
                features: Rc::new(RefCell::new(FeatureStore::default())),
                programs: RefCell::new(ProgramCache::new()),
                template: RefCell::new(point_template()),
                config,
                listeners: RefCell::new(Vec::new()),
                next_listener: Cell::new(0),
            }),
        };
        let initial = layer.update(source, viz)?;
        Ok((layer, initial))
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn state(&self) -> LayerState {
        self.inner.state.get()
    }

    /// The committed viz. Pending updates do not show here until they commit.
    #[must_use]
    pub fn viz(&self) -> Option<Viz> {
        self.inner
            .committed
            .borrow()
            .as_ref()
            .map(|c| c.viz.clone())
    }

    #[must_use]
    pub fn source(&self) -> Option<Rc<dyn DataSource>> {
        self.inner
            .committed
            .borrow()
            .as_ref()
            .map(|c| Rc::clone(&c.source))
    }

    #[must_use]
    pub fn metadata(&self) -> Option<Arc<Metadata>> {
        self.inner
            .committed
            .borrow()
            .as_ref()
            .map(|c| Arc::clone(&c.metadata))
    }

    #[must_use]
    pub fn num_features(&self) -> usize {
        self.inner.features.borrow().len()
    }

    #[must_use]
    pub fn is_animated(&self) -> bool {
        self.viz().is_some_and(|viz| viz.is_animated())
    }

    /// Number of distinct programs linked so far.
    #[must_use]
    pub fn cached_programs(&self) -> usize {
        self.inner.programs.borrow().len()
    }

    pub fn set_image_loader(&self, loader: Rc<dyn ImageLoader>) {
        *self.inner.images.borrow_mut() = loader;
    }

    /// Swaps the program template. Previously linked programs are dropped.
    pub fn set_shader_template(&self, template: ShaderTemplate) {
        *self.inner.template.borrow_mut() = template;
        *self.inner.programs.borrow_mut() = ProgramCache::new();
    }

    /// Replaces source and viz together.
    ///
    /// Validation happens now; the returned future loads images and metadata, waits for the
    /// host context and then either commits or fails. On failure the committed state is left
    /// untouched.
    pub fn update(&self, source: Rc<dyn DataSource>, viz: Viz) -> Result<PendingUpdate, LayerError> {
        self.check_viz(&viz)?;
        viz.bind(self.inner.uid);
        let generation = self.next_generation();
        #[cfg(feature = "tracing")]
        tracing::debug!(layer = %self.inner.id, generation, "update started");

        let images = self.inner.images.borrow().load_images(&viz.image_urls());
        let metadata = source.request_metadata(&viz);
        let layer = self.clone();
        Ok(async move {
            let (images, metadata) = futures::join!(images, metadata);
            images?;
            let metadata = metadata?;
            layer.host_context().await?;
            layer.check_current(generation)?;
            let staged = viz.prepare(metadata.geom_type(), &metadata)?;
            layer.commit(source, viz, staged, metadata);
            Ok(())
        }
        .boxed_local())
    }

    /// [`blend_to_viz`](Self::blend_to_viz) over the configured default duration with cubic
    /// easing.
    pub fn blend_to(&self, viz: Viz) -> Result<PendingUpdate, LayerError> {
        self.blend_to_viz(viz, self.inner.config.default_blend_ms, Rc::new(Cubic))
    }

    /// Transitions from the committed viz to `viz` over `duration_ms`.
    ///
    /// When the committed source needs new metadata for `viz` this is a plain
    /// [`update`](Self::update) instead. Either way it takes its place in the update order: a
    /// later update supersedes it and it supersedes earlier ones.
    pub fn blend_to_viz(
        &self,
        viz: Viz,
        duration_ms: f64,
        interpolator: Rc<dyn Interpolator>,
    ) -> Result<PendingUpdate, LayerError> {
        self.check_viz(&viz)?;
        let Some((source, committed_viz)) = self
            .inner
            .committed
            .borrow()
            .as_ref()
            .map(|c| (Rc::clone(&c.source), c.viz.clone()))
        else {
            return Err(ValidationError::MissingRequired("source").into());
        };
        if source.requires_new_metadata(&viz) {
            return self.update(source, viz);
        }
        viz.bind(self.inner.uid);
        viz.blend_from(&committed_viz, duration_ms, &interpolator);
        let generation = self.next_generation();
        #[cfg(feature = "tracing")]
        tracing::debug!(layer = %self.inner.id, generation, duration_ms, "blend started");

        let images = self.inner.images.borrow().load_images(&viz.image_urls());
        let metadata = source.request_metadata(&viz);
        let layer = self.clone();
        Ok(async move {
            let (images, metadata) = futures::join!(images, metadata);
            images?;
            let metadata = metadata?;
            layer.host_context().await?;
            layer.check_current(generation)?;
            if !layer.source().is_some_and(|current| Rc::ptr_eq(&current, &source)) {
                #[cfg(feature = "tracing")]
                tracing::warn!(layer = %layer.inner.id, "source changed while blending");
                return Err(LayerError::Stale);
            }
            let staged = viz.prepare(metadata.geom_type(), &metadata)?;
            layer.commit(source, viz, staged, metadata);
            Ok(())
        }
        .boxed_local())
    }

    /// Asks `host` to add this layer, waiting for the host style to load if needed.
    pub fn add_to(&self, host: Rc<dyn HostMap>, before: Option<&str>) -> Result<(), LayerError> {
        match host.add_layer(&self.inner.id, before) {
            Ok(()) => Ok(()),
            Err(HostError::StyleNotLoaded) => {
                let retry = Rc::clone(&host);
                let id = self.inner.id.clone();
                let before = before.map(str::to_owned);
                host.on_load(Box::new(move || {
                    if let Err(_err) = retry.add_layer(&id, before.as_deref()) {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(layer = %id, error = %_err, "deferred add failed");
                    }
                }));
                Ok(())
            }
            Err(err) => Err(LayerError::Runtime(format!(
                "error adding layer to map: {err}"
            ))),
        }
    }

    pub fn remove(&self) {
        if let Some(host) = self.host() {
            host.remove_layer(&self.inner.id);
        }
    }

    pub fn set_visible(&self, visible: bool) {
        self.inner.visible.set(visible);
        if let Some(host) = self.host() {
            host.set_visibility(&self.inner.id, visible);
        }
    }

    pub fn show(&self) {
        self.set_visible(true);
    }

    pub fn hide(&self) {
        self.set_visible(false);
    }

    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.inner.visible.get()
    }

    pub fn on(&self, event: LayerEvent, callback: impl Fn() + 'static) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.get());
        self.inner.next_listener.set(id.0 + 1);
        self.inner
            .listeners
            .borrow_mut()
            .push((id, event, Rc::new(callback)));
        id
    }

    /// Unregisters a listener. Returns false if it was not registered.
    pub fn off(&self, listener: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(id, _, _)| *id != listener);
        listeners.len() != before
    }

    // ── host frame contract ──────────────────────────────────────────────

    /// Called by the host once the layer is part of its style. Unblocks pending updates.
    pub fn on_attach(&self, host: Rc<dyn HostMap>, gl: Rc<RefCell<dyn GlContext>>) {
        *self.inner.host.borrow_mut() = Some(host);
        *self.inner.gl.borrow_mut() = Some(gl);
        if let Some(tx) = self.inner.context_tx.borrow_mut().take() {
            let _ = tx.send(());
        }
    }

    /// Programs belong to the detached context and are dropped with it.
    pub fn on_detach(&self) {
        *self.inner.host.borrow_mut() = None;
        *self.inner.gl.borrow_mut() = None;
        *self.inner.programs.borrow_mut() = ProgramCache::new();
    }

    /// Requests data for the area `matrix` shows.
    pub fn pre_frame(&self, matrix: &Mat4) {
        if !self.is_visible() {
            return;
        }
        let (Some(source), Some(host), Some(viewport)) =
            (self.source(), self.host(), Viewport::from_matrix(matrix))
        else {
            return;
        };
        source.request_data(host.zoom(), viewport);
    }

    /// Draws the committed viz over the features delivered so far.
    pub fn frame(&self, matrix: &Mat4) -> Result<(), LayerError> {
        if self.inner.state.get() == LayerState::Init {
            if self.inner.features.borrow().is_empty() {
                return Ok(());
            }
            self.inner.state.set(LayerState::Loaded);
            self.fire(LayerEvent::Loaded);
        }
        if self.paint(Viewport::from_matrix(matrix))? {
            self.request_repaint();
        }
        self.fire(LayerEvent::Updated);
        Ok(())
    }

    /// Runs one visible-feature pass and draws. Returns whether the viz is still animating.
    fn paint(&self, viewport: Option<Viewport>) -> Result<bool, LayerError> {
        let Some(viz) = self.viz() else {
            return Ok(false);
        };
        let Some(gl) = self.inner.gl.borrow().clone() else {
            return Ok(false);
        };
        let features = self.inner.features.borrow();
        let template = self.inner.template.borrow();
        let mut gl = gl.borrow_mut();
        viz.with_state_mut(|state| -> Result<bool, LayerError> {
            if let Some(geom_type) = features.geom_type() {
                state.set_defaults_if_required(geom_type)?;
            }
            let roots = state.roots_vec();
            let filter = roots
                .iter()
                .find(|(channel, _)| *channel == Channel::Filter)
                .map(|(_, id)| *id);
            for (_, root) in &roots {
                state.arena.reset_viewport_aggs(*root);
            }
            for feature in features.visible(viewport) {
                if let Some(filter) = filter {
                    let filtered_out = matches!(
                        state.arena.evaluate_feature(filter, feature),
                        Ok(value) if !value.is_truthy()
                    );
                    if filtered_out {
                        continue;
                    }
                }
                for (_, root) in &roots {
                    state.arena.accum_viewport_aggs(*root, feature)?;
                }
            }
            for (_, root) in &roots {
                state.arena.pre_draw(*root);
            }
            let program = self.inner.programs.borrow_mut().get_or_compile(
                &mut *gl,
                &template,
                &state.arena,
                &roots,
                &self.inner.config,
            )?;
            program.upload(&mut *gl, &state.arena)?;
            gl.draw(program.program);
            Ok(roots.iter().any(|(_, root)| state.arena.is_animated(*root)))
        })
    }

    // ── internals ────────────────────────────────────────────────────────

    fn check_viz(&self, viz: &Viz) -> Result<(), ValidationError> {
        match viz.bound_layer() {
            Some(uid) if uid != self.inner.uid => Err(ValidationError::IncorrectValue(
                "the given viz is already bound to another layer; vizzes cannot be shared between layers"
                    .to_owned(),
            )),
            _ => Ok(()),
        }
    }

    fn next_generation(&self) -> u64 {
        let generation = self.inner.generation.get() + 1;
        self.inner.generation.set(generation);
        generation
    }

    /// Fails with [`LayerError::Stale`] once an update or blend newer than `generation` exists.
    fn check_current(&self, generation: u64) -> Result<(), LayerError> {
        if self.inner.generation.get() > generation {
            #[cfg(feature = "tracing")]
            tracing::warn!(layer = %self.inner.id, generation, "update superseded");
            return Err(LayerError::Stale);
        }
        Ok(())
    }

    async fn host_context(&self) -> Result<(), LayerError> {
        self.inner
            .context
            .clone()
            .await
            .map_err(|_| LayerError::Runtime("layer was dropped before it was attached".to_owned()))
    }

    fn commit(
        &self,
        source: Rc<dyn DataSource>,
        viz: Viz,
        staged: VizState,
        metadata: Arc<Metadata>,
    ) {
        viz.install(staged);
        let previous = self.inner.committed.replace(Some(Committed {
            source: Rc::clone(&source),
            viz: viz.clone(),
            metadata: Arc::clone(&metadata),
        }));
        // Category ids are baked into linked programs, so they only hold for one snapshot.
        if !previous
            .as_ref()
            .is_some_and(|previous| Arc::ptr_eq(&previous.metadata, &metadata))
        {
            *self.inner.programs.borrow_mut() = ProgramCache::new();
        }
        if let Some(previous) = previous {
            if !Rc::ptr_eq(&previous.source, &source) {
                previous.source.free();
                self.inner.features.borrow_mut().clear();
            }
            if !previous.viz.ptr_eq(&viz) {
                previous.viz.unbind();
            }
        }
        source.bind_layer(FeatureSink::new(
            Rc::clone(&self.inner.features),
            Rc::clone(&self.inner.host),
        ));
        #[cfg(feature = "tracing")]
        tracing::debug!(
            layer = %self.inner.id,
            generation = self.inner.generation.get(),
            "update committed"
        );
        self.request_repaint();
    }

    fn host(&self) -> Option<Rc<dyn HostMap>> {
        self.inner.host.borrow().clone()
    }

    fn request_repaint(&self) {
        if let Some(host) = self.host() {
            host.trigger_repaint();
        }
    }

    fn fire(&self, event: LayerEvent) {
        let callbacks: Vec<Rc<dyn Fn()>> = self
            .inner
            .listeners
            .borrow()
            .iter()
            .filter(|(_, e, _)| *e == event)
            .map(|(_, _, callback)| Rc::clone(callback))
            .collect();
        for callback in callbacks {
            callback();
        }
    }
}
