use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use futures::future::{self, FutureExt, LocalBoxFuture};
use glam::{Mat4, Vec4};
use thiserror::Error;
use vx_metadata::{Feature, FeatureBatch, GeomType, Metadata, MetadataError};

use crate::host::HostMap;
use crate::viz::Viz;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("image {url:?} could not be loaded")]
    Image { url: String },
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// Where a layer's features and metadata come from.
///
/// Futures are `'static` so a source never borrows the viz it was asked about; anything it
/// needs from the viz (property names, the pushed-down filter) is read synchronously.
pub trait DataSource {
    fn request_metadata(&self, viz: &Viz) -> LocalBoxFuture<'static, Result<Arc<Metadata>, SourceError>>;
    fn request_data(&self, zoom: f64, viewport: Viewport);
    fn bind_layer(&self, sink: FeatureSink);
    /// False when `viz` can be drawn with the metadata the source already served.
    fn requires_new_metadata(&self, viz: &Viz) -> bool;
    fn free(&self);
}

pub trait ImageLoader {
    fn load_images(&self, urls: &[String]) -> LocalBoxFuture<'static, Result<(), SourceError>>;
}

/// Loader for vizzes that reference no images.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoImages;

impl ImageLoader for NoImages {
    fn load_images(&self, urls: &[String]) -> LocalBoxFuture<'static, Result<(), SourceError>> {
        let result = match urls.first() {
            Some(url) => Err(SourceError::Image { url: url.clone() }),
            None => Ok(()),
        };
        future::ready(result).boxed_local()
    }
}

/// Axis-aligned visible region in the `[-1, 1]` layer coordinate space, `y` pointing down.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub min: [f64; 2],
    pub max: [f64; 2],
}

impl Viewport {
    /// Unprojects the four NDC corners through the inverse of `matrix` onto the `z = 0` plane.
    ///
    /// Returns `None` for a singular matrix.
    #[must_use]
    pub fn from_matrix(matrix: &Mat4) -> Option<Self> {
        if matrix.determinant() == 0.0 {
            return None;
        }
        let inverse = matrix.inverse();
        let mut min = [f64::INFINITY; 2];
        let mut max = [f64::NEG_INFINITY; 2];
        for (x, y) in [(-1.0, -1.0), (-1.0, 1.0), (1.0, -1.0), (1.0, 1.0)] {
            let [cx, cy] = unproject(&inverse, x, y)?;
            // Unprojected points live in [0, 1]; the layer API works in [-1, 1].
            let (cx, cy) = (cx * 2.0 - 1.0, cy * 2.0 - 1.0);
            min[0] = min[0].min(cx);
            min[1] = min[1].min(cy);
            max[0] = max[0].max(cx);
            max[1] = max[1].max(cy);
        }
        // Flip y.
        let (low, high) = (-max[1], -min[1]);
        min[1] = low;
        max[1] = high;
        Some(Self { min, max })
    }

    #[must_use]
    pub fn contains(&self, [x, y]: [f64; 2]) -> bool {
        x >= self.min[0] && x <= self.max[0] && y >= self.min[1] && y <= self.max[1]
    }
}

fn unproject(inverse: &Mat4, x: f32, y: f32) -> Option<[f64; 2]> {
    let near = *inverse * Vec4::new(x, y, -1.0, 1.0);
    let far = *inverse * Vec4::new(x, y, 1.0, 1.0);
    if near.w == 0.0 || far.w == 0.0 {
        return None;
    }
    let near = near / near.w;
    let far = far / far.w;
    let t = if (far.z - near.z).abs() > f32::EPSILON {
        -near.z / (far.z - near.z)
    } else {
        0.0
    };
    let point = near + (far - near) * t;
    Some([f64::from(point.x), f64::from(point.y)])
}

#[derive(Debug, Default)]
pub(crate) struct FeatureStore {
    batches: Vec<FeatureBatch>,
    loaded: bool,
}

impl FeatureStore {
    pub(crate) fn is_empty(&self) -> bool {
        self.batches.iter().all(FeatureBatch::is_empty)
    }

    pub(crate) fn len(&self) -> usize {
        self.batches.iter().map(FeatureBatch::len).sum()
    }

    pub(crate) fn geom_type(&self) -> Option<GeomType> {
        self.batches.last().map(|batch| batch.geom_type)
    }

    /// Features inside `viewport`; features without a position are always visible.
    pub(crate) fn visible(&self, viewport: Option<Viewport>) -> impl Iterator<Item = &Feature> {
        self.batches
            .iter()
            .flat_map(|batch| batch.features.iter())
            .filter(move |feature| match (viewport, feature.position()) {
                (Some(viewport), Some(position)) => viewport.contains(position),
                _ => true,
            })
    }

    pub(crate) fn clear(&mut self) {
        self.batches.clear();
        self.loaded = false;
    }
}

/// Handle a data source pushes decoded features into.
#[derive(Clone)]
pub struct FeatureSink {
    store: Rc<RefCell<FeatureStore>>,
    host: Rc<RefCell<Option<Rc<dyn HostMap>>>>,
}

impl FeatureSink {
    pub(crate) fn new(
        store: Rc<RefCell<FeatureStore>>,
        host: Rc<RefCell<Option<Rc<dyn HostMap>>>>,
    ) -> Self {
        Self { store, host }
    }

    pub fn on_batch_added(&self, batch: FeatureBatch) {
        self.store.borrow_mut().batches.push(batch);
        self.repaint();
    }

    /// All batches for the current request have arrived.
    pub fn on_data_loaded(&self) {
        self.store.borrow_mut().loaded = true;
        self.repaint();
    }

    fn repaint(&self) {
        let host = self.host.borrow().clone();
        if let Some(host) = host {
            host.trigger_repaint();
        }
    }
}

impl std::fmt::Debug for FeatureSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureSink")
            .field("features", &self.store.borrow().len())
            .finish_non_exhaustive()
    }
}
