use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    /// Layers can only be added once the host style has loaded.
    #[error("style is not done loading")]
    StyleNotLoaded,
    #[error("{0}")]
    Other(String),
}

/// The map that owns the render loop.
///
/// Once a layer is added, the host calls [`Layer::on_attach`](crate::Layer::on_attach) and
/// then [`pre_frame`](crate::Layer::pre_frame) / [`frame`](crate::Layer::frame) on every
/// repaint.
pub trait HostMap {
    fn add_layer(&self, layer_id: &str, before: Option<&str>) -> Result<(), HostError>;
    fn remove_layer(&self, layer_id: &str);
    /// Runs `callback` once the style has finished loading.
    fn on_load(&self, callback: Box<dyn FnOnce()>);
    fn trigger_repaint(&self);
    fn zoom(&self) -> f64;
    fn set_visibility(&self, layer_id: &str, visible: bool);
}
