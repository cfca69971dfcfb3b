use std::fmt;
use std::rc::Rc;

use crate::{Channel, ExprArena, ExprId, ExprKind};

/// Easing curve applied to a `[0, 1]` progress value, on the CPU and in GLSL.
pub trait Interpolator: fmt::Debug {
    fn name(&self) -> &'static str;
    fn eval(&self, t: f64) -> f64;
    /// GLSL expression applying the curve to `x`, which is already clamped.
    fn glsl(&self, x: &str) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Linear;

impl Interpolator for Linear {
    fn name(&self) -> &'static str {
        "ilinear"
    }

    fn eval(&self, t: f64) -> f64 {
        t
    }

    fn glsl(&self, x: &str) -> String {
        x.to_owned()
    }
}

/// Cubic ease-in-out.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cubic;

impl Interpolator for Cubic {
    fn name(&self) -> &'static str {
        "cubic"
    }

    fn eval(&self, t: f64) -> f64 {
        if t < 0.5 {
            4.0 * t * t * t
        } else {
            1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
        }
    }

    fn glsl(&self, x: &str) -> String {
        format!("({x} < 0.5 ? 4.0 * {x} * {x} * {x} : 1.0 - pow(-2.0 * {x} + 2.0, 3.0) / 2.0)")
    }
}

/// Quadratic ease-out.
#[derive(Debug, Clone, Copy, Default)]
pub struct EaseOut;

impl Interpolator for EaseOut {
    fn name(&self) -> &'static str {
        "easeOut"
    }

    fn eval(&self, t: f64) -> f64 {
        1.0 - (1.0 - t) * (1.0 - t)
    }

    fn glsl(&self, x: &str) -> String {
        format!("(1.0 - (1.0 - {x}) * (1.0 - {x}))")
    }
}

impl ExprArena {
    /// Wraps `target` in a blend that starts from `from` and reaches `target` after
    /// `duration_ms`, easing progress through `interpolator`.
    ///
    /// `from` must be an unparented subtree of this arena (see [`ExprArena::import`]). When
    /// `target` is the child of a root, the root is rewired to the blend. Blending into a
    /// subtree that is itself mid-blend simply nests it, so the new window starts from the
    /// value currently on screen. Returns the blend node.
    pub fn blend_from(
        &mut self,
        target: ExprId,
        from: ExprId,
        duration_ms: f64,
        interpolator: Rc<dyn Interpolator>,
    ) -> ExprId {
        let parent = self.node(target).parent();
        let discrete = parent.is_some_and(|p| {
            matches!(self.kind(p), ExprKind::Root { channel, .. } if channel.is_discrete())
        });
        if let Some(p) = parent {
            self.nodes[target.index()].parent = None;
            self.nodes[p.index()].ty = None;
        }
        let animation = self.animate(duration_ms);
        let mix = self.ease(interpolator, animation);
        let blend = self.push(ExprKind::Blend {
            from,
            to: target,
            mix,
            discrete,
            settled: false,
        });
        if let Some(p) = parent {
            for slot in self.kind_mut(p).children_mut() {
                if *slot == target {
                    *slot = blend;
                }
            }
            self.nodes[blend.index()].parent = Some(p);
        }
        blend
    }

    /// Blends the input of `root` from the input of `old_root` in `old`.
    ///
    /// The old input is imported, so `old` stays untouched.
    pub fn blend_root_from(
        &mut self,
        root: ExprId,
        old: &ExprArena,
        old_root: ExprId,
        duration_ms: f64,
        interpolator: Rc<dyn Interpolator>,
    ) -> Option<ExprId> {
        let ExprKind::Root { input, channel } = self.kind(root) else {
            return None;
        };
        let (input, channel) = (*input, *channel);
        let old_input = match old.kind(old_root) {
            ExprKind::Root {
                input,
                channel: old_channel,
            } if *old_channel == channel => *input,
            _ => return None,
        };
        let from = self.import(old, old_input);
        Some(self.blend_from(input, from, duration_ms, interpolator))
    }

    /// True when `mix` is an animation, optionally eased. Such blends finish on their own.
    #[must_use]
    pub fn is_animation_mix(&self, mix: ExprId) -> bool {
        match self.kind(mix) {
            ExprKind::Animate { .. } => true,
            ExprKind::Ease { input, .. } => matches!(self.kind(*input), ExprKind::Animate { .. }),
            _ => false,
        }
    }

    pub(crate) fn settle_blends(&mut self, root: ExprId) {
        let finished = self
            .descendants(root)
            .into_iter()
            .filter(|id| match self.kind(*id) {
                ExprKind::Blend {
                    mix,
                    settled: false,
                    ..
                } => {
                    self.is_animation_mix(*mix)
                        && self
                            .evaluate(*mix)
                            .ok()
                            .and_then(|v| v.to_f64().ok())
                            .is_some_and(|t| t >= 1.0)
                }
                _ => false,
            })
            .collect::<Vec<_>>();
        for id in finished {
            if let ExprKind::Blend { settled, .. } = self.kind_mut(id) {
                *settled = true;
            }
        }
    }

    /// A tree needs continuous repaints while it holds `now()` or an unfinished animation.
    #[must_use]
    pub fn is_animated(&self, root: ExprId) -> bool {
        self.live_nodes(root).into_iter().any(|id| match self.kind(id) {
            ExprKind::Now => true,
            ExprKind::Animate {
                duration_ms,
                start_ms,
            } => self.animation_progress(*start_ms, *duration_ms) < 1.0,
            _ => false,
        })
    }

    /// Descendants reachable through the displayed path: settled blends only expose `to`.
    pub(crate) fn live_nodes(&self, root: ExprId) -> Vec<ExprId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            match self.kind(id) {
                ExprKind::Blend {
                    to, settled: true, ..
                } => stack.push(*to),
                kind => stack.extend(kind.children()),
            }
        }
        out
    }

    /// Channel of a root node.
    #[must_use]
    pub fn channel(&self, root: ExprId) -> Option<Channel> {
        match self.kind(root) {
            ExprKind::Root { channel, .. } => Some(*channel),
            _ => None,
        }
    }
}
