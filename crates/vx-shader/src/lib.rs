#![forbid(unsafe_code)]

//! Shader program generation for expression trees.
//!
//! Each channel root is emitted to GLSL and spliced into a [`ShaderTemplate`] at its
//! `$<channel>_preface` / `$<channel>_inline` anchors. Properties become samplers named
//! `propertyTex<slot>`, one per distinct property. Programs are cached by the identity of the
//! trees they were built from.

use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;
use vx_expr::{ArenaId, BindingResolver, Channel, EvalError, ExprArena, ExprId};
use vx_runtime::EngineConfig;

mod gl;

pub use gl::{GlCall, GlContext, ProgramHandle, RecordingGl, UniformLocation};

const PROPERTY_PREFACE_ANCHOR: &str = "$propertyPreface";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ShaderError {
    #[error("program link failed: {0}")]
    Link(String),
    #[error("template {template:?} has no anchor {anchor}")]
    MissingAnchor { template: String, anchor: String },
    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Vertex and fragment sources with substitution anchors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderTemplate {
    pub name: String,
    pub vertex: String,
    pub fragment: String,
}

impl ShaderTemplate {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        vertex: impl Into<String>,
        fragment: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            vertex: vertex.into(),
            fragment: fragment.into(),
        }
    }

    /// Grid templates sample properties by texture coordinate instead of feature id.
    #[must_use]
    pub fn is_grid(&self, config: &EngineConfig) -> bool {
        self.fragment.contains(&config.grid_marker)
    }

    fn contains(&self, anchor: &str) -> bool {
        self.vertex.contains(anchor) || self.fragment.contains(anchor)
    }
}

struct Bindings {
    uids: HashMap<ExprId, usize>,
    properties: Vec<String>,
    grid: bool,
}

impl BindingResolver for Bindings {
    fn node_uid(&mut self, id: ExprId) -> usize {
        let next = self.uids.len();
        *self.uids.entry(id).or_insert(next)
    }

    fn property_access(&mut self, property: &str) -> String {
        let slot = match self.properties.iter().position(|p| p == property) {
            Some(slot) => slot,
            None => {
                self.properties.push(property.to_owned());
                self.properties.len() - 1
            }
        };
        let coordinate = if self.grid { "uv" } else { "abs(featureID)" };
        format!("texture2D(propertyTex{slot}, {coordinate}).a")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UniformBinding {
    pub id: ExprId,
    pub name: String,
    pub location: UniformLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextureBinding {
    pub slot: usize,
    pub property: String,
    pub location: UniformLocation,
}

/// A linked program plus the bindings needed to feed it every frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledShader {
    pub program: ProgramHandle,
    pub vertex_source: String,
    pub fragment_source: String,
    pub textures: Vec<TextureBinding>,
    pub uniforms: Vec<UniformBinding>,
}

impl CompiledShader {
    /// Property name sampled by each slot, in slot order.
    #[must_use]
    pub fn property_slots(&self) -> Vec<&str> {
        self.textures.iter().map(|t| t.property.as_str()).collect()
    }

    /// Makes the program current, binds property textures and uploads current uniform values.
    pub fn upload(&self, gl: &mut dyn GlContext, arena: &ExprArena) -> Result<(), ShaderError> {
        gl.use_program(self.program);
        for texture in &self.textures {
            gl.bind_property_texture(texture.slot, &texture.property, texture.location);
        }
        for uniform in &self.uniforms {
            let value = arena
                .evaluate(uniform.id)?
                .to_f64()
                .map_err(EvalError::from)?;
            gl.uniform1f(uniform.location, value as f32);
        }
        Ok(())
    }
}

fn substitute(source: &str, replacements: &[(String, String)]) -> String {
    let mut out = source.to_owned();
    for (anchor, text) in replacements {
        out = out.replace(anchor.as_str(), text);
    }
    out
}

/// Emits, splices and links a program for `roots`.
pub fn compile_shader(
    gl: &mut dyn GlContext,
    template: &ShaderTemplate,
    arena: &ExprArena,
    roots: &[(Channel, ExprId)],
    config: &EngineConfig,
) -> Result<CompiledShader, ShaderError> {
    let mut roots = roots.to_vec();
    roots.sort();
    let mut bindings = Bindings {
        uids: HashMap::new(),
        properties: Vec::new(),
        grid: template.is_grid(config),
    };

    let mut replacements = Vec::new();
    for (channel, root) in &roots {
        let preface_anchor = format!("${}_preface", channel.name());
        let inline_anchor = format!("${}_inline", channel.name());
        if !template.contains(&inline_anchor) {
            return Err(ShaderError::MissingAnchor {
                template: template.name.clone(),
                anchor: inline_anchor,
            });
        }
        let code = arena.emit_shader(*root, &mut bindings)?;
        replacements.push((preface_anchor, code.preface));
        replacements.push((inline_anchor, code.inline));
    }
    let samplers = (0..bindings.properties.len())
        .map(|slot| format!("uniform sampler2D propertyTex{slot};\n"))
        .collect::<String>();
    replacements.push((PROPERTY_PREFACE_ANCHOR.to_owned(), samplers));
    // Longer anchors first so none is clobbered by a prefix of itself.
    replacements.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

    let vertex_source = substitute(&template.vertex, &replacements);
    let fragment_source = substitute(&template.fragment, &replacements);
    let program = gl
        .link_program(&vertex_source, &fragment_source)
        .map_err(ShaderError::Link)?;

    let mut textures = Vec::new();
    for (slot, property) in bindings.properties.iter().enumerate() {
        if let Some(location) = gl.uniform_location(program, &format!("propertyTex{slot}")) {
            textures.push(TextureBinding {
                slot,
                property: property.clone(),
                location,
            });
        }
    }

    let mut uniforms = Vec::new();
    for (_, root) in &roots {
        for (id, value) in arena.uniforms(*root)? {
            let Some(uid) = bindings.uids.get(&id) else {
                continue;
            };
            let name = vx_expr::uniform_name(value.kind, *uid);
            if let Some(location) = gl.uniform_location(program, &name) {
                uniforms.push(UniformBinding { id, name, location });
            }
        }
    }

    Ok(CompiledShader {
        program,
        vertex_source,
        fragment_source,
        textures,
        uniforms,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    template: String,
    arena: ArenaId,
    roots: Vec<(Channel, ExprId)>,
}

/// Programs keyed by (template, arena, root ids). Append-only.
#[derive(Debug, Default)]
pub struct ProgramCache {
    programs: HashMap<CacheKey, Rc<CompiledShader>>,
    hits: u64,
    misses: u64,
}

impl ProgramCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(
        &mut self,
        gl: &mut dyn GlContext,
        template: &ShaderTemplate,
        arena: &ExprArena,
        roots: &[(Channel, ExprId)],
        config: &EngineConfig,
    ) -> Result<Rc<CompiledShader>, ShaderError> {
        let mut sorted = roots.to_vec();
        sorted.sort();
        let key = CacheKey {
            template: template.name.clone(),
            arena: arena.id(),
            roots: sorted,
        };
        if let Some(shader) = self.programs.get(&key) {
            self.hits += 1;
            return Ok(Rc::clone(shader));
        }
        self.misses += 1;
        #[cfg(feature = "tracing")]
        tracing::debug!(template = %template.name, roots = key.roots.len(), "compiling shader program");
        let shader = Rc::new(compile_shader(gl, template, arena, roots, config)?);
        self.programs.insert(key, Rc::clone(&shader));
        Ok(shader)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.programs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses
    }
}

/// A point template with every channel anchor, used by tests and as a reference layout.
#[must_use]
pub fn point_template() -> ShaderTemplate {
    ShaderTemplate::new(
        "point",
        "precision highp float;\n\
         attribute vec2 vertexPosition;\n\
         attribute vec2 featureID;\n\
         $propertyPreface\
         $color_preface\
         $width_preface\
         $strokeColor_preface\
         $strokeWidth_preface\
         $filter_preface\
         varying vec4 color;\n\
         varying vec4 stroke;\n\
         void main(void) {\n\
         \x20   float size = $width_inline;\n\
         \x20   float strokeSize = $strokeWidth_inline;\n\
         \x20   color = $color_inline;\n\
         \x20   stroke = $strokeColor_inline;\n\
         \x20   color.a *= $filter_inline;\n\
         \x20   gl_PointSize = size + strokeSize;\n\
         \x20   gl_Position = vec4(vertexPosition, 0.0, 1.0);\n\
         }\n",
        "precision highp float;\n\
         varying vec4 color;\n\
         varying vec4 stroke;\n\
         void main(void) {\n\
         \x20   gl_FragColor = color;\n\
         }\n",
    )
}
