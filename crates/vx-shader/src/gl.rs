use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniformLocation(pub i32);

/// The slice of a WebGL-style context the generator drives.
///
/// Buffer and texture management stay with the host; `bind_property_texture` asks it to
/// bind whatever texture holds `property` to texture unit `unit`.
pub trait GlContext {
    fn link_program(&mut self, vertex: &str, fragment: &str) -> Result<ProgramHandle, String>;
    fn use_program(&mut self, program: ProgramHandle);
    fn uniform_location(&mut self, program: ProgramHandle, name: &str) -> Option<UniformLocation>;
    fn uniform1f(&mut self, location: UniformLocation, value: f32);
    fn bind_property_texture(&mut self, unit: usize, property: &str, location: UniformLocation);
    fn draw(&mut self, program: ProgramHandle);
}

#[derive(Debug, Clone, PartialEq)]
pub enum GlCall {
    Link(ProgramHandle),
    Use(ProgramHandle),
    Uniform1f { location: UniformLocation, value: f32 },
    BindPropertyTexture { unit: usize, property: String },
    Draw(ProgramHandle),
}

/// In-memory [`GlContext`] that records every call.
///
/// Uniform locations are only handed out for names that occur in the linked sources, so a
/// uniform the generator never emitted resolves to `None` as it would on a real driver.
#[derive(Debug, Default)]
pub struct RecordingGl {
    pub calls: Vec<GlCall>,
    /// When set, every link fails with this log.
    pub link_failure: Option<String>,
    sources: HashMap<ProgramHandle, (String, String)>,
    locations: HashMap<(ProgramHandle, String), UniformLocation>,
    next_program: u32,
}

impl RecordingGl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn links(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| matches!(call, GlCall::Link(_)))
            .count()
    }

    #[must_use]
    pub fn draws(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| matches!(call, GlCall::Draw(_)))
            .count()
    }

    /// Last value uploaded to the uniform called `name` in `program`.
    #[must_use]
    pub fn last_uniform(&self, program: ProgramHandle, name: &str) -> Option<f32> {
        let location = self.locations.get(&(program, name.to_owned()))?;
        self.calls.iter().rev().find_map(|call| match call {
            GlCall::Uniform1f { location: l, value } if l == location => Some(*value),
            _ => None,
        })
    }

    #[must_use]
    pub fn sources(&self, program: ProgramHandle) -> Option<&(String, String)> {
        self.sources.get(&program)
    }
}

impl GlContext for RecordingGl {
    fn link_program(&mut self, vertex: &str, fragment: &str) -> Result<ProgramHandle, String> {
        if let Some(log) = &self.link_failure {
            return Err(log.clone());
        }
        self.next_program += 1;
        let program = ProgramHandle(self.next_program);
        self.sources
            .insert(program, (vertex.to_owned(), fragment.to_owned()));
        self.calls.push(GlCall::Link(program));
        Ok(program)
    }

    fn use_program(&mut self, program: ProgramHandle) {
        self.calls.push(GlCall::Use(program));
    }

    fn uniform_location(&mut self, program: ProgramHandle, name: &str) -> Option<UniformLocation> {
        let (vertex, fragment) = self.sources.get(&program)?;
        if !mentions_identifier(vertex, name) && !mentions_identifier(fragment, name) {
            return None;
        }
        let next = UniformLocation(self.locations.len() as i32);
        Some(
            *self
                .locations
                .entry((program, name.to_owned()))
                .or_insert(next),
        )
    }

    fn uniform1f(&mut self, location: UniformLocation, value: f32) {
        self.calls.push(GlCall::Uniform1f { location, value });
    }

    fn bind_property_texture(&mut self, unit: usize, property: &str, _location: UniformLocation) {
        self.calls.push(GlCall::BindPropertyTexture {
            unit,
            property: property.to_owned(),
        });
    }

    fn draw(&mut self, program: ProgramHandle) {
        self.calls.push(GlCall::Draw(program));
    }
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Whole-identifier search: `globalAgg1` does not occur in `globalAgg10`.
fn mentions_identifier(source: &str, name: &str) -> bool {
    source.match_indices(name).any(|(start, _)| {
        let before = source[..start].chars().next_back();
        let after = source[start + name.len()..].chars().next();
        !before.is_some_and(is_identifier_char) && !after.is_some_and(is_identifier_char)
    })
}

#[cfg(test)]
mod tests {
    use super::{GlContext, RecordingGl, mentions_identifier};

    #[test]
    fn identifiers_match_whole_words_only() {
        let source = "uniform float globalAgg10;\nvoid main() { x = globalAgg10 + u_a; }";
        assert!(mentions_identifier(source, "globalAgg10"));
        assert!(!mentions_identifier(source, "globalAgg1"));
        assert!(!mentions_identifier(source, "lobalAgg10"));
        assert!(mentions_identifier(source, "u_a"));
        assert!(!mentions_identifier(source, "u"));
    }

    #[test]
    fn uniform_locations_require_an_exact_name() {
        let mut gl = RecordingGl::new();
        let program = gl
            .link_program("uniform float globalAgg10;", "void main() {}")
            .expect("link");
        assert!(gl.uniform_location(program, "globalAgg1").is_none());
        let location = gl
            .uniform_location(program, "globalAgg10")
            .expect("declared uniform");
        assert_eq!(gl.uniform_location(program, "globalAgg10"), Some(location));
    }
}
