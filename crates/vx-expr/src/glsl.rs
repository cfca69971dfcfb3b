use std::fmt::Write as _;

use vx_types::{Color, Value, ValueType};

use crate::{BinaryOp, EvalError, ExprArena, ExprId, ExprKind, LogicalOp, UnaryOp};

/// GLSL produced for one subtree: top-level declarations plus an inline expression.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderCode {
    pub preface: String,
    pub inline: String,
}

/// Supplies node identifiers and per-feature data access while a tree is emitted.
pub trait BindingResolver {
    /// Stable identifier for a node, the same for every call with the same id.
    fn node_uid(&mut self, id: ExprId) -> usize;
    /// GLSL that reads `property` for the current feature.
    fn property_access(&mut self, property: &str) -> String;
}

/// Nodes whose value is uploaded per frame instead of baked into program text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformKind {
    Now,
    GlobalAggregate,
    ViewportAggregate,
    Animation,
}

impl UniformKind {
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Now => "now",
            Self::GlobalAggregate => "globalAgg",
            Self::ViewportAggregate => "viewportAgg",
            Self::Animation => "anim",
        }
    }
}

#[must_use]
pub fn uniform_name(kind: UniformKind, uid: usize) -> String {
    format!("{}{uid}", kind.prefix())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformValue {
    pub kind: UniformKind,
    pub value: f32,
}

/// Float literal that GLSL ES 1.0 accepts: always carries a decimal point.
#[must_use]
pub fn glsl_float(v: f64) -> String {
    if v.is_nan() {
        return "(0.0 / 0.0)".to_owned();
    }
    if v.is_infinite() {
        return if v > 0.0 { "1e38".to_owned() } else { "-1e38".to_owned() };
    }
    let text = format!("{v:?}");
    if text.contains('.') || text.contains('e') {
        text
    } else {
        format!("{text}.0")
    }
}

fn glsl_color(c: Color) -> String {
    format!(
        "vec4({}, {}, {}, {})",
        glsl_float(c.r),
        glsl_float(c.g),
        glsl_float(c.b),
        glsl_float(c.a)
    )
}

impl ExprArena {
    fn uniform_kind(&self, id: ExprId) -> Option<UniformKind> {
        match self.kind(id) {
            ExprKind::Now => Some(UniformKind::Now),
            ExprKind::GlobalAggregate { .. } => Some(UniformKind::GlobalAggregate),
            ExprKind::ViewportAggregate { .. } => Some(UniformKind::ViewportAggregate),
            ExprKind::Animate { .. } => Some(UniformKind::Animation),
            _ => None,
        }
    }

    /// Every uniform node under `root` with its current value.
    ///
    /// Settled blends are included on both sides so a program linked mid-blend keeps
    /// receiving values after the blend finishes.
    pub fn uniforms(&self, root: ExprId) -> Result<Vec<(ExprId, UniformValue)>, EvalError> {
        self.descendants(root)
            .into_iter()
            .filter_map(|id| self.uniform_kind(id).map(|kind| (id, kind)))
            .map(|(id, kind)| {
                let value = self.evaluate(id)?.to_f64()? as f32;
                Ok((id, UniformValue { kind, value }))
            })
            .collect()
    }

    /// GLSL for a compiled subtree.
    pub fn emit_shader(
        &self,
        id: ExprId,
        resolver: &mut dyn BindingResolver,
    ) -> Result<ShaderCode, EvalError> {
        let mut preface = String::new();
        let inline = self.emit(id, resolver, &mut preface)?;
        Ok(ShaderCode { preface, inline })
    }

    fn emit(
        &self,
        id: ExprId,
        resolver: &mut dyn BindingResolver,
        preface: &mut String,
    ) -> Result<String, EvalError> {
        let node = self.node(id);
        let Some(ty) = node.value_type() else {
            return Err(EvalError::NotCompiled(id));
        };
        let code = match node.kind() {
            ExprKind::Now
            | ExprKind::GlobalAggregate { .. }
            | ExprKind::ViewportAggregate { .. }
            | ExprKind::Animate { .. } => {
                let kind = self.uniform_kind(id).unwrap_or(UniformKind::Now);
                let name = uniform_name(kind, resolver.node_uid(id));
                let _ = writeln!(preface, "uniform float {name};");
                name
            }
            ExprKind::Constant(value) => match value {
                Value::Number(v) | Value::Date(v) => glsl_float(*v),
                Value::Category(_) => glsl_float(self.category_id(value)),
                Value::Color(c) => glsl_color(*c),
            },
            ExprKind::Property { name } => resolver.property_access(name),
            ExprKind::Unary { op, input } => {
                let x = self.emit(*input, resolver, preface)?;
                match op {
                    UnaryOp::Neg => format!("(-{x})"),
                    UnaryOp::Not => format!("(1.0 - {x})"),
                    UnaryOp::Abs => format!("abs({x})"),
                    UnaryOp::Floor => format!("floor({x})"),
                    UnaryOp::Ceil => format!("ceil({x})"),
                    UnaryOp::Sqrt => format!("sqrt({x})"),
                }
            }
            ExprKind::Binary { op, left, right } => {
                let l = self.emit(*left, resolver, preface)?;
                let r = self.emit(*right, resolver, preface)?;
                match op {
                    BinaryOp::Add => format!("({l} + {r})"),
                    BinaryOp::Sub => format!("({l} - {r})"),
                    BinaryOp::Mul => format!("({l} * {r})"),
                    BinaryOp::Div => format!("({l} / {r})"),
                    BinaryOp::Mod => format!("mod({l}, {r})"),
                    BinaryOp::Pow => format!("pow({l}, {r})"),
                }
            }
            ExprKind::Logical { op, left, right } => {
                let l = self.emit(*left, resolver, preface)?;
                let r = self.emit(*right, resolver, preface)?;
                match op {
                    LogicalOp::And => format!("({l} * {r})"),
                    LogicalOp::Or => format!("min({l} + {r}, 1.0)"),
                }
            }
            ExprKind::Compare { op, left, right } => {
                let l = self.emit(*left, resolver, preface)?;
                let r = self.emit(*right, resolver, preface)?;
                format!("({l} {} {r} ? 1.0 : 0.0)", op.symbol())
            }
            ExprKind::Between {
                input,
                lower,
                upper,
            } => {
                let x = self.emit(*input, resolver, preface)?;
                let lo = self.emit(*lower, resolver, preface)?;
                let hi = self.emit(*upper, resolver, preface)?;
                format!("(({x} >= {lo} && {x} <= {hi}) ? 1.0 : 0.0)")
            }
            ExprKind::In {
                input,
                values,
                negated,
            } => {
                let x = self.emit(*input, resolver, preface)?;
                let tests = values
                    .iter()
                    .map(|v| Ok(format!("{x} == {}", self.emit(*v, resolver, preface)?)))
                    .collect::<Result<Vec<_>, EvalError>>()?;
                let any = if tests.is_empty() {
                    "false".to_owned()
                } else {
                    tests.join(" || ")
                };
                let (hit, miss) = if *negated { ("0.0", "1.0") } else { ("1.0", "0.0") };
                format!("(({any}) ? {hit} : {miss})")
            }
            ExprKind::Blend {
                from,
                to,
                mix,
                discrete,
                settled,
            } => {
                if *settled {
                    return self.emit(*to, resolver, preface);
                }
                let a = self.emit(*from, resolver, preface)?;
                let b = self.emit(*to, resolver, preface)?;
                let t = self.emit(*mix, resolver, preface)?;
                if *discrete || ty == ValueType::Category {
                    format!("mix({a}, {b}, step(1.0, {t}))")
                } else {
                    format!("mix({a}, {b}, clamp({t}, 0.0, 1.0))")
                }
            }
            ExprKind::Ease {
                interpolator,
                input,
            } => {
                let x = self.emit(*input, resolver, preface)?;
                interpolator.glsl(&format!("clamp({x}, 0.0, 1.0)"))
            }
            ExprKind::Linear { input, min, max } => {
                let x = self.emit(*input, resolver, preface)?;
                let lo = self.emit(*min, resolver, preface)?;
                let hi = self.emit(*max, resolver, preface)?;
                format!("({hi} == {lo} ? 0.0 : ({x} - {lo}) / ({hi} - {lo}))")
            }
            ExprKind::Ramp { input, palette } => {
                let x = self.emit(*input, resolver, preface)?;
                let function = format!("ramp{}", resolver.node_uid(id));
                let input_ty = self.value_type(*input);
                self.emit_ramp_function(preface, &function, *input, input_ty, palette, ty);
                format!("{function}({x})")
            }
            ExprKind::Buckets { input, breakpoints } => {
                let x = self.emit(*input, resolver, preface)?;
                let bounds = breakpoints
                    .iter()
                    .map(|b| self.emit(*b, resolver, preface))
                    .collect::<Result<Vec<_>, _>>()?;
                if self.value_type(*input) == Some(ValueType::Category) {
                    let mut code = glsl_float(bounds.len() as f64);
                    for (i, b) in bounds.iter().enumerate().rev() {
                        code = format!("({x} == {b} ? {} : {code})", glsl_float(i as f64));
                    }
                    code
                } else if bounds.is_empty() {
                    "0.0".to_owned()
                } else {
                    let steps = bounds
                        .iter()
                        .map(|b| format!("step({b}, {x})"))
                        .collect::<Vec<_>>()
                        .join(" + ");
                    format!("({steps})")
                }
            }
            ExprKind::Root { input, .. } => self.emit(*input, resolver, preface)?,
        };
        Ok(code)
    }

    fn emit_ramp_function(
        &self,
        preface: &mut String,
        function: &str,
        input: ExprId,
        input_ty: Option<ValueType>,
        palette: &[Value],
        out: ValueType,
    ) {
        let ret = if out == ValueType::Color { "vec4" } else { "float" };
        let literal = |v: &Value| match v {
            Value::Color(c) => glsl_color(*c),
            Value::Number(n) | Value::Date(n) => glsl_float(*n),
            Value::Category(_) => glsl_float(self.category_id(v)),
        };
        let Some(last) = palette.last() else {
            return;
        };
        let _ = writeln!(preface, "{ret} {function}(float x) {{");
        if input_ty == Some(ValueType::Category) {
            let domain = match (self.kind(input), self.metadata()) {
                (ExprKind::Property { name }, Some(metadata)) => metadata
                    .column(name)
                    .map(|column| column.categories.clone())
                    .unwrap_or_default(),
                _ => Vec::new(),
            };
            for (category, color) in domain.iter().zip(palette) {
                let category_id = self.category_id(&Value::Category(category.name.clone()));
                let _ = writeln!(
                    preface,
                    "    if (x == {}) return {};",
                    glsl_float(category_id),
                    literal(color)
                );
            }
        } else if palette.len() > 1 {
            let span = palette.len() - 1;
            let _ = writeln!(
                preface,
                "    float t = clamp(x, 0.0, 1.0) * {};",
                glsl_float(span as f64)
            );
            for i in 0..span {
                let _ = writeln!(
                    preface,
                    "    if (t < {}) return mix({}, {}, t - {});",
                    glsl_float((i + 1) as f64),
                    literal(&palette[i]),
                    literal(&palette[i + 1]),
                    glsl_float(i as f64)
                );
            }
        }
        let _ = writeln!(preface, "    return {};", literal(last));
        let _ = writeln!(preface, "}}");
    }
}
