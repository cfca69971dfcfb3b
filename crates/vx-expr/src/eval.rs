use vx_metadata::Feature;
use vx_types::{Value, ValueType, step};

use crate::{
    BinaryOp, CompareOp, EvalError, ExprArena, ExprId, ExprKind, LogicalOp, UnaryOp,
};

impl ExprArena {
    /// Evaluates a compiled tree without a feature, as legends do.
    pub fn evaluate(&self, id: ExprId) -> Result<Value, EvalError> {
        self.eval(id, None)
    }

    /// Evaluates a compiled tree for one feature.
    pub fn evaluate_feature(&self, id: ExprId, feature: &Feature) -> Result<Value, EvalError> {
        self.eval(id, Some(feature))
    }

    fn eval_number(&self, id: ExprId, feature: Option<&Feature>) -> Result<f64, EvalError> {
        Ok(self.eval(id, feature)?.to_f64()?)
    }

    fn eval(&self, id: ExprId, feature: Option<&Feature>) -> Result<Value, EvalError> {
        let node = self.node(id);
        if node.value_type().is_none() {
            return Err(EvalError::NotCompiled(id));
        }
        match node.kind() {
            ExprKind::Constant(value) => Ok(value.clone()),
            ExprKind::Property { name } => {
                let feature = feature.ok_or_else(|| EvalError::RequiresFeature {
                    name: name.clone(),
                })?;
                feature
                    .get(name)
                    .cloned()
                    .ok_or_else(|| EvalError::MissingProperty { name: name.clone() })
            }
            ExprKind::Now => Ok(Value::Number(self.clock().now_ms() / 1000.0)),
            ExprKind::Unary { op, input } => {
                let x = self.eval_number(*input, feature)?;
                Ok(Value::Number(match op {
                    UnaryOp::Neg => -x,
                    UnaryOp::Not => 1.0 - x,
                    UnaryOp::Abs => x.abs(),
                    UnaryOp::Floor => x.floor(),
                    UnaryOp::Ceil => x.ceil(),
                    UnaryOp::Sqrt => x.sqrt(),
                }))
            }
            ExprKind::Binary { op, left, right } => {
                let l = self.eval(*left, feature)?;
                let r = self.eval(*right, feature)?;
                let result = apply_binary(*op, l.to_f64()?, r.to_f64()?);
                Ok(match node.value_type() {
                    Some(ValueType::Date) => Value::Date(result),
                    _ => Value::Number(result),
                })
            }
            ExprKind::Logical { op, left, right } => {
                let l = self.eval_number(*left, feature)?;
                let r = self.eval_number(*right, feature)?;
                Ok(Value::Number(match op {
                    LogicalOp::And => l * r,
                    LogicalOp::Or => (l + r).min(1.0),
                }))
            }
            ExprKind::Compare { op, left, right } => {
                let l = self.eval(*left, feature)?;
                let r = self.eval(*right, feature)?;
                Ok(Value::bool(compare(*op, &l, &r)?))
            }
            ExprKind::Between {
                input,
                lower,
                upper,
            } => {
                let x = self.eval_number(*input, feature)?;
                let lo = self.eval_number(*lower, feature)?;
                let hi = self.eval_number(*upper, feature)?;
                Ok(Value::bool(lo <= x && x <= hi))
            }
            ExprKind::In {
                input,
                values,
                negated,
            } => {
                let x = self.eval(*input, feature)?;
                let mut found = false;
                for candidate in values {
                    if self.eval(*candidate, feature)? == x {
                        found = true;
                        break;
                    }
                }
                Ok(Value::bool(found != *negated))
            }
            ExprKind::GlobalAggregate { value, .. } | ExprKind::ViewportAggregate { value, .. } => {
                Ok(Value::Number(*value))
            }
            ExprKind::Blend {
                from,
                to,
                mix,
                discrete,
                settled,
            } => {
                if *settled {
                    return self.eval(*to, feature);
                }
                let t = self.eval_number(*mix, feature)?.clamp(0.0, 1.0);
                if t >= 1.0 {
                    return self.eval(*to, feature);
                }
                let a = self.eval(*from, feature)?;
                let b = self.eval(*to, feature)?;
                if *discrete {
                    Ok(step(&a, &b, t))
                } else {
                    Ok(a.interpolate(&b, t)?)
                }
            }
            ExprKind::Animate {
                duration_ms,
                start_ms,
            } => Ok(Value::Number(self.animation_progress(*start_ms, *duration_ms))),
            ExprKind::Ease {
                interpolator,
                input,
            } => {
                let t = self.eval_number(*input, feature)?.clamp(0.0, 1.0);
                Ok(Value::Number(interpolator.eval(t)))
            }
            ExprKind::Linear { input, min, max } => {
                let x = self.eval_number(*input, feature)?;
                let lo = self.eval_number(*min, feature)?;
                let hi = self.eval_number(*max, feature)?;
                Ok(Value::Number(if hi == lo { 0.0 } else { (x - lo) / (hi - lo) }))
            }
            ExprKind::Ramp { input, palette } => {
                let x = self.eval(*input, feature)?;
                self.ramp_value(*input, &x, palette)
            }
            ExprKind::Buckets { input, breakpoints } => {
                let x = self.eval(*input, feature)?;
                let mut index = 0usize;
                match &x {
                    Value::Category(_) => {
                        index = breakpoints.len();
                        for (i, breakpoint) in breakpoints.iter().enumerate() {
                            if self.eval(*breakpoint, feature)? == x {
                                index = i;
                                break;
                            }
                        }
                    }
                    other => {
                        let x = other.to_f64()?;
                        for breakpoint in breakpoints {
                            if x >= self.eval_number(*breakpoint, feature)? {
                                index += 1;
                            }
                        }
                    }
                }
                Ok(Value::Number(index as f64))
            }
            ExprKind::Root { input, .. } => self.eval(*input, feature),
        }
    }

    pub(crate) fn animation_progress(&self, start_ms: f64, duration_ms: f64) -> f64 {
        if duration_ms <= 0.0 {
            return 1.0;
        }
        ((self.clock().now_ms() - start_ms) / duration_ms).clamp(0.0, 1.0)
    }

    fn ramp_value(&self, input: ExprId, x: &Value, palette: &[Value]) -> Result<Value, EvalError> {
        let Some(last) = palette.last() else {
            return Err(EvalError::NotCompiled(input));
        };
        if let Value::Category(category) = x {
            let index = match (self.kind(input), self.metadata()) {
                (ExprKind::Property { name }, Some(metadata)) => metadata
                    .column(name)
                    .and_then(|column| column.category_index(category)),
                _ => None,
            };
            // Categories beyond the palette share the last entry.
            return Ok(index
                .and_then(|i| palette.get(i))
                .unwrap_or(last)
                .clone());
        }
        let t = x.to_f64()?.clamp(0.0, 1.0);
        if palette.len() == 1 {
            return Ok(last.clone());
        }
        let position = t * (palette.len() - 1) as f64;
        let lower = (position.floor() as usize).min(palette.len() - 2);
        Ok(palette[lower].interpolate(&palette[lower + 1], position - lower as f64)?)
    }
}

fn apply_binary(op: BinaryOp, l: f64, r: f64) -> f64 {
    match op {
        BinaryOp::Add => l + r,
        BinaryOp::Sub => l - r,
        BinaryOp::Mul => l * r,
        BinaryOp::Div => l / r,
        BinaryOp::Mod => l % r,
        BinaryOp::Pow => l.powf(r),
    }
}

fn compare(op: CompareOp, l: &Value, r: &Value) -> Result<bool, EvalError> {
    if let (Value::Category(a), Value::Category(b)) = (l, r) {
        return Ok(match op {
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            _ => a.as_str().partial_cmp(b.as_str()).is_some_and(|o| match op {
                CompareOp::Lt => o.is_lt(),
                CompareOp::Le => o.is_le(),
                CompareOp::Gt => o.is_gt(),
                _ => o.is_ge(),
            }),
        });
    }
    let (a, b) = (l.to_f64()?, r.to_f64()?);
    Ok(match op {
        CompareOp::Lt => a < b,
        CompareOp::Le => a <= b,
        CompareOp::Gt => a > b,
        CompareOp::Ge => a >= b,
        CompareOp::Eq => a == b,
        CompareOp::Ne => a != b,
    })
}
