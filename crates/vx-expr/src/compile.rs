use std::sync::Arc;

use vx_metadata::Metadata;
use vx_types::{Value, ValueType};

use crate::{AggregateOp, BinaryOp, CompareOp, CompileError, ExprArena, ExprId, ExprKind, UnaryOp};

fn mismatch(context: &'static str, expected: &'static str, found: &[ValueType]) -> CompileError {
    let found = found
        .iter()
        .map(|t| format!("{t:?}"))
        .collect::<Vec<_>>()
        .join(" and ");
    CompileError::TypeMismatch {
        context,
        expected,
        found,
    }
}

fn expect_number(context: &'static str, ty: ValueType) -> Result<(), CompileError> {
    if ty == ValueType::Number {
        Ok(())
    } else {
        Err(mismatch(context, "Number", &[ty]))
    }
}

impl ExprArena {
    /// Compiles the tree rooted at `id` against a metadata snapshot and returns its type.
    ///
    /// Children compile first. Recompiling a node rebinds it to the new snapshot.
    pub fn compile(
        &mut self,
        id: ExprId,
        metadata: &Arc<Metadata>,
    ) -> Result<ValueType, CompileError> {
        self.metadata = Some(Arc::clone(metadata));
        self.compile_node(id, metadata)
    }

    fn compile_node(
        &mut self,
        id: ExprId,
        metadata: &Arc<Metadata>,
    ) -> Result<ValueType, CompileError> {
        let child_types = self
            .children(id)
            .into_iter()
            .map(|child| self.compile_node(child, metadata))
            .collect::<Result<Vec<_>, _>>()?;
        let ty = self.resolve_type(id, &child_types, metadata)?;
        match self.kind(id) {
            ExprKind::GlobalAggregate { .. } => self.bind_global_aggregate(id, metadata)?,
            ExprKind::ViewportAggregate { .. } => self.bind_viewport_aggregate(id, metadata)?,
            _ => {}
        }
        self.nodes[id.index()].ty = Some(ty);
        Ok(ty)
    }

    fn resolve_type(
        &self,
        id: ExprId,
        children: &[ValueType],
        metadata: &Metadata,
    ) -> Result<ValueType, CompileError> {
        use ValueType::{Category, Color, Date, Number};

        match self.kind(id) {
            ExprKind::Constant(value) => Ok(value.value_type()),
            ExprKind::Property { name } => metadata
                .column(name)
                .map(|column| column.value_type)
                .ok_or_else(|| CompileError::UnknownProperty { name: name.clone() }),
            ExprKind::Now | ExprKind::Animate { .. } => Ok(Number),
            ExprKind::Unary { op, .. } => {
                let context = match op {
                    UnaryOp::Not => "not",
                    _ => "unary",
                };
                expect_number(context, children[0])?;
                Ok(Number)
            }
            ExprKind::Binary { op, .. } => match (op, children[0], children[1]) {
                (_, Number, Number) => Ok(Number),
                (BinaryOp::Add | BinaryOp::Sub, Date, Number) => Ok(Date),
                (BinaryOp::Add, Number, Date) => Ok(Date),
                (BinaryOp::Sub, Date, Date) => Ok(Number),
                (_, l, r) => Err(mismatch("arithmetic", "Number operands", &[l, r])),
            },
            ExprKind::Logical { .. } => match (children[0], children[1]) {
                (Number, Number) => Ok(Number),
                (l, r) => Err(mismatch("logical", "Number operands", &[l, r])),
            },
            ExprKind::Compare { op, .. } => {
                let (l, r) = (children[0], children[1]);
                let ordered = !matches!(op, CompareOp::Eq | CompareOp::Ne);
                if l != r {
                    return Err(mismatch("comparison", "operands of the same type", &[l, r]));
                }
                if ordered && !l.is_ordered() {
                    return Err(mismatch("comparison", "Number or Date operands", &[l, r]));
                }
                if l == Color {
                    return Err(mismatch("comparison", "comparable operands", &[l, r]));
                }
                Ok(Number)
            }
            ExprKind::Between { .. } => {
                let input = children[0];
                if !input.is_ordered() || children[1..].iter().any(|t| *t != input) {
                    return Err(mismatch("between", "Number or Date bounds matching the input", children));
                }
                Ok(Number)
            }
            ExprKind::In { negated, .. } => {
                let context = if *negated { "nin" } else { "in" };
                let input = children[0];
                if !matches!(input, Number | Category) || children[1..].iter().any(|t| *t != input) {
                    return Err(mismatch(context, "Number or Category values matching the input", children));
                }
                Ok(Number)
            }
            ExprKind::GlobalAggregate { op, .. } | ExprKind::ViewportAggregate { op, .. } => {
                let context = if matches!(self.kind(id), ExprKind::GlobalAggregate { .. }) {
                    "global aggregate"
                } else {
                    "viewport aggregate"
                };
                if let AggregateOp::Percentile(p) = op {
                    if !(0.0..=100.0).contains(p) {
                        return Err(CompileError::InvalidArgument {
                            operator: context,
                            detail: format!("percentile rank {p} is outside [0, 100]"),
                        });
                    }
                }
                if !matches!(op, AggregateOp::Count) && !children[0].is_ordered() {
                    return Err(mismatch(context, "a Number or Date input", children));
                }
                Ok(Number)
            }
            ExprKind::Blend { .. } => {
                let (from, to, mix) = (children[0], children[1], children[2]);
                if from != to {
                    return Err(mismatch("blend", "from and to of the same type", &[from, to]));
                }
                expect_number("blend", mix)?;
                Ok(to)
            }
            ExprKind::Ease { .. } => {
                expect_number("ease", children[0])?;
                Ok(Number)
            }
            ExprKind::Linear { .. } => {
                let input = children[0];
                if !input.is_ordered() || children[1..].iter().any(|t| *t != input) {
                    return Err(mismatch("linear", "Number or Date bounds matching the input", children));
                }
                Ok(Number)
            }
            ExprKind::Ramp { input, palette } => {
                let Some(first) = palette.first() else {
                    return Err(CompileError::InvalidArgument {
                        operator: "ramp",
                        detail: "palette must not be empty".to_owned(),
                    });
                };
                let out = first.value_type();
                if !matches!(out, Color | Number) || palette.iter().any(|v| v.value_type() != out) {
                    return Err(CompileError::InvalidArgument {
                        operator: "ramp",
                        detail: "palette entries must all be colors or all be numbers".to_owned(),
                    });
                }
                match children[0] {
                    Number => Ok(out),
                    Category if matches!(self.kind(*input), ExprKind::Property { .. }) => Ok(out),
                    Category => Err(CompileError::InvalidArgument {
                        operator: "ramp",
                        detail: "a categorical ramp requires a property input".to_owned(),
                    }),
                    other => Err(mismatch("ramp", "a Number or Category input", &[other])),
                }
            }
            ExprKind::Buckets { .. } => {
                let input = children[0];
                if !matches!(input, Number | Category) || children[1..].iter().any(|t| *t != input) {
                    return Err(mismatch("buckets", "breakpoints matching a Number or Category input", children));
                }
                Ok(Number)
            }
            ExprKind::Root { channel, .. } => {
                let expected = channel.expected_type();
                if children[0] != expected {
                    return Err(CompileError::TypeMismatch {
                        context: channel.name(),
                        expected: match expected {
                            Color => "Color",
                            _ => "Number",
                        },
                        found: format!("{:?}", children[0]),
                    });
                }
                Ok(expected)
            }
        }
    }

    /// Category id for a constant, as stored in category textures. Unknown categories map to -1.
    pub(crate) fn category_id(&self, value: &Value) -> f64 {
        match (value, self.metadata.as_ref()) {
            (Value::Category(c), Some(metadata)) => {
                metadata.category_id(c).map_or(-1.0, f64::from)
            }
            _ => -1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use vx_metadata::{ColumnStats, Metadata};
    use vx_types::{Color, Value, ValueType};

    use crate::{AggregateOp, Channel, CompileError, ExprArena};

    fn metadata() -> Arc<Metadata> {
        Arc::new(
            Metadata::new(
                vec![
                    ColumnStats::numeric("price", 0.0, 100.0, 50.0, 500.0, 10.0),
                    ColumnStats::categorical("kind", &["red", "blue"]),
                ],
                Vec::new(),
            )
            .expect("metadata"),
        )
    }

    #[test]
    fn compile_resolves_types_bottom_up() {
        let mut arena = ExprArena::new();
        let price = arena.property("price");
        let cheap = arena.lt(price, 10);
        let root = arena.root(Channel::Filter, cheap);

        let ty = arena.compile(root, &metadata()).expect("compile");
        assert_eq!(ty, ValueType::Number);
        assert_eq!(arena.value_type(price), Some(ValueType::Number));
        assert!(arena.is_compiled(cheap));
    }

    #[test]
    fn unknown_property_is_reported_by_name() {
        let mut arena = ExprArena::new();
        let missing = arena.property("height");
        let err = arena.compile(missing, &metadata()).expect_err("must fail");
        assert_eq!(
            err,
            CompileError::UnknownProperty {
                name: "height".to_owned()
            }
        );
        assert!(!arena.is_compiled(missing));
    }

    #[test]
    fn comparing_a_category_with_a_number_is_a_type_mismatch() {
        let mut arena = ExprArena::new();
        let kind = arena.property("kind");
        let cmp = arena.eq(kind, 3);
        let err = arena.compile(cmp, &metadata()).expect_err("must fail");
        assert!(matches!(
            err,
            CompileError::TypeMismatch {
                context: "comparison",
                ..
            }
        ));
        assert!(err.to_string().contains("Category and Number"));
    }

    #[test]
    fn color_channel_rejects_numbers() {
        let mut arena = ExprArena::new();
        let root = arena.root(Channel::Color, 4);
        let err = arena.compile(root, &metadata()).expect_err("must fail");
        assert_eq!(
            err.to_string(),
            "type mismatch in `color`: expected Color, found Number"
        );
    }

    #[test]
    fn percentile_rank_must_be_in_range() {
        let mut arena = ExprArena::new();
        let price = arena.property("price");
        let agg = arena.global(AggregateOp::Percentile(120.0), price);
        let err = arena.compile(agg, &metadata()).expect_err("must fail");
        assert!(matches!(err, CompileError::InvalidArgument { .. }));
    }

    #[test]
    fn global_aggregate_over_an_expression_is_rejected() {
        let mut arena = ExprArena::new();
        let price = arena.property("price");
        let doubled = arena.mul(price, 2);
        let agg = arena.global(AggregateOp::Max, doubled);
        let err = arena.compile(agg, &metadata()).expect_err("must fail");
        assert!(matches!(err, CompileError::InvalidArgument { .. }));
    }

    #[test]
    fn ramp_requires_a_uniform_palette() {
        let mut arena = ExprArena::new();
        let price = arena.property("price");
        let ramp = arena.ramp(
            price,
            vec![Value::Color(Color::BLACK), Value::Number(1.0)],
        );
        let err = arena.compile(ramp, &metadata()).expect_err("must fail");
        assert!(matches!(err, CompileError::InvalidArgument { operator: "ramp", .. }));

        let empty = arena.property("price");
        let ramp = arena.ramp(empty, Vec::new());
        assert!(arena.compile(ramp, &metadata()).is_err());
    }

    #[test]
    fn category_ramp_resolves_to_color() {
        let mut arena = ExprArena::new();
        let kind = arena.property("kind");
        let ramp = arena.ramp(
            kind,
            vec![Value::Color(Color::BLACK), Value::Color(Color::WHITE)],
        );
        let root = arena.root(Channel::Color, ramp);
        assert_eq!(arena.compile(root, &metadata()).expect("compile"), ValueType::Color);
    }
}
