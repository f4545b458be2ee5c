use std::collections::HashMap;

use crate::ast::{wrap_cast, ConcreteType, Node, Type};
use crate::sql::Lowerer;
use crate::FormulaError;

/// Checks a call's argument types and returns the call's result type. May
/// rewrite the argument nodes to insert casts.
pub type Validator =
    Box<dyn Fn(&mut Vec<Node>, &[Type]) -> Result<Type, FormulaError> + Send + Sync>;

/// Lowers a call to SQL text, appending any parameters through the lowerer.
pub type Implementation =
    Box<dyn Fn(&mut Lowerer<'_>, &[Node]) -> Result<String, FormulaError> + Send + Sync>;

/// Named formula functions. A name is usable only once both its validator and
/// its implementation are registered. The registry is assembled at startup
/// and immutable afterwards: registration needs `&mut self`, and everything
/// on the execution path holds a shared reference.
pub struct FunctionRegistry {
    validators: HashMap<String, Validator>,
    implementations: HashMap<String, Implementation>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        FunctionRegistry {
            validators: HashMap::new(),
            implementations: HashMap::new(),
        }
    }

    /// The built-in function set.
    pub fn builtins() -> Self {
        let mut registry = Self::new();
        register_builtins(&mut registry);
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        validator: Validator,
        implementation: Implementation,
    ) {
        let name = name.into();
        self.validators.insert(name.clone(), validator);
        self.implementations.insert(name, implementation);
    }

    pub fn validator(&self, name: &str) -> Option<&Validator> {
        self.validators.get(name)
    }

    pub fn implementation(&self, name: &str) -> Option<&Implementation> {
        self.implementations.get(name)
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Check a call's arity against `expected` and wrap each argument whose type
/// is not already a subtype of its expected type in a cast.
pub fn cast_args(
    name: &str,
    args: &mut [Node],
    arg_types: &[Type],
    expected: &[Type],
) -> Result<(), FormulaError> {
    if arg_types.len() != expected.len() {
        return Err(FormulaError::Type(format!(
            "{name} expected {} arguments, got {}",
            expected.len(),
            arg_types.len()
        )));
    }

    for ((node, actual), want) in args.iter_mut().zip(arg_types).zip(expected) {
        if !actual.is_subtype_of(want) {
            wrap_cast(node, want.clone());
        }
    }

    Ok(())
}

const DATETIME_DIFF_UNITS: &[&str] = &[
    "years",
    "months",
    "days",
    "hours",
    "minutes",
    "seconds",
    "milliseconds",
    "quarters",
    "ms",
    "s",
    "m",
    "h",
    "w",
    "M",
    "Q",
    "y",
];

fn register_builtins(registry: &mut FunctionRegistry) {
    // CREATED_TIME(): the row's creation timestamp.
    registry.register(
        "CREATED_TIME",
        Box::new(|args, arg_types| {
            cast_args("CREATED_TIME", args, arg_types, &[])?;
            Ok(Type::Concrete(ConcreteType::DateTime))
        }),
        Box::new(|lowerer, _args| Ok(format!("({})", lowerer.env.created_time_field))),
    );

    // NOW(): the timestamp of this moment in time.
    registry.register(
        "NOW",
        Box::new(|args, arg_types| {
            cast_args("NOW", args, arg_types, &[])?;
            Ok(Type::Concrete(ConcreteType::DateTime))
        }),
        Box::new(|_lowerer, _args| Ok("now()".to_string())),
    );

    // DATETIME_DIFF(d1, d2, unit): the difference between two dates in the
    // unit named by the third argument, which must be a string literal.
    registry.register(
        "DATETIME_DIFF",
        Box::new(|args, arg_types| {
            cast_args(
                "DATETIME_DIFF",
                args,
                arg_types,
                &[
                    Type::Concrete(ConcreteType::DateTime),
                    Type::Concrete(ConcreteType::DateTime),
                    Type::Concrete(ConcreteType::String),
                ],
            )?;
            Ok(Type::Concrete(ConcreteType::Number))
        }),
        Box::new(|lowerer, args| {
            let [first, second, unit] = args else {
                return Err(FormulaError::Type(format!(
                    "DATETIME_DIFF expected 3 arguments, got {}",
                    args.len()
                )));
            };
            let Node::String(unit) = unit else {
                return Err(FormulaError::Type(
                    "DATETIME_DIFF only supports literals as a third argument".to_string(),
                ));
            };
            if !DATETIME_DIFF_UNITS.contains(&unit.as_str()) {
                return Err(FormulaError::Type(format!("invalid unit {unit}")));
            }

            let first = lowerer.lower(first)?;
            let second = lowerer.lower(second)?;
            // The unit is interpolated rather than bound, which is safe only
            // because it was checked against the allowed unit list above.
            Ok(format!("EXTRACT({unit} FROM AGE({first}, {second}))"))
        }),
    );
}
