use serde::Serialize;
use uuid::Uuid;

use crate::ast::{BinaryOp, ConcreteType, Node, Type, TypeEnvironment, UnaryOp};
use crate::{Formula, FormulaError};

/// A value bound as a positional SQL parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Text(String),
    Uuid(Uuid),
}

/// Lowers type-checked AST nodes into SQL text, accumulating positional
/// parameters (`$1`, `$2`, …) in insertion order. A single lowerer may be
/// shared across several fragments (predicate, sort expression) so their
/// parameters number from one sequence.
pub struct Lowerer<'a> {
    pub env: &'a TypeEnvironment<'a>,
    values: Vec<Value>,
}

impl<'a> Lowerer<'a> {
    pub fn new(env: &'a TypeEnvironment<'a>) -> Self {
        Lowerer {
            env,
            values: Vec::new(),
        }
    }

    /// Append a parameter and return its `$N` placeholder.
    pub fn bind(&mut self, value: Value) -> String {
        self.values.push(value);
        format!("${}", self.values.len())
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Type-check `node` and lower it for use as a boolean filter. The
    /// outermost type selects the predicate wrapping.
    pub fn predicate(&mut self, node: &mut Node) -> Result<String, FormulaError> {
        let ty = node.resolve_type(self.env)?;
        let Type::Concrete(concrete) = ty else {
            return Err(FormulaError::Type(format!(
                "only formulae returning concrete types, like number or string, are supported (got {ty})"
            )));
        };

        let expr = self.lower(node)?;

        match concrete {
            ConcreteType::Number => Ok(format!("{expr} <> 0")),
            ConcreteType::String => Ok(format!(r#"{expr} <> """#)),
            ConcreteType::Boolean => Ok(expr),
            ConcreteType::DateTime => Err(FormulaError::Type(format!(
                "don't know how to handle return type {concrete}"
            ))),
        }
    }

    /// Type-check `node` and lower it as a bare expression (for ORDER BY).
    pub fn expression(&mut self, node: &mut Node) -> Result<String, FormulaError> {
        let ty = node.resolve_type(self.env)?;
        if !matches!(ty, Type::Concrete(_)) {
            return Err(FormulaError::Type(format!(
                "only formulae returning concrete types, like number or string, are supported (got {ty})"
            )));
        }
        self.lower(node)
    }

    /// Lower an already type-checked node.
    pub fn lower(&mut self, node: &Node) -> Result<String, FormulaError> {
        match node {
            Node::Cast { inner, target } => {
                let sql_type = match target {
                    Type::Concrete(ConcreteType::String) => "text",
                    Type::Concrete(ConcreteType::Number) => "double precision",
                    Type::Concrete(ConcreteType::Boolean) => "boolean",
                    Type::Concrete(ConcreteType::DateTime) => "timestamp",
                    other => {
                        return Err(FormulaError::Internal(format!(
                            "unsupported cast to {other}"
                        )))
                    }
                };
                Ok(format!("cast({} as {sql_type})", self.lower(inner)?))
            }
            Node::BinOp { left, op, right } => {
                let op_text = match op {
                    BinaryOp::Mul => "*",
                    BinaryOp::Div => "/",
                    BinaryOp::Plus => "+",
                    BinaryOp::Minus => "-",
                    BinaryOp::Eq => "=",
                    BinaryOp::Lt => "<",
                    BinaryOp::Gt => ">",
                    BinaryOp::Le if cfg!(feature = "inverted-ranges") => ">=",
                    BinaryOp::Le => "<=",
                    BinaryOp::Ge if cfg!(feature = "inverted-ranges") => "<=",
                    BinaryOp::Ge => ">=",
                    other => {
                        return Err(FormulaError::Type(format!(
                            "unsupported binary operator {other:?}"
                        )))
                    }
                };
                Ok(format!(
                    "({} {op_text} {})",
                    self.lower(left)?,
                    self.lower(right)?
                ))
            }
            Node::UnOp {
                op: UnaryOp::Minus,
                right,
            } => Ok(format!("(-{})", self.lower(right)?)),
            Node::Number(value) => Ok(self.bind(Value::Number(*value))),
            Node::String(value) => Ok(self.bind(Value::Text(value.clone()))),
            // The name is a physical column resolved from replica
            // configuration upstream, never raw request text.
            Node::Variable(name) => Ok(name.clone()),
            Node::FunctionCall { name, args } => {
                let env = self.env;
                let implementation = env.functions.implementation(name).ok_or_else(|| {
                    FormulaError::Internal(format!(
                        "no function implementation associated with {name}"
                    ))
                })?;
                implementation(self, args)
            }
            Node::Array(_) => Err(FormulaError::Type(
                "array literals cannot be lowered to SQL".to_string(),
            )),
        }
    }
}

/// Type-check and lower `formula` for use as a boolean filter, returning the
/// SQL text and its parameters.
pub fn to_sql(
    formula: &Formula,
    env: &TypeEnvironment,
) -> Result<(String, Vec<Value>), FormulaError> {
    let mut ast = formula.ast().clone();
    let mut lowerer = Lowerer::new(env);
    let text = lowerer.predicate(&mut ast)?;
    Ok((text, lowerer.into_values()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::functions::FunctionRegistry;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn env(functions: &FunctionRegistry) -> TypeEnvironment<'_> {
        TypeEnvironment {
            variables: [("age".to_string(), Type::Concrete(ConcreteType::Number))]
                .into_iter()
                .collect(),
            functions,
            id_field: "id".to_string(),
            created_time_field: "created".to_string(),
        }
    }

    fn lowered(code: &str) -> (String, Vec<Value>) {
        let functions = FunctionRegistry::builtins();
        let env = env(&functions);
        to_sql(&Formula::parse(code).unwrap(), &env).unwrap()
    }

    #[test]
    fn equality_with_arithmetic() {
        let (sql, values) = lowered("age + 1 = 10");
        assert_eq!(sql, "((age + $1) = $2)");
        assert_eq!(values, vec![Value::Number(1.0), Value::Number(10.0)]);
    }

    #[test]
    fn number_results_wrap_in_a_nonzero_check() {
        let (sql, values) = lowered("age");
        assert_eq!(sql, "age <> 0");
        assert_eq!(values, vec![]);
    }

    #[test]
    fn string_results_wrap_in_a_nonempty_check() {
        let (sql, values) = lowered("\"abc\"");
        assert_eq!(sql, r#"$1 <> """#);
        assert_eq!(values, vec![Value::Text("abc".to_string())]);
    }

    #[test]
    fn datetime_results_are_rejected() {
        let functions = FunctionRegistry::builtins();
        let env = env(&functions);
        assert_eq!(
            to_sql(&Formula::parse("NOW()").unwrap(), &env),
            Err(FormulaError::Type(
                "don't know how to handle return type datetime".to_string()
            ))
        );
    }

    #[test]
    fn datetime_diff_lowers_to_extract() {
        let (sql, values) = lowered("DATETIME_DIFF(NOW(), CREATED_TIME(), \"days\")");
        assert_eq!(sql, "EXTRACT(days FROM AGE(now(), (created))) <> 0");
        assert_eq!(values, vec![]);
    }

    #[test]
    fn datetime_diff_requires_a_literal_unit() {
        let functions = FunctionRegistry::builtins();
        let mut env = env(&functions);
        env.variables.insert(
            "unit".to_string(),
            Type::Concrete(ConcreteType::String),
        );

        let formula = Formula::parse("DATETIME_DIFF(NOW(), CREATED_TIME(), unit)").unwrap();
        assert_eq!(
            to_sql(&formula, &env),
            Err(FormulaError::Type(
                "DATETIME_DIFF only supports literals as a third argument".to_string()
            ))
        );

        let formula = Formula::parse("DATETIME_DIFF(NOW(), CREATED_TIME(), \"fortnights\")")
            .unwrap();
        assert_eq!(
            to_sql(&formula, &env),
            Err(FormulaError::Type("invalid unit fortnights".to_string()))
        );
    }

    #[test]
    fn ordering_comparisons_coerce_datetimes_to_numbers() {
        let (sql, values) = lowered("CREATED_TIME() > NOW()");
        assert_eq!(
            sql,
            "(cast((created) as double precision) > cast(now() as double precision))"
        );
        assert_eq!(values, vec![]);
    }

    #[cfg(feature = "inverted-ranges")]
    #[test]
    fn bound_operators_lower_swapped() {
        let (sql, values) = lowered("age >= 18");
        assert_eq!(sql, "(age <= $1)");
        assert_eq!(values, vec![Value::Number(18.0)]);

        let (sql, _) = lowered("age <= 18");
        assert_eq!(sql, "(age >= $1)");
    }

    #[cfg(not(feature = "inverted-ranges"))]
    #[test]
    fn bound_operators_lower_as_written() {
        let (sql, _) = lowered("age >= 18");
        assert_eq!(sql, "(age >= $1)");

        let (sql, _) = lowered("age <= 18");
        assert_eq!(sql, "(age <= $1)");
    }

    #[test]
    fn strict_comparisons_lower_as_written() {
        let (sql, _) = lowered("age > 18");
        assert_eq!(sql, "(age > $1)");

        let (sql, _) = lowered("age < 18");
        assert_eq!(sql, "(age < $1)");
    }

    #[test]
    fn unary_minus_and_division() {
        let (sql, values) = lowered("-age / 2 = 3");
        assert_eq!(sql, "(((-age) / $1) = $2)");
        assert_eq!(values, vec![Value::Number(2.0), Value::Number(3.0)]);
    }

    #[test]
    fn concatenation_has_no_lowering() {
        let functions = FunctionRegistry::builtins();
        let env = env(&functions);
        let formula = Formula::parse("\"a\" & \"b\"").unwrap();
        assert_eq!(
            to_sql(&formula, &env),
            Err(FormulaError::Type(
                "unsupported binary operator Ampersand".to_string()
            ))
        );
    }

    #[test]
    fn casts_of_unions_are_internal_errors() {
        let functions = FunctionRegistry::builtins();
        let env = TypeEnvironment {
            variables: HashMap::new(),
            functions: &functions,
            id_field: "id".to_string(),
            created_time_field: "created".to_string(),
        };
        let mut lowerer = Lowerer::new(&env);
        let node = Node::Cast {
            inner: Box::new(Node::Number(1.0)),
            target: Type::union([Type::Concrete(ConcreteType::Number)]).unwrap(),
        };
        assert!(matches!(
            lowerer.lower(&node),
            Err(FormulaError::Internal(_))
        ));
    }
}
