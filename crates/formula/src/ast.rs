use std::collections::{BTreeSet, HashMap};

use crate::functions::FunctionRegistry;
use crate::FormulaError;

/// A concrete type, like "number".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConcreteType {
    Number,
    String,
    DateTime,
    Boolean,
}

impl std::fmt::Display for ConcreteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConcreteType::Number => "number",
            ConcreteType::String => "string",
            ConcreteType::DateTime => "datetime",
            ConcreteType::Boolean => "boolean",
        })
    }
}

/// A formula type: a concrete type, a union of concrete types (flattened on
/// construction), or a list.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Concrete(ConcreteType),
    Union(BTreeSet<ConcreteType>),
    List(Box<Type>),
}

impl Type {
    /// Build a union from member types, flattening nested unions.
    pub fn union(members: impl IntoIterator<Item = Type>) -> Result<Type, FormulaError> {
        let mut set = BTreeSet::new();
        for member in members {
            match member {
                Type::Concrete(concrete) => {
                    set.insert(concrete);
                }
                Type::Union(inner) => set.extend(inner),
                Type::List(_) => {
                    return Err(FormulaError::Type(
                        "list types cannot be members of a union".to_string(),
                    ))
                }
            }
        }
        Ok(Type::Union(set))
    }

    pub fn is_subtype_of(&self, rhs: &Type) -> bool {
        match (self, rhs) {
            (Type::Concrete(a), Type::Concrete(b)) => a == b,
            (Type::Concrete(a), Type::Union(members)) => members.contains(a),
            (Type::Union(a), Type::Union(b)) => a.is_subset(b),
            (Type::Union(a), Type::Concrete(b)) => a.len() == 1 && a.iter().next() == Some(b),
            (Type::List(a), Type::List(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Concrete(concrete) => concrete.fmt(f),
            Type::Union(members) => {
                let mut first = true;
                for member in members {
                    if !first {
                        f.write_str(" | ")?;
                    }
                    member.fmt(f)?;
                    first = false;
                }
                Ok(())
            }
            Type::List(inner) => write!(f, "[{inner}]"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Mul,
    Div,
    Plus,
    Minus,
    Ampersand,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Minus,
}

/// The environment a formula is checked and lowered against: the variables
/// (physical column names) in scope with their types, the callable functions,
/// and the table's id / created-time columns.
pub struct TypeEnvironment<'a> {
    pub variables: HashMap<String, Type>,
    pub functions: &'a FunctionRegistry,
    pub id_field: String,
    pub created_time_field: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Number(f64),
    String(String),
    Variable(String),
    BinOp {
        left: Box<Node>,
        op: BinaryOp,
        right: Box<Node>,
    },
    UnOp {
        op: UnaryOp,
        right: Box<Node>,
    },
    FunctionCall {
        name: String,
        args: Vec<Node>,
    },
    Array(Vec<Node>),
    /// Inserted during type checking: a coercion of the inner node to the
    /// target type, made explicit so lowering never has to infer one.
    Cast {
        inner: Box<Node>,
        target: Type,
    },
}

/// Replace `node` with a cast of itself to `target`.
pub(crate) fn wrap_cast(node: &mut Node, target: Type) {
    let inner = std::mem::replace(node, Node::Number(0.0));
    *node = Node::Cast {
        inner: Box::new(inner),
        target,
    };
}

/// Resolve `node`'s type and wrap it in a cast if it is not already a
/// subtype of `expected`.
fn coerce(node: &mut Node, expected: &Type, env: &TypeEnvironment) -> Result<(), FormulaError> {
    let actual = node.resolve_type(env)?;
    if !actual.is_subtype_of(expected) {
        wrap_cast(node, expected.clone());
    }
    Ok(())
}

impl Node {
    /// Type-check this node against `env`, inserting explicit `Cast` nodes
    /// around children whose types need coercion, and return the node's
    /// resolved type.
    pub fn resolve_type(&mut self, env: &TypeEnvironment) -> Result<Type, FormulaError> {
        match self {
            Node::Number(_) => Ok(Type::Concrete(ConcreteType::Number)),
            Node::String(_) => Ok(Type::Concrete(ConcreteType::String)),
            Node::Cast { target, .. } => Ok(target.clone()),
            Node::Variable(name) => env
                .variables
                .get(name)
                .cloned()
                .ok_or_else(|| FormulaError::Type(format!("variable {name} does not exist"))),
            Node::UnOp {
                op: UnaryOp::Minus,
                right,
            } => {
                coerce(right, &Type::Concrete(ConcreteType::Number), env)?;
                Ok(Type::Concrete(ConcreteType::Number))
            }
            Node::BinOp { left, op, right } => {
                let op = *op;
                let operand = match op {
                    BinaryOp::Mul
                    | BinaryOp::Div
                    | BinaryOp::Plus
                    | BinaryOp::Minus
                    | BinaryOp::Le
                    | BinaryOp::Ge
                    | BinaryOp::Ne
                    | BinaryOp::Lt
                    | BinaryOp::Gt => Type::Concrete(ConcreteType::Number),
                    BinaryOp::Ampersand => Type::Concrete(ConcreteType::String),
                    // Equality takes its type from the right operand.
                    BinaryOp::Eq => right.resolve_type(env)?,
                };

                coerce(left, &operand, env)?;
                coerce(right, &operand, env)?;

                match op {
                    BinaryOp::Eq
                    | BinaryOp::Ne
                    | BinaryOp::Lt
                    | BinaryOp::Gt
                    | BinaryOp::Le
                    | BinaryOp::Ge => Ok(Type::Concrete(ConcreteType::Boolean)),
                    _ => Ok(operand),
                }
            }
            Node::FunctionCall { name, args } => {
                let validator = env
                    .functions
                    .validator(name)
                    .ok_or_else(|| FormulaError::Type(format!("function {name} does not exist")))?;
                let mut arg_types = Vec::with_capacity(args.len());
                for arg in args.iter_mut() {
                    arg_types.push(arg.resolve_type(env)?);
                }
                validator(args, &arg_types)
            }
            Node::Array(elements) => {
                let mut element_types = Vec::with_capacity(elements.len());
                for element in elements.iter_mut() {
                    element_types.push(element.resolve_type(env)?);
                }
                let list = Type::List(Box::new(Type::union(element_types.clone())?));
                for (element, actual) in elements.iter_mut().zip(&element_types) {
                    if !actual.is_subtype_of(&list) {
                        wrap_cast(element, list.clone());
                    }
                }
                Ok(list)
            }
        }
    }
}
