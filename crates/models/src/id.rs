use uuid::Uuid;

/// The entity class an identifier refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    Table,
    Field,
    Workspace,
    Row,
    Database,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Table => "ltb",
            Namespace::Field => "lfd",
            Namespace::Workspace => "lwk",
            Namespace::Row => "lrw",
            Namespace::Database => "ldb",
        }
    }

    fn parse(s: &str) -> Option<Namespace> {
        match s {
            "ltb" => Some(Namespace::Table),
            "lfd" => Some(Namespace::Field),
            "lwk" => Some(Namespace::Workspace),
            "lrw" => Some(Namespace::Row),
            "ldb" => Some(Namespace::Database),
            _ => None,
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    #[error("identifier has invalid length")]
    InvalidLength,
    #[error("identifier should be delimited with :")]
    MissingDelimiter,
    #[error("unknown identifier namespace {0}")]
    UnknownNamespace(String),
    #[error("identifier does not contain a valid uuid")]
    InvalidUuid,
    #[error("expected identifier with namespace {expected} (got {got})")]
    NamespaceMismatch { expected: Namespace, got: Namespace },
}

/// An identifier like `lwk:0f7a…`: a three-letter namespace, a colon, and a
/// uuid as 32 hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier {
    namespace: Namespace,
    uuid: Uuid,
}

impl Identifier {
    pub fn new(namespace: Namespace, uuid: Uuid) -> Self {
        Self { namespace, uuid }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn parse(s: &str) -> Result<Self, IdentifierError> {
        if s.len() != 36 {
            return Err(IdentifierError::InvalidLength);
        }
        if s.as_bytes()[3] != b':' {
            return Err(IdentifierError::MissingDelimiter);
        }
        let (Some(prefix), Some(hex)) = (s.get(..3), s.get(4..)) else {
            return Err(IdentifierError::InvalidUuid);
        };
        let namespace = Namespace::parse(prefix)
            .ok_or_else(|| IdentifierError::UnknownNamespace(prefix.to_string()))?;
        let uuid = Uuid::try_parse(hex).map_err(|_| IdentifierError::InvalidUuid)?;

        Ok(Self { namespace, uuid })
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace, self.uuid.simple())
    }
}

impl std::str::FromStr for Identifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Identifier::parse(s)
    }
}

impl serde::Serialize for Identifier {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Identifier {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let str_val = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
        Identifier::parse(str_val.as_ref())
            .map_err(|err| D::Error::custom(format!("invalid identifier: {err}")))
    }
}

macro_rules! identifier_type {
    ($(#[$attr:meta])* $name:ident, $namespace:expr) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Identifier);

        impl $name {
            pub fn new(uuid: Uuid) -> Self {
                Self(Identifier::new($namespace, uuid))
            }

            pub fn parse(s: &str) -> Result<Self, IdentifierError> {
                Identifier::parse(s).and_then(Self::try_from)
            }

            pub fn uuid(&self) -> Uuid {
                self.0.uuid()
            }

            pub fn identifier(&self) -> Identifier {
                self.0
            }
        }

        impl TryFrom<Identifier> for $name {
            type Error = IdentifierError;

            fn try_from(id: Identifier) -> Result<Self, IdentifierError> {
                if id.namespace() != $namespace {
                    return Err(IdentifierError::NamespaceMismatch {
                        expected: $namespace,
                        got: id.namespace(),
                    });
                }
                Ok(Self(id))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdentifierError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                self.0.serialize(serializer)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                use serde::de::Error;
                let id = Identifier::deserialize(deserializer)?;
                Self::try_from(id).map_err(|err| D::Error::custom(err.to_string()))
            }
        }
    };
}

identifier_type!(
    /// Identifies a table (`ltb:`).
    TableId,
    Namespace::Table
);
identifier_type!(
    /// Identifies a field (`lfd:`).
    FieldId,
    Namespace::Field
);
identifier_type!(
    /// Identifies a workspace (`lwk:`).
    WorkspaceId,
    Namespace::Workspace
);
identifier_type!(
    /// Identifies a row in a physical table (`lrw:`).
    RowId,
    Namespace::Row
);
identifier_type!(
    /// Identifies a database replica (`ldb:`).
    DatabaseId,
    Namespace::Database
);

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trip() {
        let id = Identifier::new(Namespace::Workspace, Uuid::from_u128(0x1234));
        let text = id.to_string();
        assert_eq!(text.len(), 36);
        assert_eq!(Identifier::parse(&text).unwrap(), id);
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(
            Identifier::parse("lwk:beef"),
            Err(IdentifierError::InvalidLength)
        );
        assert_eq!(
            Identifier::parse("lwk-00000000000000000000000000001234"),
            Err(IdentifierError::MissingDelimiter)
        );
        assert_eq!(
            Identifier::parse("xyz:00000000000000000000000000001234"),
            Err(IdentifierError::UnknownNamespace("xyz".to_string()))
        );
        assert_eq!(
            Identifier::parse("lwk:0000000000000000000000000000123z"),
            Err(IdentifierError::InvalidUuid)
        );
    }

    #[test]
    fn typed_identifiers_check_namespaces() {
        let text = "ltb:00000000000000000000000000001234";
        assert!(TableId::parse(text).is_ok());
        assert_eq!(
            RowId::parse(text),
            Err(IdentifierError::NamespaceMismatch {
                expected: Namespace::Row,
                got: Namespace::Table,
            })
        );
    }

    #[test]
    fn serde_uses_the_canonical_string() {
        let id = RowId::new(Uuid::from_u128(0xab));
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"lrw:000000000000000000000000000000ab\"");
        let parsed: RowId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
