//! Postgres wire messages and the identifiers shared by both directions.

pub mod backend;
pub mod frontend;

/// Wire representation of a parameter or column value.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FormatCode {
    #[default]
    Text = 0,
    Binary = 1,
}

impl FormatCode {
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            0 => Some(FormatCode::Text),
            1 => Some(FormatCode::Binary),
            _ => None,
        }
    }
}

impl From<FormatCode> for u16 {
    fn from(value: FormatCode) -> Self {
        value as u16
    }
}

impl std::fmt::Display for FormatCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormatCode::Text => write!(f, "text"),
            FormatCode::Binary => write!(f, "binary"),
        }
    }
}

/// The object ID of a Postgres data type.
///
/// Only the types the value codec understands get a name; any other OID the
/// server reports is carried through untouched.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(u32);

impl Oid {
    pub const UNSPECIFIED: Self = Self(0);
    pub const BOOL: Self = Self(16);
    pub const BYTEA: Self = Self(17);
    pub const CHAR: Self = Self(18);
    pub const NAME: Self = Self(19);
    pub const INT8: Self = Self(20);
    pub const INT2: Self = Self(21);
    pub const INT4: Self = Self(23);
    pub const TEXT: Self = Self(25);
    pub const OID: Self = Self(26);
    pub const JSON: Self = Self(114);
    pub const FLOAT4: Self = Self(700);
    pub const FLOAT8: Self = Self(701);
    pub const UNKNOWN: Self = Self(705);
    pub const BPCHAR: Self = Self(1042);
    pub const VARCHAR: Self = Self(1043);
    pub const NUMERIC: Self = Self(1700);

    pub const fn new(oid: u32) -> Self {
        Self(oid)
    }

    /// Integer types, decoded from binary as big-endian two's complement.
    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8 | Oid::OID)
    }

    /// IEEE-754 floating point types.
    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }

    /// Types whose binary representation is the text itself.
    pub fn is_textual(self) -> bool {
        matches!(
            self,
            Oid::TEXT
                | Oid::VARCHAR
                | Oid::BPCHAR
                | Oid::NAME
                | Oid::CHAR
                | Oid::UNKNOWN
                | Oid::JSON
        )
    }
}

impl From<u32> for Oid {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Oid> for u32 {
    fn from(value: Oid) -> Self {
        value.0
    }
}

impl std::fmt::Display for Oid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            Oid::UNSPECIFIED => "unspecified",
            Oid::BOOL => "bool",
            Oid::BYTEA => "bytea",
            Oid::CHAR => "char",
            Oid::NAME => "name",
            Oid::INT8 => "int8",
            Oid::INT2 => "int2",
            Oid::INT4 => "int4",
            Oid::TEXT => "text",
            Oid::OID => "oid",
            Oid::JSON => "json",
            Oid::FLOAT4 => "float4",
            Oid::FLOAT8 => "float8",
            Oid::UNKNOWN => "unknown",
            Oid::BPCHAR => "bpchar",
            Oid::VARCHAR => "varchar",
            Oid::NUMERIC => "numeric",
            _ => return write!(f, "oid({})", self.0),
        };
        write!(f, "{name}")
    }
}

impl std::fmt::Debug for Oid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Oid({})", self.0)
    }
}
