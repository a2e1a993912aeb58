use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseEnumError;

/// Numeric primary key of a user account.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Permanent identifier of an entity, shared by all of its versions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct LocalId(pub i64);

impl std::fmt::Display for LocalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LocalId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(LocalId)
    }
}

/// Default readability of a version for users other than the owner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Visibility {
    Public = 1,
    Friendly = 2,
    Private = 3,
}

impl Visibility {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Public),
            2 => Some(Self::Friendly),
            3 => Some(Self::Private),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Friendly => "friendly",
            Self::Private => "private",
        }
    }
}

impl Default for Visibility {
    fn default() -> Self {
        Self::Private
    }
}

impl FromStr for Visibility {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" | "1" => Ok(Self::Public),
            "friendly" | "2" => Ok(Self::Friendly),
            "private" | "3" => Ok(Self::Private),
            _ => Err(ParseEnumError::new("safety level", s)),
        }
    }
}

/// Lifecycle of an entity. Transitions are append-only version writes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LifecycleState {
    Active = 10,
    Deleted = 20,
    Archived = 30,
}

impl LifecycleState {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            10 => Some(Self::Active),
            20 => Some(Self::Deleted),
            30 => Some(Self::Archived),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deleted => "deleted",
            Self::Archived => "archived",
        }
    }

    /// Whether moving from `self` to `target` is a legal lifecycle change.
    ///
    /// Archived is terminal. Staying in Active or Deleted is allowed and
    /// treated by the store as a no-op.
    pub fn can_transition_to(self, target: LifecycleState) -> bool {
        match (self, target) {
            (Self::Archived, _) => false,
            (_, Self::Archived) => true,
            (Self::Active, Self::Deleted) | (Self::Deleted, Self::Active) => true,
            (Self::Active, Self::Active) | (Self::Deleted, Self::Deleted) => true,
        }
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::Active
    }
}

impl FromStr for LifecycleState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" | "10" => Ok(Self::Active),
            "deleted" | "20" => Ok(Self::Deleted),
            "archived" | "30" => Ok(Self::Archived),
            _ => Err(ParseEnumError::new("state", s)),
        }
    }
}

/// Level of an explicit per-user share.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum AccessLevel {
    Read = 1,
    Write = 2,
}

impl AccessLevel {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Read),
            2 => Some(Self::Write),
            _ => None,
        }
    }
}

impl FromStr for AccessLevel {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" | "1" => Ok(Self::Read),
            "write" | "2" => Ok(Self::Write),
            _ => Err(ParseEnumError::new("access level", s)),
        }
    }
}

/// Which groups of fields a serialized object carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ResponseMode {
    /// Scalar attributes only.
    Info,
    /// Value + unit pairs and payload fields.
    Data,
    /// Links to related objects.
    Related,
    /// Everything.
    Full,
}

impl ResponseMode {
    pub fn includes_info(self) -> bool {
        matches!(self, Self::Info | Self::Full)
    }

    pub fn includes_data(self) -> bool {
        matches!(self, Self::Data | Self::Full)
    }

    pub fn includes_related(self) -> bool {
        matches!(self, Self::Related | Self::Full)
    }
}

impl Default for ResponseMode {
    fn default() -> Self {
        Self::Full
    }
}

impl FromStr for ResponseMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "info" => Ok(Self::Info),
            "data" => Ok(Self::Data),
            "related" => Ok(Self::Related),
            "full" => Ok(Self::Full),
            _ => Err(ParseEnumError::new("response mode", s)),
        }
    }
}
