//! Core types used throughout the system
//!
//! Identifiers and role/kind enums shared by every component. Numeric ids are
//! stored as `BIGINT`, so they are signed here as well.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Principal ID - allocated by the role-aware ID generator.
///
/// The platform commission singleton uses id `0`.
pub type PrincipalId = i64;

/// Upstream marketplace shop id.
pub type ShopId = i64;

/// Upstream order serial number (opaque string, unique within a shop).
pub type OrderSn = String;

/// Principal id that owns the `platform_commission` account row.
pub const PLATFORM_PRINCIPAL_ID: PrincipalId = 0;

/// Role of an authenticated principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    ShopOwner,
    Operator,
    Platform,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::ShopOwner => "shop_owner",
            Role::Operator => "operator",
            Role::Platform => "platform",
        }
    }

    /// Numeric `user_type` carried in bearer tokens.
    pub fn id(&self) -> i16 {
        match self {
            Role::ShopOwner => 1,
            Role::Operator => 2,
            Role::Platform => 9,
        }
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(Role::ShopOwner),
            2 => Some(Role::Operator),
            9 => Some(Role::Platform),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shop_owner" => Ok(Role::ShopOwner),
            "operator" => Ok(Role::Operator),
            "platform" => Ok(Role::Platform),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// Principal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalStatus {
    Disabled = 0,
    Active = 1,
}

impl From<i16> for PrincipalStatus {
    fn from(v: i16) -> Self {
        match v {
            0 => PrincipalStatus::Disabled,
            _ => PrincipalStatus::Active,
        }
    }
}
