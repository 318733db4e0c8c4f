// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Identities of the unit and of the storage it owns.

use std::fmt;
use std::str::FromStr;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("Invalid unit name '{0}': expected <service>/<number>")]
pub struct ParseUnitNameError(String);

/// The name of a deployed unit, e.g. "mysql/0".
///
/// Parsed once when the program starts and passed down from there.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitName {
    service: String,
    number: u32,
}

impl UnitName {
    pub fn new(service: impl Into<String>, number: u32) -> Self {
        Self { service: service.into(), number }
    }

    /// The service this unit belongs to. Stable for the unit's lifetime.
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn number(&self) -> u32 {
        self.number
    }
}

impl FromStr for UnitName {
    type Err = ParseUnitNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseUnitNameError(s.to_string());
        let (service, number) = s.split_once('/').ok_or_else(err)?;
        if service.is_empty() {
            return Err(err());
        }
        let number = number.parse().map_err(|_| err())?;
        Ok(Self { service: service.to_string(), number })
    }
}

impl fmt::Display for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.number)
    }
}

/// Names a block image and the Ceph client that owns it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageIdentity {
    /// The Ceph client name; also the default pool.
    pub service: String,
    pub pool: String,
    pub image: String,
}

impl StorageIdentity {
    /// An identity using one pool per service, named after the service.
    pub fn new(service: impl Into<String>, image: impl Into<String>) -> Self {
        let service = service.into();
        Self { pool: service.clone(), service, image: image.into() }
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }
}

impl fmt::Display for StorageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} (client {})", self.pool, self.image, self.service)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_unit_name() {
        let unit: UnitName = "mysql/3".parse().unwrap();
        assert_eq!(unit.service(), "mysql");
        assert_eq!(unit.number(), 3);
        assert_eq!(unit.to_string(), "mysql/3");

        for bad in ["", "mysql", "/0", "mysql/", "mysql/x", "mysql/0/1"] {
            assert!(bad.parse::<UnitName>().is_err(), "{bad} parsed");
        }
    }

    #[test]
    fn test_pool_defaults_to_service() {
        let identity = StorageIdentity::new("mysql", "mysql1");
        assert_eq!(identity.pool, "mysql");
        assert_eq!(identity.with_pool("shared").pool, "shared");
    }
}
