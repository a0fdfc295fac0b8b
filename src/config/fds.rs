//! Inherited listener descriptor map (`--fd`).
//!
//! Text form is `port:fd` pairs joined by commas, e.g. `8000:3,4430:4`.

use std::collections::BTreeMap;
use std::fmt;
use std::os::unix::io::RawFd;
use std::str::FromStr;

use thiserror::Error;

/// Error parsing an `--fd` value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid descriptor map entry '{entry}': expected PORT:FD")]
pub struct FdMapError {
    pub entry: String,
}

/// Ordered `port → descriptor` map handed to worker processes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FdMap(BTreeMap<u16, RawFd>);

impl FdMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, port: u16, fd: RawFd) {
        self.0.insert(port, fd);
    }

    pub fn get(&self, port: u16) -> Option<RawFd> {
        self.0.get(&port).copied()
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.keys().copied()
    }

    pub fn descriptors(&self) -> Vec<RawFd> {
        self.0.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for FdMap {
    type Err = FdMapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut map = FdMap::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let invalid = || FdMapError {
                entry: entry.to_string(),
            };
            let (port, fd) = entry.split_once(':').ok_or_else(invalid)?;
            let port: u16 = port.trim().parse().map_err(|_| invalid())?;
            let fd: RawFd = fd.trim().parse().map_err(|_| invalid())?;
            if fd < 0 {
                return Err(invalid());
            }
            map.insert(port, fd);
        }
        Ok(map)
    }
}

impl fmt::Display for FdMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (port, fd)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}:{}", port, fd)?;
        }
        Ok(())
    }
}
