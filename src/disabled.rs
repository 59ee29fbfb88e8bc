//! The administratively maintained list of registers which must never be polled.
//!
//! The list lives in a small YAML document:
//!
//! ```yaml
//! disabled_registers: [1000, 2004]
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

const EMPTY_DOCUMENT: &str = "disabled_registers: []\n";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read the disabled register list at {1:?}")]
    Read(#[source] std::io::Error, PathBuf),
    #[error("could not create an empty disabled register list at {1:?}")]
    Create(#[source] std::io::Error, PathBuf),
    #[error("could not write the disabled register list to {1:?}")]
    Write(#[source] std::io::Error, PathBuf),
    #[error("the disabled register list at {1:?} is malformed")]
    Parse(#[source] serde_yaml::Error, PathBuf),
    #[error("the disabled register list at {1:?} contains `{0}`, which is not a register address")]
    InvalidAddress(String, PathBuf),
    #[error("could not serialize the disabled register list")]
    Serialize(#[source] serde_yaml::Error),
}

#[derive(serde::Deserialize)]
struct Document {
    disabled_registers: Option<Vec<Entry>>,
}

/// Entries written by older tooling may be quoted.
#[derive(serde::Deserialize)]
#[serde(untagged)]
enum Entry {
    Address(u16),
    Text(String),
}

#[derive(serde::Serialize)]
struct DocumentRef<'a> {
    disabled_registers: &'a [u16],
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DisabledRegisters(HashSet<u16>);

impl DisabledRegisters {
    pub fn new(addresses: impl IntoIterator<Item = u16>) -> Self {
        Self(addresses.into_iter().collect())
    }

    /// Load the list at `path`, creating an empty one if the file does not exist yet.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(message = "creating an empty disabled register list", ?path);
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| Error::Create(e, path.to_path_buf()))?;
                }
                std::fs::write(path, EMPTY_DOCUMENT)
                    .map_err(|e| Error::Create(e, path.to_path_buf()))?;
                return Ok(Self::default());
            }
            Err(e) => return Err(Error::Read(e, path.to_path_buf())),
        };
        let disabled = Self::parse(&contents, path)?;
        debug!(message = "loaded disabled registers", ?path, count = disabled.0.len());
        Ok(disabled)
    }

    fn parse(contents: &str, path: &Path) -> Result<Self, Error> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let document: Document =
            serde_yaml::from_str(contents).map_err(|e| Error::Parse(e, path.to_path_buf()))?;
        let mut addresses = HashSet::new();
        for entry in document.disabled_registers.unwrap_or_default() {
            let address = match entry {
                Entry::Address(address) => address,
                Entry::Text(text) => text
                    .trim()
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidAddress(text.clone(), path.to_path_buf()))?,
            };
            addresses.insert(address);
        }
        Ok(Self(addresses))
    }

    /// Write the list to `path`, addresses sorted.
    pub fn store(&self, path: &Path) -> Result<(), Error> {
        let addresses = self.sorted();
        let document = DocumentRef { disabled_registers: &addresses };
        let contents = serde_yaml::to_string(&document).map_err(Error::Serialize)?;
        std::fs::write(path, contents).map_err(|e| Error::Write(e, path.to_path_buf()))
    }

    pub fn is_disabled(&self, address: u16) -> bool {
        self.0.contains(&address)
    }

    /// Returns `true` if the address was not disabled before.
    pub fn insert(&mut self, address: u16) -> bool {
        self.0.insert(address)
    }

    /// Returns `true` if the address was disabled before.
    pub fn remove(&mut self, address: u16) -> bool {
        self.0.remove(&address)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn sorted(&self) -> Vec<u16> {
        let mut addresses = self.0.iter().copied().collect::<Vec<_>>();
        addresses.sort_unstable();
        addresses
    }
}
