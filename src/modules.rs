//! Module lookup contract
//!
//! Module discovery (program headers, export tables, symbol resolution) lives
//! outside the audit layer. The audit layer only asks "which module, if any,
//! backs this address?" through [`ModuleResolver`].

use crate::fragment::Tag;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// How a mapping was created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    /// Mapped from an executable image on disk
    Image,
    /// Anonymous memory
    Anonymous,
}

/// One module as reported by the discovery service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub kind: ModuleKind,
}

impl ModuleInfo {
    pub fn contains(&self, addr: u64) -> bool {
        (self.start..self.end).contains(&addr)
    }

    pub fn offset_of(&self, addr: u64) -> u64 {
        addr.saturating_sub(self.start)
    }
}

/// Malformed data from the discovery service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleLookupError {
    #[error("malformed module record: {0}")]
    Malformed(String),
}

/// Address to module lookup service
pub trait ModuleResolver: Send + Sync {
    fn module_for(&self, addr: Tag) -> Result<Option<ModuleInfo>, ModuleLookupError>;
}

/// Resolver that knows no modules; everything is anonymous
#[derive(Debug, Default, Clone, Copy)]
pub struct NoModules;

impl ModuleResolver for NoModules {
    fn module_for(&self, _addr: Tag) -> Result<Option<ModuleInfo>, ModuleLookupError> {
        Ok(None)
    }
}

/// Fixed list of modules, e.g. loaded from a JSON snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleMap {
    modules: Vec<ModuleInfo>,
}

impl ModuleMap {
    pub fn new(modules: Vec<ModuleInfo>) -> Self {
        Self { modules }
    }

    /// Load a JSON array of modules
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let modules: Vec<ModuleInfo> =
            serde_json::from_str(&content).context("Failed to parse module list")?;
        Ok(Self::new(modules))
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl ModuleResolver for ModuleMap {
    fn module_for(&self, addr: Tag) -> Result<Option<ModuleInfo>, ModuleLookupError> {
        // an inverted range starting at or below addr is reported, not skipped
        let Some(module) = self
            .modules
            .iter()
            .find(|m| m.contains(addr.0) || (m.end <= m.start && m.start <= addr.0))
        else {
            return Ok(None);
        };
        if module.end <= module.start {
            return Err(ModuleLookupError::Malformed(format!(
                "{} has empty range {:#x}..{:#x}",
                module.name, module.start, module.end
            )));
        }
        Ok(Some(module.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn libc() -> ModuleInfo {
        ModuleInfo {
            name: "libc.so.6".to_string(),
            start: 0x7000_0000,
            end: 0x7010_0000,
            kind: ModuleKind::Image,
        }
    }

    #[test]
    fn test_lookup_hit_and_miss() {
        let map = ModuleMap::new(vec![libc()]);
        let hit = map.module_for(Tag(0x7000_1234)).unwrap().unwrap();
        assert_eq!(hit.name, "libc.so.6");
        assert_eq!(hit.offset_of(0x7000_1234), 0x1234);
        assert!(map.module_for(Tag(0x1000)).unwrap().is_none());
    }

    #[test]
    fn test_malformed_range_reported() {
        let mut broken = libc();
        broken.end = broken.start;
        let map = ModuleMap::new(vec![broken]);
        assert!(matches!(
            map.module_for(Tag(0x7000_0010)),
            Err(ModuleLookupError::Malformed(_))
        ));
    }

    #[test]
    fn test_no_modules() {
        assert!(NoModules.module_for(Tag(0x1000)).unwrap().is_none());
    }

    #[test]
    fn test_module_list_json() {
        let json = r#"[{"name":"app","start":4096,"end":8192,"kind":"image"}]"#;
        let modules: Vec<ModuleInfo> = serde_json::from_str(json).unwrap();
        assert_eq!(modules[0].kind, ModuleKind::Image);
        assert!(modules[0].contains(4096));
        assert!(!modules[0].contains(8192));
    }
}
