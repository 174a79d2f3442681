//! Per-module descriptors. Each one is a static [`DescriptorSpec`] plus the
//! hooks that cannot be expressed as data.
//!
//! [`DescriptorSpec`]: super::descriptor::DescriptorSpec

pub mod apps;
pub mod daemons;
pub mod runtime;
pub mod sql;
pub mod web;

use std::path::Path;

use super::error::ModuleResult;
use crate::patch::{LineRule, PatchRule};

pub(crate) fn line_rule(pattern: &str, template: impl Into<String>) -> ModuleResult<PatchRule> {
    Ok(LineRule::new(pattern, template)?.into())
}

/// Forward-slash rendering used inside config files of every platform.
pub(crate) fn unix_path(path: &Path) -> String {
    path.display().to_string().replace('\\', "/")
}
