use std::{
    cmp::Ordering,
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};

use serde::Serialize;

/// Name of the version-independent directory link inside a module root.
pub const STABLE_DIR: &str = "current";
/// Per-version settings bundle file name inside an install root.
pub const BUNDLE_FILE: &str = "bundle.conf";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Bins,
    Apps,
}

impl Family {
    pub fn dir_name(self) -> &'static str {
        match self {
            Family::Bins => "bins",
            Family::Apps => "apps",
        }
    }
}

/// Concrete on-disk locations of one module at one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModulePaths {
    pub version: String,
    pub module_root: PathBuf,
    pub install_root: PathBuf,
    pub stable_root: PathBuf,
    pub bundle: PathBuf,
}

impl ModulePaths {
    /// Derive the paths of `target` by substituting the version tag embedded in
    /// the install directory name. Every other component is left untouched.
    pub fn for_version(&self, id: &str, target: &str) -> ModulePaths {
        let current_tag = format!("{id}{}", self.version);
        let target_tag = format!("{id}{target}");
        ModulePaths {
            version: target.to_string(),
            module_root: self.module_root.clone(),
            install_root: substitute_component(&self.install_root, &current_tag, &target_tag),
            stable_root: self.stable_root.clone(),
            bundle: substitute_component(&self.bundle, &current_tag, &target_tag),
        }
    }

    /// Resolve a bundle-relative file against the versioned install root.
    pub fn install_file(&self, relative: &str) -> PathBuf {
        self.install_root.join(relative)
    }

    /// Resolve a bundle-relative file against the stable root, which is what
    /// other modules' config files reference.
    pub fn stable_file(&self, relative: &str) -> PathBuf {
        self.stable_root.join(relative)
    }
}

/// Pure mapping from (family, module id, version) to directories under the
/// install root.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn family_dir(&self, family: Family) -> PathBuf {
        self.root.join(family.dir_name())
    }

    pub fn module_root(&self, family: Family, id: &str) -> PathBuf {
        self.family_dir(family).join(id)
    }

    pub fn resolve(&self, family: Family, id: &str, version: &str) -> ModulePaths {
        let module_root = self.module_root(family, id);
        let install_root = module_root.join(format!("{id}{version}"));
        ModulePaths {
            version: version.to_string(),
            stable_root: module_root.join(STABLE_DIR),
            bundle: install_root.join(BUNDLE_FILE),
            install_root,
            module_root,
        }
    }

    /// Installed versions of a module, oldest first. A missing module root is
    /// not an error.
    pub fn version_list(&self, family: Family, id: &str) -> io::Result<Vec<String>> {
        let module_root = self.module_root(family, id);
        let entries = match fs::read_dir(&module_root) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name == STABLE_DIR || !entry.path().is_dir() {
                continue;
            }
            if let Some(version) = name.strip_prefix(id).filter(|rest| !rest.is_empty()) {
                versions.push(version.to_string());
            }
        }
        versions.sort_by(|a, b| compare_versions(a, b));
        Ok(versions)
    }
}

fn substitute_component(path: &Path, current: &str, target: &str) -> PathBuf {
    let mut rebuilt = PathBuf::new();
    for component in path.components() {
        let raw = component.as_os_str();
        match raw.to_str() {
            Some(text) if text == current => rebuilt.push(target),
            _ => rebuilt.push(raw),
        }
    }
    rebuilt
}

/// Orders dotted version strings numerically where possible ("10.11" > "10.6").
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split(['.', '-', '_']);
    let mut right = b.split(['.', '-', '_']);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => {
                let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StableRootStatus {
    AlreadyLinked,
    Linked,
    /// A non-empty real directory occupies the stable root.
    Blocked,
}

/// Point `<module root>/current` at the given install root.
pub fn repoint_stable_root(paths: &ModulePaths) -> io::Result<StableRootStatus> {
    let link = &paths.stable_root;
    match fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            if fs::read_link(link)? == paths.install_root {
                return Ok(StableRootStatus::AlreadyLinked);
            }
            remove_link(link)?;
        }
        Ok(meta) if meta.is_dir() => {
            if fs::read_dir(link)?.next().is_some() {
                return Ok(StableRootStatus::Blocked);
            }
            fs::remove_dir(link)?;
        }
        Ok(_) => fs::remove_file(link)?,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => return Err(error),
    }

    create_dir_link(&paths.install_root, link)?;
    Ok(StableRootStatus::Linked)
}

#[cfg(unix)]
fn create_dir_link(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_dir_link(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

#[cfg(unix)]
fn remove_link(link: &Path) -> io::Result<()> {
    fs::remove_file(link)
}

#[cfg(windows)]
fn remove_link(link: &Path) -> io::Result<()> {
    fs::remove_dir(link).or_else(|_| fs::remove_file(link))
}

/// Temporary sibling used for write-then-rename.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("tmp"));
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn resolves_versioned_layout() {
        let resolver = PathResolver::new("/stack");
        let paths = resolver.resolve(Family::Bins, "mariadb", "10.4.32");
        assert_eq!(paths.module_root, PathBuf::from("/stack/bins/mariadb"));
        assert_eq!(
            paths.install_root,
            PathBuf::from("/stack/bins/mariadb/mariadb10.4.32")
        );
        assert_eq!(paths.stable_root, PathBuf::from("/stack/bins/mariadb/current"));
        assert_eq!(
            paths.bundle,
            PathBuf::from("/stack/bins/mariadb/mariadb10.4.32/bundle.conf")
        );
    }

    #[test]
    fn for_version_only_touches_the_install_component() {
        let resolver = PathResolver::new("/opt/10.4/stack");
        let paths = resolver.resolve(Family::Bins, "mariadb", "10.4");
        let target = paths.for_version("mariadb", "10.6");
        assert_eq!(target.version, "10.6");
        assert_eq!(
            target.install_root,
            PathBuf::from("/opt/10.4/stack/bins/mariadb/mariadb10.6")
        );
        assert_eq!(
            target.bundle,
            PathBuf::from("/opt/10.4/stack/bins/mariadb/mariadb10.6/bundle.conf")
        );
        assert_eq!(target, resolver.resolve(Family::Bins, "mariadb", "10.6"));
    }

    #[test]
    fn version_list_skips_stable_dir_and_foreign_entries() -> io::Result<()> {
        let dir = tempdir()?;
        let resolver = PathResolver::new(dir.path());
        let root = resolver.module_root(Family::Bins, "php");
        for name in ["php8.3.1", "php7.4.33", "php8.10.0", "current", "notes"] {
            fs::create_dir_all(root.join(name))?;
        }
        fs::write(root.join("php9.0.0"), "not a directory")?;

        let versions = resolver.version_list(Family::Bins, "php")?;
        assert_eq!(versions, vec!["7.4.33", "8.3.1", "8.10.0"]);
        Ok(())
    }

    #[test]
    fn version_list_of_missing_module_is_empty() -> io::Result<()> {
        let dir = tempdir()?;
        let resolver = PathResolver::new(dir.path());
        assert!(resolver.version_list(Family::Apps, "adminer")?.is_empty());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn repoint_replaces_stale_link_and_refuses_populated_dir() -> io::Result<()> {
        let dir = tempdir()?;
        let resolver = PathResolver::new(dir.path());
        let old = resolver.resolve(Family::Bins, "apache", "2.4.58");
        let new = resolver.resolve(Family::Bins, "apache", "2.4.62");
        fs::create_dir_all(&old.install_root)?;
        fs::create_dir_all(&new.install_root)?;

        assert_eq!(repoint_stable_root(&old)?, StableRootStatus::Linked);
        assert_eq!(repoint_stable_root(&old)?, StableRootStatus::AlreadyLinked);
        assert_eq!(repoint_stable_root(&new)?, StableRootStatus::Linked);
        assert_eq!(fs::read_link(&new.stable_root)?, new.install_root);

        fs::remove_file(&new.stable_root)?;
        fs::create_dir_all(new.stable_root.join("conf"))?;
        assert_eq!(repoint_stable_root(&new)?, StableRootStatus::Blocked);
        Ok(())
    }

    #[test]
    fn compares_versions_numerically() {
        assert_eq!(compare_versions("10.11", "10.6"), Ordering::Greater);
        assert_eq!(compare_versions("2.4", "2.4.0"), Ordering::Less);
        assert_eq!(compare_versions("8.3.1", "8.3.1"), Ordering::Equal);
    }
}
