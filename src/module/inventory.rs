//! Read-only scans of the web layout and of module install trees. A missing
//! directory yields an empty list.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use super::{
    error::{ModuleError, ModuleResult},
    view::ModuleView,
};

static SERVER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(#)?\s*ServerName\s+(\S+)").expect("server name regex"));
static LOAD_MODULE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^\s*(#)?\s*LoadModule\s+([a-z0-9_-]+)\s+"?([^"]*)"?"#).expect("load module regex")
});
static EXTENSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\s*(;)?\s*extension\s*=\s*"?([^"\s;]+)"?"#).expect("extension regex"));

/// Extensions loaded through `zend_extension`, listed elsewhere.
const ZEND_EXTENSIONS: [&str; 2] = ["opcache", "xdebug"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Toggle {
    pub name: String,
    pub enabled: bool,
}

fn read_dir_sorted(dir: &Path) -> ModuleResult<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(ModuleError::Io {
                path: dir.to_path_buf(),
                source,
            });
        }
    };
    let mut paths = entries
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|source| ModuleError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    paths.sort();
    Ok(paths)
}

fn read_text(path: &Path) -> ModuleResult<String> {
    fs::read_to_string(path).map_err(|source| ModuleError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// `*.conf` files directly inside `dir`.
pub fn conf_files(dir: &Path) -> ModuleResult<Vec<PathBuf>> {
    Ok(read_dir_sorted(dir)?
        .into_iter()
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "conf"))
        .collect())
}

/// Names of the `*.conf` files in `dir`, without extension.
pub fn conf_names(dir: &Path) -> ModuleResult<Vec<String>> {
    Ok(conf_files(dir)?
        .iter()
        .filter_map(|path| path.file_stem()?.to_str().map(str::to_string))
        .collect())
}

/// `ServerName` of every vhost file; a commented directive means disabled.
pub fn vhost_urls(dir: &Path) -> ModuleResult<Vec<Toggle>> {
    let mut urls = Vec::new();
    for file in conf_files(dir)? {
        let contents = read_text(&file)?;
        if let Some(captures) = contents.lines().find_map(|line| SERVER_NAME.captures(line)) {
            urls.push(Toggle {
                name: captures[2].to_string(),
                enabled: captures.get(1).is_none(),
            });
        }
    }
    Ok(urls)
}

/// Apache modules shipped in `modules/`, switched on by uncommented
/// `LoadModule` lines. PHP's own module is left out.
pub fn apache_modules(apache: &ModuleView) -> ModuleResult<Vec<Toggle>> {
    let mut modules = BTreeMap::new();
    for path in read_dir_sorted(&apache.paths.install_root.join("modules"))? {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let stem = name
            .strip_suffix(".so")
            .or_else(|| name.strip_suffix(".dll"))
            .and_then(|stem| stem.strip_prefix("mod_"));
        if let Some(stem) = stem {
            modules.insert(format!("{stem}_module"), false);
        }
    }

    let conf = apache.install_file("apacheConf")?;
    if conf.is_file() {
        for line in read_text(&conf)?.lines() {
            let Some(captures) = LOAD_MODULE.captures(line) else {
                continue;
            };
            let name = captures[2].to_string();
            if name.to_ascii_lowercase().starts_with("php") {
                continue;
            }
            modules.insert(name, captures.get(1).is_none());
        }
    }
    Ok(into_toggles(modules))
}

/// PHP extensions from `ext/` and the `extension=` lines of php.ini.
pub fn php_extensions(php: &ModuleView) -> ModuleResult<Vec<Toggle>> {
    let mut extensions = BTreeMap::new();
    for path in read_dir_sorted(&php.paths.install_root.join("ext"))? {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if let Some(name) = extension_name(name) {
            extensions.insert(name, false);
        }
    }

    let ini = php.install_file("phpConf")?;
    if ini.is_file() {
        for line in read_text(&ini)?.lines() {
            let Some(captures) = EXTENSION.captures(line) else {
                continue;
            };
            if let Some(name) = extension_name(&captures[2]) {
                extensions.insert(name, captures.get(1).is_none());
            }
        }
    }
    Ok(into_toggles(extensions))
}

fn extension_name(raw: &str) -> Option<String> {
    let name = raw.strip_prefix("php_").unwrap_or(raw);
    let name = name
        .strip_suffix(".dll")
        .or_else(|| name.strip_suffix(".so"))
        .unwrap_or(name);
    if name.is_empty() || ZEND_EXTENSIONS.contains(&name) {
        return None;
    }
    Some(name.to_string())
}

/// Project directories served from the www root.
pub fn www_dirs(www: &Path) -> ModuleResult<Vec<String>> {
    Ok(read_dir_sorted(www)?
        .iter()
        .filter(|path| path.is_dir())
        .filter_map(|path| path.file_name()?.to_str().map(str::to_string))
        .collect())
}

fn into_toggles(map: BTreeMap<String, bool>) -> Vec<Toggle> {
    map.into_iter()
        .map(|(name, enabled)| Toggle { name, enabled })
        .collect()
}
