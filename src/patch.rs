use std::{
    fs, io,
    path::{Path, PathBuf},
};

use once_cell::sync::Lazy;
use regex::{Captures, NoExpand, Regex};
use thiserror::Error;

use crate::paths::tmp_path;

static CAPTURE_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{(\d+|\{)\}\}").expect("placeholder regex"));

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("invalid patch pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type PatchResult<T> = Result<T, PatchError>;

/// Replaces every line matching `pattern` with `template`, where `{{N}}`
/// expands to capture group N of the match and `{{{}}` to a literal `{{`.
#[derive(Debug, Clone)]
pub struct LineRule {
    pattern: Regex,
    template: String,
}

impl LineRule {
    pub fn new(pattern: &str, template: impl Into<String>) -> PatchResult<Self> {
        let pattern = Regex::new(pattern).map_err(|source| PatchError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            pattern,
            template: template.into(),
        })
    }

    /// Rule matching `key = <anything>` on a line of its own, rewritten to
    /// `replacement` with the original indentation kept. `replacement` is
    /// taken literally.
    pub fn for_key(key: &str, replacement: &str) -> Self {
        let pattern = format!(r"^(\s*){}\s*=.*", regex::escape(key));
        Self {
            pattern: Regex::new(&pattern).expect("escaped key pattern"),
            template: format!("{{{{1}}}}{}", literal(replacement)),
        }
    }

    /// Whether any line of `content` would be rewritten.
    pub fn matches_any(&self, content: &str) -> bool {
        content.lines().any(|line| self.pattern.is_match(line))
    }

    fn rewrite(&self, line: &str) -> Option<String> {
        let captures = self.pattern.captures(line)?;
        Some(render_template(&self.template, &captures))
    }
}

/// Escape `text` so a line template reproduces it verbatim.
pub fn literal(text: &str) -> String {
    text.replace("{{", "{{{}}")
}

fn render_template(template: &str, captures: &Captures<'_>) -> String {
    CAPTURE_PLACEHOLDER
        .replace_all(template, |placeholder: &Captures<'_>| {
            if &placeholder[1] == "{" {
                return "{{".to_string();
            }
            placeholder[1]
                .parse::<usize>()
                .ok()
                .and_then(|group| captures.get(group))
                .map(|found| found.as_str().to_string())
                .unwrap_or_default()
        })
        .into_owned()
}

/// Swaps every `start_tag ... end_tag` region (tags included) for a freshly
/// rendered block carrying `body`.
#[derive(Debug, Clone)]
pub struct BlockRule {
    region: Regex,
    rendered: String,
}

impl BlockRule {
    pub fn new(start_tag: &str, end_tag: &str, body: &str) -> Self {
        let region = format!(
            "(?s){}.*?{}",
            regex::escape(start_tag),
            regex::escape(end_tag)
        );
        let mut rendered = String::with_capacity(start_tag.len() + body.len() + end_tag.len() + 2);
        rendered.push_str(start_tag);
        rendered.push('\n');
        for line in body.lines() {
            rendered.push_str(line);
            rendered.push('\n');
        }
        rendered.push_str(end_tag);
        Self {
            region: Regex::new(&region).expect("escaped block pattern"),
            rendered,
        }
    }

    pub fn rendered(&self) -> &str {
        &self.rendered
    }

    fn apply(&self, content: &str) -> String {
        self.region
            .replace_all(content, NoExpand(&self.rendered))
            .into_owned()
    }
}

#[derive(Debug, Clone)]
pub enum PatchRule {
    Line(LineRule),
    Block(BlockRule),
}

impl From<LineRule> for PatchRule {
    fn from(rule: LineRule) -> Self {
        PatchRule::Line(rule)
    }
}

impl From<BlockRule> for PatchRule {
    fn from(rule: BlockRule) -> Self {
        PatchRule::Block(rule)
    }
}

/// Apply block rules over the whole buffer, then line rules line by line.
/// For each line the first matching line rule wins; line endings are kept.
pub fn apply_rules(content: &str, rules: &[PatchRule]) -> String {
    let mut buffer = content.to_string();
    for rule in rules {
        if let PatchRule::Block(block) = rule {
            buffer = block.apply(&buffer);
        }
    }

    let line_rules = rules
        .iter()
        .filter_map(|rule| match rule {
            PatchRule::Line(line) => Some(line),
            PatchRule::Block(_) => None,
        })
        .collect::<Vec<_>>();
    if line_rules.is_empty() {
        return buffer;
    }

    let mut output = String::with_capacity(buffer.len());
    for raw in buffer.split_inclusive('\n') {
        let (line, eol) = split_eol(raw);
        match line_rules.iter().find_map(|rule| rule.rewrite(line)) {
            Some(rewritten) => output.push_str(&rewritten),
            None => output.push_str(line),
        }
        output.push_str(eol);
    }
    output
}

fn split_eol(raw: &str) -> (&str, &str) {
    if let Some(line) = raw.strip_suffix("\r\n") {
        (line, "\r\n")
    } else if let Some(line) = raw.strip_suffix('\n') {
        (line, "\n")
    } else {
        (raw, "")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Changed,
    Unchanged,
    /// Optional target that does not exist.
    Missing,
}

/// A set of rules bound to one file.
#[derive(Debug, Clone)]
pub struct FilePatch {
    pub path: PathBuf,
    pub rules: Vec<PatchRule>,
    pub optional: bool,
}

impl FilePatch {
    pub fn required(path: impl Into<PathBuf>, rules: Vec<PatchRule>) -> Self {
        Self {
            path: path.into(),
            rules,
            optional: false,
        }
    }

    pub fn optional(path: impl Into<PathBuf>, rules: Vec<PatchRule>) -> Self {
        Self {
            path: path.into(),
            rules,
            optional: true,
        }
    }
}

pub fn patch_file(path: &Path, rules: &[PatchRule]) -> PatchResult<PatchOutcome> {
    let existing = fs::read_to_string(path).map_err(|source| PatchError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let patched = apply_rules(&existing, rules);
    if patched == existing {
        return Ok(PatchOutcome::Unchanged);
    }
    write_atomic(path, &patched)?;
    Ok(PatchOutcome::Changed)
}

/// Apply each planned patch in order. Optional files that are absent are
/// logged and skipped; any other failure stops the run.
pub fn apply_all(plan: &[FilePatch]) -> PatchResult<Vec<(PathBuf, PatchOutcome)>> {
    let mut outcomes = Vec::with_capacity(plan.len());
    for patch in plan {
        if patch.optional && !patch.path.is_file() {
            tracing::warn!(path = %patch.path.display(), "config file not found, skipping");
            outcomes.push((patch.path.clone(), PatchOutcome::Missing));
            continue;
        }
        let outcome = patch_file(&patch.path, &patch.rules)?;
        tracing::debug!(path = %patch.path.display(), ?outcome, "patched config file");
        outcomes.push((patch.path.clone(), outcome));
    }
    Ok(outcomes)
}

/// Replace `path` with `contents` through a sibling temp file and rename.
pub fn write_atomic(path: &Path, contents: &str) -> PatchResult<()> {
    let tmp = tmp_path(path);
    let write = || -> io::Result<()> {
        fs::write(&tmp, contents)?;
        if let Ok(meta) = fs::metadata(path) {
            fs::set_permissions(&tmp, meta.permissions())?;
        }
        fs::rename(&tmp, path)
    };
    write().map_err(|source| {
        let _ = fs::remove_file(&tmp);
        PatchError::Write {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const START: &str = "# START switchOnline tag - Do not replace!";
    const END: &str = "# END switchOnline tag - Do not replace!";

    fn port_rules(port: u16) -> Vec<PatchRule> {
        vec![
            LineRule::new(r"^Listen\s(\d+)", format!("Listen {port}"))
                .expect("rule")
                .into(),
            LineRule::new(
                r"^ServerName\s+([a-zA-Z0-9.]+):(\d+)",
                format!("ServerName {{{{1}}}}:{port}"),
            )
            .expect("rule")
            .into(),
        ]
    }

    #[test]
    fn line_rule_keeps_captured_host() {
        let content = "Listen 80\nServerName localhost:80\nDocumentRoot \"/www\"\n";
        let patched = apply_rules(content, &port_rules(8080));
        assert_eq!(
            patched,
            "Listen 8080\nServerName localhost:8080\nDocumentRoot \"/www\"\n"
        );
    }

    #[test]
    fn applying_twice_is_byte_identical() {
        let content = "# comment\r\nListen 80\r\nServerName example.test:80\r\nno newline";
        let once = apply_rules(content, &port_rules(8081));
        let twice = apply_rules(&once, &port_rules(8081));
        assert_eq!(once, twice);
        assert!(once.ends_with("no newline"));
        assert!(once.contains("Listen 8081\r\n"));
    }

    #[test]
    fn first_matching_rule_wins_per_line() {
        let rules: Vec<PatchRule> = vec![
            LineRule::new(r"^#?LoadModule\sphp.*", "LoadModule php_module \"a\"")
                .expect("rule")
                .into(),
            LineRule::new(r"^#?LoadModule\sphp_*", "never").expect("rule").into(),
        ];
        let patched = apply_rules("#LoadModule php7_module \"old\"\n", &rules);
        assert_eq!(patched, "LoadModule php_module \"a\"\n");
    }

    #[test]
    fn missing_capture_renders_empty() {
        let rule = LineRule::new(r"^port\s*=\s*(\d+)", "port = {{1}}{{7}}").expect("rule");
        let patched = apply_rules("port = 3306\n", &[rule.into()]);
        assert_eq!(patched, "port = 3306\n");
    }

    #[test]
    fn block_toggle_round_trips() {
        let offline_body = "Require local";
        let original = format!(
            "<Directory \"/www\">\n{START}\n{offline_body}\n{END}\n</Directory>\n"
        );
        let online = vec![PatchRule::from(BlockRule::new(START, END, "Require all granted"))];
        let offline = vec![PatchRule::from(BlockRule::new(START, END, offline_body))];

        let mut content = original.clone();
        for _ in 0..2 {
            content = apply_rules(&content, &online);
            assert!(content.contains("Require all granted"));
            assert!(!content.contains("Require local"));
            content = apply_rules(&content, &offline);
        }
        assert_eq!(content, original);
    }

    #[test]
    fn block_rule_covers_every_region_in_file() {
        let content = format!(
            "<VirtualHost *:80>\n{START}\nRequire local\n{END}\n</VirtualHost>\n<VirtualHost *:443>\n{START}\nRequire local\n{END}\n</VirtualHost>\n"
        );
        let rule = PatchRule::from(BlockRule::new(START, END, "Require all granted"));
        let patched = apply_rules(&content, &[rule.clone()]);
        assert_eq!(patched.matches("Require all granted").count(), 2);
        assert_eq!(apply_rules(&patched, &[rule]), patched);
    }

    #[test]
    fn block_rule_with_multiline_body() {
        let rule = BlockRule::new(START, END, "Order Deny,Allow\nDeny from all\nAllow from 127.0.0.1 ::1");
        assert_eq!(
            rule.rendered(),
            format!("{START}\nOrder Deny,Allow\nDeny from all\nAllow from 127.0.0.1 ::1\n{END}")
        );
    }

    #[test]
    fn patch_file_reports_outcome_and_skips_unchanged_writes() -> PatchResult<()> {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("httpd.conf");
        fs::write(&path, "Listen 80\n").expect("seed");

        assert_eq!(patch_file(&path, &port_rules(81))?, PatchOutcome::Changed);
        assert_eq!(patch_file(&path, &port_rules(81))?, PatchOutcome::Unchanged);
        assert_eq!(fs::read_to_string(&path).expect("read"), "Listen 81\n");
        assert!(!tmp_path(&path).exists());
        Ok(())
    }

    #[test]
    fn apply_all_skips_missing_optional_files() -> PatchResult<()> {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("alias").join("adminer.conf");
        let plan = vec![FilePatch::optional(&missing, port_rules(80))];
        let outcomes = apply_all(&plan)?;
        assert_eq!(outcomes, vec![(missing, PatchOutcome::Missing)]);

        let required = vec![FilePatch::required(dir.path().join("my.ini"), port_rules(80))];
        assert!(matches!(apply_all(&required), Err(PatchError::Read { .. })));
        Ok(())
    }

    #[test]
    fn for_key_rewrites_settings_line() {
        let rule = LineRule::for_key("mysqlPort", "mysqlPort = \"3307\"");
        let patched = apply_rules(
            "mysqlPortSsl = \"1\"\nmysqlPort = \"3306\"\n",
            &[rule.into()],
        );
        assert_eq!(patched, "mysqlPortSsl = \"1\"\nmysqlPort = \"3307\"\n");
    }

    #[test]
    fn for_key_keeps_indentation() {
        let rule = LineRule::for_key("mysqlVersion", "mysqlVersion = \"8.4.0\"");
        assert!(rule.matches_any("[main]\n  mysqlVersion = \"8.0.36\"\n"));
        let patched = apply_rules("[main]\n  mysqlVersion = \"8.0.36\"\n", &[rule.into()]);
        assert_eq!(patched, "[main]\n  mysqlVersion = \"8.4.0\"\n");
    }

    #[test]
    fn literal_text_is_not_expanded() {
        let rule = LineRule::new(r"^(\$pwd)\s=", format!("{{{{1}}}} = '{}';", literal("a{{1}}b{{{")))
            .expect("rule");
        let patched = apply_rules("$pwd = '';\n", &[rule.into()]);
        assert_eq!(patched, "$pwd = 'a{{1}}b{{{';\n");
    }
}
