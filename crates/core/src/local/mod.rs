//! The local mirror tree.
//!
//! Each tracked page is one text file under the sync root. A TOML front
//! matter block between `+++` lines carries the page identity:
//!
//! ```text
//! +++
//! page_id = "98310"
//! version = 4
//! title = "Release checklist"
//! +++
//!
//! ## Steps
//! ...
//! ```
//!
//! Files without a `page_id` are pages that only exist locally so far. All
//! paths handed in and out of [`LocalTree`] are relative to the sync root.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::LocalConfig;
use crate::errors::LocalError;

const FENCE: &str = "+++";

/// Identity header embedded in a page file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl PageHeader {
    pub fn tracked(page_id: impl Into<String>, version: u64, title: impl Into<String>) -> Self {
        Self {
            page_id: Some(page_id.into()),
            version: Some(version),
            title: Some(title.into()),
        }
    }
}

/// A page file as found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPage {
    /// Relative to the sync root.
    pub path: PathBuf,
    pub header: PageHeader,
    pub body: String,
}

impl LocalPage {
    /// Title for a new remote page: the header's, else the file stem.
    pub fn title(&self) -> String {
        if let Some(title) = self.header.title.as_deref().filter(|t| !t.trim().is_empty()) {
            return title.to_string();
        }
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().replace(['-', '_'], " "))
            .unwrap_or_else(|| "Untitled".into())
    }
}

/// Split a page file into header and body.
pub fn parse_page(path: &Path, text: &str) -> Result<(PageHeader, String), LocalError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let normalized;
    let text = if text.contains("\r\n") {
        normalized = text.replace("\r\n", "\n");
        normalized.as_str()
    } else {
        text
    };

    let Some(rest) = text.strip_prefix("+++\n") else {
        return Ok((PageHeader::default(), text.to_string()));
    };
    let Some(end) = find_fence(rest) else {
        return Err(LocalError::BadHeader {
            path: path.display().to_string(),
            detail: "front matter is not closed".into(),
        });
    };
    let header: PageHeader =
        toml::from_str(&rest[..end]).map_err(|e| LocalError::BadHeader {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;
    let after = &rest[end + FENCE.len()..];
    let body = after.strip_prefix('\n').unwrap_or(after);
    let body = body.strip_prefix('\n').unwrap_or(body);
    Ok((header, body.to_string()))
}

/// Offset of the closing fence line within `rest`.
fn find_fence(rest: &str) -> Option<usize> {
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end_matches('\n') == FENCE {
            return Some(offset);
        }
        offset += line.len();
    }
    None
}

/// Render header and body back into file content.
pub fn render_page(header: &PageHeader, body: &str) -> String {
    if header == &PageHeader::default() {
        return body.to_string();
    }
    let toml = toml::to_string(header).unwrap_or_default();
    format!("{FENCE}\n{toml}{FENCE}\n\n{body}")
}

/// File-name slug for a page title.
pub fn slug(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut dash = false;
    for c in title.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    let out = out.trim_end_matches('-').to_string();
    if out.is_empty() {
        "untitled".into()
    } else {
        out
    }
}

/// Reader and writer for the mirror tree.
#[derive(Debug, Clone)]
pub struct LocalTree {
    root: PathBuf,
    extension: String,
    ignore_patterns: Vec<String>,
}

impl LocalTree {
    pub fn new(
        root: impl Into<PathBuf>,
        extension: impl Into<String>,
        ignore_patterns: Vec<String>,
    ) -> Self {
        Self {
            root: root.into(),
            extension: extension.into().trim_start_matches('.').to_string(),
            ignore_patterns,
        }
    }

    pub fn from_config(config: &LocalConfig) -> Self {
        Self::new(
            config.root.clone(),
            config.extension.clone(),
            config.ignore_patterns.clone(),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Absolute path for a relative one; refuses anything escaping the root.
    pub fn resolve(&self, rel: &Path) -> Result<PathBuf, LocalError> {
        let escapes = rel.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes {
            return Err(LocalError::OutsideRoot(rel.display().to_string()));
        }
        Ok(self.root.join(rel))
    }

    fn is_ignored(&self, rel: &Path) -> bool {
        let rel = rel.to_string_lossy().replace('\\', "/");
        self.ignore_patterns
            .iter()
            .any(|p| glob_match::glob_match(p, &rel))
    }

    /// Every page file under the root, sorted by path.
    pub fn scan(&self) -> Result<Vec<LocalPage>, LocalError> {
        let mut pages = Vec::new();
        if !self.root.exists() {
            warn!(root = %self.root.display(), "local root does not exist yet");
            return Ok(pages);
        }
        self.walk(Path::new(""), &mut pages)?;
        pages.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(count = pages.len(), "scanned local tree");
        Ok(pages)
    }

    fn walk(&self, rel_dir: &Path, out: &mut Vec<LocalPage>) -> Result<(), LocalError> {
        let dir = self.root.join(rel_dir);
        let entries = std::fs::read_dir(&dir).map_err(|e| LocalError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| LocalError::io(&dir, e))?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let rel = rel_dir.join(&name);
            if self.is_ignored(&rel) {
                continue;
            }
            let file_type = entry.file_type().map_err(|e| LocalError::io(entry.path(), e))?;
            if file_type.is_dir() {
                self.walk(&rel, out)?;
            } else if file_type.is_file()
                && rel.extension().and_then(|e| e.to_str()) == Some(self.extension.as_str())
            {
                if let Some(page) = self.read(&rel)? {
                    out.push(page);
                }
            }
        }
        Ok(())
    }

    /// Read one page file; `None` if it does not exist.
    pub fn read(&self, rel: &Path) -> Result<Option<LocalPage>, LocalError> {
        let path = self.resolve(rel)?;
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LocalError::io(&path, e)),
        };
        let (header, body) = parse_page(rel, &text)?;
        Ok(Some(LocalPage {
            path: rel.to_path_buf(),
            header,
            body,
        }))
    }

    pub fn exists(&self, rel: &Path) -> bool {
        self.resolve(rel).map(|p| p.exists()).unwrap_or(false)
    }

    /// Atomically write a page file, creating parent directories.
    pub fn write(&self, rel: &Path, header: &PageHeader, body: &str) -> Result<(), LocalError> {
        let path = self.resolve(rel)?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        std::fs::create_dir_all(&dir).map_err(|e| LocalError::io(&dir, e))?;

        let content = render_page(header, body);
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| LocalError::io(&dir, e))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| LocalError::io(&path, e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| LocalError::io(&path, e))?;
        tmp.persist(&path).map_err(|e| LocalError::io(&path, e.error))?;
        debug!(path = %rel.display(), bytes = content.len(), "wrote page file");
        Ok(())
    }

    /// Delete a page file. Already absent counts as done.
    pub fn remove(&self, rel: &Path) -> Result<(), LocalError> {
        let path = self.resolve(rel)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %rel.display(), "removed page file");
                self.prune_empty_dirs(rel);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %rel.display(), "page file already absent");
                Ok(())
            }
            Err(e) => Err(LocalError::io(&path, e)),
        }
    }

    /// Move a page file without touching its bytes. A move that already
    /// happened is a no-op.
    pub fn relocate(&self, from: &Path, to: &Path) -> Result<(), LocalError> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        if src == dst {
            return Ok(());
        }
        if !src.exists() && dst.exists() {
            debug!(from = %from.display(), to = %to.display(), "page file already relocated");
            return Ok(());
        }
        if let Some(dir) = dst.parent() {
            std::fs::create_dir_all(dir).map_err(|e| LocalError::io(dir, e))?;
        }
        std::fs::rename(&src, &dst).map_err(|e| LocalError::io(&src, e))?;
        info!(from = %from.display(), to = %to.display(), "relocated page file");
        self.prune_empty_dirs(from);
        Ok(())
    }

    /// Move the directory holding the children of page file `from` next to
    /// `to`. Returns whether anything moved; an existing target is left alone.
    pub fn relocate_children(&self, from: &Path, to: &Path) -> Result<bool, LocalError> {
        let src_rel = from.with_extension("");
        let dst_rel = to.with_extension("");
        let src = self.resolve(&src_rel)?;
        let dst = self.resolve(&dst_rel)?;
        if src == dst || !src.is_dir() || dst.exists() || dst.starts_with(&src) {
            return Ok(false);
        }
        if let Some(dir) = dst.parent() {
            std::fs::create_dir_all(dir).map_err(|e| LocalError::io(dir, e))?;
        }
        std::fs::rename(&src, &dst).map_err(|e| LocalError::io(&src, e))?;
        info!(from = %src_rel.display(), to = %dst_rel.display(), "relocated child pages");
        self.prune_empty_dirs(&src_rel);
        Ok(true)
    }

    /// Remove directories left empty by a delete or move, up to the root.
    fn prune_empty_dirs(&self, rel: &Path) {
        let mut cursor = rel.parent();
        while let Some(dir) = cursor {
            if dir.as_os_str().is_empty() {
                break;
            }
            if std::fs::remove_dir(self.root.join(dir)).is_err() {
                break;
            }
            cursor = dir.parent();
        }
    }

    /// Path for a page given the titles of its ancestors below the sync root.
    pub fn layout_path(&self, ancestor_titles: &[&str], title: &str) -> PathBuf {
        let mut path: PathBuf = ancestor_titles.iter().map(|t| slug(t)).collect();
        path.push(format!("{}.{}", slug(title), self.extension));
        path
    }

    /// Path for a child of the page stored at `parent`: `<parent stem>/<slug>`.
    pub fn child_path(&self, parent: Option<&Path>, title: &str) -> PathBuf {
        let file = format!("{}.{}", slug(title), self.extension);
        match parent {
            Some(parent) => parent.with_extension("").join(file),
            None => PathBuf::from(file),
        }
    }

    /// The file whose page is the parent of `rel`: `a/b/c.md` -> `a/b.md`.
    pub fn parent_page_path(&self, rel: &Path) -> Option<PathBuf> {
        let dir = rel.parent().filter(|d| !d.as_os_str().is_empty())?;
        Some(dir.with_extension(&self.extension))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(dir: &Path) -> LocalTree {
        LocalTree::new(dir, "md", vec!["drafts/**".into()])
    }

    #[test]
    fn test_parse_and_render_header() {
        let header = PageHeader::tracked("42", 3, "Runbook");
        let text = render_page(&header, "## Steps\n");
        assert!(text.starts_with("+++\npage_id = \"42\"\n"));
        let (parsed, body) = parse_page(Path::new("x.md"), &text).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(body, "## Steps\n");
    }

    #[test]
    fn test_file_without_header_is_untracked() {
        let (header, body) = parse_page(Path::new("x.md"), "just text\n").unwrap();
        assert!(header.page_id.is_none());
        assert_eq!(body, "just text\n");
    }

    #[test]
    fn test_unclosed_header_is_rejected() {
        let err = parse_page(Path::new("x.md"), "+++\npage_id = \"1\"\nbody").unwrap_err();
        assert!(matches!(err, LocalError::BadHeader { .. }));
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Release Checklist (v2)"), "release-checklist-v2");
        assert_eq!(slug("  --  "), "untitled");
    }

    #[test]
    fn test_scan_honours_extension_and_ignores() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree(dir.path());
        t.write(Path::new("a.md"), &PageHeader::tracked("1", 1, "A"), "a\n").unwrap();
        t.write(Path::new("a/b.md"), &PageHeader::default(), "b\n").unwrap();
        t.write(Path::new("drafts/c.md"), &PageHeader::default(), "c\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        std::fs::create_dir_all(dir.path().join(".wikisync")).unwrap();
        std::fs::write(dir.path().join(".wikisync/state.md"), "x").unwrap();

        let pages = t.scan().unwrap();
        let paths: Vec<_> = pages.iter().map(|p| p.path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("a/b.md"), PathBuf::from("a.md")]);
        assert_eq!(pages[1].header.page_id.as_deref(), Some("1"));
    }

    #[test]
    fn test_relocate_is_idempotent_and_keeps_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree(dir.path());
        t.write(Path::new("old/p.md"), &PageHeader::tracked("9", 2, "P"), "body\n")
            .unwrap();
        let before = std::fs::read(dir.path().join("old/p.md")).unwrap();

        t.relocate(Path::new("old/p.md"), Path::new("new/p.md")).unwrap();
        t.relocate(Path::new("old/p.md"), Path::new("new/p.md")).unwrap();

        assert_eq!(std::fs::read(dir.path().join("new/p.md")).unwrap(), before);
        assert!(!dir.path().join("old").exists());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree(dir.path());
        t.write(Path::new("p.md"), &PageHeader::default(), "x").unwrap();
        t.remove(Path::new("p.md")).unwrap();
        t.remove(Path::new("p.md")).unwrap();
        assert!(!t.exists(Path::new("p.md")));
    }

    #[test]
    fn test_paths_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree(dir.path());
        assert!(matches!(
            t.resolve(Path::new("../etc/passwd")),
            Err(LocalError::OutsideRoot(_))
        ));
    }

    #[test]
    fn test_layout_helpers() {
        let t = LocalTree::new("/tmp/x", "md", Vec::new());
        assert_eq!(
            t.layout_path(&["Ops", "On Call"], "Pager Duty"),
            PathBuf::from("ops/on-call/pager-duty.md")
        );
        assert_eq!(
            t.child_path(Some(Path::new("ops.md")), "Runbook"),
            PathBuf::from("ops/runbook.md")
        );
        assert_eq!(
            t.parent_page_path(Path::new("ops/runbook.md")),
            Some(PathBuf::from("ops.md"))
        );
        assert_eq!(t.parent_page_path(Path::new("top.md")), None);
    }
}
