//! A dead-simple router implementation
//!
//! A `Router` matches a request path against the configured locations. The
//! location whose prefix covers the most path components wins; the rest of
//! the path is looked up under that location's root.

use crate::config::{CgiRule, LocationConfig};
use crate::errors::*;

use std::ffi::OsStr;
use std::fs::canonicalize;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

pub struct Router {
    locations: Vec<Location>,
}

struct Location {
    prefix: PathBuf,
    root: PathBuf,
    index: String,
    cgi: Vec<CgiRule>,
}

/// What a request path resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub file: PathBuf,
    pub kind: TargetKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKind {
    Static,
    /// Run `file` as a script, through `interpreter` if there is one.
    Cgi { interpreter: Option<PathBuf> },
}

impl Router {
    /// Builds a router over `locations`. Every root must exist.
    pub fn new(locations: &[LocationConfig]) -> Result<Router> {
        let mut routes = Vec::with_capacity(locations.len());

        for location in locations {
            routes.push(Location {
                prefix: Path::new("/").join(&location.prefix),
                root: canonicalize(&location.root)?,
                index: location.index.clone(),
                cgi: location.cgi.clone(),
            });
        }

        Ok(Router { locations: routes })
    }

    /// Maps a decoded request path (no leading slash) onto the filesystem.
    ///
    /// `Ok(None)` means no location covers the path.
    pub fn resolve(&self, path: &OsStr) -> Result<Option<Target>> {
        let request_path = Path::new("/").join(path);

        if request_path.components().any(|c| c == Component::ParentDir) {
            return Err(Error::PermissionDenied);
        }

        let mut best: Option<&Location> = None;
        for location in &self.locations {
            if !request_path.starts_with(&location.prefix) {
                continue;
            }
            let depth = location.prefix.components().count();
            if best.map_or(true, |b| depth > b.prefix.components().count()) {
                best = Some(location);
            }
        }

        let location = match best {
            Some(l) => l,
            None => return Ok(None),
        };

        let rest = request_path
            .strip_prefix(&location.prefix)
            .map_err(|_| Error::NotFound)?;

        let mut file = location.root.join(rest);
        if rest.as_os_str().is_empty() || file.is_dir() {
            file.push(&location.index);
        }

        let kind = match location.cgi_rule(&file) {
            Some(rule) => TargetKind::Cgi {
                interpreter: rule.interpreter.clone(),
            },
            None => TargetKind::Static,
        };

        Ok(Some(Target { file, kind }))
    }
}

impl Location {
    fn cgi_rule(&self, file: &Path) -> Option<&CgiRule> {
        let name = file.file_name()?.as_bytes();
        self.cgi
            .iter()
            .find(|rule| name.len() > rule.suffix.len() && name.ends_with(rule.suffix.as_bytes()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs;

    use tempfile::TempDir;

    fn location(prefix: &str, root: &Path) -> LocationConfig {
        LocationConfig {
            prefix: PathBuf::from(prefix),
            root: root.to_owned(),
            index: String::from("index.html"),
            cgi: vec![CgiRule {
                suffix: String::from(".sh"),
                interpreter: Some(PathBuf::from("/bin/sh")),
            }],
        }
    }

    fn layout() -> (TempDir, TempDir, Router) {
        let site = tempfile::tempdir().unwrap();
        let scripts = tempfile::tempdir().unwrap();
        fs::create_dir(site.path().join("docs")).unwrap();

        let router = Router::new(&[location("/", site.path()),
                                   location("/cgi-bin", scripts.path())]).unwrap();
        (site, scripts, router)
    }

    fn root(dir: &TempDir) -> PathBuf {
        canonicalize(dir.path()).unwrap()
    }

    #[test]
    fn empty_path_is_the_index() {
        let (site, _scripts, router) = layout();
        let target = router.resolve(OsStr::new("")).unwrap().unwrap();
        assert_eq!(target.file, root(&site).join("index.html"));
        assert_eq!(target.kind, TargetKind::Static);
    }

    #[test]
    fn directories_get_the_index() {
        let (site, _scripts, router) = layout();
        let target = router.resolve(OsStr::new("docs/")).unwrap().unwrap();
        assert_eq!(target.file, root(&site).join("docs/index.html"));
    }

    #[test]
    fn longest_prefix_wins() {
        let (_site, scripts, router) = layout();
        let target = router.resolve(OsStr::new("cgi-bin/run.sh")).unwrap().unwrap();
        assert_eq!(target.file, root(&scripts).join("run.sh"));
        assert_eq!(target.kind, TargetKind::Cgi { interpreter: Some(PathBuf::from("/bin/sh")) });
    }

    #[test]
    fn prefixes_match_whole_components() {
        let (site, _scripts, router) = layout();
        let target = router.resolve(OsStr::new("cgi-binary")).unwrap().unwrap();
        assert_eq!(target.file, root(&site).join("cgi-binary"));
    }

    #[test]
    fn parent_components_are_forbidden() {
        let (_site, _scripts, router) = layout();
        match router.resolve(OsStr::new("docs/../../etc/passwd")) {
            Err(Error::PermissionDenied) => (),
            other => panic!("{:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn bare_suffix_is_not_a_script() {
        let (_site, _scripts, router) = layout();
        let target = router.resolve(OsStr::new(".sh")).unwrap().unwrap();
        assert_eq!(target.kind, TargetKind::Static);
    }

    #[test]
    fn unmatched_paths_resolve_to_nothing() {
        let site = tempfile::tempdir().unwrap();
        let router = Router::new(&[location("/static", site.path())]).unwrap();
        assert_eq!(router.resolve(OsStr::new("other/file")).unwrap(), None);
    }

    #[test]
    fn missing_root_is_an_error() {
        assert!(Router::new(&[location("/", Path::new("/no/such/root"))]).is_err());
    }
}
