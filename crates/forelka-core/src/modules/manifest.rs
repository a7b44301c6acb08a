//! Module file discovery, header comments and dependency provisioning.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::OnceLock,
};

use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{modules::LoadError, utils::which_in_path};

/// Metadata declared in a module file's comment header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleHeader {
    pub developer: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub requirements: Vec<String>,
}

fn header_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*(?:#|//|--)\s*(developer|version|description|requirements|scope:\s*pip)\s*:(.*)$",
        )
        .ok()
    })
    .as_ref()
}

pub fn parse_header(text: &str) -> ModuleHeader {
    let mut header = ModuleHeader::default();
    let Some(re) = header_re() else {
        return header;
    };
    for line in text.lines() {
        let Some(caps) = re.captures(line) else {
            continue;
        };
        let key = caps[1].to_ascii_lowercase();
        let value = caps[2].trim();
        match key.as_str() {
            "developer" => header.developer = non_empty(value),
            "version" => header.version = non_empty(value),
            "description" => header.description = non_empty(value),
            _ => header
                .requirements
                .extend(value.split_whitespace().map(str::to_string)),
        }
    }
    header
}

/// A missing or unreadable file yields an empty header.
pub fn read_header(path: &Path) -> ModuleHeader {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_header(&text),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "module header unreadable");
            ModuleHeader::default()
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// Derive the module name for an eligible file: not hidden, not `__*`, with
/// one of `extensions`. The name is the lowercased file stem.
pub fn module_name_for(path: &Path, extensions: &[String]) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    if file_name.starts_with('.') || file_name.starts_with("__") {
        return None;
    }
    let ext = path.extension()?.to_str()?;
    if !extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    (!stem.is_empty()).then(|| stem.to_lowercase())
}

/// Eligible files of one directory, sorted by name.
pub fn scan_dir(dir: &Path, extensions: &[String]) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if let Some(name) = module_name_for(&path, extensions) {
            out.push((name, path));
        }
    }
    out.sort();
    Ok(out)
}

/// Make sure every requirement resolves; install the missing ones.
///
/// Python modules (`ext == "py"`) resolve a requirement by importing it with
/// their interpreter; every other kind looks for an executable on `PATH`.
/// The install runs to completion with no cancellation hook.
pub async fn ensure_requirements(
    requirements: &[String],
    ext: &str,
    interpreter: &str,
    install_command: &[String],
) -> Result<(), LoadError> {
    for req in requirements {
        if is_resolvable(req, ext, interpreter).await {
            debug!(requirement = %req, "requirement available");
            continue;
        }
        install(req, install_command).await?;
    }
    Ok(())
}

async fn is_resolvable(req: &str, ext: &str, interpreter: &str) -> bool {
    if !ext.eq_ignore_ascii_case("py") {
        return which_in_path(req).is_some();
    }
    let Some(import) = import_name(req) else {
        return false;
    };
    match Command::new(interpreter)
        .arg("-c")
        .arg(format!("import {import}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(e) => {
            warn!(requirement = %req, %interpreter, error = %e, "cannot run interpreter to check requirement");
            false
        }
    }
}

/// Importable name of a package requirement: version markers are dropped
/// and dashes become underscores (`python-dateutil>=2` -> `python_dateutil`).
fn import_name(req: &str) -> Option<String> {
    let base = req
        .split(|c: char| "<>=!~[;@ ".contains(c))
        .next()
        .unwrap_or_default()
        .trim();
    let name = base.replace('-', "_");
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    valid.then_some(name)
}

async fn install(req: &str, install_command: &[String]) -> Result<(), LoadError> {
    let Some((program, args)) = install_command.split_first() else {
        return Err(LoadError::Dependency {
            requirement: req.to_string(),
            reason: "no install command configured".to_string(),
        });
    };

    info!(requirement = %req, installer = %program, "installing module requirement");
    let status = Command::new(program)
        .args(args)
        .arg(req)
        .status()
        .await
        .map_err(|e| LoadError::Dependency {
            requirement: req.to_string(),
            reason: format!("failed to run {program}: {e}"),
        })?;

    if !status.success() {
        warn!(requirement = %req, %status, "requirement install failed");
        return Err(LoadError::Dependency {
            requirement: req.to_string(),
            reason: format!("{program} exited with {status}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exts() -> Vec<String> {
        vec!["py".to_string(), "sh".to_string()]
    }

    #[test]
    fn parses_header_fields_and_requirements() {
        let text = "#!/bin/sh\n\
                    # developer: Kirill\n\
                    # version: 1.2\n\
                    # description: Does things\n\
                    # requirements: jq curl\n\
                    # scope: pip: requests\n\
                    echo hi # version: not a header\n";
        let h = parse_header(text);
        assert_eq!(h.developer.as_deref(), Some("Kirill"));
        assert_eq!(h.version.as_deref(), Some("1.2"));
        assert_eq!(h.description.as_deref(), Some("Does things"));
        assert_eq!(h.requirements, vec!["jq", "curl", "requests"]);
    }

    #[test]
    fn missing_file_has_no_requirements() {
        let h = read_header(Path::new("/definitely/not/here.py"));
        assert_eq!(h, ModuleHeader::default());
    }

    #[test]
    fn eligibility_rules() {
        let e = exts();
        assert_eq!(module_name_for(Path::new("m/Ping.py"), &e).as_deref(), Some("ping"));
        assert_eq!(module_name_for(Path::new("m/tool.SH"), &e).as_deref(), Some("tool"));
        assert_eq!(module_name_for(Path::new("m/.hidden.py"), &e), None);
        assert_eq!(module_name_for(Path::new("m/__init__.py"), &e), None);
        assert_eq!(module_name_for(Path::new("m/readme.md"), &e), None);
        assert_eq!(module_name_for(Path::new("m/noext"), &e), None);
    }

    #[test]
    fn scan_dir_lists_eligible_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for f in ["b.py", "a.sh", ".x.py", "__init__.py", "notes.txt"] {
            std::fs::write(dir.path().join(f), "").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.py")).unwrap();

        let names: Vec<_> = scan_dir(dir.path(), &exts())
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn available_requirements_need_no_install() {
        let reqs = vec!["sh".to_string()];
        ensure_requirements(&reqs, "sh", "sh", &["false".to_string()])
            .await
            .unwrap();
    }

    #[test]
    fn import_names_drop_version_markers() {
        assert_eq!(import_name("json").as_deref(), Some("json"));
        assert_eq!(import_name("python-dateutil>=2.8").as_deref(), Some("python_dateutil"));
        assert_eq!(import_name("requests[socks]").as_deref(), Some("requests"));
        assert_eq!(import_name("os.path").as_deref(), Some("os.path"));
        assert_eq!(import_name("x; rm -rf /").as_deref(), Some("x"));
        assert_eq!(import_name("==1.0"), None);
        assert_eq!(import_name("a$b"), None);
    }

    #[tokio::test]
    async fn python_requirements_resolve_by_import() {
        if which_in_path("python3").is_none() {
            return;
        }
        let reqs = vec!["json".to_string()];
        ensure_requirements(&reqs, "py", "python3", &["false".to_string()])
            .await
            .unwrap();

        let reqs = vec!["definitely_missing_pkg_xyz".to_string()];
        let err = ensure_requirements(&reqs, "py", "python3", &["false".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Dependency { .. }));
    }

    #[tokio::test]
    async fn failed_install_fails_with_dependency_error() {
        let reqs = vec!["definitely-missing-tool-xyz".to_string()];
        let err = ensure_requirements(&reqs, "sh", "sh", &["false".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LoadError::Dependency { ref requirement, .. } if requirement == "definitely-missing-tool-xyz"
        ));
    }

    #[tokio::test]
    async fn successful_install_passes() {
        let reqs = vec!["definitely-missing-tool-xyz".to_string()];
        ensure_requirements(&reqs, "sh", "sh", &["true".to_string()])
            .await
            .unwrap();
    }
}
