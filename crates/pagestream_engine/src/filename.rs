use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};

use pagestream_core::{ArtifactSource, Artifacts, ContentKind, SessionId};
use url::Url;

/// File-name stem the engine uses for a URL: the host with dots replaced by
/// underscores, followed by `_<path>` with slashes replaced by underscores.
/// `https://www.example.com/docs/intro` → `www_example_com_docs_intro`.
/// The engine works on the decoded path, so `%20` becomes a space.
pub fn artifact_prefix(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.replace('.', "_");
    let path = decoded_path(&parsed);
    let path = path.trim_matches('/').replace('/', "_");
    if path.is_empty() {
        Some(host)
    } else {
        Some(format!("{host}_{path}"))
    }
}

/// Object-store key the engine uploads an artifact under:
/// `<uuid>+<host and path, with :/?&=# as underscores>.<html|md>`.
pub fn object_key(uuid: &SessionId, url: &str, kind: ContentKind) -> String {
    let sanitized = match Url::parse(url) {
        Ok(parsed) => {
            let mut host = parsed.host_str().unwrap_or_default().to_string();
            if let Some(port) = parsed.port() {
                host = format!("{host}:{port}");
            }
            let mut path = decoded_path(&parsed).into_owned();
            // `https://a.com` and `https://a.com/` parse alike; only the
            // latter has a path for the engine.
            if path == "/" && !has_explicit_root(url) {
                path.clear();
            }
            format!("{host}{path}").replace([':', '/', '?', '&', '=', '#'], "_")
        }
        Err(_) => url.replace('/', "_"),
    };
    format!("{uuid}+{sanitized}.{}", extension(kind))
}

fn has_explicit_root(url: &str) -> bool {
    url.split(['?', '#']).next().unwrap_or(url).ends_with('/')
}

fn decoded_path(parsed: &Url) -> Cow<'_, str> {
    let raw = parsed.path();
    urlencoding::decode(raw).unwrap_or(Cow::Borrowed(raw))
}

fn extension(kind: ContentKind) -> &'static str {
    match kind {
        ContentKind::Markup => "html",
        ContentKind::Text => "md",
    }
}

/// Looks for `<prefix>_<YYYY-MM-DD>.html|.md` in `dir`, newest date first.
/// Unreadable directories yield no artifacts.
pub fn find_artifacts(dir: &Path, url: &str) -> Artifacts {
    let mut artifacts = Artifacts::default();
    let Some(prefix) = artifact_prefix(url) else {
        return artifacts;
    };
    let Ok(entries) = fs::read_dir(dir) else {
        return artifacts;
    };

    let names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();

    for kind in ContentKind::ALL {
        let newest = names
            .iter()
            .filter(|name| matches_artifact(name, &prefix, extension(kind)))
            .max();
        if let Some(name) = newest {
            artifacts.set(kind, ArtifactSource::Path(dir.join(name)));
        }
    }
    artifacts
}

fn matches_artifact(name: &str, prefix: &str, ext: &str) -> bool {
    let Some(rest) = name.strip_prefix(prefix).and_then(|r| r.strip_prefix('_')) else {
        return false;
    };
    let Some(date) = rest.strip_suffix(ext).and_then(|r| r.strip_suffix('.')) else {
        return false;
    };
    // Requiring the date keeps `example_com` from claiming `example_com_docs_*`.
    is_iso_date(date)
}

fn is_iso_date(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

/// Resolves relative artifact paths reported by the engine against the
/// directory it was told to write into.
pub fn resolve_reported(path: &str, output_dir: Option<&Path>) -> PathBuf {
    let reported = PathBuf::from(path);
    match output_dir {
        Some(dir) if reported.is_relative() && !reported.starts_with(dir) => dir.join(reported),
        _ => reported,
    }
}
