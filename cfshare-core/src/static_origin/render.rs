use crate::types::FilesMode;
use crate::types::ManifestEntry;

use super::manifest::BUNDLE_ENTRY_NAME;

/// Pure `manifest -> html bytes` renderers. One plain, dependency-light
/// template; swapping it later for a themed one does not touch `serve.rs`.
pub fn render_explorer(title: &str, manifest: &[ManifestEntry], files_mode: FilesMode) -> Vec<u8> {
    let mut rows = String::new();
    for entry in manifest {
        if files_mode == FilesMode::Zip && entry.name == BUNDLE_ENTRY_NAME {
            continue;
        }
        rows.push_str(&format!(
            "<tr><td><a href=\"/{href}\">{name}</a></td><td>{size}</td><td>{sha}</td><td>{modified}</td></tr>\n",
            href = entry.relative_url,
            name = html_escape(&entry.name),
            size = entry.size,
            sha = &entry.sha256[..12.min(entry.sha256.len())],
            modified = entry.modified_at.to_rfc3339(),
        ));
    }

    let download_all = if files_mode == FilesMode::Zip {
        "<p><a href=\"/download.zip\">Download all as .zip</a></p>"
    } else {
        ""
    };

    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\n\
         <title>{title}</title></head><body>\n\
         <h1>{title}</h1>\n{download_all}\n\
         <table><thead><tr><th>Name</th><th>Size</th><th>SHA-256</th><th>Modified</th></tr></thead>\n\
         <tbody>\n{rows}</tbody></table>\n</body></html>\n",
        title = html_escape(title),
    )
    .into_bytes()
}

/// Index page shown at `/` in zip mode when the single-file shortcut does
/// not apply: links to `/download.zip` and lists bundle contents.
pub fn render_zip_index(title: &str, manifest: &[ManifestEntry]) -> Vec<u8> {
    render_explorer(title, manifest, FilesMode::Zip)
}

/// Strip a leading `---`-delimited YAML front-matter block, then render the
/// remainder via `pulldown-cmark`.
pub fn render_markdown(source: &str) -> Vec<u8> {
    let body = strip_front_matter(source);
    let parser = pulldown_cmark::Parser::new(body);
    let mut html_body = String::new();
    pulldown_cmark::html::push_html(&mut html_body, parser);
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"></head>\n\
         <body>\n{html_body}</body></html>\n"
    )
    .into_bytes()
}

fn strip_front_matter(source: &str) -> &str {
    let Some(rest) = source.strip_prefix("---\n") else {
        return source;
    };
    match rest.find("\n---\n") {
        Some(idx) => &rest[idx + 5..],
        None => match rest.find("\n---") {
            Some(idx) if idx + 4 == rest.len() => "",
            _ => source,
        },
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn entry(name: &str) -> ManifestEntry {
        ManifestEntry {
            name: name.to_string(),
            size: 3,
            sha256: "abcdef0123456789".to_string(),
            relative_url: name.to_string(),
            modified_at: DateTime::parse_from_rfc3339("2026-01-01T00:00:00+00:00")
                .expect("fixed ts"),
        }
    }

    #[test]
    fn explorer_lists_entries_and_escapes_names() {
        let manifest = vec![entry("<script>.txt")];
        let html = String::from_utf8(render_explorer("demo", &manifest, FilesMode::Normal))
            .expect("utf8");
        assert!(html.contains("&lt;script&gt;.txt"));
        assert!(!html.contains("<script>.txt</a>"));
    }

    #[test]
    fn explorer_hides_bundle_entry_in_zip_mode() {
        let manifest = vec![entry("a.txt"), entry(BUNDLE_ENTRY_NAME)];
        let html = String::from_utf8(render_explorer("demo", &manifest, FilesMode::Zip))
            .expect("utf8");
        assert!(html.contains("a.txt"));
        assert!(!html.contains(BUNDLE_ENTRY_NAME));
        assert!(html.contains("download.zip"));
    }

    #[test]
    fn markdown_strips_front_matter_and_renders() {
        let source = "---\ntitle: Hi\n---\n# Hello\n";
        let html = String::from_utf8(render_markdown(source)).expect("utf8");
        assert!(html.contains("<h1>Hello</h1>"));
        assert!(!html.contains("title: Hi"));
    }

    #[test]
    fn markdown_without_front_matter_renders_as_is() {
        let html = String::from_utf8(render_markdown("# Hi\n")).expect("utf8");
        assert!(html.contains("<h1>Hi</h1>"));
    }
}
