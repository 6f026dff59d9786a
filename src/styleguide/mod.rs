//! Browsable style guide generated from documented Sass sources.
//!
//! Output layout under the style guide root:
//!
//! * `index.html` with the rendered overview and the list of sections,
//! * `section-<n>.html` for every top-level section number,
//! * `styleguide.css`, compiled separately by the `styleguide:apply-styles`
//!   task and linked from every page.

pub mod kss;

use std::collections::BTreeMap;
use std::fs;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use minijinja::{Environment, Value, context};
use serde::Serialize;

use crate::config::StyleguideConfig;
use crate::error::{PipelineError, StageError};
use crate::pipeline::Pipeline;

pub use kss::{Reference, Section};

const BASE: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{% block title %}{{ title }}{% endblock %}</title>
<link rel="stylesheet" href="{{ root }}styleguide.css">
{% for snippet in extra_head %}{{ snippet | safe }}
{% endfor %}</head>
<body class="sg">
<nav class="sg-nav">
<a href="{{ root }}index.html">{{ title }}</a>
<ul>
{% for s in menu %}<li><a href="{{ root }}section-{{ s.number }}.html">{% if numbers %}{{ s.number }} {% endif %}{{ s.title }}</a></li>
{% endfor %}</ul>
</nav>
<main class="sg-main">
{% block main %}{% endblock %}
</main>
</body>
</html>
"#;

const INDEX: &str = r#"{% extends "base.html" %}
{% block main %}<div class="sg-overview">{{ overview | safe }}</div>{% endblock %}
"#;

const SECTION: &str = r#"{% extends "base.html" %}
{% block title %}{{ heading.title }} | {{ title }}{% endblock %}
{% block main %}{% for s in sections %}
<section class="sg-section" id="section-{{ s.reference }}">
<h{{ s.level }}>{% if numbers %}<span class="sg-ref">{{ s.reference }}</span> {% endif %}{{ s.title }}</h{{ s.level }}>
{% if s.description %}<div class="sg-description">{{ s.description | safe }}</div>{% endif %}
{% if s.markup %}<div class="sg-example">{{ s.markup | safe }}</div>
<pre class="sg-code"><code>{{ s.markup }}</code></pre>{% endif %}
</section>
{% endfor %}{% endblock %}
"#;

#[derive(Serialize)]
struct MenuItem {
    number: u32,
    title: String,
}

#[derive(Serialize)]
struct SectionView {
    reference: String,
    level: usize,
    title: String,
    description: String,
    markup: Option<String>,
}

/// Generator for the style guide pages.
pub struct Styleguide {
    config: StyleguideConfig,
    sources: Vec<String>,
}

impl Styleguide {
    pub fn new(config: StyleguideConfig) -> Self {
        Self {
            config,
            sources: Vec::new(),
        }
    }

    /// Stylesheets scanned for documentation blocks.
    pub fn src(mut self, glob: impl AsRef<str>) -> Self {
        self.sources.push(glob.as_ref().to_string());
        self
    }

    /// Asset root embedded in the pages: absolute for the local preview,
    /// relative when frozen for publishing.
    pub fn root(&self) -> &'static str {
        if self.config.frozen { "" } else { "/" }
    }

    /// Every documented section found in the sources, ordered by reference.
    pub fn sections(&self) -> Result<Vec<Section>, PipelineError> {
        let files = self
            .sources
            .iter()
            .fold(Pipeline::new("styleguide"), |p, glob| p.src(glob))
            .files()?;

        let mut sections = Vec::new();
        for source in files.into_keys() {
            let text =
                fs::read_to_string(&source).map_err(|e| PipelineError::Io(source.clone(), e))?;
            sections.extend(kss::parse(&source, &text));
        }

        sections.sort_by(|a, b| a.reference.cmp(&b.reference));
        sections.dedup_by(|b, a| {
            if a.reference == b.reference {
                tracing::warn!(
                    "styleguide: section {} in '{}' shadows '{}'",
                    a.reference,
                    a.source,
                    b.source
                );
                true
            } else {
                false
            }
        });

        Ok(sections)
    }

    /// Write `index.html` and one page per top-level section into `output`.
    pub fn generate(&self, output: &Utf8Path) -> Result<Vec<Utf8PathBuf>, PipelineError> {
        let s = Instant::now();
        let sections = self.sections()?;

        let overview = match fs::read_to_string(&self.config.overview) {
            Ok(text) => comrak::markdown_to_html(&text, &comrak::Options::default()),
            Err(_) => {
                tracing::warn!(
                    "styleguide: overview '{}' not found",
                    self.config.overview
                );
                String::new()
            }
        };

        let root = self.root();
        let extra_head: Vec<String> = self
            .config
            .extra_head
            .iter()
            .map(|snippet| snippet.replace("{root}", root))
            .collect();

        let mut chapters: BTreeMap<u32, Vec<&Section>> = BTreeMap::new();
        for section in &sections {
            chapters.entry(section.reference.top()).or_default().push(section);
        }

        let menu: Vec<MenuItem> = chapters
            .iter()
            .map(|(&number, list)| MenuItem {
                number,
                title: list[0].title.clone(),
            })
            .collect();

        let engine = templates().map_err(|e| render_error(output, e))?;
        let base = context! {
            title => &self.config.title,
            root => Value::from_safe_string(root.to_string()),
            extra_head => extra_head,
            numbers => self.config.show_reference_numbers,
            menu => menu,
        };

        let mut written = Vec::new();
        let mut emit = |name: String, html: String| -> Result<(), PipelineError> {
            let path = output.join(name);
            crate::io::write_file(&path, html).map_err(|e| PipelineError::Io(path.clone(), e))?;
            written.push(path);
            Ok(())
        };

        let index = engine
            .get_template("index.html")
            .and_then(|t| t.render(context! { overview => overview, ..base.clone() }))
            .map_err(|e| render_error(output, e))?;
        emit("index.html".into(), index)?;

        for (number, list) in &chapters {
            let views: Vec<SectionView> = list
                .iter()
                .map(|s| SectionView {
                    reference: s.reference.to_string(),
                    level: (s.reference.depth() + 1).min(6),
                    title: s.title.clone(),
                    description: comrak::markdown_to_html(
                        &s.description,
                        &comrak::Options::default(),
                    ),
                    markup: s.markup.clone(),
                })
                .collect();

            let html = engine
                .get_template("section.html")
                .and_then(|t| {
                    t.render(context! {
                        heading => &views[0],
                        sections => &views,
                        ..base.clone()
                    })
                })
                .map_err(|e| render_error(output, e))?;
            emit(format!("section-{number}.html"), html)?;
        }

        tracing::info!(
            "styleguide: {} sections, {} pages {}",
            sections.len(),
            written.len(),
            crate::io::as_overhead(s)
        );

        Ok(written)
    }
}

fn templates() -> Result<Environment<'static>, minijinja::Error> {
    let mut env = Environment::new();
    env.add_template("base.html", BASE)?;
    env.add_template("index.html", INDEX)?;
    env.add_template("section.html", SECTION)?;
    Ok(env)
}

fn render_error(output: &Utf8Path, e: minijinja::Error) -> PipelineError {
    PipelineError::Stage {
        stage: "styleguide".into(),
        path: output.to_path_buf(),
        source: StageError::Template(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: Utf8PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
            let files = [
                (
                    "src/assets/scss/_buttons.scss",
                    "// Buttons\n//\n// Primary *actions*.\n//\n// Markup: <button class=\"btn\">Go</button>\n//\n// Styleguide 1.1\n.btn{}\n",
                ),
                (
                    "src/assets/scss/app.scss",
                    "// Basics\n//\n// Styleguide 1\n\n// Colors\n//\n// Styleguide 2\n",
                ),
                ("README.md", "# Welcome\n\nHello."),
            ];
            for (path, text) in files {
                crate::io::write_file(&root.join(path), text).unwrap();
            }
            Self { _tmp: tmp, root }
        }

        fn guide(&self, frozen: bool) -> Styleguide {
            Styleguide::new(StyleguideConfig {
                overview: self.root.join("README.md"),
                frozen,
                ..StyleguideConfig::default()
            })
            .src(self.root.join("src/**/scss/**/*.scss"))
        }

        fn read(&self, path: &str) -> String {
            fs::read_to_string(self.root.join(path)).unwrap()
        }
    }

    #[test]
    fn collects_sections_across_files_in_order() {
        let fx = Fixture::new();
        let refs: Vec<String> = fx
            .guide(false)
            .sections()
            .unwrap()
            .iter()
            .map(|s| s.reference.to_string())
            .collect();

        assert_eq!(refs, ["1", "1.1", "2"]);
    }

    #[test]
    fn writes_index_and_section_pages() {
        let fx = Fixture::new();
        let written = fx.guide(false).generate(&fx.root.join("styleguide")).unwrap();

        assert_eq!(written.len(), 3);

        let index = fx.read("styleguide/index.html");
        assert!(index.contains("<h1>Welcome</h1>"));
        assert!(index.contains(r#"href="/section-2.html""#));

        let section = fx.read("styleguide/section-1.html");
        assert!(section.contains(r#"<button class="btn">Go</button>"#));
        assert!(section.contains("&lt;button class=&quot;btn&quot;&gt;Go"));
        assert!(section.contains("<em>actions</em>"));
        assert!(section.contains(r#"<span class="sg-ref">1.1</span>"#));
    }

    #[test]
    fn preview_uses_absolute_paths() {
        let fx = Fixture::new();
        fx.guide(false).generate(&fx.root.join("styleguide")).unwrap();

        let index = fx.read("styleguide/index.html");
        assert!(index.contains(r#"href="/styleguide.css""#));
        assert!(index.contains(r#"<script src="/static/js/app.js"></script>"#));
    }

    #[test]
    fn frozen_uses_relative_paths() {
        let fx = Fixture::new();
        fx.guide(true).generate(&fx.root.join("styleguide")).unwrap();

        let index = fx.read("styleguide/index.html");
        assert!(index.contains(r#"href="styleguide.css""#));
        assert!(index.contains(r#"<script src="static/js/app.js"></script>"#));
    }
}
