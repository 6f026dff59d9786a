//! Page composition with layouts, partials, helpers and data files.
//!
//! The source tree follows the usual flat-file layout:
//!
//! ```text
//! src/
//!   pages/**/*.html     one output page each, optional YAML front matter
//!   layouts/*.html      page shells, the page is available as `body`
//!   partials/**/*.html  `{% include "nav/menu" %}`
//!   helpers/**/*.html   macro libraries, `{% import "helpers/fmt" as fmt %}`
//!   data/*.{json,toml}  global variables named after the file
//! ```
//!
//! Everything except the pages is loaded once and kept until
//! [`Composer::refresh`] is called.

use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, LazyLock, RwLock};

use camino::{Utf8Path, Utf8PathBuf};
use gray_matter::engine::YAML;
use gray_matter::{Matter, Pod};
use minijinja::{AutoEscape, Value, context};

use crate::core::Environment;
use crate::error::StageError;
use crate::pipeline::{Asset, Stage};

type Hook = Arc<dyn Fn(&mut minijinja::Environment<'static>) + Send + Sync>;

type Engine = Arc<minijinja::Environment<'static>>;

pub struct Composer {
    layouts: Utf8PathBuf,
    partials: Utf8PathBuf,
    helpers: Utf8PathBuf,
    data: Utf8PathBuf,
    hooks: Vec<Hook>,
    cache: RwLock<Option<Engine>>,
}

impl Composer {
    /// Composer reading `layouts`, `partials`, `helpers` and `data` from
    /// under `src`.
    pub fn new(src: &Utf8Path) -> Self {
        Self {
            layouts: src.join("layouts"),
            partials: src.join("partials"),
            helpers: src.join("helpers"),
            data: src.join("data"),
            hooks: Vec::new(),
            cache: RwLock::new(None),
        }
    }

    /// Register extra functions, filters or globals on every engine built
    /// by this composer.
    pub fn configure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut minijinja::Environment<'static>) + Send + Sync + 'static,
    {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// Forget every loaded layout, partial, helper and data file. The next
    /// compile reads them from disk again.
    pub fn refresh(&self) {
        *self.cache.write().unwrap() = None;
        tracing::debug!("template cache cleared");
    }

    fn engine(&self) -> Result<Engine, StageError> {
        if let Some(engine) = self.cache.read().unwrap().as_ref() {
            return Ok(engine.clone());
        }

        let mut cache = self.cache.write().unwrap();
        if let Some(engine) = cache.as_ref() {
            return Ok(engine.clone());
        }

        let engine = Arc::new(self.load()?);
        *cache = Some(engine.clone());
        Ok(engine)
    }

    fn load(&self) -> Result<minijinja::Environment<'static>, StageError> {
        let mut env = minijinja::Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::Html);
        env.add_filter("markdown", markdown);

        for (name, path) in templates(&self.layouts)? {
            env.add_template_owned(format!("layouts/{name}"), read(&path)?)?;
        }
        for (name, path) in templates(&self.partials)? {
            env.add_template_owned(name, read(&path)?)?;
        }
        for (name, path) in templates(&self.helpers)? {
            env.add_template_owned(format!("helpers/{name}"), read(&path)?)?;
        }

        for (name, value) in load_data(&self.data)? {
            env.add_global(name, value);
        }

        for hook in &self.hooks {
            hook(&mut env);
        }

        Ok(env)
    }

    /// Compose one page. `page` is the output path relative to the site root
    /// and determines the `root` variable.
    pub fn compile(
        &self,
        env: &Environment,
        page: &Utf8Path,
        text: &str,
    ) -> Result<String, StageError> {
        static PARSER: LazyLock<Matter<YAML>> = LazyLock::new(Matter::<YAML>::new);

        let entity = PARSER
            .parse::<Pod>(text)
            .map_err(|e| StageError::Data(format!("front matter: {e}")))?;
        let front = entity
            .data
            .unwrap_or_else(Pod::new_hash)
            .deserialize::<BTreeMap<String, serde_json::Value>>()
            .map_err(|e| StageError::Data(format!("front matter: {e}")))?;

        let layout = match front.get("layout") {
            Some(serde_json::Value::String(name)) => name.clone(),
            _ => "default".to_string(),
        };

        let ctx = context! {
            page => page.file_stem().unwrap_or_default(),
            root => Value::from_safe_string(root_prefix(page)),
            ..Value::from_serialize(&front)
        };

        let engine = self.engine()?;
        let body = engine.render_named_str(page.as_str(), &entity.content, &ctx)?;

        let mut html = if layout == "none" {
            body
        } else {
            engine.get_template(&format!("layouts/{layout}"))?.render(context! {
                body => Value::from_safe_string(body),
                ..ctx
            })?
        };

        if let Some(script) = env.get_refresh_script() {
            match html.rfind("</body>") {
                Some(at) => html.insert_str(at, &script),
                None => html.push_str(&script),
            }
        }

        Ok(html)
    }
}

/// `../` once for every directory between the page and the site root.
fn root_prefix(page: &Utf8Path) -> String {
    let depth = page.components().count().saturating_sub(1);
    "../".repeat(depth)
}

fn markdown(text: &str) -> Value {
    Value::from_safe_string(comrak::markdown_to_html(text, &comrak::Options::default()))
}

fn read(path: &Utf8Path) -> Result<String, StageError> {
    Ok(fs::read_to_string(path)?)
}

/// Every `*.html` under `dir`, named by its relative path without extension.
fn templates(dir: &Utf8Path) -> Result<Vec<(String, Utf8PathBuf)>, StageError> {
    let mut found = Vec::new();

    for path in files(dir, "**/*.html")? {
        let name = path
            .strip_prefix(dir)
            .unwrap_or(path.as_path())
            .with_extension("")
            .as_str()
            .replace('\\', "/");
        found.push((name, path));
    }

    Ok(found)
}

fn load_data(dir: &Utf8Path) -> Result<Vec<(String, Value)>, StageError> {
    let mut found = Vec::new();

    for path in files(dir, "*")? {
        let Some(stem) = path.file_stem() else {
            continue;
        };
        let text = read(&path)?;

        let value: serde_json::Value = match path.extension() {
            Some("json") => serde_json::from_str(&text)
                .map_err(|e| StageError::Data(format!("{path}: {e}")))?,
            Some("toml") => {
                toml::from_str(&text).map_err(|e| StageError::Data(format!("{path}: {e}")))?
            }
            _ => continue,
        };

        found.push((stem.to_string(), Value::from_serialize(&value)));
    }

    Ok(found)
}

fn files(dir: &Utf8Path, pattern: &str) -> Result<Vec<Utf8PathBuf>, StageError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let pattern = format!("{}/{pattern}", glob::Pattern::escape(dir.as_str()));
    let paths = glob::glob(&pattern).map_err(|e| StageError::Data(e.to_string()))?;

    let mut found = Vec::new();
    for path in paths {
        let path = path.map_err(|e| StageError::Io(e.into_error()))?;
        let path = Utf8PathBuf::try_from(path).map_err(|e| StageError::Io(e.into_io_error()))?;
        if path.is_file() {
            found.push(path);
        }
    }

    Ok(found)
}

/// Pipeline stage composing every page through a shared [`Composer`].
pub struct Compose {
    composer: Arc<Composer>,
}

impl Compose {
    pub fn new(composer: Arc<Composer>) -> Self {
        Self { composer }
    }
}

impl Stage for Compose {
    fn name(&self) -> &str {
        "compose"
    }

    fn apply(&self, env: &Environment, asset: Asset) -> Result<Vec<Asset>, StageError> {
        let html = self.composer.compile(env, &asset.path, asset.text()?)?;
        Ok(vec![asset.with_data(html)])
    }
}
