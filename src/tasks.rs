//! The named tasks and sequences of a site, wired from a [`Config`].
//!
//! | task                      | does                                              |
//! |---------------------------|---------------------------------------------------|
//! | `clean:dist`              | empties the output root                           |
//! | `sass`                    | `assets/scss/*.scss` to `assets/css`              |
//! | `compile-html`            | composes `pages/**/*.html`                        |
//! | `reset-pages`             | drops cached layouts, partials, helpers and data  |
//! | `scripts`                 | `assets/js/app.js` plus a minified copy           |
//! | `images`                  | optimised images, cached across runs              |
//! | `media`, `font`           | plain copies                                      |
//! | `watch`                   | dev server with live reload                       |
//! | `styleguide`              | the style guide and everything it needs           |
//! | `styleguide:watch`        | style guide server, rebuilt on style changes      |

use std::sync::Arc;

use camino::Utf8Path;

use crate::config::{Config, MinifierKind};
use crate::engine::{Registry, Sequence, TaskContext};
use crate::error::PipelineError;
use crate::pipeline::{ErrorPolicy, Pipeline};
use crate::plugin::{
    Compose, Composer, Esbuild, ImageCache, ImageOptimizer, Minifier, Minify, Optimize, Prefix,
    Sass,
};
use crate::styleguide::Styleguide;

/// Build the task registry for `config`.
pub fn registry(config: Arc<Config>) -> Registry {
    let mut registry = Registry::new();

    site_tasks(&mut registry, &config);
    styleguide_tasks(&mut registry, &config);

    registry.sequence(
        "default",
        Sequence::new()
            .then("clean:dist")
            .group(["font", "scripts", "images"])
            .then("compile-html")
            .then("reset-pages")
            .then("media")
            .then("watch"),
    );

    registry.sequence(
        "build",
        Sequence::new()
            .then("clean:dist")
            .then("sass")
            .group(["scripts", "images", "font", "compile-html"]),
    );

    registry
}

/// Fail the task on a pipeline error, unless the task runs tolerant, in
/// which case the error is only logged.
fn tolerate<T>(ctx: &TaskContext<'_>, result: Result<T, PipelineError>) -> anyhow::Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if ctx.tolerant => {
            tracing::error!("{}: {e}", ctx.name);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn under(dir: &Utf8Path, pattern: &str) -> String {
    format!("{}/{pattern}", glob::Pattern::escape(dir.as_str()))
}

fn site_tasks(registry: &mut Registry, config: &Arc<Config>) {
    let assets = config.assets();
    let out = config.dist_assets();

    let dist = config.dist.clone();
    registry.register("clean:dist", Vec::<String>::new(), move |_| {
        crate::io::clear_dir(&dist)?;
        Ok(())
    });

    let sass = Pipeline::new("sass")
        .root(&config.src)
        .src(under(&assets, "scss/*.scss"))
        .stage(Sass::new(config.styles.output_style).load_path(assets.join("scss")))
        .stage(Prefix::new(&config.styles.targets, config.styles.minify))
        .sourcemaps(config.sourcemaps)
        .policy(ErrorPolicy::Abort)
        .dest(out.join("css"));
    registry.register("sass", Vec::<String>::new(), move |ctx| {
        tolerate(ctx, sass.run(ctx.env))
    });

    let composer = Arc::new(Composer::new(&config.src));

    let pages = Pipeline::new("compile-html")
        .root(&config.src)
        .src(under(&config.src, "pages/**/*.html"))
        .stage(Compose::new(composer.clone()))
        .policy(ErrorPolicy::Continue)
        .dest(&config.dist);
    registry.register("compile-html", Vec::<String>::new(), move |ctx| {
        tolerate(ctx, pages.run(ctx.env))
    });

    registry.register("reset-pages", Vec::<String>::new(), move |_| {
        composer.refresh();
        tracing::info!("cleared template cache");
        Ok(())
    });

    let minifier: Option<Arc<dyn Minifier>> = match config.scripts.minifier {
        MinifierKind::Esbuild => Some(Arc::new(Esbuild)),
        MinifierKind::None => None,
    };

    let mut scripts = Pipeline::new("scripts")
        .root(&config.src)
        .sourcemaps(config.sourcemaps)
        .dest(out.join("js"));
    scripts = match (&config.scripts.concat, minifier) {
        (Some(target), Some(engine)) => scripts
            .src(under(&assets, "js/**/*.js"))
            .concat(Some(target))
            .finish(Minify::new(engine)),
        (Some(target), None) => scripts
            .src(under(&assets, "js/**/*.js"))
            .concat(Some(target)),
        (None, Some(engine)) => scripts
            .src(under(&assets, "js/app.js"))
            .stage(Minify::new(engine)),
        (None, None) => scripts.src(under(&assets, "js/app.js")),
    };
    registry.register("scripts", Vec::<String>::new(), move |ctx| {
        tolerate(ctx, scripts.run(ctx.env))
    });

    let cache = ImageCache::new(
        config.cache.join("img"),
        Arc::new(ImageOptimizer::new(&config.images)),
    );
    let images = ["png", "jpg", "jpeg", "gif", "svg"]
        .into_iter()
        .fold(Pipeline::new("images").root(&config.src), |p, ext| {
            p.src(under(&assets, &format!("img/**/*.{ext}")))
        })
        .stage(Optimize::new(Arc::new(cache)))
        .policy(ErrorPolicy::Continue)
        .dest(out.join("img"));
    registry.register("images", Vec::<String>::new(), move |ctx| {
        tolerate(ctx, images.run(ctx.env))
    });

    let media = Pipeline::new("media")
        .root(&config.src)
        .src(under(&assets, "video/**/*"))
        .dest(out.join("video"));
    registry.register("media", Vec::<String>::new(), move |ctx| {
        tolerate(ctx, media.run(ctx.env))
    });

    let fonts = ["eot", "woff", "ttf", "otf"]
        .into_iter()
        .fold(Pipeline::new("font").root(&config.src), |p, ext| {
            p.src(under(&assets, &format!("fonts/*.{ext}")))
        })
        .dest(out.join("fonts"));
    registry.register("font", Vec::<String>::new(), move |ctx| {
        tolerate(ctx, fonts.run(ctx.env))
    });

    watch_task(registry, config);
}

#[cfg(feature = "live")]
fn watch_task(registry: &mut Registry, config: &Arc<Config>) {
    use crate::serve::{Reload, Watch, WatchRule};

    let assets = config.assets();

    let watch = Watch::new()
        .serve(&config.dist, config.server.port)
        .rule(
            WatchRule::new([under(&assets, "js/**/*.js")], Sequence::new().then("scripts"))
                .reload(Reload::Page),
        )
        .rule(
            WatchRule::new([under(&assets, "scss/**/*")], Sequence::new().then("sass"))
                .reload(Reload::Styles),
        )
        .rule(
            WatchRule::new([under(&assets, "img/**/*")], Sequence::new().then("images"))
                .reload(Reload::Page),
        )
        .rule(
            WatchRule::new([under(&assets, "video/**/*")], Sequence::new().then("media"))
                .reload(Reload::Page),
        )
        .rule(
            WatchRule::new(
                [under(&config.src, "**/*.html")],
                Sequence::new().then("reset-pages").then("compile-html"),
            )
            .reload(Reload::Page),
        );

    registry
        .task("watch")
        .after(["sass"])
        .long_running()
        .run(move |ctx| Ok(watch.run(ctx)?));
}

#[cfg(not(feature = "live"))]
fn watch_task(registry: &mut Registry, _: &Arc<Config>) {
    registry
        .task("watch")
        .after(["sass"])
        .long_running()
        .run(|_| anyhow::bail!("built without the `live` feature"));
}

fn styleguide_tasks(registry: &mut Registry, config: &Arc<Config>) {
    let output = config.styleguide.output.clone();
    let styles = under(&config.src, "**/scss");

    let images = Pipeline::new("sg-images")
        .src(under(&config.static_dir, "img/*"))
        .dest(output.join("static/img"));
    registry.register("sg-images", Vec::<String>::new(), move |ctx| {
        tolerate(ctx, images.run(ctx.env))
    });

    let scripts = Pipeline::new("sg-js")
        .src(under(&config.static_dir, "js/*"))
        .dest(output.join("static/js"));
    registry.register("sg-js", Vec::<String>::new(), move |ctx| {
        tolerate(ctx, scripts.run(ctx.env))
    });

    let guide = Styleguide::new(config.styleguide.clone()).src(format!("{styles}/**/*.scss"));
    let target = output.clone();
    registry.register("styleguide:generate", Vec::<String>::new(), move |ctx| {
        tolerate(ctx, guide.generate(&target))
    });

    let applied = Pipeline::new("styleguide:apply-styles")
        .root(&config.src)
        .src(format!("{styles}/app.scss"))
        .src(format!("{styles}/styleguide.scss"))
        .stage(Sass::new(config.styles.output_style))
        .stage(Prefix::new(&config.styles.targets, config.styles.minify))
        .concat(Some("styleguide.css"))
        .sourcemaps(config.sourcemaps)
        .dest(&output);
    registry.register("styleguide:apply-styles", Vec::<String>::new(), move |ctx| {
        tolerate(ctx, applied.run(ctx.env))
    });

    registry.register(
        "styleguide",
        [
            "styleguide:generate",
            "styleguide:apply-styles",
            "sg-images",
            "sg-js",
        ],
        |_| Ok(()),
    );

    styleguide_watch_task(registry, config, format!("{styles}/**/*.scss"));
}

#[cfg(feature = "live")]
fn styleguide_watch_task(registry: &mut Registry, config: &Arc<Config>, styles: String) {
    use crate::serve::{Reload, Watch, WatchRule};

    let watch = Watch::new()
        .serve(&config.styleguide.output, config.server.port)
        .rule(WatchRule::new([styles], Sequence::new().then("styleguide")).reload(Reload::Page));

    registry
        .task("styleguide:watch")
        .after(["styleguide"])
        .long_running()
        .run(move |ctx| Ok(watch.run(ctx)?));
}

#[cfg(not(feature = "live"))]
fn styleguide_watch_task(registry: &mut Registry, _: &Arc<Config>, _: String) {
    registry
        .task("styleguide:watch")
        .after(["styleguide"])
        .long_running()
        .run(|_| anyhow::bail!("built without the `live` feature"));
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::{Duration, Instant};

    use camino::Utf8PathBuf;

    use super::*;
    use crate::core::{Environment, Mode};
    use crate::engine::TaskGraph;

    struct Project {
        _tmp: tempfile::TempDir,
        root: Utf8PathBuf,
    }

    impl Project {
        fn new(files: &[(&str, &str)]) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
            let project = Self { _tmp: tmp, root };
            for (path, text) in files {
                project.write(path, text);
            }
            project
        }

        fn write(&self, path: &str, data: impl AsRef<[u8]>) {
            crate::io::write_file(&self.root.join(path), data).unwrap();
        }

        fn read(&self, path: &str) -> String {
            fs::read_to_string(self.root.join(path)).unwrap()
        }

        fn exists(&self, path: &str) -> bool {
            self.root.join(path).exists()
        }

        fn config(&self) -> Config {
            let mut config = Config::default().anchored(&self.root);
            config.scripts.minifier = MinifierKind::None;
            config.sourcemaps = false;
            config
        }

        fn graph(&self, config: Config) -> TaskGraph {
            registry(Arc::new(config)).validate().unwrap()
        }
    }

    const SITE: &[(&str, &str)] = &[
        ("src/assets/scss/_vars.scss", "$accent: #c00;"),
        (
            "src/assets/scss/app.scss",
            "@import 'vars';\n.btn { color: $accent; user-select: none; }\n",
        ),
        ("src/assets/js/app.js", "console.log('hi');\n"),
        ("src/assets/fonts/body.woff", "font"),
        ("src/assets/fonts/notes.txt", "not a font"),
        ("src/assets/img/logo.svg", "<svg xmlns=\"http://www.w3.org/2000/svg\"/>"),
        (
            "src/layouts/default.html",
            "<html><body>{% include \"header\" %}{{ body }}</body></html>",
        ),
        ("src/partials/header.html", "<header>Shippy</header>"),
        ("src/pages/index.html", "---\ntitle: Home\n---\n<h1>{{ title }}</h1>"),
        ("src/pages/docs/intro.html", "<a href=\"{{ root }}index.html\">home</a>"),
    ];

    #[test]
    fn every_task_and_sequence_is_registered() {
        let project = Project::new(&[]);
        let graph = project.graph(project.config());

        let tasks: Vec<&str> = graph.tasks().collect();
        for name in [
            "clean:dist",
            "sass",
            "compile-html",
            "reset-pages",
            "scripts",
            "images",
            "media",
            "font",
            "watch",
            "sg-images",
            "sg-js",
            "styleguide:generate",
            "styleguide:apply-styles",
            "styleguide",
            "styleguide:watch",
        ] {
            assert!(tasks.contains(&name), "missing task {name}");
        }

        assert_eq!(graph.mode_for("default").unwrap(), Mode::Watch);
        assert_eq!(graph.mode_for("build").unwrap(), Mode::Build);
        assert_eq!(graph.mode_for("styleguide:watch").unwrap(), Mode::Watch);
        assert_eq!(graph.prerequisites("watch").unwrap(), ["sass"]);
    }

    #[test]
    fn build_produces_the_site() {
        let project = Project::new(SITE);
        let graph = project.graph(project.config());

        graph.run_entry("build", &Environment::build()).unwrap();

        let css = project.read("dist/assets/css/app.css");
        assert!(css.contains("color:"));
        assert!(css.contains("-webkit-user-select"));
        assert!(!project.exists("dist/assets/css/_vars.css"));

        assert_eq!(project.read("dist/assets/js/app.js"), "console.log('hi');\n");
        assert!(project.exists("dist/assets/fonts/body.woff"));
        assert!(!project.exists("dist/assets/fonts/notes.txt"));
        assert!(project.exists("dist/assets/img/logo.svg"));

        let index = project.read("dist/index.html");
        assert!(index.starts_with("<html><body><header>Shippy</header>"));
        assert!(index.ends_with("<h1>Home</h1></body></html>"));
        assert!(project.read("dist/docs/intro.html").contains(r#"href="../index.html""#));
    }

    #[test]
    fn build_removes_leftovers() {
        let project = Project::new(SITE);
        project.write("dist/old/stale.html", "stale");

        let graph = project.graph(project.config());
        graph.run_entry("build", &Environment::build()).unwrap();

        assert!(!project.exists("dist/old"));
        assert!(project.exists("dist/index.html"));
    }

    #[test]
    fn malformed_styles_fail_without_output() {
        let project = Project::new(SITE);
        project.write("src/assets/scss/broken.scss", ".a { color: red");

        let graph = project.graph(project.config());
        let err = graph.run_entry("build", &Environment::build()).unwrap_err();

        assert!(err.to_string().contains("sass"));
        assert!(!project.exists("dist/assets/css"));
        // the build stops before the group step
        assert!(!project.exists("dist/index.html"));
    }

    #[test]
    fn sourcemaps_follow_the_config() {
        let project = Project::new(SITE);
        let mut config = project.config();
        config.sourcemaps = true;

        project.graph(config).run("sass", &Environment::build()).unwrap();

        assert!(project.exists("dist/assets/css/app.css.map"));
        assert!(
            project
                .read("dist/assets/css/app.css")
                .contains("sourceMappingURL=app.css.map")
        );
    }

    #[test]
    fn images_are_stable_across_runs() {
        let project = Project::new(SITE);
        let graph = project.graph(project.config());

        graph.run("images", &Environment::build()).unwrap();
        let first = fs::read(project.root.join("dist/assets/img/logo.svg")).unwrap();
        assert!(project.exists(".cache/img"));

        graph.run("images", &Environment::build()).unwrap();
        let second = fs::read(project.root.join("dist/assets/img/logo.svg")).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn reset_pages_picks_up_partial_changes() {
        let project = Project::new(SITE);
        let graph = project.graph(project.config());
        let env = Environment::build();

        graph.run("compile-html", &env).unwrap();
        project.write("src/partials/header.html", "<header>Changed</header>");

        graph.run("compile-html", &env).unwrap();
        assert!(project.read("dist/index.html").contains("Shippy"));

        graph
            .run_sequence(&Sequence::new().then("reset-pages").then("compile-html"), &env)
            .unwrap();
        assert!(project.read("dist/index.html").contains("Changed"));
    }

    #[test]
    fn styleguide_collects_everything() {
        let project = Project::new(&[
            (
                "src/assets/scss/app.scss",
                "// Buttons\n//\n// Markup: <button class=\"btn\">Go</button>\n//\n// Styleguide 1\n.btn { color: red; }\n",
            ),
            ("src/assets/scss/styleguide.scss", ".sg-main { margin: 0; }\n"),
            ("static/img/logo.svg", "<svg/>"),
            ("static/js/app.js", "1;"),
            ("README.md", "# Styles"),
        ]);
        let graph = project.graph(project.config());

        graph.run("styleguide", &Environment::build()).unwrap();

        assert!(project.read("styleguide/index.html").contains("<h1>Styles</h1>"));
        assert!(project.exists("styleguide/section-1.html"));
        let css = project.read("styleguide/styleguide.css");
        assert!(css.contains(".btn"));
        assert!(css.contains(".sg-main"));
        assert!(project.exists("styleguide/static/img/logo.svg"));
        assert!(project.exists("styleguide/static/js/app.js"));
    }

    /// `default` running on its own thread, with its server up.
    #[cfg(all(feature = "live", feature = "server"))]
    struct Serving {
        handle: std::thread::JoinHandle<Result<(), crate::error::ShippyError>>,
        port: u16,
        reload_port: u16,
    }

    #[cfg(all(feature = "live", feature = "server"))]
    impl Serving {
        fn start(project: &Project) -> Self {
            use std::net::{TcpListener, TcpStream};

            let mut config = project.config();
            config.server.port = TcpListener::bind("127.0.0.1:0")
                .unwrap()
                .local_addr()
                .unwrap()
                .port();
            let port = config.server.port;

            let graph = project.graph(config);
            let env = Environment::watch(0).unwrap();
            let reload_port = env.reload_port.unwrap();
            let handle = std::thread::spawn(move || graph.run_entry("default", &env));

            let s = Instant::now();
            while TcpStream::connect(("127.0.0.1", port)).is_err() {
                assert!(!handle.is_finished(), "default returned early");
                assert!(s.elapsed() < Duration::from_secs(30), "server did not start");
                std::thread::sleep(Duration::from_millis(50));
            }

            Self {
                handle,
                port,
                reload_port,
            }
        }

        fn get(&self, path: &str) -> String {
            use std::io::{Read, Write};
            use std::net::TcpStream;

            let mut stream = TcpStream::connect(("127.0.0.1", self.port)).unwrap();
            write!(
                stream,
                "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
            )
            .unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).unwrap();
            response
        }
    }

    #[cfg(all(feature = "live", feature = "server"))]
    #[test]
    fn default_keeps_serving() {
        let project = Project::new(SITE);
        let serving = Serving::start(&project);

        let response = serving.get("/index.html");
        assert!(response.contains("<h1>Home</h1>"));
        assert!(response.contains("new WebSocket"));
        assert!(project.exists("dist/assets/css/app.css"));

        std::thread::sleep(Duration::from_millis(200));
        assert!(!serving.handle.is_finished());
    }

    #[cfg(all(feature = "live", feature = "server"))]
    #[test]
    fn default_serves_despite_broken_styles() {
        let project = Project::new(SITE);
        project.write("src/assets/scss/app.scss", ".a { color: red");
        let serving = Serving::start(&project);

        assert!(serving.get("/index.html").contains("<h1>Home</h1>"));
        assert!(!project.exists("dist/assets/css/app.css"));

        std::thread::sleep(Duration::from_millis(500));
        assert!(!serving.handle.is_finished());
    }

    #[cfg(all(feature = "live", feature = "server"))]
    #[test]
    fn edits_rerun_tasks_and_reload_browsers() {
        use tungstenite::Message;
        use tungstenite::stream::MaybeTlsStream;

        let project = Project::new(SITE);
        let serving = Serving::start(&project);

        let url = format!("ws://127.0.0.1:{}", serving.reload_port);
        let (mut client, _) = tungstenite::connect(url).unwrap();

        // next text message, or `None` once `wait` passes in silence
        let mut next = |wait: Duration| -> Option<String> {
            if let MaybeTlsStream::Plain(stream) = client.get_ref() {
                stream.set_read_timeout(Some(wait)).unwrap();
            }
            loop {
                match client.read() {
                    Ok(Message::Text(text)) => return Some(text.as_str().to_owned()),
                    Ok(_) => continue,
                    Err(tungstenite::Error::Io(e))
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        ) =>
                    {
                        return None;
                    }
                    Err(e) => panic!("live reload connection failed: {e}"),
                }
            }
        };

        project.write("src/assets/scss/app.scss", ".a { color: #123456; }\n");
        assert_eq!(next(Duration::from_secs(15)).as_deref(), Some("css"));
        assert!(project.read("dist/assets/css/app.css").contains("#123456"));
        // one save can arrive as more than one batch
        while let Some(message) = next(Duration::from_millis(750)) {
            assert_eq!(message, "css");
        }

        project.write("src/assets/scss/app.scss", ".a { color: red");
        assert_eq!(next(Duration::from_millis(1500)), None);
        assert!(project.read("dist/assets/css/app.css").contains("#123456"));

        project.write("src/pages/index.html", "<h1>Edited</h1>");
        assert_eq!(next(Duration::from_secs(15)).as_deref(), Some("reload"));
        assert!(project.read("dist/index.html").contains("<h1>Edited</h1>"));

        assert!(!serving.handle.is_finished());
    }
}
