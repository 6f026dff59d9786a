use camino::{Utf8Path, Utf8PathBuf};

/// Literal text of one glob component, or `None` if it has a wildcard.
/// The escapes written by `glob::Pattern::escape` (`[*]`, `[?]`, `[[]` and
/// `[]]`) stand for the escaped character.
fn literal(component: &str) -> Option<String> {
    let mut text = String::with_capacity(component.len());
    let mut rest = component;

    while let Some(c) = rest.chars().next() {
        match c {
            '*' | '?' => return None,
            '[' => match rest.as_bytes() {
                [b'[', escaped @ (b'*' | b'?' | b'[' | b']'), b']', ..] => {
                    text.push(char::from(*escaped));
                    rest = &rest[3..];
                }
                _ => return None,
            },
            _ => {
                text.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
    }

    Some(text)
}

/// Split a glob into its static prefix and the wildcard suffix. The prefix
/// is returned as a plain path, with escapes resolved.
///
/// `src/assets/**/*.scss` -> (`src/assets`, `**/*.scss`)
pub fn split_glob(glob: &str) -> (Utf8PathBuf, Utf8PathBuf) {
    let components: Vec<_> = Utf8Path::new(glob).components().collect();

    let mut root = Utf8PathBuf::new();
    let mut split = components.len();
    for (i, component) in components.iter().enumerate() {
        match literal(component.as_str()) {
            Some(text) => root.push(text),
            None => {
                split = i;
                break;
            }
        }
    }

    let suffix: Utf8PathBuf = components.iter().skip(split).collect();

    (root, suffix)
}

/// Directory that matched paths are made relative to. For a glob without
/// wildcards (a concrete file) this is the file's parent.
pub fn glob_base(glob: &str) -> Utf8PathBuf {
    let (root, suffix) = split_glob(glob);

    if suffix.as_str().is_empty() {
        root.parent().map(Utf8Path::to_path_buf).unwrap_or_default()
    } else {
        root
    }
}
