//! Upload sources and content-type detection.
//!
//! Anything that can be read and rewound can be saved.  Sources may carry
//! an explicit content type, and may wrap another source that carries one
//! (an uploaded file wrapped by a framework file object, for instance).
//! [`resolve_content_type`] walks a fixed list of strategies and takes the
//! first answer.

use std::io::{Cursor, Read, Seek};

/// A rewindable byte source passed to `save`.
pub trait ContentSource: Read + Seek + Send {
    /// Content type declared by this source itself.
    fn content_type(&self) -> Option<&str> {
        None
    }

    /// The source this one wraps, if any.
    fn inner(&self) -> Option<&dyn ContentSource> {
        None
    }
}

impl<T: AsRef<[u8]> + Send> ContentSource for Cursor<T> {}

impl ContentSource for std::fs::File {}

impl ContentSource for tempfile::SpooledTempFile {}

/// A source with an attached content type.
///
/// Nesting a `ContentFile` inside another models a wrapped file; the outer
/// type takes precedence over the inner one.
#[derive(Debug)]
pub struct ContentFile<R> {
    inner: R,
    content_type: Option<String>,
}

impl<R> ContentFile<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for ContentFile<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Seek> Seek for ContentFile<R> {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl<R: ContentSource> ContentSource for ContentFile<R> {
    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn inner(&self) -> Option<&dyn ContentSource> {
        Some(&self.inner)
    }
}

/// One way of finding a content type; `None` passes to the next strategy.
type ContentTypeStrategy = fn(&dyn ContentSource, &str) -> Option<String>;

fn declared_type(source: &dyn ContentSource, _name: &str) -> Option<String> {
    source.content_type().map(str::to_string)
}

fn wrapped_type(source: &dyn ContentSource, _name: &str) -> Option<String> {
    source
        .inner()
        .and_then(|inner| inner.content_type())
        .map(str::to_string)
}

fn guessed_type(_source: &dyn ContentSource, name: &str) -> Option<String> {
    guess_type(name).0
}

/// Tried in order; the first `Some` wins.
const CONTENT_TYPE_STRATEGIES: &[ContentTypeStrategy] =
    &[declared_type, wrapped_type, guessed_type];

/// Content type for storing `source` under `name`, falling back to `default`.
pub fn resolve_content_type(source: &dyn ContentSource, name: &str, default: &str) -> String {
    CONTENT_TYPE_STRATEGIES
        .iter()
        .find_map(|strategy| strategy(source, name))
        .unwrap_or_else(|| default.to_string())
}

/// Extensions standing for a compressed variant of another extension.
const SUFFIX_ALIASES: &[(&str, &str)] = &[
    (".svgz", ".svg.gz"),
    (".tgz", ".tar.gz"),
    (".taz", ".tar.gz"),
    (".tz", ".tar.gz"),
    (".tbz2", ".tar.bz2"),
    (".txz", ".tar.xz"),
];

/// Extensions that denote a content encoding rather than a type.
const ENCODINGS: &[(&str, &str)] = &[
    (".gz", "gzip"),
    (".Z", "compress"),
    (".bz2", "bzip2"),
    (".xz", "xz"),
    (".br", "br"),
];

/// Split off the last extension of the final path segment.
fn split_ext(name: &str) -> (&str, &str) {
    let file_start = name.rfind('/').map_or(0, |i| i + 1);
    match name[file_start..].rfind('.') {
        Some(dot) if dot > 0 => (&name[..file_start + dot], &name[file_start + dot..]),
        _ => (name, ""),
    }
}

/// Guess `(content type, content encoding)` from a file name.
///
/// `archive.tar.gz` is `application/x-tar` encoded with `gzip`.
pub fn guess_type(name: &str) -> (Option<String>, Option<String>) {
    let (base, ext) = split_ext(name);
    let (mut base, mut ext) = (base.to_string(), ext.to_string());

    if let Some((_, alias)) = SUFFIX_ALIASES
        .iter()
        .find(|(suffix, _)| ext.eq_ignore_ascii_case(suffix))
    {
        let expanded = format!("{base}{alias}");
        let (b, e) = split_ext(&expanded);
        let (b, e) = (b.to_string(), e.to_string());
        base = b;
        ext = e;
    }

    // `.Z` is the only case-sensitive encoding suffix.
    let encoding = ENCODINGS
        .iter()
        .find(|(suffix, _)| match *suffix {
            ".Z" => ext == ".Z",
            other => ext.eq_ignore_ascii_case(other),
        })
        .map(|(_, enc)| enc.to_string());
    if encoding.is_some() {
        ext = split_ext(&base).1.to_string();
    }

    if ext.is_empty() {
        return (None, encoding);
    }
    let content_type = mime_guess::from_ext(&ext[1..])
        .first()
        .map(|mime| mime.essence_str().to_string());
    (content_type, encoding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_plain_types() {
        assert_eq!(guess_type("a/b/photo.jpg").0.as_deref(), Some("image/jpeg"));
        assert_eq!(guess_type("notes.txt").0.as_deref(), Some("text/plain"));
        assert_eq!(guess_type("notes.TXT").0.as_deref(), Some("text/plain"));
        assert_eq!(guess_type("noext"), (None, None));
        assert_eq!(guess_type("dir.v2/noext"), (None, None));
    }

    #[test]
    fn test_guess_encodings() {
        let (ty, enc) = guess_type("backup.tar.gz");
        assert_eq!(ty.as_deref(), Some("application/x-tar"));
        assert_eq!(enc.as_deref(), Some("gzip"));

        let (ty, enc) = guess_type("logs.txt.bz2");
        assert_eq!(ty.as_deref(), Some("text/plain"));
        assert_eq!(enc.as_deref(), Some("bzip2"));

        let (_, enc) = guess_type("old.Z");
        assert_eq!(enc.as_deref(), Some("compress"));
    }

    #[test]
    fn test_guess_suffix_aliases() {
        let (ty, enc) = guess_type("release.tgz");
        assert_eq!(ty.as_deref(), Some("application/x-tar"));
        assert_eq!(enc.as_deref(), Some("gzip"));

        let (ty, enc) = guess_type("icon.svgz");
        assert_eq!(ty.as_deref(), Some("image/svg+xml"));
        assert_eq!(enc.as_deref(), Some("gzip"));
    }

    #[test]
    fn test_strategy_priority() {
        let plain = Cursor::new(b"data".to_vec());
        assert_eq!(
            resolve_content_type(&plain, "x.png", "application/octet-stream"),
            "image/png"
        );
        assert_eq!(
            resolve_content_type(&plain, "x.unknownext", "application/octet-stream"),
            "application/octet-stream"
        );

        let inner = ContentFile::new(Cursor::new(b"data".to_vec())).with_content_type("text/csv");
        let wrapped = ContentFile::new(inner);
        assert_eq!(
            resolve_content_type(&wrapped, "x.png", "application/octet-stream"),
            "text/csv"
        );

        let explicit = ContentFile::new(
            ContentFile::new(Cursor::new(b"data".to_vec())).with_content_type("text/csv"),
        )
        .with_content_type("application/json");
        assert_eq!(
            resolve_content_type(&explicit, "x.png", "application/octet-stream"),
            "application/json"
        );
    }

    #[test]
    fn test_content_file_reads_through() {
        let mut file = ContentFile::new(Cursor::new(b"hello".to_vec()));
        let mut out = String::new();
        file.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
        file.seek(std::io::SeekFrom::Start(1)).unwrap();
        out.clear();
        file.read_to_string(&mut out).unwrap();
        assert_eq!(out, "ello");
    }
}
