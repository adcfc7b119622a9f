//! Base-URL rewriting for recorded responses.
//!
//! Fixtures embed absolute links. Recording replaces the upstream service
//! base with the local synthetic endpoint; replay replaces whatever loopback
//! port was live during recording with the port the server is bound to now.

use std::borrow::Cow;

use regex::bytes::{Captures, NoExpand, Regex};

use crate::wire::RawResponse;

/// `http://127.0.0.1:<port>` up to a word boundary so a longer port is
/// never split.
const LOOPBACK_PATTERN: &str = r"http://127\.0\.0\.1:[0-9]{1,5}(?-u:\b)";

#[derive(Debug, Clone)]
pub enum Rewrite {
    /// Any loopback base URL becomes `to`.
    Loopback { to: Vec<u8> },
    /// Every literal occurrence of `from` becomes `to`.
    Literal { from: Vec<u8>, to: Vec<u8> },
    /// A path that opens a quoted string and is followed by `/ ? # " '`
    /// becomes `to`. Catches relative links in JSON and HTML.
    RelativePath { path: Vec<u8>, to: Vec<u8> },
}

#[derive(Debug, Clone)]
struct CompiledRewrite {
    regex: Regex,
    to: Vec<u8>,
    relative: bool,
}

impl CompiledRewrite {
    fn compile(rewrite: Rewrite) -> anyhow::Result<Self> {
        let (pattern, to, relative) = match rewrite {
            Rewrite::Loopback { to } => (LOOPBACK_PATTERN.to_owned(), to, false),
            Rewrite::Literal { from, to } => (escape_bytes(&from), to, false),
            Rewrite::RelativePath { path, to } => (
                format!(r#"(["'])({})([/?#"'])"#, escape_bytes(&path)),
                to,
                true,
            ),
        };
        let regex = Regex::new(&pattern)
            .map_err(|err| anyhow::anyhow!("compile rewrite pattern `{pattern}`: {err}"))?;
        Ok(Self {
            regex,
            to,
            relative,
        })
    }

    fn apply<'a>(&self, input: &'a [u8]) -> Cow<'a, [u8]> {
        if self.relative {
            self.regex.replace_all(input, |caps: &Captures<'_>| {
                let mut out = Vec::with_capacity(self.to.len() + 2);
                out.extend_from_slice(&caps[1]);
                out.extend_from_slice(&self.to);
                out.extend_from_slice(&caps[3]);
                out
            })
        } else {
            self.regex.replace_all(input, NoExpand(&self.to))
        }
    }
}

fn escape_bytes(value: &[u8]) -> String {
    regex::escape(&String::from_utf8_lossy(value))
}

/// An ordered set of rewrites applied in a single pass over a byte blob.
#[derive(Debug, Clone, Default)]
pub struct RewritePlan {
    rewrites: Vec<CompiledRewrite>,
}

impl RewritePlan {
    pub fn new(rewrites: impl IntoIterator<Item = Rewrite>) -> anyhow::Result<Self> {
        let rewrites = rewrites
            .into_iter()
            .map(CompiledRewrite::compile)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { rewrites })
    }

    /// Serve-time plan: point recorded loopback links at `base_url`.
    pub fn for_replay(base_url: &str) -> anyhow::Result<Self> {
        Self::new([Rewrite::Loopback {
            to: base_url.as_bytes().to_vec(),
        }])
    }

    /// Record-time plan: point upstream links (absolute, then relative to the
    /// upstream host) at the local synthetic endpoint.
    pub fn for_recording(upstream_endpoint: &str, local_endpoint: &str) -> anyhow::Result<Self> {
        let upstream_endpoint = upstream_endpoint.trim_end_matches('/');
        let mut rewrites = vec![Rewrite::Literal {
            from: upstream_endpoint.as_bytes().to_vec(),
            to: local_endpoint.as_bytes().to_vec(),
        }];
        if let Some(path) = endpoint_path(upstream_endpoint) {
            rewrites.push(Rewrite::RelativePath {
                path: path.as_bytes().to_vec(),
                to: local_endpoint.as_bytes().to_vec(),
            });
        }
        Self::new(rewrites)
    }

    pub fn apply<'a>(&self, input: &'a [u8]) -> Cow<'a, [u8]> {
        let mut output = Cow::Borrowed(input);
        for rewrite in &self.rewrites {
            let changed = match rewrite.apply(&output) {
                Cow::Owned(rewritten) => Some(rewritten),
                Cow::Borrowed(_) => None,
            };
            if let Some(rewritten) = changed {
                output = Cow::Owned(rewritten);
            }
        }
        output
    }

    /// The rewritten bytes, or `None` when nothing matched.
    fn rewritten(&self, input: &[u8]) -> Option<Vec<u8>> {
        match self.apply(input) {
            Cow::Owned(rewritten) => Some(rewritten),
            Cow::Borrowed(_) => None,
        }
    }

    /// Applies the plan to every header value, and to the body when it is
    /// textual. Binary bodies (tiles, images) are left untouched.
    pub fn apply_to_response(&self, response: &mut RawResponse) {
        for value in response.headers.values_mut() {
            if let Some(rewritten) = self.rewritten(value.as_bytes())
                && let Ok(rewritten) = hyper::header::HeaderValue::from_bytes(&rewritten)
            {
                *value = rewritten;
            }
        }
        if response.is_textual()
            && let Some(rewritten) = self.rewritten(&response.body)
        {
            let len = rewritten.len();
            response.body = rewritten.into();
            if response.headers.contains_key(hyper::header::CONTENT_LENGTH) {
                response
                    .headers
                    .insert(hyper::header::CONTENT_LENGTH, len.into());
            }
        }
    }
}

/// Path component of an absolute endpoint URL, if it has a non-root one.
fn endpoint_path(endpoint: &str) -> Option<&str> {
    let after_scheme = endpoint.split_once("://")?.1;
    let path = &after_scheme[after_scheme.find('/')?..];
    (path.len() > 1).then_some(path)
}
