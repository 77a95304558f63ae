//! Pluggable transport per-connection arguments
//!
//! Arguments travel inside the SOCKS5 username/password fields as a
//! semicolon separated list of `key=value` pairs. Backslash escapes a
//! literal backslash, equals sign or semicolon.
//!
//! ```text
//! url=https://broker.example/;ice=stun:a:3478,stun:b:3478;max=1
//! ```

use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;

/// PtArgs is a multi-valued key/value bag, the way SOCKS clients hand
/// arguments to a transport
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PtArgs {
    inner: BTreeMap<String, Vec<String>>,
}

impl PtArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// get returns the first value stored for key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.inner
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// add appends a value for key
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.entry(key.into()).or_default().push(value.into());
    }

    /// set replaces all values for key with a single value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.insert(key.into(), vec![value.into()]);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// iter yields every key/value pair, keys in sorted order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    /// merge_defaults fills in statically configured values. A default is
    /// only used when the connection did not supply the key, or supplied it
    /// empty, and the default itself is not empty.
    pub fn merge_defaults(&mut self, defaults: &PtArgs) {
        for (key, values) in &defaults.inner {
            let missing = self.get(key).is_none_or(str::is_empty);
            if !missing {
                continue;
            }

            if let Some(value) = values.first().filter(|v| !v.is_empty()) {
                self.set(key.clone(), value.clone());
            }
        }
    }

    /// parse decodes an encoded argument string
    pub fn parse(s: &str) -> Result<Self> {
        let mut args = PtArgs::new();
        if s.is_empty() {
            return Ok(args);
        }

        let mut rest = s;
        loop {
            // Key runs until an unescaped '=' (or ';', which is an error)
            let (key, stop, after) = read_unescaped(rest, &['=', ';'])?;
            if stop != Some('=') {
                return Err(Error::socks(format!("no equals sign in {key:?}")));
            }
            if key.is_empty() {
                return Err(Error::socks(format!("empty key in {rest:?}")));
            }

            let (value, stop, after) = read_unescaped(after, &[';'])?;
            args.add(key, value);

            // A separator at the very end closes the last pair
            match stop {
                Some(_) if !after.is_empty() => rest = after,
                _ => break,
            }
        }

        Ok(args)
    }

    /// encode is the inverse of parse
    pub fn encode(&self) -> String {
        self.iter()
            .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
            .collect::<Vec<_>>()
            .join(";")
    }
}

impl fmt::Display for PtArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PtArgs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut args = PtArgs::new();
        for (k, v) in iter {
            args.add(k, v);
        }
        args
    }
}

/// read_unescaped reads until one of the stop characters, undoing backslash
/// escapes. Returns the text, the stop character hit (None at end of input)
/// and the remainder after the stop character.
fn read_unescaped<'a>(s: &'a str, stops: &[char]) -> Result<(String, Option<char>, &'a str)> {
    let mut out = String::new();
    let mut chars = s.char_indices();

    while let Some((i, c)) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some((_, escaped)) => out.push(escaped),
                None => return Err(Error::socks(format!("terminal backslash in {s:?}"))),
            }
        } else if stops.contains(&c) {
            return Ok((out, Some(c), &s[i + c.len_utf8()..]));
        } else {
            out.push(c);
        }
    }

    Ok((out, None, ""))
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '=' | ';') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
