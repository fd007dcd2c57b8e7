use crate::TextCodec;

/// Header names whose values may legitimately contain commas; they are
/// never split into multiple values and never joined with `", "`.
fn is_nosplit(name: &str) -> bool {
    name.eq_ignore_ascii_case("WWW-Authenticate")
        || name.eq_ignore_ascii_case("Proxy-Authorization")
        || name.eq_ignore_ascii_case("Content-Type")
        || name.eq_ignore_ascii_case("Date")
}

/// One value of a header, with its ordered `;`-delimited modifiers.
/// A modifier with an empty value is a bare flag (`text/html; level=1`
/// has modifier `("level", "1")`; `attachment; inline` would carry
/// `("inline", "")`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderValue {
    value: String,
    modifiers: Vec<(String, String)>,
}

impl HeaderValue {
    fn parse(full: &str) -> Option<HeaderValue> {
        let mut parts = full.split(';');
        let value = parts.next()?.trim().to_string();
        if value.is_empty() {
            return None;
        }
        let mut modifiers = Vec::new();
        for part in parts {
            let mut kv = part.splitn(2, '=');
            let key = kv.next().unwrap_or("").trim().to_string();
            if key.is_empty() {
                continue;
            }
            let val = kv.next().unwrap_or("").trim().to_string();
            modifiers.push((key, val));
        }
        Some(HeaderValue { value, modifiers })
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn modifier(&self, key: &str) -> Option<&str> {
        self.modifiers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn modifiers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.modifiers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merge `other`'s modifiers into this value: existing keys are
    /// overwritten in place, new keys append, order is preserved.
    fn merge_modifiers(&mut self, other: HeaderValue) {
        for (key, val) in other.modifiers {
            match self
                .modifiers
                .iter_mut()
                .find(|(k, _)| k.eq_ignore_ascii_case(&key))
            {
                Some(slot) => slot.1 = val,
                None => self.modifiers.push((key, val)),
            }
        }
    }

    fn serialize(&self) -> String {
        let mut out = self.value.clone();
        for (key, val) in &self.modifiers {
            out.push_str("; ");
            out.push_str(key);
            if !val.is_empty() {
                out.push('=');
                out.push_str(val);
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
struct Header {
    name: String,
    values: Vec<HeaderValue>,
}

/// Case-insensitive, insertion-ordered header multimap.
///
/// The first-seen spelling of a name is the one that serializes. Each
/// name maps to an ordered list of values, each with its own modifier
/// map; duplicate values merge their modifiers instead of repeating.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<Header>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers::default()
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|h| h.name.eq_ignore_ascii_case(name))
    }

    /// Append a (possibly multi-valued) header. Returns false when
    /// either part is empty.
    pub fn add(&mut self, name: &str, full_value: &str) -> bool {
        let name = name.trim();
        if name.is_empty() || full_value.trim().is_empty() {
            return false;
        }

        let pieces: Vec<&str> = if is_nosplit(name) {
            vec![full_value.trim()]
        } else {
            full_value.split(',').collect()
        };

        let idx = match self.find(name) {
            Some(idx) => idx,
            None => {
                self.entries.push(Header {
                    name: name.to_string(),
                    values: Vec::new(),
                });
                self.entries.len() - 1
            }
        };

        for piece in pieces {
            let parsed = match HeaderValue::parse(piece) {
                Some(v) => v,
                None => continue,
            };
            let entry = &mut self.entries[idx];
            match entry
                .values
                .iter_mut()
                .find(|v| v.value.eq_ignore_ascii_case(&parsed.value))
            {
                Some(existing) => existing.merge_modifiers(parsed),
                None => entry.values.push(parsed),
            }
        }
        if self.entries[idx].values.is_empty() {
            self.entries.remove(idx);
            return false;
        }
        true
    }

    /// Replace any existing values of `name` with `full_value`.
    pub fn set(&mut self, name: &str, full_value: &str) -> bool {
        self.remove(name);
        self.add(name, full_value)
    }

    pub fn remove(&mut self, name: &str) {
        if let Some(idx) = self.find(name) {
            self.entries.remove(idx);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The serialized value of `name`: values joined with `", "`
    /// (non-splittable names use a space, they should only ever hold
    /// one value anyway).
    pub fn get(&self, name: &str) -> Option<String> {
        let idx = self.find(name)?;
        let entry = &self.entries[idx];
        let sep = if is_nosplit(&entry.name) { " " } else { ", " };
        Some(
            entry
                .values
                .iter()
                .map(HeaderValue::serialize)
                .collect::<Vec<_>>()
                .join(sep),
        )
    }

    /// First parsed value of `name`, with access to modifiers.
    pub fn get_value(&self, name: &str) -> Option<&HeaderValue> {
        self.find(name)
            .and_then(|idx| self.entries[idx].values.first())
    }

    /// Iterate `(name, serialized value)` in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, String)> {
        self.entries.iter().map(move |entry| {
            let sep = if is_nosplit(&entry.name) { " " } else { ", " };
            (
                entry.name.as_str(),
                entry
                    .values
                    .iter()
                    .map(HeaderValue::serialize)
                    .collect::<Vec<_>>()
                    .join(sep),
            )
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|h| h.name.as_str())
    }

    /// Derived `Content-Type` value, without modifiers. When several
    /// values slipped in, only the first counts.
    pub fn content_type(&self) -> Option<String> {
        let value = self.get_value("Content-Type")?;
        // A comma inside the (non-split) value means garbage after the
        // real type; drop it.
        let ct = value.value().split(',').next().unwrap_or("").trim();
        if ct.is_empty() {
            None
        } else {
            Some(ct.to_string())
        }
    }

    /// Derived `charset` modifier of the `Content-Type` header.
    pub fn charset(&self) -> Option<String> {
        let value = self.get_value("Content-Type")?;
        value.modifier("charset").map(|s| s.to_string())
    }

    /// Text codec implied by the charset, `Unknown` when absent or
    /// unrecognized.
    pub fn codec(&self) -> TextCodec {
        match self.charset() {
            Some(cs) => TextCodec::from_label(&cs),
            None => TextCodec::Unknown,
        }
    }
}
