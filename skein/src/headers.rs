//! Ordered, case-insensitive header map.
//!
//! Names are normalized to lowercase on insert (HTTP/2 requires it, and
//! HTTP/1.1 field names are case-insensitive anyway). Insertion order is
//! preserved; `set` overrides while `append` accumulates, which matters for
//! `set-cookie`.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(move |(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set `name` to `value`, replacing any existing values.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let name = name.to_ascii_lowercase();
        self.entries.retain(|(k, _)| *k != name);
        self.entries.push((name, value.into()));
    }

    /// Add a value without touching existing ones.
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push((name.to_ascii_lowercase(), value.into()));
    }

    /// Set `name` only if absent.
    pub fn set_default(&mut self, name: &str, value: impl Into<String>) {
        if !self.contains(name) {
            self.append(name, value);
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        let before = self.entries.len();
        self.entries.retain(|(k, _)| *k != name);
        before != self.entries.len()
    }

    /// Overlay `other`: its values override same-named entries here.
    pub fn merge(&mut self, other: &HeaderMap) {
        for (name, value) in &other.entries {
            self.set(name, value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<const N: usize> From<[(&str, &str); N]> for HeaderMap {
    fn from(pairs: [(&str, &str); N]) -> Self {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(name, value);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut map = HeaderMap::new();
        map.set("Content-Type", "text/plain");
        assert_eq!(map.get("content-type"), Some("text/plain"));
        assert_eq!(map.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn set_overrides_append_accumulates() {
        let mut map = HeaderMap::new();
        map.append("set-cookie", "a=1");
        map.append("set-cookie", "b=2");
        assert_eq!(map.get_all("set-cookie").count(), 2);

        map.set("accept", "*/*");
        map.set("accept", "text/html");
        assert_eq!(map.get_all("accept").count(), 1);
        assert_eq!(map.get("accept"), Some("text/html"));
    }

    #[test]
    fn order_is_preserved() {
        let map = HeaderMap::from([("b", "2"), ("a", "1"), ("c", "3")]);
        let names: Vec<&str> = map.iter().map(|(k, _)| k).collect();
        assert_eq!(names, ["b", "a", "c"]);
    }

    #[test]
    fn merge_overrides() {
        let mut base = HeaderMap::from([("user-agent", "default"), ("accept", "*/*")]);
        let extra = HeaderMap::from([("user-agent", "custom")]);
        base.merge(&extra);
        assert_eq!(base.get("user-agent"), Some("custom"));
        assert_eq!(base.get("accept"), Some("*/*"));
    }

    #[test]
    fn set_default_respects_existing() {
        let mut map = HeaderMap::new();
        map.set("host", "example.com");
        map.set_default("host", "other");
        map.set_default("accept", "*/*");
        assert_eq!(map.get("host"), Some("example.com"));
        assert_eq!(map.get("accept"), Some("*/*"));
    }
}
