use std::slice::{Iter, IterMut};

use smol_str::SmolStr;

/// Represents a single SIP header field as a name/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: SmolStr,
    pub value: SmolStr,
}

/// Collection of SIP headers preserving insertion order.
///
/// Headers are plain values: cloning a request's headers into a response
/// never shares storage with the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    /// Creates an empty header collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a header collection from the given vector without additional cloning.
    pub fn from_vec(headers: Vec<Header>) -> Self {
        Self(headers)
    }

    /// Appends a header to the collection.
    pub fn push(&mut self, name: impl Into<SmolStr>, value: impl Into<SmolStr>) {
        self.0.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Replaces the first header with this name, or appends one if absent.
    /// Any further headers with the same name are removed.
    pub fn set(&mut self, name: impl Into<SmolStr>, value: impl Into<SmolStr>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter().position(|h| h.name.eq_ignore_ascii_case(&name)) {
            Some(idx) => {
                self.0[idx].value = value;
                let mut seen = 0usize;
                self.0.retain(|h| {
                    if h.name.eq_ignore_ascii_case(&name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.0.push(Header { name, value }),
        }
    }

    /// Inserts a header before all others (used for new top Via values).
    pub fn push_front(&mut self, name: impl Into<SmolStr>, value: impl Into<SmolStr>) {
        self.0.insert(
            0,
            Header {
                name: name.into(),
                value: value.into(),
            },
        );
    }

    /// Removes every header with the given name, returning how many were dropped.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|h| !h.name.eq_ignore_ascii_case(name));
        before - self.0.len()
    }

    /// Returns an iterator over the stored headers.
    pub fn iter(&self) -> Iter<'_, Header> {
        self.0.iter()
    }

    /// Returns a mutable iterator over the stored headers.
    pub fn iter_mut(&mut self) -> IterMut<'_, Header> {
        self.0.iter_mut()
    }

    /// Returns the number of headers present.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` when the collection does not contain any headers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Finds the first header whose name matches ignoring ASCII case.
    pub fn get(&self, name: &str) -> Option<&SmolStr> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| &h.value)
    }

    /// Mutable access to the first header value with this name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut SmolStr> {
        self.0
            .iter_mut()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| &mut h.value)
    }

    /// Returns all headers with the given name, preserving original order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a SmolStr> + 'a {
        self.0
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| &h.value)
    }

    /// Consumes the collection returning the underlying vector.
    pub fn into_inner(self) -> Vec<Header> {
        self.0
    }
}

impl IntoIterator for Headers {
    type Item = Header;
    type IntoIter = std::vec::IntoIter<Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case_and_keeps_order() {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP a");
        headers.push("via", "SIP/2.0/UDP b");
        headers.push("Call-ID", "x");
        assert_eq!(headers.get("VIA").map(|v| v.as_str()), Some("SIP/2.0/UDP a"));
        let all: Vec<_> = headers.get_all("Via").map(|v| v.as_str()).collect();
        assert_eq!(all, vec!["SIP/2.0/UDP a", "SIP/2.0/UDP b"]);
    }

    #[test]
    fn set_collapses_duplicates() {
        let mut headers = Headers::new();
        headers.push("Contact", "<sip:a@1>");
        headers.push("Max-Forwards", "70");
        headers.push("Contact", "<sip:a@2>");
        headers.set("contact", "<sip:a@3>");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.iter().next().unwrap().value.as_str(), "<sip:a@3>");
    }

    #[test]
    fn clone_does_not_alias() {
        let mut original = Headers::new();
        original.push("To", "<sip:bob@example.com>");
        let mut copy = original.clone();
        copy.set("To", "<sip:bob@example.com>;tag=1");
        assert_eq!(original.get("To").unwrap().as_str(), "<sip:bob@example.com>");
    }

    #[test]
    fn push_front_and_remove() {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP b");
        headers.push_front("Via", "SIP/2.0/UDP a");
        assert_eq!(headers.get("Via").unwrap().as_str(), "SIP/2.0/UDP a");
        assert_eq!(headers.remove("via"), 2);
        assert!(headers.is_empty());
    }
}
