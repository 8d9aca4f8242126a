//! Named, appendable text buffers.

use std::fmt;

/// Escape text for use in HTML bodies and quoted attributes.
///
/// Escapes `&`, `<`, `>`, `"` and `'`.
pub fn escape(text: &str) -> String {
    html_escape::encode_quoted_attribute(text).into_owned()
}

/// A block section of a template.
///
/// Blocks are created when a capture region opens or when a value is assigned
/// to a name directly. Content only ever grows through [`Block::append`] and
/// [`Block::prepend`]; neither can fail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    name: Option<String>,
    content: String,
    escaped: bool,
}

impl Block {
    /// Create an empty block, optionally named.
    pub fn new(name: Option<String>) -> Self {
        Self {
            name,
            content: String::new(),
            escaped: false,
        }
    }

    /// Create a named block holding `content`.
    pub fn with_content(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            content: content.into(),
            escaped: false,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
    }

    pub fn append(&mut self, text: &str) {
        self.content.push_str(text);
    }

    pub fn prepend(&mut self, text: &str) {
        self.content.insert_str(0, text);
    }

    pub fn is_escaped(&self) -> bool {
        self.escaped
    }

    pub fn set_escaped(&mut self, escaped: bool) {
        self.escaped = escaped;
    }

    /// Return the escaped content, or the content unchanged if it is already
    /// marked as escaped. Does not modify the block.
    pub fn escape(&self) -> String {
        if self.escaped {
            self.content.clone()
        } else {
            escape(&self.content)
        }
    }

    /// Shorthand for [`Block::escape`].
    pub fn e(&self) -> String {
        self.escape()
    }

    /// Apply `f` to the content and return its result.
    pub fn call<T>(&self, f: impl FnOnce(&str) -> T) -> T {
        f(&self.content)
    }

    /// Cut the content back to `len` bytes.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.content.truncate(len);
    }

    pub(crate) fn len(&self) -> usize {
        self.content.len()
    }

    pub(crate) fn into_content(self) -> String {
        self.content
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_prepend() {
        let mut block = Block::new(Some("title".to_string()));
        block.append("world");
        block.prepend("hello ");
        block.append("!");

        assert_eq!(block.content(), "hello world!");
        assert_eq!(block.name(), Some("title"));
        assert_eq!(block.to_string(), "hello world!");
    }

    #[test]
    fn test_escape_does_not_mutate() {
        let block = Block::with_content("x", "<b>\"a\" & b</b>");

        assert_eq!(block.escape(), "&lt;b&gt;&quot;a&quot; &amp; b&lt;/b&gt;");
        assert_eq!(block.content(), "<b>\"a\" & b</b>");
        assert!(!block.is_escaped());
    }

    #[test]
    fn test_escape_is_idempotent_once_marked() {
        let mut block = Block::with_content("x", "<p>");
        let once = block.escape();
        block.set_content(once.clone());
        block.set_escaped(true);

        assert_eq!(block.escape(), once);
        assert_eq!(block.e(), "&lt;p&gt;");
    }

    #[test]
    fn test_call_applies_function() {
        let block = Block::with_content("x", "shout");
        assert_eq!(block.call(|s| s.to_uppercase()), "SHOUT");
        assert_eq!(block.call(str::len), 5);
    }

    #[test]
    fn test_escape_helper() {
        assert_eq!(escape("a < b && c > d"), "a &lt; b &amp;&amp; c &gt; d");
        assert_eq!(escape("plain"), "plain");
    }
}
