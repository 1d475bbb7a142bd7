//! XML permutator: breadth- and depth-wise tree expansion of an XML
//! seed.
//!
//! The element tree is deliberately small: names, raw attribute text,
//! leading character data and children are all the two spam operations
//! need. Entities, CDATA and mixed content beyond the leading text are
//! out of scope for a generator whose output only has to look like
//! plausible XML to the target.

use std::fs;
use std::io;
use std::path::Path;

use crossbeam_channel::Sender;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{publish, Permutator};
use crate::errors::{FuzzerError, Result};
use crate::test_case::TestCase;

/// Clones appended per breadth spam.
const SPAM_WIDTH: usize = 10;
/// Nesting levels added per depth spam.
const SPAM_DEPTH: usize = 10;
/// Spam permutations published per seed on top of the plain form.
const SPAM_ROUNDS: usize = 8;

/// One element of a parsed document.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct XmlElement {
    name: String,
    /// Raw text between the name and the closing `>`, leading space
    /// included.
    attrs: String,
    /// Character data between the start tag and the first child.
    text: String,
    children: Vec<XmlElement>,
}

impl XmlElement {
    /// Clone with the subtree dropped.
    fn childless_clone(&self) -> XmlElement {
        XmlElement {
            name: self.name.clone(),
            attrs: self.attrs.clone(),
            text: self.text.clone(),
            children: Vec::new(),
        }
    }

    fn serialize_into(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        out.push_str(&self.attrs);
        out.push('>');
        out.push_str(&self.text);
        for child in &self.children {
            child.serialize_into(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        self.serialize_into(&mut out);
        out
    }

    /// Child-index paths of every element in the tree, root included
    /// as the empty path.
    fn element_paths(&self) -> Vec<Vec<usize>> {
        let mut paths = vec![Vec::new()];
        for (i, child) in self.children.iter().enumerate() {
            for mut sub in child.element_paths() {
                sub.insert(0, i);
                paths.push(sub);
            }
        }
        paths
    }

    fn get_path(&self, path: &[usize]) -> &XmlElement {
        let mut current = self;
        for &i in path {
            current = &current.children[i];
        }
        current
    }

    fn get_path_mut(&mut self, path: &[usize]) -> &mut XmlElement {
        let mut current = self;
        for &i in path {
            current = &mut current.children[i];
        }
        current
    }

    fn count(&self) -> usize {
        1 + self.children.iter().map(XmlElement::count).sum::<usize>()
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Parser<'a> {
        Parser {
            bytes: text.as_bytes(),
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn starts_with(&self, prefix: &[u8]) -> bool {
        self.bytes[self.pos..].starts_with(prefix)
    }

    fn skip_until(&mut self, marker: &[u8]) -> bool {
        while self.pos < self.bytes.len() {
            if self.starts_with(marker) {
                self.pos += marker.len();
                return true;
            }
            self.pos += 1;
        }
        false
    }

    fn skip_whitespace(&mut self) {
        while let Some(b) = self.peek() {
            if b.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    /// Skips prolog, processing instructions, comments and doctype.
    fn skip_misc(&mut self) -> bool {
        loop {
            self.skip_whitespace();
            if self.starts_with(b"<?") {
                if !self.skip_until(b"?>") {
                    return false;
                }
            } else if self.starts_with(b"<!--") {
                if !self.skip_until(b"-->") {
                    return false;
                }
            } else if self.starts_with(b"<!") {
                if !self.skip_until(b">") {
                    return false;
                }
            } else {
                return true;
            }
        }
    }

    fn parse_name(&mut self) -> Option<String> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.' || b == b':' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return None;
        }
        String::from_utf8(self.bytes[start..self.pos].to_vec()).ok()
    }

    fn parse_element(&mut self) -> Option<XmlElement> {
        if self.peek()? != b'<' {
            return None;
        }
        self.pos += 1;
        let name = self.parse_name()?;

        // Raw attribute text up to the tag close.
        let attrs_start = self.pos;
        let mut self_closing = false;
        loop {
            match self.peek()? {
                b'>' => break,
                b'/' if self.starts_with(b"/>") => {
                    self_closing = true;
                    break;
                }
                _ => self.pos += 1,
            }
        }
        let attrs = String::from_utf8(self.bytes[attrs_start..self.pos].to_vec()).ok()?;
        if self_closing {
            self.pos += 2;
            return Some(XmlElement {
                name,
                attrs,
                text: String::new(),
                children: Vec::new(),
            });
        }
        self.pos += 1;

        let mut element = XmlElement {
            name,
            attrs,
            text: String::new(),
            children: Vec::new(),
        };

        let mut text_taken = false;
        loop {
            let text_start = self.pos;
            while self.peek().map_or(false, |b| b != b'<') {
                self.pos += 1;
            }
            if !text_taken && self.pos > text_start {
                element.text = String::from_utf8(self.bytes[text_start..self.pos].to_vec()).ok()?;
                text_taken = true;
            }
            if self.at_end() {
                return None;
            }
            if self.starts_with(b"</") {
                self.pos += 2;
                let closing = self.parse_name()?;
                if closing != element.name {
                    return None;
                }
                self.skip_whitespace();
                if self.peek()? != b'>' {
                    return None;
                }
                self.pos += 1;
                return Some(element);
            }
            if self.starts_with(b"<!--") {
                if !self.skip_until(b"-->") {
                    return None;
                }
                continue;
            }
            let child = self.parse_element()?;
            element.children.push(child);
        }
    }
}

/// Parses `text` into an element tree; `None` when it is not
/// well-formed enough for the permutator to work with.
pub fn parse_xml(text: &str) -> Option<XmlElement> {
    let mut parser = Parser::new(text);
    if !parser.skip_misc() {
        return None;
    }
    let root = parser.parse_element()?;
    if !parser.skip_misc() {
        return None;
    }
    if parser.at_end() {
        Some(root)
    } else {
        None
    }
}

pub fn is_valid_xml(bytes: &[u8]) -> bool {
    match std::str::from_utf8(bytes) {
        Ok(text) => parse_xml(text).is_some(),
        Err(_) => false,
    }
}

/// A parsed document under permutation, with its description log.
struct DeserializedXml {
    root: XmlElement,
    description: Vec<String>,
}

impl DeserializedXml {
    /// Appends childless clones of one random element to another
    /// random element.
    fn spam_breadth(&mut self, rng: &mut StdRng) {
        let paths = self.root.element_paths();
        let parent_path = paths[rng.gen_range(0, paths.len())].clone();
        let child_path = &paths[rng.gen_range(0, paths.len())];
        let clone = self.root.get_path(child_path).childless_clone();
        let name = clone.name.clone();
        let parent = self.root.get_path_mut(&parent_path);
        for _ in 0..SPAM_WIDTH {
            parent.children.push(clone.clone());
        }
        self.description
            .push(format!("appended {} <{}> clones breadth-wise", SPAM_WIDTH, name));
    }

    /// Nests clones of one random element inside itself, then grafts
    /// the chain onto another random element.
    fn spam_depth(&mut self, rng: &mut StdRng) {
        let paths = self.root.element_paths();
        let parent_path = paths[rng.gen_range(0, paths.len())].clone();
        let child_path = &paths[rng.gen_range(0, paths.len())];
        let mut chain = self.root.get_path(child_path).clone();
        let name = chain.name.clone();
        for _ in 0..SPAM_DEPTH {
            let mut wrapper = chain.childless_clone();
            wrapper.children.push(chain);
            chain = wrapper;
        }
        let parent = self.root.get_path_mut(&parent_path);
        parent.children.push(chain);
        self.description
            .push(format!("nested {} <{}> levels depth-wise", SPAM_DEPTH, name));
    }
}

pub struct XmlPermutator {
    to_harness: Sender<TestCase>,
    to_mutator: Sender<TestCase>,
    rng: StdRng,
}

impl XmlPermutator {
    pub fn new(
        to_harness: Sender<TestCase>,
        to_mutator: Sender<TestCase>,
        rng_seed: Option<u64>,
        stream: u64,
    ) -> XmlPermutator {
        let rng = match rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
            None => StdRng::from_entropy(),
        };
        XmlPermutator {
            to_harness,
            to_mutator,
            rng,
        }
    }

    fn publish_doc(&self, doc: &DeserializedXml) {
        let case = TestCase {
            input: doc.root.serialize().into_bytes(),
            changes: doc.description.clone(),
        };
        publish(&self.to_harness, &self.to_mutator, case);
    }
}

impl Permutator for XmlPermutator {
    fn permutate_input(&mut self, file: &Path) -> Result<()> {
        let text = fs::read_to_string(file).map_err(FuzzerError::SeedInput)?;
        let root = parse_xml(&text).ok_or_else(|| {
            FuzzerError::SeedInput(io::Error::new(
                io::ErrorKind::InvalidData,
                "seed is not well-formed XML",
            ))
        })?;
        log::debug!("parsed XML seed with {} elements", root.count());

        let mut plain = DeserializedXml {
            root: root.clone(),
            description: vec![format!("read XML seed from {}", file.display())],
        };
        plain.description.push("initial input".to_string());
        self.publish_doc(&plain);

        for _ in 0..SPAM_ROUNDS {
            let mut doc = DeserializedXml {
                root: root.clone(),
                description: vec![format!("read XML seed from {}", file.display())],
            };
            if self.rng.gen_bool(0.5) {
                doc.spam_breadth(&mut self.rng);
            } else {
                doc.spam_depth(&mut self.rng);
            }
            self.publish_doc(&doc);
        }
        Ok(())
    }
}
