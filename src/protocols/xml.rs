//! Minimal owned XML tree used by the SOAP codec and the backup store
//!
//! One parser for the whole agent. Incoming documents keep their qualified
//! names and attribute spellings untouched so namespace prefixes can be
//! resolved afterwards; text content is unescaped but otherwise verbatim.

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    /// Qualified name exactly as written, e.g. `soapenv:Body`.
    pub name: String,
    /// Attributes with their qualified names, in document order.
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    /// Concatenated character data directly under this element.
    pub text: String,
}

impl Element {
    pub fn parse(xml: &str) -> Result<Element> {
        let mut reader = Reader::from_str(xml);
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => {
                    let elem = element_from_start(&start)?;
                    stack.push(elem);
                }
                Ok(Event::Empty(start)) => {
                    let elem = element_from_start(&start)?;
                    attach(&mut stack, &mut root, elem)?;
                }
                Ok(Event::End(_)) => {
                    let elem = stack
                        .pop()
                        .ok_or_else(|| Error::xml("unbalanced end tag"))?;
                    attach(&mut stack, &mut root, elem)?;
                }
                Ok(Event::Text(text)) => {
                    if let Some(parent) = stack.last_mut() {
                        let unescaped = text
                            .unescape()
                            .map_err(|e| Error::xml(format!("bad character data: {}", e)))?;
                        parent.text.push_str(&unescaped);
                    }
                }
                Ok(Event::CData(data)) => {
                    if let Some(parent) = stack.last_mut() {
                        parent
                            .text
                            .push_str(&String::from_utf8_lossy(data.as_ref()));
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(Error::xml(format!("malformed document: {}", e))),
            }
        }

        if !stack.is_empty() {
            return Err(Error::xml("truncated document"));
        }
        root.ok_or_else(|| Error::xml("document has no root element"))
    }

    /// Name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        match self.name.split_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    pub fn prefix(&self) -> Option<&str> {
        self.name.split_once(':').map(|(prefix, _)| prefix)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn trimmed_text(&self) -> &str {
        self.text.trim()
    }

    pub fn first_element_child(&self) -> Option<&Element> {
        self.children.first()
    }

    /// Depth-first search (including self) for the first element with the
    /// given local name.
    pub fn find_local(&self, local: &str) -> Option<&Element> {
        if self.local_name() == local {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find_local(local))
    }

    /// Depth-first search (including self) for the first element with the
    /// given qualified name.
    pub fn find_qualified(&self, name: &str) -> Option<&Element> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find_qualified(name))
    }

    /// All elements with the given local name, in document order.
    pub fn find_all_local<'a>(&'a self, local: &str, out: &mut Vec<&'a Element>) {
        if self.local_name() == local {
            out.push(self);
        }
        for child in &self.children {
            child.find_all_local(local, out);
        }
    }

    pub fn collect_local(&self, local: &str) -> Vec<&Element> {
        let mut out = Vec::new();
        self.find_all_local(local, &mut out);
        out
    }
}

fn element_from_start(start: &quick_xml::events::BytesStart<'_>) -> Result<Element> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| Error::xml(format!("bad attribute: {}", e)))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| Error::xml(format!("bad attribute value: {}", e)))?
            .into_owned();
        attributes.push((key, value));
    }
    Ok(Element {
        name,
        attributes,
        children: Vec::new(),
        text: String::new(),
    })
}

fn attach(stack: &mut Vec<Element>, root: &mut Option<Element>, elem: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(elem),
        None => {
            if root.is_some() {
                return Err(Error::xml("multiple root elements"));
            }
            *root = Some(elem);
        }
    }
    Ok(())
}

/// Deterministic single-line XML rendering. The same inputs always produce
/// the same bytes, and no newlines ever appear in the output.
#[derive(Debug, Default)]
pub struct DocBuilder {
    out: String,
}

impl DocBuilder {
    pub fn new() -> Self {
        Self { out: String::new() }
    }

    pub fn open(&mut self, tag: &str) {
        self.out.push('<');
        self.out.push_str(tag);
        self.out.push('>');
    }

    pub fn open_attrs(&mut self, tag: &str, attrs: &[(&str, &str)]) {
        self.out.push('<');
        self.out.push_str(tag);
        for (key, value) in attrs {
            self.out.push(' ');
            self.out.push_str(key);
            self.out.push_str("=\"");
            self.out.push_str(&escape(value));
            self.out.push('"');
        }
        self.out.push('>');
    }

    pub fn close(&mut self, tag: &str) {
        self.out.push_str("</");
        self.out.push_str(tag);
        self.out.push('>');
    }

    pub fn empty(&mut self, tag: &str) {
        self.out.push('<');
        self.out.push_str(tag);
        self.out.push_str("/>");
    }

    pub fn text(&mut self, value: &str) {
        self.out.push_str(&escape(value));
    }

    pub fn leaf(&mut self, tag: &str, value: &str) {
        self.open(tag);
        self.text(value);
        self.close(tag);
    }

    pub fn leaf_attrs(&mut self, tag: &str, attrs: &[(&str, &str)], value: &str) {
        self.open_attrs(tag, attrs);
        self.text(value);
        self.close(tag);
    }

    pub fn finish(self) -> String {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_elements_with_prefixes() {
        let doc = Element::parse(
            "<s:Envelope xmlns:s=\"urn:x\"><s:Body><cwmp:Reboot><CommandKey>k1</CommandKey></cwmp:Reboot></s:Body></s:Envelope>",
        )
        .unwrap();

        assert_eq!(doc.name, "s:Envelope");
        assert_eq!(doc.local_name(), "Envelope");
        assert_eq!(doc.prefix(), Some("s"));
        assert_eq!(doc.attr("xmlns:s"), Some("urn:x"));

        let key = doc.find_local("CommandKey").unwrap();
        assert_eq!(key.text, "k1");
        assert!(doc.find_qualified("cwmp:Reboot").is_some());
    }

    #[test]
    fn preserves_text_verbatim_including_whitespace() {
        let doc = Element::parse("<a><id> 42 </id></a>").unwrap();
        assert_eq!(doc.find_local("id").unwrap().text, " 42 ");
        assert_eq!(doc.find_local("id").unwrap().trimmed_text(), "42");
    }

    #[test]
    fn unescapes_entities() {
        let doc = Element::parse("<v>a &amp; b &lt;c&gt;</v>").unwrap();
        assert_eq!(doc.text, "a & b <c>");
    }

    #[test]
    fn handles_self_closing_elements() {
        let doc = Element::parse("<a><empty/><b>x</b></a>").unwrap();
        assert_eq!(doc.children.len(), 2);
        assert_eq!(doc.children[0].name, "empty");
        assert!(doc.children[0].text.is_empty());
    }

    #[test]
    fn rejects_truncated_documents() {
        assert!(Element::parse("<a><b></a>").is_err());
        assert!(Element::parse("").is_err());
    }

    #[test]
    fn builder_escapes_and_roundtrips() {
        let mut b = DocBuilder::new();
        b.open("root");
        b.leaf_attrs("Value", &[("xsi:type", "xsd:string")], "a<b>&\"c\"");
        b.empty("AccessList");
        b.close("root");
        let xml = b.finish();
        assert!(!xml.contains('\n'));

        let parsed = Element::parse(&xml).unwrap();
        let value = parsed.find_local("Value").unwrap();
        assert_eq!(value.text, "a<b>&\"c\"");
        assert_eq!(value.attr("xsi:type"), Some("xsd:string"));
    }

    #[test]
    fn collects_repeated_names_in_document_order() {
        let doc = Element::parse("<l><n>1</n><x><n>2</n></x><n>3</n></l>").unwrap();
        let all: Vec<&str> = doc
            .collect_local("n")
            .iter()
            .map(|e| e.trimmed_text())
            .collect();
        assert_eq!(all, vec!["1", "2", "3"]);
    }
}
