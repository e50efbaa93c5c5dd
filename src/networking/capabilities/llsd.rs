//! LLSD values and their XML serialization
//!
//! Capability requests and event-queue responses are LLSD documents:
//! `<llsd>` wrapping a single map, array or scalar.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::BTreeMap;
use std::fmt::Write;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LlsdError {
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Document has no <llsd> root")]
    MissingRoot,

    #[error("Unexpected XML: {0}")]
    Unexpected(String),

    #[error("Invalid {kind} value '{value}'")]
    InvalidValue { kind: &'static str, value: String },

    #[error("Invalid base64 binary: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Containers nested deeper than {0}")]
    TooDeep(usize),
}

/// An LLSD value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Llsd {
    #[default]
    Undefined,
    Boolean(bool),
    Integer(i32),
    Real(f64),
    String(String),
    Uuid(Uuid),
    /// ISO-8601 text as sent
    Date(String),
    Uri(String),
    Binary(Vec<u8>),
    Map(BTreeMap<String, Llsd>),
    Array(Vec<Llsd>),
}

impl Llsd {
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Llsd)>) -> Self {
        Llsd::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Llsd::Undefined)
    }

    /// Map entry, `None` for missing keys and non-maps
    pub fn get(&self, key: &str) -> Option<&Llsd> {
        match self {
            Llsd::Map(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Llsd::String(s) | Llsd::Uri(s) | Llsd::Date(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i32> {
        match self {
            Llsd::Integer(i) => Some(*i),
            Llsd::Real(r) => Some(*r as i32),
            Llsd::Boolean(b) => Some(*b as i32),
            Llsd::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Llsd::Real(r) => Some(*r),
            Llsd::Integer(i) => Some(*i as f64),
            Llsd::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Llsd::Boolean(b) => Some(*b),
            Llsd::Integer(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Llsd::Uuid(id) => Some(*id),
            Llsd::String(s) => Uuid::parse_str(s.trim()).ok(),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Llsd::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Llsd>> {
        match self {
            Llsd::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Llsd]> {
        match self {
            Llsd::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Serialize as a complete LLSD XML document
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" ?><llsd>");
        write_value(&mut out, self);
        out.push_str("</llsd>");
        out
    }

    /// Parse an LLSD XML document
    pub fn from_xml(text: &str) -> Result<Llsd, LlsdError> {
        let mut parser = Parser::new(text);
        loop {
            match parser.next()? {
                Event::Start(e) if e.name().as_ref() == b"llsd" => break,
                Event::Empty(e) if e.name().as_ref() == b"llsd" => return Ok(Llsd::Undefined),
                Event::Eof => return Err(LlsdError::MissingRoot),
                _ => continue,
            }
        }
        match parser.next()? {
            Event::End(e) if e.name().as_ref() == b"llsd" => Ok(Llsd::Undefined),
            event => parser.parse_value(event),
        }
    }
}

impl From<bool> for Llsd {
    fn from(value: bool) -> Self {
        Llsd::Boolean(value)
    }
}

impl From<i32> for Llsd {
    fn from(value: i32) -> Self {
        Llsd::Integer(value)
    }
}

impl From<f64> for Llsd {
    fn from(value: f64) -> Self {
        Llsd::Real(value)
    }
}

impl From<&str> for Llsd {
    fn from(value: &str) -> Self {
        Llsd::String(value.to_string())
    }
}

impl From<String> for Llsd {
    fn from(value: String) -> Self {
        Llsd::String(value)
    }
}

impl From<Uuid> for Llsd {
    fn from(value: Uuid) -> Self {
        Llsd::Uuid(value)
    }
}

impl<T: Into<Llsd>> From<Vec<T>> for Llsd {
    fn from(values: Vec<T>) -> Self {
        Llsd::Array(values.into_iter().map(Into::into).collect())
    }
}

fn write_text(out: &mut String, tag: &str, text: &str) {
    if text.is_empty() {
        let _ = write!(out, "<{} />", tag);
    } else {
        let _ = write!(out, "<{tag}>{}</{tag}>", quick_xml::escape::escape(text));
    }
}

fn write_value(out: &mut String, value: &Llsd) {
    match value {
        Llsd::Undefined => out.push_str("<undef />"),
        Llsd::Boolean(b) => write_text(out, "boolean", if *b { "true" } else { "false" }),
        Llsd::Integer(i) => write_text(out, "integer", &i.to_string()),
        Llsd::Real(r) => write_text(out, "real", &r.to_string()),
        Llsd::String(s) => write_text(out, "string", s),
        Llsd::Uuid(id) => write_text(out, "uuid", &id.to_string()),
        Llsd::Date(d) => write_text(out, "date", d),
        Llsd::Uri(u) => write_text(out, "uri", u),
        Llsd::Binary(bytes) => {
            let _ = write!(out, "<binary encoding=\"base64\">{}</binary>", BASE64.encode(bytes));
        }
        Llsd::Map(map) => {
            out.push_str("<map>");
            for (key, value) in map {
                write_text(out, "key", key);
                write_value(out, value);
            }
            out.push_str("</map>");
        }
        Llsd::Array(items) => {
            out.push_str("<array>");
            for item in items {
                write_value(out, item);
            }
            out.push_str("</array>");
        }
    }
}

/// Deepest map/array nesting accepted from a peer
const MAX_DEPTH: usize = 64;

struct Parser<'a> {
    reader: Reader<&'a [u8]>,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        let mut reader = Reader::from_str(text);
        reader.trim_text(true);
        Self { reader, depth: 0 }
    }

    /// Next structural event; declarations and comments are skipped
    fn next(&mut self) -> Result<Event<'a>, LlsdError> {
        loop {
            match self.reader.read_event()? {
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => continue,
                event => return Ok(event),
            }
        }
    }

    fn parse_value(&mut self, event: Event<'a>) -> Result<Llsd, LlsdError> {
        match event {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"map" | b"array" => {
                        if self.depth >= MAX_DEPTH {
                            return Err(LlsdError::TooDeep(MAX_DEPTH));
                        }
                        self.depth += 1;
                        let value = if name == b"map" { self.parse_map() } else { self.parse_array() };
                        self.depth -= 1;
                        value
                    }
                    _ => {
                        let text = self.read_text(&name)?;
                        scalar(&name, &text)
                    }
                }
            }
            Event::Empty(e) => match e.name().as_ref() {
                b"map" => Ok(Llsd::Map(BTreeMap::new())),
                b"array" => Ok(Llsd::Array(Vec::new())),
                name => scalar(name, ""),
            },
            other => Err(LlsdError::Unexpected(format!("{:?}", other))),
        }
    }

    fn parse_map(&mut self) -> Result<Llsd, LlsdError> {
        let mut map = BTreeMap::new();
        loop {
            let key = match self.next()? {
                Event::End(e) if e.name().as_ref() == b"map" => return Ok(Llsd::Map(map)),
                Event::Start(e) if e.name().as_ref() == b"key" => self.read_text(b"key")?,
                Event::Empty(e) if e.name().as_ref() == b"key" => String::new(),
                other => return Err(LlsdError::Unexpected(format!("expected <key>, got {:?}", other))),
            };
            let event = self.next()?;
            let value = self.parse_value(event)?;
            map.insert(key, value);
        }
    }

    fn parse_array(&mut self) -> Result<Llsd, LlsdError> {
        let mut items = Vec::new();
        loop {
            match self.next()? {
                Event::End(e) if e.name().as_ref() == b"array" => return Ok(Llsd::Array(items)),
                Event::Eof => return Err(LlsdError::Unexpected("unterminated <array>".to_string())),
                event => items.push(self.parse_value(event)?),
            }
        }
    }

    /// Text content up to the closing `end` tag
    fn read_text(&mut self, end: &[u8]) -> Result<String, LlsdError> {
        let mut text = String::new();
        loop {
            match self.next()? {
                Event::Text(t) => text.push_str(&t.unescape()?),
                Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c)),
                Event::End(e) if e.name().as_ref() == end => return Ok(text),
                Event::Eof => {
                    return Err(LlsdError::Unexpected(format!(
                        "unterminated <{}>",
                        String::from_utf8_lossy(end)
                    )))
                }
                other => return Err(LlsdError::Unexpected(format!("{:?} inside scalar", other))),
            }
        }
    }
}

fn scalar(name: &[u8], text: &str) -> Result<Llsd, LlsdError> {
    let text = text.trim();
    let invalid = |kind: &'static str| LlsdError::InvalidValue { kind, value: text.to_string() };

    Ok(match name {
        b"undef" => Llsd::Undefined,
        b"boolean" => match text {
            "" | "0" | "false" => Llsd::Boolean(false),
            "1" | "true" => Llsd::Boolean(true),
            _ => return Err(invalid("boolean")),
        },
        b"integer" if text.is_empty() => Llsd::Integer(0),
        b"integer" => Llsd::Integer(text.parse().map_err(|_| invalid("integer"))?),
        b"real" if text.is_empty() => Llsd::Real(0.0),
        b"real" => Llsd::Real(text.parse().map_err(|_| invalid("real"))?),
        b"uuid" if text.is_empty() => Llsd::Uuid(Uuid::nil()),
        b"uuid" => Llsd::Uuid(Uuid::parse_str(text).map_err(|_| invalid("uuid"))?),
        b"string" => Llsd::String(text.to_string()),
        b"date" => Llsd::Date(text.to_string()),
        b"uri" => Llsd::Uri(text.to_string()),
        b"binary" => {
            let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
            Llsd::Binary(BASE64.decode(compact)?)
        }
        other => return Err(LlsdError::Unexpected(format!("unknown element <{}>", String::from_utf8_lossy(other)))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seed_response() {
        let xml = r#"<?xml version="1.0" ?>
            <llsd><map>
              <key>EventQueueGet</key><string>https://sim.example:12043/cap/eq</string>
              <key>GetDisplayNames</key><uri>https://sim.example:12043/cap/names</uri>
            </map></llsd>"#;
        let doc = Llsd::from_xml(xml).unwrap();
        assert_eq!(
            doc.get("EventQueueGet").and_then(Llsd::as_str),
            Some("https://sim.example:12043/cap/eq")
        );
        assert_eq!(doc.get("GetDisplayNames"), Some(&Llsd::Uri("https://sim.example:12043/cap/names".into())));
    }

    #[test]
    fn test_parse_event_queue_response() {
        let xml = "<llsd><map><key>events</key><array><map>\
            <key>body</key><map><key>SimulatorInfo</key><array><map>\
              <key>Handle</key><binary encoding=\"base64\">AAPpAAAD6gA=</binary>\
              <key>IP</key><binary>fwAAAQ==</binary>\
              <key>Port</key><integer>13001</integer>\
            </map></array></map>\
            <key>message</key><string>EnableSimulator</string>\
            </map></array><key>id</key><integer>4</integer></map></llsd>";
        let doc = Llsd::from_xml(xml).unwrap();
        assert_eq!(doc.get("id").and_then(Llsd::as_integer), Some(4));

        let events = doc.get("events").and_then(Llsd::as_array).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get("message").and_then(Llsd::as_str), Some("EnableSimulator"));
        let info = &events[0].get("body").unwrap().get("SimulatorInfo").unwrap().as_array().unwrap()[0];
        assert_eq!(info.get("IP").and_then(Llsd::as_binary), Some(&[127u8, 0, 0, 1][..]));
        assert_eq!(info.get("Port").and_then(Llsd::as_integer), Some(13001));
    }

    #[test]
    fn test_write_then_parse_document() {
        let doc = Llsd::map([
            ("ack", Llsd::Undefined),
            ("done", Llsd::Boolean(false)),
            ("name", Llsd::from("Tom & <Jerry>")),
            ("empty", Llsd::from("")),
            ("agent", Llsd::Uuid(Uuid::new_v4())),
            ("blob", Llsd::Binary(vec![0, 1, 2, 255])),
            ("list", Llsd::from(vec![1, 2, 3])),
            ("lag", Llsd::Real(0.25)),
        ]);
        let xml = doc.to_xml();
        assert!(xml.contains("Tom &amp; &lt;Jerry&gt;"));
        assert_eq!(Llsd::from_xml(&xml).unwrap(), doc);
    }

    #[test]
    fn test_empty_elements() {
        let doc = Llsd::from_xml("<llsd><array><map /><array /><string /><integer /><undef /></array></llsd>").unwrap();
        assert_eq!(
            doc,
            Llsd::Array(vec![
                Llsd::Map(BTreeMap::new()),
                Llsd::Array(Vec::new()),
                Llsd::String(String::new()),
                Llsd::Integer(0),
                Llsd::Undefined,
            ])
        );
        assert_eq!(Llsd::from_xml("<llsd />").unwrap(), Llsd::Undefined);
    }

    #[test]
    fn test_malformed_documents() {
        assert!(matches!(Llsd::from_xml("<html></html>"), Err(LlsdError::MissingRoot)));
        assert!(matches!(
            Llsd::from_xml("<llsd><integer>twelve</integer></llsd>"),
            Err(LlsdError::InvalidValue { kind: "integer", .. })
        ));
        assert!(Llsd::from_xml("<llsd><map><string>x</string></map></llsd>").is_err());
    }

    #[test]
    fn test_nesting_depth_is_bounded() {
        let nested = |depth: usize| format!("<llsd>{}{}</llsd>", "<array>".repeat(depth), "</array>".repeat(depth));
        assert!(Llsd::from_xml(&nested(MAX_DEPTH)).is_ok());
        assert!(matches!(Llsd::from_xml(&nested(MAX_DEPTH + 1)), Err(LlsdError::TooDeep(_))));
        assert!(matches!(Llsd::from_xml(&nested(100_000)), Err(LlsdError::TooDeep(_))));
    }
}
