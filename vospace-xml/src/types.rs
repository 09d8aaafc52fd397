use std::collections::BTreeMap;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;

use crate::error::ParsingError;
use crate::xml::{fragment, CADC_PROPERTY_BASE, IVOA_PROPERTY_BASE, VOS_NS, XSI_NS};

/// Property names carrying server-managed metadata, never exposed as
/// user-extensible extended attributes.
pub const RESERVED_PROPERTIES: &[&str] = &[
    "description",
    "type",
    "encoding",
    "MD5",
    "length",
    "creator",
    "date",
    "groupread",
    "groupwrite",
    "ispublic",
];

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IRUSR: u32 = 0o400;
const S_IWUSR: u32 = 0o200;
const S_IXUSR: u32 = 0o100;
const S_IRGRP: u32 = 0o040;
const S_IWGRP: u32 = 0o020;
const S_IXGRP: u32 = 0o010;
const S_IROTH: u32 = 0o004;
const S_IXOTH: u32 = 0o001;

/// A VOSpace node type. Tagged rather than stringly so stat computation and
/// XML emission (which views are provided, whether `<nodes>` is present) are
/// exhaustive at compile time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeType {
    Container,
    Data,
    Link,
    /// Any `vos:*Node` type this library doesn't special-case. Preserved
    /// verbatim so round-tripping an unrecognized node doesn't lose it.
    Unknown(String),
}

impl NodeType {
    pub fn wire_name(&self) -> &str {
        match self {
            Self::Container => "vos:ContainerNode",
            Self::Data => "vos:DataNode",
            Self::Link => "vos:LinkNode",
            Self::Unknown(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "vos:ContainerNode" => Self::Container,
            "vos:DataNode" => Self::Data,
            "vos:LinkNode" => Self::Link,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Self::Container)
    }
}

/// A node's property map. A missing key means the property was never set;
/// a key mapped to `None` means it is tombstoned (pending delete on the next
/// flush). See spec Design Notes: `Map<String, Option<String>>` is exactly
/// the three states (present / tombstoned / absent) the wire format needs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Properties(pub BTreeMap<String, Option<String>>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_deref())
    }

    /// `changeProp`: set `key` to `value`, or tombstone it if `value` is
    /// `None`. Returns whether the property was newly set to a value (as
    /// opposed to a tombstone or a true no-op), regardless of whether the
    /// new value equals the old one.
    pub fn change(&mut self, key: &str, value: Option<&str>) -> bool {
        let existed = self.0.contains_key(key);
        match value {
            Some(v) => {
                self.0.insert(key.to_string(), Some(v.to_string()));
                true
            }
            None if existed => {
                self.0.insert(key.to_string(), None);
                false
            }
            None => false,
        }
    }

    /// Properties a caller may treat as their own extended attributes, i.e.
    /// everything outside [`RESERVED_PROPERTIES`].
    pub fn extended(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0
            .iter()
            .filter(|(k, _)| !RESERVED_PROPERTIES.contains(&k.as_str()))
            .map(|(k, v)| (k.as_str(), v.as_deref()))
    }
}

/// A container's child list is either not loaded yet, or loaded (possibly
/// empty). Collapsing these to a single `Vec` would make "empty container"
/// indistinguishable from "haven't asked the server yet" and cause silent
/// re-fetch loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildList {
    Unloaded,
    Loaded(Vec<Node>),
}

impl Default for ChildList {
    fn default() -> Self {
        Self::Unloaded
    }
}

impl ChildList {
    pub fn as_loaded(&self) -> Option<&[Node]> {
        match self {
            Self::Loaded(v) => Some(v),
            Self::Unloaded => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }
}

/// A node in the VOSpace tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub uri: String,
    pub node_type: NodeType,
    pub properties: Properties,
    pub children: ChildList,
}

/// Stat attributes derived from a node's properties. Pure
/// function of `(type, properties, children)` plus the externally supplied
/// clock and uid/gid -- the node model itself never reads the system clock
/// or calls into the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    pub st_mode: u32,
    pub st_nlink: u64,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_size: u64,
    pub st_atime: DateTime<Local>,
    pub st_mtime: DateTime<Local>,
    pub st_ctime: DateTime<Local>,
}

/// A convenience summary of a node, the rough equivalent of one line of
/// `ls -l` output. Not part of the wire format; derived for callers that
/// want a directory listing without re-deriving it from properties
/// themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String,
    pub permissions: String,
    pub creator: Option<String>,
    pub read_group: String,
    pub write_group: String,
    pub size: u64,
    pub date: Option<DateTime<Local>>,
}

/// `groupread`/`groupwrite` grant access unless they're absent, empty, or
/// literally `"NONE"`. A freshly chmod'd node clears the property to `""`
/// rather than removing it, so empty must be treated the same as `"NONE"`
/// for the grant to actually disappear (see the chmod round-trip test below).
fn grants(v: Option<&str>) -> bool {
    !matches!(v, None | Some("") | Some("NONE"))
}

/// Parse a VOSpace `date` property (ISO-8601, truncated to second
/// precision) as UTC and convert to local time.
fn parse_vospace_date(raw: &str) -> Option<DateTime<Local>> {
    let head = if raw.len() > 19 { &raw[..19] } else { raw };
    let naive = NaiveDateTime::parse_from_str(head, "%Y-%m-%dT%H:%M:%S").ok()?;
    Some(Utc.from_utc_datetime(&naive).with_timezone(&Local))
}

fn extract_cn(creator: &str) -> Option<String> {
    let (_, rest) = creator.split_once("CN=")?;
    let cn = rest.split(',').next().unwrap_or(rest).trim();
    Some(cn.replace(' ', "_").to_lowercase())
}

fn permission_string(mode: u32, is_dir: bool) -> String {
    let bit = |flag: u32, c: char| if mode & flag != 0 { c } else { '-' };
    let mut s = String::with_capacity(10);
    s.push(if is_dir { 'd' } else { '-' });
    s.push(bit(S_IRUSR, 'r'));
    s.push(bit(S_IWUSR, 'w'));
    s.push(bit(S_IXUSR, 'x'));
    s.push(bit(S_IRGRP, 'r'));
    s.push(bit(S_IWGRP, 'w'));
    s.push(bit(S_IXGRP, 'x'));
    s.push(bit(S_IROTH, 'r'));
    s.push('-'); // public never implies write
    s.push(bit(S_IXOTH, 'x'));
    s
}

impl Node {
    pub fn new(uri: impl Into<String>, node_type: NodeType) -> Self {
        let children = if node_type.is_container() {
            ChildList::Loaded(Vec::new())
        } else {
            ChildList::Unloaded
        };
        Self {
            uri: uri.into(),
            node_type,
            properties: Properties::new(),
            children,
        }
    }

    pub fn name(&self) -> &str {
        self.uri.rsplit('/').next().unwrap_or(&self.uri)
    }

    pub fn is_container(&self) -> bool {
        self.node_type.is_container()
    }

    pub fn is_public(&self) -> bool {
        self.properties.get("ispublic") == Some("true")
    }

    /// `setProperty`: unconditionally overwrite `key`. A DOM-splicing
    /// implementation of this call could leave two `<property>` elements
    /// with the same key behind -- callers should prefer `changeProp` --
    /// but a `Map` can't represent that anyway.
    pub fn set_property(&mut self, key: &str, value: Option<&str>) {
        self.properties
            .0
            .insert(key.to_string(), value.map(|v| v.to_string()));
    }

    pub fn change_prop(&mut self, key: &str, value: Option<&str>) -> bool {
        self.properties.change(key, value)
    }

    pub fn set_public(&mut self, value: bool) -> bool {
        self.change_prop("ispublic", Some(if value { "true" } else { "false" }))
    }

    pub fn chwgrp(&mut self, group: &str) -> bool {
        self.change_prop("groupwrite", Some(group))
    }

    pub fn chrgrp(&mut self, group: &str) -> bool {
        self.change_prop("groupread", Some(group))
    }

    /// Map a Unix mode's other-read/group-read/group-write bits onto
    /// `ispublic`/`groupread`/`groupwrite`. Owner bits and the execute bits
    /// are not representable and are ignored.
    pub fn chmod(&mut self, mode: u32) -> bool {
        let mut changed = false;
        changed |= self.set_public(mode & S_IROTH != 0);

        let groupread = self.properties.get("groupread").unwrap_or("").to_string();
        changed |= if mode & S_IRGRP != 0 {
            self.chrgrp(&groupread)
        } else {
            self.chrgrp("")
        };

        let groupwrite = self.properties.get("groupwrite").unwrap_or("").to_string();
        changed |= if mode & S_IWGRP != 0 {
            self.chwgrp(&groupwrite)
        } else {
            self.chwgrp("")
        };

        changed
    }

    fn st_mode_bits(&self) -> u32 {
        let mut mode = if self.is_container() { S_IFDIR } else { S_IFREG };
        mode |= S_IRUSR | S_IWUSR | S_IXUSR;
        if grants(self.properties.get("groupwrite")) {
            mode |= S_IWGRP;
        }
        if grants(self.properties.get("groupread")) {
            mode |= S_IRGRP | S_IXGRP;
        }
        if self.is_public() {
            mode |= S_IROTH | S_IXOTH;
        }
        mode
    }

    pub fn stat(&self, now: DateTime<Local>, uid: u32, gid: u32) -> NodeStat {
        let mtime = self
            .properties
            .get("date")
            .and_then(parse_vospace_date)
            .unwrap_or(now);
        let st_nlink = if self.is_container() {
            2 + self.children.as_loaded().map(|c| c.len()).unwrap_or(0) as u64
        } else {
            1
        };
        let st_size = self
            .properties
            .get("length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        NodeStat {
            st_mode: self.st_mode_bits(),
            st_nlink,
            st_uid: uid,
            st_gid: gid,
            st_size,
            st_atime: now,
            st_mtime: mtime,
            st_ctime: mtime,
        }
    }

    pub fn entry_info(&self) -> EntryInfo {
        let mode = self.st_mode_bits();
        EntryInfo {
            name: self.name().to_string(),
            permissions: permission_string(mode, self.is_container()),
            creator: self.properties.get("creator").and_then(extract_cn),
            read_group: self.properties.get("groupread").unwrap_or("NONE").to_string(),
            write_group: self.properties.get("groupwrite").unwrap_or("NONE").to_string(),
            size: self
                .properties
                .get("length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            date: self.properties.get("date").and_then(parse_vospace_date),
        }
    }

    pub fn to_xml(&self) -> String {
        let mut buf = Vec::new();
        {
            let mut w = Writer::new(&mut buf);
            self.write_xml(&mut w)
                .expect("writing XML to an in-memory buffer cannot fail");
        }
        String::from_utf8(buf).expect("quick-xml only emits valid utf-8")
    }

    fn write_xml<W: std::io::Write>(&self, w: &mut Writer<W>) -> quick_xml::Result<()> {
        let mut node_el = BytesStart::new("node");
        node_el.push_attribute(("xmlns", VOS_NS));
        node_el.push_attribute(("xmlns:vos", VOS_NS));
        node_el.push_attribute(("xmlns:xsi", XSI_NS));
        node_el.push_attribute(("uri", self.uri.as_str()));
        node_el.push_attribute(("xsi:type", self.node_type.wire_name()));
        node_el.push_attribute(("busy", "false"));
        w.write_event(Event::Start(node_el))?;

        w.write_event(Event::Start(BytesStart::new("properties")))?;
        for (key, value) in self.properties.0.iter() {
            let uri = format!("{}#{}", IVOA_PROPERTY_BASE, key);
            let mut p = BytesStart::new("property");
            p.push_attribute(("uri", uri.as_str()));
            p.push_attribute(("readOnly", "false"));
            match value {
                Some(v) => {
                    w.write_event(Event::Start(p))?;
                    w.write_event(Event::Text(BytesText::new(v)))?;
                }
                None => {
                    p.push_attribute(("xsi:nil", "true"));
                    w.write_event(Event::Start(p))?;
                }
            }
            w.write_event(Event::End(BytesEnd::new("property")))?;
        }
        w.write_event(Event::End(BytesEnd::new("properties")))?;

        w.write_event(Event::Start(BytesStart::new("accepts")))?;
        write_view(w, IVOA_PROPERTY_BASE, "defaultview")?;
        w.write_event(Event::End(BytesEnd::new("accepts")))?;

        w.write_event(Event::Start(BytesStart::new("provides")))?;
        write_view(w, IVOA_PROPERTY_BASE, "defaultview")?;
        write_view(w, CADC_PROPERTY_BASE, "rssview")?;
        if matches!(self.node_type, NodeType::Data) {
            write_view(w, CADC_PROPERTY_BASE, "dataview")?;
        }
        w.write_event(Event::End(BytesEnd::new("provides")))?;

        if self.is_container() {
            w.write_event(Event::Start(BytesStart::new("nodes")))?;
            if let Some(children) = self.children.as_loaded() {
                for child in children {
                    child.write_xml(w)?;
                }
            }
            w.write_event(Event::End(BytesEnd::new("nodes")))?;
        }

        w.write_event(Event::End(BytesEnd::new("node")))
    }

    pub fn from_xml(xml: &str) -> Result<Node, ParsingError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_event_into(&mut buf)?.into_owned() {
                Event::Start(start) if local_name(start.name().as_ref()) == b"node" => {
                    return parse_node(&mut reader, &start);
                }
                Event::Eof => return Err(ParsingError::Eof),
                _ => {}
            }
        }
    }
}

fn write_view<W: std::io::Write>(w: &mut Writer<W>, base: &str, name: &str) -> quick_xml::Result<()> {
    let mut v = BytesStart::new("view");
    v.push_attribute(("uri", format!("{}#{}", base, name).as_str()));
    w.write_event(Event::Empty(v))
}

/// Strip any `prefix:` off a qualified XML name. VOSpace documents only ever
/// mix two namespaces (the default VOS one and xsi) and none of our element
/// or attribute local names collide across them, so resolving the real
/// namespace binding (as a full `NsReader` would) is unnecessary ceremony.
fn local_name(raw: &[u8]) -> &[u8] {
    match raw.iter().position(|&b| b == b':') {
        Some(idx) => &raw[idx + 1..],
        None => raw,
    }
}

fn get_attr(e: &BytesStart, local: &str) -> Result<Option<String>, ParsingError> {
    for attr in e.attributes() {
        let attr = attr?;
        if local_name(attr.key.as_ref()) == local.as_bytes() {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// Parses the children of a `<node>` element whose opening tag (`start`) has
/// already been consumed. Every event is detached with `.into_owned()` as
/// soon as it is read so `buf` can be cleared and reused on the next
/// iteration (and passed down into helpers like [`skip_element`]) without
/// fighting the borrow checker over a reference still held into it.
fn parse_node(reader: &mut Reader<&[u8]>, start: &BytesStart) -> Result<Node, ParsingError> {
    let uri = get_attr(start, "uri")?.unwrap_or_default();
    let node_type = get_attr(start, "type")?
        .map(|s| NodeType::parse(&s))
        .ok_or(ParsingError::MissingType)?;

    let mut properties = Properties::new();
    let mut children = if node_type.is_container() {
        ChildList::Loaded(Vec::new())
    } else {
        ChildList::Unloaded
    };

    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)?.into_owned() {
            Event::Start(e) => match local_name(e.name().as_ref()) {
                b"properties" => parse_properties(reader, &mut properties)?,
                b"nodes" => children = ChildList::Loaded(parse_nodes(reader)?),
                _ => skip_element(reader, &e)?,
            },
            Event::Empty(e) if local_name(e.name().as_ref()) == b"nodes" => {
                children = ChildList::Loaded(Vec::new());
            }
            Event::Empty(_) => {}
            Event::End(e) if local_name(e.name().as_ref()) == b"node" => break,
            Event::Eof => return Err(ParsingError::Eof),
            _ => {}
        }
    }

    Ok(Node {
        uri,
        node_type,
        properties,
        children,
    })
}

fn parse_properties(reader: &mut Reader<&[u8]>, props: &mut Properties) -> Result<(), ParsingError> {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)?.into_owned() {
            Event::Start(e) if local_name(e.name().as_ref()) == b"property" => {
                let key = property_key(&e)?;
                let nil = get_attr(&e, "nil")?.as_deref() == Some("true");
                let text = read_property_text(reader)?;
                props.0.insert(key, if nil { None } else { Some(text) });
            }
            Event::Empty(e) if local_name(e.name().as_ref()) == b"property" => {
                let key = property_key(&e)?;
                let nil = get_attr(&e, "nil")?.as_deref() == Some("true");
                props.0.insert(key, if nil { None } else { Some(String::new()) });
            }
            Event::End(e) if local_name(e.name().as_ref()) == b"properties" => break,
            Event::Eof => return Err(ParsingError::Eof),
            _ => {}
        }
    }
    Ok(())
}

fn property_key(e: &BytesStart) -> Result<String, ParsingError> {
    let uri = get_attr(e, "uri")?.unwrap_or_default();
    fragment(&uri)
        .map(|s| s.to_string())
        .ok_or(ParsingError::MissingPropertyName)
}

fn read_property_text(reader: &mut Reader<&[u8]>) -> Result<String, ParsingError> {
    let mut acc = String::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)?.into_owned() {
            Event::Text(t) => acc.push_str(&t.unescape()?),
            Event::CData(c) => acc.push_str(std::str::from_utf8(&c)?),
            Event::End(e) if local_name(e.name().as_ref()) == b"property" => break,
            Event::Eof => return Err(ParsingError::Eof),
            _ => {}
        }
    }
    Ok(acc)
}

fn parse_nodes(reader: &mut Reader<&[u8]>) -> Result<Vec<Node>, ParsingError> {
    let mut out = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)?.into_owned() {
            Event::Start(e) if local_name(e.name().as_ref()) == b"node" => {
                out.push(parse_node(reader, &e)?);
            }
            Event::Empty(e) if local_name(e.name().as_ref()) == b"node" => {
                let uri = get_attr(&e, "uri")?.unwrap_or_default();
                let node_type = get_attr(&e, "type")?
                    .map(|s| NodeType::parse(&s))
                    .ok_or(ParsingError::MissingType)?;
                out.push(Node::new(uri, node_type));
            }
            Event::End(e) if local_name(e.name().as_ref()) == b"nodes" => break,
            Event::Eof => return Err(ParsingError::Eof),
            _ => {}
        }
    }
    Ok(out)
}

/// Skip over an element this decoder doesn't care about (`<accepts>`,
/// `<provides>`, or anything from a future server version), tracking depth
/// so nested elements with the same local name don't close the skip early.
fn skip_element(reader: &mut Reader<&[u8]>, start: &BytesStart) -> Result<(), ParsingError> {
    let name = start.name().as_ref().to_vec();
    let mut depth = 0u32;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)?.into_owned() {
            Event::Start(e) if e.name().as_ref() == name.as_slice() => depth += 1,
            Event::End(e) if e.name().as_ref() == name.as_slice() => {
                if depth == 0 {
                    return Ok(());
                }
                depth -= 1;
            }
            Event::Eof => return Err(ParsingError::Eof),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Node {
        let mut n = Node::new("vos://cadc.nrc.ca!vospace/demo/hello.txt", NodeType::Data);
        n.set_property("length", Some("6"));
        n.set_property("MD5", Some("b1946ac92492d2347c6235b4d2611184"));
        n.set_property("date", Some("2020-01-02T03:04:05.000"));
        n.set_property("ispublic", Some("true"));
        n
    }

    #[test]
    fn round_trip_preserves_type_and_properties() {
        let n = sample();
        let xml = n.to_xml();
        let back = Node::from_xml(&xml).unwrap();
        assert_eq!(back.node_type, n.node_type);
        assert_eq!(back.properties, n.properties);
        assert_eq!(back.uri, n.uri);
    }

    #[test]
    fn missing_type_is_an_error() {
        let xml = r#"<node xmlns="http://www.ivoa.net/xml/VOSpace/v2.0" uri="vos://a/b"><properties/></node>"#;
        assert!(matches!(Node::from_xml(xml), Err(ParsingError::MissingType)));
    }

    #[test]
    fn change_prop_tombstones_with_nil() {
        let mut n = sample();
        assert_eq!(n.change_prop("length", None), false);
        assert_eq!(n.properties.get("length"), None);
        let xml = n.to_xml();
        assert!(xml.contains(r#"xsi:nil="true""#));
    }

    #[test]
    fn change_prop_sets_new_and_existing() {
        let mut n = Node::new("vos://a/b", NodeType::Data);
        assert_eq!(n.change_prop("description", Some("hi")), true);
        assert_eq!(n.properties.get("description"), Some("hi"));
        assert_eq!(n.change_prop("description", Some("hi")), true); // unconditional, per spec
    }

    #[test]
    fn stat_mode_is_pure_function_of_acl_properties() {
        let mut n = sample();
        let now: DateTime<Local> = Local::now();
        let before = n.stat(now, 0, 0).st_mode;
        n.set_property("date", Some("1999-01-01T00:00:00.000"));
        let after = n.stat(now, 0, 0).st_mode;
        assert_eq!(before, after);
    }

    #[test]
    fn chmod_round_trip_0o750() {
        let mut n = Node::new("vos://a/b", NodeType::Data);
        n.set_property("ispublic", Some("false"));
        n.set_property("groupread", Some("X"));
        n.set_property("groupwrite", Some("X"));

        assert!(n.chmod(0o750));
        assert_eq!(n.properties.get("ispublic"), Some("false"));
        assert_eq!(n.properties.get("groupread"), Some("X"));
        assert_eq!(n.properties.get("groupwrite"), Some(""));

        let mode = n.stat(Local::now(), 0, 0).st_mode;
        assert_eq!(mode & 0o777, 0o750);
        assert_eq!(mode & S_IFREG, S_IFREG);
    }

    #[test]
    fn container_child_list_starts_loaded_empty() {
        let n = Node::new("vos://a/b", NodeType::Container);
        assert_eq!(n.children.as_loaded(), Some(&[][..]));
    }

    #[test]
    fn data_node_child_list_is_unloaded_sentinel() {
        let n = Node::new("vos://a/b", NodeType::Data);
        assert!(!n.children.is_loaded());
    }
}
