use std::str::Utf8Error;

/// Errors produced while turning a `<node>` document into a [`crate::Node`]
/// or back.
#[derive(Debug)]
pub enum ParsingError {
    /// The element wasn't the one being looked for; callers use this to
    /// backtrack, it is not necessarily fatal.
    Recoverable,
    /// A `<node>` element with no `type` attribute.
    MissingType,
    /// A `<property>` element with no `uri` attribute, or a `uri` with no
    /// `#fragment`.
    MissingPropertyName,
    Utf8(Utf8Error),
    Attr(quick_xml::events::attributes::AttrError),
    Xml(quick_xml::Error),
    Eof,
}

impl std::fmt::Display for ParsingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recoverable => write!(f, "recoverable parsing error"),
            Self::MissingType => write!(f, "node element has no type attribute"),
            Self::MissingPropertyName => write!(f, "property element has no #fragment in its uri"),
            Self::Utf8(_) => write!(f, "invalid utf-8 in xml"),
            Self::Attr(_) => write!(f, "invalid xml attribute"),
            Self::Xml(_) => write!(f, "xml error"),
            Self::Eof => write!(f, "unexpected end of xml document"),
        }
    }
}

impl std::error::Error for ParsingError {}

impl From<Utf8Error> for ParsingError {
    fn from(v: Utf8Error) -> Self {
        Self::Utf8(v)
    }
}

impl From<quick_xml::events::attributes::AttrError> for ParsingError {
    fn from(v: quick_xml::events::attributes::AttrError) -> Self {
        Self::Attr(v)
    }
}

impl From<quick_xml::Error> for ParsingError {
    fn from(v: quick_xml::Error) -> Self {
        Self::Xml(v)
    }
}
