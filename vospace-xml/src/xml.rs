//! Namespace constants and small helpers shared by the node encoder and
//! decoder. Kept separate from [`crate::types`] so the codec module isn't
//! cluttered with constant definitions.

pub const VOS_NS: &str = "http://www.ivoa.net/xml/VOSpace/v2.0";
pub const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";

/// Base URI under which every standard (IVOA-defined) property name lives,
/// e.g. `ivo://ivoa.net/vospace/core#ispublic`.
pub const IVOA_PROPERTY_BASE: &str = "ivo://ivoa.net/vospace/core";
/// Base URI for CADC-specific extension views (rssview, dataview).
pub const CADC_PROPERTY_BASE: &str = "ivo://cadc.nrc.ca/vospace/core";

/// Pull the short property name out of a property's namespaced uri, i.e.
/// everything after the last `#`. This is how `changeProp`/`setProps` key
/// their property map.
pub fn fragment(uri: &str) -> Option<&str> {
    uri.rsplit_once('#').map(|(_, frag)| frag)
}
