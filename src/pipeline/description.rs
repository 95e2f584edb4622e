//! Abstract pipeline descriptions
//!
//! A [`PipelineDescription`] is a directed graph of media elements with
//! properties and caps on the links. Descriptions are plain data: the
//! builder produces them without touching GStreamer, and the runtime
//! realizes them into a live graph. A description is constructed fresh
//! before each launch and discarded on teardown.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A reference to a mixable media source
///
/// Scene slots and mixer branches carry one of these; dispatch is on the
/// variant, never on string shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum SourceRef {
    Camera(String),
    Graphics(String),
    Presentation(String),
    Guest(String),
}

impl SourceRef {
    /// Stable key for branch maps and pad names
    pub fn key(&self) -> String {
        match self {
            Self::Camera(id) => format!("camera_{}", id),
            Self::Graphics(id) => format!("graphics_{}", id),
            Self::Presentation(id) => format!("presentation_{}", id),
            Self::Guest(id) => format!("guest_{}", id),
        }
    }

    /// Stream path name on the local stream server, when the source has one
    pub fn stream_path(&self) -> Option<&str> {
        match self {
            Self::Camera(id) | Self::Presentation(id) | Self::Guest(id) => Some(id),
            Self::Graphics(_) => None,
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Camera(id) => write!(f, "camera:{}", id),
            Self::Graphics(id) => write!(f, "graphics:{}", id),
            Self::Presentation(id) => write!(f, "presentation:{}", id),
            Self::Guest(id) => write!(f, "guest:{}", id),
        }
    }
}

/// What a pipeline is for; decides builder dispatch and runtime counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Ingest,
    Recording,
    Preview,
    MixerBranch,
    MixerProgram,
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingest => write!(f, "ingest"),
            Self::Recording => write!(f, "recording"),
            Self::Preview => write!(f, "preview"),
            Self::MixerBranch => write!(f, "mixer_branch"),
            Self::MixerProgram => write!(f, "mixer_program"),
        }
    }
}

/// Typed element property value
///
/// `FromStr` covers enum-typed and structure-typed properties, which the
/// runtime applies with `set_property_from_str`.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Str(String),
    Int(i64),
    UInt(u64),
    Bool(bool),
    Double(f64),
    Fraction(i32, i32),
    FromStr(String),
}

impl PropertyValue {
    pub fn from_str_value(v: impl Into<String>) -> Self {
        Self::FromStr(v.into())
    }
}

/// One element in the graph
#[derive(Debug, Clone, PartialEq)]
pub struct ElementSpec {
    /// GStreamer factory name (e.g. "v4l2src")
    pub factory: String,
    /// Unique element name inside the description
    pub name: String,
    pub properties: Vec<(String, PropertyValue)>,
}

impl ElementSpec {
    pub fn new(factory: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            factory: factory.into(),
            name: name.into(),
            properties: Vec::new(),
        }
    }

    pub fn prop(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.push((key.into(), value));
        self
    }
}

/// A link between two named elements, optionally constrained by caps
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSpec {
    pub from: String,
    pub to: String,
    /// Caps string applied on the link (`link_filtered`)
    pub caps: Option<String>,
}

/// An abstract pipeline: elements plus links
///
/// Branches (tees, parallel audio) are expressed naturally: several links
/// may leave the same element. Elements with sometimes-pads (rtspsrc,
/// decodebin) are linked by the runtime when their pads appear.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDescription {
    /// Pipeline name, also used in logs and error reports
    pub name: String,
    pub kind: PipelineKind,
    pub elements: Vec<ElementSpec>,
    pub links: Vec<LinkSpec>,
}

impl PipelineDescription {
    pub fn new(name: impl Into<String>, kind: PipelineKind) -> Self {
        Self {
            name: name.into(),
            kind,
            elements: Vec::new(),
            links: Vec::new(),
        }
    }

    pub fn add(&mut self, element: ElementSpec) -> &mut Self {
        self.elements.push(element);
        self
    }

    pub fn link(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.links.push(LinkSpec {
            from: from.into(),
            to: to.into(),
            caps: None,
        });
        self
    }

    pub fn link_caps(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        caps: impl Into<String>,
    ) -> &mut Self {
        self.links.push(LinkSpec {
            from: from.into(),
            to: to.into(),
            caps: Some(caps.into()),
        });
        self
    }

    /// Chain a straight run of elements with plain links
    pub fn chain(&mut self, names: &[&str]) -> &mut Self {
        for pair in names.windows(2) {
            self.link(pair[0], pair[1]);
        }
        self
    }

    pub fn element(&self, name: &str) -> Option<&ElementSpec> {
        self.elements.iter().find(|e| e.name == name)
    }

    /// Structural sanity check: unique names, links reference known elements
    pub fn verify(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for e in &self.elements {
            if !seen.insert(e.name.as_str()) {
                return Err(format!("duplicate element name '{}'", e.name));
            }
        }
        for l in &self.links {
            if !seen.contains(l.from.as_str()) {
                return Err(format!("link from unknown element '{}'", l.from));
            }
            if !seen.contains(l.to.as_str()) {
                return Err(format!("link to unknown element '{}'", l.to));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_links_in_order() {
        let mut desc = PipelineDescription::new("t", PipelineKind::Ingest);
        desc.add(ElementSpec::new("a", "a"))
            .add(ElementSpec::new("b", "b"))
            .add(ElementSpec::new("c", "c"))
            .chain(&["a", "b", "c"]);
        assert_eq!(desc.links.len(), 2);
        assert_eq!(desc.links[0].from, "a");
        assert_eq!(desc.links[1].to, "c");
        desc.verify().unwrap();
    }

    #[test]
    fn test_verify_rejects_unknown_link() {
        let mut desc = PipelineDescription::new("t", PipelineKind::Ingest);
        desc.add(ElementSpec::new("a", "a")).link("a", "ghost");
        assert!(desc.verify().is_err());
    }

    #[test]
    fn test_verify_rejects_duplicate_names() {
        let mut desc = PipelineDescription::new("t", PipelineKind::Recording);
        desc.add(ElementSpec::new("queue", "q"))
            .add(ElementSpec::new("queue", "q"));
        assert!(desc.verify().is_err());
    }

    #[test]
    fn test_source_ref_serde() {
        let src: SourceRef = serde_json::from_str(r#"{"type":"camera","id":"cam0"}"#).unwrap();
        assert_eq!(src, SourceRef::Camera("cam0".into()));
        assert_eq!(src.key(), "camera_cam0");
        assert_eq!(src.stream_path(), Some("cam0"));
        assert_eq!(SourceRef::Graphics("clock".into()).stream_path(), None);
    }
}
