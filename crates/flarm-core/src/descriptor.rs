use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::{FlarmError, FlarmResult};

pub const DESCRIPTOR_FILE_NAME: &str = "details.xml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorField {
    Name,
    Publisher,
    App,
    Version,
    Platform,
    Author,
}

impl DescriptorField {
    pub const ALL: [DescriptorField; 6] = [
        Self::Name,
        Self::Publisher,
        Self::App,
        Self::Version,
        Self::Platform,
        Self::Author,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Publisher => "publisher",
            Self::App => "app",
            Self::Version => "version",
            Self::Platform => "platform",
            Self::Author => "author",
        }
    }

    fn from_tag(tag: &[u8]) -> Option<Self> {
        let tag = std::str::from_utf8(tag).ok()?;
        Self::ALL
            .into_iter()
            .find(|field| field.as_str().eq_ignore_ascii_case(tag))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorFields {
    pub name: String,
    pub publisher: String,
    pub app: String,
    pub version: String,
    pub platform: String,
    pub author: Option<String>,
}

impl DescriptorFields {
    fn set(&mut self, field: DescriptorField, value: String) {
        match field {
            DescriptorField::Name => self.name = value,
            DescriptorField::Publisher => self.publisher = value,
            DescriptorField::App => self.app = value,
            DescriptorField::Version => self.version = value,
            DescriptorField::Platform => self.platform = value,
            DescriptorField::Author => {
                self.author = if value.is_empty() { None } else { Some(value) }
            }
        }
    }
}

/// Outcome of reading a descriptor. `PartiallyParsed` still carries a usable identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorParse {
    Parsed(DescriptorFields),
    PartiallyParsed {
        fields: DescriptorFields,
        warnings: Vec<String>,
    },
}

impl DescriptorParse {
    pub fn fields(&self) -> &DescriptorFields {
        match self {
            Self::Parsed(fields) | Self::PartiallyParsed { fields, .. } => fields,
        }
    }

    pub fn warnings(&self) -> &[String] {
        match self {
            Self::Parsed(_) => &[],
            Self::PartiallyParsed { warnings, .. } => warnings,
        }
    }

    pub fn into_parts(self) -> (DescriptorFields, Vec<String>) {
        match self {
            Self::Parsed(fields) => (fields, Vec::new()),
            Self::PartiallyParsed { fields, warnings } => (fields, warnings),
        }
    }
}

pub fn parse_descriptor(content: &str) -> FlarmResult<DescriptorParse> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut warnings = Vec::new();

    let fields = match parse_structured(content) {
        Ok(fields) => fields,
        Err(reason) => {
            warn!(%reason, "descriptor is not well-formed; falling back to pattern extraction");
            warnings.push(format!(
                "descriptor is not well-formed XML ({reason}); fields were extracted best-effort"
            ));
            parse_fallback(content)?
        }
    };

    if fields.publisher.is_empty() {
        return Err(FlarmError::metadata_unavailable(
            "descriptor does not declare a <publisher>",
        ));
    }
    if fields.app.is_empty() {
        return Err(FlarmError::metadata_unavailable(
            "descriptor does not declare an <app>",
        ));
    }

    for (field, value) in [
        (DescriptorField::Name, &fields.name),
        (DescriptorField::Version, &fields.version),
    ] {
        if value.is_empty() {
            warnings.push(format!("descriptor does not declare <{}>", field.as_str()));
        }
    }

    if warnings.is_empty() {
        Ok(DescriptorParse::Parsed(fields))
    } else {
        Ok(DescriptorParse::PartiallyParsed { fields, warnings })
    }
}

/// Reads the direct children of the root element; a field's value is all of its descendant text.
fn parse_structured(content: &str) -> Result<DescriptorFields, String> {
    let mut reader = Reader::from_str(content);
    let mut fields = DescriptorFields::default();
    let mut depth = 0_usize;
    let mut root_seen = false;
    let mut current: Option<(DescriptorField, String)> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => {
                if depth == 0 {
                    if root_seen {
                        return Err("more than one root element".to_string());
                    }
                    root_seen = true;
                } else if depth == 1 {
                    current = DescriptorField::from_tag(element.local_name().as_ref())
                        .map(|field| (field, String::new()));
                }
                depth += 1;
            }
            Ok(Event::End(_)) => {
                depth = depth.saturating_sub(1);
                if depth == 1 {
                    if let Some((field, raw)) = current.take() {
                        fields.set(field, clean_value(&raw));
                    }
                }
            }
            Ok(Event::Empty(element)) => {
                if depth == 0 {
                    if root_seen {
                        return Err("more than one root element".to_string());
                    }
                    root_seen = true;
                } else if depth == 1 {
                    if let Some(field) = DescriptorField::from_tag(element.local_name().as_ref())
                    {
                        fields.set(field, String::new());
                    }
                }
            }
            Ok(Event::Text(text)) => {
                let text = text.unescape().map_err(|err| err.to_string())?;
                if depth == 0 && !text.trim().is_empty() {
                    return Err("text outside of the root element".to_string());
                }
                if let Some((_, raw)) = current.as_mut() {
                    raw.push_str(&text);
                    raw.push(' ');
                }
            }
            Ok(Event::CData(data)) => {
                if let Some((_, raw)) = current.as_mut() {
                    raw.push_str(&String::from_utf8_lossy(&data));
                    raw.push(' ');
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(err.to_string()),
        }
    }

    if !root_seen {
        return Err("document has no root element".to_string());
    }
    if depth != 0 {
        return Err("document ended inside an open element".to_string());
    }
    debug!("descriptor parsed structurally");
    Ok(fields)
}

fn parse_fallback(content: &str) -> FlarmResult<DescriptorFields> {
    let markup = Regex::new(r"<[^>]*>").map_err(pattern_error)?;
    let mut fields = DescriptorFields::default();

    for field in DescriptorField::ALL {
        let tag = field.as_str();
        let pattern = Regex::new(&format!(r"(?is)<{tag}\b[^>]*>(.*?)</{tag}\s*>"))
            .map_err(pattern_error)?;
        let Some(captured) = pattern.captures(content).and_then(|caps| caps.get(1)) else {
            continue;
        };
        let without_tags = markup.replace_all(captured.as_str(), " ");
        fields.set(field, clean_value(&decode_entities(&without_tags)));
    }

    Ok(fields)
}

fn pattern_error(err: regex::Error) -> FlarmError {
    FlarmError::metadata_unavailable(format!("descriptor pattern failed to compile: {err}"))
}

fn decode_entities(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Field values never carry markup characters, even ones spelled as entities.
fn clean_value(value: &str) -> String {
    value
        .replace(['<', '>'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
