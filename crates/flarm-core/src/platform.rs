use std::fmt;

use tracing::warn;

/// The two platform families the Flarm ecosystem distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    /// Windows hosts.
    Knosthalij,
    /// Linux, macOS and every other host.
    Danenone,
}

impl Platform {
    pub fn running() -> Self {
        if cfg!(windows) {
            Self::Knosthalij
        } else {
            Self::Danenone
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Knosthalij => "Knosthalij",
            Self::Danenone => "Danenone",
        }
    }

    pub fn family(self) -> &'static str {
        match self {
            Self::Knosthalij => "Windows",
            Self::Danenone => "Linux",
        }
    }

    /// Tokens release asset names use for this platform.
    pub fn asset_aliases(self) -> &'static [&'static str] {
        match self {
            Self::Knosthalij => &["knosthalij", "windows", "win"],
            Self::Danenone => &["danenone", "linux", "mac", "macos", "darwin"],
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "knosthalij" => Some(Self::Knosthalij),
            "danenone" => Some(Self::Danenone),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformRequirement {
    Only(Platform),
    Universal,
    Unrecognized(String),
}

impl PlatformRequirement {
    pub fn parse(declared: &str) -> Self {
        let trimmed = declared.trim();
        if trimmed.is_empty()
            || trimmed.eq_ignore_ascii_case("any")
            || trimmed.eq_ignore_ascii_case("universal")
        {
            return Self::Universal;
        }
        match Platform::parse(trimmed) {
            Some(platform) => Self::Only(platform),
            None => Self::Unrecognized(trimmed.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compatibility {
    Compatible,
    Incompatible { reason: String },
}

impl Compatibility {
    pub fn is_compatible(&self) -> bool {
        matches!(self, Self::Compatible)
    }
}

pub fn check_compatibility(declared: &PlatformRequirement, running: Platform) -> Compatibility {
    match declared {
        PlatformRequirement::Universal => Compatibility::Compatible,
        PlatformRequirement::Only(target) if *target == running => Compatibility::Compatible,
        PlatformRequirement::Only(target) => Compatibility::Incompatible {
            reason: format!(
                "this package is built for {} ({}) and is not compatible with {} ({})",
                target.as_str(),
                target.family(),
                running.as_str(),
                running.family()
            ),
        },
        PlatformRequirement::Unrecognized(token) => {
            warn!(platform = %token, "unrecognized package platform; allowing install");
            Compatibility::Compatible
        }
    }
}
