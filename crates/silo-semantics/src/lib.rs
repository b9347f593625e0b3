//! Batch semantics: the six policy dimensions that govern how a batch of
//! operations is executed, plus preset templates.
//!
//! A `Semantics` value is mutable while it has a single owner. Once attached
//! to a batch it is shared behind an `Arc` and treated as immutable; message
//! flag derivation and the scheduler both rely on that.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("unknown semantics dimension: '{0}'")]
    UnknownDimension(String),
    #[error("unknown value '{value}' for semantics dimension '{dimension}'")]
    UnknownValue { dimension: String, value: String },
    #[error("malformed semantics entry: '{0}' (expected 'dimension=value')")]
    Malformed(String),
}

macro_rules! dimension {
    ($(#[$doc:meta])* $name:ident { $($variant:ident => $repr:literal),+ $(,)? }) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "kebab-case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $repr),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Error> {
                match s {
                    $($repr => Ok(Self::$variant),)+
                    other => Err(Error::UnknownValue {
                        dimension: stringify!($name).to_ascii_lowercase(),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

dimension!(
    /// Whether operations, whole batches, or nothing at all is atomic.
    Atomicity {
        None => "none",
        Operation => "operation",
        Batch => "batch",
    }
);

dimension!(
    /// Which concurrent accesses the application promises to perform.
    Concurrency {
        Overlapping => "overlapping",
        NonOverlapping => "non-overlapping",
        None => "none",
    }
);

dimension!(
    /// When other clients observe a completed operation.
    Consistency {
        Immediate => "immediate",
        Eventual => "eventual",
        Session => "session",
    }
);

dimension!(
    /// How strongly operation order is preserved across handles and servers.
    Ordering {
        Strict => "strict",
        SemiRelaxed => "semi-relaxed",
        Relaxed => "relaxed",
    }
);

dimension!(
    /// Where data must reside before an operation completes.
    Persistency {
        Storage => "storage",
        Network => "network",
        None => "none",
    }
);

dimension!(
    /// Where data must reside before an operation is acknowledged.
    Safety {
        Storage => "storage",
        Network => "network",
        None => "none",
    }
);

dimension!(
    /// Whether permissions are checked on every access.
    Security {
        Strict => "strict",
        None => "none",
    }
);

/// Preset combinations of all six dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Template {
    Default,
    Posix,
    TemporaryLocal,
}

/// The policy bag attached to every batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Semantics {
    atomicity: Atomicity,
    concurrency: Concurrency,
    consistency: Consistency,
    ordering: Ordering,
    persistency: Persistency,
    safety: Safety,
    security: Security,
}

impl Semantics {
    pub fn new(template: Template) -> Self {
        match template {
            Template::Default => Self {
                atomicity: Atomicity::None,
                concurrency: Concurrency::NonOverlapping,
                consistency: Consistency::Immediate,
                ordering: Ordering::SemiRelaxed,
                persistency: Persistency::Network,
                safety: Safety::Network,
                security: Security::None,
            },
            Template::Posix => Self {
                atomicity: Atomicity::Operation,
                concurrency: Concurrency::Overlapping,
                consistency: Consistency::Immediate,
                ordering: Ordering::Strict,
                persistency: Persistency::Network,
                safety: Safety::Network,
                security: Security::Strict,
            },
            Template::TemporaryLocal => Self {
                atomicity: Atomicity::None,
                concurrency: Concurrency::None,
                consistency: Consistency::Eventual,
                ordering: Ordering::Relaxed,
                persistency: Persistency::None,
                safety: Safety::None,
                security: Security::None,
            },
        }
    }

    /// Parse a comma-separated list of `dimension=value` pairs on top of a
    /// template, e.g. `"atomicity=batch,ordering=strict"`.
    pub fn parse(template: Template, spec: &str) -> Result<Self, Error> {
        let mut semantics = Self::new(template);

        for entry in spec.split(',').filter(|e| !e.is_empty()) {
            let (dimension, value) = entry
                .split_once('=')
                .ok_or_else(|| Error::Malformed(entry.to_string()))?;

            match dimension {
                "atomicity" => semantics.atomicity = value.parse()?,
                "concurrency" => semantics.concurrency = value.parse()?,
                "consistency" => semantics.consistency = value.parse()?,
                "ordering" => semantics.ordering = value.parse()?,
                "persistency" => semantics.persistency = value.parse()?,
                "safety" => semantics.safety = value.parse()?,
                "security" => semantics.security = value.parse()?,
                other => return Err(Error::UnknownDimension(other.to_string())),
            }
        }

        Ok(semantics)
    }

    pub fn atomicity(&self) -> Atomicity {
        self.atomicity
    }
    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }
    pub fn consistency(&self) -> Consistency {
        self.consistency
    }
    pub fn ordering(&self) -> Ordering {
        self.ordering
    }
    pub fn persistency(&self) -> Persistency {
        self.persistency
    }
    pub fn safety(&self) -> Safety {
        self.safety
    }
    pub fn security(&self) -> Security {
        self.security
    }

    pub fn set_atomicity(&mut self, value: Atomicity) -> &mut Self {
        self.atomicity = value;
        self
    }
    pub fn set_concurrency(&mut self, value: Concurrency) -> &mut Self {
        self.concurrency = value;
        self
    }
    pub fn set_consistency(&mut self, value: Consistency) -> &mut Self {
        self.consistency = value;
        self
    }
    pub fn set_ordering(&mut self, value: Ordering) -> &mut Self {
        self.ordering = value;
        self
    }
    pub fn set_persistency(&mut self, value: Persistency) -> &mut Self {
        self.persistency = value;
        self
    }
    pub fn set_safety(&mut self, value: Safety) -> &mut Self {
        self.safety = value;
        self
    }
    pub fn set_security(&mut self, value: Security) -> &mut Self {
        self.security = value;
        self
    }
}

impl Default for Semantics {
    fn default() -> Self {
        Self::new(Template::Default)
    }
}
