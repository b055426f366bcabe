use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One reversible schema-change step.
///
/// `upgrade` and `downgrade` are SQL batches; `downgrade` must undo exactly
/// what `upgrade` created. Revisions are built once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub id: Cow<'static, str>,
    pub parent: Option<Cow<'static, str>>,
    pub message: Cow<'static, str>,
    pub upgrade: Cow<'static, str>,
    pub downgrade: Cow<'static, str>,
}

impl Revision {
    pub fn new(
        id: impl Into<Cow<'static, str>>,
        parent: Option<impl Into<Cow<'static, str>>>,
        message: impl Into<Cow<'static, str>>,
        upgrade: impl Into<Cow<'static, str>>,
        downgrade: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            id: id.into(),
            parent: parent.map(Into::into),
            message: message.into(),
            upgrade: upgrade.into(),
            downgrade: downgrade.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn is_base(&self) -> bool {
        self.parent.is_none()
    }

    pub fn sql(&self, direction: Direction) -> &str {
        match direction {
            Direction::Upgrade => &self.upgrade,
            Direction::Downgrade => &self.downgrade,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upgrade,
    Downgrade,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upgrade => "upgrade",
            Self::Downgrade => "downgrade",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a run should leave the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Head,
    Base,
    /// A full revision id or a unique prefix of one.
    Revision(String),
    /// `+N` / `-N` steps from the current ledger position.
    Relative(i64),
}

impl Target {
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        match s {
            "head" | "heads" => return Self::Head,
            "base" => return Self::Base,
            _ => {}
        }
        if let Some(rest) = s.strip_prefix(['+', '-']) {
            if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(n) = s.parse::<i64>() {
                    return Self::Relative(n);
                }
            }
        }
        Self::Revision(s.to_string())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Head => f.write_str("head"),
            Self::Base => f.write_str("base"),
            Self::Revision(id) => f.write_str(id),
            Self::Relative(n) => write!(f, "{n:+}"),
        }
    }
}

impl From<&str> for Target {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}
