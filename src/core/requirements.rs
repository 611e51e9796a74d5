//! Dependency manifest (`requirements.txt`) parsing and version selection.
//!
//! Supports the subset of the pip format that a pinned application image needs:
//! `name[extras] <specifiers> ; <marker>` lines, comments and line continuations.
//! Option lines (`-r`, `-e`, `--index-url`, ...) and direct URL references are
//! rejected so a manifest always means the same thing to every installer.

use crate::utils::error::{BootstrapError, Result};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

static REQUIREMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)\s*(?:\[([^\]]*)\])?\s*([^;]*?)\s*(?:;\s*(.*))?$",
    )
    .expect("valid regex")
});

static SPECIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(===|==|!=|~=|>=|<=|>|<)\s*([A-Za-z0-9.*+!_-]+)$").expect("valid regex")
});

static VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^v?(\d+(?:\.\d+)*)(?:[-_.]?(a|b|c|rc|alpha|beta|pre|preview)[-_.]?(\d*))?(?:[-_.]?(post|rev|r)[-_.]?(\d*))?(?:[-_.]?(dev)[-_.]?(\d*))?$",
    )
    .expect("valid regex")
});

/// PEP 503 normalized project name.
pub fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut last_was_sep = false;
    for ch in name.chars() {
        if matches!(ch, '-' | '_' | '.') {
            if !last_was_sep {
                normalized.push('-');
            }
            last_was_sep = true;
        } else {
            normalized.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        }
    }
    normalized
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    raw: String,
    release: Vec<u64>,
    pre: Option<(u8, u64)>,
    post: Option<u64>,
    dev: Option<u64>,
}

impl Version {
    pub fn parse(input: &str) -> Option<Self> {
        let lowered = input.trim().to_ascii_lowercase();
        // local version labels never take part in matching here
        let public = lowered.split('+').next().unwrap_or_default();
        let caps = VERSION.captures(public)?;

        let release = caps[1]
            .split('.')
            .map(|part| part.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()?;

        let number = |idx: usize| {
            caps.get(idx)
                .map(|m| m.as_str())
                .filter(|s| !s.is_empty())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0)
        };

        let pre = caps.get(2).map(|label| {
            let rank = match label.as_str() {
                "a" | "alpha" => 0,
                "b" | "beta" => 1,
                _ => 2,
            };
            (rank, number(3))
        });
        let post = caps.get(4).map(|_| number(5));
        let dev = caps.get(6).map(|_| number(7));

        Some(Self {
            raw: input.trim().to_string(),
            release,
            pre,
            post,
            dev,
        })
    }

    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some() || self.dev.is_some()
    }

    pub fn release(&self) -> &[u64] {
        &self.release
    }

    fn release_cmp(&self, other: &Self) -> Ordering {
        let len = self.release.len().max(other.release.len());
        for i in 0..len {
            let a = self.release.get(i).copied().unwrap_or(0);
            let b = other.release.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }

    // dev-only < pre-release < final < post-release for the same release tuple
    fn phase_key(&self) -> (u8, u8, u64, u64, u64) {
        let dev_key = self.dev.unwrap_or(u64::MAX);
        match (self.pre, self.post) {
            (None, None) if self.dev.is_some() => (0, 0, 0, 0, dev_key),
            (Some((rank, n)), _) => (1, rank, n, 0, dev_key),
            (None, None) => (2, 0, 0, 0, dev_key),
            (None, Some(p)) => (3, 0, 0, p, dev_key),
        }
    }

    /// True when this version's release starts with `prefix` (zero padded).
    fn has_release_prefix(&self, prefix: &[u64]) -> bool {
        prefix
            .iter()
            .enumerate()
            .all(|(i, p)| self.release.get(i).copied().unwrap_or(0) == *p)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.release_cmp(other)
            .then_with(|| self.phase_key().cmp(&other.phase_key()))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Arbitrary,
    Equal,
    NotEqual,
    Compatible,
    GreaterEqual,
    LessEqual,
    Greater,
    Less,
}

impl Operator {
    fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "===" => Self::Arbitrary,
            "==" => Self::Equal,
            "!=" => Self::NotEqual,
            "~=" => Self::Compatible,
            ">=" => Self::GreaterEqual,
            "<=" => Self::LessEqual,
            ">" => Self::Greater,
            "<" => Self::Less,
            _ => return None,
        })
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Arbitrary => "===",
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::Compatible => "~=",
            Self::GreaterEqual => ">=",
            Self::LessEqual => "<=",
            Self::Greater => ">",
            Self::Less => "<",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Specifier {
    pub op: Operator,
    pub version: String,
    wildcard: Option<Vec<u64>>,
}

impl Specifier {
    fn parse(raw: &str) -> std::result::Result<Self, String> {
        let caps = SPECIFIER
            .captures(raw.trim())
            .ok_or_else(|| format!("invalid version specifier '{}'", raw.trim()))?;
        let op = Operator::parse(&caps[1]).ok_or_else(|| format!("unknown operator '{}'", &caps[1]))?;
        let version = caps[2].to_string();

        if op == Operator::Arbitrary {
            return Ok(Self {
                op,
                version,
                wildcard: None,
            });
        }

        if let Some(prefix) = version.strip_suffix(".*") {
            if !matches!(op, Operator::Equal | Operator::NotEqual) {
                return Err(format!("wildcard versions are only allowed with == and != ('{}')", raw.trim()));
            }
            let numbers = prefix
                .split('.')
                .map(|p| p.parse::<u64>().ok())
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| format!("invalid wildcard version '{}'", version))?;
            return Ok(Self {
                op,
                version,
                wildcard: Some(numbers),
            });
        }

        let parsed = Version::parse(&version).ok_or_else(|| format!("invalid version '{}'", version))?;
        if op == Operator::Compatible && parsed.release.len() < 2 {
            return Err(format!("~= requires at least two release segments ('{}')", version));
        }

        Ok(Self {
            op,
            version,
            wildcard: None,
        })
    }

    pub fn matches(&self, candidate: &Version) -> bool {
        if self.op == Operator::Arbitrary {
            return candidate.raw.eq_ignore_ascii_case(&self.version);
        }
        if let Some(prefix) = &self.wildcard {
            let hit = candidate.has_release_prefix(prefix);
            return if self.op == Operator::Equal { hit } else { !hit };
        }
        let Some(target) = Version::parse(&self.version) else {
            return false;
        };

        match self.op {
            Operator::Equal => candidate.cmp(&target) == Ordering::Equal,
            Operator::NotEqual => candidate.cmp(&target) != Ordering::Equal,
            Operator::GreaterEqual => *candidate >= target,
            Operator::LessEqual => *candidate <= target,
            Operator::Greater => *candidate > target,
            Operator::Less => *candidate < target,
            Operator::Compatible => {
                let prefix = &target.release[..target.release.len() - 1];
                *candidate >= target && candidate.has_release_prefix(prefix)
            }
            Operator::Arbitrary => unreachable!("handled above"),
        }
    }

    /// An exact pin on a pre-release opts that package into pre-releases.
    fn pins_prerelease(&self) -> bool {
        matches!(self.op, Operator::Equal | Operator::Arbitrary)
            && self.wildcard.is_none()
            && Version::parse(&self.version).is_some_and(|v| v.is_prerelease())
    }
}

impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.as_str(), self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Normalized name.
    pub name: String,
    pub extras: Vec<String>,
    pub specifiers: Vec<Specifier>,
    /// Environment marker, kept verbatim and not evaluated.
    pub marker: Option<String>,
    pub line: usize,
}

impl Requirement {
    pub fn specifier_string(&self) -> String {
        self.specifiers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn allows(&self, version: &Version) -> bool {
        self.specifiers.iter().all(|s| s.matches(version))
    }

    /// Highest available version satisfying every specifier.
    pub fn select_version<'a, I>(&self, available: I) -> Option<Version>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let allow_pre = self.specifiers.iter().any(Specifier::pins_prerelease);
        available
            .into_iter()
            .filter_map(Version::parse)
            .filter(|v| allow_pre || !v.is_prerelease())
            .filter(|v| self.allows(v))
            .max()
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[{}]", self.extras.join(","))?;
        }
        f.write_str(&self.specifier_string())
    }
}

fn syntax_error(line: usize, content: &str, reason: impl Into<String>) -> BootstrapError {
    BootstrapError::ManifestSyntaxError {
        line,
        content: content.to_string(),
        reason: reason.into(),
    }
}

/// Joins continuation lines and strips comments, keeping the original line numbers.
fn logical_lines(content: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (idx, raw) in content.lines().enumerate() {
        let number = idx + 1;
        let (start, mut buffer) = pending.take().unwrap_or((number, String::new()));

        if let Some(stripped) = raw.strip_suffix('\\') {
            buffer.push_str(stripped);
            buffer.push(' ');
            pending = Some((start, buffer));
            continue;
        }
        buffer.push_str(raw);

        let without_comment = if buffer.trim_start().starts_with('#') {
            ""
        } else {
            match buffer.find(" #").or_else(|| buffer.find("\t#")) {
                Some(pos) => &buffer[..pos],
                None => buffer.as_str(),
            }
        };
        let trimmed = without_comment.trim();
        if !trimmed.is_empty() {
            lines.push((start, trimmed.to_string()));
        }
    }

    if let Some((start, buffer)) = pending {
        let trimmed = buffer.trim();
        if !trimmed.is_empty() {
            lines.push((start, trimmed.to_string()));
        }
    }

    lines
}

pub fn parse_requirement(line: usize, text: &str) -> Result<Requirement> {
    if text.starts_with('-') {
        return Err(syntax_error(
            line,
            text,
            "pip option lines are not supported in image manifests",
        ));
    }
    if text.contains("://") || text.contains(" @ ") {
        return Err(syntax_error(line, text, "direct URL references are not supported"));
    }

    let caps = REQUIREMENT
        .captures(text)
        .ok_or_else(|| syntax_error(line, text, "expected 'name[extras] specifiers'"))?;

    let name = normalize_name(&caps[1]);
    let extras = caps
        .get(2)
        .map(|m| {
            m.as_str()
                .split(',')
                .map(|e| normalize_name(e.trim()))
                .filter(|e| !e.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let spec_text = caps.get(3).map(|m| m.as_str().trim()).unwrap_or_default();
    let spec_text = spec_text
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(spec_text);

    let mut specifiers = Vec::new();
    if !spec_text.trim().is_empty() {
        for part in spec_text.split(',') {
            let spec = Specifier::parse(part).map_err(|reason| syntax_error(line, text, reason))?;
            specifiers.push(spec);
        }
    }

    let marker = caps
        .get(4)
        .map(|m| m.as_str().trim().to_string())
        .filter(|m| !m.is_empty());

    Ok(Requirement {
        name,
        extras,
        specifiers,
        marker,
        line,
    })
}

/// Parse a manifest. Duplicate entries are merged, first occurrence wins the position.
pub fn parse_manifest(content: &str) -> Result<Vec<Requirement>> {
    let mut merged: Vec<Requirement> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (line, text) in logical_lines(content) {
        let requirement = parse_requirement(line, &text)?;
        match index.get(&requirement.name) {
            Some(&pos) => {
                let existing = &mut merged[pos];
                for extra in requirement.extras {
                    if !existing.extras.contains(&extra) {
                        existing.extras.push(extra);
                    }
                }
                existing.specifiers.extend(requirement.specifiers);
                if existing.marker.is_none() {
                    existing.marker = requirement.marker;
                }
            }
            None => {
                index.insert(requirement.name.clone(), merged.len());
                merged.push(requirement);
            }
        }
    }

    Ok(merged)
}
