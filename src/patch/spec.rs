//! Patch rules and the three-stage regex applier.

use regex::bytes::Regex;
use sha2::{Digest, Sha256};

use super::hex;
use super::policy;
use crate::error::PatchError;

const KIND_REGEX: &str = "regex";
const KIND_CUSTOM: &str = "custom";

/// Counters accumulated while applying a spec set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchStats {
    /// Stage-1 matches.
    pub segments: usize,
    /// Segments that passed the guard.
    pub eligible: usize,
    /// Segments with at least one replacement.
    pub patched: usize,
    /// Segments whose bytes actually differ afterwards.
    pub changed: usize,
    pub replacements: usize,
}

impl PatchStats {
    pub fn absorb(&mut self, other: PatchStats) {
        self.segments += other.segments;
        self.eligible += other.eligible;
        self.patched += other.patched;
        self.changed += other.changed;
        self.replacements += other.replacements;
    }
}

/// One rule. Either a regex triplet or a named built-in applier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSpec {
    pub label: String,
    pub match_pattern: Option<String>,
    pub guard_pattern: Option<String>,
    pub patch_pattern: Option<String>,
    pub replace: String,
    pub fixed_length: bool,
    pub apply_id: Option<String>,
}

impl PatchSpec {
    pub fn regex(
        label: impl Into<String>,
        match_pattern: impl Into<String>,
        patch_pattern: impl Into<String>,
        replace: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            match_pattern: Some(match_pattern.into()),
            guard_pattern: None,
            patch_pattern: Some(patch_pattern.into()),
            replace: replace.into(),
            fixed_length: true,
            apply_id: None,
        }
    }

    pub fn custom(label: impl Into<String>, apply_id: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            match_pattern: None,
            guard_pattern: None,
            patch_pattern: None,
            replace: String::new(),
            fixed_length: true,
            apply_id: Some(apply_id.into()),
        }
    }

    pub fn with_guard(mut self, guard: impl Into<String>) -> Self {
        self.guard_pattern = Some(guard.into());
        self
    }

    pub fn with_fixed_length(mut self, fixed_length: bool) -> Self {
        self.fixed_length = fixed_length;
        self
    }

    fn kind(&self) -> &'static str {
        if self.apply_id.is_some() {
            KIND_CUSTOM
        } else {
            KIND_REGEX
        }
    }
}

/// An ordered list of rules, identified by [`SpecSet::sha256`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecSet {
    specs: Vec<PatchSpec>,
}

impl SpecSet {
    pub fn new(specs: Vec<PatchSpec>) -> Self {
        Self { specs }
    }

    /// The rules shipped with this build.
    pub fn builtin() -> Self {
        Self::new(vec![PatchSpec::custom(
            "policy-settings",
            policy::POLICY_SETTINGS_APPLY_ID,
        )])
    }

    pub fn specs(&self) -> &[PatchSpec] {
        &self.specs
    }

    /// Hex SHA-256 over every field that affects the output.
    pub fn sha256(&self) -> String {
        let mut hasher = Sha256::new();
        for spec in &self.specs {
            let fixed = if spec.fixed_length { "true" } else { "false" };
            for field in [
                spec.label.as_str(),
                spec.kind(),
                spec.apply_id.as_deref().unwrap_or(""),
                spec.match_pattern.as_deref().unwrap_or(""),
                spec.guard_pattern.as_deref().unwrap_or(""),
                spec.patch_pattern.as_deref().unwrap_or(""),
                fixed,
                spec.replace.as_str(),
            ] {
                hasher.update(field.as_bytes());
                hasher.update(b"\n");
            }
        }
        hex::encode(&hasher.finalize())
    }

    pub fn compile(&self) -> Result<CompiledSet, PatchError> {
        let specs = self
            .specs
            .iter()
            .map(CompiledSpec::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CompiledSet { specs })
    }
}

type CustomApplier = fn(&str, &[u8]) -> Result<(Vec<u8>, PatchStats), PatchError>;

fn custom_applier(apply_id: &str) -> Option<CustomApplier> {
    match apply_id {
        policy::POLICY_SETTINGS_APPLY_ID => Some(policy::apply),
        _ => None,
    }
}

enum CompiledRule {
    Regex {
        block: Regex,
        guard: Option<Regex>,
        patch: Regex,
        replace: Vec<u8>,
        fixed_length: bool,
    },
    Custom(CustomApplier),
}

struct CompiledSpec {
    label: String,
    rule: CompiledRule,
}

impl CompiledSpec {
    fn compile(spec: &PatchSpec) -> Result<Self, PatchError> {
        let rule = match &spec.apply_id {
            Some(apply_id) => CompiledRule::Custom(
                custom_applier(apply_id).ok_or_else(|| PatchError::UnknownApplier(apply_id.clone()))?,
            ),
            None => {
                let build = |pattern: &str| {
                    Regex::new(pattern).map_err(|source| PatchError::InvalidPattern {
                        label: spec.label.clone(),
                        source,
                    })
                };
                CompiledRule::Regex {
                    block: build(spec.match_pattern.as_deref().unwrap_or(""))?,
                    guard: spec.guard_pattern.as_deref().map(build).transpose()?,
                    patch: build(spec.patch_pattern.as_deref().unwrap_or(""))?,
                    replace: normalize_replacement(&spec.replace).into_bytes(),
                    fixed_length: spec.fixed_length,
                }
            }
        };
        Ok(Self {
            label: spec.label.clone(),
            rule,
        })
    }

    fn apply(&self, input: &[u8]) -> Result<(Vec<u8>, PatchStats), PatchError> {
        match &self.rule {
            CompiledRule::Custom(applier) => applier(&self.label, input),
            CompiledRule::Regex {
                block,
                guard,
                patch,
                replace,
                fixed_length,
            } => {
                let mut stats = PatchStats::default();
                let mut out = Vec::with_capacity(input.len());
                let mut last = 0;

                for segment in block.find_iter(input) {
                    out.extend_from_slice(&input[last..segment.start()]);
                    last = segment.end();
                    stats.segments += 1;

                    let span = segment.as_bytes();
                    if guard.as_ref().is_some_and(|g| !g.is_match(span)) {
                        out.extend_from_slice(span);
                        continue;
                    }
                    stats.eligible += 1;

                    let mut rewritten = Vec::with_capacity(span.len());
                    let mut cursor = 0;
                    let mut hits = 0;
                    for caps in patch.captures_iter(span) {
                        let Some(whole) = caps.get(0) else { continue };
                        if whole.start() == whole.end() {
                            return Err(PatchError::EmptyMatch {
                                label: self.label.clone(),
                                offset: segment.start() + whole.start(),
                            });
                        }
                        rewritten.extend_from_slice(&span[cursor..whole.start()]);
                        caps.expand(replace, &mut rewritten);
                        cursor = whole.end();
                        hits += 1;
                    }
                    rewritten.extend_from_slice(&span[cursor..]);

                    if *fixed_length && rewritten.len() != span.len() {
                        return Err(PatchError::LengthMismatch {
                            label: self.label.clone(),
                            before: span.len(),
                            after: rewritten.len(),
                        });
                    }
                    if hits > 0 {
                        stats.patched += 1;
                        stats.replacements += hits;
                    }
                    if rewritten != span {
                        stats.changed += 1;
                    }
                    out.extend_from_slice(&rewritten);
                }
                out.extend_from_slice(&input[last..]);
                Ok((out, stats))
            }
        }
    }
}

/// A spec set ready to run.
pub struct CompiledSet {
    specs: Vec<CompiledSpec>,
}

impl CompiledSet {
    /// Run every rule in order, each on the previous rule's output.
    pub fn apply(&self, input: &[u8]) -> Result<(Vec<u8>, PatchStats), PatchError> {
        let mut current = input.to_vec();
        let mut total = PatchStats::default();
        for spec in &self.specs {
            let (next, stats) = spec.apply(&current)?;
            total.absorb(stats);
            current = next;
        }
        Ok((current, total))
    }
}

/// Rewrite `$N` followed by an identifier character to `${N}` so the group
/// number is not read as part of a group name. `$$` is kept as an escape.
pub fn normalize_replacement(replace: &str) -> String {
    let bytes = replace.as_bytes();
    let mut out = String::with_capacity(replace.len() + 4);
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            let ch_len = replace[i..].chars().next().map_or(1, char::len_utf8);
            out.push_str(&replace[i..i + ch_len]);
            i += ch_len;
            continue;
        }
        if bytes.get(i + 1) == Some(&b'$') {
            out.push_str("$$");
            i += 2;
            continue;
        }
        let digits = bytes[i + 1..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        let after = bytes.get(i + 1 + digits);
        if digits > 0 && after.is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_') {
            out.push_str("${");
            out.push_str(&replace[i + 1..i + 1 + digits]);
            out.push('}');
        } else {
            out.push_str(&replace[i..i + 1 + digits]);
        }
        i += 1 + digits;
    }
    out
}
