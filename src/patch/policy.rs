//! Built-in applier that neutralizes `policySettings` branches in the bundled
//! CLI source.
//!
//! For every `if(x==='policySettings'){ ... }` block, the last plain
//! statement before the block's first `continue` (or `return null`) is
//! overwritten with that keyword statement, space-padded to the original
//! length, so the branch exits before doing any work.

use std::sync::OnceLock;

use regex::bytes::Regex;

use super::spec::PatchStats;
use crate::error::PatchError;

pub const POLICY_SETTINGS_APPLY_ID: &str = "policySettings-block-v1";

const BLOCK_HEADER: &str = r#"if\s*\(\s*[A-Za-z0-9_$]+\s*===?\s*(?:'policySettings'|"policySettings"|`policySettings`)\s*\)\s*\{"#;

fn block_header() -> Result<&'static Regex, PatchError> {
    static HEADER: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    HEADER
        .get_or_init(|| Regex::new(BLOCK_HEADER))
        .as_ref()
        .map_err(|source| PatchError::InvalidPattern {
            label: POLICY_SETTINGS_APPLY_ID.to_string(),
            source: source.clone(),
        })
}

/// One planned in-place overwrite.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Edit {
    start: usize,
    end: usize,
    bytes: Vec<u8>,
}

pub fn apply(label: &str, input: &[u8]) -> Result<(Vec<u8>, PatchStats), PatchError> {
    let header = block_header()?;
    let mut stats = PatchStats::default();
    let mut edits: Vec<Edit> = Vec::new();

    for found in header.find_iter(input) {
        stats.segments += 1;
        let open = found.end() - 1;
        let Some(block) = scan_block(input, open) else {
            continue;
        };
        stats.eligible += 1;
        if let Some(edit) = plan_block(input, &block) {
            stats.patched += 1;
            stats.replacements += 1;
            if input[edit.start..edit.end] != edit.bytes[..] {
                stats.changed += 1;
            }
            edits.push(edit);
        }
    }

    edits.sort_by_key(|e| e.start);
    for pair in edits.windows(2) {
        if pair[1].start < pair[0].end {
            return Err(PatchError::Overlap {
                label: label.to_string(),
                first: pair[0].start,
                second: pair[1].start,
            });
        }
    }

    let mut out = input.to_vec();
    for edit in &edits {
        out[edit.start..edit.end].copy_from_slice(&edit.bytes);
    }
    Ok((out, stats))
}

/// A balanced `{ ... }` region. `code[i]` is true when `input[open + i]` is
/// code rather than string or comment text.
#[derive(Debug)]
struct Block {
    open: usize,
    close: usize,
    code: Vec<bool>,
}

impl Block {
    fn is_code(&self, pos: usize) -> bool {
        pos >= self.open && pos <= self.close && self.code[pos - self.open]
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Lex {
    Code,
    Quoted(u8),
    Template,
    LineComment,
    BlockComment,
}

/// Find the brace closing the one at `open`, skipping strings, template
/// literals (with nested `${}` expressions) and comments.
fn scan_block(input: &[u8], open: usize) -> Option<Block> {
    let mut code = Vec::new();
    let mut mode = Lex::Code;
    let mut depth = 0usize;
    // brace depth at which each open `${` started
    let mut templates: Vec<usize> = Vec::new();
    let mut i = open;

    while i < input.len() {
        let b = input[i];
        let next = input.get(i + 1).copied();
        match mode {
            Lex::Code => match b {
                b'\'' | b'"' => {
                    mode = Lex::Quoted(b);
                    code.push(false);
                }
                b'`' => {
                    mode = Lex::Template;
                    code.push(false);
                }
                b'/' if next == Some(b'/') => {
                    mode = Lex::LineComment;
                    code.extend([false, false]);
                    i += 2;
                    continue;
                }
                b'/' if next == Some(b'*') => {
                    mode = Lex::BlockComment;
                    code.extend([false, false]);
                    i += 2;
                    continue;
                }
                b'{' => {
                    depth += 1;
                    code.push(true);
                }
                b'}' => {
                    if templates.last() == Some(&depth) {
                        templates.pop();
                        mode = Lex::Template;
                        code.push(false);
                    } else {
                        code.push(true);
                        depth = depth.saturating_sub(1);
                        if depth == 0 {
                            return Some(Block {
                                open,
                                close: i,
                                code,
                            });
                        }
                    }
                }
                _ => code.push(true),
            },
            Lex::Quoted(quote) => {
                code.push(false);
                if b == b'\\' {
                    if next.is_some() {
                        code.push(false);
                    }
                    i += 2;
                    continue;
                }
                if b == quote || b == b'\n' {
                    mode = Lex::Code;
                }
            }
            Lex::Template => {
                code.push(false);
                if b == b'\\' {
                    if next.is_some() {
                        code.push(false);
                    }
                    i += 2;
                    continue;
                }
                if b == b'`' {
                    mode = Lex::Code;
                } else if b == b'$' && next == Some(b'{') {
                    code.push(false);
                    templates.push(depth);
                    mode = Lex::Code;
                    i += 2;
                    continue;
                }
            }
            Lex::LineComment => {
                code.push(false);
                if b == b'\n' {
                    mode = Lex::Code;
                }
            }
            Lex::BlockComment => {
                code.push(false);
                if b == b'*' && next == Some(b'/') {
                    code.push(false);
                    mode = Lex::Code;
                    i += 2;
                    continue;
                }
            }
        }
        i += 1;
    }
    None
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

/// First code occurrence of `word` as a whole identifier inside the block.
fn find_keyword(input: &[u8], block: &Block, word: &[u8]) -> Option<usize> {
    (block.open + 1..block.close).find(|&pos| {
        let end = pos + word.len();
        end <= block.close
            && &input[pos..end] == word
            && (pos..end).all(|p| block.is_code(p))
            && !is_ident_byte(input[pos - 1])
            && !input.get(end).copied().is_some_and(is_ident_byte)
    })
}

/// First code occurrence of `return null` (any whitespace between).
fn find_return_null(input: &[u8], block: &Block) -> Option<usize> {
    let mut from = block.open + 1;
    while from < block.close {
        let pos = (from..block.close).find(|&p| {
            let end = p + b"return".len();
            end <= block.close
                && &input[p..end] == b"return"
                && (p..end).all(|q| block.is_code(q))
                && !is_ident_byte(input[p - 1])
        })?;
        let mut after = pos + b"return".len();
        let ws_start = after;
        while after < block.close && input[after].is_ascii_whitespace() {
            after += 1;
        }
        let end = after + b"null".len();
        if after > ws_start
            && end <= block.close
            && &input[after..end] == b"null"
            && (after..end).all(|q| block.is_code(q))
            && !input.get(end).copied().is_some_and(is_ident_byte)
        {
            return Some(pos);
        }
        from = pos + 1;
    }
    None
}

/// Statement spans `[start, end)` split on `;` at nesting depth zero.
/// Each span includes its `;` and excludes leading whitespace.
fn statements(input: &[u8], block: &Block) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut depth = 0i32;
    let mut start = block.open + 1;
    for pos in block.open + 1..block.close {
        if !block.is_code(pos) {
            continue;
        }
        match input[pos] {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            b';' if depth == 0 => {
                spans.push((start, pos + 1));
                start = pos + 1;
            }
            _ => {}
        }
    }
    if start < block.close {
        spans.push((start, block.close));
    }
    spans
        .into_iter()
        .filter_map(|(start, end)| {
            let skip = input[start..end]
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            (start + skip < end).then_some((start + skip, end))
        })
        .collect()
}

fn plan_block(input: &[u8], block: &Block) -> Option<Edit> {
    let (token, replacement): (usize, &[u8]) = match find_keyword(input, block, b"continue") {
        Some(pos) => (pos, b"continue;"),
        None => (find_return_null(input, block)?, b"return null;"),
    };

    let (start, end) = statements(input, block)
        .into_iter()
        .filter(|&(start, end)| {
            let text = &input[start..end];
            end <= token
                && end - start >= replacement.len()
                && !text.starts_with(b"continue")
                && !text.starts_with(b"return")
        })
        .last()?;

    let mut bytes = replacement.to_vec();
    bytes.resize(end - start, b' ');
    Some(Edit { start, end, bytes })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &[u8]) -> (Vec<u8>, PatchStats) {
        apply("policy-settings", input).unwrap()
    }

    #[test]
    fn rewrites_continue_and_return_null_blocks() {
        let input = r#"if(a==='policySettings'){let U=XI("policySettings");if(U)$=YnH($,U,zmD);continue}--if(b==='policySettings'){let I=FYD();if(I===null)return null;return I==="remote"?"E":"L"}"#;
        let first = "if(U)$=YnH($,U,zmD);";
        let second = "let I=FYD();";
        let expected = input
            .replacen(first, &format!("{:<width$}", "continue;", width = first.len()), 1)
            .replacen(second, &format!("{:<width$}", "return null;", width = second.len()), 1);

        let (out, stats) = run(input.as_bytes());
        assert_eq!(out.len(), input.len());
        assert_eq!(String::from_utf8_lossy(&out), expected);
        assert!(expected.contains("continue;           continue}"));
        assert!(expected.contains("{return null;if(I===null)"));
        assert_eq!(stats.segments, 2);
        assert_eq!(stats.changed, 2);
        assert_eq!(stats.replacements, 2);
    }

    #[test]
    fn quote_styles_and_loose_equality_match() {
        for header in [
            r#"if (x == "policySettings") {"#,
            "if(x===`policySettings`){",
            "if( $q === 'policySettings' ){",
        ] {
            let input = format!("{header}doWork(1,2);continue}}");
            let (out, stats) = run(input.as_bytes());
            assert_eq!(stats.changed, 1, "{header}");
            assert!(String::from_utf8_lossy(&out).contains("continue;   continue"), "{header}");
        }
    }

    #[test]
    fn keywords_inside_strings_and_comments_are_ignored() {
        let input = br#"if(a==='policySettings'){log("continue");/* return null */x=1;}"#;
        let (out, stats) = run(input);
        assert_eq!(out, input.to_vec());
        assert_eq!(stats.eligible, 1);
        assert_eq!(stats.patched, 0);
    }

    #[test]
    fn braces_in_strings_and_templates_do_not_end_block() {
        let input = br#"if(a==='policySettings'){s="}";t=`${ {a:1}.a }}`;longStatement();continue}tail"#;
        let (out, stats) = run(input);
        assert_eq!(stats.changed, 1);
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("continue;       continue}tail"), "{text}");
        assert_eq!(out.len(), input.len());
    }

    #[test]
    fn short_statements_are_not_candidates() {
        let input = b"if(a==='policySettings'){x=1;continue}";
        let (out, stats) = run(input);
        assert_eq!(out, input.to_vec());
        assert_eq!(stats.patched, 0);
    }

    #[test]
    fn unterminated_block_is_left_alone() {
        let input = b"if(a==='policySettings'){doSomething();continue";
        let (out, stats) = run(input);
        assert_eq!(out, input.to_vec());
        assert_eq!(stats.segments, 1);
        assert_eq!(stats.eligible, 0);
    }

    #[test]
    fn blocks_sharing_a_statement_overlap() {
        // the second header sits in a comment, so both scans end at the same brace
        let input = b"if(a==='policySettings'){/*if(b==='policySettings'){*/go(12345678);continue}";
        let err = apply("policy-settings", input).unwrap_err();
        assert!(matches!(err, PatchError::Overlap { .. }), "{err:?}");
    }

    #[test]
    fn second_application_is_stable() {
        let input = b"if(a==='policySettings'){prepare(1);continue}";
        let (once, _) = run(input);
        let (twice, stats) = run(&once);
        assert_eq!(once, twice);
        assert_eq!(stats.changed, 0);
    }
}
