// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bounded repair pre-pass for pasted JSON configuration.
//!
//! Exactly two fixes are applied, both outside string literals:
//!
//! 1. a comma directly followed (after whitespace) by `}` or `]` is dropped;
//! 2. a bare identifier key (`name:` after `{` or `,`) is double-quoted.
//!
//! Nothing else is rewritten. Line numbers are preserved, and every edit is
//! recorded so a parse error in the repaired text can be reported at its
//! position in the original input.

/// One column shift introduced by a fix. Columns are 1-based byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Shift {
    line: usize,
    /// First output column the shift applies to.
    from_column: usize,
    /// Bytes added (+) or removed (-) relative to the input.
    delta: isize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repaired {
    pub text: String,
    /// Number of fixes applied.
    pub fixes: usize,
    shifts: Vec<Shift>,
}

impl Repaired {
    /// Map a 1-based (line, column) in `text` back to the input.
    pub fn original_position(&self, line: usize, column: usize) -> (usize, usize) {
        let delta: isize = self
            .shifts
            .iter()
            .filter(|s| s.line == line && s.from_column <= column)
            .map(|s| s.delta)
            .sum();
        let original = (column as isize - delta).max(1) as usize;
        (line, original)
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '-'
}

/// Apply the two fixes to `input`.
pub fn repair(input: &str) -> Repaired {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 16);
    let mut shifts = Vec::new();
    let mut fixes = 0;

    let mut line = 1;
    // Output bytes written on the current line.
    let mut column = 0;
    let mut in_string = false;
    let mut escaped = false;
    // Last significant character emitted outside a string.
    let mut last_structural: Option<char> = None;

    let next_significant = |from: usize| chars[from..].iter().copied().find(|c| !c.is_whitespace());

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];

        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                last_structural = Some('"');
            }
        } else if c == '"' {
            in_string = true;
        } else if c == ',' && matches!(next_significant(i + 1), Some('}') | Some(']')) {
            shifts.push(Shift {
                line,
                from_column: column + 1,
                delta: -1,
            });
            fixes += 1;
            i += 1;
            continue;
        } else if is_ident_start(c) && matches!(last_structural, Some('{') | Some(',')) {
            let start = i;
            let mut end = i;
            while end < chars.len() && is_ident_char(chars[end]) {
                end += 1;
            }
            if next_significant(end) == Some(':') {
                let ident: String = chars[start..end].iter().collect();
                shifts.push(Shift {
                    line,
                    from_column: column + 2,
                    delta: 1,
                });
                shifts.push(Shift {
                    line,
                    from_column: column + ident.len() + 3,
                    delta: 1,
                });
                out.push('"');
                out.push_str(&ident);
                out.push('"');
                column += ident.len() + 2;
                fixes += 1;
                last_structural = Some('"');
                i = end;
                continue;
            }
        } else if !c.is_whitespace() {
            last_structural = Some(c);
        }

        out.push(c);
        if c == '\n' {
            line += 1;
            column = 0;
        } else {
            column += c.len_utf8();
        }
        i += 1;
    }

    Repaired {
        text: out,
        fixes,
        shifts,
    }
}
